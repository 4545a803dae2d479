use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use log::LevelFilter;

use raidsim::{ArrayOptions, RaidArray, RaidError, RaidLevel, WorkerPhase};

fn prompt(text: &str) -> Result<String> {
    print!("{}", text);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading stdin")?;
    Ok(line.trim().to_string())
}

fn main() -> Result<()> {
    let _logger = raidsim::logger::init("system.log", LevelFilter::Info)?;

    println!();
    println!("{}", "=".repeat(40));
    println!("      RAID Array Simulator");
    println!("{}", "=".repeat(40));
    log::info!("raidsim started");

    loop {
        println!();
        println!("Select a RAID level to demonstrate:");
        println!(" 0 - RAID-0 (Striping) - performance, no redundancy");
        println!(" 1 - RAID-1 (Mirroring) - full redundancy");
        println!(" 5 - RAID-5 (Striping with Parity) - survives 1 failure");
        println!(" 6 - RAID-6 (Striping with Dual Parity) - survives 2 failures");
        println!("10 - RAID-10 (Mirrored Stripes)");
        println!("50 - RAID-50 (Striped RAID-5)");
        println!("60 - RAID-60 (Striped RAID-6)");
        println!(" q - Quit");

        let choice = prompt("\nEnter your choice: ")?;
        if choice.eq_ignore_ascii_case("q") {
            break;
        }
        let level = match choice.parse::<u32>().ok().and_then(RaidLevel::from_number) {
            Some(level) => level,
            None => {
                println!("Invalid RAID level.");
                continue;
            }
        };

        let mut array = RaidArray::new(
            level,
            ArrayOptions {
                root: ".".into(),
                pace: Some(Duration::from_millis(50)),
            },
        );

        let mut clear = true;
        if array.config_path().exists() {
            let answer = prompt(&format!(
                "An existing RAID-{} configuration was found. Wipe it and start fresh? (y/n): ",
                level.number()
            ))?;
            clear = answer.eq_ignore_ascii_case("y");
        }
        array.initialize_structure(clear)?;

        interactive(&mut array)?;
        array.cleanup();
    }

    log::info!("raidsim shutting down");
    Ok(())
}

fn interactive(array: &mut RaidArray) -> Result<()> {
    loop {
        println!();
        println!("{}", "=".repeat(50));
        println!("RAID-{} Interactive Demo", array.raid_level().number());
        println!("{}", "=".repeat(50));
        println!("1. Write data to the RAID");
        println!("2. Simulate a drive failure");
        println!("3. Add a new drive");
        println!("4. Re-add a failed drive");
        println!("5. View status and health");
        println!("6. Clear and re-initialize");
        println!("7. Back to level selection");

        match prompt("Enter your choice (1-7): ")?.as_str() {
            "1" => {
                if array.worker_phase() != WorkerPhase::Idle {
                    println!("A rebuild or rebalance is in progress; try again later.");
                    continue;
                }
                let data = prompt("Enter data to write: ")?;
                if data.is_empty() {
                    continue;
                }
                if let Err(e) = array.write_data(&data) {
                    println!("Write failed: {}", e);
                }
            }
            "2" => {
                println!("{}", array.display_status());
                let id = match prompt("Enter drive ID to fail: ")?.parse::<usize>() {
                    Ok(id) => id,
                    Err(_) => {
                        println!("Invalid drive ID.");
                        continue;
                    }
                };
                match array.remove_drive(id) {
                    Ok(()) => recovery_menu(array, id)?,
                    Err(RaidError::BeyondFaultTolerance(_)) => {
                        println!("!!! CRITICAL RAID FAILURE !!! Data may be lost.");
                    }
                    Err(e) => println!("Failure simulation refused: {}", e),
                }
            }
            "3" => match array.add_drive(false, None) {
                Ok(id) => println!("Drive {} added.", id),
                Err(e) => println!("Cannot add drive: {}", e),
            },
            "4" => {
                let id = match prompt("Enter the failed drive ID to re-add: ")?.parse::<usize>() {
                    Ok(id) => id,
                    Err(_) => {
                        println!("Invalid drive ID.");
                        continue;
                    }
                };
                match array.readd_drive(id) {
                    Ok(()) => println!("Drive {} re-added.", id),
                    Err(e) => println!("Cannot re-add drive: {}", e),
                }
            }
            "5" => {
                println!("{}", array.display_status());
                println!(
                    "Drive artifacts and raid_config.json live in raid_{}/",
                    array.raid_level().number()
                );
            }
            "6" => {
                let confirm =
                    prompt("This deletes the current configuration and data. Continue? (y/n): ")?;
                if confirm.eq_ignore_ascii_case("y") {
                    array.cleanup();
                    array.initialize_structure(true)?;
                }
            }
            "7" => break,
            _ => println!("Invalid choice."),
        }
    }
    Ok(())
}

fn recovery_menu(array: &mut RaidArray, failed_id: usize) -> Result<()> {
    println!(
        "RAID is operating in degraded mode. Failed drive: {}",
        failed_id
    );
    println!("1. Re-add the existing drive (it is back and intact)");
    println!("2. Add a new replacement drive and rebuild");
    println!("3. Do nothing for now");
    match prompt("Enter your choice (1-3): ")?.as_str() {
        "1" => {
            if let Err(e) = array.readd_drive(failed_id) {
                println!("Re-add failed: {}", e);
            }
        }
        "2" => match array.add_drive(false, None) {
            Ok(replacement) => {
                if let Err(e) = array.start_rebuild(Some(failed_id), replacement) {
                    println!("Rebuild failed to start: {}", e);
                }
            }
            Err(e) => println!("Cannot add a replacement: {}", e),
        },
        _ => {}
    }
    Ok(())
}
