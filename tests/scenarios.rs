//! End-to-end drills: write, fail, rebuild, rebalance, reload.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;
use test_log::test;

use raidsim::{
    ArrayOptions, Block, DriveStatus, HealthStatus, RaidArray, RaidError, RaidLevel, WorkerPhase,
    LOST,
};

fn scratch_root(tag: &str) -> PathBuf {
    let mut bytes = [0u8; 6];
    rand::rng().fill(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let dir = std::env::temp_dir().join(format!("raidsim-scenario-{}-{}", tag, suffix));
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn fresh_array(level: RaidLevel, root: &PathBuf) -> RaidArray {
    let mut array = RaidArray::new(
        level,
        ArrayOptions {
            root: root.clone(),
            pace: None,
        },
    );
    array.initialize_structure(true).unwrap();
    array
}

#[test]
fn s1_raid5_write_fail_rebuild() {
    let root = scratch_root("s1");
    let mut array = fresh_array(RaidLevel::Raid5, &root);
    array.write_data("ABC").unwrap();

    array.remove_drive(1).unwrap();
    assert_eq!(array.drive_status(1), Some(DriveStatus::Failed));

    // A replacement add while a drive is failed schedules nothing by itself.
    let replacement = array.add_drive(false, None).unwrap();
    assert_eq!(replacement, 3);
    assert_eq!(array.worker_phase(), WorkerPhase::Idle);

    array.start_rebuild(Some(1), replacement).unwrap();
    array.join_worker();

    assert_eq!(array.drive_status(replacement), Some(DriveStatus::Active));
    assert_eq!(array.health_check().status, HealthStatus::Ok);
    // Every payload decodes to the original characters.
    for (lba, ch) in "ABC".chars().enumerate() {
        assert_eq!(array.read_lba(lba as u64), Some(ch.to_string()));
    }
    // LBA 0 had its data on drive 1; the replacement now carries it.
    let entry = array.placement_entry(0).unwrap();
    let sector = entry[&replacement];
    assert!(sector >= 0);
    assert_eq!(
        array.drive_sector(replacement, sector as u64).unwrap().block,
        Block::Rebuilt("A".to_string())
    );
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn s2_raid0_cannot_rebuild() {
    let root = scratch_root("s2");
    let mut array = fresh_array(RaidLevel::Raid0, &root);
    array.write_data("HI").unwrap();

    let err = array.remove_drive(0).unwrap_err();
    assert!(matches!(err, RaidError::BeyondFaultTolerance(0)));

    let replacement = array.add_drive(false, None).unwrap();
    array.start_rebuild(Some(0), replacement).unwrap();
    array.join_worker();

    // LBA 0 lived on drive 0: the replacement carries only the loss marker.
    assert_eq!(array.placement_entry(0).unwrap()[&replacement], LOST);
    let marker = array.drive_sector(replacement, 0).unwrap();
    assert_eq!(marker.block, Block::PermLost);
    assert_eq!(marker.block.payload(), "LOST");
    assert_eq!(marker.block.label(), "PERM_LOST");
    // LBA 1 lived on drive 1 and is untouched.
    assert!(!array.placement_entry(1).unwrap().contains_key(&replacement));
    assert_eq!(array.health_check().status, HealthStatus::Critical);
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn s3_raid1_sync_on_add() {
    let root = scratch_root("s3");
    let mut array = fresh_array(RaidLevel::Raid1, &root);
    array.write_data("XYZ").unwrap();

    // A healthy mirror add starts the sync itself.
    let new_id = array.add_drive(false, None).unwrap();
    array.join_worker();

    assert_eq!(new_id, 2);
    for (sector, ch) in "XYZ".chars().enumerate() {
        let entry = array.drive_sector(new_id, sector as u64).unwrap();
        assert_eq!(entry.block, Block::Synced(ch.to_string()));
        assert_eq!(entry.lba, Some(sector as u64));
    }
    assert_eq!(array.drive_status(new_id), Some(DriveStatus::Active));
    assert_eq!(array.health_check().status, HealthStatus::Ok);
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn s4_raid6_dual_parity_layout() {
    let root = scratch_root("s4");
    let mut array = fresh_array(RaidLevel::Raid6, &root);
    array.write_data("A").unwrap();

    let entry = array.placement_entry(0).unwrap();
    assert_eq!(entry.len(), 3);
    // p = 0, q = 1, data on drive 0 mod (4-2) = 0 of the remaining pool.
    assert_eq!(
        array.drive_sector(0, entry[&0] as u64).unwrap().block.label(),
        "PARITY-P"
    );
    assert_eq!(
        array.drive_sector(1, entry[&1] as u64).unwrap().block.label(),
        "PARITY-Q"
    );
    assert_eq!(
        array.drive_sector(2, entry[&2] as u64).unwrap().block,
        Block::Data("A".to_string())
    );
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn s5_rebalance_after_raid5_expansion() {
    let root = scratch_root("s5");
    let mut array = fresh_array(RaidLevel::Raid5, &root);
    array.write_data("WXYZ").unwrap();

    // A healthy expansion schedules the rebalance itself.
    let new_id = array.add_drive(false, None).unwrap();
    assert_eq!(new_id, 3);
    array.join_worker();

    for (lba, ch) in "WXYZ".chars().enumerate() {
        let entry = array.placement_entry(lba as u64).unwrap();
        assert_eq!(entry.len(), 2);
        // Parity now rotates over four drives, not three.
        let parity_drive = lba % 4;
        let parity = array
            .drive_sector(parity_drive, entry[&parity_drive] as u64)
            .unwrap();
        assert_eq!(parity.block.label(), "PARITY-P");
        assert_eq!(array.read_lba(lba as u64), Some(ch.to_string()));
    }
    assert_eq!(array.drive_status(new_id), Some(DriveStatus::Active));
    assert_eq!(array.health_check().status, HealthStatus::Ok);
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn s6_catalog_survives_restart() {
    let root = scratch_root("s6");
    let mut array = fresh_array(RaidLevel::Raid5, &root);
    array.write_data("ABC").unwrap();

    let placement = array.placement_snapshot();
    let raid_signature = array.raid_signature();
    let drive_signatures: Vec<String> =
        (0..3).map(|id| array.drive_signature(id).unwrap()).collect();
    let health = array.health_check().status;
    array.cleanup();
    drop(array);

    let mut reloaded = RaidArray::new(
        RaidLevel::Raid5,
        ArrayOptions {
            root: root.clone(),
            pace: None,
        },
    );
    reloaded.initialize_structure(false).unwrap();

    assert_eq!(reloaded.placement_snapshot(), placement);
    assert_eq!(reloaded.raid_signature(), raid_signature);
    assert_eq!(reloaded.lba_counter(), 3);
    for (id, signature) in drive_signatures.iter().enumerate() {
        assert_eq!(reloaded.drive_signature(id).as_ref(), Some(signature));
        assert_eq!(reloaded.drive_status(id), Some(DriveStatus::Active));
    }
    assert_eq!(reloaded.health_check().status, health);
    // Payloads were re-parsed from the artifacts.
    assert_eq!(reloaded.read_lba(0), Some("A".to_string()));

    // Writes continue from where the counter left off.
    reloaded.write_data("D").unwrap();
    assert_eq!(reloaded.lba_counter(), 4);
    assert_eq!(reloaded.read_lba(3), Some("D".to_string()));
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn reload_flags_a_missing_artifact() {
    let root = scratch_root("missing");
    let mut array = fresh_array(RaidLevel::Raid5, &root);
    array.write_data("AB").unwrap();
    array.cleanup();
    drop(array);

    fs::remove_file(root.join("raid_5").join("disk_2")).unwrap();

    let mut reloaded = RaidArray::new(
        RaidLevel::Raid5,
        ArrayOptions {
            root: root.clone(),
            pace: None,
        },
    );
    reloaded.initialize_structure(false).unwrap();
    assert_eq!(
        reloaded.drive_status(2),
        Some(DriveStatus::FailedFileMissing)
    );
    assert!(reloaded.health_check().status >= HealthStatus::Degraded);
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn rebuild_of_a_healthy_drive_is_idempotent() {
    let root = scratch_root("idempotent");
    let mut array = fresh_array(RaidLevel::Raid5, &root);
    array.write_data("AB").unwrap();

    let before = array.placement_snapshot();
    array.start_rebuild(Some(0), 0).unwrap();
    array.join_worker();

    assert_eq!(array.placement_snapshot(), before);
    assert_eq!(array.health_check().status, HealthStatus::Ok);
    for (lba, ch) in "AB".chars().enumerate() {
        assert_eq!(array.read_lba(lba as u64), Some(ch.to_string()));
    }
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn readd_resyncs_in_place() {
    let root = scratch_root("readd");
    let mut array = fresh_array(RaidLevel::Raid1, &root);
    array.write_data("QR").unwrap();

    array.remove_drive(1).unwrap();
    array.readd_drive(1).unwrap();
    array.join_worker();

    assert_eq!(array.drive_status(1), Some(DriveStatus::Active));
    assert_eq!(array.health_check().status, HealthStatus::Ok);
    // The re-added mirror holds copies again, in its original sectors.
    for (sector, ch) in "QR".chars().enumerate() {
        assert_eq!(
            array
                .drive_sector(1, sector as u64)
                .unwrap()
                .block
                .payload(),
            ch.to_string()
        );
    }
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn foreground_is_gated_while_a_worker_runs() {
    let root = scratch_root("gate");
    let mut array = RaidArray::new(
        RaidLevel::Raid5,
        ArrayOptions {
            root: root.clone(),
            pace: Some(Duration::from_millis(25)),
        },
    );
    array.initialize_structure(true).unwrap();
    array.write_data("ABCDE").unwrap();

    array.start_rebuild(Some(0), 0).unwrap();
    assert!(matches!(
        array.write_data("F"),
        Err(RaidError::WorkerBusy)
    ));
    assert!(matches!(
        array.start_rebuild(Some(1), 1),
        Err(RaidError::WorkerBusy)
    ));
    assert!(matches!(
        array.remove_drive(1),
        Err(RaidError::WorkerBusy)
    ));
    array.join_worker();
    assert_eq!(array.worker_phase(), WorkerPhase::Idle);

    // Once the worker is done, writes flow again.
    array.write_data("F").unwrap();
    assert_eq!(array.lba_counter(), 6);
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn cleanup_cancels_and_is_idempotent() {
    let root = scratch_root("cleanup");
    let mut array = RaidArray::new(
        RaidLevel::Raid5,
        ArrayOptions {
            root: root.clone(),
            pace: Some(Duration::from_millis(50)),
        },
    );
    array.initialize_structure(true).unwrap();
    array.write_data("ABCDEFGH").unwrap();

    array.start_rebuild(Some(0), 0).unwrap();
    array.cleanup();
    array.cleanup();
    assert_eq!(array.worker_phase(), WorkerPhase::Idle);
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn raid50_writes_stay_inside_their_group() {
    let root = scratch_root("raid50");
    let mut array = fresh_array(RaidLevel::Raid50, &root);
    array.write_data("ABCD").unwrap();

    for lba in 0..4u64 {
        let entry = array.placement_entry(lba).unwrap();
        assert_eq!(entry.len(), 2);
        let group = (lba % 2) as usize;
        for drive in entry.keys() {
            assert_eq!(drive / 3, group);
        }
        let ch = "ABCD".chars().nth(lba as usize).unwrap();
        assert_eq!(array.read_lba(lba), Some(ch.to_string()));
    }
    fs::remove_dir_all(root).unwrap();
}

#[test]
fn raid10_rebuild_copies_the_pair_mirror() {
    let root = scratch_root("raid10");
    let mut array = fresh_array(RaidLevel::Raid10, &root);
    array.write_data("MN").unwrap();

    // Drive 0 is in the first pair; lba 0 lives there.
    array.remove_drive(0).unwrap();
    array.readd_drive(0).unwrap();
    array.join_worker();

    assert_eq!(array.health_check().status, HealthStatus::Ok);
    let entry = array.placement_entry(0).unwrap();
    assert_eq!(
        array
            .drive_sector(0, entry[&0] as u64)
            .unwrap()
            .block
            .payload(),
        "M"
    );
    fs::remove_dir_all(root).unwrap();
}
