use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{unbounded, Sender};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("could not open log file: {0}")]
    Io(#[from] io::Error),
    #[error("a logger is already installed: {0}")]
    AlreadyInstalled(#[from] SetLoggerError),
}

enum Message {
    Entry(String),
    Shutdown,
}

/// `log` sink that formats records on the calling thread and hands them to
/// a dedicated writer thread over an unbounded queue, so simulated I/O never
/// stalls on the log file.
struct ChannelLogger {
    tx: Sender<Message>,
    level: LevelFilter,
}

impl Log for ChannelLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("[{}] {}: {}", timestamp(), record.level(), record.args());
        let _ = self.tx.send(Message::Entry(line));
    }

    fn flush(&self) {}
}

/// Keeps the writer thread alive; `shutdown` drains it before exit.
pub struct LoggerHandle {
    tx: Sender<Message>,
    thread: Option<thread::JoinHandle<()>>,
}

impl LoggerHandle {
    /// Asks the writer thread to drain and stop, then joins it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.tx.send(Message::Shutdown);
            let _ = handle.join();
        }
    }
}

impl Drop for LoggerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Installs the channel logger as the global `log` sink. Entries go to both
/// `log_file` and stderr.
pub fn init(log_file: impl AsRef<Path>, level: LevelFilter) -> Result<LoggerHandle, LoggerError> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file.as_ref())?;
    let (tx, rx) = unbounded();

    let thread = thread::Builder::new()
        .name("logger".to_string())
        .spawn(move || {
            for message in rx {
                match message {
                    Message::Entry(line) => {
                        eprintln!("{}", line);
                        let _ = writeln!(file, "{}", line).and_then(|_| file.flush());
                    }
                    Message::Shutdown => break,
                }
            }
        })?;

    log::set_boxed_logger(Box::new(ChannelLogger {
        tx: tx.clone(),
        level,
    }))?;
    log::set_max_level(level);

    Ok(LoggerHandle {
        tx,
        thread: Some(thread),
    })
}

fn timestamp() -> String {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => format!("{}.{:03}", elapsed.as_secs(), elapsed.subsec_millis()),
        Err(_) => "0.000".to_string(),
    }
}
