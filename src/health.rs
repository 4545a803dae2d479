use std::fmt;

use crate::drive::{Drive, DriveStatus};
use crate::geometry::RaidLevel;
use crate::placement::PlacementMap;

/// Overall array condition, worst first when combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    Ok,
    Inconsistent,
    Degraded,
    Critical,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Ok => "OK",
            HealthStatus::Inconsistent => "INCONSISTENT",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub notes: Vec<String>,
}

impl HealthReport {
    fn raise(&mut self, to: HealthStatus, note: String) {
        if to > self.status {
            self.status = to;
        }
        self.notes.push(note);
    }
}

/// Checks the drive roster, then classifies every mapped LBA and folds in
/// the drive-level flags.
///
/// The roster check runs first and unconditionally, so a down drive is
/// visible even before any block has been written: a loss beyond fault
/// tolerance is CRITICAL, an outstanding failed drive is DEGRADED. A failed
/// drive whose every held block is still fully available has been superseded
/// by a rebuilt replacement and raises nothing.
///
/// A stripe component counts as available when its drive is active, the
/// placement slot is not the lost sentinel, and the named sector is present
/// in the drive's sector map. Missing components that redundancy can still
/// cover read as INCONSISTENT; an LBA with nothing left is CRITICAL.
pub fn check(
    level: RaidLevel,
    drives: &[Drive],
    placement: &PlacementMap,
    lba_count: u64,
    worker_active: bool,
) -> HealthReport {
    let mut report = HealthReport {
        status: HealthStatus::Ok,
        notes: Vec::new(),
    };

    let total = drives.len();
    let expected = level.expected_components(total);
    let available = |lba: u64| -> usize {
        match placement.entry(lba) {
            Some(entry) => drives
                .iter()
                .filter(|d| {
                    d.is_active()
                        && entry
                            .get(&d.id())
                            .map_or(false, |&slot| slot >= 0 && d.has_sector(slot as u64))
                })
                .count(),
            None => 0,
        }
    };

    let active_count = drives.iter().filter(|d| d.is_active()).count();
    let tolerated = total.saturating_sub(level.fault_tolerance());
    if active_count < tolerated {
        report.raise(
            HealthStatus::Critical,
            format!(
                "{} of {} drives active, loss exceeds fault tolerance",
                active_count, total
            ),
        );
    } else {
        for drive in drives.iter().filter(|d| !d.is_active()) {
            let held: Vec<u64> = (0..lba_count)
                .filter(|&lba| {
                    placement
                        .entry(lba)
                        .map_or(false, |entry| entry.contains_key(&drive.id()))
                })
                .collect();
            let superseded =
                !held.is_empty() && held.iter().all(|&lba| available(lba) >= expected);
            if !superseded {
                report.raise(
                    HealthStatus::Degraded,
                    format!(
                        "drive {}: down ({}), rebuild recommended",
                        drive.id(),
                        drive.status()
                    ),
                );
            }
        }
    }

    for drive in drives {
        if drive.status() == DriveStatus::FailedSignatureMismatch {
            report.raise(
                HealthStatus::Degraded,
                format!("drive {}: signature mismatch, replacement required", drive.id()),
            );
        } else if drive.status() == DriveStatus::FailedFileMissing {
            report.raise(
                HealthStatus::Degraded,
                format!("drive {}: artifact missing", drive.id()),
            );
        } else if drive.is_active() && !drive.artifact_path().exists() {
            report.raise(
                HealthStatus::Degraded,
                format!("drive {}: active but its artifact is gone", drive.id()),
            );
        }
    }

    if worker_active {
        report.raise(
            HealthStatus::Degraded,
            "a rebuild or rebalance is in progress".to_string(),
        );
    }

    for lba in 0..lba_count {
        let readable = available(lba);
        if readable == 0 {
            report.raise(
                HealthStatus::Critical,
                format!("LBA {}: no readable copies remain", lba),
            );
        } else if readable < expected {
            report.raise(
                HealthStatus::Inconsistent,
                format!(
                    "LBA {}: {} of {} components readable (rebuildable)",
                    lba, readable, expected
                ),
            );
        }
    }

    report
}
