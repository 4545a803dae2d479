use std::fs;
use std::io;
use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::drive::DriveStatus;
use crate::placement::PlacementMap;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("catalog holds RAID-{found}, expected RAID-{expected}")]
    LevelMismatch { expected: u32, found: u32 },
}

/// One `(lba, drive, sector)` cell of the placement index on the wire.
/// `sector` is `-1` for a permanently lost block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRecord {
    pub lba: u64,
    pub drive_id: usize,
    pub sector: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveRecord {
    pub id: usize,
    pub signature: String,
    pub is_active: bool,
    pub status: DriveStatus,
    pub next_physical_sector: u64,
}

/// Snapshot of the array that survives a restart. Sector payloads are not
/// here; they live in the per-drive artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogDoc {
    pub raid_level: u32,
    pub raid_signature: String,
    pub current_logical_block_index: u64,
    pub placement: Vec<PlacementRecord>,
    pub drives: Vec<DriveRecord>,
}

impl CatalogDoc {
    pub fn placement_records(map: &PlacementMap) -> Vec<PlacementRecord> {
        let mut records = Vec::new();
        for (&lba, entry) in map.iter() {
            for (&drive_id, &sector) in entry {
                records.push(PlacementRecord {
                    lba,
                    drive_id,
                    sector,
                });
            }
        }
        records
    }

    pub fn restore_placement(&self) -> PlacementMap {
        let mut map = PlacementMap::new();
        for record in &self.placement {
            map.insert_raw(record.lba, record.drive_id, record.sector);
        }
        map
    }
}

pub fn save(path: &Path, doc: &CatalogDoc) -> Result<(), CatalogError> {
    let mut file = io::BufWriter::new(fs::File::create(path)?);
    serde_json::to_writer_pretty(&mut file, doc)?;
    io::Write::flush(&mut file)?;
    info!("catalog saved to {}", path.display());
    Ok(())
}

pub fn load(path: &Path, expected_level: u32) -> Result<CatalogDoc, CatalogError> {
    let file = io::BufReader::new(fs::File::open(path)?);
    let doc: CatalogDoc = serde_json::from_reader(file)?;
    if doc.raid_level != expected_level {
        return Err(CatalogError::LevelMismatch {
            expected: expected_level,
            found: doc.raid_level,
        });
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::fresh_token;
    use test_log::test;

    fn sample_doc() -> CatalogDoc {
        let mut map = PlacementMap::new();
        map.record(0, 0, 1);
        map.record(0, 1, 0);
        map.mark_lost(1, 0);
        CatalogDoc {
            raid_level: 5,
            raid_signature: "RAID-5-abc".to_string(),
            current_logical_block_index: 2,
            placement: CatalogDoc::placement_records(&map),
            drives: vec![
                DriveRecord {
                    id: 0,
                    signature: "DRV-0-x".to_string(),
                    is_active: true,
                    status: DriveStatus::Active,
                    next_physical_sector: 2,
                },
                DriveRecord {
                    id: 1,
                    signature: "DRV-1-y".to_string(),
                    is_active: false,
                    status: DriveStatus::Failed,
                    next_physical_sector: 1,
                },
            ],
        }
    }

    fn scratch_file() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("raidsim-catalog-{}.json", fresh_token()))
    }

    #[test]
    fn round_trip_preserves_everything() {
        let path = scratch_file();
        let doc = sample_doc();
        save(&path, &doc).unwrap();
        let loaded = load(&path, 5).unwrap();
        assert_eq!(loaded, doc);
        // The placement records restore to the same ordered map.
        let restored = loaded.restore_placement();
        assert_eq!(restored.sector_on(0, 0), Some(1));
        assert_eq!(restored.sector_on(1, 0), Some(crate::placement::LOST));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn level_mismatch_is_rejected() {
        let path = scratch_file();
        save(&path, &sample_doc()).unwrap();
        assert!(matches!(
            load(&path, 6),
            Err(CatalogError::LevelMismatch {
                expected: 6,
                found: 5
            })
        ));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn status_strings_use_snake_case() {
        let json = serde_json::to_string(&DriveStatus::FailedFileMissing).unwrap();
        assert_eq!(json, "\"failed_file_missing\"");
        let back: DriveStatus = serde_json::from_str("\"re_adding\"").unwrap();
        assert_eq!(back, DriveStatus::ReAdding);
    }
}
