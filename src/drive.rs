use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use log::{debug, error, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("drive {0} is not active")]
    Inactive(usize),
    #[error("drive {0} artifact is missing")]
    ArtifactMissing(usize),
    #[error("drive {0} artifact i/o failed: {1}")]
    Io(usize, #[source] io::Error),
}

/// Operational state of a drive, persisted in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStatus {
    Active,
    Rebuilding,
    Syncing,
    ReAdding,
    Rebalancing,
    Failed,
    FailedFileMissing,
    FailedSignatureMismatch,
    PermanentlyFailed,
}

impl DriveStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DriveStatus::Active => "active",
            DriveStatus::Rebuilding => "rebuilding",
            DriveStatus::Syncing => "syncing",
            DriveStatus::ReAdding => "re_adding",
            DriveStatus::Rebalancing => "rebalancing",
            DriveStatus::Failed => "failed",
            DriveStatus::FailedFileMissing => "failed_file_missing",
            DriveStatus::FailedSignatureMismatch => "failed_signature_mismatch",
            DriveStatus::PermanentlyFailed => "permanently_failed",
        }
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            DriveStatus::Failed
                | DriveStatus::FailedFileMissing
                | DriveStatus::FailedSignatureMismatch
                | DriveStatus::PermanentlyFailed
        )
    }
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a sector holds, tagged by the role it plays in its stripe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Data(String),
    ParityP(String),
    ParityQ(String),
    Rebuilt(String),
    Synced(String),
    PermLost,
    RebuildFail,
}

impl Block {
    pub fn label(&self) -> &'static str {
        match self {
            Block::Data(_) => "DATA",
            Block::ParityP(_) => "PARITY-P",
            Block::ParityQ(_) => "PARITY-Q",
            Block::Rebuilt(_) => "REBUILT",
            Block::Synced(_) => "SYNCED",
            Block::PermLost => "PERM_LOST",
            Block::RebuildFail => "REBUILD-FAIL",
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Block::Data(p)
            | Block::ParityP(p)
            | Block::ParityQ(p)
            | Block::Rebuilt(p)
            | Block::Synced(p) => p,
            Block::PermLost => "LOST",
            Block::RebuildFail => "ERROR",
        }
    }

    /// The payload, when this block can stand in for the original user data.
    ///
    /// A rebuilt block may hold a recomputed parity token rather than data,
    /// so it only qualifies when the payload is a single logical unit.
    pub fn data_payload(&self) -> Option<&str> {
        match self {
            Block::Data(p) | Block::Synced(p) => Some(p),
            Block::Rebuilt(p) if p.chars().count() == 1 => Some(p),
            _ => None,
        }
    }

    fn from_parts(label: &str, payload: &str) -> Option<Block> {
        match label {
            "DATA" => Some(Block::Data(payload.to_string())),
            "PARITY-P" => Some(Block::ParityP(payload.to_string())),
            "PARITY-Q" => Some(Block::ParityQ(payload.to_string())),
            "REBUILT" => Some(Block::Rebuilt(payload.to_string())),
            "SYNCED" => Some(Block::Synced(payload.to_string())),
            "PERM_LOST" => Some(Block::PermLost),
            "REBUILD-FAIL" => Some(Block::RebuildFail),
            _ => None,
        }
    }
}

/// One written physical sector: its block and the LBA it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectorEntry {
    pub block: Block,
    pub lba: Option<u64>,
}

/// Opaque identity token, shared between signatures in the catalog and the
/// drive artifacts.
pub(crate) fn fresh_token() -> String {
    let mut bytes = [0u8; 9];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A single simulated disk. It owns its sector map and the human-readable
/// artifact file that mirrors it on disk.
#[derive(Debug)]
pub struct Drive {
    id: usize,
    path: PathBuf,
    signature: String,
    active: bool,
    status: DriveStatus,
    sectors: BTreeMap<u64, SectorEntry>,
    next_physical_sector: u64,
}

impl Drive {
    /// Creates a fresh active drive and renders its artifact.
    pub fn create(id: usize, dir: &Path, signature: Option<String>) -> Result<Drive, DriveError> {
        let mut drive = Drive {
            id,
            path: artifact_path(dir, id),
            signature: signature.unwrap_or_else(|| format!("DRV-{}-{}", id, fresh_token())),
            active: true,
            status: DriveStatus::Active,
            sectors: BTreeMap::new(),
            next_physical_sector: 0,
        };
        drive.render()?;
        Ok(drive)
    }

    /// Reattaches a drive recorded in the catalog to its on-disk artifact.
    ///
    /// A missing artifact or a signature that disagrees with the catalog
    /// turns the drive into the matching failed variant instead of erroring.
    pub fn attach(
        id: usize,
        dir: &Path,
        signature: String,
        is_active: bool,
        status: DriveStatus,
        next_physical_sector: u64,
    ) -> Drive {
        let path = artifact_path(dir, id);
        let mut drive = Drive {
            id,
            path,
            signature,
            active: is_active,
            status,
            sectors: BTreeMap::new(),
            next_physical_sector,
        };
        let text = match fs::read_to_string(&drive.path) {
            Ok(text) => text,
            Err(_) => {
                error!("drive {}: artifact missing on load, marking failed", id);
                drive.active = false;
                drive.status = DriveStatus::FailedFileMissing;
                return drive;
            }
        };
        let (artifact_signature, sectors) = parse_artifact(&text);
        if !drive.status.is_failed() {
            match artifact_signature {
                Some(ref found) if *found == drive.signature => {}
                found => {
                    error!(
                        "drive {}: artifact signature {:?} does not match catalog, marking failed",
                        id, found
                    );
                    drive.active = false;
                    drive.status = DriveStatus::FailedSignatureMismatch;
                }
            }
        }
        drive.sectors = sectors;
        if let Some(max) = drive.sectors.keys().next_back() {
            drive.next_physical_sector = drive.next_physical_sector.max(max + 1);
        }
        drive
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn status(&self) -> DriveStatus {
        self.status
    }

    pub fn next_physical_sector(&self) -> u64 {
        self.next_physical_sector
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    pub fn artifact_path(&self) -> &Path {
        &self.path
    }

    pub fn has_sector(&self, sector: u64) -> bool {
        self.sectors.contains_key(&sector)
    }

    /// Looks at a sector without touching the artifact or the state machine.
    pub fn peek(&self, sector: u64) -> Option<&SectorEntry> {
        self.sectors.get(&sector)
    }

    pub fn sectors(&self) -> impl Iterator<Item = (&u64, &SectorEntry)> {
        self.sectors.iter()
    }

    pub(crate) fn snapshot_sectors(&self) -> BTreeMap<u64, SectorEntry> {
        self.sectors.clone()
    }

    /// Writes a block to the next free physical sector.
    pub fn append_write(&mut self, block: Block, lba: Option<u64>) -> Result<u64, DriveError> {
        if !self.active {
            return Err(DriveError::Inactive(self.id));
        }
        let sector = self.next_physical_sector;
        debug!(
            "drive {}: '{}' -> physical sector {} (lba {:?}) as {}",
            self.id,
            block.payload(),
            sector,
            lba,
            block.label()
        );
        self.sectors.insert(sector, SectorEntry { block, lba });
        self.next_physical_sector += 1;
        self.render()?;
        Ok(sector)
    }

    /// Writes a block to a caller-chosen sector. Rebuild and rebalance use
    /// this to place reconstructed data precisely.
    pub fn targeted_write(
        &mut self,
        sector: u64,
        block: Block,
        lba: Option<u64>,
    ) -> Result<(), DriveError> {
        if !self.active {
            return Err(DriveError::Inactive(self.id));
        }
        debug!(
            "drive {}: '{}' -> physical sector {} (lba {:?}) as {} [targeted]",
            self.id,
            block.payload(),
            sector,
            lba,
            block.label()
        );
        self.sectors.insert(sector, SectorEntry { block, lba });
        if sector >= self.next_physical_sector {
            self.next_physical_sector = sector + 1;
        }
        self.render()
    }

    /// Reads a sector. `None` when the drive is inactive, the artifact has
    /// gone missing (which fails the drive), or the sector was never written.
    pub fn read_sector(&mut self, sector: u64) -> Option<SectorEntry> {
        if !self.active {
            error!("drive {}: read attempted while inactive", self.id);
            return None;
        }
        if !self.path.exists() {
            error!("drive {}: artifact vanished, marking failed", self.id);
            self.active = false;
            self.status = DriveStatus::FailedFileMissing;
            let _ = self.render();
            return None;
        }
        self.sectors.get(&sector).cloned()
    }

    /// Takes the drive out of service. Idempotent; an already-specific failed
    /// status is preserved.
    pub fn mark_failed(&mut self) {
        if self.active {
            error!("drive {}: DRIVE FAILURE DETECTED", self.id);
        }
        self.active = false;
        if !self.status.is_failed() {
            self.status = DriveStatus::Failed;
        }
        let _ = self.render();
    }

    /// Puts the drive back in service under the given transitional status.
    pub fn reactivate(&mut self, status: DriveStatus) {
        self.active = true;
        self.status = status;
        let _ = self.render();
    }

    pub fn set_status(&mut self, status: DriveStatus) {
        self.status = status;
        let _ = self.render();
    }

    pub(crate) fn set_permanently_failed(&mut self) {
        self.active = false;
        self.status = DriveStatus::PermanentlyFailed;
        let _ = self.render();
    }

    /// Drops all sectors and resets the append cursor, e.g. before a fresh
    /// replacement starts rebuilding.
    pub fn clear_sectors(&mut self) {
        self.sectors.clear();
        self.next_physical_sector = 0;
        let _ = self.render();
    }

    /// Rewrites the artifact to mirror the in-memory state. Loss of the
    /// artifact's directory during the rewrite fails the drive.
    fn render(&mut self) -> Result<(), DriveError> {
        match self.write_artifact() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.active {
                    warn!(
                        "drive {}: artifact unwritable during render, marking failed",
                        self.id
                    );
                    self.active = false;
                    self.status = DriveStatus::FailedFileMissing;
                }
                Err(DriveError::ArtifactMissing(self.id))
            }
            Err(e) => Err(DriveError::Io(self.id, e)),
        }
    }

    fn write_artifact(&self) -> io::Result<()> {
        let mut f = io::BufWriter::new(fs::File::create(&self.path)?);
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f, "RAID DRIVE {} - SIMULATED DEVICE", self.id)?;
        writeln!(f, "{}", "=".repeat(50))?;
        writeln!(f)?;
        writeln!(f, "METADATA:")?;
        writeln!(f, "Drive ID: {}", self.id)?;
        writeln!(f, "Status: {}", self.status)?;
        writeln!(f, "Signature: {}", self.signature)?;
        writeln!(f, "Used Sectors: {}", self.sectors.len())?;
        writeln!(f, "Next Physical Sector: {}", self.next_physical_sector)?;
        writeln!(f)?;
        writeln!(f, "BLOCK TABLE:")?;
        writeln!(f, "{}", TABLE_RULE)?;
        writeln!(f, "| Sector | LBlock | Role         | Payload  |")?;
        writeln!(f, "{}", TABLE_RULE)?;
        for (sector, entry) in &self.sectors {
            let lba = match entry.lba {
                Some(lba) => format!("{:>6}", lba),
                None => "   N/A".to_string(),
            };
            let preview: String = entry.block.payload().chars().take(8).collect();
            writeln!(
                f,
                "| {:>6} | {} | {:<12} | {:<8} |",
                sector,
                lba,
                entry.block.label(),
                preview
            )?;
        }
        writeln!(f, "{}", TABLE_RULE)?;
        f.flush()
    }
}

const TABLE_RULE: &str = "+--------+--------+--------------+----------+";

fn artifact_path(dir: &Path, id: usize) -> PathBuf {
    dir.join(format!("disk_{}", id))
}

/// Pulls the signature line and the sector table back out of an artifact.
fn parse_artifact(text: &str) -> (Option<String>, BTreeMap<u64, SectorEntry>) {
    let mut signature = None;
    let mut sectors = BTreeMap::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("Signature: ") {
            signature = Some(rest.trim().to_string());
            continue;
        }
        if !line.starts_with('|') {
            continue;
        }
        let fields: Vec<&str> = line.split('|').map(str::trim).collect();
        // ["", sector, lba, role, payload, ""]
        if fields.len() != 6 || fields[1] == "Sector" {
            continue;
        }
        let sector = match fields[1].parse::<u64>() {
            Ok(s) => s,
            Err(_) => continue,
        };
        let lba = match fields[2] {
            "N/A" => None,
            other => other.parse::<u64>().ok(),
        };
        match Block::from_parts(fields[3], fields[4]) {
            Some(block) => {
                sectors.insert(sector, SectorEntry { block, lba });
            }
            None => warn!("artifact row with unknown role {:?} skipped", fields[3]),
        }
    }
    (signature, sectors)
}
