use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use thiserror::Error;

use crate::catalog::{self, CatalogDoc, CatalogError, DriveRecord};
use crate::codec;
use crate::drive::{fresh_token, Block, Drive, DriveError, DriveStatus, SectorEntry};
use crate::geometry::{self, DriveSlot, GeometryError, RaidLevel, StripeRole};
use crate::health::{self, HealthReport};
use crate::placement::PlacementMap;
use crate::rebuild;

#[derive(Error, Debug)]
pub enum RaidError {
    #[error(transparent)]
    Drive(#[from] DriveError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("a rebuild or rebalance is already running")]
    WorkerBusy,
    #[error("write refused: {active} active drives, quorum is {needed}")]
    BelowWriteQuorum { active: usize, needed: usize },
    #[error("losing drive {0} exceeds the array's fault tolerance")]
    BeyondFaultTolerance(usize),
    #[error("drive {0} is not part of the array")]
    UnknownDrive(usize),
    #[error("drive {0} is not in a failed state")]
    NotFailed(usize),
    #[error("drive {0} is already inactive")]
    AlreadyInactive(usize),
    #[error("dynamic expansion is not supported for {0}")]
    ExpansionUnsupported(&'static str),
    #[error("no data or parity source remains for lba {0}")]
    ReconstructionUnavailable(u64),
}

/// What the single background slot is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Rebuilding,
    Rebalancing,
}

/// Construction knobs for an array.
#[derive(Debug, Clone)]
pub struct ArrayOptions {
    /// Directory under which `raid_<level>/` is created.
    pub root: PathBuf,
    /// Optional delay between simulated I/O steps, so demonstrations are
    /// watchable. Leave `None` for tests.
    pub pace: Option<Duration>,
}

impl Default for ArrayOptions {
    fn default() -> ArrayOptions {
        ArrayOptions {
            root: PathBuf::from("."),
            pace: None,
        }
    }
}

/// Mutable array state. Everything a worker or the foreground touches lives
/// behind one mutex; the worker phase inside it is the gate that keeps
/// foreground mutation and background reconstruction apart.
pub(crate) struct Inner {
    pub(crate) level: RaidLevel,
    pub(crate) dir: PathBuf,
    pub(crate) config_path: PathBuf,
    pub(crate) drives: Vec<Drive>,
    pub(crate) placement: PlacementMap,
    pub(crate) lba_counter: u64,
    pub(crate) raid_signature: String,
    pub(crate) phase: WorkerPhase,
}

/// Shared handles a background worker runs on.
pub(crate) struct WorkerCtx {
    pub(crate) inner: Arc<Mutex<Inner>>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) pace: Option<Duration>,
}

impl WorkerCtx {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn pace(&self) {
        if let Some(pace) = self.pace {
            thread::sleep(pace);
        }
    }
}

/// A multi-drive redundant array simulated over one directory of artifacts.
pub struct RaidArray {
    inner: Arc<Mutex<Inner>>,
    cancel: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    pace: Option<Duration>,
    level: RaidLevel,
}

impl RaidArray {
    pub fn new(level: RaidLevel, options: ArrayOptions) -> RaidArray {
        let dir = options.root.join(format!("raid_{}", level.number()));
        let config_path = dir.join("raid_config.json");
        RaidArray {
            inner: Arc::new(Mutex::new(Inner {
                level,
                dir,
                config_path,
                drives: Vec::new(),
                placement: PlacementMap::new(),
                lba_counter: 0,
                raid_signature: format!("RAID-{}-{}", level.number(), fresh_token()),
                phase: WorkerPhase::Idle,
            })),
            cancel: Arc::new(AtomicBool::new(false)),
            worker: None,
            pace: options.pace,
            level,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Builds or restores the on-disk structure. With `clear_existing` the
    /// directory is wiped and the minimum drive roster created; otherwise an
    /// existing catalog is loaded, falling back to a fresh build when that
    /// fails.
    pub fn initialize_structure(&mut self, clear_existing: bool) -> Result<(), RaidError> {
        info!(
            "initializing {} structure (clear_existing={})",
            self.level.name(),
            clear_existing
        );
        if !clear_existing {
            return match self.load_config() {
                Ok(()) => {
                    let inner = self.lock();
                    info!(
                        "{} configuration loaded with {} drives",
                        inner.level.name(),
                        inner.drives.len()
                    );
                    Ok(())
                }
                Err(e) => {
                    warn!("failed to load catalog ({}), creating a new one", e);
                    self.initialize_structure(true)
                }
            };
        }

        let inner = &mut *self.lock();
        match fs::remove_dir_all(&inner.dir) {
            Ok(()) => info!("cleared existing RAID folder {}", inner.dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&inner.dir)?;
        inner.drives.clear();
        inner.placement.clear();
        inner.lba_counter = 0;
        inner.raid_signature = format!("RAID-{}-{}", inner.level.number(), fresh_token());
        for _ in 0..inner.level.min_drives() {
            add_drive_inner(inner, None)?;
        }
        save_config(inner);
        info!(
            "{} initialized fresh with {} drives",
            inner.level.name(),
            inner.drives.len()
        );
        Ok(())
    }

    fn load_config(&mut self) -> Result<(), RaidError> {
        let inner = &mut *self.lock();
        let doc = catalog::load(&inner.config_path, inner.level.number())?;
        let mut drives = Vec::with_capacity(doc.drives.len());
        for record in &doc.drives {
            let drive = Drive::attach(
                record.id,
                &inner.dir,
                record.signature.clone(),
                record.is_active,
                record.status,
                record.next_physical_sector,
            );
            if drive.status() != record.status {
                warn!(
                    "drive {}: catalog said {}, restored as {}",
                    record.id,
                    record.status,
                    drive.status()
                );
            }
            drives.push(drive);
        }
        drives.sort_by_key(Drive::id);
        inner.drives = drives;
        inner.placement = doc.restore_placement();
        inner.lba_counter = doc.current_logical_block_index;
        inner.raid_signature = doc.raid_signature;
        Ok(())
    }

    /// Writes each character of `data` as one logical block. Per-LBA writes
    /// are atomic and checkpointed; a failure aborts the rest of the string
    /// but leaves previously committed blocks in place.
    pub fn write_data(&mut self, data: &str) -> Result<(), RaidError> {
        info!("writing {:?} to {}", data, self.level.name());
        {
            let inner = self.lock();
            if inner.phase != WorkerPhase::Idle {
                return Err(RaidError::WorkerBusy);
            }
            check_write_quorum(&inner)?;
        }
        for ch in data.chars() {
            if let Some(pace) = self.pace {
                thread::sleep(pace);
            }
            let inner = &mut *self.lock();
            let lba = inner.lba_counter;
            match write_block(inner, lba, ch) {
                Ok(()) => {
                    inner.lba_counter += 1;
                    save_config(inner);
                    info!("write completed for logical block {} ({:?})", lba, ch);
                }
                Err(e) => {
                    save_config(inner);
                    error!("write aborted at logical block {}: {}", lba, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Adds a drive with the next free id. Outside initial setup, a healthy
    /// array schedules the follow-up worker itself: rebalance for RAID-0/5/6,
    /// a mirror sync for RAID-1. With a failed drive present the newcomer is
    /// a bare replacement and the caller decides when to rebuild onto it.
    pub fn add_drive(
        &mut self,
        initial_setup: bool,
        existing_signature: Option<String>,
    ) -> Result<usize, RaidError> {
        enum FollowUp {
            None,
            Rebalance,
            Sync,
        }
        let (new_id, follow_up) = {
            let inner = &mut *self.lock();
            if !initial_setup {
                if inner.level.is_nested() {
                    warn!(
                        "dynamic drive addition is not supported for {}; re-initialize with more drives",
                        inner.level.name()
                    );
                    return Err(RaidError::ExpansionUnsupported(inner.level.name()));
                }
                if inner.phase != WorkerPhase::Idle {
                    return Err(RaidError::WorkerBusy);
                }
            }
            let new_id = add_drive_inner(inner, existing_signature)?;
            save_config(inner);
            let any_failed = inner.drives.iter().any(|d| !d.is_active());
            let follow_up = if initial_setup {
                FollowUp::None
            } else if any_failed {
                info!(
                    "drive {} added as a replacement; start a rebuild to populate it",
                    new_id
                );
                FollowUp::None
            } else {
                match inner.level {
                    RaidLevel::Raid0 | RaidLevel::Raid5 | RaidLevel::Raid6 => {
                        info!(
                            "drive {} added; rebalancing existing blocks across the wider stripe",
                            new_id
                        );
                        FollowUp::Rebalance
                    }
                    RaidLevel::Raid1 => {
                        info!("drive {} added; syncing a new mirror copy", new_id);
                        FollowUp::Sync
                    }
                    _ => FollowUp::None,
                }
            };
            (new_id, follow_up)
        };
        match follow_up {
            FollowUp::Rebalance => self.start_rebalance(new_id)?,
            FollowUp::Sync => self.start_rebuild(None, new_id)?,
            FollowUp::None => {}
        }
        Ok(new_id)
    }

    /// Simulates the failure of a drive. Beyond fault tolerance the drive is
    /// permanently failed, its blocks are marked lost and the error says so;
    /// within tolerance the array keeps running degraded.
    pub fn remove_drive(&mut self, drive_id: usize) -> Result<(), RaidError> {
        let inner = &mut *self.lock();
        if inner.phase != WorkerPhase::Idle {
            return Err(RaidError::WorkerBusy);
        }
        let index = drive_index(inner, drive_id).ok_or(RaidError::UnknownDrive(drive_id))?;
        if !inner.drives[index].is_active() {
            warn!("drive {} is already inactive", drive_id);
            return Err(RaidError::AlreadyInactive(drive_id));
        }
        inner.drives[index].mark_failed();
        save_config(inner);

        let active = inner.drives.iter().filter(|d| d.is_active()).count();
        let tolerated = inner.drives.len().saturating_sub(inner.level.fault_tolerance());
        if active < tolerated {
            error!("RAID FAILURE: not enough drives to maintain data integrity");
            // Whatever this drive held is gone for good, at any level.
            inner.placement.mark_drive_lost(drive_id);
            inner.drives[index].set_permanently_failed();
            save_config(inner);
            return Err(RaidError::BeyondFaultTolerance(drive_id));
        }
        warn!("{} operating in degraded mode", inner.level.name());
        Ok(())
    }

    /// Puts a failed drive back into service in its own slot. On RAID-0 the
    /// drive only serves future writes; on redundant levels a same-slot
    /// rebuild always runs to resync it.
    pub fn readd_drive(&mut self, drive_id: usize) -> Result<(), RaidError> {
        {
            let inner = &mut *self.lock();
            if inner.phase != WorkerPhase::Idle {
                return Err(RaidError::WorkerBusy);
            }
            let index = drive_index(inner, drive_id).ok_or(RaidError::UnknownDrive(drive_id))?;
            if inner.drives[index].is_active() || !inner.drives[index].status().is_failed() {
                return Err(RaidError::NotFailed(drive_id));
            }
            // A loss beyond fault tolerance cannot be redeemed, only cleared.
            if inner.drives[index].status() == DriveStatus::PermanentlyFailed {
                return Err(RaidError::BeyondFaultTolerance(drive_id));
            }
            if inner.level == RaidLevel::Raid0 {
                warn!(
                    "RAID-0: re-activating drive {} does not recover lost blocks",
                    drive_id
                );
                inner.drives[index].reactivate(DriveStatus::Active);
                save_config(inner);
                return Ok(());
            }
            inner.drives[index].reactivate(DriveStatus::ReAdding);
            save_config(inner);
            info!(
                "drive {} re-added (signature {}), resyncing in place",
                drive_id,
                inner.drives[index].signature()
            );
        }
        self.start_rebuild(Some(drive_id), drive_id)
    }

    /// Renders the array roster, placement dump and health report.
    pub fn display_status(&self) -> String {
        let inner = self.lock();
        let mut out = String::new();
        let rule = "=".repeat(60);
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "RAID-{} STATUS", inner.level.number());
        let _ = writeln!(out, "{}", rule);
        let _ = writeln!(out, "Configuration: {}", inner.level.name());
        let _ = writeln!(out, "RAID Signature: {}", inner.raid_signature);
        let _ = writeln!(out, "Total Configured Drives: {}", inner.drives.len());
        let _ = writeln!(
            out,
            "Active Drives: {}",
            inner.drives.iter().filter(|d| d.is_active()).count()
        );
        let _ = writeln!(
            out,
            "Failed Drives: {}",
            inner.drives.iter().filter(|d| !d.is_active()).count()
        );
        let _ = writeln!(out, "Current Logical Block Index: {}", inner.lba_counter);
        let _ = writeln!(
            out,
            "Worker: {}",
            match inner.phase {
                WorkerPhase::Idle => "idle",
                WorkerPhase::Rebuilding => "rebuilding",
                WorkerPhase::Rebalancing => "rebalancing",
            }
        );
        let _ = writeln!(out);
        for drive in &inner.drives {
            let _ = writeln!(
                out,
                "Drive {}: {} - {} physical sectors written (Signature: {})",
                drive.id(),
                drive.status(),
                drive.next_physical_sector(),
                drive.signature()
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "Logical Block to Physical Sector Mapping:");
        if inner.placement.is_empty() {
            let _ = writeln!(out, "  No logical blocks written yet.");
        } else {
            for (lba, entry) in inner.placement.iter() {
                let cells: Vec<String> = entry
                    .iter()
                    .map(|(drive, slot)| format!("{}: {}", drive, slot))
                    .collect();
                let _ = writeln!(out, "  LBA {}: {{{}}}", lba, cells.join(", "));
            }
        }
        let report = run_health(&inner);
        let _ = writeln!(out);
        let _ = writeln!(out, "HEALTH: {}", report.status);
        for note in &report.notes {
            let _ = writeln!(out, "- {}", note);
        }
        let _ = writeln!(out, "{}", rule);
        out
    }

    /// Classifies the array's health and logs the findings.
    pub fn health_check(&self) -> HealthReport {
        let inner = self.lock();
        let report = run_health(&inner);
        for note in &report.notes {
            warn!("health: {}", note);
        }
        info!("health: overall {}", report.status);
        report
    }

    /// Decodes the user payload stored for an LBA from whatever survives,
    /// preferring a plain data copy and falling back to parity inversion.
    pub fn read_lba(&self, lba: u64) -> Option<String> {
        let inner = self.lock();
        let entry = inner.placement.entry(lba)?;
        let mut blocks = Vec::new();
        for (&drive_id, &slot) in entry {
            if slot < 0 {
                continue;
            }
            if let Some(drive) = inner.drives.iter().find(|d| d.id() == drive_id) {
                if !drive.is_active() {
                    continue;
                }
                if let Some(sector) = drive.peek(slot as u64) {
                    blocks.push(sector.block.clone());
                }
            }
        }
        rebuild::decode_sources(lba, &blocks)
    }

    /// Stops any background worker and joins it with a bounded timeout.
    /// Safe to call more than once.
    pub fn cleanup(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            info!("waiting for worker thread to finish");
            let deadline = Instant::now() + Duration::from_secs(2);
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(20));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("worker thread did not terminate within the join timeout");
            }
        }
    }

    /// Blocks until the current background worker (if any) has finished.
    pub fn join_worker(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    pub(crate) fn spawn_worker<F>(&mut self, name: &str, body: F) -> Result<(), RaidError>
    where
        F: FnOnce(WorkerCtx) + Send + 'static,
    {
        self.cancel.store(false, Ordering::SeqCst);
        let ctx = WorkerCtx {
            inner: Arc::clone(&self.inner),
            cancel: Arc::clone(&self.cancel),
            pace: self.pace,
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(ctx))?;
        self.worker = Some(handle);
        Ok(())
    }

    pub fn raid_level(&self) -> RaidLevel {
        self.level
    }

    pub fn raid_signature(&self) -> String {
        self.lock().raid_signature.clone()
    }

    pub fn lba_counter(&self) -> u64 {
        self.lock().lba_counter
    }

    pub fn drive_count(&self) -> usize {
        self.lock().drives.len()
    }

    pub fn worker_phase(&self) -> WorkerPhase {
        self.lock().phase
    }

    pub fn config_path(&self) -> PathBuf {
        self.lock().config_path.clone()
    }

    pub fn drive_status(&self, drive_id: usize) -> Option<DriveStatus> {
        let inner = self.lock();
        inner
            .drives
            .iter()
            .find(|d| d.id() == drive_id)
            .map(Drive::status)
    }

    pub fn drive_signature(&self, drive_id: usize) -> Option<String> {
        let inner = self.lock();
        inner
            .drives
            .iter()
            .find(|d| d.id() == drive_id)
            .map(|d| d.signature().to_string())
    }

    pub fn drive_sector(&self, drive_id: usize, sector: u64) -> Option<SectorEntry> {
        let inner = self.lock();
        inner
            .drives
            .iter()
            .find(|d| d.id() == drive_id)
            .and_then(|d| d.peek(sector).cloned())
    }

    pub fn placement_entry(&self, lba: u64) -> Option<BTreeMap<usize, i64>> {
        self.lock().placement.entry(lba).cloned()
    }

    pub fn placement_snapshot(&self) -> PlacementMap {
        self.lock().placement.clone()
    }
}

impl Drop for RaidArray {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Active-count gate for foreground writes: RAID-0 needs every drive, the
/// redundant levels need `total - fault_tolerance`.
fn check_write_quorum(inner: &Inner) -> Result<(), RaidError> {
    let total = inner.drives.len();
    let active = inner.drives.iter().filter(|d| d.is_active()).count();
    let needed = if inner.level == RaidLevel::Raid0 {
        total
    } else {
        total.saturating_sub(inner.level.fault_tolerance())
    };
    if active < needed {
        error!(
            "{} cannot accept writes: {} active drives, quorum is {}",
            inner.level.name(),
            active,
            needed
        );
        return Err(RaidError::BelowWriteQuorum { active, needed });
    }
    Ok(())
}

pub(crate) fn drive_index(inner: &Inner, drive_id: usize) -> Option<usize> {
    inner.drives.iter().position(|d| d.id() == drive_id)
}

pub(crate) fn drive_slots(inner: &Inner) -> Vec<DriveSlot> {
    inner
        .drives
        .iter()
        .map(|d| DriveSlot {
            id: d.id(),
            active: d.is_active(),
        })
        .collect()
}

/// Commits one logical block: geometry first, then the data write, then the
/// redundancy writes, recording each landing sector in the placement map.
/// A sub-write failure fails that drive, marks a lost data destination and
/// aborts the block.
pub(crate) fn write_block(inner: &mut Inner, lba: u64, ch: char) -> Result<(), RaidError> {
    let slots = drive_slots(inner);
    let assignments = geometry::assign(inner.level, lba, &slots)?;
    inner.placement.begin(lba);
    let payload = ch.to_string();
    for assignment in &assignments {
        let block = match assignment.role {
            StripeRole::Data => Block::Data(payload.clone()),
            StripeRole::ParityP => Block::ParityP(codec::p_parity(&[payload.as_str()])),
            StripeRole::ParityQ => Block::ParityQ(codec::q_parity(&[payload.as_str()], lba)),
        };
        let index = match drive_index(inner, assignment.drive_id) {
            Some(index) => index,
            None => continue,
        };
        let label = block.label();
        match inner.drives[index].append_write(block, Some(lba)) {
            Ok(sector) => {
                inner.placement.record(lba, assignment.drive_id, sector);
                if assignment.role != StripeRole::Data {
                    info!(
                        "{} for lba {} stored on drive {}",
                        label, lba, assignment.drive_id
                    );
                }
            }
            Err(e) => {
                error!("error writing {} to drive {}: {}", label, assignment.drive_id, e);
                inner.drives[index].mark_failed();
                if assignment.role == StripeRole::Data {
                    inner.placement.mark_lost(lba, assignment.drive_id);
                }
                return Err(e.into());
            }
        }
    }
    Ok(())
}

fn add_drive_inner(inner: &mut Inner, existing_signature: Option<String>) -> Result<usize, RaidError> {
    // Next sequential id, filling the first gap if one exists.
    let mut new_id = 0;
    let mut ids: Vec<usize> = inner.drives.iter().map(Drive::id).collect();
    ids.sort_unstable();
    for id in ids {
        if id == new_id {
            new_id += 1;
        } else {
            break;
        }
    }
    let drive = Drive::create(new_id, &inner.dir, existing_signature)?;
    inner.drives.push(drive);
    inner.drives.sort_by_key(Drive::id);
    info!("added drive {} to {}", new_id, inner.level.name());
    Ok(new_id)
}

/// Best-effort catalog checkpoint; failures are logged, never fatal.
pub(crate) fn save_config(inner: &Inner) {
    let doc = CatalogDoc {
        raid_level: inner.level.number(),
        raid_signature: inner.raid_signature.clone(),
        current_logical_block_index: inner.lba_counter,
        placement: CatalogDoc::placement_records(&inner.placement),
        drives: inner
            .drives
            .iter()
            .map(|d| DriveRecord {
                id: d.id(),
                signature: d.signature().to_string(),
                is_active: d.is_active(),
                status: d.status(),
                next_physical_sector: d.next_physical_sector(),
            })
            .collect(),
    };
    if let Err(e) = catalog::save(&inner.config_path, &doc) {
        error!("error saving RAID configuration: {}", e);
    }
}

pub(crate) fn run_health(inner: &Inner) -> HealthReport {
    health::check(
        inner.level,
        &inner.drives,
        &inner.placement,
        inner.lba_counter,
        inner.phase != WorkerPhase::Idle,
    )
}
