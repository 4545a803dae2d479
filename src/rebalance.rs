use std::collections::BTreeMap;

use log::{error, info, warn};

use crate::array::{
    drive_index, run_health, save_config, write_block, Inner, RaidArray, RaidError, WorkerCtx,
    WorkerPhase,
};
use crate::drive::{Block, DriveStatus, SectorEntry};
use crate::geometry::RaidLevel;
use crate::placement::PlacementMap;
use crate::rebuild::decode_sources;

type SectorSnapshot = BTreeMap<usize, BTreeMap<u64, SectorEntry>>;

impl RaidArray {
    /// Redistributes every logical block across the widened drive set after
    /// an expansion of RAID-0, 5 or 6. Mirrors and nested levels never
    /// rebalance: RAID-1 syncs instead, RAID-10/50/60 require
    /// re-initialization.
    pub fn start_rebalance(&mut self, new_drive_id: usize) -> Result<(), RaidError> {
        {
            let inner = &mut *self.lock();
            if !matches!(
                inner.level,
                RaidLevel::Raid0 | RaidLevel::Raid5 | RaidLevel::Raid6
            ) {
                return Err(RaidError::ExpansionUnsupported(inner.level.name()));
            }
            if inner.phase != WorkerPhase::Idle {
                warn!("rebalance request rejected, another worker is active");
                return Err(RaidError::WorkerBusy);
            }
            drive_index(inner, new_drive_id).ok_or(RaidError::UnknownDrive(new_drive_id))?;
            inner.phase = WorkerPhase::Rebalancing;
            info!(
                "rebalance started for {} with new drive {}",
                inner.level.name(),
                new_drive_id
            );
        }
        if let Err(e) =
            self.spawn_worker("rebalance", move |ctx| rebalance_worker(ctx, new_drive_id))
        {
            self.lock().phase = WorkerPhase::Idle;
            return Err(e);
        }
        Ok(())
    }
}

fn rebalance_worker(ctx: WorkerCtx, new_drive_id: usize) {
    // Snapshot the old layout, then clear the live drives so the rewrite
    // below starts from empty platters.
    let (old_placement, old_sectors, total) = {
        let inner = &mut *ctx.lock();
        let index = match drive_index(inner, new_drive_id) {
            Some(index) => index,
            None => {
                inner.phase = WorkerPhase::Idle;
                return;
            }
        };
        inner.drives[index].clear_sectors();
        inner.drives[index].reactivate(DriveStatus::Rebalancing);

        let old_placement = inner.placement.clone();
        let mut old_sectors: SectorSnapshot = BTreeMap::new();
        for drive in &inner.drives {
            if drive.is_active() {
                old_sectors.insert(drive.id(), drive.snapshot_sectors());
            }
        }
        for drive in inner.drives.iter_mut() {
            if drive.is_active() {
                drive.clear_sectors();
            }
        }
        (old_placement, old_sectors, inner.lba_counter)
    };

    if total == 0 {
        info!("rebalance: no logical blocks to redistribute");
    }
    for lba in 0..total {
        if ctx.cancelled() {
            warn!("rebalance cancelled before logical block {}", lba);
            break;
        }
        ctx.pace();
        let inner = &mut *ctx.lock();
        match recover_original(inner, &old_placement, &old_sectors, lba) {
            Some(payload) => {
                let ch = match payload.chars().next() {
                    Some(ch) => ch,
                    None => {
                        warn!("rebalance: empty payload recovered for lba {}", lba);
                        inner.placement.replace(lba, BTreeMap::new());
                        continue;
                    }
                };
                if let Err(e) = write_block(inner, lba, ch) {
                    error!("rebalance: rewriting lba {} failed: {}", lba, e);
                    inner.placement.replace(lba, BTreeMap::new());
                }
            }
            None => {
                warn!(
                    "rebalance: no source for lba {}; block is permanently lost",
                    lba
                );
                inner.placement.replace(lba, BTreeMap::new());
            }
        }
        info!(
            "rebalance: progress {:.1}% - logical block {}",
            (lba + 1) as f64 / total as f64 * 100.0,
            lba
        );
    }

    let inner = &mut *ctx.lock();
    if let Some(index) = drive_index(inner, new_drive_id) {
        inner.drives[index].set_status(DriveStatus::Active);
    }
    inner.phase = WorkerPhase::Idle;
    save_config(inner);
    info!("rebalance with drive {} finished", new_drive_id);
    let report = run_health(inner);
    info!("health after rebalance: {}", report.status);
}

/// Pulls an LBA's original user payload out of the pre-rebalance snapshot,
/// preferring a data copy and inverting snapshotted parity otherwise.
fn recover_original(
    inner: &Inner,
    old_placement: &PlacementMap,
    old_sectors: &SectorSnapshot,
    lba: u64,
) -> Option<String> {
    let entry = old_placement.entry(lba)?;
    let mut sources: Vec<Block> = Vec::new();
    for (&drive_id, &slot) in entry {
        if slot < 0 {
            continue;
        }
        let still_active = inner
            .drives
            .iter()
            .any(|d| d.id() == drive_id && d.is_active());
        if !still_active {
            continue;
        }
        if let Some(sector) = old_sectors
            .get(&drive_id)
            .and_then(|sectors| sectors.get(&(slot as u64)))
        {
            sources.push(sector.block.clone());
        }
    }
    decode_sources(lba, &sources)
}
