use log::{error, info, warn};

use crate::array::{
    drive_index, run_health, save_config, Inner, RaidArray, RaidError, WorkerCtx, WorkerPhase,
};
use crate::codec;
use crate::drive::{Block, DriveStatus};
use crate::geometry::RaidLevel;

impl RaidArray {
    /// Starts reconstructing a drive in the background.
    ///
    /// `failed_position = Some(p)` rebuilds the stripe share that slot `p`
    /// held onto `replacement_id` (same-slot re-adds reuse the original
    /// sectors, fresh replacements append). `None` is new-drive-add mode:
    /// the replacement is synced with a copy of every LBA, as when a mirror
    /// joins a RAID-1 set.
    pub fn start_rebuild(
        &mut self,
        failed_position: Option<usize>,
        replacement_id: usize,
    ) -> Result<(), RaidError> {
        {
            let inner = &mut *self.lock();
            if inner.phase != WorkerPhase::Idle {
                warn!("rebuild request rejected, another worker is active");
                return Err(RaidError::WorkerBusy);
            }
            let replacement =
                drive_index(inner, replacement_id).ok_or(RaidError::UnknownDrive(replacement_id))?;
            match failed_position {
                Some(failed) => {
                    drive_index(inner, failed).ok_or(RaidError::UnknownDrive(failed))?;
                    if failed != replacement_id {
                        // A fresh replacement starts from a blank slate.
                        inner.drives[replacement].clear_sectors();
                    }
                    inner.drives[replacement].reactivate(DriveStatus::Rebuilding);
                    info!("drive {} set to rebuilding", replacement_id);
                }
                None => {
                    inner.drives[replacement].clear_sectors();
                    inner.drives[replacement].reactivate(DriveStatus::Syncing);
                    info!("new drive {} set to syncing", replacement_id);
                }
            }
            save_config(inner);
            inner.phase = WorkerPhase::Rebuilding;
            info!(
                "rebuild started: failed position {:?} -> drive {}",
                failed_position, replacement_id
            );
        }
        if let Err(e) = self.spawn_worker("rebuild", move |ctx| {
            rebuild_worker(ctx, failed_position, replacement_id)
        }) {
            self.lock().phase = WorkerPhase::Idle;
            return Err(e);
        }
        Ok(())
    }
}

fn rebuild_worker(ctx: WorkerCtx, failed_position: Option<usize>, replacement_id: usize) {
    let total = ctx.lock().lba_counter;
    if total == 0 {
        info!("rebuild: no data blocks to rebuild");
    }
    for lba in 0..total {
        if ctx.cancelled() {
            warn!("rebuild cancelled before logical block {}", lba);
            break;
        }
        ctx.pace();
        let inner = &mut *ctx.lock();
        rebuild_one(inner, lba, failed_position, replacement_id);
        info!(
            "rebuild: progress {:.1}% - logical block {}",
            (lba + 1) as f64 / total as f64 * 100.0,
            lba
        );
    }
    let inner = &mut *ctx.lock();
    if let Some(index) = drive_index(inner, replacement_id) {
        inner.drives[index].set_status(DriveStatus::Active);
    }
    inner.phase = WorkerPhase::Idle;
    save_config(inner);
    info!("rebuild of drive {} finished", replacement_id);
    let report = run_health(inner);
    info!("health after rebuild: {}", report.status);
}

/// Reconstructs one logical block onto the replacement drive.
fn rebuild_one(inner: &mut Inner, lba: u64, failed_position: Option<usize>, replacement_id: usize) {
    let entry = match inner.placement.entry(lba) {
        Some(entry) => entry.clone(),
        None => return,
    };

    // RAID-0 has nothing to reconstruct from; install the loss marker.
    if inner.level == RaidLevel::Raid0 {
        if let Some(failed) = failed_position {
            if !entry.contains_key(&failed) {
                return;
            }
            error!(
                "rebuild: RAID-0 block at lba {} is permanently lost",
                lba
            );
            install(inner, lba, replacement_id, None, Block::PermLost, true);
        }
        return;
    }

    let same_slot = failed_position == Some(replacement_id);
    let target_sector = match failed_position {
        Some(failed) => match entry.get(&failed) {
            // The failed drive never took part in this stripe.
            None => return,
            Some(&slot) if slot >= 0 && same_slot => Some(slot as u64),
            Some(_) => None,
        },
        None => None,
    };

    // Collect what the surviving stripe members still hold.
    let mut sources: Vec<Block> = Vec::new();
    for (&drive_id, &slot) in &entry {
        if drive_id == replacement_id || failed_position == Some(drive_id) {
            continue;
        }
        if slot < 0 {
            continue;
        }
        if let Some(index) = drive_index(inner, drive_id) {
            if let Some(sector) = inner.drives[index].read_sector(slot as u64) {
                match sector.block {
                    Block::PermLost | Block::RebuildFail => {}
                    block => sources.push(block),
                }
            } else {
                warn!(
                    "rebuild: could not read lba {} from drive {}",
                    lba, drive_id
                );
            }
        }
    }

    let is_sync = failed_position.is_none();
    match reconstruct(inner.level, lba, &sources) {
        Ok(payload) => {
            let block = if is_sync {
                Block::Synced(payload)
            } else {
                Block::Rebuilt(payload)
            };
            install(inner, lba, replacement_id, target_sector, block, false);
        }
        Err(e) => {
            error!("rebuild: lba {} unrecoverable: {}", lba, e);
            install(inner, lba, replacement_id, target_sector, Block::RebuildFail, true);
        }
    }
}

/// Writes the reconstruction outcome onto the replacement and updates the
/// placement map: the landing sector on success, the lost sentinel on
/// failure.
fn install(
    inner: &mut Inner,
    lba: u64,
    replacement_id: usize,
    target_sector: Option<u64>,
    block: Block,
    lost: bool,
) {
    let index = match drive_index(inner, replacement_id) {
        Some(index) => index,
        None => return,
    };
    let sector = target_sector.unwrap_or_else(|| inner.drives[index].next_physical_sector());
    if let Err(e) = inner.drives[index].targeted_write(sector, block, Some(lba)) {
        error!(
            "rebuild: writing lba {} to drive {} failed: {}",
            lba, replacement_id, e
        );
        inner.drives[index].mark_failed();
        inner.placement.mark_lost(lba, replacement_id);
        return;
    }
    if lost {
        inner.placement.mark_lost(lba, replacement_id);
    } else {
        inner.placement.record(lba, replacement_id, sector);
    }
}

/// Rebuilds the stripe share a missing member held, inferring its role as
/// the complement of the surviving roles.
fn reconstruct(level: RaidLevel, lba: u64, sources: &[Block]) -> Result<String, RaidError> {
    let unavailable = || RaidError::ReconstructionUnavailable(lba);
    match level {
        RaidLevel::Raid0 => Err(unavailable()),
        RaidLevel::Raid1 | RaidLevel::Raid10 => {
            // Any surviving mirror copy will do.
            sources
                .first()
                .map(|b| b.payload().to_string())
                .ok_or_else(unavailable)
        }
        RaidLevel::Raid5 | RaidLevel::Raid50 => {
            let datas: Vec<&str> = sources
                .iter()
                .filter_map(|b| match b {
                    Block::Data(p) => Some(p.as_str()),
                    _ => None,
                })
                .collect();
            let parity = sources.iter().find_map(|b| match b {
                Block::ParityP(t) => Some(t.as_str()),
                _ => None,
            });
            match (parity, datas.is_empty()) {
                // The member that is gone was the data destination.
                (Some(token), true) => codec::invert_p(token, &datas)
                    .map(|c| c.to_string())
                    .ok_or_else(unavailable),
                // Parity is gone; recompute it from the surviving data.
                (None, false) => Ok(codec::p_parity(&datas)),
                // Full stripe still readable: resync with the data copy.
                (Some(_), false) => Ok(datas[0].to_string()),
                (None, true) => Err(unavailable()),
            }
        }
        RaidLevel::Raid6 | RaidLevel::Raid60 => {
            let datas: Vec<&str> = sources
                .iter()
                .filter_map(|b| match b {
                    Block::Data(p) => Some(p.as_str()),
                    _ => None,
                })
                .collect();
            let p = sources.iter().find_map(|b| match b {
                Block::ParityP(t) => Some(t.as_str()),
                _ => None,
            });
            let q = sources.iter().find_map(|b| match b {
                Block::ParityQ(t) => Some(t.as_str()),
                _ => None,
            });
            if datas.is_empty() {
                // Data is the missing role; prefer P, fall back to Q.
                if let Some(token) = p {
                    return codec::invert_p(token, &[])
                        .map(|c| c.to_string())
                        .ok_or_else(unavailable);
                }
                if let Some(token) = q {
                    return codec::invert_q(token, &[], lba)
                        .map(|c| c.to_string())
                        .ok_or_else(unavailable);
                }
                return Err(unavailable());
            }
            match (p, q) {
                (None, Some(_)) => Ok(codec::p_parity(&datas)),
                (Some(_), None) => Ok(codec::q_parity(&datas, lba)),
                // Full stripe still readable: resync with the data copy.
                (Some(_), Some(_)) => Ok(datas[0].to_string()),
                // Two roles missing at once is beyond the simplified codec.
                (None, None) => Err(unavailable()),
            }
        }
    }
}

/// Decodes the user payload for an LBA from a set of surviving blocks:
/// a data copy when one exists, otherwise parity inversion.
pub(crate) fn decode_sources(lba: u64, sources: &[Block]) -> Option<String> {
    if let Some(payload) = sources.iter().find_map(Block::data_payload) {
        return Some(payload.to_string());
    }
    if let Some(token) = sources.iter().find_map(|b| match b {
        Block::ParityP(t) => Some(t.as_str()),
        _ => None,
    }) {
        return codec::invert_p(token, &[]).map(|c| c.to_string());
    }
    if let Some(token) = sources.iter().find_map(|b| match b {
        Block::ParityQ(t) => Some(t.as_str()),
        _ => None,
    }) {
        return codec::invert_q(token, &[], lba).map(|c| c.to_string());
    }
    None
}
