use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("{0} needs at least {1} active drives in the stripe")]
    InsufficientDrives(&'static str, usize),
    #[error("drive roster is not a multiple of the {0}-drive group width")]
    UnevenGroups(usize),
    #[error("every drive in the selected mirror pair has failed")]
    PairUnavailable,
    #[error("striping without redundancy needs every drive active")]
    StripeBroken,
}

/// The seven array geometries the simulator models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RaidLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
    Raid50,
    Raid60,
}

impl RaidLevel {
    pub fn from_number(n: u32) -> Option<RaidLevel> {
        match n {
            0 => Some(RaidLevel::Raid0),
            1 => Some(RaidLevel::Raid1),
            5 => Some(RaidLevel::Raid5),
            6 => Some(RaidLevel::Raid6),
            10 => Some(RaidLevel::Raid10),
            50 => Some(RaidLevel::Raid50),
            60 => Some(RaidLevel::Raid60),
            _ => None,
        }
    }

    pub fn number(self) -> u32 {
        match self {
            RaidLevel::Raid0 => 0,
            RaidLevel::Raid1 => 1,
            RaidLevel::Raid5 => 5,
            RaidLevel::Raid6 => 6,
            RaidLevel::Raid10 => 10,
            RaidLevel::Raid50 => 50,
            RaidLevel::Raid60 => 60,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RaidLevel::Raid0 => "RAID-0 (Striping)",
            RaidLevel::Raid1 => "RAID-1 (Mirroring)",
            RaidLevel::Raid5 => "RAID-5 (Striping with Parity)",
            RaidLevel::Raid6 => "RAID-6 (Striping with Dual Parity)",
            RaidLevel::Raid10 => "RAID-10 (Mirrored Stripes)",
            RaidLevel::Raid50 => "RAID-50 (Striped RAID-5)",
            RaidLevel::Raid60 => "RAID-60 (Striped RAID-6)",
        }
    }

    /// Smallest drive roster the level can be built on.
    pub fn min_drives(self) -> usize {
        match self {
            RaidLevel::Raid0 | RaidLevel::Raid1 => 2,
            RaidLevel::Raid5 => 3,
            RaidLevel::Raid6 | RaidLevel::Raid10 => 4,
            RaidLevel::Raid50 => 6,
            RaidLevel::Raid60 => 8,
        }
    }

    /// Simultaneous drive losses the level survives.
    pub fn fault_tolerance(self) -> usize {
        match self {
            RaidLevel::Raid0 => 0,
            RaidLevel::Raid1 | RaidLevel::Raid5 => 1,
            RaidLevel::Raid6 | RaidLevel::Raid10 | RaidLevel::Raid50 => 2,
            RaidLevel::Raid60 => 4,
        }
    }

    /// Width of the mirror pair / inner parity group for the nested levels.
    pub fn group_width(self) -> Option<usize> {
        match self {
            RaidLevel::Raid10 => Some(2),
            RaidLevel::Raid50 => Some(RaidLevel::Raid5.min_drives()),
            RaidLevel::Raid60 => Some(RaidLevel::Raid6.min_drives()),
            _ => None,
        }
    }

    pub fn is_nested(self) -> bool {
        self.group_width().is_some()
    }

    /// Stripe components a fully healthy LBA carries at this level.
    pub fn expected_components(self, total_drives: usize) -> usize {
        match self {
            RaidLevel::Raid0 => 1,
            RaidLevel::Raid1 => total_drives,
            RaidLevel::Raid5 | RaidLevel::Raid10 | RaidLevel::Raid50 => 2,
            RaidLevel::Raid6 | RaidLevel::Raid60 => 3,
        }
    }
}

/// Function a sector plays inside one stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StripeRole {
    Data,
    ParityP,
    ParityQ,
}

/// One drive's part in the stripe chosen for an LBA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub drive_id: usize,
    pub role: StripeRole,
}

/// A drive as geometry sees it: its slot in the roster and whether it can
/// take I/O right now.
#[derive(Debug, Clone, Copy)]
pub struct DriveSlot {
    pub id: usize,
    pub active: bool,
}

/// Maps an LBA to its ordered role assignments under the given level.
///
/// Data destinations come first, parity after, so a writer can commit user
/// payloads before redundancy. The result is a pure function of
/// `(level, lba, slots)`; replays are identical.
pub fn assign(
    level: RaidLevel,
    lba: u64,
    slots: &[DriveSlot],
) -> Result<Vec<Assignment>, GeometryError> {
    let active: Vec<DriveSlot> = slots.iter().filter(|s| s.active).cloned().collect();
    match level {
        RaidLevel::Raid0 => {
            if active.is_empty() || active.len() < slots.len() {
                return Err(GeometryError::StripeBroken);
            }
            let target = active[lba as usize % active.len()];
            Ok(vec![Assignment {
                drive_id: target.id,
                role: StripeRole::Data,
            }])
        }
        RaidLevel::Raid1 => {
            if active.is_empty() {
                return Err(GeometryError::InsufficientDrives("RAID-1", 1));
            }
            Ok(mirror_all(&active))
        }
        RaidLevel::Raid5 => single_parity(lba, &active, "RAID-5"),
        RaidLevel::Raid6 => dual_parity(lba, &active, "RAID-6"),
        RaidLevel::Raid10 => {
            let pair = group_for(lba, slots, 2)?;
            let live: Vec<DriveSlot> = pair.iter().filter(|s| s.active).cloned().collect();
            if live.is_empty() {
                return Err(GeometryError::PairUnavailable);
            }
            Ok(mirror_all(&live))
        }
        RaidLevel::Raid50 => {
            let group = group_for(lba, slots, RaidLevel::Raid5.min_drives())?;
            let live: Vec<DriveSlot> = group.iter().filter(|s| s.active).cloned().collect();
            single_parity(lba, &live, "RAID-50 sub-group")
        }
        RaidLevel::Raid60 => {
            let group = group_for(lba, slots, RaidLevel::Raid6.min_drives())?;
            let live: Vec<DriveSlot> = group.iter().filter(|s| s.active).cloned().collect();
            dual_parity(lba, &live, "RAID-60 sub-group")
        }
    }
}

fn mirror_all(active: &[DriveSlot]) -> Vec<Assignment> {
    active
        .iter()
        .map(|s| Assignment {
            drive_id: s.id,
            role: StripeRole::Data,
        })
        .collect()
}

/// Partitions the full roster into consecutive groups of `width` and picks
/// the group this LBA stripes into.
fn group_for(lba: u64, slots: &[DriveSlot], width: usize) -> Result<&[DriveSlot], GeometryError> {
    if slots.is_empty() || slots.len() % width != 0 {
        return Err(GeometryError::UnevenGroups(width));
    }
    let groups = slots.len() / width;
    let index = lba as usize % groups;
    Ok(&slots[index * width..(index + 1) * width])
}

/// Rotated single parity: parity on `lba mod n`, data on the `lba mod (n-1)`
/// survivor of the remaining drives in roster order.
fn single_parity(
    lba: u64,
    active: &[DriveSlot],
    label: &'static str,
) -> Result<Vec<Assignment>, GeometryError> {
    let n = active.len();
    if n < 2 {
        return Err(GeometryError::InsufficientDrives(label, 2));
    }
    let parity = lba as usize % n;
    let pool: Vec<DriveSlot> = active
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != parity)
        .map(|(_, s)| *s)
        .collect();
    let data = pool[lba as usize % pool.len()];
    Ok(vec![
        Assignment {
            drive_id: data.id,
            role: StripeRole::Data,
        },
        Assignment {
            drive_id: active[parity].id,
            role: StripeRole::ParityP,
        },
    ])
}

/// Rotated dual parity: P on `lba mod n`, Q on the next distinct index,
/// data on the `lba mod (n-2)` drive of what is left.
fn dual_parity(
    lba: u64,
    active: &[DriveSlot],
    label: &'static str,
) -> Result<Vec<Assignment>, GeometryError> {
    let n = active.len();
    if n < 3 {
        return Err(GeometryError::InsufficientDrives(label, 3));
    }
    let p = lba as usize % n;
    let mut q = (lba as usize + 1) % n;
    if p == q {
        q = (q + 1) % n;
    }
    let pool: Vec<DriveSlot> = active
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != p && *i != q)
        .map(|(_, s)| *s)
        .collect();
    let data = pool[lba as usize % pool.len()];
    Ok(vec![
        Assignment {
            drive_id: data.id,
            role: StripeRole::Data,
        },
        Assignment {
            drive_id: active[p].id,
            role: StripeRole::ParityP,
        },
        Assignment {
            drive_id: active[q].id,
            role: StripeRole::ParityQ,
        },
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn roster(n: usize) -> Vec<DriveSlot> {
        (0..n).map(|id| DriveSlot { id, active: true }).collect()
    }

    fn ids_with_role(assignments: &[Assignment], role: StripeRole) -> Vec<usize> {
        assignments
            .iter()
            .filter(|a| a.role == role)
            .map(|a| a.drive_id)
            .collect()
    }

    #[test]
    fn raid0_round_robin() {
        let slots = roster(3);
        for lba in 0..9u64 {
            let a = assign(RaidLevel::Raid0, lba, &slots).unwrap();
            assert_eq!(a.len(), 1);
            assert_eq!(a[0].drive_id, lba as usize % 3);
        }
    }

    #[test]
    fn raid0_refuses_degraded_roster() {
        let mut slots = roster(3);
        slots[1].active = false;
        assert_eq!(
            assign(RaidLevel::Raid0, 0, &slots),
            Err(GeometryError::StripeBroken)
        );
    }

    #[test]
    fn raid1_mirrors_every_active_drive() {
        let mut slots = roster(3);
        slots[2].active = false;
        let a = assign(RaidLevel::Raid1, 5, &slots).unwrap();
        assert_eq!(ids_with_role(&a, StripeRole::Data), vec![0, 1]);
    }

    #[test]
    fn raid5_parity_rotation() {
        let slots = roster(3);
        for lba in 0..6u64 {
            let a = assign(RaidLevel::Raid5, lba, &slots).unwrap();
            let parity = ids_with_role(&a, StripeRole::ParityP);
            assert_eq!(parity, vec![lba as usize % 3]);
            let data = ids_with_role(&a, StripeRole::Data);
            assert_eq!(data.len(), 1);
            assert_ne!(data[0], parity[0]);
        }
        // lba 0: parity on 0, pool [1, 2], data = pool[0 % 2] = 1
        let a = assign(RaidLevel::Raid5, 0, &slots).unwrap();
        assert_eq!(a[0].drive_id, 1);
        // Data always comes before parity.
        assert_eq!(a[0].role, StripeRole::Data);
    }

    #[test]
    fn raid6_four_drive_layout() {
        // p = 0, q = 1, pool [2, 3], data = pool[0 % 2] = 2.
        let a = assign(RaidLevel::Raid6, 0, &roster(4)).unwrap();
        assert_eq!(ids_with_role(&a, StripeRole::Data), vec![2]);
        assert_eq!(ids_with_role(&a, StripeRole::ParityP), vec![0]);
        assert_eq!(ids_with_role(&a, StripeRole::ParityQ), vec![1]);
    }

    #[test]
    fn raid6_parity_indices_stay_distinct() {
        let slots = roster(4);
        for lba in 0..16u64 {
            let a = assign(RaidLevel::Raid6, lba, &slots).unwrap();
            let p = ids_with_role(&a, StripeRole::ParityP)[0];
            let q = ids_with_role(&a, StripeRole::ParityQ)[0];
            assert_ne!(p, q);
        }
    }

    #[test]
    fn raid6_needs_three_in_play() {
        let mut slots = roster(4);
        slots[0].active = false;
        slots[1].active = false;
        assert!(matches!(
            assign(RaidLevel::Raid6, 0, &slots),
            Err(GeometryError::InsufficientDrives(_, 3))
        ));
    }

    #[test]
    fn raid10_stripes_across_pairs() {
        let slots = roster(4);
        let a = assign(RaidLevel::Raid10, 0, &slots).unwrap();
        assert_eq!(ids_with_role(&a, StripeRole::Data), vec![0, 1]);
        let a = assign(RaidLevel::Raid10, 1, &slots).unwrap();
        assert_eq!(ids_with_role(&a, StripeRole::Data), vec![2, 3]);
    }

    #[test]
    fn raid10_survives_half_a_pair() {
        let mut slots = roster(4);
        slots[0].active = false;
        let a = assign(RaidLevel::Raid10, 0, &slots).unwrap();
        assert_eq!(ids_with_role(&a, StripeRole::Data), vec![1]);
        slots[1].active = false;
        assert_eq!(
            assign(RaidLevel::Raid10, 0, &slots),
            Err(GeometryError::PairUnavailable)
        );
    }

    #[test]
    fn raid50_groups_then_stripes() {
        let slots = roster(6);
        // lba 1 -> group 1 (drives 3..6); inside it parity = 1 % 3 = drive 4.
        let a = assign(RaidLevel::Raid50, 1, &slots).unwrap();
        assert_eq!(ids_with_role(&a, StripeRole::ParityP), vec![4]);
        let data = ids_with_role(&a, StripeRole::Data)[0];
        assert!(data >= 3 && data < 6);
    }

    #[test]
    fn raid60_stays_inside_its_group() {
        let slots = roster(8);
        for lba in 0..8u64 {
            let a = assign(RaidLevel::Raid60, lba, &slots).unwrap();
            let group = lba as usize % 2;
            for part in &a {
                assert!(part.drive_id / 4 == group);
            }
            assert_eq!(a.len(), 3);
        }
    }

    #[test]
    fn replay_is_deterministic() {
        let slots = roster(6);
        for lba in 0..32u64 {
            let a = assign(RaidLevel::Raid50, lba, &slots).unwrap();
            let b = assign(RaidLevel::Raid50, lba, &slots).unwrap();
            assert_eq!(a, b);
        }
    }
}
