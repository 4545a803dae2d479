use std::collections::BTreeMap;

/// Sector slot recorded for a drive that once held a block and has since
/// permanently lost it.
pub const LOST: i64 = -1;

/// The authoritative LBA -> {drive -> physical sector} index.
///
/// Entries are created per successful write and never removed; a slot of
/// [`LOST`] marks a block that was written and is now gone for good. A drive
/// absent from an entry simply never participated in that stripe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementMap {
    entries: BTreeMap<u64, BTreeMap<usize, i64>>,
}

impl PlacementMap {
    pub fn new() -> PlacementMap {
        PlacementMap::default()
    }

    /// Opens (or resets) the entry for an LBA ahead of its stripe writes.
    pub fn begin(&mut self, lba: u64) {
        self.entries.insert(lba, BTreeMap::new());
    }

    pub fn record(&mut self, lba: u64, drive_id: usize, sector: u64) {
        self.entries
            .entry(lba)
            .or_insert_with(BTreeMap::new)
            .insert(drive_id, sector as i64);
    }

    pub fn mark_lost(&mut self, lba: u64, drive_id: usize) {
        self.entries
            .entry(lba)
            .or_insert_with(BTreeMap::new)
            .insert(drive_id, LOST);
    }

    /// Marks every block this drive ever held as permanently lost. Used when
    /// a RAID-0 member fails beyond recovery.
    pub fn mark_drive_lost(&mut self, drive_id: usize) {
        for entry in self.entries.values_mut() {
            if entry.contains_key(&drive_id) {
                entry.insert(drive_id, LOST);
            }
        }
    }

    pub fn replace(&mut self, lba: u64, entry: BTreeMap<usize, i64>) {
        self.entries.insert(lba, entry);
    }

    pub fn entry(&self, lba: u64) -> Option<&BTreeMap<usize, i64>> {
        self.entries.get(&lba)
    }

    pub fn sector_on(&self, lba: u64, drive_id: usize) -> Option<i64> {
        self.entries.get(&lba).and_then(|e| e.get(&drive_id)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &BTreeMap<usize, i64>)> {
        self.entries.iter()
    }

    /// Used by the catalog loader to repopulate the index record by record.
    pub fn insert_raw(&mut self, lba: u64, drive_id: usize, slot: i64) {
        self.entries
            .entry(lba)
            .or_insert_with(BTreeMap::new)
            .insert(drive_id, slot);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
