//! Visibility-heap entry record: `(slot, visibleSince)`, 12 bytes.

use queue_mmap::StorageAdapter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct HeapEntryRecord {
    pub slot: u32,
    pub visible_since: u64,
}

impl StorageAdapter for HeapEntryRecord {
    const RECORD_SIZE: u32 = 12;

    fn read(buf: &[u8]) -> Self {
        Self {
            slot: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            visible_since: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.slot.to_le_bytes());
        buf[4..12].copy_from_slice(&self.visible_since.to_le_bytes());
    }
}
