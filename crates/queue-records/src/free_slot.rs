//! Free-slot stack entry: a single recycled header index.

use queue_mmap::StorageAdapter;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FreeSlotRecord(pub u32);

impl StorageAdapter for FreeSlotRecord {
    const RECORD_SIZE: u32 = 4;

    fn read(buf: &[u8]) -> Self {
        Self(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
    }

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.0.to_le_bytes());
    }
}
