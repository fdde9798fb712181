//! `queue-blobstore`: `content.dat`, the segmented byte-array storage
//! backing message bodies.
//!
//! Generalizes the teacher's single growable `MappedFile` into a file
//! divided into fixed-size, never-removed segments (component design
//! mirrors `lithos-mmap`'s growable-region contract, but the content
//! file grows by *appending whole segments* rather than remapping a
//! single region larger).

mod segment;

use queue_core::error::{QueueError, Result};
use queue_journal::{ProtectedFile, RollbackJournal};
use queue_mmap::MappedFile;
use queue_records::Handle;
use segment::SegmentView;
use std::path::Path;

pub use segment::SEGMENT_SIZE;

pub const STORAGE_MAGIC: u32 = 0x4D42_4153;

const OFF_MAGIC: u64 = 0;
const OFF_SEGMENT_SIZE: u64 = 4;
const OFF_SEGMENT_COUNT: u64 = 8;
const OFF_LAST_USED_SEGMENT: u64 = 12;
const OFF_NEXT_RECORD_ID: u64 = 16;
const STORAGE_HEADER_LEN: u64 = 24;

/// Segmented byte-array storage for message bodies.
pub struct ByteArrayStorage {
    file: MappedFile,
    file_id: u32,
}

impl ByteArrayStorage {
    pub fn create<P: AsRef<Path>>(path: P, file_id: u32) -> Result<Self> {
        let mut file = MappedFile::create(path, STORAGE_HEADER_LEN)?;
        file.put_u32(OFF_MAGIC, STORAGE_MAGIC)?;
        file.put_u32(OFF_SEGMENT_SIZE, SEGMENT_SIZE as u32)?;
        file.put_u32(OFF_SEGMENT_COUNT, 0)?;
        file.put_u32(OFF_LAST_USED_SEGMENT, 0)?;
        file.put_u64(OFF_NEXT_RECORD_ID, 0)?;
        Ok(Self { file, file_id })
    }

    pub fn open<P: AsRef<Path>>(path: P, file_id: u32) -> Result<Self> {
        let file = MappedFile::open(path)?;
        let magic = file.get_u32(OFF_MAGIC)?;
        if magic != STORAGE_MAGIC {
            return Err(QueueError::Format(format!("bad byte-array storage marker: {magic:#010x}")));
        }
        let segment_size = file.get_u32(OFF_SEGMENT_SIZE)?;
        if segment_size as u64 != SEGMENT_SIZE {
            return Err(QueueError::Format(format!(
                "stored segment size {segment_size} != {SEGMENT_SIZE}"
            )));
        }
        Ok(Self { file, file_id })
    }

    pub fn backing_file_mut(&mut self) -> (&mut MappedFile, u32) {
        (&mut self.file, self.file_id)
    }

    fn segment_count(&self) -> Result<u32> {
        Ok(self.file.get_u32(OFF_SEGMENT_COUNT)?)
    }

    fn last_used_segment(&self) -> Result<u32> {
        Ok(self.file.get_u32(OFF_LAST_USED_SEGMENT)?)
    }

    fn next_record_id(&mut self, journal: &mut RollbackJournal) -> Result<u64> {
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        let id = pf.get_u64(OFF_NEXT_RECORD_ID)?;
        pf.put_u64(OFF_NEXT_RECORD_ID, id + 1)?;
        Ok(id)
    }

    fn append_segment(&mut self, journal: &mut RollbackJournal) -> Result<u32> {
        let count = self.segment_count()?;
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        let view = SegmentView::at(count);
        view.init(&mut pf)?;
        pf.put_u32(OFF_SEGMENT_COUNT, count + 1)?;
        Ok(count)
    }

    /// Stores `bytes` under a fresh, globally unique record id. Tries
    /// segments starting from the last-used hint (wrapping around);
    /// appends a new segment if none have room.
    pub fn add_array(&mut self, journal: &mut RollbackJournal, bytes: &[u8]) -> Result<Handle> {
        let record_id = self.next_record_id(journal)?;
        let count = self.segment_count()?;
        let start = if count == 0 { 0 } else { self.last_used_segment()? };

        for step in 0..count {
            let idx = (start + step) % count;
            let view = SegmentView::at(idx);
            let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
            if let Some(slot) = view.allocate(&mut pf, record_id, bytes)? {
                pf.put_u32(OFF_LAST_USED_SEGMENT, idx)?;
                return Ok(Handle {
                    segment: idx,
                    record_number: slot,
                    record_id,
                });
            }
        }

        let new_idx = self.append_segment(journal)?;
        let view = SegmentView::at(new_idx);
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        let slot = view.allocate(&mut pf, record_id, bytes)?.ok_or_else(|| {
            QueueError::State("message body does not fit in a fresh segment".into())
        })?;
        pf.put_u32(OFF_LAST_USED_SEGMENT, new_idx)?;
        Ok(Handle {
            segment: new_idx,
            record_number: slot,
            record_id,
        })
    }

    pub fn get_array(&mut self, journal: &mut RollbackJournal, handle: Handle) -> Result<Option<Vec<u8>>> {
        let pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        let view = SegmentView::at(handle.segment);
        view.lookup(&pf, handle.record_number, handle.record_id)
    }

    pub fn delete_array(&mut self, journal: &mut RollbackJournal, handle: Handle) -> Result<bool> {
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        let view = SegmentView::at(handle.segment);
        view.delete(&mut pf, handle.record_number, handle.record_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("queue_blobstore_test_{name}_{ts}"))
    }

    fn new_storage(name: &str) -> (RollbackJournal, ByteArrayStorage, std::path::PathBuf, std::path::PathBuf) {
        let journal_path = tmp_path(&format!("{name}_journal"));
        let content_path = tmp_path(&format!("{name}_content"));
        let journal = RollbackJournal::create(&journal_path).unwrap();
        let storage = ByteArrayStorage::create(&content_path, 40).unwrap();
        (journal, storage, journal_path, content_path)
    }

    #[test]
    fn add_then_get_roundtrips_bytes() {
        let (mut journal, mut storage, jp, cp) = new_storage("roundtrip");
        let handle = storage.add_array(&mut journal, b"hello world").unwrap();
        let back = storage.get_array(&mut journal, handle).unwrap().unwrap();
        assert_eq!(back, b"hello world");
        let _ = std::fs::remove_file(jp);
        let _ = std::fs::remove_file(cp);
    }

    #[test]
    fn delete_then_get_returns_none() {
        let (mut journal, mut storage, jp, cp) = new_storage("delete");
        let handle = storage.add_array(&mut journal, b"gone soon").unwrap();
        assert!(storage.delete_array(&mut journal, handle).unwrap());
        assert!(storage.get_array(&mut journal, handle).unwrap().is_none());
        let _ = std::fs::remove_file(jp);
        let _ = std::fs::remove_file(cp);
    }

    #[test]
    fn stale_handle_after_slot_reuse_is_rejected() {
        let (mut journal, mut storage, jp, cp) = new_storage("stale");
        let h1 = storage.add_array(&mut journal, b"first").unwrap();
        storage.delete_array(&mut journal, h1).unwrap();
        let h2 = storage.add_array(&mut journal, b"second").unwrap();
        assert_eq!(h2.segment, h1.segment);
        assert_eq!(h2.record_number, h1.record_number);
        assert_ne!(h2.record_id, h1.record_id);
        // The old handle's recordId no longer matches what's in the slot.
        assert!(storage.get_array(&mut journal, h1).unwrap().is_none());
        assert_eq!(storage.get_array(&mut journal, h2).unwrap().unwrap(), b"second");
        let _ = std::fs::remove_file(jp);
        let _ = std::fs::remove_file(cp);
    }

    #[test]
    fn many_small_records_round_trip_across_compaction() {
        let (mut journal, mut storage, jp, cp) = new_storage("compaction");
        // Bodies are sized (and the record count chosen) so the base fill
        // consumes nearly all of one 2 MiB segment: 2000 * (1000 + 21)
        // index/payload bytes ~= 2,042,000, leaving only ~55 KiB of direct
        // headroom. That small headroom is what forces the later reuse
        // allocations below to go through `allocate()`'s compaction path
        // instead of just being satisfied directly.
        let body_of = |i: u32| vec![(i % 256) as u8; 1000];
        let mut handles = Vec::new();
        for i in 0..2000u32 {
            handles.push((i, storage.add_array(&mut journal, &body_of(i)).unwrap()));
        }
        // Delete every other one: released_space now comfortably covers
        // the remaining headroom shortfall, so reuse allocations below
        // succeed only via `can_allocate`'s reclaim path, i.e. via compact().
        for (i, h) in &handles {
            if i % 2 == 0 {
                storage.delete_array(&mut journal, *h).unwrap();
            }
        }
        for i in 2000..2500u32 {
            storage.add_array(&mut journal, &body_of(i)).unwrap();
        }
        for (i, h) in &handles {
            let got = storage.get_array(&mut journal, *h).unwrap();
            if i % 2 == 0 {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap(), body_of(*i));
            }
        }
        let _ = std::fs::remove_file(jp);
        let _ = std::fs::remove_file(cp);
    }

    #[test]
    fn compact_does_not_corrupt_a_live_record_whose_neighbor_slot_was_reused() {
        // Direct `SegmentView` drive of the exact shape that corrupts data
        // under slot-order compaction: a low-numbered slot is freed then
        // reused by a new, larger record. Because `allocated_space` only
        // ever grows, the reused record's new physical offset ends up
        // *closer to the segment's tail* than a still-live, higher-numbered
        // neighbor's offset, inverting the slot-order/offset-order
        // relationship compaction relies on. Processing slot order without
        // reading every live payload first would let one entry's relocated
        // write clobber another entry's still-unread original bytes.
        let journal_path = tmp_path("compact_corruption_journal");
        let file_path = tmp_path("compact_corruption_data");
        let mut journal = RollbackJournal::create(&journal_path).unwrap();
        let mut file = MappedFile::create(&file_path, SEGMENT_SIZE).unwrap();
        {
            let mut pf = ProtectedFile::new(&mut journal, 99, &mut file);
            let view = SegmentView::at(0);
            view.init(&mut pf).unwrap();

            let y_bytes = vec![0x11u8; 100];
            let z_bytes = vec![0x22u8; 50];
            let y_slot = view.allocate(&mut pf, 1, &y_bytes).unwrap().unwrap();
            let z_slot = view.allocate(&mut pf, 2, &z_bytes).unwrap().unwrap();
            assert_eq!((y_slot, z_slot), (0, 1));

            // Free Y, then reuse its slot for X: X lands at a new offset
            // further from the tail than Z's, even though X's slot number
            // (0) is lower than Z's (1).
            assert!(view.delete(&mut pf, y_slot, 1).unwrap());
            let x_bytes = vec![0x33u8; 150];
            let x_slot = view.allocate(&mut pf, 3, &x_bytes).unwrap().unwrap();
            assert_eq!(x_slot, y_slot);

            // Consume almost all remaining direct headroom, leaving just
            // enough that the next allocation can only succeed by
            // reclaiming Y's released bytes, i.e. by compacting.
            let header = view.read_header(&pf).unwrap();
            let filler_len = header.unallocated_space - 21 - 50;
            let filler_bytes = vec![0x44u8; filler_len as usize];
            view.allocate(&mut pf, 4, &filler_bytes).unwrap().unwrap();

            let w_bytes = vec![0x55u8; 64];
            view.allocate(&mut pf, 5, &w_bytes).unwrap().unwrap();

            let z_back = view.lookup(&pf, z_slot, 2).unwrap().unwrap();
            assert_eq!(z_back, z_bytes, "Z's payload must survive compaction intact");
            let x_back = view.lookup(&pf, x_slot, 3).unwrap().unwrap();
            assert_eq!(x_back, x_bytes, "X's payload must survive compaction intact");
        }
        let _ = std::fs::remove_file(&journal_path);
        let _ = std::fs::remove_file(&file_path);
    }

    #[test]
    fn two_fifths_sized_arrays_pack_exactly_two_per_segment() {
        let (mut journal, mut storage, jp, cp) = new_storage("two_fifths");
        let array_len = (2 * SEGMENT_SIZE / 5) as usize;
        let payload = vec![0xABu8; array_len];

        let h1 = storage.add_array(&mut journal, &payload).unwrap();
        let h2 = storage.add_array(&mut journal, &payload).unwrap();
        assert_eq!(h1.segment, h2.segment, "both arrays should land in the same segment");

        // A third array of the same size must overflow into a new segment:
        // two of them plus their index slots leave less than one more
        // array's worth of room in a single 2 MiB segment.
        let h3 = storage.add_array(&mut journal, &payload).unwrap();
        assert_ne!(h3.segment, h1.segment);

        assert_eq!(storage.get_array(&mut journal, h1).unwrap().unwrap(), payload);
        assert_eq!(storage.get_array(&mut journal, h2).unwrap().unwrap(), payload);
        let _ = std::fs::remove_file(jp);
        let _ = std::fs::remove_file(cp);
    }
}
