//! Per-segment layout and allocation for [`crate::ByteArrayStorage`].
//!
//! A segment is a fixed-size region of `content.dat`:
//!
//! ```text
//! [ segment header: 7 x u32 (28 bytes) ]
//! [ index region: N x 21-byte slots, growing upward    ]
//! [ ... unallocated middle ...                          ]
//! [ payload region, growing downward from segment end   ]
//! ```
//!
//! Each 21-byte index slot is a 17-byte index entry (`recordId:u64,
//! dataOffset:u32, dataLength:u32, free:u8`) followed by a 4-byte cell
//! used as backing storage for the segment's free-record min-heap — the
//! heap's array occupies the first `freeRecordCount` of those cells by
//! position, independent of which slot number happens to sit there.

use queue_core::error::{QueueError, Result};
use queue_journal::{ProtectedFile, RollbackJournal};
use queue_mmap::MappedFile;

pub const SEGMENT_MAGIC: u32 = 0x5345_474D;
pub const SEGMENT_SIZE: u64 = 2 * 1024 * 1024;

const SEG_HEADER_LEN: u64 = 28;
const INDEX_SLOT_LEN: u64 = 21;
const INDEX_ENTRY_LEN: u64 = 17;

/// Byte offsets of the segment header's seven `u32` fields, relative to
/// the segment start.
const OFF_INDEX_RECORD_COUNT: u64 = 0;
const OFF_FREE_RECORD_COUNT: u64 = 4;
const OFF_LAST_NON_FREE_RECORD: u64 = 8;
const OFF_UNALLOCATED_SPACE: u64 = 12;
const OFF_ALLOCATED_SPACE: u64 = 16;
const OFF_RELEASED_SPACE: u64 = 20;
const OFF_MAGIC: u64 = 24;

/// An in-memory snapshot of one segment's header fields, read once and
/// written back explicitly via [`SegmentView::persist`].
#[derive(Clone, Copy, Debug)]
pub struct SegmentHeader {
    pub index_record_count: u32,
    pub free_record_count: u32,
    /// `u32::MAX` encodes "no non-free record" (an empty segment).
    pub last_non_free_record: u32,
    pub unallocated_space: u32,
    pub allocated_space: u32,
    pub released_space: u32,
}

pub const NO_LAST_NON_FREE: u32 = u32::MAX;

pub struct IndexEntry {
    pub record_id: u64,
    pub data_offset: u32,
    pub data_length: u32,
    pub free: bool,
}

/// A live view over one segment, bound to its absolute byte offset
/// inside `content.dat`.
pub struct SegmentView {
    pub base: u64,
}

impl SegmentView {
    pub fn at(index: u32) -> Self {
        Self {
            base: index as u64 * SEGMENT_SIZE,
        }
    }

    pub fn init(&self, pf: &mut ProtectedFile<'_>) -> Result<()> {
        pf.ensure_capacity(self.base + SEGMENT_SIZE)?;
        let header = SegmentHeader {
            index_record_count: 0,
            free_record_count: 0,
            last_non_free_record: NO_LAST_NON_FREE,
            unallocated_space: (SEGMENT_SIZE - SEG_HEADER_LEN) as u32,
            allocated_space: 0,
            released_space: 0,
        };
        self.write_header(pf, &header)?;
        pf.put_u32(self.base + OFF_MAGIC, SEGMENT_MAGIC)?;
        Ok(())
    }

    pub fn read_header(&self, pf: &ProtectedFile<'_>) -> Result<SegmentHeader> {
        let magic = pf.get_u32(self.base + OFF_MAGIC)?;
        if magic != SEGMENT_MAGIC {
            return Err(QueueError::Format(format!("bad segment marker: {magic:#010x}")));
        }
        Ok(SegmentHeader {
            index_record_count: pf.get_u32(self.base + OFF_INDEX_RECORD_COUNT)?,
            free_record_count: pf.get_u32(self.base + OFF_FREE_RECORD_COUNT)?,
            last_non_free_record: pf.get_u32(self.base + OFF_LAST_NON_FREE_RECORD)?,
            unallocated_space: pf.get_u32(self.base + OFF_UNALLOCATED_SPACE)?,
            allocated_space: pf.get_u32(self.base + OFF_ALLOCATED_SPACE)?,
            released_space: pf.get_u32(self.base + OFF_RELEASED_SPACE)?,
        })
    }

    pub fn write_header(&self, pf: &mut ProtectedFile<'_>, h: &SegmentHeader) -> Result<()> {
        pf.put_u32(self.base + OFF_INDEX_RECORD_COUNT, h.index_record_count)?;
        pf.put_u32(self.base + OFF_FREE_RECORD_COUNT, h.free_record_count)?;
        pf.put_u32(self.base + OFF_LAST_NON_FREE_RECORD, h.last_non_free_record)?;
        pf.put_u32(self.base + OFF_UNALLOCATED_SPACE, h.unallocated_space)?;
        pf.put_u32(self.base + OFF_ALLOCATED_SPACE, h.allocated_space)?;
        pf.put_u32(self.base + OFF_RELEASED_SPACE, h.released_space)?;
        Ok(())
    }

    fn index_region_start(&self) -> u64 {
        self.base + SEG_HEADER_LEN
    }

    fn slot_offset(&self, slot: u32) -> u64 {
        self.index_region_start() + slot as u64 * INDEX_SLOT_LEN
    }

    fn heap_cell_offset(&self, pos: u32) -> u64 {
        self.slot_offset(pos) + INDEX_ENTRY_LEN
    }

    pub fn read_entry(&self, pf: &ProtectedFile<'_>, slot: u32) -> Result<IndexEntry> {
        let off = self.slot_offset(slot);
        let record_id = pf.get_u64(off)?;
        let data_offset = pf.get_u32(off + 8)?;
        let data_length = pf.get_u32(off + 12)?;
        let free = pf.get_u32(off + 16)? != 0;
        Ok(IndexEntry {
            record_id,
            data_offset,
            data_length,
            free,
        })
    }

    fn write_entry(&self, pf: &mut ProtectedFile<'_>, slot: u32, e: &IndexEntry) -> Result<()> {
        let off = self.slot_offset(slot);
        pf.put_u64(off, e.record_id)?;
        pf.put_u32(off + 8, e.data_offset)?;
        pf.put_u32(off + 12, e.data_length)?;
        pf.put_u32(off + 16, e.free as u32)?;
        Ok(())
    }

    // --- free-record min-heap over the per-slot 4-byte companion cells ---

    fn heap_get(&self, pf: &ProtectedFile<'_>, pos: u32) -> Result<u32> {
        pf.get_u32(self.heap_cell_offset(pos))
    }

    fn heap_set(&self, pf: &mut ProtectedFile<'_>, pos: u32, value: u32) -> Result<()> {
        pf.put_u32(self.heap_cell_offset(pos), value)
    }

    fn heap_push(&self, pf: &mut ProtectedFile<'_>, len: u32, slot_number: u32) -> Result<()> {
        self.heap_set(pf, len, slot_number)?;
        let mut i = len;
        while i > 0 {
            let parent = (i - 1) / 2;
            let vi = self.heap_get(pf, i)?;
            let vp = self.heap_get(pf, parent)?;
            if vp <= vi {
                break;
            }
            self.heap_set(pf, i, vp)?;
            self.heap_set(pf, parent, vi)?;
            i = parent;
        }
        Ok(())
    }

    fn heap_pop_min(&self, pf: &mut ProtectedFile<'_>, len: u32) -> Result<u32> {
        let min = self.heap_get(pf, 0)?;
        let new_len = len - 1;
        if new_len > 0 {
            let last = self.heap_get(pf, new_len)?;
            self.heap_set(pf, 0, last)?;
            let mut i = 0u32;
            loop {
                let left = 2 * i + 1;
                let right = 2 * i + 2;
                let mut smallest = i;
                let mut v_smallest = self.heap_get(pf, i)?;
                if left < new_len {
                    let vl = self.heap_get(pf, left)?;
                    if vl < v_smallest {
                        smallest = left;
                        v_smallest = vl;
                    }
                }
                if right < new_len {
                    let vr = self.heap_get(pf, right)?;
                    if vr < v_smallest {
                        smallest = right;
                    }
                }
                if smallest == i {
                    break;
                }
                let vi = self.heap_get(pf, i)?;
                let vs = self.heap_get(pf, smallest)?;
                self.heap_set(pf, i, vs)?;
                self.heap_set(pf, smallest, vi)?;
                i = smallest;
            }
        }
        Ok(min)
    }

    /// Rebuilds the free-record heap in scan order over every free slot
    /// in `0..=last_non_free_record` (used right after compaction, where
    /// the old heap cells may no longer be valid storage positions).
    fn rebuild_free_heap(&self, pf: &mut ProtectedFile<'_>, h: &mut SegmentHeader) -> Result<()> {
        h.free_record_count = 0;
        if h.last_non_free_record == NO_LAST_NON_FREE {
            return Ok(());
        }
        for slot in 0..=h.last_non_free_record {
            let entry = self.read_entry(pf, slot)?;
            if entry.free {
                self.heap_push(pf, h.free_record_count, slot)?;
                h.free_record_count += 1;
            }
        }
        Ok(())
    }

    fn reclaimable_trailing_slots(&self, h: &SegmentHeader) -> u32 {
        h.index_record_count - (h.last_non_free_record.wrapping_add(1)).min(h.index_record_count)
    }

    /// `true` if `needed` bytes of payload (plus a fresh index slot if
    /// the free-heap is empty) fit either directly, or after reclaiming
    /// released payload bytes and trailing free index slots.
    pub fn can_allocate(&self, h: &SegmentHeader, len: u32) -> bool {
        let needed = len + if h.free_record_count == 0 { INDEX_SLOT_LEN as u32 } else { 0 };
        if needed <= h.unallocated_space {
            return true;
        }
        let reclaimable = h.released_space + self.reclaimable_trailing_slots(h) as u32 * INDEX_SLOT_LEN as u32;
        needed <= h.unallocated_space + reclaimable
    }

    /// Allocates `bytes` under `record_id`, compacting first if the
    /// direct path doesn't have room. Returns the slot number the new
    /// entry was written at.
    pub fn allocate(
        &self,
        pf: &mut ProtectedFile<'_>,
        record_id: u64,
        bytes: &[u8],
    ) -> Result<Option<u32>> {
        let mut h = self.read_header(pf)?;
        let len = bytes.len() as u32;
        let needed = len + if h.free_record_count == 0 { INDEX_SLOT_LEN as u32 } else { 0 };

        if needed > h.unallocated_space {
            if !self.can_allocate(&h, len) {
                return Ok(None);
            }
            self.compact(pf, &mut h)?;
        }

        let data_offset = (SEGMENT_SIZE as u32) - h.allocated_space - len;
        pf.write_bytes(self.base + data_offset as u64, bytes)?;
        h.allocated_space += len;

        let slot = if h.free_record_count > 0 {
            let slot = self.heap_pop_min(pf, h.free_record_count)?;
            h.free_record_count -= 1;
            slot
        } else {
            let slot = h.index_record_count;
            h.index_record_count += 1;
            slot
        };
        h.unallocated_space -= needed;

        self.write_entry(
            pf,
            slot,
            &IndexEntry {
                record_id,
                data_offset,
                data_length: len,
                free: false,
            },
        )?;
        if h.last_non_free_record == NO_LAST_NON_FREE || slot > h.last_non_free_record {
            h.last_non_free_record = slot;
        }
        self.write_header(pf, &h)?;
        Ok(Some(slot))
    }

    pub fn lookup(&self, pf: &ProtectedFile<'_>, slot: u32, record_id: u64) -> Result<Option<Vec<u8>>> {
        let h = self.read_header(pf)?;
        if slot >= h.index_record_count {
            return Ok(None);
        }
        let entry = self.read_entry(pf, slot)?;
        if entry.free || entry.record_id != record_id {
            return Ok(None);
        }
        let bytes = pf.read_bytes(self.base + entry.data_offset as u64, entry.data_length)?;
        Ok(Some(bytes))
    }

    pub fn delete(&self, pf: &mut ProtectedFile<'_>, slot: u32, record_id: u64) -> Result<bool> {
        let mut h = self.read_header(pf)?;
        if slot >= h.index_record_count {
            return Ok(false);
        }
        let mut entry = self.read_entry(pf, slot)?;
        if entry.free || entry.record_id != record_id {
            return Ok(false);
        }
        entry.free = true;
        let length = entry.data_length;
        self.write_entry(pf, slot, &entry)?;

        self.heap_push(pf, h.free_record_count, slot)?;
        h.free_record_count += 1;
        h.released_space += length;

        if slot == h.last_non_free_record {
            let mut cursor = slot;
            loop {
                if cursor == 0 {
                    h.last_non_free_record = NO_LAST_NON_FREE;
                    break;
                }
                cursor -= 1;
                let candidate = self.read_entry(pf, cursor)?;
                if !candidate.free {
                    h.last_non_free_record = cursor;
                    break;
                }
            }
            if h.last_non_free_record == NO_LAST_NON_FREE && !self.read_entry(pf, 0)?.free {
                h.last_non_free_record = 0;
            }
        }
        self.write_header(pf, &h)?;
        Ok(true)
    }

    /// Garbage-collects the segment: trims trailing free index slots,
    /// rebuilds the free-record heap, and slides every live payload into
    /// a contiguous tail buffer in slot order.
    fn compact(&self, pf: &mut ProtectedFile<'_>, h: &mut SegmentHeader) -> Result<()> {
        if h.last_non_free_record == NO_LAST_NON_FREE {
            h.index_record_count = 0;
        } else {
            h.index_record_count = h.last_non_free_record + 1;
        }
        self.rebuild_free_heap(pf, h)?;

        let mut entries = Vec::new();
        if h.last_non_free_record != NO_LAST_NON_FREE {
            for slot in 0..=h.last_non_free_record {
                let entry = self.read_entry(pf, slot)?;
                if !entry.free {
                    entries.push((slot, entry));
                }
            }
        }

        // Read every live payload's bytes before writing any of them back.
        // Slot order has no relationship to physical data_offset (offsets
        // are assigned by allocation recency, slots are recycled
        // independently via the free-record heap), so writing one entry's
        // relocated bytes can land inside a range another, not-yet-read
        // entry still occupies. Buffering first removes any write-before-
        // read ordering hazard regardless of how slots map to offsets.
        let mut payloads = Vec::with_capacity(entries.len());
        for (_, entry) in &entries {
            let bytes = pf.read_bytes(self.base + entry.data_offset as u64, entry.data_length)?;
            payloads.push(bytes);
        }

        let mut tail_offset = SEGMENT_SIZE as u32;
        let mut allocated = 0u32;
        for ((slot, entry), bytes) in entries.iter_mut().zip(payloads.into_iter()) {
            tail_offset -= entry.data_length;
            pf.write_bytes(self.base + tail_offset as u64, &bytes)?;
            entry.data_offset = tail_offset;
            allocated += entry.data_length;
            self.write_entry(pf, *slot, entry)?;
        }

        h.allocated_space = allocated;
        h.released_space = 0;
        h.unallocated_space = SEGMENT_SIZE as u32
            - SEG_HEADER_LEN as u32
            - h.index_record_count * INDEX_SLOT_LEN as u32
            - h.allocated_space;
        self.write_header(pf, h)
    }
}
