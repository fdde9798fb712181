//! `MappedArrayList<T>`: a growable, file-backed array of fixed-size
//! records over a journaled [`queue_mmap::MappedFile`].

use crate::error::{QueueError, Result};
use queue_journal::{ProtectedFile, RollbackJournal};
use queue_mmap::{MappedFile, StorageAdapter};
use std::marker::PhantomData;
use std::path::Path;

/// Marker identifying a `MappedArrayList` file: `"MMAL"` read little-endian.
pub const ARRAY_MAGIC: u32 = 0x4D4D_414C;

const MARKER_OFFSET: u64 = 0;
const COUNT_OFFSET: u64 = 4;
const RECORD_SIZE_OFFSET: u64 = 8;
/// Fixed header: marker + count + record_size.
pub const HEADER_LEN: u64 = 12;

pub struct MappedArrayList<T: StorageAdapter> {
    file: MappedFile,
    file_id: u32,
    _pd: PhantomData<T>,
}

impl<T: StorageAdapter> MappedArrayList<T> {
    pub fn create<P: AsRef<Path>>(path: P, file_id: u32) -> Result<Self> {
        let mut file = MappedFile::create(path, HEADER_LEN)?;
        file.put_u32(MARKER_OFFSET, ARRAY_MAGIC)?;
        file.put_u32(COUNT_OFFSET, 0)?;
        file.put_u32(RECORD_SIZE_OFFSET, T::RECORD_SIZE)?;
        Ok(Self {
            file,
            file_id,
            _pd: PhantomData,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, file_id: u32) -> Result<Self> {
        let file = MappedFile::open(path)?;
        let marker = file.get_u32(MARKER_OFFSET)?;
        if marker != ARRAY_MAGIC {
            return Err(QueueError::Format(format!(
                "bad array-list marker: {marker:#010x}"
            )));
        }
        let stored_size = file.get_u32(RECORD_SIZE_OFFSET)?;
        if stored_size != T::RECORD_SIZE {
            return Err(QueueError::Format(format!(
                "array-list record size mismatch: file has {stored_size}, expected {}",
                T::RECORD_SIZE
            )));
        }
        Ok(Self {
            file,
            file_id,
            _pd: PhantomData,
        })
    }

    pub fn size(&self) -> Result<u32> {
        Ok(self.file.get_u32(COUNT_OFFSET)?)
    }

    fn offset_of(index: u32) -> u64 {
        HEADER_LEN + index as u64 * T::RECORD_SIZE as u64
    }

    fn check_bounds(&self, index: u32) -> Result<()> {
        let size = self.size()?;
        if index >= size {
            return Err(QueueError::State(format!(
                "array-list index {index} out of bounds (size {size})"
            )));
        }
        Ok(())
    }

    pub fn get(&self, index: u32) -> Result<T> {
        self.check_bounds(index)?;
        Ok(self.file.get(Self::offset_of(index))?)
    }

    pub fn set(&mut self, journal: &mut RollbackJournal, index: u32, value: &T) -> Result<()> {
        self.check_bounds(index)?;
        let offset = Self::offset_of(index);
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        pf.put(offset, value)?;
        Ok(())
    }

    /// Appends `value`, growing the backing file if needed. Returns the
    /// index the new record was stored at.
    pub fn add(&mut self, journal: &mut RollbackJournal, value: &T) -> Result<u32> {
        let count = self.size()?;
        let offset = Self::offset_of(count);
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        pf.ensure_capacity(offset + T::RECORD_SIZE as u64)?;
        pf.put(offset, value)?;
        pf.put_u32(COUNT_OFFSET, count + 1)?;
        Ok(count)
    }

    /// Removes and returns the last record, shrinking the logical count.
    /// Never shrinks the underlying file.
    pub fn remove_last(&mut self, journal: &mut RollbackJournal) -> Result<T> {
        let count = self.size()?;
        if count == 0 {
            return Err(QueueError::State("remove_last on empty array-list".into()));
        }
        let last = self.get(count - 1)?;
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        pf.put_u32(COUNT_OFFSET, count - 1)?;
        Ok(last)
    }

    pub fn clear(&mut self, journal: &mut RollbackJournal) -> Result<()> {
        let mut pf = ProtectedFile::new(journal, self.file_id, &mut self.file);
        pf.put_u32(COUNT_OFFSET, 0)?;
        Ok(())
    }

    /// Exposes the backing file so the owning component (e.g. `Queue`)
    /// can register it as a rollback target under this list's `file_id`.
    pub fn backing_file_mut(&mut self) -> (&mut MappedFile, u32) {
        (&mut self.file, self.file_id)
    }
}
