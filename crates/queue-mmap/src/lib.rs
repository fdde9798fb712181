//! `queue-mmap`: growable, memory-mapped file primitive shared by every other
//! `queue-*` crate.
//!
//! A [`MappedFile`] owns a `memmap2` region over a single on-disk file and
//! exposes typed random access (`get_u32`/`put_u32`/`get_u64`/`put_u64`/
//! `read_bytes`/`write_bytes`) plus `get`/`put` for any type implementing
//! [`StorageAdapter`]. Growth is one-directional: `ensure_capacity` remaps to
//! a larger region on demand, but the region is never shrunk.

use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::io::{self, Error, ErrorKind};
use std::path::Path;

/// Maximum size of a single mapped file: offsets into the region are
/// carried as `u32`/signed-friendly arithmetic, so we cap at `i32::MAX`.
pub const MAX_CAPACITY: u64 = i32::MAX as u64;

/// Capacity is grown in units of this size (rounded up) whenever
/// [`MappedFile::ensure_capacity`] needs more room.
pub const GROWTH_UNIT: u64 = 64 * 1024;

/// Fixed-size (de)serialization contract for a record type stored directly
/// inside a [`MappedFile`] (header slots, heap entries, free-slot stack
/// entries, segment index slots, ...).
///
/// Implementors must serialize to exactly `RECORD_SIZE` bytes; `MappedFile`
/// and `queue-core`'s `MappedArrayList` rely on that size being constant for
/// the lifetime of a file.
pub trait StorageAdapter: Sized {
    /// Serialized size of one record, in bytes.
    const RECORD_SIZE: u32;

    /// Deserialize a record from exactly `RECORD_SIZE` bytes.
    fn read(buf: &[u8]) -> Self;

    /// Serialize this record into exactly `RECORD_SIZE` bytes.
    fn write(&self, buf: &mut [u8]);
}

/// A growable memory-mapped file.
///
/// `length()` reports the on-disk size (authoritative, re-read from the
/// filesystem); `capacity()` reports the size of the region currently
/// mapped into memory. They are kept equal by construction: every growth
/// extends the file and remaps it in the same step.
pub struct MappedFile {
    file: File,
    mmap: MmapMut,
    capacity: u64,
}

impl MappedFile {
    /// Creates a new file (truncating any existing one) and maps the first
    /// `initial_capacity` bytes read-write.
    pub fn create<P: AsRef<Path>>(path: P, initial_capacity: u64) -> io::Result<Self> {
        if initial_capacity > MAX_CAPACITY {
            return Err(capacity_error(initial_capacity));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(initial_capacity)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            mmap,
            capacity: initial_capacity,
        })
    }

    /// Opens an existing file and maps its full current length read-write.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len > MAX_CAPACITY {
            return Err(capacity_error(len));
        }
        // memmap2 refuses to map a zero-length file.
        if len == 0 {
            file.set_len(GROWTH_UNIT)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            file,
            mmap,
            capacity: file_len(&file)?,
        })
    }

    /// On-disk size of the backing file, re-read from the filesystem.
    pub fn length(&self) -> io::Result<u64> {
        file_len(&self.file)
    }

    /// Size, in bytes, of the currently mapped region.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Grows the file and the mapping to at least `needed` bytes if
    /// `needed > capacity()`. Never shrinks. Growth is rounded up to the
    /// next multiple of [`GROWTH_UNIT`].
    pub fn ensure_capacity(&mut self, needed: u64) -> io::Result<()> {
        if needed <= self.capacity {
            return Ok(());
        }
        if needed > MAX_CAPACITY {
            return Err(capacity_error(needed));
        }
        let rounded = needed.div_ceil(GROWTH_UNIT) * GROWTH_UNIT;
        let new_cap = rounded.min(MAX_CAPACITY).max(needed);
        self.file.set_len(new_cap)?;
        // Dropping the old mapping before remapping avoids holding two
        // live mappings of the same file at once.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = new_cap;
        Ok(())
    }

    fn check_range(&self, offset: u64, len: u64) -> io::Result<()> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "offset overflow"))?;
        if end > self.capacity {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("range [{offset}, {end}) outside mapped capacity {}", self.capacity),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn get_u32(&self, offset: u64) -> io::Result<u32> {
        self.check_range(offset, 4)?;
        let o = offset as usize;
        Ok(u32::from_le_bytes(self.mmap[o..o + 4].try_into().unwrap()))
    }

    #[inline]
    pub fn put_u32(&mut self, offset: u64, value: u32) -> io::Result<()> {
        self.check_range(offset, 4)?;
        let o = offset as usize;
        self.mmap[o..o + 4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    #[inline]
    pub fn get_u64(&self, offset: u64) -> io::Result<u64> {
        self.check_range(offset, 8)?;
        let o = offset as usize;
        Ok(u64::from_le_bytes(self.mmap[o..o + 8].try_into().unwrap()))
    }

    #[inline]
    pub fn put_u64(&mut self, offset: u64, value: u64) -> io::Result<()> {
        self.check_range(offset, 8)?;
        let o = offset as usize;
        self.mmap[o..o + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn read_bytes(&self, offset: u64, len: u32) -> io::Result<Vec<u8>> {
        self.check_range(offset, len as u64)?;
        let o = offset as usize;
        Ok(self.mmap[o..o + len as usize].to_vec())
    }

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.check_range(offset, bytes.len() as u64)?;
        let o = offset as usize;
        self.mmap[o..o + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Deserializes a `T` at `offset` using its [`StorageAdapter`] impl.
    pub fn get<T: StorageAdapter>(&self, offset: u64) -> io::Result<T> {
        self.check_range(offset, T::RECORD_SIZE as u64)?;
        let o = offset as usize;
        Ok(T::read(&self.mmap[o..o + T::RECORD_SIZE as usize]))
    }

    /// Serializes `value` at `offset` using its [`StorageAdapter`] impl.
    pub fn put<T: StorageAdapter>(&mut self, offset: u64, value: &T) -> io::Result<()> {
        self.check_range(offset, T::RECORD_SIZE as u64)?;
        let o = offset as usize;
        value.write(&mut self.mmap[o..o + T::RECORD_SIZE as usize]);
        Ok(())
    }

    /// Raw pointer to the start of the mapped region. Used by `queue-sync`
    /// to install an atomic lock cell directly into the mapping.
    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Flushes the mapping to disk. Never called on the commit path (no
    /// durability guarantee against OS crash is provided); exposed only
    /// for tests that want to assert bytes survive a reopen.
    pub fn flush(&self) -> io::Result<()> {
        self.mmap.flush()
    }
}

fn file_len(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

fn capacity_error(requested: u64) -> Error {
    Error::new(
        ErrorKind::InvalidInput,
        format!("requested capacity {requested} exceeds MAX_CAPACITY {MAX_CAPACITY}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("queue_mmap_test_{name}_{ts}"))
    }

    #[test]
    fn roundtrip_u32_u64() {
        let path = tmp_path("roundtrip");
        let mut mf = MappedFile::create(&path, GROWTH_UNIT).unwrap();
        mf.put_u32(0, 0xDEAD_BEEF).unwrap();
        mf.put_u64(8, 0x0102_0304_0506_0708).unwrap();
        assert_eq!(mf.get_u32(0).unwrap(), 0xDEAD_BEEF);
        assert_eq!(mf.get_u64(8).unwrap(), 0x0102_0304_0506_0708);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn grows_without_shrinking() {
        let path = tmp_path("grow");
        let mut mf = MappedFile::create(&path, 16).unwrap();
        assert_eq!(mf.capacity(), 16);
        mf.ensure_capacity(GROWTH_UNIT + 1).unwrap();
        assert!(mf.capacity() >= GROWTH_UNIT + 1);
        let grown = mf.capacity();
        mf.ensure_capacity(16).unwrap();
        assert_eq!(mf.capacity(), grown, "ensure_capacity must never shrink");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_range_access_errors() {
        let path = tmp_path("oob");
        let mf = MappedFile::create(&path, 16).unwrap();
        assert!(mf.get_u64(12).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn reopen_preserves_bytes() {
        let path = tmp_path("reopen");
        {
            let mut mf = MappedFile::create(&path, GROWTH_UNIT).unwrap();
            mf.write_bytes(0, b"hello").unwrap();
            mf.flush().unwrap();
        }
        {
            let mf = MappedFile::open(&path).unwrap();
            assert_eq!(mf.read_bytes(0, 5).unwrap(), b"hello");
        }
        let _ = std::fs::remove_file(&path);
    }
}
