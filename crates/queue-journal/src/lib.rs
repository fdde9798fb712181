//! `queue-journal`: the write-ahead undo log that makes every public queue
//! operation atomic across several files in the face of a crash.
//!
//! [`RollbackJournal`] owns a single on-disk log of undo records. Any
//! mutation that needs to participate in crash atomicity goes through a
//! [`ProtectedFile`] wrapping the target [`queue_mmap::MappedFile`]: every
//! write first captures the bytes it is about to overwrite into the
//! journal, then performs the write. `rollback()` replays those captures
//! in reverse insertion order; `commit()` discards them.
//!
//! # Record layout
//!
//! Records grow tail-first and are self-describing from the *end*, so
//! rollback can walk them backward without a separate index:
//!
//! ```text
//! [ prior bytes (length) ][ file_id:u32 ][ offset:u32 ][ length:u32 ]
//! ```
//!
//! Reading the last 4 bytes of the log gives `length`; from there the
//! record's start, `file_id` and `offset` all fall out by subtraction.

use queue_mmap::MappedFile;
use std::collections::HashMap;
use std::io::{self, Error, ErrorKind};
use std::path::Path;

/// Magic marker identifying a journal file: ASCII-ish encoding chosen by
/// the original format, kept for wire compatibility with the spec.
pub const JOURNAL_MAGIC: u32 = 0x52424A4E;

const MARKER_OFFSET: u64 = 0;
const JOURNAL_SIZE_OFFSET: u64 = 4;
/// Fixed journal header: `marker:u32` + `journal_size:u32`.
pub const HEADER_LEN: u64 = 8;

const TRAILER_LEN: u64 = 12; // file_id:u32 + offset:u32 + length:u32

/// A target file that can have undo bytes replayed into it.
///
/// Implemented for [`queue_mmap::MappedFile`] so any file wrapped in a
/// [`ProtectedFile`] can also serve as a rollback target.
pub trait UndoTarget {
    fn ensure_capacity(&mut self, needed: u64) -> io::Result<()>;
    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()>;
}

impl UndoTarget for MappedFile {
    fn ensure_capacity(&mut self, needed: u64) -> io::Result<()> {
        MappedFile::ensure_capacity(self, needed)
    }

    fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        MappedFile::write_bytes(self, offset, bytes)
    }
}

/// Maps a `file_id` to the live target file it identifies, so
/// [`RollbackJournal::rollback`] can restore undo records into the right
/// file without owning those files itself.
pub struct TargetRegistry<'a> {
    targets: HashMap<u32, &'a mut dyn UndoTarget>,
}

impl<'a> TargetRegistry<'a> {
    pub fn new() -> Self {
        Self {
            targets: HashMap::new(),
        }
    }

    pub fn register(&mut self, file_id: u32, target: &'a mut dyn UndoTarget) -> &mut Self {
        self.targets.insert(file_id, target);
        self
    }
}

impl Default for TargetRegistry<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// The undo log shared by every mutable file in a queue directory.
pub struct RollbackJournal {
    file: MappedFile,
}

impl RollbackJournal {
    /// Creates a fresh, empty journal file.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut file = MappedFile::create(path, HEADER_LEN)?;
        file.put_u32(MARKER_OFFSET, JOURNAL_MAGIC)?;
        file.put_u32(JOURNAL_SIZE_OFFSET, 0)?;
        Ok(Self { file })
    }

    /// Opens an existing journal file, validating its marker.
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = MappedFile::open(path)?;
        let marker = file.get_u32(MARKER_OFFSET)?;
        if marker != JOURNAL_MAGIC {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("bad journal marker: {marker:#010x}"),
            ));
        }
        Ok(Self { file })
    }

    /// Bytes currently used by the undo log, excluding the fixed header.
    pub fn journal_size(&self) -> io::Result<u32> {
        self.file.get_u32(JOURNAL_SIZE_OFFSET)
    }

    fn set_journal_size(&mut self, size: u32) -> io::Result<()> {
        self.file.put_u32(JOURNAL_SIZE_OFFSET, size)
    }

    /// Appends one undo record capturing `prior` bytes that `file_id` had
    /// at `offset` before being overwritten.
    fn append_undo(&mut self, file_id: u32, offset: u64, prior: &[u8]) -> io::Result<()> {
        let size = self.journal_size()? as u64;
        let record_len = prior.len() as u64 + TRAILER_LEN;
        let start = HEADER_LEN + size;
        self.file.ensure_capacity(start + record_len)?;
        self.file.write_bytes(start, prior)?;
        self.file.put_u32(start + prior.len() as u64, file_id)?;
        self.file.put_u32(start + prior.len() as u64 + 4, offset as u32)?;
        self.file.put_u32(start + prior.len() as u64 + 8, prior.len() as u32)?;
        self.set_journal_size((size + record_len) as u32)
    }

    /// Replays every undo record in reverse insertion order into the
    /// file identified by its `file_id`, then empties the log.
    ///
    /// Must be called exactly once, under the config lock, before any new
    /// mutation — this is what makes a crash between a prior operation's
    /// writes and its commit invisible to the next operation.
    pub fn rollback(&mut self, targets: &mut TargetRegistry<'_>) -> io::Result<()> {
        let mut size = self.journal_size()? as u64;
        while size > 0 {
            let end = HEADER_LEN + size;
            let length = self.file.get_u32(end - 4)? as u64;
            let offset = self.file.get_u32(end - 8)? as u64;
            let file_id = self.file.get_u32(end - 12)?;
            let record_len = length + TRAILER_LEN;
            let start = end - record_len;
            let prior = self.file.read_bytes(start, length as u32)?;

            let target = targets.targets.get_mut(&file_id).ok_or_else(|| {
                Error::new(
                    ErrorKind::NotFound,
                    format!("rollback: no target registered for file_id {file_id}"),
                )
            })?;
            target.ensure_capacity(offset + length)?;
            target.write_bytes(offset, &prior)?;

            size -= record_len;
            self.set_journal_size(size as u32)?;
        }
        self.set_journal_size(0)
    }

    /// Empties the log without replaying it: the mutation since the last
    /// rollback is now durable-within-process (not durable across an OS
    /// crash — see the workspace's non-goals).
    pub fn commit(&mut self) -> io::Result<()> {
        self.set_journal_size(0)
    }
}

/// A [`MappedFile`] wrapped so every mutating call first journals the
/// bytes it is about to overwrite. Reads are never journaled.
pub struct ProtectedFile<'a> {
    journal: &'a mut RollbackJournal,
    file_id: u32,
    file: &'a mut MappedFile,
}

impl<'a> ProtectedFile<'a> {
    pub fn new(journal: &'a mut RollbackJournal, file_id: u32, file: &'a mut MappedFile) -> Self {
        Self {
            journal,
            file_id,
            file,
        }
    }

    fn protect(&mut self, offset: u64, len: u32) -> io::Result<()> {
        self.file.ensure_capacity(offset + len as u64)?;
        let prior = self.file.read_bytes(offset, len)?;
        self.journal.append_undo(self.file_id, offset, &prior)
    }

    pub fn get_u32(&self, offset: u64) -> io::Result<u32> {
        self.file.get_u32(offset)
    }

    pub fn put_u32(&mut self, offset: u64, value: u32) -> io::Result<()> {
        self.protect(offset, 4)?;
        self.file.put_u32(offset, value)
    }

    pub fn get_u64(&self, offset: u64) -> io::Result<u64> {
        self.file.get_u64(offset)
    }

    pub fn put_u64(&mut self, offset: u64, value: u64) -> io::Result<()> {
        self.protect(offset, 8)?;
        self.file.put_u64(offset, value)
    }

    pub fn read_bytes(&self, offset: u64, len: u32) -> io::Result<Vec<u8>> {
        self.file.read_bytes(offset, len)
    }

    pub fn write_bytes(&mut self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        self.protect(offset, bytes.len() as u32)?;
        self.file.write_bytes(offset, bytes)
    }

    pub fn get<T: queue_mmap::StorageAdapter>(&self, offset: u64) -> io::Result<T> {
        self.file.get(offset)
    }

    pub fn put<T: queue_mmap::StorageAdapter>(&mut self, offset: u64, value: &T) -> io::Result<()> {
        self.protect(offset, T::RECORD_SIZE)?;
        self.file.put(offset, value)
    }

    pub fn capacity(&self) -> u64 {
        self.file.capacity()
    }

    pub fn ensure_capacity(&mut self, needed: u64) -> io::Result<()> {
        // Growth itself is not undone on rollback (a larger file is
        // harmless); only journal the bytes inside the grown region when
        // they are actually written.
        self.file.ensure_capacity(needed)
    }
}
