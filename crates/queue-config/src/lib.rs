//! `queue-config`: the queue's persistent parameters file.
//!
//! `config.dat` carries a magic marker, format version, the lock cell
//! every other file's mutation is serialized under, the two fixed
//! parameters (`visibilityTimeout`, `retentionPeriod`), and a monotonic
//! `nextMessageId` counter. Parameters are immutable once written:
//! reopening an existing queue with different parameters is a hard
//! error, mirroring the teacher's `obsidian-config`/`onyx-config`
//! "parse once, trust thereafter" posture but enforced at the binary
//! layer instead of `serde`/`toml`.

use queue_core::error::{QueueError, Result};
use queue_mmap::MappedFile;
use queue_sync::ByteBufferLock;
use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const CONFIG_MAGIC: u32 = 0x4D51_4346;
pub const CONFIG_FORMAT_VERSION: u32 = 1;

const MAGIC_OFFSET: u64 = 0;
const VERSION_OFFSET: u64 = 4;
const LOCK_OFFSET: u64 = 8;
const VISIBILITY_TIMEOUT_OFFSET: u64 = 16;
const RETENTION_PERIOD_OFFSET: u64 = 24;
const NEXT_MESSAGE_ID_OFFSET: u64 = 32;

/// Total on-disk record size. The lock cell is a full `u64` (required by
/// [`ByteBufferLock`]'s 8-byte-aligned-cell contract), so the record is
/// 40 bytes rather than the 36 a byte-for-byte sum of the other five
/// narrower fields alone would suggest.
pub const CONFIG_RECORD_SIZE: u64 = 40;

/// Bounds enforced on construction, matching the wire invariants every
/// `queue` operation relies on (a delay or wait longer than these would
/// silently never fire).
pub const MIN_VISIBILITY_TIMEOUT_MS: u64 = 0;
pub const MAX_VISIBILITY_TIMEOUT_MS: u64 = 12 * 60 * 60 * 1000;
pub const MIN_RETENTION_PERIOD_MS: u64 = 15 * 1000;
pub const MAX_RETENTION_PERIOD_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Typed, validated construction parameters for a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueParams {
    pub visibility_timeout_ms: u64,
    pub retention_period_ms: u64,
}

impl QueueParams {
    pub fn new(visibility_timeout_ms: u64, retention_period_ms: u64) -> Result<Self> {
        if !(MIN_VISIBILITY_TIMEOUT_MS..=MAX_VISIBILITY_TIMEOUT_MS).contains(&visibility_timeout_ms) {
            return Err(QueueError::Parameter(format!(
                "visibilityTimeout {visibility_timeout_ms}ms outside [{MIN_VISIBILITY_TIMEOUT_MS}, {MAX_VISIBILITY_TIMEOUT_MS}]"
            )));
        }
        if !(MIN_RETENTION_PERIOD_MS..=MAX_RETENTION_PERIOD_MS).contains(&retention_period_ms) {
            return Err(QueueError::Parameter(format!(
                "retentionPeriod {retention_period_ms}ms outside [{MIN_RETENTION_PERIOD_MS}, {MAX_RETENTION_PERIOD_MS}]"
            )));
        }
        Ok(Self {
            visibility_timeout_ms,
            retention_period_ms,
        })
    }
}

/// The queue's parameters file: `config.dat`.
pub struct ConfigFile {
    file: MappedFile,
    params: QueueParams,
}

impl ConfigFile {
    /// Creates `config.dat` if absent. If it already exists, falls
    /// through to [`Self::open`] and verifies the stored parameters
    /// match `params`; a mismatch is
    /// [`QueueError::ExistsWithDifferentParameters`].
    pub fn create<P: AsRef<Path>>(path: P, params: QueueParams) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            let existing = Self::open(path)?;
            if existing.params != params {
                return Err(QueueError::ExistsWithDifferentParameters(format!(
                    "stored {:?} != requested {:?}",
                    existing.params, params
                )));
            }
            return Ok(existing);
        }

        let mut file = MappedFile::create(path, CONFIG_RECORD_SIZE)?;
        file.put_u32(MAGIC_OFFSET, CONFIG_MAGIC)?;
        file.put_u32(VERSION_OFFSET, CONFIG_FORMAT_VERSION)?;
        file.put_u64(LOCK_OFFSET, 0)?; // ByteBufferLock::UNLOCKED
        file.put_u64(VISIBILITY_TIMEOUT_OFFSET, params.visibility_timeout_ms)?;
        file.put_u64(RETENTION_PERIOD_OFFSET, params.retention_period_ms)?;
        file.put_u64(NEXT_MESSAGE_ID_OFFSET, 0)?;
        file.flush()?;
        Ok(Self { file, params })
    }

    /// Opens an existing `config.dat`, validating the marker and format
    /// version through a plain file handle first so a file that isn't
    /// actually a config file is rejected before anything gets mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut probe = File::open(path.as_ref())?;
        let mut header = [0u8; 8];
        probe.read_exact(&mut header).map_err(|_| {
            QueueError::Format("config.dat too short to contain a marker/version header".into())
        })?;
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let version = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if magic != CONFIG_MAGIC {
            return Err(QueueError::Format(format!("bad config marker: {magic:#010x}")));
        }
        if version != CONFIG_FORMAT_VERSION {
            return Err(QueueError::Format(format!(
                "unsupported config format version {version}"
            )));
        }
        drop(probe);

        let file = MappedFile::open(path)?;
        let visibility_timeout_ms = file.get_u64(VISIBILITY_TIMEOUT_OFFSET)?;
        let retention_period_ms = file.get_u64(RETENTION_PERIOD_OFFSET)?;
        let params = QueueParams {
            visibility_timeout_ms,
            retention_period_ms,
        };
        Ok(Self { file, params })
    }

    pub fn params(&self) -> QueueParams {
        self.params
    }

    /// Raw pointer to the lock cell, for installing a [`ByteBufferLock`]
    /// over it.
    ///
    /// # Safety
    /// The returned pointer is only valid while `self` is alive and must
    /// not be used after the backing mapping is remapped (it never is:
    /// `config.dat` has a fixed 40-byte size).
    pub unsafe fn lock_cell_ptr(&mut self) -> *mut u8 {
        unsafe { self.file.as_mut_ptr().add(LOCK_OFFSET as usize) }
    }

    /// Builds the `ByteBufferLock` guarding this config file (and, by
    /// convention, every other file in the queue directory).
    pub fn lock(&mut self) -> ByteBufferLock {
        unsafe { ByteBufferLock::at(self.lock_cell_ptr()) }
    }

    /// Reads, increments, and returns the next message id. Caller must
    /// already hold the config lock.
    pub fn next_message_id(&mut self) -> Result<u64> {
        let id = self.file.get_u64(NEXT_MESSAGE_ID_OFFSET)?;
        self.file.put_u64(NEXT_MESSAGE_ID_OFFSET, id + 1)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("queue_config_test_{name}_{ts}"))
    }

    #[test]
    fn create_then_open_roundtrips_params() {
        let path = tmp_path("roundtrip");
        let params = QueueParams::new(30_000, 60_000).unwrap();
        {
            let _cf = ConfigFile::create(&path, params).unwrap();
        }
        let cf = ConfigFile::open(&path).unwrap();
        assert_eq!(cf.params(), params);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn create_twice_with_same_params_succeeds() {
        let path = tmp_path("idempotent");
        let params = QueueParams::new(1_000, 20_000).unwrap();
        let _cf1 = ConfigFile::create(&path, params).unwrap();
        let cf2 = ConfigFile::create(&path, params).unwrap();
        assert_eq!(cf2.params(), params);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn create_twice_with_different_params_errors() {
        let path = tmp_path("mismatch");
        let params_a = QueueParams::new(1_000, 20_000).unwrap();
        let params_b = QueueParams::new(2_000, 20_000).unwrap();
        let _cf1 = ConfigFile::create(&path, params_a).unwrap();
        let err = ConfigFile::create(&path, params_b).unwrap_err();
        assert!(matches!(err, QueueError::ExistsWithDifferentParameters(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn next_message_id_increments_monotonically() {
        let path = tmp_path("next_id");
        let params = QueueParams::new(1_000, 20_000).unwrap();
        let mut cf = ConfigFile::create(&path, params).unwrap();
        assert_eq!(cf.next_message_id().unwrap(), 0);
        assert_eq!(cf.next_message_id().unwrap(), 1);
        assert_eq!(cf.next_message_id().unwrap(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn out_of_bounds_visibility_timeout_is_rejected() {
        let err = QueueParams::new(MAX_VISIBILITY_TIMEOUT_MS + 1, MIN_RETENTION_PERIOD_MS).unwrap_err();
        assert!(matches!(err, QueueError::Parameter(_)));
    }

    #[test]
    fn bad_marker_is_rejected_on_open() {
        let path = tmp_path("bad_marker");
        std::fs::write(&path, [0u8; 40]).unwrap();
        let err = ConfigFile::open(&path).unwrap_err();
        assert!(matches!(err, QueueError::Format(_)));
        let _ = std::fs::remove_file(&path);
    }
}
