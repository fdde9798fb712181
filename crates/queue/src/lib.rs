//! `queue`: a persistent, file-backed, memory-mapped message queue for
//! same-host, cross-process producers and consumers.
//!
//! A [`Queue`] owns one directory holding six files (`config.dat`,
//! `rollback.dat`, `headers.dat`, `free-headers.dat`,
//! `priority-queue.dat`, `content.dat`). Every public operation runs to
//! completion under the directory's single [`queue_sync::ByteBufferLock`],
//! rolling back any undo entries left by a crashed prior operation before
//! it mutates anything, and committing the journal before releasing the
//! lock.

mod message;

pub use message::Message;
pub use queue_config::QueueParams;
pub use queue_core::error::{QueueError, Result};

use queue_blobstore::ByteArrayStorage;
use queue_config::ConfigFile;
use queue_core::{MappedArrayList, MappedHeap};
use queue_journal::{RollbackJournal, TargetRegistry};
use queue_perf_recorder::{PerfRecorder, PerfStage};
use queue_records::{FreeSlotRecord, HeaderRecord, HeapEntryRecord};
use queue_sync::ByteBufferLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const HEADERS_FILE_ID: u32 = 10;
const FREE_HEADERS_FILE_ID: u32 = 20;
const PRIORITY_QUEUE_FILE_ID: u32 = 30;
const CONTENT_FILE_ID: u32 = 40;

const MAX_PUSH_DELAY_MS: u64 = 15 * 60 * 1000;
const MAX_PULL_TIMEOUT_MS: u64 = 20 * 1000;
const MAX_BODY_LEN: usize = 256 * 1024;
const WAIT_POLL_INTERVAL_MS: u64 = 50;
const CLEANUP_BATCH_LIMIT: usize = 100;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as u64
}

/// Creates `folder` (if absent) and opens or creates the queue inside
/// it. Thin wrapper a multi-queue directory router would call once per
/// queue before handing off to [`Queue::new`] — no routing table is
/// implemented here, only the single-folder helper.
pub fn open_queue_dir<P: AsRef<Path>>(folder: P, params: QueueParams) -> Result<Queue> {
    std::fs::create_dir_all(folder.as_ref())?;
    Queue::new(folder, params)
}

type Relocations = Arc<Mutex<Vec<(u32, u32)>>>;

/// A persistent, file-backed message queue.
pub struct Queue {
    folder: PathBuf,
    config: ConfigFile,
    lock: ByteBufferLock,
    journal: RollbackJournal,
    headers: MappedArrayList<HeaderRecord>,
    free_headers: MappedArrayList<FreeSlotRecord>,
    heap: MappedHeap<HeapEntryRecord>,
    content: ByteArrayStorage,
    relocations: Relocations,
    stop: AtomicBool,
    perf: Mutex<PerfRecorder>,
}

impl Queue {
    /// Opens an existing queue folder or creates a new one.
    ///
    /// Constructs/opens `config.dat` and the four data files, then —
    /// under the config lock — replays and discards any undo entries a
    /// crashed prior process left behind, so the queue always starts
    /// from a clean, fully-committed state.
    pub fn new<P: AsRef<Path>>(folder: P, params: QueueParams) -> Result<Self> {
        let folder = folder.as_ref().to_path_buf();
        std::fs::create_dir_all(&folder)?;
        // Canonicalize so `delete`'s `queue_folder == self.folder` check
        // can't be defeated by two different relative/symlinked paths to
        // the same directory.
        let folder = folder.canonicalize()?;

        let mut config = ConfigFile::create(folder.join("config.dat"), params)?;
        let lock = config.lock();

        let rollback_path = folder.join("rollback.dat");
        let mut journal = if rollback_path.exists() {
            RollbackJournal::open(&rollback_path)?
        } else {
            RollbackJournal::create(&rollback_path)?
        };

        let headers_path = folder.join("headers.dat");
        let mut headers: MappedArrayList<HeaderRecord> = if headers_path.exists() {
            MappedArrayList::open(&headers_path, HEADERS_FILE_ID)?
        } else {
            MappedArrayList::create(&headers_path, HEADERS_FILE_ID)?
        };

        let free_headers_path = folder.join("free-headers.dat");
        let mut free_headers: MappedArrayList<FreeSlotRecord> = if free_headers_path.exists() {
            MappedArrayList::open(&free_headers_path, FREE_HEADERS_FILE_ID)?
        } else {
            MappedArrayList::create(&free_headers_path, FREE_HEADERS_FILE_ID)?
        };

        let relocations: Relocations = Arc::new(Mutex::new(Vec::new()));
        let relocations_cb = Arc::clone(&relocations);
        let priority_queue_path = folder.join("priority-queue.dat");
        let mut heap: MappedHeap<HeapEntryRecord> = if priority_queue_path.exists() {
            MappedHeap::open(
                &priority_queue_path,
                PRIORITY_QUEUE_FILE_ID,
                compare_visible_since,
                move |entry: &HeapEntryRecord, idx: u32| {
                    relocations_cb.lock().unwrap().push((entry.slot, idx));
                },
            )?
        } else {
            MappedHeap::create(
                &priority_queue_path,
                PRIORITY_QUEUE_FILE_ID,
                compare_visible_since,
                move |entry: &HeapEntryRecord, idx: u32| {
                    relocations_cb.lock().unwrap().push((entry.slot, idx));
                },
            )?
        };

        let content_path = folder.join("content.dat");
        let mut content = if content_path.exists() {
            ByteArrayStorage::open(&content_path, CONTENT_FILE_ID)?
        } else {
            ByteArrayStorage::create(&content_path, CONTENT_FILE_ID)?
        };

        {
            let _guard = lock.acquire();
            Self::rollback_data_files(&mut journal, &mut headers, &mut free_headers, &mut heap, &mut content)?;
            journal.commit()?;
        }

        tracing::debug!(folder = %folder.display(), "queue opened");

        Ok(Self {
            folder,
            config,
            lock,
            journal,
            headers,
            free_headers,
            heap,
            content,
            relocations,
            stop: AtomicBool::new(false),
            perf: Mutex::new(PerfRecorder::new()),
        })
    }

    /// Requests that any in-flight [`Self::pull`] wait loop stop early
    /// with [`QueueError::Interrupted`] at its next poll.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    fn rollback_data_files(
        journal: &mut RollbackJournal,
        headers: &mut MappedArrayList<HeaderRecord>,
        free_headers: &mut MappedArrayList<FreeSlotRecord>,
        heap: &mut MappedHeap<HeapEntryRecord>,
        content: &mut ByteArrayStorage,
    ) -> Result<()> {
        let (hf, hid) = headers.backing_file_mut();
        let (ff, fid) = free_headers.backing_file_mut();
        let (pf, pid) = heap.backing_file_mut();
        let (cf, cid) = content.backing_file_mut();
        let mut registry = TargetRegistry::new();
        registry.register(hid, hf).register(fid, ff).register(pid, pf).register(cid, cf);
        journal.rollback(&mut registry)?;
        Ok(())
    }

    /// Drains any `(slot, new_heap_index)` pairs the heap's relocation
    /// callback buffered during the last heap mutation and writes them
    /// into the corresponding headers, through the same open journal
    /// transaction. A free function (not a `&mut self` method) so it can
    /// be called while a [`queue_sync::LockGuard`] is still borrowing
    /// `self.lock` — only the three fields actually needed are borrowed.
    fn apply_relocations(
        relocations: &Relocations,
        journal: &mut RollbackJournal,
        headers: &mut MappedArrayList<HeaderRecord>,
    ) -> Result<()> {
        let batch: Vec<(u32, u32)> = {
            let mut buf = relocations.lock().unwrap();
            std::mem::take(&mut *buf)
        };
        for (slot, new_index) in batch {
            let mut header = headers.get(slot)?;
            header.heap_index = new_index;
            headers.set(journal, slot, &header)?;
        }
        Ok(())
    }

    /// Validates and enqueues `bytes`, visible after `delay_ms`.
    pub fn push(&mut self, delay_ms: u64, bytes: &[u8]) -> Result<()> {
        let mut perf = self.perf.lock().unwrap();
        perf.begin(PerfStage::PushValidate);
        if delay_ms > MAX_PUSH_DELAY_MS {
            return Err(QueueError::Parameter(format!(
                "push delay {delay_ms}ms exceeds max {MAX_PUSH_DELAY_MS}ms"
            )));
        }
        if bytes.len() > MAX_BODY_LEN {
            return Err(QueueError::Parameter(format!(
                "message body {} bytes exceeds max {MAX_BODY_LEN} bytes",
                bytes.len()
            )));
        }
        perf.end(PerfStage::PushValidate);
        drop(perf);

        let now = now_millis();
        self.cleanup_queue()?;

        self.perf.lock().unwrap().begin(PerfStage::LockAcquire);
        let guard = self.lock.acquire();
        self.perf.lock().unwrap().end(PerfStage::LockAcquire);

        self.perf.lock().unwrap().begin(PerfStage::JournalRollback);
        Self::rollback_data_files(
            &mut self.journal,
            &mut self.headers,
            &mut self.free_headers,
            &mut self.heap,
            &mut self.content,
        )?;
        self.perf.lock().unwrap().end(PerfStage::JournalRollback);

        self.perf.lock().unwrap().begin(PerfStage::PushAllocate);
        let message_id = self.config.next_message_id()?;

        let free_count = self.free_headers.size()?;
        let slot = if free_count > 0 {
            self.free_headers.remove_last(&mut self.journal)?.0
        } else {
            self.headers.size()?
        };

        let mut header = HeaderRecord {
            occupied: true,
            message_id,
            sent_time: now,
            delay: delay_ms,
            received_time: None,
            heap_index: 0,
            body_handle: Default::default(),
        };
        let visible_since = header.visible_since(self.config.params().visibility_timeout_ms);

        let heap_index = self.heap.add(&mut self.journal, HeapEntryRecord { slot, visible_since })?;
        Self::apply_relocations(&self.relocations, &mut self.journal, &mut self.headers)?;
        header.heap_index = heap_index;

        header.body_handle = self.content.add_array(&mut self.journal, bytes)?;

        if slot == self.headers.size()? {
            self.headers.add(&mut self.journal, &header)?;
        } else {
            self.headers.set(&mut self.journal, slot, &header)?;
        }
        self.perf.lock().unwrap().end(PerfStage::PushAllocate);

        self.perf.lock().unwrap().begin(PerfStage::JournalCommit);
        self.journal.commit()?;
        self.perf.lock().unwrap().end(PerfStage::JournalCommit);
        guard.release();

        tracing::trace!(folder = %self.folder.display(), message_id, slot, "push");
        Ok(())
    }

    /// Waits up to `timeout_ms` for the next visible message.
    pub fn pull(&mut self, timeout_ms: u64) -> Result<Option<Message>> {
        if timeout_ms > MAX_PULL_TIMEOUT_MS {
            return Err(QueueError::Parameter(format!(
                "pull timeout {timeout_ms}ms exceeds max {MAX_PULL_TIMEOUT_MS}ms"
            )));
        }
        self.perf.lock().unwrap().begin(PerfStage::Pull);
        let start = now_millis();
        loop {
            if let Some(message) = self.poll_message()? {
                self.perf.lock().unwrap().end(PerfStage::Pull);
                return Ok(Some(message));
            }
            if self.stop.load(Ordering::Relaxed) {
                return Err(QueueError::Interrupted);
            }

            let elapsed = now_millis().saturating_sub(start);
            let remaining = timeout_ms.saturating_sub(elapsed);
            if remaining == 0 {
                self.perf.lock().unwrap().end(PerfStage::Pull);
                return Ok(None);
            }

            let time_until_next_visible = match self.heap.peek()? {
                Some(entry) => {
                    let now = now_millis();
                    entry.visible_since.saturating_sub(now) + 1
                }
                None => u64::MAX,
            };
            let wait = remaining.min(time_until_next_visible).min(WAIT_POLL_INTERVAL_MS);
            self.perf.lock().unwrap().begin(PerfStage::LockWait);
            std::thread::sleep(Duration::from_millis(wait.max(1)));
            self.perf.lock().unwrap().end(PerfStage::LockWait);
        }
    }

    fn poll_message(&mut self) -> Result<Option<Message>> {
        self.cleanup_queue()?;
        let now = now_millis();

        let guard = self.lock.acquire();
        Self::rollback_data_files(
            &mut self.journal,
            &mut self.headers,
            &mut self.free_headers,
            &mut self.heap,
            &mut self.content,
        )?;

        let head = self.heap.peek()?;
        let Some(entry) = head else {
            self.journal.commit()?;
            guard.release();
            return Ok(None);
        };
        if entry.visible_since > now {
            self.journal.commit()?;
            guard.release();
            return Ok(None);
        }

        let slot = entry.slot;
        let mut header = self.headers.get(slot)?;
        header.received_time = Some(now);

        self.heap.remove_at(&mut self.journal, header.heap_index)?;
        Self::apply_relocations(&self.relocations, &mut self.journal, &mut self.headers)?;

        let new_visible_since = header.visible_since(self.config.params().visibility_timeout_ms);
        let new_heap_index = self
            .heap
            .add(&mut self.journal, HeapEntryRecord { slot, visible_since: new_visible_since })?;
        Self::apply_relocations(&self.relocations, &mut self.journal, &mut self.headers)?;
        header.heap_index = new_heap_index;

        self.headers.set(&mut self.journal, slot, &header)?;

        let body = self
            .content
            .get_array(&mut self.journal, header.body_handle)?
            .ok_or_else(|| QueueError::State("header references a missing body".into()))?;

        self.journal.commit()?;
        guard.release();

        tracing::trace!(folder = %self.folder.display(), message_id = header.message_id, slot, "pull");

        Ok(Some(Message {
            queue_folder: self.folder.clone(),
            message_id: header.message_id,
            slot,
            sent_time_ms: header.sent_time,
            delay_ms: header.delay,
            received_time_ms: header.received_time,
            body,
        }))
    }

    /// Deletes `message`, silently succeeding if it was already deleted
    /// or reused by another message.
    pub fn delete(&mut self, message: &Message) -> Result<()> {
        self.perf.lock().unwrap().begin(PerfStage::Delete);
        if message.queue_folder != self.folder {
            return Err(QueueError::Parameter(format!(
                "message belongs to queue folder {:?}, not {:?}",
                message.queue_folder, self.folder
            )));
        }
        self.cleanup_queue()?;

        let guard = self.lock.acquire();
        Self::rollback_data_files(
            &mut self.journal,
            &mut self.headers,
            &mut self.free_headers,
            &mut self.heap,
            &mut self.content,
        )?;

        let size = self.headers.size()?;
        if message.slot >= size {
            self.journal.commit()?;
            guard.release();
            self.perf.lock().unwrap().end(PerfStage::Delete);
            return Ok(());
        }
        let header = self.headers.get(message.slot)?;
        if !header.occupied || header.message_id != message.message_id {
            self.journal.commit()?;
            guard.release();
            self.perf.lock().unwrap().end(PerfStage::Delete);
            return Ok(());
        }

        self.content.delete_array(&mut self.journal, header.body_handle)?;
        self.heap.remove_at(&mut self.journal, header.heap_index)?;
        Self::apply_relocations(&self.relocations, &mut self.journal, &mut self.headers)?;
        self.headers.set(&mut self.journal, message.slot, &HeaderRecord::null())?;
        self.free_headers.add(&mut self.journal, &FreeSlotRecord(message.slot))?;

        self.journal.commit()?;
        guard.release();
        self.perf.lock().unwrap().end(PerfStage::Delete);

        tracing::trace!(folder = %self.folder.display(), message_id = message.message_id, slot = message.slot, "delete");
        Ok(())
    }

    /// Removes expired messages (`now >= sentTime + retentionPeriod`) in
    /// batches of at most [`CLEANUP_BATCH_LIMIT`] per lock acquisition,
    /// repeating until a pass deletes fewer than the limit.
    pub fn cleanup_queue(&mut self) -> Result<()> {
        let retention = self.config.params().retention_period_ms;
        loop {
            self.perf.lock().unwrap().begin(PerfStage::CleanupBatch);
            let now = now_millis();
            let guard = self.lock.acquire();
            Self::rollback_data_files(
                &mut self.journal,
                &mut self.headers,
                &mut self.free_headers,
                &mut self.heap,
                &mut self.content,
            )?;

            let mut deleted = 0usize;
            let size = self.headers.size()?;
            for slot in 0..size {
                if deleted >= CLEANUP_BATCH_LIMIT {
                    break;
                }
                let header = self.headers.get(slot)?;
                if header.occupied && now >= header.sent_time + retention {
                    self.content.delete_array(&mut self.journal, header.body_handle)?;
                    self.heap.remove_at(&mut self.journal, header.heap_index)?;
                    Self::apply_relocations(&self.relocations, &mut self.journal, &mut self.headers)?;
                    self.headers.set(&mut self.journal, slot, &HeaderRecord::null())?;
                    self.free_headers.add(&mut self.journal, &FreeSlotRecord(slot))?;
                    deleted += 1;
                }
            }

            self.journal.commit()?;
            guard.release();
            self.perf.lock().unwrap().end(PerfStage::CleanupBatch);

            if deleted < CLEANUP_BATCH_LIMIT {
                return Ok(());
            }
        }
    }

    /// Runs [`Self::cleanup_queue`] then returns the number of visible
    /// or pending messages.
    pub fn size(&mut self) -> Result<u32> {
        self.cleanup_queue()?;
        let guard = self.lock.acquire();
        Self::rollback_data_files(
            &mut self.journal,
            &mut self.headers,
            &mut self.free_headers,
            &mut self.heap,
            &mut self.content,
        )?;
        let n = self.heap.size()?;
        self.journal.commit()?;
        guard.release();
        Ok(n)
    }
}

fn compare_visible_since(a: &HeapEntryRecord, b: &HeapEntryRecord) -> std::cmp::Ordering {
    a.visible_since.cmp(&b.visible_since)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn tmp_dir(name: &str) -> PathBuf {
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("queue_test_{name}_{ts}"))
    }

    fn params() -> QueueParams {
        QueueParams::new(30_000, 600_000).unwrap()
    }

    #[test]
    fn basic_push_pull_delete() {
        let dir = tmp_dir("basic");
        let mut q = Queue::new(&dir, params()).unwrap();

        q.push(0, b"Test Message 1").unwrap();
        q.push(0, b"Test Message 2").unwrap();

        let m1 = q.pull(20_000).unwrap().unwrap();
        assert_eq!(m1.body, b"Test Message 1");
        let m2 = q.pull(20_000).unwrap().unwrap();
        assert_eq!(m2.body, b"Test Message 2");

        q.delete(&m1).unwrap();
        q.delete(&m2).unwrap();
        assert_eq!(q.size().unwrap(), 0);

        let none = q.pull(0).unwrap();
        assert!(none.is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn delayed_message_becomes_visible_later() {
        let dir = tmp_dir("delay");
        let mut q = Queue::new(&dir, params()).unwrap();
        q.push(0, b"M1").unwrap();
        q.push(300, b"M2").unwrap();

        let m1 = q.pull(0).unwrap().unwrap();
        assert_eq!(m1.body, b"M1");
        assert!(q.pull(0).unwrap().is_none());

        let m2 = q.pull(500).unwrap().unwrap();
        assert_eq!(m2.body, b"M2");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn slot_reuse_keeps_message_id_monotonic() {
        let dir = tmp_dir("slot_reuse");
        let mut q = Queue::new(&dir, params()).unwrap();

        let mut pulled = Vec::new();
        for i in 0..3 {
            q.push(0, format!("m{i}").as_bytes()).unwrap();
        }
        for _ in 0..3 {
            let m = q.pull(0).unwrap().unwrap();
            pulled.push((m.message_id, m.slot));
            q.delete(&m).unwrap();
        }
        assert_eq!(pulled.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![0, 1, 2]);

        for i in 3..6 {
            q.push(0, format!("m{i}").as_bytes()).unwrap();
        }
        let mut reused_slots = Vec::new();
        for _ in 0..3 {
            let m = q.pull(0).unwrap().unwrap();
            reused_slots.push(m.slot);
            q.delete(&m).unwrap();
        }
        // free-headers is a LIFO stack: slots come back in {2,1,0} order.
        assert_eq!(reused_slots, vec![2, 1, 0]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopening_preserves_live_messages() {
        let dir = tmp_dir("reopen");
        {
            let mut q = Queue::new(&dir, params()).unwrap();
            q.push(0, b"still here").unwrap();
        }
        let mut q = Queue::new(&dir, params()).unwrap();
        let m = q.pull(0).unwrap().unwrap();
        assert_eq!(m.body, b"still here");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reopening_with_different_parameters_errors() {
        let dir = tmp_dir("mismatch");
        let _q = Queue::new(&dir, params()).unwrap();
        let other = QueueParams::new(1_000, 20_000).unwrap();
        let err = Queue::new(&dir, other).unwrap_err();
        assert!(matches!(err, QueueError::ExistsWithDifferentParameters(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_of_stale_message_is_a_silent_success() {
        let dir = tmp_dir("stale_delete");
        let mut q = Queue::new(&dir, params()).unwrap();
        q.push(0, b"once").unwrap();
        let m = q.pull(0).unwrap().unwrap();
        q.delete(&m).unwrap();
        // Deleting the same (now-stale) message again is a no-op, not an error.
        q.delete(&m).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_rejects_message_from_a_different_queue_folder() {
        let dir = tmp_dir("wrong_folder");
        let mut q = Queue::new(&dir, params()).unwrap();
        q.push(0, b"mine").unwrap();
        let mut m = q.pull(0).unwrap().unwrap();
        m.queue_folder = PathBuf::from("/not/this/queue");
        let err = q.delete(&m).unwrap_err();
        assert!(matches!(err, QueueError::Parameter(_)));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn push_rejects_oversized_body_and_delay() {
        let dir = tmp_dir("bounds");
        let mut q = Queue::new(&dir, params()).unwrap();
        let big = vec![0u8; MAX_BODY_LEN + 1];
        assert!(matches!(q.push(0, &big), Err(QueueError::Parameter(_))));
        assert!(matches!(q.push(MAX_PUSH_DELAY_MS + 1, b"x"), Err(QueueError::Parameter(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rollback_discards_an_uncommitted_partial_push() {
        let dir = tmp_dir("partial_commit");
        let mut q = Queue::new(&dir, params()).unwrap();
        q.push(0, b"kept").unwrap();
        assert_eq!(q.size().unwrap(), 1);

        // Drive the same steps `push` takes -- allocate a heap entry,
        // append a body, store a header -- but stop short of
        // `journal.commit()`. This is exactly the on-disk state a crash
        // between those writes and the commit would leave behind.
        let slot = q.headers.size().unwrap();
        let mut header = HeaderRecord {
            occupied: true,
            message_id: 999,
            sent_time: now_millis(),
            delay: 0,
            received_time: None,
            heap_index: 0,
            body_handle: Default::default(),
        };
        let visible_since = header.visible_since(q.config.params().visibility_timeout_ms);
        let heap_index = q
            .heap
            .add(&mut q.journal, HeapEntryRecord { slot, visible_since })
            .unwrap();
        header.heap_index = heap_index;
        header.body_handle = q.content.add_array(&mut q.journal, b"orphaned").unwrap();
        q.headers.add(&mut q.journal, &header).unwrap();
        // No `q.journal.commit()` -- this is the simulated crash point.

        // Recovery: the same rollback every `new`/`push`/`pull`/`delete`
        // call runs before touching anything.
        Queue::rollback_data_files(
            &mut q.journal,
            &mut q.headers,
            &mut q.free_headers,
            &mut q.heap,
            &mut q.content,
        )
        .unwrap();

        assert_eq!(q.size().unwrap(), 1, "uncommitted push must not survive rollback");
        let m = q.pull(0).unwrap().unwrap();
        assert_eq!(m.body, b"kept");
        q.delete(&m).unwrap();
        assert_eq!(q.size().unwrap(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
