//! `MappedHeap<T>`: a file-backed binary min-heap over a
//! [`MappedArrayList`], with relocation callbacks so an owner (the queue's
//! header slot table) can keep an external back-reference to each
//! element's current heap index in sync.

use crate::array_list::MappedArrayList;
use crate::error::Result;
use queue_journal::RollbackJournal;
use queue_mmap::StorageAdapter;
use std::cmp::Ordering;
use std::path::Path;

/// A min-heap keyed by `compare`, stored in a [`MappedArrayList<T>`].
///
/// `on_relocate` is invoked once per element whose stored index changed
/// during a sift or a tail-swap in `remove_at`/`poll`, with the element's
/// new value and index. It is never invoked for the element an `add`/
/// `poll`/`remove_at` call is primarily about — those calls return the
/// element's final index (or the element itself) directly.
pub struct MappedHeap<T: StorageAdapter + Copy> {
    list: MappedArrayList<T>,
    compare: Box<dyn Fn(&T, &T) -> Ordering + Send>,
    on_relocate: Box<dyn FnMut(&T, u32) + Send>,
}

impl<T: StorageAdapter + Copy> MappedHeap<T> {
    pub fn create<P: AsRef<Path>>(
        path: P,
        file_id: u32,
        compare: impl Fn(&T, &T) -> Ordering + Send + 'static,
        on_relocate: impl FnMut(&T, u32) + Send + 'static,
    ) -> Result<Self> {
        Ok(Self {
            list: MappedArrayList::create(path, file_id)?,
            compare: Box::new(compare),
            on_relocate: Box::new(on_relocate),
        })
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        file_id: u32,
        compare: impl Fn(&T, &T) -> Ordering + Send + 'static,
        on_relocate: impl FnMut(&T, u32) + Send + 'static,
    ) -> Result<Self> {
        Ok(Self {
            list: MappedArrayList::open(path, file_id)?,
            compare: Box::new(compare),
            on_relocate: Box::new(on_relocate),
        })
    }

    pub fn size(&self) -> Result<u32> {
        self.list.size()
    }

    pub fn peek(&self) -> Result<Option<T>> {
        if self.size()? == 0 {
            Ok(None)
        } else {
            Ok(Some(self.list.get(0)?))
        }
    }

    /// Adds `value` to the heap, returning the index it comes to rest at.
    pub fn add(&mut self, journal: &mut RollbackJournal, value: T) -> Result<u32> {
        let idx = self.list.add(journal, &value)?;
        self.sift_up(journal, idx)
    }

    /// Removes and returns the minimum element.
    pub fn poll(&mut self, journal: &mut RollbackJournal) -> Result<Option<T>> {
        if self.size()? == 0 {
            return Ok(None);
        }
        Ok(Some(self.remove_at(journal, 0)?))
    }

    /// Removes and returns the element at `index`. Replaces `index` with
    /// the last element, then attempts a sift-down followed by a sift-up
    /// (at most one actually moves it).
    pub fn remove_at(&mut self, journal: &mut RollbackJournal, index: u32) -> Result<T> {
        let size = self.size()?;
        let removed = self.list.get(index)?;
        let last_index = size - 1;
        if index == last_index {
            self.list.remove_last(journal)?;
            return Ok(removed);
        }
        let last_value = self.list.get(last_index)?;
        self.list.remove_last(journal)?;
        self.list.set(journal, index, &last_value)?;
        (self.on_relocate)(&last_value, index);

        let after_down = self.sift_down(journal, index)?;
        if after_down == index {
            self.sift_up(journal, index)?;
        }
        Ok(removed)
    }

    fn sift_up(&mut self, journal: &mut RollbackJournal, mut i: u32) -> Result<u32> {
        while i > 0 {
            let parent = (i - 1) / 2;
            let vi = self.list.get(i)?;
            let vp = self.list.get(parent)?;
            if (self.compare)(&vp, &vi) != Ordering::Greater {
                break;
            }
            self.list.set(journal, i, &vp)?;
            self.list.set(journal, parent, &vi)?;
            (self.on_relocate)(&vp, i);
            (self.on_relocate)(&vi, parent);
            i = parent;
        }
        Ok(i)
    }

    fn sift_down(&mut self, journal: &mut RollbackJournal, mut i: u32) -> Result<u32> {
        loop {
            let size = self.size()?;
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let vi = self.list.get(i)?;
            let mut smallest = i;
            let mut v_smallest = vi;

            if left < size {
                let vl = self.list.get(left)?;
                if (self.compare)(&vl, &v_smallest) == Ordering::Less {
                    smallest = left;
                    v_smallest = vl;
                }
            }
            if right < size {
                let vr = self.list.get(right)?;
                if (self.compare)(&vr, &v_smallest) == Ordering::Less {
                    smallest = right;
                    v_smallest = vr;
                }
            }
            if smallest == i {
                break;
            }
            self.list.set(journal, i, &v_smallest)?;
            self.list.set(journal, smallest, &vi)?;
            (self.on_relocate)(&v_smallest, i);
            (self.on_relocate)(&vi, smallest);
            i = smallest;
        }
        Ok(i)
    }

    /// Exposes the backing file for rollback-target registration.
    pub fn backing_file_mut(&mut self) -> (&mut queue_mmap::MappedFile, u32) {
        self.list.backing_file_mut()
    }
}
