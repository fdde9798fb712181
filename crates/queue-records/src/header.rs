//! Header slot record: one per message, 57 bytes on disk including the
//! null-sentinel flag.

use crate::handle::Handle;
use queue_mmap::StorageAdapter;

/// A header slot. `occupied == false` is the null sentinel: an empty slot
/// sitting on the free-slot stack. All other fields are meaningless when
/// `occupied` is false.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct HeaderRecord {
    pub occupied: bool,
    pub message_id: u64,
    pub sent_time: u64,
    pub delay: u64,
    pub received_time: Option<u64>,
    pub heap_index: u32,
    pub body_handle: Handle,
}

impl HeaderRecord {
    /// `receivedTime + visibilityTimeout` if received, else `sentTime + delay`.
    pub fn visible_since(&self, visibility_timeout: u64) -> u64 {
        match self.received_time {
            Some(received) => received + visibility_timeout,
            None => self.sent_time + self.delay,
        }
    }

    pub fn null() -> Self {
        Self::default()
    }
}

impl StorageAdapter for HeaderRecord {
    // occupied(1) + message_id(8) + sent_time(8) + delay(8)
    // + received_present(1) + received_time(8) + heap_index(4)
    // + body_handle(16) + padding(3) = 57
    const RECORD_SIZE: u32 = 57;

    fn read(buf: &[u8]) -> Self {
        let occupied = buf[0] != 0;
        let message_id = u64::from_le_bytes(buf[1..9].try_into().unwrap());
        let sent_time = u64::from_le_bytes(buf[9..17].try_into().unwrap());
        let delay = u64::from_le_bytes(buf[17..25].try_into().unwrap());
        let received_present = buf[25] != 0;
        let received_raw = u64::from_le_bytes(buf[26..34].try_into().unwrap());
        let heap_index = u32::from_le_bytes(buf[34..38].try_into().unwrap());
        let body_handle = Handle::decode(&buf[38..54]);

        Self {
            occupied,
            message_id,
            sent_time,
            delay,
            received_time: received_present.then_some(received_raw),
            heap_index,
            body_handle,
        }
    }

    fn write(&self, buf: &mut [u8]) {
        buf.fill(0);
        buf[0] = self.occupied as u8;
        buf[1..9].copy_from_slice(&self.message_id.to_le_bytes());
        buf[9..17].copy_from_slice(&self.sent_time.to_le_bytes());
        buf[17..25].copy_from_slice(&self.delay.to_le_bytes());
        match self.received_time {
            Some(t) => {
                buf[25] = 1;
                buf[26..34].copy_from_slice(&t.to_le_bytes());
            }
            None => {
                buf[25] = 0;
            }
        }
        buf[34..38].copy_from_slice(&self.heap_index.to_le_bytes());
        self.body_handle.encode(&mut buf[38..54]);
        // buf[54..57] left zeroed (reserved).
    }
}
