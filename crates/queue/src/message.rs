//! The value type returned by [`crate::Queue::pull`].

use std::path::PathBuf;

/// A message pulled from a queue: the fixed header fields plus its body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Canonical path of the queue folder this message was read from.
    /// `delete` validates a message is returned to the queue it came
    /// from.
    pub queue_folder: PathBuf,
    pub message_id: u64,
    pub slot: u32,
    pub sent_time_ms: u64,
    pub delay_ms: u64,
    pub received_time_ms: Option<u64>,
    pub body: Vec<u8>,
}
