//! `queue-core`: the file-backed array and heap primitives shared by the
//! queue engine, plus the error taxonomy every `queue-*` crate uses.

pub mod array_list;
pub mod error;
pub mod heap;

pub use array_list::MappedArrayList;
pub use error::{QueueError, Result};
pub use heap::MappedHeap;
