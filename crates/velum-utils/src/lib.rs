//! Ring-buffer containers shared by the Velum caches.
//!
//! Both containers use the same indexing discipline: a `first` index plus
//! an explicit length counter. A head/tail pair where head == tail is
//! ambiguous between "empty" and "full"; a length counter never is.

mod bounded;
mod queue;

pub use bounded::RingBuf;
pub use queue::RingQueue;
