//! Per-sender sequence numbers.
//!
//! Every outbound message carries a sequence number from the sender's
//! counter.  Replies echo the number of the request they answer, which is how
//! a sender matches a `Reply` with the `ViewCommand` or `SharedCloudAnchors`
//! it sent.  Zero is never handed out so that it can mean "no request".

use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing sequence counter starting at 1.
///
/// # Examples
///
/// ```rust
/// use arpet_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(1),
        }
    }

    /// Returns the next sequence number, skipping 0 on wrap-around.
    pub fn next(&self) -> u64 {
        loop {
            // `Relaxed` is enough: the number only orders messages, it does
            // not publish any other memory.
            let value = self.inner.fetch_add(1, Ordering::Relaxed);
            if value != 0 {
                return value;
            }
        }
    }

    /// The value the next call to [`next`](Self::next) will return (modulo wrap).
    pub fn peek(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
