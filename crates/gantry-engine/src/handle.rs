//! Transfer handles and their completion accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Completion counters for one posted transfer.
///
/// Total and completed live in one word (`total << 32 | completed`) so
/// a poll observes both halves coherently even while the post path
/// narrows the initial over-allocation down to the emitted count.
#[derive(Debug, Default)]
pub struct TransferProgress {
    counts: AtomicU64,
    failed: AtomicBool,
}

impl TransferProgress {
    /// Reset to `total` expected requests, none completed.
    pub fn init(&self, total: u32) {
        self.counts.store((total as u64) << 32, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
    }

    /// Narrow the total to the actually emitted request count.
    pub fn adjust_total(&self, actual: u32) {
        self.counts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                Some(((actual as u64) << 32) | (word & 0xFFFF_FFFF))
            })
            .expect("fetch_update closure never fails");
    }

    /// Record one request completion; `ok = false` marks the whole
    /// transfer failed.
    pub fn mark(&self, ok: bool) {
        if ok {
            self.counts.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.store(true, Ordering::SeqCst);
        }
    }

    /// Completed request count.
    pub fn completed(&self) -> u32 {
        (self.counts.load(Ordering::SeqCst) & 0xFFFF_FFFF) as u32
    }

    /// Expected request count.
    pub fn total(&self) -> u32 {
        (self.counts.load(Ordering::SeqCst) >> 32) as u32
    }

    /// Whether every expected request has completed.
    pub fn is_completed(&self) -> bool {
        let word = self.counts.load(Ordering::SeqCst);
        (word >> 32) == (word & 0xFFFF_FFFF)
    }

    /// Whether any request completed in error.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

/// Handle for one user-level transfer, owned by the caller between
/// prep and release.
///
/// Dropping the handle while chunks are in flight is safe: each posted
/// request holds its own reference to the progress counters, so the
/// completion callbacks stay valid until they fire.
#[derive(Debug)]
pub struct FabricXferHandle {
    pub(crate) peer: String,
    pub(crate) progress: Arc<TransferProgress>,
}

impl FabricXferHandle {
    pub(crate) fn new(peer: String) -> Self {
        FabricXferHandle { peer, progress: Arc::new(TransferProgress::default()) }
    }

    /// The peer this transfer targets.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Requests this transfer emitted (exact after the post narrowed
    /// the initial upper bound).
    pub fn total_requests(&self) -> u32 {
        self.progress.total()
    }

    /// Requests that have completed so far.
    pub fn completed_requests(&self) -> u32 {
        self.progress.completed()
    }
}
