//! Free-space handling: page numbers freed by committed transactions that
//! are safe to hand out again.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::trace;

use vellum_types::{PageNumber, TxnId};

use crate::low_level::LowLevelTransaction;

/// The free-space contract the transaction core consumes.
///
/// Implementations may store their bookkeeping in pages and recurse into
/// the transaction that is calling them, which is why both methods take the
/// transaction. They must be reentrancy-safe.
pub trait FreeSpaceHandling: Send + Sync {
    /// Try to reserve `num_pages` contiguous pages from free space.
    fn try_allocate(&self, tx: &mut LowLevelTransaction, num_pages: u32) -> Option<PageNumber>;

    /// Record that `p` is free once `tx` commits.
    fn free_page(&self, tx: &mut LowLevelTransaction, p: PageNumber);
}

#[derive(Default)]
struct FreeSpaceInner {
    /// Committed free runs: start page → run length, non-adjacent.
    available: BTreeMap<u64, u64>,
    /// Frees staged by open transactions, merged on commit, dropped on
    /// rollback.
    pending: HashMap<TxnId, Vec<PageNumber>>,
}

impl FreeSpaceInner {
    fn insert_run(&mut self, start: u64, len: u64) {
        let mut start = start;
        let mut len = len;
        // Coalesce with the predecessor run.
        if let Some((&prev_start, &prev_len)) = self.available.range(..start).next_back() {
            if prev_start + prev_len == start {
                self.available.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        // Coalesce with the successor run.
        if let Some(&next_len) = self.available.get(&(start + len)) {
            self.available.remove(&(start + len));
            len += next_len;
        }
        self.available.insert(start, len);
    }
}

/// In-memory run-coalescing free list.
///
/// Frees are staged per transaction and become allocatable only after that
/// transaction commits; copy-on-write plus the journal's translation tables
/// make immediate reuse safe for concurrent readers.
#[derive(Default)]
pub struct FreeSpaceList {
    inner: Mutex<FreeSpaceInner>,
}

impl FreeSpaceList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Promote a committed transaction's staged frees into the free list.
    pub(crate) fn commit_frees(&self, txn_id: TxnId) {
        let mut inner = self.inner.lock();
        if let Some(pages) = inner.pending.remove(&txn_id) {
            trace!(%txn_id, count = pages.len(), "frees committed to free list");
            for p in pages {
                inner.insert_run(p.get(), 1);
            }
        }
    }

    /// Drop a rolled-back transaction's staged frees.
    pub(crate) fn discard_frees(&self, txn_id: TxnId) {
        self.inner.lock().pending.remove(&txn_id);
    }

    /// Total pages currently allocatable.
    #[must_use]
    pub fn available_pages(&self) -> u64 {
        self.inner.lock().available.values().sum()
    }
}

impl FreeSpaceHandling for FreeSpaceList {
    fn try_allocate(&self, _tx: &mut LowLevelTransaction, num_pages: u32) -> Option<PageNumber> {
        let mut inner = self.inner.lock();
        let n = u64::from(num_pages);
        let (&start, &len) = inner
            .available
            .iter()
            .find(|(_, &len)| len >= n)?;
        inner.available.remove(&start);
        if len > n {
            inner.available.insert(start + n, len - n);
        }
        trace!(start, num_pages, "pages reused from free space");
        Some(PageNumber::new(start))
    }

    fn free_page(&self, tx: &mut LowLevelTransaction, p: PageNumber) {
        self.inner.lock().pending.entry(tx.id()).or_default().push(p);
    }
}
