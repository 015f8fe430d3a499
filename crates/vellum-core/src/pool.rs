//! Reusable per-write-transaction containers.

use std::collections::{HashMap, HashSet};

use vellum_pager::PageFromScratch;
use vellum_types::PageNumber;

/// The environment-owned container pool borrowed by each write transaction.
///
/// Only one write transaction is active at a time, so a single pool
/// amortizes the container allocations across all writers. Borrowed at
/// begin, reset and returned at dispose.
#[derive(Debug, Default)]
pub struct WriteTransactionPool {
    /// Pages copied-on-write by the current transaction.
    pub(crate) dirty_pages: HashSet<PageNumber>,
    /// First tail page of a dirty overflow run → number of tail pages.
    pub(crate) dirty_overflow_pages: HashMap<PageNumber, u32>,
    /// Logical page number → scratch slot holding its new version.
    pub(crate) scratch_pages_table: HashMap<PageNumber, PageFromScratch>,
}

impl WriteTransactionPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all containers, keeping their capacity for the next borrower.
    pub fn reset(&mut self) {
        self.dirty_pages.clear();
        self.dirty_overflow_pages.clear();
        self.scratch_pages_table.clear();
    }

    /// Whether every container is empty. A freshly borrowed pool must be.
    #[must_use]
    pub fn is_clear(&self) -> bool {
        self.dirty_pages.is_empty()
            && self.dirty_overflow_pages.is_empty()
            && self.scratch_pages_table.is_empty()
    }
}
