//! The low-level transaction: page read/modify/allocate/free, commit,
//! rollback, snapshot isolation.
//!
//! A transaction binds to an immutable snapshot at begin: the environment
//! state, the journal's translation tables, and reference-counted handles
//! to the data-file mapping and every scratch file. Reads resolve through
//! three tiers (own scratch table, journal snapshot, data file); writes go
//! through copy-on-write into scratch slots that stay invisible to
//! concurrent readers until the journal write at commit publishes them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use vellum_error::{Result, VellumError};
use vellum_journal::{Journal, JournalBatch, JournalBatchPage};
use vellum_pager::{PageFromScratch, PagerState, ScratchFile, ScratchFileId};
use vellum_types::{
    Page, PageFlags, PageNumber, TransactionHeader, TxnId, TxnMarker,
};

use crate::env::{StorageEnvironment, TxnOutcome};
use crate::freespace::FreeSpaceHandling;
use crate::pool::WriteTransactionPool;
use crate::state::EnvState;

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Read,
    ReadWrite,
}

/// Transaction lifecycle state. Disposal is ownership-based: dropping the
/// transaction is the dispose step, and a dropped transaction cannot be
/// operated on at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committed,
    RolledBack,
}

/// Statistics from a successful commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommitStats {
    /// Physical pages written to the journal, header page included.
    pub pages_written: u64,
    /// Bytes appended to the journal.
    pub journal_bytes: u64,
}

/// Options for [`LowLevelTransaction::allocate_page_with`].
#[derive(Debug, Clone, Copy)]
pub struct AllocOptions {
    /// Reuse this logical page number instead of consulting free space and
    /// the tail. Copy-on-write allocates with the number being shadowed.
    pub page_number: Option<PageNumber>,
    /// Logical page this allocation shadows, recorded on the scratch slot.
    pub previous_version: Option<PageNumber>,
    /// Zero the slot's memory. When false only the header is cleared.
    pub zero: bool,
}

impl Default for AllocOptions {
    fn default() -> Self {
        Self {
            page_number: None,
            previous_version: None,
            zero: true,
        }
    }
}

type TxnHook = Box<dyn FnOnce(TxnId) + Send>;

/// A low-level transaction over the page store.
pub struct LowLevelTransaction {
    env: Arc<StorageEnvironment>,
    id: TxnId,
    kind: TxnKind,
    state: TxnState,
    lazy_commit: bool,
    /// Local clone of the environment state; published on commit.
    local: EnvState,
    /// Pinned data-file mapping generation.
    data_pager_state: Arc<PagerState>,
    /// Pinned scratch file states, extended as new files appear.
    scratch_states: HashMap<ScratchFileId, Arc<ScratchFile>>,
    /// One-element cache accelerating repeated scratch reads in one file.
    scratch_state_cache: Option<(ScratchFileId, Arc<ScratchFile>)>,
    /// Frozen journal translation tables.
    journal_snapshots: Vec<vellum_journal::JournalSnapshot>,

    // Write-transaction state. `pool` is `Some` exactly for writers.
    pool: Option<WriteTransactionPool>,
    freed_pages: HashSet<PageNumber>,
    unused_scratch: SmallVec<[PageFromScratch; 8]>,
    transaction_pages: HashSet<PageFromScratch>,
    pages_to_free_on_commit: SmallVec<[PageNumber; 8]>,
    txn_header_slot: Option<PageFromScratch>,
    txn_header: TransactionHeader,
    allocated_pages_in_transaction: u64,
    overflow_pages_in_transaction: u64,
    flushed_to_journal: bool,
    last_commit_stats: Option<CommitStats>,
    on_commit: Vec<TxnHook>,
    on_dispose: Vec<TxnHook>,
    #[cfg(debug_assertions)]
    read_page_hashes: HashMap<PageNumber, u64>,
    disposed: bool,
}

impl LowLevelTransaction {
    pub(crate) fn new_read(env: Arc<StorageEnvironment>) -> Result<Self> {
        env.ensure_healthy()?;
        let id = env.issue_txn_id();
        let local = env.state_snapshot();
        env.register_active(id, TxnKind::Read, local.last_committed);
        let tx = Self::bind_snapshot(env, id, TxnKind::Read, local, None);
        trace!(txn = %tx.id, floor = %tx.local.last_committed, "read transaction opened");
        Ok(tx)
    }

    pub(crate) fn new_write(env: Arc<StorageEnvironment>) -> Result<Self> {
        env.ensure_healthy()?;
        // Serializes writers; blocks until the previous one completes.
        let pool = env.acquire_write_pool();
        if let Err(err) = env.ensure_healthy() {
            env.release_write_pool(pool);
            return Err(err);
        }
        let id = env.issue_txn_id();
        let local = env.state_snapshot();
        env.register_active(id, TxnKind::ReadWrite, local.last_committed);

        // Duplicate-id guard: the journal must not already hold records for
        // this id or a later one.
        let recorded = env.journal().max_recorded_txn_id();
        if recorded >= id {
            env.latch_catastrophic(&format!(
                "issued {id} but journal already recorded {recorded}"
            ));
            env.complete_transaction(id, TxnOutcome::RolledBack);
            env.release_write_pool(pool);
            return Err(VellumError::DuplicateTransactionId {
                id: id.get(),
                recorded: recorded.get(),
            });
        }
        debug_assert!(pool.is_clear());

        let mut tx = Self::bind_snapshot(env, id, TxnKind::ReadWrite, local, Some(pool));
        tx.init_transaction_header()?;
        debug!(txn = %tx.id, next_page = %tx.local.next_page_number, "write transaction opened");
        Ok(tx)
    }

    fn bind_snapshot(
        env: Arc<StorageEnvironment>,
        id: TxnId,
        kind: TxnKind,
        local: EnvState,
        pool: Option<WriteTransactionPool>,
    ) -> Self {
        let scratch_states = env.scratch().pager_states();
        let data_pager_state = env.pager().state();
        let journal_snapshots = env.journal().snapshots();
        Self {
            env,
            id,
            kind,
            state: TxnState::Open,
            lazy_commit: false,
            local,
            data_pager_state,
            scratch_states,
            scratch_state_cache: None,
            journal_snapshots,
            pool,
            freed_pages: HashSet::new(),
            unused_scratch: SmallVec::new(),
            transaction_pages: HashSet::new(),
            pages_to_free_on_commit: SmallVec::new(),
            txn_header_slot: None,
            txn_header: TransactionHeader::default(),
            allocated_pages_in_transaction: 0,
            overflow_pages_in_transaction: 0,
            flushed_to_journal: false,
            last_commit_stats: None,
            on_commit: Vec::new(),
            on_dispose: Vec::new(),
            #[cfg(debug_assertions)]
            read_page_hashes: HashMap::new(),
            disposed: false,
        }
    }

    /// Lay down the transaction header in its own scratch slot.
    fn init_transaction_header(&mut self) -> Result<()> {
        let slot = self
            .env
            .scratch()
            .allocate(self.id, 1, self.env.reclaim_horizon())?;
        let mut page = self.env.scratch().read_page(&slot);
        page.zero();
        self.txn_header_slot = Some(slot);
        self.txn_header = TransactionHeader {
            txn_id: self.id,
            previous_root: self.local.root.catalog_page_or_zero(),
            new_root: self.local.root.catalog_page_or_zero(),
            next_page_number: self.local.next_page_number,
            last_page_number: PageNumber::new(self.local.next_page_number.get().saturating_sub(1)),
            timestamp_micros: now_micros(),
            ..TransactionHeader::default()
        };
        Ok(())
    }

    // -- accessors ---------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.kind == TxnKind::ReadWrite
    }

    #[must_use]
    pub fn state(&self) -> TxnState {
        self.state
    }

    #[must_use]
    pub fn env(&self) -> &Arc<StorageEnvironment> {
        &self.env
    }

    /// Skip the journal fsync on commit. The commit stays buffered until
    /// the next synchronous commit forces it out.
    pub fn set_lazy_commit(&mut self, lazy: bool) {
        self.lazy_commit = lazy;
    }

    #[must_use]
    pub fn allocated_pages_in_transaction(&self) -> u64 {
        self.allocated_pages_in_transaction
    }

    #[must_use]
    pub fn overflow_pages_in_transaction(&self) -> u64 {
        self.overflow_pages_in_transaction
    }

    #[must_use]
    pub fn flushed_to_journal(&self) -> bool {
        self.flushed_to_journal
    }

    /// The tail page number in this transaction's local state.
    #[must_use]
    pub fn next_page_number(&self) -> PageNumber {
        self.local.next_page_number
    }

    #[must_use]
    pub fn last_commit_stats(&self) -> Option<CommitStats> {
        self.last_commit_stats
    }

    /// Dirty page numbers, sorted. Empty for read transactions.
    #[must_use]
    pub fn dirty_page_numbers(&self) -> Vec<PageNumber> {
        let Some(pool) = self.pool.as_ref() else {
            return Vec::new();
        };
        let mut pages: Vec<PageNumber> = pool.dirty_pages.iter().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Dirty overflow tail ranges as `(first_tail_page, tail_len)`, sorted.
    #[must_use]
    pub fn dirty_overflow_ranges(&self) -> Vec<(PageNumber, u32)> {
        let Some(pool) = self.pool.as_ref() else {
            return Vec::new();
        };
        let mut ranges: Vec<(PageNumber, u32)> = pool
            .dirty_overflow_pages
            .iter()
            .map(|(p, len)| (*p, *len))
            .collect();
        ranges.sort_unstable_by_key(|(p, _)| *p);
        ranges
    }

    /// Number of scratch slots owned by this transaction.
    #[must_use]
    pub fn transaction_page_count(&self) -> usize {
        self.transaction_pages.len()
    }

    /// The root catalog page in this transaction's view.
    #[must_use]
    pub fn root_catalog_page(&self) -> Option<PageNumber> {
        self.local.root.catalog_page
    }

    /// Point the root catalog at `page`, effective at commit.
    pub fn set_root_catalog(&mut self, page: Option<PageNumber>, tree_count: u32) -> Result<()> {
        self.ensure_writable()?;
        self.local.root.catalog_page = page;
        self.local.root.tree_count = tree_count;
        Ok(())
    }

    /// Run `hook` in the post-durability phase of a successful commit.
    pub fn on_commit(&mut self, hook: impl FnOnce(TxnId) + Send + 'static) {
        self.on_commit.push(Box::new(hook));
    }

    /// Run `hook` when the transaction is dropped.
    pub fn on_dispose(&mut self, hook: impl FnOnce(TxnId) + Send + 'static) {
        self.on_dispose.push(Box::new(hook));
    }

    // -- state checks ------------------------------------------------------

    fn ensure_active(&self) -> Result<()> {
        self.env.ensure_healthy()?;
        match self.state {
            TxnState::Open => Ok(()),
            TxnState::Committed => Err(VellumError::invalid(format!(
                "{} is already committed",
                self.id
            ))),
            TxnState::RolledBack => Err(VellumError::invalid(format!(
                "{} is already rolled back",
                self.id
            ))),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_active()?;
        if self.kind != TxnKind::ReadWrite {
            return Err(VellumError::invalid(format!(
                "write operation on read transaction {}",
                self.id
            )));
        }
        Ok(())
    }

    // -- reads -------------------------------------------------------------

    /// Read page `p` in this transaction's view: own scratch table first,
    /// then the journal snapshot, then the data file.
    pub fn get_page(&mut self, p: PageNumber) -> Result<Page> {
        self.ensure_active()?;

        if self.kind == TxnKind::ReadWrite {
            let slot = self
                .pool
                .as_ref()
                .expect("write transaction holds the pool")
                .scratch_pages_table
                .get(&p)
                .copied();
            if let Some(slot) = slot {
                let state = self.scratch_state(slot.file)?;
                let page = state.page_at(slot.slot, slot.run_len);
                debug_assert_eq!(page.page_number(), p);
                return Ok(page);
            }
        }

        let journal_hit =
            match Journal::read_page_in(&self.journal_snapshots, self.id, p, &self.scratch_states)
            {
                Ok(hit) => hit,
                Err(err) => {
                    self.env.latch_catastrophic(&err.to_string());
                    return Err(err);
                }
            };
        if let Some(page) = journal_hit {
            debug_assert_eq!(page.page_number(), p);
            self.note_page_read(p, &page);
            return Ok(page);
        }

        let page = match self
            .env
            .pager()
            .read_page(&self.data_pager_state, self.id, p)
        {
            Ok(page) => page,
            Err(err) => {
                self.env.latch_catastrophic(&err.to_string());
                return Err(err);
            }
        };
        debug_assert_eq!(page.page_number(), p);
        self.note_page_read(p, &page);
        Ok(page)
    }

    /// Resolve a scratch file state: one-element cache, then the pinned
    /// set, then the pool (pinning files that appeared after begin, which
    /// only happens for this writer's own allocations).
    fn scratch_state(&mut self, file: ScratchFileId) -> Result<Arc<ScratchFile>> {
        if let Some((cached_id, state)) = &self.scratch_state_cache {
            if *cached_id == file {
                return Ok(Arc::clone(state));
            }
        }
        let state = match self.scratch_states.get(&file) {
            Some(state) => Arc::clone(state),
            None => {
                let state = self.env.scratch().file_state(file).ok_or_else(|| {
                    VellumError::catastrophic(format!("scratch file {file} unknown to the pool"))
                })?;
                self.scratch_states.insert(file, Arc::clone(&state));
                state
            }
        };
        self.scratch_state_cache = Some((file, Arc::clone(&state)));
        Ok(state)
    }

    #[cfg(debug_assertions)]
    fn note_page_read(&mut self, p: PageNumber, page: &Page) {
        if self.kind != TxnKind::ReadWrite {
            return;
        }
        self.read_page_hashes
            .entry(p)
            .or_insert_with(|| xxhash_rust::xxh64::xxh64(page.raw(), 0));
    }

    #[cfg(not(debug_assertions))]
    fn note_page_read(&mut self, _p: PageNumber, _page: &Page) {}

    // -- copy-on-write -----------------------------------------------------

    /// Make page `p` writable: copy-on-write into a scratch slot exactly
    /// once per transaction; later calls return the same slot.
    pub fn modify_page(&mut self, p: PageNumber) -> Result<Page> {
        self.ensure_writable()?;
        debug_assert!(
            !self.freed_pages.contains(&p),
            "modify of page {p} freed in this transaction"
        );

        let existing = self
            .pool
            .as_ref()
            .expect("write transaction holds the pool")
            .scratch_pages_table
            .get(&p)
            .copied();
        if let Some(slot) = existing {
            let state = self.scratch_state(slot.file)?;
            return Ok(state.page_at(slot.slot, slot.run_len));
        }

        let current = self.get_page(p)?;
        let run = if current.is_overflow() {
            u32::try_from(
                self.env
                    .pager()
                    .number_of_overflow_pages(u64::from(current.overflow_size())),
            )
            .map_err(|_| VellumError::invalid_allocation("overflow run exceeds u32 pages"))?
            .max(1)
        } else {
            1
        };
        let mut page = self.allocate_page_impl(
            run,
            AllocOptions {
                page_number: Some(p),
                previous_version: Some(p),
                zero: false,
            },
        )?;
        page.copy_from(&current);
        trace!(txn = %self.id, %p, run, "page copied on write");
        Ok(page)
    }

    // -- allocation --------------------------------------------------------

    /// Allocate a run of `n` pages with a fresh page number.
    pub fn allocate_page(&mut self, n: u32) -> Result<Page> {
        self.allocate_page_impl(n, AllocOptions::default())
    }

    /// Allocate with explicit options.
    pub fn allocate_page_with(&mut self, n: u32, opts: AllocOptions) -> Result<Page> {
        self.allocate_page_impl(n, opts)
    }

    /// Allocate an overflow run sized for `byte_count` payload bytes.
    pub fn allocate_overflow_raw_page(&mut self, byte_count: u64) -> Result<Page> {
        self.ensure_writable()?;
        if byte_count > u64::try_from(i32::MAX).expect("i32::MAX fits u64") - 1 {
            return Err(VellumError::invalid_allocation(format!(
                "overflow allocation of {byte_count} bytes exceeds the representable maximum"
            )));
        }
        let n = u32::try_from(self.env.page_size().overflow_pages(byte_count))
            .expect("bounded by i32::MAX / page_size");
        let mut page = self.allocate_page_impl(n, AllocOptions::default())?;
        page.set_flags(PageFlags::OVERFLOW);
        page.set_overflow_size(u32::try_from(byte_count).expect("bounded by i32::MAX"));
        Ok(page)
    }

    /// Allocate one contiguous run covering `sizes` and return one handle
    /// per element, preserving contiguity.
    ///
    /// When `total` is given it must equal the sum of `sizes`.
    pub fn allocate_pages(&mut self, sizes: &[u32], total: Option<u32>) -> Result<Vec<Page>> {
        self.ensure_writable()?;
        if sizes.is_empty() || sizes.contains(&0) {
            return Err(VellumError::invalid_allocation(
                "allocate_pages needs non-empty, non-zero sizes",
            ));
        }
        let sum: u64 = sizes.iter().copied().map(u64::from).sum();
        let total = match total {
            Some(total) => {
                if u64::from(total) != sum {
                    return Err(VellumError::invalid_allocation(format!(
                        "stated total {total} disagrees with size sum {sum}"
                    )));
                }
                total
            }
            None => u32::try_from(sum)
                .map_err(|_| VellumError::invalid_allocation("size sum exceeds u32 pages"))?,
        };

        let base = self.reserve_page_number(total)?;
        let run = self
            .env
            .scratch()
            .allocate(self.id, total, self.env.reclaim_horizon())?;
        self.env.scratch().ensure_mapped(&run)?;

        let ps = self.env.page_size();
        let mut pages = Vec::with_capacity(sizes.len());
        let mut page_cursor = base;
        let mut slot_cursor = run.slot;
        for &size in sizes {
            let piece = PageFromScratch {
                file: run.file,
                slot: slot_cursor,
                run_len: size,
                original_run_len: size,
                previous_version: None,
            };
            self.register_allocation(page_cursor, piece)?;
            let state = self.scratch_state(run.file)?;
            let mut page = state.page_at(piece.slot, size);
            page.zero();
            page.set_page_number(page_cursor);
            if size > 1 {
                page.set_flags(PageFlags::OVERFLOW);
                page.set_overflow_size(size * ps.get());
            } else {
                page.set_flags(PageFlags::SINGLE);
            }
            pages.push(page);
            page_cursor = page_cursor.offset(u64::from(size));
            slot_cursor += u64::from(size);
        }
        Ok(pages)
    }

    /// Pick the logical page number for a fresh `n`-page allocation and
    /// enforce the storage quota before any scratch is touched.
    fn reserve_page_number(&mut self, n: u32) -> Result<PageNumber> {
        let env = Arc::clone(&self.env);
        let (p, from_tail) = match env.free_space().try_allocate(self, n) {
            Some(p) => (p, false),
            None => (self.local.next_page_number, true),
        };
        self.check_quota(p, n)?;
        if from_tail {
            self.local.next_page_number = p.offset(u64::from(n));
        }
        Ok(p)
    }

    fn check_quota(&self, p: PageNumber, n: u32) -> Result<()> {
        if let Some(max) = self.env.pager().max_storage_size() {
            let last_page = p.get() + u64::from(n) - 1;
            if last_page * u64::from(self.env.page_size().get()) > max {
                return Err(VellumError::QuotaExceeded {
                    page: p.get(),
                    max_bytes: max,
                });
            }
        }
        Ok(())
    }

    /// Record a scratch slot as the new version of `p` and update every
    /// piece of bookkeeping that must stay pairwise consistent.
    fn register_allocation(&mut self, p: PageNumber, slot: PageFromScratch) -> Result<()> {
        let inserted = self.transaction_pages.insert(slot);
        debug_assert!(inserted, "scratch slot registered twice");
        self.allocated_pages_in_transaction += 1;
        if slot.run_len > 1 {
            self.overflow_pages_in_transaction += u64::from(slot.run_len - 1);
        }
        let pool = self.pool.as_mut().expect("write transaction holds the pool");
        let previous = pool.scratch_pages_table.insert(p, slot);
        debug_assert!(previous.is_none(), "page {p} already redirected");
        let fresh = pool.dirty_pages.insert(p);
        debug_assert!(fresh, "page {p} already dirty");
        if slot.run_len > 1 {
            let previous = pool.dirty_overflow_pages.insert(p.next(), slot.run_len - 1);
            debug_assert!(previous.is_none(), "overflow tail at {} already tracked", p.next());
        }
        Ok(())
    }

    fn allocate_page_impl(&mut self, n: u32, opts: AllocOptions) -> Result<Page> {
        self.ensure_writable()?;
        if n == 0 {
            return Err(VellumError::invalid_allocation("allocation of zero pages"));
        }

        let p = match opts.page_number {
            Some(p) => {
                self.check_quota(p, n)?;
                p
            }
            None => self.reserve_page_number(n)?,
        };

        let mut slot = self
            .env
            .scratch()
            .allocate(self.id, n, self.env.reclaim_horizon())?;
        slot.previous_version = opts.previous_version;
        self.register_allocation(p, slot)?;
        if n > 1 {
            self.env.scratch().ensure_mapped(&slot)?;
        }

        let state = self.scratch_state(slot.file)?;
        let mut page = state.page_at(slot.slot, slot.run_len);
        if opts.zero {
            page.zero();
        } else {
            page.zero_header();
        }
        page.set_page_number(p);
        if n > 1 {
            page.set_flags(PageFlags::OVERFLOW);
            page.set_overflow_size(n * self.env.page_size().get());
        } else {
            page.set_flags(PageFlags::SINGLE);
        }
        trace!(txn = %self.id, %p, run = n, "page allocated");
        Ok(page)
    }

    /// Split an overflow allocation made in this transaction into
    /// single-page allocations with their own scratch entries.
    pub fn break_large_allocation_to_separate_pages(&mut self, p: PageNumber) -> Result<()> {
        self.ensure_writable()?;
        let slot = self
            .pool
            .as_ref()
            .expect("write transaction holds the pool")
            .scratch_pages_table
            .get(&p)
            .copied()
            .ok_or_else(|| {
                VellumError::invalid(format!(
                    "break of page {p} not allocated in {}",
                    self.id
                ))
            })?;
        if slot.run_len < 2 {
            return Err(VellumError::invalid(format!(
                "break of page {p}: not an overflow allocation"
            )));
        }

        let pieces = self.env.scratch().break_large_allocation(&slot)?;
        let n = slot.run_len;
        let removed = self.transaction_pages.remove(&slot);
        debug_assert!(removed);

        let pool = self.pool.as_mut().expect("write transaction holds the pool");
        pool.dirty_overflow_pages.remove(&p.next());
        for (i, piece) in pieces.iter().enumerate() {
            let number = p.offset(i as u64);
            let inserted = self.transaction_pages.insert(*piece);
            debug_assert!(inserted);
            pool.scratch_pages_table.insert(number, *piece);
            pool.dirty_pages.insert(number);
        }
        self.allocated_pages_in_transaction += u64::from(n - 1);
        self.overflow_pages_in_transaction -= u64::from(n - 1);

        for (i, piece) in pieces.iter().enumerate() {
            let number = p.offset(i as u64);
            let state = self.scratch_state(piece.file)?;
            let mut page = state.page_at(piece.slot, 1);
            page.set_page_number(number);
            page.set_flags(PageFlags::SINGLE);
            page.set_overflow_size(0);
        }
        debug!(txn = %self.id, %p, pieces = n, "overflow allocation split into single pages");
        Ok(())
    }

    // -- freeing -----------------------------------------------------------

    /// Free page `p` now. The page remains readable through snapshots taken
    /// before this transaction commits.
    pub fn free_page(&mut self, p: PageNumber) -> Result<()> {
        self.ensure_writable()?;
        debug_assert!(!self.freed_pages.contains(&p), "double free of page {p}");
        self.freed_pages.insert(p);

        let env = Arc::clone(&self.env);
        env.free_space().free_page(self, p);

        let pool = self.pool.as_mut().expect("write transaction holds the pool");
        if let Some(slot) = pool.scratch_pages_table.remove(&p) {
            let removed = self.transaction_pages.remove(&slot);
            debug_assert!(removed);
            // Returned to the pool only at commit or rollback; other code
            // paths in this transaction may still hold the pointer.
            self.unused_scratch.push(slot);
        }

        let pool = self.pool.as_mut().expect("write transaction holds the pool");
        if pool.dirty_pages.remove(&p) {
            self.allocated_pages_in_transaction -= 1;
        } else if let Some(tail_len) = pool.dirty_overflow_pages.remove(&p) {
            self.overflow_pages_in_transaction -= 1;
            if tail_len > 1 {
                pool.dirty_overflow_pages.insert(p.next(), tail_len - 1);
            }
        }
        trace!(txn = %self.id, %p, "page freed");
        Ok(())
    }

    /// Defer freeing `p` to commit time, so reads earlier in this
    /// transaction keep resolving it.
    pub fn free_page_on_commit(&mut self, p: PageNumber) -> Result<()> {
        self.ensure_writable()?;
        self.pages_to_free_on_commit.push(p);
        Ok(())
    }

    // -- commit / rollback -------------------------------------------------

    /// Commit the transaction. A no-op for read transactions.
    ///
    /// The journal write is the durability point: once it returns, the
    /// transaction is committed even if a later step fails, in which case
    /// the environment latches catastrophic failure and the error carries
    /// the original cause.
    pub fn commit(&mut self) -> Result<CommitStats> {
        self.env.ensure_healthy()?;
        if self.kind == TxnKind::Read {
            return Ok(CommitStats::default());
        }
        self.ensure_active()?;

        while let Some(p) = self.pages_to_free_on_commit.pop() {
            self.free_page(p)?;
        }

        self.txn_header.next_page_number = self.local.next_page_number;
        self.txn_header.last_page_number =
            PageNumber::new(self.local.next_page_number.get() - 1);
        self.txn_header.new_root = self.local.root.catalog_page_or_zero();
        self.txn_header.page_count = u32::try_from(
            self.allocated_pages_in_transaction + self.overflow_pages_in_transaction,
        )
        .map_err(|_| VellumError::invalid_allocation("transaction dirty set exceeds u32 pages"))?;
        self.txn_header.marker |= TxnMarker::COMMIT;

        let mut stats = CommitStats::default();
        let to_write =
            self.allocated_pages_in_transaction + self.overflow_pages_in_transaction;
        if to_write > 0 || self.env.journal().has_data_in_lazy_tx_buffer() {
            let mut entries: Vec<(PageNumber, PageFromScratch)> = self
                .pool
                .as_ref()
                .expect("write transaction holds the pool")
                .scratch_pages_table
                .iter()
                .map(|(p, slot)| (*p, *slot))
                .collect();
            entries.sort_unstable_by_key(|(p, _)| *p);

            let mut handles = Vec::with_capacity(entries.len());
            for (p, slot) in entries {
                let state = self.scratch_state(slot.file)?;
                handles.push((p, state.page_at(slot.slot, slot.run_len), slot));
            }
            let pages: Vec<JournalBatchPage<'_>> = handles
                .iter()
                .map(|(p, page, slot)| JournalBatchPage {
                    page_number: *p,
                    bytes: page.raw(),
                    slot: *slot,
                })
                .collect();

            let write = self.env.journal().write_to_journal(JournalBatch {
                txn_id: self.id,
                lazy: self.lazy_commit,
                quarantine_marker: self.env.latest_issued_txn_id(),
                header: self.txn_header,
                pages,
            })?;
            self.flushed_to_journal = true;
            self.txn_header = write.header;
            stats.pages_written = write.pages_written;
            stats.journal_bytes =
                write.pages_written * u64::from(self.env.page_size().get());
        }

        // Post-durability phase: the transaction is committed on disk; any
        // failure here leaves in-memory state unusable.
        if let Err(err) = self.commit_post_durability() {
            let detail = format!("post-commit failure in {}: {err}", self.id);
            self.env.latch_catastrophic(&detail);
            self.state = TxnState::Committed;
            return Err(VellumError::catastrophic(detail));
        }
        self.last_commit_stats = Some(stats);
        debug!(
            txn = %self.id,
            pages = stats.pages_written,
            lazy = self.lazy_commit,
            "transaction committed"
        );
        Ok(stats)
    }

    fn commit_post_durability(&mut self) -> Result<()> {
        self.validate_dirty_pages();

        if let Some(header_slot) = self.txn_header_slot.take() {
            self.env.scratch().free(header_slot, self.id);
        }
        for slot in self.unused_scratch.drain(..) {
            self.env.scratch().free(slot, self.id);
        }
        // Committed slots now belong to the journal's translation tables;
        // they are released when the flusher moves them to the data file.
        self.transaction_pages.clear();

        let mut published = self.local.clone();
        published.last_committed = self.id;
        self.local = published.clone();
        self.env.publish_state(published);
        self.env.free_space().commit_frees(self.id);
        self.state = TxnState::Committed;
        self.env.run_after_commit_hooks(self.id);
        for hook in self.on_commit.drain(..) {
            hook(self.id);
        }
        Ok(())
    }

    /// Roll the transaction back, releasing every scratch slot it
    /// allocated. A no-op unless this is an open write transaction.
    pub fn rollback(&mut self) -> Result<()> {
        if self.kind != TxnKind::ReadWrite || self.state != TxnState::Open {
            return Ok(());
        }
        self.validate_read_pages();

        for slot in self.transaction_pages.drain() {
            self.env.scratch().free(slot, self.id);
        }
        for slot in self.unused_scratch.drain(..) {
            self.env.scratch().free(slot, self.id);
        }
        if let Some(header_slot) = self.txn_header_slot.take() {
            self.env.scratch().free(header_slot, self.id);
        }
        self.env.free_space().discard_frees(self.id);
        self.env.journal().update_cache_for_journal_snapshots();
        self.scratch_state_cache = None;
        self.journal_snapshots.clear();
        self.state = TxnState::RolledBack;
        debug!(txn = %self.id, "transaction rolled back");
        Ok(())
    }

    // -- debug validation --------------------------------------------------

    /// Commit-time consistency sweep over the redirection layer.
    fn validate_dirty_pages(&mut self) {
        #[cfg(debug_assertions)]
        {
            let entries: Vec<(PageNumber, PageFromScratch)> = self
                .pool
                .as_ref()
                .expect("write transaction holds the pool")
                .scratch_pages_table
                .iter()
                .map(|(p, s)| (*p, *s))
                .collect();
            for (p, slot) in entries {
                let state = self
                    .scratch_state(slot.file)
                    .expect("committed slot's file is pinned");
                let page = state.page_at(slot.slot, slot.run_len);
                debug_assert_eq!(page.page_number(), p, "header page number drifted");
                debug_assert_eq!(
                    page.is_overflow(),
                    slot.run_len > 1,
                    "overflow flag disagrees with run length for page {p}"
                );
            }
            let pool = self.pool.as_ref().expect("write transaction holds the pool");
            for tail in pool.dirty_overflow_pages.keys() {
                debug_assert!(
                    !pool.dirty_pages.contains(tail),
                    "page {tail} is both dirty and an overflow tail"
                );
            }
        }
    }

    /// Rollback-time check that pages read but never modified were not
    /// mutated out-of-transaction.
    fn validate_read_pages(&mut self) {
        #[cfg(debug_assertions)]
        {
            let hashes: Vec<(PageNumber, u64)> = self
                .read_page_hashes
                .iter()
                .map(|(p, h)| (*p, *h))
                .collect();
            for (p, recorded) in hashes {
                let dirty = self
                    .pool
                    .as_ref()
                    .is_some_and(|pool| pool.dirty_pages.contains(&p));
                if dirty || self.freed_pages.contains(&p) {
                    continue;
                }
                let page = match Journal::read_page_in(
                    &self.journal_snapshots,
                    self.id,
                    p,
                    &self.scratch_states,
                ) {
                    Ok(Some(page)) => page,
                    _ => match self
                        .env
                        .pager()
                        .read_page(&self.data_pager_state, self.id, p)
                    {
                        Ok(page) => page,
                        Err(_) => continue,
                    },
                };
                let current = xxhash_rust::xxh64::xxh64(page.raw(), 0);
                debug_assert_eq!(
                    current, recorded,
                    "read-only page {p} mutated outside the transaction"
                );
            }
        }
    }
}

impl Drop for LowLevelTransaction {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.kind == TxnKind::ReadWrite && self.state == TxnState::Open {
            if let Err(err) = self.rollback() {
                warn!(txn = %self.id, %err, "implicit rollback on drop failed");
            }
        }
        if self.kind == TxnKind::ReadWrite {
            if let Some(mut pool) = self.pool.take() {
                pool.reset();
                self.env.release_write_pool(pool);
            }
        }
        let outcome = match self.state {
            TxnState::Committed => TxnOutcome::Committed,
            TxnState::Open | TxnState::RolledBack => TxnOutcome::RolledBack,
        };
        self.env.complete_transaction(self.id, outcome);
        self.scratch_states.clear();
        self.scratch_state_cache = None;
        self.journal_snapshots.clear();
        for hook in self.on_dispose.drain(..) {
            hook(self.id);
        }
        trace!(txn = %self.id, ?outcome, "transaction disposed");
    }
}

impl std::fmt::Debug for LowLevelTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowLevelTransaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("allocated", &self.allocated_pages_in_transaction)
            .field("overflow", &self.overflow_pages_in_transaction)
            .finish_non_exhaustive()
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvOptions;

    fn open_env(dir: &tempfile::TempDir) -> Arc<StorageEnvironment> {
        StorageEnvironment::open(EnvOptions::new(dir.path())).expect("environment opens")
    }

    #[test]
    fn first_allocation_is_page_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("write tx");
        let page = tx.allocate_page(1).expect("allocate");
        assert_eq!(page.page_number(), PageNumber::FIRST);
        assert_eq!(tx.allocated_pages_in_transaction(), 1);
        assert_eq!(tx.overflow_pages_in_transaction(), 0);
    }

    #[test]
    fn write_op_on_read_transaction_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.read_transaction().expect("read tx");
        let err = tx.allocate_page(1).expect_err("read tx cannot allocate");
        assert!(matches!(err, VellumError::InvalidOperation { .. }));
        let err = tx.free_page(PageNumber::FIRST).expect_err("nor free");
        assert!(matches!(err, VellumError::InvalidOperation { .. }));
    }

    #[test]
    fn commit_is_a_noop_for_read_transactions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.read_transaction().expect("read tx");
        let stats = tx.commit().expect("silent");
        assert_eq!(stats.pages_written, 0);
    }

    #[test]
    fn operations_after_commit_fail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("write tx");
        tx.allocate_page(1).expect("allocate");
        tx.commit().expect("commit");
        assert_eq!(tx.state(), TxnState::Committed);
        assert!(matches!(
            tx.commit().expect_err("double commit"),
            VellumError::InvalidOperation { .. }
        ));
        assert!(matches!(
            tx.get_page(PageNumber::FIRST).expect_err("read after commit"),
            VellumError::InvalidOperation { .. }
        ));
    }

    #[test]
    fn commit_after_rollback_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("write tx");
        tx.allocate_page(1).expect("allocate");
        tx.rollback().expect("rollback");
        assert!(matches!(
            tx.commit().expect_err("commit after rollback"),
            VellumError::InvalidOperation { .. }
        ));
    }

    #[test]
    fn modify_page_is_idempotent_within_a_transaction() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        {
            let mut tx = env.write_transaction().expect("tx1");
            let mut page = tx.allocate_page(1).expect("allocate");
            page.data_mut().fill(1);
            tx.commit().expect("commit");
        }
        let mut tx = env.write_transaction().expect("tx2");
        let a = tx.modify_page(PageNumber::FIRST).expect("first modify");
        let b = tx.modify_page(PageNumber::FIRST).expect("second modify");
        assert_eq!(a.raw().as_ptr(), b.raw().as_ptr(), "same scratch slot");
        assert_eq!(tx.allocated_pages_in_transaction(), 1);
    }

    #[test]
    fn free_page_reverses_allocation_bookkeeping() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("tx");
        let page = tx.allocate_page(1).expect("allocate");
        let p = page.page_number();
        assert_eq!(tx.dirty_page_numbers(), vec![p]);
        tx.free_page(p).expect("free");
        assert!(tx.dirty_page_numbers().is_empty());
        assert_eq!(tx.allocated_pages_in_transaction(), 0);
        assert_eq!(tx.transaction_page_count(), 0);
    }

    #[test]
    fn overflow_tail_frees_shift_the_range() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("tx");
        let page = tx.allocate_page(3).expect("overflow");
        let p = page.page_number();
        assert_eq!(tx.dirty_overflow_ranges(), vec![(p.next(), 2)]);

        tx.free_page(p).expect("free head");
        assert_eq!(tx.allocated_pages_in_transaction(), 0);
        assert_eq!(tx.dirty_overflow_ranges(), vec![(p.next(), 2)]);

        tx.free_page(p.next()).expect("free first tail");
        assert_eq!(tx.overflow_pages_in_transaction(), 1);
        assert_eq!(tx.dirty_overflow_ranges(), vec![(p.offset(2), 1)]);

        tx.free_page(p.offset(2)).expect("free last tail");
        assert_eq!(tx.overflow_pages_in_transaction(), 0);
        assert!(tx.dirty_overflow_ranges().is_empty());
    }

    #[test]
    fn allocate_pages_defaults_total_to_size_sum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("tx");
        let pages = tx.allocate_pages(&[2, 3, 1], None).expect("contiguous run");
        assert_eq!(pages.len(), 3);
        // Contiguous page numbers spanning the stated sizes.
        assert_eq!(pages[0].page_number(), PageNumber::new(1));
        assert_eq!(pages[1].page_number(), PageNumber::new(3));
        assert_eq!(pages[2].page_number(), PageNumber::new(6));
        assert_eq!(tx.allocated_pages_in_transaction(), 3);
        assert_eq!(tx.overflow_pages_in_transaction(), 3);
    }

    #[test]
    fn allocate_pages_rejects_mismatched_total() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("tx");
        let err = tx
            .allocate_pages(&[2, 3], Some(4))
            .expect_err("total disagrees");
        assert!(matches!(err, VellumError::InvalidAllocation { .. }));
    }

    #[test]
    fn oversized_overflow_allocation_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let mut tx = env.write_transaction().expect("tx");
        let err = tx
            .allocate_overflow_raw_page(u64::from(u32::MAX))
            .expect_err("too big");
        assert!(matches!(err, VellumError::InvalidAllocation { .. }));
    }

    #[test]
    fn freed_pages_return_through_free_space_after_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let p;
        {
            let mut tx = env.write_transaction().expect("tx1");
            p = tx.allocate_page(1).expect("allocate").page_number();
            tx.commit().expect("commit");
        }
        {
            let mut tx = env.write_transaction().expect("tx2");
            tx.free_page(p).expect("free committed page");
            tx.commit().expect("commit");
        }
        assert_eq!(env.free_space().available_pages(), 1);
        let mut tx = env.write_transaction().expect("tx3");
        let reused = tx.allocate_page(1).expect("allocate");
        assert_eq!(reused.page_number(), p, "free space is consulted first");
    }

    #[test]
    fn rollback_discards_staged_frees() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let p;
        {
            let mut tx = env.write_transaction().expect("tx1");
            p = tx.allocate_page(1).expect("allocate").page_number();
            tx.commit().expect("commit");
        }
        {
            let mut tx = env.write_transaction().expect("tx2");
            tx.free_page(p).expect("free");
            tx.rollback().expect("rollback");
        }
        assert_eq!(env.free_space().available_pages(), 0);
    }

    #[test]
    fn writers_are_serialized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let tx1 = env.write_transaction().expect("first writer");
        let env2 = Arc::clone(&env);
        let handle = std::thread::spawn(move || {
            let mut tx2 = env2.write_transaction().expect("second writer");
            let page = tx2.allocate_page(1).expect("allocate");
            let p = page.page_number();
            tx2.commit().expect("commit");
            p
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(env.active_write_transactions(), 1);
        drop(tx1);
        let p = handle.join().expect("writer thread");
        assert_eq!(p, PageNumber::FIRST);
    }

    #[test]
    fn latched_environment_rejects_new_transactions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        env.latch_catastrophic("test latch");
        assert!(matches!(
            env.write_transaction().expect_err("latched"),
            VellumError::CatastrophicFailure { .. }
        ));
        assert!(matches!(
            env.read_transaction().expect_err("latched"),
            VellumError::CatastrophicFailure { .. }
        ));
    }

    #[test]
    fn free_on_commit_defers_until_commit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = open_env(&dir);
        let p;
        {
            let mut tx = env.write_transaction().expect("tx1");
            let mut page = tx.allocate_page(1).expect("allocate");
            page.data_mut().fill(7);
            p = page.page_number();
            tx.commit().expect("commit");
        }
        let mut tx = env.write_transaction().expect("tx2");
        tx.free_page_on_commit(p).expect("defer");
        // Still readable inside the same transaction.
        let page = tx.get_page(p).expect("still resolvable");
        assert_eq!(page.data()[0], 7);
        tx.commit().expect("commit");
        assert_eq!(env.free_space().available_pages(), 1);
    }
}
