//! The storage environment: one per database directory.
//!
//! Owns the pager, scratch pool, journal, and free-space list; issues
//! transaction ids; serializes writers; tracks active transactions so the
//! journal flusher and the scratch pool know what may be recycled; and
//! latches catastrophic failures so every later transaction fails fast.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info};

use vellum_error::{Result, VellumError};
use vellum_journal::Journal;
use vellum_pager::{Pager, ScratchBufferPool};
use vellum_types::{PageNumber, PageSize, TxnId};

use crate::freespace::FreeSpaceList;
use crate::low_level::{LowLevelTransaction, TxnKind};
use crate::pool::WriteTransactionPool;
use crate::state::{EnvState, RootHeader};
use crate::txn::Transaction;

const ENV_HEADER_MAGIC: u64 = u64::from_le_bytes(*b"VELLUMHD");
const ENV_HEADER_VERSION: u32 = 1;

/// Configuration for opening a [`StorageEnvironment`].
#[derive(Debug, Clone)]
pub struct EnvOptions {
    /// Database directory; created if missing.
    pub path: PathBuf,
    pub page_size: PageSize,
    /// Optional data-file quota in bytes.
    pub max_storage_size: Option<u64>,
    /// Initial data-file size in pages.
    pub initial_data_pages: u64,
    /// Pages per scratch file.
    pub scratch_file_pages: u64,
    /// Scratch pool growth bound.
    pub max_scratch_files: usize,
    /// Pages per journal file before rotation.
    pub journal_file_pages: u64,
}

impl EnvOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            page_size: PageSize::DEFAULT,
            max_storage_size: None,
            initial_data_pages: 64,
            scratch_file_pages: 2048,
            max_scratch_files: 16,
            journal_file_pages: 8192,
        }
    }

    #[must_use]
    pub fn page_size(mut self, page_size: PageSize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn max_storage_size(mut self, bytes: u64) -> Self {
        self.max_storage_size = Some(bytes);
        self
    }

    #[must_use]
    pub fn scratch_capacity(mut self, file_pages: u64, max_files: usize) -> Self {
        self.scratch_file_pages = file_pages;
        self.max_scratch_files = max_files;
        self
    }

    #[must_use]
    pub fn journal_file_pages(mut self, pages: u64) -> Self {
        self.journal_file_pages = pages;
        self
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    RolledBack,
}

type CompletedHook = Box<dyn Fn(TxnId, TxnOutcome) + Send + Sync>;
type AfterCommitHook = Box<dyn Fn(TxnId) + Send + Sync>;

struct ActiveTxn {
    kind: TxnKind,
    /// `last_committed` observed when the transaction began. The journal
    /// may flush a committed transaction to the data file only once every
    /// active floor has passed it.
    snapshot_floor: TxnId,
}

/// Process-wide handle to one database directory.
pub struct StorageEnvironment {
    options: EnvOptions,
    pager: Pager,
    scratch: ScratchBufferPool,
    journal: Journal,
    free_space: FreeSpaceList,
    state: RwLock<EnvState>,
    /// Next transaction id to issue.
    next_txn_id: AtomicU64,
    /// The single write-transaction pool; `None` while a writer holds it.
    write_slot: Mutex<Option<WriteTransactionPool>>,
    write_cv: Condvar,
    active: Mutex<BTreeMap<TxnId, ActiveTxn>>,
    catastrophic: RwLock<Option<String>>,
    completed_hooks: Mutex<Vec<CompletedHook>>,
    after_commit_hooks: Mutex<Vec<AfterCommitHook>>,
}

impl StorageEnvironment {
    /// Open (or create) the environment at `options.path`.
    pub fn open(options: EnvOptions) -> Result<Arc<Self>> {
        fs::create_dir_all(&options.path)?;
        let pager = Pager::open(
            &options.path.join("data.vellum"),
            options.page_size,
            options.initial_data_pages,
            options.max_storage_size,
        )?;

        let header_bytes = pager.read_page_bytes(PageNumber::ZERO)?;
        let state = match decode_env_header(&header_bytes, options.page_size)? {
            Some(state) => {
                info!(path = %options.path.display(), last_committed = %state.last_committed, "environment reopened");
                state
            }
            None => {
                let state = EnvState::initial();
                let mut buf = vec![0u8; options.page_size.as_usize()];
                encode_env_header(&state, options.page_size, &mut buf);
                pager.write_page(PageNumber::ZERO, &buf)?;
                pager.sync()?;
                info!(path = %options.path.display(), "environment created");
                state
            }
        };

        let journal = Journal::open(
            &options.path.join("journal"),
            options.page_size,
            options.journal_file_pages,
        )?;
        let scratch = ScratchBufferPool::new(
            options.page_size,
            options.scratch_file_pages,
            options.max_scratch_files,
        );

        let next_txn_id = AtomicU64::new(state.last_committed.get() + 1);
        Ok(Arc::new(Self {
            options,
            pager,
            scratch,
            journal,
            free_space: FreeSpaceList::new(),
            state: RwLock::new(state),
            next_txn_id,
            write_slot: Mutex::new(Some(WriteTransactionPool::new())),
            write_cv: Condvar::new(),
            active: Mutex::new(BTreeMap::new()),
            catastrophic: RwLock::new(None),
            completed_hooks: Mutex::new(Vec::new()),
            after_commit_hooks: Mutex::new(Vec::new()),
        }))
    }

    #[must_use]
    pub fn options(&self) -> &EnvOptions {
        &self.options
    }

    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.options.page_size
    }

    #[must_use]
    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    #[must_use]
    pub fn scratch(&self) -> &ScratchBufferPool {
        &self.scratch
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    #[must_use]
    pub fn free_space(&self) -> &FreeSpaceList {
        &self.free_space
    }

    /// Begin a low-level read transaction.
    pub fn read_transaction(self: &Arc<Self>) -> Result<LowLevelTransaction> {
        LowLevelTransaction::new_read(Arc::clone(self))
    }

    /// Begin a low-level write transaction. Blocks while another writer is
    /// active; writers never overlap.
    pub fn write_transaction(self: &Arc<Self>) -> Result<LowLevelTransaction> {
        LowLevelTransaction::new_write(Arc::clone(self))
    }

    /// Begin a high-level write transaction.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        Ok(Transaction::new(self.write_transaction()?))
    }

    /// Begin a high-level read transaction.
    pub fn begin_read(self: &Arc<Self>) -> Result<Transaction> {
        Ok(Transaction::new(self.read_transaction()?))
    }

    /// Fail fast when the environment is latched.
    pub fn ensure_healthy(&self) -> Result<()> {
        if let Some(detail) = self.catastrophic.read().as_ref() {
            return Err(VellumError::catastrophic(detail.clone()));
        }
        Ok(())
    }

    /// The first latched cause, if any.
    #[must_use]
    pub fn catastrophic_failure(&self) -> Option<String> {
        self.catastrophic.read().clone()
    }

    /// Latch the environment. Only the first cause is kept; later failures
    /// surface the original one.
    pub fn latch_catastrophic(&self, detail: &str) {
        let mut latch = self.catastrophic.write();
        if latch.is_none() {
            error!(detail, "environment latched into catastrophic failure");
            *latch = Some(detail.to_owned());
        }
    }

    pub(crate) fn issue_txn_id(&self) -> TxnId {
        TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn latest_issued_txn_id(&self) -> TxnId {
        TxnId::new(self.next_txn_id.load(Ordering::SeqCst) - 1)
    }

    /// A copy of the current published state.
    #[must_use]
    pub fn state_snapshot(&self) -> EnvState {
        self.state.read().clone()
    }

    pub(crate) fn publish_state(&self, state: EnvState) {
        *self.state.write() = state;
    }

    /// Take the write pool, blocking until the previous writer returns it.
    pub(crate) fn acquire_write_pool(&self) -> WriteTransactionPool {
        let mut slot = self.write_slot.lock();
        loop {
            if let Some(pool) = slot.take() {
                debug_assert!(pool.is_clear(), "write pool returned dirty");
                return pool;
            }
            self.write_cv.wait(&mut slot);
        }
    }

    pub(crate) fn release_write_pool(&self, pool: WriteTransactionPool) {
        let mut slot = self.write_slot.lock();
        debug_assert!(slot.is_none());
        *slot = Some(pool);
        self.write_cv.notify_one();
    }

    pub(crate) fn register_active(&self, id: TxnId, kind: TxnKind, snapshot_floor: TxnId) {
        self.active.lock().insert(
            id,
            ActiveTxn {
                kind,
                snapshot_floor,
            },
        );
    }

    /// Deregister a transaction and run the completion hooks.
    pub(crate) fn complete_transaction(&self, id: TxnId, outcome: TxnOutcome) {
        self.active.lock().remove(&id);
        for hook in self.completed_hooks.lock().iter() {
            hook(id, outcome);
        }
        self.scratch.reclaim(self.reclaim_horizon());
    }

    pub(crate) fn run_after_commit_hooks(&self, id: TxnId) {
        for hook in self.after_commit_hooks.lock().iter() {
            hook(id);
        }
    }

    /// Oldest live transaction id, if any.
    #[must_use]
    pub fn oldest_active_transaction(&self) -> Option<TxnId> {
        self.active.lock().keys().next().copied()
    }

    /// Scratch slots quarantined before this id are no longer observable.
    pub(crate) fn reclaim_horizon(&self) -> TxnId {
        self.oldest_active_transaction()
            .unwrap_or_else(|| self.latest_issued_txn_id().next())
    }

    /// Commits at or below this floor are in every live snapshot and may
    /// move to the data file.
    fn flush_floor(&self) -> TxnId {
        let active = self.active.lock();
        active
            .values()
            .map(|t| t.snapshot_floor)
            .min()
            .unwrap_or_else(|| self.state.read().last_committed)
    }

    /// Count of currently active write transactions (0 or 1).
    #[must_use]
    pub fn active_write_transactions(&self) -> usize {
        self.active
            .lock()
            .values()
            .filter(|t| t.kind == TxnKind::ReadWrite)
            .count()
    }

    /// Flush committed journal pages into the data file and checkpoint the
    /// environment header. Returns the number of page images applied.
    pub fn flush_journal(&self) -> Result<u64> {
        self.ensure_healthy()?;
        let floor = self.flush_floor();
        let marker = self.latest_issued_txn_id();
        let applied = self
            .journal
            .apply_to_data_file(&self.pager, &self.scratch, floor, marker)?;
        if applied > 0 {
            let state = self.state_snapshot();
            let mut buf = vec![0u8; self.options.page_size.as_usize()];
            encode_env_header(&state, self.options.page_size, &mut buf);
            self.pager.write_page(PageNumber::ZERO, &buf)?;
            self.pager.sync()?;
            debug!(applied, floor = %floor, "journal flush checkpointed");
        }
        self.scratch.reclaim(self.reclaim_horizon());
        Ok(applied)
    }

    /// Run `hook` whenever any transaction completes (commit or rollback).
    pub fn on_transaction_completed(&self, hook: CompletedHook) {
        self.completed_hooks.lock().push(hook);
    }

    /// Run `hook` after each successful commit's post-durability phase.
    pub fn on_transaction_after_commit(&self, hook: AfterCommitHook) {
        self.after_commit_hooks.lock().push(hook);
    }
}

impl std::fmt::Debug for StorageEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEnvironment")
            .field("path", &self.options.path)
            .field("page_size", &self.options.page_size)
            .field("state", &*self.state.read())
            .finish_non_exhaustive()
    }
}

fn encode_env_header(state: &EnvState, page_size: PageSize, buf: &mut [u8]) {
    buf[0..8].copy_from_slice(&ENV_HEADER_MAGIC.to_le_bytes());
    buf[8..12].copy_from_slice(&ENV_HEADER_VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&page_size.get().to_le_bytes());
    buf[16..24].copy_from_slice(&state.next_page_number.get().to_le_bytes());
    buf[24..32].copy_from_slice(&state.last_committed.get().to_le_bytes());
    buf[32..40].copy_from_slice(&state.root.catalog_page_or_zero().get().to_le_bytes());
    buf[40..44].copy_from_slice(&state.root.tree_count.to_le_bytes());
}

/// Decode the environment header page. `Ok(None)` means a blank page: a
/// freshly created store.
fn decode_env_header(buf: &[u8], page_size: PageSize) -> Result<Option<EnvState>> {
    let mut magic = [0u8; 8];
    magic.copy_from_slice(&buf[0..8]);
    let magic = u64::from_le_bytes(magic);
    if magic == 0 && buf.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    if magic != ENV_HEADER_MAGIC {
        return Err(VellumError::corrupt(format!(
            "bad environment header magic {magic:#018x}"
        )));
    }
    let mut u32buf = [0u8; 4];
    u32buf.copy_from_slice(&buf[8..12]);
    let version = u32::from_le_bytes(u32buf);
    if version != ENV_HEADER_VERSION {
        return Err(VellumError::corrupt(format!(
            "unsupported environment version {version}"
        )));
    }
    u32buf.copy_from_slice(&buf[12..16]);
    let stored_page_size = u32::from_le_bytes(u32buf);
    if stored_page_size != page_size.get() {
        return Err(VellumError::corrupt(format!(
            "store was created with page size {stored_page_size}, opened with {page_size}"
        )));
    }
    let mut u64buf = [0u8; 8];
    u64buf.copy_from_slice(&buf[16..24]);
    let next_page_number = PageNumber::new(u64::from_le_bytes(u64buf));
    u64buf.copy_from_slice(&buf[24..32]);
    let last_committed = TxnId::new(u64::from_le_bytes(u64buf));
    u64buf.copy_from_slice(&buf[32..40]);
    let catalog_raw = u64::from_le_bytes(u64buf);
    u32buf.copy_from_slice(&buf[40..44]);
    let tree_count = u32::from_le_bytes(u32buf);
    Ok(Some(EnvState {
        next_page_number,
        root: RootHeader {
            catalog_page: (catalog_raw != 0).then(|| PageNumber::new(catalog_raw)),
            tree_count,
        },
        last_committed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_header_round_trip() {
        let state = EnvState {
            next_page_number: PageNumber::new(77),
            root: RootHeader {
                catalog_page: Some(PageNumber::new(12)),
                tree_count: 4,
            },
            last_committed: TxnId::new(31),
        };
        let mut buf = vec![0u8; 4096];
        encode_env_header(&state, PageSize::DEFAULT, &mut buf);
        let decoded = decode_env_header(&buf, PageSize::DEFAULT)
            .expect("decodes")
            .expect("present");
        assert_eq!(decoded, state);
    }

    #[test]
    fn blank_header_is_fresh_store() {
        let buf = vec![0u8; 4096];
        assert!(decode_env_header(&buf, PageSize::DEFAULT)
            .expect("decodes")
            .is_none());
    }

    #[test]
    fn page_size_mismatch_is_corrupt() {
        let mut buf = vec![0u8; 4096];
        encode_env_header(&EnvState::initial(), PageSize::DEFAULT, &mut buf);
        let err = decode_env_header(&buf, PageSize::new(8192).expect("valid"))
            .expect_err("mismatch");
        assert!(matches!(err, VellumError::Corrupt { .. }));
    }

    #[test]
    fn open_issues_monotonic_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = StorageEnvironment::open(EnvOptions::new(dir.path())).expect("open");
        let a = env.issue_txn_id();
        let b = env.issue_txn_id();
        assert!(b > a);
        assert_eq!(env.latest_issued_txn_id(), b);
    }

    #[test]
    fn reopen_restores_checkpointed_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let env = StorageEnvironment::open(EnvOptions::new(dir.path())).expect("open");
            let mut state = env.state_snapshot();
            state.next_page_number = PageNumber::new(9);
            state.last_committed = TxnId::new(5);
            env.publish_state(state);
            // Checkpoint without journal work.
            let buf = {
                let mut b = vec![0u8; env.page_size().as_usize()];
                encode_env_header(&env.state_snapshot(), env.page_size(), &mut b);
                b
            };
            env.pager().write_page(PageNumber::ZERO, &buf).expect("write");
            env.pager().sync().expect("sync");
        }
        let env = StorageEnvironment::open(EnvOptions::new(dir.path())).expect("reopen");
        let state = env.state_snapshot();
        assert_eq!(state.next_page_number, PageNumber::new(9));
        assert_eq!(state.last_committed, TxnId::new(5));
        assert_eq!(env.latest_issued_txn_id(), TxnId::new(5));
    }

    #[test]
    fn catastrophic_latch_keeps_first_cause() {
        let dir = tempfile::tempdir().expect("tempdir");
        let env = StorageEnvironment::open(EnvOptions::new(dir.path())).expect("open");
        assert!(env.ensure_healthy().is_ok());
        env.latch_catastrophic("first");
        env.latch_catastrophic("second");
        let err = env.ensure_healthy().expect_err("latched");
        assert!(err.to_string().contains("first"));
        assert_eq!(env.catastrophic_failure().as_deref(), Some("first"));
    }
}
