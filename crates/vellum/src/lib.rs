//! Vellum: an embedded transactional page store.
//!
//! A single writer and any number of concurrent readers share a
//! memory-mapped data file. Writers copy pages into anonymous scratch
//! memory before touching them, commit by appending to a write-ahead
//! journal, and publish their changes atomically; readers bind an
//! immutable snapshot at begin and observe exactly the transactions that
//! committed before it, no matter what the writer does afterwards.
//!
//! ```no_run
//! use vellum::{EnvOptions, StorageEnvironment};
//!
//! # fn main() -> vellum::Result<()> {
//! let env = StorageEnvironment::open(EnvOptions::new("/tmp/db"))?;
//! let mut tx = env.write_transaction()?;
//! let mut page = tx.allocate_page(1)?;
//! page.data_mut()[..5].copy_from_slice(b"hello");
//! tx.commit()?;
//! # Ok(())
//! # }
//! ```

pub use vellum_core::{
    AllocOptions, CommitParticipant, CommitStats, EnvOptions, EnvState, FreeSpaceHandling,
    FreeSpaceList, LowLevelTransaction, RootHeader, StorageEnvironment, Transaction, Tree,
    TreeHeader, TxnKind, TxnOutcome, TxnState, WriteTransactionPool,
};
pub use vellum_error::{Result, VellumError};
pub use vellum_journal::{Journal, JournalEntry, JournalSnapshot};
pub use vellum_pager::{PageFromScratch, Pager, PagerState, ScratchBufferPool, ScratchFile};
pub use vellum_types::{
    Page, PageFlags, PageNumber, PageSize, TransactionHeader, TreePageFlags, TxnId, TxnMarker,
    PAGE_HEADER_SIZE,
};
