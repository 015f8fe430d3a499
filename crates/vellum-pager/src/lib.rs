//! Data-file pager and scratch buffer pool.
//!
//! Two memory-backed page sources live here:
//!
//! - [`Pager`]: the data file, grown in chunks and memory-mapped. Reads are
//!   served straight from the mapping; writes happen only when the journal
//!   flushes committed pages back into the file.
//! - [`ScratchBufferPool`]: short-lived page slots in anonymous mappings,
//!   disjoint from the data file, used for copy-on-write. Slots freed by a
//!   transaction are quarantined until every transaction that could still
//!   observe them has completed.
//!
//! Both hand out reference-counted state objects ([`PagerState`],
//! [`ScratchFile`]) that transactions pin for their lifetime, which is what
//! keeps [`vellum_types::Page`] handles valid.

mod pager;
mod scratch;

pub use pager::{Pager, PagerState};
pub use scratch::{PageFromScratch, ScratchBufferPool, ScratchFile, ScratchFileId};
