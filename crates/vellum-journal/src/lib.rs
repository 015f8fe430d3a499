//! Append-only write-ahead journal.
//!
//! Every committed write transaction is serialized as one transaction
//! header page followed by its dirty page images and appended to the
//! current journal file, then fsynced (unless the commit is lazy). The
//! journal also owns the **page translation tables**: per journal file, an
//! immutable map from logical page number to the committed scratch slot
//! holding its latest image. Read transactions clone the tables at begin
//! ([`Journal::snapshots`]) and resolve page reads through them for their
//! whole lifetime, which is what gives readers a stable snapshot while the
//! data file lags behind.
//!
//! [`Journal::apply_to_data_file`] is the background-flush half: it copies
//! committed images whose transaction id every live reader already
//! observes back into the data file, prunes the translation tables, and
//! releases the scratch slots into quarantine.

mod journal;

pub use journal::{
    Journal, JournalBatch, JournalBatchPage, JournalEntry, JournalSnapshot, JournalWrite,
};
