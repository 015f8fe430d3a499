use thiserror::Error;

/// Primary error type for vellum storage operations.
///
/// Structured variants for the conditions callers are expected to branch on,
/// plus a fatality classification: fatal errors latch the environment into a
/// catastrophic state and every subsequent transaction fails fast until the
/// process restarts and recovers.
#[derive(Error, Debug)]
pub enum VellumError {
    /// Operation attempted on a transaction that was already disposed.
    #[error("transaction {txn_id} has been disposed")]
    TransactionDisposed { txn_id: u64 },

    /// Operation is not valid for the transaction's current state,
    /// e.g. a write operation on a read transaction or a commit after
    /// rollback. The transaction must be rolled back.
    #[error("invalid transaction operation: {detail}")]
    InvalidOperation { detail: String },

    /// A computed page number would exceed the configured storage quota.
    #[error("allocating page {page} would exceed the storage quota of {max_bytes} bytes")]
    QuotaExceeded { page: u64, max_bytes: u64 },

    /// The scratch buffer pool cannot satisfy an allocation within its
    /// configured bounds. Transient: the caller should back off and retry
    /// once readers drain.
    #[error("scratch buffer pool exhausted allocating {requested_pages} page(s)")]
    ScratchBufferFull { requested_pages: u32 },

    /// An allocation request was malformed (zero pages, oversized overflow,
    /// or a per-element sum that disagrees with the stated total).
    #[error("invalid allocation: {detail}")]
    InvalidAllocation { detail: String },

    /// A write transaction was issued an id that the journal has already
    /// recorded. Fatal: the id allocator and the journal disagree, so the
    /// environment latches catastrophic failure.
    #[error("duplicate transaction id {id}: journal already holds records up to {recorded}")]
    DuplicateTransactionId { id: u64, recorded: u64 },

    /// The environment is latched into catastrophic failure; all further
    /// transactions fail with the original cause until restart.
    #[error("storage environment in catastrophic failure: {detail}")]
    CatastrophicFailure { detail: String },

    /// On-disk state failed validation (bad magic, header mismatch,
    /// short read). Fatal.
    #[error("data store is corrupt: {detail}")]
    Corrupt { detail: String },

    /// Underlying file I/O error. Fatal for the data file and journal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl VellumError {
    /// Create an invalid-operation error.
    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::InvalidOperation {
            detail: detail.into(),
        }
    }

    /// Create an invalid-allocation error.
    pub fn invalid_allocation(detail: impl Into<String>) -> Self {
        Self::InvalidAllocation {
            detail: detail.into(),
        }
    }

    /// Create a corruption error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::Corrupt {
            detail: detail.into(),
        }
    }

    /// Create a catastrophic-failure error.
    pub fn catastrophic(detail: impl Into<String>) -> Self {
        Self::CatastrophicFailure {
            detail: detail.into(),
        }
    }

    /// Whether this error latches the environment into catastrophic failure.
    ///
    /// Fatal errors leave in-memory state unusable; non-fatal errors roll the
    /// transaction back cleanly and the environment stays healthy.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateTransactionId { .. }
                | Self::CatastrophicFailure { .. }
                | Self::Corrupt { .. }
                | Self::Io(_)
        )
    }

    /// Whether the operation may succeed if retried after backing off.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ScratchBufferFull { .. })
    }
}

/// Result type alias using [`VellumError`].
pub type Result<T> = std::result::Result<T, VellumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = VellumError::QuotaExceeded {
            page: 6,
            max_bytes: 20480,
        };
        assert_eq!(
            err.to_string(),
            "allocating page 6 would exceed the storage quota of 20480 bytes"
        );
    }

    #[test]
    fn fatal_classification() {
        assert!(VellumError::DuplicateTransactionId { id: 9, recorded: 9 }.is_fatal());
        assert!(VellumError::catastrophic("post-journal failure").is_fatal());
        assert!(VellumError::corrupt("bad magic").is_fatal());
        assert!(!VellumError::invalid("commit after rollback").is_fatal());
        assert!(
            !VellumError::ScratchBufferFull {
                requested_pages: 32
            }
            .is_fatal()
        );
    }

    #[test]
    fn transient_classification() {
        assert!(
            VellumError::ScratchBufferFull {
                requested_pages: 1
            }
            .is_transient()
        );
        assert!(!VellumError::invalid("x").is_transient());
        assert!(
            !VellumError::QuotaExceeded {
                page: 1,
                max_bytes: 4096
            }
            .is_transient()
        );
    }

    #[test]
    fn io_error_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "data file missing");
        let err: VellumError = io_err.into();
        assert!(matches!(err, VellumError::Io(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn convenience_constructors() {
        let err = VellumError::invalid("write op on read transaction");
        assert!(matches!(
            err,
            VellumError::InvalidOperation { detail } if detail == "write op on read transaction"
        ));

        let err = VellumError::invalid_allocation("zero pages requested");
        assert!(matches!(err, VellumError::InvalidAllocation { .. }));
    }
}
