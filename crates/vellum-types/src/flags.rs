//! Bitsets stamped into page and transaction headers.

bitflags::bitflags! {
    /// Page flags, stored at byte 12 of the page header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u8 {
        /// A single fixed-size page.
        const SINGLE = 1;
        /// The head of a contiguous overflow run treated as one logical page.
        const OVERFLOW = 2;
    }
}

bitflags::bitflags! {
    /// Flags for the tree layer above the page store, stored at byte 13 of
    /// the page header. Opaque to the core; carried through copy-on-write.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TreePageFlags: u8 {
        const BRANCH = 1;
        const LEAF = 2;
    }
}

bitflags::bitflags! {
    /// Marker bits recorded in the transaction header of every committed
    /// transaction in the journal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TxnMarker: u32 {
        /// The transaction reached its commit point.
        const COMMIT = 1;
        /// The commit skipped the journal fsync (lazy transaction).
        const LAZY = 2;
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::SINGLE
    }
}

impl Default for TreePageFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for TxnMarker {
    fn default() -> Self {
        Self::empty()
    }
}
