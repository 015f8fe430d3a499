//! Environment state cloned into every transaction.

use vellum_types::{PageNumber, TxnId};

/// Header of the root catalog, carried in the environment state and in
/// every transaction header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootHeader {
    /// Page holding the serialized tree catalog, if any trees exist.
    pub catalog_page: Option<PageNumber>,
    /// Number of named trees in the catalog.
    pub tree_count: u32,
}

impl RootHeader {
    /// Catalog page encoded for headers: page 0 never holds the catalog,
    /// so 0 stands for "none".
    #[must_use]
    pub fn catalog_page_or_zero(&self) -> PageNumber {
        self.catalog_page.unwrap_or(PageNumber::ZERO)
    }
}

/// The environment's published state.
///
/// Cloned into a transaction's local state at begin; a write transaction
/// mutates its local copy and publishes it atomically on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvState {
    /// Next page number handed out when the free list is empty.
    pub next_page_number: PageNumber,
    /// Root catalog header.
    pub root: RootHeader,
    /// Id of the most recently committed write transaction.
    pub last_committed: TxnId,
}

impl EnvState {
    /// State of a freshly created store: page 0 is the environment header,
    /// user pages start at 1.
    #[must_use]
    pub fn initial() -> Self {
        Self {
            next_page_number: PageNumber::FIRST,
            root: RootHeader::default(),
            last_committed: TxnId::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let state = EnvState::initial();
        assert_eq!(state.next_page_number, PageNumber::FIRST);
        assert_eq!(state.root.catalog_page, None);
        assert_eq!(state.root.catalog_page_or_zero(), PageNumber::ZERO);
        assert_eq!(state.last_committed, TxnId::ZERO);
    }
}
