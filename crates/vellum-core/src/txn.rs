//! The high-level transaction: a unit of work over named trees.
//!
//! A thin envelope around [`LowLevelTransaction`]. Tree roots live in the
//! root catalog, a serialized name → header table stored in its own page
//! (or overflow run) and pointed at by the environment state. On commit
//! the envelope runs registered participants, rewrites the catalog if any
//! tree changed, and delegates to the low-level commit.

use std::collections::BTreeMap;

use tracing::debug;

use vellum_error::{Result, VellumError};
use vellum_types::{PageNumber, TreePageFlags, TxnId};

use crate::low_level::{CommitStats, LowLevelTransaction, TxnKind};

/// Persistent header of one named tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    /// The tree's root page.
    pub root_page: PageNumber,
    /// Pages owned by the tree.
    pub page_count: u64,
    /// Entries stored in the tree.
    pub entry_count: u64,
}

/// A named subtree opened in a transaction.
#[derive(Debug, Clone)]
pub struct Tree {
    name: String,
    header: TreeHeader,
}

impl Tree {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn root_page(&self) -> PageNumber {
        self.header.root_page
    }

    #[must_use]
    pub fn header(&self) -> &TreeHeader {
        &self.header
    }
}

/// External module hooked into the commit sequence.
///
/// Participants run before the catalog is serialized, in registration
/// order, and may use the low-level transaction freely.
pub trait CommitParticipant: Send {
    fn prepare_for_commit(&mut self, tx: &mut LowLevelTransaction) -> Result<()>;
}

/// A high-level transaction holding the trees opened in one unit of work.
pub struct Transaction {
    ll: LowLevelTransaction,
    trees: BTreeMap<String, Tree>,
    catalog_loaded: bool,
    catalog_dirty: bool,
    participants: Vec<Box<dyn CommitParticipant>>,
}

impl Transaction {
    pub(crate) fn new(ll: LowLevelTransaction) -> Self {
        Self {
            ll,
            trees: BTreeMap::new(),
            catalog_loaded: false,
            catalog_dirty: false,
            participants: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.ll.id()
    }

    /// The underlying page-level transaction.
    #[must_use]
    pub fn low_level(&self) -> &LowLevelTransaction {
        &self.ll
    }

    /// The underlying page-level transaction, mutable.
    pub fn low_level_mut(&mut self) -> &mut LowLevelTransaction {
        &mut self.ll
    }

    /// Register an external commit participant.
    pub fn register_participant(&mut self, participant: Box<dyn CommitParticipant>) {
        self.participants.push(participant);
    }

    fn load_catalog(&mut self) -> Result<()> {
        if self.catalog_loaded {
            return Ok(());
        }
        if let Some(catalog_page) = self.ll.root_catalog_page() {
            let page = self.ll.get_page(catalog_page)?;
            self.trees = decode_catalog(page.data())?;
        }
        self.catalog_loaded = true;
        Ok(())
    }

    /// Open a named tree, or `None` if it does not exist.
    pub fn read_tree(&mut self, name: &str) -> Result<Option<&Tree>> {
        self.load_catalog()?;
        Ok(self.trees.get(name))
    }

    /// Names of every tree visible to this transaction.
    pub fn tree_names(&mut self) -> Result<Vec<String>> {
        self.load_catalog()?;
        Ok(self.trees.keys().cloned().collect())
    }

    /// Create a named tree, or open it when it already exists.
    pub fn create_tree(&mut self, name: &str) -> Result<&Tree> {
        if self.ll.kind() != TxnKind::ReadWrite {
            return Err(VellumError::invalid(format!(
                "create_tree(\"{name}\") on read transaction {}",
                self.ll.id()
            )));
        }
        self.load_catalog()?;
        if !self.trees.contains_key(name) {
            let mut root = self.ll.allocate_page(1)?;
            root.set_tree_flags(TreePageFlags::LEAF);
            let tree = Tree {
                name: name.to_owned(),
                header: TreeHeader {
                    root_page: root.page_number(),
                    page_count: 1,
                    entry_count: 0,
                },
            };
            debug!(txn = %self.ll.id(), name, root = %tree.header.root_page, "tree created");
            self.trees.insert(name.to_owned(), tree);
            self.catalog_dirty = true;
        }
        Ok(self.trees.get(name).expect("tree just ensured"))
    }

    /// Delete a named tree, freeing its root on commit. Returns whether the
    /// tree existed.
    pub fn delete_tree(&mut self, name: &str) -> Result<bool> {
        if self.ll.kind() != TxnKind::ReadWrite {
            return Err(VellumError::invalid(format!(
                "delete_tree(\"{name}\") on read transaction {}",
                self.ll.id()
            )));
        }
        self.load_catalog()?;
        let Some(tree) = self.trees.remove(name) else {
            return Ok(false);
        };
        // Deferred so reads earlier in this transaction keep resolving.
        self.ll.free_page_on_commit(tree.header.root_page)?;
        self.catalog_dirty = true;
        debug!(txn = %self.ll.id(), name, "tree deleted");
        Ok(true)
    }

    /// Rename a tree. Fails if `from` is missing or `to` exists.
    pub fn rename_tree(&mut self, from: &str, to: &str) -> Result<()> {
        if self.ll.kind() != TxnKind::ReadWrite {
            return Err(VellumError::invalid(format!(
                "rename_tree(\"{from}\") on read transaction {}",
                self.ll.id()
            )));
        }
        self.load_catalog()?;
        if self.trees.contains_key(to) {
            return Err(VellumError::invalid(format!(
                "rename target \"{to}\" already exists"
            )));
        }
        let Some(mut tree) = self.trees.remove(from) else {
            return Err(VellumError::invalid(format!(
                "rename source \"{from}\" does not exist"
            )));
        };
        tree.name = to.to_owned();
        self.trees.insert(to.to_owned(), tree);
        self.catalog_dirty = true;
        Ok(())
    }

    /// Serialize the tree catalog into a fresh page and repoint the root.
    fn write_catalog(&mut self) -> Result<()> {
        if let Some(old) = self.ll.root_catalog_page() {
            self.ll.free_page(old)?;
        }
        let tree_count = u32::try_from(self.trees.len())
            .map_err(|_| VellumError::invalid_allocation("tree catalog exceeds u32 entries"))?;
        if self.trees.is_empty() {
            self.ll.set_root_catalog(None, 0)?;
            return Ok(());
        }
        let bytes = encode_catalog(&self.trees);
        let payload = self.ll.env().page_size().payload();
        let mut page = if bytes.len() <= payload {
            self.ll.allocate_page(1)?
        } else {
            self.ll.allocate_overflow_raw_page(bytes.len() as u64)?
        };
        page.data_mut()[..bytes.len()].copy_from_slice(&bytes);
        self.ll
            .set_root_catalog(Some(page.page_number()), tree_count)?;
        Ok(())
    }

    /// Commit the unit of work: participants, catalog, low-level commit.
    pub fn commit(mut self) -> Result<CommitStats> {
        if self.ll.kind() == TxnKind::ReadWrite {
            let mut participants = std::mem::take(&mut self.participants);
            for participant in &mut participants {
                participant.prepare_for_commit(&mut self.ll)?;
            }
            if self.catalog_dirty {
                self.write_catalog()?;
            }
        }
        self.ll.commit()
    }

    /// Roll back explicitly. Dropping the transaction does the same.
    pub fn rollback(mut self) -> Result<()> {
        self.ll.rollback()
    }
}

const CATALOG_ENTRY_FIXED: usize = 2 + 8 + 8 + 8;

fn encode_catalog(trees: &BTreeMap<String, Tree>) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(
        4 + trees
            .values()
            .map(|t| CATALOG_ENTRY_FIXED + t.name.len())
            .sum::<usize>(),
    );
    bytes.extend_from_slice(
        &u32::try_from(trees.len())
            .expect("catalog size checked by caller")
            .to_le_bytes(),
    );
    for tree in trees.values() {
        let name = tree.name.as_bytes();
        bytes.extend_from_slice(
            &u16::try_from(name.len())
                .expect("tree names are short")
                .to_le_bytes(),
        );
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&tree.header.root_page.get().to_le_bytes());
        bytes.extend_from_slice(&tree.header.page_count.to_le_bytes());
        bytes.extend_from_slice(&tree.header.entry_count.to_le_bytes());
    }
    bytes
}

fn decode_catalog(data: &[u8]) -> Result<BTreeMap<String, Tree>> {
    let corrupt = || VellumError::corrupt("truncated tree catalog");
    let mut trees = BTreeMap::new();
    let count_bytes: [u8; 4] = data.get(0..4).ok_or_else(corrupt)?.try_into().expect("4");
    let count = u32::from_le_bytes(count_bytes);
    let mut at = 4usize;
    for _ in 0..count {
        let len_bytes: [u8; 2] = data
            .get(at..at + 2)
            .ok_or_else(corrupt)?
            .try_into()
            .expect("2");
        let name_len = usize::from(u16::from_le_bytes(len_bytes));
        at += 2;
        let name = std::str::from_utf8(data.get(at..at + name_len).ok_or_else(corrupt)?)
            .map_err(|_| VellumError::corrupt("tree name is not valid UTF-8"))?
            .to_owned();
        at += name_len;
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(data.get(at..at + 8).ok_or_else(corrupt)?);
        let root_page = PageNumber::new(u64::from_le_bytes(u64buf));
        at += 8;
        u64buf.copy_from_slice(data.get(at..at + 8).ok_or_else(corrupt)?);
        let page_count = u64::from_le_bytes(u64buf);
        at += 8;
        u64buf.copy_from_slice(data.get(at..at + 8).ok_or_else(corrupt)?);
        let entry_count = u64::from_le_bytes(u64buf);
        at += 8;
        trees.insert(
            name.clone(),
            Tree {
                name,
                header: TreeHeader {
                    root_page,
                    page_count,
                    entry_count,
                },
            },
        );
    }
    Ok(trees)
}
