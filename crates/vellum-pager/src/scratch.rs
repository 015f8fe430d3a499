//! The scratch buffer pool: copy-on-write page slots in anonymous memory.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::{debug, trace};

use vellum_error::{Result, VellumError};
use vellum_types::{Page, PageNumber, PageSize, TxnId};

/// Identifies one anonymous mapping in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ScratchFileId(u32);

impl ScratchFileId {
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ScratchFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scratch#{}", self.0)
    }
}

/// A copy-on-write slot handed out by the pool.
///
/// Uniquely identifies a run of page slots in one scratch file. The
/// `previous_version` field records the logical page this slot shadows,
/// `None` for pages first allocated in the owning transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageFromScratch {
    pub file: ScratchFileId,
    pub slot: u64,
    pub run_len: u32,
    pub original_run_len: u32,
    pub previous_version: Option<PageNumber>,
}

/// One anonymous mapping backing scratch slots.
///
/// Shared as `Arc<ScratchFile>`: every transaction pins the files that
/// existed when it began, which keeps journal-published slots readable for
/// the transaction's whole snapshot lifetime.
pub struct ScratchFile {
    id: ScratchFileId,
    base: NonNull<u8>,
    num_pages: u64,
    page_size: PageSize,
    // Keeps the anonymous mapping alive.
    _map: MmapMut,
}

// Safety: the mapping is owned by this object and outlives `base`; slot
// ownership rules (one writer, quarantined reuse) govern aliasing.
unsafe impl Send for ScratchFile {}
unsafe impl Sync for ScratchFile {}

impl ScratchFile {
    fn create(id: ScratchFileId, num_pages: u64, page_size: PageSize) -> Result<Arc<Self>> {
        let len = usize::try_from(num_pages * u64::from(page_size.get()))
            .map_err(|_| VellumError::invalid_allocation("scratch file size overflows usize"))?;
        let mut map = MmapMut::map_anon(len)?;
        let base = NonNull::new(map.as_mut_ptr()).expect("anonymous mmap base is non-null");
        Ok(Arc::new(Self {
            id,
            base,
            num_pages,
            page_size,
            _map: map,
        }))
    }

    #[must_use]
    pub fn id(&self) -> ScratchFileId {
        self.id
    }

    #[must_use]
    pub fn num_pages(&self) -> u64 {
        self.num_pages
    }

    /// A page handle over `run_len` slots starting at `slot`.
    ///
    /// # Panics
    ///
    /// Debug-asserts the run is inside the file; callers hold a
    /// [`PageFromScratch`] the pool produced, which is always in bounds.
    #[must_use]
    pub fn page_at(&self, slot: u64, run_len: u32) -> Page {
        debug_assert!(slot + u64::from(run_len) <= self.num_pages);
        let offset = slot * u64::from(self.page_size.get());
        // Safety: in bounds per the pool's slot accounting.
        let ptr = unsafe {
            NonNull::new_unchecked(self.base.as_ptr().add(offset as usize))
        };
        unsafe { Page::from_raw(ptr, self.page_size, run_len) }
    }
}

impl fmt::Debug for ScratchFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchFile")
            .field("id", &self.id)
            .field("num_pages", &self.num_pages)
            .finish_non_exhaustive()
    }
}

struct QuarantinedSlot {
    file: ScratchFileId,
    slot: u64,
    run_len: u32,
    /// Latest transaction id issued when the slot was freed. The slot may
    /// be reused once the oldest active transaction id is greater.
    freed_marker: TxnId,
}

struct PoolInner {
    files: Vec<Arc<ScratchFile>>,
    /// Next unused slot in the newest file.
    bump: u64,
    /// Reusable slots bucketed by run length.
    free: BTreeMap<u32, Vec<(ScratchFileId, u64)>>,
    quarantine: Vec<QuarantinedSlot>,
    pages_in_use: u64,
}

/// Pool of copy-on-write page slots.
///
/// Internally synchronized; shared between the single writer, the journal
/// flusher, and read transactions pinning file states.
pub struct ScratchBufferPool {
    page_size: PageSize,
    file_pages: u64,
    max_files: usize,
    inner: Mutex<PoolInner>,
}

impl ScratchBufferPool {
    /// Create an empty pool. Files are mapped lazily on first allocation.
    #[must_use]
    pub fn new(page_size: PageSize, file_pages: u64, max_files: usize) -> Self {
        Self {
            page_size,
            file_pages: file_pages.max(1),
            max_files: max_files.max(1),
            inner: Mutex::new(PoolInner {
                files: Vec::new(),
                bump: 0,
                free: BTreeMap::new(),
                quarantine: Vec::new(),
                pages_in_use: 0,
            }),
        }
    }

    /// Reserve a contiguous run of `n` page slots for `owner`.
    ///
    /// Quarantined slots whose freeing marker is older than
    /// `reclaim_horizon` are recycled first; then the free buckets; then
    /// fresh space, growing the pool by one file at a time up to its
    /// configured bounds.
    pub fn allocate(
        &self,
        owner: TxnId,
        n: u32,
        reclaim_horizon: TxnId,
    ) -> Result<PageFromScratch> {
        if n == 0 {
            return Err(VellumError::invalid_allocation(
                "scratch allocation of zero pages",
            ));
        }
        if u64::from(n) > self.file_pages {
            return Err(VellumError::ScratchBufferFull { requested_pages: n });
        }
        let mut inner = self.inner.lock();
        Self::reclaim_locked(&mut inner, reclaim_horizon);

        if let Some(bucket) = inner.free.get_mut(&n) {
            if let Some((file, slot)) = bucket.pop() {
                inner.pages_in_use += u64::from(n);
                trace!(%owner, %file, slot, run_len = n, "scratch slot reused");
                return Ok(PageFromScratch {
                    file,
                    slot,
                    run_len: n,
                    original_run_len: n,
                    previous_version: None,
                });
            }
        }

        if inner.files.is_empty() || inner.bump + u64::from(n) > self.file_pages {
            if inner.files.len() >= self.max_files {
                return Err(VellumError::ScratchBufferFull { requested_pages: n });
            }
            let id = ScratchFileId::new(u32::try_from(inner.files.len()).expect("file count"));
            let file = ScratchFile::create(id, self.file_pages, self.page_size)?;
            debug!(%id, pages = self.file_pages, "scratch file mapped");
            inner.files.push(file);
            inner.bump = 0;
        }

        let file = inner.files.last().expect("at least one scratch file").id();
        let slot = inner.bump;
        inner.bump += u64::from(n);
        inner.pages_in_use += u64::from(n);
        trace!(%owner, %file, slot, run_len = n, "scratch slot allocated");
        Ok(PageFromScratch {
            file,
            slot,
            run_len: n,
            original_run_len: n,
            previous_version: None,
        })
    }

    /// A page handle for `slot`. The pool keeps all files alive, and the
    /// slot stays valid until it is freed and its quarantine drains.
    #[must_use]
    pub fn read_page(&self, slot: &PageFromScratch) -> Page {
        let inner = self.inner.lock();
        inner.files[slot.file.get() as usize].page_at(slot.slot, slot.run_len)
    }

    /// The state object backing `file`, for transactions to pin.
    #[must_use]
    pub fn file_state(&self, file: ScratchFileId) -> Option<Arc<ScratchFile>> {
        let inner = self.inner.lock();
        inner.files.get(file.get() as usize).cloned()
    }

    /// Release a slot. Physical reuse is deferred: the slot sits in
    /// quarantine until the oldest active transaction id passes
    /// `freed_marker`, because a reader whose snapshot observed the slot
    /// may dereference it until then.
    pub fn free(&self, slot: PageFromScratch, freed_marker: TxnId) {
        debug_assert_eq!(slot.run_len, slot.original_run_len);
        let mut inner = self.inner.lock();
        inner.pages_in_use = inner
            .pages_in_use
            .saturating_sub(u64::from(slot.run_len));
        trace!(%freed_marker, file = %slot.file, slot = slot.slot, run_len = slot.run_len, "scratch slot quarantined");
        inner.quarantine.push(QuarantinedSlot {
            file: slot.file,
            slot: slot.slot,
            run_len: slot.run_len,
            freed_marker,
        });
    }

    /// Move quarantined slots freed before `oldest_active` to the free
    /// buckets.
    pub fn reclaim(&self, oldest_active: TxnId) {
        let mut inner = self.inner.lock();
        Self::reclaim_locked(&mut inner, oldest_active);
    }

    fn reclaim_locked(inner: &mut PoolInner, oldest_active: TxnId) {
        let mut kept = Vec::with_capacity(inner.quarantine.len());
        for q in inner.quarantine.drain(..) {
            if q.freed_marker < oldest_active {
                inner
                    .free
                    .entry(q.run_len)
                    .or_default()
                    .push((q.file, q.slot));
            } else {
                kept.push(q);
            }
        }
        inner.quarantine = kept;
    }

    /// Split an overflow allocation of `n` pages into `n` single-page
    /// allocations in place: same bytes, new metadata.
    pub fn break_large_allocation(&self, slot: &PageFromScratch) -> Result<Vec<PageFromScratch>> {
        if slot.run_len < 2 {
            return Err(VellumError::invalid_allocation(
                "break of a single-page scratch slot",
            ));
        }
        self.ensure_mapped(slot)?;
        Ok((0..u64::from(slot.run_len))
            .map(|i| PageFromScratch {
                file: slot.file,
                slot: slot.slot + i,
                run_len: 1,
                original_run_len: 1,
                previous_version: if i == 0 { slot.previous_version } else { None },
            })
            .collect())
    }

    /// Validate that a multi-page slot is contiguously mapped. Anonymous
    /// mappings are always contiguous, so this is a bounds check.
    pub fn ensure_mapped(&self, slot: &PageFromScratch) -> Result<()> {
        let inner = self.inner.lock();
        let file = inner
            .files
            .get(slot.file.get() as usize)
            .ok_or_else(|| VellumError::corrupt(format!("unknown scratch file {}", slot.file)))?;
        if slot.slot + u64::from(slot.run_len) > file.num_pages() {
            return Err(VellumError::corrupt(format!(
                "scratch run {}+{} beyond {} of {} pages",
                slot.slot,
                slot.run_len,
                slot.file,
                file.num_pages()
            )));
        }
        Ok(())
    }

    /// Snapshot of every file's state object, for read transactions to pin
    /// at begin.
    #[must_use]
    pub fn pager_states(&self) -> HashMap<ScratchFileId, Arc<ScratchFile>> {
        let inner = self.inner.lock();
        inner.files.iter().map(|f| (f.id(), Arc::clone(f))).collect()
    }

    /// Pages currently allocated and not yet freed.
    #[must_use]
    pub fn pages_in_use(&self) -> u64 {
        self.inner.lock().pages_in_use
    }

    /// Number of mapped scratch files.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.inner.lock().files.len()
    }
}

impl fmt::Debug for ScratchBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ScratchBufferPool")
            .field("page_size", &self.page_size)
            .field("file_pages", &self.file_pages)
            .field("files", &inner.files.len())
            .field("pages_in_use", &inner.pages_in_use)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HORIZON: TxnId = TxnId::new(u64::MAX);

    fn pool() -> ScratchBufferPool {
        ScratchBufferPool::new(PageSize::DEFAULT, 64, 2)
    }

    #[test]
    fn allocate_and_write() {
        let pool = pool();
        let slot = pool.allocate(TxnId::new(1), 1, HORIZON).expect("allocate");
        let mut page = pool.read_page(&slot);
        page.data_mut().fill(0xAB);
        assert!(pool.read_page(&slot).data().iter().all(|&b| b == 0xAB));
        assert_eq!(pool.pages_in_use(), 1);
    }

    #[test]
    fn distinct_slots_do_not_alias() {
        let pool = pool();
        let a = pool.allocate(TxnId::new(1), 1, HORIZON).expect("a");
        let b = pool.allocate(TxnId::new(1), 1, HORIZON).expect("b");
        let mut pa = pool.read_page(&a);
        pa.data_mut().fill(0x11);
        let mut pb = pool.read_page(&b);
        pb.data_mut().fill(0x22);
        assert!(pool.read_page(&a).data().iter().all(|&b| b == 0x11));
    }

    #[test]
    fn quarantine_blocks_reuse_until_horizon() {
        let pool = pool();
        let slot = pool.allocate(TxnId::new(5), 1, TxnId::new(1)).expect("allocate");
        pool.free(slot, TxnId::new(5));
        assert_eq!(pool.pages_in_use(), 0);

        // Oldest active is still 5: the slot must not come back.
        let next = pool.allocate(TxnId::new(6), 1, TxnId::new(5)).expect("bump");
        assert_ne!((next.file, next.slot), (slot.file, slot.slot));

        // Horizon passed: the slot is recycled.
        let recycled = pool.allocate(TxnId::new(7), 1, TxnId::new(6)).expect("reuse");
        assert_eq!((recycled.file, recycled.slot), (slot.file, slot.slot));
    }

    #[test]
    fn pool_exhaustion() {
        let pool = ScratchBufferPool::new(PageSize::DEFAULT, 4, 1);
        for _ in 0..4 {
            pool.allocate(TxnId::new(1), 1, TxnId::new(1)).expect("fits");
        }
        let err = pool
            .allocate(TxnId::new(1), 1, TxnId::new(1))
            .expect_err("full");
        assert!(matches!(err, VellumError::ScratchBufferFull { .. }));
    }

    #[test]
    fn oversized_run_rejected() {
        let pool = ScratchBufferPool::new(PageSize::DEFAULT, 4, 1);
        let err = pool
            .allocate(TxnId::new(1), 5, TxnId::new(1))
            .expect_err("cannot ever fit");
        assert!(matches!(err, VellumError::ScratchBufferFull { .. }));
    }

    #[test]
    fn grows_second_file() {
        let pool = ScratchBufferPool::new(PageSize::DEFAULT, 2, 2);
        pool.allocate(TxnId::new(1), 2, TxnId::new(1)).expect("first file");
        pool.allocate(TxnId::new(1), 2, TxnId::new(1)).expect("second file");
        assert_eq!(pool.file_count(), 2);
    }

    #[test]
    fn break_large_allocation_preserves_bytes() {
        let pool = pool();
        let slot = pool.allocate(TxnId::new(1), 3, HORIZON).expect("run");
        let mut page = pool.read_page(&slot);
        page.raw_mut()[4096] = 0xEE; // first byte of the second physical page

        let pieces = pool.break_large_allocation(&slot).expect("split");
        assert_eq!(pieces.len(), 3);
        assert!(pieces.iter().all(|p| p.run_len == 1));
        assert_eq!(pieces[1].slot, slot.slot + 1);
        assert_eq!(pool.read_page(&pieces[1]).raw()[0], 0xEE);
        // Same pages, no accounting change.
        assert_eq!(pool.pages_in_use(), 3);
    }

    #[test]
    fn freed_run_reused_for_same_size() {
        let pool = pool();
        let run = pool.allocate(TxnId::new(1), 3, HORIZON).expect("run");
        pool.free(run, TxnId::new(1));
        let again = pool.allocate(TxnId::new(3), 3, TxnId::new(2)).expect("reuse");
        assert_eq!((again.file, again.slot), (run.file, run.slot));
    }
}
