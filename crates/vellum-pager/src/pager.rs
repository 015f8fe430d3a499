//! The data-file pager.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::MmapMut;
use parking_lot::RwLock;
use tracing::debug;

use vellum_error::{Result, VellumError};
use vellum_types::{Page, PageNumber, PageSize, TxnId};

/// One generation of the data-file mapping.
///
/// Transactions clone the `Arc<PagerState>` at begin and hold it until
/// dispose; the mapping stays valid for every outstanding [`Page`] handle
/// even after the pager remaps a grown file into a newer generation.
pub struct PagerState {
    base: NonNull<u8>,
    len: usize,
    generation: u64,
    // Keeps the mapping alive; flushed on sync.
    map: MmapMut,
}

// Safety: the mapping is owned by this state object and outlives `base`;
// concurrent access is governed by the single-writer discipline above.
unsafe impl Send for PagerState {}
unsafe impl Sync for PagerState {}

impl PagerState {
    fn new(mut map: MmapMut, generation: u64) -> Self {
        let base = NonNull::new(map.as_mut_ptr()).expect("mmap base pointer is non-null");
        let len = map.len();
        Self {
            base,
            len,
            generation,
            map,
        }
    }

    /// Mapping generation, bumped on every remap.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mapped length in bytes.
    #[must_use]
    pub fn mapped_len(&self) -> usize {
        self.len
    }

    fn page_ptr(&self, p: PageNumber, run_len: u32, page_size: PageSize) -> Option<NonNull<u8>> {
        let ps = page_size.as_usize() as u64;
        let start = p.get().checked_mul(ps)?;
        let end = start.checked_add(u64::from(run_len) * ps)?;
        if end > self.len as u64 {
            return None;
        }
        // Safety: bounds checked against the mapped length above.
        NonNull::new(unsafe { self.base.as_ptr().add(start as usize) })
    }
}

impl std::fmt::Debug for PagerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagerState")
            .field("generation", &self.generation)
            .field("mapped_len", &self.len)
            .finish_non_exhaustive()
    }
}

/// Memory-mapped pager over the data file.
pub struct Pager {
    file: File,
    path: PathBuf,
    page_size: PageSize,
    max_storage_size: Option<u64>,
    state: RwLock<Arc<PagerState>>,
}

impl Pager {
    /// Open (or create) the data file and map it.
    ///
    /// A fresh file is sized to `initial_pages` pages; an existing file is
    /// mapped at its current length.
    pub fn open(
        path: &Path,
        page_size: PageSize,
        initial_pages: u64,
        max_storage_size: Option<u64>,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            let pages = initial_pages.max(1);
            file.set_len(pages * u64::from(page_size.get()))?;
        } else if len % u64::from(page_size.get()) != 0 {
            return Err(VellumError::corrupt(format!(
                "data file length {len} is not a multiple of page size {page_size}"
            )));
        }
        // Safety: the file stays open for the pager's lifetime and is only
        // resized through `ensure_capacity`, which remaps first.
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!(path = %path.display(), mapped_len = map.len(), "data file mapped");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size,
            max_storage_size,
            state: RwLock::new(Arc::new(PagerState::new(map, 0))),
        })
    }

    /// The configured page size.
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Optional storage quota in bytes.
    #[must_use]
    pub fn max_storage_size(&self) -> Option<u64> {
        self.max_storage_size
    }

    /// Number of pages an overflow allocation of `byte_count` bytes needs.
    #[must_use]
    pub fn number_of_overflow_pages(&self, byte_count: u64) -> u64 {
        self.page_size.overflow_pages(byte_count)
    }

    /// The current mapping state. Transactions clone and hold this for
    /// their lifetime; dropping the clone releases the reference.
    #[must_use]
    pub fn state(&self) -> Arc<PagerState> {
        self.state.read().clone()
    }

    /// Read page `p` through a pinned mapping state.
    ///
    /// The returned handle covers the whole run when `p` heads an overflow
    /// run. Out-of-range page numbers are fatal: the data file is the
    /// authority on what exists, so a miss here is corruption upstream.
    pub fn read_page(&self, state: &PagerState, txn_id: TxnId, p: PageNumber) -> Result<Page> {
        let head = state.page_ptr(p, 1, self.page_size).ok_or_else(|| {
            VellumError::catastrophic(format!(
                "{txn_id} read of page {p} beyond mapped data file ({} bytes)",
                state.mapped_len()
            ))
        })?;
        // Safety: one page at `head` is in bounds per page_ptr.
        let page = unsafe { Page::from_raw(head, self.page_size, 1) };
        if !page.is_overflow() {
            return Ok(page);
        }
        let run = u32::try_from(self.number_of_overflow_pages(u64::from(page.overflow_size())))
            .map_err(|_| VellumError::corrupt(format!("overflow run at page {p} overflows u32")))?;
        let ptr = state.page_ptr(p, run.max(1), self.page_size).ok_or_else(|| {
            VellumError::catastrophic(format!(
                "{txn_id} overflow run at page {p} ({run} pages) beyond mapped data file"
            ))
        })?;
        // Safety: the full run is in bounds per page_ptr.
        Ok(unsafe { Page::from_raw(ptr, self.page_size, run.max(1)) })
    }

    /// Copy one page's raw bytes out of the file. Used for the environment
    /// header page, where no transaction state exists yet.
    pub fn read_page_bytes(&self, p: PageNumber) -> Result<Vec<u8>> {
        let state = self.state();
        let ptr = state.page_ptr(p, 1, self.page_size).ok_or_else(|| {
            VellumError::corrupt(format!("page {p} beyond mapped data file"))
        })?;
        // Safety: one page in bounds per page_ptr.
        let bytes =
            unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.page_size.as_usize()) };
        Ok(bytes.to_vec())
    }

    /// Write raw bytes at page `p`, growing the file as needed.
    ///
    /// Only the journal flusher and the environment checkpoint call this;
    /// user transactions never write the data file directly.
    pub fn write_page(&self, p: PageNumber, bytes: &[u8]) -> Result<()> {
        debug_assert!(!bytes.is_empty() && bytes.len() % self.page_size.as_usize() == 0);
        let ps = u64::from(self.page_size.get());
        let pages_needed = p.get() + (bytes.len() as u64).div_ceil(ps);
        self.ensure_capacity(pages_needed)?;
        let state = self.state();
        let ptr = state
            .page_ptr(p, 1, self.page_size)
            .ok_or_else(|| VellumError::corrupt(format!("page {p} unmapped after growth")))?;
        // Safety: ensure_capacity guarantees the target range is mapped and
        // the single flusher discipline rules out concurrent writers.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len());
        }
        Ok(())
    }

    /// Flush the mapping to disk (`msync`).
    pub fn sync(&self) -> Result<()> {
        let state = self.state.read();
        state.map.flush()?;
        Ok(())
    }

    /// Grow the file and publish a new mapping generation if `pages` do not
    /// fit the current mapping. Readers pinned to older generations are
    /// unaffected.
    pub fn ensure_capacity(&self, pages: u64) -> Result<()> {
        let needed = pages * u64::from(self.page_size.get());
        {
            let state = self.state.read();
            if needed <= state.mapped_len() as u64 {
                return Ok(());
            }
        }
        let mut state = self.state.write();
        if needed <= state.mapped_len() as u64 {
            return Ok(());
        }
        let mut new_len = (state.mapped_len() as u64).max(u64::from(self.page_size.get()));
        while new_len < needed {
            new_len *= 2;
        }
        self.file.set_len(new_len)?;
        // Safety: same contract as in open.
        let map = unsafe { MmapMut::map_mut(&self.file)? };
        let generation = state.generation() + 1;
        debug!(
            path = %self.path.display(),
            new_len,
            generation,
            "data file grown and remapped"
        );
        *state = Arc::new(PagerState::new(map, generation));
        Ok(())
    }
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("max_storage_size", &self.max_storage_size)
            .finish_non_exhaustive()
    }
}
