//! Journal file management, translation tables, and the data-file flush.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};
use xxhash_rust::xxh64::Xxh64;

use vellum_error::{Result, VellumError};
use vellum_pager::{PageFromScratch, Pager, ScratchBufferPool, ScratchFile, ScratchFileId};
use vellum_types::{Page, PageNumber, PageSize, TransactionHeader, TxnId, TxnMarker};

/// One committed page image, addressed by the scratch slot that holds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    /// The transaction that committed this image.
    pub txn_id: TxnId,
    /// Where the image lives until the flusher copies it to the data file.
    pub slot: PageFromScratch,
}

/// Immutable view of one journal file's translation table.
///
/// Cloning is cheap (two `Arc` bumps); read transactions hold a vector of
/// these for their whole lifetime.
#[derive(Debug, Clone)]
pub struct JournalSnapshot {
    file_seq: u64,
    table: Arc<HashMap<PageNumber, JournalEntry>>,
}

impl JournalSnapshot {
    /// The journal file this snapshot covers.
    #[must_use]
    pub fn file_seq(&self) -> u64 {
        self.file_seq
    }

    /// Look up the committed image of `p` in this file, if any.
    #[must_use]
    pub fn get(&self, p: PageNumber) -> Option<&JournalEntry> {
        self.table.get(&p)
    }

    /// Number of pages this file currently translates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// One dirty page handed to [`Journal::write_to_journal`].
pub struct JournalBatchPage<'a> {
    pub page_number: PageNumber,
    /// The full run bytes, header included.
    pub bytes: &'a [u8],
    /// The committed scratch slot that will serve reads until flush.
    pub slot: PageFromScratch,
}

/// A committing transaction's dirty set plus its header.
pub struct JournalBatch<'a> {
    pub txn_id: TxnId,
    /// Skip the fsync; the commit stays buffered until the next
    /// synchronous commit or rotation.
    pub lazy: bool,
    /// Latest transaction id issued at commit time. Superseded slots are
    /// quarantined with this marker.
    pub quarantine_marker: TxnId,
    pub header: TransactionHeader,
    pub pages: Vec<JournalBatchPage<'a>>,
}

/// Outcome of a journal write.
#[derive(Debug, Clone, Copy)]
pub struct JournalWrite {
    /// Physical pages appended, transaction header page included.
    pub pages_written: u64,
    /// The header as written, with sizes and content hash filled in.
    pub header: TransactionHeader,
}

struct JournalFileState {
    seq: u64,
    file: File,
    path: PathBuf,
    write_offset_pages: u64,
    table: Arc<HashMap<PageNumber, JournalEntry>>,
}

struct RetiredSlot {
    slot: PageFromScratch,
    retired_marker: TxnId,
}

struct JournalInner {
    files: Vec<JournalFileState>,
    next_seq: u64,
    /// Monotone latch: set on the first lazy commit, never cleared.
    has_lazy_transactions: bool,
    /// Pages appended to the current file since its last fsync.
    lazy_pages_pending: u64,
    max_recorded_txn: TxnId,
    /// Slots whose translation entry was overwritten by a newer commit,
    /// pending release once no snapshot can reference them.
    retired: Vec<RetiredSlot>,
    snapshot_cache: Option<Vec<JournalSnapshot>>,
}

/// The write-ahead journal.
pub struct Journal {
    dir: PathBuf,
    page_size: PageSize,
    max_file_pages: u64,
    inner: Mutex<JournalInner>,
}

impl Journal {
    /// Open the journal directory, starting a fresh file after any left
    /// over from previous runs.
    pub fn open(dir: &std::path::Path, page_size: PageSize, max_file_pages: u64) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut next_seq = 0u64;
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            if let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".journal")) {
                if let Ok(seq) = stem.parse::<u64>() {
                    next_seq = next_seq.max(seq + 1);
                }
            }
        }
        let journal = Self {
            dir: dir.to_path_buf(),
            page_size,
            max_file_pages: max_file_pages.max(2),
            inner: Mutex::new(JournalInner {
                files: Vec::new(),
                next_seq,
                has_lazy_transactions: false,
                lazy_pages_pending: 0,
                max_recorded_txn: TxnId::ZERO,
                retired: Vec::new(),
                snapshot_cache: None,
            }),
        };
        Ok(journal)
    }

    fn file_path(dir: &std::path::Path, seq: u64) -> PathBuf {
        dir.join(format!("{seq:010}.journal"))
    }

    fn open_new_file(&self, inner: &mut JournalInner) -> Result<()> {
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let path = Self::file_path(&self.dir, seq);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        debug!(seq, path = %path.display(), "journal file started");
        inner.files.push(JournalFileState {
            seq,
            file,
            path,
            write_offset_pages: 0,
            table: Arc::new(HashMap::new()),
        });
        inner.snapshot_cache = None;
        Ok(())
    }

    /// Durably record a committing transaction.
    ///
    /// Serializes the transaction header page followed by every dirty page
    /// image, appends to the current file (rotating first if the batch
    /// does not fit), and fsyncs unless the batch is lazy. After this
    /// returns the transaction is committed: the translation tables are
    /// republished so new snapshots resolve the written pages from their
    /// scratch slots.
    pub fn write_to_journal(&self, batch: JournalBatch<'_>) -> Result<JournalWrite> {
        let ps = self.page_size.as_usize();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        debug_assert!(
            batch.txn_id > inner.max_recorded_txn,
            "journal write for {} after recording {}",
            batch.txn_id,
            inner.max_recorded_txn
        );

        let payload_pages: u64 = batch
            .pages
            .iter()
            .map(|p| (p.bytes.len() as u64).div_ceil(ps as u64))
            .sum();
        let total_pages = payload_pages + 1;

        if inner.files.is_empty() {
            self.open_new_file(inner)?;
        } else {
            let current = inner.files.last().expect("journal has a current file");
            if current.write_offset_pages > 0
                && current.write_offset_pages + total_pages > self.max_file_pages
            {
                if inner.lazy_pages_pending > 0 {
                    current.file.sync_data()?;
                    inner.lazy_pages_pending = 0;
                }
                self.open_new_file(inner)?;
            }
        }

        // Finalize the header: sizes and content hash over the payload in
        // journal order. Compression is not applied at this layer, so the
        // compressed size equals the uncompressed size.
        let mut header = batch.header;
        let mut hasher = Xxh64::new(0);
        let mut payload_bytes = 0u64;
        for page in &batch.pages {
            hasher.update(page.bytes);
            payload_bytes += page.bytes.len() as u64;
        }
        header.content_hash = hasher.digest();
        header.uncompressed_size = u32::try_from(payload_bytes)
            .map_err(|_| VellumError::invalid_allocation("transaction payload exceeds 4 GiB"))?;
        header.compressed_size = header.uncompressed_size;
        header.marker |= TxnMarker::COMMIT;
        if batch.lazy {
            header.marker |= TxnMarker::LAZY;
        }

        let mut header_page = vec![0u8; ps];
        header.encode_into(&mut header_page);

        let current = inner.files.last().expect("journal has a current file");
        let mut offset = current.write_offset_pages * ps as u64;
        current.file.write_all_at(&header_page, offset)?;
        offset += ps as u64;
        for page in &batch.pages {
            current.file.write_all_at(page.bytes, offset)?;
            offset += (page.bytes.len() as u64).div_ceil(ps as u64) * ps as u64;
        }
        if batch.lazy {
            inner.lazy_pages_pending += total_pages;
            inner.has_lazy_transactions = true;
        } else {
            current.file.sync_data()?;
            inner.lazy_pages_pending = 0;
        }

        // Republish the translation table: copy, extend, swap. Snapshots
        // taken earlier keep the previous Arc untouched.
        let current = inner.files.last_mut().expect("journal has a current file");
        current.write_offset_pages += total_pages;
        let mut table: HashMap<PageNumber, JournalEntry> = (*current.table).clone();
        let mut displaced = Vec::new();
        for page in &batch.pages {
            let entry = JournalEntry {
                txn_id: batch.txn_id,
                slot: page.slot,
            };
            if let Some(old) = table.insert(page.page_number, entry) {
                displaced.push(old.slot);
            }
        }
        current.table = Arc::new(table);
        // An entry for the same page in an older file is also superseded,
        // but stays resolvable there for older snapshots; only the current
        // file's displaced slots lose their last table reference here.
        for slot in displaced {
            inner.retired.push(RetiredSlot {
                slot,
                retired_marker: batch.quarantine_marker,
            });
        }

        inner.max_recorded_txn = batch.txn_id;
        inner.snapshot_cache = None;
        debug!(
            txn = %batch.txn_id,
            pages = total_pages,
            lazy = batch.lazy,
            hash = format_args!("{:016x}", header.content_hash),
            "transaction journalled"
        );
        Ok(JournalWrite {
            pages_written: total_pages,
            header,
        })
    }

    /// Atomic snapshot of every journal file's translation table.
    #[must_use]
    pub fn snapshots(&self) -> Vec<JournalSnapshot> {
        let mut inner = self.inner.lock();
        if let Some(cache) = &inner.snapshot_cache {
            return cache.clone();
        }
        let snaps: Vec<JournalSnapshot> = inner
            .files
            .iter()
            .map(|f| JournalSnapshot {
                file_seq: f.seq,
                table: Arc::clone(&f.table),
            })
            .collect();
        inner.snapshot_cache = Some(snaps.clone());
        snaps
    }

    /// Resolve `p` through a transaction's held snapshots, newest file
    /// first. Returns the page handle into the committed scratch slot, or
    /// `None` when the page lives only in the data file.
    pub fn read_page_in(
        snapshots: &[JournalSnapshot],
        visible_to: TxnId,
        p: PageNumber,
        scratch_states: &HashMap<ScratchFileId, Arc<ScratchFile>>,
    ) -> Result<Option<Page>> {
        for snap in snapshots.iter().rev() {
            if let Some(entry) = snap.get(p) {
                if entry.txn_id > visible_to {
                    // Frozen tables cannot contain future commits; seeing
                    // one means a snapshot outlived its transaction.
                    debug_assert!(false, "snapshot holds future {}", entry.txn_id);
                    continue;
                }
                let state = scratch_states.get(&entry.slot.file).ok_or_else(|| {
                    VellumError::catastrophic(format!(
                        "journal entry for page {p} references unpinned {}",
                        entry.slot.file
                    ))
                })?;
                trace!(%p, txn = %entry.txn_id, file_seq = snap.file_seq, "page read from journal");
                return Ok(Some(state.page_at(entry.slot.slot, entry.slot.run_len)));
            }
        }
        Ok(None)
    }

    /// Whether lazy commits are still buffered without an fsync.
    #[must_use]
    pub fn has_data_in_lazy_tx_buffer(&self) -> bool {
        self.inner.lock().lazy_pages_pending > 0
    }

    /// Whether any lazy commit has ever happened (monotone latch).
    #[must_use]
    pub fn has_lazy_transactions(&self) -> bool {
        self.inner.lock().has_lazy_transactions
    }

    /// Drop the memoized snapshot view. Called after a rollback so the
    /// next snapshot acquisition rebuilds from the authoritative tables.
    pub fn update_cache_for_journal_snapshots(&self) {
        self.inner.lock().snapshot_cache = None;
    }

    /// Highest transaction id with records in any journal file.
    #[must_use]
    pub fn max_recorded_txn_id(&self) -> TxnId {
        self.inner.lock().max_recorded_txn
    }

    /// Copy committed images every live reader already observes back into
    /// the data file, then prune translation tables and release slots.
    ///
    /// `flush_horizon` is the smallest snapshot floor among active
    /// transactions: entries committed at or below it are in every live
    /// snapshot, so moving them to the data file changes no observable
    /// read. `quarantine_marker` is the latest issued transaction id;
    /// released slots stay quarantined until the oldest active id passes
    /// it.
    pub fn apply_to_data_file(
        &self,
        pager: &Pager,
        scratch: &ScratchBufferPool,
        flush_horizon: TxnId,
        quarantine_marker: TxnId,
    ) -> Result<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut applied = 0u64;
        for file in &inner.files {
            let mut entries: Vec<(&PageNumber, &JournalEntry)> = file
                .table
                .iter()
                .filter(|(_, e)| e.txn_id <= flush_horizon)
                .collect();
            // Deterministic order; later files overwrite earlier ones.
            entries.sort_by_key(|(p, _)| **p);
            for (p, entry) in entries {
                let image = scratch.read_page(&entry.slot);
                pager.write_page(*p, image.raw())?;
                applied += 1;
            }
        }
        if applied == 0 && inner.retired.is_empty() {
            return Ok(0);
        }
        pager.sync()?;

        // Nothing observable references the flushed entries any more:
        // current tables lose them (the data file now serves those reads)
        // and their slots go to quarantine.
        for file in &mut inner.files {
            if file.table.values().any(|e| e.txn_id <= flush_horizon) {
                let mut table = (*file.table).clone();
                table.retain(|_, e| {
                    if e.txn_id <= flush_horizon {
                        scratch.free(e.slot, quarantine_marker);
                        false
                    } else {
                        true
                    }
                });
                file.table = Arc::new(table);
            }
        }
        for retired in inner.retired.drain(..) {
            scratch.free(retired.slot, retired.retired_marker);
        }

        // Retire fully-pruned, non-current files.
        let file_count = inner.files.len();
        let next_seq = inner.next_seq;
        let mut removed = Vec::new();
        inner.files.retain(|f| {
            let last = f.seq + 1 == next_seq;
            let keep = last || !f.table.is_empty() || f.write_offset_pages == 0;
            if !keep {
                removed.push(f.path.clone());
            }
            keep
        });
        for path in removed {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "failed to remove retired journal file");
            }
        }
        if inner.files.len() != file_count {
            debug!(
                retired = file_count - inner.files.len(),
                "journal files retired after flush"
            );
        }

        inner.snapshot_cache = None;
        debug!(%flush_horizon, applied, "journal flushed to data file");
        Ok(applied)
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Journal")
            .field("dir", &self.dir)
            .field("files", &inner.files.len())
            .field("max_recorded_txn", &inner.max_recorded_txn)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_types::PageFlags;

    const HORIZON: TxnId = TxnId::new(u64::MAX);

    struct Fixture {
        _dir: tempfile::TempDir,
        journal: Journal,
        scratch: ScratchBufferPool,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal =
            Journal::open(&dir.path().join("journal"), PageSize::DEFAULT, 64).expect("journal");
        let scratch = ScratchBufferPool::new(PageSize::DEFAULT, 256, 4);
        Fixture {
            _dir: dir,
            journal,
            scratch,
        }
    }

    fn committed_slot(f: &Fixture, txn: TxnId, p: PageNumber, fill: u8) -> PageFromScratch {
        let slot = f.scratch.allocate(txn, 1, HORIZON).expect("slot");
        let mut page = f.scratch.read_page(&slot);
        page.zero();
        page.set_page_number(p);
        page.set_flags(PageFlags::SINGLE);
        page.data_mut().fill(fill);
        let bytes = f.scratch.read_page(&slot);
        let batch = JournalBatch {
            txn_id: txn,
            lazy: false,
            quarantine_marker: txn,
            header: TransactionHeader {
                txn_id: txn,
                page_count: 1,
                ..TransactionHeader::default()
            },
            pages: vec![JournalBatchPage {
                page_number: p,
                bytes: bytes.raw(),
                slot,
            }],
        };
        let write = f.journal.write_to_journal(batch).expect("journalled");
        assert_eq!(write.pages_written, 2);
        slot
    }

    fn states(f: &Fixture) -> HashMap<ScratchFileId, Arc<ScratchFile>> {
        f.scratch.pager_states()
    }

    #[test]
    fn snapshot_resolves_committed_page() {
        let f = fixture();
        let p = PageNumber::new(7);
        committed_slot(&f, TxnId::new(2), p, 0xAA);

        let snaps = f.journal.snapshots();
        let page = Journal::read_page_in(&snaps, TxnId::new(3), p, &states(&f))
            .expect("reads")
            .expect("found");
        assert_eq!(page.page_number(), p);
        assert!(page.data().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn snapshot_is_frozen_against_later_commits() {
        let f = fixture();
        let p = PageNumber::new(7);
        committed_slot(&f, TxnId::new(2), p, 0xAA);
        let snaps = f.journal.snapshots();

        committed_slot(&f, TxnId::new(4), p, 0xBB);

        let page = Journal::read_page_in(&snaps, TxnId::new(3), p, &states(&f))
            .expect("reads")
            .expect("found");
        assert!(page.data().iter().all(|&b| b == 0xAA));

        let fresh = f.journal.snapshots();
        let page = Journal::read_page_in(&fresh, TxnId::new(5), p, &states(&f))
            .expect("reads")
            .expect("found");
        assert!(page.data().iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn miss_returns_none() {
        let f = fixture();
        committed_slot(&f, TxnId::new(2), PageNumber::new(1), 0x01);
        let snaps = f.journal.snapshots();
        let miss = Journal::read_page_in(&snaps, TxnId::new(3), PageNumber::new(99), &states(&f))
            .expect("reads");
        assert!(miss.is_none());
    }

    #[test]
    fn lazy_buffer_latches_and_drains() {
        let f = fixture();
        let p = PageNumber::new(3);
        let txn = TxnId::new(2);
        let slot = f.scratch.allocate(txn, 1, HORIZON).expect("slot");
        let mut page = f.scratch.read_page(&slot);
        page.zero();
        page.set_page_number(p);
        let bytes = f.scratch.read_page(&slot);
        f.journal
            .write_to_journal(JournalBatch {
                txn_id: txn,
                lazy: true,
                quarantine_marker: txn,
                header: TransactionHeader::default(),
                pages: vec![JournalBatchPage {
                    page_number: p,
                    bytes: bytes.raw(),
                    slot,
                }],
            })
            .expect("lazy write");
        assert!(f.journal.has_data_in_lazy_tx_buffer());
        assert!(f.journal.has_lazy_transactions());

        committed_slot(&f, TxnId::new(3), PageNumber::new(4), 0x44);
        assert!(!f.journal.has_data_in_lazy_tx_buffer());
        // The latch stays set.
        assert!(f.journal.has_lazy_transactions());
    }

    #[test]
    fn duplicate_guard_exposes_max_recorded() {
        let f = fixture();
        assert_eq!(f.journal.max_recorded_txn_id(), TxnId::ZERO);
        committed_slot(&f, TxnId::new(9), PageNumber::new(1), 0x01);
        assert_eq!(f.journal.max_recorded_txn_id(), TxnId::new(9));
    }

    #[test]
    fn flush_moves_pages_to_data_file_and_prunes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture();
        let pager = Pager::open(
            &dir.path().join("data.vellum"),
            PageSize::DEFAULT,
            8,
            None,
        )
        .expect("pager");

        let p = PageNumber::new(2);
        committed_slot(&f, TxnId::new(2), p, 0xCC);
        let in_use_before = f.scratch.pages_in_use();

        let applied = f
            .journal
            .apply_to_data_file(&pager, &f.scratch, TxnId::new(2), TxnId::new(2))
            .expect("flush");
        assert_eq!(applied, 1);
        assert_eq!(f.scratch.pages_in_use(), in_use_before - 1);

        // The journal no longer translates the page; the data file serves it.
        let snaps = f.journal.snapshots();
        assert!(Journal::read_page_in(&snaps, TxnId::new(3), p, &states(&f))
            .expect("reads")
            .is_none());
        let state = pager.state();
        let page = pager.read_page(&state, TxnId::new(3), p).expect("data read");
        assert!(page.data().iter().all(|&b| b == 0xCC));
    }

    #[test]
    fn flush_respects_horizon() {
        let dir = tempfile::tempdir().expect("tempdir");
        let f = fixture();
        let pager = Pager::open(
            &dir.path().join("data.vellum"),
            PageSize::DEFAULT,
            8,
            None,
        )
        .expect("pager");

        committed_slot(&f, TxnId::new(2), PageNumber::new(1), 0x01);
        committed_slot(&f, TxnId::new(4), PageNumber::new(2), 0x02);

        let applied = f
            .journal
            .apply_to_data_file(&pager, &f.scratch, TxnId::new(2), TxnId::new(4))
            .expect("flush");
        assert_eq!(applied, 1);

        let snaps = f.journal.snapshots();
        assert!(
            Journal::read_page_in(&snaps, TxnId::new(5), PageNumber::new(2), &states(&f))
                .expect("reads")
                .is_some(),
            "entry above the horizon must stay in the journal"
        );
    }

    #[test]
    fn rotation_starts_new_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let journal = Journal::open(&dir.path().join("journal"), PageSize::DEFAULT, 2).expect("j");
        let scratch = ScratchBufferPool::new(PageSize::DEFAULT, 64, 2);
        for i in 0..3u64 {
            let txn = TxnId::new(i + 1);
            let p = PageNumber::new(i + 1);
            let slot = scratch.allocate(txn, 1, HORIZON).expect("slot");
            let mut page = scratch.read_page(&slot);
            page.zero();
            page.set_page_number(p);
            let bytes = scratch.read_page(&slot);
            journal
                .write_to_journal(JournalBatch {
                    txn_id: txn,
                    lazy: false,
                    quarantine_marker: txn,
                    header: TransactionHeader::default(),
                    pages: vec![JournalBatchPage {
                        page_number: p,
                        bytes: bytes.raw(),
                        slot,
                    }],
                })
                .expect("write");
        }
        // Each batch is two pages against a two-page file cap: one file per
        // batch, and every snapshot still resolves.
        let snaps = journal.snapshots();
        assert_eq!(snaps.len(), 3);
        let page = Journal::read_page_in(
            &snaps,
            TxnId::new(9),
            PageNumber::new(2),
            &scratch.pager_states(),
        )
        .expect("reads")
        .expect("found");
        assert_eq!(page.page_number(), PageNumber::new(2));
    }
}
