//! The transaction header written as the first page of every committed
//! transaction in the journal.

use std::fmt;

use crate::flags::TxnMarker;
use crate::{PageNumber, TxnId};

/// Marker constant at the start of every transaction header.
pub const TXN_HEADER_MARKER: u64 = u64::from_le_bytes(*b"VLMTXHDR");

/// Encoded size of a [`TransactionHeader`] in bytes. The header occupies the
/// first page of the journal entry; the remainder of that page is zero.
pub const TXN_HEADER_ENCODED_SIZE: usize = 80;

/// Commit metadata for one journalled transaction.
///
/// All fields little-endian on disk, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionHeader {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Root-catalog page before this transaction (0 = none).
    pub previous_root: PageNumber,
    /// Root-catalog page after this transaction (0 = none).
    pub new_root: PageNumber,
    /// Next page number after this transaction, published on commit.
    pub next_page_number: PageNumber,
    /// Highest page number in use after this transaction.
    pub last_page_number: PageNumber,
    /// Number of dirty pages recorded (header page excluded).
    pub page_count: u32,
    /// Payload bytes before compression.
    pub uncompressed_size: u32,
    /// Payload bytes as written. Equal to `uncompressed_size` while the
    /// journal writes pages uncompressed.
    pub compressed_size: u32,
    /// xxh64 over the payload pages, in journal order.
    pub content_hash: u64,
    /// Commit wall-clock time, microseconds since the UTC epoch.
    pub timestamp_micros: u64,
    /// Marker bits ([`TxnMarker::COMMIT`] et al.).
    pub marker: TxnMarker,
}

/// Decode failure for a transaction header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnHeaderError {
    /// Buffer shorter than [`TXN_HEADER_ENCODED_SIZE`].
    ShortBuffer { len: usize },
    /// Leading marker constant did not match.
    BadMarker { found: u64 },
}

impl fmt::Display for TxnHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortBuffer { len } => {
                write!(f, "transaction header needs {TXN_HEADER_ENCODED_SIZE} bytes, got {len}")
            }
            Self::BadMarker { found } => {
                write!(f, "bad transaction header marker: {found:#018x}")
            }
        }
    }
}

impl std::error::Error for TxnHeaderError {}

impl TransactionHeader {
    /// Encode into the first [`TXN_HEADER_ENCODED_SIZE`] bytes of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than the encoded size; the caller always
    /// hands a full page.
    pub fn encode_into(&self, buf: &mut [u8]) {
        assert!(buf.len() >= TXN_HEADER_ENCODED_SIZE);
        let mut w = FieldWriter { buf, at: 0 };
        w.u64(TXN_HEADER_MARKER);
        w.u64(self.txn_id.get());
        w.u64(self.previous_root.get());
        w.u64(self.new_root.get());
        w.u64(self.next_page_number.get());
        w.u64(self.last_page_number.get());
        w.u32(self.page_count);
        w.u32(self.uncompressed_size);
        w.u32(self.compressed_size);
        w.u64(self.content_hash);
        w.u64(self.timestamp_micros);
        w.u32(self.marker.bits());
    }

    /// Decode from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, TxnHeaderError> {
        if buf.len() < TXN_HEADER_ENCODED_SIZE {
            return Err(TxnHeaderError::ShortBuffer { len: buf.len() });
        }
        let mut r = FieldReader { buf, at: 0 };
        let marker = r.u64();
        if marker != TXN_HEADER_MARKER {
            return Err(TxnHeaderError::BadMarker { found: marker });
        }
        Ok(Self {
            txn_id: TxnId::new(r.u64()),
            previous_root: PageNumber::new(r.u64()),
            new_root: PageNumber::new(r.u64()),
            next_page_number: PageNumber::new(r.u64()),
            last_page_number: PageNumber::new(r.u64()),
            page_count: r.u32(),
            uncompressed_size: r.u32(),
            compressed_size: r.u32(),
            content_hash: r.u64(),
            timestamp_micros: r.u64(),
            marker: TxnMarker::from_bits_truncate(r.u32()),
        })
    }
}

struct FieldWriter<'a> {
    buf: &'a mut [u8],
    at: usize,
}

impl FieldWriter<'_> {
    fn u64(&mut self, v: u64) {
        self.buf[self.at..self.at + 8].copy_from_slice(&v.to_le_bytes());
        self.at += 8;
    }

    fn u32(&mut self, v: u32) {
        self.buf[self.at..self.at + 4].copy_from_slice(&v.to_le_bytes());
        self.at += 4;
    }
}

struct FieldReader<'a> {
    buf: &'a [u8],
    at: usize,
}

impl FieldReader<'_> {
    fn u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.buf[self.at..self.at + 8]);
        self.at += 8;
        u64::from_le_bytes(b)
    }

    fn u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.buf[self.at..self.at + 4]);
        self.at += 4;
        u32::from_le_bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransactionHeader {
        TransactionHeader {
            txn_id: TxnId::new(17),
            previous_root: PageNumber::new(3),
            new_root: PageNumber::new(9),
            next_page_number: PageNumber::new(128),
            last_page_number: PageNumber::new(127),
            page_count: 12,
            uncompressed_size: 12 * 4096,
            compressed_size: 12 * 4096,
            content_hash: 0xDEAD_BEEF_CAFE_F00D,
            timestamp_micros: 1_754_000_000_000_000,
            marker: TxnMarker::COMMIT,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let header = sample();
        let mut buf = vec![0u8; 4096];
        header.encode_into(&mut buf);
        let decoded = TransactionHeader::decode(&buf).expect("decodes");
        assert_eq!(decoded, header);
    }

    #[test]
    fn rejects_bad_marker() {
        let mut buf = vec![0u8; TXN_HEADER_ENCODED_SIZE];
        sample().encode_into(&mut buf);
        buf[0] ^= 0xFF;
        assert!(matches!(
            TransactionHeader::decode(&buf),
            Err(TxnHeaderError::BadMarker { .. })
        ));
    }

    #[test]
    fn rejects_short_buffer() {
        let buf = vec![0u8; TXN_HEADER_ENCODED_SIZE - 1];
        assert!(matches!(
            TransactionHeader::decode(&buf),
            Err(TxnHeaderError::ShortBuffer { .. })
        ));
    }

    #[test]
    fn marker_is_ascii_tag() {
        assert_eq!(&TXN_HEADER_MARKER.to_le_bytes(), b"VLMTXHDR");
    }

    proptest::proptest! {
        #[test]
        fn any_header_round_trips(
            txn_id in proptest::prelude::any::<u64>(),
            roots in proptest::prelude::any::<(u64, u64)>(),
            next in proptest::prelude::any::<u64>(),
            page_count in proptest::prelude::any::<u32>(),
            sizes in proptest::prelude::any::<(u32, u32)>(),
            content_hash in proptest::prelude::any::<u64>(),
            timestamp_micros in proptest::prelude::any::<u64>(),
            marker_bits in 0u32..4,
        ) {
            let header = TransactionHeader {
                txn_id: TxnId::new(txn_id),
                previous_root: PageNumber::new(roots.0),
                new_root: PageNumber::new(roots.1),
                next_page_number: PageNumber::new(next),
                last_page_number: PageNumber::new(next.saturating_sub(1)),
                page_count,
                uncompressed_size: sizes.0,
                compressed_size: sizes.1,
                content_hash,
                timestamp_micros,
                marker: TxnMarker::from_bits_truncate(marker_bits),
            };
            let mut buf = vec![0u8; TXN_HEADER_ENCODED_SIZE];
            header.encode_into(&mut buf);
            proptest::prop_assert_eq!(TransactionHeader::decode(&buf).expect("decodes"), header);
        }
    }
}
