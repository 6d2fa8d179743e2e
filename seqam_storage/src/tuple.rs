//! Heap tuple header codec and the visibility bits sequences care about.

use crate::{Result, StorageError};

/// Raw transaction id as stored in tuple headers.
pub type RawXid = u32;

/// No transaction.
pub const INVALID_TRANSACTION_ID: RawXid = 0;
/// Visible to every snapshot.
pub const FROZEN_TRANSACTION_ID: RawXid = 2;
/// First command of a transaction.
pub const FIRST_COMMAND_ID: u32 = 0;

/// xmin committed hint.
pub const HEAP_XMIN_COMMITTED: u16 = 0x0100;
/// xmin aborted hint.
pub const HEAP_XMIN_INVALID: u16 = 0x0200;
/// Both xmin hints set means frozen.
pub const HEAP_XMIN_FROZEN: u16 = HEAP_XMIN_COMMITTED | HEAP_XMIN_INVALID;
/// xmax committed hint.
pub const HEAP_XMAX_COMMITTED: u16 = 0x0400;
/// xmax invalid hint.
pub const HEAP_XMAX_INVALID: u16 = 0x0800;
/// xmax is a multixact.
pub const HEAP_XMAX_IS_MULTI: u16 = 0x1000;

/// Physical tuple address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemPointer {
    /// Block number.
    pub block: u32,
    /// Line pointer.
    pub offset: u16,
}

/// Fixed header in front of every heap tuple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapTupleHeader {
    /// Inserting transaction.
    pub xmin: RawXid,
    /// Deleting or locking transaction.
    pub xmax: RawXid,
    /// Command id inside the inserting transaction.
    pub cid: u32,
    /// Current tuple address.
    pub ctid: ItemPointer,
    /// Attribute count and flags.
    pub infomask2: u16,
    /// Visibility hint bits.
    pub infomask: u16,
    /// Offset of the user data.
    pub hoff: u8,
}

impl HeapTupleHeader {
    /// Encoded header size rounded up to the tuple alignment.
    pub const SIZE: usize = 24;

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.xmin.to_le_bytes());
        out.extend_from_slice(&self.xmax.to_le_bytes());
        out.extend_from_slice(&self.cid.to_le_bytes());
        out.extend_from_slice(&self.ctid.block.to_le_bytes());
        out.extend_from_slice(&self.ctid.offset.to_le_bytes());
        out.extend_from_slice(&self.infomask2.to_le_bytes());
        out.extend_from_slice(&self.infomask.to_le_bytes());
        out.push(self.hoff);
        out.push(0);
    }

    fn decode(buf: &[u8]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        Self {
            xmin: u32_at(0),
            xmax: u32_at(4),
            cid: u32_at(8),
            ctid: ItemPointer {
                block: u32_at(12),
                offset: u16_at(16),
            },
            infomask2: u16_at(18),
            infomask: u16_at(20),
            hoff: buf[22],
        }
    }

    /// Raw xmax without interpreting multixact bits.
    pub fn raw_xmax(&self) -> RawXid {
        self.xmax
    }

    /// Whether the insertion is visible to all snapshots.
    pub fn xmin_frozen(&self) -> bool {
        self.infomask & HEAP_XMIN_FROZEN == HEAP_XMIN_FROZEN
    }

    /// Forget a stray xmax left by row locking; a hint-bit style repair.
    pub fn clear_xmax(&mut self) {
        self.xmax = INVALID_TRANSACTION_ID;
        self.infomask &= !(HEAP_XMAX_COMMITTED | HEAP_XMAX_IS_MULTI);
        self.infomask |= HEAP_XMAX_INVALID;
    }
}

/// Heap tuple: header plus opaque user data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapTuple {
    /// Tuple header.
    pub header: HeapTupleHeader,
    /// Attribute payload.
    pub data: Vec<u8>,
}

impl HeapTuple {
    /// New tuple around `data` with `natts` attributes and no visibility set.
    pub fn new(data: Vec<u8>, natts: u16) -> Self {
        Self {
            header: HeapTupleHeader {
                infomask2: natts,
                hoff: HeapTupleHeader::SIZE as u8,
                ..HeapTupleHeader::default()
            },
            data,
        }
    }

    /// Mark the tuple as inserted by a frozen transaction and never deleted,
    /// placed at the first slot of block 0.
    pub fn freeze(&mut self) {
        let h = &mut self.header;
        h.xmin = FROZEN_TRANSACTION_ID;
        h.infomask |= HEAP_XMIN_FROZEN;
        h.cid = FIRST_COMMAND_ID;
        h.xmax = INVALID_TRANSACTION_ID;
        h.infomask |= HEAP_XMAX_INVALID;
        h.ctid = ItemPointer {
            block: 0,
            offset: crate::page::FIRST_OFFSET_NUMBER,
        };
    }

    /// Total encoded length.
    pub fn len(&self) -> usize {
        HeapTupleHeader::SIZE + self.data.len()
    }

    /// Whether the tuple carries no user data.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Header followed by data, as stored on a page.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse an on-page tuple.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HeapTupleHeader::SIZE {
            return Err(StorageError::InvalidTuple(format!(
                "tuple of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let header = HeapTupleHeader::decode(buf);
        let hoff = header.hoff as usize;
        if hoff < HeapTupleHeader::SIZE || hoff > buf.len() {
            return Err(StorageError::InvalidTuple(format!("bad data offset {hoff}")));
        }
        Ok(Self {
            header,
            data: buf[hoff..].to_vec(),
        })
    }

    /// Rewrite only the header of an on-page tuple.
    pub fn write_header(header: &HeapTupleHeader, buf: &mut [u8]) -> Result<()> {
        if buf.len() < HeapTupleHeader::SIZE {
            return Err(StorageError::InvalidTuple("tuple too short".into()));
        }
        let mut out = Vec::with_capacity(HeapTupleHeader::SIZE);
        header.encode_into(&mut out);
        buf[..HeapTupleHeader::SIZE].copy_from_slice(&out);
        Ok(())
    }

    /// Header of an on-page tuple.
    pub fn read_header(buf: &[u8]) -> Result<HeapTupleHeader> {
        if buf.len() < HeapTupleHeader::SIZE {
            return Err(StorageError::InvalidTuple("tuple too short".into()));
        }
        Ok(HeapTupleHeader::decode(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freeze_sets_visibility_bits() {
        let mut tuple = HeapTuple::new(vec![1, 2, 3], 3);
        tuple.header.xmax = 77;
        tuple.freeze();
        assert_eq!(tuple.header.xmin, FROZEN_TRANSACTION_ID);
        assert_eq!(tuple.header.raw_xmax(), INVALID_TRANSACTION_ID);
        assert!(tuple.header.xmin_frozen());
        assert_ne!(tuple.header.infomask & HEAP_XMAX_INVALID, 0);
        assert_eq!(tuple.header.ctid.offset, 1);
    }

    #[test]
    fn encode_decode_preserves_header_and_data() {
        let mut tuple = HeapTuple::new(vec![0xAB; 17], 3);
        tuple.freeze();
        let bytes = tuple.encode();
        assert_eq!(bytes.len(), HeapTupleHeader::SIZE + 17);
        assert_eq!(HeapTuple::decode(&bytes).unwrap(), tuple);
    }

    #[test]
    fn clear_xmax_repairs_stray_lock() {
        let mut tuple = HeapTuple::new(vec![0; 3], 2);
        tuple.freeze();
        let mut bytes = tuple.encode();
        let mut header = HeapTuple::read_header(&bytes).unwrap();
        header.xmax = 1234;
        header.infomask |= HEAP_XMAX_COMMITTED;
        header.infomask &= !HEAP_XMAX_INVALID;
        HeapTuple::write_header(&header, &mut bytes).unwrap();

        let mut stray = HeapTuple::read_header(&bytes).unwrap();
        assert_eq!(stray.raw_xmax(), 1234);
        stray.clear_xmax();
        assert_eq!(stray.raw_xmax(), INVALID_TRANSACTION_ID);
        assert_eq!(stray.infomask & HEAP_XMAX_COMMITTED, 0);
        assert_ne!(stray.infomask & HEAP_XMAX_INVALID, 0);
    }

    #[test]
    fn decode_rejects_truncated_tuple() {
        assert!(HeapTuple::decode(&[0u8; 10]).is_err());
    }
}
