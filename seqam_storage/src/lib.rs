//! Storage layer primitives for sequence relations: page layout, block
//! storage, shared buffers and the write-ahead log.
#![deny(missing_docs)]

use std::fmt;

use crc32c::crc32c;
use serde::{Deserialize, Serialize};

pub mod buffer;
pub mod engine;
pub mod page;
pub mod tuple;
pub mod wal;

pub use engine::{Result, StorageError};

/// Size of every relation block (bytes).
pub const PAGE_SIZE: usize = 8192;

/// Object identifier shared by catalog rows and relation files.
pub type Oid = u32;

/// Physical file number of a relation; changes on every rewrite.
pub type RelFileNumber = u32;

/// Block index inside a relation fork.
pub type BlockNumber = u32;

/// Position in the write-ahead log. Records are stamped with the offset one
/// past their last byte.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Position before any record was written.
    pub const INVALID: Lsn = Lsn(0);

    /// Whether this position refers to a written record.
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:08X}", self.0 >> 32, self.0 as u32)
    }
}

/// Physical identity of a relation's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RelFileLocator {
    /// Tablespace.
    pub spc_oid: Oid,
    /// Database.
    pub db_oid: Oid,
    /// Relation file number.
    pub rel_number: RelFileNumber,
}

impl RelFileLocator {
    /// Encoded size in WAL records.
    pub const ENCODED_LEN: usize = 12;

    /// Append the little-endian encoding to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.spc_oid.to_le_bytes());
        out.extend_from_slice(&self.db_oid.to_le_bytes());
        out.extend_from_slice(&self.rel_number.to_le_bytes());
    }

    /// Decode from the first [`Self::ENCODED_LEN`] bytes of `buf`.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let word = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Self {
            spc_oid: word(0),
            db_oid: word(4),
            rel_number: word(8),
        })
    }
}

impl fmt::Display for RelFileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc_oid, self.db_oid, self.rel_number)
    }
}

/// Relation fork. Sequences only use the main fork and, when unlogged, the
/// init fork that seeds the main fork after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ForkNumber {
    /// Regular data.
    Main = 0,
    /// Initial contents of an unlogged relation.
    Init = 3,
}

impl ForkNumber {
    /// File name suffix of the fork.
    pub fn suffix(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::Init => "_init",
        }
    }

    /// Parse a wire value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(ForkNumber::Main),
            3 => Some(ForkNumber::Init),
            _ => None,
        }
    }
}

/// Durability class of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persistence {
    /// WAL-logged, survives crashes.
    Permanent,
    /// Not WAL-logged, reset from its init fork after a crash.
    Unlogged,
    /// Session-local, discarded after a crash.
    Temp,
}

impl Persistence {
    /// Single-letter code as shown by catalogs.
    pub fn as_char(self) -> char {
        match self {
            Persistence::Permanent => 'p',
            Persistence::Unlogged => 'u',
            Persistence::Temp => 't',
        }
    }
}

/// Identity of one block of one relation fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferTag {
    /// Relation storage.
    pub locator: RelFileLocator,
    /// Fork inside the relation.
    pub fork: ForkNumber,
    /// Block inside the fork.
    pub block: BlockNumber,
}

impl BufferTag {
    /// Tag of `block` in `fork` of `locator`.
    pub fn new(locator: RelFileLocator, fork: ForkNumber, block: BlockNumber) -> Self {
        Self {
            locator,
            fork,
            block,
        }
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} blk {}", self.locator, self.fork.suffix(), self.block)
    }
}

/// Page header as stored at the start of every block (24 bytes, little endian).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageHeader {
    /// LSN of the last WAL record that touched the page.
    pub lsn: u64,
    /// Folded CRC32C of the page (computed with this field zeroed).
    pub checksum: u16,
    /// Page flag bits.
    pub flags: u16,
    /// Offset to the start of free space (end of the line pointer array).
    pub lower: u16,
    /// Offset to the end of free space (start of tuple data).
    pub upper: u16,
    /// Offset to the start of the special area.
    pub special: u16,
    /// Page size and layout version.
    pub size_version: u16,
    /// Oldest prunable xid, unused by sequences.
    pub prune_xid: u32,
}

impl PageHeader {
    /// Encoded size of the header.
    pub const SIZE: usize = 24;

    /// Byte range of the checksum inside the header.
    pub const CHECKSUM_RANGE: std::ops::Range<usize> = 8..10;

    /// Decode the header from the first [`Self::SIZE`] bytes of a page.
    pub fn read_from(page: &[u8]) -> Self {
        let u16_at = |i: usize| u16::from_le_bytes([page[i], page[i + 1]]);
        let mut lsn = [0u8; 8];
        lsn.copy_from_slice(&page[0..8]);
        let mut prune = [0u8; 4];
        prune.copy_from_slice(&page[20..24]);
        Self {
            lsn: u64::from_le_bytes(lsn),
            checksum: u16_at(8),
            flags: u16_at(10),
            lower: u16_at(12),
            upper: u16_at(14),
            special: u16_at(16),
            size_version: u16_at(18),
            prune_xid: u32::from_le_bytes(prune),
        }
    }

    /// Encode the header into the first [`Self::SIZE`] bytes of a page.
    pub fn write_to(&self, page: &mut [u8]) {
        page[0..8].copy_from_slice(&self.lsn.to_le_bytes());
        page[8..10].copy_from_slice(&self.checksum.to_le_bytes());
        page[10..12].copy_from_slice(&self.flags.to_le_bytes());
        page[12..14].copy_from_slice(&self.lower.to_le_bytes());
        page[14..16].copy_from_slice(&self.upper.to_le_bytes());
        page[16..18].copy_from_slice(&self.special.to_le_bytes());
        page[18..20].copy_from_slice(&self.size_version.to_le_bytes());
        page[20..24].copy_from_slice(&self.prune_xid.to_le_bytes());
    }
}

/// Compute CRC32C checksum for a page buffer (header `checksum` field must be zeroed).
pub fn compute_checksum(page: &[u8]) -> u16 {
    let sum = crc32c(page);
    // Fold 32-bit CRC into 16-bit value (as PostgreSQL does).
    ((sum >> 16) as u16) ^ (sum as u16)
}
