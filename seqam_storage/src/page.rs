//! Slotted page layout: header, line pointer array growing forward, tuple
//! data growing backward from the special area.

use crate::{compute_checksum, Lsn, PageHeader, PAGE_SIZE};
use crate::{Result, StorageError};

/// 1-based index into the line pointer array.
pub type OffsetNumber = u16;

/// First valid line pointer.
pub const FIRST_OFFSET_NUMBER: OffsetNumber = 1;

/// Layout version written into every initialized page.
pub const PAGE_LAYOUT_VERSION: u16 = 4;

const ITEM_ID_SIZE: usize = 4;
const MAXALIGN: usize = 8;

/// Round `len` up to the platform alignment used for tuples.
pub fn maxalign(len: usize) -> usize {
    (len + MAXALIGN - 1) & !(MAXALIGN - 1)
}

/// State of a line pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemFlags {
    /// Unused (free) slot.
    Unused,
    /// Points at a live tuple.
    Normal,
    /// HOT redirect.
    Redirect,
    /// Dead, storage may be reclaimed.
    Dead,
}

/// Decoded line pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemId {
    /// Offset of the tuple from the page start.
    pub offset: u16,
    /// Tuple length in bytes.
    pub length: u16,
    /// Line pointer state.
    pub flags: ItemFlags,
}

impl ItemId {
    fn decode(raw: u32) -> Self {
        let flags = match (raw >> 15) & 0x3 {
            0 => ItemFlags::Unused,
            1 => ItemFlags::Normal,
            2 => ItemFlags::Redirect,
            _ => ItemFlags::Dead,
        };
        Self {
            offset: (raw & 0x7FFF) as u16,
            length: (raw >> 17) as u16,
            flags,
        }
    }

    fn encode(&self) -> u32 {
        let flags = match self.flags {
            ItemFlags::Unused => 0,
            ItemFlags::Normal => 1,
            ItemFlags::Redirect => 2,
            ItemFlags::Dead => 3,
        };
        (self.offset as u32 & 0x7FFF) | (flags << 15) | ((self.length as u32) << 17)
    }

    /// Whether the pointer refers to a live tuple.
    pub fn is_normal(&self) -> bool {
        self.flags == ItemFlags::Normal && self.length > 0
    }
}

/// One block worth of bytes with slotted-page accessors.
#[derive(Clone)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("header", &self.header())
            .finish_non_exhaustive()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl Page {
    /// All-zero page, as produced by relation extension.
    pub fn new_zeroed() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Copy of raw block contents.
    pub fn from_bytes(bytes: &[u8; PAGE_SIZE]) -> Self {
        Self {
            data: Box::new(*bytes),
        }
    }

    /// Raw contents.
    pub fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Mutable raw contents.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// A page that was never initialized.
    pub fn is_new(&self) -> bool {
        self.header().upper == 0
    }

    /// Decoded header.
    pub fn header(&self) -> PageHeader {
        PageHeader::read_from(&self.data[..])
    }

    fn set_header(&mut self, header: &PageHeader) {
        header.write_to(&mut self.data[..]);
    }

    /// Reset to an empty page reserving `special_size` bytes at the end.
    pub fn init(&mut self, special_size: usize) {
        let special = PAGE_SIZE - maxalign(special_size);
        self.data.fill(0);
        self.set_header(&PageHeader {
            lsn: 0,
            checksum: 0,
            flags: 0,
            lower: PageHeader::SIZE as u16,
            upper: special as u16,
            special: special as u16,
            size_version: (PAGE_SIZE as u16) | PAGE_LAYOUT_VERSION,
            prune_xid: 0,
        });
    }

    /// LSN of the last WAL record applied to the page.
    pub fn lsn(&self) -> Lsn {
        Lsn(self.header().lsn)
    }

    /// Stamp the page with the LSN of a WAL record describing it.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[0..8].copy_from_slice(&lsn.0.to_le_bytes());
    }

    /// Special area reserved by [`Page::init`].
    pub fn special(&self) -> &[u8] {
        let start = self.header().special as usize;
        &self.data[start.min(PAGE_SIZE)..]
    }

    /// Mutable special area.
    pub fn special_mut(&mut self) -> &mut [u8] {
        let start = self.header().special as usize;
        &mut self.data[start.min(PAGE_SIZE)..]
    }

    /// Number of line pointers in use.
    pub fn max_offset_number(&self) -> OffsetNumber {
        let lower = self.header().lower as usize;
        (lower.saturating_sub(PageHeader::SIZE) / ITEM_ID_SIZE) as OffsetNumber
    }

    /// Bytes available between the line pointer array and the tuple data.
    pub fn free_space(&self) -> usize {
        let h = self.header();
        (h.upper as usize).saturating_sub(h.lower as usize)
    }

    /// Line pointer at `offnum`, if it exists.
    pub fn item_id(&self, offnum: OffsetNumber) -> Option<ItemId> {
        if offnum < FIRST_OFFSET_NUMBER || offnum > self.max_offset_number() {
            return None;
        }
        let pos = PageHeader::SIZE + (offnum as usize - 1) * ITEM_ID_SIZE;
        let raw = u32::from_le_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);
        Some(ItemId::decode(raw))
    }

    /// Tuple bytes behind a normal line pointer.
    pub fn item(&self, offnum: OffsetNumber) -> Option<&[u8]> {
        let id = self.item_id(offnum).filter(ItemId::is_normal)?;
        let (start, end) = (id.offset as usize, id.offset as usize + id.length as usize);
        self.data.get(start..end)
    }

    /// Mutable tuple bytes behind a normal line pointer.
    pub fn item_mut(&mut self, offnum: OffsetNumber) -> Option<&mut [u8]> {
        let id = self.item_id(offnum).filter(ItemId::is_normal)?;
        let (start, end) = (id.offset as usize, id.offset as usize + id.length as usize);
        self.data.get_mut(start..end)
    }

    /// Append `item` at `offnum`, which must be the next free line pointer.
    pub fn add_item(&mut self, item: &[u8], offnum: OffsetNumber) -> Result<OffsetNumber> {
        let mut h = self.header();
        if self.is_new() {
            return Err(StorageError::InvalidPage("page is not initialized".into()));
        }
        let expected = self.max_offset_number() + 1;
        if offnum != expected {
            return Err(StorageError::InvalidPage(format!(
                "invalid item offset {offnum}, next free is {expected}"
            )));
        }
        let aligned = maxalign(item.len());
        if self.free_space() < aligned + ITEM_ID_SIZE {
            return Err(StorageError::PageFull {
                needed: aligned + ITEM_ID_SIZE,
                free: self.free_space(),
            });
        }
        let upper = h.upper as usize - aligned;
        self.data[upper..upper + item.len()].copy_from_slice(item);
        let id = ItemId {
            offset: upper as u16,
            length: item.len() as u16,
            flags: ItemFlags::Normal,
        };
        let pos = h.lower as usize;
        self.data[pos..pos + ITEM_ID_SIZE].copy_from_slice(&id.encode().to_le_bytes());
        h.lower += ITEM_ID_SIZE as u16;
        h.upper = upper as u16;
        self.set_header(&h);
        Ok(offnum)
    }

    /// Recompute and store the page checksum.
    pub fn set_checksum(&mut self) {
        self.data[PageHeader::CHECKSUM_RANGE].fill(0);
        let sum = compute_checksum(&self.data[..]);
        self.data[PageHeader::CHECKSUM_RANGE].copy_from_slice(&sum.to_le_bytes());
    }

    /// Check the stored checksum. New pages carry none and always pass.
    pub fn verify_checksum(&self) -> std::result::Result<(), (u16, u16)> {
        if self.is_new() {
            return Ok(());
        }
        let stored = self.header().checksum;
        let mut copy = self.data.clone();
        copy[PageHeader::CHECKSUM_RANGE].fill(0);
        let computed = compute_checksum(&copy[..]);
        if computed == stored {
            Ok(())
        } else {
            Err((computed, stored))
        }
    }

    /// Zero the fields that legitimately differ between primary and replay.
    pub fn mask_lsn_and_checksum(&mut self) {
        self.data[0..8].fill(0);
        self.data[PageHeader::CHECKSUM_RANGE].fill(0);
    }

    /// Zero the hole between line pointers and tuple data.
    pub fn mask_unused_space(&mut self) {
        let h = self.header();
        let (lower, upper) = (h.lower as usize, h.upper as usize);
        if lower >= PageHeader::SIZE && lower <= upper && upper <= PAGE_SIZE {
            self.data[lower..upper].fill(0);
        }
    }
}
