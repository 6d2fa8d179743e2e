//! Single-page, single-tuple layout shared by sequence access methods.
//!
//! Block 0 of a sequence fork holds one frozen tuple at the first item slot
//! and a 4-byte magic word in the special area identifying the access method
//! that owns the page.

use tracing::debug;

use seqam_storage::buffer::LockedBuffer;
use seqam_storage::page::{Page, FIRST_OFFSET_NUMBER};
use seqam_storage::tuple::{HeapTuple, HeapTupleHeader};
use seqam_storage::wal::{CriticalSection, RmgrId, REGBUF_FORCE_IMAGE, REGBUF_WILL_INIT};
use seqam_storage::{ForkNumber, Lsn};

use crate::error::{Result, SequenceError};
use crate::relation::Relation;

/// Size of the special area holding the magic word.
pub const SEQ_MAGIC_SIZE: usize = 4;

/// How [`init_page`] logs the freshly written page.
#[derive(Debug, Clone)]
pub enum InitLogging {
    /// No WAL.
    None,
    /// Record of `rmgr`/`info` whose payload is `prefix` followed by the
    /// encoded tuple; the block is registered as rebuilt by redo.
    Record {
        /// Resource manager.
        rmgr: RmgrId,
        /// Record type.
        info: u8,
        /// Payload preceding the tuple.
        prefix: Vec<u8>,
    },
    /// Generic record carrying a full image of the page.
    FullPageImage,
}

/// Magic word stored in the special area of `page`.
pub fn page_magic(page: &Page) -> u32 {
    let special = page.special();
    if special.len() < SEQ_MAGIC_SIZE {
        return 0;
    }
    u32::from_le_bytes([special[0], special[1], special[2], special[3]])
}

/// Rebuild `page` in place as a sequence page holding `tuple`.
pub fn build_page(page: &mut Page, magic: u32, tuple: &[u8]) -> seqam_storage::Result<()> {
    page.init(SEQ_MAGIC_SIZE);
    page.special_mut()[..SEQ_MAGIC_SIZE].copy_from_slice(&magic.to_le_bytes());
    page.add_item(tuple, FIRST_OFFSET_NUMBER)?;
    Ok(())
}

/// Extend `fork` of `rel` with block 0 and write `tuple` to it, frozen.
pub fn init_page(
    rel: &Relation<'_>,
    fork: ForkNumber,
    magic: u32,
    tuple: &mut HeapTuple,
    logging: InitLogging,
) -> Result<()> {
    let buffer = rel.extend(fork)?;
    if buffer.block_number() != 0 {
        return Err(SequenceError::Internal(format!(
            "sequence \"{}\" already has {} blocks in its {:?} fork",
            rel.name(),
            buffer.block_number(),
            fork
        )));
    }
    let mut buffer = buffer.lock_exclusive();
    tuple.freeze();
    let encoded = tuple.encode();

    // Assign the xid outside the critical section.
    if rel.needs_wal() {
        rel.txn().top_xid();
    }

    let crit = CriticalSection::enter();
    buffer.mark_dirty();
    crit.escalate(build_page(buffer.page_mut(), magic, &encoded));

    let wal = rel.engine().wal();
    let lsn = match logging {
        InitLogging::None => None,
        InitLogging::Record { rmgr, info, prefix } => {
            let mut builder = wal.begin_insert();
            builder
                .set_xid(rel.record_xid())
                .register_buffer(0, &buffer, REGBUF_WILL_INIT)
                .register_data(&prefix)
                .register_data(&encoded);
            Some(crit.escalate(builder.insert(rmgr, info)))
        }
        InitLogging::FullPageImage => {
            let mut builder = wal.begin_insert();
            builder
                .set_xid(rel.record_xid())
                .register_buffer(0, &buffer, REGBUF_FORCE_IMAGE | REGBUF_WILL_INIT);
            Some(crit.escalate(builder.insert(RmgrId::Generic, 0)))
        }
    };
    if let Some(lsn) = lsn {
        buffer.page_mut().set_lsn(lsn);
    }
    drop(crit);
    debug!(relation = rel.name(), ?fork, lsn = ?lsn, "sequence page initialized");
    Ok(())
}

/// Exclusively locked block 0 of a sequence, with its tuple validated.
pub struct SequencePage {
    buffer: LockedBuffer,
    hoff: usize,
}

impl std::fmt::Debug for SequencePage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequencePage")
            .field("tag", &self.buffer.tag())
            .field("lsn", &self.lsn())
            .finish()
    }
}

/// Lock block 0 of `rel` and check it carries `magic` and a tuple. A stray
/// xmax left by an old row lock is cleared and the page dirtied as a hint.
pub fn read_page(rel: &Relation<'_>, magic: u32) -> Result<SequencePage> {
    let mut buffer = rel.read_buffer(0)?.lock_exclusive();

    let found = page_magic(buffer.page());
    if found != magic {
        return Err(SequenceError::CorruptSequence(format!(
            "bad magic number in sequence \"{}\": {:08X}",
            rel.name(),
            found
        )));
    }
    let normal = buffer
        .page()
        .item_id(FIRST_OFFSET_NUMBER)
        .is_some_and(|id| id.is_normal());
    if !normal {
        return Err(SequenceError::CorruptSequence(format!(
            "sequence \"{}\" has no tuple in its first item slot",
            rel.name()
        )));
    }

    let item = buffer
        .page()
        .item(FIRST_OFFSET_NUMBER)
        .ok_or_else(|| SequenceError::Internal("first item vanished".into()))?;
    let mut header = HeapTuple::read_header(item)?;
    let hoff = header.hoff as usize;
    if hoff < HeapTupleHeader::SIZE || hoff > item.len() {
        return Err(SequenceError::CorruptSequence(format!(
            "sequence \"{}\" tuple has bad data offset {hoff}",
            rel.name()
        )));
    }
    if header.raw_xmax() != 0 {
        header.clear_xmax();
        let item = buffer
            .page_mut()
            .item_mut(FIRST_OFFSET_NUMBER)
            .ok_or_else(|| SequenceError::Internal("first item vanished".into()))?;
        HeapTuple::write_header(&header, item)?;
        buffer.mark_dirty_hint();
        debug!(relation = rel.name(), "cleared stale xmax on sequence tuple");
    }
    Ok(SequencePage { buffer, hoff })
}

impl SequencePage {
    fn item(&self) -> &[u8] {
        self.buffer
            .page()
            .item(FIRST_OFFSET_NUMBER)
            .unwrap_or_default()
    }

    /// Access-method data of the tuple.
    pub fn data(&self) -> &[u8] {
        &self.item()[self.hoff..]
    }

    /// Overwrite the tuple data in place.
    pub fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let hoff = self.hoff;
        let item = self
            .buffer
            .page_mut()
            .item_mut(FIRST_OFFSET_NUMBER)
            .ok_or_else(|| SequenceError::Internal("first item vanished".into()))?;
        let item_len = item.len();
        let target = item.get_mut(hoff..hoff + data.len()).ok_or_else(|| {
            SequenceError::CorruptSequence(format!(
                "sequence tuple of {item_len} bytes cannot hold {} data bytes",
                data.len()
            ))
        })?;
        target.copy_from_slice(data);
        Ok(())
    }

    /// Copy of the whole tuple.
    pub fn tuple(&self) -> Result<HeapTuple> {
        Ok(HeapTuple::decode(self.item())?)
    }

    /// Encoded tuple, header included.
    pub fn tuple_bytes(&self) -> Vec<u8> {
        self.item().to_vec()
    }

    /// Page LSN.
    pub fn lsn(&self) -> Lsn {
        self.buffer.page().lsn()
    }

    /// Stamp the page LSN.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.buffer.page_mut().set_lsn(lsn);
    }

    /// Mark the buffer dirty.
    pub fn mark_dirty(&mut self) {
        self.buffer.mark_dirty();
    }

    /// Locked buffer, for WAL registration.
    pub fn buffer(&self) -> &LockedBuffer {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_page_carries_magic_and_tuple() {
        let mut page = Page::new_zeroed();
        let mut tuple = HeapTuple::new(vec![7; 17], 3);
        tuple.freeze();
        build_page(&mut page, 0x1717, &tuple.encode()).unwrap();
        assert_eq!(page_magic(&page), 0x1717);
        let item = page.item(FIRST_OFFSET_NUMBER).unwrap();
        let decoded = HeapTuple::decode(item).unwrap();
        assert_eq!(decoded.data, vec![7; 17]);
        assert!(decoded.header.xmin_frozen());
    }

    #[test]
    fn zeroed_page_has_no_magic() {
        assert_eq!(page_magic(&Page::new_zeroed()), 0);
    }
}
