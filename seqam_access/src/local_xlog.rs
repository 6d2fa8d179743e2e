//! WAL replay and inspection for the local sequence access method.

use seqam_storage::page::Page;
use seqam_storage::wal::{WalEntry, XLogRecord};
use seqam_storage::RelFileLocator;

use crate::engine::Engine;
use crate::error::{Result, SequenceError};
use crate::local::{SEQ_LOCAL_MAGIC, XLOG_SEQ_LOCAL_LOG};
use crate::seqpage::build_page;

/// Rebuild the sequence page from the tuple image in the record.
pub fn redo(engine: &Engine, entry: &WalEntry) -> Result<()> {
    let record = &entry.record;
    if record.info != XLOG_SEQ_LOCAL_LOG {
        return Err(SequenceError::Internal(format!(
            "seq_redo: unknown op code {}",
            record.info
        )));
    }
    let block = record.block(0).ok_or_else(|| {
        SequenceError::Internal(format!("seq_redo: record at {} has no block 0", entry.start))
    })?;
    let tuple = record
        .main_data
        .get(RelFileLocator::ENCODED_LEN..)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            SequenceError::Internal(format!("seq_redo: record at {} has no tuple", entry.start))
        })?;

    // Build the page aside and copy it in, so a failure leaves the buffer
    // untouched.
    let mut page = Page::new_zeroed();
    build_page(&mut page, SEQ_LOCAL_MAGIC, tuple)?;
    page.set_lsn(entry.end);

    let mut buffer = engine
        .buffers()
        .read_buffer_extended(block.tag)?
        .lock_exclusive();
    buffer.page_mut().as_bytes_mut().copy_from_slice(page.as_bytes());
    buffer.mark_dirty();
    Ok(())
}

/// Hide the parts of a page that legitimately differ between primary and
/// replayed copies.
pub fn mask(page: &mut Page) {
    page.mask_lsn_and_checksum();
    page.mask_unused_space();
}

/// One-line description of a record.
pub fn desc(record: &XLogRecord) -> String {
    if record.info != XLOG_SEQ_LOCAL_LOG {
        return String::new();
    }
    match RelFileLocator::decode(&record.main_data) {
        Some(locator) => format!("rel {locator}"),
        None => "rel ?".to_string(),
    }
}

/// Name of a record type.
pub fn identify(info: u8) -> Option<&'static str> {
    match info {
        XLOG_SEQ_LOCAL_LOG => Some("SEQ_LOCAL_LOG"),
        _ => None,
    }
}
