//! Resource manager table and crash recovery.
//!
//! Startup replays every durable record from the redo pointer of the last
//! checkpoint, then rebuilds unlogged sequences from their init forks,
//! discards temporary ones and writes an end-of-recovery checkpoint.

use tracing::{debug, info, warn};

use seqam_catalog::RelKind;
use seqam_storage::page::Page;
use seqam_storage::wal::{read_records, RmgrId, WalEntry, WalWriter, XLogRecord};
use seqam_storage::{ForkNumber, Lsn, Persistence, RelFileLocator};
use seqam_txn::TransactionId;

use crate::engine::Engine;
use crate::error::{Result, SequenceError};
use crate::local_xlog;

/// Online checkpoint record of the XLOG manager.
pub const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
/// Storage creation record of the SMGR manager.
pub const XLOG_SMGR_CREATE: u8 = 0x10;
/// Removal of every fork of a relation.
pub const XLOG_SMGR_UNLINK: u8 = 0x30;
/// The only generic record type.
pub const XLOG_GENERIC_IMAGE: u8 = 0x00;

/// Payload of a checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Replay starts here.
    pub redo: Lsn,
    /// Next transaction id at checkpoint time.
    pub next_xid: u32,
}

impl CheckpointRecord {
    /// Encode as record payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12);
        out.extend_from_slice(&self.redo.0.to_le_bytes());
        out.extend_from_slice(&self.next_xid.to_le_bytes());
        out
    }

    /// Decode a record payload.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let redo = u64::from_le_bytes(buf.get(0..8)?.try_into().ok()?);
        let next_xid = u32::from_le_bytes(buf.get(8..12)?.try_into().ok()?);
        Some(Self {
            redo: Lsn(redo),
            next_xid,
        })
    }
}

/// Log creation of `fork` so that replay recreates the file.
pub fn log_smgr_create(
    wal: &WalWriter,
    xid: u32,
    locator: RelFileLocator,
    fork: ForkNumber,
) -> seqam_storage::Result<Lsn> {
    let mut data = Vec::with_capacity(RelFileLocator::ENCODED_LEN + 1);
    locator.encode_into(&mut data);
    data.push(fork as u8);
    let mut builder = wal.begin_insert();
    builder.set_xid(xid).register_data(&data);
    builder.insert(RmgrId::Smgr, XLOG_SMGR_CREATE)
}

/// Log removal of the storage of `locator`. Replay of earlier records may
/// recreate the files; replaying this record removes them again.
pub fn log_smgr_unlink(
    wal: &WalWriter,
    xid: u32,
    locator: RelFileLocator,
) -> seqam_storage::Result<Lsn> {
    let mut data = Vec::with_capacity(RelFileLocator::ENCODED_LEN);
    locator.encode_into(&mut data);
    let mut builder = wal.begin_insert();
    builder.set_xid(xid).register_data(&data);
    builder.insert(RmgrId::Smgr, XLOG_SMGR_UNLINK)
}

/// Callbacks of one resource manager.
pub struct RmgrData {
    /// Display name.
    pub name: &'static str,
    /// Apply a record.
    pub redo: fn(&Engine, &WalEntry) -> Result<()>,
    /// Describe a record.
    pub desc: fn(&XLogRecord) -> String,
    /// Name a record type.
    pub identify: fn(u8) -> Option<&'static str>,
    /// Mask a page before consistency comparison.
    pub mask: Option<fn(&mut Page)>,
}

static XLOG_RMGR: RmgrData = RmgrData {
    name: "XLOG",
    redo: xlog_redo,
    desc: xlog_desc,
    identify: xlog_identify,
    mask: None,
};

static SMGR_RMGR: RmgrData = RmgrData {
    name: "Storage",
    redo: smgr_redo,
    desc: smgr_desc,
    identify: smgr_identify,
    mask: None,
};

static GENERIC_RMGR: RmgrData = RmgrData {
    name: "Generic",
    redo: generic_redo,
    desc: generic_desc,
    identify: generic_identify,
    mask: Some(generic_mask),
};

static SEQ_LOCAL_RMGR: RmgrData = RmgrData {
    name: "SeqLocal",
    redo: local_xlog::redo,
    desc: local_xlog::desc,
    identify: local_xlog::identify,
    mask: Some(local_xlog::mask),
};

/// Callbacks for `id`.
pub fn rmgr(id: RmgrId) -> &'static RmgrData {
    match id {
        RmgrId::Xlog => &XLOG_RMGR,
        RmgrId::Smgr => &SMGR_RMGR,
        RmgrId::Generic => &GENERIC_RMGR,
        RmgrId::SeqLocal => &SEQ_LOCAL_RMGR,
    }
}

/// One line per record, as printed by the WAL dump tool.
pub fn describe_entry(entry: &WalEntry) -> String {
    let record = &entry.record;
    let rm = rmgr(record.rmgr);
    let kind = (rm.identify)(record.info)
        .map(str::to_string)
        .unwrap_or_else(|| format!("UNKNOWN ({:#04x})", record.info));
    format!(
        "rmgr: {:<8} len: {:>5} tx: {:>6} lsn: {} desc: {} {}",
        rm.name,
        entry.end.0 - entry.start.0,
        record.xid,
        entry.start,
        kind,
        (rm.desc)(record)
    )
}

fn xlog_redo(_engine: &Engine, _entry: &WalEntry) -> Result<()> {
    Ok(())
}

fn xlog_desc(record: &XLogRecord) -> String {
    match CheckpointRecord::decode(&record.main_data) {
        Some(cp) => format!("redo {}; next xid {}", cp.redo, cp.next_xid),
        None => String::new(),
    }
}

fn xlog_identify(info: u8) -> Option<&'static str> {
    (info == XLOG_CHECKPOINT_ONLINE).then_some("CHECKPOINT_ONLINE")
}

fn smgr_payload(record: &XLogRecord) -> Option<(RelFileLocator, ForkNumber)> {
    let locator = RelFileLocator::decode(&record.main_data)?;
    let fork = ForkNumber::from_u8(*record.main_data.get(RelFileLocator::ENCODED_LEN)?)?;
    Some((locator, fork))
}

fn malformed(entry: &WalEntry) -> SequenceError {
    SequenceError::Internal(format!("smgr_redo: malformed record at {}", entry.start))
}

fn smgr_redo(engine: &Engine, entry: &WalEntry) -> Result<()> {
    match entry.record.info {
        XLOG_SMGR_CREATE => {
            let (locator, fork) = smgr_payload(&entry.record).ok_or_else(|| malformed(entry))?;
            engine.storage().create_fork(locator, fork, true)?;
        }
        XLOG_SMGR_UNLINK => {
            let locator =
                RelFileLocator::decode(&entry.record.main_data).ok_or_else(|| malformed(entry))?;
            engine.buffers().drop_relation_buffers(locator);
            engine.storage().unlink(locator)?;
            debug!(%locator, "replayed storage removal");
        }
        other => {
            return Err(SequenceError::Internal(format!(
                "smgr_redo: unknown op code {other:#04x}"
            )))
        }
    }
    Ok(())
}

fn smgr_desc(record: &XLogRecord) -> String {
    if record.info == XLOG_SMGR_UNLINK {
        return RelFileLocator::decode(&record.main_data)
            .map(|locator| locator.to_string())
            .unwrap_or_default();
    }
    match smgr_payload(record) {
        Some((locator, fork)) => format!("{locator}{}", fork.suffix()),
        None => String::new(),
    }
}

fn smgr_identify(info: u8) -> Option<&'static str> {
    match info {
        XLOG_SMGR_CREATE => Some("CREATE"),
        XLOG_SMGR_UNLINK => Some("UNLINK"),
        _ => None,
    }
}

fn generic_redo(engine: &Engine, entry: &WalEntry) -> Result<()> {
    for block in &entry.record.blocks {
        let Some(image) = &block.image else {
            continue;
        };
        let mut buffer = engine
            .buffers()
            .read_buffer_extended(block.tag)?
            .lock_exclusive();
        let page = buffer.page_mut();
        page.as_bytes_mut().copy_from_slice(&image[..]);
        page.set_lsn(entry.end);
        buffer.mark_dirty();
    }
    Ok(())
}

fn generic_desc(record: &XLogRecord) -> String {
    record
        .blocks
        .iter()
        .map(|b| format!("blk {} {}", b.tag.block, b.tag.locator))
        .collect::<Vec<_>>()
        .join(", ")
}

fn generic_identify(info: u8) -> Option<&'static str> {
    (info == XLOG_GENERIC_IMAGE).then_some("Generic")
}

fn generic_mask(page: &mut Page) {
    page.mask_lsn_and_checksum();
    page.mask_unused_space();
}

/// What [`startup`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records replayed.
    pub records: usize,
    /// Replay started here.
    pub redo: Lsn,
    /// End of valid WAL.
    pub end: Lsn,
    /// Unlogged sequences reset from their init fork.
    pub unlogged_reset: usize,
    /// Temporary sequences discarded.
    pub temp_dropped: usize,
}

pub(crate) fn startup(engine: &Engine) -> Result<RecoveryStats> {
    let wal = engine.wal();
    let bytes = wal.durable_bytes()?;
    let (entries, end) = read_records(&bytes);
    if (end.0 as usize) < bytes.len() {
        warn!(%end, discarded = bytes.len() - end.0 as usize, "invalid record at end of WAL");
        wal.truncate_to(end)?;
    }

    let gtm = engine.txns().gtm();
    let mut redo = Lsn::INVALID;
    for entry in &entries {
        let record = &entry.record;
        if record.xid != 0 {
            gtm.advance_past(TransactionId(record.xid));
        }
        if record.rmgr == RmgrId::Xlog && record.info == XLOG_CHECKPOINT_ONLINE {
            if let Some(cp) = CheckpointRecord::decode(&record.main_data) {
                redo = cp.redo;
                gtm.advance_past(TransactionId(cp.next_xid.saturating_sub(1)));
            }
        }
    }
    wal.set_redo_ptr(redo);

    let mut stats = RecoveryStats {
        redo,
        end,
        ..RecoveryStats::default()
    };
    for entry in entries.iter().filter(|e| e.start >= redo) {
        (rmgr(entry.record.rmgr).redo)(engine, entry)?;
        stats.records += 1;
    }
    if stats.records > 0 {
        info!(%redo, %end, records = stats.records, "redo done");
    }
    engine.buffers().flush_all()?;

    let catalog = engine.catalog();
    let storage = engine.storage();
    for rel in catalog.relations_of_kind(RelKind::Sequence) {
        match rel.persistence {
            Persistence::Unlogged => {
                engine.buffers().drop_relation_buffers(rel.locator);
                if storage.fork_exists(rel.locator, ForkNumber::Init) {
                    storage.copy_fork(rel.locator, ForkNumber::Init, ForkNumber::Main)?;
                    stats.unlogged_reset += 1;
                    debug!(relation = %rel.name, "unlogged sequence reset from init fork");
                }
            }
            Persistence::Temp => {
                engine.buffers().drop_relation_buffers(rel.locator);
                storage.unlink(rel.locator)?;
                catalog.remove_relation(rel.oid);
                stats.temp_dropped += 1;
            }
            Persistence::Permanent => {}
        }
    }

    engine.checkpoint()?;
    Ok(stats)
}
