//! Write-ahead log: record format, group-commit writer, reader for
//! recovery and the per-thread critical section guard.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crc32c::crc32c;
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::buffer::LockedBuffer;
use crate::{BufferTag, ForkNumber, Lsn, RelFileLocator, Result, StorageError, PAGE_SIZE};

/// Resource manager owning a record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RmgrId {
    /// Checkpoints.
    Xlog = 0,
    /// Storage creation.
    Smgr = 2,
    /// Generic full-page images.
    Generic = 20,
    /// Local sequence access method.
    SeqLocal = 21,
}

impl RmgrId {
    /// Parse a wire value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(RmgrId::Xlog),
            2 => Some(RmgrId::Smgr),
            20 => Some(RmgrId::Generic),
            21 => Some(RmgrId::SeqLocal),
            _ => None,
        }
    }
}

/// Page will be fully rebuilt by redo; no prior contents needed.
pub const REGBUF_WILL_INIT: u8 = 0x01;
/// Include a full image of the page.
pub const REGBUF_FORCE_IMAGE: u8 = 0x02;

/// Block reference attached to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRef {
    /// Registration slot.
    pub id: u8,
    /// Block touched by the record.
    pub tag: BufferTag,
    /// Redo rebuilds the page from scratch.
    pub will_init: bool,
    /// Full page image, if one was taken.
    pub image: Option<Box<[u8; PAGE_SIZE]>>,
}

/// Decoded WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogRecord {
    /// Owning resource manager.
    pub rmgr: RmgrId,
    /// Record type inside the resource manager.
    pub info: u8,
    /// Top-level transaction that wrote the record, 0 if none.
    pub xid: u32,
    /// Insertion time, unix nanoseconds.
    pub timestamp: i128,
    /// Registered blocks.
    pub blocks: Vec<BlockRef>,
    /// Resource-manager specific payload.
    pub main_data: Vec<u8>,
}

// total_len u32 | crc u32 | rmgr u8 | info u8 | nblocks u8 | pad u8 | xid u32 | ts i128
const RECORD_HEADER_SIZE: usize = 32;
// id u8 | flags u8 | locator | fork u8 | block u32
const BLOCK_HEADER_SIZE: usize = 2 + RelFileLocator::ENCODED_LEN + 1 + 4;
const BKP_WILL_INIT: u8 = 0x01;
const BKP_HAS_IMAGE: u8 = 0x02;

impl XLogRecord {
    /// Block reference registered under `id`.
    pub fn block(&self, id: u8) -> Option<&BlockRef> {
        self.blocks.iter().find(|b| b.id == id)
    }

    /// Serialize with length prefix and CRC.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + self.main_data.len() + 4);
        out.extend_from_slice(&[0u8; 8]);
        out.push(self.rmgr as u8);
        out.push(self.info);
        out.push(self.blocks.len() as u8);
        out.push(0);
        out.extend_from_slice(&self.xid.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        for block in &self.blocks {
            let mut flags = 0;
            if block.will_init {
                flags |= BKP_WILL_INIT;
            }
            if block.image.is_some() {
                flags |= BKP_HAS_IMAGE;
            }
            out.push(block.id);
            out.push(flags);
            block.tag.locator.encode_into(&mut out);
            out.push(block.tag.fork as u8);
            out.extend_from_slice(&block.tag.block.to_le_bytes());
            if let Some(image) = &block.image {
                out.extend_from_slice(&image[..]);
            }
        }
        out.extend_from_slice(&(self.main_data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.main_data);

        let total = out.len() as u32;
        out[0..4].copy_from_slice(&total.to_le_bytes());
        let crc = crc32c(&out[8..]);
        out[4..8].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Parse one record from the front of `buf`, which starts at `start`.
    /// Returns the record and the number of bytes it occupies.
    pub fn decode(buf: &[u8], start: Lsn) -> Result<(Self, usize)> {
        let corrupt = |reason: &str| StorageError::CorruptWal {
            lsn: start,
            reason: reason.to_string(),
        };
        if buf.len() < RECORD_HEADER_SIZE {
            return Err(corrupt("truncated record header"));
        }
        let total = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if total < RECORD_HEADER_SIZE + 4 || total > buf.len() {
            return Err(corrupt("record length out of range"));
        }
        let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if crc32c(&buf[8..total]) != crc {
            return Err(corrupt("incorrect resource manager data checksum"));
        }
        let rmgr = RmgrId::from_u8(buf[8]).ok_or_else(|| corrupt("invalid resource manager id"))?;
        let info = buf[9];
        let nblocks = buf[10] as usize;
        let xid = u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);
        let mut ts = [0u8; 16];
        ts.copy_from_slice(&buf[16..32]);
        let timestamp = i128::from_le_bytes(ts);

        let mut pos = RECORD_HEADER_SIZE;
        let mut blocks = Vec::with_capacity(nblocks);
        for _ in 0..nblocks {
            if pos + BLOCK_HEADER_SIZE > total {
                return Err(corrupt("truncated block reference"));
            }
            let id = buf[pos];
            let flags = buf[pos + 1];
            let locator = RelFileLocator::decode(&buf[pos + 2..])
                .ok_or_else(|| corrupt("truncated locator"))?;
            let fork_pos = pos + 2 + RelFileLocator::ENCODED_LEN;
            let fork =
                ForkNumber::from_u8(buf[fork_pos]).ok_or_else(|| corrupt("invalid fork number"))?;
            let block = u32::from_le_bytes([
                buf[fork_pos + 1],
                buf[fork_pos + 2],
                buf[fork_pos + 3],
                buf[fork_pos + 4],
            ]);
            pos += BLOCK_HEADER_SIZE;
            let image = if flags & BKP_HAS_IMAGE != 0 {
                if pos + PAGE_SIZE > total {
                    return Err(corrupt("truncated page image"));
                }
                let mut page = Box::new([0u8; PAGE_SIZE]);
                page.copy_from_slice(&buf[pos..pos + PAGE_SIZE]);
                pos += PAGE_SIZE;
                Some(page)
            } else {
                None
            };
            blocks.push(BlockRef {
                id,
                tag: BufferTag::new(locator, fork, block),
                will_init: flags & BKP_WILL_INIT != 0,
                image,
            });
        }
        if pos + 4 > total {
            return Err(corrupt("truncated main data length"));
        }
        let len = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if pos + len != total {
            return Err(corrupt("main data length mismatch"));
        }
        let record = XLogRecord {
            rmgr,
            info,
            xid,
            timestamp,
            blocks,
            main_data: buf[pos..total].to_vec(),
        };
        Ok((record, total))
    }
}

/// A record together with its position in the stream.
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// First byte of the record.
    pub start: Lsn,
    /// One past the last byte; the LSN pages are stamped with.
    pub end: Lsn,
    /// The record.
    pub record: XLogRecord,
}

/// Parse every complete record of a WAL stream. Parsing stops at the first
/// torn or corrupt record; the second value is where valid WAL ends.
pub fn read_records(bytes: &[u8]) -> (Vec<WalEntry>, Lsn) {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        match XLogRecord::decode(&bytes[pos..], Lsn(pos as u64)) {
            Ok((record, len)) => {
                entries.push(WalEntry {
                    start: Lsn(pos as u64),
                    end: Lsn((pos + len) as u64),
                    record,
                });
                pos += len;
            }
            Err(e) => {
                tracing::debug!(error = %e, "end of valid WAL");
                break;
            }
        }
    }
    (entries, Lsn(pos as u64))
}

/// Iterate over WAL records from a file path.
pub fn iter_log<P: AsRef<Path>>(path: P) -> Result<Vec<WalEntry>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(read_records(&bytes).0)
}

enum WalSink {
    File(File),
    Memory(Arc<Mutex<Vec<u8>>>),
}

impl WalSink {
    fn write_durable(&mut self, bytes: &[u8]) -> Result<()> {
        match self {
            WalSink::File(file) => {
                file.write_all(bytes)?;
                file.sync_data()?;
            }
            WalSink::Memory(mem) => mem.lock().extend_from_slice(bytes),
        }
        Ok(())
    }
}

struct WalState {
    sink: WalSink,
    buffer: Vec<u8>,
    insert_lsn: u64,
    flushed_lsn: u64,
}

impl WalState {
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        self.sink.write_durable(&pending)?;
        self.flushed_lsn = self.insert_lsn;
        Ok(())
    }
}

/// Writer for write-ahead log with simple group commit.
pub struct WalWriter {
    state: Mutex<WalState>,
    redo_ptr: AtomicU64,
    buffer_limit: usize,
}

impl std::fmt::Debug for WalWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalWriter")
            .field("insert_lsn", &self.insert_lsn())
            .field("flushed_lsn", &self.flushed_lsn())
            .field("redo_ptr", &self.redo_ptr())
            .finish()
    }
}

impl WalWriter {
    fn with_sink(sink: WalSink, start: u64, buffer_limit: usize) -> Self {
        Self {
            state: Mutex::new(WalState {
                sink,
                buffer: Vec::with_capacity(buffer_limit),
                insert_lsn: start,
                flushed_lsn: start,
            }),
            redo_ptr: AtomicU64::new(0),
            buffer_limit,
        }
    }

    /// Open WAL file (create if not exists) at given path.
    pub fn open<P: AsRef<Path>>(path: P, buffer_limit: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::with_sink(WalSink::File(file), len, buffer_limit))
    }

    /// WAL kept in a shared in-memory vector standing in for durable media.
    pub fn in_memory(durable: Arc<Mutex<Vec<u8>>>, buffer_limit: usize) -> Self {
        let len = durable.lock().len() as u64;
        Self::with_sink(WalSink::Memory(durable), len, buffer_limit)
    }

    /// Start building a record.
    pub fn begin_insert(&self) -> RecordBuilder<'_> {
        RecordBuilder {
            wal: self,
            xid: 0,
            blocks: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Append a record, returning the LSN just past its end.
    pub fn insert(&self, mut record: XLogRecord) -> Result<Lsn> {
        record.timestamp = OffsetDateTime::now_utc().unix_timestamp_nanos();
        let bytes = record.encode();
        let mut state = self.state.lock();
        state.buffer.extend_from_slice(&bytes);
        state.insert_lsn += bytes.len() as u64;
        let lsn = Lsn(state.insert_lsn);
        tracing::trace!(rmgr = ?record.rmgr, info = record.info, %lsn, "WAL record inserted");

        if state.buffer.len() >= self.buffer_limit {
            state.flush()?;
        }
        Ok(lsn)
    }

    /// Make WAL durable at least up to `upto`.
    pub fn flush(&self, upto: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        if upto.0 <= state.flushed_lsn {
            return Ok(());
        }
        state.flush()
    }

    /// Flush everything inserted so far (group commit).
    pub fn flush_all(&self) -> Result<()> {
        self.state.lock().flush()
    }

    /// Position the next record will start at.
    pub fn insert_lsn(&self) -> Lsn {
        Lsn(self.state.lock().insert_lsn)
    }

    /// Everything before this position is durable.
    pub fn flushed_lsn(&self) -> Lsn {
        Lsn(self.state.lock().flushed_lsn)
    }

    /// Redo start of the latest checkpoint.
    pub fn redo_ptr(&self) -> Lsn {
        Lsn(self.redo_ptr.load(Ordering::Acquire))
    }

    /// Advance the redo pointer at checkpoint start.
    pub fn set_redo_ptr(&self, lsn: Lsn) {
        self.redo_ptr.fetch_max(lsn.0, Ordering::AcqRel);
    }

    /// Durable WAL contents.
    pub fn durable_bytes(&self) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        match &mut state.sink {
            WalSink::File(file) => {
                let mut reader = file.try_clone()?;
                reader.seek(SeekFrom::Start(0))?;
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
            WalSink::Memory(mem) => Ok(mem.lock().clone()),
        }
    }

    /// Discard a torn tail so new records follow the last valid one.
    pub fn truncate_to(&self, end: Lsn) -> Result<()> {
        let mut state = self.state.lock();
        state.flush()?;
        match &mut state.sink {
            WalSink::File(file) => file.set_len(end.0)?,
            WalSink::Memory(mem) => mem.lock().truncate(end.0 as usize),
        }
        state.insert_lsn = end.0;
        state.flushed_lsn = end.0;
        Ok(())
    }
}

impl Drop for WalWriter {
    fn drop(&mut self) {
        let _ = self.state.get_mut().flush();
    }
}

/// Collects block references and payload for one record, then inserts it.
pub struct RecordBuilder<'w> {
    wal: &'w WalWriter,
    xid: u32,
    blocks: Vec<BlockRef>,
    data: Vec<u8>,
}

impl RecordBuilder<'_> {
    /// Attribute the record to a transaction.
    pub fn set_xid(&mut self, xid: u32) -> &mut Self {
        self.xid = xid;
        self
    }

    /// Register a locked buffer the record modifies.
    pub fn register_buffer(&mut self, id: u8, buffer: &LockedBuffer, flags: u8) -> &mut Self {
        let image = (flags & REGBUF_FORCE_IMAGE != 0).then(|| Box::new(*buffer.page().as_bytes()));
        self.blocks.push(BlockRef {
            id,
            tag: buffer.tag(),
            will_init: flags & REGBUF_WILL_INIT != 0,
            image,
        });
        self
    }

    /// Append to the record payload.
    pub fn register_data(&mut self, data: &[u8]) -> &mut Self {
        self.data.extend_from_slice(data);
        self
    }

    /// Finalize and append the record.
    pub fn insert(self, rmgr: RmgrId, info: u8) -> Result<Lsn> {
        self.wal.insert(XLogRecord {
            rmgr,
            info,
            xid: self.xid,
            timestamp: 0,
            blocks: self.blocks,
            main_data: self.data,
        })
    }
}

thread_local! {
    static CRIT_SECTION_COUNT: Cell<u32> = const { Cell::new(0) };
}

/// Whether the current thread is inside a critical section.
pub fn in_critical_section() -> bool {
    CRIT_SECTION_COUNT.with(|c| c.get() > 0)
}

/// Marks a region where a shared buffer has been modified but its WAL
/// record is not yet inserted. Any failure inside escalates to a panic:
/// the in-memory page can no longer be trusted.
pub struct CriticalSection {
    _not_send: PhantomData<*const ()>,
}

impl CriticalSection {
    /// Enter a (possibly nested) critical section.
    pub fn enter() -> Self {
        CRIT_SECTION_COUNT.with(|c| c.set(c.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }

    /// Unwrap a result, turning an error into a panic.
    pub fn escalate<T, E: std::fmt::Display>(&self, result: std::result::Result<T, E>) -> T {
        match result {
            Ok(v) => v,
            Err(e) => panic!("PANIC: error in critical section: {e}"),
        }
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        CRIT_SECTION_COUNT.with(|c| c.set(c.get().saturating_sub(1)));
    }
}
