//! Built-in local sequence access method.
//!
//! The tuple holds `(last_value, log_cnt, is_called)`. `nextval` logs a WAL
//! record describing a state [`SEQ_LOCAL_LOG_VALS`] values ahead of what it
//! hands out, so most calls only touch the shared buffer; `log_cnt` counts
//! the values still covered by the last record. After a crash the sequence
//! resumes past everything that may have been handed out.

use tracing::{debug, trace};

use seqam_storage::tuple::HeapTuple;
use seqam_storage::wal::{CriticalSection, RmgrId, REGBUF_WILL_INIT};
use seqam_storage::{ForkNumber, Persistence, RelFileLocator};

use crate::error::{Result, SequenceError};
use crate::relation::Relation;
use crate::routine::{NextvalParams, SequenceAmRoutine};
use crate::seqpage::{self, InitLogging, SequencePage};

/// Values pre-logged beyond what a caller asked for.
pub const SEQ_LOCAL_LOG_VALS: i64 = 32;

/// Magic word of local sequence pages.
pub const SEQ_LOCAL_MAGIC: u32 = 0x1717;

/// The only record type: a full tuple image.
pub const XLOG_SEQ_LOCAL_LOG: u8 = 0x00;

/// Number of attributes of the tuple.
const SEQ_LOCAL_NATTS: u16 = 3;

/// Tuple data of a local sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSequenceData {
    /// Last value handed out, or the first to hand out when not called.
    pub last_value: i64,
    /// Values still covered by the last WAL record.
    pub log_cnt: i64,
    /// Whether `last_value` has been handed out.
    pub is_called: bool,
}

impl LocalSequenceData {
    /// Encoded size.
    pub const SIZE: usize = 17;

    /// Encode as stored in the tuple.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.last_value.to_le_bytes());
        out[8..16].copy_from_slice(&self.log_cnt.to_le_bytes());
        out[16] = self.is_called as u8;
        out
    }

    /// Decode tuple data.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(SequenceError::CorruptSequence(format!(
                "local sequence tuple has {} data bytes, expected {}",
                buf.len(),
                Self::SIZE
            )));
        }
        let mut word = [0u8; 8];
        word.copy_from_slice(&buf[0..8]);
        let last_value = i64::from_le_bytes(word);
        word.copy_from_slice(&buf[8..16]);
        let log_cnt = i64::from_le_bytes(word);
        Ok(Self {
            last_value,
            log_cnt,
            is_called: buf[16] != 0,
        })
    }

    fn to_tuple(self) -> HeapTuple {
        HeapTuple::new(self.encode().to_vec(), SEQ_LOCAL_NATTS)
    }
}

/// Handler of the built-in access method.
pub fn handler() -> Option<SequenceAmRoutine> {
    Some(SequenceAmRoutine {
        get_table_am: Some(get_table_am),
        init: Some(init),
        nextval: Some(nextval),
        setval: Some(setval),
        reset: Some(reset),
        get_state: Some(get_state),
        change_persistence: Some(change_persistence),
    })
}

fn get_table_am() -> &'static str {
    "heap"
}

fn locator_bytes(locator: RelFileLocator) -> Vec<u8> {
    let mut out = Vec::with_capacity(RelFileLocator::ENCODED_LEN);
    locator.encode_into(&mut out);
    out
}

fn read_seq_tuple(rel: &Relation<'_>) -> Result<(SequencePage, LocalSequenceData)> {
    let page = seqpage::read_page(rel, SEQ_LOCAL_MAGIC)?;
    let data = LocalSequenceData::decode(page.data())?;
    Ok((page, data))
}

/// Write `tuple` to the main fork and, for unlogged sequences, to a logged
/// init fork that seeds the main fork after a crash.
fn fill_seq_with_data(rel: &Relation<'_>, tuple: &HeapTuple) -> Result<()> {
    fill_seq_fork_with_data(rel, &mut tuple.clone(), ForkNumber::Main)?;
    if rel.persistence() == Persistence::Unlogged {
        rel.create_init_fork()?;
        fill_seq_fork_with_data(rel, &mut tuple.clone(), ForkNumber::Init)?;
        rel.flush_buffers()?;
    }
    Ok(())
}

fn fill_seq_fork_with_data(rel: &Relation<'_>, tuple: &mut HeapTuple, fork: ForkNumber) -> Result<()> {
    let logging = if rel.needs_wal() || fork == ForkNumber::Init {
        InitLogging::Record {
            rmgr: RmgrId::SeqLocal,
            info: XLOG_SEQ_LOCAL_LOG,
            prefix: locator_bytes(rel.locator()),
        }
    } else {
        InitLogging::None
    };
    seqpage::init_page(rel, fork, SEQ_LOCAL_MAGIC, tuple, logging)
}

/// Log the current tuple of `page` as a full record and stamp the page.
fn log_tuple(rel: &Relation<'_>, page: &mut SequencePage, crit: &CriticalSection) {
    let wal = rel.engine().wal();
    let mut builder = wal.begin_insert();
    builder
        .set_xid(rel.record_xid())
        .register_buffer(0, page.buffer(), REGBUF_WILL_INIT)
        .register_data(&locator_bytes(rel.locator()))
        .register_data(&page.tuple_bytes());
    let lsn = crit.escalate(builder.insert(RmgrId::SeqLocal, XLOG_SEQ_LOCAL_LOG));
    page.set_lsn(lsn);
}

fn init(rel: &mut Relation<'_>, last_value: i64, is_called: bool) -> Result<()> {
    let data = LocalSequenceData {
        last_value,
        log_cnt: 0,
        is_called,
    };
    fill_seq_with_data(rel, &data.to_tuple())
}

fn nextval(rel: &mut Relation<'_>, params: &NextvalParams) -> Result<(i64, i64)> {
    let NextvalParams {
        incby,
        maxv,
        minv,
        cache,
        cycle,
    } = *params;
    let (mut page, seq) = read_seq_tuple(rel)?;

    let mut last = seq.last_value;
    let mut next = seq.last_value;
    let mut result = seq.last_value;
    let mut fetch = cache;
    let mut log = seq.log_cnt;
    let mut rescnt = 0i64;
    let mut logit = false;

    // An uncalled sequence hands out last_value itself first.
    if !seq.is_called {
        rescnt += 1;
        fetch -= 1;
    }

    if log < fetch || !seq.is_called {
        fetch = fetch.saturating_add(SEQ_LOCAL_LOG_VALS);
        log = fetch;
        logit = true;
    } else if page.lsn() <= rel.engine().wal().redo_ptr() {
        // First change since a checkpoint: the page will not be
        // full-page-logged, so the record must restate the state.
        fetch = fetch.saturating_add(SEQ_LOCAL_LOG_VALS);
        log = fetch;
        logit = true;
    }

    while fetch > 0 {
        let room = steps_before_bound(next, incby, minv, maxv);
        let (steps, first) = if room == 0 {
            if rescnt > 0 {
                break;
            }
            if !cycle {
                let (which, bound) = if incby > 0 {
                    ("maximum", maxv)
                } else {
                    ("minimum", minv)
                };
                return Err(SequenceError::LimitExceeded(format!(
                    "nextval: reached {which} value of sequence \"{}\" ({bound})",
                    rel.name()
                )));
            }
            next = if incby > 0 { minv } else { maxv };
            fetch -= 1;
            (1, next)
        } else {
            let steps = room.min(fetch);
            let first = advance(next, incby, 1);
            next = advance(next, incby, steps);
            fetch -= steps;
            (steps, first)
        };

        let taken = steps.min(cache - rescnt);
        if taken > 0 {
            if rescnt == 0 {
                result = first;
            }
            last = advance(first, incby, taken - 1);
            log -= taken;
            rescnt += taken;
        }
    }
    // Values not fetched because a bound was hit are not logged.
    log -= fetch;
    debug_assert!(log >= 0);

    let wal_logged = logit && rel.needs_wal();
    if wal_logged {
        rel.txn().top_xid();
    }

    let crit = CriticalSection::enter();
    page.mark_dirty();
    if wal_logged {
        let logged = LocalSequenceData {
            last_value: next,
            log_cnt: 0,
            is_called: true,
        };
        crit.escalate(page.write_data(&logged.encode()));
        log_tuple(rel, &mut page, &crit);
        trace!(relation = rel.name(), logged_up_to = next, "nextval logged");
    }
    let current = LocalSequenceData {
        last_value: last,
        log_cnt: log,
        is_called: true,
    };
    crit.escalate(page.write_data(&current.encode()));
    drop(crit);
    Ok((result, last))
}

/// How many times `incby` can be added to `next` without leaving
/// `[minv, maxv]`.
fn steps_before_bound(next: i64, incby: i64, minv: i64, maxv: i64) -> i64 {
    let (next, incby) = (i128::from(next), i128::from(incby));
    let room = if incby > 0 {
        (i128::from(maxv) - next) / incby
    } else {
        (next - i128::from(minv)) / -incby
    };
    i64::try_from(room.max(0)).unwrap_or(i64::MAX)
}

/// `next + incby * steps`, for a step count already known to stay in range.
fn advance(next: i64, incby: i64, steps: i64) -> i64 {
    let value = i128::from(next) + i128::from(incby) * i128::from(steps);
    value.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

fn setval(rel: &mut Relation<'_>, next: i64, iscalled: bool) -> Result<()> {
    let (mut page, _) = read_seq_tuple(rel)?;
    let data = LocalSequenceData {
        last_value: next,
        log_cnt: 0,
        is_called: iscalled,
    };
    let crit = CriticalSection::enter();
    crit.escalate(page.write_data(&data.encode()));
    page.mark_dirty();
    if rel.needs_wal() {
        log_tuple(rel, &mut page, &crit);
    }
    drop(crit);
    Ok(())
}

fn reset(rel: &mut Relation<'_>, startv: i64, is_called: bool, reset_state: bool) -> Result<()> {
    let (page, mut data) = read_seq_tuple(rel)?;
    let mut tuple = page.tuple()?;
    drop(page);

    data.last_value = startv;
    data.is_called = is_called;
    if reset_state {
        data.log_cnt = 0;
    }
    tuple.data = data.encode().to_vec();

    rel.set_new_relfilenumber(rel.persistence())?;
    debug!(relation = rel.name(), startv, is_called, "local sequence reset");
    fill_seq_with_data(rel, &tuple)
}

fn get_state(rel: &mut Relation<'_>) -> Result<(i64, bool)> {
    let (_page, data) = read_seq_tuple(rel)?;
    Ok((data.last_value, data.is_called))
}

fn change_persistence(rel: &mut Relation<'_>, persistence: Persistence) -> Result<()> {
    let (page, _) = read_seq_tuple(rel)?;
    let tuple = page.tuple()?;
    rel.set_new_relfilenumber(persistence)?;
    fill_seq_with_data(rel, &tuple)?;
    drop(page);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_encoding_is_seventeen_bytes() {
        let data = LocalSequenceData {
            last_value: -5,
            log_cnt: 32,
            is_called: true,
        };
        let bytes = data.encode();
        assert_eq!(bytes.len(), LocalSequenceData::SIZE);
        assert_eq!(LocalSequenceData::decode(&bytes).unwrap(), data);
    }

    #[test]
    fn short_data_is_corrupt() {
        let err = LocalSequenceData::decode(&[0; 9]).unwrap_err();
        assert!(matches!(err, SequenceError::CorruptSequence(_)));
    }
}
