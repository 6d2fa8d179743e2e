//! Snowflake access method callbacks.
//!
//! The tuple only keeps the 12-bit counter; time and machine id are taken
//! when a value is generated. Storage is always unlogged: after a crash the
//! counter restarts from the init fork, and the clock keeps values unique.

use std::thread;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::debug;

use seqam_access::relation::Relation;
use seqam_access::routine::{NextvalParams, SequenceAmRoutine};
use seqam_access::seqpage::{self, InitLogging, SequencePage};
use seqam_access::{Result, SequenceError};
use seqam_storage::tuple::HeapTuple;
use seqam_storage::wal::CriticalSection;
use seqam_storage::{ForkNumber, Persistence};

use crate::id::{SnowflakeId, COUNTER_MASK};
use crate::MACHINE_ID_SETTING;

/// Magic word of snowflake pages.
pub const SNOWFLAKE_MAGIC: u32 = 0x01;

const SNOWFLAKE_NATTS: u16 = 2;

/// Tuple data of a snowflake sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeData {
    /// Counter of the last generated value.
    pub count: i16,
    /// Whether a value has been generated.
    pub is_called: bool,
}

impl SnowflakeData {
    /// Encoded size.
    pub const SIZE: usize = 3;

    /// Encode as stored in the tuple.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let c = self.count.to_le_bytes();
        [c[0], c[1], self.is_called as u8]
    }

    /// Decode tuple data.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        match buf {
            [lo, hi, called, ..] => Ok(Self {
                count: i16::from_le_bytes([*lo, *hi]),
                is_called: *called != 0,
            }),
            _ => Err(SequenceError::CorruptSequence(format!(
                "snowflake tuple has {} data bytes, expected {}",
                buf.len(),
                Self::SIZE
            ))),
        }
    }
}

/// Handler registered as `snowflake_sequenceam_handler`.
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

fn counter_of(value: i64) -> i16 {
    (value as i16) & COUNTER_MASK as i16
}

fn now_ms() -> u64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64
}

fn read_snowflake(rel: &Relation<'_>) -> Result<(SequencePage, SnowflakeData)> {
    let page = seqpage::read_page(rel, SNOWFLAKE_MAGIC)?;
    let data = SnowflakeData::decode(page.data())?;
    Ok((page, data))
}

/// Only the init fork is logged, as a full page image.
fn fill_snowflake_fork(rel: &Relation<'_>, tuple: &mut HeapTuple, fork: ForkNumber) -> Result<()> {
    let logging = match fork {
        ForkNumber::Init => InitLogging::FullPageImage,
        ForkNumber::Main => InitLogging::None,
    };
    seqpage::init_page(rel, fork, SNOWFLAKE_MAGIC, tuple, logging)
}

fn fill_snowflake(rel: &Relation<'_>, tuple: &HeapTuple) -> Result<()> {
    if rel.persistence() != Persistence::Unlogged {
        return Err(SequenceError::Internal(format!(
            "snowflake sequence \"{}\" must be unlogged",
            rel.name()
        )));
    }
    fill_snowflake_fork(rel, &mut tuple.clone(), ForkNumber::Main)?;
    rel.create_init_fork()?;
    fill_snowflake_fork(rel, &mut tuple.clone(), ForkNumber::Init)?;
    rel.flush_buffers()
}

fn get_table_am() -> &'static str {
    "heap"
}

fn init(rel: &mut Relation<'_>, last_value: i64, is_called: bool) -> Result<()> {
    let data = SnowflakeData {
        count: counter_of(last_value),
        is_called,
    };
    rel.set_new_relfilenumber(Persistence::Unlogged)?;
    let tuple = HeapTuple::new(data.encode().to_vec(), SNOWFLAKE_NATTS);
    fill_snowflake(rel, &tuple)
}

fn nextval(rel: &mut Relation<'_>, _params: &NextvalParams) -> Result<(i64, i64)> {
    let machine = rel.engine().settings().get_int(MACHINE_ID_SETTING)?;
    let (mut page, data) = read_snowflake(rel)?;

    let mut count = data.count as u32 + 1;
    if count as u64 > COUNTER_MASK {
        // Counter exhausted for this millisecond: wait for the next one with
        // the page still locked.
        count = 1;
        thread::sleep(Duration::from_millis(1));
        debug!(relation = rel.name(), "snowflake counter wrapped");
    }
    let id = SnowflakeId {
        time_ms: now_ms(),
        machine: machine as u32,
        count,
    };

    let updated = SnowflakeData {
        count: count as i16,
        is_called: true,
    };
    let crit = CriticalSection::enter();
    crit.escalate(page.write_data(&updated.encode()));
    page.mark_dirty();
    drop(crit);

    let raw = id.to_raw();
    Ok((raw, raw))
}

fn setval(rel: &mut Relation<'_>, next: i64, iscalled: bool) -> Result<()> {
    let (mut page, _) = read_snowflake(rel)?;
    let updated = SnowflakeData {
        count: counter_of(next),
        is_called: iscalled,
    };
    let crit = CriticalSection::enter();
    crit.escalate(page.write_data(&updated.encode()));
    page.mark_dirty();
    drop(crit);
    Ok(())
}

fn get_state(rel: &mut Relation<'_>) -> Result<(i64, bool)> {
    let (_page, data) = read_snowflake(rel)?;
    Ok((data.count as i64, data.is_called))
}

fn reset(rel: &mut Relation<'_>, startv: i64, is_called: bool, _reset_state: bool) -> Result<()> {
    let (page, _) = read_snowflake(rel)?;
    let mut tuple = page.tuple()?;
    drop(page);

    let data = SnowflakeData {
        count: counter_of(startv),
        is_called,
    };
    tuple.data = data.encode().to_vec();
    rel.set_new_relfilenumber(rel.persistence())?;
    fill_snowflake(rel, &tuple)
}

fn change_persistence(rel: &mut Relation<'_>, persistence: Persistence) -> Result<()> {
    debug!(
        relation = rel.name(),
        requested = ?persistence,
        "snowflake storage stays unlogged"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_keeps_low_twelve_bits() {
        assert_eq!(counter_of(0), 0);
        assert_eq!(counter_of(4095), 4095);
        assert_eq!(counter_of(4096 + 7), 7);
        assert_eq!(counter_of(-1), 4095);
    }

    #[test]
    fn data_is_three_bytes() {
        let data = SnowflakeData {
            count: 4095,
            is_called: true,
        };
        assert_eq!(SnowflakeData::decode(&data.encode()).unwrap(), data);
        assert!(SnowflakeData::decode(&[1]).is_err());
    }
}
