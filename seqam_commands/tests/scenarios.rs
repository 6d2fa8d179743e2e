mod common;

use std::sync::Arc;

use time::OffsetDateTime;

use seqam_access::local::{LocalSequenceData, SEQ_LOCAL_MAGIC};
use seqam_access::seqpage::read_page;
use seqam_access::{Relation, SequenceError};
use seqam_commands::{CreateSeqStmt, SeqOption, Session};
use seqam_config::GucSource;
use seqam_snowflake::{snowflake_get, MACHINE_ID_SETTING, SNOWFLAKE_AM_NAME};

use common::{begin, create, seq_local_records, superuser, wal_bytes, Instance};

fn bounded(cycle: bool) -> Vec<SeqOption> {
    vec![
        SeqOption::Start(1),
        SeqOption::MinValue(Some(1)),
        SeqOption::MaxValue(Some(3)),
        SeqOption::Increment(1),
        SeqOption::Cache(1),
        SeqOption::Cycle(cycle),
    ]
}

#[test]
fn ascending_sequence_stops_at_maxvalue() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", bounded(false));

    let txn = begin(&session);
    for expected in 1..=3 {
        assert_eq!(session.nextval(&txn, oid).unwrap(), expected);
    }
    let err = session.nextval(&txn, oid).unwrap_err();
    assert!(matches!(err, SequenceError::LimitExceeded(_)));
    assert_eq!(err.sqlstate(), "2200H");
    assert_eq!(err.to_string(), "nextval: reached maximum value of sequence \"s\" (3)");
}

#[test]
fn cycling_sequence_wraps_to_minvalue() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "c", bounded(true));

    let txn = begin(&session);
    let values: Vec<i64> = (0..5).map(|_| session.nextval(&txn, oid).unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3, 1, 2]);
}

#[test]
fn cached_fetch_logs_one_record_past_the_cache() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "cached", vec![SeqOption::Cache(5)]);
    let logged_at_create = seq_local_records(&wal_bytes(&inst)).len();

    let txn = begin(&session);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 1);

    let records = seq_local_records(&wal_bytes(&inst));
    assert_eq!(records.len(), logged_at_create + 1);
    let logged = records.last().unwrap();
    assert_eq!(logged.last_value, 37);
    assert!(logged.is_called);
    assert_eq!(logged.log_cnt, 0);

    let rel = Relation::sequence_open(&engine, &txn, oid, None).unwrap();
    let page = read_page(&rel, SEQ_LOCAL_MAGIC).unwrap();
    let stored = LocalSequenceData::decode(page.data()).unwrap();
    assert_eq!(stored.last_value, 5);
    assert_eq!(stored.log_cnt, 32);
    drop(page);

    // The other four values come from the session cache.
    for expected in 2..=5 {
        assert_eq!(session.nextval(&txn, oid).unwrap(), expected);
    }
    assert_eq!(seq_local_records(&wal_bytes(&inst)).len(), logged_at_create + 1);
}

#[test]
fn setval_then_currval_and_nextval() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", Vec::new());

    let txn = begin(&session);
    assert_eq!(session.setval(&txn, oid, 42).unwrap(), 42);
    assert_eq!(session.currval(&txn, oid).unwrap(), 42);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 43);
}

#[test]
fn snowflake_value_decomposes_to_time_machine_and_counter() {
    let inst = Instance::new();
    let engine = inst.start();
    engine
        .settings()
        .set(MACHINE_ID_SETTING, "5", true, GucSource::Session)
        .unwrap();
    let mut session = superuser(&engine);
    let txn = begin(&session);
    let mut stmt = CreateSeqStmt::new("flake");
    stmt.access_method = Some(SNOWFLAKE_AM_NAME.into());
    let oid = session.define_sequence(&txn, &stmt).unwrap().unwrap();

    let before = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;
    let value = session.nextval(&txn, oid).unwrap();
    let after = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as u64;

    let id = snowflake_get(value);
    assert_eq!(id.machine, 5);
    assert_eq!(id.count, 1);
    assert!(before <= id.time_ms && id.time_ms <= after);
}

#[test]
fn each_session_sees_its_own_currval_and_lastval() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut a = superuser(&engine);
    let mut b = Session::new(Arc::clone(&engine), a.user());
    let oid = create(&a, "shared", Vec::new());
    {
        let txn = begin(&a);
        a.setval(&txn, oid, 9).unwrap();
        engine.commit(txn).unwrap();
    }

    let txn_a = begin(&a);
    let txn_b = begin(&b);
    assert_eq!(a.nextval(&txn_a, oid).unwrap(), 10);
    assert_eq!(b.nextval(&txn_b, oid).unwrap(), 11);

    assert_eq!(a.currval(&txn_a, oid).unwrap(), 10);
    assert_eq!(b.currval(&txn_b, oid).unwrap(), 11);
    assert_eq!(a.lastval(&txn_a).unwrap(), 10);
    assert_eq!(b.lastval(&txn_b).unwrap(), 11);
    engine.commit(txn_a).unwrap();
    engine.commit(txn_b).unwrap();
}
