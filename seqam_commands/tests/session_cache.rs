mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use seqam_access::SequenceError;
use seqam_catalog::{ACL_SELECT, ACL_UPDATE, ACL_USAGE};
use seqam_commands::{AlterSeqStmt, CreateSeqStmt, SeqOption, Session};
use seqam_storage::Persistence;
use seqam_txn::TxnOptions;

use common::{begin, create, seq_local_records, superuser, wal_bytes, Instance};

#[test]
fn currval_and_lastval_need_a_prior_nextval() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", Vec::new());
    let txn = begin(&session);

    let err = session.currval(&txn, oid).unwrap_err();
    assert_eq!(
        err.to_string(),
        "currval of sequence \"s\" is not yet defined in this session"
    );
    assert_eq!(err.sqlstate(), "55000");
    let err = session.lastval(&txn).unwrap_err();
    assert_eq!(err.to_string(), "lastval is not yet defined in this session");

    assert_eq!(session.nextval(&txn, oid).unwrap(), 1);
    assert_eq!(session.currval(&txn, oid).unwrap(), 1);
    assert_eq!(session.lastval(&txn).unwrap(), 1);
}

#[test]
fn lastval_follows_the_most_recent_sequence() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let first = create(&session, "first", Vec::new());
    let second = create(&session, "second", vec![SeqOption::Start(100)]);
    let txn = begin(&session);

    session.nextval(&txn, first).unwrap();
    session.nextval(&txn, second).unwrap();
    assert_eq!(session.lastval(&txn).unwrap(), 100);
    session.nextval(&txn, first).unwrap();
    assert_eq!(session.lastval(&txn).unwrap(), 2);
}

#[test]
fn lastval_is_undefined_once_the_sequence_is_dropped() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "gone", Vec::new());

    let txn = begin(&session);
    session.nextval(&txn, oid).unwrap();
    engine.commit(txn).unwrap();

    let txn = begin(&session);
    session.drop_sequence(&txn, "gone", false).unwrap();
    engine.commit(txn).unwrap();

    let txn = begin(&session);
    assert!(matches!(
        session.lastval(&txn).unwrap_err(),
        SequenceError::NotYetDefined(_)
    ));
}

#[test]
fn names_resolve_with_or_without_schema() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    create(&session, "named", Vec::new());
    let txn = begin(&session);

    assert_eq!(session.nextval_by_name(&txn, "named").unwrap(), 1);
    assert_eq!(session.nextval_by_name(&txn, "public.named").unwrap(), 2);
    let err = session.nextval_by_name(&txn, "missing").unwrap_err();
    assert_eq!(err.to_string(), "relation \"missing\" does not exist");
    assert_eq!(err.sqlstate(), "42P01");
}

#[test]
fn setval_without_is_called_keeps_currval() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", Vec::new());
    let txn = begin(&session);

    assert_eq!(session.nextval(&txn, oid).unwrap(), 1);
    assert_eq!(session.setval3(&txn, oid, 10, false).unwrap(), 10);
    assert_eq!(session.currval(&txn, oid).unwrap(), 1);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 10);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 11);
}

#[test]
fn setval_outside_bounds_is_rejected() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", vec![SeqOption::MaxValue(Some(10))]);
    let txn = begin(&session);

    let err = session.setval(&txn, oid, 11).unwrap_err();
    assert!(matches!(err, SequenceError::OutOfBounds(_)));
    assert_eq!(err.sqlstate(), "22003");
    assert_eq!(
        err.to_string(),
        "setval: value 11 is out of bounds for sequence \"s\" (1..10)"
    );
    assert!(session.setval(&txn, oid, 0).is_err());
    assert_eq!(session.setval(&txn, oid, 10).unwrap(), 10);
}

#[test]
fn cached_values_are_served_without_touching_storage() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", vec![SeqOption::Cache(10)]);
    let txn = begin(&session);

    assert_eq!(session.nextval(&txn, oid).unwrap(), 1);
    let entry = *session.entry(oid).unwrap();
    assert_eq!((entry.last, entry.cached, entry.increment), (1, 10, 1));
    assert_eq!(session.pg_get_sequence_data(&txn, oid).unwrap(), Some((10, true)));

    for expected in 2..=10 {
        assert_eq!(session.nextval(&txn, oid).unwrap(), expected);
    }
    assert_eq!(session.pg_get_sequence_data(&txn, oid).unwrap(), Some((10, true)));
    assert_eq!(session.nextval(&txn, oid).unwrap(), 11);
    assert_eq!(session.pg_get_sequence_data(&txn, oid).unwrap(), Some((20, true)));
}

#[test]
fn largest_cache_reserves_the_whole_range() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", vec![SeqOption::Cache(i64::MAX)]);
    let txn = begin(&session);

    assert_eq!(session.nextval(&txn, oid).unwrap(), 1);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 2);
    let entry = *session.entry(oid).unwrap();
    assert_eq!((entry.last, entry.cached), (2, i64::MAX));
    assert_eq!(
        session.pg_get_sequence_data(&txn, oid).unwrap(),
        Some((i64::MAX, true))
    );
}

#[test]
fn reset_by_another_session_discards_prefetched_values() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut a = superuser(&engine);
    let mut b = superuser(&engine);
    let oid = create(&a, "s", vec![SeqOption::Cache(10)]);

    let txn = begin(&a);
    assert_eq!(a.nextval(&txn, oid).unwrap(), 1);
    engine.commit(txn).unwrap();

    let txn = begin(&b);
    b.reset_sequence(&txn, oid).unwrap();
    engine.commit(txn).unwrap();

    let txn = begin(&a);
    assert_eq!(a.currval(&txn, oid).unwrap(), 1);
    // Values 2..10 belonged to the old storage.
    assert_eq!(a.nextval(&txn, oid).unwrap(), 1);
}

#[test]
fn alter_keeps_currval_and_drops_the_cache() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", vec![SeqOption::Cache(10)]);

    let txn = begin(&session);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 1);
    engine.commit(txn).unwrap();

    let txn = begin(&session);
    session
        .alter_sequence(&txn, &AlterSeqStmt::new("s", vec![SeqOption::Increment(5)]))
        .unwrap();
    engine.commit(txn).unwrap();

    let txn = begin(&session);
    assert_eq!(session.currval(&txn, oid).unwrap(), 1);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 15);
    assert_eq!(session.nextval(&txn, oid).unwrap(), 20);
}

#[test]
fn read_only_transactions_may_only_touch_temporary_sequences() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let permanent = create(&session, "p", Vec::new());
    let txn = begin(&session);
    let mut stmt = CreateSeqStmt::new("t");
    stmt.persistence = Persistence::Temp;
    let temp = session.define_sequence(&txn, &stmt).unwrap().unwrap();
    session.nextval(&txn, permanent).unwrap();
    engine.commit(txn).unwrap();

    let txn = engine.begin(TxnOptions { read_only: true });
    let err = session.nextval(&txn, permanent).unwrap_err();
    assert_eq!(err.to_string(), "cannot execute nextval() in a read-only transaction");
    assert_eq!(err.sqlstate(), "25006");
    assert!(matches!(
        session.setval(&txn, permanent, 5).unwrap_err(),
        SequenceError::ReadOnlyTransaction(_)
    ));
    assert_eq!(session.currval(&txn, permanent).unwrap(), 1);

    assert_eq!(session.nextval(&txn, temp).unwrap(), 1);
    assert_eq!(session.setval(&txn, temp, 5).unwrap(), 5);
}

#[test]
fn temporary_sequences_write_no_wal() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let txn = begin(&session);
    let mut stmt = CreateSeqStmt::new("t");
    stmt.persistence = Persistence::Temp;
    let temp = session.define_sequence(&txn, &stmt).unwrap().unwrap();

    let before = seq_local_records(&wal_bytes(&inst)).len();
    for _ in 0..40 {
        session.nextval(&txn, temp).unwrap();
    }
    assert_eq!(seq_local_records(&wal_bytes(&inst)).len(), before);
    assert!(txn.xid_if_assigned().is_none());
}

#[test]
fn parallel_mode_blocks_changes_but_not_reads() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", Vec::new());
    let txn = begin(&session);
    session.nextval(&txn, oid).unwrap();

    txn.enter_parallel_mode();
    let err = session.nextval(&txn, oid).unwrap_err();
    assert_eq!(err.to_string(), "cannot execute nextval() during a parallel operation");
    assert_eq!(err.sqlstate(), "25000");
    assert!(matches!(
        session.setval(&txn, oid, 3).unwrap_err(),
        SequenceError::UnsafeInParallelMode(_)
    ));
    assert_eq!(session.currval(&txn, oid).unwrap(), 1);

    txn.exit_parallel_mode();
    assert_eq!(session.nextval(&txn, oid).unwrap(), 2);
}

#[test]
fn privileges_gate_each_operation() {
    let inst = Instance::new();
    let engine = inst.start();
    let admin = superuser(&engine);
    let oid = create(&admin, "guarded", Vec::new());
    let alice = engine.catalog().create_role("alice", false);
    let mut session = Session::new(Arc::clone(&engine), alice);
    let txn = begin(&session);

    let err = session.nextval(&txn, oid).unwrap_err();
    assert_eq!(err.to_string(), "permission denied for sequence guarded");
    assert_eq!(err.sqlstate(), "42501");
    assert_eq!(session.pg_sequence_last_value(&txn, oid).unwrap(), None);
    assert_eq!(session.pg_get_sequence_data(&txn, oid).unwrap(), None);
    assert!(session.pg_sequence_parameters(oid).is_err());
    // Internal callers skip the check.
    assert_eq!(session.nextval_internal(&txn, oid, false).unwrap(), 1);

    engine.catalog().grant(oid, alice, ACL_USAGE).unwrap();
    assert_eq!(session.nextval(&txn, oid).unwrap(), 2);
    assert_eq!(session.currval(&txn, oid).unwrap(), 2);
    assert_eq!(session.pg_sequence_last_value(&txn, oid).unwrap(), Some(2));
    assert_eq!(session.pg_get_sequence_data(&txn, oid).unwrap(), None);
    assert!(matches!(
        session.setval(&txn, oid, 7).unwrap_err(),
        SequenceError::PermissionDenied(_)
    ));

    engine.catalog().grant(oid, alice, ACL_UPDATE | ACL_SELECT).unwrap();
    assert_eq!(session.setval(&txn, oid, 7).unwrap(), 7);
    assert_eq!(session.pg_get_sequence_data(&txn, oid).unwrap(), Some((7, true)));
    assert_eq!(session.pg_sequence_parameters(oid).unwrap().relid, oid);

    engine.catalog().revoke(oid, alice, ACL_USAGE | ACL_UPDATE).unwrap();
    assert!(session.nextval(&txn, oid).is_err());
    assert_eq!(session.currval(&txn, oid).unwrap(), 7);
}

#[test]
fn discard_forgets_session_state() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(&session, "s", vec![SeqOption::Cache(5)]);
    let txn = begin(&session);
    session.nextval(&txn, oid).unwrap();

    session.discard_sequences();
    assert!(session.entry(oid).is_none());
    assert!(session.currval(&txn, oid).is_err());
    assert!(session.lastval(&txn).is_err());
    // The discarded cache is not handed out again.
    assert_eq!(session.nextval(&txn, oid).unwrap(), 6);
}

#[test]
fn stored_state_functions() {
    let inst = Instance::new();
    let engine = inst.start();
    let mut session = superuser(&engine);
    let oid = create(
        &session,
        "s",
        vec![SeqOption::Start(3), SeqOption::Increment(2), SeqOption::Cycle(true)],
    );
    let txn = begin(&session);

    assert_eq!(session.pg_sequence_last_value(&txn, oid).unwrap(), None);
    assert_eq!(session.pg_get_sequence_data(&txn, oid).unwrap(), Some((3, false)));
    session.nextval(&txn, oid).unwrap();
    assert_eq!(session.pg_sequence_last_value(&txn, oid).unwrap(), Some(3));

    let params = session.pg_sequence_parameters(oid).unwrap();
    assert_eq!((params.start, params.increment, params.cycle), (3, 2, true));
    assert_eq!((params.min, params.max, params.cache), (1, i64::MAX, 1));
}

#[test]
fn concurrent_sessions_never_share_a_value() {
    let inst = Instance::new();
    let engine = inst.start();
    let oid = create(&superuser(&engine), "shared", vec![SeqOption::Cache(3)]);

    let per_thread: Vec<Vec<i64>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                scope.spawn(move || {
                    let mut session = superuser(&engine);
                    let txn = begin(&session);
                    let values: Vec<i64> =
                        (0..100).map(|_| session.nextval(&txn, oid).unwrap()).collect();
                    engine.commit(txn).unwrap();
                    values
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for values in &per_thread {
        assert!(values.windows(2).all(|w| w[0] < w[1]));
        for v in values {
            assert!(seen.insert(*v), "value {v} handed out twice");
        }
    }
    assert_eq!(seen.len(), 400);
}
