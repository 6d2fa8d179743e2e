use std::sync::Arc;

use parking_lot::Mutex;

use seqam_access::{
    sequence_change_persistence, sequence_get_state, sequence_init, sequence_nextval,
    sequence_reset, sequence_setval, Engine, EngineOptions, NextvalParams, Relation,
};
use seqam_catalog::{
    Catalog, RelKind, RelationForm, BOOTSTRAP_SUPERUSER_ID, DEFAULT_DATABASE_OID,
    DEFAULT_TABLESPACE_OID, PUBLIC_NAMESPACE,
};
use seqam_config::GucSource;
use seqam_snowflake::{register, snowflake_get, MACHINE_ID_SETTING};
use seqam_storage::engine::MemStorage;
use seqam_storage::{ForkNumber, Oid, Persistence, RelFileLocator};
use seqam_txn::{Transaction, TxnOptions};

const PARAMS: NextvalParams = NextvalParams {
    incby: 1,
    maxv: i64::MAX,
    minv: 0,
    cache: 1,
    cycle: false,
};

struct Instance {
    storage: MemStorage,
    wal: Arc<Mutex<Vec<u8>>>,
    catalog: Arc<Catalog>,
}

impl Instance {
    fn new() -> Self {
        Self {
            storage: MemStorage::new(),
            wal: Arc::new(Mutex::new(Vec::new())),
            catalog: Arc::new(Catalog::new()),
        }
    }

    fn start(&self) -> (Arc<Engine>, Oid) {
        let engine = Engine::start(EngineOptions::in_memory(
            self.storage.clone(),
            Arc::clone(&self.wal),
            Arc::clone(&self.catalog),
        ))
        .unwrap();
        let am = register(&engine).unwrap();
        (engine, am)
    }
}

fn create(engine: &Engine, txn: &Transaction, am: Oid, start: i64) -> Oid {
    let catalog = engine.catalog();
    let oid = catalog.next_oid();
    catalog
        .insert_relation(RelationForm {
            oid,
            name: "flake".into(),
            namespace: PUBLIC_NAMESPACE,
            owner: BOOTSTRAP_SUPERUSER_ID,
            kind: RelKind::Sequence,
            persistence: Persistence::Permanent,
            locator: RelFileLocator {
                spc_oid: DEFAULT_TABLESPACE_OID,
                db_oid: DEFAULT_DATABASE_OID,
                rel_number: catalog.next_relfilenumber(),
            },
            am,
            columns: Vec::new(),
            acl: None,
        })
        .unwrap();
    let mut rel = Relation::open(engine, txn, oid, None).unwrap();
    rel.create_storage().unwrap();
    sequence_init(&mut rel, start, false).unwrap();
    oid
}

#[test]
fn storage_becomes_unlogged_with_an_init_fork() {
    let inst = Instance::new();
    let (engine, am) = inst.start();
    let txn = engine.begin(TxnOptions::default());
    let oid = create(&engine, &txn, am, 1);

    let form = engine.catalog().relation(oid).unwrap();
    assert_eq!(form.persistence, Persistence::Unlogged);
    assert!(engine.storage().fork_exists(form.locator, ForkNumber::Init));
    let mut rel = Relation::sequence_open(&engine, &txn, oid, None).unwrap();
    assert_eq!(sequence_get_state(&mut rel).unwrap(), (1, false));
}

#[test]
fn values_carry_machine_and_counter() {
    let inst = Instance::new();
    let (engine, am) = inst.start();
    let txn = engine.begin(TxnOptions::default());
    let oid = create(&engine, &txn, am, 0);
    let mut rel = Relation::sequence_open(&engine, &txn, oid, None).unwrap();

    let (first, last) = sequence_nextval(&mut rel, &PARAMS).unwrap();
    assert_eq!(first, last);
    let id = snowflake_get(first);
    assert_eq!(id.machine, 1);
    assert_eq!(id.count, 1);
    assert!(id.time_ms > 0);

    engine
        .settings()
        .set(MACHINE_ID_SETTING, "42", true, GucSource::Session)
        .unwrap();
    let (second, _) = sequence_nextval(&mut rel, &PARAMS).unwrap();
    let id = snowflake_get(second);
    assert_eq!(id.machine, 42);
    assert_eq!(id.count, 2);
    assert!(second > first);
    assert_eq!(sequence_get_state(&mut rel).unwrap(), (2, true));
}

#[test]
fn counter_wrap_waits_for_the_next_millisecond() {
    let inst = Instance::new();
    let (engine, am) = inst.start();
    let txn = engine.begin(TxnOptions::default());
    let oid = create(&engine, &txn, am, 0);
    let mut rel = Relation::sequence_open(&engine, &txn, oid, None).unwrap();

    let ids: Vec<_> = (0..4097)
        .map(|_| snowflake_get(sequence_nextval(&mut rel, &PARAMS).unwrap().0))
        .collect();
    let drops: Vec<usize> = ids
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[1].count < w[0].count)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(drops.len(), 1);
    let i = drops[0];
    assert_eq!(ids[i].count, 4095);
    assert_eq!(ids[i + 1].count, 1);
    assert!(ids[i + 1].time_ms > ids[i].time_ms);
}

#[test]
fn setval_and_reset_keep_twelve_bits() {
    let inst = Instance::new();
    let (engine, am) = inst.start();
    let txn = engine.begin(TxnOptions::default());
    let oid = create(&engine, &txn, am, 1);
    let mut rel = Relation::sequence_open(&engine, &txn, oid, None).unwrap();

    sequence_setval(&mut rel, 4096 + 10, true).unwrap();
    assert_eq!(sequence_get_state(&mut rel).unwrap(), (10, true));
    let (value, _) = sequence_nextval(&mut rel, &PARAMS).unwrap();
    assert_eq!(snowflake_get(value).count, 11);

    let before = rel.locator();
    sequence_reset(&mut rel, 7, false, true).unwrap();
    assert_ne!(rel.locator(), before);
    assert_eq!(rel.persistence(), Persistence::Unlogged);
    assert_eq!(sequence_get_state(&mut rel).unwrap(), (7, false));

    sequence_change_persistence(&mut rel, Persistence::Permanent).unwrap();
    assert_eq!(rel.persistence(), Persistence::Unlogged);
}

#[test]
fn counter_restarts_from_init_fork_after_crash() {
    let inst = Instance::new();
    let (engine, am) = inst.start();
    let txn = engine.begin(TxnOptions::default());
    let oid = create(&engine, &txn, am, 0);
    {
        let mut rel = Relation::sequence_open(&engine, &txn, oid, None).unwrap();
        for _ in 0..10 {
            sequence_nextval(&mut rel, &PARAMS).unwrap();
        }
        rel.flush_buffers().unwrap();
    }
    engine.commit(txn).unwrap();
    drop(engine);

    let (engine, _) = inst.start();
    let txn = engine.begin(TxnOptions::default());
    let mut rel = Relation::sequence_open(&engine, &txn, oid, None).unwrap();
    assert_eq!(sequence_get_state(&mut rel).unwrap(), (0, false));
}

#[test]
fn loading_twice_reuses_the_access_method() {
    let inst = Instance::new();
    let (engine, am) = inst.start();
    assert_eq!(register(&engine).unwrap(), am);
}
