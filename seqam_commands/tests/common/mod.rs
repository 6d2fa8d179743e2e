#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use seqam_access::local::LocalSequenceData;
use seqam_access::{Engine, EngineOptions};
use seqam_catalog::{
    Catalog, ColumnForm, RelKind, RelationForm, BOOTSTRAP_SUPERUSER_ID, DEFAULT_DATABASE_OID,
    DEFAULT_TABLESPACE_OID, PUBLIC_NAMESPACE,
};
use seqam_commands::{CreateSeqStmt, SeqOption, Session};
use seqam_storage::engine::MemStorage;
use seqam_storage::tuple::HeapTuple;
use seqam_storage::wal::{read_records, RmgrId};
use seqam_storage::{Oid, Persistence, RelFileLocator};
use seqam_txn::{Transaction, TxnOptions};

/// Storage, WAL and catalog that outlive an engine, so a test can stop and
/// restart the instance.
pub struct Instance {
    pub storage: MemStorage,
    pub wal: Arc<Mutex<Vec<u8>>>,
    pub catalog: Arc<Catalog>,
}

impl Instance {
    pub fn new() -> Self {
        Self {
            storage: MemStorage::new(),
            wal: Arc::new(Mutex::new(Vec::new())),
            catalog: Arc::new(Catalog::new()),
        }
    }

    pub fn start(&self) -> Arc<Engine> {
        let engine = Engine::start(EngineOptions::in_memory(
            self.storage.clone(),
            Arc::clone(&self.wal),
            Arc::clone(&self.catalog),
        ))
        .unwrap();
        seqam_snowflake::register(&engine).unwrap();
        engine
    }

    /// Instance sharing this catalog but holding only the first `len` bytes
    /// of WAL and none of the data pages.
    pub fn crashed_at(&self, len: usize) -> Self {
        let wal = self.wal.lock()[..len].to_vec();
        Self {
            storage: MemStorage::new(),
            wal: Arc::new(Mutex::new(wal)),
            catalog: Arc::clone(&self.catalog),
        }
    }

    /// Like [`Instance::crashed_at`], but with `pages` as the data files
    /// found on disk.
    pub fn crashed_with_pages(&self, len: usize, pages: &MemStorage) -> Self {
        Self {
            storage: pages.snapshot(),
            ..self.crashed_at(len)
        }
    }
}

pub fn superuser(engine: &Arc<Engine>) -> Session {
    Session::new(Arc::clone(engine), BOOTSTRAP_SUPERUSER_ID)
}

/// Create sequence `name` in its own committed transaction.
pub fn create(session: &Session, name: &str, options: Vec<SeqOption>) -> Oid {
    let engine = Arc::clone(session.engine());
    let txn = engine.begin(TxnOptions::default());
    let mut stmt = CreateSeqStmt::new(name);
    stmt.options = options;
    let oid = session.define_sequence(&txn, &stmt).unwrap().unwrap();
    engine.commit(txn).unwrap();
    oid
}

pub fn begin(session: &Session) -> Transaction {
    session.engine().begin(TxnOptions::default())
}

/// Plain table with integer columns, owned by `owner`.
pub fn create_table(engine: &Engine, name: &str, owner: Oid, columns: &[&str]) -> Oid {
    let catalog = engine.catalog();
    let oid = catalog.next_oid();
    catalog
        .insert_relation(RelationForm {
            oid,
            name: name.into(),
            namespace: PUBLIC_NAMESPACE,
            owner,
            kind: RelKind::Table,
            persistence: Persistence::Permanent,
            locator: RelFileLocator {
                spc_oid: DEFAULT_TABLESPACE_OID,
                db_oid: DEFAULT_DATABASE_OID,
                rel_number: catalog.next_relfilenumber(),
            },
            am: 0,
            columns: columns
                .iter()
                .enumerate()
                .map(|(i, c)| ColumnForm {
                    attnum: i as i16 + 1,
                    name: c.to_string(),
                    type_name: "int8".into(),
                    identity: false,
                })
                .collect(),
            acl: None,
        })
        .unwrap();
    oid
}

/// Sequence-state records in `wal`, in log order.
pub fn seq_local_records(wal: &[u8]) -> Vec<LocalSequenceData> {
    read_records(wal)
        .0
        .into_iter()
        .filter(|e| e.record.rmgr == RmgrId::SeqLocal)
        .map(|e| {
            let tuple =
                HeapTuple::decode(&e.record.main_data[RelFileLocator::ENCODED_LEN..]).unwrap();
            LocalSequenceData::decode(&tuple.data).unwrap()
        })
        .collect()
}

pub fn wal_bytes(inst: &Instance) -> Vec<u8> {
    inst.wal.lock().clone()
}
