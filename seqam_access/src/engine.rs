//! Shared state of one running instance: storage, buffers, WAL, catalog,
//! settings and the registry of sequence access method handlers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use seqam_catalog::{AccessMethodForm, AmKind, Catalog, LOCAL_SEQUENCE_AM_HANDLER};
use seqam_config::{check_sequence_am_name, GucSource, Settings, DEFAULT_SEQUENCE_ACCESS_METHOD};
use seqam_storage::buffer::BufferPool;
use seqam_storage::engine::{MemStorage, StorageEngine};
use seqam_storage::wal::{RmgrId, WalWriter};
use seqam_storage::{Lsn, Oid};
use seqam_txn::{Transaction, TxnManager, TxnOptions};

use crate::error::{Result, SequenceError};
use crate::local;
use crate::recovery::{self, CheckpointRecord, XLOG_CHECKPOINT_ONLINE};
use crate::routine::{AmHandlerFn, SequenceAm};

/// Default buffer pool size in pages.
pub const DEFAULT_SHARED_BUFFERS: usize = 128;

/// Components an [`Engine`] is started from. Sharing `storage`, the WAL
/// backing store and `catalog` between two engines simulates a restart.
pub struct EngineOptions {
    /// Block storage.
    pub storage: Arc<dyn StorageEngine>,
    /// Write-ahead log.
    pub wal: Arc<WalWriter>,
    /// System catalog.
    pub catalog: Arc<Catalog>,
    /// Run-time settings.
    pub settings: Arc<Settings>,
    /// Buffer pool capacity in pages.
    pub shared_buffers: usize,
}

impl EngineOptions {
    /// Options over in-memory storage with a write-through WAL kept in
    /// `wal_bytes`. Handing clones of `storage`, `wal_bytes` and `catalog` to
    /// a second engine restarts the instance as after a crash.
    pub fn in_memory(
        storage: MemStorage,
        wal_bytes: Arc<Mutex<Vec<u8>>>,
        catalog: Arc<Catalog>,
    ) -> Self {
        Self {
            storage: Arc::new(storage),
            wal: Arc::new(WalWriter::in_memory(wal_bytes, 0)),
            catalog,
            settings: Arc::new(Settings::new()),
            shared_buffers: DEFAULT_SHARED_BUFFERS,
        }
    }
}

/// One running instance.
pub struct Engine {
    storage: Arc<dyn StorageEngine>,
    buffers: Arc<BufferPool>,
    wal: Arc<WalWriter>,
    txns: Arc<TxnManager>,
    catalog: Arc<Catalog>,
    settings: Arc<Settings>,
    handlers: RwLock<HashMap<String, AmHandlerFn>>,
    loaded: RwLock<HashMap<Oid, Arc<SequenceAm>>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("wal", &self.wal)
            .field("buffers", &self.buffers.len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Bring an instance up: register the built-in access method, install
    /// the setting hooks and replay WAL written by a previous run.
    pub fn start(opts: EngineOptions) -> Result<Arc<Self>> {
        let buffers = Arc::new(
            BufferPool::new(Arc::clone(&opts.storage), opts.shared_buffers)
                .with_wal(Arc::clone(&opts.wal)),
        );
        let engine = Arc::new(Self {
            storage: opts.storage,
            buffers,
            wal: opts.wal,
            txns: Arc::new(TxnManager::default()),
            catalog: opts.catalog,
            settings: opts.settings,
            handlers: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
        });
        engine.register_am_handler(LOCAL_SEQUENCE_AM_HANDLER, local::handler);
        engine.install_setting_hooks()?;

        let stats = recovery::startup(&engine)?;
        info!(
            records = stats.records,
            redo = %stats.redo,
            end = %stats.end,
            "database system is ready"
        );
        engine.settings.mark_started();
        Ok(engine)
    }

    fn install_setting_hooks(&self) -> Result<()> {
        let catalog = Arc::clone(&self.catalog);
        self.settings.set_check_hook(
            DEFAULT_SEQUENCE_ACCESS_METHOD,
            Arc::new(move |value: &str, source: GucSource| {
                check_sequence_am_name(value)?;
                let found = catalog
                    .access_method_by_name(value)
                    .is_some_and(|am| am.kind == AmKind::Sequence);
                if found {
                    return Ok(());
                }
                let msg = format!("sequence access method \"{value}\" does not exist.");
                if source == GucSource::Test {
                    // Accepted so that files can name AMs loaded later.
                    info!("{msg}");
                    return Ok(());
                }
                Err(msg)
            }),
        )?;
        Ok(())
    }

    /// Block storage.
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Shared buffers.
    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Write-ahead log.
    pub fn wal(&self) -> &Arc<WalWriter> {
        &self.wal
    }

    /// Transaction manager.
    pub fn txns(&self) -> &Arc<TxnManager> {
        &self.txns
    }

    /// System catalog.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Run-time settings.
    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Start a transaction.
    pub fn begin(&self, opts: TxnOptions) -> Transaction {
        self.txns.begin(opts)
    }

    /// Commit `txn`, making its WAL durable first when it wrote any.
    pub fn commit(&self, txn: Transaction) -> Result<()> {
        if txn.xid_if_assigned().is_some() {
            self.wal.flush_all()?;
        }
        txn.commit();
        Ok(())
    }

    /// Write every dirty buffer and log a checkpoint. Returns the new redo
    /// pointer; pages last logged before it force a fresh WAL record on their
    /// next change.
    pub fn checkpoint(&self) -> Result<Lsn> {
        let redo = self.wal.insert_lsn();
        self.wal.set_redo_ptr(redo);
        let written = self.buffers.flush_all()?;
        let record = CheckpointRecord {
            redo,
            next_xid: self.txns.gtm().peek_next_xid().0,
        };
        let mut builder = self.wal.begin_insert();
        builder.register_data(&record.encode());
        let end = builder.insert(RmgrId::Xlog, XLOG_CHECKPOINT_ONLINE)?;
        self.wal.flush(end)?;
        debug!(%redo, written, "checkpoint complete");
        Ok(redo)
    }

    /// Make `handler` callable under `name`, as if a shared library exporting
    /// it had been loaded.
    pub fn register_am_handler(&self, name: &str, handler: AmHandlerFn) {
        self.handlers.write().insert(name.to_string(), handler);
        // A replaced handler must not keep serving through the cache.
        self.loaded.write().clear();
    }

    /// Register `handler` and create the access method row `name` pointing
    /// at it if the catalog lacks one. Returns the access method oid.
    pub fn register_sequence_am(
        &self,
        name: &str,
        handler_name: &str,
        handler: AmHandlerFn,
    ) -> Result<Oid> {
        self.register_am_handler(handler_name, handler);
        if let Some(existing) = self.catalog.access_method_by_name(name) {
            return Ok(existing.oid);
        }
        let oid = self.catalog.next_oid();
        self.catalog.insert_access_method(AccessMethodForm {
            oid,
            name: name.to_string(),
            kind: AmKind::Sequence,
            handler: handler_name.to_string(),
        })?;
        info!(name, oid, "sequence access method created");
        Ok(oid)
    }

    /// Oid of the sequence access method `name`.
    pub fn get_sequence_am_oid(&self, name: &str, missing_ok: bool) -> Result<Option<Oid>> {
        match self.catalog.access_method_by_name(name) {
            Some(am) if am.kind == AmKind::Sequence => Ok(Some(am.oid)),
            Some(_) => Err(SequenceError::WrongObjectType(format!(
                "access method \"{name}\" is not of type SEQUENCE"
            ))),
            None if missing_ok => Ok(None),
            None => Err(SequenceError::UndefinedObject(format!(
                "access method \"{name}\" does not exist"
            ))),
        }
    }

    /// Validated routine of access method `am_oid`, loaded on first use.
    pub fn sequence_am(&self, am_oid: Oid) -> Result<Arc<SequenceAm>> {
        if let Some(am) = self.loaded.read().get(&am_oid) {
            return Ok(Arc::clone(am));
        }
        let form = self.catalog.access_method(am_oid)?;
        if form.kind != AmKind::Sequence {
            return Err(SequenceError::WrongObjectType(format!(
                "access method \"{}\" is not of type SEQUENCE",
                form.name
            )));
        }
        let handler = self
            .handlers
            .read()
            .get(&form.handler)
            .copied()
            .ok_or_else(|| {
                SequenceError::UndefinedObject(format!(
                    "function {}() does not exist",
                    form.handler
                ))
            })?;
        let am = Arc::new(SequenceAm::from_handler(&form, handler)?);
        self.loaded.write().insert(am_oid, Arc::clone(&am));
        Ok(am)
    }

    /// Oid of the access method the session setting selects for new
    /// sequences.
    pub fn default_sequence_am(&self) -> Result<Oid> {
        let name = self.settings.get_string(DEFAULT_SEQUENCE_ACCESS_METHOD)?;
        self.get_sequence_am_oid(&name, false)?
            .ok_or_else(|| SequenceError::Internal(format!("no access method {name}")))
    }
}
