//! Open relation handle used by access method callbacks.

use std::sync::Arc;

use tracing::{debug, warn};

use seqam_catalog::{RelKind, RelationForm, DEFAULT_DATABASE_OID};
use seqam_storage::buffer::{Buffer, BufferPool};
use seqam_storage::engine::StorageEngine;
use seqam_storage::wal::WalWriter;
use seqam_storage::{BufferTag, ForkNumber, Oid, Persistence, RelFileLocator};
use seqam_txn::{LockMode, LockTag, Transaction};

use crate::engine::Engine;
use crate::error::{Result, SequenceError};
use crate::recovery::{log_smgr_create, log_smgr_unlink};
use crate::routine::SequenceAm;

/// Lock tag of relation `oid`.
pub fn relation_lock_tag(oid: Oid) -> LockTag {
    LockTag {
        db_oid: DEFAULT_DATABASE_OID,
        rel_oid: oid,
    }
}

/// A relation opened inside a transaction. The form is a snapshot of the
/// catalog row, refreshed when this handle changes the storage.
pub struct Relation<'a> {
    engine: &'a Engine,
    txn: &'a Transaction,
    form: RelationForm,
}

impl std::fmt::Debug for Relation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relation")
            .field("oid", &self.form.oid)
            .field("name", &self.form.name)
            .field("locator", &self.form.locator)
            .finish()
    }
}

impl<'a> Relation<'a> {
    /// Open relation `oid`, first taking `lockmode` on it if given.
    pub fn open(
        engine: &'a Engine,
        txn: &'a Transaction,
        oid: Oid,
        lockmode: Option<LockMode>,
    ) -> Result<Self> {
        if let Some(mode) = lockmode {
            txn.lock_relation(relation_lock_tag(oid), mode)?;
        }
        let form = engine.catalog().relation(oid)?;
        Ok(Self { engine, txn, form })
    }

    /// Open relation `oid` and check it is a sequence.
    pub fn sequence_open(
        engine: &'a Engine,
        txn: &'a Transaction,
        oid: Oid,
        lockmode: Option<LockMode>,
    ) -> Result<Self> {
        let rel = Self::open(engine, txn, oid, lockmode)?;
        if rel.form.kind != RelKind::Sequence {
            return Err(SequenceError::WrongObjectType(format!(
                "\"{}\" is not a sequence",
                rel.form.name
            )));
        }
        Ok(rel)
    }

    /// Owning engine.
    pub fn engine(&self) -> &'a Engine {
        self.engine
    }

    /// Transaction the relation was opened in.
    pub fn txn(&self) -> &'a Transaction {
        self.txn
    }

    /// Catalog row.
    pub fn form(&self) -> &RelationForm {
        &self.form
    }

    /// Relation oid.
    pub fn oid(&self) -> Oid {
        self.form.oid
    }

    /// Unqualified name.
    pub fn name(&self) -> &str {
        &self.form.name
    }

    /// Current storage.
    pub fn locator(&self) -> RelFileLocator {
        self.form.locator
    }

    /// Durability class.
    pub fn persistence(&self) -> Persistence {
        self.form.persistence
    }

    /// Whether changes must be WAL-logged.
    pub fn needs_wal(&self) -> bool {
        self.form.needs_wal()
    }

    /// Access method routine of this sequence.
    pub fn sequence_am(&self) -> Result<Arc<SequenceAm>> {
        self.engine.sequence_am(self.form.am)
    }

    /// Top-level xid to stamp on WAL records, 0 if none was assigned.
    pub(crate) fn record_xid(&self) -> u32 {
        self.txn.xid_if_assigned().map_or(0, |xid| xid.0)
    }

    /// Pin `block` of the main fork.
    pub fn read_buffer(&self, block: u32) -> Result<Buffer> {
        let tag = BufferTag::new(self.form.locator, ForkNumber::Main, block);
        Ok(self.engine.buffers().read_buffer(tag)?)
    }

    /// Add a block to `fork`.
    pub fn extend(&self, fork: ForkNumber) -> Result<Buffer> {
        Ok(self.engine.buffers().extend(self.form.locator, fork)?)
    }

    /// Create the main fork of the current storage. The files are removed
    /// again if the transaction aborts.
    pub fn create_storage(&self) -> Result<()> {
        create_main_fork(self.engine, self.txn, self.form.locator, self.form.persistence)
    }

    /// Create the init fork, logging its creation regardless of persistence
    /// so that recovery can rebuild the main fork from it.
    pub fn create_init_fork(&self) -> Result<()> {
        let storage = self.engine.storage();
        if !storage.fork_exists(self.form.locator, ForkNumber::Init) {
            storage.create_fork(self.form.locator, ForkNumber::Init, false)?;
        }
        log_smgr_create(
            self.engine.wal(),
            self.record_xid(),
            self.form.locator,
            ForkNumber::Init,
        )?;
        Ok(())
    }

    /// Write every dirty page of the relation to storage.
    pub fn flush_buffers(&self) -> Result<()> {
        Ok(self.engine.buffers().flush_relation(self.form.locator)?)
    }

    /// Switch the relation to fresh, empty storage with `persistence`. The
    /// previous storage is unlinked at commit; on abort the catalog row is
    /// restored and the new storage unlinked instead.
    pub fn set_new_relfilenumber(&mut self, persistence: Persistence) -> Result<()> {
        let catalog = Arc::clone(self.engine.catalog());
        let old_locator = self.form.locator;
        let old_persistence = self.form.persistence;
        let new_locator = RelFileLocator {
            rel_number: catalog.next_relfilenumber(),
            ..old_locator
        };
        create_main_fork(self.engine, self.txn, new_locator, persistence)?;

        self.form = catalog.update_relation(self.form.oid, |form| {
            form.locator = new_locator;
            form.persistence = persistence;
            form.clone()
        })?;
        debug!(
            relation = %self.form.name,
            old = %old_locator,
            new = %new_locator,
            "relation storage replaced"
        );

        let oid = self.form.oid;
        self.txn.on_abort(move || {
            let restored = catalog.update_relation(oid, |form| {
                form.locator = old_locator;
                form.persistence = old_persistence;
            });
            if let Err(e) = restored {
                warn!(oid, locator = %old_locator, error = %e, "could not restore relation storage");
            }
        });
        let unlink = StorageUnlink::new(self.engine, self.txn, old_locator, old_persistence);
        self.txn.on_commit(move || unlink.run("old"));
        Ok(())
    }
}

fn create_main_fork(
    engine: &Engine,
    txn: &Transaction,
    locator: RelFileLocator,
    persistence: Persistence,
) -> Result<()> {
    engine
        .storage()
        .create_fork(locator, ForkNumber::Main, false)?;
    if persistence == Persistence::Permanent {
        let xid = txn.xid_if_assigned().map_or(0, |xid| xid.0);
        log_smgr_create(engine.wal(), xid, locator, ForkNumber::Main)?;
    }
    let unlink = StorageUnlink::new(engine, txn, locator, persistence);
    txn.on_abort(move || unlink.run("aborted"));
    Ok(())
}

/// Unlink the storage of a relation at commit of `txn`.
pub fn drop_storage_at_commit(
    engine: &Engine,
    txn: &Transaction,
    locator: RelFileLocator,
    persistence: Persistence,
) {
    let unlink = StorageUnlink::new(engine, txn, locator, persistence);
    txn.on_commit(move || unlink.run("dropped"));
}

/// Removal of a relation's files at the end of a transaction. Storage that
/// may have WAL records gets an unlink record, flushed before the files go,
/// so that crash recovery does not bring them back.
struct StorageUnlink {
    wal: Arc<WalWriter>,
    buffers: Arc<BufferPool>,
    storage: Arc<dyn StorageEngine>,
    xid: u32,
    locator: RelFileLocator,
    logged: bool,
}

impl StorageUnlink {
    fn new(
        engine: &Engine,
        txn: &Transaction,
        locator: RelFileLocator,
        persistence: Persistence,
    ) -> Self {
        Self {
            wal: Arc::clone(engine.wal()),
            buffers: Arc::clone(engine.buffers()),
            storage: Arc::clone(engine.storage()),
            xid: txn.xid_if_assigned().map_or(0, |xid| xid.0),
            locator,
            logged: persistence != Persistence::Temp,
        }
    }

    fn run(self, what: &str) {
        if self.logged {
            let logged = log_smgr_unlink(&self.wal, self.xid, self.locator)
                .and_then(|end| self.wal.flush(end));
            if let Err(e) = logged {
                warn!(locator = %self.locator, error = %e, "could not log storage removal");
            }
        }
        self.buffers.drop_relation_buffers(self.locator);
        match self.storage.unlink(self.locator) {
            Ok(()) => debug!(locator = %self.locator, what, "storage removed"),
            Err(e) => warn!(locator = %self.locator, what, error = %e, "could not remove storage"),
        }
    }
}
