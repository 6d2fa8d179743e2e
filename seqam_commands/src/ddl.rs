//! CREATE, ALTER and DROP SEQUENCE, plus the storage resets that TRUNCATE
//! RESTART IDENTITY and ALTER ... SET LOGGED need.
//!
//! Catalog rows change immediately; every change registers an abort action
//! that puts the old row back.

use std::sync::Arc;

use tracing::{debug, info};

use seqam_access::relation::{drop_storage_at_commit, relation_lock_tag};
use seqam_access::{
    sequence_change_persistence, sequence_get_state, sequence_init, sequence_reset, Engine,
    Relation, Result, SequenceError,
};
use seqam_catalog::{
    DependForm, DependencyType, RelKind, RelationForm, SeqType, SequenceForm,
    DEFAULT_DATABASE_OID, DEFAULT_TABLESPACE_OID,
};
use seqam_storage::{Oid, Persistence, RelFileLocator};
use seqam_txn::{LockMode, Transaction};

use crate::params::{self, init_params, SeqOption, SeqRestart};
use crate::session::{init_sequence, Session};

/// CREATE SEQUENCE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSeqStmt {
    /// `[schema.]name`.
    pub name: String,
    /// Options in the order given.
    pub options: Vec<SeqOption>,
    /// `TEMPORARY`, `UNLOGGED` or neither.
    pub persistence: Persistence,
    /// `USING am`; the session default otherwise.
    pub access_method: Option<String>,
    /// `IF NOT EXISTS`.
    pub if_not_exists: bool,
    /// Sequence backs an identity column.
    pub for_identity: bool,
    /// Owner; the session user otherwise.
    pub owner: Option<Oid>,
}

impl CreateSeqStmt {
    /// Statement creating a permanent sequence `name` with default options.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Vec::new(),
            persistence: Persistence::Permanent,
            access_method: None,
            if_not_exists: false,
            for_identity: false,
            owner: None,
        }
    }
}

/// ALTER SEQUENCE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterSeqStmt {
    /// `[schema.]name`.
    pub name: String,
    /// Options to change.
    pub options: Vec<SeqOption>,
    /// Sequence backs an identity column.
    pub for_identity: bool,
    /// `IF EXISTS`.
    pub missing_ok: bool,
}

impl AlterSeqStmt {
    /// Statement changing `options` of `name`.
    pub fn new(name: impl Into<String>, options: Vec<SeqOption>) -> Self {
        Self {
            name: name.into(),
            options,
            for_identity: false,
            missing_ok: false,
        }
    }
}

/// Parameters of sequence `relid` as an option list.
pub fn sequence_options(engine: &Engine, relid: Oid) -> Result<Vec<SeqOption>> {
    Ok(params::sequence_options(&engine.catalog().sequence(relid)?))
}

fn blank_form() -> (SequenceForm, SeqRestart) {
    (
        SequenceForm {
            relid: 0,
            seq_type: SeqType::Int8,
            start: 0,
            increment: 0,
            max: 0,
            min: 0,
            cache: 0,
            cycle: false,
        },
        SeqRestart {
            last_value: 0,
            is_called: false,
            reset_state: false,
        },
    )
}

impl Session {
    fn check_owner(&self, form: &RelationForm) -> Result<()> {
        if form.owner != self.user && !self.engine.catalog().is_superuser(self.user) {
            return Err(SequenceError::PermissionDenied(format!(
                "must be owner of sequence {}",
                form.name
            )));
        }
        Ok(())
    }

    fn lookup_for_ddl(&self, name: &str, missing_ok: bool) -> Result<Option<Oid>> {
        match self.resolve_relation(name) {
            Ok(relid) => Ok(Some(relid)),
            Err(SequenceError::UndefinedTable(_)) if missing_ok => {
                info!("relation \"{name}\" does not exist, skipping");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Create a sequence. Returns `None` when `IF NOT EXISTS` found the name
    /// taken.
    pub fn define_sequence(&self, txn: &Transaction, stmt: &CreateSeqStmt) -> Result<Option<Oid>> {
        let engine = Arc::clone(&self.engine);
        let catalog = engine.catalog();
        let (namespace, relname) = self.qualified_name(&stmt.name)?;
        if stmt.if_not_exists && catalog.relname_get_relid(namespace, relname).is_some() {
            info!("relation \"{relname}\" already exists, skipping");
            return Ok(None);
        }

        let (mut form, mut state) = blank_form();
        let outcome = init_params(&stmt.options, stmt.for_identity, true, &mut form, &mut state)?;

        let am = match &stmt.access_method {
            Some(name) => engine.get_sequence_am_oid(name, false)?.ok_or_else(|| {
                SequenceError::UndefinedObject(format!("access method \"{name}\" does not exist"))
            })?,
            None => engine.default_sequence_am()?,
        };

        let seqoid = catalog.next_oid();
        catalog.insert_relation(RelationForm {
            oid: seqoid,
            name: relname.to_string(),
            namespace,
            owner: stmt.owner.unwrap_or(self.user),
            kind: RelKind::Sequence,
            persistence: stmt.persistence,
            locator: RelFileLocator {
                spc_oid: DEFAULT_TABLESPACE_OID,
                db_oid: DEFAULT_DATABASE_OID,
                rel_number: catalog.next_relfilenumber(),
            },
            am,
            columns: Vec::new(),
            acl: None,
        })?;
        let undo = Arc::clone(catalog);
        txn.on_abort(move || {
            undo.remove_relation(seqoid);
        });

        let mut rel =
            Relation::sequence_open(&engine, txn, seqoid, Some(LockMode::AccessExclusive))?;
        rel.create_storage()?;
        sequence_init(&mut rel, state.last_value, state.is_called)?;

        if let Some(owned_by) = &outcome.owned_by {
            self.process_owned_by(txn, rel.form(), owned_by, stmt.for_identity)?;
        }

        form.relid = seqoid;
        catalog.upsert_sequence(form);
        info!(
            sequence = relname,
            oid = seqoid,
            am,
            persistence = ?rel.persistence(),
            "sequence created"
        );
        Ok(Some(seqoid))
    }

    /// Change options of a sequence. Options other than `OWNED BY` rewrite
    /// the storage, so the change rolls back with the transaction. The
    /// session's `currval` is kept; prefetched values are dropped.
    pub fn alter_sequence(&mut self, txn: &Transaction, stmt: &AlterSeqStmt) -> Result<Option<Oid>> {
        let Some(relid) = self.lookup_for_ddl(&stmt.name, stmt.missing_ok)? else {
            return Ok(None);
        };
        txn.lock_relation(relation_lock_tag(relid), LockMode::ShareRowExclusive)?;
        let catalog = Arc::clone(self.engine.catalog());
        self.check_owner(&catalog.relation(relid)?)?;

        self.with_entry(relid, |s, elm| {
            let mut rel = init_sequence(&s.engine, txn, elm)?;
            let old_form = catalog.sequence(relid)?;
            let mut form = old_form.clone();

            let (last_value, is_called) = sequence_get_state(&mut rel)?;
            let mut state = SeqRestart {
                last_value,
                is_called,
                reset_state: false,
            };
            let outcome = init_params(&stmt.options, stmt.for_identity, false, &mut form, &mut state)?;

            if outcome.need_seq_rewrite {
                if rel.needs_wal() {
                    txn.top_xid();
                }
                sequence_reset(&mut rel, state.last_value, state.is_called, state.reset_state)?;
            }

            elm.cached = elm.last;

            if let Some(owned_by) = &outcome.owned_by {
                s.process_owned_by(txn, rel.form(), owned_by, stmt.for_identity)?;
            }

            catalog.upsert_sequence(form);
            let undo = Arc::clone(&catalog);
            txn.on_abort(move || undo.upsert_sequence(old_form));
            info!(
                sequence = rel.name(),
                rewrite = outcome.need_seq_rewrite,
                "sequence altered"
            );
            Ok(())
        })?;
        Ok(Some(relid))
    }

    /// Put a sequence back to its start value on fresh storage.
    pub fn reset_sequence(&mut self, txn: &Transaction, relid: Oid) -> Result<()> {
        txn.lock_relation(relation_lock_tag(relid), LockMode::AccessExclusive)?;
        self.with_entry(relid, |s, elm| {
            let mut rel = init_sequence(&s.engine, txn, elm)?;
            let startv = s.engine.catalog().sequence(relid)?.start;
            sequence_reset(&mut rel, startv, false, true)?;
            elm.cached = elm.last;
            debug!(sequence = rel.name(), startv, "sequence reset");
            Ok(())
        })
    }

    /// Move a sequence to storage of another persistence.
    pub fn change_sequence_persistence(
        &mut self,
        txn: &Transaction,
        relid: Oid,
        persistence: Persistence,
    ) -> Result<()> {
        txn.lock_relation(relation_lock_tag(relid), LockMode::AccessExclusive)?;
        self.check_owner(&self.engine.catalog().relation(relid)?)?;
        self.with_entry(relid, |s, elm| {
            let mut rel = init_sequence(&s.engine, txn, elm)?;
            if rel.needs_wal() {
                txn.top_xid();
            }
            sequence_change_persistence(&mut rel, persistence)?;
            info!(sequence = rel.name(), ?persistence, "sequence persistence changed");
            Ok(())
        })
    }

    /// Drop a sequence. Storage goes away at commit.
    pub fn drop_sequence(&mut self, txn: &Transaction, name: &str, missing_ok: bool) -> Result<Option<Oid>> {
        let Some(relid) = self.lookup_for_ddl(name, missing_ok)? else {
            return Ok(None);
        };
        txn.lock_relation(relation_lock_tag(relid), LockMode::AccessExclusive)?;
        let catalog = Arc::clone(self.engine.catalog());
        let form = catalog.relation(relid)?;
        if form.kind != RelKind::Sequence {
            return Err(SequenceError::WrongObjectType(format!(
                "\"{}\" is not a sequence",
                form.name
            )));
        }
        self.check_owner(&form)?;
        if let Some((tableid, attnum)) = catalog.sequence_is_owned(relid, DependencyType::Internal) {
            let table = catalog.relation(tableid)?;
            let column = table
                .columns
                .iter()
                .find(|c| i32::from(c.attnum) == attnum)
                .map_or_else(|| attnum.to_string(), |c| c.name.clone());
            return Err(SequenceError::PrerequisiteState(format!(
                "cannot drop sequence {} because column {} of table {} requires it",
                form.name, column, table.name
            )));
        }

        let seq_form = catalog.sequence(relid).ok();
        let deps = catalog.dependencies_of(relid);
        catalog.remove_relation(relid);
        let (locator, persistence) = (form.locator, form.persistence);
        let undo = Arc::clone(&catalog);
        let name = form.name.clone();
        txn.on_abort(move || {
            if undo.insert_relation(form).is_ok() {
                if let Some(seq_form) = seq_form {
                    undo.upsert_sequence(seq_form);
                }
                for dep in deps {
                    undo.record_dependency(dep);
                }
            }
        });
        drop_storage_at_commit(&self.engine, txn, locator, persistence);
        info!(sequence = %name, oid = relid, "sequence dropped");
        Ok(Some(relid))
    }

    /// Link the sequence to `table.column`, or unlink it for `OWNED BY NONE`.
    fn process_owned_by(
        &self,
        txn: &Transaction,
        seqrel: &RelationForm,
        owned_by: &[String],
        for_identity: bool,
    ) -> Result<()> {
        let catalog = Arc::clone(self.engine.catalog());
        let deptype = if for_identity {
            DependencyType::Internal
        } else {
            DependencyType::Auto
        };

        let target = match owned_by {
            [none] if none == "none" => None,
            [] | [_] => {
                return Err(SequenceError::SyntaxError("invalid OWNED BY option".into()));
            }
            [relname @ .., attname] => {
                let tableid = self.resolve_relation(&relname.join("."))?;
                txn.lock_relation(relation_lock_tag(tableid), LockMode::AccessShare)?;
                let table = catalog.relation(tableid)?;
                if !table.kind.can_own_sequences() {
                    return Err(SequenceError::WrongObjectType(format!(
                        "sequence cannot be owned by relation \"{}\"",
                        table.name
                    )));
                }
                if seqrel.owner != table.owner {
                    return Err(SequenceError::PrerequisiteState(
                        "sequence must have same owner as table it is linked to".into(),
                    ));
                }
                if seqrel.namespace != table.namespace {
                    return Err(SequenceError::PrerequisiteState(
                        "sequence must be in same schema as table it is linked to".into(),
                    ));
                }
                let column = table.column(attname).ok_or_else(|| {
                    SequenceError::UndefinedTable(format!(
                        "column \"{attname}\" of relation \"{}\" does not exist",
                        table.name
                    ))
                })?;
                Some((tableid, i32::from(column.attnum)))
            }
        };

        if deptype == DependencyType::Auto {
            if let Some((tableid, _)) = catalog.sequence_is_owned(seqrel.oid, DependencyType::Internal) {
                debug!(
                    sequence = %seqrel.name,
                    table = tableid,
                    "sequence is linked to an identity column"
                );
                return Err(SequenceError::FeatureNotSupported(
                    "cannot change ownership of identity sequence".into(),
                ));
            }
        }

        let previous: Vec<DependForm> = catalog
            .dependencies_of(seqrel.oid)
            .into_iter()
            .filter(|d| d.deptype == deptype)
            .collect();
        catalog.delete_dependencies(seqrel.oid, deptype);
        if let Some((tableid, attnum)) = target {
            catalog.record_dependency(DependForm {
                objid: seqrel.oid,
                refobjid: tableid,
                refobjsubid: attnum,
                deptype,
            });
        }
        let seqid = seqrel.oid;
        txn.on_abort(move || {
            catalog.delete_dependencies(seqid, deptype);
            for dep in previous {
                catalog.record_dependency(dep);
            }
        });
        Ok(())
    }
}
