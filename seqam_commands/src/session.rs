//! Per-session sequence state: values prefetched through `CACHE`, the
//! `currval` of every sequence touched and the sequence `lastval` reads.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{instrument, trace};

use seqam_access::relation::relation_lock_tag;
use seqam_access::{
    sequence_get_state, sequence_nextval, sequence_setval, Engine, NextvalParams, Relation,
    Result, SequenceError,
};
use seqam_catalog::{AclMode, SequenceForm, ACL_SELECT, ACL_UPDATE, ACL_USAGE, PUBLIC_NAMESPACE};
use seqam_storage::{Oid, RelFileNumber};
use seqam_txn::{LocalTransactionId, LockMode, Transaction};

/// Cached state of one sequence in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqTableEntry {
    /// Sequence relation.
    pub relid: Oid,
    /// Storage the cached values were taken from; a different one means
    /// the sequence was rewritten since.
    pub filenumber: Option<RelFileNumber>,
    /// Transaction that holds the relation lock.
    pub lxid: LocalTransactionId,
    /// Whether `last` holds a value for `currval`.
    pub last_valid: bool,
    /// Value last returned by `nextval`.
    pub last: i64,
    /// Last value already reserved; equal to `last` when nothing is cached.
    pub cached: i64,
    /// Increment the cached values were reserved with.
    pub increment: i64,
}

impl SeqTableEntry {
    pub(crate) fn new(relid: Oid) -> Self {
        Self {
            relid,
            filenumber: None,
            lxid: LocalTransactionId::INVALID,
            last_valid: false,
            last: 0,
            cached: 0,
            increment: 0,
        }
    }
}

/// One client session. Entries live until [`Session::discard_sequences`],
/// even if the sequence is dropped.
pub struct Session {
    pub(crate) engine: Arc<Engine>,
    pub(crate) user: Oid,
    seqtab: HashMap<Oid, SeqTableEntry>,
    last_used: Option<Oid>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("sequences", &self.seqtab.len())
            .field("last_used", &self.last_used)
            .finish()
    }
}

/// Take the relation lock once per transaction and open the sequence.
pub(crate) fn lock_and_open_sequence<'a>(
    engine: &'a Engine,
    txn: &'a Transaction,
    elm: &mut SeqTableEntry,
) -> Result<Relation<'a>> {
    if elm.lxid != txn.lxid() {
        txn.lock_relation(relation_lock_tag(elm.relid), LockMode::RowExclusive)?;
        elm.lxid = txn.lxid();
    }
    Relation::sequence_open(engine, txn, elm.relid, None)
}

/// Open the sequence for `elm` and drop prefetched values if its storage
/// changed. `currval` state survives.
pub(crate) fn init_sequence<'a>(
    engine: &'a Engine,
    txn: &'a Transaction,
    elm: &mut SeqTableEntry,
) -> Result<Relation<'a>> {
    let rel = lock_and_open_sequence(engine, txn, elm)?;
    let filenumber = rel.locator().rel_number;
    if elm.filenumber != Some(filenumber) {
        elm.filenumber = Some(filenumber);
        elm.cached = elm.last;
    }
    Ok(rel)
}

impl Session {
    /// New session acting as role `user`.
    pub fn new(engine: Arc<Engine>, user: Oid) -> Self {
        Self {
            engine,
            user,
            seqtab: HashMap::new(),
            last_used: None,
        }
    }

    /// Engine the session runs against.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Role the session acts as.
    pub fn user(&self) -> Oid {
        self.user
    }

    /// Cached state of `relid`, if the session touched it.
    pub fn entry(&self, relid: Oid) -> Option<&SeqTableEntry> {
        self.seqtab.get(&relid)
    }

    /// Run `f` on the entry of `relid`, creating it first if needed. The
    /// entry is stored back even when `f` fails, like the lock it records.
    pub(crate) fn with_entry<T>(
        &mut self,
        relid: Oid,
        f: impl FnOnce(&Self, &mut SeqTableEntry) -> Result<T>,
    ) -> Result<T> {
        let mut elm = self
            .seqtab
            .get(&relid)
            .copied()
            .unwrap_or_else(|| SeqTableEntry::new(relid));
        let result = f(self, &mut elm);
        self.seqtab.insert(relid, elm);
        result
    }

    pub(crate) fn check_privileges(&self, rel: &Relation<'_>, mask: AclMode) -> Result<()> {
        if !self.has_privileges(rel.oid(), mask)? {
            return Err(SequenceError::PermissionDenied(format!(
                "permission denied for sequence {}",
                rel.name()
            )));
        }
        Ok(())
    }

    fn has_privileges(&self, relid: Oid, mask: AclMode) -> Result<bool> {
        let held = self
            .engine
            .catalog()
            .relation_privileges(relid, self.user, mask)?;
        Ok(held != 0)
    }

    /// Split `[schema.]name` into schema oid and relation name.
    pub(crate) fn qualified_name<'n>(&self, name: &'n str) -> Result<(Oid, &'n str)> {
        match name.rsplit_once('.') {
            Some((schema, rel)) => Ok((self.engine.catalog().namespace_oid(schema)?, rel)),
            None => Ok((PUBLIC_NAMESPACE, name)),
        }
    }

    /// Resolve `[schema.]name` to a relation oid.
    pub fn resolve_relation(&self, name: &str) -> Result<Oid> {
        let (namespace, relname) = self.qualified_name(name)?;
        self.engine
            .catalog()
            .relname_get_relid(namespace, relname)
            .ok_or_else(|| {
                SequenceError::UndefinedTable(format!("relation \"{name}\" does not exist"))
            })
    }

    /// Next value of `relid`, from the session cache when values are left.
    #[instrument(level = "debug", skip(self, txn), err)]
    pub fn nextval(&mut self, txn: &Transaction, relid: Oid) -> Result<i64> {
        self.nextval_internal(txn, relid, true)
    }

    /// `nextval` by `[schema.]name`.
    pub fn nextval_by_name(&mut self, txn: &Transaction, name: &str) -> Result<i64> {
        let relid = self.resolve_relation(name)?;
        self.nextval_internal(txn, relid, true)
    }

    /// `nextval` with an optional privilege check; internal callers such as
    /// column defaults skip it.
    pub fn nextval_internal(
        &mut self,
        txn: &Transaction,
        relid: Oid,
        check_permissions: bool,
    ) -> Result<i64> {
        let value = self.with_entry(relid, |s, elm| s.nextval_with(txn, elm, check_permissions))?;
        self.last_used = Some(relid);
        Ok(value)
    }

    fn nextval_with(
        &self,
        txn: &Transaction,
        elm: &mut SeqTableEntry,
        check_permissions: bool,
    ) -> Result<i64> {
        let mut rel = init_sequence(&self.engine, txn, elm)?;
        if check_permissions {
            self.check_privileges(&rel, ACL_USAGE | ACL_UPDATE)?;
        }
        if !rel.form().is_temp() {
            txn.prevent_if_read_only("nextval()")?;
        }
        txn.prevent_if_parallel_mode("nextval()")?;

        if elm.last != elm.cached {
            elm.last += elm.increment;
            trace!(relid = elm.relid, value = elm.last, "served from session cache");
            return Ok(elm.last);
        }

        let form = self.engine.catalog().sequence(elm.relid)?;
        let params = NextvalParams {
            incby: form.increment,
            maxv: form.max,
            minv: form.min,
            cache: form.cache,
            cycle: form.cycle,
        };
        let (result, last) = sequence_nextval(&mut rel, &params)?;

        elm.increment = form.increment;
        elm.last = result;
        elm.cached = last;
        elm.last_valid = true;
        Ok(result)
    }

    /// Value last returned by `nextval` for `relid` in this session.
    #[instrument(level = "debug", skip(self, txn), err)]
    pub fn currval(&mut self, txn: &Transaction, relid: Oid) -> Result<i64> {
        self.with_entry(relid, |s, elm| {
            let rel = init_sequence(&s.engine, txn, elm)?;
            s.check_privileges(&rel, ACL_SELECT | ACL_USAGE)?;
            if !elm.last_valid {
                return Err(SequenceError::NotYetDefined(format!(
                    "currval of sequence \"{}\" is not yet defined in this session",
                    rel.name()
                )));
            }
            Ok(elm.last)
        })
    }

    /// Value last returned by `nextval` for any sequence in this session.
    #[instrument(level = "debug", skip(self, txn), err)]
    pub fn lastval(&mut self, txn: &Transaction) -> Result<i64> {
        let not_yet =
            || SequenceError::NotYetDefined("lastval is not yet defined in this session".into());
        let relid = self.last_used.ok_or_else(not_yet)?;
        // The sequence may have been dropped since.
        if !self.engine.catalog().relation_exists(relid) {
            return Err(not_yet());
        }
        self.with_entry(relid, |s, elm| {
            let rel = lock_and_open_sequence(&s.engine, txn, elm)?;
            s.check_privileges(&rel, ACL_SELECT | ACL_USAGE)?;
            Ok(elm.last)
        })
    }

    /// Two-argument `setval`: the next `nextval` returns `next + increment`.
    pub fn setval(&mut self, txn: &Transaction, relid: Oid, next: i64) -> Result<i64> {
        self.do_setval(txn, relid, next, true)?;
        Ok(next)
    }

    /// Three-argument `setval`. With `is_called = false` the next `nextval`
    /// returns `next` itself and `currval` is left alone.
    pub fn setval3(
        &mut self,
        txn: &Transaction,
        relid: Oid,
        next: i64,
        is_called: bool,
    ) -> Result<i64> {
        self.do_setval(txn, relid, next, is_called)?;
        Ok(next)
    }

    #[instrument(level = "debug", skip(self, txn), err)]
    fn do_setval(&mut self, txn: &Transaction, relid: Oid, next: i64, is_called: bool) -> Result<()> {
        self.with_entry(relid, |s, elm| {
            let mut rel = init_sequence(&s.engine, txn, elm)?;
            s.check_privileges(&rel, ACL_UPDATE)?;
            let form = s.engine.catalog().sequence(relid)?;

            if !rel.form().is_temp() {
                txn.prevent_if_read_only("setval()")?;
            }
            txn.prevent_if_parallel_mode("setval()")?;

            if next < form.min || next > form.max {
                return Err(SequenceError::OutOfBounds(format!(
                    "setval: value {next} is out of bounds for sequence \"{}\" ({}..{})",
                    rel.name(),
                    form.min,
                    form.max
                )));
            }

            if is_called {
                elm.last = next;
                elm.last_valid = true;
            }
            elm.cached = elm.last;

            if rel.needs_wal() {
                txn.top_xid();
            }
            sequence_setval(&mut rel, next, is_called)
        })
    }

    /// Stored `last_value` of `relid`, or `None` when it was never called or
    /// the session may not read it.
    pub fn pg_sequence_last_value(&mut self, txn: &Transaction, relid: Oid) -> Result<Option<i64>> {
        self.with_entry(relid, |s, elm| {
            let mut rel = init_sequence(&s.engine, txn, elm)?;
            if !s.has_privileges(relid, ACL_SELECT | ACL_USAGE)? {
                return Ok(None);
            }
            let (last_value, is_called) = sequence_get_state(&mut rel)?;
            Ok(is_called.then_some(last_value))
        })
    }

    /// Stored `(last_value, is_called)` of `relid`, or `None` without
    /// `SELECT` privilege.
    pub fn pg_get_sequence_data(
        &mut self,
        txn: &Transaction,
        relid: Oid,
    ) -> Result<Option<(i64, bool)>> {
        self.with_entry(relid, |s, elm| {
            let mut rel = init_sequence(&s.engine, txn, elm)?;
            if !s.has_privileges(relid, ACL_SELECT)? {
                return Ok(None);
            }
            Ok(Some(sequence_get_state(&mut rel)?))
        })
    }

    /// Catalog parameters of `relid`.
    pub fn pg_sequence_parameters(&self, relid: Oid) -> Result<SequenceForm> {
        let catalog = self.engine.catalog();
        if !self.has_privileges(relid, ACL_SELECT | ACL_UPDATE | ACL_USAGE)? {
            return Err(SequenceError::PermissionDenied(format!(
                "permission denied for sequence {}",
                catalog.relation(relid)?.name
            )));
        }
        Ok(catalog.sequence(relid)?)
    }

    /// Forget every cached value and the `lastval` sequence.
    pub fn discard_sequences(&mut self) {
        self.seqtab.clear();
        self.last_used = None;
    }
}
