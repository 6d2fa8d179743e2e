//! In-memory system catalog for sequence relations.
//!
//! Rows live behind one `RwLock` and are handed out as clones. Updates are
//! applied immediately; callers that need transactional behaviour register
//! undo actions with their transaction. The whole catalog can be written to
//! and read back from a JSON snapshot.
#![deny(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use seqam_storage::{Oid, RelFileNumber};

pub mod acl;
pub mod forms;

pub use acl::{AclItem, AclMode, ACL_ALL_RIGHTS_SEQUENCE, ACL_SELECT, ACL_UPDATE, ACL_USAGE};
pub use forms::{
    AccessMethodForm, AmKind, ColumnForm, DependForm, DependencyType, NamespaceForm, RelKind,
    RelationForm, RoleForm, SeqType, SequenceForm,
};

/// Superuser created at bootstrap.
pub const BOOTSTRAP_SUPERUSER_ID: Oid = 10;
/// System schema.
pub const PG_CATALOG_NAMESPACE: Oid = 11;
/// Default user schema.
pub const PUBLIC_NAMESPACE: Oid = 2200;
/// Default tablespace.
pub const DEFAULT_TABLESPACE_OID: Oid = 1663;
/// Database every relation lives in.
pub const DEFAULT_DATABASE_OID: Oid = 5;
/// Heap table access method.
pub const HEAP_TABLE_AM_OID: Oid = 2;
/// Built-in local sequence access method.
pub const LOCAL_SEQUENCE_AM_OID: Oid = 6023;
/// First oid handed to user objects.
pub const FIRST_NORMAL_OBJECT_ID: Oid = 16384;

/// Name of the built-in sequence access method.
pub const LOCAL_SEQUENCE_AM_NAME: &str = "seqlocal";
/// Handler of the built-in sequence access method.
pub const LOCAL_SEQUENCE_AM_HANDLER: &str = "seq_local_sequenceam_handler";

/// Catalog lookup and update failures.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No relation with this oid.
    #[error("could not open relation with OID {0}")]
    RelationNotFound(Oid),
    /// Relation name already taken in the schema.
    #[error("relation \"{0}\" already exists")]
    DuplicateRelation(String),
    /// No sequence parameters for this relation.
    #[error("cache lookup failed for sequence {0}")]
    SequenceNotFound(Oid),
    /// No access method with this oid.
    #[error("cache lookup failed for access method {0}")]
    AccessMethodNotFound(Oid),
    /// Access method name already taken.
    #[error("access method \"{0}\" already exists")]
    DuplicateAccessMethod(String),
    /// Unknown schema.
    #[error("schema \"{0}\" does not exist")]
    NamespaceNotFound(String),
    /// Unknown role.
    #[error("role \"{0}\" does not exist")]
    RoleNotFound(String),
    /// Snapshot file problem.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Snapshot encoding problem.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogData {
    next_oid: Oid,
    next_relfilenumber: RelFileNumber,
    roles: BTreeMap<Oid, RoleForm>,
    namespaces: BTreeMap<Oid, NamespaceForm>,
    relations: BTreeMap<Oid, RelationForm>,
    sequences: BTreeMap<Oid, SequenceForm>,
    access_methods: BTreeMap<Oid, AccessMethodForm>,
    depends: Vec<DependForm>,
}

impl CatalogData {
    fn bootstrap() -> Self {
        let mut data = Self {
            next_oid: FIRST_NORMAL_OBJECT_ID,
            next_relfilenumber: FIRST_NORMAL_OBJECT_ID,
            roles: BTreeMap::new(),
            namespaces: BTreeMap::new(),
            relations: BTreeMap::new(),
            sequences: BTreeMap::new(),
            access_methods: BTreeMap::new(),
            depends: Vec::new(),
        };
        data.roles.insert(
            BOOTSTRAP_SUPERUSER_ID,
            RoleForm {
                oid: BOOTSTRAP_SUPERUSER_ID,
                name: "postgres".into(),
                superuser: true,
            },
        );
        for (oid, name) in [(PG_CATALOG_NAMESPACE, "pg_catalog"), (PUBLIC_NAMESPACE, "public")] {
            data.namespaces.insert(
                oid,
                NamespaceForm {
                    oid,
                    name: name.into(),
                    owner: BOOTSTRAP_SUPERUSER_ID,
                },
            );
        }
        data.access_methods.insert(
            HEAP_TABLE_AM_OID,
            AccessMethodForm {
                oid: HEAP_TABLE_AM_OID,
                name: "heap".into(),
                kind: AmKind::Table,
                handler: "heap_tableam_handler".into(),
            },
        );
        data.access_methods.insert(
            LOCAL_SEQUENCE_AM_OID,
            AccessMethodForm {
                oid: LOCAL_SEQUENCE_AM_OID,
                name: LOCAL_SEQUENCE_AM_NAME.into(),
                kind: AmKind::Sequence,
                handler: LOCAL_SEQUENCE_AM_HANDLER.into(),
            },
        );
        data
    }
}

/// System catalog.
#[derive(Debug)]
pub struct Catalog {
    data: RwLock<CatalogData>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// Catalog holding only bootstrap rows.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(CatalogData::bootstrap()),
        }
    }

    /// Read a snapshot written by [`Catalog::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let data: CatalogData = serde_json::from_str(&text)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            relations = data.relations.len(),
            "catalog loaded"
        );
        Ok(Self {
            data: RwLock::new(data),
        })
    }

    /// Load `path` if it exists, otherwise bootstrap.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Write a snapshot, replacing the file atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(&*self.data.read())?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Allocate an object id.
    pub fn next_oid(&self) -> Oid {
        let mut data = self.data.write();
        let oid = data.next_oid;
        data.next_oid += 1;
        oid
    }

    /// Allocate a relation file number that no relation uses yet.
    pub fn next_relfilenumber(&self) -> RelFileNumber {
        let mut data = self.data.write();
        loop {
            let candidate = data.next_relfilenumber;
            data.next_relfilenumber += 1;
            let in_use = data
                .relations
                .values()
                .any(|r| r.locator.rel_number == candidate);
            if !in_use {
                return candidate;
            }
        }
    }

    // ---- roles and schemas ----

    /// Add a role.
    pub fn create_role(&self, name: &str, superuser: bool) -> Oid {
        let oid = self.next_oid();
        self.data.write().roles.insert(
            oid,
            RoleForm {
                oid,
                name: name.to_string(),
                superuser,
            },
        );
        oid
    }

    /// Role by name.
    pub fn role_oid(&self, name: &str) -> Result<Oid> {
        self.data
            .read()
            .roles
            .values()
            .find(|r| r.name == name)
            .map(|r| r.oid)
            .ok_or_else(|| CatalogError::RoleNotFound(name.to_string()))
    }

    /// Role name, or the numeric oid when unknown.
    pub fn role_name(&self, oid: Oid) -> String {
        self.data
            .read()
            .roles
            .get(&oid)
            .map(|r| r.name.clone())
            .unwrap_or_else(|| oid.to_string())
    }

    /// Whether `role` bypasses privilege checks.
    pub fn is_superuser(&self, role: Oid) -> bool {
        self.data
            .read()
            .roles
            .get(&role)
            .map(|r| r.superuser)
            .unwrap_or(false)
    }

    /// Add a schema.
    pub fn create_namespace(&self, name: &str, owner: Oid) -> Oid {
        let oid = self.next_oid();
        self.data.write().namespaces.insert(
            oid,
            NamespaceForm {
                oid,
                name: name.to_string(),
                owner,
            },
        );
        oid
    }

    /// Schema by name.
    pub fn namespace_oid(&self, name: &str) -> Result<Oid> {
        self.data
            .read()
            .namespaces
            .values()
            .find(|n| n.name == name)
            .map(|n| n.oid)
            .ok_or_else(|| CatalogError::NamespaceNotFound(name.to_string()))
    }

    /// Schema name, or the numeric oid when unknown.
    pub fn namespace_name(&self, oid: Oid) -> String {
        self.data
            .read()
            .namespaces
            .get(&oid)
            .map(|n| n.name.clone())
            .unwrap_or_else(|| oid.to_string())
    }

    // ---- relations ----

    /// Insert a relation row. Names are unique per schema.
    pub fn insert_relation(&self, form: RelationForm) -> Result<()> {
        let mut data = self.data.write();
        let taken = data
            .relations
            .values()
            .any(|r| r.namespace == form.namespace && r.name == form.name);
        if taken {
            return Err(CatalogError::DuplicateRelation(form.name));
        }
        data.relations.insert(form.oid, form);
        Ok(())
    }

    /// Relation row.
    pub fn relation(&self, oid: Oid) -> Result<RelationForm> {
        self.data
            .read()
            .relations
            .get(&oid)
            .cloned()
            .ok_or(CatalogError::RelationNotFound(oid))
    }

    /// Whether a relation row exists.
    pub fn relation_exists(&self, oid: Oid) -> bool {
        self.data.read().relations.contains_key(&oid)
    }

    /// Relation oid by schema and name.
    pub fn relname_get_relid(&self, namespace: Oid, name: &str) -> Option<Oid> {
        self.data
            .read()
            .relations
            .values()
            .find(|r| r.namespace == namespace && r.name == name)
            .map(|r| r.oid)
    }

    /// Modify a relation row in place.
    pub fn update_relation<T>(&self, oid: Oid, f: impl FnOnce(&mut RelationForm) -> T) -> Result<T> {
        let mut data = self.data.write();
        let form = data
            .relations
            .get_mut(&oid)
            .ok_or(CatalogError::RelationNotFound(oid))?;
        Ok(f(form))
    }

    /// Remove a relation row with its sequence row and dependencies.
    pub fn remove_relation(&self, oid: Oid) -> Option<RelationForm> {
        let mut data = self.data.write();
        data.sequences.remove(&oid);
        data.depends.retain(|d| d.objid != oid && d.refobjid != oid);
        data.relations.remove(&oid)
    }

    /// Every relation of a kind.
    pub fn relations_of_kind(&self, kind: RelKind) -> Vec<RelationForm> {
        self.data
            .read()
            .relations
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    // ---- sequences ----

    /// Insert or replace a sequence parameters row.
    pub fn upsert_sequence(&self, form: SequenceForm) {
        self.data.write().sequences.insert(form.relid, form);
    }

    /// Sequence parameters row.
    pub fn sequence(&self, relid: Oid) -> Result<SequenceForm> {
        self.data
            .read()
            .sequences
            .get(&relid)
            .cloned()
            .ok_or(CatalogError::SequenceNotFound(relid))
    }

    // ---- access methods ----

    /// Register an access method row.
    pub fn insert_access_method(&self, form: AccessMethodForm) -> Result<()> {
        let mut data = self.data.write();
        if data.access_methods.values().any(|am| am.name == form.name) {
            return Err(CatalogError::DuplicateAccessMethod(form.name));
        }
        data.access_methods.insert(form.oid, form);
        Ok(())
    }

    /// Access method row.
    pub fn access_method(&self, oid: Oid) -> Result<AccessMethodForm> {
        self.data
            .read()
            .access_methods
            .get(&oid)
            .cloned()
            .ok_or(CatalogError::AccessMethodNotFound(oid))
    }

    /// Access method row by name.
    pub fn access_method_by_name(&self, name: &str) -> Option<AccessMethodForm> {
        self.data
            .read()
            .access_methods
            .values()
            .find(|am| am.name == name)
            .cloned()
    }

    // ---- dependencies ----

    /// Record that `dep.objid` depends on `dep.refobjid`.
    pub fn record_dependency(&self, dep: DependForm) {
        let mut data = self.data.write();
        if !data.depends.contains(&dep) {
            data.depends.push(dep);
        }
    }

    /// Remove dependencies of `objid` with type `deptype`, returning how many
    /// went away.
    pub fn delete_dependencies(&self, objid: Oid, deptype: DependencyType) -> usize {
        let mut data = self.data.write();
        let before = data.depends.len();
        data.depends
            .retain(|d| !(d.objid == objid && d.deptype == deptype));
        before - data.depends.len()
    }

    /// Dependencies recorded for `objid`.
    pub fn dependencies_of(&self, objid: Oid) -> Vec<DependForm> {
        self.data
            .read()
            .depends
            .iter()
            .filter(|d| d.objid == objid)
            .cloned()
            .collect()
    }

    /// Objects depending on `refobjid` with type `deptype`.
    pub fn dependents_of(&self, refobjid: Oid, deptype: DependencyType) -> Vec<DependForm> {
        self.data
            .read()
            .depends
            .iter()
            .filter(|d| d.refobjid == refobjid && d.deptype == deptype)
            .cloned()
            .collect()
    }

    /// Table and column owning a sequence through a dependency of `deptype`.
    pub fn sequence_is_owned(&self, seqid: Oid, deptype: DependencyType) -> Option<(Oid, i32)> {
        self.data
            .read()
            .depends
            .iter()
            .find(|d| d.objid == seqid && d.deptype == deptype && d.refobjsubid != 0)
            .map(|d| (d.refobjid, d.refobjsubid))
    }

    // ---- privileges ----

    /// Bits of `mask` that `role` holds on relation `relid`. Owners hold
    /// every sequence privilege; superusers hold everything.
    pub fn relation_privileges(&self, relid: Oid, role: Oid, mask: AclMode) -> Result<AclMode> {
        let data = self.data.read();
        let form = data
            .relations
            .get(&relid)
            .ok_or(CatalogError::RelationNotFound(relid))?;
        let superuser = data.roles.get(&role).map(|r| r.superuser).unwrap_or(false);
        if superuser || form.owner == role {
            return Ok(mask);
        }
        Ok(form
            .acl
            .as_deref()
            .map(|acl| acl::granted(acl, role, mask))
            .unwrap_or(0))
    }

    /// Grant privileges on a relation.
    pub fn grant(&self, relid: Oid, grantee: Oid, privs: AclMode) -> Result<()> {
        self.update_relation(relid, |form| {
            acl::grant(form.acl.get_or_insert_with(Vec::new), grantee, privs)
        })
    }

    /// Revoke privileges on a relation.
    pub fn revoke(&self, relid: Oid, grantee: Oid, privs: AclMode) -> Result<()> {
        self.update_relation(relid, |form| {
            if let Some(acl) = form.acl.as_mut() {
                acl::revoke(acl, grantee, privs);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqam_storage::{Persistence, RelFileLocator};

    fn relation(catalog: &Catalog, name: &str, kind: RelKind, owner: Oid) -> RelationForm {
        let oid = catalog.next_oid();
        RelationForm {
            oid,
            name: name.into(),
            namespace: PUBLIC_NAMESPACE,
            owner,
            kind,
            persistence: Persistence::Permanent,
            locator: RelFileLocator {
                spc_oid: DEFAULT_TABLESPACE_OID,
                db_oid: DEFAULT_DATABASE_OID,
                rel_number: catalog.next_relfilenumber(),
            },
            am: LOCAL_SEQUENCE_AM_OID,
            columns: Vec::new(),
            acl: None,
        }
    }

    #[test]
    fn bootstrap_has_local_sequence_am() {
        let catalog = Catalog::new();
        let am = catalog.access_method_by_name("seqlocal").unwrap();
        assert_eq!(am.oid, LOCAL_SEQUENCE_AM_OID);
        assert_eq!(am.kind, AmKind::Sequence);
        assert!(catalog.is_superuser(BOOTSTRAP_SUPERUSER_ID));
        assert_eq!(catalog.namespace_oid("public").unwrap(), PUBLIC_NAMESPACE);
    }

    #[test]
    fn relation_names_are_unique_per_schema() {
        let catalog = Catalog::new();
        let a = relation(&catalog, "s", RelKind::Sequence, BOOTSTRAP_SUPERUSER_ID);
        let b = relation(&catalog, "s", RelKind::Sequence, BOOTSTRAP_SUPERUSER_ID);
        catalog.insert_relation(a.clone()).unwrap();
        assert!(matches!(
            catalog.insert_relation(b),
            Err(CatalogError::DuplicateRelation(_))
        ));
        assert_eq!(catalog.relname_get_relid(PUBLIC_NAMESPACE, "s"), Some(a.oid));
    }

    #[test]
    fn relfilenumbers_skip_numbers_in_use() {
        let catalog = Catalog::new();
        let mut form = relation(&catalog, "t", RelKind::Table, BOOTSTRAP_SUPERUSER_ID);
        let taken = catalog.next_relfilenumber() + 1;
        form.locator.rel_number = taken;
        catalog.insert_relation(form).unwrap();
        let next = catalog.next_relfilenumber();
        assert_ne!(next, taken);
        assert_ne!(catalog.next_relfilenumber(), taken);
    }

    #[test]
    fn ownership_dependencies() {
        let catalog = Catalog::new();
        let seq = relation(&catalog, "s", RelKind::Sequence, BOOTSTRAP_SUPERUSER_ID);
        let seqid = seq.oid;
        catalog.insert_relation(seq).unwrap();
        catalog.record_dependency(DependForm {
            objid: seqid,
            refobjid: 900,
            refobjsubid: 1,
            deptype: DependencyType::Auto,
        });
        assert_eq!(catalog.sequence_is_owned(seqid, DependencyType::Auto), Some((900, 1)));
        assert_eq!(catalog.sequence_is_owned(seqid, DependencyType::Internal), None);
        assert_eq!(catalog.delete_dependencies(seqid, DependencyType::Auto), 1);
        assert_eq!(catalog.sequence_is_owned(seqid, DependencyType::Auto), None);
    }

    #[test]
    fn privileges_follow_owner_and_grants() {
        let catalog = Catalog::new();
        let alice = catalog.create_role("alice", false);
        let bob = catalog.create_role("bob", false);
        let seq = relation(&catalog, "s", RelKind::Sequence, alice);
        let seqid = seq.oid;
        catalog.insert_relation(seq).unwrap();

        assert_eq!(
            catalog.relation_privileges(seqid, alice, ACL_UPDATE).unwrap(),
            ACL_UPDATE
        );
        assert_eq!(catalog.relation_privileges(seqid, bob, ACL_UPDATE).unwrap(), 0);
        catalog.grant(seqid, bob, ACL_USAGE).unwrap();
        assert_eq!(
            catalog
                .relation_privileges(seqid, bob, ACL_USAGE | ACL_UPDATE)
                .unwrap(),
            ACL_USAGE
        );
        assert_eq!(
            catalog
                .relation_privileges(seqid, BOOTSTRAP_SUPERUSER_ID, ACL_UPDATE)
                .unwrap(),
            ACL_UPDATE
        );
    }

    #[test]
    fn snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let catalog = Catalog::new();
        let seq = relation(&catalog, "s", RelKind::Sequence, BOOTSTRAP_SUPERUSER_ID);
        let seqid = seq.oid;
        catalog.insert_relation(seq).unwrap();
        catalog.upsert_sequence(SequenceForm {
            relid: seqid,
            seq_type: SeqType::Int8,
            start: 1,
            increment: 1,
            max: i64::MAX,
            min: 1,
            cache: 1,
            cycle: false,
        });
        catalog.save(&path).unwrap();

        let loaded = Catalog::open(&path).unwrap();
        assert_eq!(loaded.relation(seqid).unwrap(), catalog.relation(seqid).unwrap());
        assert_eq!(loaded.sequence(seqid).unwrap().max, i64::MAX);
        assert!(loaded.next_oid() > seqid);
    }
}
