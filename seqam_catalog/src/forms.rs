//! Catalog row shapes.

use serde::{Deserialize, Serialize};

use seqam_storage::{Oid, Persistence, RelFileLocator};

use crate::acl::AclItem;

/// Kind of a relation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelKind {
    /// Ordinary table.
    Table,
    /// Sequence.
    Sequence,
    /// View.
    View,
    /// Index.
    Index,
    /// Foreign table.
    ForeignTable,
    /// Partitioned table.
    PartitionedTable,
}

impl RelKind {
    /// Whether a sequence may be attached to one of this relation's columns.
    pub fn can_own_sequences(self) -> bool {
        matches!(
            self,
            RelKind::Table | RelKind::ForeignTable | RelKind::View | RelKind::PartitionedTable
        )
    }
}

/// Column of a relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnForm {
    /// 1-based attribute number.
    pub attnum: i16,
    /// Column name.
    pub name: String,
    /// Type name as written in DDL.
    pub type_name: String,
    /// Generated as identity.
    pub identity: bool,
}

/// Relation row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationForm {
    /// Relation oid.
    pub oid: Oid,
    /// Unqualified name.
    pub name: String,
    /// Schema.
    pub namespace: Oid,
    /// Owning role.
    pub owner: Oid,
    /// Relation kind.
    pub kind: RelKind,
    /// Durability class.
    pub persistence: Persistence,
    /// Current storage; the relfilenumber changes on rewrite.
    pub locator: RelFileLocator,
    /// Access method (a sequence AM for sequences).
    pub am: Oid,
    /// Columns.
    pub columns: Vec<ColumnForm>,
    /// Explicit grants; `None` means owner-only defaults.
    pub acl: Option<Vec<AclItem>>,
}

impl RelationForm {
    /// Column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnForm> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether the relation keeps no WAL and lives in the backend only.
    pub fn is_temp(&self) -> bool {
        self.persistence == Persistence::Temp
    }

    /// Whether changes to the relation are WAL-logged.
    pub fn needs_wal(&self) -> bool {
        self.persistence == Persistence::Permanent
    }
}

/// Integer type backing a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeqType {
    /// 16-bit.
    Int2,
    /// 32-bit.
    Int4,
    /// 64-bit.
    Int8,
}

impl SeqType {
    /// Smallest value of the type.
    pub fn min(self) -> i64 {
        match self {
            SeqType::Int2 => i16::MIN as i64,
            SeqType::Int4 => i32::MIN as i64,
            SeqType::Int8 => i64::MIN,
        }
    }

    /// Largest value of the type.
    pub fn max(self) -> i64 {
        match self {
            SeqType::Int2 => i16::MAX as i64,
            SeqType::Int4 => i32::MAX as i64,
            SeqType::Int8 => i64::MAX,
        }
    }

    /// SQL spelling.
    pub fn name(self) -> &'static str {
        match self {
            SeqType::Int2 => "smallint",
            SeqType::Int4 => "integer",
            SeqType::Int8 => "bigint",
        }
    }

    /// Parse a type name. Returns `None` for types that cannot back a
    /// sequence.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "smallint" | "int2" => Some(SeqType::Int2),
            "integer" | "int" | "int4" => Some(SeqType::Int4),
            "bigint" | "int8" => Some(SeqType::Int8),
            _ => None,
        }
    }
}

/// Sequence parameters row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceForm {
    /// Sequence relation.
    pub relid: Oid,
    /// Backing integer type.
    pub seq_type: SeqType,
    /// START value.
    pub start: i64,
    /// INCREMENT.
    pub increment: i64,
    /// MAXVALUE.
    pub max: i64,
    /// MINVALUE.
    pub min: i64,
    /// CACHE.
    pub cache: i64,
    /// CYCLE.
    pub cycle: bool,
}

/// What kind of access method a row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AmKind {
    /// Table storage.
    Table,
    /// Sequence generation strategy.
    Sequence,
}

/// Access method row. `handler` names the routine factory registered with
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessMethodForm {
    /// Access method oid.
    pub oid: Oid,
    /// Name used in `USING`.
    pub name: String,
    /// Kind.
    pub kind: AmKind,
    /// Handler function name.
    pub handler: String,
}

/// Strength of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyType {
    /// Referenced object cannot be dropped without CASCADE.
    Normal,
    /// Dependent object is dropped with the referenced one.
    Auto,
    /// Dependent object is an implementation detail of the referenced one.
    Internal,
}

/// Dependency row: `objid` depends on column `refobjsubid` of `refobjid`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependForm {
    /// Dependent relation.
    pub objid: Oid,
    /// Referenced relation.
    pub refobjid: Oid,
    /// Referenced column, 0 for the whole relation.
    pub refobjsubid: i32,
    /// Dependency type.
    pub deptype: DependencyType,
}

/// Role row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleForm {
    /// Role oid.
    pub oid: Oid,
    /// Role name.
    pub name: String,
    /// Bypasses privilege checks.
    pub superuser: bool,
}

/// Schema row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceForm {
    /// Schema oid.
    pub oid: Oid,
    /// Schema name.
    pub name: String,
    /// Owning role.
    pub owner: Oid,
}
