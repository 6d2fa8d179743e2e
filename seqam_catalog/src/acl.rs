//! Privilege bits and grant lists.

use serde::{Deserialize, Serialize};

use seqam_storage::Oid;

/// Set of privilege bits.
pub type AclMode = u32;

/// INSERT.
pub const ACL_INSERT: AclMode = 1 << 0;
/// SELECT, also `currval` and reading sequence state.
pub const ACL_SELECT: AclMode = 1 << 1;
/// UPDATE, also `nextval` and `setval`.
pub const ACL_UPDATE: AclMode = 1 << 2;
/// USAGE, `nextval` and `currval`.
pub const ACL_USAGE: AclMode = 1 << 8;
/// Everything a sequence owner holds.
pub const ACL_ALL_RIGHTS_SEQUENCE: AclMode = ACL_SELECT | ACL_UPDATE | ACL_USAGE;

/// Grantee standing for every role.
pub const ACL_ID_PUBLIC: Oid = 0;

/// One grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclItem {
    /// Role receiving the privileges, or [`ACL_ID_PUBLIC`].
    pub grantee: Oid,
    /// Granted bits.
    pub privs: AclMode,
}

/// Bits of `mask` held by `role` through `acl`, ignoring ownership.
pub fn granted(acl: &[AclItem], role: Oid, mask: AclMode) -> AclMode {
    acl.iter()
        .filter(|item| item.grantee == role || item.grantee == ACL_ID_PUBLIC)
        .fold(0, |acc, item| acc | (item.privs & mask))
}

/// Add `privs` for `grantee`, merging with an existing entry.
pub fn grant(acl: &mut Vec<AclItem>, grantee: Oid, privs: AclMode) {
    match acl.iter_mut().find(|item| item.grantee == grantee) {
        Some(item) => item.privs |= privs,
        None => acl.push(AclItem { grantee, privs }),
    }
}

/// Remove `privs` from `grantee`.
pub fn revoke(acl: &mut Vec<AclItem>, grantee: Oid, privs: AclMode) {
    for item in acl.iter_mut().filter(|item| item.grantee == grantee) {
        item.privs &= !privs;
    }
    acl.retain(|item| item.privs != 0);
}
