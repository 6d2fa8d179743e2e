//! Heavyweight relation locks with blocking waits and wait-for graph
//! deadlock detection.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::LocalTransactionId;

/// Owner of a lock: the top-level transaction that requested it.
pub type LockOwner = LocalTransactionId;

/// Lockable object: a relation inside a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockTag {
    /// Database oid.
    pub db_oid: u32,
    /// Relation oid.
    pub rel_oid: u32,
}

/// Table-level lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Plain reads.
    AccessShare,
    /// SELECT FOR UPDATE.
    RowShare,
    /// Data modification, including nextval/setval.
    RowExclusive,
    /// Maintenance that must not run concurrently with itself.
    ShareUpdateExclusive,
    /// Blocks writers.
    Share,
    /// ALTER SEQUENCE.
    ShareRowExclusive,
    /// Blocks everything but plain reads.
    Exclusive,
    /// Rewrites and drops.
    AccessExclusive,
}

impl LockMode {
    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    fn conflict_mask(self) -> u8 {
        use LockMode::*;
        let modes: &[LockMode] = match self {
            AccessShare => &[AccessExclusive],
            RowShare => &[Exclusive, AccessExclusive],
            RowExclusive => &[Share, ShareRowExclusive, Exclusive, AccessExclusive],
            ShareUpdateExclusive => &[
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Share => &[
                RowExclusive,
                ShareUpdateExclusive,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            ShareRowExclusive => &[
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Exclusive => &[
                RowShare,
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            AccessExclusive => &[
                AccessShare,
                RowShare,
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
        };
        modes.iter().fold(0, |acc, m| acc | m.bit())
    }

    /// Whether two modes held by different owners conflict.
    pub fn conflicts(self, other: Self) -> bool {
        self.conflict_mask() & other.bit() != 0
    }

    /// Whether holding `self` blocks everything `other` blocks, so a
    /// request for `other` needs no new grant.
    pub fn covers(self, other: Self) -> bool {
        let needed = other.conflict_mask();
        self.conflict_mask() & needed == needed
    }
}

/// Lock table entry.
#[derive(Default)]
struct LockEntry {
    granted: Vec<(LockOwner, LockMode)>,
    waiting: VecDeque<(LockOwner, LockMode)>,
}

impl LockEntry {
    fn held(&self, owner: LockOwner, mode: LockMode) -> bool {
        self.granted
            .iter()
            .any(|&(o, m)| o == owner && m.covers(mode))
    }

    fn grantable(&self, owner: LockOwner, mode: LockMode) -> bool {
        self.granted
            .iter()
            .all(|&(o, m)| o == owner || !m.conflicts(mode))
    }
}

/// Lock acquisition failure.
#[derive(Debug, Error)]
pub enum LockError {
    /// Waiting would close a cycle in the wait-for graph.
    #[error("deadlock detected: transaction {owner:?} waiting for {mode:?} on relation {rel_oid}")]
    Deadlock {
        /// Requesting transaction.
        owner: LockOwner,
        /// Requested mode.
        mode: LockMode,
        /// Relation requested.
        rel_oid: u32,
    },
}

/// Lock manager shared by all sessions.
#[derive(Default)]
pub struct LockManager {
    table: Mutex<HashMap<LockTag, LockEntry>>,
    released: Condvar,
}

impl LockManager {
    /// Acquire a lock, blocking while incompatible holders exist.
    pub fn lock(&self, owner: LockOwner, tag: LockTag, mode: LockMode) -> Result<(), LockError> {
        let mut tbl = self.table.lock();
        loop {
            let entry = tbl.entry(tag).or_default();
            if entry.held(owner, mode) {
                return Ok(());
            }
            if entry.grantable(owner, mode) {
                entry.waiting.retain(|&(o, _)| o != owner);
                entry.granted.push((owner, mode));
                return Ok(());
            }
            if !entry.waiting.iter().any(|&(o, _)| o == owner) {
                entry.waiting.push_back((owner, mode));
            }
            if Self::detect_deadlock(&tbl, owner) {
                if let Some(entry) = tbl.get_mut(&tag) {
                    entry.waiting.retain(|&(o, _)| o != owner);
                }
                tracing::warn!(?owner, ?mode, rel_oid = tag.rel_oid, "deadlock detected");
                return Err(LockError::Deadlock {
                    owner,
                    mode,
                    rel_oid: tag.rel_oid,
                });
            }
            self.released.wait(&mut tbl);
        }
    }

    /// Whether `owner` holds `mode` (or a stronger mode) on `tag`.
    pub fn holds(&self, owner: LockOwner, tag: LockTag, mode: LockMode) -> bool {
        self.table
            .lock()
            .get(&tag)
            .map(|e| e.held(owner, mode))
            .unwrap_or(false)
    }

    /// Release all locks held by `owner`.
    pub fn release_all(&self, owner: LockOwner) {
        let mut tbl = self.table.lock();
        for entry in tbl.values_mut() {
            entry.granted.retain(|&(o, _)| o != owner);
            entry.waiting.retain(|&(o, _)| o != owner);
        }
        tbl.retain(|_, e| !e.granted.is_empty() || !e.waiting.is_empty());
        drop(tbl);
        self.released.notify_all();
    }

    /// Cycle detection over "waiter -> conflicting holder" edges.
    fn detect_deadlock(tbl: &HashMap<LockTag, LockEntry>, start: LockOwner) -> bool {
        let mut graph: HashMap<LockOwner, HashSet<LockOwner>> = HashMap::new();
        for entry in tbl.values() {
            for &(waiter, mode) in &entry.waiting {
                let holders = entry
                    .granted
                    .iter()
                    .filter(|&&(o, m)| o != waiter && m.conflicts(mode))
                    .map(|&(o, _)| o);
                graph.entry(waiter).or_default().extend(holders);
            }
        }
        // BFS to find cycle to start.
        let mut queue = VecDeque::new();
        let mut visited = HashSet::new();
        queue.push_back(start);
        while let Some(txn) = queue.pop_front() {
            if !visited.insert(txn) {
                continue;
            }
            if let Some(neigh) = graph.get(&txn) {
                for &n in neigh {
                    if n == start {
                        return true;
                    }
                    queue.push_back(n);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const R1: LockTag = LockTag {
        db_oid: 5,
        rel_oid: 1,
    };
    const R2: LockTag = LockTag {
        db_oid: 5,
        rel_oid: 2,
    };

    #[test]
    fn conflict_table_matches_documented_modes() {
        use LockMode::*;
        assert!(!RowExclusive.conflicts(RowExclusive));
        assert!(RowExclusive.conflicts(ShareRowExclusive));
        assert!(ShareRowExclusive.conflicts(ShareRowExclusive));
        assert!(AccessExclusive.conflicts(AccessShare));
        assert!(!AccessShare.conflicts(RowExclusive));
        for a in [AccessShare, RowExclusive, Share, AccessExclusive] {
            for b in [AccessShare, RowExclusive, Share, AccessExclusive] {
                assert_eq!(a.conflicts(b), b.conflicts(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn lock_grant_and_reentry() {
        let lm = LockManager::default();
        let t1 = LocalTransactionId(1);
        let t2 = LocalTransactionId(2);
        lm.lock(t1, R1, LockMode::RowExclusive).unwrap();
        lm.lock(t2, R1, LockMode::RowExclusive).unwrap(); // compatible
        lm.lock(t1, R2, LockMode::AccessExclusive).unwrap();
        lm.lock(t1, R2, LockMode::RowExclusive).unwrap(); // own locks never conflict
        assert!(lm.holds(t1, R2, LockMode::Share));
        lm.release_all(t1);
        assert!(!lm.holds(t1, R2, LockMode::AccessShare));
    }

    #[test]
    fn relocking_adds_no_grant() {
        let lm = LockManager::default();
        let t1 = LocalTransactionId(1);
        for _ in 0..10 {
            lm.lock(t1, R1, LockMode::RowExclusive).unwrap();
        }
        lm.lock(t1, R1, LockMode::AccessShare).unwrap();
        assert_eq!(lm.table.lock()[&R1].granted.len(), 1);

        lm.lock(t1, R1, LockMode::ShareRowExclusive).unwrap();
        lm.lock(t1, R1, LockMode::RowExclusive).unwrap();
        assert_eq!(lm.table.lock()[&R1].granted.len(), 2);
    }

    #[test]
    fn strength_follows_the_conflict_table() {
        use LockMode::*;
        assert!(ShareRowExclusive.covers(RowExclusive));
        assert!(ShareRowExclusive.covers(Share));
        assert!(AccessExclusive.covers(Exclusive));
        assert!(!Share.covers(RowExclusive));
        assert!(!RowExclusive.covers(Share));

        let lm = LockManager::default();
        let t1 = LocalTransactionId(1);
        lm.lock(t1, R1, Share).unwrap();
        assert!(lm.holds(t1, R1, AccessShare));
        assert!(!lm.holds(t1, R1, RowExclusive));
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let lm = Arc::new(LockManager::default());
        let t1 = LocalTransactionId(1);
        lm.lock(t1, R1, LockMode::AccessExclusive).unwrap();
        let waiter = {
            let lm = Arc::clone(&lm);
            std::thread::spawn(move || {
                lm.lock(LocalTransactionId(2), R1, LockMode::RowExclusive)
                    .unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        lm.release_all(t1);
        waiter.join().unwrap();
        assert!(lm.holds(LocalTransactionId(2), R1, LockMode::RowExclusive));
    }

    #[test]
    fn deadlock_is_reported_to_the_second_waiter() {
        let lm = Arc::new(LockManager::default());
        let t1 = LocalTransactionId(1);
        let t2 = LocalTransactionId(2);
        lm.lock(t1, R1, LockMode::AccessExclusive).unwrap();
        lm.lock(t2, R2, LockMode::AccessExclusive).unwrap();
        let first = {
            let lm = Arc::clone(&lm);
            std::thread::spawn(move || lm.lock(t1, R2, LockMode::AccessExclusive))
        };
        std::thread::sleep(Duration::from_millis(20));
        let res = lm.lock(t2, R1, LockMode::AccessExclusive);
        assert!(matches!(res, Err(LockError::Deadlock { .. })));
        lm.release_all(t2);
        assert!(first.join().unwrap().is_ok());
    }
}
