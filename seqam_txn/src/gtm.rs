//! Id allocators for transactions.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::{LocalTransactionId, TransactionId};

/// Issues monotonically increasing transaction ids.
#[derive(Debug)]
pub struct Gtm {
    next_xid: AtomicU32,
    next_lxid: AtomicU32,
}

impl Default for Gtm {
    fn default() -> Self {
        Self::starting_at(TransactionId::FIRST_NORMAL)
    }
}

impl Gtm {
    /// Allocator whose next permanent id is `next`, as recovered from WAL.
    pub fn starting_at(next: TransactionId) -> Self {
        Self {
            next_xid: AtomicU32::new(next.0.max(TransactionId::FIRST_NORMAL.0)),
            next_lxid: AtomicU32::new(1),
        }
    }

    /// Allocate a permanent transaction id.
    #[inline]
    pub fn alloc_xid(&self) -> TransactionId {
        TransactionId(self.next_xid.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocate a local transaction id.
    #[inline]
    pub fn alloc_lxid(&self) -> LocalTransactionId {
        LocalTransactionId(self.next_lxid.fetch_add(1, Ordering::Relaxed))
    }

    /// Make sure future ids are above `seen`.
    pub fn advance_past(&self, seen: TransactionId) {
        self.next_xid.fetch_max(seen.0.saturating_add(1), Ordering::Relaxed);
    }

    /// Next permanent id that would be handed out.
    pub fn peek_next_xid(&self) -> TransactionId {
        TransactionId(self.next_xid.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_skip_reserved_values() {
        let gtm = Gtm::default();
        let a = gtm.alloc_xid();
        let b = gtm.alloc_xid();
        assert_eq!(a, TransactionId::FIRST_NORMAL);
        assert!(b > a);
        assert_ne!(gtm.alloc_lxid(), gtm.alloc_lxid());
    }

    #[test]
    fn advance_past_recovered_ids() {
        let gtm = Gtm::starting_at(TransactionId(0));
        assert_eq!(gtm.peek_next_xid(), TransactionId::FIRST_NORMAL);
        gtm.advance_past(TransactionId(40));
        assert_eq!(gtm.alloc_xid(), TransactionId(41));
        gtm.advance_past(TransactionId(10));
        assert_eq!(gtm.alloc_xid(), TransactionId(42));
    }
}
