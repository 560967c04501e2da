//! Key-level write locks held by open transactions

use shardtx_common::TxnId;
use std::collections::HashMap;

/// Result of checking if a lock can be acquired
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LockAttemptResult {
    WouldGrant,
    Conflict { holder: TxnId },
}

/// Exclusive write locks. A transaction keeps its locks until it commits or
/// aborts, including while prepared.
#[derive(Debug, Default)]
pub(crate) struct LockManager {
    locks: HashMap<String, TxnId>,
}

impl LockManager {
    pub fn check(&self, txn: TxnId, key: &str) -> LockAttemptResult {
        match self.locks.get(key) {
            // Re-entrant for the holder
            Some(holder) if *holder != txn => LockAttemptResult::Conflict { holder: *holder },
            _ => LockAttemptResult::WouldGrant,
        }
    }

    pub fn grant(&mut self, txn: TxnId, key: String) {
        self.locks.insert(key, txn);
    }

    pub fn release_all(&mut self, txn: TxnId) {
        self.locks.retain(|_key, holder| *holder != txn);
    }

    /// Keys locked by `txn`, sorted for determinism
    pub fn locks_held_by(&self, txn: TxnId) -> Vec<String> {
        let mut keys: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, holder)| **holder == txn)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardtx_common::SessionId;

    #[test]
    fn test_locks_conflict_between_transactions() {
        let mut locks = LockManager::default();
        let t1 = TxnId::new(SessionId::new(), 1);
        let t2 = TxnId::new(SessionId::new(), 1);

        assert_eq!(locks.check(t1, "k"), LockAttemptResult::WouldGrant);
        locks.grant(t1, "k".to_string());

        assert_eq!(locks.check(t1, "k"), LockAttemptResult::WouldGrant);
        assert_eq!(
            locks.check(t2, "k"),
            LockAttemptResult::Conflict { holder: t1 }
        );

        locks.release_all(t1);
        assert_eq!(locks.check(t2, "k"), LockAttemptResult::WouldGrant);
        assert!(locks.locks_held_by(t1).is_empty());
    }
}
