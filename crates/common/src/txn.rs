//! Transaction identifiers and the transaction state machine

use crate::SessionId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Per-session transaction attempt counter.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TxnNumber(pub u64);

impl TxnNumber {
    pub fn next(&self) -> Self {
        TxnNumber(self.0 + 1)
    }
}

impl fmt::Display for TxnNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TxnNumber {
    fn from(n: u64) -> Self {
        TxnNumber(n)
    }
}

/// One transaction attempt: `(session_id, txn_number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId {
    pub session_id: SessionId,
    pub txn_number: TxnNumber,
}

impl TxnId {
    pub fn new(session_id: SessionId, txn_number: impl Into<TxnNumber>) -> Self {
        Self {
            session_id,
            txn_number: txn_number.into(),
        }
    }

    /// Storage key: session bytes followed by the big-endian txn number, so
    /// keys of one session are contiguous and ordered by attempt.
    pub fn to_key(&self) -> Vec<u8> {
        let mut key = self.session_id.to_bytes().to_vec();
        key.extend_from_slice(&self.txn_number.0.to_be_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Result<Self, String> {
        if key.len() != 41 {
            return Err(format!("Invalid transaction key length: {}", key.len()));
        }

        let session_id = SessionId::from_bytes(&key[..33])?;
        let mut number = [0u8; 8];
        number.copy_from_slice(&key[33..]);

        Ok(Self::new(session_id, u64::from_be_bytes(number)))
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.txn_number)
    }
}

/// A shard or storage partition taking part in a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle of a transaction record.
///
/// Transitions only move forward: `InProgress -> Prepared -> {Committed | Aborted}`.
/// An in-progress transaction may also end directly (empty commit, early abort).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    InProgress,
    Prepared,
    Committed,
    Aborted,
}

impl TxnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnState::Committed | TxnState::Aborted)
    }

    pub fn can_transition_to(&self, next: TxnState) -> bool {
        match (self, next) {
            (TxnState::InProgress, TxnState::Prepared)
            | (TxnState::InProgress, TxnState::Committed)
            | (TxnState::InProgress, TxnState::Aborted)
            | (TxnState::Prepared, TxnState::Committed)
            | (TxnState::Prepared, TxnState::Aborted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnState::InProgress => "inProgress",
            TxnState::Prepared => "prepared",
            TxnState::Committed => "committed",
            TxnState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip_and_order() {
        let session = SessionId::new();
        let t1 = TxnId::new(session, 1);
        let t2 = TxnId::new(session, 256);

        assert_eq!(TxnId::from_key(&t1.to_key()).unwrap(), t1);
        assert!(t1.to_key() < t2.to_key());
        assert!(TxnId::from_key(b"short").is_err());
    }

    #[test]
    fn test_state_transitions() {
        use TxnState::*;

        assert!(InProgress.can_transition_to(Prepared));
        assert!(Prepared.can_transition_to(Committed));
        assert!(Prepared.can_transition_to(Aborted));
        assert!(InProgress.can_transition_to(Aborted));

        assert!(!Prepared.can_transition_to(InProgress));
        assert!(!Committed.can_transition_to(Aborted));
        assert!(!Aborted.can_transition_to(Committed));
        assert!(!Committed.can_transition_to(Committed));
    }
}
