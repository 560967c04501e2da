//! In-memory transaction records

use crate::error::{Result, SessionError};
use crate::registry::ParticipantRegistry;
use serde::{Deserialize, Serialize};
use shardtx_clock::OpTime;
use shardtx_common::{AbortReason, TxnId, TxnState};

/// One attempt to commit a distributed transaction.
///
/// Owns its participant entries. State only moves forward and the terminal
/// op time is written exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    txn: TxnId,
    state: TxnState,
    start_op_time: OpTime,
    commit_op_time: Option<OpTime>,
    abort_op_time: Option<OpTime>,
    abort_reason: Option<AbortReason>,
    participants: ParticipantRegistry,
}

impl TransactionRecord {
    pub fn new(txn: TxnId, start_op_time: OpTime) -> Self {
        Self {
            txn,
            state: TxnState::InProgress,
            start_op_time,
            commit_op_time: None,
            abort_op_time: None,
            abort_reason: None,
            participants: ParticipantRegistry::new(),
        }
    }

    pub fn txn(&self) -> TxnId {
        self.txn
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn start_op_time(&self) -> OpTime {
        self.start_op_time
    }

    pub fn commit_op_time(&self) -> Option<OpTime> {
        self.commit_op_time
    }

    pub fn abort_op_time(&self) -> Option<OpTime> {
        self.abort_op_time
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        self.abort_reason.as_ref()
    }

    pub fn participants(&self) -> &ParticipantRegistry {
        &self.participants
    }

    pub fn participants_mut(&mut self) -> &mut ParticipantRegistry {
        &mut self.participants
    }

    /// Commit has begun once the participant list is frozen. A terminal
    /// record is always frozen.
    pub fn commit_started(&self) -> bool {
        self.participants.is_frozen()
    }

    /// Move to `next`. Repeating the current terminal state is a no-op, which
    /// keeps replayed decisions harmless.
    pub fn transition(&mut self, next: TxnState, at: OpTime) -> Result<()> {
        if self.state == next && next.is_terminal() {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                txn: self.txn,
                from: self.state,
                to: next,
            });
        }

        match next {
            TxnState::Committed => self.commit_op_time = Some(at),
            TxnState::Aborted => self.abort_op_time = Some(at),
            TxnState::InProgress | TxnState::Prepared => {}
        }
        if next.is_terminal() {
            self.participants.seal();
        }
        self.state = next;
        Ok(())
    }

    pub fn abort(&mut self, reason: AbortReason, at: OpTime) -> Result<()> {
        let was_aborted = self.state == TxnState::Aborted;
        self.transition(TxnState::Aborted, at)?;
        if !was_aborted {
            self.abort_reason = Some(reason);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardtx_common::SessionId;

    fn record() -> TransactionRecord {
        TransactionRecord::new(TxnId::new(SessionId::new(), 1), OpTime::new(1, 0))
    }

    #[test]
    fn test_state_moves_forward_only() {
        let mut rec = record();
        rec.transition(TxnState::Prepared, OpTime::new(2, 0)).unwrap();
        rec.transition(TxnState::Committed, OpTime::new(3, 0)).unwrap();

        assert!(matches!(
            rec.transition(TxnState::Aborted, OpTime::new(4, 0)),
            Err(SessionError::InvalidTransition { .. })
        ));
        assert!(rec.transition(TxnState::InProgress, OpTime::new(4, 0)).is_err());
        assert_eq!(rec.state(), TxnState::Committed);
    }

    #[test]
    fn test_terminal_op_time_written_once() {
        let mut rec = record();
        rec.abort(AbortReason::Explicit, OpTime::new(5, 0)).unwrap();
        rec.abort(AbortReason::LifetimeExpired, OpTime::new(9, 0))
            .unwrap();

        assert_eq!(rec.abort_op_time(), Some(OpTime::new(5, 0)));
        assert_eq!(rec.abort_reason(), Some(&AbortReason::Explicit));
        assert_eq!(rec.commit_op_time(), None);
    }

    #[test]
    fn test_aborted_record_takes_no_new_participants() {
        let mut rec = record();
        rec.participants_mut()
            .add_participant("shard-a".into())
            .unwrap();
        rec.abort(AbortReason::SessionKilled, OpTime::new(2, 0))
            .unwrap();

        assert!(matches!(
            rec.participants_mut().add_participant("shard-b".into()),
            Err(SessionError::TooLateToAddParticipant(_))
        ));
        assert_eq!(rec.participants().len(), 1);
    }
}
