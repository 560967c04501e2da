//! Participants touched by one transaction

use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use shardtx_clock::OpTime;
use shardtx_common::{ParticipantId, PrepareVote, VoteState};
use std::ops::Deref;

/// One shard's view of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub vote: VoteState,
    /// Set when the participant voted yes
    pub prepare_timestamp: Option<OpTime>,
    /// The participant acknowledged the decision
    pub acknowledged: bool,
}

impl Participant {
    fn new(id: ParticipantId) -> Self {
        Self {
            id,
            vote: VoteState::Unvoted,
            prepare_timestamp: None,
            acknowledged: false,
        }
    }
}

/// Immutable participant set handed out by [`ParticipantRegistry::freeze`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantList(Vec<ParticipantId>);

impl ParticipantList {
    pub fn into_vec(self) -> Vec<ParticipantId> {
        self.0
    }
}

impl Deref for ParticipantList {
    type Target = [ParticipantId];

    fn deref(&self) -> &[ParticipantId] {
        &self.0
    }
}

impl From<Vec<ParticipantId>> for ParticipantList {
    fn from(ids: Vec<ParticipantId>) -> Self {
        Self(ids)
    }
}

/// Accumulates participants until prepare begins, then exposes them immutably.
///
/// Insertion order is kept so the persisted list is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRegistry {
    participants: Vec<Participant>,
    frozen: bool,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry reconstructed from a persisted list, already frozen
    pub fn frozen_with(ids: &[ParticipantId]) -> Self {
        Self {
            participants: ids.iter().cloned().map(Participant::new).collect(),
            frozen: true,
        }
    }

    /// Add a participant. Returns true if it was not present yet.
    pub fn add_participant(&mut self, id: ParticipantId) -> Result<bool> {
        if self.contains(&id) {
            return Ok(false);
        }
        if self.frozen {
            return Err(SessionError::TooLateToAddParticipant(id));
        }
        self.participants.push(Participant::new(id));
        Ok(true)
    }

    /// Fix the participant set. May only be called once.
    pub fn freeze(&mut self) -> Result<ParticipantList> {
        if self.frozen {
            return Err(SessionError::AlreadyFrozen);
        }
        self.frozen = true;
        Ok(self.list())
    }

    /// Freeze without handing out the list. Used when the transaction ends
    /// without a commit, so late operations cannot add participants.
    pub(crate) fn seal(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn list(&self) -> ParticipantList {
        ParticipantList(self.participants.iter().map(|p| p.id.clone()).collect())
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.iter().any(|p| &p.id == id)
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn get_mut(&mut self, id: &ParticipantId) -> Result<&mut Participant> {
        self.participants
            .iter_mut()
            .find(|p| &p.id == id)
            .ok_or_else(|| SessionError::UnknownParticipant(id.clone()))
    }

    /// Record a participant's prepare vote. `None` records a vote timeout,
    /// which counts as a no.
    pub fn record_vote(&mut self, id: &ParticipantId, vote: Option<&PrepareVote>) -> Result<()> {
        let participant = self.get_mut(id)?;
        match vote {
            Some(PrepareVote::Commit { prepare_timestamp }) => {
                participant.vote = VoteState::PreparedYes;
                participant.prepare_timestamp = Some(*prepare_timestamp);
            }
            Some(PrepareVote::Abort { .. }) | None => {
                participant.vote = VoteState::PreparedNo;
            }
        }
        Ok(())
    }

    /// True only if every participant voted yes
    pub fn all_voted_yes(&self) -> bool {
        self.participants
            .iter()
            .all(|p| p.vote == VoteState::PreparedYes)
    }

    /// Commit timestamp for a unanimous yes: the latest prepare timestamp
    pub fn max_prepare_timestamp(&self) -> Option<OpTime> {
        self.participants
            .iter()
            .filter_map(|p| p.prepare_timestamp)
            .max()
    }

    pub fn mark_acknowledged(&mut self, id: &ParticipantId) -> Result<()> {
        self.get_mut(id)?.acknowledged = true;
        Ok(())
    }

    pub fn all_acknowledged(&self) -> bool {
        self.participants.iter().all(|p| p.acknowledged)
    }
}
