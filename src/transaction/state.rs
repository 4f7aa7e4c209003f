//! Transaction state structures
//!
//! Defines the status machine and the metadata the coordinator keeps for
//! every transaction that has not finished yet.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::id::TxnId;
use crate::error::{Result, StreamlineError};

/// Transaction status machine
///
/// ```text
/// Open ──> Committing ──> Committed
///   └────> Aborting ────> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    Open,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnStatus {
    /// Check if this status allows registering participants
    pub fn can_add_participants(&self) -> bool {
        matches!(self, TxnStatus::Open)
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }

    /// Check if the outcome is decided but not yet applied everywhere
    pub fn is_ending(&self) -> bool {
        matches!(self, TxnStatus::Committing | TxnStatus::Aborting)
    }

    pub fn can_transition_to(&self, next: TxnStatus) -> bool {
        matches!(
            (self, next),
            (TxnStatus::Open, TxnStatus::Committing)
                | (TxnStatus::Open, TxnStatus::Aborting)
                | (TxnStatus::Committing, TxnStatus::Committed)
                | (TxnStatus::Aborting, TxnStatus::Aborted)
        )
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnStatus::Open => write!(f, "Open"),
            TxnStatus::Committing => write!(f, "Committing"),
            TxnStatus::Committed => write!(f, "Committed"),
            TxnStatus::Aborting => write!(f, "Aborting"),
            TxnStatus::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Outcome requested for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnAction {
    Commit,
    Abort,
}

impl TxnAction {
    /// Status recorded while participants are being told
    pub fn ending_status(&self) -> TxnStatus {
        match self {
            TxnAction::Commit => TxnStatus::Committing,
            TxnAction::Abort => TxnStatus::Aborting,
        }
    }

    /// Status recorded once every participant confirmed
    pub fn final_status(&self) -> TxnStatus {
        match self {
            TxnAction::Commit => TxnStatus::Committed,
            TxnAction::Abort => TxnStatus::Aborted,
        }
    }

    /// The action a recovered ending status resumes
    pub fn resumed_from(status: TxnStatus) -> Option<TxnAction> {
        match status {
            TxnStatus::Committing => Some(TxnAction::Commit),
            TxnStatus::Aborting => Some(TxnAction::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for TxnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnAction::Commit => write!(f, "commit"),
            TxnAction::Abort => write!(f, "abort"),
        }
    }
}

/// A resource touched by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TxnParticipant {
    /// Topic that received transactional messages
    Topic(String),
    /// Subscription that recorded transactional acknowledgments
    Subscription { topic: String, subscription: String },
}

impl TxnParticipant {
    pub fn topic(topic: impl Into<String>) -> Self {
        TxnParticipant::Topic(topic.into())
    }

    pub fn subscription(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        TxnParticipant::Subscription {
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }
}

impl fmt::Display for TxnParticipant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnParticipant::Topic(t) => write!(f, "{}", t),
            TxnParticipant::Subscription {
                topic,
                subscription,
            } => write!(f, "{}/{}", topic, subscription),
        }
    }
}

/// Coordinator-side metadata of one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnMeta {
    pub id: TxnId,
    pub status: TxnStatus,
    pub owner: Option<String>,
    pub timeout_ms: i64,
    pub opened_at_ms: i64,
    pub produced_topics: BTreeSet<String>,
    pub acked_subscriptions: BTreeSet<(String, String)>,
}

impl TxnMeta {
    pub fn new(id: TxnId, timeout_ms: i64, opened_at_ms: i64, owner: Option<String>) -> Self {
        Self {
            id,
            status: TxnStatus::Open,
            owner,
            timeout_ms,
            opened_at_ms,
            produced_topics: BTreeSet::new(),
            acked_subscriptions: BTreeSet::new(),
        }
    }

    /// Record a participant, returning false if it was already known
    pub fn add_participant(&mut self, participant: &TxnParticipant) -> bool {
        match participant {
            TxnParticipant::Topic(t) => self.produced_topics.insert(t.clone()),
            TxnParticipant::Subscription {
                topic,
                subscription,
            } => self
                .acked_subscriptions
                .insert((topic.clone(), subscription.clone())),
        }
    }

    pub fn remove_participant(&mut self, participant: &TxnParticipant) {
        match participant {
            TxnParticipant::Topic(t) => {
                self.produced_topics.remove(t);
            }
            TxnParticipant::Subscription {
                topic,
                subscription,
            } => {
                self.acked_subscriptions
                    .remove(&(topic.clone(), subscription.clone()));
            }
        }
    }

    pub fn has_participant(&self, participant: &TxnParticipant) -> bool {
        match participant {
            TxnParticipant::Topic(t) => self.produced_topics.contains(t),
            TxnParticipant::Subscription {
                topic,
                subscription,
            } => self
                .acked_subscriptions
                .contains(&(topic.clone(), subscription.clone())),
        }
    }

    /// Every participant, topics first
    pub fn participants(&self) -> Vec<TxnParticipant> {
        self.produced_topics
            .iter()
            .map(|t| TxnParticipant::Topic(t.clone()))
            .chain(
                self.acked_subscriptions
                    .iter()
                    .map(|(t, s)| TxnParticipant::subscription(t.clone(), s.clone())),
            )
            .collect()
    }

    /// Move to `next`, rejecting transitions the status machine does not allow
    pub fn transition(&mut self, next: TxnStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            let expected = match next {
                TxnStatus::Committed => TxnStatus::Committing,
                TxnStatus::Aborted => TxnStatus::Aborting,
                _ => TxnStatus::Open,
            };
            return Err(StreamlineError::invalid_txn_state(
                self.id,
                expected,
                self.status,
            ));
        }
        self.status = next;
        Ok(())
    }

    pub fn deadline_ms(&self) -> i64 {
        self.opened_at_ms.saturating_add(self.timeout_ms)
    }

    pub fn is_timed_out(&self, now_ms: i64) -> bool {
        self.status == TxnStatus::Open && now_ms >= self.deadline_ms()
    }

    pub fn remaining_timeout_ms(&self, now_ms: i64) -> i64 {
        (self.deadline_ms() - now_ms).max(0)
    }
}
