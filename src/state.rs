//! Attempt and ATR entry state machines
//!
//! Both machines only move forward. The attempt checks its own transitions in
//! memory; ATR entry writes are checked against the stored state by
//! [`transition_entry`](crate::repository::transition_entry) under CAS, so a
//! regression is reported instead of being written.

use serde::{Deserialize, Serialize};

/// Illegal state change
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("illegal transition {from} -> {to}")]
pub struct IllegalTransition {
    /// Current state
    pub from: &'static str,
    /// Requested state
    pub to: &'static str,
}

/// Phase of an attempt, as tracked in memory by its context
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AttemptState {
    /// No mutation staged yet
    NotStarted,
    /// At least one mutation staged; ATR entry is PENDING
    Staging,
    /// Commit requested, commit point not yet durable
    Committing,
    /// ATR entry is COMMITTED
    Committed,
    /// Every mutation unstaged; ATR entry is COMPLETED
    Completed,
    /// Reverting staged mutations
    RollingBack,
    /// Every mutation reverted
    RolledBack,
}

impl AttemptState {
    /// Name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Staging => "STAGING",
            Self::Committing => "COMMITTING",
            Self::Committed => "COMMITTED",
            Self::Completed => "COMPLETED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// Whether `to` follows `self` in the legal graph
    pub fn can_transition_to(&self, to: AttemptState) -> bool {
        use AttemptState::*;
        matches!(
            (self, to),
            (NotStarted, Staging)
                | (NotStarted, Committing)
                | (NotStarted, RollingBack)
                | (Staging, Committing)
                | (Staging, RollingBack)
                | (Committing, Committed)
                | (Committing, Completed)
                | (Committing, RollingBack)
                | (Committed, Completed)
                | (RollingBack, RolledBack)
        )
    }

    /// Checked transition
    pub fn transition(self, to: AttemptState) -> Result<AttemptState, IllegalTransition> {
        if self == to || self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self.name(), to: to.name() })
        }
    }

    /// Terminal states accept no further operations
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

/// State of an ATR entry, as persisted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AtrState {
    /// Attempt is staging
    Pending,
    /// Commit point reached
    Committed,
    /// Every mutation unstaged
    Completed,
    /// Rollback started
    Aborted,
    /// Every mutation reverted
    RolledBack,
    /// Written by a newer protocol version
    #[serde(other)]
    Unknown,
}

impl AtrState {
    /// Name as persisted
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Committed => "COMMITTED",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::RolledBack => "ROLLED_BACK",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether `to` follows `self`.
    ///
    /// Observed sequences are subsequences of PENDING, COMMITTED, COMPLETED or
    /// PENDING, ABORTED, ROLLED_BACK.
    pub fn can_transition_to(&self, to: AtrState) -> bool {
        use AtrState::*;
        matches!(
            (self, to),
            (Pending, Committed)
                | (Pending, Aborted)
                | (Pending, Completed)
                | (Pending, RolledBack)
                | (Committed, Completed)
                | (Aborted, RolledBack)
        )
    }

    /// Checked transition
    pub fn transition(self, to: AtrState) -> Result<AtrState, IllegalTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self.name(), to: to.name() })
        }
    }

    /// Nothing left to do for this attempt's documents
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

impl std::fmt::Display for AtrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
