//! The single outstanding-confirmation slot of a session.
//!
//! A confirmation is answerable only while it sits in the slot, its sequence
//! number equals the session's current one and its expiry has not passed.
//! Resolution always empties the slot, so one confirmation can be acted on at
//! most once.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::attempt::Attempt;

/// A proposal waiting for the user's decision.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub confirm_id: String,
    /// Session sequence number when the proposal was made.
    pub seq: u64,
    pub attempt: Attempt,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Instant,
}

impl PendingConfirmation {
    pub fn new(seq: u64, mut attempt: Attempt, description: String, expires_at: Instant) -> Self {
        let confirm_id = uuid::Uuid::new_v4().simple().to_string();
        attempt.confirm_id = Some(confirm_id.clone());
        Self {
            confirm_id,
            seq,
            attempt,
            description,
            created_at: Utc::now(),
            expires_at,
        }
    }
}

/// What a `confirm` call resolved to.
#[derive(Debug)]
pub enum Resolution {
    /// No pending confirmation with that id. Nothing changed.
    Unknown,
    Stale(PendingConfirmation),
    Expired(PendingConfirmation),
    Rejected(PendingConfirmation),
    Approved(PendingConfirmation),
}

#[derive(Debug, Default)]
pub enum ConfirmationSlot {
    #[default]
    Empty,
    Pending(Box<PendingConfirmation>),
}

impl ConfirmationSlot {
    pub fn pending(&self) -> Option<&PendingConfirmation> {
        match self {
            Self::Empty => None,
            Self::Pending(p) => Some(p),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    /// Install `pending`, handing back whatever it displaced.
    pub fn replace(&mut self, pending: PendingConfirmation) -> Option<PendingConfirmation> {
        match std::mem::replace(self, Self::Pending(Box::new(pending))) {
            Self::Empty => None,
            Self::Pending(old) => Some(*old),
        }
    }

    pub fn take(&mut self) -> Option<PendingConfirmation> {
        match std::mem::take(self) {
            Self::Empty => None,
            Self::Pending(p) => Some(*p),
        }
    }

    /// Remove the pending confirmation if its expiry has passed.
    pub fn take_expired(&mut self, now: Instant) -> Option<PendingConfirmation> {
        match self {
            Self::Pending(p) if p.expires_at <= now => self.take(),
            _ => None,
        }
    }

    /// Answer the pending confirmation. Staleness is checked before expiry,
    /// expiry before the user's answer.
    pub fn resolve(&mut self, confirm_id: &str, approved: bool, now: Instant, current_seq: u64) -> Resolution {
        let matches = self.pending().is_some_and(|p| p.confirm_id == confirm_id);
        if !matches {
            return Resolution::Unknown;
        }
        let Some(pending) = self.take() else {
            return Resolution::Unknown;
        };
        if pending.seq != current_seq {
            Resolution::Stale(pending)
        } else if pending.expires_at <= now {
            Resolution::Expired(pending)
        } else if approved {
            Resolution::Approved(pending)
        } else {
            Resolution::Rejected(pending)
        }
    }
}

/// Why a confirmation left the slot without being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retirement {
    Answered,
    Expired,
    Superseded,
    Cancelled,
}

impl Retirement {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Answered => "was already answered",
            Self::Expired => "has expired",
            Self::Superseded => "was superseded by a newer message",
            Self::Cancelled => "was cancelled",
        }
    }
}

/// Recently retired confirmation ids, so a late answer gets a precise error
/// instead of "unknown".
#[derive(Debug)]
pub struct RetiredConfirmations {
    entries: VecDeque<(String, Retirement)>,
    capacity: usize,
}

impl Default for RetiredConfirmations {
    fn default() -> Self {
        Self::with_capacity(32)
    }
}

impl RetiredConfirmations {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn retire(&mut self, confirm_id: &str, why: Retirement) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((confirm_id.to_string(), why));
    }

    pub fn get(&self, confirm_id: &str) -> Option<Retirement> {
        self.entries
            .iter()
            .rev()
            .find(|(id, _)| id == confirm_id)
            .map(|(_, why)| *why)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::session::ToolCallRecord;
    use crate::skills::testing::descriptor;
    use crate::skills::{ActionCategory, BoundParams};

    fn pending(seq: u64, ttl: Duration) -> PendingConfirmation {
        let d = Arc::new(descriptor("pg", "query", ActionCategory::Write, true, vec![]));
        let attempt = Attempt::new(
            ToolCallRecord {
                id: "c".into(),
                tool: "pg__query".into(),
                arguments: "{}".into(),
            },
            Some(d),
            BoundParams::default(),
        );
        PendingConfirmation::new(seq, attempt, "Run pg.query".into(), Instant::now() + ttl)
    }

    #[tokio::test]
    async fn approve_once() {
        let mut slot = ConfirmationSlot::default();
        let p = pending(1, Duration::from_secs(60));
        let id = p.confirm_id.clone();
        assert_eq!(p.attempt.confirm_id.as_deref(), Some(id.as_str()));
        slot.replace(p);

        assert!(matches!(slot.resolve(&id, true, Instant::now(), 1), Resolution::Approved(_)));
        assert!(!slot.is_pending());
        assert!(matches!(slot.resolve(&id, true, Instant::now(), 1), Resolution::Unknown));
    }

    #[tokio::test]
    async fn wrong_id_leaves_slot_intact() {
        let mut slot = ConfirmationSlot::default();
        slot.replace(pending(1, Duration::from_secs(60)));
        assert!(matches!(slot.resolve("guess", true, Instant::now(), 1), Resolution::Unknown));
        assert!(slot.is_pending());
    }

    #[tokio::test]
    async fn stale_beats_approval() {
        let mut slot = ConfirmationSlot::default();
        let p = pending(1, Duration::from_secs(60));
        let id = p.confirm_id.clone();
        slot.replace(p);
        assert!(matches!(slot.resolve(&id, true, Instant::now(), 2), Resolution::Stale(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_beats_approval() {
        let mut slot = ConfirmationSlot::default();
        let p = pending(1, Duration::from_secs(60));
        let id = p.confirm_id.clone();
        slot.replace(p);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(slot.resolve(&id, true, Instant::now(), 1), Resolution::Expired(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn take_expired_only_after_deadline() {
        let mut slot = ConfirmationSlot::default();
        slot.replace(pending(1, Duration::from_secs(10)));
        assert!(slot.take_expired(Instant::now()).is_none());
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(slot.take_expired(Instant::now()).is_some());
    }

    #[tokio::test]
    async fn replace_returns_displaced() {
        let mut slot = ConfirmationSlot::default();
        assert!(slot.replace(pending(1, Duration::from_secs(60))).is_none());
        assert!(slot.replace(pending(1, Duration::from_secs(60))).is_some());
    }

    #[test]
    fn retired_ring_is_bounded() {
        let mut retired = RetiredConfirmations::with_capacity(2);
        retired.retire("a", Retirement::Expired);
        retired.retire("b", Retirement::Superseded);
        retired.retire("c", Retirement::Answered);
        assert_eq!(retired.get("a"), None);
        assert_eq!(retired.get("b"), Some(Retirement::Superseded));
        assert_eq!(retired.get("c").map(Retirement::describe), Some("was already answered"));
    }
}
