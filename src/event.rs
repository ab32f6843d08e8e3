use std::fmt::{Debug, Display};

use chrono::{DateTime, Utc};
use ethers::types::H256;
use uuid::Uuid;

/// Unique identifier of a tracked event. Used as primary key in the db.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Deserialize, serde::Serialize)]
pub struct EventUuid(Uuid);

impl EventUuid {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventUuid {
    fn default() -> Self {
        Self(Uuid::nil())
    }
}

impl Display for EventUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for EventUuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventUuid({})", self.0)
    }
}

impl AsRef<Uuid> for EventUuid {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize, Default)]
pub enum EventStatus {
    /// default state; the transaction has not reached the target depth yet
    #[default]
    Pending,
    /// enough independent notifiers reported the event, still short of
    /// the target chain depth
    Confirmed,
    /// the transaction reverted on chain; terminal
    Failed,
    /// the target confirmation depth was reached; terminal
    Finalized,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Failed | EventStatus::Finalized)
    }

    fn rank(&self) -> u8 {
        match self {
            EventStatus::Pending => 0,
            EventStatus::Confirmed => 1,
            EventStatus::Failed => 2,
            EventStatus::Finalized => 3,
        }
    }

    /// Moves the status forward only. A terminal status never changes and
    /// no transition may lower the rank, so Finalized can never regress.
    pub fn promote(&mut self, next: EventStatus) -> bool {
        if self.is_terminal() || next.rank() <= self.rank() {
            return false;
        }
        *self = next;
        true
    }
}

/// Durable record of a submitted transaction tracked to finality. Created
/// on enqueue, mutated only by the sync worker's processing pass, never
/// deleted here (retention is an external concern).
#[derive(Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct TrackedEvent {
    /// unique event identifier. Primary key in the db.
    pub uuid: EventUuid,
    pub tx_hash: H256,
    /// opaque caller-supplied value printed in logs, e.g. a nullifier hash
    pub correlation_id: String,
    pub status: EventStatus,
    /// highest chain confirmation depth observed so far; never decreases
    pub confirmations: u64,
    /// how many times independent callers reported this same event;
    /// distinct from chain confirmations
    pub acknowledgements: u32,
    /// processing passes spent on this event so far
    pub attempts: u32,
    /// None means eligible for processing immediately
    pub next_attempt_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Debug for TrackedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedEvent")
            .field("uuid", &self.uuid)
            .field("tx_hash", &self.tx_hash)
            .field("correlation_id", &self.correlation_id)
            .field("status", &self.status)
            .field("confirmations", &self.confirmations)
            .field("acknowledgements", &self.acknowledgements)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl TrackedEvent {
    pub fn new(tx_hash: H256, correlation_id: String) -> Self {
        let now = Utc::now();
        Self {
            uuid: EventUuid::random(),
            tx_hash,
            correlation_id,
            status: EventStatus::Pending,
            confirmations: 0,
            acknowledgements: 1,
            attempts: 0,
            next_attempt_after: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the processing pass should pick this event up: not yet
    /// terminal, attempt budget left, and the retry timestamp (if any)
    /// has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        !self.status.is_terminal()
            && self.attempts < max_attempts
            && self.next_attempt_after.map_or(true, |after| after <= now)
    }

    /// Records a newly observed confirmation depth without ever lowering
    /// the stored count.
    pub fn record_confirmations(&mut self, depth: u64) {
        self.confirmations = self.confirmations.max(depth);
    }

    #[cfg(test)]
    pub fn random() -> Self {
        Self::new(H256::random(), format!("event-{}", EventUuid::random()))
    }
}

/// Transient bookkeeping for a transaction between submission and the end
/// of confirmation polling.
#[derive(Debug, Clone)]
pub struct PendingTransaction {
    pub tx_hash: H256,
    pub target_confirmations: u64,
    pub attempts: u32,
    pub correlation_id: String,
    pub nonce: u64,
}
