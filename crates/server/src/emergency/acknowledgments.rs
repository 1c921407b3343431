//! Acknowledgment bookkeeping for one emergency.

use crate::emergency::types::{Acknowledgment, millis_between};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

/// Result of recording an acknowledgment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AckRecord {
    /// First acknowledgment from this recipient.
    First,
    /// The recipient already acknowledged; carries the original record.
    Duplicate(Acknowledgment),
}

/// At most one acknowledgment per recipient, first writer wins.
#[derive(Debug, Default)]
pub struct AcknowledgmentStore {
    acks: DashMap<String, Acknowledgment>,
}

impl AcknowledgmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_acknowledgments(acks: impl IntoIterator<Item = Acknowledgment>) -> Self {
        let store = Self::new();
        for ack in acks {
            store.acks.entry(ack.recipient_id.clone()).or_insert(ack);
        }
        store
    }

    pub fn record(&self, ack: Acknowledgment) -> AckRecord {
        match self.acks.entry(ack.recipient_id.clone()) {
            Entry::Occupied(existing) => AckRecord::Duplicate(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(ack);
                AckRecord::First
            }
        }
    }

    /// Undo a first record whose persistence failed.
    pub fn forget(&self, recipient_id: &str) {
        self.acks.remove(recipient_id);
    }

    pub fn get(&self, recipient_id: &str) -> Option<Acknowledgment> {
        self.acks.get(recipient_id).map(|a| a.clone())
    }

    pub fn has_acknowledged(&self, recipient_id: &str) -> bool {
        self.acks.contains_key(recipient_id)
    }

    pub fn count(&self) -> u32 {
        self.acks.len() as u32
    }

    pub fn all(&self) -> Vec<Acknowledgment> {
        let mut all: Vec<Acknowledgment> = self.acks.iter().map(|a| a.clone()).collect();
        all.sort_by_key(|a| a.acknowledged_at);
        all
    }

    /// A recipient is overdue once `timeout_ms` has passed since `started_at`
    /// without an acknowledgment.
    pub fn is_overdue(
        &self,
        recipient_id: &str,
        started_at: OffsetDateTime,
        timeout_ms: u64,
        now: OffsetDateTime,
    ) -> bool {
        !self.has_acknowledged(recipient_id) && millis_between(started_at, now) > timeout_ms
    }
}
