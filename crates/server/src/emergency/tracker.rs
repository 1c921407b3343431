//! Per-(recipient, channel) delivery state and aggregate statistics.
//!
//! Results for the same delivery can arrive out of order (a retry's
//! "delivered" after a duplicate send's "failed"). They are merged so the most
//! progressed state wins: acknowledged > delivered > sent > failed > pending.
//! `escalated` is only entered through an escalation action and only an
//! acknowledgment moves a delivery out of it.

use crate::emergency::types::{DeliveryKey, DeliveryState, RecipientDelivery};
use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Outcome reported by a channel for one send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Delivered,
    Failed,
}

impl SendOutcome {
    fn state(self) -> DeliveryState {
        match self {
            SendOutcome::Sent => DeliveryState::Sent,
            SendOutcome::Delivered => DeliveryState::Delivered,
            SendOutcome::Failed => DeliveryState::Failed,
        }
    }
}

fn progress_rank(state: DeliveryState) -> u8 {
    match state {
        DeliveryState::Pending => 0,
        DeliveryState::Failed => 1,
        DeliveryState::Sent => 2,
        DeliveryState::Delivered => 3,
        DeliveryState::Acknowledged => 4,
        // Never compared by rank, see `merge_state`.
        DeliveryState::Escalated => 0,
    }
}

/// Combine the current state with an incoming one.
pub fn merge_state(current: DeliveryState, incoming: DeliveryState) -> DeliveryState {
    use DeliveryState::*;
    match (current, incoming) {
        (Acknowledged, _) | (_, Acknowledged) => Acknowledged,
        (Escalated, _) | (_, Escalated) => Escalated,
        _ if progress_rank(incoming) > progress_rank(current) => incoming,
        _ => current,
    }
}

/// Before/after snapshot of one delivery mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub before: DeliveryState,
    pub delivery: RecipientDelivery,
}

impl DeliveryUpdate {
    pub fn changed(&self) -> bool {
        self.before != self.delivery.state
    }

    /// True when this update is the first time the delivery reached `state` or beyond.
    pub fn first_reached(&self, state: DeliveryState) -> bool {
        let rank = progress_rank(state);
        self.before != DeliveryState::Escalated
            && progress_rank(self.before) < rank
            && progress_rank(self.delivery.state) >= rank
            && self.delivery.state != DeliveryState::Escalated
    }
}

/// Aggregate counts over all deliveries of an emergency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct DeliveryStats {
    pub total: u32,
    pub pending: u32,
    pub sent: u32,
    pub delivered: u32,
    pub acknowledged: u32,
    pub failed: u32,
    pub escalated: u32,
    /// Acknowledged deliveries as a rounded percentage of all deliveries.
    pub ack_rate: u32,
}

impl DeliveryStats {
    pub fn from_deliveries<'a>(deliveries: impl IntoIterator<Item = &'a RecipientDelivery>) -> Self {
        let mut stats = DeliveryStats::default();
        for d in deliveries {
            stats.total += 1;
            match d.state {
                DeliveryState::Pending => stats.pending += 1,
                DeliveryState::Sent => stats.sent += 1,
                DeliveryState::Delivered => stats.delivered += 1,
                DeliveryState::Acknowledged => stats.acknowledged += 1,
                DeliveryState::Failed => stats.failed += 1,
                DeliveryState::Escalated => stats.escalated += 1,
            }
        }
        stats.ack_rate = ack_rate(stats.acknowledged, stats.total);
        stats
    }
}

/// `round(acknowledged / total * 100)`, zero for an empty set.
pub fn ack_rate(acknowledged: u32, total: u32) -> u32 {
    if total == 0 {
        return 0;
    }
    (f64::from(acknowledged) / f64::from(total) * 100.0).round() as u32
}

/// Concurrent delivery table for one emergency.
///
/// Every mutation goes through a single map entry, so a channel result and an
/// escalation action racing on the same key are applied one after the other.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    deliveries: DashMap<DeliveryKey, RecipientDelivery>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_deliveries(deliveries: impl IntoIterator<Item = RecipientDelivery>) -> Self {
        let tracker = Self::new();
        for d in deliveries {
            tracker.deliveries.insert(d.key(), d);
        }
        tracker
    }

    /// Register a delivery. Returns false when one already exists for the key.
    pub fn open(&self, delivery: RecipientDelivery) -> bool {
        match self.deliveries.entry(delivery.key()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(delivery);
                true
            }
        }
    }

    pub fn contains(&self, key: &DeliveryKey) -> bool {
        self.deliveries.contains_key(key)
    }

    pub fn get(&self, key: &DeliveryKey) -> Option<RecipientDelivery> {
        self.deliveries.get(key).map(|d| d.clone())
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    fn update<F>(&self, key: &DeliveryKey, f: F) -> Option<DeliveryUpdate>
    where
        F: FnOnce(&mut RecipientDelivery),
    {
        let mut entry = self.deliveries.get_mut(key)?;
        let before = entry.state;
        f(&mut entry);
        Some(DeliveryUpdate {
            before,
            delivery: entry.clone(),
        })
    }

    /// Note that a send was handed to the channel.
    pub fn record_attempt(&self, key: &DeliveryKey, now: OffsetDateTime) -> Option<DeliveryUpdate> {
        self.update(key, |d| {
            d.attempts += 1;
            d.last_attempt_at = Some(now);
        })
    }

    /// Merge a channel result into the delivery.
    pub fn apply_outcome(
        &self,
        key: &DeliveryKey,
        outcome: SendOutcome,
        error_message: Option<String>,
        now: OffsetDateTime,
    ) -> Option<DeliveryUpdate> {
        self.update(key, |d| {
            let merged = merge_state(d.state, outcome.state());
            if merged == DeliveryState::Delivered && d.delivered_at.is_none() {
                d.delivered_at = Some(now);
            }
            match outcome {
                SendOutcome::Failed if merged == DeliveryState::Failed => {
                    d.error_message = error_message
                }
                SendOutcome::Failed => {}
                _ => d.error_message = None,
            }
            d.state = merged;
        })
    }

    /// Retries ran out. Only a delivery that never got past pending becomes failed;
    /// one that was sent or delivered keeps its state.
    pub fn mark_failed(&self, key: &DeliveryKey, error_message: Option<String>) -> Option<DeliveryUpdate> {
        self.update(key, |d| {
            if matches!(d.state, DeliveryState::Pending | DeliveryState::Failed) {
                d.state = DeliveryState::Failed;
                if error_message.is_some() {
                    d.error_message = error_message;
                }
            }
        })
    }

    /// A forced resend puts a failed delivery back to pending.
    pub fn requeue(&self, key: &DeliveryKey) -> Option<DeliveryUpdate> {
        self.update(key, |d| {
            if d.state == DeliveryState::Failed {
                d.state = DeliveryState::Pending;
                d.error_message = None;
            }
        })
    }

    /// Count a forced resend against the delivery's resend budget.
    pub fn record_resend(&self, key: &DeliveryKey, now: OffsetDateTime) -> Option<DeliveryUpdate> {
        self.update(key, |d| {
            d.resend_count += 1;
            d.last_resend_at = Some(now);
        })
    }

    /// Mark every delivery of a recipient as acknowledged.
    pub fn mark_acknowledged(&self, recipient_id: &str, now: OffsetDateTime) -> Vec<DeliveryUpdate> {
        let keys: Vec<DeliveryKey> = self
            .deliveries
            .iter()
            .filter(|d| d.recipient_id == recipient_id)
            .map(|d| d.key().clone())
            .collect();
        keys.iter()
            .filter_map(|key| {
                self.update(key, |d| {
                    if d.state != DeliveryState::Acknowledged {
                        d.state = DeliveryState::Acknowledged;
                        d.acknowledged_at = Some(now);
                    }
                })
            })
            .filter(DeliveryUpdate::changed)
            .collect()
    }

    /// Mark a delivery escalated. No-op for acknowledged or already escalated deliveries.
    pub fn mark_escalated(&self, key: &DeliveryKey, now: OffsetDateTime) -> Option<DeliveryUpdate> {
        self.update(key, |d| {
            if !d.state.is_terminal() {
                d.state = DeliveryState::Escalated;
                d.escalated_at = Some(now);
            }
        })
        .filter(DeliveryUpdate::changed)
    }

    /// Deliveries still eligible for escalation or resend.
    pub fn outstanding(&self) -> Vec<RecipientDelivery> {
        let mut out: Vec<RecipientDelivery> = self
            .deliveries
            .iter()
            .filter(|d| !d.state.is_terminal())
            .map(|d| d.clone())
            .collect();
        out.sort_by(|a, b| a.key().cmp(&b.key()));
        out
    }

    pub fn for_recipient(&self, recipient_id: &str) -> Vec<RecipientDelivery> {
        self.deliveries
            .iter()
            .filter(|d| d.recipient_id == recipient_id)
            .map(|d| d.clone())
            .collect()
    }

    pub fn has_state(&self, state: DeliveryState) -> bool {
        self.deliveries.iter().any(|d| d.state == state)
    }

    pub fn snapshot(&self) -> Vec<RecipientDelivery> {
        let mut all: Vec<RecipientDelivery> = self.deliveries.iter().map(|d| d.clone()).collect();
        all.sort_by(|a, b| a.key().cmp(&b.key()));
        all
    }

    pub fn stats(&self) -> DeliveryStats {
        let all = self.snapshot();
        DeliveryStats::from_deliveries(&all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::types::{Channel, ContactPoint, Recipient};

    fn delivery(recipient: &str, channel: Channel) -> RecipientDelivery {
        let r = Recipient {
            recipient_id: recipient.into(),
            guardian_id: format!("g-{recipient}"),
            student_id: format!("s-{recipient}"),
            contacts: vec![],
        };
        let contact = ContactPoint {
            channel,
            address: "+15550100".into(),
        };
        RecipientDelivery::new("em-1", &r, &contact, 0, OffsetDateTime::now_utc())
    }

    #[test]
    fn most_progressed_state_wins() {
        use DeliveryState::*;
        assert_eq!(merge_state(Delivered, Failed), Delivered);
        assert_eq!(merge_state(Failed, Delivered), Delivered);
        assert_eq!(merge_state(Sent, Failed), Sent);
        assert_eq!(merge_state(Pending, Failed), Failed);
        assert_eq!(merge_state(Acknowledged, Failed), Acknowledged);
        assert_eq!(merge_state(Acknowledged, Escalated), Acknowledged);
        assert_eq!(merge_state(Escalated, Delivered), Escalated);
        assert_eq!(merge_state(Escalated, Acknowledged), Acknowledged);
    }

    #[test]
    fn late_failure_does_not_regress_delivery() {
        let tracker = DeliveryTracker::new();
        let d = delivery("r1", Channel::Sms);
        let key = d.key();
        tracker.open(d);
        let now = OffsetDateTime::now_utc();

        tracker.apply_outcome(&key, SendOutcome::Delivered, None, now);
        let update = tracker
            .apply_outcome(&key, SendOutcome::Failed, Some("timeout".into()), now)
            .unwrap();
        assert!(!update.changed());
        assert_eq!(tracker.get(&key).unwrap().state, DeliveryState::Delivered);
    }

    #[test]
    fn first_reached_reports_counter_transitions_once() {
        let tracker = DeliveryTracker::new();
        let d = delivery("r1", Channel::Sms);
        let key = d.key();
        tracker.open(d);
        let now = OffsetDateTime::now_utc();

        let sent = tracker.apply_outcome(&key, SendOutcome::Sent, None, now).unwrap();
        assert!(sent.first_reached(DeliveryState::Sent));
        assert!(!sent.first_reached(DeliveryState::Delivered));

        let delivered = tracker
            .apply_outcome(&key, SendOutcome::Delivered, None, now)
            .unwrap();
        assert!(!delivered.first_reached(DeliveryState::Sent));
        assert!(delivered.first_reached(DeliveryState::Delivered));

        let again = tracker
            .apply_outcome(&key, SendOutcome::Delivered, None, now)
            .unwrap();
        assert!(!again.first_reached(DeliveryState::Delivered));
    }

    #[test]
    fn acknowledged_is_final() {
        let tracker = DeliveryTracker::new();
        let d = delivery("r1", Channel::Email);
        let key = d.key();
        tracker.open(d);
        let now = OffsetDateTime::now_utc();

        assert_eq!(tracker.mark_acknowledged("r1", now).len(), 1);
        assert!(tracker.mark_escalated(&key, now).is_none());
        tracker.apply_outcome(&key, SendOutcome::Failed, None, now);
        assert_eq!(tracker.get(&key).unwrap().state, DeliveryState::Acknowledged);
        assert!(tracker.mark_acknowledged("r1", now).is_empty());
    }

    #[test]
    fn acknowledgment_covers_every_channel_of_the_recipient() {
        let tracker = DeliveryTracker::new();
        let now = OffsetDateTime::now_utc();
        tracker.open(delivery("r1", Channel::Sms));
        tracker.open(delivery("r1", Channel::Email));
        tracker.open(delivery("r2", Channel::Sms));

        let updates = tracker.mark_acknowledged("r1", now);
        assert_eq!(updates.len(), 2);
        assert!(
            tracker
                .for_recipient("r1")
                .iter()
                .all(|d| d.state == DeliveryState::Acknowledged && d.acknowledged_at == Some(now))
        );
        let other = tracker.get(&DeliveryKey::new("r2", Channel::Sms)).unwrap();
        assert_eq!(other.state, DeliveryState::Pending);
    }

    #[test]
    fn resends_are_counted_apart_from_attempts() {
        let tracker = DeliveryTracker::new();
        let now = OffsetDateTime::now_utc();
        let d = delivery("r1", Channel::Sms);
        let key = d.key();
        tracker.open(d);
        for _ in 0..5 {
            tracker.record_attempt(&key, now);
        }
        tracker.mark_failed(&key, Some("carrier rejected".into()));

        let update = tracker.record_resend(&key, now).unwrap();
        assert!(!update.changed());
        assert_eq!(update.delivery.attempts, 5);
        assert_eq!(update.delivery.resend_count, 1);
        assert_eq!(update.delivery.last_resend_at, Some(now));
        assert_eq!(update.delivery.state, DeliveryState::Failed);
    }

    #[test]
    fn exhaustion_only_fails_unsent_deliveries() {
        let tracker = DeliveryTracker::new();
        let now = OffsetDateTime::now_utc();
        let sent = delivery("r1", Channel::Sms);
        let never = delivery("r2", Channel::Sms);
        let (sent_key, never_key) = (sent.key(), never.key());
        tracker.open(sent);
        tracker.open(never);
        tracker.apply_outcome(&sent_key, SendOutcome::Sent, None, now);

        tracker.mark_failed(&sent_key, Some("gave up".into()));
        tracker.mark_failed(&never_key, Some("gave up".into()));
        assert_eq!(tracker.get(&sent_key).unwrap().state, DeliveryState::Sent);
        assert_eq!(tracker.get(&never_key).unwrap().state, DeliveryState::Failed);

        tracker.requeue(&never_key);
        let requeued = tracker.get(&never_key).unwrap();
        assert_eq!(requeued.state, DeliveryState::Pending);
        assert!(requeued.error_message.is_none());
    }

    #[test]
    fn open_is_idempotent_per_key() {
        let tracker = DeliveryTracker::new();
        assert!(tracker.open(delivery("r1", Channel::Sms)));
        assert!(!tracker.open(delivery("r1", Channel::Sms)));
        assert!(tracker.open(delivery("r1", Channel::Email)));
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn stats_counts_sum_to_total() {
        let tracker = DeliveryTracker::new();
        let now = OffsetDateTime::now_utc();
        for i in 0..7 {
            tracker.open(delivery(&format!("r{i}"), Channel::Sms));
        }
        tracker.apply_outcome(&DeliveryKey::new("r0", Channel::Sms), SendOutcome::Sent, None, now);
        tracker.apply_outcome(&DeliveryKey::new("r1", Channel::Sms), SendOutcome::Delivered, None, now);
        tracker.apply_outcome(&DeliveryKey::new("r2", Channel::Sms), SendOutcome::Failed, None, now);
        tracker.mark_acknowledged("r3", now);
        tracker.mark_acknowledged("r4", now);
        tracker.mark_escalated(&DeliveryKey::new("r5", Channel::Sms), now);

        let stats = tracker.stats();
        assert_eq!(stats.total, 7);
        assert_eq!(
            stats.pending
                + stats.sent
                + stats.delivered
                + stats.acknowledged
                + stats.failed
                + stats.escalated,
            stats.total
        );
        assert_eq!(stats.acknowledged, 2);
        // 2 / 7 = 28.57%
        assert_eq!(stats.ack_rate, 29);
    }

    #[test]
    fn ack_rate_is_zero_without_deliveries() {
        assert_eq!(DeliveryTracker::new().stats().ack_rate, 0);
        assert_eq!(ack_rate(0, 0), 0);
        assert_eq!(ack_rate(1, 3), 33);
        assert_eq!(ack_rate(2, 3), 67);
        assert_eq!(ack_rate(1, 2), 50);
    }

    #[test]
    fn outstanding_excludes_terminal_deliveries() {
        let tracker = DeliveryTracker::new();
        let now = OffsetDateTime::now_utc();
        tracker.open(delivery("r1", Channel::Sms));
        tracker.open(delivery("r2", Channel::Sms));
        tracker.open(delivery("r3", Channel::Sms));
        tracker.mark_acknowledged("r1", now);
        tracker.mark_escalated(&DeliveryKey::new("r2", Channel::Sms), now);

        let outstanding = tracker.outstanding();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].recipient_id, "r3");
    }
}
