//! Priority send queue for emergency traffic.
//!
//! Emergency messages skip any normal or offline queue: they carry a priority
//! above [`NORMAL_PRIORITY`](crate::emergency::profiles::NORMAL_PRIORITY) and
//! are handed straight to the channel adapter when ready. Ordering is highest
//! priority first, then oldest first.

use crate::channels::{ChannelAdapter, DeliveryResult, DeliveryStatus, DeliveryTarget};
use crate::emergency::profiles::{config_for_severity, priority_for_severity};
use crate::emergency::types::{EmergencyContext, QueuedEmergencyMessage, RecipientDelivery};
use crate::render::RenderedMessage;
use dashmap::DashMap;
use futures::StreamExt;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use time::OffsetDateTime;
use tokio::sync::Notify;

struct Entry {
    sequence: u64,
    message: QueuedEmergencyMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: greater pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.message.created_at.cmp(&self.message.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// What to do with a message after a send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The channel accepted or delivered it.
    Completed,
    /// Failed with attempts left; carries the message to requeue.
    Retry(QueuedEmergencyMessage),
    /// Failed on the last allowed attempt.
    Exhausted,
}

fn in_flight_key(message: &QueuedEmergencyMessage) -> (String, String) {
    (message.emergency_id.clone(), message.recipient_id.clone())
}

pub struct PriorityDispatcher {
    channel: Arc<dyn ChannelAdapter>,
    concurrency: usize,
    queue: Mutex<BinaryHeap<Entry>>,
    /// Taken but not finished, per (emergency, recipient).
    in_flight: DashMap<(String, String), usize>,
    sequence: AtomicU64,
    wake: Notify,
}

impl PriorityDispatcher {
    pub fn new(channel: Arc<dyn ChannelAdapter>, concurrency: usize) -> Self {
        Self {
            channel,
            concurrency: concurrency.max(1),
            queue: Mutex::new(BinaryHeap::new()),
            in_flight: DashMap::new(),
            sequence: AtomicU64::new(0),
            wake: Notify::new(),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Entry>> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Build the queued form of one send for `delivery`.
    pub fn message_for(
        ctx: &EmergencyContext,
        delivery: &RecipientDelivery,
        content: RenderedMessage,
        now: OffsetDateTime,
    ) -> QueuedEmergencyMessage {
        let severity = ctx.details.severity;
        QueuedEmergencyMessage {
            id: uuid::Uuid::new_v4().to_string(),
            emergency_id: ctx.id.clone(),
            recipient_id: delivery.recipient_id.clone(),
            guardian_id: delivery.guardian_id.clone(),
            channel: delivery.channel,
            address: delivery.address.clone(),
            priority: priority_for_severity(severity),
            content,
            created_at: now,
            attempts: 0,
            max_attempts: config_for_severity(severity).config.max_retry_attempts,
            next_retry_at: now,
            bypass_offline_queue: true,
        }
    }

    pub fn enqueue(&self, message: QueuedEmergencyMessage) {
        let sequence = self.sequence.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue().push(Entry { sequence, message });
        self.wake.notify_one();
    }

    /// Remove and return every message due at `now`, highest priority first.
    /// Taken messages count as in flight until `finish` or `enqueue` again.
    pub fn take_ready(&self, now: OffsetDateTime) -> Vec<QueuedEmergencyMessage> {
        let mut queue = self.queue();
        let mut ready = Vec::new();
        let mut waiting = Vec::new();
        while let Some(entry) = queue.pop() {
            if entry.message.next_retry_at <= now {
                ready.push(entry.message);
            } else {
                waiting.push(entry);
            }
        }
        queue.extend(waiting);
        drop(queue);
        for message in &ready {
            *self.in_flight.entry(in_flight_key(message)).or_insert(0) += 1;
        }
        ready
    }

    /// Mark a taken message as done (sent, exhausted or discarded).
    pub fn finish(&self, message: &QueuedEmergencyMessage) {
        let key = in_flight_key(message);
        if let Some(mut count) = self.in_flight.get_mut(&key) {
            *count = count.saturating_sub(1);
        }
        self.in_flight.remove_if(&key, |_, count| *count == 0);
    }

    /// Put a taken message back for a later attempt.
    pub fn requeue(&self, message: QueuedEmergencyMessage) {
        self.finish(&message);
        self.enqueue(message);
    }

    /// Drop every queued message of an emergency, returning what was removed.
    /// In-flight sends are not interrupted; their results must be discarded.
    pub fn purge(&self, emergency_id: &str) -> Vec<QueuedEmergencyMessage> {
        let mut queue = self.queue();
        let (purged, kept): (Vec<Entry>, Vec<Entry>) = queue
            .drain()
            .partition(|e| e.message.emergency_id == emergency_id);
        queue.extend(kept);
        purged.into_iter().map(|e| e.message).collect()
    }

    /// Messages of an emergency that are queued or in flight.
    pub fn outstanding(&self, emergency_id: &str) -> usize {
        let queued = self
            .queue()
            .iter()
            .filter(|e| e.message.emergency_id == emergency_id)
            .count();
        let in_flight: usize = self
            .in_flight
            .iter()
            .filter(|e| e.key().0 == emergency_id)
            .map(|e| *e.value())
            .sum();
        queued + in_flight
    }

    /// True while a send for the recipient is queued or in flight.
    pub fn has_outstanding_for(&self, emergency_id: &str, recipient_id: &str) -> bool {
        let in_flight = self
            .in_flight
            .contains_key(&(emergency_id.to_string(), recipient_id.to_string()));
        in_flight
            || self.queue().iter().any(|e| {
                e.message.emergency_id == emergency_id && e.message.recipient_id == recipient_id
            })
    }

    pub fn len(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when something was enqueued since the last wake-up.
    pub async fn woken(&self) {
        self.wake.notified().await;
    }

    /// Send a batch through the channel adapter with bounded concurrency.
    pub async fn send_all(
        &self,
        batch: Vec<QueuedEmergencyMessage>,
    ) -> Vec<(QueuedEmergencyMessage, DeliveryResult)> {
        futures::stream::iter(batch)
            .map(|message| async move {
                let target = DeliveryTarget {
                    emergency_id: message.emergency_id.clone(),
                    recipient_id: message.recipient_id.clone(),
                    guardian_id: message.guardian_id.clone(),
                    address: message.address.clone(),
                };
                let result = self
                    .channel
                    .send(&target, message.channel, &message.content)
                    .await;
                (message, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await
    }

    /// Decide what happens to a message after one send.
    pub fn after_send(
        message: &QueuedEmergencyMessage,
        result: &DeliveryResult,
        retry_interval_ms: u64,
        now: OffsetDateTime,
    ) -> DispatchOutcome {
        if result.status != DeliveryStatus::Failed {
            return DispatchOutcome::Completed;
        }
        let attempts = message.attempts + 1;
        if attempts < message.max_attempts {
            let mut retry = message.clone();
            retry.attempts = attempts;
            retry.next_retry_at = now + time::Duration::milliseconds(retry_interval_ms as i64);
            DispatchOutcome::Retry(retry)
        } else {
            DispatchOutcome::Exhausted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::LoggingChannel;
    use crate::emergency::types::{Channel, Severity};
    use time::Duration;

    fn message(emergency: &str, priority: u32, created_at: OffsetDateTime) -> QueuedEmergencyMessage {
        QueuedEmergencyMessage {
            id: uuid::Uuid::new_v4().to_string(),
            emergency_id: emergency.into(),
            recipient_id: "r1".into(),
            guardian_id: "g1".into(),
            channel: Channel::Sms,
            address: "+15550100".into(),
            priority,
            content: RenderedMessage {
                subject: None,
                body: "b".into(),
            },
            created_at,
            attempts: 0,
            max_attempts: 3,
            next_retry_at: created_at,
            bypass_offline_queue: true,
        }
    }

    fn dispatcher() -> PriorityDispatcher {
        PriorityDispatcher::new(Arc::new(LoggingChannel), 4)
    }

    #[test]
    fn highest_priority_then_oldest_first() {
        let d = dispatcher();
        let t0 = OffsetDateTime::now_utc();
        d.enqueue(message("advisory", priority_for_severity(Severity::Advisory), t0));
        d.enqueue(message("critical-new", 1000, t0 + Duration::seconds(2)));
        d.enqueue(message("critical-old", 1000, t0 + Duration::seconds(1)));
        d.enqueue(message("high", 800, t0));

        let order: Vec<String> = d
            .take_ready(t0 + Duration::seconds(5))
            .into_iter()
            .map(|m| m.emergency_id)
            .collect();
        assert_eq!(order, ["critical-old", "critical-new", "high", "advisory"]);
    }

    #[test]
    fn future_retries_stay_queued() {
        let d = dispatcher();
        let t0 = OffsetDateTime::now_utc();
        let mut later = message("em-1", 1000, t0);
        later.next_retry_at = t0 + Duration::seconds(30);
        d.enqueue(later);
        d.enqueue(message("em-1", 1000, t0));

        assert_eq!(d.take_ready(t0).len(), 1);
        assert_eq!(d.len(), 1);
        assert_eq!(d.outstanding("em-1"), 2);
    }

    #[test]
    fn outstanding_tracks_in_flight_until_finished() {
        let d = dispatcher();
        let t0 = OffsetDateTime::now_utc();
        d.enqueue(message("em-1", 1000, t0));
        let taken = d.take_ready(t0);
        assert_eq!(d.outstanding("em-1"), 1);
        d.finish(&taken[0]);
        assert_eq!(d.outstanding("em-1"), 0);
    }

    #[test]
    fn recipient_stays_outstanding_while_its_send_is_in_flight() {
        let d = dispatcher();
        let t0 = OffsetDateTime::now_utc();
        d.enqueue(message("em-1", 1000, t0));
        let taken = d.take_ready(t0);
        assert!(d.is_empty());
        assert!(d.has_outstanding_for("em-1", "r1"));
        assert!(!d.has_outstanding_for("em-1", "r2"));
        assert!(!d.has_outstanding_for("em-2", "r1"));

        d.finish(&taken[0]);
        assert!(!d.has_outstanding_for("em-1", "r1"));
    }

    #[test]
    fn purge_removes_only_that_emergency() {
        let d = dispatcher();
        let t0 = OffsetDateTime::now_utc();
        d.enqueue(message("em-1", 1000, t0));
        d.enqueue(message("em-1", 1000, t0));
        d.enqueue(message("em-2", 800, t0));
        assert_eq!(d.purge("em-1").len(), 2);
        assert_eq!(d.outstanding("em-1"), 0);
        assert_eq!(d.outstanding("em-2"), 1);
    }

    #[test]
    fn failures_retry_until_ceiling() {
        let t0 = OffsetDateTime::now_utc();
        let failed = DeliveryResult::failed("carrier down");
        let m = message("em-1", 1000, t0);

        let DispatchOutcome::Retry(retry) = PriorityDispatcher::after_send(&m, &failed, 30_000, t0)
        else {
            panic!("expected retry");
        };
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.next_retry_at, t0 + Duration::seconds(30));

        let mut last = m.clone();
        last.attempts = 2;
        assert_eq!(
            PriorityDispatcher::after_send(&last, &failed, 30_000, t0),
            DispatchOutcome::Exhausted
        );
        assert_eq!(
            PriorityDispatcher::after_send(&m, &DeliveryResult::sent(), 30_000, t0),
            DispatchOutcome::Completed
        );
    }

    #[tokio::test]
    async fn send_all_returns_every_result() {
        let d = dispatcher();
        let t0 = OffsetDateTime::now_utc();
        let batch: Vec<_> = (0..10).map(|_| message("em-1", 1000, t0)).collect();
        let results = d.send_all(batch).await;
        assert_eq!(results.len(), 10);
        assert!(
            results
                .iter()
                .all(|(_, r)| r.status == DeliveryStatus::Delivered)
        );
    }
}
