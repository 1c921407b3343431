//! Process-local repository, used by tests and single-node development runs.

use super::{EmergencyRepository, StoreResult};
use crate::emergency::types::{
    Acknowledgment, EmergencyContext, QueuedEmergencyMessage, Recipient, RecipientDelivery,
};
use crate::error::PersistenceError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use time::OffsetDateTime;

#[derive(Default)]
struct Partition {
    context: Option<EmergencyContext>,
    recipients: Vec<Recipient>,
    deliveries: BTreeMap<(String, String), RecipientDelivery>,
    acknowledgments: BTreeMap<String, Acknowledgment>,
}

/// One partition per emergency id; each operation holds only that partition's shard lock.
#[derive(Default)]
pub struct InMemoryRepository {
    partitions: DashMap<String, Partition>,
    queue: DashMap<String, QueuedEmergencyMessage>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EmergencyRepository for InMemoryRepository {
    fn insert_context<'a>(
        &'a self,
        ctx: &'a EmergencyContext,
        recipients: &'a [Recipient],
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            match self.partitions.entry(ctx.id.clone()) {
                Entry::Occupied(_) => Err(PersistenceError::Conflict {
                    id: ctx.id.clone(),
                    expected: ctx.version,
                }),
                Entry::Vacant(slot) => {
                    slot.insert(Partition {
                        context: Some(ctx.clone()),
                        recipients: recipients.to_vec(),
                        ..Default::default()
                    });
                    Ok(())
                }
            }
        })
    }

    fn save_context<'a>(&'a self, ctx: &'a EmergencyContext) -> BoxFuture<'a, StoreResult<i64>> {
        Box::pin(async move {
            let mut partition = self
                .partitions
                .get_mut(&ctx.id)
                .ok_or_else(|| PersistenceError::NotFound(ctx.id.clone()))?;
            let stored = partition
                .context
                .as_mut()
                .ok_or_else(|| PersistenceError::NotFound(ctx.id.clone()))?;
            if stored.version != ctx.version {
                return Err(PersistenceError::Conflict {
                    id: ctx.id.clone(),
                    expected: ctx.version,
                });
            }
            let mut next = ctx.clone();
            next.version = ctx.version + 1;
            *stored = next;
            Ok(ctx.version + 1)
        })
    }

    fn load_context<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<EmergencyContext>>> {
        Box::pin(async move { Ok(self.partitions.get(id).and_then(|p| p.context.clone())) })
    }

    fn load_recipients<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Vec<Recipient>>> {
        Box::pin(async move {
            Ok(self
                .partitions
                .get(id)
                .map(|p| p.recipients.clone())
                .unwrap_or_default())
        })
    }

    fn list_active(&self) -> BoxFuture<'_, StoreResult<Vec<EmergencyContext>>> {
        Box::pin(async move {
            let mut active: Vec<EmergencyContext> = self
                .partitions
                .iter()
                .filter_map(|p| p.context.clone())
                .filter(|c| !c.is_terminal())
                .collect();
            active.sort_by_key(|c| c.initiated_at);
            Ok(active)
        })
    }

    fn upsert_delivery<'a>(
        &'a self,
        delivery: &'a RecipientDelivery,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let mut partition = self
                .partitions
                .get_mut(&delivery.emergency_id)
                .ok_or_else(|| PersistenceError::NotFound(delivery.emergency_id.clone()))?;
            partition.deliveries.insert(
                (
                    delivery.recipient_id.clone(),
                    delivery.channel.as_str().to_string(),
                ),
                delivery.clone(),
            );
            Ok(())
        })
    }

    fn load_deliveries<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<RecipientDelivery>>> {
        Box::pin(async move {
            Ok(self
                .partitions
                .get(emergency_id)
                .map(|p| p.deliveries.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn insert_acknowledgment<'a>(
        &'a self,
        ack: &'a Acknowledgment,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            let mut partition = self
                .partitions
                .get_mut(&ack.emergency_id)
                .ok_or_else(|| PersistenceError::NotFound(ack.emergency_id.clone()))?;
            if partition.acknowledgments.contains_key(&ack.recipient_id) {
                return Ok(false);
            }
            partition
                .acknowledgments
                .insert(ack.recipient_id.clone(), ack.clone());
            Ok(true)
        })
    }

    fn load_acknowledgments<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<Acknowledgment>>> {
        Box::pin(async move {
            Ok(self
                .partitions
                .get(emergency_id)
                .map(|p| p.acknowledgments.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn save_queued_message<'a>(
        &'a self,
        message: &'a QueuedEmergencyMessage,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.queue.insert(message.id.clone(), message.clone());
            Ok(())
        })
    }

    fn delete_queued_message<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            self.queue.remove(id);
            Ok(())
        })
    }

    fn delete_queued_messages_for<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move {
            let before = self.queue.len();
            self.queue.retain(|_, m| m.emergency_id != emergency_id);
            Ok((before - self.queue.len()) as u64)
        })
    }

    fn load_queued_messages<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<QueuedEmergencyMessage>>> {
        Box::pin(async move {
            let mut messages: Vec<QueuedEmergencyMessage> = self
                .queue
                .iter()
                .filter(|m| m.emergency_id == emergency_id)
                .map(|m| m.clone())
                .collect();
            messages.sort_by_key(|m| m.created_at);
            Ok(messages)
        })
    }

    fn purge_archived_before(&self, cutoff: OffsetDateTime) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(async move {
            let expired: Vec<String> = self
                .partitions
                .iter()
                .filter(|p| {
                    p.context
                        .as_ref()
                        .and_then(|c| c.archived_at)
                        .is_some_and(|at| at < cutoff)
                })
                .map(|p| p.key().clone())
                .collect();
            for id in &expired {
                self.partitions.remove(id);
                self.queue.retain(|_, m| &m.emergency_id != id);
            }
            Ok(expired.len() as u64)
        })
    }
}
