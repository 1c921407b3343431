//! SeaORM-backed repository (PostgreSQL in production, SQLite in tests).

use super::{EmergencyRepository, StoreResult};
use crate::emergency::types::{
    AckMethod, Acknowledgment, Channel, DeliveryState, EmergencyContext, EmergencyState,
    QueuedEmergencyMessage, Recipient, RecipientDelivery,
};
use crate::entity::{acknowledgment, emergency, queued_message, recipient_delivery};
use crate::error::PersistenceError;
use futures::future::BoxFuture;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
};
use std::str::FromStr;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct SeaOrmRepository {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn parse<T: FromStr<Err = String>>(value: &str) -> StoreResult<T> {
    value.parse().map_err(PersistenceError::Corrupt)
}

fn to_u32(value: i32, field: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| PersistenceError::Corrupt(format!("negative {field}: {value}")))
}

fn context_to_active(
    ctx: &EmergencyContext,
    version: i64,
) -> StoreResult<emergency::ActiveModel> {
    Ok(emergency::ActiveModel {
        id: Set(ctx.id.clone()),
        state: Set(ctx.state.as_str().to_string()),
        emergency_type: Set(ctx.details.emergency_type.as_str().to_string()),
        severity: Set(ctx.details.severity.as_str().to_string()),
        details: Set(serde_json::to_string(&ctx.details)?),
        config: Set(serde_json::to_string(&ctx.config)?),
        recipients: sea_orm::ActiveValue::NotSet,
        initiated_by: Set(ctx.initiated_by.clone()),
        initiated_at: Set(ctx.initiated_at),
        school_id: Set(ctx.school_id.clone()),
        total_recipients: Set(ctx.total_recipients as i32),
        sent_count: Set(ctx.sent_count as i32),
        delivered_count: Set(ctx.delivered_count as i32),
        acknowledged_count: Set(ctx.acknowledged_count as i32),
        pending_acks: Set(ctx.pending_acks as i32),
        escalation_level: Set(ctx.escalation_level as i32),
        last_escalation_at: Set(ctx.last_escalation_at),
        resolved_at: Set(ctx.resolved_at),
        resolved_by: Set(ctx.resolved_by.clone()),
        cancelled_at: Set(ctx.cancelled_at),
        cancelled_by: Set(ctx.cancelled_by.clone()),
        archived_at: Set(ctx.archived_at),
        escalation_exhausted: Set(ctx.escalation_exhausted),
        version: Set(version),
    })
}

fn context_from_model(m: emergency::Model) -> StoreResult<EmergencyContext> {
    Ok(EmergencyContext {
        state: parse::<EmergencyState>(&m.state)?,
        details: serde_json::from_str(&m.details)?,
        config: serde_json::from_str(&m.config)?,
        initiated_by: m.initiated_by,
        initiated_at: m.initiated_at,
        school_id: m.school_id,
        total_recipients: to_u32(m.total_recipients, "total_recipients")?,
        sent_count: to_u32(m.sent_count, "sent_count")?,
        delivered_count: to_u32(m.delivered_count, "delivered_count")?,
        acknowledged_count: to_u32(m.acknowledged_count, "acknowledged_count")?,
        pending_acks: to_u32(m.pending_acks, "pending_acks")?,
        escalation_level: to_u32(m.escalation_level, "escalation_level")?,
        last_escalation_at: m.last_escalation_at,
        resolved_at: m.resolved_at,
        resolved_by: m.resolved_by,
        cancelled_at: m.cancelled_at,
        cancelled_by: m.cancelled_by,
        archived_at: m.archived_at,
        escalation_exhausted: m.escalation_exhausted,
        version: m.version,
        id: m.id,
    })
}

fn delivery_to_active(d: &RecipientDelivery) -> recipient_delivery::ActiveModel {
    recipient_delivery::ActiveModel {
        emergency_id: Set(d.emergency_id.clone()),
        recipient_id: Set(d.recipient_id.clone()),
        channel: Set(d.channel.as_str().to_string()),
        guardian_id: Set(d.guardian_id.clone()),
        student_id: Set(d.student_id.clone()),
        address: Set(d.address.clone()),
        state: Set(d.state.as_str().to_string()),
        attempts: Set(d.attempts as i32),
        resend_count: Set(d.resend_count as i32),
        escalation_level: Set(d.escalation_level as i32),
        created_at: Set(d.created_at),
        last_attempt_at: Set(d.last_attempt_at),
        last_resend_at: Set(d.last_resend_at),
        delivered_at: Set(d.delivered_at),
        acknowledged_at: Set(d.acknowledged_at),
        escalated_at: Set(d.escalated_at),
        error_message: Set(d.error_message.clone()),
    }
}

fn delivery_from_model(m: recipient_delivery::Model) -> StoreResult<RecipientDelivery> {
    Ok(RecipientDelivery {
        channel: parse::<Channel>(&m.channel)?,
        state: parse::<DeliveryState>(&m.state)?,
        attempts: to_u32(m.attempts, "attempts")?,
        resend_count: to_u32(m.resend_count, "resend_count")?,
        escalation_level: to_u32(m.escalation_level, "escalation_level")?,
        emergency_id: m.emergency_id,
        recipient_id: m.recipient_id,
        guardian_id: m.guardian_id,
        student_id: m.student_id,
        address: m.address,
        created_at: m.created_at,
        last_attempt_at: m.last_attempt_at,
        last_resend_at: m.last_resend_at,
        delivered_at: m.delivered_at,
        acknowledged_at: m.acknowledged_at,
        escalated_at: m.escalated_at,
        error_message: m.error_message,
    })
}

fn ack_from_model(m: acknowledgment::Model) -> StoreResult<Acknowledgment> {
    Ok(Acknowledgment {
        channel: parse::<Channel>(&m.channel)?,
        method: parse::<AckMethod>(&m.method)?,
        id: m.id,
        emergency_id: m.emergency_id,
        recipient_id: m.recipient_id,
        guardian_id: m.guardian_id,
        acknowledged_at: m.acknowledged_at,
    })
}

fn message_from_model(m: queued_message::Model) -> StoreResult<QueuedEmergencyMessage> {
    Ok(QueuedEmergencyMessage {
        channel: parse::<Channel>(&m.channel)?,
        content: serde_json::from_str(&m.content)?,
        priority: to_u32(m.priority, "priority")?,
        attempts: to_u32(m.attempts, "attempts")?,
        max_attempts: to_u32(m.max_attempts, "max_attempts")?,
        id: m.id,
        emergency_id: m.emergency_id,
        recipient_id: m.recipient_id,
        guardian_id: m.guardian_id,
        address: m.address,
        created_at: m.created_at,
        next_retry_at: m.next_retry_at,
        bypass_offline_queue: m.bypass_offline_queue,
    })
}

impl EmergencyRepository for SeaOrmRepository {
    fn insert_context<'a>(
        &'a self,
        ctx: &'a EmergencyContext,
        recipients: &'a [Recipient],
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let mut model = context_to_active(ctx, ctx.version)?;
            model.recipients = Set(serde_json::to_string(recipients)?);
            emergency::Entity::insert(model)
                .exec_without_returning(self.db.as_ref())
                .await?;
            Ok(())
        })
    }

    fn save_context<'a>(&'a self, ctx: &'a EmergencyContext) -> BoxFuture<'a, StoreResult<i64>> {
        Box::pin(async move {
            let next = ctx.version + 1;
            let model = context_to_active(ctx, next)?;
            let result = emergency::Entity::update_many()
                .set(model)
                .filter(emergency::Column::Id.eq(ctx.id.as_str()))
                .filter(emergency::Column::Version.eq(ctx.version))
                .exec(self.db.as_ref())
                .await?;
            if result.rows_affected == 1 {
                return Ok(next);
            }
            let exists = emergency::Entity::find_by_id(ctx.id.clone())
                .one(self.db.as_ref())
                .await?
                .is_some();
            if exists {
                Err(PersistenceError::Conflict {
                    id: ctx.id.clone(),
                    expected: ctx.version,
                })
            } else {
                Err(PersistenceError::NotFound(ctx.id.clone()))
            }
        })
    }

    fn load_context<'a>(
        &'a self,
        id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Option<EmergencyContext>>> {
        Box::pin(async move {
            emergency::Entity::find_by_id(id.to_string())
                .one(self.db.as_ref())
                .await?
                .map(context_from_model)
                .transpose()
        })
    }

    fn load_recipients<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<Vec<Recipient>>> {
        Box::pin(async move {
            match emergency::Entity::find_by_id(id.to_string())
                .one(self.db.as_ref())
                .await?
            {
                Some(m) => Ok(serde_json::from_str(&m.recipients)?),
                None => Ok(Vec::new()),
            }
        })
    }

    fn list_active(&self) -> BoxFuture<'_, StoreResult<Vec<EmergencyContext>>> {
        Box::pin(async move {
            emergency::Entity::find()
                .filter(emergency::Column::State.is_not_in([
                    EmergencyState::Resolved.as_str(),
                    EmergencyState::Cancelled.as_str(),
                ]))
                .order_by_asc(emergency::Column::InitiatedAt)
                .all(self.db.as_ref())
                .await?
                .into_iter()
                .map(context_from_model)
                .collect()
        })
    }

    fn upsert_delivery<'a>(
        &'a self,
        delivery: &'a RecipientDelivery,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            use recipient_delivery::Column;
            recipient_delivery::Entity::insert(delivery_to_active(delivery))
                .on_conflict(
                    OnConflict::columns([Column::EmergencyId, Column::RecipientId, Column::Channel])
                        .update_columns([
                            Column::Address,
                            Column::State,
                            Column::Attempts,
                            Column::ResendCount,
                            Column::LastAttemptAt,
                            Column::LastResendAt,
                            Column::DeliveredAt,
                            Column::AcknowledgedAt,
                            Column::EscalatedAt,
                            Column::ErrorMessage,
                        ])
                        .to_owned(),
                )
                .exec_without_returning(self.db.as_ref())
                .await?;
            Ok(())
        })
    }

    fn load_deliveries<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<RecipientDelivery>>> {
        Box::pin(async move {
            recipient_delivery::Entity::find()
                .filter(recipient_delivery::Column::EmergencyId.eq(emergency_id))
                .order_by_asc(recipient_delivery::Column::RecipientId)
                .all(self.db.as_ref())
                .await?
                .into_iter()
                .map(delivery_from_model)
                .collect()
        })
    }

    fn insert_acknowledgment<'a>(
        &'a self,
        ack: &'a Acknowledgment,
    ) -> BoxFuture<'a, StoreResult<bool>> {
        Box::pin(async move {
            use acknowledgment::Column;
            let model = acknowledgment::ActiveModel {
                id: Set(ack.id.clone()),
                emergency_id: Set(ack.emergency_id.clone()),
                recipient_id: Set(ack.recipient_id.clone()),
                guardian_id: Set(ack.guardian_id.clone()),
                acknowledged_at: Set(ack.acknowledged_at),
                channel: Set(ack.channel.as_str().to_string()),
                method: Set(ack.method.as_str().to_string()),
            };
            let inserted = acknowledgment::Entity::insert(model)
                .on_conflict(
                    OnConflict::columns([Column::EmergencyId, Column::RecipientId])
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(self.db.as_ref())
                .await?;
            Ok(inserted == 1)
        })
    }

    fn load_acknowledgments<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<Acknowledgment>>> {
        Box::pin(async move {
            acknowledgment::Entity::find()
                .filter(acknowledgment::Column::EmergencyId.eq(emergency_id))
                .order_by_asc(acknowledgment::Column::AcknowledgedAt)
                .all(self.db.as_ref())
                .await?
                .into_iter()
                .map(ack_from_model)
                .collect()
        })
    }

    fn save_queued_message<'a>(
        &'a self,
        message: &'a QueuedEmergencyMessage,
    ) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            use queued_message::Column;
            let model = queued_message::ActiveModel {
                id: Set(message.id.clone()),
                emergency_id: Set(message.emergency_id.clone()),
                recipient_id: Set(message.recipient_id.clone()),
                guardian_id: Set(message.guardian_id.clone()),
                channel: Set(message.channel.as_str().to_string()),
                address: Set(message.address.clone()),
                priority: Set(message.priority as i32),
                content: Set(serde_json::to_string(&message.content)?),
                created_at: Set(message.created_at),
                attempts: Set(message.attempts as i32),
                max_attempts: Set(message.max_attempts as i32),
                next_retry_at: Set(message.next_retry_at),
                bypass_offline_queue: Set(message.bypass_offline_queue),
            };
            queued_message::Entity::insert(model)
                .on_conflict(
                    OnConflict::column(Column::Id)
                        .update_columns([Column::Attempts, Column::NextRetryAt])
                        .to_owned(),
                )
                .exec_without_returning(self.db.as_ref())
                .await?;
            Ok(())
        })
    }

    fn delete_queued_message<'a>(&'a self, id: &'a str) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            queued_message::Entity::delete_by_id(id.to_string())
                .exec(self.db.as_ref())
                .await?;
            Ok(())
        })
    }

    fn delete_queued_messages_for<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<u64>> {
        Box::pin(async move {
            let result = queued_message::Entity::delete_many()
                .filter(queued_message::Column::EmergencyId.eq(emergency_id))
                .exec(self.db.as_ref())
                .await?;
            Ok(result.rows_affected)
        })
    }

    fn load_queued_messages<'a>(
        &'a self,
        emergency_id: &'a str,
    ) -> BoxFuture<'a, StoreResult<Vec<QueuedEmergencyMessage>>> {
        Box::pin(async move {
            queued_message::Entity::find()
                .filter(queued_message::Column::EmergencyId.eq(emergency_id))
                .order_by_asc(queued_message::Column::CreatedAt)
                .all(self.db.as_ref())
                .await?
                .into_iter()
                .map(message_from_model)
                .collect()
        })
    }

    fn purge_archived_before(&self, cutoff: OffsetDateTime) -> BoxFuture<'_, StoreResult<u64>> {
        Box::pin(async move {
            let expired: Vec<String> = emergency::Entity::find()
                .filter(emergency::Column::ArchivedAt.lt(cutoff))
                .all(self.db.as_ref())
                .await?
                .into_iter()
                .map(|m| m.id)
                .collect();
            if expired.is_empty() {
                return Ok(0);
            }
            recipient_delivery::Entity::delete_many()
                .filter(recipient_delivery::Column::EmergencyId.is_in(expired.clone()))
                .exec(self.db.as_ref())
                .await?;
            acknowledgment::Entity::delete_many()
                .filter(acknowledgment::Column::EmergencyId.is_in(expired.clone()))
                .exec(self.db.as_ref())
                .await?;
            queued_message::Entity::delete_many()
                .filter(queued_message::Column::EmergencyId.is_in(expired.clone()))
                .exec(self.db.as_ref())
                .await?;
            let result = emergency::Entity::delete_many()
                .filter(emergency::Column::Id.is_in(expired))
                .exec(self.db.as_ref())
                .await?;
            Ok(result.rows_affected)
        })
    }
}
