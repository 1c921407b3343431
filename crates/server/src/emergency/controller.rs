//! Emergency lifecycle orchestration.
//!
//! The controller owns every active emergency. Each one lives in an
//! [`ActiveEmergency`] whose context sits behind a single async mutex, so all
//! counter and state changes for an emergency are serialized. Delivery and
//! acknowledgment tables are concurrent maps updated entry by entry.

use crate::auth::{Authorization, Role, RolePolicy};
use crate::channels::DeliveryStatus;
use crate::clock::{Clock, SystemClock};
use crate::emergency::acknowledgments::{AckRecord, AcknowledgmentStore};
use crate::emergency::dispatcher::PriorityDispatcher;
use crate::emergency::escalation::EscalationEngine;
use crate::emergency::profiles::default_config;
use crate::emergency::resend::ResendPolicy;
use crate::emergency::state_machine::{Transition, advance};
use crate::emergency::task_manager::EvaluationTaskManager;
use crate::emergency::tracker::{DeliveryStats, DeliveryTracker, DeliveryUpdate, SendOutcome};
use crate::emergency::types::{
    AckMethod, Acknowledgment, Channel, ContactPoint, DeliveryKey, DeliveryState, EmergencyContext,
    EmergencyDetails, EmergencyEvent, EmergencyState, QueuedEmergencyMessage, Recipient,
    RecipientDelivery,
};
use crate::error::{EmergencyError, PersistenceError};
use crate::events::{EmergencyNotice, EventBus};
use crate::render::{MessageRenderer, RenderedMessage};
use crate::store::{EmergencyRepository, with_retry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use utoipa::ToSchema;

/// The caller of an administrative operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub role: Role,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct InitiateEmergency {
    pub details: EmergencyDetails,
    pub school_id: String,
    pub recipients: Vec<Recipient>,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
pub struct AcknowledgmentRequest {
    pub recipient_id: String,
    pub channel: Channel,
    pub method: AckMethod,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AckOutcome {
    Recorded {
        state: EmergencyState,
        pending_acks: u32,
    },
    /// The recipient had already acknowledged; nothing changed.
    Duplicate {
        #[serde(with = "time::serde::rfc3339")]
        acknowledged_at: time::OffsetDateTime,
    },
    /// The emergency is resolved or cancelled; the ack was not recorded.
    Closed { state: EmergencyState },
}

/// In-memory state of an emergency that has not reached a terminal state.
pub struct ActiveEmergency {
    pub(crate) context: Mutex<EmergencyContext>,
    pub(crate) recipients: HashMap<String, Recipient>,
    pub(crate) tracker: DeliveryTracker,
    pub(crate) acks: AcknowledgmentStore,
    closed: AtomicBool,
}

impl ActiveEmergency {
    fn new(
        context: EmergencyContext,
        recipients: Vec<Recipient>,
        tracker: DeliveryTracker,
        acks: AcknowledgmentStore,
    ) -> Self {
        Self {
            context: Mutex::new(context),
            recipients: recipients
                .into_iter()
                .map(|r| (r.recipient_id.clone(), r))
                .collect(),
            tracker,
            acks,
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Allowed contacts of a recipient on channels with no delivery yet, in preference order.
    pub(crate) fn unused_contacts(&self, ctx: &EmergencyContext, recipient_id: &str) -> Vec<ContactPoint> {
        let Some(recipient) = self.recipients.get(recipient_id) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        recipient
            .allowed_contacts(&ctx.config)
            .filter(|c| seen.insert(c.channel))
            .filter(|c| {
                !self
                    .tracker
                    .contains(&DeliveryKey::new(recipient_id, c.channel))
            })
            .cloned()
            .collect()
    }
}

enum Lookup {
    Active(Arc<ActiveEmergency>),
    Closed(EmergencyContext),
}

pub struct EmergencyController {
    pub(crate) repository: Arc<dyn EmergencyRepository>,
    pub(crate) dispatcher: Arc<PriorityDispatcher>,
    pub(crate) renderer: Arc<dyn MessageRenderer>,
    pub(crate) authorization: Arc<dyn Authorization>,
    pub(crate) events: EventBus,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) escalation: EscalationEngine,
    pub(crate) resend: ResendPolicy,
    pub(crate) tasks: Arc<EvaluationTaskManager>,
    pub(crate) active: DashMap<String, Arc<ActiveEmergency>>,
}

impl EmergencyController {
    pub fn new(
        repository: Arc<dyn EmergencyRepository>,
        dispatcher: Arc<PriorityDispatcher>,
        renderer: Arc<dyn MessageRenderer>,
    ) -> Self {
        Self {
            repository,
            dispatcher,
            renderer,
            authorization: Arc::new(RolePolicy),
            events: EventBus::default(),
            clock: Arc::new(SystemClock),
            escalation: EscalationEngine::default(),
            resend: ResendPolicy::default(),
            tasks: Arc::new(EvaluationTaskManager::new()),
            active: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_authorization(mut self, authorization: Arc<dyn Authorization>) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_escalation(mut self, escalation: EscalationEngine) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_resend_policy(mut self, resend: ResendPolicy) -> Self {
        self.resend = resend;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tasks(&self) -> &Arc<EvaluationTaskManager> {
        &self.tasks
    }

    pub fn dispatcher(&self) -> &Arc<PriorityDispatcher> {
        &self.dispatcher
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    pub(crate) fn active(&self, id: &str) -> Option<Arc<ActiveEmergency>> {
        self.active.get(id).map(|a| a.clone())
    }

    /// Declare an emergency and start broadcasting it.
    #[tracing::instrument(skip(self, request), fields(school_id = %request.school_id))]
    pub async fn initiate_emergency(
        &self,
        actor: &Actor,
        request: InitiateEmergency,
    ) -> Result<EmergencyContext, EmergencyError> {
        if !self.authorization.can_initiate(actor.role) {
            return Err(EmergencyError::Unauthorized("initiate emergencies"));
        }
        validate_initiation(actor, &request)?;

        let now = self.clock.now();
        let InitiateEmergency {
            details,
            school_id,
            recipients,
        } = request;
        let config = default_config(details.emergency_type);
        let total = recipients.len() as u32;
        let mut ctx = EmergencyContext {
            id: uuid::Uuid::new_v4().to_string(),
            state: EmergencyState::Initiated,
            details,
            config,
            initiated_by: actor.user_id.clone(),
            initiated_at: now,
            school_id,
            total_recipients: total,
            sent_count: 0,
            delivered_count: 0,
            acknowledged_count: 0,
            pending_acks: total,
            escalation_level: 0,
            last_escalation_at: None,
            resolved_at: None,
            resolved_by: None,
            cancelled_at: None,
            cancelled_by: None,
            archived_at: None,
            escalation_exhausted: false,
            version: 0,
        };

        let mut unreachable = Vec::new();
        let deliveries: Vec<RecipientDelivery> = recipients
            .iter()
            .filter_map(|r| match r.allowed_contacts(&ctx.config).next() {
                Some(primary) => Some(RecipientDelivery::new(&ctx.id, r, primary, 0, now)),
                None => {
                    unreachable.push(r.recipient_id.clone());
                    None
                }
            })
            .collect();
        if !unreachable.is_empty() {
            return Err(EmergencyError::Validation(format!(
                "recipients without a contact on an allowed channel: {}",
                unreachable.join(", ")
            )));
        }

        // Render everything up front so a template problem leaves no trace.
        let mut contents: HashMap<Channel, RenderedMessage> = HashMap::new();
        for d in &deliveries {
            if !contents.contains_key(&d.channel) {
                contents.insert(d.channel, self.render(&ctx, d.channel)?);
            }
        }

        {
            let (repo, snapshot, list) = (&self.repository, &ctx, recipients.as_slice());
            with_retry("insert_context", move || repo.insert_context(snapshot, list)).await?;
        }
        for d in &deliveries {
            self.store_delivery(d).await?;
        }

        let active = Arc::new(ActiveEmergency::new(
            ctx.clone(),
            recipients,
            DeliveryTracker::from_deliveries(deliveries.iter().cloned()),
            AcknowledgmentStore::new(),
        ));
        self.active.insert(ctx.id.clone(), active.clone());

        tracing::info!(
            name = "emergency.initiated",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Emergency initiated",
            emergency_id = %ctx.id,
            emergency_type = ctx.details.emergency_type.as_str(),
            severity = ctx.details.severity.as_str(),
            recipients = total,
            initiated_by = %actor.user_id,
        );

        let mut guard = active.context.lock().await;
        self.transition(&mut guard, EmergencyEvent::StartBroadcast, now);
        self.persist(&mut guard).await?;
        for d in &deliveries {
            if let Some(content) = contents.get(&d.channel) {
                let message = PriorityDispatcher::message_for(&guard, d, content.clone(), now);
                self.enqueue(message).await;
            }
        }
        ctx = guard.clone();
        Ok(ctx)
    }

    /// Record a guardian's acknowledgment. Idempotent per recipient.
    #[tracing::instrument(skip(self, request), fields(recipient_id = %request.recipient_id))]
    pub async fn record_acknowledgment(
        &self,
        emergency_id: &str,
        request: AcknowledgmentRequest,
    ) -> Result<AckOutcome, EmergencyError> {
        let active = match self.lookup(emergency_id).await? {
            Lookup::Active(active) => active,
            Lookup::Closed(ctx) => return Ok(AckOutcome::Closed { state: ctx.state }),
        };
        let mut ctx = active.context.lock().await;
        if ctx.is_terminal() || active.is_closed() {
            return Ok(AckOutcome::Closed { state: ctx.state });
        }
        let Some(recipient) = active.recipients.get(&request.recipient_id) else {
            return Err(EmergencyError::UnknownRecipient {
                emergency_id: emergency_id.to_string(),
                recipient_id: request.recipient_id,
            });
        };

        let now = self.clock.now();
        let ack = Acknowledgment {
            id: uuid::Uuid::new_v4().to_string(),
            emergency_id: emergency_id.to_string(),
            recipient_id: recipient.recipient_id.clone(),
            guardian_id: recipient.guardian_id.clone(),
            acknowledged_at: now,
            channel: request.channel,
            method: request.method,
        };
        if let AckRecord::Duplicate(original) = active.acks.record(ack.clone()) {
            return Ok(AckOutcome::Duplicate {
                acknowledged_at: original.acknowledged_at,
            });
        }
        let stored = {
            let (repo, ack) = (&self.repository, &ack);
            with_retry("insert_acknowledgment", move || repo.insert_acknowledgment(ack)).await
        };
        match stored {
            Ok(true) => {}
            Ok(false) => {
                // Already in the store from an earlier process; memory now agrees.
                return Ok(AckOutcome::Duplicate {
                    acknowledged_at: ack.acknowledged_at,
                });
            }
            Err(e) => {
                active.acks.forget(&ack.recipient_id);
                return Err(e.into());
            }
        }

        ctx.apply_acknowledgment();
        for update in active.tracker.mark_acknowledged(&ack.recipient_id, now) {
            self.publish_delivery(&update);
            self.store_delivery_logged(&update.delivery).await;
        }

        let transition = self.transition(&mut ctx, EmergencyEvent::AckReceived, now);
        if transition.is_applied() {
            self.settle_if_all_acknowledged(&mut ctx, now);
        }

        tracing::info!(
            name = "emergency.acknowledged",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Acknowledgment recorded",
            emergency_id = %emergency_id,
            recipient_id = %ack.recipient_id,
            pending_acks = ctx.pending_acks,
            state = ctx.state.as_str(),
        );

        self.finish_mutation(&active, &mut ctx).await?;
        Ok(AckOutcome::Recorded {
            state: ctx.state,
            pending_acks: ctx.pending_acks,
        })
    }

    /// Apply an asynchronous receipt from a channel (e.g. a carrier delivery report).
    #[tracing::instrument(skip(self))]
    pub async fn record_delivery_receipt(
        &self,
        emergency_id: &str,
        recipient_id: &str,
        channel: Channel,
        status: DeliveryStatus,
        error_message: Option<String>,
    ) -> Result<Option<RecipientDelivery>, EmergencyError> {
        let active = match self.lookup(emergency_id).await? {
            Lookup::Active(active) => active,
            Lookup::Closed(_) => return Ok(None),
        };
        let mut ctx = active.context.lock().await;
        if ctx.is_terminal() || active.is_closed() {
            return Ok(None);
        }
        let key = DeliveryKey::new(recipient_id, channel);
        let now = self.clock.now();
        let Some(update) =
            self.apply_outcome(&active, &mut ctx, &key, outcome_of(status), error_message, now)
        else {
            return Err(EmergencyError::UnknownRecipient {
                emergency_id: emergency_id.to_string(),
                recipient_id: recipient_id.to_string(),
            });
        };
        self.store_delivery(&update.delivery).await?;
        self.persist(&mut ctx).await?;
        Ok(Some(update.delivery))
    }

    /// Close an emergency as handled.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_emergency(
        &self,
        actor: &Actor,
        emergency_id: &str,
    ) -> Result<Transition, EmergencyError> {
        let active = match self.lookup(emergency_id).await? {
            Lookup::Active(active) => active,
            Lookup::Closed(ctx) => {
                if !self
                    .authorization
                    .can_resolve(actor.role, &ctx.initiated_by, &actor.user_id)
                {
                    return Err(EmergencyError::Unauthorized("resolve this emergency"));
                }
                return Ok(Transition::Rejected {
                    state: ctx.state,
                    event: EmergencyEvent::Resolve,
                });
            }
        };
        let mut ctx = active.context.lock().await;
        if !self
            .authorization
            .can_resolve(actor.role, &ctx.initiated_by, &actor.user_id)
        {
            return Err(EmergencyError::Unauthorized("resolve this emergency"));
        }
        let now = self.clock.now();
        let transition = self.transition(&mut ctx, EmergencyEvent::Resolve, now);
        if transition.is_applied() {
            ctx.resolved_by = Some(actor.user_id.clone());
            self.finish_mutation(&active, &mut ctx).await?;
        }
        Ok(transition)
    }

    /// Abort an emergency. Queued sends are dropped and no further escalation
    /// or resend touches its deliveries.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_emergency(
        &self,
        actor: &Actor,
        emergency_id: &str,
    ) -> Result<Transition, EmergencyError> {
        if !self.authorization.can_cancel(actor.role) {
            return Err(EmergencyError::Unauthorized("cancel emergencies"));
        }
        let active = match self.lookup(emergency_id).await? {
            Lookup::Active(active) => active,
            Lookup::Closed(ctx) => {
                return Ok(Transition::Rejected {
                    state: ctx.state,
                    event: EmergencyEvent::Cancel,
                });
            }
        };
        let mut ctx = active.context.lock().await;
        let now = self.clock.now();
        let transition = self.transition(&mut ctx, EmergencyEvent::Cancel, now);
        if transition.is_applied() {
            ctx.cancelled_by = Some(actor.user_id.clone());
            self.finish_mutation(&active, &mut ctx).await?;
        }
        Ok(transition)
    }

    pub async fn get_delivery_stats(&self, emergency_id: &str) -> Result<DeliveryStats, EmergencyError> {
        if let Some(active) = self.active(emergency_id) {
            return Ok(active.tracker.stats());
        }
        if self.load_context(emergency_id).await?.is_none() {
            return Err(EmergencyError::NotFound(emergency_id.to_string()));
        }
        let deliveries = {
            let repo = &self.repository;
            with_retry("load_deliveries", move || repo.load_deliveries(emergency_id)).await?
        };
        Ok(DeliveryStats::from_deliveries(&deliveries))
    }

    pub async fn get_emergency_state(
        &self,
        emergency_id: &str,
    ) -> Result<EmergencyContext, EmergencyError> {
        if let Some(active) = self.active(emergency_id) {
            return Ok(active.context.lock().await.clone());
        }
        self.load_context(emergency_id)
            .await?
            .ok_or_else(|| EmergencyError::NotFound(emergency_id.to_string()))
    }

    /// Deliveries of an emergency, active or archived.
    pub async fn get_deliveries(
        &self,
        emergency_id: &str,
    ) -> Result<Vec<RecipientDelivery>, EmergencyError> {
        if let Some(active) = self.active(emergency_id) {
            return Ok(active.tracker.snapshot());
        }
        let repo = &self.repository;
        Ok(with_retry("load_deliveries", move || repo.load_deliveries(emergency_id)).await?)
    }

    /// Delete archived emergencies older than `cutoff` from the store.
    pub async fn purge_archived_before(
        &self,
        cutoff: time::OffsetDateTime,
    ) -> Result<u64, EmergencyError> {
        let repo = &self.repository;
        Ok(with_retry("purge_archived", move || repo.purge_archived_before(cutoff)).await?)
    }

    /// Reload every non-terminal emergency from the store. Evaluation resumes
    /// from the persisted `initiated_at`, so thresholds survive a restart.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EmergencyError> {
        let contexts = {
            let repo = &self.repository;
            with_retry("list_active", move || repo.list_active()).await?
        };
        let mut restored = 0;
        for ctx in contexts {
            if self.active.contains_key(&ctx.id) {
                continue;
            }
            self.restore(ctx).await?;
            restored += 1;
        }
        tracing::info!(
            name = "emergency.recovered",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Restored active emergencies",
            count = restored,
        );
        Ok(restored)
    }

    async fn restore(&self, ctx: EmergencyContext) -> Result<Arc<ActiveEmergency>, EmergencyError> {
        let id = ctx.id.clone();
        let repo = &self.repository;
        let key = id.as_str();
        let recipients = with_retry("load_recipients", move || repo.load_recipients(key)).await?;
        let deliveries = with_retry("load_deliveries", move || repo.load_deliveries(key)).await?;
        let acks = with_retry("load_acknowledgments", move || repo.load_acknowledgments(key)).await?;
        let queued = with_retry("load_queued_messages", move || repo.load_queued_messages(key)).await?;

        let active = Arc::new(ActiveEmergency::new(
            ctx,
            recipients,
            DeliveryTracker::from_deliveries(deliveries),
            AcknowledgmentStore::from_acknowledgments(acks),
        ));
        let active = self
            .active
            .entry(id.clone())
            .or_insert_with(|| active)
            .clone();

        let mut ctx = active.context.lock().await;
        let now = self.clock.now();
        let queued_keys: HashSet<DeliveryKey> = queued.iter().map(|m| m.delivery_key()).collect();
        for message in queued {
            self.dispatcher.enqueue(message);
        }
        if ctx.state == EmergencyState::Initiated {
            self.transition(&mut ctx, EmergencyEvent::StartBroadcast, now);
            self.persist(&mut ctx).await?;
        }
        // Pending deliveries whose send never made it into the queue.
        for d in active.tracker.snapshot() {
            if d.state == DeliveryState::Pending && !queued_keys.contains(&d.key()) {
                match self.render(&ctx, d.channel) {
                    Ok(content) => {
                        let message = PriorityDispatcher::message_for(&ctx, &d, content, now);
                        self.enqueue(message).await;
                    }
                    Err(e) => tracing::error!(
                        name = "emergency.recover.render_failed",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        message = "Failed to render message while restoring emergency",
                        emergency_id = %id,
                        error = %e,
                    ),
                }
            }
        }
        drop(ctx);
        Ok(active)
    }

    async fn lookup(&self, emergency_id: &str) -> Result<Lookup, EmergencyError> {
        if let Some(active) = self.active(emergency_id) {
            return Ok(Lookup::Active(active));
        }
        match self.load_context(emergency_id).await? {
            None => Err(EmergencyError::NotFound(emergency_id.to_string())),
            Some(ctx) if ctx.is_terminal() => Ok(Lookup::Closed(ctx)),
            Some(ctx) => Ok(Lookup::Active(self.restore(ctx).await?)),
        }
    }

    async fn load_context(&self, id: &str) -> Result<Option<EmergencyContext>, PersistenceError> {
        let repo = &self.repository;
        with_retry("load_context", move || repo.load_context(id)).await
    }

    pub(crate) fn render(
        &self,
        ctx: &EmergencyContext,
        channel: Channel,
    ) -> Result<RenderedMessage, EmergencyError> {
        Ok(self
            .renderer
            .render(ctx.details.emergency_type, channel, &template_variables(ctx))?)
    }

    /// Offer an event to the state machine and announce any state change.
    pub(crate) fn transition(
        &self,
        ctx: &mut EmergencyContext,
        event: EmergencyEvent,
        now: time::OffsetDateTime,
    ) -> Transition {
        let transition = advance(ctx, event, now);
        if let Transition::Applied { from, to, .. } = transition {
            if from != to {
                self.events.publish(EmergencyNotice::StateChanged {
                    emergency_id: ctx.id.clone(),
                    from,
                    to,
                });
            }
        }
        transition
    }

    /// An ack that leaves nobody pending lands in `awaiting_ack` from
    /// `escalating` (or from `broadcast_complete`); settle it to `resolved`.
    pub(crate) fn settle_if_all_acknowledged(
        &self,
        ctx: &mut EmergencyContext,
        now: time::OffsetDateTime,
    ) {
        if ctx.state == EmergencyState::AwaitingAck && ctx.pending_acks == 0 {
            self.transition(ctx, EmergencyEvent::AckReceived, now);
        }
    }

    /// Merge a channel outcome into a delivery and the context counters.
    pub(crate) fn apply_outcome(
        &self,
        active: &ActiveEmergency,
        ctx: &mut EmergencyContext,
        key: &DeliveryKey,
        outcome: SendOutcome,
        error_message: Option<String>,
        now: time::OffsetDateTime,
    ) -> Option<DeliveryUpdate> {
        let update = active.tracker.apply_outcome(key, outcome, error_message, now)?;
        if update.first_reached(DeliveryState::Sent) {
            ctx.sent_count += 1;
        }
        if update.first_reached(DeliveryState::Delivered) {
            ctx.delivered_count += 1;
        }
        if update.changed() {
            self.publish_delivery(&update);
        }
        Some(update)
    }

    pub(crate) fn publish_delivery(&self, update: &DeliveryUpdate) {
        self.events.publish(EmergencyNotice::DeliveryUpdated {
            emergency_id: update.delivery.emergency_id.clone(),
            recipient_id: update.delivery.recipient_id.clone(),
            channel: update.delivery.channel,
            state: update.delivery.state,
        });
    }

    /// Queue a send and keep it in the store until it completes.
    pub(crate) async fn enqueue(&self, message: QueuedEmergencyMessage) {
        let stored = {
            let (repo, m) = (&self.repository, &message);
            with_retry("save_queued_message", move || repo.save_queued_message(m)).await
        };
        if let Err(e) = stored {
            tracing::error!(
                name = "emergency.enqueue.persist_failed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "Queued message not persisted; it will not survive a restart",
                emergency_id = %message.emergency_id,
                error = %e,
            );
        }
        self.dispatcher.enqueue(message);
    }

    pub(crate) async fn forget_queued(&self, message: &QueuedEmergencyMessage) {
        let (repo, id) = (&self.repository, message.id.as_str());
        if let Err(e) = with_retry("delete_queued_message", move || repo.delete_queued_message(id)).await {
            tracing::warn!(
                name = "emergency.dequeue.persist_failed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "Failed to remove completed message from store",
                emergency_id = %message.emergency_id,
                error = %e,
            );
        }
    }

    pub(crate) async fn store_delivery(&self, delivery: &RecipientDelivery) -> Result<(), PersistenceError> {
        let repo = &self.repository;
        with_retry("upsert_delivery", move || repo.upsert_delivery(delivery)).await
    }

    pub(crate) async fn store_delivery_logged(&self, delivery: &RecipientDelivery) {
        if let Err(e) = self.store_delivery(delivery).await {
            tracing::error!(
                name = "emergency.delivery.persist_failed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "Failed to persist delivery",
                emergency_id = %delivery.emergency_id,
                recipient_id = %delivery.recipient_id,
                error = %e,
            );
        }
    }

    /// Save the context. A version conflict means the stored row moved under
    /// us; this process owns the emergency, so its state is re-applied on top
    /// of the stored version.
    pub(crate) async fn persist(&self, ctx: &mut EmergencyContext) -> Result<(), EmergencyError> {
        let repo = &self.repository;
        let saved = {
            let snapshot: &EmergencyContext = ctx;
            with_retry("save_context", move || repo.save_context(snapshot)).await
        };
        match saved {
            Ok(version) => {
                ctx.version = version;
                Ok(())
            }
            Err(PersistenceError::Conflict { .. }) => {
                let stored = self
                    .load_context(&ctx.id)
                    .await?
                    .ok_or_else(|| PersistenceError::NotFound(ctx.id.clone()))?;
                tracing::warn!(
                    name = "emergency.persist.conflict",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Version conflict, re-applying in-memory state",
                    emergency_id = %ctx.id,
                    ours = ctx.version,
                    stored = stored.version,
                );
                ctx.version = stored.version;
                let snapshot: &EmergencyContext = ctx;
                let version = with_retry("save_context", move || repo.save_context(snapshot)).await?;
                ctx.version = version;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist after a mutation and archive the emergency if it became terminal.
    pub(crate) async fn finish_mutation(
        &self,
        active: &ActiveEmergency,
        ctx: &mut EmergencyContext,
    ) -> Result<(), EmergencyError> {
        if ctx.is_terminal() {
            self.close(active, ctx).await;
        }
        self.persist(ctx).await
    }

    /// Tear down in-memory state for a terminal emergency.
    async fn close(&self, active: &ActiveEmergency, ctx: &mut EmergencyContext) {
        active.closed.store(true, Ordering::SeqCst);
        ctx.archived_at = Some(self.clock.now());
        self.tasks.stop_task(&ctx.id).await;
        let purged = self.dispatcher.purge(&ctx.id);
        {
            let (repo, id) = (&self.repository, ctx.id.as_str());
            if let Err(e) =
                with_retry("delete_queued_messages", move || repo.delete_queued_messages_for(id)).await
            {
                tracing::warn!(
                    name = "emergency.close.purge_failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Failed to purge stored queue",
                    emergency_id = %ctx.id,
                    error = %e,
                );
            }
        }
        self.active.remove(&ctx.id);
        tracing::info!(
            name = "emergency.closed",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Emergency closed",
            emergency_id = %ctx.id,
            state = ctx.state.as_str(),
            purged_messages = purged.len(),
            acknowledged = ctx.acknowledged_count,
            total_recipients = ctx.total_recipients,
        );
    }
}

pub(crate) fn outcome_of(status: DeliveryStatus) -> SendOutcome {
    match status {
        DeliveryStatus::Sent => SendOutcome::Sent,
        DeliveryStatus::Delivered => SendOutcome::Delivered,
        DeliveryStatus::Failed => SendOutcome::Failed,
    }
}

fn template_variables(ctx: &EmergencyContext) -> serde_json::Value {
    json!({
        "emergency_id": ctx.id,
        "title": ctx.details.title,
        "description": ctx.details.description,
        "instructions": ctx.details.instructions,
        "severity": ctx.details.severity.as_str(),
        "emergency_type": ctx.details.emergency_type.as_str(),
        "school_name": ctx.school_id,
    })
}

fn validate_initiation(actor: &Actor, request: &InitiateEmergency) -> Result<(), EmergencyError> {
    let missing = |field: &str| EmergencyError::Validation(format!("{field} is required"));
    if actor.user_id.trim().is_empty() {
        return Err(missing("initiated_by"));
    }
    if request.school_id.trim().is_empty() {
        return Err(missing("school_id"));
    }
    if request.details.title.trim().is_empty() {
        return Err(missing("details.title"));
    }
    if request.details.description.trim().is_empty() {
        return Err(missing("details.description"));
    }
    if request.recipients.is_empty() {
        return Err(missing("recipients"));
    }
    let mut seen = HashSet::new();
    for r in &request.recipients {
        if r.recipient_id.trim().is_empty() {
            return Err(missing("recipients[].recipient_id"));
        }
        if r.guardian_id.trim().is_empty() {
            return Err(missing("recipients[].guardian_id"));
        }
        if !seen.insert(r.recipient_id.as_str()) {
            return Err(EmergencyError::Validation(format!(
                "duplicate recipient '{}'",
                r.recipient_id
            )));
        }
    }
    Ok(())
}
