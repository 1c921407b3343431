//! Periodic evaluation of active emergencies and handling of send results.

use crate::channels::DeliveryResult;
use crate::emergency::controller::{ActiveEmergency, EmergencyController, outcome_of};
use crate::emergency::dispatcher::{DispatchOutcome, PriorityDispatcher};
use crate::emergency::escalation::EscalationAction;
use crate::emergency::tracker::SendOutcome;
use crate::emergency::types::{
    DeliveryKey, DeliveryState, EmergencyContext, EmergencyEvent, EmergencyState, QueuedEmergencyMessage,
    RecipientDelivery, millis_between,
};
use crate::error::EmergencyError;
use crate::events::EmergencyNotice;
use time::OffsetDateTime;

/// What one evaluation pass did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub state: Option<EmergencyState>,
    pub escalated_to: Option<u32>,
    pub escalated_deliveries: usize,
    pub opened_deliveries: usize,
    pub resends: usize,
    pub exhausted: bool,
}

impl EmergencyController {
    /// Advance one emergency by the clock: broadcast completion, ack timeouts,
    /// escalation levels and forced resends.
    #[tracing::instrument(skip(self))]
    pub async fn evaluate(&self, emergency_id: &str) -> Result<EvaluationReport, EmergencyError> {
        let Some(active) = self.active(emergency_id) else {
            return Ok(EvaluationReport::default());
        };
        let mut ctx = active.context.lock().await;
        if ctx.is_terminal() || active.is_closed() {
            return Ok(EvaluationReport {
                state: Some(ctx.state),
                ..Default::default()
            });
        }
        let now = self.clock.now();
        let mut report = EvaluationReport::default();
        let version = ctx.version;
        let before = ctx.clone();

        if ctx.state == EmergencyState::Broadcasting
            && self.dispatcher.outstanding(&ctx.id) == 0
            && !active.tracker.has_state(DeliveryState::Pending)
        {
            self.transition(&mut ctx, EmergencyEvent::BroadcastComplete, now);
            self.settle_if_all_acknowledged(&mut ctx, now);
        }

        if ctx.state == EmergencyState::AwaitingAck && ctx.pending_acks > 0 {
            let timeout_ms = ctx.config.escalate_after_ms;
            let overdue = active.recipients.keys().any(|recipient_id| {
                active
                    .acks
                    .is_overdue(recipient_id, ctx.initiated_at, timeout_ms, now)
            });
            if overdue {
                self.transition(&mut ctx, EmergencyEvent::AckTimeout, now);
            }
        }

        if ctx.state == EmergencyState::Escalating {
            self.escalate(&active, &mut ctx, now, &mut report).await;
            self.check_exhaustion(&active, &mut ctx, now, &mut report);
        }

        if matches!(
            ctx.state,
            EmergencyState::AwaitingAck | EmergencyState::Escalating
        ) {
            self.forced_resends(&active, &ctx, now, &mut report).await;
        }

        report.state = Some(ctx.state);
        let mut comparable = ctx.clone();
        comparable.version = version;
        if comparable != before {
            self.finish_mutation(&active, &mut ctx).await?;
        }
        Ok(report)
    }

    async fn escalate(
        &self,
        active: &ActiveEmergency,
        ctx: &mut EmergencyContext,
        now: OffsetDateTime,
        report: &mut EvaluationReport,
    ) {
        if ctx.pending_acks == 0 {
            return;
        }
        let current = ctx.escalation_level;
        let Some(rule) = self.escalation.get_escalation_rule(current + 1).cloned() else {
            return;
        };
        let escalating: Vec<RecipientDelivery> = active
            .tracker
            .outstanding()
            .into_iter()
            .filter(|d| !active.acks.has_acknowledged(&d.recipient_id))
            .filter(|d| {
                self.escalation
                    .should_escalate(d, ctx.initiated_at, current, now)
            })
            .collect();
        let threshold_reached = self
            .escalation
            .threshold_ms(rule.level)
            .is_some_and(|threshold| ctx.elapsed_ms(now) >= threshold);
        if !threshold_reached {
            return;
        }
        if !self.transition(ctx, EmergencyEvent::Escalate, now).is_applied() {
            return;
        }
        report.escalated_to = Some(ctx.escalation_level);

        for d in &escalating {
            if let Some(update) = active.tracker.mark_escalated(&d.key(), now) {
                self.publish_delivery(&update);
                self.store_delivery_logged(&update.delivery).await;
                report.escalated_deliveries += 1;
            }
        }

        let mut unacked: Vec<&String> = active
            .recipients
            .keys()
            .filter(|r| !active.acks.has_acknowledged(r))
            .collect();
        unacked.sort();

        tracing::warn!(
            name = "emergency.escalated",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Escalating unacknowledged emergency",
            emergency_id = %ctx.id,
            level = ctx.escalation_level,
            unacknowledged = unacked.len(),
            actions = ?rule.actions,
        );

        for action in &rule.actions {
            match action {
                EscalationAction::ResendPrimary => {
                    for recipient_id in &unacked {
                        if self.dispatcher.has_outstanding_for(&ctx.id, recipient_id) {
                            continue;
                        }
                        let primary = escalating
                            .iter()
                            .filter(|d| &&d.recipient_id == recipient_id)
                            .min_by_key(|d| d.escalation_level);
                        if let Some(d) = primary {
                            if self.send_again(ctx, d, now).await {
                                report.resends += 1;
                            }
                        }
                    }
                }
                EscalationAction::SwitchToAlternateChannel => {
                    for recipient_id in &unacked {
                        let next = active.unused_contacts(ctx, recipient_id).into_iter().next();
                        if let Some(contact) = next {
                            if self.open_delivery(active, ctx, recipient_id, &contact, now).await {
                                report.opened_deliveries += 1;
                            }
                        }
                    }
                }
                EscalationAction::AllRemainingChannels => {
                    for recipient_id in &unacked {
                        for contact in active.unused_contacts(ctx, recipient_id) {
                            if self.open_delivery(active, ctx, recipient_id, &contact, now).await {
                                report.opened_deliveries += 1;
                            }
                        }
                    }
                }
                EscalationAction::NotifySchoolAdmin | EscalationAction::NotifyDistrictAdmin => {
                    let district = *action == EscalationAction::NotifyDistrictAdmin;
                    tracing::warn!(
                        name = "emergency.escalated.admin_notified",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        message = "Notifying administrators of unacknowledged recipients",
                        emergency_id = %ctx.id,
                        school_id = %ctx.school_id,
                        level = ctx.escalation_level,
                        district = district,
                    );
                    self.events.publish(EmergencyNotice::AdministratorNotified {
                        emergency_id: ctx.id.clone(),
                        school_id: ctx.school_id.clone(),
                        level: ctx.escalation_level,
                        district,
                        outstanding: unacked.iter().map(|r| (*r).clone()).collect(),
                    });
                }
            }
        }
    }

    fn check_exhaustion(
        &self,
        active: &ActiveEmergency,
        ctx: &mut EmergencyContext,
        now: OffsetDateTime,
        report: &mut EvaluationReport,
    ) {
        if ctx.escalation_exhausted
            || ctx.pending_acks == 0
            || !self
                .escalation
                .is_exhausted(ctx.escalation_level, ctx.last_escalation_at, now)
        {
            return;
        }
        ctx.escalation_exhausted = true;
        report.exhausted = true;
        let mut outstanding: Vec<String> = active
            .recipients
            .keys()
            .filter(|r| !active.acks.has_acknowledged(r))
            .cloned()
            .collect();
        outstanding.sort();
        tracing::warn!(
            name = "emergency.escalation.exhausted",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "All escalation levels used without full acknowledgment",
            emergency_id = %ctx.id,
            initiated_by = %ctx.initiated_by,
            outstanding = outstanding.len(),
        );
        self.events.publish(EmergencyNotice::EscalationExhausted {
            emergency_id: ctx.id.clone(),
            initiated_by: ctx.initiated_by.clone(),
            outstanding,
        });
    }

    async fn forced_resends(
        &self,
        active: &ActiveEmergency,
        ctx: &EmergencyContext,
        now: OffsetDateTime,
        report: &mut EvaluationReport,
    ) {
        let severity = ctx.details.severity;
        for d in active.tracker.outstanding() {
            if active.acks.has_acknowledged(&d.recipient_id)
                || self.dispatcher.has_outstanding_for(&ctx.id, &d.recipient_id)
            {
                continue;
            }
            let elapsed = millis_between(d.resend_window_start(ctx.initiated_at), now);
            let decision = self.resend.should_forced_resend(&d, severity, elapsed);
            if !decision.should_resend {
                continue;
            }
            let key = d.key();
            if decision.use_alternative_channel {
                let next = active
                    .unused_contacts(ctx, &d.recipient_id)
                    .into_iter()
                    .next();
                if let Some(contact) = next {
                    if self
                        .open_delivery(active, ctx, &d.recipient_id, &contact, now)
                        .await
                    {
                        report.opened_deliveries += 1;
                        report.resends += 1;
                        self.count_resend(active, &key, now).await;
                    }
                    continue;
                }
            }
            if let Some(update) = active.tracker.requeue(&key) {
                if update.changed() {
                    self.publish_delivery(&update);
                }
                if self.send_again(ctx, &update.delivery, now).await {
                    report.resends += 1;
                    self.count_resend(active, &key, now).await;
                } else if update.changed() {
                    self.store_delivery_logged(&update.delivery).await;
                }
            }
        }
    }

    async fn count_resend(&self, active: &ActiveEmergency, key: &DeliveryKey, now: OffsetDateTime) {
        if let Some(update) = active.tracker.record_resend(key, now) {
            self.store_delivery_logged(&update.delivery).await;
        }
    }

    /// Render and enqueue another send for an existing delivery.
    async fn send_again(
        &self,
        ctx: &EmergencyContext,
        delivery: &RecipientDelivery,
        now: OffsetDateTime,
    ) -> bool {
        match self.render(ctx, delivery.channel) {
            Ok(content) => {
                let message = PriorityDispatcher::message_for(ctx, delivery, content, now);
                self.enqueue(message).await;
                true
            }
            Err(e) => {
                tracing::error!(
                    name = "emergency.resend.render_failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Failed to render resend",
                    emergency_id = %ctx.id,
                    recipient_id = %delivery.recipient_id,
                    error = %e,
                );
                false
            }
        }
    }

    /// Open a delivery on another contact of a recipient and queue its first send.
    async fn open_delivery(
        &self,
        active: &ActiveEmergency,
        ctx: &EmergencyContext,
        recipient_id: &str,
        contact: &crate::emergency::types::ContactPoint,
        now: OffsetDateTime,
    ) -> bool {
        let Some(recipient) = active.recipients.get(recipient_id) else {
            return false;
        };
        let delivery = RecipientDelivery::new(&ctx.id, recipient, contact, ctx.escalation_level, now);
        if !active.tracker.open(delivery.clone()) {
            return false;
        }
        self.store_delivery_logged(&delivery).await;
        tracing::info!(
            name = "emergency.delivery.opened",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Reaching recipient on another channel",
            emergency_id = %ctx.id,
            recipient_id = %recipient_id,
            channel = contact.channel.as_str(),
            level = ctx.escalation_level,
        );
        self.send_again(ctx, &delivery, now).await
    }

    /// Send everything due now and fold the results back in. Returns the
    /// number of sends attempted.
    pub async fn dispatch_ready(&self) -> usize {
        let now = self.clock.now();
        let mut batch = Vec::new();
        for message in self.dispatcher.take_ready(now) {
            match self.active(&message.emergency_id) {
                Some(active) if !active.is_closed() => {
                    active.tracker.record_attempt(&message.delivery_key(), now);
                    batch.push(message);
                }
                _ => self.discard(&message).await,
            }
        }
        if batch.is_empty() {
            return 0;
        }
        let sent = batch.len();
        for (message, result) in self.dispatcher.send_all(batch).await {
            if let Err(e) = self.handle_send_result(message, result).await {
                tracing::error!(
                    name = "emergency.dispatch.result_failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Failed to record send result",
                    error = %e,
                );
            }
        }
        sent
    }

    async fn discard(&self, message: &QueuedEmergencyMessage) {
        self.dispatcher.finish(message);
        self.forget_queued(message).await;
    }

    async fn handle_send_result(
        &self,
        message: QueuedEmergencyMessage,
        result: DeliveryResult,
    ) -> Result<(), EmergencyError> {
        let Some(active) = self.active(&message.emergency_id) else {
            self.discard(&message).await;
            return Ok(());
        };
        let mut ctx = active.context.lock().await;
        if ctx.is_terminal() || active.is_closed() {
            drop(ctx);
            self.discard(&message).await;
            return Ok(());
        }
        let now = self.clock.now();
        let key = message.delivery_key();
        let outcome = outcome_of(result.status);

        let update = match PriorityDispatcher::after_send(
            &message,
            &result,
            ctx.config.retry_interval_ms,
            now,
        ) {
            DispatchOutcome::Completed => {
                self.dispatcher.finish(&message);
                self.forget_queued(&message).await;
                self.apply_outcome(&active, &mut ctx, &key, outcome, None, now)
            }
            DispatchOutcome::Retry(retry) => {
                let update =
                    self.apply_outcome(&active, &mut ctx, &key, SendOutcome::Failed, result.error_message.clone(), now);
                self.dispatcher.finish(&message);
                self.enqueue(retry).await;
                update
            }
            DispatchOutcome::Exhausted => {
                self.dispatcher.finish(&message);
                self.forget_queued(&message).await;
                self.apply_outcome(&active, &mut ctx, &key, SendOutcome::Failed, result.error_message.clone(), now);
                tracing::warn!(
                    name = "emergency.delivery.exhausted",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Send retries exhausted",
                    emergency_id = %message.emergency_id,
                    recipient_id = %message.recipient_id,
                    channel = message.channel.as_str(),
                    attempts = message.attempts + 1,
                );
                active.tracker.mark_failed(&key, result.error_message.clone())
            }
        };

        if let Some(update) = update {
            if update.delivery.state == DeliveryState::Failed {
                tracing::debug!(
                    name = "emergency.delivery.failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    message = "Send failed",
                    emergency_id = %message.emergency_id,
                    recipient_id = %message.recipient_id,
                    error = ?update.delivery.error_message,
                );
            }
            self.store_delivery(&update.delivery).await?;
        }
        self.persist(&mut ctx).await
    }
}
