//! Severity-specific forced resend rules.

use crate::emergency::types::{DeliveryState, RecipientDelivery, Severity};
use once_cell::sync::Lazy;
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResendCondition {
    /// Handed to the channel (or not yet) without a delivery receipt.
    Undelivered,
    /// Delivered but not acknowledged.
    Unacknowledged,
    Failed,
}

impl ResendCondition {
    pub fn matches(self, state: DeliveryState) -> bool {
        match self {
            ResendCondition::Undelivered => {
                matches!(state, DeliveryState::Sent | DeliveryState::Pending)
            }
            ResendCondition::Unacknowledged => state == DeliveryState::Delivered,
            ResendCondition::Failed => state == DeliveryState::Failed,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResendRule {
    pub condition: ResendCondition,
    pub after_ms: u64,
    pub max_resends: u32,
    pub use_alternative_channel: bool,
}

const fn rule(condition: ResendCondition, after_ms: u64, max_resends: u32, alt: bool) -> ResendRule {
    ResendRule {
        condition,
        after_ms,
        max_resends,
        use_alternative_channel: alt,
    }
}

pub static RESEND_RULES: Lazy<HashMap<Severity, Vec<ResendRule>>> = Lazy::new(|| {
    use ResendCondition::*;
    HashMap::from([
        (
            Severity::Critical,
            vec![
                rule(Undelivered, 60_000, 5, true),
                rule(Unacknowledged, 120_000, 3, true),
                rule(Failed, 30_000, 5, true),
            ],
        ),
        (
            Severity::High,
            vec![
                rule(Undelivered, 120_000, 3, true),
                rule(Unacknowledged, 300_000, 2, false),
                rule(Failed, 60_000, 3, true),
            ],
        ),
        (
            Severity::Elevated,
            vec![rule(Undelivered, 300_000, 2, false), rule(Failed, 120_000, 2, true)],
        ),
        (Severity::Advisory, vec![rule(Failed, 300_000, 1, false)]),
    ])
});

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResendDecision {
    pub should_resend: bool,
    pub use_alternative_channel: bool,
}

#[derive(Clone, Debug)]
pub struct ResendPolicy {
    rules: HashMap<Severity, Vec<ResendRule>>,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self::new(RESEND_RULES.clone())
    }
}

impl ResendPolicy {
    pub fn new(rules: HashMap<Severity, Vec<ResendRule>>) -> Self {
        Self { rules }
    }

    /// Rules for `severity` whose condition matches the delivery's state, in declared order.
    pub fn get_applicable_resend_rules(
        &self,
        severity: Severity,
        delivery: &RecipientDelivery,
    ) -> Vec<ResendRule> {
        self.rules
            .get(&severity)
            .map(|rules| {
                rules
                    .iter()
                    .filter(|r| r.condition.matches(delivery.state))
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// First applicable rule whose wait has passed and whose budget is not
    /// spent. The budget counts forced resends only (`resend_count`), so a
    /// delivery that used up its dispatcher retries can still be resent.
    pub fn should_forced_resend(
        &self,
        delivery: &RecipientDelivery,
        severity: Severity,
        elapsed_ms: u64,
    ) -> ResendDecision {
        self.get_applicable_resend_rules(severity, delivery)
            .into_iter()
            .find(|r| elapsed_ms >= r.after_ms && delivery.resend_count < r.max_resends)
            .map(|r| ResendDecision {
                should_resend: true,
                use_alternative_channel: r.use_alternative_channel,
            })
            .unwrap_or_default()
    }
}
