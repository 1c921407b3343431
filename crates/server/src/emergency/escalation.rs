//! Level-based escalation of recipients who have not acknowledged.
//!
//! Thresholds are cumulative: level N fires once the time since the emergency
//! started reaches the sum of `trigger_after_ms` of levels 1..=N.

use crate::emergency::types::{DeliveryState, RecipientDelivery, millis_between};
use once_cell::sync::Lazy;
use serde::Serialize;
use time::OffsetDateTime;
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EscalationAction {
    /// Send once more on the delivery's own channel.
    ResendPrimary,
    /// Open a delivery on the recipient's next unused allowed contact.
    SwitchToAlternateChannel,
    /// Open deliveries on every unused allowed contact.
    AllRemainingChannels,
    NotifySchoolAdmin,
    NotifyDistrictAdmin,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct EscalationRule {
    pub level: u32,
    pub trigger_after_ms: u64,
    pub actions: Vec<EscalationAction>,
    pub max_attempts: u32,
}

pub static ESCALATION_RULES: Lazy<Vec<EscalationRule>> = Lazy::new(|| {
    use EscalationAction::*;
    vec![
        EscalationRule {
            level: 1,
            trigger_after_ms: 180_000,
            actions: vec![ResendPrimary, SwitchToAlternateChannel],
            max_attempts: 2,
        },
        EscalationRule {
            level: 2,
            trigger_after_ms: 300_000,
            actions: vec![AllRemainingChannels, NotifySchoolAdmin],
            max_attempts: 2,
        },
        EscalationRule {
            level: 3,
            trigger_after_ms: 600_000,
            actions: vec![AllRemainingChannels, NotifyDistrictAdmin],
            max_attempts: 1,
        },
    ]
});

#[derive(Clone, Debug)]
pub struct EscalationEngine {
    rules: Vec<EscalationRule>,
}

impl Default for EscalationEngine {
    fn default() -> Self {
        Self::new(ESCALATION_RULES.clone())
    }
}

impl EscalationEngine {
    /// Rules must be ordered by level starting at 1.
    pub fn new(rules: Vec<EscalationRule>) -> Self {
        Self { rules }
    }

    /// Rule at exactly `level`, `None` for 0 or past the last level.
    pub fn get_escalation_rule(&self, level: u32) -> Option<&EscalationRule> {
        self.rules.iter().find(|r| r.level == level)
    }

    pub fn max_level(&self) -> u32 {
        self.rules.iter().map(|r| r.level).max().unwrap_or(0)
    }

    /// Cumulative time from emergency start at which `level` fires.
    pub fn threshold_ms(&self, level: u32) -> Option<u64> {
        self.get_escalation_rule(level)?;
        Some(
            self.rules
                .iter()
                .filter(|r| r.level <= level)
                .map(|r| r.trigger_after_ms)
                .sum(),
        )
    }

    /// Whether `delivery` should move to `current_level + 1`.
    pub fn should_escalate(
        &self,
        delivery: &RecipientDelivery,
        started_at: OffsetDateTime,
        current_level: u32,
        now: OffsetDateTime,
    ) -> bool {
        if matches!(
            delivery.state,
            DeliveryState::Acknowledged | DeliveryState::Escalated
        ) {
            return false;
        }
        match self.threshold_ms(current_level + 1) {
            Some(threshold) => millis_between(started_at, now) >= threshold,
            None => false,
        }
    }

    /// Whether the final level has run its course: the highest level has been
    /// reached and its own trigger window has elapsed since it fired.
    pub fn is_exhausted(
        &self,
        current_level: u32,
        last_escalation_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> bool {
        let max = self.max_level();
        if max == 0 || current_level < max {
            return false;
        }
        let Some(rule) = self.get_escalation_rule(max) else {
            return false;
        };
        last_escalation_at.is_some_and(|at| millis_between(at, now) >= rule.trigger_after_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emergency::types::{Channel, ContactPoint, Recipient};
    use time::Duration;

    fn delivery(state: DeliveryState) -> RecipientDelivery {
        let r = Recipient {
            recipient_id: "r1".into(),
            guardian_id: "g1".into(),
            student_id: "s1".into(),
            contacts: vec![],
        };
        let c = ContactPoint {
            channel: Channel::Sms,
            address: "+15550100".into(),
        };
        let mut d = RecipientDelivery::new("em-1", &r, &c, 0, OffsetDateTime::now_utc());
        d.state = state;
        d
    }

    #[test]
    fn rule_lookup_is_exact() {
        let engine = EscalationEngine::default();
        assert!(engine.get_escalation_rule(0).is_none());
        assert!(engine.get_escalation_rule(4).is_none());
        assert_eq!(engine.get_escalation_rule(2).unwrap().trigger_after_ms, 300_000);
        assert_eq!(engine.max_level(), 3);
    }

    #[test]
    fn thresholds_accumulate() {
        let engine = EscalationEngine::default();
        assert_eq!(engine.threshold_ms(1), Some(180_000));
        assert_eq!(engine.threshold_ms(2), Some(480_000));
        assert_eq!(engine.threshold_ms(3), Some(1_080_000));
        assert_eq!(engine.threshold_ms(4), None);
    }

    #[test]
    fn escalates_at_cumulative_threshold() {
        let engine = EscalationEngine::default();
        let start = OffsetDateTime::now_utc();
        let d = delivery(DeliveryState::Delivered);

        assert!(!engine.should_escalate(&d, start, 0, start + Duration::seconds(179)));
        assert!(engine.should_escalate(&d, start, 0, start + Duration::seconds(180)));
        assert!(!engine.should_escalate(&d, start, 1, start + Duration::seconds(300)));
        assert!(engine.should_escalate(&d, start, 1, start + Duration::seconds(480)));
        assert!(!engine.should_escalate(&d, start, 3, start + Duration::hours(5)));
    }

    #[test]
    fn terminal_deliveries_never_escalate() {
        let engine = EscalationEngine::default();
        let start = OffsetDateTime::now_utc();
        let late = start + Duration::hours(1);
        for state in [DeliveryState::Acknowledged, DeliveryState::Escalated] {
            assert!(!engine.should_escalate(&delivery(state), start, 0, late));
        }
        for state in [
            DeliveryState::Pending,
            DeliveryState::Sent,
            DeliveryState::Failed,
        ] {
            assert!(engine.should_escalate(&delivery(state), start, 0, late));
        }
    }

    #[test]
    fn exhaustion_waits_for_final_window() {
        let engine = EscalationEngine::default();
        let fired = OffsetDateTime::now_utc();
        assert!(!engine.is_exhausted(2, Some(fired), fired + Duration::hours(1)));
        assert!(!engine.is_exhausted(3, Some(fired), fired + Duration::seconds(599)));
        assert!(engine.is_exhausted(3, Some(fired), fired + Duration::seconds(600)));
        assert!(!engine.is_exhausted(3, None, fired));
    }
}
