//! Core data model for emergencies, deliveries and acknowledgments.

use crate::render::RenderedMessage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use utoipa::ToSchema;

/// Kind of emergency being declared.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyType {
    SchoolClosure,
    SafetyIncident,
    WeatherDisruption,
    InfrastructureFailure,
}

impl EmergencyType {
    pub const ALL: [EmergencyType; 4] = [
        EmergencyType::SchoolClosure,
        EmergencyType::SafetyIncident,
        EmergencyType::WeatherDisruption,
        EmergencyType::InfrastructureFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyType::SchoolClosure => "school_closure",
            EmergencyType::SafetyIncident => "safety_incident",
            EmergencyType::WeatherDisruption => "weather_disruption",
            EmergencyType::InfrastructureFailure => "infrastructure_failure",
        }
    }
}

/// Severity of an emergency. Declared lowest to highest so `Ord` follows urgency.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Advisory,
    Elevated,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Advisory => "advisory",
            Severity::Elevated => "elevated",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Lifecycle state of an emergency.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyState {
    Initiated,
    Broadcasting,
    AwaitingAck,
    Escalating,
    Resolved,
    Cancelled,
}

impl EmergencyState {
    pub const ALL: [EmergencyState; 6] = [
        EmergencyState::Initiated,
        EmergencyState::Broadcasting,
        EmergencyState::AwaitingAck,
        EmergencyState::Escalating,
        EmergencyState::Resolved,
        EmergencyState::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, EmergencyState::Resolved | EmergencyState::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyState::Initiated => "initiated",
            EmergencyState::Broadcasting => "broadcasting",
            EmergencyState::AwaitingAck => "awaiting_ack",
            EmergencyState::Escalating => "escalating",
            EmergencyState::Resolved => "resolved",
            EmergencyState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for EmergencyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmergencyState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EmergencyState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown emergency state '{s}'"))
    }
}

/// Events that drive the emergency state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyEvent {
    StartBroadcast,
    BroadcastComplete,
    AckReceived,
    AckTimeout,
    Escalate,
    Resolve,
    Cancel,
}

impl EmergencyEvent {
    pub const ALL: [EmergencyEvent; 7] = [
        EmergencyEvent::StartBroadcast,
        EmergencyEvent::BroadcastComplete,
        EmergencyEvent::AckReceived,
        EmergencyEvent::AckTimeout,
        EmergencyEvent::Escalate,
        EmergencyEvent::Resolve,
        EmergencyEvent::Cancel,
    ];
}

/// Outbound notification channel.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Sms,
    #[serde(rename = "whatsapp")]
    WhatsApp,
    Email,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Sms, Channel::WhatsApp, Channel::Email];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Sms => "sms",
            Channel::WhatsApp => "whatsapp",
            Channel::Email => "email",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .into_iter()
            .find(|channel| channel.as_str() == s)
            .ok_or_else(|| format!("unknown channel '{s}'"))
    }
}

/// What the admin declared. Immutable for the lifetime of the emergency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EmergencyDetails {
    pub emergency_type: EmergencyType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Retry and escalation parameters attached to an emergency.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct EmergencyConfig {
    pub max_retry_attempts: u32,
    pub retry_interval_ms: u64,
    pub require_acknowledgment: bool,
    pub escalate_after_ms: u64,
    pub allowed_channels: Vec<Channel>,
}

impl EmergencyConfig {
    pub fn allows(&self, channel: Channel) -> bool {
        self.allowed_channels.contains(&channel)
    }
}

/// One declared emergency and its aggregate counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct EmergencyContext {
    pub id: String,
    pub state: EmergencyState,
    pub details: EmergencyDetails,
    pub config: EmergencyConfig,
    pub initiated_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub initiated_at: OffsetDateTime,
    pub school_id: String,
    pub total_recipients: u32,
    pub sent_count: u32,
    pub delivered_count: u32,
    pub acknowledged_count: u32,
    pub pending_acks: u32,
    pub escalation_level: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_escalation_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cancelled_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub cancelled_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub archived_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub escalation_exhausted: bool,
    /// Optimistic concurrency token, bumped on every successful save.
    pub version: i64,
}

impl EmergencyContext {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Milliseconds elapsed since the emergency was initiated, clamped at zero.
    pub fn elapsed_ms(&self, now: OffsetDateTime) -> u64 {
        millis_between(self.initiated_at, now)
    }

    /// Count a first acknowledgment from a recipient and keep `pending_acks` in step.
    pub fn apply_acknowledgment(&mut self) {
        self.acknowledged_count = (self.acknowledged_count + 1).min(self.total_recipients);
        self.pending_acks = self.total_recipients - self.acknowledged_count;
    }
}

/// Milliseconds from `from` to `to`, zero when `to` is earlier.
pub fn millis_between(from: OffsetDateTime, to: OffsetDateTime) -> u64 {
    let ms = (to - from).whole_milliseconds();
    if ms <= 0 { 0 } else { ms as u64 }
}

/// A channel-specific address for a guardian.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ContactPoint {
    pub channel: Channel,
    pub address: String,
}

/// A guardian targeted by an emergency. Contacts are in preference order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Recipient {
    pub recipient_id: String,
    pub guardian_id: String,
    pub student_id: String,
    pub contacts: Vec<ContactPoint>,
}

impl Recipient {
    /// Contacts usable under the given config, in preference order.
    pub fn allowed_contacts<'a>(
        &'a self,
        config: &'a EmergencyConfig,
    ) -> impl Iterator<Item = &'a ContactPoint> + 'a {
        self.contacts.iter().filter(|c| config.allows(c.channel))
    }
}

/// Per-(recipient, channel) delivery state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Delivered,
    Acknowledged,
    Failed,
    Escalated,
}

impl DeliveryState {
    pub const ALL: [DeliveryState; 6] = [
        DeliveryState::Pending,
        DeliveryState::Sent,
        DeliveryState::Delivered,
        DeliveryState::Acknowledged,
        DeliveryState::Failed,
        DeliveryState::Escalated,
    ];

    /// No automatic resend or escalation touches a delivery in these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Acknowledged | DeliveryState::Escalated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Acknowledged => "acknowledged",
            DeliveryState::Failed => "failed",
            DeliveryState::Escalated => "escalated",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown delivery state '{s}'"))
    }
}

/// Identifies a delivery within one emergency.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub recipient_id: String,
    pub channel: Channel,
}

impl DeliveryKey {
    pub fn new(recipient_id: impl Into<String>, channel: Channel) -> Self {
        Self {
            recipient_id: recipient_id.into(),
            channel,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RecipientDelivery {
    pub emergency_id: String,
    pub recipient_id: String,
    pub guardian_id: String,
    pub student_id: String,
    pub channel: Channel,
    pub address: String,
    pub state: DeliveryState,
    pub attempts: u32,
    /// Forced resends issued for this delivery. Separate from `attempts`,
    /// which counts every send including dispatcher retries.
    #[serde(default)]
    pub resend_count: u32,
    /// Escalation level under which this delivery was opened (0 = initial broadcast).
    pub escalation_level: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_resend_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub acknowledged_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub escalated_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl RecipientDelivery {
    pub fn new(
        emergency_id: &str,
        recipient: &Recipient,
        contact: &ContactPoint,
        escalation_level: u32,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            emergency_id: emergency_id.to_string(),
            recipient_id: recipient.recipient_id.clone(),
            guardian_id: recipient.guardian_id.clone(),
            student_id: recipient.student_id.clone(),
            channel: contact.channel,
            address: contact.address.clone(),
            state: DeliveryState::Pending,
            attempts: 0,
            resend_count: 0,
            escalation_level,
            created_at: now,
            last_attempt_at: None,
            last_resend_at: None,
            delivered_at: None,
            acknowledged_at: None,
            escalated_at: None,
            error_message: None,
        }
    }

    pub fn key(&self) -> DeliveryKey {
        DeliveryKey::new(self.recipient_id.clone(), self.channel)
    }

    /// Start of the current forced-resend wait: the latest send or forced
    /// resend, or `started_at` when neither happened yet.
    pub fn resend_window_start(&self, started_at: OffsetDateTime) -> OffsetDateTime {
        match (self.last_attempt_at, self.last_resend_at) {
            (Some(a), Some(r)) => a.max(r),
            (Some(t), None) | (None, Some(t)) => t,
            (None, None) => started_at,
        }
    }
}

/// How a guardian acknowledged the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AckMethod {
    Reply,
    Button,
    Link,
    Auto,
}

impl AckMethod {
    pub const ALL: [AckMethod; 4] = [
        AckMethod::Reply,
        AckMethod::Button,
        AckMethod::Link,
        AckMethod::Auto,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AckMethod::Reply => "reply",
            AckMethod::Button => "button",
            AckMethod::Link => "link",
            AckMethod::Auto => "auto",
        }
    }
}

impl FromStr for AckMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AckMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| format!("unknown acknowledgment method '{s}'"))
    }
}

/// Immutable acknowledgment record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Acknowledgment {
    pub id: String,
    pub emergency_id: String,
    pub recipient_id: String,
    pub guardian_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub acknowledged_at: OffsetDateTime,
    pub channel: Channel,
    pub method: AckMethod,
}

/// One send attempt waiting in the priority queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEmergencyMessage {
    pub id: String,
    pub emergency_id: String,
    pub recipient_id: String,
    pub guardian_id: String,
    pub channel: Channel,
    pub address: String,
    pub priority: u32,
    pub content: RenderedMessage,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub next_retry_at: OffsetDateTime,
    pub bypass_offline_queue: bool,
}

impl QueuedEmergencyMessage {
    pub fn delivery_key(&self) -> DeliveryKey {
        DeliveryKey::new(self.recipient_id.clone(), self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_forms_round_trip() {
        for state in EmergencyState::ALL {
            assert_eq!(state.as_str().parse::<EmergencyState>().unwrap(), state);
        }
        for state in DeliveryState::ALL {
            assert_eq!(state.as_str().parse::<DeliveryState>().unwrap(), state);
        }
        for channel in Channel::ALL {
            assert_eq!(channel.as_str().parse::<Channel>().unwrap(), channel);
        }
        assert!("carrier_pigeon".parse::<Channel>().is_err());
    }

    #[test]
    fn whatsapp_serializes_as_single_word() {
        let json = serde_json::to_string(&Channel::WhatsApp).unwrap();
        assert_eq!(json, "\"whatsapp\"");
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Elevated);
        assert!(Severity::Elevated > Severity::Advisory);
    }

    #[test]
    fn resend_window_starts_at_latest_send_or_resend() {
        let start = OffsetDateTime::now_utc();
        let recipient = Recipient {
            recipient_id: "r1".into(),
            guardian_id: "g1".into(),
            student_id: "s1".into(),
            contacts: vec![],
        };
        let contact = ContactPoint {
            channel: Channel::Sms,
            address: "+15550100".into(),
        };
        let mut d = RecipientDelivery::new("em-1", &recipient, &contact, 0, start);
        assert_eq!(d.resend_window_start(start), start);

        d.last_attempt_at = Some(start + time::Duration::seconds(120));
        assert_eq!(d.resend_window_start(start), start + time::Duration::seconds(120));

        d.last_resend_at = Some(start + time::Duration::seconds(150));
        assert_eq!(d.resend_window_start(start), start + time::Duration::seconds(150));
    }

    #[test]
    fn millis_between_clamps_negative() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(millis_between(now, now - time::Duration::seconds(5)), 0);
        assert_eq!(millis_between(now, now + time::Duration::seconds(5)), 5_000);
    }
}
