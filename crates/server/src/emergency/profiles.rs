//! Per-type default configuration and severity-derived send priority.

use crate::emergency::types::{Channel, EmergencyConfig, EmergencyType, Severity};

/// Priority of ordinary (non-emergency) outbound traffic.
pub const NORMAL_PRIORITY: u32 = 100;

/// Type whose configuration is used when no type declares a severity.
pub const FALLBACK_EMERGENCY_TYPE: EmergencyType = EmergencyType::SafetyIncident;

/// Severity an emergency type carries unless the admin overrides it.
pub fn default_severity(emergency_type: EmergencyType) -> Severity {
    match emergency_type {
        EmergencyType::SafetyIncident => Severity::Critical,
        EmergencyType::SchoolClosure => Severity::High,
        EmergencyType::WeatherDisruption => Severity::Elevated,
        EmergencyType::InfrastructureFailure => Severity::Elevated,
    }
}

/// Default retry/escalation configuration of an emergency type.
pub fn default_config(emergency_type: EmergencyType) -> EmergencyConfig {
    match emergency_type {
        EmergencyType::SafetyIncident => EmergencyConfig {
            max_retry_attempts: 5,
            retry_interval_ms: 30_000,
            require_acknowledgment: true,
            escalate_after_ms: 180_000,
            allowed_channels: vec![Channel::Sms, Channel::WhatsApp, Channel::Email],
        },
        EmergencyType::SchoolClosure => EmergencyConfig {
            max_retry_attempts: 3,
            retry_interval_ms: 60_000,
            require_acknowledgment: true,
            escalate_after_ms: 600_000,
            allowed_channels: vec![Channel::Sms, Channel::Email, Channel::WhatsApp],
        },
        EmergencyType::WeatherDisruption => EmergencyConfig {
            max_retry_attempts: 3,
            retry_interval_ms: 120_000,
            require_acknowledgment: false,
            escalate_after_ms: 900_000,
            allowed_channels: vec![Channel::Sms, Channel::Email],
        },
        EmergencyType::InfrastructureFailure => EmergencyConfig {
            max_retry_attempts: 3,
            retry_interval_ms: 120_000,
            require_acknowledgment: true,
            escalate_after_ms: 900_000,
            allowed_channels: vec![Channel::Email, Channel::Sms],
        },
    }
}

/// Result of resolving a configuration from a severity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SeverityConfig {
    pub emergency_type: EmergencyType,
    pub config: EmergencyConfig,
    /// True when no type declared the severity and the fallback type was used.
    pub fell_back: bool,
}

/// Find the configuration of the first type (declaration order) whose default
/// severity matches. Severities no type declares resolve to
/// [`FALLBACK_EMERGENCY_TYPE`], which may not match the emergency's own type.
pub fn config_for_severity(severity: Severity) -> SeverityConfig {
    match EmergencyType::ALL
        .into_iter()
        .find(|t| default_severity(*t) == severity)
    {
        Some(emergency_type) => SeverityConfig {
            emergency_type,
            config: default_config(emergency_type),
            fell_back: false,
        },
        None => {
            tracing::warn!(
                name = "emergency.profiles.severity_fallback",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "No emergency type declares this severity, using fallback type config",
                severity = severity.as_str(),
                fallback_type = FALLBACK_EMERGENCY_TYPE.as_str(),
            );
            SeverityConfig {
                emergency_type: FALLBACK_EMERGENCY_TYPE,
                config: default_config(FALLBACK_EMERGENCY_TYPE),
                fell_back: true,
            }
        }
    }
}

/// Queue priority for a severity. Always above [`NORMAL_PRIORITY`].
pub fn priority_for_severity(severity: Severity) -> u32 {
    match severity {
        Severity::Critical => 1000,
        Severity::High => 800,
        Severity::Elevated => 600,
        Severity::Advisory => 400,
    }
}
