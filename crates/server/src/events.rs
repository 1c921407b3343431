//! In-process notices about emergency progress.

use crate::emergency::types::{Channel, DeliveryState, EmergencyState};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmergencyNotice {
    StateChanged {
        emergency_id: String,
        from: EmergencyState,
        to: EmergencyState,
    },
    DeliveryUpdated {
        emergency_id: String,
        recipient_id: String,
        channel: Channel,
        state: DeliveryState,
    },
    /// An escalation level asked for administrators to be told.
    AdministratorNotified {
        emergency_id: String,
        school_id: String,
        level: u32,
        district: bool,
        outstanding: Vec<String>,
    },
    /// Every escalation level has run and recipients are still silent.
    EscalationExhausted {
        emergency_id: String,
        initiated_by: String,
        outstanding: Vec<String>,
    },
}

impl EmergencyNotice {
    pub fn emergency_id(&self) -> &str {
        match self {
            EmergencyNotice::StateChanged { emergency_id, .. }
            | EmergencyNotice::DeliveryUpdated { emergency_id, .. }
            | EmergencyNotice::AdministratorNotified { emergency_id, .. }
            | EmergencyNotice::EscalationExhausted { emergency_id, .. } => emergency_id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<EmergencyNotice>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmergencyNotice> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers. Having none is fine.
    pub fn publish(&self, notice: EmergencyNotice) {
        let receivers = self.sender.send(notice).unwrap_or(0);
        tracing::trace!(
            name = "emergency.events.published",
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            message = "Published emergency notice",
            receivers = receivers,
        );
    }
}
