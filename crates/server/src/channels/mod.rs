//! Outbound channel adapters.
//!
//! The transport wire protocols live behind [`ChannelAdapter`]; the core only
//! sees a [`DeliveryResult`] per send.

pub mod email;

use crate::emergency::types::Channel;
use crate::error::ChannelError;
use crate::render::RenderedMessage;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

pub use email::EmailChannel;

/// Who a message goes to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryTarget {
    pub emergency_id: String,
    pub recipient_id: String,
    pub guardian_id: String,
    pub address: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Accepted by the transport, no receipt yet.
    Sent,
    Delivered,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryResult {
    pub status: DeliveryStatus,
    pub error_message: Option<String>,
}

impl DeliveryResult {
    pub fn sent() -> Self {
        Self {
            status: DeliveryStatus::Sent,
            error_message: None,
        }
    }

    pub fn delivered() -> Self {
        Self {
            status: DeliveryStatus::Delivered,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: DeliveryStatus::Failed,
            error_message: Some(message.into()),
        }
    }
}

impl From<ChannelError> for DeliveryResult {
    fn from(e: ChannelError) -> Self {
        DeliveryResult::failed(e.to_string())
    }
}

pub trait ChannelAdapter: Send + Sync {
    fn send<'a>(
        &'a self,
        target: &'a DeliveryTarget,
        channel: Channel,
        content: &'a RenderedMessage,
    ) -> BoxFuture<'a, DeliveryResult>;
}

/// Routes each send to the adapter registered for its channel.
#[derive(Clone, Default)]
pub struct ChannelRouter {
    routes: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, channel: Channel, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.routes.insert(channel, adapter);
        self
    }

    pub fn is_routed(&self, channel: Channel) -> bool {
        self.routes.contains_key(&channel)
    }
}

impl ChannelAdapter for ChannelRouter {
    fn send<'a>(
        &'a self,
        target: &'a DeliveryTarget,
        channel: Channel,
        content: &'a RenderedMessage,
    ) -> BoxFuture<'a, DeliveryResult> {
        match self.routes.get(&channel) {
            Some(adapter) => adapter.send(target, channel, content),
            None => Box::pin(async move { ChannelError::Unrouted(channel).into() }),
        }
    }
}

/// Writes the message to the log and reports it delivered. Stands in for
/// transports that are not configured in a deployment.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingChannel;

impl ChannelAdapter for LoggingChannel {
    fn send<'a>(
        &'a self,
        target: &'a DeliveryTarget,
        channel: Channel,
        content: &'a RenderedMessage,
    ) -> BoxFuture<'a, DeliveryResult> {
        Box::pin(async move {
            tracing::info!(
                name = "channels.logging.send",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                message = "Emergency message (logging channel)",
                emergency_id = %target.emergency_id,
                recipient_id = %target.recipient_id,
                channel = channel.as_str(),
                address = %target.address,
                subject = ?content.subject,
                body = %content.body,
            );
            DeliveryResult::delivered()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DeliveryTarget {
        DeliveryTarget {
            emergency_id: "em-1".into(),
            recipient_id: "r1".into(),
            guardian_id: "g1".into(),
            address: "+15550100".into(),
        }
    }

    fn content() -> RenderedMessage {
        RenderedMessage {
            subject: None,
            body: "hello".into(),
        }
    }

    #[tokio::test]
    async fn unrouted_channel_fails() {
        let router = ChannelRouter::new().with_route(Channel::Sms, Arc::new(LoggingChannel));
        let t = target();
        let c = content();
        let result = router.send(&t, Channel::WhatsApp, &c).await;
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert!(result.error_message.unwrap().contains("whatsapp"));

        let result = router.send(&t, Channel::Sms, &c).await;
        assert_eq!(result.status, DeliveryStatus::Delivered);
    }
}
