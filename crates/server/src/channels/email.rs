//! Email delivery over SMTP.

use crate::channels::{ChannelAdapter, DeliveryResult, DeliveryTarget};
use crate::config::SmtpConfig;
use crate::emergency::types::Channel;
use crate::error::ChannelError;
use crate::render::RenderedMessage;
use futures::future::BoxFuture;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};

const DEFAULT_SUBJECT: &str = "Emergency notification";

pub struct EmailChannel {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailChannel {
    pub fn new(mailer: AsyncSmtpTransport<Tokio1Executor>, from: Mailbox) -> Self {
        Self { mailer, from }
    }

    pub fn from_config(smtp: &SmtpConfig) -> Result<Self, ChannelError> {
        let creds = Credentials::new(smtp.username.clone(), smtp.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.server)
            .map_err(|e| ChannelError::Transport(e.to_string()))?
            .port(smtp.port)
            .credentials(creds)
            .build();
        let from = smtp
            .from
            .parse::<Mailbox>()
            .map_err(|e| ChannelError::InvalidAddress {
                address: smtp.from.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self::new(mailer, from))
    }

    fn build_message(
        &self,
        target: &DeliveryTarget,
        content: &RenderedMessage,
    ) -> Result<lettre::Message, ChannelError> {
        let to = target
            .address
            .parse::<Mailbox>()
            .map_err(|e| ChannelError::InvalidAddress {
                address: target.address.clone(),
                reason: e.to_string(),
            })?;
        lettre::Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(content.subject.as_deref().unwrap_or(DEFAULT_SUBJECT))
            .header(ContentType::TEXT_PLAIN)
            .body(content.body.clone())
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }
}

impl ChannelAdapter for EmailChannel {
    fn send<'a>(
        &'a self,
        target: &'a DeliveryTarget,
        _channel: Channel,
        content: &'a RenderedMessage,
    ) -> BoxFuture<'a, DeliveryResult> {
        Box::pin(async move {
            let message = match self.build_message(target, content) {
                Ok(m) => m,
                Err(e) => return e.into(),
            };
            match self.mailer.send(message).await {
                // SMTP acceptance is not a delivery receipt.
                Ok(_) => DeliveryResult::sent(),
                Err(e) => {
                    tracing::warn!(
                        name = "channels.email.send_failed",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        message = "Failed to send emergency email",
                        emergency_id = %target.emergency_id,
                        recipient_id = %target.recipient_id,
                        error = %e,
                    );
                    ChannelError::Transport(e.to_string()).into()
                }
            }
        })
    }
}
