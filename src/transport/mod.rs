//! Outbound mail transports.
//!
//! A [`Transport`] takes a fully composed [`OutgoingMessage`] and returns the
//! provider's delivery id. Inline images travel as [`LazyAsset`]s so nothing
//! is fetched until the transport actually serialises the message.

pub mod mailgun;
pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::assets::LazyAsset;
use crate::config::TransportConfig;
use crate::error::TransportError;

pub use mailgun::MailgunTransport;
pub use smtp::SmtpMailTransport;

/// A message ready for dispatch.
#[derive(Debug)]
pub struct OutgoingMessage {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    /// Attachments the HTML refers to as `cid:<name>`.
    pub inline: Vec<LazyAsset>,
    pub track_opens: bool,
    pub track_clicks: bool,
}

impl OutgoingMessage {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            text: String::new(),
            html: String::new(),
            inline: Vec::new(),
            track_opens: true,
            track_clicks: false,
        }
    }
}

/// A mail delivery provider.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &str;

    /// Deliver `message`, returning the provider's delivery id.
    async fn send(&self, message: OutgoingMessage) -> Result<String, TransportError>;
}

/// Build the configured transport.
pub fn create_transport(
    config: &TransportConfig,
    client: reqwest::Client,
) -> Result<Arc<dyn Transport>, TransportError> {
    match config {
        TransportConfig::Mailgun(mg) => Ok(Arc::new(MailgunTransport::new(client, mg))),
        TransportConfig::Smtp(smtp) => Ok(Arc::new(SmtpMailTransport::new(smtp)?)),
    }
}
