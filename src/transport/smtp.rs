//! SMTP transport via lettre.
//!
//! The HTML part and its inline images form a `multipart/related` body
//! nested in `multipart/alternative` next to the plain-text part. The
//! generated `Message-ID` doubles as the delivery id.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as _};
use secrecy::ExposeSecret;
use tracing::info;

use super::{OutgoingMessage, Transport};
use crate::config::SmtpConfig;
use crate::error::TransportError;

const PROVIDER: &str = "smtp";

/// An inline image after its bytes have been read.
struct InlineImage {
    name: String,
    content_type: String,
    bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct SmtpMailTransport {
    mailer: SmtpTransport,
    host: String,
}

impl std::fmt::Debug for SmtpMailTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailTransport")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, TransportError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let mailer = SmtpTransport::relay(&config.host)
            .map_err(|e| TransportError::Request {
                provider: PROVIDER.into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        Ok(Self {
            mailer,
            host: config.host.clone(),
        })
    }
}

fn invalid(what: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::InvalidMessage(format!("{what}: {e}"))
}

/// `<uuid@sender-domain>`
fn message_id(sender: &str) -> String {
    let domain = sender
        .rsplit_once('@')
        .map(|(_, d)| d.trim_end_matches('>'))
        .filter(|d| !d.is_empty())
        .unwrap_or("dripmail.local");
    format!("<{}@{}>", uuid::Uuid::new_v4(), domain)
}

fn build_message(
    message: &OutgoingMessage,
    images: Vec<InlineImage>,
    message_id: &str,
) -> Result<Message, TransportError> {
    let mut related = MultiPart::related().singlepart(SinglePart::html(message.html.clone()));
    for image in images {
        let content_type =
            ContentType::parse(&image.content_type).map_err(|e| invalid("content type", e))?;
        related = related.singlepart(
            Attachment::new_inline(image.name).body(image.bytes, content_type),
        );
    }

    let body = MultiPart::alternative()
        .singlepart(SinglePart::plain(message.text.clone()))
        .multipart(related);

    Message::builder()
        .from(message.sender.parse().map_err(|e| invalid("from address", e))?)
        .to(message.recipient.parse().map_err(|e| invalid("to address", e))?)
        .subject(message.subject.clone())
        .message_id(Some(message_id.to_string()))
        .multipart(body)
        .map_err(|e| invalid("message", e))
}

#[async_trait]
impl Transport for SmtpMailTransport {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, mut message: OutgoingMessage) -> Result<String, TransportError> {
        // lettre attachments take an owned body.
        let mut images = Vec::with_capacity(message.inline.len());
        for asset in &mut message.inline {
            images.push(InlineImage {
                name: asset.name().to_string(),
                content_type: asset.content_type().to_string(),
                bytes: asset.read_to_end().await?,
            });
            asset.release();
        }

        let id = message_id(&message.sender);
        let email = build_message(&message, images, &id)?;

        let mailer = self.mailer.clone();
        tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| TransportError::Aborted(e.to_string()))?
            .map_err(|e| TransportError::Request {
                provider: PROVIDER.into(),
                reason: e.to_string(),
            })?;

        info!(recipient = %message.recipient, delivery_id = %id, "SMTP relay accepted message");
        Ok(id)
    }
}
