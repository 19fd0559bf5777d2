//! Mailgun HTTP API transport.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, info};

use super::{OutgoingMessage, Transport};
use crate::config::MailgunConfig;
use crate::error::TransportError;

const PROVIDER: &str = "mailgun";

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// Sends through `POST {base}/v3/{domain}/messages`.
pub struct MailgunTransport {
    client: reqwest::Client,
    domain: String,
    api_key: SecretString,
    base_url: String,
}

impl std::fmt::Debug for MailgunTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailgunTransport")
            .field("domain", &self.domain)
            .field("api_key", &"[redacted]")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl MailgunTransport {
    pub fn new(client: reqwest::Client, config: &MailgunConfig) -> Self {
        Self {
            client,
            domain: config.domain.clone(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Point at a different API host (EU region, tests).
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v3/{}/messages", self.base_url, self.domain)
    }

    fn request_error(e: impl std::fmt::Display) -> TransportError {
        TransportError::Request {
            provider: PROVIDER.into(),
            reason: e.to_string(),
        }
    }

    async fn build_form(message: &mut OutgoingMessage) -> Result<Form, TransportError> {
        let mut form = Form::new()
            .text("from", message.sender.clone())
            .text("to", message.recipient.clone())
            .text("subject", message.subject.clone())
            .text("text", message.text.clone())
            .text("html", message.html.clone())
            .text("o:tracking-opens", yes_no(message.track_opens))
            .text("o:tracking-clicks", yes_no(message.track_clicks));

        for asset in std::mem::take(&mut message.inline) {
            let name = asset.name().to_string();
            let content_type = asset.content_type();
            let part = Part::stream(asset.into_body().await?)
                .file_name(name)
                .mime_str(content_type)
                .map_err(|e| TransportError::InvalidMessage(e.to_string()))?;
            form = form.part("inline", part);
        }
        Ok(form)
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

#[async_trait]
impl Transport for MailgunTransport {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, mut message: OutgoingMessage) -> Result<String, TransportError> {
        let inline = message.inline.len();
        let form = Self::build_form(&mut message).await?;
        debug!(
            recipient = %message.recipient,
            inline,
            "Posting message to Mailgun"
        );

        let resp = self
            .client
            .post(self.messages_url())
            .basic_auth("api", Some(self.api_key.expose_secret()))
            .multipart(form)
            .send()
            .await
            .map_err(Self::request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                provider: PROVIDER.into(),
                status: status.as_u16(),
                body,
            });
        }

        let parsed: SendResponse = resp.json().await.map_err(Self::request_error)?;
        info!(recipient = %message.recipient, delivery_id = %parsed.id, "Mailgun accepted message");
        Ok(parsed.id)
    }
}
