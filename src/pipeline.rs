//! Send pipeline: template + recipient → delivered message.
//!
//! Order of operations per send:
//! 1. ensure the recipient row exists
//! 2. consent gate (a denied send is a normal outcome, not an error)
//! 3. persist a pending email row
//! 4. mint the unsubscribe token
//! 5. render, preparing lazy inline assets
//! 6. dispatch under a deadline owned by a detached task
//! 7. record the delivery id (failure here is logged only)

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::assets::LazyAsset;
use crate::campaign::Template;
use crate::consent::ConsentStore;
use crate::error::{RenderError, SendError, TransportError};
use crate::render::render;
use crate::store::Database;
use crate::token::TokenCodec;
use crate::transport::{OutgoingMessage, Transport};

/// Result of one [`SendPipeline::send`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SendOutcome {
    /// Id of the email row, `None` when consent suppressed the send.
    #[serde(rename = "id")]
    pub email_id: Option<i64>,
    pub sent: bool,
}

impl SendOutcome {
    fn suppressed() -> Self {
        Self {
            email_id: None,
            sent: false,
        }
    }
}

/// Collaborators the pipeline is built from.
pub struct SendPipelineDeps {
    pub store: Arc<dyn Database>,
    pub consent: ConsentStore,
    pub codec: TokenCodec,
    pub transport: Arc<dyn Transport>,
    /// Client used for inline asset fetches.
    pub http: reqwest::Client,
    /// Base URL relative image paths are resolved against.
    pub asset_base_url: String,
    pub send_timeout: Duration,
}

#[derive(Clone)]
pub struct SendPipeline {
    store: Arc<dyn Database>,
    consent: ConsentStore,
    codec: TokenCodec,
    transport: Arc<dyn Transport>,
    http: reqwest::Client,
    asset_base_url: String,
    send_timeout: Duration,
}

impl SendPipeline {
    pub fn new(deps: SendPipelineDeps) -> Self {
        Self {
            store: deps.store,
            consent: deps.consent,
            codec: deps.codec,
            transport: deps.transport,
            http: deps.http,
            asset_base_url: deps.asset_base_url,
            send_timeout: deps.send_timeout,
        }
    }

    /// Send `template` to `recipient`.
    ///
    /// Once the provider call has started it runs to completion (or to the
    /// send timeout) together with the delivery bookkeeping, even if the
    /// future returned here is dropped.
    pub async fn send(
        &self,
        template: &Template,
        recipient: &str,
    ) -> Result<SendOutcome, SendError> {
        self.consent.ensure_recipient_exists(recipient).await?;
        if !self.consent.is_opted_in(recipient).await? {
            info!(recipient, template = %template.id, "Recipient not opted in, skipping send");
            return Ok(SendOutcome::suppressed());
        }

        let email_id = self.store.insert_email(recipient, &template.id).await?;
        let token = self.codec.encode(recipient, email_id)?;
        let body = render(template, &token)?;

        let mut message = OutgoingMessage::new(&template.sender, recipient, &template.subject);
        message.text = body.text;
        message.html = body.html;
        for name in &body.images {
            let image = template
                .image(name)
                .ok_or_else(|| RenderError::UnknownImage {
                    template: template.id.clone(),
                    name: name.clone(),
                })?;
            message
                .inline
                .push(LazyAsset::for_image(self.http.clone(), &self.asset_base_url, image));
        }

        debug!(recipient, email_id, template = %template.id, "Dispatching email");
        let delivery_id = self.dispatch(email_id, message).await?;
        info!(recipient, email_id, delivery_id = %delivery_id, "Email sent");

        Ok(SendOutcome {
            email_id: Some(email_id),
            sent: true,
        })
    }

    async fn dispatch(
        &self,
        email_id: i64,
        message: OutgoingMessage,
    ) -> Result<String, TransportError> {
        let transport = Arc::clone(&self.transport);
        let store = Arc::clone(&self.store);
        let timeout = self.send_timeout;

        // Detached: dropping the JoinHandle does not cancel the task.
        let handle = tokio::spawn(async move {
            let provider = transport.name().to_string();
            let delivery_id = match tokio::time::timeout(timeout, transport.send(message)).await {
                Ok(result) => result?,
                Err(_) => return Err(TransportError::Timeout { provider, timeout }),
            };

            if let Err(e) = store.mark_email_sent(email_id, &delivery_id).await {
                warn!(
                    email_id,
                    delivery_id = %delivery_id,
                    error = %e,
                    "Email delivered but recording the delivery failed"
                );
            }
            Ok(delivery_id)
        });

        handle
            .await
            .map_err(|e| TransportError::Aborted(e.to_string()))?
    }
}
