//! Error types for dripmail.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Unsubscribe token errors.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Signature, encoding, payload or age check failed.
    #[error("Invalid token")]
    Invalid,

    #[error("Failed to encode token: {0}")]
    Encode(String),
}

/// Errors from the campaign definition source (the CMS).
#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error("Campaign query failed: {0}")]
    Request(String),

    #[error("Invalid response from campaign source: {0}")]
    InvalidResponse(String),

    #[error("Unknown campaign: {name}")]
    UnknownCampaign { name: String },
}

/// Template rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to render markdown: {0}")]
    Markdown(String),

    #[error("Image reference without a name (alt text) in template {template}")]
    UnnamedImage { template: String },

    #[error("Template {template} references unknown image '{name}'")]
    UnknownImage { template: String, name: String },
}

/// Transport provider errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Provider {provider} request failed: {reason}")]
    Request { provider: String, reason: String },

    #[error("Provider {provider} rejected message ({status}): {body}")]
    Rejected {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Failed to fetch inline asset {url}: {reason}")]
    Asset { url: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Dispatch task aborted: {0}")]
    Aborted(String),
}

/// Errors returned by the send pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors returned by the series engine.
#[derive(Debug, thiserror::Error)]
pub enum SeriesError {
    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("Campaign error: {0}")]
    Campaign(#[from] CampaignError),

    #[error("Campaign {name} has no steps")]
    EmptyCampaign { name: String },

    #[error("Unknown step {step} in campaign {series}")]
    UnknownStep { series: String, step: String },

    #[error("Step {step} in campaign {series} has an unschedulable delay of {delay_seconds}s")]
    InvalidDelay {
        series: String,
        step: String,
        delay_seconds: i64,
    },

    #[error("Trigger cycle aborted: {0}")]
    Aborted(String),
}

/// Errors returned by consent operations.
#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("Invalid unsubscribe token")]
    InvalidToken(#[from] TokenError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}
