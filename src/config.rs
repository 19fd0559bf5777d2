//! Configuration types.
//!
//! Everything is read once at start-up into a [`Config`] and handed to the
//! components that need it. Secrets stay wrapped in [`SecretString`].

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use secrecy::SecretString;

use crate::error::ConfigError;

/// Minimum length of the unsubscribe token signing key, in bytes.
pub const MIN_TOKEN_KEY_LEN: usize = 32;

const DEFAULT_MAILGUN_BASE_URL: &str = "https://api.mailgun.net";

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// CMS base URL. GraphQL lives at `/graphql`, assets are relative to it.
    pub cms_url: String,
    pub token: TokenConfig,
    /// Shared secret expected in `Authorization: Bearer` on the HTTP API.
    pub auth_token: SecretString,
    pub transport: TransportConfig,
    pub send: SendConfig,
    pub series: SeriesConfig,
    pub http_port: u16,
}

/// Unsubscribe token settings.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC key, unpadded URL-safe base64.
    pub key: SecretString,
    /// Tokens older than this are rejected. `None` means they never expire.
    pub max_age: Option<Duration>,
}

/// Which provider delivers outbound mail.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Mailgun(MailgunConfig),
    Smtp(SmtpConfig),
}

#[derive(Debug, Clone)]
pub struct MailgunConfig {
    pub domain: String,
    pub api_key: SecretString,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
}

/// Send pipeline settings.
#[derive(Debug, Clone)]
pub struct SendConfig {
    /// Deadline for a single provider call, independent of the caller.
    pub send_timeout: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(15),
        }
    }
}

/// Series engine settings.
#[derive(Debug, Clone)]
pub struct SeriesConfig {
    /// Maximum due enrollments handled per trigger cycle.
    pub batch_size: usize,
    /// Deadline for collecting a trigger cycle's results.
    pub batch_timeout: Duration,
    /// Interval of the in-process trigger ticker. Zero disables it.
    pub trigger_interval: Duration,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout: Duration::from_secs(60),
            trigger_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required =
            |key: &str| get(key).ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()));

        let db_path = get("DRIPMAIL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/dripmail.db"));

        let cms_url = required("DRIPMAIL_CMS_URL")?
            .trim_end_matches('/')
            .to_string();

        let key = decode_token_key(&required("DRIPMAIL_TOKEN_KEY")?)?;
        let max_age = parse_opt::<u64>(&get, "DRIPMAIL_TOKEN_MAX_AGE_SECS")?.map(Duration::from_secs);

        let auth_token = SecretString::from(required("DRIPMAIL_AUTH_TOKEN")?);

        let transport = if let Some(domain) = get("DRIPMAIL_MAILGUN_DOMAIN") {
            TransportConfig::Mailgun(MailgunConfig {
                domain,
                api_key: SecretString::from(required("DRIPMAIL_MAILGUN_API_KEY")?),
                base_url: get("DRIPMAIL_MAILGUN_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_MAILGUN_BASE_URL.to_string())
                    .trim_end_matches('/')
                    .to_string(),
            })
        } else if let Some(host) = get("DRIPMAIL_SMTP_HOST") {
            TransportConfig::Smtp(SmtpConfig {
                host,
                port: parse_opt(&get, "DRIPMAIL_SMTP_PORT")?.unwrap_or(587),
                username: get("DRIPMAIL_SMTP_USERNAME").unwrap_or_default(),
                password: SecretString::from(get("DRIPMAIL_SMTP_PASSWORD").unwrap_or_default()),
            })
        } else {
            return Err(ConfigError::MissingRequired {
                key: "transport".to_string(),
                hint: "Set DRIPMAIL_MAILGUN_DOMAIN or DRIPMAIL_SMTP_HOST".to_string(),
            });
        };

        let send = SendConfig {
            send_timeout: parse_opt(&get, "DRIPMAIL_SEND_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(SendConfig::default().send_timeout),
        };

        let defaults = SeriesConfig::default();
        let batch_size: usize = parse_opt(&get, "DRIPMAIL_BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DRIPMAIL_BATCH_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        let series = SeriesConfig {
            batch_size,
            batch_timeout: parse_opt(&get, "DRIPMAIL_BATCH_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.batch_timeout),
            trigger_interval: parse_opt(&get, "DRIPMAIL_TRIGGER_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.trigger_interval),
        };

        let http_port = parse_opt(&get, "DRIPMAIL_HTTP_PORT")?.unwrap_or(8080);

        Ok(Self {
            db_path,
            cms_url,
            token: TokenConfig { key, max_age },
            auth_token,
            transport,
            send,
            series,
            http_port,
        })
    }
}

/// Validate the base64url signing key. The secret keeps the canonical
/// unpadded encoding; [`crate::token::TokenCodec`] decodes it.
fn decode_token_key(raw: &str) -> Result<SecretString, ConfigError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(raw.trim().trim_end_matches('='))
        .map_err(|e| ConfigError::InvalidValue {
            key: "DRIPMAIL_TOKEN_KEY".to_string(),
            message: format!("not unpadded URL-safe base64: {e}"),
        })?;
    if bytes.len() < MIN_TOKEN_KEY_LEN {
        return Err(ConfigError::InvalidValue {
            key: "DRIPMAIL_TOKEN_KEY".to_string(),
            message: format!(
                "key is {} bytes, need at least {MIN_TOKEN_KEY_LEN}",
                bytes.len()
            ),
        });
    }
    Ok(SecretString::from(URL_SAFE_NO_PAD.encode(bytes)))
}

fn parse_opt<T>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}
