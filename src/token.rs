//! Unsubscribe token codec.
//!
//! A token is the URL-safe unpadded base64 encoding of `claims || tag`, where
//! `claims` is a small JSON object binding a recipient to one email id and
//! `tag` is HMAC-SHA-256 over a context label and the claims. Verification
//! uses `Mac::verify_slice`, which compares in constant time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::TokenConfig;
use crate::error::{ConfigError, TokenError};

type HmacSha256 = Hmac<Sha256>;

/// Length of the HMAC-SHA-256 tag appended to the claims.
const TAG_LEN: usize = 32;

/// Tolerated lead of a token's issue time over the local clock when a max
/// age is enforced.
const CLOCK_SKEW_LEEWAY: Duration = Duration::from_secs(60);

/// Domain separation label mixed into every tag.
const CONTEXT: &[u8] = b"dripmail/unsubscribe/v1\0";

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    #[serde(rename = "r")]
    recipient: String,
    #[serde(rename = "e")]
    email_id: i64,
    #[serde(rename = "t")]
    issued_at: i64,
}

/// Encodes and verifies unsubscribe tokens with a symmetric key.
#[derive(Clone)]
pub struct TokenCodec {
    key: Arc<[u8]>,
    max_age: Option<Duration>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("key", &"[redacted]")
            .field("max_age", &self.max_age)
            .finish()
    }
}

impl TokenCodec {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: Arc::from(key),
            max_age: None,
        }
    }

    /// Build a codec from the validated base64url key in the config.
    pub fn from_config(config: &TokenConfig) -> Result<Self, ConfigError> {
        let key = URL_SAFE_NO_PAD
            .decode(config.key.expose_secret())
            .map_err(|e| ConfigError::InvalidValue {
                key: "DRIPMAIL_TOKEN_KEY".to_string(),
                message: e.to_string(),
            })?;
        let codec = Self::new(&key);
        Ok(match config.max_age {
            Some(age) => codec.with_max_age(age),
            None => codec,
        })
    }

    /// Reject tokens issued longer than `max_age` ago.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|e| TokenError::Encode(format!("bad key: {e}")))?;
        mac.update(CONTEXT);
        Ok(mac)
    }

    /// Mint a token binding `recipient` to `email_id`.
    pub fn encode(&self, recipient: &str, email_id: i64) -> Result<String, TokenError> {
        self.seal(&Claims {
            recipient: recipient.to_string(),
            email_id,
            issued_at: Utc::now().timestamp(),
        })
    }

    fn seal(&self, claims: &Claims) -> Result<String, TokenError> {
        let mut raw =
            serde_json::to_vec(claims).map_err(|e| TokenError::Encode(e.to_string()))?;

        let mut mac = self.mac()?;
        mac.update(&raw);
        raw.extend_from_slice(&mac.finalize().into_bytes());

        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Verify a token and return the `(recipient, email_id)` it binds.
    ///
    /// Every failure yields [`TokenError::Invalid`] and no data.
    pub fn decode(&self, token: &str) -> Result<(String, i64), TokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::Invalid)?;
        if raw.len() <= TAG_LEN {
            return Err(TokenError::Invalid);
        }
        let (payload, tag) = raw.split_at(raw.len() - TAG_LEN);

        let mut mac = self.mac().map_err(|_| TokenError::Invalid)?;
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| TokenError::Invalid)?;

        let claims: Claims = serde_json::from_slice(payload).map_err(|_| TokenError::Invalid)?;

        if let Some(max_age) = self.max_age {
            let age = Utc::now().timestamp().saturating_sub(claims.issued_at);
            let too_new = age < 0 && age.unsigned_abs() > CLOCK_SKEW_LEEWAY.as_secs();
            let too_old = age > 0 && age.unsigned_abs() > max_age.as_secs();
            if too_new || too_old {
                return Err(TokenError::Invalid);
            }
        }

        Ok((claims.recipient, claims.email_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new(&[42u8; 32])
    }

    /// A valid token whose issue time is `offset` seconds from now.
    fn issued_at_offset(c: &TokenCodec, offset: i64) -> String {
        c.seal(&Claims {
            recipient: "dave@example.com".into(),
            email_id: 3,
            issued_at: Utc::now().timestamp() + offset,
        })
        .unwrap()
    }

    #[test]
    fn roundtrip() {
        let c = codec();
        let token = c.encode("alice@example.com", 17).unwrap();
        assert_eq!(c.decode(&token).unwrap(), ("alice@example.com".to_string(), 17));
    }

    #[test]
    fn token_is_url_safe() {
        let token = codec().encode("a+b/c@example.com", i64::MAX).unwrap();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn every_single_bit_flip_is_rejected() {
        let c = codec();
        let token = c.encode("bob@example.com", 5).unwrap();
        let raw = URL_SAFE_NO_PAD.decode(&token).unwrap();

        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut tampered = raw.clone();
                tampered[byte] ^= 1 << bit;
                let forged = URL_SAFE_NO_PAD.encode(&tampered);
                assert!(
                    matches!(c.decode(&forged), Err(TokenError::Invalid)),
                    "flip at byte {byte} bit {bit} was accepted"
                );
            }
        }
    }

    #[test]
    fn every_character_substitution_is_rejected() {
        let c = codec();
        let token = c.encode("bob@example.com", 5).unwrap();
        for (i, ch) in token.char_indices() {
            let replacement = if ch == 'A' { 'B' } else { 'A' };
            let mut forged = token.clone();
            forged.replace_range(i..i + 1, &replacement.to_string());
            assert!(c.decode(&forged).is_err(), "substitution at {i} was accepted");
        }
    }

    #[test]
    fn wrong_key_is_rejected() {
        let token = codec().encode("carol@example.com", 1).unwrap();
        let other = TokenCodec::new(&[7u8; 32]);
        assert!(matches!(other.decode(&token), Err(TokenError::Invalid)));
    }

    #[test]
    fn garbage_is_rejected() {
        let c = codec();
        for input in ["", "not a token", "AAAA", "!!!!"] {
            assert!(matches!(c.decode(input), Err(TokenError::Invalid)));
        }
    }

    #[test]
    fn expired_token_is_rejected() {
        let c = codec().with_max_age(Duration::from_secs(60));
        let stale = issued_at_offset(&c, -3600);

        assert!(matches!(c.decode(&stale), Err(TokenError::Invalid)));
        // The same token is fine without an age limit.
        assert!(codec().decode(&stale).is_ok());
    }

    #[test]
    fn small_clock_skew_is_tolerated() {
        let c = codec().with_max_age(Duration::from_secs(3600));
        let ahead = issued_at_offset(&c, 5);
        assert_eq!(c.decode(&ahead).unwrap(), ("dave@example.com".to_string(), 3));

        let far_ahead = issued_at_offset(&c, 3600);
        assert!(matches!(c.decode(&far_ahead), Err(TokenError::Invalid)));
        assert!(codec().decode(&far_ahead).is_ok());
    }

    #[test]
    fn fresh_token_within_max_age() {
        let c = codec().with_max_age(Duration::from_secs(60));
        let token = c.encode("erin@example.com", 8).unwrap();
        assert_eq!(c.decode(&token).unwrap().1, 8);
    }

    #[test]
    fn debug_redacts_key() {
        let out = format!("{:?}", codec());
        assert!(out.contains("[redacted]"));
        assert!(!out.contains("42"));
    }
}
