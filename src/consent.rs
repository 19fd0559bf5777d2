//! Consent store: per-recipient opt-in state, checked before every send.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{ConsentError, DatabaseError};
use crate::store::Database;
use crate::token::TokenCodec;

/// Opt-in bookkeeping on top of the [`Database`].
#[derive(Clone)]
pub struct ConsentStore {
    store: Arc<dyn Database>,
    codec: TokenCodec,
}

impl ConsentStore {
    pub fn new(store: Arc<dyn Database>, codec: TokenCodec) -> Self {
        Self { store, codec }
    }

    /// Create the recipient as opted in unless it already exists.
    /// Never touches the consent of an existing recipient.
    pub async fn ensure_recipient_exists(&self, email: &str) -> Result<(), DatabaseError> {
        self.store.ensure_recipient(email).await
    }

    /// Current consent. A recipient we have never seen is not opted in.
    pub async fn is_opted_in(&self, email: &str) -> Result<bool, DatabaseError> {
        Ok(self
            .store
            .get_recipient(email)
            .await?
            .is_some_and(|r| r.opted_in))
    }

    /// Withdraw consent for the recipient bound in `token`.
    ///
    /// Only the call that actually flips consent appends an unsubscribe
    /// event; repeated calls with the same token change nothing.
    pub async fn unsubscribe(&self, token: &str) -> Result<(), ConsentError> {
        let (email, email_id) = self.codec.decode(token)?;

        if !self.store.opt_out(&email).await? {
            debug!(recipient = %email, email_id, "Unsubscribe was a no-op");
            return Ok(());
        }

        self.store.insert_unsubscribe_event(&email, email_id).await?;
        info!(recipient = %email, email_id, "Recipient unsubscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn setup() -> (ConsentStore, Arc<dyn Database>, TokenCodec) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let codec = TokenCodec::new(&[1u8; 32]);
        (ConsentStore::new(Arc::clone(&db), codec.clone()), db, codec)
    }

    #[tokio::test]
    async fn unknown_recipient_is_not_opted_in() {
        let (consent, _, _) = setup().await;
        assert!(!consent.is_opted_in("stranger@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn new_recipient_is_opted_in() {
        let (consent, _, _) = setup().await;
        consent.ensure_recipient_exists("a@example.com").await.unwrap();
        assert!(consent.is_opted_in("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn unsubscribe_flips_consent_and_logs_once() {
        let (consent, db, codec) = setup().await;
        consent.ensure_recipient_exists("a@example.com").await.unwrap();
        let token = codec.encode("a@example.com", 12).unwrap();

        consent.unsubscribe(&token).await.unwrap();
        assert!(!consent.is_opted_in("a@example.com").await.unwrap());
        let events = db.list_unsubscribe_events("a@example.com").await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].email_id, 12);

        // Second call is a no-op for both consent and the audit log.
        consent.unsubscribe(&token).await.unwrap();
        assert!(!consent.is_opted_in("a@example.com").await.unwrap());
        assert_eq!(db.list_unsubscribe_events("a@example.com").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_after_unsubscribe_keeps_opt_out() {
        let (consent, _, codec) = setup().await;
        consent.ensure_recipient_exists("a@example.com").await.unwrap();
        consent
            .unsubscribe(&codec.encode("a@example.com", 1).unwrap())
            .await
            .unwrap();
        consent.ensure_recipient_exists("a@example.com").await.unwrap();
        assert!(!consent.is_opted_in("a@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn tampered_token_is_rejected_without_side_effects() {
        let (consent, db, _) = setup().await;
        consent.ensure_recipient_exists("a@example.com").await.unwrap();
        let forged = TokenCodec::new(&[9u8; 32]).encode("a@example.com", 1).unwrap();

        let err = consent.unsubscribe(&forged).await.unwrap_err();
        assert!(matches!(err, ConsentError::InvalidToken(_)));
        assert!(consent.is_opted_in("a@example.com").await.unwrap());
        assert!(db.list_unsubscribe_events("a@example.com").await.unwrap().is_empty());
    }
}
