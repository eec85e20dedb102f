use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine;
use serde::Deserialize;

use crate::collaborators::Collaborators;
use crate::error::ServiceError;
use crate::gmail::string_or_number;
use crate::sync_engine::{AdvanceOutcome, SyncEngine};

/// Pub/Sub push request body.
#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default, alias = "message_id")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushNotification {
    pub email_address: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub history_id: Option<String>,
}

impl PushEnvelope {
    /// Decode the base64 JSON payload Gmail publishes.
    pub fn notification(&self) -> Result<(String, String)> {
        let data = self
            .message
            .data
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .ok_or_else(|| anyhow!("push message has no data"))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(data.trim()))
            .context("push data is not base64")?;
        let payload: PushNotification =
            serde_json::from_slice(&bytes).context("push data is not a Gmail notification")?;

        let email = payload.email_address.trim().to_string();
        let cursor = payload
            .history_id
            .ok_or_else(|| anyhow!("notification for {} has no historyId", email))?;
        if email.is_empty() {
            return Err(anyhow!("notification has no emailAddress"));
        }
        Ok((email, cursor))
    }
}

/// Resolves push events to accounts and hands them to the sync engine.
pub struct NotificationIngestor {
    collab: Collaborators,
    engine: Arc<SyncEngine>,
}

impl NotificationIngestor {
    pub fn new(collab: Collaborators, engine: Arc<SyncEngine>) -> Self {
        Self { collab, engine }
    }

    /// Returns `None` when no active subscription matches the address.
    pub async fn on_push_notification(
        &self,
        account_email: &str,
        cursor: &str,
    ) -> Result<Option<AdvanceOutcome>, ServiceError> {
        tracing::info!("Push notification for {} (cursor {})", account_email, cursor);

        let account = match self
            .collab
            .db
            .find_active_integration_by_email(account_email)
            .map_err(ServiceError::storage)?
        {
            Some(account) => account,
            None => {
                tracing::info!("No active integration found for {}", account_email);
                return Ok(None);
            }
        };

        let outcome = self.engine.advance(&account.id, cursor).await?;
        tracing::info!(
            "Applied notification for {}: {} new item(s), {} delivered",
            account_email,
            outcome.item_ids.len(),
            outcome.delivered
        );
        Ok(Some(outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ReplyStateMachine;
    use crate::subscription::SubscriptionManager;
    use crate::test_support::{mail_item, Harness};

    fn envelope(payload: serde_json::Value) -> PushEnvelope {
        let data = base64::engine::general_purpose::STANDARD.encode(payload.to_string());
        serde_json::from_value(serde_json::json!({
            "message": {"data": data, "messageId": "1"},
            "subscription": "projects/p/subscriptions/s"
        }))
        .unwrap()
    }

    fn ingestor(harness: &Harness) -> NotificationIngestor {
        let subscriptions = Arc::new(SubscriptionManager::new(harness.collaborators()));
        let reply = Arc::new(ReplyStateMachine::new(harness.collaborators()));
        let engine = Arc::new(SyncEngine::new(harness.collaborators(), subscriptions, reply, 4));
        NotificationIngestor::new(harness.collaborators(), engine)
    }

    #[test]
    fn envelope_accepts_numeric_and_string_history_ids() {
        let numeric = envelope(serde_json::json!({"emailAddress": "a@example.com", "historyId": 105}));
        assert_eq!(
            numeric.notification().unwrap(),
            ("a@example.com".to_string(), "105".to_string())
        );
        let text = envelope(serde_json::json!({"emailAddress": "a@example.com", "historyId": "106"}));
        assert_eq!(text.notification().unwrap().1, "106");
    }

    #[test]
    fn envelope_without_cursor_is_rejected() {
        assert!(envelope(serde_json::json!({"emailAddress": "a@example.com"}))
            .notification()
            .is_err());
        let empty: PushEnvelope = serde_json::from_value(serde_json::json!({"message": {}})).unwrap();
        assert!(empty.notification().is_err());
    }

    #[tokio::test]
    async fn notification_from_100_to_105_delivers_two_items() {
        let harness = Harness::new();
        let account = harness.active_account("alice@example.com", 42, "100");
        harness.provider.add_item(mail_item("m1", "One", "a <a@example.com>"));
        harness.provider.add_item(mail_item("m2", "Two", "b <b@example.com>"));
        harness.provider.set_changes("100", &["m1", "m2"], None);

        let outcome = ingestor(&harness)
            .on_push_notification("alice@example.com", "105")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome.item_ids, vec!["m1", "m2"]);
        assert_eq!(harness.db.count_contexts(42).unwrap(), 2);
        assert_eq!(harness.chat.deliveries().len(), 2);
        assert_eq!(
            harness.db.get_integration(&account.id).unwrap().unwrap().watch.cursor.as_deref(),
            Some("105")
        );
    }

    #[tokio::test]
    async fn unknown_or_inactive_accounts_are_ignored() {
        let harness = Harness::new();
        harness.linked_account("idle@example.com", 9);
        let ingestor = ingestor(&harness);

        assert_eq!(ingestor.on_push_notification("nobody@example.com", "5").await, Ok(None));
        assert_eq!(ingestor.on_push_notification("idle@example.com", "5").await, Ok(None));
        assert!(harness.provider.calls().is_empty());
    }
}
