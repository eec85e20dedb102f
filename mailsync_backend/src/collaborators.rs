//! Capability interfaces for everything that leaves the process, plus the
//! handle bundle each component is constructed with.

use std::sync::Arc;

use async_trait::async_trait;

use crate::database::MailSyncDatabase;
use crate::error::ServiceError;
use crate::models::{
    AccountIntegration, ActionButton, ChangeSet, ConversationId, MailItem, OutgoingMessage,
    WatchRegistration,
};
use crate::retry::RetryPolicy;

/// Mailbox provider: change feed, push subscription, item access.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Ids of items added since `cursor`, in provider order.
    async fn list_changes_since(
        &self,
        account: &AccountIntegration,
        cursor: &str,
    ) -> Result<ChangeSet, ServiceError>;

    async fn subscribe(&self, account: &AccountIntegration)
        -> Result<WatchRegistration, ServiceError>;

    async fn unsubscribe(&self, account: &AccountIntegration) -> Result<(), ServiceError>;

    async fn get_item(
        &self,
        account: &AccountIntegration,
        item_id: &str,
    ) -> Result<MailItem, ServiceError>;

    async fn search(
        &self,
        account: &AccountIntegration,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<MailItem>, ServiceError>;

    async fn send(
        &self,
        account: &AccountIntegration,
        message: &OutgoingMessage,
    ) -> Result<(), ServiceError>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn summarize(&self, subject: &str, body: &str, from: &str)
        -> Result<String, ServiceError>;

    async fn draft_reply(
        &self,
        subject: &str,
        body: &str,
        from: &str,
    ) -> Result<String, ServiceError>;
}

/// The generator's credentials are ours, not the mailbox owner's. A rejected
/// API key must never be reported as revoked Gmail access.
fn generator_failure(error: ServiceError) -> ServiceError {
    match error {
        ServiceError::Auth(detail) => {
            ServiceError::Permanent(format!("text generation rejected credentials: {}", detail))
        }
        other => other,
    }
}

/// Chat front end. `actions` is a list of button rows.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn deliver_message(
        &self,
        conversation_id: ConversationId,
        text: &str,
        actions: &[Vec<ActionButton>],
    ) -> Result<(), ServiceError>;

    async fn acknowledge_action(
        &self,
        action_id: &str,
        text: Option<&str>,
    ) -> Result<(), ServiceError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn MailProvider>,
    pub generator: Arc<dyn TextGenerator>,
    pub chat: Arc<dyn ChatTransport>,
    pub db: Arc<MailSyncDatabase>,
    pub retry: RetryPolicy,
}

impl Collaborators {
    /// Deliver through the retry policy.
    pub async fn deliver(
        &self,
        conversation_id: ConversationId,
        text: &str,
        actions: &[Vec<ActionButton>],
    ) -> Result<(), ServiceError> {
        self.retry
            .run("deliver_message", || {
                self.chat.deliver_message(conversation_id, text, actions)
            })
            .await
    }

    /// Plain message where a failure only gets logged.
    pub async fn notify(&self, conversation_id: ConversationId, text: &str) {
        if let Err(e) = self.deliver(conversation_id, text, &[]).await {
            tracing::warn!(
                "Failed to notify conversation {}: {}",
                conversation_id,
                e
            );
        }
    }

    pub async fn acknowledge(&self, action_id: &str, text: Option<&str>) {
        if let Err(e) = self.chat.acknowledge_action(action_id, text).await {
            tracing::debug!("Failed to acknowledge action {}: {}", action_id, e);
        }
    }

    pub async fn summarize(&self, item: &MailItem) -> Result<String, ServiceError> {
        let body = item.text_for_generation();
        self.retry
            .run("summarize", || {
                self.generator.summarize(&item.subject, body, &item.from)
            })
            .await
            .map_err(generator_failure)
    }

    pub async fn draft_reply(
        &self,
        subject: &str,
        body: &str,
        from: &str,
    ) -> Result<String, ServiceError> {
        self.retry
            .run("draft_reply", || self.generator.draft_reply(subject, body, from))
            .await
            .map_err(generator_failure)
    }

    pub async fn fetch_item(
        &self,
        account: &AccountIntegration,
        item_id: &str,
    ) -> Result<MailItem, ServiceError> {
        self.retry
            .run("get_item", || self.provider.get_item(account, item_id))
            .await
    }

    /// Auth failures stop the subscription; the user has to reconnect.
    pub async fn handle_auth_failure(&self, account: &AccountIntegration, error: &ServiceError) {
        tracing::warn!(
            "Authorization failed for {} ({}); deactivating watch",
            account.email,
            error
        );
        if let Err(e) = self.db.deactivate_watch(&account.id) {
            tracing::error!("Failed to deactivate watch for {}: {}", account.email, e);
        }
        self.notify(
            account.conversation_id,
            "Gmail access was revoked or has expired. Use /connect to link your account again.",
        )
        .await;
    }
}
