//! Incremental sync: turns a push notification's cursor into new-item
//! deliveries, advancing the account watermark exactly once per batch.

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};

use crate::collaborators::Collaborators;
use crate::error::ServiceError;
use crate::locks::KeyedLocks;
use crate::models::{AccountIntegration, ItemContext, MailItem, PayloadKind};
use crate::reply::{new_item_actions, ReplyStateMachine};
use crate::subscription::SubscriptionManager;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceOutcome {
    /// New items in provider order.
    pub item_ids: Vec<String>,
    /// Whether the watermark is now at (or past) the notification's cursor.
    pub applied: bool,
    pub delivered: usize,
}

pub struct SyncEngine {
    collab: Collaborators,
    subscriptions: Arc<SubscriptionManager>,
    reply: Arc<ReplyStateMachine>,
    account_locks: Arc<KeyedLocks<String>>,
    item_concurrency: usize,
}

impl SyncEngine {
    pub fn new(
        collab: Collaborators,
        subscriptions: Arc<SubscriptionManager>,
        reply: Arc<ReplyStateMachine>,
        item_concurrency: usize,
    ) -> Self {
        Self {
            account_locks: subscriptions.account_locks(),
            collab,
            subscriptions,
            reply,
            item_concurrency: item_concurrency.max(1),
        }
    }

    pub async fn advance(
        &self,
        account_id: &str,
        new_cursor: &str,
    ) -> Result<AdvanceOutcome, ServiceError> {
        let new_cursor = new_cursor.trim();
        if new_cursor.is_empty() {
            return Err(ServiceError::Permanent("notification carried no cursor".into()));
        }

        let _guard = self.account_locks.lock(account_id.to_string()).await;

        let account = self
            .collab
            .db
            .get_integration(account_id)
            .map_err(ServiceError::storage)?
            .ok_or_else(|| ServiceError::NotFound(format!("integration {}", account_id)))?;

        if !account.watch.active {
            tracing::debug!("Ignoring cursor {} for inactive watch {}", new_cursor, account.email);
            return Ok(AdvanceOutcome::default());
        }

        let old_cursor = match account.watch.cursor.clone() {
            Some(cursor) => cursor,
            None => return self.resync(&account, "no stored cursor").await,
        };
        if old_cursor == new_cursor {
            tracing::debug!("Cursor {} already applied for {}", new_cursor, account.email);
            return Ok(AdvanceOutcome {
                applied: true,
                ..AdvanceOutcome::default()
            });
        }

        let changes = match self
            .collab
            .retry
            .run("list_changes_since", || {
                self.collab.provider.list_changes_since(&account, &old_cursor)
            })
            .await
        {
            Ok(changes) => changes,
            Err(ServiceError::CursorExpired(detail)) => {
                return self.resync(&account, &detail).await;
            }
            Err(e) => {
                if e.is_auth() {
                    self.collab.handle_auth_failure(&account, &e).await;
                } else {
                    tracing::warn!(
                        "Change query for {} from cursor {} failed: {}",
                        account.email,
                        old_cursor,
                        e
                    );
                }
                return Err(e);
            }
        };

        // The provider's own latest cursor covers everything just enumerated;
        // an older, late notification then cannot drag the watermark back.
        let watermark = changes
            .latest_cursor
            .clone()
            .unwrap_or_else(|| new_cursor.to_string());
        self.collab
            .db
            .advance_cursor(&account.id, &watermark)
            .map_err(ServiceError::storage)?;

        tracing::info!(
            "Advanced {} from {} to {} ({} new item(s))",
            account.email,
            old_cursor,
            watermark,
            changes.item_ids.len()
        );

        let delivered = self.process_items(&account, &changes.item_ids).await;
        Ok(AdvanceOutcome {
            item_ids: changes.item_ids,
            applied: true,
            delivered,
        })
    }

    /// Cursor missing or too old: start over from a fresh subscription.
    async fn resync(
        &self,
        account: &AccountIntegration,
        reason: &str,
    ) -> Result<AdvanceOutcome, ServiceError> {
        tracing::warn!("Resyncing {} ({})", account.email, reason);
        match self.subscriptions.register_locked(account).await {
            Ok(_) => Ok(AdvanceOutcome {
                applied: true,
                ..AdvanceOutcome::default()
            }),
            Err(e) => {
                if e.is_auth() {
                    self.collab.handle_auth_failure(account, &e).await;
                } else {
                    tracing::error!("Resync for {} failed: {}", account.email, e);
                }
                Err(e)
            }
        }
    }

    /// Fetch and summarize concurrently, then store and deliver in provider
    /// order. Returns how many items reached the chat.
    async fn process_items(&self, account: &AccountIntegration, item_ids: &[String]) -> usize {
        if item_ids.is_empty() {
            return 0;
        }

        let prepared: Vec<(String, Result<(MailItem, String), ServiceError>)> =
            stream::iter(item_ids.iter().cloned())
                .map(|item_id| async move {
                    let result = self.prepare_item(account, &item_id).await;
                    (item_id, result)
                })
                .buffered(self.item_concurrency)
                .collect()
                .await;

        let conversation_id = account.conversation_id;
        let mut delivered = 0;
        let mut auth_error = None;

        for (item_id, result) in prepared {
            let (item, summary) = match result {
                Ok(prepared) => prepared,
                Err(e) => {
                    tracing::warn!("Failed to process item {} for {}: {}", item_id, account.email, e);
                    if e.is_auth() {
                        auth_error = Some(e);
                    } else {
                        self.collab
                            .notify(conversation_id, "⚠️ A new email arrived but could not be summarized.")
                            .await;
                    }
                    continue;
                }
            };

            // Goes through the context locks: an in-flight reply or a pending
            // draft on the same key wins over the fresh summary.
            let context =
                ItemContext::from_item(conversation_id, &item, summary.clone(), PayloadKind::Summary);
            if let Err(e) = self.reply.store_context(&context) {
                tracing::error!("Failed to store context for item {}: {}", item.id, e);
                continue;
            }

            let text = format!(
                "📬 New Email Arrived!\n\nFrom: {}\nSubject: {}\n\nAI Summary:\n{}",
                item.from, item.subject, summary
            );
            match self
                .collab
                .deliver(conversation_id, &text, &new_item_actions(&item.id))
                .await
            {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("Failed to deliver item {}: {}", item.id, e),
            }
        }

        if let Some(e) = auth_error {
            self.collab.handle_auth_failure(account, &e).await;
        }
        delivered
    }

    async fn prepare_item(
        &self,
        account: &AccountIntegration,
        item_id: &str,
    ) -> Result<(MailItem, String), ServiceError> {
        let item = self.collab.fetch_item(account, item_id).await?;
        let summary = self.collab.summarize(&item).await?;
        Ok((item, summary))
    }
}
