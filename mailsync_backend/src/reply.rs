//! Reply workflow per (conversation, item).
//!
//! The state is derived from the stored context alone (see [`ReplyState`]).
//! Every transition runs under a per-key try-lock: a second press on the same
//! message while one is in flight is rejected with a "try again" answer.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex_lite::Regex;

use crate::collaborators::Collaborators;
use crate::error::ServiceError;
use crate::locks::KeyedLocks;
use crate::models::{
    AccountIntegration, ActionButton, ConversationId, ItemContext, OutgoingMessage, PayloadKind,
    ReplyState,
};
use crate::retry::RetryPolicy;

pub type ContextKey = (ConversationId, String);

const NOT_CONNECTED: &str = "❌ Gmail not connected. Use /connect to link your account.";
const ITEM_MISSING: &str = "❌ Email not found. It may have been deleted.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyAction {
    Reply,
    Summary,
    Send,
    Cancel,
    Custom,
}

impl ReplyAction {
    const ALL: [ReplyAction; 5] = [
        ReplyAction::Reply,
        ReplyAction::Summary,
        ReplyAction::Send,
        ReplyAction::Cancel,
        ReplyAction::Custom,
    ];

    fn prefix(self) -> &'static str {
        match self {
            ReplyAction::Reply => "reply_",
            ReplyAction::Summary => "summary_",
            ReplyAction::Send => "send_",
            ReplyAction::Cancel => "cancel_",
            ReplyAction::Custom => "custom_",
        }
    }

    pub fn callback_data(self, item_id: &str) -> String {
        format!("{}{}", self.prefix(), item_id)
    }

    /// Decode `<action>_<item id>` callback data.
    pub fn decode(data: &str) -> Option<(ReplyAction, String)> {
        Self::ALL.iter().find_map(|action| {
            data.strip_prefix(action.prefix())
                .filter(|id| !id.trim().is_empty())
                .map(|id| (*action, id.to_string()))
        })
    }

    fn acknowledgement(self) -> Option<&'static str> {
        match self {
            ReplyAction::Reply => Some("Generating AI reply..."),
            ReplyAction::Summary => Some("Getting full summary..."),
            ReplyAction::Send => Some("Sending email..."),
            ReplyAction::Cancel => Some("Cancelled"),
            ReplyAction::Custom => None,
        }
    }
}

/// What a user action ended up doing. Every variant has already been
/// reported to the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Drafted,
    Summarized,
    Sent,
    Cancelled,
    Prompted,
    /// Another transition on the same key was in flight.
    Busy,
    /// Not valid from the current state, or nothing to act on.
    Rejected,
    Failed(ServiceError),
}

pub fn new_item_actions(item_id: &str) -> Vec<Vec<ActionButton>> {
    vec![
        vec![
            ActionButton::callback("✉️ Generate Reply", ReplyAction::Reply.callback_data(item_id)),
            ActionButton::callback("✏️ Custom Reply", ReplyAction::Custom.callback_data(item_id)),
        ],
        vec![ActionButton::callback(
            "📄 Full Summary",
            ReplyAction::Summary.callback_data(item_id),
        )],
    ]
}

pub fn search_result_actions(item_id: &str) -> Vec<Vec<ActionButton>> {
    vec![vec![
        ActionButton::callback("✉️ Generate Reply", ReplyAction::Reply.callback_data(item_id)),
        ActionButton::callback("📄 Full Summary", ReplyAction::Summary.callback_data(item_id)),
    ]]
}

fn draft_actions(item_id: &str) -> Vec<Vec<ActionButton>> {
    vec![
        vec![
            ActionButton::callback("✅ Send This Reply", ReplyAction::Send.callback_data(item_id)),
            ActionButton::callback("🔄 Regenerate", ReplyAction::Reply.callback_data(item_id)),
        ],
        vec![ActionButton::callback("❌ Cancel", ReplyAction::Cancel.callback_data(item_id))],
    ]
}

fn summary_actions(item_id: &str) -> Vec<Vec<ActionButton>> {
    vec![vec![ActionButton::callback(
        "✉️ Generate Reply",
        ReplyAction::Reply.callback_data(item_id),
    )]]
}

/// Bare address out of `Name <addr>`, or the whole field when there are no
/// angle brackets.
pub fn extract_address(originator: &str) -> String {
    static ADDRESS: OnceLock<Option<Regex>> = OnceLock::new();
    ADDRESS
        .get_or_init(|| Regex::new(r"<(.+?)>").ok())
        .as_ref()
        .and_then(|re| re.captures(originator))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_else(|| originator.trim().to_string())
}

pub fn reply_subject(subject: &str) -> String {
    let trimmed = subject.trim();
    if trimmed
        .get(..3)
        .map(|p| p.eq_ignore_ascii_case("re:"))
        .unwrap_or(false)
    {
        trimmed.to_string()
    } else {
        format!("Re: {}", trimmed)
    }
}

pub struct ReplyStateMachine {
    collab: Collaborators,
    context_locks: Arc<KeyedLocks<ContextKey>>,
}

impl ReplyStateMachine {
    pub fn new(collab: Collaborators) -> Self {
        Self {
            collab,
            context_locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Entry point for chat callbacks. `action_id` is acknowledged exactly once.
    pub async fn on_user_action(
        &self,
        conversation_id: ConversationId,
        action: ReplyAction,
        item_id: &str,
        action_id: Option<&str>,
    ) -> Transition {
        let key = (conversation_id, item_id.to_string());
        let _guard = match self.context_locks.try_lock(key) {
            Some(guard) => guard,
            None => {
                tracing::info!(
                    "Rejected concurrent {:?} on ({}, {})",
                    action,
                    conversation_id,
                    item_id
                );
                if let Some(id) = action_id {
                    self.collab
                        .acknowledge(id, Some("⏳ Still working on this email. Try again in a moment."))
                        .await;
                }
                return Transition::Busy;
            }
        };

        if let Some(id) = action_id {
            self.collab.acknowledge(id, action.acknowledgement()).await;
        }

        let transition = match action {
            ReplyAction::Reply => self.generate_reply(conversation_id, item_id).await,
            ReplyAction::Summary => self.full_summary(conversation_id, item_id).await,
            ReplyAction::Send => self.send(conversation_id, item_id).await,
            ReplyAction::Cancel => self.cancel(conversation_id, item_id),
            ReplyAction::Custom => self.custom_reply_prompt(conversation_id).await,
        };
        tracing::debug!(
            "{:?} on ({}, {}) -> {:?}",
            action,
            conversation_id,
            item_id,
            transition
        );
        transition
    }

    /// Store a context shown outside the reply flow (new-item notifications,
    /// search results, manual checks). Skipped when a transition currently
    /// holds the key, and never replaces a pending draft.
    pub fn store_context(&self, context: &ItemContext) -> Result<bool, ServiceError> {
        let key = (context.conversation_id, context.item_id.clone());
        let Some(_guard) = self.context_locks.try_lock(key) else {
            tracing::debug!(
                "Context ({}, {}) is busy; not storing",
                context.conversation_id,
                context.item_id
            );
            return Ok(false);
        };

        let existing = self
            .collab
            .db
            .get_context(context.conversation_id, &context.item_id)
            .map_err(ServiceError::storage)?;
        if ReplyState::of(existing.as_ref()) == ReplyState::Drafted {
            tracing::debug!(
                "Keeping pending draft for ({}, {})",
                context.conversation_id,
                context.item_id
            );
            return Ok(false);
        }

        self.collab
            .db
            .put_context(context)
            .map_err(ServiceError::storage)?;
        Ok(true)
    }

    /// Drop abandoned contexts older than `cutoff`. Keys with an in-flight
    /// transition are left alone.
    pub fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<usize, ServiceError> {
        let keys = self
            .collab
            .db
            .list_contexts_created_before(cutoff)
            .map_err(ServiceError::storage)?;

        let mut purged = 0;
        for (conversation_id, item_id) in keys {
            let Some(_guard) = self.context_locks.try_lock((conversation_id, item_id.clone()))
            else {
                continue;
            };
            // Re-check under the lock; a transition may have just rewritten it.
            let still_stale = self
                .collab
                .db
                .get_context(conversation_id, &item_id)
                .map_err(ServiceError::storage)?
                .map(|c| c.created_at < cutoff)
                .unwrap_or(false);
            if still_stale
                && self
                    .collab
                    .db
                    .delete_context(conversation_id, &item_id)
                    .map_err(ServiceError::storage)?
            {
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::info!("Purged {} expired reply context(s)", purged);
        }
        Ok(purged)
    }

    // ─── Transitions ─────────────────────────────────────────────────────────

    async fn generate_reply(&self, conversation_id: ConversationId, item_id: &str) -> Transition {
        let existing = match self.load_context(conversation_id, item_id).await {
            Ok(context) => context,
            Err(transition) => return transition,
        };

        let base = match existing {
            Some(context) => context,
            None => {
                let account = match self.account_for(conversation_id).await {
                    Ok(account) => account,
                    Err(transition) => return transition,
                };
                match self.collab.fetch_item(&account, item_id).await {
                    Ok(item) => ItemContext::from_item(
                        conversation_id,
                        &item,
                        item.text_for_generation().to_string(),
                        PayloadKind::Original,
                    ),
                    Err(e) => {
                        return self
                            .fail(&account, conversation_id, e, "❌ Failed to generate reply. Please try again.")
                            .await
                    }
                }
            }
        };

        // Drafts always come from the original body, never from a prior draft.
        let draft = match self
            .collab
            .draft_reply(&base.subject, &base.body, &base.originator)
            .await
        {
            Ok(draft) => draft,
            Err(e) => {
                tracing::warn!("Draft generation failed for {}: {}", item_id, e);
                self.collab
                    .notify(conversation_id, "❌ Failed to generate reply. Please try again.")
                    .await;
                return Transition::Failed(e);
            }
        };

        let drafted = base.with_payload(draft, PayloadKind::Draft);
        if let Err(e) = self.collab.db.put_context(&drafted) {
            return self.storage_failure(conversation_id, e).await;
        }

        let text = format!(
            "🤖 AI-Generated Reply:\n\n{}\n\nReview the reply before sending.",
            drafted.payload
        );
        if let Err(e) = self
            .collab
            .deliver(conversation_id, &text, &draft_actions(item_id))
            .await
        {
            tracing::warn!("Failed to deliver draft for {}: {}", item_id, e);
        }
        Transition::Drafted
    }

    async fn full_summary(&self, conversation_id: ConversationId, item_id: &str) -> Transition {
        let account = match self.account_for(conversation_id).await {
            Ok(account) => account,
            Err(transition) => return transition,
        };

        let item = match self.collab.fetch_item(&account, item_id).await {
            Ok(item) => item,
            Err(e) => {
                return self
                    .fail(&account, conversation_id, e, "❌ Failed to get summary.")
                    .await
            }
        };
        let summary = match self.collab.summarize(&item).await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("Summary failed for {}: {}", item_id, e);
                self.collab
                    .notify(conversation_id, "❌ Failed to get summary.")
                    .await;
                return Transition::Failed(e);
            }
        };

        let context =
            ItemContext::from_item(conversation_id, &item, summary.clone(), PayloadKind::Summary);
        if let Err(e) = self.collab.db.put_context(&context) {
            return self.storage_failure(conversation_id, e).await;
        }

        let text = format!(
            "📋 Full Email Summary\n\nFrom: {}\nSubject: {}\n\nAI Summary:\n{}",
            item.from, item.subject, summary
        );
        if let Err(e) = self
            .collab
            .deliver(conversation_id, &text, &summary_actions(item_id))
            .await
        {
            tracing::warn!("Failed to deliver summary for {}: {}", item_id, e);
        }
        Transition::Summarized
    }

    async fn send(&self, conversation_id: ConversationId, item_id: &str) -> Transition {
        let context = match self.load_context(conversation_id, item_id).await {
            Ok(context) => context,
            Err(transition) => return transition,
        };

        let draft = match (ReplyState::of(context.as_ref()), context) {
            (ReplyState::Drafted, Some(context)) => context,
            _ => {
                self.collab
                    .notify(
                        conversation_id,
                        "❌ Reply context not found. Please generate a reply first.",
                    )
                    .await;
                return Transition::Rejected;
            }
        };

        let account = match self.account_for(conversation_id).await {
            Ok(account) => account,
            Err(transition) => return transition,
        };

        let message = OutgoingMessage {
            to: extract_address(&draft.originator),
            subject: reply_subject(&draft.subject),
            body: draft.payload.clone(),
            thread_id: draft.thread_id.clone(),
            in_reply_to: draft.message_id_header.clone(),
        };

        // A timed-out send may still have gone out; never resend blindly.
        let policy = RetryPolicy::single_attempt(self.collab.retry.call_timeout);
        if let Err(e) = policy
            .run("send", || self.collab.provider.send(&account, &message))
            .await
        {
            return self
                .fail(&account, conversation_id, e, "❌ Failed to send reply. Please try again.")
                .await;
        }

        if let Err(e) = self.collab.db.delete_context(conversation_id, item_id) {
            tracing::error!(
                "Reply for {} sent but context cleanup failed: {}",
                item_id,
                e
            );
        }
        self.collab
            .notify(conversation_id, "✅ Reply sent successfully!")
            .await;
        Transition::Sent
    }

    fn cancel(&self, conversation_id: ConversationId, item_id: &str) -> Transition {
        match self.collab.db.delete_context(conversation_id, item_id) {
            Ok(_) => Transition::Cancelled,
            Err(e) => {
                tracing::error!("Failed to delete context for {}: {}", item_id, e);
                Transition::Failed(ServiceError::storage(e))
            }
        }
    }

    async fn custom_reply_prompt(&self, conversation_id: ConversationId) -> Transition {
        self.collab
            .notify(
                conversation_id,
                "✏️ To send a custom reply, type your message below.\n\n\
                 I'll send it as a reply to this email.",
            )
            .await;
        Transition::Prompted
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    async fn load_context(
        &self,
        conversation_id: ConversationId,
        item_id: &str,
    ) -> Result<Option<ItemContext>, Transition> {
        match self.collab.db.get_context(conversation_id, item_id) {
            Ok(context) => Ok(context),
            Err(e) => Err(self.storage_failure(conversation_id, e).await),
        }
    }

    async fn account_for(
        &self,
        conversation_id: ConversationId,
    ) -> Result<AccountIntegration, Transition> {
        match self.collab.db.find_integration_by_conversation(conversation_id) {
            Ok(Some(account)) => Ok(account),
            Ok(None) => {
                self.collab.notify(conversation_id, NOT_CONNECTED).await;
                Err(Transition::Rejected)
            }
            Err(e) => Err(self.storage_failure(conversation_id, e).await),
        }
    }

    async fn fail(
        &self,
        account: &AccountIntegration,
        conversation_id: ConversationId,
        error: ServiceError,
        message: &str,
    ) -> Transition {
        match &error {
            ServiceError::Auth(_) => self.collab.handle_auth_failure(account, &error).await,
            ServiceError::NotFound(_) => self.collab.notify(conversation_id, ITEM_MISSING).await,
            _ => {
                tracing::warn!("Reply action failed for {}: {}", account.email, error);
                self.collab.notify(conversation_id, message).await;
            }
        }
        Transition::Failed(error)
    }

    async fn storage_failure(
        &self,
        conversation_id: ConversationId,
        error: anyhow::Error,
    ) -> Transition {
        tracing::error!("Context storage failed for chat {}: {:#}", conversation_id, error);
        self.collab
            .notify(conversation_id, "❌ Something went wrong. Please try again.")
            .await;
        Transition::Failed(ServiceError::storage(error))
    }
}
