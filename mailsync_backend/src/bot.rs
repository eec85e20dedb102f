//! Telegram update dispatch: commands and button callbacks.
//!
//! Every update is decoded once into a [`BotCommand`] or [`CallbackAction`]
//! and then matched exhaustively.

use std::sync::Arc;

use crate::collaborators::Collaborators;
use crate::config::MailSyncConfig;
use crate::error::ServiceError;
use crate::models::{AccountIntegration, ActionButton, ConversationId, ItemContext, PayloadKind};
use crate::reply::{new_item_actions, search_result_actions, ReplyAction, ReplyStateMachine};
use crate::subscription::SubscriptionManager;
use crate::telegram::{CallbackQuery, Update};

const CHECK_LIMIT: usize = 5;
const SEARCH_LIMIT: usize = 5;
const SNIPPET_PREVIEW_CHARS: usize = 150;

const NO_ACCOUNT: &str = "❌ No account linked. Use /connect to get started.";

const WELCOME_TEXT: &str = "👋 Welcome to MailSync!\n\n\
     I'm your AI-powered email assistant. I'll help you manage your emails directly from Telegram.\n\n\
     🚀 Get Started:\n\
     1. Use /connect to link your Gmail\n\
     2. Use /watch to enable real-time notifications\n\
     3. Receive AI summaries and reply instantly!\n\n\
     Type /help to see all commands.";

const HELP_TEXT: &str = "📚 MailSync Commands\n\n\
     Getting Started:\n\
     /start - Welcome message\n\
     /connect - Link your Gmail account\n\
     /unlink - Disconnect Gmail account\n\n\
     Email Management:\n\
     /check - Check recent unread emails\n\
     /search <keyword> - Search your emails\n\n\
     Notifications:\n\
     /watch - Enable real-time notifications\n\
     /unwatch - Disable notifications\n\
     /status - View account & notification status\n\n\
     /help - Show this message";

const SEARCH_USAGE: &str = "🔍 Email Search\n\n\
     Usage: /search <keyword>\n\n\
     Examples:\n\
     • /search invoice\n\
     • /search from:john@example.com\n\
     • /search subject:meeting\n\
     • /search after:2026/01/01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Connect,
    Status,
    Check,
    Search(String),
    Watch,
    Unwatch,
    Unlink,
    Unknown(String),
}

impl BotCommand {
    /// `None` for plain text. Accepts `/cmd@BotName` forms.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let (head, args) = match rest.split_once(char::is_whitespace) {
            Some((head, args)) => (head, args.trim()),
            None => (rest, ""),
        };
        let name = head
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        Some(match name.as_str() {
            "start" => BotCommand::Start,
            "help" => BotCommand::Help,
            "connect" => BotCommand::Connect,
            "status" => BotCommand::Status,
            "check" => BotCommand::Check,
            "search" => BotCommand::Search(args.to_string()),
            "watch" => BotCommand::Watch,
            "unwatch" => BotCommand::Unwatch,
            "unlink" => BotCommand::Unlink,
            _ => BotCommand::Unknown(name),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Item { action: ReplyAction, item_id: String },
    ConfirmUnlink,
    CancelUnlink,
}

impl CallbackAction {
    pub fn decode(data: &str) -> Option<Self> {
        // Exact account-level actions first; "cancel_unlink" would otherwise
        // decode as a cancel on item "unlink".
        match data.trim() {
            "confirm_unlink" => Some(CallbackAction::ConfirmUnlink),
            "cancel_unlink" => Some(CallbackAction::CancelUnlink),
            other => ReplyAction::decode(other)
                .map(|(action, item_id)| CallbackAction::Item { action, item_id }),
        }
    }
}

pub struct BotDispatcher {
    collab: Collaborators,
    config: Arc<MailSyncConfig>,
    subscriptions: Arc<SubscriptionManager>,
    reply: Arc<ReplyStateMachine>,
}

impl BotDispatcher {
    pub fn new(
        collab: Collaborators,
        config: Arc<MailSyncConfig>,
        subscriptions: Arc<SubscriptionManager>,
        reply: Arc<ReplyStateMachine>,
    ) -> Self {
        Self {
            collab,
            config,
            subscriptions,
            reply,
        }
    }

    pub async fn handle_update(&self, update: Update) {
        if let Some(query) = update.callback_query {
            self.handle_callback(query).await;
            return;
        }

        let Some(message) = update.message else {
            return;
        };
        let chat_id = message.chat.id;
        let Some(text) = message.text.filter(|t| !t.trim().is_empty()) else {
            return;
        };

        match BotCommand::parse(&text) {
            Some(command) => {
                tracing::info!("Telegram [chat {}]: {:?}", chat_id, command);
                self.handle_command(chat_id, command).await;
            }
            None => tracing::debug!("Telegram [chat {}]: ignoring free text", chat_id),
        }
    }

    async fn handle_callback(&self, query: CallbackQuery) {
        let Some(chat_id) = query.message.as_ref().map(|m| m.chat.id) else {
            self.collab.acknowledge(&query.id, None).await;
            return;
        };
        let data = query.data.as_deref().unwrap_or_default();

        match CallbackAction::decode(data) {
            Some(CallbackAction::Item { action, item_id }) => {
                self.reply
                    .on_user_action(chat_id, action, &item_id, Some(&query.id))
                    .await;
            }
            Some(CallbackAction::ConfirmUnlink) => {
                self.collab.acknowledge(&query.id, Some("Disconnecting...")).await;
                self.confirm_unlink(chat_id).await;
            }
            Some(CallbackAction::CancelUnlink) => {
                self.collab.acknowledge(&query.id, Some("Cancelled")).await;
            }
            None => {
                tracing::warn!("Unknown callback data from chat {}: {:?}", chat_id, data);
                self.collab
                    .acknowledge(&query.id, Some("This button is no longer supported."))
                    .await;
            }
        }
    }

    pub async fn handle_command(&self, chat_id: ConversationId, command: BotCommand) {
        match command {
            BotCommand::Start => self.collab.notify(chat_id, WELCOME_TEXT).await,
            BotCommand::Help => self.collab.notify(chat_id, HELP_TEXT).await,
            BotCommand::Connect => self.connect(chat_id).await,
            BotCommand::Status => self.status(chat_id).await,
            BotCommand::Check => self.check(chat_id).await,
            BotCommand::Search(query) => self.search(chat_id, &query).await,
            BotCommand::Watch => self.watch(chat_id).await,
            BotCommand::Unwatch => self.unwatch(chat_id).await,
            BotCommand::Unlink => self.unlink_prompt(chat_id).await,
            BotCommand::Unknown(name) => {
                self.collab
                    .notify(
                        chat_id,
                        &format!("Unknown command /{}. Type /help to see all commands.", name),
                    )
                    .await
            }
        }
    }

    // ─── Commands ────────────────────────────────────────────────────────────

    async fn connect(&self, chat_id: ConversationId) {
        let actions = vec![vec![ActionButton::link(
            "🔗 Connect Gmail",
            self.config.connect_url(chat_id),
        )]];
        if let Err(e) = self
            .collab
            .deliver(
                chat_id,
                "🔐 Connect Your Gmail Account\n\nClick the button below to authorize MailSync:",
                &actions,
            )
            .await
        {
            tracing::warn!("Failed to send connect link to {}: {}", chat_id, e);
        }
    }

    async fn status(&self, chat_id: ConversationId) {
        let Some(account) = self.account(chat_id).await else {
            return;
        };
        let watch = &account.watch;
        let mut text = format!(
            "📊 Account Status\n\nEmail: {}\nPush Notifications: {}",
            account.email,
            if watch.active { "✅ Enabled" } else { "❌ Disabled" }
        );
        if let (true, Some(expires)) = (watch.active, watch.expires_at) {
            text.push_str(&format!("\nWatch Expires: {}", expires.format("%Y-%m-%d %H:%M UTC")));
        }
        if let Some(updated) = watch.last_updated {
            text.push_str(&format!("\nLast Sync: {}", updated.format("%Y-%m-%d %H:%M UTC")));
        }
        self.collab.notify(chat_id, &text).await;
    }

    async fn check(&self, chat_id: ConversationId) {
        let Some(account) = self.account(chat_id).await else {
            return;
        };
        self.collab
            .notify(chat_id, "🔍 Checking your recent emails...")
            .await;

        let items = match self.search_items(&account, "is:unread", CHECK_LIMIT).await {
            Ok(items) => items,
            Err(e) => {
                self.command_failed(&account, e, "❌ Error checking emails. Please try again later.")
                    .await;
                return;
            }
        };
        if items.is_empty() {
            self.collab.notify(chat_id, "📭 No new emails found!").await;
            return;
        }

        self.collab
            .notify(
                chat_id,
                &format!("📬 Found {} recent email(s). Summarizing...", items.len()),
            )
            .await;

        for item in items {
            let summary = match self.collab.summarize(&item).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!("Failed to summarize {}: {}", item.id, e);
                    self.collab
                        .notify(chat_id, &format!("⚠️ Failed to process email: {}", item.subject))
                        .await;
                    continue;
                }
            };
            let context =
                ItemContext::from_item(chat_id, &item, summary.clone(), PayloadKind::Summary);
            if let Err(e) = self.reply.store_context(&context) {
                tracing::error!("Failed to store context for {}: {}", item.id, e);
            }
            let text = format!(
                "📧 New Email\n\nFrom: {}\nSubject: {}\n\nAI Summary:\n{}",
                item.from, item.subject, summary
            );
            if let Err(e) = self
                .collab
                .deliver(chat_id, &text, &new_item_actions(&item.id))
                .await
            {
                tracing::warn!("Failed to deliver {}: {}", item.id, e);
            }
        }

        self.collab.notify(chat_id, "✅ All emails processed!").await;
    }

    async fn search(&self, chat_id: ConversationId, query: &str) {
        let query = query.trim();
        if query.is_empty() {
            self.collab.notify(chat_id, SEARCH_USAGE).await;
            return;
        }
        let Some(account) = self.account(chat_id).await else {
            return;
        };
        self.collab
            .notify(chat_id, &format!("🔍 Searching for: \"{}\"...", query))
            .await;

        let items = match self.search_items(&account, query, SEARCH_LIMIT).await {
            Ok(items) => items,
            Err(e) => {
                self.command_failed(&account, e, "❌ Error searching emails. Please try again.")
                    .await;
                return;
            }
        };
        if items.is_empty() {
            self.collab
                .notify(chat_id, &format!("📭 No emails found matching \"{}\"", query))
                .await;
            return;
        }

        self.collab
            .notify(chat_id, &format!("📬 Found {} email(s):", items.len()))
            .await;
        for item in items {
            let context = ItemContext::from_item(
                chat_id,
                &item,
                item.snippet.clone(),
                PayloadKind::Original,
            );
            if let Err(e) = self.reply.store_context(&context) {
                tracing::error!("Failed to store context for {}: {}", item.id, e);
            }
            let preview: String = item.snippet.chars().take(SNIPPET_PREVIEW_CHARS).collect();
            let text = format!(
                "📧 Email\n\nFrom: {}\nSubject: {}\nDate: {}\n\n{}...",
                item.from,
                item.subject,
                item.date.as_deref().unwrap_or("unknown"),
                preview
            );
            if let Err(e) = self
                .collab
                .deliver(chat_id, &text, &search_result_actions(&item.id))
                .await
            {
                tracing::warn!("Failed to deliver search result {}: {}", item.id, e);
            }
        }
    }

    async fn watch(&self, chat_id: ConversationId) {
        let Some(account) = self.account(chat_id).await else {
            return;
        };
        self.collab
            .notify(chat_id, "⏳ Setting up real-time notifications...")
            .await;

        match self.subscriptions.register(&account.id).await {
            Ok(registration) => {
                let text = format!(
                    "✅ Real-time notifications enabled!\n\n\
                     You'll receive instant AI summaries when new emails arrive.\n\n\
                     ⏰ Watch expires: {}\n\
                     Watches renew automatically.\n\n\
                     Use /unwatch to disable notifications.",
                    registration.expires_at.format("%Y-%m-%d")
                );
                self.collab.notify(chat_id, &text).await;
            }
            Err(e) => {
                self.command_failed(
                    &account,
                    e,
                    "❌ Failed to enable notifications. Please try again.",
                )
                .await
            }
        }
    }

    async fn unwatch(&self, chat_id: ConversationId) {
        let Some(account) = self.account(chat_id).await else {
            return;
        };
        if !account.watch.active {
            self.collab
                .notify(chat_id, "ℹ️ Push notifications are not enabled.")
                .await;
            return;
        }

        match self.subscriptions.revoke(&account.id).await {
            Ok(()) => {
                self.collab
                    .notify(
                        chat_id,
                        "🔕 Real-time notifications disabled. Use /watch to re-enable.",
                    )
                    .await
            }
            Err(e) => {
                tracing::error!("Failed to revoke watch for {}: {}", account.email, e);
                self.collab
                    .notify(chat_id, "❌ Failed to disable notifications.")
                    .await;
            }
        }
    }

    async fn unlink_prompt(&self, chat_id: ConversationId) {
        let actions = vec![vec![
            ActionButton::callback("✅ Yes, Disconnect", "confirm_unlink".to_string()),
            ActionButton::callback("❌ Cancel", "cancel_unlink".to_string()),
        ]];
        if let Err(e) = self
            .collab
            .deliver(
                chat_id,
                "⚠️ Disconnect Gmail Account\n\n\
                 This will:\n\
                 • Stop all email notifications\n\
                 • Remove your Gmail connection\n\
                 • Delete stored email data\n\n\
                 Are you sure?",
                &actions,
            )
            .await
        {
            tracing::warn!("Failed to send unlink prompt to {}: {}", chat_id, e);
        }
    }

    async fn confirm_unlink(&self, chat_id: ConversationId) {
        let account = match self.collab.db.find_integration_by_conversation(chat_id) {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.collab.notify(chat_id, "❌ No account to disconnect.").await;
                return;
            }
            Err(e) => {
                tracing::error!("Failed to load account for chat {}: {}", chat_id, e);
                self.collab
                    .notify(chat_id, "❌ Failed to disconnect. Please try again.")
                    .await;
                return;
            }
        };

        if account.watch.active {
            if let Err(e) = self.subscriptions.revoke(&account.id).await {
                tracing::warn!("Could not stop watch for {}: {}", account.email, e);
            }
        }

        let cleanup = self
            .collab
            .db
            .delete_contexts_for_conversation(chat_id)
            .and_then(|_| self.collab.db.delete_integration(&account.id));
        match cleanup {
            Ok(()) => {
                tracing::info!("Unlinked {} from chat {}", account.email, chat_id);
                self.collab
                    .notify(
                        chat_id,
                        "✅ Account Disconnected\n\n\
                         Your Gmail has been unlinked and all data deleted.\n\n\
                         Use /connect to link a new account.",
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!("Failed to unlink {}: {}", account.email, e);
                self.collab
                    .notify(chat_id, "❌ Failed to disconnect. Please try again.")
                    .await;
            }
        }
    }

    // ─── Helpers ─────────────────────────────────────────────────────────────

    async fn account(&self, chat_id: ConversationId) -> Option<AccountIntegration> {
        match self.collab.db.find_integration_by_conversation(chat_id) {
            Ok(Some(account)) => Some(account),
            Ok(None) => {
                self.collab.notify(chat_id, NO_ACCOUNT).await;
                None
            }
            Err(e) => {
                tracing::error!("Failed to load account for chat {}: {}", chat_id, e);
                self.collab
                    .notify(chat_id, "❌ Something went wrong. Please try again.")
                    .await;
                None
            }
        }
    }

    async fn search_items(
        &self,
        account: &AccountIntegration,
        query: &str,
        limit: usize,
    ) -> Result<Vec<crate::models::MailItem>, ServiceError> {
        self.collab
            .retry
            .run("search", || self.collab.provider.search(account, query, limit))
            .await
    }

    async fn command_failed(&self, account: &AccountIntegration, error: ServiceError, message: &str) {
        if error.is_auth() {
            self.collab.handle_auth_failure(account, &error).await;
        } else {
            tracing::warn!("Command failed for {}: {}", account.email, error);
            self.collab.notify(account.conversation_id, message).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{TelegramChat, TelegramMessage};
    use crate::test_support::{mail_item, Harness, ProviderCall};

    fn dispatcher(harness: &Harness) -> BotDispatcher {
        let collab = harness.collaborators();
        let subscriptions = Arc::new(SubscriptionManager::new(collab.clone()));
        let reply = Arc::new(ReplyStateMachine::new(collab.clone()));
        let config = MailSyncConfig {
            public_base_url: "https://mail.example.com/".to_string(),
            ..MailSyncConfig::default()
        };
        BotDispatcher::new(collab, Arc::new(config), subscriptions, reply)
    }

    fn callback(chat_id: i64, data: &str) -> Update {
        Update {
            update_id: 1,
            message: None,
            callback_query: Some(CallbackQuery {
                id: format!("cb-{}", data),
                data: Some(data.to_string()),
                message: Some(TelegramMessage {
                    message_id: 10,
                    chat: TelegramChat { id: chat_id },
                    text: None,
                }),
            }),
        }
    }

    fn text(chat_id: i64, text: &str) -> Update {
        Update {
            update_id: 2,
            message: Some(TelegramMessage {
                message_id: 11,
                chat: TelegramChat { id: chat_id },
                text: Some(text.to_string()),
            }),
            callback_query: None,
        }
    }

    #[test]
    fn commands_parse_with_arguments_and_bot_suffix() {
        assert_eq!(BotCommand::parse("/start"), Some(BotCommand::Start));
        assert_eq!(BotCommand::parse("/check@MailSyncBot"), Some(BotCommand::Check));
        assert_eq!(
            BotCommand::parse("/search  from:john@example.com "),
            Some(BotCommand::Search("from:john@example.com".to_string()))
        );
        assert_eq!(BotCommand::parse("/search"), Some(BotCommand::Search(String::new())));
        assert_eq!(
            BotCommand::parse("/archive"),
            Some(BotCommand::Unknown("archive".to_string()))
        );
        assert_eq!(BotCommand::parse("hello there"), None);
    }

    #[test]
    fn unlink_callbacks_decode_before_item_prefixes() {
        assert_eq!(CallbackAction::decode("cancel_unlink"), Some(CallbackAction::CancelUnlink));
        assert_eq!(CallbackAction::decode("confirm_unlink"), Some(CallbackAction::ConfirmUnlink));
        assert_eq!(
            CallbackAction::decode("cancel_m1"),
            Some(CallbackAction::Item {
                action: ReplyAction::Cancel,
                item_id: "m1".to_string()
            })
        );
        assert_eq!(CallbackAction::decode("bogus"), None);
    }

    #[tokio::test]
    async fn connect_sends_oauth_link_for_the_chat() {
        let harness = Harness::new();
        dispatcher(&harness).handle_update(text(42, "/connect")).await;

        let delivery = &harness.chat.deliveries()[0];
        assert_eq!(
            delivery.actions[0][0],
            ActionButton::link(
                "🔗 Connect Gmail",
                "https://mail.example.com/gmail/auth?conversation_id=42".to_string()
            )
        );
    }

    #[tokio::test]
    async fn check_summarizes_unread_and_stores_contexts() {
        let harness = Harness::new();
        harness.linked_account("alice@example.com", 42);
        harness.provider.add_item(mail_item("m1", "One", "a@example.com"));
        harness.provider.add_item(mail_item("m2", "Two", "b@example.com"));
        harness.provider.set_search_results(&["m1", "m2"]);
        harness.generator.fail_for_subject("Two");

        dispatcher(&harness).handle_update(text(42, "/check")).await;

        assert!(harness
            .provider
            .calls()
            .contains(&ProviderCall::Search("is:unread".to_string())));
        assert!(harness.db.get_context(42, "m1").unwrap().is_some());
        assert!(harness.db.get_context(42, "m2").unwrap().is_none());
        let texts: Vec<String> = harness.chat.deliveries().into_iter().map(|d| d.text).collect();
        assert!(texts.iter().any(|t| t.contains("Summary of One")));
        assert!(texts.iter().any(|t| t.contains("Failed to process email: Two")));
        assert!(texts.last().unwrap().contains("All emails processed"));
    }

    #[tokio::test]
    async fn search_without_query_shows_usage() {
        let harness = Harness::new();
        dispatcher(&harness).handle_update(text(42, "/search")).await;

        assert!(harness.chat.deliveries()[0].text.contains("Usage: /search"));
        assert!(harness.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn search_results_store_snippet_contexts() {
        let harness = Harness::new();
        harness.linked_account("alice@example.com", 42);
        harness.provider.add_item(mail_item("m1", "Invoice", "a@example.com"));
        harness.provider.set_search_results(&["m1"]);

        dispatcher(&harness)
            .handle_update(text(42, "/search invoice"))
            .await;

        let context = harness.db.get_context(42, "m1").unwrap().unwrap();
        assert_eq!(context.payload_kind, PayloadKind::Original);
        assert_eq!(context.payload, "Snippet of Invoice");
        let last = harness.chat.deliveries().pop().unwrap();
        assert_eq!(last.callback_data(), vec!["reply_m1", "summary_m1"]);
    }

    #[tokio::test]
    async fn watch_and_unwatch_toggle_the_subscription() {
        let harness = Harness::new();
        let account = harness.linked_account("alice@example.com", 42);
        let dispatcher = dispatcher(&harness);

        dispatcher.handle_update(text(42, "/watch")).await;
        assert!(harness.db.get_integration(&account.id).unwrap().unwrap().watch.active);

        dispatcher.handle_update(text(42, "/unwatch")).await;
        assert!(!harness.db.get_integration(&account.id).unwrap().unwrap().watch.active);

        dispatcher.handle_update(text(42, "/unwatch")).await;
        let texts: Vec<String> = harness.chat.deliveries().into_iter().map(|d| d.text).collect();
        assert!(texts.last().unwrap().contains("not enabled"));
    }

    #[tokio::test]
    async fn commands_without_account_prompt_to_connect() {
        let harness = Harness::new();
        dispatcher(&harness).handle_update(text(42, "/status")).await;
        assert!(harness.chat.deliveries()[0].text.contains("/connect"));
    }

    #[tokio::test]
    async fn confirm_unlink_removes_account_and_contexts() {
        let harness = Harness::new();
        let account = harness.active_account("alice@example.com", 42, "100");
        harness
            .db
            .put_context(&ItemContext::from_item(
                42,
                &mail_item("m1", "x", "y"),
                "s".into(),
                PayloadKind::Summary,
            ))
            .unwrap();

        dispatcher(&harness)
            .handle_update(callback(42, "confirm_unlink"))
            .await;

        assert!(harness.db.get_integration(&account.id).unwrap().is_none());
        assert_eq!(harness.db.count_contexts(42).unwrap(), 0);
        assert_eq!(harness.provider.count(|c| matches!(c, ProviderCall::Unsubscribe(_))), 1);
        assert!(harness.chat.deliveries()[0].text.contains("Account Disconnected"));
    }

    #[tokio::test]
    async fn cancel_unlink_only_acknowledges() {
        let harness = Harness::new();
        let account = harness.active_account("alice@example.com", 42, "100");

        dispatcher(&harness)
            .handle_update(callback(42, "cancel_unlink"))
            .await;

        assert!(harness.db.get_integration(&account.id).unwrap().is_some());
        assert!(harness.chat.deliveries().is_empty());
        assert_eq!(harness.chat.acks().len(), 1);
    }

    #[tokio::test]
    async fn item_callbacks_reach_the_reply_machine() {
        let harness = Harness::new();
        harness
            .db
            .put_context(&ItemContext::from_item(
                42,
                &mail_item("m1", "x", "y"),
                "s".into(),
                PayloadKind::Summary,
            ))
            .unwrap();

        dispatcher(&harness).handle_update(callback(42, "cancel_m1")).await;

        assert!(harness.db.get_context(42, "m1").unwrap().is_none());
        assert_eq!(
            harness.chat.acks(),
            vec![("cb-cancel_m1".to_string(), Some("Cancelled".to_string()))]
        );
    }
}
