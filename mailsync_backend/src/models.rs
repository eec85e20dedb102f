use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chat the account is linked to (a Telegram chat id).
pub type ConversationId = i64;

/// OAuth credential pair. Opaque to the sync and reply components; only the
/// provider client reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Push-subscription watermark embedded in the integration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchState {
    pub active: bool,
    pub cursor: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// One linked mailbox. The single source of truth for where sync left off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountIntegration {
    pub id: String,
    pub email: String,
    pub conversation_id: ConversationId,
    pub credentials: Credentials,
    pub watch: WatchState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the context payload currently holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Raw item text, e.g. a search snippet.
    Original,
    Summary,
    Draft,
}

impl PayloadKind {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            PayloadKind::Original => "original",
            PayloadKind::Summary => "summary",
            PayloadKind::Draft => "draft",
        }
    }

    pub(crate) fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "summary" => PayloadKind::Summary,
            "draft" => PayloadKind::Draft,
            _ => PayloadKind::Original,
        }
    }
}

/// Reply workflow state for one (conversation, item) key, derived from the
/// stored context alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    NoContext,
    Summarized,
    Drafted,
}

impl ReplyState {
    pub fn of(context: Option<&ItemContext>) -> Self {
        match context.map(|c| c.payload_kind) {
            None => ReplyState::NoContext,
            Some(PayloadKind::Draft) => ReplyState::Drafted,
            Some(_) => ReplyState::Summarized,
        }
    }
}

/// Text currently in play for one (conversation, item) reply workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemContext {
    pub conversation_id: ConversationId,
    pub item_id: String,
    pub subject: String,
    pub originator: String,
    /// Original item text. Drafts are always generated from this, never from
    /// a previous draft.
    pub body: String,
    pub payload: String,
    pub payload_kind: PayloadKind,
    pub thread_id: Option<String>,
    pub message_id_header: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ItemContext {
    pub fn from_item(
        conversation_id: ConversationId,
        item: &MailItem,
        payload: String,
        payload_kind: PayloadKind,
    ) -> Self {
        Self {
            conversation_id,
            item_id: item.id.clone(),
            subject: item.subject.clone(),
            originator: item.from.clone(),
            body: item.text_for_generation().to_string(),
            payload,
            payload_kind,
            thread_id: item.thread_id.clone(),
            message_id_header: item.message_id_header.clone(),
            created_at: Utc::now(),
        }
    }

    /// Same key and provenance, new payload. Contexts are replaced whole.
    pub fn with_payload(&self, payload: String, payload_kind: PayloadKind) -> Self {
        Self {
            payload,
            payload_kind,
            created_at: Utc::now(),
            ..self.clone()
        }
    }
}

/// A fetched mailbox item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MailItem {
    pub id: String,
    pub thread_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub date: Option<String>,
    pub body: String,
    pub snippet: String,
    pub message_id_header: Option<String>,
}

impl MailItem {
    pub fn text_for_generation(&self) -> &str {
        if self.body.trim().is_empty() {
            &self.snippet
        } else {
            &self.body
        }
    }
}

/// Result of a "changes since" query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Newly added item ids, in provider order.
    pub item_ids: Vec<String>,
    /// Latest cursor the provider reported, when it reports one.
    pub latest_cursor: Option<String>,
}

/// Result of registering a push subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRegistration {
    pub cursor: String,
    pub expires_at: DateTime<Utc>,
}

/// Reply being dispatched through the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub thread_id: Option<String>,
    pub in_reply_to: Option<String>,
}

/// A chat button. Callback buttons come back as user actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ActionButton {
    Callback { label: String, data: String },
    Link { label: String, url: String },
}

impl ActionButton {
    pub fn callback(label: &str, data: String) -> Self {
        ActionButton::Callback {
            label: label.to_string(),
            data,
        }
    }

    pub fn link(label: &str, url: String) -> Self {
        ActionButton::Link {
            label: label.to_string(),
            url,
        }
    }
}
