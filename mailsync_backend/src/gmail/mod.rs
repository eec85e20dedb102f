//! Gmail REST client implementing [`MailProvider`].

pub mod oauth;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer};

use crate::collaborators::MailProvider;
use crate::database::MailSyncDatabase;
use crate::error::ServiceError;
use crate::models::{AccountIntegration, ChangeSet, MailItem, OutgoingMessage, WatchRegistration};

pub use oauth::GoogleOAuth;

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";

/// Tokens within this window of expiry are refreshed before use.
const TOKEN_REFRESH_SKEW_SECS: i64 = 60;

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        !self.access_token.is_empty()
            && self
                .expires_at
                .map(|t| t > Utc::now() + Duration::seconds(TOKEN_REFRESH_SKEW_SECS))
                .unwrap_or(true)
    }
}

pub struct GmailClient {
    http: reqwest::Client,
    oauth: GoogleOAuth,
    db: Arc<MailSyncDatabase>,
    pubsub_topic: String,
    api_base: String,
    tokens: Mutex<HashMap<String, CachedToken>>,
}

// ─── Gmail API types ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryResponse {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    history_id: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<MessageAdded>,
}

#[derive(Deserialize)]
struct MessageAdded {
    message: MessageRef,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

#[derive(Deserialize)]
struct MessageListResponse {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    #[serde(default, deserialize_with = "string_or_number")]
    history_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    expiration: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    snippet: String,
    payload: Option<MessagePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePart {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    headers: Vec<Header>,
    body: Option<PartBody>,
    #[serde(default)]
    parts: Vec<MessagePart>,
}

#[derive(Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Deserialize)]
struct PartBody {
    data: Option<String>,
}

/// Gmail and Pub/Sub encode 64-bit ids as strings, but not always.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

// ─── Client ──────────────────────────────────────────────────────────────────

impl GmailClient {
    pub fn new(
        http: reqwest::Client,
        oauth: GoogleOAuth,
        db: Arc<MailSyncDatabase>,
        pubsub_topic: String,
    ) -> Self {
        Self {
            http,
            oauth,
            db,
            pubsub_topic,
            api_base: GMAIL_API_BASE.to_string(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn oauth(&self) -> &GoogleOAuth {
        &self.oauth
    }

    fn cached_token(&self, account: &AccountIntegration) -> Option<CachedToken> {
        let cache = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&account.id).filter(|t| t.is_fresh()).cloned()
    }

    async fn access_token(
        &self,
        account: &AccountIntegration,
        force_refresh: bool,
    ) -> Result<String, ServiceError> {
        if !force_refresh {
            if let Some(cached) = self.cached_token(account) {
                return Ok(cached.access_token);
            }
            let stored = CachedToken {
                access_token: account.credentials.access_token.clone(),
                expires_at: account.credentials.expires_at,
            };
            if stored.is_fresh() {
                return Ok(stored.access_token);
            }
        }

        let (access_token, expires_at) = self.oauth.refresh(&account.credentials.refresh_token).await?;
        tracing::debug!("Refreshed Gmail access token for {}", account.email);

        if let Err(e) = self
            .db
            .update_access_token(&account.id, &access_token, expires_at)
        {
            tracing::warn!("Failed to persist refreshed token for {}: {}", account.email, e);
        }
        let mut cache = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            account.id.clone(),
            CachedToken {
                access_token: access_token.clone(),
                expires_at,
            },
        );
        Ok(access_token)
    }

    /// Send an authorized request, refreshing the token once on a 401.
    async fn send_authorized<F>(
        &self,
        account: &AccountIntegration,
        context: &str,
        build: F,
    ) -> Result<reqwest::Response, ServiceError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut force_refresh = false;
        loop {
            let token = self.access_token(account, force_refresh).await?;
            let response = build(&token)
                .send()
                .await
                .map_err(|e| ServiceError::from_transport(context, &e))?;

            let status = response.status();
            if status == reqwest::StatusCode::UNAUTHORIZED && !force_refresh {
                force_refresh = true;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_gmail_error(context, status, &body));
            }
            return Ok(response);
        }
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        context: &str,
        response: reqwest::Response,
    ) -> Result<T, ServiceError> {
        response
            .json()
            .await
            .map_err(|e| ServiceError::Permanent(format!("{} parse: {}", context, e)))
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    async fn list_changes_since(
        &self,
        account: &AccountIntegration,
        cursor: &str,
    ) -> Result<ChangeSet, ServiceError> {
        let url = format!("{}/history", self.api_base);
        let mut seen = HashSet::new();
        let mut changes = ChangeSet::default();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .send_authorized(account, "gmail history", |token| {
                    let mut query = vec![
                        ("startHistoryId", cursor.to_string()),
                        ("historyTypes", "messageAdded".to_string()),
                        ("labelId", "INBOX".to_string()),
                    ];
                    if let Some(page) = &page_token {
                        query.push(("pageToken", page.clone()));
                    }
                    self.http.get(&url).bearer_auth(token).query(&query)
                })
                .await
                .map_err(|e| match e {
                    ServiceError::NotFound(detail) => ServiceError::CursorExpired(detail),
                    other => other,
                })?;

            let page: HistoryResponse = Self::json("gmail history", response).await?;
            for record in page.history {
                for added in record.messages_added {
                    if seen.insert(added.message.id.clone()) {
                        changes.item_ids.push(added.message.id);
                    }
                }
            }
            if page.history_id.is_some() {
                changes.latest_cursor = page.history_id;
            }

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        Ok(changes)
    }

    async fn subscribe(
        &self,
        account: &AccountIntegration,
    ) -> Result<WatchRegistration, ServiceError> {
        if self.pubsub_topic.trim().is_empty() {
            return Err(ServiceError::Permanent(
                "no Pub/Sub topic configured for Gmail watch".to_string(),
            ));
        }
        let url = format!("{}/watch", self.api_base);
        let body = serde_json::json!({
            "topicName": self.pubsub_topic,
            "labelIds": ["INBOX"],
            "labelFilterBehavior": "include",
        });
        let response = self
            .send_authorized(account, "gmail watch", |token| {
                self.http.post(&url).bearer_auth(token).json(&body)
            })
            .await?;

        let watch: WatchResponse = Self::json("gmail watch", response).await?;
        let cursor = watch
            .history_id
            .ok_or_else(|| ServiceError::Permanent("gmail watch returned no historyId".into()))?;
        let expires_at = watch
            .expiration
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| ServiceError::Permanent("gmail watch returned no expiration".into()))?;

        Ok(WatchRegistration { cursor, expires_at })
    }

    async fn unsubscribe(&self, account: &AccountIntegration) -> Result<(), ServiceError> {
        let url = format!("{}/stop", self.api_base);
        self.send_authorized(account, "gmail stop", |token| {
            self.http.post(&url).bearer_auth(token).json(&serde_json::json!({}))
        })
        .await?;
        Ok(())
    }

    async fn get_item(
        &self,
        account: &AccountIntegration,
        item_id: &str,
    ) -> Result<MailItem, ServiceError> {
        let url = format!("{}/messages/{}", self.api_base, item_id);
        let response = self
            .send_authorized(account, "gmail message", |token| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("format", "full")])
            })
            .await?;
        let message: GmailMessage = Self::json("gmail message", response).await?;
        Ok(mail_item_from(message))
    }

    async fn search(
        &self,
        account: &AccountIntegration,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<MailItem>, ServiceError> {
        let url = format!("{}/messages", self.api_base);
        let max = max_results.max(1).to_string();
        let response = self
            .send_authorized(account, "gmail search", |token| {
                self.http
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("q", query), ("maxResults", max.as_str())])
            })
            .await?;
        let list: MessageListResponse = Self::json("gmail search", response).await?;

        let mut items = Vec::with_capacity(list.messages.len());
        for message in list.messages.into_iter().take(max_results) {
            items.push(self.get_item(account, &message.id).await?);
        }
        Ok(items)
    }

    async fn send(
        &self,
        account: &AccountIntegration,
        message: &OutgoingMessage,
    ) -> Result<(), ServiceError> {
        let url = format!("{}/messages/send", self.api_base);
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(build_rfc822(message));
        let mut body = serde_json::json!({ "raw": raw });
        if let Some(thread_id) = &message.thread_id {
            body["threadId"] = serde_json::Value::String(thread_id.clone());
        }
        self.send_authorized(account, "gmail send", |token| {
            self.http.post(&url).bearer_auth(token).json(&body)
        })
        .await?;
        tracing::info!("Sent reply from {} to {}", account.email, message.to);
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Gmail reports quota exhaustion as 403 with a rate-limit reason.
fn classify_gmail_error(context: &str, status: reqwest::StatusCode, body: &str) -> ServiceError {
    let lowered = body.to_ascii_lowercase();
    if status == reqwest::StatusCode::FORBIDDEN
        && (lowered.contains("ratelimitexceeded") || lowered.contains("quotaexceeded"))
    {
        return ServiceError::Transient(format!("{} rate limited: {}", context, status));
    }
    ServiceError::from_status(context, status, body)
}

fn mail_item_from(message: GmailMessage) -> MailItem {
    let (headers, body) = match &message.payload {
        Some(part) => (
            &part.headers[..],
            find_plain_text(part).and_then(decode_body_data),
        ),
        None => (&[][..], None),
    };
    let header = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };

    MailItem {
        subject: header("Subject").unwrap_or_else(|| "No Subject".to_string()),
        from: header("From").unwrap_or_else(|| "Unknown".to_string()),
        date: header("Date"),
        message_id_header: header("Message-ID"),
        body: body.unwrap_or_else(|| message.snippet.clone()),
        snippet: message.snippet.clone(),
        thread_id: message.thread_id.clone(),
        id: message.id,
    }
}

/// First `text/plain` part, depth first.
fn find_plain_text(part: &MessagePart) -> Option<&str> {
    if part.mime_type.eq_ignore_ascii_case("text/plain") {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_deref()) {
            return Some(data);
        }
    }
    part.parts.iter().find_map(find_plain_text)
}

fn decode_body_data(data: &str) -> Option<String> {
    let trimmed = data.trim().trim_end_matches('=');
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(trimmed)
        .ok()?;
    let text = String::from_utf8_lossy(&bytes).into_owned();
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!(
            "=?UTF-8?B?{}?=",
            base64::engine::general_purpose::STANDARD.encode(value.as_bytes())
        )
    }
}

fn build_rfc822(message: &OutgoingMessage) -> String {
    let mut lines = vec![
        format!("To: {}", message.to),
        format!("Subject: {}", encode_header_value(&message.subject)),
        "MIME-Version: 1.0".to_string(),
        "Content-Type: text/plain; charset=utf-8".to_string(),
    ];
    if let Some(original) = &message.in_reply_to {
        lines.push(format!("In-Reply-To: {}", original));
        lines.push(format!("References: {}", original));
    }
    lines.push(String::new());
    lines.push(message.body.clone());
    lines.join("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(text: &str) -> String {
        base64::engine::general_purpose::URL_SAFE.encode(text)
    }

    #[test]
    fn message_parsing_prefers_nested_plain_text() {
        let json = serde_json::json!({
            "id": "m1",
            "threadId": "t1",
            "snippet": "short",
            "payload": {
                "mimeType": "multipart/mixed",
                "headers": [
                    {"name": "Subject", "value": "Lunch?"},
                    {"name": "From", "value": "Bob <bob@example.com>"},
                    {"name": "Message-Id", "value": "<abc@mail.example.com>"}
                ],
                "parts": [
                    {"mimeType": "multipart/alternative", "parts": [
                        {"mimeType": "text/html", "body": {"data": encoded("<p>hi</p>")}},
                        {"mimeType": "text/plain", "body": {"data": encoded("Are you free at noon?")}}
                    ]}
                ]
            }
        });
        let message: GmailMessage = serde_json::from_value(json).unwrap();
        let item = mail_item_from(message);

        assert_eq!(item.subject, "Lunch?");
        assert_eq!(item.from, "Bob <bob@example.com>");
        assert_eq!(item.body, "Are you free at noon?");
        assert_eq!(item.thread_id.as_deref(), Some("t1"));
        assert_eq!(item.message_id_header.as_deref(), Some("<abc@mail.example.com>"));
    }

    #[test]
    fn message_without_text_part_falls_back_to_snippet() {
        let json = serde_json::json!({"id": "m2", "snippet": "only snippet"});
        let item = mail_item_from(serde_json::from_value(json).unwrap());
        assert_eq!(item.body, "only snippet");
        assert_eq!(item.subject, "No Subject");
        assert_eq!(item.from, "Unknown");
    }

    #[test]
    fn history_ids_accept_strings_and_numbers() {
        let page: HistoryResponse =
            serde_json::from_str(r#"{"historyId": 105, "history": []}"#).unwrap();
        assert_eq!(page.history_id.as_deref(), Some("105"));
        let page: HistoryResponse = serde_json::from_str(r#"{"historyId": "106"}"#).unwrap();
        assert_eq!(page.history_id.as_deref(), Some("106"));
    }

    #[test]
    fn rate_limited_403_is_transient_but_plain_403_is_auth() {
        let forbidden = reqwest::StatusCode::FORBIDDEN;
        assert!(classify_gmail_error(
            "x",
            forbidden,
            r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#
        )
        .is_transient());
        assert!(classify_gmail_error("x", forbidden, r#"{"error":{"code":403}}"#).is_auth());
        assert!(matches!(
            classify_gmail_error("x", reqwest::StatusCode::NOT_FOUND, ""),
            ServiceError::NotFound(_)
        ));
    }

    #[test]
    fn reply_message_threads_on_original_message_id() {
        let raw = build_rfc822(&OutgoingMessage {
            to: "bob@example.com".to_string(),
            subject: "Re: Lunch?".to_string(),
            body: "Sure.".to_string(),
            thread_id: Some("t1".to_string()),
            in_reply_to: Some("<abc@mail.example.com>".to_string()),
        });

        assert!(raw.starts_with("To: bob@example.com\r\nSubject: Re: Lunch?\r\n"));
        assert!(raw.contains("In-Reply-To: <abc@mail.example.com>\r\n"));
        assert!(raw.contains("References: <abc@mail.example.com>\r\n"));
        assert!(raw.ends_with("\r\n\r\nSure."));
    }

    #[test]
    fn non_ascii_subjects_are_encoded() {
        assert_eq!(encode_header_value("Re: hello"), "Re: hello");
        assert!(encode_header_value("Re: café").starts_with("=?UTF-8?B?"));
    }
}
