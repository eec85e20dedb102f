//! In-memory fakes for the collaborator traits. Every call is recorded so
//! tests can assert on ordering, counts and the absence of calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::collaborators::{ChatTransport, Collaborators, MailProvider, TextGenerator};
use crate::database::MailSyncDatabase;
use crate::error::ServiceError;
use crate::models::{
    AccountIntegration, ActionButton, ChangeSet, ConversationId, Credentials, MailItem,
    OutgoingMessage, WatchRegistration,
};
use crate::retry::RetryPolicy;

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn mail_item(id: &str, subject: &str, from: &str) -> MailItem {
    MailItem {
        id: id.to_string(),
        thread_id: Some(format!("thread-{}", id)),
        subject: subject.to_string(),
        from: from.to_string(),
        date: Some("Mon, 5 Oct 2026 09:00:00 +0000".to_string()),
        body: format!("Body of {}", subject),
        snippet: format!("Snippet of {}", subject),
        message_id_header: Some(format!("<{}@mail.example.com>", id)),
    }
}

// ─── Provider ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCall {
    ListChanges { email: String, cursor: String },
    Subscribe(String),
    Unsubscribe(String),
    GetItem(String),
    Search(String),
    Send(OutgoingMessage),
}

#[derive(Default)]
pub struct MockProvider {
    calls: Mutex<Vec<ProviderCall>>,
    items: Mutex<HashMap<String, MailItem>>,
    changes: Mutex<HashMap<String, ChangeSet>>,
    changes_error: Mutex<Option<ServiceError>>,
    watch_cursor: Mutex<Option<String>>,
    subscribe_failures: Mutex<HashMap<String, ServiceError>>,
    unsubscribe_error: Mutex<Option<ServiceError>>,
    search_results: Mutex<Vec<String>>,
    send_error: Mutex<Option<ServiceError>>,
    send_delay: Mutex<Duration>,
    subscribe_delay: Mutex<Duration>,
}

impl MockProvider {
    pub fn add_item(&self, item: MailItem) {
        locked(&self.items).insert(item.id.clone(), item);
    }

    pub fn remove_item(&self, id: &str) {
        locked(&self.items).remove(id);
    }

    /// Changes reported for a delta query starting at `from_cursor`.
    pub fn set_changes(&self, from_cursor: &str, item_ids: &[&str], latest: Option<&str>) {
        locked(&self.changes).insert(
            from_cursor.to_string(),
            ChangeSet {
                item_ids: item_ids.iter().map(|s| s.to_string()).collect(),
                latest_cursor: latest.map(str::to_string),
            },
        );
    }

    pub fn fail_changes(&self, error: ServiceError) {
        *locked(&self.changes_error) = Some(error);
    }

    pub fn set_watch_cursor(&self, cursor: &str) {
        *locked(&self.watch_cursor) = Some(cursor.to_string());
    }

    pub fn fail_subscribe(&self, email: &str, error: ServiceError) {
        locked(&self.subscribe_failures).insert(email.to_string(), error);
    }

    pub fn fail_unsubscribe(&self, error: ServiceError) {
        *locked(&self.unsubscribe_error) = Some(error);
    }

    pub fn set_search_results(&self, ids: &[&str]) {
        *locked(&self.search_results) = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_send(&self, error: ServiceError) {
        *locked(&self.send_error) = Some(error);
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        *locked(&self.subscribe_delay) = delay;
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *locked(&self.send_delay) = delay;
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        locked(&self.calls).clone()
    }

    pub fn count(&self, pred: impl Fn(&ProviderCall) -> bool) -> usize {
        locked(&self.calls).iter().filter(|c| pred(c)).count()
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        locked(&self.calls)
            .iter()
            .filter_map(|c| match c {
                ProviderCall::Send(m) => Some(m.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ProviderCall) {
        locked(&self.calls).push(call);
    }

    fn item(&self, id: &str) -> Result<MailItem, ServiceError> {
        locked(&self.items)
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("message {}", id)))
    }
}

#[async_trait]
impl MailProvider for MockProvider {
    async fn list_changes_since(
        &self,
        account: &AccountIntegration,
        cursor: &str,
    ) -> Result<ChangeSet, ServiceError> {
        self.record(ProviderCall::ListChanges {
            email: account.email.clone(),
            cursor: cursor.to_string(),
        });
        if let Some(error) = locked(&self.changes_error).clone() {
            return Err(error);
        }
        Ok(locked(&self.changes).get(cursor).cloned().unwrap_or_default())
    }

    async fn subscribe(
        &self,
        account: &AccountIntegration,
    ) -> Result<WatchRegistration, ServiceError> {
        self.record(ProviderCall::Subscribe(account.email.clone()));
        let delay = *locked(&self.subscribe_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = locked(&self.subscribe_failures).get(&account.email).cloned() {
            return Err(error);
        }
        let cursor = locked(&self.watch_cursor)
            .clone()
            .unwrap_or_else(|| "500".to_string());
        Ok(WatchRegistration {
            cursor,
            expires_at: Utc::now() + chrono::Duration::days(7),
        })
    }

    async fn unsubscribe(&self, account: &AccountIntegration) -> Result<(), ServiceError> {
        self.record(ProviderCall::Unsubscribe(account.email.clone()));
        match locked(&self.unsubscribe_error).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn get_item(
        &self,
        _account: &AccountIntegration,
        item_id: &str,
    ) -> Result<MailItem, ServiceError> {
        self.record(ProviderCall::GetItem(item_id.to_string()));
        self.item(item_id)
    }

    async fn search(
        &self,
        _account: &AccountIntegration,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<MailItem>, ServiceError> {
        self.record(ProviderCall::Search(query.to_string()));
        let ids = locked(&self.search_results).clone();
        ids.iter()
            .take(max_results)
            .map(|id| self.item(id))
            .collect()
    }

    async fn send(
        &self,
        _account: &AccountIntegration,
        message: &OutgoingMessage,
    ) -> Result<(), ServiceError> {
        let delay = *locked(&self.send_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.record(ProviderCall::Send(message.clone()));
        match locked(&self.send_error).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ─── Generator ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeneratorCall {
    Summarize { subject: String, body: String },
    Draft { subject: String, body: String },
}

#[derive(Default)]
pub struct MockGenerator {
    calls: Mutex<Vec<GeneratorCall>>,
    failing_subjects: Mutex<HashMap<String, ServiceError>>,
}

impl MockGenerator {
    pub fn fail_for_subject(&self, subject: &str) {
        self.fail_for_subject_with(
            subject,
            ServiceError::Permanent(format!("generation failed for {}", subject)),
        );
    }

    pub fn fail_for_subject_with(&self, subject: &str, error: ServiceError) {
        locked(&self.failing_subjects).insert(subject.to_string(), error);
    }

    pub fn calls(&self) -> Vec<GeneratorCall> {
        locked(&self.calls).clone()
    }

    fn check(&self, subject: &str) -> Result<(), ServiceError> {
        match locked(&self.failing_subjects).get(subject).cloned() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TextGenerator for MockGenerator {
    async fn summarize(
        &self,
        subject: &str,
        body: &str,
        _from: &str,
    ) -> Result<String, ServiceError> {
        locked(&self.calls).push(GeneratorCall::Summarize {
            subject: subject.to_string(),
            body: body.to_string(),
        });
        self.check(subject)?;
        Ok(format!("Summary of {}", subject))
    }

    async fn draft_reply(
        &self,
        subject: &str,
        body: &str,
        _from: &str,
    ) -> Result<String, ServiceError> {
        let n = {
            let mut calls = locked(&self.calls);
            calls.push(GeneratorCall::Draft {
                subject: subject.to_string(),
                body: body.to_string(),
            });
            calls
                .iter()
                .filter(|c| matches!(c, GeneratorCall::Draft { .. }))
                .count()
        };
        self.check(subject)?;
        Ok(format!("Draft {} for {}", n, subject))
    }
}

// ─── Chat ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub conversation_id: ConversationId,
    pub text: String,
    pub actions: Vec<Vec<ActionButton>>,
}

impl Delivery {
    pub fn callback_data(&self) -> Vec<String> {
        self.actions
            .iter()
            .flatten()
            .filter_map(|b| match b {
                ActionButton::Callback { data, .. } => Some(data.clone()),
                ActionButton::Link { .. } => None,
            })
            .collect()
    }
}

#[derive(Default)]
pub struct MockChat {
    deliveries: Mutex<Vec<Delivery>>,
    acks: Mutex<Vec<(String, Option<String>)>>,
    failing_text: Mutex<Option<String>>,
}

impl MockChat {
    /// Fail any delivery whose text contains `needle`.
    pub fn fail_deliveries_containing(&self, needle: &str) {
        *locked(&self.failing_text) = Some(needle.to_string());
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        locked(&self.deliveries).clone()
    }

    pub fn acks(&self) -> Vec<(String, Option<String>)> {
        locked(&self.acks).clone()
    }
}

#[async_trait]
impl ChatTransport for MockChat {
    async fn deliver_message(
        &self,
        conversation_id: ConversationId,
        text: &str,
        actions: &[Vec<ActionButton>],
    ) -> Result<(), ServiceError> {
        if let Some(needle) = locked(&self.failing_text).as_deref() {
            if text.contains(needle) {
                return Err(ServiceError::Permanent("chat rejected message".into()));
            }
        }
        locked(&self.deliveries).push(Delivery {
            conversation_id,
            text: text.to_string(),
            actions: actions.to_vec(),
        });
        Ok(())
    }

    async fn acknowledge_action(
        &self,
        action_id: &str,
        text: Option<&str>,
    ) -> Result<(), ServiceError> {
        locked(&self.acks).push((action_id.to_string(), text.map(str::to_string)));
        Ok(())
    }
}

// ─── Harness ─────────────────────────────────────────────────────────────────

pub struct Harness {
    pub db: Arc<MailSyncDatabase>,
    pub provider: Arc<MockProvider>,
    pub generator: Arc<MockGenerator>,
    pub chat: Arc<MockChat>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            db: Arc::new(MailSyncDatabase::open_in_memory().expect("in-memory db")),
            provider: Arc::new(MockProvider::default()),
            generator: Arc::new(MockGenerator::default()),
            chat: Arc::new(MockChat::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            provider: self.provider.clone(),
            generator: self.generator.clone(),
            chat: self.chat.clone(),
            db: self.db.clone(),
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                call_timeout: Duration::from_secs(5),
            },
        }
    }

    pub fn linked_account(&self, email: &str, conversation_id: ConversationId) -> AccountIntegration {
        self.db
            .upsert_integration(
                email,
                conversation_id,
                &Credentials {
                    access_token: "access".to_string(),
                    refresh_token: "refresh".to_string(),
                    expires_at: None,
                },
            )
            .expect("upsert integration")
    }

    pub fn active_account(
        &self,
        email: &str,
        conversation_id: ConversationId,
        cursor: &str,
    ) -> AccountIntegration {
        let account = self.linked_account(email, conversation_id);
        self.db
            .activate_watch(&account.id, cursor, Utc::now() + chrono::Duration::days(7))
            .expect("activate watch");
        self.db
            .get_integration(&account.id)
            .expect("load integration")
            .expect("integration exists")
    }
}
