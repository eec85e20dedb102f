use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use crate::models::{
    AccountIntegration, ConversationId, Credentials, ItemContext, PayloadKind, WatchState,
};

const INTEGRATION_COLUMNS: &str = "id, email, conversation_id, access_token, refresh_token, \
     token_expires_at, watch_active, watch_cursor, watch_expires_at, watch_last_updated, \
     created_at, updated_at";

const CONTEXT_COLUMNS: &str = "conversation_id, item_id, subject, originator, body, payload, \
     payload_kind, thread_id, message_id_header, created_at";

/// SQLite-backed store for integration records (with their watch watermark)
/// and reply contexts.
pub struct MailSyncDatabase {
    conn: Mutex<Connection>,
}

impl MailSyncDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS integrations (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                conversation_id INTEGER NOT NULL,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                token_expires_at TEXT,
                watch_active INTEGER NOT NULL DEFAULT 0,
                watch_cursor TEXT,
                watch_expires_at TEXT,
                watch_last_updated TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_integrations_conversation
             ON integrations(conversation_id)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS item_contexts (
                conversation_id INTEGER NOT NULL,
                item_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                originator TEXT NOT NULL,
                body TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_kind TEXT NOT NULL,
                thread_id TEXT,
                message_id_header TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (conversation_id, item_id)
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_item_contexts_created
             ON item_contexts(created_at)",
            [],
        )?;

        Ok(())
    }

    // ─── Integration records ──────────────────────────────────────────────────

    /// Insert or update the record for `email`. Existing watch state is kept;
    /// credentials and the linked conversation are replaced.
    pub fn upsert_integration(
        &self,
        email: &str,
        conversation_id: ConversationId,
        credentials: &Credentials,
    ) -> Result<AccountIntegration> {
        let now = Utc::now().to_rfc3339();
        let email = email.trim();
        {
            let conn = self.lock_conn()?;
            conn.execute(
                "INSERT INTO integrations
                    (id, email, conversation_id, access_token, refresh_token, token_expires_at,
                     watch_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)
                 ON CONFLICT(email) DO UPDATE SET
                    conversation_id = excluded.conversation_id,
                    access_token = excluded.access_token,
                    refresh_token = CASE WHEN excluded.refresh_token = ''
                                         THEN integrations.refresh_token
                                         ELSE excluded.refresh_token END,
                    token_expires_at = excluded.token_expires_at,
                    updated_at = excluded.updated_at",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    email,
                    conversation_id,
                    credentials.access_token,
                    credentials.refresh_token,
                    credentials.expires_at.map(|t| t.to_rfc3339()),
                    now,
                ],
            )?;
        }

        self.find_integration_by_email(email)?
            .ok_or_else(|| anyhow!("integration for {} vanished after upsert", email))
    }

    pub fn get_integration(&self, id: &str) -> Result<Option<AccountIntegration>> {
        self.query_integration(
            &format!("SELECT {} FROM integrations WHERE id = ?1", INTEGRATION_COLUMNS),
            params![id],
        )
    }

    pub fn find_integration_by_email(&self, email: &str) -> Result<Option<AccountIntegration>> {
        self.query_integration(
            &format!(
                "SELECT {} FROM integrations WHERE email = ?1 COLLATE NOCASE",
                INTEGRATION_COLUMNS
            ),
            params![email.trim()],
        )
    }

    /// Push events are only honoured for accounts with a live subscription.
    pub fn find_active_integration_by_email(
        &self,
        email: &str,
    ) -> Result<Option<AccountIntegration>> {
        self.query_integration(
            &format!(
                "SELECT {} FROM integrations WHERE email = ?1 COLLATE NOCASE AND watch_active = 1",
                INTEGRATION_COLUMNS
            ),
            params![email.trim()],
        )
    }

    pub fn find_integration_by_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<AccountIntegration>> {
        self.query_integration(
            &format!(
                "SELECT {} FROM integrations WHERE conversation_id = ?1
                 ORDER BY updated_at DESC LIMIT 1",
                INTEGRATION_COLUMNS
            ),
            params![conversation_id],
        )
    }

    pub fn list_active_integrations(&self) -> Result<Vec<AccountIntegration>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM integrations WHERE watch_active = 1 ORDER BY created_at, email",
            INTEGRATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map([], integration_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn query_integration(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<AccountIntegration>> {
        let conn = self.lock_conn()?;
        let record = conn
            .query_row(sql, params, integration_from_row)
            .optional()?;
        Ok(record)
    }

    /// Record a fresh (or renewed) subscription: active, new cursor, new expiry.
    pub fn activate_watch(
        &self,
        id: &str,
        cursor: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        if cursor.trim().is_empty() {
            return Err(anyhow!("refusing to activate watch for {} with empty cursor", id));
        }
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE integrations
             SET watch_active = 1, watch_cursor = ?2, watch_expires_at = ?3,
                 watch_last_updated = ?4, updated_at = ?4
             WHERE id = ?1",
            params![id, cursor, expires_at.to_rfc3339(), now],
        )?;
        require_updated(updated, id)
    }

    /// Move the watermark. Only the cursor and its timestamp change.
    pub fn advance_cursor(&self, id: &str, cursor: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE integrations
             SET watch_cursor = ?2, watch_last_updated = ?3, updated_at = ?3
             WHERE id = ?1",
            params![id, cursor, now],
        )?;
        require_updated(updated, id)
    }

    pub fn deactivate_watch(&self, id: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn()?;
        let updated = conn.execute(
            "UPDATE integrations
             SET watch_active = 0, watch_last_updated = ?2, updated_at = ?2
             WHERE id = ?1",
            params![id, now],
        )?;
        require_updated(updated, id)
    }

    pub fn update_access_token(
        &self,
        id: &str,
        access_token: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE integrations
             SET access_token = ?2, token_expires_at = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, access_token, expires_at.map(|t| t.to_rfc3339()), now],
        )?;
        Ok(())
    }

    pub fn delete_integration(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM integrations WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ─── Item contexts ────────────────────────────────────────────────────────

    /// Store `context`, replacing whatever was stored for its key.
    pub fn put_context(&self, context: &ItemContext) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO item_contexts ({})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                CONTEXT_COLUMNS
            ),
            params![
                context.conversation_id,
                context.item_id,
                context.subject,
                context.originator,
                context.body,
                context.payload,
                context.payload_kind.as_db_str(),
                context.thread_id,
                context.message_id_header,
                context.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_context(
        &self,
        conversation_id: ConversationId,
        item_id: &str,
    ) -> Result<Option<ItemContext>> {
        let conn = self.lock_conn()?;
        let context = conn
            .query_row(
                &format!(
                    "SELECT {} FROM item_contexts WHERE conversation_id = ?1 AND item_id = ?2",
                    CONTEXT_COLUMNS
                ),
                params![conversation_id, item_id],
                context_from_row,
            )
            .optional()?;
        Ok(context)
    }

    /// Returns whether a row was removed.
    pub fn delete_context(&self, conversation_id: ConversationId, item_id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM item_contexts WHERE conversation_id = ?1 AND item_id = ?2",
            params![conversation_id, item_id],
        )?;
        Ok(removed > 0)
    }

    pub fn delete_contexts_for_conversation(&self, conversation_id: ConversationId) -> Result<usize> {
        let conn = self.lock_conn()?;
        let removed = conn.execute(
            "DELETE FROM item_contexts WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        Ok(removed)
    }

    pub fn list_contexts_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(ConversationId, String)>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT conversation_id, item_id FROM item_contexts
             WHERE created_at < ?1 ORDER BY created_at",
        )?;
        let keys = stmt
            .query_map(params![cutoff.to_rfc3339()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn count_contexts(&self, conversation_id: ConversationId) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM item_contexts WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn require_updated(updated: usize, id: &str) -> Result<()> {
    if updated == 0 {
        Err(anyhow!("integration {} not found", id))
    } else {
        Ok(())
    }
}

fn integration_from_row(row: &Row<'_>) -> rusqlite::Result<AccountIntegration> {
    Ok(AccountIntegration {
        id: row.get(0)?,
        email: row.get(1)?,
        conversation_id: row.get(2)?,
        credentials: Credentials {
            access_token: row.get(3)?,
            refresh_token: row.get(4)?,
            expires_at: parse_optional_rfc3339(row.get(5)?, 5)?,
        },
        watch: WatchState {
            active: row.get::<_, i64>(6)? != 0,
            cursor: row
                .get::<_, Option<String>>(7)?
                .filter(|c| !c.trim().is_empty()),
            expires_at: parse_optional_rfc3339(row.get(8)?, 8)?,
            last_updated: parse_optional_rfc3339(row.get(9)?, 9)?,
        },
        created_at: parse_rfc3339(row.get(10)?, 10)?,
        updated_at: parse_rfc3339(row.get(11)?, 11)?,
    })
}

fn context_from_row(row: &Row<'_>) -> rusqlite::Result<ItemContext> {
    Ok(ItemContext {
        conversation_id: row.get(0)?,
        item_id: row.get(1)?,
        subject: row.get(2)?,
        originator: row.get(3)?,
        body: row.get(4)?,
        payload: row.get(5)?,
        payload_kind: PayloadKind::from_db(&row.get::<_, String>(6)?),
        thread_id: row.get(7)?,
        message_id_header: row.get(8)?,
        created_at: parse_rfc3339(row.get(9)?, 9)?,
    })
}

fn parse_rfc3339(raw: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn parse_optional_rfc3339(
    raw: Option<String>,
    column: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| parse_rfc3339(s, column))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MailItem;
    use chrono::Duration;

    fn credentials() -> Credentials {
        Credentials {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: None,
        }
    }

    fn item(id: &str) -> MailItem {
        MailItem {
            id: id.to_string(),
            thread_id: Some(format!("t-{}", id)),
            subject: "Quarterly numbers".to_string(),
            from: "Bob <bob@example.com>".to_string(),
            date: None,
            body: "Please review.".to_string(),
            snippet: "Please review.".to_string(),
            message_id_header: Some(format!("<{}@mail>", id)),
        }
    }

    #[test]
    fn watch_lifecycle_round_trips_through_sqlite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = MailSyncDatabase::new(dir.path().join("mailsync.db")).expect("db init");

        let account = db
            .upsert_integration("alice@example.com", 42, &credentials())
            .expect("upsert");
        assert!(!account.watch.active);
        assert!(db.list_active_integrations().unwrap().is_empty());

        let expires = Utc::now() + Duration::days(7);
        db.activate_watch(&account.id, "100", expires).expect("activate");
        let active = db
            .find_active_integration_by_email("ALICE@example.com")
            .unwrap()
            .expect("active account");
        assert_eq!(active.watch.cursor.as_deref(), Some("100"));
        assert!(active.watch.last_updated.is_some());

        db.advance_cursor(&account.id, "105").expect("advance");
        let advanced = db.get_integration(&account.id).unwrap().unwrap();
        assert_eq!(advanced.watch.cursor.as_deref(), Some("105"));
        assert!(advanced.watch.active);

        db.deactivate_watch(&account.id).expect("deactivate");
        assert!(db
            .find_active_integration_by_email("alice@example.com")
            .unwrap()
            .is_none());
        assert_eq!(
            db.get_integration(&account.id).unwrap().unwrap().watch.cursor.as_deref(),
            Some("105")
        );
    }

    #[test]
    fn activate_rejects_empty_cursor_and_unknown_ids() {
        let db = MailSyncDatabase::open_in_memory().unwrap();
        let account = db.upsert_integration("a@example.com", 1, &credentials()).unwrap();
        assert!(db.activate_watch(&account.id, " ", Utc::now()).is_err());
        assert!(db.advance_cursor("missing", "1").is_err());
    }

    #[test]
    fn relinking_keeps_watch_and_refresh_token() {
        let db = MailSyncDatabase::open_in_memory().unwrap();
        let first = db.upsert_integration("a@example.com", 1, &credentials()).unwrap();
        db.activate_watch(&first.id, "9", Utc::now() + Duration::days(1)).unwrap();

        let relinked = db
            .upsert_integration(
                "a@example.com",
                2,
                &Credentials {
                    access_token: "new".to_string(),
                    refresh_token: String::new(),
                    expires_at: None,
                },
            )
            .unwrap();

        assert_eq!(relinked.id, first.id);
        assert_eq!(relinked.conversation_id, 2);
        assert_eq!(relinked.credentials.access_token, "new");
        assert_eq!(relinked.credentials.refresh_token, "rt");
        assert!(relinked.watch.active);
        assert_eq!(
            db.find_integration_by_conversation(2).unwrap().map(|a| a.id),
            Some(first.id)
        );
    }

    #[test]
    fn email_case_does_not_create_a_second_record() {
        let db = MailSyncDatabase::open_in_memory().unwrap();
        let first = db.upsert_integration("alice@example.com", 1, &credentials()).unwrap();
        let again = db.upsert_integration("Alice@Example.com", 2, &credentials()).unwrap();

        assert_eq!(again.id, first.id);
        assert_eq!(again.conversation_id, 2);
        let rows: i64 = db
            .lock_conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM integrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn context_put_overwrites_instead_of_appending() {
        let db = MailSyncDatabase::open_in_memory().unwrap();
        let summary = ItemContext::from_item(42, &item("m1"), "summary".into(), PayloadKind::Summary);
        db.put_context(&summary).unwrap();
        db.put_context(&summary.with_payload("draft one".into(), PayloadKind::Draft))
            .unwrap();
        db.put_context(&summary.with_payload("draft two".into(), PayloadKind::Draft))
            .unwrap();

        assert_eq!(db.count_contexts(42).unwrap(), 1);
        let stored = db.get_context(42, "m1").unwrap().expect("context");
        assert_eq!(stored.payload, "draft two");
        assert_eq!(stored.payload_kind, PayloadKind::Draft);
        assert_eq!(stored.body, "Please review.");
        assert_eq!(stored.message_id_header.as_deref(), Some("<m1@mail>"));

        assert!(db.delete_context(42, "m1").unwrap());
        assert!(!db.delete_context(42, "m1").unwrap());
        assert!(db.get_context(42, "m1").unwrap().is_none());
    }

    #[test]
    fn contexts_are_scoped_per_conversation() {
        let db = MailSyncDatabase::open_in_memory().unwrap();
        db.put_context(&ItemContext::from_item(1, &item("m1"), "s".into(), PayloadKind::Summary))
            .unwrap();
        db.put_context(&ItemContext::from_item(2, &item("m1"), "s".into(), PayloadKind::Summary))
            .unwrap();
        db.put_context(&ItemContext::from_item(1, &item("m2"), "s".into(), PayloadKind::Summary))
            .unwrap();

        assert_eq!(db.delete_contexts_for_conversation(1).unwrap(), 2);
        assert!(db.get_context(2, "m1").unwrap().is_some());
    }

    #[test]
    fn old_contexts_are_listed_for_expiry() {
        let db = MailSyncDatabase::open_in_memory().unwrap();
        let mut stale = ItemContext::from_item(1, &item("old"), "s".into(), PayloadKind::Summary);
        stale.created_at = Utc::now() - Duration::hours(100);
        db.put_context(&stale).unwrap();
        db.put_context(&ItemContext::from_item(1, &item("new"), "s".into(), PayloadKind::Summary))
            .unwrap();

        let keys = db
            .list_contexts_created_before(Utc::now() - Duration::hours(72))
            .unwrap();
        assert_eq!(keys, vec![(1, "old".to_string())]);
    }
}
