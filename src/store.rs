use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::models::{
    ChannelType, DeliveryLog, Notification, NotificationStatus, Template, WebhookEndpoint,
};

/// Shared handle to the notification store. Cheap to clone; every scheduler,
/// dispatcher and the web dashboard hold one.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid {field} value in database: {value}")]
struct BadColumn {
    field: &'static str,
    value: String,
}

fn conv_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv_err(idx, e))
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    let id: String = row.get(0)?;
    let channel: String = row.get(2)?;
    let payload: String = row.get(4)?;
    let scheduled_at: Option<String> = row.get(5)?;
    let status: String = row.get(6)?;
    let sent_at: Option<String> = row.get(7)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok(Notification {
        id: Uuid::parse_str(&id).map_err(|e| conv_err(0, e))?,
        user_id: row.get(1)?,
        channel: ChannelType::parse(&channel).ok_or_else(|| {
            conv_err(2, BadColumn { field: "channel", value: channel.clone() })
        })?,
        template_id: row.get(3)?,
        payload: serde_json::from_str(&payload).map_err(|e| conv_err(4, e))?,
        scheduled_at: scheduled_at.as_deref().map(|s| parse_ts(5, s)).transpose()?,
        status: NotificationStatus::parse(&status).ok_or_else(|| {
            conv_err(6, BadColumn { field: "status", value: status.clone() })
        })?,
        sent_at: sent_at.as_deref().map(|s| parse_ts(7, s)).transpose()?,
        retries: row.get(8)?,
        created_at: parse_ts(9, &created_at)?,
        updated_at: parse_ts(10, &updated_at)?,
        version: row.get(11)?,
    })
}

const NOTIFICATION_COLUMNS: &str = "id, user_id, channel, template_id, payload, \
     scheduled_at, status, sent_at, retries, created_at, updated_at, version";

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open database")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.try_lock().expect("no other handle exists during init");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                template_id INTEGER,
                payload TEXT NOT NULL,
                scheduled_at TEXT,
                status TEXT NOT NULL,
                sent_at TEXT,
                retries INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_notifications_status
                ON notifications(status);
            CREATE INDEX IF NOT EXISTS idx_notifications_user
                ON notifications(user_id);

            CREATE TABLE IF NOT EXISTS delivery_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                notification_id TEXT NOT NULL,
                request_payload TEXT NOT NULL,
                response_payload TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                attempt INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_delivery_logs_notification
                ON delivery_logs(notification_id);

            CREATE TABLE IF NOT EXISTS webhook_endpoints (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                url TEXT NOT NULL,
                secret_key TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            );

            CREATE INDEX IF NOT EXISTS idx_webhook_endpoints_user
                ON webhook_endpoints(user_id);

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                channel TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    pub async fn insert_notification(&self, n: &Notification) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO notifications
                (id, user_id, channel, template_id, payload, scheduled_at,
                 status, sent_at, retries, created_at, updated_at, version)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                n.id.to_string(),
                n.user_id,
                n.channel.as_str(),
                n.template_id,
                serde_json::to_string(&n.payload)?,
                n.scheduled_at.map(|t| t.to_rfc3339()),
                n.status.as_str(),
                n.sent_at.map(|t| t.to_rfc3339()),
                n.retries,
                n.created_at.to_rfc3339(),
                n.updated_at.to_rfc3339(),
                n.version,
            ],
        )
        .context("Failed to insert notification")?;
        Ok(())
    }

    /// Persist the mutable fields of a notification after an attempt or a
    /// status transition. Identity fields never change after creation.
    ///
    /// Optimistic concurrency: the write only lands if the row still carries
    /// the version this snapshot was read at, and bumps it. A concurrent
    /// writer that got there first makes this call fail; the caller must drop
    /// its write rather than double-count the attempt.
    pub async fn update_notification(&self, n: &mut Notification) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn.execute(
            "UPDATE notifications
                SET status = ?, sent_at = ?, retries = ?, updated_at = ?,
                    version = version + 1
              WHERE id = ? AND version = ?",
            params![
                n.status.as_str(),
                n.sent_at.map(|t| t.to_rfc3339()),
                n.retries,
                n.updated_at.to_rfc3339(),
                n.id.to_string(),
                n.version,
            ],
        )
        .context("Failed to update notification")?;

        if updated == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT COUNT(*) FROM notifications WHERE id = ?",
                    [n.id.to_string()],
                    |row| row.get::<_, i64>(0),
                )
                .map(|count| count > 0)
                .context("Failed to check notification existence")?;
            if exists {
                anyhow::bail!("Notification {} was modified concurrently", n.id);
            }
            anyhow::bail!("Notification {} not found", n.id);
        }

        n.version += 1;
        Ok(())
    }

    pub async fn find_notification(&self, id: Uuid) -> Result<Option<Notification>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?"
        ))?;
        let mut rows = stmt.query_map([id.to_string()], notification_from_row)?;
        rows.next().transpose().context("Failed to read notification")
    }

    /// PENDING notifications whose scheduled time has arrived. A NULL
    /// scheduled_at counts as due immediately. Bounded query.
    pub async fn find_due_pending(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Notification>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
              WHERE status = 'PENDING'
                AND (scheduled_at IS NULL OR scheduled_at <= ?)
              ORDER BY created_at
              LIMIT ?"
        ))?;
        let rows = stmt
            .query_map(params![now.to_rfc3339(), limit], notification_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query due notifications")?;
        Ok(rows)
    }

    /// FAILED notifications with retry budget left, oldest first. Bounded
    /// query; the retry scheduler applies the backoff window on top of this
    /// set. Exhausted rows are excluded here so they can never occupy the
    /// batch: they stay FAILED forever and their `updated_at` never moves,
    /// which would otherwise pin them to the head of every batch and starve
    /// eligible retries behind them.
    pub async fn find_failed(&self, max_attempts: u32, limit: u32) -> Result<Vec<Notification>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
              WHERE status = 'FAILED' AND retries < ?
              ORDER BY updated_at
              LIMIT ?"
        ))?;
        let rows = stmt
            .query_map(params![max_attempts, limit], notification_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query failed notifications")?;
        Ok(rows)
    }

    /// Most recently updated notifications, for the dashboard.
    pub async fn recent_notifications(&self, limit: u32) -> Result<Vec<Notification>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications
              ORDER BY updated_at DESC
              LIMIT ?"
        ))?;
        let rows = stmt
            .query_map([limit], notification_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query recent notifications")?;
        Ok(rows)
    }

    pub async fn append_delivery_log(
        &self,
        notification_id: Uuid,
        request_payload: &str,
        response_payload: &str,
        status_code: u16,
        attempt: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO delivery_logs
                (notification_id, request_payload, response_payload,
                 status_code, attempt, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                notification_id.to_string(),
                request_payload,
                response_payload,
                status_code,
                attempt,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to append delivery log")?;
        Ok(())
    }

    pub async fn delivery_logs(&self, notification_id: Uuid) -> Result<Vec<DeliveryLog>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, notification_id, request_payload, response_payload,
                    status_code, attempt, created_at
               FROM delivery_logs
              WHERE notification_id = ?
              ORDER BY id",
        )?;
        let rows = stmt
            .query_map([notification_id.to_string()], |row| {
                let nid: String = row.get(1)?;
                let created_at: String = row.get(6)?;
                Ok(DeliveryLog {
                    id: row.get(0)?,
                    notification_id: Uuid::parse_str(&nid).map_err(|e| conv_err(1, e))?,
                    request_payload: row.get(2)?,
                    response_payload: row.get(3)?,
                    status_code: row.get(4)?,
                    attempt: row.get(5)?,
                    created_at: parse_ts(6, &created_at)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query delivery logs")?;
        Ok(rows)
    }

    pub async fn insert_endpoint(&self, user_id: &str, url: &str, secret_key: &str) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO webhook_endpoints (user_id, url, secret_key, active)
             VALUES (?, ?, ?, 1)",
            params![user_id, url, secret_key],
        )
        .context("Failed to insert webhook endpoint")?;
        Ok(conn.last_insert_rowid())
    }

    /// Active webhook endpoints for a user. Inactive rows are invisible to the
    /// dispatch core.
    pub async fn active_endpoints(&self, user_id: &str) -> Result<Vec<WebhookEndpoint>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, url, secret_key, active
               FROM webhook_endpoints
              WHERE user_id = ? AND active = 1
              ORDER BY id",
        )?;
        let rows = stmt
            .query_map([user_id], |row| {
                Ok(WebhookEndpoint {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    url: row.get(2)?,
                    secret_key: row.get(3)?,
                    active: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to query webhook endpoints")?;
        Ok(rows)
    }

    pub async fn insert_template(
        &self,
        name: &str,
        channel: ChannelType,
        subject: Option<&str>,
        body: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO templates (name, channel, subject, body) VALUES (?, ?, ?, ?)",
            params![name, channel.as_str(), subject, body],
        )
        .context("Failed to insert template")?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_template(&self, id: i64) -> Result<Option<Template>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, name, channel, subject, body FROM templates WHERE id = ?",
        )?;
        let mut rows = stmt.query_map([id], |row| {
            let channel: String = row.get(2)?;
            Ok(Template {
                id: row.get(0)?,
                name: row.get(1)?,
                channel: ChannelType::parse(&channel).ok_or_else(|| {
                    conv_err(2, BadColumn { field: "channel", value: channel.clone() })
                })?,
                subject: row.get(3)?,
                body: row.get(4)?,
            })
        })?;
        rows.next().transpose().context("Failed to read template")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn test_notification(channel: ChannelType) -> Notification {
        let mut payload = Map::new();
        payload.insert("to".to_string(), json!("a@b.com"));
        payload.insert("subject".to_string(), json!("Hi"));
        payload.insert("body".to_string(), json!("Hello"));
        Notification::new("user-1".to_string(), channel, None, payload, None)
    }

    #[tokio::test]
    async fn test_insert_and_find_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let n = test_notification(ChannelType::Email);
        store.insert_notification(&n).await.unwrap();

        let found = store.find_notification(n.id).await.unwrap().unwrap();
        assert_eq!(found.id, n.id);
        assert_eq!(found.user_id, "user-1");
        assert_eq!(found.channel, ChannelType::Email);
        assert_eq!(found.status, NotificationStatus::Pending);
        assert_eq!(found.payload_str("to"), Some("a@b.com"));
        assert_eq!(found.retries, 0);
        assert!(found.sent_at.is_none());
    }

    #[tokio::test]
    async fn test_find_missing_returns_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.find_notification(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_persists_attempt_outcome() {
        let store = Store::open_in_memory().unwrap();
        let mut n = test_notification(ChannelType::Sms);
        store.insert_notification(&n).await.unwrap();

        n.mark_failed(Utc::now());
        store.update_notification(&mut n).await.unwrap();

        let found = store.find_notification(n.id).await.unwrap().unwrap();
        assert_eq!(found.status, NotificationStatus::Failed);
        assert_eq!(found.retries, 1);
        assert_eq!(found.version, 1);
    }

    #[tokio::test]
    async fn test_update_unknown_notification_fails() {
        let store = Store::open_in_memory().unwrap();
        let mut n = test_notification(ChannelType::Push);
        assert!(store.update_notification(&mut n).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_update_loses_on_stale_version() {
        let store = Store::open_in_memory().unwrap();
        let n = test_notification(ChannelType::Email);
        store.insert_notification(&n).await.unwrap();

        // Two writers read the same snapshot
        let mut first = store.find_notification(n.id).await.unwrap().unwrap();
        let mut second = store.find_notification(n.id).await.unwrap().unwrap();

        first.mark_sent(Utc::now());
        store.update_notification(&mut first).await.unwrap();

        // The stale writer is rejected and the stored row keeps the winner's state
        second.mark_failed(Utc::now());
        let err = store.update_notification(&mut second).await.unwrap_err();
        assert!(err.to_string().contains("modified concurrently"));

        let stored = store.find_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert_eq!(stored.retries, 0);
    }

    #[tokio::test]
    async fn test_find_due_pending() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        // Unscheduled: due immediately
        let immediate = test_notification(ChannelType::Email);
        store.insert_notification(&immediate).await.unwrap();

        // Scheduled in the past: due
        let mut past = test_notification(ChannelType::Email);
        past.scheduled_at = Some(now - chrono::Duration::minutes(5));
        store.insert_notification(&past).await.unwrap();

        // Scheduled in the future: not due
        let mut future = test_notification(ChannelType::Email);
        future.scheduled_at = Some(now + chrono::Duration::hours(1));
        store.insert_notification(&future).await.unwrap();

        // Already sent: never selected regardless of schedule
        let mut sent = test_notification(ChannelType::Email);
        sent.mark_sent(now);
        store.insert_notification(&sent).await.unwrap();

        let due = store.find_due_pending(now, 100).await.unwrap();
        let ids: Vec<Uuid> = due.iter().map(|n| n.id).collect();
        assert_eq!(due.len(), 2);
        assert!(ids.contains(&immediate.id));
        assert!(ids.contains(&past.id));
    }

    #[tokio::test]
    async fn test_find_failed_is_bounded() {
        let store = Store::open_in_memory().unwrap();
        for _ in 0..5 {
            let mut n = test_notification(ChannelType::Webhook);
            n.mark_failed(Utc::now());
            store.insert_notification(&n).await.unwrap();
        }
        let pending = test_notification(ChannelType::Webhook);
        store.insert_notification(&pending).await.unwrap();

        let failed = store.find_failed(5, 3).await.unwrap();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|n| n.status == NotificationStatus::Failed));
    }

    #[tokio::test]
    async fn test_find_failed_excludes_exhausted() {
        let store = Store::open_in_memory().unwrap();

        // Older than the retryable row, but out of budget
        let mut exhausted = test_notification(ChannelType::Email);
        exhausted.status = NotificationStatus::Failed;
        exhausted.retries = 5;
        store.insert_notification(&exhausted).await.unwrap();

        let mut retryable = test_notification(ChannelType::Email);
        retryable.status = NotificationStatus::Failed;
        retryable.retries = 2;
        retryable.updated_at = exhausted.updated_at + chrono::Duration::seconds(10);
        store.insert_notification(&retryable).await.unwrap();

        let failed = store.find_failed(5, 100).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, retryable.id);
    }

    #[tokio::test]
    async fn test_delivery_log_append_order() {
        let store = Store::open_in_memory().unwrap();
        let n = test_notification(ChannelType::Email);
        store.insert_notification(&n).await.unwrap();

        store
            .append_delivery_log(n.id, "{}", "timeout", 500, 1)
            .await
            .unwrap();
        store
            .append_delivery_log(n.id, "{}", "ok", 200, 2)
            .await
            .unwrap();

        let logs = store.delivery_logs(n.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].attempt, 1);
        assert_eq!(logs[0].status_code, 500);
        assert_eq!(logs[1].attempt, 2);
        assert_eq!(logs[1].status_code, 200);
    }

    #[tokio::test]
    async fn test_active_endpoints_filters_by_user() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_endpoint("user-1", "https://a.example/hook", "s1")
            .await
            .unwrap();
        store
            .insert_endpoint("user-2", "https://b.example/hook", "s2")
            .await
            .unwrap();

        let endpoints = store.active_endpoints("user-1").await.unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].url, "https://a.example/hook");
        assert!(endpoints[0].active);

        assert!(store.active_endpoints("user-3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_template_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_template("welcome", ChannelType::Email, Some("Welcome!"), "Hello {{name}}")
            .await
            .unwrap();

        let template = store.get_template(id).await.unwrap().unwrap();
        assert_eq!(template.name, "welcome");
        assert_eq!(template.channel, ChannelType::Email);
        assert_eq!(template.body, "Hello {{name}}");

        assert!(store.get_template(id + 1).await.unwrap().is_none());
    }
}
