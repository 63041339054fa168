use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Delivery channel for a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelType {
    Email,
    Sms,
    Push,
    InApp,
    Webhook,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Email => "EMAIL",
            ChannelType::Sms => "SMS",
            ChannelType::Push => "PUSH",
            ChannelType::InApp => "IN_APP",
            ChannelType::Webhook => "WEBHOOK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "EMAIL" => Some(ChannelType::Email),
            "SMS" => Some(ChannelType::Sms),
            "PUSH" => Some(ChannelType::Push),
            "IN_APP" | "INAPP" => Some(ChannelType::InApp),
            "WEBHOOK" => Some(ChannelType::Webhook),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a notification.
///
/// PENDING -> PROCESSING | SENT | FAILED
/// PROCESSING -> SENT | FAILED (reserved, not currently produced)
/// FAILED -> RETRYING
/// RETRYING -> SENT | FAILED
/// PENDING | FAILED | RETRYING -> CANCELLED
///
/// SENT and CANCELLED are terminal. Nothing transitions back to PENDING.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Retrying,
    Cancelled,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Processing => "PROCESSING",
            NotificationStatus::Sent => "SENT",
            NotificationStatus::Failed => "FAILED",
            NotificationStatus::Retrying => "RETRYING",
            NotificationStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(NotificationStatus::Pending),
            "PROCESSING" => Some(NotificationStatus::Processing),
            "SENT" => Some(NotificationStatus::Sent),
            "FAILED" => Some(NotificationStatus::Failed),
            "RETRYING" => Some(NotificationStatus::Retrying),
            "CANCELLED" => Some(NotificationStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Cancelled)
    }

    /// Whether moving from `self` to `to` follows a defined edge.
    pub fn can_transition(&self, to: NotificationStatus) -> bool {
        use NotificationStatus::*;
        match (self, to) {
            (Pending, Processing) | (Pending, Sent) | (Pending, Failed) => true,
            (Processing, Sent) | (Processing, Failed) => true,
            (Failed, Retrying) => true,
            (Retrying, Sent) | (Retrying, Failed) => true,
            (Pending, Cancelled) | (Failed, Cancelled) | (Retrying, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid status transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: NotificationStatus,
    pub to: NotificationStatus,
}

/// The unit of work: one message addressed to one user on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: String,
    pub channel: ChannelType,
    pub template_id: Option<i64>,
    pub payload: Map<String, Value>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub status: NotificationStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency stamp, bumped by the store on every successful
    /// update. A writer holding a stale version loses the write.
    pub version: i64,
}

impl Notification {
    pub fn new(
        user_id: String,
        channel: ChannelType,
        template_id: Option<i64>,
        payload: Map<String, Value>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            channel,
            template_id,
            payload,
            scheduled_at,
            status: NotificationStatus::Pending,
            sent_at: None,
            retries: 0,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    /// Record a successful delivery attempt. `sent_at` is set only once.
    pub fn mark_sent(&mut self, now: DateTime<Utc>) {
        self.status = NotificationStatus::Sent;
        if self.sent_at.is_none() {
            self.sent_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Record a failed delivery attempt and consume one retry from the budget.
    pub fn mark_failed(&mut self, now: DateTime<Utc>) {
        self.status = NotificationStatus::Failed;
        self.retries += 1;
        self.updated_at = now;
    }

    /// Edge-checked transition, used by the retry scheduler and cancellation.
    pub fn transition(
        &mut self,
        to: NotificationStatus,
        now: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition(to) {
            return Err(InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Append-only audit record of one delivery attempt.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryLog {
    pub id: i64,
    pub notification_id: Uuid,
    pub request_payload: String,
    pub response_payload: String,
    pub status_code: u16,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

/// Registered webhook target for a user. Read-only from the dispatch core.
#[derive(Debug, Clone)]
pub struct WebhookEndpoint {
    pub id: i64,
    pub user_id: String,
    pub url: String,
    pub secret_key: String,
    pub active: bool,
}

/// Stored message template, rendered against the notification payload.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: i64,
    pub name: String,
    pub channel: ChannelType,
    pub subject: Option<String>,
    pub body: String,
}
