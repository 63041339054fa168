mod email;
mod in_app;
mod push;
mod sms;
mod webhook;

pub use email::EmailDispatcher;
pub use in_app::InAppDispatcher;
pub use push::PushDispatcher;
pub use sms::{SmsDispatcher, TwilioCredentials};
pub use webhook::WebhookDispatcher;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, warn};

use crate::models::{ChannelType, Notification};
use crate::store::Store;
use crate::template;

/// Why a single delivery attempt failed. Every variant is caught at the
/// dispatcher boundary and converted into a FAILED transition plus a
/// delivery log entry; none of them propagate to the consumer.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("missing payload field '{0}'")]
    MissingField(&'static str),

    #[error("{0} provider credentials not configured")]
    ProviderNotConfigured(&'static str),

    #[error("template error: {0}")]
    Template(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// One delivery channel. `deliver` performs exactly one attempt and records
/// the outcome itself; it never returns an error so that one malformed
/// notification cannot interrupt a batch.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// The fixed channel this dispatcher serves.
    fn channel(&self) -> ChannelType;

    /// Registration-time predicate: claims notifications of the fixed channel.
    fn supports(&self, notification: &Notification) -> bool {
        notification.channel == self.channel()
    }

    async fn deliver(&self, notification: &mut Notification);
}

/// Routes a notification to the dispatcher registered for its channel.
///
/// Resolved once at startup into a lookup table keyed by channel type, so a
/// second dispatcher claiming the same channel replaces the first (with a
/// warning) instead of silently shadowing it behind a registration order.
pub struct DispatchRouter {
    handlers: HashMap<ChannelType, Box<dyn Dispatcher>>,
}

impl DispatchRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, dispatcher: Box<dyn Dispatcher>) {
        let channel = dispatcher.channel();
        if self.handlers.insert(channel, dispatcher).is_some() {
            warn!(
                channel = %channel,
                "Replaced a previously registered dispatcher for this channel"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route one notification. A channel with no registered dispatcher is a
    /// configuration defect: logged, the notification is left unmodified and
    /// nothing is retried.
    pub async fn dispatch(&self, notification: &mut Notification) {
        match self.handlers.get(&notification.channel) {
            Some(dispatcher) if dispatcher.supports(notification) => {
                dispatcher.deliver(notification).await;
            }
            _ => {
                error!(
                    notification_id = %notification.id,
                    channel = %notification.channel,
                    "No dispatcher registered for channel, notification left unmodified"
                );
            }
        }
    }
}

impl Default for DispatchRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the message content for a notification: render the referenced
/// template against the payload when one is set, otherwise read the given
/// payload field directly.
pub(crate) async fn resolve_content(
    store: &Store,
    notification: &Notification,
    field: &'static str,
) -> Result<String, DeliveryError> {
    match notification.template_id {
        Some(template_id) => {
            let template = store
                .get_template(template_id)
                .await
                .map_err(|e| DeliveryError::Template(e.to_string()))?
                .ok_or_else(|| {
                    DeliveryError::Template(format!("template {} not found", template_id))
                })?;
            template::render(&template.body, &notification.payload)
                .map_err(|e| DeliveryError::Template(e.to_string()))
        }
        None => notification
            .payload_str(field)
            .map(str::to_string)
            .ok_or(DeliveryError::MissingField(field)),
    }
}

/// Append one delivery log entry. A log write failure cannot fail the
/// attempt, it is reported and swallowed here.
pub(crate) async fn log_attempt(
    store: &Store,
    notification: &Notification,
    response: &str,
    status_code: u16,
    attempt: u32,
) {
    let request_payload =
        serde_json::to_string(&notification.payload).unwrap_or_else(|_| "{}".to_string());

    if let Err(e) = store
        .append_delivery_log(
            notification.id,
            &request_payload,
            response,
            status_code,
            attempt,
        )
        .await
    {
        error!(
            notification_id = %notification.id,
            error = %e,
            "Failed to append delivery log entry"
        );
    }
}

/// Shared success path: SENT + sent-at + persist + audit entry.
pub(crate) async fn record_success(store: &Store, notification: &mut Notification, response: &str) {
    let attempt = notification.retries + 1;
    notification.mark_sent(Utc::now());

    if let Err(e) = store.update_notification(notification).await {
        error!(
            notification_id = %notification.id,
            error = %e,
            "Failed to persist successful delivery"
        );
    }

    log_attempt(store, notification, response, 200, attempt).await;
}

/// Shared failure path: FAILED + retry increment + persist + audit entry.
pub(crate) async fn record_failure(
    store: &Store,
    notification: &mut Notification,
    error: &DeliveryError,
) {
    notification.mark_failed(Utc::now());
    // retries now includes this attempt, so it doubles as the attempt number
    let attempt = notification.retries;

    if let Err(e) = store.update_notification(notification).await {
        error!(
            notification_id = %notification.id,
            error = %e,
            "Failed to persist failed delivery"
        );
    }

    log_attempt(store, notification, &error.to_string(), 500, attempt).await;
}
