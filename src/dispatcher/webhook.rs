use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::{log_attempt, record_failure, DeliveryError, Dispatcher};
use crate::models::{ChannelType, Notification, NotificationStatus, WebhookEndpoint};
use crate::store::Store;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Delivers WEBHOOK notifications: an HMAC-signed HTTP POST of the payload
/// to every active endpoint registered for the target user.
///
/// Fan-out is per endpoint with independently recorded outcomes; the single
/// status field on the notification ends up reflecting the last-processed
/// endpoint. Zero active endpoints is a configuration state, not a transient
/// fault: the notification goes FAILED without consuming a retry and without
/// a delivery log entry.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    store: Store,
}

/// base64(HMAC-SHA256(secret, payload)), the value carried in the
/// signature header.
pub fn sign_payload(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

impl WebhookDispatcher {
    pub fn new(store: Store) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
        }
    }

    async fn post_signed(
        &self,
        endpoint: &WebhookEndpoint,
        payload: &str,
    ) -> Result<(u16, String), DeliveryError> {
        let signature = sign_payload(payload, &endpoint.secret_key);

        debug!(
            url = %endpoint.url,
            endpoint_id = endpoint.id,
            payload_size_bytes = payload.len(),
            "Posting signed webhook"
        );

        let response = self
            .client
            .post(&endpoint.url)
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        let response_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(DeliveryError::Transport(format!(
                "webhook endpoint returned HTTP {}: {}",
                status, response_body
            )));
        }

        Ok((status.as_u16(), response_body))
    }
}

#[async_trait]
impl Dispatcher for WebhookDispatcher {
    fn channel(&self) -> ChannelType {
        ChannelType::Webhook
    }

    #[instrument(skip(self, notification), fields(
        channel = "webhook",
        notification_id = %notification.id,
        user_id = %notification.user_id,
    ))]
    async fn deliver(&self, notification: &mut Notification) {
        let endpoints = match self.store.active_endpoints(&notification.user_id).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!(error = %e, "Webhook endpoint lookup failed");
                let err = DeliveryError::Transport(e.to_string());
                record_failure(&self.store, notification, &err).await;
                return;
            }
        };

        if endpoints.is_empty() {
            warn!("No active webhook endpoints for user");
            // Configuration state, not a transient fault: no retry consumed,
            // no delivery log entry
            notification.status = NotificationStatus::Failed;
            notification.updated_at = Utc::now();
            if let Err(e) = self.store.update_notification(notification).await {
                error!(error = %e, "Failed to persist endpoint-less webhook failure");
            }
            return;
        }

        let payload = match serde_json::to_string(&notification.payload) {
            Ok(payload) => payload,
            Err(e) => {
                let err = DeliveryError::Transport(format!("payload serialization failed: {}", e));
                record_failure(&self.store, notification, &err).await;
                return;
            }
        };

        let start = Instant::now();
        let endpoint_count = endpoints.len();
        let mut success_count = 0;
        let mut failure_count = 0;

        for endpoint in &endpoints {
            match self.post_signed(endpoint, &payload).await {
                Ok((status_code, response_body)) => {
                    success_count += 1;
                    info!(
                        url = %endpoint.url,
                        endpoint_id = endpoint.id,
                        status_code = status_code,
                        "Webhook sent successfully"
                    );

                    let attempt = notification.retries + 1;
                    notification.mark_sent(Utc::now());
                    if let Err(e) = self.store.update_notification(notification).await {
                        error!(error = %e, "Failed to persist webhook delivery");
                    }
                    log_attempt(&self.store, notification, &response_body, status_code, attempt)
                        .await;
                }
                Err(e) => {
                    failure_count += 1;
                    warn!(
                        url = %endpoint.url,
                        endpoint_id = endpoint.id,
                        error = %e,
                        "Webhook delivery failed"
                    );
                    record_failure(&self.store, notification, &e).await;
                }
            }
        }

        info!(
            endpoints = endpoint_count,
            delivered = success_count,
            failed = failure_count,
            duration_ms = start.elapsed().as_millis(),
            "Webhook fan-out completed"
        );
    }
}
