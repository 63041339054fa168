use async_trait::async_trait;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{record_failure, record_success, resolve_content, DeliveryError, Dispatcher};
use crate::models::{ChannelType, Notification};
use crate::store::Store;

const RESEND_API_URL: &str = "https://api.resend.com/emails";

/// Delivers EMAIL notifications through the Resend HTTP API.
///
/// Requires payload fields `to`, `subject` and `body` (or a template in
/// place of `body`).
pub struct EmailDispatcher {
    client: reqwest::Client,
    store: Store,
    api_key: Option<String>,
    from: String,
}

#[derive(Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: Vec<&'a str>,
    subject: &'a str,
    html: &'a str,
}

impl EmailDispatcher {
    pub fn new(store: Store, api_key: Option<String>, from: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            api_key,
            from,
        }
    }

    async fn try_deliver(&self, notification: &Notification) -> Result<String, DeliveryError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(DeliveryError::ProviderNotConfigured("email"))?;

        let to = notification
            .payload_str("to")
            .ok_or(DeliveryError::MissingField("to"))?;
        let subject = notification
            .payload_str("subject")
            .ok_or(DeliveryError::MissingField("subject"))?;
        let body = resolve_content(&self.store, notification, "body").await?;

        let email = ResendEmail {
            from: &self.from,
            to: vec![to],
            subject,
            html: &body,
        };

        debug!(
            api_url = RESEND_API_URL,
            to = %to,
            subject = %subject,
            body_size_bytes = body.len(),
            "Sending request to Resend API"
        );

        let response = self
            .client
            .post(RESEND_API_URL)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&email)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        let response_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(DeliveryError::Transport(format!(
                "Resend API error (HTTP {}): {}",
                status, response_body
            )));
        }

        Ok(response_body)
    }
}

#[async_trait]
impl Dispatcher for EmailDispatcher {
    fn channel(&self) -> ChannelType {
        ChannelType::Email
    }

    #[instrument(skip(self, notification), fields(
        channel = "email",
        notification_id = %notification.id,
        user_id = %notification.user_id,
    ))]
    async fn deliver(&self, notification: &mut Notification) {
        let start = Instant::now();

        match self.try_deliver(notification).await {
            Ok(response) => {
                info!(
                    duration_ms = start.elapsed().as_millis(),
                    "Email sent successfully"
                );
                record_success(&self.store, notification, &response).await;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    duration_ms = start.elapsed().as_millis(),
                    "Email delivery failed"
                );
                record_failure(&self.store, notification, &e).await;
            }
        }
    }
}
