use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{record_failure, record_success, resolve_content, DeliveryError, Dispatcher};
use crate::models::{ChannelType, Notification};
use crate::store::Store;

/// Twilio credentials, supplied through the environment. Absence is a
/// per-attempt delivery failure, never a startup failure.
#[derive(Debug, Clone)]
pub struct TwilioCredentials {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

/// Delivers SMS notifications through the Twilio REST API.
///
/// Requires payload fields `to` and `message` (or a template in place of
/// `message`). Short-circuits before any transport call when credentials
/// are unconfigured.
pub struct SmsDispatcher {
    client: reqwest::Client,
    store: Store,
    credentials: Option<TwilioCredentials>,
}

impl SmsDispatcher {
    pub fn new(store: Store, credentials: Option<TwilioCredentials>) -> Self {
        Self {
            client: reqwest::Client::new(),
            store,
            credentials,
        }
    }

    async fn try_deliver(&self, notification: &Notification) -> Result<String, DeliveryError> {
        // Fail fast: no credentials means no transport attempt at all
        let creds = self
            .credentials
            .as_ref()
            .ok_or(DeliveryError::ProviderNotConfigured("sms"))?;

        let to = notification
            .payload_str("to")
            .ok_or(DeliveryError::MissingField("to"))?;
        let message = resolve_content(&self.store, notification, "message").await?;

        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            creds.account_sid
        );
        let params = [
            ("From", creds.from_number.as_str()),
            ("To", to),
            ("Body", message.as_str()),
        ];

        debug!(
            to = %to,
            from = %creds.from_number,
            body_len = message.len(),
            "Sending SMS via Twilio"
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&creds.account_sid, Some(&creds.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        let response_body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(DeliveryError::Transport(format!(
                "Twilio API error (HTTP {}): {}",
                status, response_body
            )));
        }

        Ok(response_body)
    }
}

#[async_trait]
impl Dispatcher for SmsDispatcher {
    fn channel(&self) -> ChannelType {
        ChannelType::Sms
    }

    #[instrument(skip(self, notification), fields(
        channel = "sms",
        notification_id = %notification.id,
        user_id = %notification.user_id,
    ))]
    async fn deliver(&self, notification: &mut Notification) {
        let start = Instant::now();

        match self.try_deliver(notification).await {
            Ok(response) => {
                info!(
                    duration_ms = start.elapsed().as_millis(),
                    "SMS sent successfully"
                );
                record_success(&self.store, notification, &response).await;
            }
            Err(e) => {
                warn!(
                    error = %e,
                    duration_ms = start.elapsed().as_millis(),
                    "SMS delivery failed"
                );
                record_failure(&self.store, notification, &e).await;
            }
        }
    }
}
