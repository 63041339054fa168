use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::{record_failure, record_success, DeliveryError, Dispatcher};
use crate::models::{ChannelType, Notification};
use crate::store::Store;

/// Delivers PUSH notifications. Requires payload fields `deviceToken`,
/// `title` and `body`.
///
/// The provider call is simulated: delivery is fire-and-forget and success
/// is assumed once the call returns.
// TODO: wire up the FCM HTTP v1 API once a service account is provisioned
pub struct PushDispatcher {
    store: Store,
}

impl PushDispatcher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    fn try_deliver(&self, notification: &Notification) -> Result<String, DeliveryError> {
        let device_token = notification
            .payload_str("deviceToken")
            .ok_or(DeliveryError::MissingField("deviceToken"))?;
        let title = notification
            .payload_str("title")
            .ok_or(DeliveryError::MissingField("title"))?;
        let _body = notification
            .payload_str("body")
            .ok_or(DeliveryError::MissingField("body"))?;

        info!(
            device_token = %device_token,
            title = %title,
            "Sending push notification"
        );

        Ok("Push notification sent successfully".to_string())
    }
}

#[async_trait]
impl Dispatcher for PushDispatcher {
    fn channel(&self) -> ChannelType {
        ChannelType::Push
    }

    #[instrument(skip(self, notification), fields(
        channel = "push",
        notification_id = %notification.id,
        user_id = %notification.user_id,
    ))]
    async fn deliver(&self, notification: &mut Notification) {
        match self.try_deliver(notification) {
            Ok(response) => {
                record_success(&self.store, notification, &response).await;
            }
            Err(e) => {
                warn!(error = %e, "Push delivery failed");
                record_failure(&self.store, notification, &e).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationStatus;
    use serde_json::{json, Map};

    fn push_payload() -> Map<String, serde_json::Value> {
        let mut payload = Map::new();
        payload.insert("deviceToken".to_string(), json!("token-123"));
        payload.insert("title".to_string(), json!("Ping"));
        payload.insert("body".to_string(), json!("You have mail"));
        payload
    }

    #[tokio::test]
    async fn test_successful_delivery_end_to_end() {
        let store = Store::open_in_memory().unwrap();
        let dispatcher = PushDispatcher::new(store.clone());

        let mut n = Notification::new(
            "user-1".to_string(),
            ChannelType::Push,
            None,
            push_payload(),
            None,
        );
        store.insert_notification(&n).await.unwrap();

        dispatcher.deliver(&mut n).await;

        let stored = store.find_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.sent_at.is_some());
        assert_eq!(stored.retries, 0);

        let logs = store.delivery_logs(n.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, 200);
        assert_eq!(logs[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_missing_device_token_fails() {
        let store = Store::open_in_memory().unwrap();
        let dispatcher = PushDispatcher::new(store.clone());

        let mut payload = push_payload();
        payload.remove("deviceToken");
        let mut n = Notification::new(
            "user-1".to_string(),
            ChannelType::Push,
            None,
            payload,
            None,
        );
        store.insert_notification(&n).await.unwrap();

        dispatcher.deliver(&mut n).await;

        let stored = store.find_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Failed);
        assert_eq!(stored.retries, 1);
        assert!(stored.sent_at.is_none());
    }
}
