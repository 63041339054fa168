use async_trait::async_trait;
use tracing::{info, instrument};

use super::{record_success, Dispatcher};
use crate::models::{ChannelType, Notification};
use crate::store::Store;

/// Delivers IN_APP notifications. There is no external transport: delivery
/// is the act of persisting the notification in the SENT state, where the
/// read API can pick it up. Still writes a delivery log entry so every
/// channel leaves the same audit trail.
pub struct InAppDispatcher {
    store: Store,
}

impl InAppDispatcher {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Dispatcher for InAppDispatcher {
    fn channel(&self) -> ChannelType {
        ChannelType::InApp
    }

    #[instrument(skip(self, notification), fields(
        channel = "in_app",
        notification_id = %notification.id,
        user_id = %notification.user_id,
    ))]
    async fn deliver(&self, notification: &mut Notification) {
        record_success(
            &self.store,
            notification,
            "In-app notification stored successfully",
        )
        .await;

        info!("In-app notification stored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationStatus;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_delivery_is_persistence() {
        let store = Store::open_in_memory().unwrap();
        let dispatcher = InAppDispatcher::new(store.clone());

        let mut payload = Map::new();
        payload.insert("body".to_string(), json!("Welcome aboard"));
        let mut n = Notification::new(
            "user-1".to_string(),
            ChannelType::InApp,
            None,
            payload,
            None,
        );
        store.insert_notification(&n).await.unwrap();

        dispatcher.deliver(&mut n).await;

        let stored = store.find_notification(n.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Sent);
        assert!(stored.sent_at.is_some());

        // Audit symmetry: a log entry even without a transport
        let logs = store.delivery_logs(n.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status_code, 200);
    }
}
