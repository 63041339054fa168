use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bus::Envelope;
use crate::dispatcher::DispatchRouter;

/// Drains the dispatch bus and routes each message synchronously.
///
/// The dispatcher boundary contains every delivery failure, so nothing a
/// single notification does can break this loop or block the ones behind it
/// beyond its own transport call.
pub async fn run_consumer(
    mut rx: UnboundedReceiver<Envelope>,
    router: Arc<DispatchRouter>,
    token: CancellationToken,
) {
    info!(dispatchers = router.len(), "Dispatch consumer started");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Dispatch consumer stopping");
                break;
            }
            envelope = rx.recv() => {
                let Some(envelope) = envelope else {
                    info!("Dispatch bus closed, consumer stopping");
                    break;
                };

                let mut notification = envelope.notification;
                info!(
                    notification_id = %notification.id,
                    topic = %envelope.topic,
                    channel = %notification.channel,
                    "Received dispatch request"
                );

                router.dispatch(&mut notification).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{self, Topic};
    use crate::dispatcher::{InAppDispatcher, SmsDispatcher};
    use crate::models::{ChannelType, Notification, NotificationStatus};
    use crate::store::Store;
    use serde_json::{json, Map};

    #[tokio::test]
    async fn test_consumer_processes_mixed_batch_with_isolation() {
        let store = Store::open_in_memory().unwrap();

        let mut router = DispatchRouter::new();
        router.register(Box::new(InAppDispatcher::new(store.clone())));
        router.register(Box::new(SmsDispatcher::new(store.clone(), None)));
        let router = Arc::new(router);

        let (publisher, rx) = bus::channel();

        // An SMS that will fail (no credentials) followed by an in-app that
        // must still go through
        let mut sms_payload = Map::new();
        sms_payload.insert("to".to_string(), json!("+4712345678"));
        sms_payload.insert("message".to_string(), json!("hi"));
        let sms = Notification::new(
            "user-1".to_string(),
            ChannelType::Sms,
            None,
            sms_payload,
            None,
        );
        store.insert_notification(&sms).await.unwrap();

        let in_app = Notification::new(
            "user-1".to_string(),
            ChannelType::InApp,
            None,
            Map::new(),
            None,
        );
        store.insert_notification(&in_app).await.unwrap();

        publisher.publish(Topic::Request, sms.clone());
        publisher.publish(Topic::Request, in_app.clone());

        let token = CancellationToken::new();
        drop(publisher); // close the bus so the consumer drains and exits
        run_consumer(rx, router, token).await;

        let sms_stored = store.find_notification(sms.id).await.unwrap().unwrap();
        assert_eq!(sms_stored.status, NotificationStatus::Failed);

        let in_app_stored = store.find_notification(in_app.id).await.unwrap().unwrap();
        assert_eq!(in_app_stored.status, NotificationStatus::Sent);
    }

    #[tokio::test]
    async fn test_consumer_stops_on_cancellation() {
        let store = Store::open_in_memory().unwrap();
        let router = Arc::new(DispatchRouter::new());
        let (_publisher, rx) = bus::channel();

        let token = CancellationToken::new();
        token.cancel();
        run_consumer(rx, router, token).await; // must return promptly
    }
}
