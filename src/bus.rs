use std::fmt;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::Notification;

/// Logical topics on the dispatch bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    /// Fresh dispatch of a pending notification.
    Request,
    /// Re-dispatch of a notification picked up by the retry scheduler.
    Retry,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Request => "notifications.request",
            Topic::Retry => "notifications.retry",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the bus. Carries the full notification as published; the
/// consumer acts on this snapshot, not on a fresh read. Delivery to the
/// consumer is at-least-once and carries no dedup token.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub topic: Topic,
    pub notification: Notification,
}

/// Producer half of the bus. Publish is fire-and-forget: a closed consumer
/// is logged, never surfaced to the caller.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Publisher {
    pub fn publish(&self, topic: Topic, notification: Notification) {
        let id = notification.id;
        debug!(notification_id = %id, topic = %topic, "Publishing dispatch request");

        if self.tx.send(Envelope { topic, notification }).is_err() {
            warn!(
                notification_id = %id,
                topic = %topic,
                "Dispatch consumer is gone, message dropped"
            );
        }
    }
}

/// Create the bus. Both topics share one ordered stream; the envelope carries
/// the topic tag for logging and consumer-side bookkeeping.
pub fn channel() -> (Publisher, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Publisher { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelType;
    use serde_json::Map;

    fn notification() -> Notification {
        Notification::new("user-1".to_string(), ChannelType::Email, None, Map::new(), None)
    }

    #[tokio::test]
    async fn test_publish_preserves_order_and_topic() {
        let (publisher, mut rx) = channel();

        let first = notification();
        let second = notification();
        publisher.publish(Topic::Request, first.clone());
        publisher.publish(Topic::Retry, second.clone());

        let a = rx.recv().await.unwrap();
        assert_eq!(a.topic, Topic::Request);
        assert_eq!(a.notification.id, first.id);

        let b = rx.recv().await.unwrap();
        assert_eq!(b.topic, Topic::Retry);
        assert_eq!(b.notification.id, second.id);
    }

    #[tokio::test]
    async fn test_publish_after_consumer_dropped_does_not_panic() {
        let (publisher, rx) = channel();
        drop(rx);
        publisher.publish(Topic::Request, notification());
    }
}
