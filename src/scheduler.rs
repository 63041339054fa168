use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Publisher, Topic};
use crate::models::{Notification, NotificationStatus};
use crate::store::Store;

/// Retry eligibility policy: a fixed backoff table indexed by the current
/// retry count, clamped to its last entry, plus a hard attempt ceiling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff_secs: Vec<u64>,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(backoff_secs: Vec<u64>, max_attempts: u32) -> Self {
        assert!(!backoff_secs.is_empty(), "backoff table must not be empty");
        Self {
            backoff_secs,
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Seconds a notification with this retry count must wait after its last
    /// update before it can be retried. Counts beyond the table clamp to the
    /// last entry.
    pub fn backoff_for(&self, retries: u32) -> u64 {
        let idx = (retries as usize).min(self.backoff_secs.len() - 1);
        self.backoff_secs[idx]
    }

    /// Whether a FAILED notification may be republished now. Backoff is
    /// measured from `updated_at`: each failed attempt resets the clock.
    pub fn is_eligible(&self, notification: &Notification, now: DateTime<Utc>) -> bool {
        if notification.retries >= self.max_attempts {
            return false;
        }
        let elapsed = (now - notification.updated_at).num_seconds();
        elapsed >= self.backoff_for(notification.retries) as i64
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![60, 120, 300, 600, 1200], 5)
    }
}

/// One pass of the scheduled delivery trigger: publish every due PENDING
/// notification to the request topic, unchanged. Status stays PENDING until
/// a dispatcher acts on it, so a row can be selected again on the next pass.
pub async fn trigger_due_once(store: &Store, publisher: &Publisher, batch_limit: u32) -> Result<usize> {
    let now = Utc::now();
    let due = store.find_due_pending(now, batch_limit).await?;
    let count = due.len();

    if count > 0 {
        info!(count = count, "Publishing due notifications");
    } else {
        debug!("No due notifications");
    }

    for notification in due {
        publisher.publish(Topic::Request, notification);
    }

    Ok(count)
}

/// One pass of the retry scheduler: move eligible FAILED notifications to
/// RETRYING, persist, and republish them on the retry topic.
pub async fn retry_failed_once(
    store: &Store,
    publisher: &Publisher,
    policy: &RetryPolicy,
    batch_limit: u32,
) -> Result<usize> {
    let now = Utc::now();
    // Exhausted rows are filtered out by the query itself, so they never
    // consume batch slots
    let failed = store.find_failed(policy.max_attempts(), batch_limit).await?;
    let mut republished = 0;

    for mut notification in failed {
        if !policy.is_eligible(&notification, now) {
            continue;
        }

        if let Err(e) = notification.transition(NotificationStatus::Retrying, now) {
            warn!(notification_id = %notification.id, error = %e, "Skipping retry");
            continue;
        }

        if let Err(e) = store.update_notification(&mut notification).await {
            error!(
                notification_id = %notification.id,
                error = %e,
                "Failed to persist RETRYING transition, not republishing"
            );
            continue;
        }

        debug!(
            notification_id = %notification.id,
            retries = notification.retries,
            "Republishing failed notification"
        );
        publisher.publish(Topic::Retry, notification);
        republished += 1;
    }

    if republished > 0 {
        info!(count = republished, "Republished failed notifications for retry");
    }

    Ok(republished)
}

/// Periodic task wrapping `trigger_due_once`. Runs until cancelled; a failed
/// pass is logged and retried on the next tick.
pub async fn run_dispatch_trigger(
    store: Store,
    publisher: Publisher,
    period: Duration,
    batch_limit: u32,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    info!(period_secs = period.as_secs(), "Scheduled delivery trigger started");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Scheduled delivery trigger stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = trigger_due_once(&store, &publisher, batch_limit).await {
                    error!(error = %e, "Scheduled delivery pass failed, will retry next tick");
                }
            }
        }
    }
}

/// Periodic task wrapping `retry_failed_once`. Runs until cancelled.
pub async fn run_retry_scheduler(
    store: Store,
    publisher: Publisher,
    policy: RetryPolicy,
    period: Duration,
    batch_limit: u32,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    info!(
        period_secs = period.as_secs(),
        max_attempts = policy.max_attempts(),
        "Retry scheduler started"
    );

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                info!("Retry scheduler stopping");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = retry_failed_once(&store, &publisher, &policy, batch_limit).await {
                    error!(error = %e, "Retry pass failed, will retry next tick");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus;
    use crate::models::ChannelType;
    use serde_json::Map;

    fn notification() -> Notification {
        Notification::new(
            "user-1".to_string(),
            ChannelType::Email,
            None,
            Map::new(),
            None,
        )
    }

    fn failed_ago(retries: u32, secs_ago: i64) -> Notification {
        let mut n = notification();
        n.status = NotificationStatus::Failed;
        n.retries = retries;
        n.updated_at = Utc::now() - chrono::Duration::seconds(secs_ago);
        n
    }

    #[test]
    fn test_backoff_table_clamps_to_last_entry() {
        let policy = RetryPolicy::new(vec![60, 120, 300, 600, 1200], 10);
        assert_eq!(policy.backoff_for(0), 60);
        assert_eq!(policy.backoff_for(2), 300);
        assert_eq!(policy.backoff_for(4), 1200);
        assert_eq!(policy.backoff_for(9), 1200);
    }

    #[test]
    fn test_eligibility_scenario_six_minutes_after_second_retry() {
        // retries = 2, last update 6 minutes ago, table entry 300s: eligible
        let policy = RetryPolicy::new(vec![60, 120, 300, 600, 1200], 5);
        let n = failed_ago(2, 360);
        assert!(policy.is_eligible(&n, Utc::now()));
    }

    #[test]
    fn test_eligibility_respects_backoff_window() {
        let policy = RetryPolicy::new(vec![60, 120, 300, 600, 1200], 5);
        // Too soon: 30s elapsed, needs 60
        assert!(!policy.is_eligible(&failed_ago(0, 30), Utc::now()));
        // Exactly at the threshold counts as eligible
        assert!(policy.is_eligible(&failed_ago(0, 60), Utc::now()));
    }

    #[test]
    fn test_eligibility_stops_at_max_attempts() {
        let policy = RetryPolicy::new(vec![1], 3);
        assert!(policy.is_eligible(&failed_ago(2, 1000), Utc::now()));
        assert!(!policy.is_eligible(&failed_ago(3, 1000), Utc::now()));
        assert!(!policy.is_eligible(&failed_ago(10, 1000), Utc::now()));
    }

    #[tokio::test]
    async fn test_trigger_publishes_due_and_leaves_status_pending() {
        let store = Store::open_in_memory().unwrap();
        let (publisher, mut rx) = bus::channel();

        let due = notification();
        store.insert_notification(&due).await.unwrap();

        let mut future = notification();
        future.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.insert_notification(&future).await.unwrap();

        let count = trigger_due_once(&store, &publisher, 100).await.unwrap();
        assert_eq!(count, 1);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, Topic::Request);
        assert_eq!(envelope.notification.id, due.id);
        assert_eq!(envelope.notification.status, NotificationStatus::Pending);

        // Status unchanged in the store: a later pass may select it again
        let stored = store.find_notification(due.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Pending);
    }

    #[tokio::test]
    async fn test_retry_pass_transitions_and_republishes() {
        let store = Store::open_in_memory().unwrap();
        let (publisher, mut rx) = bus::channel();
        let policy = RetryPolicy::new(vec![1], 5);

        let eligible = failed_ago(1, 10);
        store.insert_notification(&eligible).await.unwrap();

        let count = retry_failed_once(&store, &publisher, &policy, 100)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.topic, Topic::Retry);
        assert_eq!(envelope.notification.status, NotificationStatus::Retrying);

        let stored = store.find_notification(eligible.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NotificationStatus::Retrying);
        assert_eq!(stored.retries, 1); // republish consumes no retry by itself
    }

    #[tokio::test]
    async fn test_exhausted_rows_do_not_consume_batch_slots() {
        let store = Store::open_in_memory().unwrap();
        let (publisher, mut rx) = bus::channel();
        let policy = RetryPolicy::new(vec![1], 3);

        // Exhausted rows are older, so a naive bounded query would fill the
        // whole batch with them and never reach the eligible one
        for _ in 0..3 {
            store.insert_notification(&failed_ago(3, 5000)).await.unwrap();
        }
        let eligible = failed_ago(1, 100);
        store.insert_notification(&eligible).await.unwrap();

        let count = retry_failed_once(&store, &publisher, &policy, 3)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.notification.id, eligible.id);
    }

    #[tokio::test]
    async fn test_retry_pass_skips_exhausted_and_recent() {
        let store = Store::open_in_memory().unwrap();
        let (publisher, mut rx) = bus::channel();
        let policy = RetryPolicy::new(vec![60], 3);

        // Exhausted
        store.insert_notification(&failed_ago(3, 1000)).await.unwrap();
        // Inside the backoff window
        store.insert_notification(&failed_ago(0, 5)).await.unwrap();

        let count = retry_failed_once(&store, &publisher, &policy, 100)
            .await
            .unwrap();
        assert_eq!(count, 0);
        assert!(rx.try_recv().is_err());
    }
}
