//! Best-effort fan-out of lifecycle events.
//!
//! `notify` never returns an error: delivery failures are retried on the
//! dispatcher's own small schedule, then logged and counted.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crate::models::message::NotificationEvent;

const NOTIFICATION_LIST_KEY: &str = "photo_pipeline:notifications";
const DEDUP_KEY_PREFIX: &str = "photo_pipeline:notify:";
const DEDUP_TTL_SECS: u64 = 86_400;

/// Outbound channel the dispatcher delivers to.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Deliver an event. `Ok(false)` means the channel had already seen this key.
    async fn publish(&self, key: &str, event: &NotificationEvent) -> Result<bool, NotifyError>;
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Notification channel unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// How many delivered keys to remember locally.
    pub dedup_capacity: usize,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
            dedup_capacity: 10_000,
        }
    }
}

#[derive(Default)]
struct DeliveredKeys {
    set: HashSet<String>,
    order: VecDeque<String>,
}

pub struct NotificationDispatcher {
    sink: Box<dyn NotificationSink>,
    settings: NotifySettings,
    delivered: Mutex<DeliveredKeys>,
}

impl NotificationDispatcher {
    pub fn new(sink: Box<dyn NotificationSink>, settings: NotifySettings) -> Self {
        Self {
            sink,
            settings,
            delivered: Mutex::new(DeliveredKeys::default()),
        }
    }

    pub async fn notify(&self, event: NotificationEvent) {
        let key = event.idempotency_key();
        if self.delivered.lock().set.contains(&key) {
            tracing::debug!(key = %key, "Notification already delivered, skipping");
            return;
        }

        let attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=attempts {
            match self.sink.publish(&key, &event).await {
                Ok(fresh) => {
                    self.remember(key.clone());
                    if fresh {
                        tracing::debug!(key = %key, "Notification delivered");
                    }
                    return;
                }
                Err(e) if attempt < attempts => {
                    tracing::debug!(key = %key, attempt = attempt, error = %e, "Notification delivery failed, retrying");
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => {
                    metrics::counter!("pipeline_notifications_failed_total").increment(1);
                    tracing::warn!(key = %key, attempts = attempts, error = %e, "Dropping notification");
                }
            }
        }
    }

    fn remember(&self, key: String) {
        let mut delivered = self.delivered.lock();
        if !delivered.set.insert(key.clone()) {
            return;
        }
        delivered.order.push_back(key);
        while delivered.order.len() > self.settings.dedup_capacity {
            if let Some(oldest) = delivered.order.pop_front() {
                delivered.set.remove(&oldest);
            }
        }
    }
}

/// Redis list used as the outbound fan-out channel.
pub struct RedisNotificationSink {
    client: redis::Client,
}

impl RedisNotificationSink {
    pub fn new(redis_url: &str) -> Result<Self, NotifyError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl NotificationSink for RedisNotificationSink {
    async fn publish(&self, key: &str, event: &NotificationEvent) -> Result<bool, NotifyError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let guard_key = format!("{}{}", DEDUP_KEY_PREFIX, key);

        // Cross-instance guard: only the first publisher of a key pushes.
        let claimed: Option<String> = redis::cmd("SET")
            .arg(&guard_key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            return Ok(false);
        }

        let payload = serde_json::to_string(event)?;
        if let Err(e) = conn.lpush::<_, _, ()>(NOTIFICATION_LIST_KEY, &payload).await {
            let _: Result<(), _> = conn.del(&guard_key).await;
            return Err(e.into());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        calls: Arc<AtomicU32>,
        failures_before_success: u32,
    }

    #[async_trait]
    impl NotificationSink for CountingSink {
        async fn publish(&self, _key: &str, _event: &NotificationEvent) -> Result<bool, NotifyError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_before_success {
                Err(NotifyError::Unavailable("down".to_string()))
            } else {
                Ok(true)
            }
        }
    }

    fn dispatcher(failures_before_success: u32) -> (NotificationDispatcher, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let sink = CountingSink {
            calls: calls.clone(),
            failures_before_success,
        };
        let settings = NotifySettings {
            retry_delay: Duration::from_millis(1),
            ..NotifySettings::default()
        };
        (NotificationDispatcher::new(Box::new(sink), settings), calls)
    }

    #[tokio::test]
    async fn test_duplicate_events_delivered_once() {
        let (dispatcher, calls) = dispatcher(0);
        dispatcher.notify(NotificationEvent::for_job("J1", None, "COMPLETED")).await;
        dispatcher.notify(NotificationEvent::for_job("J1", None, "COMPLETED")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let (dispatcher, calls) = dispatcher(2);
        dispatcher.notify(NotificationEvent::for_job("J1", None, "FAILED")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_delivery_is_swallowed_and_not_marked() {
        let (dispatcher, calls) = dispatcher(u32::MAX);
        dispatcher.notify(NotificationEvent::for_job("J1", None, "FAILED")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // not remembered, so a later notify tries again
        dispatcher.notify(NotificationEvent::for_job("J1", None, "FAILED")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_dedup_capacity_evicts_oldest() {
        let calls = Arc::new(AtomicU32::new(0));
        let sink = CountingSink {
            calls: calls.clone(),
            failures_before_success: 0,
        };
        let dispatcher = NotificationDispatcher::new(
            Box::new(sink),
            NotifySettings {
                dedup_capacity: 1,
                ..NotifySettings::default()
            },
        );
        dispatcher.notify(NotificationEvent::for_job("J1", None, "COMPLETED")).await;
        dispatcher.notify(NotificationEvent::for_job("J2", None, "COMPLETED")).await;
        dispatcher.notify(NotificationEvent::for_job("J1", None, "COMPLETED")).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
