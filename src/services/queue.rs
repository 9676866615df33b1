use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

const PENDING_KEY: &str = "photo_pipeline:uploads";
const MESSAGES_KEY: &str = "photo_pipeline:messages";
const VISIBILITY_KEY: &str = "photo_pipeline:visibility";
const DELIVERIES_KEY: &str = "photo_pipeline:deliveries";
const DEAD_LETTER_KEY: &str = "photo_pipeline:dead_letter";

/// Upper bound on messages moved by one reclaim pass.
const RECLAIM_BATCH: usize = 100;

/// A message handed to the worker. Dropping it without `ack` leaves it
/// in flight until its visibility deadline passes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Queue-assigned id, stable across redeliveries of the same enqueue.
    pub id: String,
    pub payload: String,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

/// At-least-once inbound queue.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Receive up to `max` messages, hiding each for the visibility timeout.
    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn ack(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Return in-flight messages whose deadline passed to the pending list,
    /// or dead-letter them once they hit the delivery limit. Returns how many
    /// messages were moved.
    async fn reclaim_expired(&self) -> Result<u64, QueueError>;

    /// Messages waiting to be received.
    async fn depth(&self) -> Result<u64, QueueError>;
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub visibility_timeout: Duration,
    pub max_deliveries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_deliveries: 5,
        }
    }
}

/// Lua scripts so that moving a message and recording its deadline happen together.
mod scripts {
    use redis::Script;

    /// Pop the next id, bump its delivery count and hide it until the deadline.
    pub fn receive() -> Script {
        Script::new(
            r#"
            local id = redis.call('RPOP', KEYS[1])
            if not id then
                return nil
            end

            local payload = redis.call('HGET', KEYS[2], id)
            if not payload then
                -- body already acked or dead-lettered
                redis.call('HDEL', KEYS[4], id)
                return {id}
            end

            local count = redis.call('HINCRBY', KEYS[4], id, 1)
            redis.call('ZADD', KEYS[3], ARGV[1], id)
            return {id, payload, tostring(count)}
            "#,
        )
    }

    /// Requeue or dead-letter every id whose deadline passed.
    pub fn reclaim() -> Script {
        Script::new(
            r#"
            local now = ARGV[1]
            local max_deliveries = tonumber(ARGV[2])
            local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'LIMIT', 0, tonumber(ARGV[3]))
            local requeued = 0
            local dead = 0

            for _, id in ipairs(ids) do
                redis.call('ZREM', KEYS[1], id)
                local deliveries = tonumber(redis.call('HGET', KEYS[2], id) or '0')
                if deliveries >= max_deliveries then
                    local payload = redis.call('HGET', KEYS[4], id)
                    if payload then
                        redis.call('LPUSH', KEYS[5], payload)
                    end
                    redis.call('HDEL', KEYS[2], id)
                    redis.call('HDEL', KEYS[4], id)
                    dead = dead + 1
                else
                    -- consuming end, so it is redelivered next
                    redis.call('RPUSH', KEYS[3], id)
                    requeued = requeued + 1
                end
            end

            return {requeued, dead}
            "#,
        )
    }
}

/// Redis-backed upload-event queue with visibility timeouts and a dead-letter list.
///
/// Each enqueue stores its payload in a hash under a fresh id and pushes the id
/// onto the pending list. In-flight ids live in a sorted set scored by their
/// visibility deadline, so byte-identical duplicates are tracked separately.
pub struct RedisQueue {
    client: redis::Client,
    settings: QueueSettings,
}

impl RedisQueue {
    pub fn new(redis_url: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client, settings })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }

    /// Store an upload event and put it on the pending list. Returns its id.
    pub async fn enqueue(&self, payload: &str) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .hset(MESSAGES_KEY, &id, payload)
            .ignore()
            .lpush(PENDING_KEY, &id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(id)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    pub async fn dead_letter_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(DEAD_LETTER_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    fn deadline(&self) -> i64 {
        let visibility = i64::try_from(self.settings.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        Utc::now().timestamp_millis().saturating_add(visibility)
    }
}

#[async_trait]
impl MessageSource for RedisQueue {
    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;
        let script = scripts::receive();
        let mut received = Vec::new();

        while received.len() < max {
            let popped: Option<Vec<String>> = script
                .key(PENDING_KEY)
                .key(MESSAGES_KEY)
                .key(VISIBILITY_KEY)
                .key(DELIVERIES_KEY)
                .arg(self.deadline())
                .invoke_async(&mut conn)
                .await
                .map_err(QueueError::Redis)?;

            let Some(fields) = popped else { break };
            let mut fields = fields.into_iter();
            let (Some(id), Some(payload), Some(count)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };

            received.push(ReceivedMessage {
                id,
                payload,
                delivery_count: count.parse().unwrap_or(1),
            });
        }

        Ok(received)
    }

    async fn ack(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::pipe()
            .atomic()
            .zrem(VISIBILITY_KEY, &message.id)
            .ignore()
            .hdel(DELIVERIES_KEY, &message.id)
            .ignore()
            .hdel(MESSAGES_KEY, &message.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn reclaim_expired(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let (requeued, dead): (u64, u64) = scripts::reclaim()
            .key(VISIBILITY_KEY)
            .key(DELIVERIES_KEY)
            .key(PENDING_KEY)
            .key(MESSAGES_KEY)
            .key(DEAD_LETTER_KEY)
            .arg(Utc::now().timestamp_millis())
            .arg(self.settings.max_deliveries)
            .arg(RECLAIM_BATCH)
            .invoke_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        if dead > 0 {
            tracing::warn!(dead_lettered = dead, "Messages exceeded max deliveries");
        }
        if requeued > 0 {
            tracing::debug!(requeued = requeued, "Visibility timeout expired, messages requeued");
        }
        Ok(requeued + dead)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(PENDING_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}
