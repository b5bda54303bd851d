//! Redis broker using the reliable-queue pattern

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::Connection;
use redis::{Client, Script};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Broker, Delivery};
use crate::config::AppConfig;
use crate::error::{TaskError, TaskResult};

/// Redis key prefixes for the transport
const QUEUE_KEY: &str = "tc:queue";
const PROCESSING_KEY: &str = "tc:processing";
const CLAIMED_KEY: &str = "tc:claimed";
const SCHEDULED_KEY: &str = "tc:scheduled";
const DEAD_KEY: &str = "tc:dead";

/// Moves every due member of a scheduled zset onto its queue in one step
const PROMOTE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, member in ipairs(due) do
  redis.call('ZREM', KEYS[1], member)
  redis.call('LPUSH', KEYS[2], member)
end
return #due
";

/// Requeues processing entries claimed before the cutoff
///
/// Entries without a claim time (the consumer died between BLMOVE and ZADD)
/// are stamped now and picked up on a later pass.
const REQUEUE_SCRIPT: &str = r"
local entries = redis.call('LRANGE', KEYS[1], 0, -1)
local requeued = 0
for _, member in ipairs(entries) do
  local claimed = redis.call('ZSCORE', KEYS[2], member)
  if not claimed then
    redis.call('ZADD', KEYS[2], ARGV[2], member)
  elseif tonumber(claimed) <= tonumber(ARGV[1]) then
    redis.call('LREM', KEYS[1], 1, member)
    redis.call('ZREM', KEYS[2], member)
    redis.call('RPUSH', KEYS[3], member)
    requeued = requeued + 1
  end
end
return requeued
";

fn queue_key(queue: &str) -> String {
    format!("{}:{}", QUEUE_KEY, queue)
}

fn processing_key(queue: &str) -> String {
    format!("{}:{}", PROCESSING_KEY, queue)
}

fn claimed_key(queue: &str) -> String {
    format!("{}:{}", CLAIMED_KEY, queue)
}

fn scheduled_key(queue: &str) -> String {
    format!("{}:{}", SCHEDULED_KEY, queue)
}

fn dead_key(queue: &str) -> String {
    format!("{}:{}", DEAD_KEY, queue)
}

/// Broker on Redis lists
///
/// Messages are pushed on the left of `tc:queue:<q>` and atomically moved to
/// `tc:processing:<q>` when consumed, where they stay until acknowledged.
/// The claim time of each processing entry is kept in the `tc:claimed:<q>`
/// zset so [`Broker::requeue_stale`] can return abandoned ones.
#[derive(Debug)]
pub struct RedisBroker {
    client: Client,
    dead_letter: bool,
    next_tag: AtomicU64,
}

impl RedisBroker {
    /// Connect to the Redis server named in the configuration
    pub async fn new(config: &AppConfig) -> TaskResult<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| TaskError::broker("connect".to_string(), e.to_string()))?;
        let broker = Self::from_client(client, config);

        let mut conn = broker.get_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::broker("ping".to_string(), e.to_string()))?;

        info!("Broker connected to Redis at {}", config.redis_url);
        Ok(broker)
    }

    /// Build a broker on an existing client without checking connectivity
    pub fn from_client(client: Client, config: &AppConfig) -> Self {
        Self {
            client,
            dead_letter: config.dead_letter,
            next_tag: AtomicU64::new(0),
        }
    }

    async fn get_connection(&self) -> TaskResult<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::broker("get_connection".to_string(), e.to_string()))
    }

    /// Number of messages waiting on `queue`
    pub async fn queue_len(&self, queue: &str) -> TaskResult<u64> {
        let mut conn = self.get_connection().await?;
        redis::cmd("LLEN")
            .arg(queue_key(queue))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::broker("queue_len".to_string(), e.to_string()))
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("LPUSH")
            .arg(queue_key(queue))
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::broker("publish".to_string(), e.to_string()))?;

        debug!("Published message to queue {}", queue);
        Ok(())
    }

    async fn schedule(&self, queue: &str, payload: Vec<u8>, eta: DateTime<Utc>) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("ZADD")
            .arg(scheduled_key(queue))
            .arg(eta.timestamp_millis())
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::broker("schedule".to_string(), e.to_string()))?;

        debug!("Scheduled message on queue {} for {}", queue, eta);
        Ok(())
    }

    async fn consume(&self, queue: &str, timeout: Duration) -> TaskResult<Option<Delivery>> {
        let mut conn = self.get_connection().await?;

        // BLMOVE treats 0 as "block forever"
        let seconds = timeout.as_secs_f64().max(0.001);
        let payload: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(queue_key(queue))
            .arg(processing_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::broker("consume".to_string(), e.to_string()))?;

        if let Some(payload) = &payload {
            redis::cmd("ZADD")
                .arg(claimed_key(queue))
                .arg(Utc::now().timestamp_millis())
                .arg(payload.as_slice())
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| TaskError::broker("consume".to_string(), e.to_string()))?;
        }

        Ok(payload.map(|payload| Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::SeqCst) + 1,
            queue: queue.to_string(),
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(processing_key(&delivery.queue))
            .arg(1)
            .arg(delivery.payload.as_slice())
            .ignore()
            .cmd("ZREM")
            .arg(claimed_key(&delivery.queue))
            .arg(delivery.payload.as_slice())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::broker("ack".to_string(), e.to_string()))
    }

    async fn nack(&self, delivery: &Delivery) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(processing_key(&delivery.queue))
            .arg(1)
            .arg(delivery.payload.as_slice())
            .ignore()
            .cmd("ZREM")
            .arg(claimed_key(&delivery.queue))
            .arg(delivery.payload.as_slice())
            .ignore()
            .cmd("RPUSH")
            .arg(queue_key(&delivery.queue))
            .arg(delivery.payload.as_slice())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::broker("nack".to_string(), e.to_string()))?;

        debug!("Requeued delivery {} on queue {}", delivery.tag, delivery.queue);
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LREM")
            .arg(processing_key(&delivery.queue))
            .arg(1)
            .arg(delivery.payload.as_slice())
            .ignore()
            .cmd("ZREM")
            .arg(claimed_key(&delivery.queue))
            .arg(delivery.payload.as_slice())
            .ignore();
        if self.dead_letter {
            pipe.cmd("LPUSH")
                .arg(dead_key(&delivery.queue))
                .arg(delivery.payload.as_slice())
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::broker("reject".to_string(), e.to_string()))?;

        warn!("Rejected delivery {} on queue {}", delivery.tag, delivery.queue);
        Ok(())
    }

    async fn promote_due(&self, queue: &str) -> TaskResult<u64> {
        let mut conn = self.get_connection().await?;
        let promoted: u64 = Script::new(PROMOTE_SCRIPT)
            .key(scheduled_key(queue))
            .key(queue_key(queue))
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TaskError::broker("promote_due".to_string(), e.to_string()))?;

        if promoted > 0 {
            info!("Promoted {} scheduled messages on queue {}", promoted, queue);
        }
        Ok(promoted)
    }

    async fn requeue_stale(&self, queue: &str, older_than: Duration) -> TaskResult<u64> {
        let mut conn = self.get_connection().await?;
        let now = Utc::now().timestamp_millis();
        let cutoff = now - older_than.as_millis() as i64;
        let requeued: u64 = Script::new(REQUEUE_SCRIPT)
            .key(processing_key(queue))
            .key(claimed_key(queue))
            .key(queue_key(queue))
            .arg(cutoff)
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TaskError::broker("requeue_stale".to_string(), e.to_string()))?;

        if requeued > 0 {
            warn!("Requeued {} unacknowledged deliveries on queue {}", requeued, queue);
        }
        Ok(requeued)
    }
}
