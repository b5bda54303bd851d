//! Redis result backend

use async_trait::async_trait;
use redis::aio::Connection;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{ChordBarrier, ResultBackend};
use crate::config::AppConfig;
use crate::error::{TaskError, TaskResult};
use crate::task::{TaskId, TaskMeta};

/// Redis key prefixes for stored state
const RESULT_KEY: &str = "tc:result";
const CHORD_KEY: &str = "tc:chord";

/// Writes a record unless that would replace a terminal state with a non-terminal one
const PUT_SCRIPT: &str = r"
local current = redis.call('HGET', KEYS[1], 'state')
if (current == 'SUCCESS' or current == 'FAILURE') and ARGV[3] == '0' then
  return 0
end
redis.call('HSET', KEYS[1], 'state', ARGV[1], 'meta', ARGV[2])
redis.call('EXPIRE', KEYS[1], ARGV[4])
return 1
";

/// Counts a member once and decrements the remaining counter
const DECREMENT_SCRIPT: &str = r"
if redis.call('SADD', KEYS[2], ARGV[1]) == 0 then
  return -1
end
redis.call('EXPIRE', KEYS[2], ARGV[2])
return redis.call('DECR', KEYS[1])
";

fn result_key(id: TaskId) -> String {
    format!("{}:{}", RESULT_KEY, id)
}

fn chord_key(id: TaskId) -> String {
    format!("{}:{}", CHORD_KEY, id)
}

fn remaining_key(id: TaskId) -> String {
    format!("{}:{}:remaining", CHORD_KEY, id)
}

fn counted_key(id: TaskId) -> String {
    format!("{}:{}:counted", CHORD_KEY, id)
}

fn settled_key(id: TaskId) -> String {
    format!("{}:{}:settled", CHORD_KEY, id)
}

/// Result backend storing one hash per invocation
#[derive(Debug)]
pub struct RedisBackend {
    client: Client,
    result_ttl: u64,
}

impl RedisBackend {
    /// Connect to the Redis server named in the configuration
    pub async fn new(config: &AppConfig) -> TaskResult<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| TaskError::backend("connect".to_string(), e.to_string()))?;
        let backend = Self::from_client(client, config);

        let mut conn = backend.get_connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| TaskError::backend("ping".to_string(), e.to_string()))?;

        info!("Result backend connected to Redis at {}", config.redis_url);
        Ok(backend)
    }

    /// Build a backend on an existing client without checking connectivity
    pub fn from_client(client: Client, config: &AppConfig) -> Self {
        Self {
            client,
            result_ttl: config.result_ttl,
        }
    }

    async fn get_connection(&self) -> TaskResult<Connection> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| TaskError::backend("get_connection".to_string(), e.to_string()))
    }

    fn decode(id: TaskId, raw: Option<String>) -> TaskResult<TaskMeta> {
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(TaskMeta::pending(id)),
        }
    }
}

#[async_trait]
impl ResultBackend for RedisBackend {
    async fn put_result(&self, meta: TaskMeta) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(&meta)?;
        let terminal = if meta.state.is_terminal() { "1" } else { "0" };

        let written: i64 = Script::new(PUT_SCRIPT)
            .key(result_key(meta.id))
            .arg(meta.state.as_str())
            .arg(json)
            .arg(terminal)
            .arg(self.result_ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("put_result".to_string(), e.to_string()))?;

        if written == 0 {
            debug!("Ignoring {} for terminal invocation {}", meta.state, meta.id);
        }
        Ok(())
    }

    async fn get_result(&self, id: TaskId) -> TaskResult<TaskMeta> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = redis::cmd("HGET")
            .arg(result_key(id))
            .arg("meta")
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("get_result".to_string(), e.to_string()))?;
        Self::decode(id, raw)
    }

    async fn get_results(&self, ids: &[TaskId]) -> TaskResult<Vec<TaskMeta>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.get_connection().await?;
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HGET").arg(result_key(*id)).arg("meta");
        }
        let raws: Vec<Option<String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("get_results".to_string(), e.to_string()))?;

        ids.iter()
            .zip(raws)
            .map(|(id, raw)| Self::decode(*id, raw))
            .collect()
    }

    async fn init_barrier(&self, barrier: &ChordBarrier) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        let json = serde_json::to_string(barrier)?;

        redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(chord_key(barrier.id))
            .arg(json)
            .arg("EX")
            .arg(self.result_ttl)
            .ignore()
            .cmd("SET")
            .arg(remaining_key(barrier.id))
            .arg(barrier.size())
            .arg("EX")
            .arg(self.result_ttl)
            .ignore()
            .cmd("DEL")
            .arg(counted_key(barrier.id))
            .arg(settled_key(barrier.id))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::backend("init_barrier".to_string(), e.to_string()))?;

        debug!("Initialized chord barrier {} with {} members", barrier.id, barrier.size());
        Ok(())
    }

    async fn decrement_barrier(&self, barrier_id: TaskId, member_id: TaskId) -> TaskResult<Option<u64>> {
        let mut conn = self.get_connection().await?;
        let remaining: i64 = Script::new(DECREMENT_SCRIPT)
            .key(remaining_key(barrier_id))
            .key(counted_key(barrier_id))
            .arg(member_id.to_string())
            .arg(self.result_ttl)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("decrement_barrier".to_string(), e.to_string()))?;

        if remaining < 0 {
            Ok(None)
        } else {
            Ok(Some(remaining as u64))
        }
    }

    async fn load_barrier(&self, barrier_id: TaskId) -> TaskResult<Option<ChordBarrier>> {
        let mut conn = self.get_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(chord_key(barrier_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("load_barrier".to_string(), e.to_string()))?;

        raw.map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(TaskError::from)
    }

    async fn barrier_unsettled(&self, barrier_id: TaskId) -> TaskResult<bool> {
        let mut conn = self.get_connection().await?;
        let (remaining, settled): (Option<i64>, bool) = redis::pipe()
            .cmd("GET")
            .arg(remaining_key(barrier_id))
            .cmd("EXISTS")
            .arg(settled_key(barrier_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| TaskError::backend("barrier_unsettled".to_string(), e.to_string()))?;

        Ok(remaining == Some(0) && !settled)
    }

    async fn settle_barrier(&self, barrier_id: TaskId) -> TaskResult<()> {
        let mut conn = self.get_connection().await?;
        redis::cmd("SET")
            .arg(settled_key(barrier_id))
            .arg(1)
            .arg("EX")
            .arg(self.result_ttl)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| TaskError::backend("settle_barrier".to_string(), e.to_string()))
    }
}
