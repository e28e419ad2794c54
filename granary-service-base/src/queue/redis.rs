// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::{QueueError, QueueName, TaskMessage, TaskQueue};
use async_trait::async_trait;
use granary_common::config::RedisConfig;
use redis::aio::ConnectionManager;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Priority buckets, drained in this order. A message lands in the first
/// bucket whose threshold its priority reaches.
const BUCKETS: [(u8, &str); 3] = [(7, "p9"), (3, "p5"), (0, "p0")];

fn bucket_for(priority: u8) -> &'static str {
    for (threshold, bucket) in BUCKETS {
        if priority >= threshold {
            return bucket;
        }
    }
    BUCKETS[BUCKETS.len() - 1].1
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Redis-backed task queue: one list per (queue, priority bucket) popped
/// highest bucket first, plus a sorted set for messages with a countdown,
/// promoted into their list once due.
#[derive(Clone)]
pub struct RedisTaskQueue {
    connection: ConnectionManager,
    key_prefix: String,
}

impl RedisTaskQueue {
    pub async fn new(config: &RedisConfig) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(config.url()).map_err(|e| QueueError::Internal(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn list_key(&self, queue: QueueName, bucket: &str) -> String {
        format!("{}:queue:{}:{}", self.key_prefix, queue, bucket)
    }

    fn delayed_key(&self) -> String {
        format!("{}:queue:delayed", self.key_prefix)
    }

    /// Moves due delayed messages into their destination lists. Each member
    /// is claimed with ZREM first so concurrent workers promote it once.
    async fn promote_due(&self) -> Result<(), QueueError> {
        let mut connection = self.connection.clone();
        let delayed_key = self.delayed_key();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&delayed_key)
            .arg(0u64)
            .arg(now_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(100)
            .query_async(&mut connection)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        for raw in due {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&delayed_key)
                .arg(&raw)
                .query_async(&mut connection)
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
            if removed == 0 {
                continue;
            }
            match serde_json::from_str::<TaskMessage>(&raw) {
                Ok(message) => {
                    let key = self.list_key(message.queue, bucket_for(message.priority));
                    redis::cmd("LPUSH")
                        .arg(&key)
                        .arg(&raw)
                        .query_async::<()>(&mut connection)
                        .await
                        .map_err(|e| QueueError::Unavailable(e.to_string()))?;
                }
                Err(error) => {
                    warn!("Dropping undecodable delayed message: {error}");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(&self, message: TaskMessage) -> Result<(), QueueError> {
        let mut connection = self.connection.clone();
        let raw =
            serde_json::to_string(&message).map_err(|e| QueueError::Internal(e.to_string()))?;

        if message.countdown > Duration::ZERO {
            let due_at = now_millis() + message.countdown.as_millis() as u64;
            redis::cmd("ZADD")
                .arg(self.delayed_key())
                .arg(due_at)
                .arg(&raw)
                .query_async::<()>(&mut connection)
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        } else {
            let key = self.list_key(message.queue, bucket_for(message.priority));
            redis::cmd("LPUSH")
                .arg(&key)
                .arg(&raw)
                .query_async::<()>(&mut connection)
                .await
                .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    async fn dequeue(
        &self,
        queues: &[QueueName],
        wait: Duration,
    ) -> Result<Option<TaskMessage>, QueueError> {
        self.promote_due().await?;

        let mut connection = self.connection.clone();
        let mut keys = Vec::new();
        for queue in queues {
            for (_, bucket) in BUCKETS {
                keys.push(self.list_key(*queue, bucket));
            }
        }

        // A zero BRPOP timeout means "block forever"; clamp so the caller's
        // wait bound is honored.
        let timeout = wait.as_secs_f64().max(0.001);
        let reply: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(&keys)
            .arg(timeout)
            .query_async(&mut connection)
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;

        match reply {
            Some((_key, raw)) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| QueueError::Internal(format!("undecodable message: {e}"))),
            None => Ok(None),
        }
    }
}
