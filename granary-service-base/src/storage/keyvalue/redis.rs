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

use super::{KeyValueError, KeyValueStorage};
use async_trait::async_trait;
use granary_common::config::RedisConfig;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;

#[derive(Clone)]
pub struct RedisKeyValueStorage {
    connection: ConnectionManager,
    key_prefix: String,
    operation_timeout: Duration,
}

impl RedisKeyValueStorage {
    pub async fn new(config: &RedisConfig) -> Result<Self, KeyValueError> {
        let client = redis::Client::open(config.url())
            .map_err(|e| KeyValueError::Internal(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| KeyValueError::Unavailable(e.to_string()))?;
        Ok(Self {
            connection,
            key_prefix: config.key_prefix.clone(),
            operation_timeout: config.operation_timeout,
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn bounded<T, F>(&self, op: &'static str, future: F) -> Result<T, KeyValueError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.operation_timeout, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) if error.is_io_error() || error.is_connection_dropped() => {
                Err(KeyValueError::Unavailable(format!("{op}: {error}")))
            }
            Ok(Err(error)) => Err(KeyValueError::Internal(format!("{op}: {error}"))),
            Err(_) => Err(KeyValueError::Unavailable(format!(
                "{op}: timed out after {:?}",
                self.operation_timeout
            ))),
        }
    }
}

#[async_trait]
impl KeyValueStorage for RedisKeyValueStorage {
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KeyValueError> {
        let mut connection = self.connection.clone();
        let key = self.prefixed(key);
        let reply: Option<String> = self
            .bounded("add", async {
                redis::cmd("SET")
                    .arg(&key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut connection)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, KeyValueError> {
        let mut connection = self.connection.clone();
        let key = self.prefixed(key);
        self.bounded("incr", async {
            redis::cmd("INCR").arg(&key).query_async(&mut connection).await
        })
        .await
    }

    async fn decr(&self, key: &str) -> Result<i64, KeyValueError> {
        let mut connection = self.connection.clone();
        let key = self.prefixed(key);
        self.bounded("decr", async {
            redis::cmd("DECR").arg(&key).query_async(&mut connection).await
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueError> {
        let mut connection = self.connection.clone();
        let key = self.prefixed(key);
        self.bounded("get", async {
            redis::cmd("GET").arg(&key).query_async(&mut connection).await
        })
        .await
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KeyValueError> {
        let mut connection = self.connection.clone();
        let key = self.prefixed(key);
        self.bounded("set", async {
            let mut cmd = redis::cmd("SET");
            cmd.arg(&key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl.as_millis() as u64);
            }
            cmd.query_async::<()>(&mut connection).await
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), KeyValueError> {
        let mut connection = self.connection.clone();
        let key = self.prefixed(key);
        self.bounded("delete", async {
            redis::cmd("DEL")
                .arg(&key)
                .query_async::<()>(&mut connection)
                .await
        })
        .await
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<(), KeyValueError> {
        let mut connection = self.connection.clone();
        let key = self.prefixed(key);
        self.bounded("touch", async {
            redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(ttl.as_millis() as u64)
                .query_async::<()>(&mut connection)
                .await
        })
        .await
    }
}
