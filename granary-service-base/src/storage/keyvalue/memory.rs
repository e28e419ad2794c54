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
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// In-memory key/value storage for tests and single-process local runs.
/// Expiry is evaluated lazily on access, mirroring how the remote store is
/// observed by its callers.
#[derive(Default)]
pub struct InMemoryKeyValueStorage {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKeyValueStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_live_entries<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>, Instant) -> T,
    ) -> T {
        let mut entries = self.entries.lock().expect("key value storage poisoned");
        let now = Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
        f(&mut entries, now)
    }
}

#[async_trait]
impl KeyValueStorage for InMemoryKeyValueStorage {
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KeyValueError> {
        Ok(self.with_live_entries(|entries, now| {
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: Some(now + ttl),
                    },
                );
                true
            }
        }))
    }

    async fn incr(&self, key: &str) -> Result<i64, KeyValueError> {
        self.with_live_entries(|entries, _| match entries.get_mut(key) {
            Some(entry) => {
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| KeyValueError::Internal(format!("{key} is not an integer")))?;
                entry.value = (current + 1).to_string();
                Ok(current + 1)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        })
    }

    async fn decr(&self, key: &str) -> Result<i64, KeyValueError> {
        self.with_live_entries(|entries, _| match entries.get_mut(key) {
            Some(entry) => {
                let current: i64 = entry
                    .value
                    .parse()
                    .map_err(|_| KeyValueError::Internal(format!("{key} is not an integer")))?;
                entry.value = (current - 1).to_string();
                Ok(current - 1)
            }
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: "-1".to_string(),
                        expires_at: None,
                    },
                );
                Ok(-1)
            }
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueError> {
        Ok(self.with_live_entries(|entries, _| entries.get(key).map(|entry| entry.value.clone())))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), KeyValueError> {
        self.with_live_entries(|entries, now| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|ttl| now + ttl),
                },
            );
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KeyValueError> {
        self.with_live_entries(|entries, _| {
            entries.remove(key);
        });
        Ok(())
    }

    async fn touch(&self, key: &str, ttl: Duration) -> Result<(), KeyValueError> {
        self.with_live_entries(|entries, now| {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Some(now + ttl);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    async fn add_is_set_if_absent() {
        let storage = InMemoryKeyValueStorage::new();
        assert!(storage
            .add("lock", "running", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!storage
            .add("lock", "running", Duration::from_secs(60))
            .await
            .unwrap());
        storage.delete("lock").await.unwrap();
        assert!(storage
            .add("lock", "running", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[test]
    async fn expired_keys_vanish() {
        let storage = InMemoryKeyValueStorage::new();
        assert!(storage
            .add("lock", "running", Duration::from_millis(20))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(storage.get("lock").await.unwrap(), None);
        assert!(storage
            .add("lock", "running", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[test]
    async fn counters_start_from_zero() {
        let storage = InMemoryKeyValueStorage::new();
        assert_eq!(storage.incr("count").await.unwrap(), 1);
        assert_eq!(storage.incr("count").await.unwrap(), 2);
        assert_eq!(storage.decr("count").await.unwrap(), 1);
        assert_eq!(storage.decr("count").await.unwrap(), 0);
        assert_eq!(storage.decr("count").await.unwrap(), -1);
    }

    #[test]
    async fn touch_extends_ttl() {
        let storage = InMemoryKeyValueStorage::new();
        storage
            .set("key", "value", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        storage.touch("key", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            storage.get("key").await.unwrap(),
            Some("value".to_string())
        );
    }
}
