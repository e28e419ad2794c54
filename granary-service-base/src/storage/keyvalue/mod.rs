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

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use granary_common::SafeDisplay;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyValueError {
    /// The store did not answer within the operation timeout, or the
    /// connection is down. Callers treat the current tick as a no-op.
    #[error("Shared state store unavailable: {0}")]
    Unavailable(String),
    #[error("Shared state store error: {0}")]
    Internal(String),
}

impl SafeDisplay for KeyValueError {
    fn to_safe_string(&self) -> String {
        self.to_string()
    }
}

/// Namespaced key/value store with string values and millisecond TTLs, used
/// for dispatcher locks, the dispatch slot counter, round-robin offsets and
/// the active high-priority task marker.
///
/// Every operation must fail fast: implementations bound each call by a
/// short timeout rather than blocking the caller.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Atomic set-if-absent. Returns `false` when the key already exists.
    async fn add(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KeyValueError>;

    /// Atomic increment; a missing key counts as zero.
    async fn incr(&self, key: &str) -> Result<i64, KeyValueError>;

    /// Atomic decrement; may go below zero, callers repair.
    async fn decr(&self, key: &str) -> Result<i64, KeyValueError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KeyValueError>;

    /// Unconditional set; `None` TTL means the key does not expire.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<(), KeyValueError>;

    async fn delete(&self, key: &str) -> Result<(), KeyValueError>;

    /// Extends the TTL of an existing key without changing its value.
    async fn touch(&self, key: &str, ttl: Duration) -> Result<(), KeyValueError>;
}
