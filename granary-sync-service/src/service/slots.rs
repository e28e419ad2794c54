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

use crate::keys::IN_FLIGHT_ORG_SYNC_COUNT_KEY;
use granary_service_base::storage::keyvalue::{KeyValueError, KeyValueStorage};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The dispatch slot counter. A slot is reserved by the dispatcher before an
/// organization sync is enqueued and released by the worker when the sync
/// task exits; it therefore gates *dispatch*, not the per-integration
/// pipelines the sync task fans out to (those outlive the permit).
///
/// All call sites go through this type; monitors repair through it too. Any
/// value that is missing, non-numeric or negative is repaired to zero
/// without losing enqueued work.
#[derive(Clone)]
pub struct DispatchSlots {
    storage: Arc<dyn KeyValueStorage>,
    max: i64,
    counter_ttl: Duration,
}

impl DispatchSlots {
    pub fn new(storage: Arc<dyn KeyValueStorage>, max: i64, counter_ttl: Duration) -> Self {
        Self {
            storage,
            max,
            counter_ttl,
        }
    }

    pub fn max(&self) -> i64 {
        self.max
    }

    /// Current counter value, repaired to a sane state if needed, with its
    /// TTL refreshed.
    pub async fn observed(&self) -> Result<i64, KeyValueError> {
        match self.storage.get(IN_FLIGHT_ORG_SYNC_COUNT_KEY).await? {
            None => {
                info!("In-flight counter missing or expired, initializing to 0");
                self.repair().await?;
                Ok(0)
            }
            Some(raw) => match raw.parse::<i64>() {
                Ok(value) if value < 0 => {
                    warn!("In-flight counter was negative ({value}), resetting to 0");
                    self.repair().await?;
                    Ok(0)
                }
                Ok(value) => {
                    self.storage
                        .touch(IN_FLIGHT_ORG_SYNC_COUNT_KEY, self.counter_ttl)
                        .await?;
                    Ok(value)
                }
                Err(_) => {
                    warn!("In-flight counter held a non-numeric value ({raw}), resetting to 0");
                    self.repair().await?;
                    Ok(0)
                }
            },
        }
    }

    /// Reserves one slot unless the ceiling is reached. Re-reads the counter
    /// first so a tick never overshoots even if workers finished in between.
    pub async fn try_reserve(&self) -> Result<bool, KeyValueError> {
        let observed = self.observed().await?;
        if observed >= self.max {
            return Ok(false);
        }
        let value = self.storage.incr(IN_FLIGHT_ORG_SYNC_COUNT_KEY).await?;
        self.storage
            .touch(IN_FLIGHT_ORG_SYNC_COUNT_KEY, self.counter_ttl)
            .await?;
        crate::metrics::DISPATCH_SLOTS_IN_USE.set(value);
        Ok(true)
    }

    /// Releases one slot. The counter may already have been repaired or
    /// expired; a resulting negative value is clamped back to zero.
    pub async fn release(&self) -> Result<i64, KeyValueError> {
        let value = self.storage.decr(IN_FLIGHT_ORG_SYNC_COUNT_KEY).await?;
        self.storage
            .touch(IN_FLIGHT_ORG_SYNC_COUNT_KEY, self.counter_ttl)
            .await?;
        if value < 0 {
            warn!("In-flight counter went below zero ({value}) on release, resetting to 0");
            self.repair().await?;
            crate::metrics::DISPATCH_SLOTS_IN_USE.set(0);
            return Ok(0);
        }
        crate::metrics::DISPATCH_SLOTS_IN_USE.set(value);
        Ok(value)
    }

    pub async fn repair(&self) -> Result<(), KeyValueError> {
        self.storage
            .set(IN_FLIGHT_ORG_SYNC_COUNT_KEY, "0", Some(self.counter_ttl))
            .await
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use granary_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;

    fn slots(storage: Arc<dyn KeyValueStorage>) -> DispatchSlots {
        DispatchSlots::new(storage, 3, Duration::from_secs(3600))
    }

    #[test]
    async fn missing_counter_initializes_to_zero() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(InMemoryKeyValueStorage::new());
        let slots = slots(storage.clone());
        assert_eq!(slots.observed().await.unwrap(), 0);
        assert_eq!(
            storage
                .get(IN_FLIGHT_ORG_SYNC_COUNT_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("0")
        );
    }

    #[test]
    async fn reserve_stops_at_the_ceiling() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(InMemoryKeyValueStorage::new());
        let slots = slots(storage);
        for _ in 0..3 {
            assert!(slots.try_reserve().await.unwrap());
        }
        assert!(!slots.try_reserve().await.unwrap());
        assert_eq!(slots.observed().await.unwrap(), 3);
    }

    #[test]
    async fn release_clamps_negative_values() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(InMemoryKeyValueStorage::new());
        let slots = slots(storage);
        assert_eq!(slots.release().await.unwrap(), 0);
        assert_eq!(slots.observed().await.unwrap(), 0);
    }

    #[test]
    async fn non_numeric_counter_is_repaired() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(InMemoryKeyValueStorage::new());
        storage
            .set(IN_FLIGHT_ORG_SYNC_COUNT_KEY, "garbage", None)
            .await
            .unwrap();
        let slots = slots(storage);
        assert_eq!(slots.observed().await.unwrap(), 0);
        assert!(slots.try_reserve().await.unwrap());
        assert_eq!(slots.observed().await.unwrap(), 1);
    }

    #[test]
    async fn reserve_release_cycles_stay_in_range() {
        let storage: Arc<dyn KeyValueStorage> = Arc::new(InMemoryKeyValueStorage::new());
        let slots = slots(storage);
        for _ in 0..10 {
            let reserved = slots.try_reserve().await.unwrap();
            let observed = slots.observed().await.unwrap();
            assert!((0..=3).contains(&observed));
            if reserved {
                slots.release().await.unwrap();
            }
        }
    }
}
