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

use crate::config::DispatchConfig;
use crate::keys::{DISPATCHER_LOCK_KEY, ORG_OFFSET_KEY};
use crate::metrics;
use crate::repo::organization::OrganizationRepo;
use crate::repo::sync_log::SyncLogRepo;
use crate::service::slots::DispatchSlots;
use crate::tasks::names;
use granary_common::model::{OrganizationId, SyncEventStatus};
use granary_service_base::queue::{QueueError, QueueName, TaskMessage, TaskQueue};
use granary_service_base::repo::RepoError;
use granary_service_base::storage::keyvalue::{KeyValueError, KeyValueStorage};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error(transparent)]
    SharedState(#[from] KeyValueError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Keeps up to the configured number of organization syncs dispatched,
/// round-robin over every organization that has an integration. One tick per
/// invocation; the tick re-enqueues itself.
pub struct StandardDispatcher {
    storage: Arc<dyn KeyValueStorage>,
    queue: Arc<dyn TaskQueue>,
    organization_repo: Arc<dyn OrganizationRepo>,
    sync_log: Arc<dyn SyncLogRepo>,
    slots: DispatchSlots,
    config: DispatchConfig,
}

impl StandardDispatcher {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        queue: Arc<dyn TaskQueue>,
        organization_repo: Arc<dyn OrganizationRepo>,
        sync_log: Arc<dyn SyncLogRepo>,
        slots: DispatchSlots,
        config: DispatchConfig,
    ) -> Self {
        Self {
            storage,
            queue,
            organization_repo,
            sync_log,
            slots,
            config,
        }
    }

    /// One dispatcher tick. Overlapping invocations collapse at the
    /// dispatcher lock; whatever happens inside, a tick that holds the lock
    /// releases it and schedules the next tick.
    pub async fn tick(&self) -> Result<(), DispatcherError> {
        let lock_acquired = self
            .storage
            .add(DISPATCHER_LOCK_KEY, "running", self.config.dispatcher_lock_ttl)
            .await?;
        if !lock_acquired {
            warn!("Dispatcher lock already held, skipping this tick");
            return Ok(());
        }

        let result = self.dispatch().await;

        if let Err(error) = &result {
            warn!("Dispatcher tick failed: {error}");
            let _ = self
                .sync_log
                .record(names::DISPATCHER, SyncEventStatus::Failed, error.to_string())
                .await;
        }

        let _ = self.storage.delete(DISPATCHER_LOCK_KEY).await;
        self.requeue_self().await?;

        result.map(|_| ())
    }

    async fn requeue_self(&self) -> Result<(), DispatcherError> {
        self.queue
            .enqueue(
                TaskMessage::new(names::DISPATCHER, json!({}))
                    .on_queue(QueueName::Default)
                    .with_countdown(self.config.tick_interval),
            )
            .await?;
        Ok(())
    }

    async fn dispatch(&self) -> Result<usize, DispatcherError> {
        let in_flight = self.slots.observed().await?;
        info!("Current in-flight organization syncs: {in_flight}");

        let slots_to_fill = self.slots.max() - in_flight;
        if slots_to_fill <= 0 {
            info!(
                "In-flight count ({in_flight}) meets or exceeds limit ({}), waiting",
                self.slots.max()
            );
            return Ok(0);
        }

        let organizations = self
            .organization_repo
            .organizations_with_integrations()
            .await?;
        if organizations.is_empty() {
            info!("No organizations found for dispatch");
            return Ok(0);
        }
        let total = organizations.len() as i64;

        let offset = self.read_offset(total).await?;
        let mut dispatched: i64 = 0;

        for _ in 0..slots_to_fill {
            // The counter is re-read inside the reservation so slots freed or
            // taken since the tick started are respected.
            if !self.slots.try_reserve().await? {
                info!("Dispatch limit reached, breaking dispatch loop");
                break;
            }

            let organization = organizations[((offset + dispatched) % total) as usize];
            self.enqueue_org_sync(organization).await?;
            metrics::ORG_SYNCS_DISPATCHED_TOTAL
                .with_label_values(&["dispatched"])
                .inc();
            dispatched += 1;
        }

        if dispatched > 0 {
            let new_offset = (offset + dispatched) % total;
            self.storage
                .set(ORG_OFFSET_KEY, &new_offset.to_string(), None)
                .await?;
            self.sync_log
                .record(
                    names::DISPATCHER,
                    SyncEventStatus::Dispatched,
                    format!("Dispatched {dispatched} org tasks. Offset now {new_offset}."),
                )
                .await?;
        } else {
            info!("No new organization tasks dispatched this tick");
        }

        Ok(dispatched as usize)
    }

    async fn read_offset(&self, total: i64) -> Result<i64, DispatcherError> {
        let offset = match self.storage.get(ORG_OFFSET_KEY).await? {
            Some(raw) => raw.parse::<i64>().unwrap_or(0),
            None => 0,
        };
        // The organization universe may have shrunk since the offset was
        // written.
        Ok(offset.rem_euclid(total))
    }

    async fn enqueue_org_sync(
        &self,
        organization_id: OrganizationId,
    ) -> Result<(), DispatcherError> {
        info!("Dispatching sync for organization {organization_id}");
        self.queue
            .enqueue(
                TaskMessage::new(
                    names::SYNC_ORGANIZATION,
                    json!({ "organization_id": organization_id }),
                )
                .on_queue(QueueName::OrgSync),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::keys::IN_FLIGHT_ORG_SYNC_COUNT_KEY;
    use crate::repo::organization::InMemoryOrganizationRepo;
    use crate::repo::sync_log::InMemorySyncLogRepo;
    use granary_common::model::{Integration, IntegrationId, ProviderKind};
    use granary_service_base::queue::memory::InMemoryTaskQueue;
    use granary_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct Fixture {
        storage: Arc<InMemoryKeyValueStorage>,
        queue: Arc<InMemoryTaskQueue>,
        organizations: Arc<InMemoryOrganizationRepo>,
        sync_log: Arc<InMemorySyncLogRepo>,
        dispatcher: StandardDispatcher,
        slots: DispatchSlots,
    }

    fn fixture(org_ids: &[i64]) -> Fixture {
        let storage = Arc::new(InMemoryKeyValueStorage::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let organizations = Arc::new(InMemoryOrganizationRepo::new());
        let sync_log = Arc::new(InMemorySyncLogRepo::new());

        for (i, org) in org_ids.iter().enumerate() {
            let mut settings = BTreeMap::new();
            settings.insert("client_id".to_string(), "id".to_string());
            settings.insert("client_secret".to_string(), "secret".to_string());
            organizations.add_integration(Integration {
                id: IntegrationId(i as i64 + 1),
                organization_id: OrganizationId(*org),
                provider: ProviderKind::Xero,
                settings,
                is_active: true,
            });
        }

        let config = DispatchConfig::default();
        let slots = DispatchSlots::new(
            storage.clone(),
            config.max_concurrent_org_syncs,
            config.counter_ttl,
        );
        let dispatcher = StandardDispatcher::new(
            storage.clone(),
            queue.clone(),
            organizations.clone(),
            sync_log.clone(),
            slots.clone(),
            config,
        );
        Fixture {
            storage,
            queue,
            organizations,
            sync_log,
            dispatcher,
            slots,
        }
    }

    fn dispatched_orgs(queue: &InMemoryTaskQueue) -> Vec<i64> {
        queue
            .drain_ready(QueueName::OrgSync)
            .into_iter()
            .filter(|m| m.name == names::SYNC_ORGANIZATION)
            .map(|m| m.args["organization_id"].as_i64().unwrap())
            .collect()
    }

    #[test]
    async fn first_tick_fills_every_slot_round_robin() {
        let f = fixture(&[1, 2, 3]);

        f.dispatcher.tick().await.unwrap();

        assert_eq!(dispatched_orgs(&f.queue), vec![1, 2, 3]);
        assert_eq!(f.slots.observed().await.unwrap(), 3);
        assert_eq!(
            f.storage.get(ORG_OFFSET_KEY).await.unwrap().as_deref(),
            Some("0")
        );

        let dispatched = f.sync_log.events_for(names::DISPATCHER);
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].status, SyncEventStatus::Dispatched);
    }

    #[test]
    async fn freed_slot_is_refilled_from_the_offset() {
        let f = fixture(&[1, 2, 3]);
        f.dispatcher.tick().await.unwrap();
        let _ = dispatched_orgs(&f.queue);

        // One sync finished and released its slot.
        f.slots.release().await.unwrap();

        // Make the next tick's lock available again.
        f.storage.delete(DISPATCHER_LOCK_KEY).await.unwrap();
        f.dispatcher.tick().await.unwrap();

        assert_eq!(dispatched_orgs(&f.queue), vec![1]);
        assert_eq!(f.slots.observed().await.unwrap(), 3);
        assert_eq!(
            f.storage.get(ORG_OFFSET_KEY).await.unwrap().as_deref(),
            Some("1")
        );
    }

    #[test]
    async fn no_organizations_means_no_counter_change() {
        let f = fixture(&[]);
        f.dispatcher.tick().await.unwrap();

        assert_eq!(dispatched_orgs(&f.queue), Vec::<i64>::new());
        assert_eq!(
            f.storage
                .get(IN_FLIGHT_ORG_SYNC_COUNT_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("0")
        );
        assert_eq!(f.storage.get(ORG_OFFSET_KEY).await.unwrap(), None);
    }

    #[test]
    async fn offset_is_modulated_when_the_universe_shrinks() {
        let f = fixture(&[1, 2]);
        f.storage
            .set(ORG_OFFSET_KEY, "5", None)
            .await
            .unwrap();

        f.dispatcher.tick().await.unwrap();

        // 5 mod 2 = 1, so dispatch starts at org 2.
        let orgs = dispatched_orgs(&f.queue);
        assert_eq!(orgs[0], 2);
    }

    #[test]
    async fn held_lock_short_circuits_the_tick() {
        let f = fixture(&[1, 2, 3]);
        f.storage
            .add(DISPATCHER_LOCK_KEY, "running", Duration::from_secs(60))
            .await
            .unwrap();

        f.dispatcher.tick().await.unwrap();

        assert_eq!(dispatched_orgs(&f.queue), Vec::<i64>::new());
        // No self re-queue either: the other tick owns the cycle.
        assert_eq!(f.queue.ready_len(QueueName::Default), 0);
        assert_eq!(f.queue.delayed_len(), 0);
    }

    #[test]
    async fn two_ticks_without_completions_dispatch_once() {
        let f = fixture(&[1, 2, 3]);
        f.dispatcher.tick().await.unwrap();
        f.storage.delete(DISPATCHER_LOCK_KEY).await.unwrap();
        f.dispatcher.tick().await.unwrap();

        assert_eq!(dispatched_orgs(&f.queue), vec![1, 2, 3]);
        assert_eq!(f.slots.observed().await.unwrap(), 3);
    }

    #[test]
    async fn counter_and_offset_advance_together() {
        let f = fixture(&[1, 2, 3, 4, 5]);

        f.dispatcher.tick().await.unwrap();

        // Three slots filled: counter +3, offset +3 (mod 5).
        assert_eq!(dispatched_orgs(&f.queue), vec![1, 2, 3]);
        assert_eq!(f.slots.observed().await.unwrap(), 3);
        assert_eq!(
            f.storage.get(ORG_OFFSET_KEY).await.unwrap().as_deref(),
            Some("3")
        );
    }

    #[test]
    async fn organizations_are_listed_in_stable_order() {
        let f = fixture(&[3, 1, 2]);
        let orgs = f
            .organizations
            .organizations_with_integrations()
            .await
            .unwrap();
        assert_eq!(
            orgs,
            vec![OrganizationId(1), OrganizationId(2), OrganizationId(3)]
        );
    }
}
