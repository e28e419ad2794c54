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

//! End-to-end scheduler flows over the in-memory infrastructure: messages
//! travel through the real queue, and task bodies run through the real
//! registry.

use chrono::{NaiveDate, Utc};
use granary_common::model::{
    HptState, Integration, IntegrationId, OrganizationId, ProviderKind, SyncEventStatus,
};
use granary_service_base::queue::memory::InMemoryTaskQueue;
use granary_service_base::queue::{QueueName, TaskQueue};
use granary_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
use granary_service_base::storage::keyvalue::KeyValueStorage;
use granary_sync_service::config::SyncServiceConfig;
use granary_sync_service::import::warehouse::InMemoryWarehouseWriter;
use granary_sync_service::keys::ACTIVE_HIGH_PRIORITY_TASK_KEY;
use granary_sync_service::repo::organization::InMemoryOrganizationRepo;
use granary_sync_service::repo::sync_log::InMemorySyncLogRepo;
use granary_sync_service::repo::task::{InMemoryTaskRepo, NewHighPriorityTask, TaskRepo};
use granary_sync_service::service::Services;
use granary_sync_service::tasks::{names, TaskRegistry};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

test_r::enable!();

use test_r::test;

struct Harness {
    services: Arc<Services>,
    registry: TaskRegistry,
    storage: Arc<InMemoryKeyValueStorage>,
    queue: Arc<InMemoryTaskQueue>,
    organizations: Arc<InMemoryOrganizationRepo>,
    tasks: Arc<InMemoryTaskRepo>,
    sync_log: Arc<InMemorySyncLogRepo>,
}

fn harness() -> Harness {
    let storage = Arc::new(InMemoryKeyValueStorage::new());
    let queue = Arc::new(InMemoryTaskQueue::new());
    let organizations = Arc::new(InMemoryOrganizationRepo::new());
    let tasks = Arc::new(InMemoryTaskRepo::new());
    let sync_log = Arc::new(InMemorySyncLogRepo::new());

    let services = Arc::new(Services::from_parts(
        SyncServiceConfig::default(),
        storage.clone(),
        queue.clone(),
        organizations.clone(),
        tasks.clone(),
        Arc::new(granary_sync_service::repo::token::InMemoryTokenRepo::new()),
        sync_log.clone(),
        Arc::new(InMemoryWarehouseWriter::new()),
    ));
    let registry = TaskRegistry::new(services.clone());

    Harness {
        services,
        registry,
        storage,
        queue,
        organizations,
        tasks,
        sync_log,
    }
}

/// Integration whose provider credentials are incomplete: task bodies run
/// without reaching out to any provider API.
fn uncredentialed_integration(id: i64, org: i64) -> Integration {
    Integration {
        id: IntegrationId(id),
        organization_id: OrganizationId(org),
        provider: ProviderKind::Netsuite,
        settings: BTreeMap::new(),
        is_active: true,
    }
}

/// Executes queued `sync_organization` tasks the way a worker would. The
/// pipeline messages they fan out are drained but not executed so the test
/// never leaves the process.
async fn execute_org_syncs(harness: &Harness) -> (usize, usize) {
    let mut executed = 0;
    let mut pipelines = 0;
    while let Some(message) = harness
        .services
        .queue
        .dequeue(&[QueueName::OrgSync], Duration::ZERO)
        .await
        .unwrap()
    {
        if message.name == names::SYNC_ORGANIZATION {
            harness.registry.execute(&message).await.unwrap();
            executed += 1;
        } else {
            pipelines += 1;
        }
    }
    (executed, pipelines)
}

#[test]
async fn high_priority_task_travels_pending_running_done() {
    let h = harness();
    h.organizations
        .add_integration(uncredentialed_integration(1, 1));
    let task = h
        .tasks
        .create(&NewHighPriorityTask {
            integration_id: IntegrationId(1),
            provider: ProviderKind::Netsuite,
            since_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            until_date: None,
            selected_modules: vec!["accounts".to_string(), "vendors".to_string()],
        })
        .await
        .unwrap();
    assert_eq!(task.state(), HptState::Pending);

    // Dispatcher tick claims the task, writes the marker, enqueues the
    // worker message.
    h.services.hp_dispatcher.tick().await.unwrap();
    assert_eq!(
        h.storage
            .get(ACTIVE_HIGH_PRIORITY_TASK_KEY)
            .await
            .unwrap()
            .as_deref(),
        Some(task.id.to_string().as_str())
    );
    assert_eq!(
        h.tasks.get(task.id).await.unwrap().unwrap().state(),
        HptState::Running
    );

    // The worker executes the message.
    let message = h
        .services
        .queue
        .dequeue(&[QueueName::HighPriority], Duration::ZERO)
        .await
        .unwrap()
        .expect("worker message enqueued");
    assert_eq!(message.name, names::PROCESS_HIGH_PRIORITY);
    h.registry.execute(&message).await.unwrap();

    // Terminal state: processed exactly once, marker cleared.
    let done = h.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(done.state(), HptState::Done);
    assert!(done.processed_at.is_some());
    assert!(!done.in_progress);
    assert_eq!(
        h.storage.get(ACTIVE_HIGH_PRIORITY_TASK_KEY).await.unwrap(),
        None
    );

    // Re-delivering the same message is a no-op on the row.
    h.registry.execute(&message).await.unwrap();
    let still_done = h.tasks.get(task.id).await.unwrap().unwrap();
    assert_eq!(still_done.processed_at, done.processed_at);
}

#[test]
async fn serial_lane_processes_tasks_one_at_a_time() {
    let h = harness();
    h.organizations
        .add_integration(uncredentialed_integration(1, 1));
    for _ in 0..2 {
        h.tasks
            .create(&NewHighPriorityTask {
                integration_id: IntegrationId(1),
                provider: ProviderKind::Netsuite,
                since_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                until_date: None,
                selected_modules: vec![],
            })
            .await
            .unwrap();
    }

    // First round: one task claimed, the second stays pending while the
    // marker is up.
    h.services.hp_dispatcher.tick().await.unwrap();
    h.storage
        .delete(granary_sync_service::keys::HIGH_PRIORITY_DISPATCHER_LOCK_KEY)
        .await
        .unwrap();
    h.services.hp_dispatcher.tick().await.unwrap();

    let worker_messages: Vec<_> = h
        .queue
        .drain_ready(QueueName::HighPriority)
        .into_iter()
        .filter(|m| m.name == names::PROCESS_HIGH_PRIORITY)
        .collect();
    assert_eq!(worker_messages.len(), 1);

    // Finish the first; the next tick dispatches the second.
    h.registry.execute(&worker_messages[0]).await.unwrap();
    h.storage
        .delete(granary_sync_service::keys::HIGH_PRIORITY_DISPATCHER_LOCK_KEY)
        .await
        .unwrap();
    h.services.hp_dispatcher.tick().await.unwrap();

    let second_round: Vec<_> = h
        .queue
        .drain_ready(QueueName::HighPriority)
        .into_iter()
        .filter(|m| m.name == names::PROCESS_HIGH_PRIORITY)
        .collect();
    assert_eq!(second_round.len(), 1);
}

#[test]
async fn organization_dispatch_round_trips_the_slot_counter() {
    let h = harness();
    let mut settings = BTreeMap::new();
    settings.insert("client_id".to_string(), "id".to_string());
    settings.insert("client_secret".to_string(), "secret".to_string());
    for org in 1..=3 {
        h.organizations.add_integration(Integration {
            id: IntegrationId(org),
            organization_id: OrganizationId(org),
            provider: ProviderKind::Xero,
            settings: settings.clone(),
            is_active: true,
        });
    }

    h.services.dispatcher.tick().await.unwrap();
    assert_eq!(h.services.slots.observed().await.unwrap(), 3);

    // Workers drain the org_sync queue; every sync task releases its slot
    // and fans out one pipeline per integration.
    let (executed, pipelines) = execute_org_syncs(&h).await;
    assert_eq!(executed, 3);
    assert_eq!(pipelines, 3);

    assert_eq!(h.services.slots.observed().await.unwrap(), 0);

    let org_events = h.sync_log.events_for(names::SYNC_ORGANIZATION);
    assert_eq!(org_events.len(), 3);
    assert!(org_events
        .iter()
        .all(|e| e.status == SyncEventStatus::Success));
}
