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
use crate::keys::{ACTIVE_HIGH_PRIORITY_TASK_KEY, HIGH_PRIORITY_DISPATCHER_LOCK_KEY};
use crate::repo::sync_log::SyncLogRepo;
use crate::repo::task::TaskRepo;
use crate::service::dispatcher::DispatcherError;
use crate::tasks::names;
use chrono::Utc;
use granary_common::model::{SyncEventStatus, TaskId};
use granary_service_base::queue::{QueueName, TaskMessage, TaskQueue, PRIORITY_URGENT};
use granary_service_base::storage::keyvalue::KeyValueStorage;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Serializes user-initiated imports: at most one `process_high_priority`
/// task in flight across the whole deployment, the next pending task
/// dispatched as soon as the marker clears.
pub struct HighPriorityDispatcher {
    storage: Arc<dyn KeyValueStorage>,
    queue: Arc<dyn TaskQueue>,
    task_repo: Arc<dyn TaskRepo>,
    sync_log: Arc<dyn SyncLogRepo>,
    config: DispatchConfig,
}

impl HighPriorityDispatcher {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        queue: Arc<dyn TaskQueue>,
        task_repo: Arc<dyn TaskRepo>,
        sync_log: Arc<dyn SyncLogRepo>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            storage,
            queue,
            task_repo,
            sync_log,
            config,
        }
    }

    pub async fn tick(&self) -> Result<(), DispatcherError> {
        let lock_acquired = self
            .storage
            .add(
                HIGH_PRIORITY_DISPATCHER_LOCK_KEY,
                "running",
                self.config.dispatcher_lock_ttl,
            )
            .await?;
        if !lock_acquired {
            warn!("High priority dispatcher lock already held, skipping this tick");
            return Ok(());
        }

        let result = self.dispatch_next().await;

        if let Err(error) = &result {
            warn!("High priority dispatcher tick failed: {error}");
            let _ = self
                .sync_log
                .record(
                    names::HIGH_PRIORITY_DISPATCHER,
                    SyncEventStatus::Failed,
                    error.to_string(),
                )
                .await;
        }

        let _ = self.storage.delete(HIGH_PRIORITY_DISPATCHER_LOCK_KEY).await;
        self.requeue_self().await?;

        result.map(|_| ())
    }

    async fn requeue_self(&self) -> Result<(), DispatcherError> {
        self.queue
            .enqueue(
                TaskMessage::new(names::HIGH_PRIORITY_DISPATCHER, json!({}))
                    .on_queue(QueueName::HighPriority)
                    .with_countdown(self.config.tick_interval),
            )
            .await?;
        Ok(())
    }

    async fn dispatch_next(&self) -> Result<Option<TaskId>, DispatcherError> {
        if let Some(active) = self.storage.get(ACTIVE_HIGH_PRIORITY_TASK_KEY).await? {
            info!("High priority task {active} is still running, waiting");
            return Ok(None);
        }

        let Some(task) = self.task_repo.claim_next_pending(Utc::now()).await? else {
            info!("No high priority tasks found for processing");
            return Ok(None);
        };

        // The marker is written before the enqueue so a second tick between
        // the two steps cannot double-dispatch; if the enqueue fails the
        // marker expires or is cleared by the state monitor.
        self.storage
            .set(
                ACTIVE_HIGH_PRIORITY_TASK_KEY,
                &task.id.to_string(),
                Some(self.config.active_marker_ttl),
            )
            .await?;

        self.queue
            .enqueue(
                TaskMessage::new(
                    names::PROCESS_HIGH_PRIORITY,
                    json!({ "task_id": task.id }),
                )
                .on_queue(QueueName::HighPriority)
                .with_priority(PRIORITY_URGENT),
            )
            .await?;

        info!("High priority dispatcher sent task {} to the queue", task.id);
        Ok(Some(task.id))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::repo::sync_log::InMemorySyncLogRepo;
    use crate::repo::task::{InMemoryTaskRepo, NewHighPriorityTask};
    use chrono::NaiveDate;
    use granary_common::model::{HptState, IntegrationId, ProviderKind};
    use granary_service_base::queue::memory::InMemoryTaskQueue;
    use granary_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;

    struct Fixture {
        storage: Arc<InMemoryKeyValueStorage>,
        queue: Arc<InMemoryTaskQueue>,
        tasks: Arc<InMemoryTaskRepo>,
        dispatcher: HighPriorityDispatcher,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryKeyValueStorage::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let tasks = Arc::new(InMemoryTaskRepo::new());
        let sync_log = Arc::new(InMemorySyncLogRepo::new());
        let dispatcher = HighPriorityDispatcher::new(
            storage.clone(),
            queue.clone(),
            tasks.clone(),
            sync_log,
            DispatchConfig::default(),
        );
        Fixture {
            storage,
            queue,
            tasks,
            dispatcher,
        }
    }

    async fn pending_task(tasks: &InMemoryTaskRepo, modules: &[&str]) -> TaskId {
        tasks
            .create(&NewHighPriorityTask {
                integration_id: IntegrationId(1),
                provider: ProviderKind::Netsuite,
                since_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                until_date: None,
                selected_modules: modules.iter().map(|m| m.to_string()).collect(),
            })
            .await
            .unwrap()
            .id
    }

    async fn unlock(f: &Fixture) {
        f.storage
            .delete(HIGH_PRIORITY_DISPATCHER_LOCK_KEY)
            .await
            .unwrap();
    }

    #[test]
    async fn claims_marks_and_enqueues_a_pending_task() {
        let f = fixture();
        let id = pending_task(&f.tasks, &["accounts", "vendors"]).await;

        f.dispatcher.tick().await.unwrap();

        assert_eq!(
            f.storage
                .get(ACTIVE_HIGH_PRIORITY_TASK_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some(id.to_string().as_str())
        );

        let messages = f.queue.drain_ready(QueueName::HighPriority);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name, names::PROCESS_HIGH_PRIORITY);
        assert_eq!(messages[0].args["task_id"].as_i64(), Some(id.0));
        assert_eq!(messages[0].priority, PRIORITY_URGENT);

        let claimed = f.tasks.get(id).await.unwrap().unwrap();
        assert_eq!(claimed.state(), HptState::Running);
    }

    #[test]
    async fn second_tick_observes_the_marker_and_waits() {
        let f = fixture();
        let _first = pending_task(&f.tasks, &[]).await;
        let second = pending_task(&f.tasks, &[]).await;

        f.dispatcher.tick().await.unwrap();
        let _ = f.queue.drain_ready(QueueName::HighPriority);

        unlock(&f).await;
        f.dispatcher.tick().await.unwrap();

        // Nothing new was dispatched while the first task is running.
        let messages: Vec<_> = f
            .queue
            .drain_ready(QueueName::HighPriority)
            .into_iter()
            .filter(|m| m.name == names::PROCESS_HIGH_PRIORITY)
            .collect();
        assert!(messages.is_empty());
        assert_eq!(
            f.tasks.get(second).await.unwrap().unwrap().state(),
            HptState::Pending
        );
    }

    #[test]
    async fn next_pending_task_goes_out_after_the_marker_clears() {
        let f = fixture();
        let first = pending_task(&f.tasks, &[]).await;
        let second = pending_task(&f.tasks, &[]).await;

        f.dispatcher.tick().await.unwrap();
        let _ = f.queue.drain_ready(QueueName::HighPriority);

        // The worker finished the first task.
        f.tasks.mark_done(first, Utc::now()).await.unwrap();
        f.storage
            .delete(ACTIVE_HIGH_PRIORITY_TASK_KEY)
            .await
            .unwrap();

        unlock(&f).await;
        f.dispatcher.tick().await.unwrap();

        let messages: Vec<_> = f
            .queue
            .drain_ready(QueueName::HighPriority)
            .into_iter()
            .filter(|m| m.name == names::PROCESS_HIGH_PRIORITY)
            .collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].args["task_id"].as_i64(), Some(second.0));
    }

    #[test]
    async fn tick_with_no_pending_tasks_is_a_no_op() {
        let f = fixture();
        f.dispatcher.tick().await.unwrap();

        assert_eq!(
            f.storage.get(ACTIVE_HIGH_PRIORITY_TASK_KEY).await.unwrap(),
            None
        );
        assert!(f.queue.drain_ready(QueueName::HighPriority).is_empty());
    }
}
