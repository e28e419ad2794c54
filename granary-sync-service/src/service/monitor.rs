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

use crate::config::MonitorConfig;
use crate::keys::ACTIVE_HIGH_PRIORITY_TASK_KEY;
use crate::repo::sync_log::SyncLogRepo;
use crate::repo::task::TaskRepo;
use crate::service::dispatcher::DispatcherError;
use crate::service::slots::DispatchSlots;
use crate::tasks::names;
use chrono::{Duration as ChronoDuration, Utc};
use granary_common::model::{SyncEventStatus, TaskId};
use granary_service_base::queue::{QueueName, TaskMessage, TaskQueue, PRIORITY_URGENT};
use granary_service_base::storage::keyvalue::KeyValueStorage;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Self-healing jobs that re-derive correct state when the shared state
/// store and the task store disagree. All of them are idempotent: running
/// them more often than scheduled produces duplicate detection logs at
/// worst, never duplicate work.
pub struct Monitors {
    storage: Arc<dyn KeyValueStorage>,
    queue: Arc<dyn TaskQueue>,
    task_repo: Arc<dyn TaskRepo>,
    sync_log: Arc<dyn SyncLogRepo>,
    slots: DispatchSlots,
    config: MonitorConfig,
}

impl Monitors {
    pub fn new(
        storage: Arc<dyn KeyValueStorage>,
        queue: Arc<dyn TaskQueue>,
        task_repo: Arc<dyn TaskRepo>,
        sync_log: Arc<dyn SyncLogRepo>,
        slots: DispatchSlots,
        config: MonitorConfig,
    ) -> Self {
        Self {
            storage,
            queue,
            task_repo,
            sync_log,
            slots,
            config,
        }
    }

    fn chrono(duration: std::time::Duration) -> ChronoDuration {
        ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
    }

    /// Finds pending high-priority tasks nobody picked up and re-dispatches
    /// them directly, bypassing the serial lane: a missed task means the
    /// lane itself lost it.
    pub async fn missed_high_priority_tasks(&self) -> Result<(), DispatcherError> {
        let threshold = Utc::now() - Self::chrono(self.config.missed_hpt_age);
        let missed = self.task_repo.missed(threshold).await?;
        if missed.is_empty() {
            return Ok(());
        }

        let count = missed.len();
        let ids: Vec<TaskId> = missed.iter().map(|t| t.id).collect();
        warn!("Found {count} high priority tasks that were never processed: {ids:?}");
        self.sync_log
            .record(
                names::MONITOR_MISSED_HPTS,
                SyncEventStatus::Detected,
                format!("Detected {count} missed high priority tasks: {ids:?}"),
            )
            .await?;

        let mut dispatched = 0usize;
        for task in missed {
            match self.redispatch(task.id).await {
                Ok(()) => dispatched += 1,
                Err(dispatch_error) => {
                    error!("Error dispatching missed task {}: {dispatch_error}", task.id)
                }
            }
        }

        self.sync_log
            .record(
                names::MONITOR_MISSED_HPTS,
                SyncEventStatus::Dispatched,
                format!("Dispatched {dispatched} out of {count} missed high priority tasks"),
            )
            .await?;
        Ok(())
    }

    /// Finds tasks that claim to be running but whose progress stamp went
    /// stale while the active marker points elsewhere, and re-dispatches
    /// them.
    pub async fn in_progress_not_dispatched(&self) -> Result<(), DispatcherError> {
        let threshold = Utc::now() - Self::chrono(self.config.hpt_stuck_threshold);
        let stuck = self.task_repo.in_progress_since_before(threshold).await?;
        if stuck.is_empty() {
            return Ok(());
        }

        let active_marker = self
            .storage
            .get(ACTIVE_HIGH_PRIORITY_TASK_KEY)
            .await?
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(TaskId);

        let abandoned: Vec<TaskId> = stuck
            .iter()
            .filter(|task| active_marker != Some(task.id))
            .map(|task| task.id)
            .collect();
        if abandoned.is_empty() {
            return Ok(());
        }

        self.sync_log
            .record(
                names::MONITOR_IN_PROGRESS_NOT_DISPATCHED,
                SyncEventStatus::Detected,
                format!(
                    "Detected {} in-progress tasks without a running worker: {abandoned:?}",
                    abandoned.len()
                ),
            )
            .await?;

        let mut dispatched = 0usize;
        for id in &abandoned {
            match self.redispatch(*id).await {
                Ok(()) => dispatched += 1,
                Err(dispatch_error) => {
                    error!("Error re-dispatching stuck task {id}: {dispatch_error}")
                }
            }
        }

        self.sync_log
            .record(
                names::MONITOR_IN_PROGRESS_NOT_DISPATCHED,
                SyncEventStatus::Dispatched,
                format!(
                    "Dispatched {dispatched} out of {} stuck in-progress tasks",
                    abandoned.len()
                ),
            )
            .await?;
        Ok(())
    }

    /// Detects the dispatch counter pinned at the ceiling while no
    /// organization sync has completed for a long window, and repairs it.
    pub async fn stuck_semaphores(&self) -> Result<(), DispatcherError> {
        let observed = self.slots.observed().await?;
        if observed < self.slots.max() {
            return Ok(());
        }

        let window_start = Utc::now() - Self::chrono(self.config.semaphore_stuck_window);
        let last_completion = self
            .sync_log
            .last_event(names::SYNC_ORGANIZATION, SyncEventStatus::Success)
            .await?;
        let recently_completed =
            matches!(&last_completion, Some(event) if event.timestamp > window_start);
        if recently_completed {
            return Ok(());
        }

        warn!(
            "Dispatch counter stuck at {observed} with no organization sync completed in {:?}, \
             resetting to 0",
            self.config.semaphore_stuck_window
        );
        self.slots.repair().await?;
        self.sync_log
            .record(
                names::MONITOR_STUCK_SEMAPHORES,
                SyncEventStatus::Warning,
                format!("Reset stuck in-flight counter from {observed} to 0"),
            )
            .await?;
        Ok(())
    }

    /// Reconciles the active high-priority task marker with task store
    /// truth: a marker pointing at a done or missing task is stale and gets
    /// cleared so the serial lane can move on.
    pub async fn comprehensive_state(&self) -> Result<(), DispatcherError> {
        let Some(raw) = self.storage.get(ACTIVE_HIGH_PRIORITY_TASK_KEY).await? else {
            return Ok(());
        };

        let stale_reason = match raw.parse::<i64>() {
            Err(_) => Some(format!("marker held a non-numeric value: {raw}")),
            Ok(id) => match self.task_repo.get(TaskId(id)).await? {
                None => Some(format!("task {id} no longer exists")),
                Some(task) if task.processed => Some(format!("task {id} is already done")),
                Some(_) => None,
            },
        };

        if let Some(reason) = stale_reason {
            info!("Clearing stale active high priority task marker: {reason}");
            self.storage.delete(ACTIVE_HIGH_PRIORITY_TASK_KEY).await?;
            self.sync_log
                .record(
                    names::COMPREHENSIVE_STATE_MONITOR,
                    SyncEventStatus::Detected,
                    format!("Cleared stale active task marker ({reason})"),
                )
                .await?;
        }
        Ok(())
    }

    async fn redispatch(&self, id: TaskId) -> Result<(), DispatcherError> {
        self.task_repo.set_in_progress_since(id, Utc::now()).await?;
        self.queue
            .enqueue(
                TaskMessage::new(names::PROCESS_HIGH_PRIORITY, json!({ "task_id": id }))
                    .on_queue(QueueName::HighPriority)
                    .with_priority(PRIORITY_URGENT),
            )
            .await?;
        info!("Monitor dispatched task {id} to the high priority queue");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::keys::IN_FLIGHT_ORG_SYNC_COUNT_KEY;
    use crate::repo::sync_log::InMemorySyncLogRepo;
    use crate::repo::task::{InMemoryTaskRepo, NewHighPriorityTask};
    use chrono::NaiveDate;
    use granary_common::model::{IntegrationId, ProviderKind};
    use granary_service_base::queue::memory::InMemoryTaskQueue;
    use granary_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use std::time::Duration;

    struct Fixture {
        storage: Arc<InMemoryKeyValueStorage>,
        queue: Arc<InMemoryTaskQueue>,
        tasks: Arc<InMemoryTaskRepo>,
        sync_log: Arc<InMemorySyncLogRepo>,
        monitors: Monitors,
    }

    fn fixture(config: MonitorConfig) -> Fixture {
        let storage = Arc::new(InMemoryKeyValueStorage::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let tasks = Arc::new(InMemoryTaskRepo::new());
        let sync_log = Arc::new(InMemorySyncLogRepo::new());
        let slots = DispatchSlots::new(storage.clone(), 3, Duration::from_secs(3600));
        let monitors = Monitors::new(
            storage.clone(),
            queue.clone(),
            tasks.clone(),
            sync_log.clone(),
            slots,
            config,
        );
        Fixture {
            storage,
            queue,
            tasks,
            sync_log,
            monitors,
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            missed_hpt_age: Duration::ZERO,
            hpt_stuck_threshold: Duration::ZERO,
            semaphore_stuck_window: Duration::from_secs(3600),
        }
    }

    async fn pending_task(tasks: &InMemoryTaskRepo) -> TaskId {
        tasks
            .create(&NewHighPriorityTask {
                integration_id: IntegrationId(1),
                provider: ProviderKind::Xero,
                since_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                until_date: None,
                selected_modules: vec![],
            })
            .await
            .unwrap()
            .id
    }

    #[test]
    async fn missed_task_is_detected_and_redispatched() {
        let f = fixture(fast_config());
        let id = pending_task(&f.tasks).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        f.monitors.missed_high_priority_tasks().await.unwrap();

        let messages = f.queue.drain_ready(QueueName::HighPriority);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].args["task_id"].as_i64(), Some(id.0));

        let task = f.tasks.get(id).await.unwrap().unwrap();
        assert!(task.in_progress_since.is_some());

        let events = f.sync_log.events_for(names::MONITOR_MISSED_HPTS);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, SyncEventStatus::Detected);
        assert_eq!(events[1].status, SyncEventStatus::Dispatched);
    }

    #[test]
    async fn running_and_done_tasks_are_not_missed() {
        let f = fixture(fast_config());
        let running = pending_task(&f.tasks).await;
        let done = pending_task(&f.tasks).await;
        f.tasks.mark_in_progress(running, Utc::now()).await.unwrap();
        f.tasks.mark_done(done, Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        f.monitors.missed_high_priority_tasks().await.unwrap();

        assert!(f.queue.drain_ready(QueueName::HighPriority).is_empty());
        assert!(f.sync_log.events_for(names::MONITOR_MISSED_HPTS).is_empty());
    }

    #[test]
    async fn in_progress_with_active_marker_is_left_alone() {
        let f = fixture(fast_config());
        let id = pending_task(&f.tasks).await;
        f.tasks.mark_in_progress(id, Utc::now()).await.unwrap();
        f.storage
            .set(
                ACTIVE_HIGH_PRIORITY_TASK_KEY,
                &id.to_string(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        f.monitors.in_progress_not_dispatched().await.unwrap();

        assert!(f.queue.drain_ready(QueueName::HighPriority).is_empty());
    }

    #[test]
    async fn abandoned_in_progress_task_is_redispatched() {
        let f = fixture(fast_config());
        let id = pending_task(&f.tasks).await;
        f.tasks.mark_in_progress(id, Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        f.monitors.in_progress_not_dispatched().await.unwrap();

        let messages = f.queue.drain_ready(QueueName::HighPriority);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].args["task_id"].as_i64(), Some(id.0));
    }

    #[test]
    async fn stuck_counter_is_reset_when_nothing_completes() {
        let f = fixture(fast_config());
        f.storage
            .set(IN_FLIGHT_ORG_SYNC_COUNT_KEY, "3", None)
            .await
            .unwrap();

        f.monitors.stuck_semaphores().await.unwrap();

        assert_eq!(
            f.storage
                .get(IN_FLIGHT_ORG_SYNC_COUNT_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("0")
        );
    }

    #[test]
    async fn counter_with_recent_completions_is_not_reset() {
        let f = fixture(fast_config());
        f.storage
            .set(IN_FLIGHT_ORG_SYNC_COUNT_KEY, "3", None)
            .await
            .unwrap();
        f.sync_log
            .record(
                names::SYNC_ORGANIZATION,
                SyncEventStatus::Success,
                "Organization 1 sync dispatch completed".to_string(),
            )
            .await
            .unwrap();

        f.monitors.stuck_semaphores().await.unwrap();

        assert_eq!(
            f.storage
                .get(IN_FLIGHT_ORG_SYNC_COUNT_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("3")
        );
    }

    #[test]
    async fn stale_marker_for_done_task_is_cleared() {
        let f = fixture(fast_config());
        let id = pending_task(&f.tasks).await;
        f.tasks.mark_done(id, Utc::now()).await.unwrap();
        f.storage
            .set(
                ACTIVE_HIGH_PRIORITY_TASK_KEY,
                &id.to_string(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        f.monitors.comprehensive_state().await.unwrap();

        assert_eq!(
            f.storage.get(ACTIVE_HIGH_PRIORITY_TASK_KEY).await.unwrap(),
            None
        );
    }

    #[test]
    async fn marker_for_running_task_is_kept() {
        let f = fixture(fast_config());
        let id = pending_task(&f.tasks).await;
        f.tasks.mark_in_progress(id, Utc::now()).await.unwrap();
        f.storage
            .set(
                ACTIVE_HIGH_PRIORITY_TASK_KEY,
                &id.to_string(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        f.monitors.comprehensive_state().await.unwrap();

        assert_eq!(
            f.storage
                .get(ACTIVE_HIGH_PRIORITY_TASK_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some(id.to_string().as_str())
        );
    }

    #[test]
    async fn running_the_missed_monitor_twice_does_not_double_dispatch() {
        let f = fixture(fast_config());
        let id = pending_task(&f.tasks).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        f.monitors.missed_high_priority_tasks().await.unwrap();
        let first: Vec<_> = f.queue.drain_ready(QueueName::HighPriority);
        assert_eq!(first.len(), 1);

        // The worker claimed the task in the meantime.
        f.tasks.mark_in_progress(id, Utc::now()).await.unwrap();

        f.monitors.missed_high_priority_tasks().await.unwrap();
        assert!(f.queue.drain_ready(QueueName::HighPriority).is_empty());
    }
}
