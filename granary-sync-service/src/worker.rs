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

use crate::metrics;
use crate::service::Services;
use crate::tasks::{names, TaskRegistry};
use granary_common::model::{SyncEventStatus, WorkerRole};
use granary_service_base::queue::{QueueName, TaskMessage};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Tracks sections of work that must not be interrupted by graceful
/// shutdown. A high-priority import holds a guard for its whole execution
/// so a rolling deploy cannot kill a partially written import; an operator
/// who really wants it dead uses the non-catchable signal.
#[derive(Default)]
pub struct Interruptibility {
    uninterruptible: AtomicUsize,
}

impl Interruptibility {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uninterruptible_scope(self: &Arc<Self>, label: &str) -> UninterruptibleGuard {
        self.uninterruptible.fetch_add(1, Ordering::SeqCst);
        info!("Entering uninterruptible section: {label}");
        UninterruptibleGuard {
            owner: self.clone(),
            label: label.to_string(),
        }
    }

    pub fn is_uninterruptible(&self) -> bool {
        self.uninterruptible.load(Ordering::SeqCst) > 0
    }
}

pub struct UninterruptibleGuard {
    owner: Arc<Interruptibility>,
    label: String,
}

impl Drop for UninterruptibleGuard {
    fn drop(&mut self) {
        self.owner.uninterruptible.fetch_sub(1, Ordering::SeqCst);
        info!("Leaving uninterruptible section: {}", self.label);
    }
}

/// A single-task-at-a-time queue consumer (the fleet runs many of these
/// processes). The worker binds to the queues its role implies, kickstarts
/// its role's dispatcher on startup, and honors graceful shutdown between
/// tasks; the task in flight always runs to completion or its hard time
/// limit.
pub struct QueueWorker {
    services: Arc<Services>,
    registry: TaskRegistry,
    role: WorkerRole,
    shutdown: CancellationToken,
}

impl QueueWorker {
    pub fn new(services: Arc<Services>, shutdown: CancellationToken) -> Self {
        let role = services.config.worker.role;
        let registry = TaskRegistry::new(services.clone());
        Self {
            services,
            registry,
            role,
            shutdown,
        }
    }

    /// Queue bindings by role: a dedicated subset of workers serves only
    /// the high-priority queue.
    fn queues(&self) -> &'static [QueueName] {
        match self.role {
            WorkerRole::HighPriority => &[QueueName::HighPriority],
            WorkerRole::Standard => &[QueueName::OrgSync, QueueName::Default],
        }
    }

    async fn kickstart(&self) {
        let (task, queue) = match self.role {
            WorkerRole::HighPriority => {
                (names::HIGH_PRIORITY_DISPATCHER, QueueName::HighPriority)
            }
            WorkerRole::Standard => (names::DISPATCHER, QueueName::Default),
        };
        info!("Worker ready ({}), kickstarting {task}", self.role);
        let message = TaskMessage::new(task, json!({}))
            .on_queue(queue)
            .with_countdown(Duration::from_secs(5));
        if let Err(queue_error) = self.services.queue.enqueue(message).await {
            error!("Failed to kickstart {task}: {queue_error}");
        }
    }

    pub async fn run(&self) {
        self.kickstart().await;

        loop {
            if self.shutdown.is_cancelled() {
                info!("Worker shutting down");
                break;
            }

            let message = match self
                .services
                .queue
                .dequeue(self.queues(), Duration::from_secs(1))
                .await
            {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(queue_error) => {
                    warn!("Queue unavailable: {queue_error}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            self.execute(message).await;
        }
    }

    async fn execute(&self, message: TaskMessage) {
        let task_name = message.name.clone();
        info!("Executing task {task_name}");
        let timer = metrics::TASK_DURATION_SECONDS
            .with_label_values(&[&task_name])
            .start_timer();

        // Soft limit watchdog: logs without interrupting the task.
        let soft_limit = self.services.config.worker.soft_time_limit;
        let soft_watchdog = {
            let sync_log = self.services.sync_log.clone();
            let task_name = task_name.clone();
            tokio::spawn(async move {
                tokio::time::sleep(soft_limit).await;
                warn!("Task {task_name} exceeded its soft time limit ({soft_limit:?})");
                let _ = sync_log
                    .record(
                        &task_name,
                        SyncEventStatus::Failed,
                        format!("Soft time limit ({soft_limit:?}) exceeded"),
                    )
                    .await;
            })
        };

        let hard_limit = self.services.config.worker.hard_time_limit;
        let result =
            tokio::time::timeout(hard_limit, self.registry.execute(&message)).await;
        soft_watchdog.abort();
        timer.observe_duration();

        match result {
            Ok(Ok(())) => {
                metrics::TASKS_EXECUTED_TOTAL
                    .with_label_values(&[&task_name, "ok"])
                    .inc();
            }
            Ok(Err(task_error)) => {
                metrics::TASKS_EXECUTED_TOTAL
                    .with_label_values(&[&task_name, "error"])
                    .inc();
                error!("Task {task_name} failed: {task_error}");
                self.retry_or_bury(message, task_error.to_string()).await;
            }
            Err(_elapsed) => {
                metrics::TASKS_EXECUTED_TOTAL
                    .with_label_values(&[&task_name, "timeout"])
                    .inc();
                error!("Task {task_name} hit its hard time limit ({hard_limit:?})");
                self.retry_or_bury(message, format!("Hard time limit ({hard_limit:?})"))
                    .await;
            }
        }
    }

    /// Failed tasks are retried a bounded number of times with a fixed
    /// delay, then buried with a log event.
    async fn retry_or_bury(&self, message: TaskMessage, reason: String) {
        let worker_config = &self.services.config.worker;
        if message.attempt + 1 < worker_config.task_max_retries {
            let mut retry = message;
            retry.attempt += 1;
            retry.countdown = worker_config.task_retry_delay;
            let attempt = retry.attempt;
            let name = retry.name.clone();
            match self.services.queue.enqueue(retry).await {
                Ok(()) => info!(
                    "Task {name} scheduled for retry {attempt} in {:?}",
                    worker_config.task_retry_delay
                ),
                Err(queue_error) => {
                    error!("Failed to schedule retry for {name}: {queue_error}")
                }
            }
        } else {
            let _ = self
                .services
                .sync_log
                .record(
                    &message.name,
                    SyncEventStatus::Failed,
                    format!(
                        "Task gave up after {} attempts: {reason}",
                        message.attempt + 1
                    ),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn uninterruptible_scopes_nest() {
        let interruptibility = Arc::new(Interruptibility::new());
        assert!(!interruptibility.is_uninterruptible());

        let outer = interruptibility.uninterruptible_scope("outer");
        assert!(interruptibility.is_uninterruptible());
        {
            let _inner = interruptibility.uninterruptible_scope("inner");
            assert!(interruptibility.is_uninterruptible());
        }
        assert!(interruptibility.is_uninterruptible());

        drop(outer);
        assert!(!interruptibility.is_uninterruptible());
    }
}
