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

//! Clock-driven task schedule. The table is explicit: adding a periodic job
//! means adding an entry here, nothing is discovered at runtime.

use crate::tasks::names;
use chrono::{Duration as ChronoDuration, NaiveTime, Utc};
use granary_service_base::queue::{QueueName, TaskMessage, TaskQueue, PRIORITY_URGENT};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    DailyAt { hour: u32, minute: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleEntry {
    pub task: &'static str,
    pub cadence: Cadence,
    pub queue: QueueName,
    pub priority: u8,
}

/// The monitors share the high-priority queue so they cannot be starved by
/// organization syncs.
pub fn beat_schedule() -> Vec<ScheduleEntry> {
    vec![
        ScheduleEntry {
            task: names::DAILY_PREVIOUS_DAY_SYNC,
            cadence: Cadence::DailyAt { hour: 0, minute: 5 },
            queue: QueueName::HighPriority,
            priority: PRIORITY_URGENT,
        },
        ScheduleEntry {
            task: names::REFRESH_PROVIDER_TOKENS,
            cadence: Cadence::Every(Duration::from_secs(20 * 60)),
            queue: QueueName::HighPriority,
            priority: PRIORITY_URGENT,
        },
        ScheduleEntry {
            task: names::MONITOR_MISSED_HPTS,
            cadence: Cadence::Every(Duration::from_secs(3 * 60)),
            queue: QueueName::HighPriority,
            priority: PRIORITY_URGENT,
        },
        ScheduleEntry {
            task: names::MONITOR_STUCK_SEMAPHORES,
            cadence: Cadence::Every(Duration::from_secs(15 * 3600)),
            queue: QueueName::HighPriority,
            priority: PRIORITY_URGENT,
        },
        ScheduleEntry {
            task: names::MONITOR_IN_PROGRESS_NOT_DISPATCHED,
            cadence: Cadence::Every(Duration::from_secs(3 * 60)),
            queue: QueueName::HighPriority,
            priority: PRIORITY_URGENT,
        },
        ScheduleEntry {
            task: names::COMPREHENSIVE_STATE_MONITOR,
            cadence: Cadence::Every(Duration::from_secs(10 * 60)),
            queue: QueueName::HighPriority,
            priority: PRIORITY_URGENT,
        },
    ]
}

/// Time until the next firing of a daily cadence.
fn until_daily(hour: u32, minute: u32) -> Duration {
    let now = Utc::now();
    let target_time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    let today_target = now.date_naive().and_time(target_time).and_utc();
    let next = if today_target > now {
        today_target
    } else {
        today_target + ChronoDuration::days(1)
    };
    (next - now).to_std().unwrap_or(Duration::ZERO)
}

/// Runs the beat: one loop per schedule entry, each enqueueing its task at
/// the configured cadence until shutdown.
pub async fn run_beat(queue: Arc<dyn TaskQueue>, shutdown: CancellationToken) {
    let mut handles = Vec::new();
    for entry in beat_schedule() {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            info!("Beat entry {} started ({:?})", entry.task, entry.cadence);
            loop {
                let wait = match entry.cadence {
                    Cadence::Every(interval) => interval,
                    Cadence::DailyAt { hour, minute } => until_daily(hour, minute),
                };
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let message = TaskMessage::new(entry.task, json!({}))
                    .on_queue(entry.queue)
                    .with_priority(entry.priority);
                if let Err(queue_error) = queue.enqueue(message).await {
                    error!("Beat failed to enqueue {}: {queue_error}", entry.task);
                }
            }
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}
