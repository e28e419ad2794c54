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

pub mod daily;
pub mod pipeline;
pub mod process_high_priority;
pub mod refresh_tokens;
pub mod sync_organization;

use crate::service::dispatcher::DispatcherError;
use crate::service::Services;
use chrono::NaiveDate;
use granary_service_base::queue::TaskMessage;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Every task name the workers accept. Dispatchers, monitors and the beat
/// schedule refer to tasks exclusively through these.
pub mod names {
    pub const DISPATCHER: &str = "dispatcher";
    pub const HIGH_PRIORITY_DISPATCHER: &str = "high_priority_dispatcher";
    pub const SYNC_ORGANIZATION: &str = "sync_organization";
    pub const SYNC_INTEGRATION: &str = "sync_integration";
    pub const PROCESS_HIGH_PRIORITY: &str = "process_high_priority";
    pub const DAILY_PREVIOUS_DAY_SYNC: &str = "daily_previous_day_sync";
    pub const REFRESH_PROVIDER_TOKENS: &str = "refresh_provider_tokens";
    pub const MONITOR_MISSED_HPTS: &str = "monitor_missed_hpts";
    pub const MONITOR_STUCK_SEMAPHORES: &str = "monitor_stuck_semaphores";
    pub const MONITOR_IN_PROGRESS_NOT_DISPATCHED: &str = "monitor_in_progress_not_dispatched";
    pub const COMPREHENSIVE_STATE_MONITOR: &str = "comprehensive_state_monitor";
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),
    #[error("Invalid arguments for {0}: {1}")]
    InvalidArgs(&'static str, String),
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),
    #[error("Task failed: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOrganizationArgs {
    pub organization_id: granary_common::model::OrganizationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHighPriorityArgs {
    pub task_id: granary_common::model::TaskId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncIntegrationArgs {
    pub integration_id: granary_common::model::IntegrationId,
    #[serde(default)]
    pub since_date: Option<NaiveDate>,
    #[serde(default)]
    pub until_date: Option<NaiveDate>,
}

fn parse_args<T: DeserializeOwned>(
    task: &'static str,
    message: &TaskMessage,
) -> Result<T, TaskError> {
    serde_json::from_value(message.args.clone())
        .map_err(|e| TaskError::InvalidArgs(task, e.to_string()))
}

/// Maps task names to their handlers. Registration is explicit and
/// exhaustive; a message with an unknown name is rejected rather than
/// silently dropped.
pub struct TaskRegistry {
    services: Arc<Services>,
}

impl TaskRegistry {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn execute(&self, message: &TaskMessage) -> Result<(), TaskError> {
        match message.name.as_str() {
            names::DISPATCHER => Ok(self.services.dispatcher.tick().await?),
            names::HIGH_PRIORITY_DISPATCHER => Ok(self.services.hp_dispatcher.tick().await?),
            names::SYNC_ORGANIZATION => {
                let args: SyncOrganizationArgs = parse_args(names::SYNC_ORGANIZATION, message)?;
                sync_organization::run(&self.services, args.organization_id).await
            }
            names::SYNC_INTEGRATION => {
                let args: SyncIntegrationArgs = parse_args(names::SYNC_INTEGRATION, message)?;
                pipeline::run(&self.services, args).await
            }
            names::PROCESS_HIGH_PRIORITY => {
                let args: ProcessHighPriorityArgs =
                    parse_args(names::PROCESS_HIGH_PRIORITY, message)?;
                process_high_priority::run(&self.services, args.task_id).await
            }
            names::DAILY_PREVIOUS_DAY_SYNC => daily::run(&self.services).await,
            names::REFRESH_PROVIDER_TOKENS => refresh_tokens::run(&self.services).await,
            names::MONITOR_MISSED_HPTS => {
                Ok(self.services.monitors.missed_high_priority_tasks().await?)
            }
            names::MONITOR_STUCK_SEMAPHORES => Ok(self.services.monitors.stuck_semaphores().await?),
            names::MONITOR_IN_PROGRESS_NOT_DISPATCHED => {
                Ok(self.services.monitors.in_progress_not_dispatched().await?)
            }
            names::COMPREHENSIVE_STATE_MONITOR => {
                Ok(self.services.monitors.comprehensive_state().await?)
            }
            other => Err(TaskError::UnknownTask(other.to_string())),
        }
    }
}
