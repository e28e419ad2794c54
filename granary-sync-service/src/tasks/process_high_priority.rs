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

use super::{names, TaskError};
use crate::import::Importer;
use crate::keys::ACTIVE_HIGH_PRIORITY_TASK_KEY;
use crate::service::Services;
use chrono::Utc;
use granary_common::model::{HighPriorityTask, SyncEventStatus, TaskId};
use granary_common::SafeDisplay;
use tracing::{error, info, warn};

/// Executes one high-priority import end to end. The execution is an
/// uninterruptible section: graceful shutdown waits for it. Whatever
/// happens inside, the task row is finalized and the active marker cleared
/// so the serial lane can move on.
pub async fn run(services: &Services, task_id: TaskId) -> Result<(), TaskError> {
    let _uninterruptible = services.config.worker.mask_termination.then(|| {
        services
            .interruptibility
            .uninterruptible_scope(&format!("high priority task {task_id}"))
    });

    let Some(task) = services
        .task_repo
        .get(task_id)
        .await
        .map_err(|e| TaskError::Failed(e.to_string()))?
    else {
        error!("High priority task {task_id} does not exist");
        return Ok(());
    };

    if task.processed {
        info!("High priority task {task_id} is already processed, nothing to do");
        return Ok(());
    }

    // Claim or adopt: the monitor path dispatches tasks that are still
    // pending, the dispatcher path dispatches tasks it already claimed.
    let _ = services.task_repo.mark_in_progress(task_id, Utc::now()).await;

    let outcome = import(services, &task).await;
    finalize(services, task_id).await;

    match outcome {
        Ok(()) => {
            let _ = services
                .sync_log
                .record(
                    names::PROCESS_HIGH_PRIORITY,
                    SyncEventStatus::Success,
                    format!(
                        "High priority task {task_id} for integration {} processed",
                        task.integration_id
                    ),
                )
                .await;
            Ok(())
        }
        Err(task_error) => {
            let _ = services
                .sync_log
                .record(
                    names::PROCESS_HIGH_PRIORITY,
                    SyncEventStatus::Failed,
                    format!("High priority task {task_id} failed: {task_error}"),
                )
                .await;
            Err(task_error)
        }
    }
}

async fn import(services: &Services, task: &HighPriorityTask) -> Result<(), TaskError> {
    let Some(integration) = services
        .organization_repo
        .get_integration(task.integration_id)
        .await
        .map_err(|e| TaskError::Failed(e.to_string()))?
    else {
        error!(
            "Integration {} for high priority task {} does not exist",
            task.integration_id, task.id
        );
        return Ok(());
    };

    let importer = match services
        .importer_factory
        .importer(&integration, task.since_date, task.until_date)
    {
        Ok(importer) => importer,
        Err(import_error) => {
            error!(
                "Cannot build importer for high priority task {}: {import_error}",
                task.id
            );
            return Ok(());
        }
    };

    info!(
        "Processing high priority task {} for integration {} since {}",
        task.id, integration.id, task.since_date
    );

    if !task.selected_modules.is_empty() {
        run_selected_modules(services, task, importer.as_ref()).await;
    } else if importer.supports_full_import() {
        info!("Starting full import for integration {}", integration.id);
        if let Err(full_error) = importer.full_import().await {
            error!(
                "Full import for integration {} failed: {}",
                integration.id,
                full_error.to_safe_string()
            );
        }
    } else {
        run_all_modules(services, task, importer.as_ref()).await;
    }

    Ok(())
}

/// Module failures are isolated: one bad module does not stop the rest of a
/// user's requested import.
async fn run_selected_modules(
    services: &Services,
    task: &HighPriorityTask,
    importer: &dyn Importer,
) {
    let mut processed_any = false;
    for module in &task.selected_modules {
        if !importer.modules().contains(&module.as_str()) {
            warn!(
                "Unknown module {module} for integration {}",
                task.integration_id
            );
            continue;
        }
        info!("Importing {module} for integration {}", task.integration_id);
        match importer.run_module(module).await {
            Ok(_) => processed_any = true,
            Err(module_error) => {
                error!(
                    "Error processing module {module} for integration {}: {}",
                    task.integration_id,
                    module_error.to_safe_string()
                );
                let _ = services
                    .sync_log
                    .record(
                        names::PROCESS_HIGH_PRIORITY,
                        SyncEventStatus::Failed,
                        format!("Module {module} failed: {}", module_error.to_safe_string()),
                    )
                    .await;
            }
        }
    }
    if !processed_any {
        warn!("No valid modules were processed for task {}", task.id);
    }
}

async fn run_all_modules(services: &Services, task: &HighPriorityTask, importer: &dyn Importer) {
    let mut processed_any = false;
    for module in importer.modules() {
        match importer.run_module(module).await {
            Ok(_) => processed_any = true,
            Err(module_error) => {
                error!(
                    "Error processing module {module} for integration {}: {}",
                    task.integration_id,
                    module_error.to_safe_string()
                );
                let _ = services
                    .sync_log
                    .record(
                        names::PROCESS_HIGH_PRIORITY,
                        SyncEventStatus::Failed,
                        format!("Module {module} failed: {}", module_error.to_safe_string()),
                    )
                    .await;
            }
        }
    }
    if !processed_any {
        warn!(
            "No import functions were successfully processed for task {}",
            task.id
        );
    }
}

/// Terminal bookkeeping: runs on every exit path. Failing to finalize is
/// logged but never panics the worker; the comprehensive state monitor
/// clears any marker this leaves behind.
async fn finalize(services: &Services, task_id: TaskId) {
    match services.task_repo.mark_done(task_id, Utc::now()).await {
        Ok(()) => info!("Marked high priority task {task_id} as processed"),
        Err(repo_error) => {
            error!("Failed to update high priority task {task_id} status: {repo_error}")
        }
    }
    if let Err(storage_error) = services.storage.delete(ACTIVE_HIGH_PRIORITY_TASK_KEY).await {
        error!("Failed to clear the active high priority task marker: {storage_error}");
    }
}
