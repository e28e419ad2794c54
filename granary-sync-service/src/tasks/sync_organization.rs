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
use crate::keys::org_sync_lock_key;
use crate::service::Services;
use granary_common::model::{OrganizationId, SyncEventStatus};
use granary_service_base::queue::{QueueName, TaskMessage};
use serde_json::json;
use tracing::{error, info, warn};

/// Entry point for one organization sync: fans out a sequential pipeline
/// task per dispatchable integration. Exactly one instance per organization
/// runs at a time (the org lock), and the dispatch slot reserved by the
/// dispatcher is released on every exit path.
pub async fn run(services: &Services, organization_id: OrganizationId) -> Result<(), TaskError> {
    info!("Entered organization sync for {organization_id}");
    let lock_key = org_sync_lock_key(organization_id);

    let lock_acquired = services
        .storage
        .add(
            &lock_key,
            "in_progress",
            services.config.dispatch.org_sync_lock_ttl,
        )
        .await
        .unwrap_or(false);

    if lock_acquired {
        dispatch_pipelines(services, organization_id).await;
        let _ = services.storage.delete(&lock_key).await;
    } else {
        warn!("Organization {organization_id} sync lock already held, skipping this instance");
    }

    // The slot was reserved by the dispatcher before this task was enqueued;
    // it must come back even when the lock was contended or the body failed.
    match services.slots.release().await {
        Ok(value) => info!(
            "Released dispatch slot for organization {organization_id}, in-flight now {value}"
        ),
        Err(release_error) => error!(
            "Failed to release dispatch slot for organization {organization_id}: {release_error}"
        ),
    }

    Ok(())
}

async fn dispatch_pipelines(services: &Services, organization_id: OrganizationId) {
    let integrations = match services
        .organization_repo
        .integrations_for_organization(organization_id)
        .await
    {
        Ok(integrations) => integrations,
        Err(repo_error) => {
            error!("Error during organization {organization_id} sync: {repo_error}");
            let _ = services
                .sync_log
                .record(
                    names::SYNC_ORGANIZATION,
                    SyncEventStatus::Failed,
                    format!("Organization {organization_id} sync failed: {repo_error}"),
                )
                .await;
            return;
        }
    };

    let mut dispatched = 0usize;
    for integration in integrations {
        if !integration.is_active {
            continue;
        }
        if !integration.has_credentials() {
            warn!(
                "No valid credentials found for integration {} of type {}",
                integration.id, integration.provider
            );
            continue;
        }

        info!(
            "Dispatching {} sync for integration {} of organization {organization_id}",
            integration.provider, integration.id
        );
        let message = TaskMessage::new(
            names::SYNC_INTEGRATION,
            json!({ "integration_id": integration.id }),
        )
        .on_queue(QueueName::OrgSync);

        match services.queue.enqueue(message).await {
            Ok(()) => dispatched += 1,
            Err(queue_error) => {
                error!(
                    "Failed to enqueue pipeline for integration {}: {queue_error}",
                    integration.id
                );
            }
        }
    }

    let (status, detail) = if dispatched > 0 {
        (
            SyncEventStatus::Success,
            format!("Organization {organization_id} sync dispatched {dispatched} pipelines"),
        )
    } else {
        (
            SyncEventStatus::Warning,
            format!("No sub-tasks dispatched for organization {organization_id}"),
        )
    };
    let _ = services
        .sync_log
        .record(names::SYNC_ORGANIZATION, status, detail)
        .await;
}
