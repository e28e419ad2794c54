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
use crate::repo::task::NewHighPriorityTask;
use crate::service::registry::provider_spec;
use crate::service::Services;
use chrono::{Duration as ChronoDuration, Utc};
use granary_common::model::SyncEventStatus;
use tracing::{error, info};

/// Creates one high-priority task per active integration covering the
/// previous day with the provider's full module list. The serial
/// high-priority lane drains them one by one.
pub async fn run(services: &Services) -> Result<(), TaskError> {
    let yesterday = (Utc::now() - ChronoDuration::days(1)).date_naive();
    info!("Starting daily sync scheduling for previous day {yesterday}");
    let _ = services
        .sync_log
        .record(
            names::DAILY_PREVIOUS_DAY_SYNC,
            SyncEventStatus::Started,
            format!("Starting sync scheduling for previous day {yesterday}"),
        )
        .await;

    let integrations = match services.organization_repo.active_integrations().await {
        Ok(integrations) => integrations,
        Err(repo_error) => {
            error!("Daily previous day sync failed: {repo_error}");
            let _ = services
                .sync_log
                .record(
                    names::DAILY_PREVIOUS_DAY_SYNC,
                    SyncEventStatus::Failed,
                    format!("Error: {repo_error}"),
                )
                .await;
            return Err(TaskError::Failed(repo_error.to_string()));
        }
    };

    if integrations.is_empty() {
        info!("No active integrations found for the daily sync");
        return Ok(());
    }

    let mut scheduled = 0usize;
    for integration in integrations {
        if !integration.has_credentials() {
            continue;
        }
        let modules = provider_spec(integration.provider)
            .modules
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>();

        let new_task = NewHighPriorityTask {
            integration_id: integration.id,
            provider: integration.provider,
            since_date: yesterday,
            until_date: Some(yesterday),
            selected_modules: modules,
        };
        match services.task_repo.create(&new_task).await {
            Ok(created) => {
                scheduled += 1;
                info!(
                    "Created full sync task {} for integration {} ({})",
                    created.id, integration.id, integration.provider
                );
            }
            Err(repo_error) => {
                error!(
                    "Failed to create daily sync task for integration {}: {repo_error}",
                    integration.id
                );
            }
        }
    }

    let _ = services
        .sync_log
        .record(
            names::DAILY_PREVIOUS_DAY_SYNC,
            SyncEventStatus::Success,
            format!("Scheduled {scheduled} complete sync tasks for previous day {yesterday}"),
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::config::SyncServiceConfig;
    use crate::import::warehouse::InMemoryWarehouseWriter;
    use crate::repo::organization::InMemoryOrganizationRepo;
    use crate::repo::sync_log::InMemorySyncLogRepo;
    use crate::repo::task::{InMemoryTaskRepo, TaskRepo};
    use crate::repo::token::InMemoryTokenRepo;
    use granary_common::model::{Integration, IntegrationId, OrganizationId, ProviderKind};
    use granary_service_base::queue::memory::InMemoryTaskQueue;
    use granary_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    #[test]
    async fn creates_a_full_module_task_per_credentialed_integration() {
        let organizations = Arc::new(InMemoryOrganizationRepo::new());
        let tasks = Arc::new(InMemoryTaskRepo::new());

        let mut toast_settings = BTreeMap::new();
        toast_settings.insert("api_url".to_string(), "https://t".to_string());
        toast_settings.insert("client_id".to_string(), "id".to_string());
        toast_settings.insert("client_secret".to_string(), "secret".to_string());
        organizations.add_integration(Integration {
            id: IntegrationId(1),
            organization_id: OrganizationId(1),
            provider: ProviderKind::Toast,
            settings: toast_settings,
            is_active: true,
        });
        // Active but without credentials: skipped.
        organizations.add_integration(Integration {
            id: IntegrationId(2),
            organization_id: OrganizationId(1),
            provider: ProviderKind::Xero,
            settings: BTreeMap::new(),
            is_active: true,
        });

        let services = crate::service::Services::from_parts(
            SyncServiceConfig::default(),
            Arc::new(InMemoryKeyValueStorage::new()),
            Arc::new(InMemoryTaskQueue::new()),
            organizations,
            tasks.clone(),
            Arc::new(InMemoryTokenRepo::new()),
            Arc::new(InMemorySyncLogRepo::new()),
            Arc::new(InMemoryWarehouseWriter::new()),
        );

        run(&services).await.unwrap();

        let yesterday = (Utc::now() - ChronoDuration::days(1)).date_naive();
        let claimed = tasks.claim_next_pending(Utc::now()).await.unwrap().unwrap();
        assert_eq!(claimed.integration_id, IntegrationId(1));
        assert_eq!(claimed.since_date, yesterday);
        assert_eq!(claimed.until_date, Some(yesterday));
        assert_eq!(
            claimed.selected_modules,
            provider_spec(ProviderKind::Toast)
                .modules
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
        );
        assert!(tasks.claim_next_pending(Utc::now()).await.unwrap().is_none());
    }
}
