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

use super::{names, SyncIntegrationArgs, TaskError};
use crate::service::Services;
use chrono::Utc;
use granary_common::model::SyncEventStatus;
use granary_common::SafeDisplay;
use tracing::{error, info, warn};

/// Sequential per-integration sync: every module of the provider in
/// declared order, with a fixed pause between modules to smooth provider
/// rate limits. A module failure aborts the remainder of this pipeline but
/// not sibling pipelines for other integrations.
pub async fn run(services: &Services, args: SyncIntegrationArgs) -> Result<(), TaskError> {
    let Some(integration) = services
        .organization_repo
        .get_integration(args.integration_id)
        .await
        .map_err(|e| TaskError::Failed(e.to_string()))?
    else {
        warn!("Integration {} does not exist, skipping pipeline", args.integration_id);
        return Ok(());
    };

    let since_date = args
        .since_date
        .unwrap_or_else(|| Utc::now().date_naive());
    let importer = match services
        .importer_factory
        .importer(&integration, since_date, args.until_date)
    {
        Ok(importer) => importer,
        Err(import_error) => {
            error!(
                "Cannot build importer for integration {}: {import_error}",
                integration.id
            );
            let _ = services
                .sync_log
                .record(
                    names::SYNC_INTEGRATION,
                    SyncEventStatus::Failed,
                    format!(
                        "Integration {} pipeline failed: {}",
                        integration.id,
                        import_error.to_safe_string()
                    ),
                )
                .await;
            return Ok(());
        }
    };

    info!(
        "Starting {} pipeline for integration {} since {since_date}",
        integration.provider, integration.id
    );

    for (index, module) in importer.modules().iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(services.config.pipeline.inter_module_pause).await;
        }

        match importer.run_module(module).await {
            Ok(count) => {
                info!(
                    "{} {module} imported for integration {} ({count} records)",
                    integration.provider, integration.id
                );
            }
            Err(module_error) => {
                error!(
                    "Module {module} failed for integration {}: {module_error}; \
                     aborting the remaining pipeline",
                    integration.id
                );
                let _ = services
                    .sync_log
                    .record_import(
                        names::SYNC_INTEGRATION,
                        integration.provider,
                        integration.organization_id,
                        SyncEventStatus::Failed,
                        format!(
                            "Module {module} failed: {}",
                            module_error.to_safe_string()
                        ),
                    )
                    .await;
                return Ok(());
            }
        }
    }

    info!(
        "Completed {} pipeline for integration {}",
        integration.provider, integration.id
    );
    Ok(())
}
