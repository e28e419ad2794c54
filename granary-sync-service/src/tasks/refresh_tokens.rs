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

use super::TaskError;
use crate::clients::netsuite::NetsuiteTokenRefresher;
use crate::service::Services;
use granary_common::model::ProviderKind;
use granary_common::SafeDisplay;
use tracing::{error, info};

/// Proactively rotates NetSuite access tokens for every credentialed
/// integration. NetSuite's machine-to-machine tokens cannot be refreshed
/// lazily by a refresh token, so they are re-obtained on a schedule; Xero
/// and Toast tokens renew on demand.
pub async fn run(services: &Services) -> Result<(), TaskError> {
    let integrations = services
        .organization_repo
        .active_integrations()
        .await
        .map_err(|e| TaskError::Failed(e.to_string()))?;

    let refresher = NetsuiteTokenRefresher::new(
        reqwest::Client::new(),
        services.config.http_client_retries.clone(),
    );

    let mut refreshed = 0usize;
    let mut failed = 0usize;
    for integration in integrations {
        if integration.provider != ProviderKind::Netsuite
            || integration.netsuite_credentials().is_none()
        {
            continue;
        }
        match services
            .token_service
            .refresh(&integration, &refresher)
            .await
        {
            Ok(_) => refreshed += 1,
            Err(token_error) => {
                failed += 1;
                error!(
                    "Error refreshing NetSuite token for integration {}: {}",
                    integration.id,
                    token_error.to_safe_string()
                );
            }
        }
    }

    info!("NetSuite token refresh finished: {refreshed} refreshed, {failed} failed");
    Ok(())
}
