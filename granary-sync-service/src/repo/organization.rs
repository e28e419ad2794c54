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

use async_trait::async_trait;
use granary_common::model::{Integration, IntegrationId, OrganizationId, ProviderKind};
use granary_service_base::repo::RepoError;
use sqlx::{Pool, Postgres};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct IntegrationRecord {
    pub id: i64,
    pub organization_id: i64,
    pub provider: String,
    pub settings: serde_json::Value,
    pub is_active: bool,
}

impl TryFrom<IntegrationRecord> for Integration {
    type Error = String;

    fn try_from(value: IntegrationRecord) -> Result<Self, Self::Error> {
        let provider = ProviderKind::from_str(value.provider.as_str())
            .map_err(|_| format!("Invalid provider kind: {}", value.provider))?;
        let settings: BTreeMap<String, String> = serde_json::from_value(value.settings)
            .map_err(|e| format!("Invalid integration settings: {e}"))?;
        Ok(Self {
            id: IntegrationId(value.id),
            organization_id: OrganizationId(value.organization_id),
            provider,
            settings,
            is_active: value.is_active,
        })
    }
}

#[async_trait]
pub trait OrganizationRepo: Send + Sync {
    /// Ids of every organization holding at least one integration, in stable
    /// id order. This is the round-robin universe of the dispatcher.
    async fn organizations_with_integrations(&self) -> Result<Vec<OrganizationId>, RepoError>;

    async fn integrations_for_organization(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Integration>, RepoError>;

    async fn get_integration(
        &self,
        id: IntegrationId,
    ) -> Result<Option<Integration>, RepoError>;

    async fn active_integrations(&self) -> Result<Vec<Integration>, RepoError>;
}

pub struct DbOrganizationRepo {
    db_pool: Pool<Postgres>,
}

impl DbOrganizationRepo {
    pub fn new(db_pool: Pool<Postgres>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl OrganizationRepo for DbOrganizationRepo {
    async fn organizations_with_integrations(&self) -> Result<Vec<OrganizationId>, RepoError> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
              SELECT DISTINCT organization_id FROM integrations
              ORDER BY organization_id ASC
            "#,
        )
        .fetch_all(&self.db_pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| OrganizationId(id)).collect())
    }

    async fn integrations_for_organization(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Integration>, RepoError> {
        let records = sqlx::query_as::<_, IntegrationRecord>(
            "SELECT * FROM integrations WHERE organization_id = $1 ORDER BY id DESC",
        )
        .bind(organization_id.0)
        .fetch_all(&self.db_pool)
        .await?;

        records
            .into_iter()
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .collect()
    }

    async fn get_integration(
        &self,
        id: IntegrationId,
    ) -> Result<Option<Integration>, RepoError> {
        let record =
            sqlx::query_as::<_, IntegrationRecord>("SELECT * FROM integrations WHERE id = $1")
                .bind(id.0)
                .fetch_optional(&self.db_pool)
                .await?;

        record
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .transpose()
    }

    async fn active_integrations(&self) -> Result<Vec<Integration>, RepoError> {
        let records = sqlx::query_as::<_, IntegrationRecord>(
            "SELECT * FROM integrations WHERE is_active ORDER BY id ASC",
        )
        .fetch_all(&self.db_pool)
        .await?;

        records
            .into_iter()
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .collect()
    }
}

/// In-memory organization/integration repo for tests and local runs.
#[derive(Default)]
pub struct InMemoryOrganizationRepo {
    integrations: Mutex<Vec<Integration>>,
}

impl InMemoryOrganizationRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_integration(&self, integration: Integration) {
        self.integrations.lock().unwrap().push(integration);
    }
}

#[async_trait]
impl OrganizationRepo for InMemoryOrganizationRepo {
    async fn organizations_with_integrations(&self) -> Result<Vec<OrganizationId>, RepoError> {
        let integrations = self.integrations.lock().unwrap();
        let mut ids: Vec<OrganizationId> =
            integrations.iter().map(|i| i.organization_id).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn integrations_for_organization(
        &self,
        organization_id: OrganizationId,
    ) -> Result<Vec<Integration>, RepoError> {
        let integrations = self.integrations.lock().unwrap();
        let mut matching: Vec<Integration> = integrations
            .iter()
            .filter(|i| i.organization_id == organization_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.id.0.cmp(&a.id.0));
        Ok(matching)
    }

    async fn get_integration(
        &self,
        id: IntegrationId,
    ) -> Result<Option<Integration>, RepoError> {
        Ok(self
            .integrations
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == id)
            .cloned())
    }

    async fn active_integrations(&self) -> Result<Vec<Integration>, RepoError> {
        let integrations = self.integrations.lock().unwrap();
        let mut active: Vec<Integration> =
            integrations.iter().filter(|i| i.is_active).cloned().collect();
        active.sort_by_key(|i| i.id.0);
        Ok(active)
    }
}
