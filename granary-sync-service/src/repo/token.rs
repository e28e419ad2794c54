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
use chrono::{DateTime, Utc};
use granary_common::model::{AccessToken, IntegrationId, ProviderKind};
use granary_service_base::repo::RepoError;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct AccessTokenRecord {
    pub integration_id: i64,
    pub provider: String,
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<AccessTokenRecord> for AccessToken {
    type Error = String;

    fn try_from(value: AccessTokenRecord) -> Result<Self, Self::Error> {
        let provider = ProviderKind::from_str(value.provider.as_str())
            .map_err(|_| format!("Invalid provider kind: {}", value.provider))?;
        Ok(Self {
            integration_id: IntegrationId(value.integration_id),
            provider,
            token: value.token,
            refresh_token: value.refresh_token,
            expires_at: value.expires_at,
        })
    }
}

impl From<&AccessToken> for AccessTokenRecord {
    fn from(value: &AccessToken) -> Self {
        Self {
            integration_id: value.integration_id.0,
            provider: value.provider.to_string(),
            token: value.token.clone(),
            refresh_token: value.refresh_token.clone(),
            expires_at: value.expires_at,
        }
    }
}

#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn get(
        &self,
        integration_id: IntegrationId,
        provider: ProviderKind,
    ) -> Result<Option<AccessToken>, RepoError>;

    async fn upsert(&self, token: &AccessToken) -> Result<(), RepoError>;
}

pub struct DbTokenRepo {
    db_pool: Pool<Postgres>,
}

impl DbTokenRepo {
    pub fn new(db_pool: Pool<Postgres>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TokenRepo for DbTokenRepo {
    async fn get(
        &self,
        integration_id: IntegrationId,
        provider: ProviderKind,
    ) -> Result<Option<AccessToken>, RepoError> {
        let record = sqlx::query_as::<_, AccessTokenRecord>(
            "SELECT * FROM integration_access_tokens WHERE integration_id = $1 AND provider = $2",
        )
        .bind(integration_id.0)
        .bind(provider.to_string())
        .fetch_optional(&self.db_pool)
        .await?;

        record
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .transpose()
    }

    async fn upsert(&self, token: &AccessToken) -> Result<(), RepoError> {
        let record = AccessTokenRecord::from(token);
        sqlx::query(
            r#"
              INSERT INTO integration_access_tokens
                (integration_id, provider, token, refresh_token, expires_at)
              VALUES
                ($1, $2, $3, $4, $5)
              ON CONFLICT (integration_id, provider) DO UPDATE
              SET token = $3,
                  refresh_token = $4,
                  expires_at = $5
            "#,
        )
        .bind(record.integration_id)
        .bind(record.provider.as_str())
        .bind(record.token.as_str())
        .bind(record.refresh_token.as_deref())
        .bind(record.expires_at)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }
}

/// In-memory token repo for tests and local runs.
#[derive(Default)]
pub struct InMemoryTokenRepo {
    tokens: Mutex<HashMap<(IntegrationId, ProviderKind), AccessToken>>,
}

impl InMemoryTokenRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenRepo for InMemoryTokenRepo {
    async fn get(
        &self,
        integration_id: IntegrationId,
        provider: ProviderKind,
    ) -> Result<Option<AccessToken>, RepoError> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .get(&(integration_id, provider))
            .cloned())
    }

    async fn upsert(&self, token: &AccessToken) -> Result<(), RepoError> {
        self.tokens
            .lock()
            .unwrap()
            .insert((token.integration_id, token.provider), token.clone());
        Ok(())
    }
}
