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
use chrono::Utc;
use granary_common::model::{OrganizationId, ProviderKind, SyncEventStatus, SyncLogEvent};
use granary_service_base::repo::RepoError;
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use std::sync::Mutex;

#[async_trait]
pub trait SyncLogRepo: Send + Sync {
    async fn append(&self, event: &SyncLogEvent) -> Result<(), RepoError>;

    /// Latest event for a task name with the given status. The
    /// stuck-semaphore monitor uses this to find the last completed
    /// organization sync.
    async fn last_event(
        &self,
        task_name: &str,
        status: SyncEventStatus,
    ) -> Result<Option<SyncLogEvent>, RepoError>;

    /// Convenience append used all over the scheduler code.
    async fn record(
        &self,
        task_name: &str,
        status: SyncEventStatus,
        detail: String,
    ) -> Result<(), RepoError> {
        self.append(&SyncLogEvent {
            task_name: task_name.to_string(),
            provider: None,
            organization_id: None,
            status,
            detail,
            timestamp: Utc::now(),
        })
        .await
    }

    /// Append variant carrying the provider/organization context of an
    /// import module.
    async fn record_import(
        &self,
        task_name: &str,
        provider: ProviderKind,
        organization_id: OrganizationId,
        status: SyncEventStatus,
        detail: String,
    ) -> Result<(), RepoError> {
        self.append(&SyncLogEvent {
            task_name: task_name.to_string(),
            provider: Some(provider),
            organization_id: Some(organization_id),
            status,
            detail,
            timestamp: Utc::now(),
        })
        .await
    }
}

pub struct DbSyncLogRepo {
    db_pool: Pool<Postgres>,
}

impl DbSyncLogRepo {
    pub fn new(db_pool: Pool<Postgres>) -> Self {
        Self { db_pool }
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
struct SyncLogEventRecord {
    task_name: String,
    provider: Option<String>,
    organization_id: Option<i64>,
    status: String,
    detail: String,
    timestamp: chrono::DateTime<Utc>,
}

impl TryFrom<SyncLogEventRecord> for SyncLogEvent {
    type Error = String;

    fn try_from(value: SyncLogEventRecord) -> Result<Self, Self::Error> {
        let provider = value
            .provider
            .map(|p| {
                ProviderKind::from_str(p.as_str())
                    .map_err(|_| format!("Invalid provider kind: {p}"))
            })
            .transpose()?;
        let status = SyncEventStatus::from_str(value.status.as_str())
            .map_err(|_| format!("Invalid event status: {}", value.status))?;
        Ok(Self {
            task_name: value.task_name,
            provider,
            organization_id: value.organization_id.map(OrganizationId),
            status,
            detail: value.detail,
            timestamp: value.timestamp,
        })
    }
}

#[async_trait]
impl SyncLogRepo for DbSyncLogRepo {
    async fn append(&self, event: &SyncLogEvent) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              INSERT INTO sync_log_events
                (task_name, provider, organization_id, status, detail, timestamp)
              VALUES
                ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.task_name.as_str())
        .bind(event.provider.map(|p| p.to_string()))
        .bind(event.organization_id.map(|o| o.0))
        .bind(event.status.to_string())
        .bind(event.detail.as_str())
        .bind(event.timestamp)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn last_event(
        &self,
        task_name: &str,
        status: SyncEventStatus,
    ) -> Result<Option<SyncLogEvent>, RepoError> {
        let record = sqlx::query_as::<_, SyncLogEventRecord>(
            r#"
              SELECT task_name, provider, organization_id, status, detail, timestamp
              FROM sync_log_events
              WHERE task_name = $1 AND status = $2
              ORDER BY timestamp DESC
              LIMIT 1
            "#,
        )
        .bind(task_name)
        .bind(status.to_string())
        .fetch_optional(&self.db_pool)
        .await?;

        record
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .transpose()
    }
}

/// In-memory sync log for tests and local runs.
#[derive(Default)]
pub struct InMemorySyncLogRepo {
    events: Mutex<Vec<SyncLogEvent>>,
}

impl InMemorySyncLogRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SyncLogEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_for(&self, task_name: &str) -> Vec<SyncLogEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.task_name == task_name)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SyncLogRepo for InMemorySyncLogRepo {
    async fn append(&self, event: &SyncLogEvent) -> Result<(), RepoError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn last_event(
        &self,
        task_name: &str,
        status: SyncEventStatus,
    ) -> Result<Option<SyncLogEvent>, RepoError> {
        Ok(self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.task_name == task_name && e.status == status)
            .max_by_key(|e| e.timestamp)
            .cloned())
    }
}
