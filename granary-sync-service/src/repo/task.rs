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
use chrono::{DateTime, NaiveDate, Utc};
use granary_common::model::{HighPriorityTask, IntegrationId, ProviderKind, TaskId};
use granary_service_base::repo::RepoError;
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use std::sync::Mutex;

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct HighPriorityTaskRecord {
    pub id: i64,
    pub integration_id: i64,
    pub provider: String,
    pub since_date: NaiveDate,
    pub until_date: Option<NaiveDate>,
    pub selected_modules: serde_json::Value,
    pub processed: bool,
    pub in_progress: bool,
    pub in_progress_since: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<HighPriorityTaskRecord> for HighPriorityTask {
    type Error = String;

    fn try_from(value: HighPriorityTaskRecord) -> Result<Self, Self::Error> {
        let provider = ProviderKind::from_str(value.provider.as_str())
            .map_err(|_| format!("Invalid provider kind: {}", value.provider))?;
        let selected_modules: Vec<String> = serde_json::from_value(value.selected_modules)
            .map_err(|e| format!("Invalid selected_modules: {e}"))?;
        Ok(Self {
            id: TaskId(value.id),
            integration_id: IntegrationId(value.integration_id),
            provider,
            since_date: value.since_date,
            until_date: value.until_date,
            selected_modules,
            processed: value.processed,
            in_progress: value.in_progress,
            in_progress_since: value.in_progress_since,
            processed_at: value.processed_at,
            created_at: value.created_at,
        })
    }
}

/// Input for creating a high-priority task; everything else is defaulted by
/// the store.
#[derive(Debug, Clone)]
pub struct NewHighPriorityTask {
    pub integration_id: IntegrationId,
    pub provider: ProviderKind,
    pub since_date: NaiveDate,
    pub until_date: Option<NaiveDate>,
    pub selected_modules: Vec<String>,
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn create(&self, task: &NewHighPriorityTask) -> Result<HighPriorityTask, RepoError>;

    async fn get(&self, id: TaskId) -> Result<Option<HighPriorityTask>, RepoError>;

    /// Claims the oldest pending task in a single transaction: marks it in
    /// progress, stamps `in_progress_since` and returns it. Row-level
    /// locking keeps two dispatchers from claiming the same row.
    async fn claim_next_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<HighPriorityTask>, RepoError>;

    /// Compare-and-set pending -> running. Returns `false` when the task is
    /// already running or done.
    async fn mark_in_progress(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool, RepoError>;

    /// Terminal transition; also clears `in_progress`.
    async fn mark_done(&self, id: TaskId, when: DateTime<Utc>) -> Result<(), RepoError>;

    /// Restamps `in_progress_since` for a task that is not yet done. Used by
    /// the monitors and the high-priority dispatcher.
    async fn set_in_progress_since(
        &self,
        id: TaskId,
        when: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Pending tasks created before the threshold (never picked up).
    async fn missed(&self, older_than: DateTime<Utc>)
        -> Result<Vec<HighPriorityTask>, RepoError>;

    /// Running tasks whose progress stamp is older than the threshold.
    async fn in_progress_since_before(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<HighPriorityTask>, RepoError>;
}

pub struct DbTaskRepo {
    db_pool: Pool<Postgres>,
}

impl DbTaskRepo {
    pub fn new(db_pool: Pool<Postgres>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl TaskRepo for DbTaskRepo {
    async fn create(&self, task: &NewHighPriorityTask) -> Result<HighPriorityTask, RepoError> {
        let record = sqlx::query_as::<_, HighPriorityTaskRecord>(
            r#"
              INSERT INTO high_priority_tasks
                (integration_id, provider, since_date, until_date, selected_modules)
              VALUES
                ($1, $2, $3, $4, $5)
              RETURNING *
            "#,
        )
        .bind(task.integration_id.0)
        .bind(task.provider.to_string())
        .bind(task.since_date)
        .bind(task.until_date)
        .bind(serde_json::json!(task.selected_modules))
        .fetch_one(&self.db_pool)
        .await?;

        record.try_into().map_err(RepoError::Internal)
    }

    async fn get(&self, id: TaskId) -> Result<Option<HighPriorityTask>, RepoError> {
        let record = sqlx::query_as::<_, HighPriorityTaskRecord>(
            "SELECT * FROM high_priority_tasks WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.db_pool)
        .await?;

        record
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .transpose()
    }

    async fn claim_next_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<HighPriorityTask>, RepoError> {
        let record = sqlx::query_as::<_, HighPriorityTaskRecord>(
            r#"
              UPDATE high_priority_tasks
              SET in_progress = TRUE, in_progress_since = $1
              WHERE id = (
                SELECT id FROM high_priority_tasks
                WHERE NOT processed AND NOT in_progress
                ORDER BY created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
              )
              RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(&self.db_pool)
        .await?;

        record
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .transpose()
    }

    async fn mark_in_progress(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE high_priority_tasks
              SET in_progress = TRUE, in_progress_since = $2
              WHERE id = $1 AND NOT processed AND NOT in_progress
            "#,
        )
        .bind(id.0)
        .bind(now)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_done(&self, id: TaskId, when: DateTime<Utc>) -> Result<(), RepoError> {
        sqlx::query(
            r#"
              UPDATE high_priority_tasks
              SET processed = TRUE, in_progress = FALSE, processed_at = $2
              WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(when)
        .execute(&self.db_pool)
        .await?;
        Ok(())
    }

    async fn set_in_progress_since(
        &self,
        id: TaskId,
        when: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"
              UPDATE high_priority_tasks
              SET in_progress_since = $2
              WHERE id = $1 AND NOT processed
            "#,
        )
        .bind(id.0)
        .bind(when)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn missed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<HighPriorityTask>, RepoError> {
        let records = sqlx::query_as::<_, HighPriorityTaskRecord>(
            r#"
              SELECT * FROM high_priority_tasks
              WHERE NOT processed AND NOT in_progress AND created_at < $1
              ORDER BY created_at ASC
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.db_pool)
        .await?;

        records
            .into_iter()
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .collect()
    }

    async fn in_progress_since_before(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<HighPriorityTask>, RepoError> {
        let records = sqlx::query_as::<_, HighPriorityTaskRecord>(
            r#"
              SELECT * FROM high_priority_tasks
              WHERE in_progress AND NOT processed AND in_progress_since < $1
              ORDER BY in_progress_since ASC
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.db_pool)
        .await?;

        records
            .into_iter()
            .map(|r| r.try_into().map_err(RepoError::Internal))
            .collect()
    }
}

/// In-memory task repo for tests and single-process local runs.
#[derive(Default)]
pub struct InMemoryTaskRepo {
    tasks: Mutex<Vec<HighPriorityTask>>,
    next_id: Mutex<i64>,
}

impl InMemoryTaskRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepo for InMemoryTaskRepo {
    async fn create(&self, task: &NewHighPriorityTask) -> Result<HighPriorityTask, RepoError> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let created = HighPriorityTask {
            id: TaskId(*next_id),
            integration_id: task.integration_id,
            provider: task.provider,
            since_date: task.since_date,
            until_date: task.until_date,
            selected_modules: task.selected_modules.clone(),
            processed: false,
            in_progress: false,
            in_progress_since: None,
            processed_at: None,
            created_at: Utc::now(),
        };
        self.tasks.lock().unwrap().push(created.clone());
        Ok(created)
    }

    async fn get(&self, id: TaskId) -> Result<Option<HighPriorityTask>, RepoError> {
        Ok(self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned())
    }

    async fn claim_next_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<HighPriorityTask>, RepoError> {
        let mut tasks = self.tasks.lock().unwrap();
        let candidate = tasks
            .iter_mut()
            .filter(|t| !t.processed && !t.in_progress)
            .min_by_key(|t| (t.created_at, t.id.0));
        Ok(candidate.map(|task| {
            task.in_progress = true;
            task.in_progress_since = Some(now);
            task.clone()
        }))
    }

    async fn mark_in_progress(&self, id: TaskId, now: DateTime<Utc>) -> Result<bool, RepoError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks
            .iter_mut()
            .find(|t| t.id == id && !t.processed && !t.in_progress)
        {
            Some(task) => {
                task.in_progress = true;
                task.in_progress_since = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_done(&self, id: TaskId, when: DateTime<Utc>) -> Result<(), RepoError> {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.iter_mut().find(|t| t.id == id) {
            task.processed = true;
            task.in_progress = false;
            task.processed_at = Some(when);
        }
        Ok(())
    }

    async fn set_in_progress_since(
        &self,
        id: TaskId,
        when: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.iter_mut().find(|t| t.id == id && !t.processed) {
            Some(task) => {
                task.in_progress_since = Some(when);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn missed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<HighPriorityTask>, RepoError> {
        let tasks = self.tasks.lock().unwrap();
        let mut missed: Vec<HighPriorityTask> = tasks
            .iter()
            .filter(|t| !t.processed && !t.in_progress && t.created_at < older_than)
            .cloned()
            .collect();
        missed.sort_by_key(|t| (t.created_at, t.id.0));
        Ok(missed)
    }

    async fn in_progress_since_before(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<Vec<HighPriorityTask>, RepoError> {
        let tasks = self.tasks.lock().unwrap();
        let mut stuck: Vec<HighPriorityTask> = tasks
            .iter()
            .filter(|t| {
                t.in_progress
                    && !t.processed
                    && matches!(t.in_progress_since, Some(since) if since < threshold)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|t| (t.in_progress_since, t.id.0));
        Ok(stuck)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn new_task(integration: i64) -> NewHighPriorityTask {
        NewHighPriorityTask {
            integration_id: IntegrationId(integration),
            provider: ProviderKind::Netsuite,
            since_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            until_date: None,
            selected_modules: vec!["accounts".to_string()],
        }
    }

    #[test]
    async fn claim_takes_the_oldest_pending_exactly_once() {
        let repo = InMemoryTaskRepo::new();
        let first = repo.create(&new_task(1)).await.unwrap();
        let _second = repo.create(&new_task(2)).await.unwrap();

        let now = Utc::now();
        let claimed = repo.claim_next_pending(now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert!(claimed.in_progress);
        assert_eq!(claimed.in_progress_since, Some(now));

        let reclaimed = repo.claim_next_pending(now).await.unwrap().unwrap();
        assert_ne!(reclaimed.id, first.id);
        assert!(repo.claim_next_pending(now).await.unwrap().is_none());
    }

    #[test]
    async fn mark_in_progress_is_a_compare_and_set() {
        let repo = InMemoryTaskRepo::new();
        let task = repo.create(&new_task(1)).await.unwrap();
        let now = Utc::now();

        assert!(repo.mark_in_progress(task.id, now).await.unwrap());
        assert!(!repo.mark_in_progress(task.id, now).await.unwrap());

        repo.mark_done(task.id, now).await.unwrap();
        assert!(!repo.mark_in_progress(task.id, now).await.unwrap());
    }

    #[test]
    async fn done_is_terminal_and_stamped() {
        let repo = InMemoryTaskRepo::new();
        let task = repo.create(&new_task(1)).await.unwrap();
        let when = Utc::now();
        repo.mark_done(task.id, when).await.unwrap();

        let stored = repo.get(task.id).await.unwrap().unwrap();
        assert!(stored.processed);
        assert!(!stored.in_progress);
        assert_eq!(stored.processed_at, Some(when));
        assert!(!repo.set_in_progress_since(task.id, when).await.unwrap());
    }

    #[test]
    async fn missed_scan_only_sees_old_pending_tasks() {
        let repo = InMemoryTaskRepo::new();
        let old = repo.create(&new_task(1)).await.unwrap();
        let running = repo.create(&new_task(2)).await.unwrap();
        repo.mark_in_progress(running.id, Utc::now()).await.unwrap();

        let threshold = Utc::now() + chrono::Duration::seconds(1);
        let missed = repo.missed(threshold).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].id, old.id);
    }
}
