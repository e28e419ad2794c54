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
use granary_common::model::OrganizationId;
use granary_common::SafeDisplay;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    #[error("Warehouse write failed: {0}")]
    Write(String),
}

impl From<sqlx::Error> for WarehouseError {
    fn from(error: sqlx::Error) -> Self {
        WarehouseError::Write(error.to_string())
    }
}

impl SafeDisplay for WarehouseError {
    fn to_safe_string(&self) -> String {
        "Warehouse write failed".to_string()
    }
}

/// One raw provider record addressed by its natural key within an
/// organization scope.
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseRow {
    pub natural_key: String,
    pub payload: serde_json::Value,
}

impl WarehouseRow {
    pub fn new(natural_key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            natural_key: natural_key.into(),
            payload,
        }
    }
}

/// Writer for raw provider records. Upserts on the natural key so
/// re-processing a page is a no-op, which is what makes batch-level retry
/// safe.
#[async_trait]
pub trait WarehouseWriter: Send + Sync {
    async fn upsert(
        &self,
        table: &str,
        organization_id: OrganizationId,
        rows: &[WarehouseRow],
    ) -> Result<u64, WarehouseError>;

    /// Removes an organization's rows from a table; reference modules use
    /// this for drop-and-reload.
    async fn clear_scope(
        &self,
        table: &str,
        organization_id: OrganizationId,
    ) -> Result<u64, WarehouseError>;
}

pub struct PostgresWarehouseWriter {
    db_pool: Pool<Postgres>,
}

impl PostgresWarehouseWriter {
    pub fn new(db_pool: Pool<Postgres>) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl WarehouseWriter for PostgresWarehouseWriter {
    async fn upsert(
        &self,
        table: &str,
        organization_id: OrganizationId,
        rows: &[WarehouseRow],
    ) -> Result<u64, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // One transaction per batch; a failed batch leaves earlier batches
        // committed and is safe to redo.
        let mut tx = self.db_pool.begin().await?;
        let now = Utc::now();
        for row in rows {
            sqlx::query(
                r#"
                  INSERT INTO warehouse_rows
                    (table_name, organization_id, natural_key, payload, ingested_at)
                  VALUES
                    ($1, $2, $3, $4, $5)
                  ON CONFLICT (table_name, organization_id, natural_key) DO UPDATE
                  SET payload = $4,
                      ingested_at = $5
                "#,
            )
            .bind(table)
            .bind(organization_id.0)
            .bind(row.natural_key.as_str())
            .bind(&row.payload)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn clear_scope(
        &self,
        table: &str,
        organization_id: OrganizationId,
    ) -> Result<u64, WarehouseError> {
        let result = sqlx::query(
            "DELETE FROM warehouse_rows WHERE table_name = $1 AND organization_id = $2",
        )
        .bind(table)
        .bind(organization_id.0)
        .execute(&self.db_pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// In-memory warehouse for tests and local runs.
#[derive(Default)]
pub struct InMemoryWarehouseWriter {
    rows: Mutex<HashMap<(String, i64), HashMap<String, serde_json::Value>>>,
}

impl InMemoryWarehouseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self, table: &str, organization_id: OrganizationId) -> Vec<WarehouseRow> {
        let rows = self.rows.lock().unwrap();
        rows.get(&(table.to_string(), organization_id.0))
            .map(|scope| {
                let mut collected: Vec<WarehouseRow> = scope
                    .iter()
                    .map(|(key, payload)| WarehouseRow::new(key.clone(), payload.clone()))
                    .collect();
                collected.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
                collected
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl WarehouseWriter for InMemoryWarehouseWriter {
    async fn upsert(
        &self,
        table: &str,
        organization_id: OrganizationId,
        rows: &[WarehouseRow],
    ) -> Result<u64, WarehouseError> {
        let mut stored = self.rows.lock().unwrap();
        let scope = stored
            .entry((table.to_string(), organization_id.0))
            .or_default();
        for row in rows {
            scope.insert(row.natural_key.clone(), row.payload.clone());
        }
        Ok(rows.len() as u64)
    }

    async fn clear_scope(
        &self,
        table: &str,
        organization_id: OrganizationId,
    ) -> Result<u64, WarehouseError> {
        let mut stored = self.rows.lock().unwrap();
        Ok(stored
            .remove(&(table.to_string(), organization_id.0))
            .map(|scope| scope.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde_json::json;

    #[test]
    async fn upsert_is_idempotent_on_the_natural_key() {
        let warehouse = InMemoryWarehouseWriter::new();
        let org = OrganizationId(1);

        warehouse
            .upsert(
                "xero_accounts",
                org,
                &[
                    WarehouseRow::new("a-1", json!({"Name": "Sales"})),
                    WarehouseRow::new("a-2", json!({"Name": "Rent"})),
                ],
            )
            .await
            .unwrap();
        warehouse
            .upsert(
                "xero_accounts",
                org,
                &[WarehouseRow::new("a-1", json!({"Name": "Sales (renamed)"}))],
            )
            .await
            .unwrap();

        let rows = warehouse.rows("xero_accounts", org);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload["Name"], "Sales (renamed)");
    }

    #[test]
    async fn clear_scope_only_touches_one_organization() {
        let warehouse = InMemoryWarehouseWriter::new();
        warehouse
            .upsert(
                "netsuite_vendors",
                OrganizationId(1),
                &[WarehouseRow::new("v-1", json!({}))],
            )
            .await
            .unwrap();
        warehouse
            .upsert(
                "netsuite_vendors",
                OrganizationId(2),
                &[WarehouseRow::new("v-1", json!({}))],
            )
            .await
            .unwrap();

        warehouse
            .clear_scope("netsuite_vendors", OrganizationId(1))
            .await
            .unwrap();

        assert!(warehouse.rows("netsuite_vendors", OrganizationId(1)).is_empty());
        assert_eq!(warehouse.rows("netsuite_vendors", OrganizationId(2)).len(), 1);
    }
}
