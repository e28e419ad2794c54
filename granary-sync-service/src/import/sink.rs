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

use super::warehouse::{WarehouseRow, WarehouseWriter};
use super::ImportError;
use crate::repo::sync_log::SyncLogRepo;
use granary_common::model::{OrganizationId, ProviderKind, SyncEventStatus};
use tracing::debug;

/// Buffered writer in front of the warehouse. Rows are flushed in
/// fixed-size batches, each batch an independent atomic write, so any batch
/// boundary is a safe crash point: a restart redoes at most the in-flight
/// batch and skips nothing. Long imports emit a heartbeat log event every
/// few batches so the monitors can tell slow from hung.
pub struct BatchSink<'a> {
    warehouse: &'a dyn WarehouseWriter,
    sync_log: &'a dyn SyncLogRepo,
    table: &'a str,
    module: &'a str,
    provider: ProviderKind,
    organization_id: OrganizationId,
    batch_size: usize,
    heartbeat_every: u32,
    buffer: Vec<WarehouseRow>,
    written: u64,
    flushes: u32,
}

impl<'a> BatchSink<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        warehouse: &'a dyn WarehouseWriter,
        sync_log: &'a dyn SyncLogRepo,
        table: &'a str,
        module: &'a str,
        provider: ProviderKind,
        organization_id: OrganizationId,
        batch_size: usize,
        heartbeat_every: u32,
    ) -> Self {
        Self {
            warehouse,
            sync_log,
            table,
            module,
            provider,
            organization_id,
            batch_size: batch_size.max(1),
            heartbeat_every: heartbeat_every.max(1),
            buffer: Vec::new(),
            written: 0,
            flushes: 0,
        }
    }

    pub async fn push(&mut self, row: WarehouseRow) -> Result<(), ImportError> {
        self.buffer.push(row);
        if self.buffer.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ImportError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let written = self
            .warehouse
            .upsert(self.table, self.organization_id, &batch)
            .await?;
        self.written += written;
        self.flushes += 1;
        debug!(
            "Flushed batch {} of {} ({} rows so far)",
            self.flushes, self.table, self.written
        );

        if self.flushes % self.heartbeat_every == 0 {
            let _ = self
                .sync_log
                .record_import(
                    self.module,
                    self.provider,
                    self.organization_id,
                    SyncEventStatus::Started,
                    format!(
                        "heartbeat after {} batches ({} rows)",
                        self.flushes, self.written
                    ),
                )
                .await;
        }
        Ok(())
    }

    /// Flushes the remainder and returns the total row count written.
    pub async fn finish(mut self) -> Result<u64, ImportError> {
        self.flush().await?;
        Ok(self.written)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::import::warehouse::InMemoryWarehouseWriter;
    use crate::repo::sync_log::InMemorySyncLogRepo;
    use serde_json::json;

    #[test]
    async fn rows_flush_in_batches_and_finish_drains() {
        let warehouse = InMemoryWarehouseWriter::new();
        let sync_log = InMemorySyncLogRepo::new();
        let mut sink = BatchSink::new(
            &warehouse,
            &sync_log,
            "toast_orders",
            "orders",
            ProviderKind::Toast,
            OrganizationId(1),
            3,
            100,
        );

        for i in 0..7 {
            sink.push(WarehouseRow::new(format!("o-{i}"), json!({ "i": i })))
                .await
                .unwrap();
        }
        let written = sink.finish().await.unwrap();

        assert_eq!(written, 7);
        assert_eq!(warehouse.rows("toast_orders", OrganizationId(1)).len(), 7);
    }

    #[test]
    async fn heartbeats_fire_every_n_batches() {
        let warehouse = InMemoryWarehouseWriter::new();
        let sync_log = InMemorySyncLogRepo::new();
        let mut sink = BatchSink::new(
            &warehouse,
            &sync_log,
            "netsuite_transactions",
            "transactions",
            ProviderKind::Netsuite,
            OrganizationId(1),
            1,
            2,
        );

        for i in 0..5 {
            sink.push(WarehouseRow::new(format!("t-{i}"), json!({})))
                .await
                .unwrap();
        }
        sink.finish().await.unwrap();

        // 5 single-row batches with a heartbeat every 2 flushes.
        let heartbeats = sync_log.events_for("transactions");
        assert_eq!(heartbeats.len(), 2);
        assert!(heartbeats
            .iter()
            .all(|e| e.status == SyncEventStatus::Started));
    }

    #[test]
    async fn redoing_a_batch_does_not_duplicate_rows() {
        let warehouse = InMemoryWarehouseWriter::new();
        let sync_log = InMemorySyncLogRepo::new();

        for _ in 0..2 {
            let mut sink = BatchSink::new(
                &warehouse,
                &sync_log,
                "xero_invoices",
                "invoices",
                ProviderKind::Xero,
                OrganizationId(1),
                2,
                100,
            );
            for i in 0..4 {
                sink.push(WarehouseRow::new(format!("inv-{i}"), json!({ "i": i })))
                    .await
                    .unwrap();
            }
            sink.finish().await.unwrap();
        }

        assert_eq!(warehouse.rows("xero_invoices", OrganizationId(1)).len(), 4);
    }
}
