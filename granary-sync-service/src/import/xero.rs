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

use super::sink::BatchSink;
use super::warehouse::{WarehouseRow, WarehouseWriter};
use super::{ImportError, Importer};
use crate::clients::xero::XeroClient;
use crate::config::ImportConfig;
use crate::metrics;
use crate::repo::sync_log::SyncLogRepo;
use async_trait::async_trait;
use chrono::NaiveDate;
use granary_common::model::{Integration, ProviderKind, SyncEventStatus};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Module execution order for the Xero pipeline.
pub const MODULES: [&str; 6] = [
    "accounts",
    "journal_lines",
    "contacts",
    "invoices",
    "bank_transactions",
    "budgets",
];

pub struct XeroImporter {
    client: XeroClient,
    integration: Integration,
    since_date: NaiveDate,
    until_date: Option<NaiveDate>,
    warehouse: Arc<dyn WarehouseWriter>,
    sync_log: Arc<dyn SyncLogRepo>,
    config: ImportConfig,
}

impl XeroImporter {
    pub fn new(
        client: XeroClient,
        integration: Integration,
        since_date: NaiveDate,
        until_date: Option<NaiveDate>,
        warehouse: Arc<dyn WarehouseWriter>,
        sync_log: Arc<dyn SyncLogRepo>,
        config: ImportConfig,
    ) -> Self {
        Self {
            client,
            integration,
            since_date,
            until_date,
            warehouse,
            sync_log,
            config,
        }
    }

    fn sink<'a>(&'a self, table: &'a str, module: &'a str, heavy: bool) -> BatchSink<'a> {
        BatchSink::new(
            self.warehouse.as_ref(),
            self.sync_log.as_ref(),
            table,
            module,
            ProviderKind::Xero,
            self.integration.organization_id,
            if heavy {
                self.config.batch_size_heavy
            } else {
                self.config.batch_size_rows
            },
            self.config.heartbeat_every_batches,
        )
    }

    async fn log_module_completed(&self, module: &str, count: u64) {
        metrics::IMPORTED_ROWS_TOTAL
            .with_label_values(&["xero", module])
            .inc_by(count as f64);
        let _ = self
            .sync_log
            .record_import(
                &format!("xero_{module}"),
                ProviderKind::Xero,
                self.integration.organization_id,
                SyncEventStatus::Success,
                format!("Imported {count} records"),
            )
            .await;
    }

    async fn import_keyed_collection(
        &self,
        module: &str,
        table: &str,
        path: &str,
        result_key: &str,
        id_field: &str,
        paginated: bool,
    ) -> Result<u64, ImportError> {
        info!("Importing Xero {module} for integration {}", self.integration.id);
        let records = if paginated {
            self.client
                .get_paginated(path, result_key, Some(self.since_date))
                .await?
        } else {
            self.client
                .get_collection(path, result_key, Some(self.since_date))
                .await?
        };

        let mut sink = self.sink(table, module, false);
        for record in records {
            let Some(id) = record[id_field].as_str() else {
                warn!("{result_key} entry missing {id_field}, skipping record");
                continue;
            };
            sink.push(WarehouseRow::new(id, record.clone())).await?;
        }
        let count = sink.finish().await?;
        self.log_module_completed(module, count).await;
        Ok(count)
    }

    pub async fn sync_chart_of_accounts(&self) -> Result<u64, ImportError> {
        self.import_keyed_collection(
            "accounts",
            "xero_accounts",
            "Accounts",
            "Accounts",
            "AccountID",
            false,
        )
        .await
    }

    /// Journals paginate with an offset cursor: the next page starts after
    /// the highest journal number seen so far.
    pub async fn import_journal_lines(&self) -> Result<u64, ImportError> {
        info!(
            "Importing Xero journals and lines for integration {}",
            self.integration.id
        );
        let mut journal_sink = self.sink("xero_journals", "journal_lines", false);
        let mut line_sink = self.sink("xero_journal_lines", "journal_lines", true);
        let mut offset: Option<i64> = None;
        let mut line_count = 0u64;

        loop {
            let journals = self
                .client
                .get_journals(offset, Some(self.since_date))
                .await?;
            if journals.is_empty() {
                break;
            }
            info!("Fetched {} journals", journals.len());

            for journal in &journals {
                let Some(journal_id) = journal["JournalID"].as_str() else {
                    warn!("Skipping journal with no JournalID");
                    continue;
                };
                journal_sink
                    .push(WarehouseRow::new(journal_id, journal.clone()))
                    .await?;

                for line in journal["JournalLines"].as_array().into_iter().flatten() {
                    let Some(line_id) = line["JournalLineID"].as_str() else {
                        warn!("Skipping line in journal {journal_id} with no JournalLineID");
                        continue;
                    };
                    let mut payload = line.clone();
                    if let Some(object) = payload.as_object_mut() {
                        object.insert("JournalID".to_string(), Value::from(journal_id));
                        object.insert(
                            "JournalNumber".to_string(),
                            journal["JournalNumber"].clone(),
                        );
                        object.insert("JournalDate".to_string(), journal["JournalDate"].clone());
                    }
                    line_sink.push(WarehouseRow::new(line_id, payload)).await?;
                    line_count += 1;
                }
            }

            offset = next_journal_offset(&journals);
            if offset.is_none() {
                break;
            }
        }

        let journal_count = journal_sink.finish().await?;
        line_sink.finish().await?;
        self.log_module_completed("journal_lines", journal_count + line_count)
            .await;
        Ok(journal_count + line_count)
    }

    pub async fn import_contacts(&self) -> Result<u64, ImportError> {
        self.import_keyed_collection(
            "contacts",
            "xero_contacts",
            "Contacts",
            "Contacts",
            "ContactID",
            true,
        )
        .await
    }

    pub async fn import_invoices(&self) -> Result<u64, ImportError> {
        self.import_keyed_collection(
            "invoices",
            "xero_invoices",
            "Invoices",
            "Invoices",
            "InvoiceID",
            true,
        )
        .await
    }

    pub async fn import_bank_transactions(&self) -> Result<u64, ImportError> {
        self.import_keyed_collection(
            "bank_transactions",
            "xero_bank_transactions",
            "BankTransactions",
            "BankTransactions",
            "BankTransactionID",
            true,
        )
        .await
    }

    /// Budgets honor the until date: each budget's period balances are
    /// bounded by the requested window.
    pub async fn import_budgets(&self) -> Result<u64, ImportError> {
        info!("Importing Xero budgets for integration {}", self.integration.id);
        let budgets = self
            .client
            .get_collection("Budgets", "Budgets", Some(self.since_date))
            .await?;

        let mut sink = self.sink("xero_budgets", "budgets", false);
        for budget in budgets {
            let Some(id) = budget["BudgetID"].as_str() else {
                warn!("Budget entry missing BudgetID, skipping record");
                continue;
            };
            let mut payload = budget.clone();
            if let (Some(object), Some(until)) = (payload.as_object_mut(), self.until_date) {
                object.insert("PeriodEnd".to_string(), Value::from(until.to_string()));
            }
            sink.push(WarehouseRow::new(id, payload)).await?;
        }
        let count = sink.finish().await?;
        self.log_module_completed("budgets", count).await;
        Ok(count)
    }
}

/// The next Journals request continues after the highest journal number of
/// the page; a page without journal numbers ends the scan.
pub fn next_journal_offset(journals: &[Value]) -> Option<i64> {
    journals
        .iter()
        .filter_map(|j| j["JournalNumber"].as_i64())
        .max()
}

#[async_trait]
impl Importer for XeroImporter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Xero
    }

    fn modules(&self) -> &'static [&'static str] {
        &MODULES
    }

    async fn run_module(&self, module: &str) -> Result<u64, ImportError> {
        match module {
            "accounts" => self.sync_chart_of_accounts().await,
            "journal_lines" => self.import_journal_lines().await,
            "contacts" => self.import_contacts().await,
            "invoices" => self.import_invoices().await,
            "bank_transactions" => self.import_bank_transactions().await,
            "budgets" => self.import_budgets().await,
            other => Err(ImportError::UnknownModule(other.to_string())),
        }
    }

    fn supports_full_import(&self) -> bool {
        true
    }

    async fn full_import(&self) -> Result<u64, ImportError> {
        let mut total = 0u64;
        for module in MODULES {
            total += self.run_module(module).await?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde_json::json;

    #[test]
    fn journal_offset_advances_to_the_highest_number() {
        let journals = vec![
            json!({"JournalID": "a", "JournalNumber": 17}),
            json!({"JournalID": "b", "JournalNumber": 42}),
            json!({"JournalID": "c", "JournalNumber": 23}),
        ];
        assert_eq!(next_journal_offset(&journals), Some(42));
    }

    #[test]
    fn journal_offset_stops_without_numbers() {
        let journals = vec![json!({"JournalID": "a"})];
        assert_eq!(next_journal_offset(&journals), None);
        assert_eq!(next_journal_offset(&[]), None);
    }
}
