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
use crate::clients::netsuite::NetSuiteClient;
use crate::config::ImportConfig;
use crate::metrics;
use crate::repo::sync_log::SyncLogRepo;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use granary_common::model::{Integration, ProviderKind, SyncEventStatus};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

/// Module execution order for the NetSuite pipeline.
pub const MODULES: [&str; 11] = [
    "vendors",
    "accounts",
    "transactions",
    "transaction_accounting_lines",
    "transaction_lines",
    "subsidiaries",
    "departments",
    "entities",
    "accounting_periods",
    "locations",
    "budgets",
];

const KEYSET_BATCH_SIZE: usize = 500;
const SUITEQL_PAGE_SIZE: usize = 1000;

/// Cursor over `(LASTMODIFIEDDATE, ID)`. The tuple comparison survives
/// batches that end exactly on a timestamp tie: the next batch starts
/// strictly after the last row even when several rows share a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeysetMarker {
    pub last_modified: String,
    pub id: i64,
}

impl KeysetMarker {
    pub fn clause(&self) -> String {
        format!(
            "AND (LASTMODIFIEDDATE, ID) > (TO_DATE('{}', 'YYYY-MM-DD HH24:MI:SS'), {})",
            self.last_modified, self.id
        )
    }
}

/// Marker for the next batch, taken from the last row of the current one.
pub fn advance_marker(rows: &[Value]) -> Option<KeysetMarker> {
    let last = rows.last()?;
    let id = field_i64(last, "id")?;
    let last_modified = field_str(last, "lastmodifieddate")
        .and_then(parse_netsuite_datetime)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "1970-01-01 00:00:00".to_string());
    Some(KeysetMarker { last_modified, id })
}

/// SuiteQL result keys come back lowercase; be lenient about casing anyway.
fn field_str<'a>(row: &'a Value, key: &str) -> Option<&'a str> {
    row[key]
        .as_str()
        .or_else(|| row[key.to_uppercase()].as_str())
}

fn field_i64(row: &Value, key: &str) -> Option<i64> {
    let value = if row[key].is_null() {
        &row[key.to_uppercase()]
    } else {
        &row[key]
    };
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// NetSuite renders datetimes in several shapes depending on account
/// locale; try the common ones.
pub fn parse_netsuite_datetime(raw: &str) -> Option<DateTime<Utc>> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%m/%d/%Y %H:%M",
        "%m/%d/%Y %I:%M %p",
        "%d/%m/%Y %H:%M",
    ];
    for format in FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(parsed.and_utc());
        }
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(raw, "%m/%d/%Y") {
        return parsed.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Date filter in SuiteQL's own dialect.
pub fn date_clause(field: &str, since: Option<&str>, until: Option<&str>) -> String {
    let mut clause = String::new();
    if let Some(since) = since {
        clause.push_str(&format!(
            " AND {field} >= TO_DATE('{since}', 'YYYY-MM-DD HH24:MI:SS')"
        ));
    }
    if let Some(until) = until {
        clause.push_str(&format!(
            " AND {field} <= TO_DATE('{until}', 'YYYY-MM-DD HH24:MI:SS')"
        ));
    }
    clause
}

pub struct NetSuiteImporter {
    client: NetSuiteClient,
    integration: Integration,
    /// `YYYY-MM-DD HH:MM:SS`, defaulted by the factory to today at
    /// midnight.
    since: String,
    until: Option<String>,
    warehouse: Arc<dyn WarehouseWriter>,
    sync_log: Arc<dyn SyncLogRepo>,
    config: ImportConfig,
}

impl NetSuiteImporter {
    pub fn new(
        client: NetSuiteClient,
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
            since: format!("{since_date} 00:00:00"),
            until: until_date.map(|d| format!("{d} 23:59:59")),
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
            ProviderKind::Netsuite,
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
            .with_label_values(&["netsuite", module])
            .inc_by(count as f64);
        let _ = self
            .sync_log
            .record_import(
                &format!("netsuite_{module}"),
                ProviderKind::Netsuite,
                self.integration.organization_id,
                SyncEventStatus::Success,
                format!("Imported {count} records"),
            )
            .await;
    }

    /// Reference modules are small; they are reloaded from scratch within
    /// the organization scope on every run.
    async fn import_reference(
        &self,
        module: &str,
        table: &str,
        query: String,
        id_key: &str,
    ) -> Result<u64, ImportError> {
        info!(
            "Importing NetSuite {module} for integration {}",
            self.integration.id
        );
        let rows = self.client.query_all(&query, SUITEQL_PAGE_SIZE).await?;

        self.warehouse
            .clear_scope(table, self.integration.organization_id)
            .await?;
        let mut sink = self.sink(table, module, false);
        for row in rows {
            let Some(id) = field_str(&row, id_key).map(|s| s.to_string()).or_else(|| {
                field_i64(&row, id_key).map(|n| n.to_string())
            }) else {
                continue;
            };
            sink.push(WarehouseRow::new(id, row.clone())).await?;
        }
        let count = sink.finish().await?;
        self.log_module_completed(module, count).await;
        Ok(count)
    }

    async fn import_keyset(
        &self,
        module: &str,
        table: &str,
        build_query: impl Fn(Option<&KeysetMarker>) -> String,
    ) -> Result<u64, ImportError> {
        info!(
            "Importing NetSuite {module} incrementally for integration {}",
            self.integration.id
        );
        let mut sink = self.sink(table, module, true);
        let mut marker: Option<KeysetMarker> = None;
        let mut total = 0u64;

        loop {
            let query = build_query(marker.as_ref());
            let rows = self.client.query_batch(&query, KEYSET_BATCH_SIZE).await?;
            if rows.is_empty() {
                break;
            }

            for row in &rows {
                let Some(id) = field_i64(row, "id") else {
                    continue;
                };
                sink.push(WarehouseRow::new(id.to_string(), row.clone()))
                    .await?;
                total += 1;
            }

            let next = advance_marker(&rows);
            info!(
                "Processed {module} batch of {} rows, new marker: {next:?}",
                rows.len()
            );
            if rows.len() < KEYSET_BATCH_SIZE || next.is_none() {
                break;
            }
            marker = next;
        }

        sink.finish().await?;
        self.log_module_completed(module, total).await;
        Ok(total)
    }

    pub async fn import_vendors(&self) -> Result<u64, ImportError> {
        let clause = date_clause("LASTMODIFIEDDATE", Some(&self.since), self.until.as_deref());
        self.import_reference(
            "vendors",
            "netsuite_vendors",
            format!("SELECT * FROM Vendor WHERE 1=1{clause}"),
            "id",
        )
        .await
    }

    pub async fn import_accounts(&self) -> Result<u64, ImportError> {
        let clause = date_clause("lastmodifieddate", Some(&self.since), self.until.as_deref());
        self.import_reference(
            "accounts",
            "netsuite_accounts",
            format!(
                "SELECT id, acctnumber, accountsearchdisplayname, accttype, currency, \
                 parent, isinactive, issummary, lastmodifieddate \
                 FROM account WHERE 1=1{clause} ORDER BY id"
            ),
            "id",
        )
        .await
    }

    pub async fn import_subsidiaries(&self) -> Result<u64, ImportError> {
        let clause = date_clause("lastmodifieddate", Some(&self.since), self.until.as_deref());
        self.import_reference(
            "subsidiaries",
            "netsuite_subsidiaries",
            format!(
                "SELECT id, name, fullname, legalname, iselimination, currency, country, \
                 lastmodifieddate FROM subsidiary WHERE 1=1{clause} ORDER BY id"
            ),
            "id",
        )
        .await
    }

    pub async fn import_departments(&self) -> Result<u64, ImportError> {
        self.import_reference(
            "departments",
            "netsuite_departments",
            "SELECT id, name, fullname, subsidiary, isinactive FROM department ORDER BY id"
                .to_string(),
            "id",
        )
        .await
    }

    pub async fn import_entities(&self) -> Result<u64, ImportError> {
        let clause = date_clause("lastmodifieddate", Some(&self.since), self.until.as_deref());
        self.import_reference(
            "entities",
            "netsuite_entities",
            format!("SELECT * FROM entity WHERE 1=1{clause}"),
            "id",
        )
        .await
    }

    pub async fn import_accounting_periods(&self) -> Result<u64, ImportError> {
        let clause = date_clause("lastmodifieddate", Some(&self.since), self.until.as_deref());
        self.import_reference(
            "accounting_periods",
            "netsuite_accounting_periods",
            format!(
                "SELECT id, periodname, startdate, enddate, closed, isquarter, isyear, \
                 isadjust, isposting, lastmodifieddate \
                 FROM accountingperiod WHERE 1=1{clause} ORDER BY id"
            ),
            "id",
        )
        .await
    }

    pub async fn import_locations(&self) -> Result<u64, ImportError> {
        self.import_reference(
            "locations",
            "netsuite_locations",
            "SELECT id, name, fullname, subsidiary, isinactive FROM location ORDER BY id"
                .to_string(),
            "id",
        )
        .await
    }

    pub async fn import_budgets(&self) -> Result<u64, ImportError> {
        self.import_reference(
            "budgets",
            "netsuite_budgets",
            "SELECT id, accountingperiod, account, category, subsidiary, amount \
             FROM budgets ORDER BY id"
                .to_string(),
            "id",
        )
        .await
    }

    pub async fn import_transactions(&self) -> Result<u64, ImportError> {
        let date_filter =
            date_clause("LASTMODIFIEDDATE", Some(&self.since), self.until.as_deref());
        self.import_keyset("transactions", "netsuite_transactions", move |marker| {
            let marker_clause = marker.map(|m| m.clause()).unwrap_or_default();
            format!(
                "SELECT ID, ABBREVTYPE, APPROVALSTATUS, BILLINGSTATUS, CLOSEDATE, CREATEDBY, \
                 CREATEDDATE, CURRENCY, DUEDATE, ENTITY, EXCHANGERATE, EXTERNALID, \
                 FOREIGNAMOUNTPAID, FOREIGNAMOUNTUNPAID, FOREIGNTOTAL, NUMBER, ISREVERSAL, \
                 LASTMODIFIEDBY, LASTMODIFIEDDATE, POSTING, POSTINGPERIOD, RECORDTYPE, SOURCE, \
                 STATUS, TRANDATE, TRANDISPLAYNAME, TRANID, TRANSACTIONNUMBER, TYPE, VOIDED, MEMO \
                 FROM Transaction \
                 WHERE 1=1{date_filter} {marker_clause} \
                 ORDER BY LASTMODIFIEDDATE ASC, ID ASC \
                 FETCH NEXT {KEYSET_BATCH_SIZE} ROWS ONLY"
            )
        })
        .await
    }

    pub async fn import_transaction_lines(&self) -> Result<u64, ImportError> {
        let date_filter =
            date_clause("LINELASTMODIFIEDDATE", Some(&self.since), self.until.as_deref());
        self.import_keyset(
            "transaction_lines",
            "netsuite_transaction_lines",
            move |marker| {
                let min_id = marker.map(|m| m.id).unwrap_or(0);
                format!(
                    "SELECT ID, TRANSACTION, LINESEQUENCENUMBER, ITEM, ACCOUNT, CLASS, \
                     DEPARTMENT, LOCATION, SUBSIDIARY, ENTITY, MEMO, NETAMOUNT, QUANTITY, \
                     RATE, LINELASTMODIFIEDDATE AS LASTMODIFIEDDATE \
                     FROM TransactionLine \
                     WHERE ID > {min_id}{date_filter} \
                     ORDER BY ID ASC \
                     FETCH NEXT {KEYSET_BATCH_SIZE} ROWS ONLY"
                )
            },
        )
        .await
    }

    pub async fn import_transaction_accounting_lines(&self) -> Result<u64, ImportError> {
        let date_filter =
            date_clause("LASTMODIFIEDDATE", Some(&self.since), self.until.as_deref());
        self.import_keyset(
            "transaction_accounting_lines",
            "netsuite_transaction_accounting_lines",
            move |marker| {
                let min_id = marker.map(|m| m.id).unwrap_or(0);
                format!(
                    "SELECT TRANSACTION AS ID, TRANSACTIONLINE, ACCOUNT, ACCOUNTINGBOOK, \
                     AMOUNT, CREDIT, DEBIT, NETAMOUNT, POSTING, LASTMODIFIEDDATE \
                     FROM TransactionAccountingLine \
                     WHERE TRANSACTION > {min_id}{date_filter} \
                     ORDER BY TRANSACTION ASC \
                     FETCH NEXT {KEYSET_BATCH_SIZE} ROWS ONLY"
                )
            },
        )
        .await
    }
}

#[async_trait]
impl Importer for NetSuiteImporter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Netsuite
    }

    fn modules(&self) -> &'static [&'static str] {
        &MODULES
    }

    async fn run_module(&self, module: &str) -> Result<u64, ImportError> {
        match module {
            "vendors" => self.import_vendors().await,
            "accounts" => self.import_accounts().await,
            "transactions" => self.import_transactions().await,
            "transaction_accounting_lines" => self.import_transaction_accounting_lines().await,
            "transaction_lines" => self.import_transaction_lines().await,
            "subsidiaries" => self.import_subsidiaries().await,
            "departments" => self.import_departments().await,
            "entities" => self.import_entities().await,
            "accounting_periods" => self.import_accounting_periods().await,
            "locations" => self.import_locations().await,
            "budgets" => self.import_budgets().await,
            other => Err(ImportError::UnknownModule(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde_json::json;

    #[test]
    fn marker_advances_past_a_timestamp_tie() {
        // The last two rows share a timestamp; the tuple marker must carry
        // the id so the next batch starts strictly after id 900.
        let rows = vec![
            json!({"id": "898", "lastmodifieddate": "2024-01-03 11:59:00"}),
            json!({"id": "899", "lastmodifieddate": "2024-01-03 12:00:00"}),
            json!({"id": "900", "lastmodifieddate": "2024-01-03 12:00:00"}),
        ];
        let marker = advance_marker(&rows).unwrap();
        assert_eq!(marker.last_modified, "2024-01-03 12:00:00");
        assert_eq!(marker.id, 900);
        assert_eq!(
            marker.clause(),
            "AND (LASTMODIFIEDDATE, ID) > (TO_DATE('2024-01-03 12:00:00', 'YYYY-MM-DD HH24:MI:SS'), 900)"
        );
    }

    #[test]
    fn marker_of_an_empty_batch_is_none() {
        assert_eq!(advance_marker(&[]), None);
    }

    #[test]
    fn marker_without_a_timestamp_falls_back_to_the_epoch() {
        let rows = vec![json!({"id": 7})];
        let marker = advance_marker(&rows).unwrap();
        assert_eq!(marker.last_modified, "1970-01-01 00:00:00");
        assert_eq!(marker.id, 7);
    }

    #[test]
    fn date_clause_uses_the_suiteql_dialect() {
        assert_eq!(
            date_clause("LASTMODIFIEDDATE", Some("2024-01-01 00:00:00"), None),
            " AND LASTMODIFIEDDATE >= TO_DATE('2024-01-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS')"
        );
        assert_eq!(
            date_clause(
                "LASTMODIFIEDDATE",
                Some("2024-01-01 00:00:00"),
                Some("2024-02-01 23:59:59")
            ),
            " AND LASTMODIFIEDDATE >= TO_DATE('2024-01-01 00:00:00', 'YYYY-MM-DD HH24:MI:SS') \
             AND LASTMODIFIEDDATE <= TO_DATE('2024-02-01 23:59:59', 'YYYY-MM-DD HH24:MI:SS')"
        );
        assert_eq!(date_clause("LASTMODIFIEDDATE", None, None), "");
    }

    #[test]
    fn netsuite_datetimes_parse_across_locales() {
        assert!(parse_netsuite_datetime("2024-01-03 12:00:00").is_some());
        assert!(parse_netsuite_datetime("1/3/2024 12:00").is_some());
        assert!(parse_netsuite_datetime("1/3/2024").is_some());
        assert!(parse_netsuite_datetime("not a date").is_none());
    }

    #[test]
    fn mixed_case_fields_resolve() {
        let row = json!({"ID": 12, "LASTMODIFIEDDATE": "2024-01-03 12:00:00"});
        assert_eq!(field_i64(&row, "id"), Some(12));
        assert_eq!(field_str(&row, "lastmodifieddate"), Some("2024-01-03 12:00:00"));
    }
}
