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
use crate::clients::toast::ToastClient;
use crate::config::ImportConfig;
use crate::metrics;
use crate::repo::sync_log::SyncLogRepo;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use granary_common::model::{Integration, ProviderKind, SyncEventStatus};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Module execution order for the Toast pipeline.
pub const MODULES: [&str; 7] = [
    "orders",
    "restaurant_info",
    "revenue_centers",
    "service_areas",
    "restaurant_services",
    "sales_categories",
    "dining_options",
];

pub struct ToastImporter {
    client: ToastClient,
    integration: Integration,
    start: NaiveDateTime,
    end: NaiveDateTime,
    warehouse: Arc<dyn WarehouseWriter>,
    sync_log: Arc<dyn SyncLogRepo>,
    config: ImportConfig,
}

impl ToastImporter {
    pub fn new(
        client: ToastClient,
        integration: Integration,
        since_date: NaiveDate,
        until_date: Option<NaiveDate>,
        warehouse: Arc<dyn WarehouseWriter>,
        sync_log: Arc<dyn SyncLogRepo>,
        config: ImportConfig,
    ) -> Self {
        let (start, end) = order_window(since_date, until_date);
        Self {
            client,
            integration,
            start,
            end,
            warehouse,
            sync_log,
            config,
        }
    }

    fn sink<'a>(&'a self, table: &'a str, module: &'a str) -> BatchSink<'a> {
        BatchSink::new(
            self.warehouse.as_ref(),
            self.sync_log.as_ref(),
            table,
            module,
            ProviderKind::Toast,
            self.integration.organization_id,
            self.config.batch_size_rows,
            self.config.heartbeat_every_batches,
        )
    }

    async fn log_module_completed(&self, module: &str, count: u64) {
        metrics::IMPORTED_ROWS_TOTAL
            .with_label_values(&["toast", module])
            .inc_by(count as f64);
        let _ = self
            .sync_log
            .record_import(
                &format!("toast_{module}"),
                ProviderKind::Toast,
                self.integration.organization_id,
                SyncEventStatus::Success,
                format!("Imported {count} records"),
            )
            .await;
    }

    async fn guids(&self) -> Result<Vec<String>, ImportError> {
        let guids = self.client.restaurant_guids().await?;
        if guids.is_empty() {
            return Err(ImportError::Provider(
                "No restaurant GUIDs found for this integration".to_string(),
            ));
        }
        Ok(guids)
    }

    pub async fn import_orders(&self) -> Result<u64, ImportError> {
        info!(
            "Importing Toast orders for integration {} from {} to {}",
            self.integration.id, self.start, self.end
        );
        let mut sink = self.sink("toast_orders", "orders");
        for guid in self.guids().await? {
            let orders = self.client.orders_bulk(&guid, self.start, self.end).await?;
            for order in orders {
                let Some(order_guid) = order["guid"].as_str() else {
                    warn!("Skipping order without a guid for restaurant {guid}");
                    continue;
                };
                let mut payload = order.clone();
                if let Some(object) = payload.as_object_mut() {
                    object.insert("restaurantGuid".to_string(), Value::from(guid.as_str()));
                }
                sink.push(WarehouseRow::new(order_guid, payload)).await?;
            }
        }
        let count = sink.finish().await?;
        self.log_module_completed("orders", count).await;
        Ok(count)
    }

    pub async fn import_restaurant_info(&self) -> Result<u64, ImportError> {
        info!(
            "Importing Toast restaurant info for integration {}",
            self.integration.id
        );
        let mut sink = self.sink("toast_restaurants", "restaurant_info");
        for guid in self.guids().await? {
            let info = self.client.restaurant_info(&guid).await?;
            sink.push(WarehouseRow::new(guid.as_str(), info)).await?;
        }
        let count = sink.finish().await?;
        self.log_module_completed("restaurant_info", count).await;
        Ok(count)
    }

    async fn import_config_collection(
        &self,
        module: &str,
        table: &str,
        collection: &str,
    ) -> Result<u64, ImportError> {
        info!(
            "Importing Toast {module} for integration {}",
            self.integration.id
        );
        let mut sink = self.sink(table, module);
        for guid in self.guids().await? {
            let items = self.client.config_collection(&guid, collection).await?;
            for item in items {
                let Some(item_guid) = item["guid"].as_str() else {
                    continue;
                };
                // Config guids are only unique per restaurant.
                let key = format!("{guid}:{item_guid}");
                sink.push(WarehouseRow::new(key, item.clone())).await?;
            }
        }
        let count = sink.finish().await?;
        self.log_module_completed(module, count).await;
        Ok(count)
    }
}

/// Orders are pulled from the since date at midnight up to the end of the
/// until date; with no upper bound the window closes at the next midnight
/// after the start.
pub fn order_window(
    since_date: NaiveDate,
    until_date: Option<NaiveDate>,
) -> (NaiveDateTime, NaiveDateTime) {
    let start = since_date.and_hms_opt(0, 0, 0).expect("midnight exists");
    let end_date = until_date.unwrap_or(since_date);
    let end = end_date.and_hms_opt(0, 0, 0).expect("midnight exists") + ChronoDuration::days(1);
    (start, end)
}

#[async_trait]
impl Importer for ToastImporter {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Toast
    }

    fn modules(&self) -> &'static [&'static str] {
        &MODULES
    }

    async fn run_module(&self, module: &str) -> Result<u64, ImportError> {
        match module {
            "orders" => self.import_orders().await,
            "restaurant_info" => self.import_restaurant_info().await,
            "revenue_centers" => {
                self.import_config_collection(
                    "revenue_centers",
                    "toast_revenue_centers",
                    "revenueCenters",
                )
                .await
            }
            "service_areas" => {
                self.import_config_collection(
                    "service_areas",
                    "toast_service_areas",
                    "serviceAreas",
                )
                .await
            }
            "restaurant_services" => {
                self.import_config_collection(
                    "restaurant_services",
                    "toast_restaurant_services",
                    "restaurantServices",
                )
                .await
            }
            "sales_categories" => {
                self.import_config_collection(
                    "sales_categories",
                    "toast_sales_categories",
                    "salesCategories",
                )
                .await
            }
            "dining_options" => {
                self.import_config_collection(
                    "dining_options",
                    "toast_dining_options",
                    "diningOptions",
                )
                .await
            }
            other => Err(ImportError::UnknownModule(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn default_window_covers_one_business_day() {
        let day = NaiveDate::from_ymd_opt(2025, 5, 4).unwrap();
        let (start, end) = order_window(day, None);
        assert_eq!(start, day.and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(
            end,
            NaiveDate::from_ymd_opt(2025, 5, 5)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
    }

    #[test]
    fn bounded_window_ends_after_the_until_date() {
        let since = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        let until = NaiveDate::from_ymd_opt(2025, 5, 3).unwrap();
        let (start, end) = order_window(since, Some(until));
        assert_eq!(start, since.and_hms_opt(0, 0, 0).unwrap());
        assert_eq!(
            end,
            NaiveDate::from_ymd_opt(2025, 5, 4)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
    }
}
