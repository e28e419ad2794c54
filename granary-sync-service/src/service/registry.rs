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

//! Static provider registry: which modules each provider kind offers, in
//! pipeline order, and how to construct its importer. Built from code at
//! startup; there is no runtime discovery.

use crate::clients::netsuite::NetSuiteClient;
use crate::clients::toast::ToastClient;
use crate::clients::xero::XeroClient;
use crate::config::ImportConfig;
use crate::import::netsuite::NetSuiteImporter;
use crate::import::toast::ToastImporter;
use crate::import::warehouse::WarehouseWriter;
use crate::import::xero::XeroImporter;
use crate::import::{netsuite, toast, xero, ImportError, Importer};
use crate::repo::sync_log::SyncLogRepo;
use crate::service::token_refresh::TokenService;
use chrono::NaiveDate;
use granary_common::model::{Integration, ProviderKind};
use granary_common::retries::RetryConfig;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct ProviderSpec {
    pub modules: &'static [&'static str],
    pub has_full_import: bool,
}

pub fn provider_spec(provider: ProviderKind) -> ProviderSpec {
    match provider {
        ProviderKind::Xero => ProviderSpec {
            modules: &xero::MODULES,
            has_full_import: true,
        },
        ProviderKind::Netsuite => ProviderSpec {
            modules: &netsuite::MODULES,
            has_full_import: false,
        },
        ProviderKind::Toast => ProviderSpec {
            modules: &toast::MODULES,
            has_full_import: false,
        },
    }
}

/// Builds the provider-specific importer for an integration and a date
/// window.
pub struct ImporterFactory {
    http: reqwest::Client,
    tokens: Arc<TokenService>,
    warehouse: Arc<dyn WarehouseWriter>,
    sync_log: Arc<dyn SyncLogRepo>,
    retry: RetryConfig,
    import_config: ImportConfig,
}

impl ImporterFactory {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<TokenService>,
        warehouse: Arc<dyn WarehouseWriter>,
        sync_log: Arc<dyn SyncLogRepo>,
        retry: RetryConfig,
        import_config: ImportConfig,
    ) -> Self {
        Self {
            http,
            tokens,
            warehouse,
            sync_log,
            retry,
            import_config,
        }
    }

    pub fn importer(
        &self,
        integration: &Integration,
        since_date: NaiveDate,
        until_date: Option<NaiveDate>,
    ) -> Result<Box<dyn Importer>, ImportError> {
        match integration.provider {
            ProviderKind::Xero => {
                let client = XeroClient::new(
                    self.http.clone(),
                    integration.clone(),
                    self.tokens.clone(),
                    self.retry.clone(),
                );
                Ok(Box::new(XeroImporter::new(
                    client,
                    integration.clone(),
                    since_date,
                    until_date,
                    self.warehouse.clone(),
                    self.sync_log.clone(),
                    self.import_config.clone(),
                )))
            }
            ProviderKind::Netsuite => {
                let client = NetSuiteClient::new(
                    self.http.clone(),
                    integration.clone(),
                    self.tokens.clone(),
                    self.retry.clone(),
                )?;
                Ok(Box::new(NetSuiteImporter::new(
                    client,
                    integration.clone(),
                    since_date,
                    until_date,
                    self.warehouse.clone(),
                    self.sync_log.clone(),
                    self.import_config.clone(),
                )))
            }
            ProviderKind::Toast => {
                let client = ToastClient::new(
                    self.http.clone(),
                    integration.clone(),
                    self.tokens.clone(),
                    self.retry.clone(),
                )?;
                Ok(Box::new(ToastImporter::new(
                    client,
                    integration.clone(),
                    since_date,
                    until_date,
                    self.warehouse.clone(),
                    self.sync_log.clone(),
                    self.import_config.clone(),
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn every_provider_declares_modules() {
        for provider in [
            ProviderKind::Xero,
            ProviderKind::Netsuite,
            ProviderKind::Toast,
        ] {
            let spec = provider_spec(provider);
            assert!(!spec.modules.is_empty());
        }
    }

    #[test]
    fn module_names_are_unique_within_a_provider() {
        for provider in [
            ProviderKind::Xero,
            ProviderKind::Netsuite,
            ProviderKind::Toast,
        ] {
            let spec = provider_spec(provider);
            let mut names: Vec<_> = spec.modules.to_vec();
            names.sort();
            names.dedup();
            assert_eq!(names.len(), spec.modules.len());
        }
    }
}
