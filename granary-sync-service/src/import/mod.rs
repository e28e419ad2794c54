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

pub mod netsuite;
pub mod sink;
pub mod toast;
pub mod warehouse;
pub mod xero;

use crate::clients::HttpClientError;
use async_trait::async_trait;
use granary_common::model::ProviderKind;
use granary_common::SafeDisplay;
use granary_service_base::repo::RepoError;
use warehouse::WarehouseError;

#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error(transparent)]
    Http(#[from] HttpClientError),
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("Unknown module: {0}")]
    UnknownModule(String),
    #[error("Provider data error: {0}")]
    Provider(String),
}

impl SafeDisplay for ImportError {
    fn to_safe_string(&self) -> String {
        match self {
            ImportError::Http(inner) => inner.to_safe_string(),
            ImportError::Warehouse(inner) => inner.to_safe_string(),
            ImportError::Repo(inner) => inner.to_safe_string(),
            ImportError::UnknownModule(_) => self.to_string(),
            ImportError::Provider(_) => self.to_string(),
        }
    }
}

/// A provider-specific extract-and-load pipeline, organized by module (the
/// finest unit of user-selectable import work). Module execution is
/// idempotent with respect to the warehouse: re-running a module over the
/// same date window rewrites the same rows.
#[async_trait]
pub trait Importer: Send + Sync {
    fn provider(&self) -> ProviderKind;

    /// Module names in pipeline execution order.
    fn modules(&self) -> &'static [&'static str];

    /// Runs one module and returns the number of records imported.
    async fn run_module(&self, module: &str) -> Result<u64, ImportError>;

    /// Whether the provider defines a dedicated whole-dataset import (used
    /// when a task selects no modules).
    fn supports_full_import(&self) -> bool {
        false
    }

    async fn full_import(&self) -> Result<u64, ImportError> {
        Err(ImportError::UnknownModule("full_import".to_string()))
    }
}
