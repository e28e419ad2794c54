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

pub mod dispatcher;
pub mod hp_dispatcher;
pub mod monitor;
pub mod registry;
pub mod slots;
pub mod token_refresh;

use crate::config::SyncServiceConfig;
use crate::import::warehouse::{PostgresWarehouseWriter, WarehouseWriter};
use crate::worker::Interruptibility;
use crate::repo::organization::{DbOrganizationRepo, OrganizationRepo};
use crate::repo::sync_log::{DbSyncLogRepo, SyncLogRepo};
use crate::repo::task::{DbTaskRepo, TaskRepo};
use crate::repo::token::{DbTokenRepo, TokenRepo};
use dispatcher::StandardDispatcher;
use granary_service_base::db;
use granary_service_base::queue::redis::RedisTaskQueue;
use granary_service_base::queue::TaskQueue;
use granary_service_base::storage::keyvalue::redis::RedisKeyValueStorage;
use granary_service_base::storage::keyvalue::KeyValueStorage;
use hp_dispatcher::HighPriorityDispatcher;
use monitor::Monitors;
use registry::ImporterFactory;
use slots::DispatchSlots;
use std::sync::Arc;
use token_refresh::TokenService;

#[derive(Clone)]
pub struct Services {
    pub config: SyncServiceConfig,
    pub storage: Arc<dyn KeyValueStorage>,
    pub queue: Arc<dyn TaskQueue>,
    pub organization_repo: Arc<dyn OrganizationRepo>,
    pub task_repo: Arc<dyn TaskRepo>,
    pub token_repo: Arc<dyn TokenRepo>,
    pub sync_log: Arc<dyn SyncLogRepo>,
    pub warehouse: Arc<dyn WarehouseWriter>,
    pub slots: DispatchSlots,
    pub dispatcher: Arc<StandardDispatcher>,
    pub hp_dispatcher: Arc<HighPriorityDispatcher>,
    pub monitors: Arc<Monitors>,
    pub token_service: Arc<TokenService>,
    pub importer_factory: Arc<ImporterFactory>,
    pub interruptibility: Arc<Interruptibility>,
}

impl Services {
    pub async fn new(config: &SyncServiceConfig) -> Result<Services, String> {
        let db_pool = db::create_postgres_pool(&config.db)
            .await
            .map_err(|e| e.to_string())?;

        let storage: Arc<dyn KeyValueStorage> = Arc::new(
            RedisKeyValueStorage::new(&config.redis)
                .await
                .map_err(|e| e.to_string())?,
        );
        let queue: Arc<dyn TaskQueue> = Arc::new(
            RedisTaskQueue::new(&config.redis)
                .await
                .map_err(|e| e.to_string())?,
        );

        let organization_repo: Arc<dyn OrganizationRepo> =
            Arc::new(DbOrganizationRepo::new(db_pool.clone()));
        let task_repo: Arc<dyn TaskRepo> = Arc::new(DbTaskRepo::new(db_pool.clone()));
        let token_repo: Arc<dyn TokenRepo> = Arc::new(DbTokenRepo::new(db_pool.clone()));
        let sync_log: Arc<dyn SyncLogRepo> = Arc::new(DbSyncLogRepo::new(db_pool.clone()));
        let warehouse: Arc<dyn WarehouseWriter> =
            Arc::new(PostgresWarehouseWriter::new(db_pool.clone()));

        Ok(Self::from_parts(
            config.clone(),
            storage,
            queue,
            organization_repo,
            task_repo,
            token_repo,
            sync_log,
            warehouse,
        ))
    }

    /// Wiring over already-constructed infrastructure; tests and local runs
    /// use this with the in-memory implementations.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        config: SyncServiceConfig,
        storage: Arc<dyn KeyValueStorage>,
        queue: Arc<dyn TaskQueue>,
        organization_repo: Arc<dyn OrganizationRepo>,
        task_repo: Arc<dyn TaskRepo>,
        token_repo: Arc<dyn TokenRepo>,
        sync_log: Arc<dyn SyncLogRepo>,
        warehouse: Arc<dyn WarehouseWriter>,
    ) -> Services {
        let slots = DispatchSlots::new(
            storage.clone(),
            config.dispatch.max_concurrent_org_syncs,
            config.dispatch.counter_ttl,
        );

        let dispatcher = Arc::new(StandardDispatcher::new(
            storage.clone(),
            queue.clone(),
            organization_repo.clone(),
            sync_log.clone(),
            slots.clone(),
            config.dispatch.clone(),
        ));

        let hp_dispatcher = Arc::new(HighPriorityDispatcher::new(
            storage.clone(),
            queue.clone(),
            task_repo.clone(),
            sync_log.clone(),
            config.dispatch.clone(),
        ));

        let monitors = Arc::new(Monitors::new(
            storage.clone(),
            queue.clone(),
            task_repo.clone(),
            sync_log.clone(),
            slots.clone(),
            config.monitors.clone(),
        ));

        let token_service = Arc::new(TokenService::new(token_repo.clone(), storage.clone()));

        let importer_factory = Arc::new(ImporterFactory::new(
            reqwest::Client::new(),
            token_service.clone(),
            warehouse.clone(),
            sync_log.clone(),
            config.http_client_retries.clone(),
            config.import.clone(),
        ));

        Services {
            config,
            storage,
            queue,
            organization_repo,
            task_repo,
            token_repo,
            sync_log,
            warehouse,
            slots,
            dispatcher,
            hp_dispatcher,
            monitors,
            token_service,
            importer_factory,
            interruptibility: Arc::new(Interruptibility::new()),
        }
    }
}
