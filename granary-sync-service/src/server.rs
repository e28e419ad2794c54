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

use granary_common::tracing::init_tracing_with_default_env_filter;
use granary_common::SafeDisplay;
use granary_service_base::db;
use granary_sync_service::config::{make_config_loader, SyncServiceConfig};
use granary_sync_service::schedule::run_beat;
use granary_sync_service::service::Services;
use granary_sync_service::worker::QueueWorker;
use granary_sync_service::{api, metrics};
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::EndpointExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn main() -> Result<(), std::io::Error> {
    if let Some(config) = make_config_loader().load_or_dump_config() {
        init_tracing_with_default_env_filter(&config.tracing);
        info!("Starting granary-sync-service with configuration:");
        info!("{}", config.to_safe_string());

        let prometheus = metrics::register_all();

        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(async_main(&config, prometheus))
    } else {
        Ok(())
    }
}

async fn async_main(
    config: &SyncServiceConfig,
    prometheus_registry: prometheus::Registry,
) -> Result<(), std::io::Error> {
    let migrations = Path::new("./db/migration/postgres");
    db::postgres_migrate(&config.db, migrations)
        .await
        .map_err(|e| {
            error!("DB - init error: {}", e);
            std::io::Error::other(format!("Init error: {e:?}"))
        })?;

    let services = Arc::new(Services::new(config).await.map_err(|e| {
        error!("Services - init error: {}", e);
        std::io::Error::other(e)
    })?);

    let shutdown = CancellationToken::new();

    let worker = QueueWorker::new(services.clone(), shutdown.clone());
    let worker_handle = tokio::spawn(async move { worker.run().await });

    let beat_handle = if config.worker.beat {
        let queue = services.queue.clone();
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move { run_beat(queue, shutdown).await }))
    } else {
        None
    };

    let http_port = config.http_port;
    info!("Starting operational HTTP endpoint on port {http_port}");
    let app = api::combined_routes().nest("/metrics", PrometheusExporter::new(prometheus_registry));
    let http_shutdown = shutdown.clone();
    let http_server = tokio::spawn(async move {
        let _ = poem::Server::new(TcpListener::bind(format!("0.0.0.0:{http_port}")))
            .run_with_graceful_shutdown(
                app.boxed(),
                async move { http_shutdown.cancelled().await },
                Some(Duration::from_secs(5)),
            )
            .await;
    });

    select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt, shutting down");
        }
        _ = sigterm() => {
            if services.interruptibility.is_uninterruptible() {
                warn!(
                    "Termination requested while a high-priority import is running; \
                     finishing the import first"
                );
            } else {
                info!("Received termination signal, shutting down");
            }
        }
    }

    shutdown.cancel();
    let _ = worker_handle.await;
    if let Some(beat_handle) = beat_handle {
        let _ = beat_handle.await;
    }
    let _ = http_server.await;
    Ok(())
}

#[cfg(unix)]
async fn sigterm() {
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(signal_error) => {
            error!("Cannot install SIGTERM handler: {signal_error}");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
