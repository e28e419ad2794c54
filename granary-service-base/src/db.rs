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

use granary_common::config::DbConfig;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Connection, Executor, PgConnection, Pool, Postgres};
use std::error::Error;
use std::path::Path;
use tracing::info;

fn pg_connect_options_from(config: &DbConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(config.host.as_str())
        .port(config.port)
        .database(config.database.as_str())
        .username(config.username.as_str())
        .password(config.password.as_str())
}

pub async fn create_postgres_pool(config: &DbConfig) -> Result<Pool<Postgres>, Box<dyn Error>> {
    info!(
        "DB pool: postgresql://{}:{}/{}?currentSchema={}",
        config.host, config.port, config.database, config.schema
    );
    let conn_options = pg_connect_options_from(config);
    let schema = config.schema.clone();

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .after_connect(move |conn, _meta| {
            let schema = schema.clone();
            Box::pin(async move {
                let sql = format!("SET SCHEMA '{}';", schema);
                conn.execute(sqlx::query(&sql)).await?;
                Ok(())
            })
        })
        .connect_with(conn_options)
        .await
        .map_err(|e| e.into())
}

pub async fn postgres_migrate(
    config: &DbConfig,
    migrations_path: &Path,
) -> Result<(), Box<dyn Error>> {
    let schema = config.schema.as_str();
    info!(
        "DB migration: postgresql://{}:{}/{}?currentSchema={}",
        config.host, config.port, config.database, schema
    );
    let conn_options = pg_connect_options_from(config);
    let mut conn = PgConnection::connect_with(&conn_options).await?;
    let sql = format!("CREATE SCHEMA IF NOT EXISTS {};", schema);
    conn.execute(sqlx::query(&sql)).await?;
    let sql = format!("SET SCHEMA '{}';", schema);
    conn.execute(sqlx::query(&sql)).await?;

    let migrator = Migrator::new(migrations_path).await?;
    migrator.run(&mut conn).await?;

    let _ = conn.close().await;
    Ok(())
}
