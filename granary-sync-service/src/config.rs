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

use granary_common::config::{ConfigLoader, DbConfig, RedisConfig};
use granary_common::model::WorkerRole;
use granary_common::retries::RetryConfig;
use granary_common::tracing::TracingConfig;
use granary_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncServiceConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub db: DbConfig,
    pub redis: RedisConfig,
    pub worker: WorkerConfig,
    pub dispatch: DispatchConfig,
    pub pipeline: PipelineConfig,
    pub monitors: MonitorConfig,
    pub import: ImportConfig,
    pub http_client_retries: RetryConfig,
}

impl Default for SyncServiceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("granary-sync-service"),
            environment: "dev".to_string(),
            http_port: 8080,
            db: DbConfig::default(),
            redis: RedisConfig::default(),
            worker: WorkerConfig::default(),
            dispatch: DispatchConfig::default(),
            pipeline: PipelineConfig::default(),
            monitors: MonitorConfig::default(),
            import: ImportConfig::default(),
            http_client_retries: RetryConfig::default(),
        }
    }
}

impl SafeDisplay for SyncServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "environment: {}", self.environment);
        let _ = writeln!(&mut result, "HTTP port: {}", self.http_port);
        let _ = writeln!(&mut result, "DB:");
        let _ = writeln!(&mut result, "{}", self.db.to_safe_string_indented());
        let _ = writeln!(&mut result, "redis:");
        let _ = writeln!(&mut result, "{}", self.redis.to_safe_string_indented());
        let _ = writeln!(&mut result, "worker:");
        let _ = writeln!(&mut result, "{}", self.worker.to_safe_string_indented());
        let _ = writeln!(&mut result, "dispatch:");
        let _ = writeln!(&mut result, "{}", self.dispatch.to_safe_string_indented());
        let _ = writeln!(&mut result, "pipeline:");
        let _ = writeln!(&mut result, "{}", self.pipeline.to_safe_string_indented());
        let _ = writeln!(&mut result, "monitors:");
        let _ = writeln!(&mut result, "{}", self.monitors.to_safe_string_indented());
        let _ = writeln!(&mut result, "import:");
        let _ = writeln!(&mut result, "{}", self.import.to_safe_string_indented());
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Role this worker process runs with; decides queue bindings and
    /// whether an in-flight high-priority import survives graceful shutdown.
    pub role: WorkerRole,
    /// Whether this process also runs the clock-driven schedule.
    pub beat: bool,
    /// Shield high-priority imports from graceful termination. Disabling
    /// this makes rolling deploys able to interrupt a running import.
    pub mask_termination: bool,
    #[serde(with = "humantime_serde")]
    pub soft_time_limit: Duration,
    #[serde(with = "humantime_serde")]
    pub hard_time_limit: Duration,
    pub task_max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub task_retry_delay: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            role: WorkerRole::Standard,
            beat: false,
            mask_termination: true,
            soft_time_limit: Duration::from_secs(170_000),
            hard_time_limit: Duration::from_secs(172_000),
            task_max_retries: 3,
            task_retry_delay: Duration::from_secs(300),
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "role: {}", self.role);
        let _ = writeln!(&mut result, "beat: {}", self.beat);
        let _ = writeln!(&mut result, "mask termination: {}", self.mask_termination);
        let _ = writeln!(&mut result, "soft time limit: {:?}", self.soft_time_limit);
        let _ = writeln!(&mut result, "hard time limit: {:?}", self.hard_time_limit);
        let _ = writeln!(&mut result, "task max retries: {}", self.task_max_retries);
        let _ = writeln!(&mut result, "task retry delay: {:?}", self.task_retry_delay);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Ceiling on concurrently dispatched organization syncs. This gates
    /// dispatch slots, not downstream pipeline execution.
    pub max_concurrent_org_syncs: i64,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub dispatcher_lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub org_sync_lock_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub counter_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub active_marker_ttl: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_org_syncs: 3,
            tick_interval: Duration::from_secs(5),
            dispatcher_lock_ttl: Duration::from_secs(60),
            org_sync_lock_ttl: Duration::from_secs(600),
            counter_ttl: Duration::from_secs(3600),
            active_marker_ttl: Duration::from_secs(259_200),
        }
    }
}

impl SafeDisplay for DispatchConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "max concurrent org syncs: {}",
            self.max_concurrent_org_syncs
        );
        let _ = writeln!(&mut result, "tick interval: {:?}", self.tick_interval);
        let _ = writeln!(
            &mut result,
            "dispatcher lock ttl: {:?}",
            self.dispatcher_lock_ttl
        );
        let _ = writeln!(&mut result, "org sync lock ttl: {:?}", self.org_sync_lock_ttl);
        let _ = writeln!(&mut result, "counter ttl: {:?}", self.counter_ttl);
        let _ = writeln!(&mut result, "active marker ttl: {:?}", self.active_marker_ttl);
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pause between modules of one integration pipeline, smoothing provider
    /// rate limits.
    #[serde(with = "humantime_serde")]
    pub inter_module_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            inter_module_pause: Duration::from_secs(20),
        }
    }
}

impl SafeDisplay for PipelineConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(
            &mut result,
            "inter module pause: {:?}",
            self.inter_module_pause
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// A pending task older than this counts as missed.
    #[serde(with = "humantime_serde")]
    pub missed_hpt_age: Duration,
    /// A running task whose progress stamp is older than this is suspect.
    #[serde(with = "humantime_serde")]
    pub hpt_stuck_threshold: Duration,
    /// With the counter at the ceiling and no completed organization sync
    /// within this window, the semaphore is considered stuck.
    #[serde(with = "humantime_serde")]
    pub semaphore_stuck_window: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            missed_hpt_age: Duration::from_secs(60),
            hpt_stuck_threshold: Duration::from_secs(300),
            semaphore_stuck_window: Duration::from_secs(3600),
        }
    }
}

impl SafeDisplay for MonitorConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "missed hpt age: {:?}", self.missed_hpt_age);
        let _ = writeln!(
            &mut result,
            "hpt stuck threshold: {:?}",
            self.hpt_stuck_threshold
        );
        let _ = writeln!(
            &mut result,
            "semaphore stuck window: {:?}",
            self.semaphore_stuck_window
        );
        result
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportConfig {
    pub batch_size_rows: usize,
    pub batch_size_heavy: usize,
    /// Heartbeat log event cadence, in flushed batches.
    pub heartbeat_every_batches: u32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 1000,
            batch_size_heavy: 500,
            heartbeat_every_batches: 5,
        }
    }
}

impl SafeDisplay for ImportConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "batch size rows: {}", self.batch_size_rows);
        let _ = writeln!(&mut result, "batch size heavy: {}", self.batch_size_heavy);
        let _ = writeln!(
            &mut result,
            "heartbeat every batches: {}",
            self.heartbeat_every_batches
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<SyncServiceConfig> {
    ConfigLoader::new(&PathBuf::from("config/sync-service.toml"))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use crate::config::make_config_loader;
    use std::env;
    use std::path::PathBuf;

    #[test]
    pub fn config_is_loadable() {
        env::set_current_dir(PathBuf::from(env!("CARGO_MANIFEST_DIR")))
            .expect("Failed to set current directory");

        make_config_loader().load().expect("Failed to load config");
    }
}
