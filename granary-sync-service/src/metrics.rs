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

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_gauge,
    CounterVec, HistogramVec, IntGauge, Registry,
};

lazy_static! {
    pub static ref TASKS_EXECUTED_TOTAL: CounterVec = register_counter_vec!(
        opts!("tasks_executed_total", "Worker tasks executed"),
        &["task", "outcome"]
    )
    .unwrap();
    pub static ref TASK_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        histogram_opts!(
            "task_duration_seconds",
            "Worker task execution time",
            vec![0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 3600.0]
        ),
        &["task"]
    )
    .unwrap();
    pub static ref ORG_SYNCS_DISPATCHED_TOTAL: CounterVec = register_counter_vec!(
        opts!(
            "org_syncs_dispatched_total",
            "Organization sync tasks emitted by the dispatcher"
        ),
        &["outcome"]
    )
    .unwrap();
    pub static ref DISPATCH_SLOTS_IN_USE: IntGauge = register_int_gauge!(
        "dispatch_slots_in_use",
        "Last observed value of the dispatch slot counter"
    )
    .unwrap();
    pub static ref IMPORTED_ROWS_TOTAL: CounterVec = register_counter_vec!(
        opts!("imported_rows_total", "Rows written to the warehouse"),
        &["provider", "module"]
    )
    .unwrap();
    pub static ref PROVIDER_RATE_LIMIT_HITS_TOTAL: CounterVec = register_counter_vec!(
        opts!(
            "provider_rate_limit_hits_total",
            "HTTP 429 responses from providers"
        ),
        &["provider"]
    )
    .unwrap();
}

pub fn register_all() -> Registry {
    let registry = prometheus::default_registry().clone();

    lazy_static::initialize(&TASKS_EXECUTED_TOTAL);
    lazy_static::initialize(&TASK_DURATION_SECONDS);
    lazy_static::initialize(&ORG_SYNCS_DISPATCHED_TOTAL);
    lazy_static::initialize(&DISPATCH_SLOTS_IN_USE);
    lazy_static::initialize(&IMPORTED_ROWS_TOTAL);
    lazy_static::initialize(&PROVIDER_RATE_LIMIT_HITS_TOTAL);

    registry
}
