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

//! Shared-state key namespace. Every key the schedulers and workers put into
//! the key-value store is declared here.

use granary_common::model::{IntegrationId, OrganizationId, ProviderKind};

pub const DISPATCHER_LOCK_KEY: &str = "dispatcher_task_lock";
pub const HIGH_PRIORITY_DISPATCHER_LOCK_KEY: &str = "high_priority_dispatcher_lock";
pub const IN_FLIGHT_ORG_SYNC_COUNT_KEY: &str = "in_flight_org_sync_count";
pub const ORG_OFFSET_KEY: &str = "dispatcher_org_offset";
pub const ACTIVE_HIGH_PRIORITY_TASK_KEY: &str = "active_high_priority_task";

pub fn org_sync_lock_key(organization_id: OrganizationId) -> String {
    format!("org_sync_lock_{organization_id}")
}

pub fn token_refresh_lock_key(integration_id: IntegrationId, provider: ProviderKind) -> String {
    format!("token_refresh_lock_{integration_id}_{provider}")
}
