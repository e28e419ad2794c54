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

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrganizationId(pub i64);

impl Display for OrganizationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrationId(pub i64);

impl Display for IntegrationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProviderKind {
    Xero,
    Netsuite,
    Toast,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub name: String,
}

/// Xero uses the OAuth2 client credentials flow.
#[derive(Clone, Debug, PartialEq)]
pub struct XeroCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// NetSuite machine-to-machine auth: the access token is obtained with a
/// PS256-signed JWT assertion built from these fields.
#[derive(Clone, Debug, PartialEq)]
pub struct NetsuiteCredentials {
    pub account_id: String,
    pub consumer_key: String,
    pub certificate_id: String,
    pub private_key_pem: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ToastCredentials {
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// One (organization, provider, credentials) connection. The settings map
/// holds the per-provider credential fields; an integration is only
/// dispatchable when the full credential set for its provider is present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: IntegrationId,
    pub organization_id: OrganizationId,
    pub provider: ProviderKind,
    pub settings: BTreeMap<String, String>,
    pub is_active: bool,
}

impl Integration {
    fn setting(&self, key: &str) -> Option<String> {
        self.settings.get(key).filter(|v| !v.is_empty()).cloned()
    }

    pub fn xero_credentials(&self) -> Option<XeroCredentials> {
        Some(XeroCredentials {
            client_id: self.setting("client_id")?,
            client_secret: self.setting("client_secret")?,
        })
    }

    pub fn netsuite_credentials(&self) -> Option<NetsuiteCredentials> {
        Some(NetsuiteCredentials {
            account_id: self.setting("account_id")?,
            consumer_key: self.setting("consumer_key")?,
            certificate_id: self.setting("certificate_id")?,
            private_key_pem: self.setting("private_key")?,
        })
    }

    pub fn toast_credentials(&self) -> Option<ToastCredentials> {
        Some(ToastCredentials {
            api_url: self.setting("api_url")?,
            client_id: self.setting("client_id")?,
            client_secret: self.setting("client_secret")?,
        })
    }

    /// Whether the settings map carries the complete credential set for the
    /// integration's own provider.
    pub fn has_credentials(&self) -> bool {
        match self.provider {
            ProviderKind::Xero => self.xero_credentials().is_some(),
            ProviderKind::Netsuite => self.netsuite_credentials().is_some(),
            ProviderKind::Toast => self.toast_credentials().is_some(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccessToken {
    pub integration_id: IntegrationId,
    pub provider: ProviderKind,
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// The token counts as expiring when it runs out within the safety
    /// window, so callers refresh before the provider starts rejecting it.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => {
                expires_at
                    <= now + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
            }
            None => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HptState {
    Pending,
    Running,
    Done,
}

/// A user- or schedule-initiated import job, stored durably. Terminal once
/// `processed` is set; `in_progress && processed` is never written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HighPriorityTask {
    pub id: TaskId,
    pub integration_id: IntegrationId,
    pub provider: ProviderKind,
    pub since_date: NaiveDate,
    pub until_date: Option<NaiveDate>,
    pub selected_modules: Vec<String>,
    pub processed: bool,
    pub in_progress: bool,
    pub in_progress_since: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl HighPriorityTask {
    pub fn state(&self) -> HptState {
        if self.processed {
            HptState::Done
        } else if self.in_progress {
            HptState::Running
        } else {
            HptState::Pending
        }
    }

    pub fn processing_duration(&self) -> Option<chrono::Duration> {
        match (self.in_progress_since, self.processed_at) {
            (Some(started), Some(finished)) => Some(finished - started),
            _ => None,
        }
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum SyncEventStatus {
    Started,
    Success,
    Warning,
    Failed,
    Dispatched,
    Detected,
}

/// Append-only audit record of scheduler and importer activity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEvent {
    pub task_name: String,
    pub provider: Option<ProviderKind>,
    pub organization_id: Option<OrganizationId>,
    pub status: SyncEventStatus,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// Role a worker process runs with, set from configuration at startup. The
/// role decides queue bindings and whether graceful shutdown may interrupt
/// the task in flight.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case", ascii_case_insensitive)]
pub enum WorkerRole {
    Standard,
    HighPriority,
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::str::FromStr;

    #[test]
    fn provider_kind_round_trips_through_strings() {
        for kind in [
            ProviderKind::Xero,
            ProviderKind::Netsuite,
            ProviderKind::Toast,
        ] {
            let rendered = kind.to_string();
            assert_eq!(ProviderKind::from_str(&rendered).unwrap(), kind);
        }
        assert_eq!(
            ProviderKind::from_str("NETSUITE").unwrap(),
            ProviderKind::Netsuite
        );
    }

    #[test]
    fn integration_credentials_require_every_field() {
        let mut settings = BTreeMap::new();
        settings.insert("client_id".to_string(), "id".to_string());
        let mut integration = Integration {
            id: IntegrationId(1),
            organization_id: OrganizationId(1),
            provider: ProviderKind::Xero,
            settings,
            is_active: true,
        };
        assert!(!integration.has_credentials());

        integration
            .settings
            .insert("client_secret".to_string(), "secret".to_string());
        assert!(integration.has_credentials());

        integration
            .settings
            .insert("client_secret".to_string(), "".to_string());
        assert!(!integration.has_credentials());
    }

    #[test]
    fn hpt_state_derivation() {
        let mut task = HighPriorityTask {
            id: TaskId(1),
            integration_id: IntegrationId(1),
            provider: ProviderKind::Netsuite,
            since_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            until_date: None,
            selected_modules: vec![],
            processed: false,
            in_progress: false,
            in_progress_since: None,
            processed_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(task.state(), HptState::Pending);
        task.in_progress = true;
        assert_eq!(task.state(), HptState::Running);
        task.in_progress = false;
        task.processed = true;
        assert_eq!(task.state(), HptState::Done);
    }
}
