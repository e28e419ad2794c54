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

use crate::keys::token_refresh_lock_key;
use crate::repo::token::TokenRepo;
use async_trait::async_trait;
use chrono::Utc;
use granary_common::model::{AccessToken, Integration, IntegrationId, ProviderKind};
use granary_common::SafeDisplay;
use granary_service_base::repo::RepoError;
use granary_service_base::storage::keyvalue::{KeyValueError, KeyValueStorage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Tokens are refreshed this long before their recorded expiry.
const REFRESH_WINDOW: Duration = Duration::from_secs(60);
const CROSS_PROCESS_LOCK_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Missing {0} credentials on integration {1}")]
    MissingCredentials(ProviderKind, IntegrationId),
    #[error("Token endpoint error: {0}")]
    Endpoint(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    SharedState(#[from] KeyValueError),
}

impl SafeDisplay for TokenError {
    fn to_safe_string(&self) -> String {
        match self {
            TokenError::MissingCredentials(provider, id) => {
                format!("Missing {provider} credentials on integration {id}")
            }
            // Endpoint bodies can echo the assertion; keep them out of logs.
            TokenError::Endpoint(_) => "Token endpoint error".to_string(),
            TokenError::Repo(inner) => inner.to_safe_string(),
            TokenError::SharedState(inner) => inner.to_safe_string(),
        }
    }
}

/// Performs the provider-specific token exchange. Implemented by each
/// provider client module.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn obtain_token(&self, integration: &Integration) -> Result<AccessToken, TokenError>;
}

#[derive(Clone, Copy)]
enum ShortCircuit<'a> {
    /// Reuse the stored token when it is not close to expiry.
    WhenFresh,
    /// Reuse the stored token only when it differs from a rejected one.
    WhenRotatedFrom(&'a str),
    /// Always go upstream.
    Never,
}

/// Caches provider access tokens and collapses concurrent refreshes of the
/// same (integration, provider) pair into one upstream request: an
/// in-process mutex serializes local callers, a shared-state lock collapses
/// refreshes across worker processes, and a re-read after acquiring decides
/// whether somebody else already rotated the token.
pub struct TokenService {
    token_repo: Arc<dyn TokenRepo>,
    storage: Arc<dyn KeyValueStorage>,
    refresh_locks: Mutex<HashMap<(IntegrationId, ProviderKind), Arc<Mutex<()>>>>,
}

impl TokenService {
    pub fn new(token_repo: Arc<dyn TokenRepo>, storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            token_repo,
            storage,
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a token usable right now, refreshing first when the stored
    /// one is missing or expires within the safety window.
    pub async fn get_valid_token(
        &self,
        integration: &Integration,
        refresher: &dyn TokenRefresher,
    ) -> Result<AccessToken, TokenError> {
        let provider = refresher.provider();
        if let Some(token) = self.token_repo.get(integration.id, provider).await? {
            if !token.expires_within(REFRESH_WINDOW, Utc::now()) {
                return Ok(token);
            }
        }
        self.refresh_guarded(integration, refresher, ShortCircuit::WhenFresh)
            .await
    }

    /// Refresh path for a 401 mid-request: goes upstream unless another
    /// caller already replaced the rejected token.
    pub async fn refresh_after_rejection(
        &self,
        integration: &Integration,
        refresher: &dyn TokenRefresher,
        rejected_token: &str,
    ) -> Result<AccessToken, TokenError> {
        self.refresh_guarded(
            integration,
            refresher,
            ShortCircuit::WhenRotatedFrom(rejected_token),
        )
        .await
    }

    /// Unconditional refresh, used by the scheduled token refresh task.
    pub async fn refresh(
        &self,
        integration: &Integration,
        refresher: &dyn TokenRefresher,
    ) -> Result<AccessToken, TokenError> {
        self.refresh_guarded(integration, refresher, ShortCircuit::Never)
            .await
    }

    async fn refresh_guarded(
        &self,
        integration: &Integration,
        refresher: &dyn TokenRefresher,
        short_circuit: ShortCircuit<'_>,
    ) -> Result<AccessToken, TokenError> {
        let provider = refresher.provider();
        let key = (integration.id, provider);

        let local_lock = {
            let mut locks = self.refresh_locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _local_guard = local_lock.lock().await;

        // Re-read under the lock: a caller that queued behind the winner
        // observes the rotated token without a second upstream request.
        if let Some(stored) = self.token_repo.get(integration.id, provider).await? {
            let reusable = match short_circuit {
                ShortCircuit::WhenFresh => !stored.expires_within(REFRESH_WINDOW, Utc::now()),
                ShortCircuit::WhenRotatedFrom(rejected) => stored.token != rejected,
                ShortCircuit::Never => false,
            };
            if reusable {
                return Ok(stored);
            }
        }

        // Cross-process collapse is best effort: a down shared-state store
        // must not block token refresh.
        let lock_key = token_refresh_lock_key(integration.id, provider);
        let cross_process_lock = match self
            .storage
            .add(&lock_key, "refreshing", CROSS_PROCESS_LOCK_TTL)
            .await
        {
            Ok(acquired) => acquired,
            Err(error) => {
                warn!("Shared-state lock unavailable during token refresh: {error}");
                true
            }
        };

        if !cross_process_lock {
            if let Some(token) = self.await_other_process(integration, provider, &short_circuit).await? {
                return Ok(token);
            }
        }

        let result = refresher.obtain_token(integration).await;
        match result {
            Ok(token) => {
                self.token_repo.upsert(&token).await?;
                let _ = self.storage.delete(&lock_key).await;
                info!(
                    "Refreshed {provider} token for integration {}",
                    integration.id
                );
                Ok(token)
            }
            Err(error) => {
                let _ = self.storage.delete(&lock_key).await;
                Err(error)
            }
        }
    }

    /// Polls briefly for the token another process is refreshing; falls back
    /// to refreshing locally when it does not show up in time.
    async fn await_other_process(
        &self,
        integration: &Integration,
        provider: ProviderKind,
        short_circuit: &ShortCircuit<'_>,
    ) -> Result<Option<AccessToken>, TokenError> {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            if let Some(stored) = self.token_repo.get(integration.id, provider).await? {
                let usable = match short_circuit {
                    ShortCircuit::WhenFresh | ShortCircuit::Never => {
                        !stored.expires_within(REFRESH_WINDOW, Utc::now())
                    }
                    ShortCircuit::WhenRotatedFrom(rejected) => stored.token != *rejected,
                };
                if usable {
                    return Ok(Some(stored));
                }
            }
        }
        warn!(
            "Gave up waiting for a concurrent {provider} token refresh on integration {}",
            integration.id
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::repo::token::InMemoryTokenRepo;
    use granary_common::model::OrganizationId;
    use granary_service_base::storage::keyvalue::memory::InMemoryKeyValueStorage;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRefresher {
        calls: AtomicU32,
    }

    impl CountingRefresher {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        fn provider(&self) -> ProviderKind {
            ProviderKind::Xero
        }

        async fn obtain_token(
            &self,
            integration: &Integration,
        ) -> Result<AccessToken, TokenError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            // Simulate endpoint latency so concurrent callers overlap.
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(AccessToken {
                integration_id: integration.id,
                provider: ProviderKind::Xero,
                token: format!("token-{n}"),
                refresh_token: None,
                expires_at: Some(Utc::now() + chrono::Duration::minutes(30)),
            })
        }
    }

    fn integration() -> Integration {
        Integration {
            id: IntegrationId(7),
            organization_id: OrganizationId(1),
            provider: ProviderKind::Xero,
            settings: BTreeMap::new(),
            is_active: true,
        }
    }

    fn service() -> TokenService {
        TokenService::new(
            Arc::new(InMemoryTokenRepo::new()),
            Arc::new(InMemoryKeyValueStorage::new()),
        )
    }

    #[test]
    async fn concurrent_callers_produce_one_upstream_refresh() {
        let service = Arc::new(service());
        let refresher = Arc::new(CountingRefresher::new());
        let integration = integration();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let service = service.clone();
            let refresher = refresher.clone();
            let integration = integration.clone();
            handles.push(tokio::spawn(async move {
                service
                    .get_valid_token(&integration, refresher.as_ref())
                    .await
                    .unwrap()
            }));
        }

        let mut tokens = Vec::new();
        for handle in handles {
            tokens.push(handle.await.unwrap().token);
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "token-1"));
    }

    #[test]
    async fn fresh_token_is_reused_without_refreshing() {
        let service = service();
        let refresher = CountingRefresher::new();
        let integration = integration();

        let first = service
            .get_valid_token(&integration, &refresher)
            .await
            .unwrap();
        let second = service
            .get_valid_token(&integration, &refresher)
            .await
            .unwrap();

        assert_eq!(first.token, second.token);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    async fn rejection_refresh_rotates_once() {
        let service = Arc::new(service());
        let refresher = Arc::new(CountingRefresher::new());
        let integration = integration();

        let original = service
            .get_valid_token(&integration, refresher.as_ref())
            .await
            .unwrap();

        // Two callers race to replace the same rejected token; only one
        // upstream refresh happens, the loser reuses the rotated token.
        let (a, b) = tokio::join!(
            service.refresh_after_rejection(&integration, refresher.as_ref(), &original.token),
            service.refresh_after_rejection(&integration, refresher.as_ref(), &original.token),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.token, b.token);
        assert_ne!(a.token, original.token);
    }

    #[test]
    async fn expiring_token_triggers_a_refresh() {
        let token_repo = Arc::new(InMemoryTokenRepo::new());
        let service = TokenService::new(
            token_repo.clone(),
            Arc::new(InMemoryKeyValueStorage::new()),
        );
        let refresher = CountingRefresher::new();
        let integration = integration();

        token_repo
            .upsert(&AccessToken {
                integration_id: integration.id,
                provider: ProviderKind::Xero,
                token: "nearly-dead".to_string(),
                refresh_token: None,
                expires_at: Some(Utc::now() + chrono::Duration::seconds(10)),
            })
            .await
            .unwrap();

        let token = service
            .get_valid_token(&integration, &refresher)
            .await
            .unwrap();
        assert_eq!(token.token, "token-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }
}
