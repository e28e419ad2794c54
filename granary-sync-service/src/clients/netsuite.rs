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

use super::{send_authorized, send_with_rate_limit, HttpClientError};
use crate::service::token_refresh::{TokenError, TokenRefresher, TokenService};
use async_trait::async_trait;
use chrono::Utc;
use granary_common::model::{AccessToken, Integration, NetsuiteCredentials, ProviderKind};
use granary_common::retries::RetryConfig;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

fn token_url(account_id: &str) -> String {
    format!("https://{account_id}.suitetalk.api.netsuite.com/services/rest/auth/oauth2/v1/token")
}

fn suiteql_url(account_id: &str) -> String {
    format!("https://{account_id}.suitetalk.api.netsuite.com/services/rest/query/v1/suiteql")
}

/// Machine-to-machine OAuth2: the access token is requested with a
/// PS256-signed JWT assertion, there is no refresh token.
pub struct NetsuiteTokenRefresher {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl NetsuiteTokenRefresher {
    pub fn new(http: reqwest::Client, retry: RetryConfig) -> Self {
        Self { http, retry }
    }

    fn jwt_assertion(credentials: &NetsuiteCredentials) -> Result<String, TokenError> {
        let mut header = Header::new(Algorithm::PS256);
        header.kid = Some(credentials.certificate_id.clone());

        let now = Utc::now().timestamp();
        let claims = json!({
            "iss": credentials.consumer_key,
            "aud": token_url(&credentials.account_id),
            "iat": now,
            "exp": now + 3600,
            "scope": ["restlets", "rest_webservices"],
        });

        let key = EncodingKey::from_rsa_pem(credentials.private_key_pem.as_bytes())
            .map_err(|e| TokenError::Endpoint(format!("invalid RSA private key: {e}")))?;
        jsonwebtoken::encode(&header, &claims, &key)
            .map_err(|e| TokenError::Endpoint(format!("JWT signing failed: {e}")))
    }
}

#[async_trait]
impl TokenRefresher for NetsuiteTokenRefresher {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Netsuite
    }

    async fn obtain_token(&self, integration: &Integration) -> Result<AccessToken, TokenError> {
        let credentials =
            integration
                .netsuite_credentials()
                .ok_or(TokenError::MissingCredentials(
                    ProviderKind::Netsuite,
                    integration.id,
                ))?;

        let assertion = Self::jwt_assertion(&credentials)?;
        let url = token_url(&credentials.account_id);

        let response = send_with_rate_limit(ProviderKind::Netsuite, &self.retry, || {
            self.http.post(&url).form(&[
                ("grant_type", "client_credentials"),
                (
                    "client_assertion_type",
                    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer",
                ),
                ("client_assertion", assertion.as_str()),
            ])
        })
        .await
        .map_err(|e| TokenError::Endpoint(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Endpoint(format!(
                "NetSuite M2M token request failed with HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TokenError::Endpoint(e.to_string()))?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| TokenError::Endpoint("no access_token in response".to_string()))?;
        let expires_in = body["expires_in"].as_i64().unwrap_or(3600);

        Ok(AccessToken {
            integration_id: integration.id,
            provider: ProviderKind::Netsuite,
            token: token.to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::seconds(expires_in)),
        })
    }
}

/// SuiteQL query executor over the NetSuite REST query service.
pub struct NetSuiteClient {
    http: reqwest::Client,
    integration: Integration,
    tokens: Arc<TokenService>,
    refresher: NetsuiteTokenRefresher,
    retry: RetryConfig,
    account_id: String,
}

impl NetSuiteClient {
    pub fn new(
        http: reqwest::Client,
        integration: Integration,
        tokens: Arc<TokenService>,
        retry: RetryConfig,
    ) -> Result<Self, HttpClientError> {
        let credentials = integration.netsuite_credentials().ok_or_else(|| {
            HttpClientError::Token(format!(
                "Missing netsuite credentials on integration {}",
                integration.id
            ))
        })?;
        let refresher = NetsuiteTokenRefresher::new(http.clone(), retry.clone());
        Ok(Self {
            http,
            integration,
            tokens,
            refresher,
            retry,
            account_id: credentials.account_id,
        })
    }

    async fn post_suiteql(
        &self,
        query: &str,
        limit: usize,
        offset: Option<usize>,
    ) -> Result<Vec<Value>, HttpClientError> {
        let url = suiteql_url(&self.account_id);
        debug!("Executing SuiteQL query: {query}");

        let response = send_authorized(
            &self.tokens,
            &self.integration,
            &self.refresher,
            &self.retry,
            |token| {
                let mut params = vec![("limit", limit.to_string())];
                if let Some(offset) = offset {
                    params.push(("offset", offset.to_string()));
                }
                self.http
                    .post(&url)
                    .bearer_auth(token)
                    .header("Prefer", "transient")
                    .query(&params)
                    .json(&json!({ "q": query }))
            },
        )
        .await?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| HttpClientError::UnexpectedResponse(e.to_string()))?;
        Ok(body["items"]
            .as_array()
            .map(|items| items.to_vec())
            .unwrap_or_default())
    }

    /// Fetches every row of a query with offset/limit pagination, stopping
    /// at the first short page.
    pub async fn query_all(
        &self,
        query: &str,
        page_size: usize,
    ) -> Result<Vec<Value>, HttpClientError> {
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let page = self.post_suiteql(query, page_size, Some(offset)).await?;
            let page_len = page.len();
            rows.extend(page);
            if page_len < page_size {
                break;
            }
            offset += page_size;
        }
        Ok(rows)
    }

    /// Single batch for keyset-paginated pulls: the query itself bounds the
    /// row count (`FETCH NEXT n ROWS ONLY`) and encodes the marker.
    pub async fn query_batch(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Value>, HttpClientError> {
        self.post_suiteql(query, limit, None).await
    }
}
