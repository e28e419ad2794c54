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
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use granary_common::model::{AccessToken, Integration, ProviderKind};
use granary_common::retries::RetryConfig;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

const API_BASE: &str = "https://api.xero.com/api.xro/2.0";
const TOKEN_URL: &str = "https://identity.xero.com/connect/token";
const SCOPES: &str = "accounting.transactions accounting.settings accounting.reports.read \
                      accounting.journals.read accounting.budgets.read accounting.contacts";
/// Endpoints that paginate with a `page` parameter return at most this many
/// records per page; a shorter page is the last one.
pub const PAGE_SIZE: usize = 100;

/// Client-credentials token exchange against the Xero identity service.
pub struct XeroTokenRefresher {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl XeroTokenRefresher {
    pub fn new(http: reqwest::Client, retry: RetryConfig) -> Self {
        Self { http, retry }
    }
}

#[async_trait]
impl TokenRefresher for XeroTokenRefresher {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Xero
    }

    async fn obtain_token(&self, integration: &Integration) -> Result<AccessToken, TokenError> {
        let credentials = integration
            .xero_credentials()
            .ok_or(TokenError::MissingCredentials(
                ProviderKind::Xero,
                integration.id,
            ))?;

        let response = send_with_rate_limit(ProviderKind::Xero, &self.retry, || {
            self.http
                .post(TOKEN_URL)
                .basic_auth(&credentials.client_id, Some(&credentials.client_secret))
                .form(&[("grant_type", "client_credentials"), ("scope", SCOPES)])
        })
        .await
        .map_err(|e| TokenError::Endpoint(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Endpoint(format!(
                "Xero token request failed with HTTP {}",
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
        let expires_in = body["expires_in"].as_i64().unwrap_or(1800);

        Ok(AccessToken {
            integration_id: integration.id,
            provider: ProviderKind::Xero,
            token: token.to_string(),
            refresh_token: None,
            expires_at: Some(Utc::now() + chrono::Duration::seconds(expires_in)),
        })
    }
}

pub struct XeroClient {
    http: reqwest::Client,
    integration: Integration,
    tokens: Arc<TokenService>,
    refresher: XeroTokenRefresher,
    retry: RetryConfig,
}

impl XeroClient {
    pub fn new(
        http: reqwest::Client,
        integration: Integration,
        tokens: Arc<TokenService>,
        retry: RetryConfig,
    ) -> Self {
        let refresher = XeroTokenRefresher::new(http.clone(), retry.clone());
        Self {
            http,
            integration,
            tokens,
            refresher,
            retry,
        }
    }

    fn if_modified_since(since: Option<NaiveDate>) -> Option<String> {
        let date = since?;
        let at_midnight = date.and_hms_opt(0, 0, 0)?;
        Some(
            Utc.from_utc_datetime(&at_midnight)
                .format("%a, %d %b %Y %H:%M:%S GMT")
                .to_string(),
        )
    }

    async fn get(
        &self,
        path: &str,
        params: &[(String, String)],
        since: Option<NaiveDate>,
    ) -> Result<Value, HttpClientError> {
        let url = format!("{API_BASE}/{path}");
        let response = send_authorized(
            &self.tokens,
            &self.integration,
            &self.refresher,
            &self.retry,
            |token| {
                let mut request = self
                    .http
                    .get(&url)
                    .bearer_auth(token)
                    .header(reqwest::header::ACCEPT, "application/json")
                    .query(params);
                if let Some(stamp) = Self::if_modified_since(since) {
                    request = request.header(reqwest::header::IF_MODIFIED_SINCE, stamp);
                }
                request
            },
        )
        .await?;

        response
            .json()
            .await
            .map_err(|e| HttpClientError::UnexpectedResponse(e.to_string()))
    }

    /// Single-shot collection endpoints (e.g. the chart of accounts).
    pub async fn get_collection(
        &self,
        path: &str,
        result_key: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Value>, HttpClientError> {
        let body = self.get(path, &[], since).await?;
        Ok(items_of(&body, result_key))
    }

    /// Page-number pagination: `page=1..` until an empty or short page.
    pub async fn get_paginated(
        &self,
        path: &str,
        result_key: &str,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Value>, HttpClientError> {
        let mut results = Vec::new();
        let mut page: u32 = 1;
        loop {
            let params = vec![("page".to_string(), page.to_string())];
            let body = self.get(path, &params, since).await?;
            let page_results = items_of(&body, result_key);
            info!("Fetched {} records on page {page} of {path}", page_results.len());
            let last = page_is_last(page_results.len(), PAGE_SIZE);
            results.extend(page_results);
            if last {
                break;
            }
            page += 1;
        }
        Ok(results)
    }

    /// The Journals endpoint paginates with an `offset` cursor (highest
    /// journal number seen) instead of page numbers.
    pub async fn get_journals(
        &self,
        offset: Option<i64>,
        since: Option<NaiveDate>,
    ) -> Result<Vec<Value>, HttpClientError> {
        let params = match offset {
            Some(offset) => vec![("offset".to_string(), offset.to_string())],
            None => Vec::new(),
        };
        let body = self.get("Journals", &params, since).await?;
        Ok(items_of(&body, "Journals"))
    }
}

fn items_of(body: &Value, result_key: &str) -> Vec<Value> {
    body[result_key]
        .as_array()
        .map(|items| items.to_vec())
        .unwrap_or_default()
}

/// A page shorter than the page size (or empty) terminates pagination.
pub fn page_is_last(page_len: usize, page_size: usize) -> bool {
    page_len < page_size
}

/// Xero renders timestamps either as Microsoft JSON dates
/// (`/Date(1672531200000+0000)/`) or as ISO-8601.
pub fn parse_xero_datetime(raw: &str) -> Option<DateTime<Utc>> {
    if let Some(inner) = raw
        .strip_prefix("/Date(")
        .and_then(|rest| rest.strip_suffix(")/"))
    {
        let millis_part: String = inner
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '-')
            .collect();
        let millis: i64 = millis_part.parse().ok()?;
        return Utc.timestamp_millis_opt(millis).single();
    }

    DateTime::parse_from_rfc3339(&raw.replace("Z", "+00:00"))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn microsoft_json_dates_parse() {
        let parsed = parse_xero_datetime("/Date(1672531200000+0000)/").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn iso_dates_parse() {
        let parsed = parse_xero_datetime("2023-06-01T12:30:00Z").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2023, 6, 1, 12, 30, 0).unwrap());
    }

    #[test]
    fn garbage_dates_do_not_parse() {
        assert_eq!(parse_xero_datetime("yesterday"), None);
    }

    #[test]
    fn full_page_continues_short_page_stops() {
        // A provider returning exactly page_size rows must fetch one more
        // (empty) page rather than stopping early.
        assert!(!page_is_last(PAGE_SIZE, PAGE_SIZE));
        assert!(page_is_last(PAGE_SIZE - 1, PAGE_SIZE));
        assert!(page_is_last(0, PAGE_SIZE));
    }

    #[test]
    fn if_modified_since_is_http_date() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        assert_eq!(
            XeroClient::if_modified_since(Some(date)).unwrap(),
            "Tue, 05 Mar 2024 00:00:00 GMT"
        );
        assert_eq!(XeroClient::if_modified_since(None), None);
    }
}
