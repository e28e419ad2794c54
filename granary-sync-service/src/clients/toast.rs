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
use chrono::{NaiveDate, NaiveDateTime};
use granary_common::model::{AccessToken, Integration, ProviderKind};
use granary_common::retries::RetryConfig;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Toast issues short-lived bearer tokens without an expiry in the login
/// response; they are replaced on the first 401.
pub struct ToastTokenRefresher {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl ToastTokenRefresher {
    pub fn new(http: reqwest::Client, retry: RetryConfig) -> Self {
        Self { http, retry }
    }
}

#[async_trait]
impl TokenRefresher for ToastTokenRefresher {
    fn provider(&self) -> ProviderKind {
        ProviderKind::Toast
    }

    async fn obtain_token(&self, integration: &Integration) -> Result<AccessToken, TokenError> {
        let credentials = integration
            .toast_credentials()
            .ok_or(TokenError::MissingCredentials(
                ProviderKind::Toast,
                integration.id,
            ))?;

        let hostname = credentials.api_url.trim_end_matches('/').to_string();
        let url = format!("{hostname}/authentication/v1/authentication/login");

        let response = send_with_rate_limit(ProviderKind::Toast, &self.retry, || {
            self.http.post(&url).json(&json!({
                "clientId": credentials.client_id,
                "clientSecret": credentials.client_secret,
                "userAccessType": "TOAST_MACHINE_CLIENT",
            }))
        })
        .await
        .map_err(|e| TokenError::Endpoint(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TokenError::Endpoint(format!(
                "Toast authentication failed with HTTP {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| TokenError::Endpoint(e.to_string()))?;
        let token = body["token"]["accessToken"]
            .as_str()
            .or_else(|| body["accessToken"].as_str())
            .ok_or_else(|| TokenError::Endpoint("no accessToken in response".to_string()))?;

        Ok(AccessToken {
            integration_id: integration.id,
            provider: ProviderKind::Toast,
            token: token.to_string(),
            refresh_token: None,
            expires_at: None,
        })
    }
}

pub struct ToastClient {
    http: reqwest::Client,
    integration: Integration,
    tokens: Arc<TokenService>,
    refresher: ToastTokenRefresher,
    retry: RetryConfig,
    hostname: String,
}

impl ToastClient {
    pub fn new(
        http: reqwest::Client,
        integration: Integration,
        tokens: Arc<TokenService>,
        retry: RetryConfig,
    ) -> Result<Self, HttpClientError> {
        let credentials = integration.toast_credentials().ok_or_else(|| {
            HttpClientError::Token(format!(
                "Missing toast credentials on integration {}",
                integration.id
            ))
        })?;
        let refresher = ToastTokenRefresher::new(http.clone(), retry.clone());
        Ok(Self {
            http,
            integration,
            tokens,
            refresher,
            retry,
            hostname: credentials.api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(
        &self,
        path: &str,
        restaurant_guid: Option<&str>,
        params: &[(String, String)],
    ) -> Result<Value, HttpClientError> {
        let url = format!("{}{path}", self.hostname);
        let response = send_authorized(
            &self.tokens,
            &self.integration,
            &self.refresher,
            &self.retry,
            |token| {
                let mut request = self.http.get(&url).bearer_auth(token).query(params);
                if let Some(guid) = restaurant_guid {
                    request = request.header("Toast-Restaurant-External-ID", guid);
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

    /// All restaurant GUIDs reachable with this integration's credentials.
    pub async fn restaurant_guids(&self) -> Result<Vec<String>, HttpClientError> {
        let body = self.get("/partners/v1/restaurants", None, &[]).await?;
        let guids: Vec<String> = body
            .as_array()
            .map(|restaurants| {
                restaurants
                    .iter()
                    .filter_map(|r| r["restaurantGuid"].as_str())
                    .map(|guid| guid.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(guids)
    }

    pub async fn restaurant_info(&self, guid: &str) -> Result<Value, HttpClientError> {
        self.get(
            &format!("/restaurants/v1/restaurants/{guid}"),
            Some(guid),
            &[],
        )
        .await
    }

    /// Bulk order export for one restaurant over a date window, page by page
    /// until an empty page.
    pub async fn orders_bulk(
        &self,
        guid: &str,
        start: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Value>, HttpClientError> {
        let mut orders = Vec::new();
        let mut page: u32 = 1;
        loop {
            let params = vec![
                ("startDate".to_string(), format_toast_date(start)),
                ("endDate".to_string(), format_toast_date(end)),
                ("page".to_string(), page.to_string()),
            ];
            let body = self.get("/orders/v2/ordersBulk", Some(guid), &params).await?;
            let batch = body.as_array().map(|b| b.to_vec()).unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            info!("Fetched {} orders on page {page} for restaurant {guid}", batch.len());
            orders.extend(batch);
            page += 1;
        }
        Ok(orders)
    }

    /// Configuration collections (revenue centers, service areas, dining
    /// options, ...) keyed by restaurant.
    pub async fn config_collection(
        &self,
        guid: &str,
        collection: &str,
    ) -> Result<Vec<Value>, HttpClientError> {
        let body = self
            .get(&format!("/config/v2/{collection}"), Some(guid), &[])
            .await?;
        Ok(body.as_array().map(|items| items.to_vec()).unwrap_or_default())
    }
}

/// Toast expects `YYYY-MM-DDTHH:MM:SS.mmm+0000` timestamps.
pub fn format_toast_date(value: NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.3f+0000").to_string()
}

/// Business dates come back as `YYYYMMDD` integers.
pub fn parse_business_date(value: &Value) -> Option<NaiveDate> {
    let raw = match value {
        Value::Number(n) => n.as_i64()?.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    NaiveDate::parse_from_str(&raw, "%Y%m%d").ok()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn toast_dates_use_the_fixed_offset_format() {
        let date = NaiveDate::from_ymd_opt(2025, 5, 4)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(format_toast_date(date), "2025-05-04T00:00:00.000+0000");
    }

    #[test]
    fn business_dates_parse_from_numbers_and_strings() {
        assert_eq!(
            parse_business_date(&json!(20231130)),
            NaiveDate::from_ymd_opt(2023, 11, 30)
        );
        assert_eq!(
            parse_business_date(&json!("20231130")),
            NaiveDate::from_ymd_opt(2023, 11, 30)
        );
        assert_eq!(parse_business_date(&json!(null)), None);
    }
}
