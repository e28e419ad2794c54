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

pub mod netsuite;
pub mod toast;
pub mod xero;

use crate::metrics;
use crate::service::token_refresh::{TokenError, TokenRefresher, TokenService};
use granary_common::model::{Integration, ProviderKind};
use granary_common::retries::RetryConfig;
use granary_common::SafeDisplay;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::warn;

/// Fallback wait when a 429 carries no Retry-After header.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("Unauthorized after token refresh")]
    Unauthorized,
    #[error("HTTP {status} from {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unexpected response shape: {0}")]
    UnexpectedResponse(String),
    #[error("Token error: {0}")]
    Token(String),
}

impl From<TokenError> for HttpClientError {
    fn from(error: TokenError) -> Self {
        HttpClientError::Token(error.to_safe_string())
    }
}

impl SafeDisplay for HttpClientError {
    fn to_safe_string(&self) -> String {
        match self {
            // Provider error bodies can quote request parameters; keep only
            // status and URL.
            HttpClientError::Status { status, url, .. } => format!("HTTP {status} from {url}"),
            other => other.to_string(),
        }
    }
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate_body(body: String) -> String {
    if body.len() > 500 {
        format!("{}... (truncated)", &body[..500])
    } else {
        body
    }
}

/// Sends a request, absorbing provider flow control: 429 responses are
/// retried after the advertised Retry-After without a cap, 5xx responses are
/// retried a bounded number of times with exponential backoff. Any other
/// status is returned to the caller untouched.
pub async fn send_with_rate_limit<F>(
    provider: ProviderKind,
    retry: &RetryConfig,
    build: F,
) -> Result<reqwest::Response, HttpClientError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut server_error_attempts = 0u32;
    loop {
        let response = build()
            .send()
            .await
            .map_err(|e| HttpClientError::Transport(e.to_string()))?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let delay = retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER);
            metrics::PROVIDER_RATE_LIMIT_HITS_TOTAL
                .with_label_values(&[&provider.to_string()])
                .inc();
            warn!("429 from {provider}, waiting {delay:?} before retrying");
            tokio::time::sleep(delay).await;
            continue;
        }

        if status.is_server_error() {
            server_error_attempts += 1;
            if server_error_attempts < retry.max_attempts {
                let delay = retry.delay_for_attempt(server_error_attempts);
                warn!("HTTP {status} from {provider}, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                continue;
            }
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            return Err(HttpClientError::Status {
                status: status.as_u16(),
                url,
                body: truncate_body(body),
            });
        }

        return Ok(response);
    }
}

/// Maps any remaining non-success status into an error carrying a truncated
/// body.
pub async fn error_for_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, HttpClientError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        Err(HttpClientError::Status {
            status: status.as_u16(),
            url,
            body: truncate_body(body),
        })
    }
}

/// Bearer-authorized request with the standard auth recovery rule: on a 401
/// the token is refreshed once (single-flight across callers) and the
/// request retried exactly once.
pub async fn send_authorized<F>(
    tokens: &TokenService,
    integration: &Integration,
    refresher: &dyn TokenRefresher,
    retry: &RetryConfig,
    build: F,
) -> Result<reqwest::Response, HttpClientError>
where
    F: Fn(&str) -> reqwest::RequestBuilder,
{
    let provider = refresher.provider();
    let token = tokens.get_valid_token(integration, refresher).await?;

    let response = send_with_rate_limit(provider, retry, || build(&token.token)).await?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return error_for_status(response).await;
    }

    warn!("401 from {provider}, refreshing token and retrying once");
    let refreshed = tokens
        .refresh_after_rejection(integration, refresher, &token.token)
        .await?;
    let response = send_with_rate_limit(provider, retry, || build(&refreshed.token)).await?;
    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(HttpClientError::Unauthorized);
    }
    error_for_status(response).await
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn bodies_are_truncated_for_errors() {
        let long = "x".repeat(1000);
        let truncated = truncate_body(long);
        assert!(truncated.starts_with("x"));
        assert!(truncated.ends_with("(truncated)"));
        assert!(truncated.len() < 600);

        assert_eq!(truncate_body("short".to_string()), "short");
    }

    #[test]
    fn status_errors_mask_bodies_in_safe_display() {
        let error = HttpClientError::Status {
            status: 400,
            url: "https://api.example.com/x".to_string(),
            body: "secret=value".to_string(),
        };
        assert!(!error.to_safe_string().contains("secret"));
    }
}
