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

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_jitter_factor: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_jitter_factor: Some(0.15),
        }
    }
}

impl RetryConfig {
    /// Delay before the given retry attempt (1-based), capped at `max_delay`
    /// with optional multiplicative jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.min_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let jittered = match self.max_jitter_factor {
            Some(max_jitter) if max_jitter > 0.0 => {
                let jitter = rand::rng().random_range(0.0..max_jitter);
                capped * (1.0 + jitter)
            }
            _ => capped,
        };
        Duration::from_millis(jittered as u64)
    }
}

/// Runs `action` with the configured retry policy, retrying only errors for
/// which `is_retriable` holds. The input is borrowed by each attempt so the
/// caller keeps ownership of clients and request parameters.
pub async fn with_retries<In, F, G, R, E>(
    target_label: &'static str,
    op_label: &'static str,
    op_id: Option<String>,
    config: &RetryConfig,
    input: &In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    E: Display,
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'a + Send>>,
    G: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action(input).await {
            Ok(result) => return Ok(result),
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    target: "retries",
                    "{target_label}/{op_label}{}: attempt {attempt} failed ({error}), retrying in {delay:?}",
                    op_id
                        .as_deref()
                        .map(|id| format!(" [{id}]"))
                        .unwrap_or_default()
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                info!(
                    target: "retries",
                    "{target_label}/{op_label}: giving up after {attempt} attempts ({error})"
                );
                return Err(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_grow_and_cap() {
        let config = RetryConfig {
            max_attempts: 5,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            multiplier: 2.0,
            max_jitter_factor: None,
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(350));
    }

    #[test]
    async fn retries_until_success() {
        let config = RetryConfig {
            max_attempts: 3,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 1.0,
            max_jitter_factor: None,
        };
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "flaky",
            None,
            &config,
            &calls,
            |calls| {
                Box::pin(async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("failure {n}"))
                    } else {
                        Ok(n)
                    }
                })
            },
            |_| true,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    async fn non_retriable_errors_fail_immediately() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retries(
            "test",
            "fatal",
            None,
            &config,
            &calls,
            |calls| {
                Box::pin(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                })
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
