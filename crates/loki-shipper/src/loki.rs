// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of log lines to Loki's push API.
//!
//! A [`DeliveryBatch`] is encoded as one JSON push request: lines sharing a
//! label set form one stream, and each entry is a `[nanosecond timestamp, line]`
//! pair. Server errors and network failures are retried according to the
//! configured [`RetryStrategy`]; client errors are never retried.

use reqwest::StatusCode;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::DeliveryError;
use crate::http::get_client;
use crate::mapper::LogLine;

pub const LOKI_PORT: u16 = 3100;
pub const PUSH_PATH: &str = "/loki/api/v1/push";

/// How many times a push is attempted and how long to wait in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry right away, up to the given number of attempts.
    Immediate(u64),
    /// Attempts and a fixed delay in milliseconds.
    LinearBackoff(u64, u64),
    /// Delay doubles after each failure, starting at `base_ms` and capped at `max_ms`.
    ExponentialBackoff {
        attempts: u64,
        base_ms: u64,
        max_ms: u64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff {
            attempts: 5,
            base_ms: 500,
            max_ms: 30_000,
        }
    }
}

impl RetryStrategy {
    /// Attempt ceiling, never lower than one.
    pub fn max_attempts(&self) -> u64 {
        let attempts = match self {
            RetryStrategy::Immediate(attempts)
            | RetryStrategy::LinearBackoff(attempts, _)
            | RetryStrategy::ExponentialBackoff { attempts, .. } => *attempts,
        };
        attempts.max(1)
    }

    /// Delay before the next attempt, once attempt number `attempt` (1-based) has failed.
    pub fn delay_after(&self, attempt: u64) -> Duration {
        match self {
            RetryStrategy::Immediate(_) => Duration::ZERO,
            RetryStrategy::LinearBackoff(_, delay_ms) => Duration::from_millis(*delay_ms),
            RetryStrategy::ExponentialBackoff {
                base_ms, max_ms, ..
            } => {
                let exponent = attempt.saturating_sub(1).min(32) as u32;
                let delay = base_ms.saturating_mul(2_u64.saturating_pow(exponent));
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}

/// Ordered log lines pushed together in one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryBatch {
    lines: Vec<LogLine>,
}

impl DeliveryBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, line: LogLine) {
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl From<Vec<LogLine>> for DeliveryBatch {
    fn from(lines: Vec<LogLine>) -> Self {
        Self { lines }
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    streams: Vec<PushStream<'a>>,
}

#[derive(Serialize)]
struct PushStream<'a> {
    stream: &'a BTreeMap<String, String>,
    values: Vec<(String, &'a str)>,
}

fn encode_push_body(batch: &DeliveryBatch) -> Result<Vec<u8>, DeliveryError> {
    let mut streams: Vec<PushStream<'_>> = Vec::new();
    for line in batch.lines() {
        let entry = (line.timestamp_ns.to_string(), line.line.as_str());
        match streams.iter_mut().find(|s| *s.stream == line.labels) {
            Some(stream) => stream.values.push(entry),
            None => streams.push(PushStream {
                stream: &line.labels,
                values: vec![entry],
            }),
        }
    }
    serde_json::to_vec(&PushRequest { streams })
        .map_err(|e| DeliveryError::Payload(e.to_string()))
}

pub struct LokiClientConfig {
    /// Full push URL, e.g. `http://loki:3100/loki/api/v1/push`.
    pub url: String,
    /// Sent as `X-Scope-OrgID` for multi-tenant Loki.
    pub tenant_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
}

#[derive(Debug, Clone)]
pub struct LokiClient {
    client: reqwest::Client,
    url: String,
    tenant_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
    retry_strategy: RetryStrategy,
}

impl LokiClient {
    /// # Errors
    ///
    /// [`DeliveryError::Client`] when the HTTP client cannot be built.
    pub fn new(config: LokiClientConfig) -> Result<Self, DeliveryError> {
        let client = get_client(config.https_proxy.as_deref(), config.timeout)
            .map_err(|e| DeliveryError::Client(e.to_string()))?;
        Ok(LokiClient {
            client,
            url: config.url,
            tenant_id: config.tenant_id,
            username: config.username,
            password: config.password,
            retry_strategy: config.retry_strategy,
        })
    }

    fn create_request(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(tenant_id) = &self.tenant_id {
            request = request.header("X-Scope-OrgID", tenant_id);
        }
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }
        request
    }

    /// Pushes `batch` as a single request.
    ///
    /// Succeeds only on a 2xx response. A 4xx response other than 429 fails
    /// immediately with [`DeliveryError::Rejected`]; anything else is retried
    /// until the attempt ceiling, then reported as [`DeliveryError::Exhausted`].
    pub async fn push(&self, batch: &DeliveryBatch) -> Result<(), DeliveryError> {
        if batch.is_empty() {
            return Ok(());
        }
        let body = encode_push_body(batch)?;
        let max_attempts = self.retry_strategy.max_attempts();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let time = Instant::now();
            let resp = self.create_request(body.clone()).send().await;
            let elapsed = time.elapsed();

            let last_error = match resp {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!(
                            "LOKI | Pushed {} lines in {} ms",
                            batch.len(),
                            elapsed.as_millis()
                        );
                        return Ok(());
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if is_permanent_error(status) {
                        error!("LOKI | Push rejected with {status}: {body}");
                        return Err(DeliveryError::Rejected { status, body });
                    }
                    format!("{status}: {body}")
                }
                Err(e) => format!("network error: {e}"),
            };

            if attempts >= max_attempts {
                error!(
                    "LOKI | Failed to push {} lines after {attempts} attempts: {last_error}",
                    batch.len()
                );
                return Err(DeliveryError::Exhausted {
                    attempts,
                    last_error,
                });
            }

            let delay = self.retry_strategy.delay_after(attempts);
            warn!(
                "LOKI | Push attempt {attempts}/{max_attempts} failed after {} ms: {last_error}, retrying in {} ms",
                elapsed.as_millis(),
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Client errors mean the request itself is bad, except for rate limiting.
fn is_permanent_error(status: StatusCode) -> bool {
    status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn line(collection: &str, timestamp_ns: i64, text: &str) -> LogLine {
        LogLine {
            labels: BTreeMap::from([
                ("collection".to_string(), collection.to_string()),
                ("host".to_string(), "gw".to_string()),
            ]),
            timestamp_ns,
            line: text.to_string(),
        }
    }

    fn client(url: String, retry_strategy: RetryStrategy) -> LokiClient {
        LokiClient::new(LokiClientConfig {
            url,
            tenant_id: None,
            username: None,
            password: None,
            https_proxy: None,
            timeout: Duration::from_secs(2),
            retry_strategy,
        })
        .unwrap()
    }

    #[test]
    fn test_retry_strategy_delays() {
        let strategy = RetryStrategy::ExponentialBackoff {
            attempts: 6,
            base_ms: 100,
            max_ms: 1_000,
        };
        let delays: Vec<u128> = (1..=5)
            .map(|attempt| strategy.delay_after(attempt).as_millis())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000]);
        assert_eq!(strategy.max_attempts(), 6);

        assert_eq!(
            RetryStrategy::LinearBackoff(3, 250).delay_after(2),
            Duration::from_millis(250)
        );
        assert_eq!(RetryStrategy::Immediate(0).max_attempts(), 1);
        assert_eq!(RetryStrategy::Immediate(3).delay_after(1), Duration::ZERO);
    }

    #[test]
    fn test_exponential_delay_does_not_overflow() {
        let strategy = RetryStrategy::ExponentialBackoff {
            attempts: u64::MAX,
            base_ms: u64::MAX / 2,
            max_ms: 30_000,
        };
        assert_eq!(strategy.delay_after(90), Duration::from_millis(30_000));
    }

    #[test]
    fn test_push_body_groups_streams_in_order() {
        let batch = DeliveryBatch::from(vec![
            line("alarm", 1_000, "a1"),
            line("event", 2_000, "e1"),
            line("alarm", 3_000, "a2"),
        ]);
        let body: serde_json::Value =
            serde_json::from_slice(&encode_push_body(&batch).unwrap()).unwrap();
        assert_eq!(
            body,
            json!({
                "streams": [
                    {
                        "stream": { "collection": "alarm", "host": "gw" },
                        "values": [["1000", "a1"], ["3000", "a2"]],
                    },
                    {
                        "stream": { "collection": "event", "host": "gw" },
                        "values": [["2000", "e1"]],
                    },
                ]
            })
        );
    }

    #[test]
    fn test_permanent_errors() {
        assert!(is_permanent_error(StatusCode::BAD_REQUEST));
        assert!(is_permanent_error(StatusCode::UNAUTHORIZED));
        assert!(!is_permanent_error(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_permanent_error(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_push_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .match_header("content-type", "application/json")
            .match_body(Matcher::Json(json!({
                "streams": [{
                    "stream": { "collection": "alarm", "host": "gw" },
                    "values": [["1705000000000000000", "{\"key\":\"x\"}"]],
                }]
            })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let loki = client(
            format!("{}{PUSH_PATH}", server.url()),
            RetryStrategy::Immediate(3),
        );
        let batch = DeliveryBatch::from(vec![line(
            "alarm",
            1_705_000_000_000_000_000,
            "{\"key\":\"x\"}",
        )]);

        assert!(loki.push(&batch).await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_retries_then_succeeds() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("POST", PUSH_PATH)
            .with_status(503)
            .expect(3)
            .create_async()
            .await;
        let success = server
            .mock("POST", PUSH_PATH)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let loki = client(
            format!("{}{PUSH_PATH}", server.url()),
            RetryStrategy::LinearBackoff(4, 1),
        );
        let batch = DeliveryBatch::from(vec![line("alarm", 1, "x")]);

        assert!(loki.push(&batch).await.is_ok());
        failing.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_exhausts_retries() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .with_status(500)
            .with_body("Internal Server Error")
            .expect(3)
            .create_async()
            .await;

        let loki = client(
            format!("{}{PUSH_PATH}", server.url()),
            RetryStrategy::Immediate(3),
        );
        let batch = DeliveryBatch::from(vec![line("alarm", 1, "x")]);

        match loki.push(&batch).await {
            Err(DeliveryError::Exhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("Internal Server Error"));
            }
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_client_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .with_status(400)
            .with_body("entry too far behind")
            .expect(1)
            .create_async()
            .await;

        let loki = client(
            format!("{}{PUSH_PATH}", server.url()),
            RetryStrategy::Immediate(5),
        );
        let batch = DeliveryBatch::from(vec![line("alarm", 1, "x")]);

        match loki.push(&batch).await {
            Err(DeliveryError::Rejected { status, body }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "entry too far behind");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_rate_limit_is_retried() {
        let mut server = Server::new_async().await;
        let limited = server
            .mock("POST", PUSH_PATH)
            .with_status(429)
            .expect(1)
            .create_async()
            .await;
        let success = server
            .mock("POST", PUSH_PATH)
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let loki = client(
            format!("{}{PUSH_PATH}", server.url()),
            RetryStrategy::Immediate(2),
        );
        let batch = DeliveryBatch::from(vec![line("alarm", 1, "x")]);

        assert!(loki.push(&batch).await.is_ok());
        limited.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn test_push_network_error_exhausts() {
        let loki = client(
            "http://127.0.0.1:1/loki/api/v1/push".to_string(),
            RetryStrategy::Immediate(2),
        );
        let batch = DeliveryBatch::from(vec![line("alarm", 1, "x")]);

        assert!(matches!(
            loki.push(&batch).await,
            Err(DeliveryError::Exhausted { attempts: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_push_sends_tenant_and_auth_headers() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .match_header("X-Scope-OrgID", "home")
            .match_header("authorization", "Basic dXNlcjpwYXNz")
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let loki = LokiClient::new(LokiClientConfig {
            url: format!("{}{PUSH_PATH}", server.url()),
            tenant_id: Some("home".to_string()),
            username: Some("user".to_string()),
            password: Some("pass".to_string()),
            https_proxy: None,
            timeout: Duration::from_secs(2),
            retry_strategy: RetryStrategy::Immediate(1),
        })
        .unwrap();
        let batch = DeliveryBatch::from(vec![line("alarm", 1, "x")]);

        assert!(loki.push(&batch).await.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_sent() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", PUSH_PATH)
            .expect(0)
            .create_async()
            .await;

        let loki = client(
            format!("{}{PUSH_PATH}", server.url()),
            RetryStrategy::Immediate(1),
        );
        assert!(loki.push(&DeliveryBatch::new()).await.is_ok());
        mock.assert_async().await;
    }
}
