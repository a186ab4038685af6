use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::QuerySection;

pub type QueryResult<T> = std::result::Result<T, QueryError>;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("query timed out after {0} ms")]
    Timeout(u64),
    #[error("rate limited (HTTP 429)")]
    RateLimited,
    #[error("server error (HTTP {0})")]
    Server(u16),
    #[error("request rejected (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl QueryError {
    fn retryable(&self) -> bool {
        matches!(
            self,
            QueryError::Transport(_)
                | QueryError::Timeout(_)
                | QueryError::RateLimited
                | QueryError::Server(_)
        )
    }
}

/// One scored trace row from the evaluation backend.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceRow {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub scores: HashMap<String, Option<f64>>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryHealthStatus {
    Healthy,
    Degraded,
}

/// Diagnostic counters surfaced through `monitor_health` events.
#[derive(Debug, Clone, Serialize)]
pub struct QueryHealth {
    pub status: QueryHealthStatus,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_rate_limited: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_backoff_ms: Option<u64>,
}

/// Capability the monitor polls for scored traces.
#[async_trait]
pub trait QueryClient: Send + Sync {
    async fn query(&self, sql: &str) -> QueryResult<Vec<TraceRow>>;
    fn health(&self) -> QueryHealth;
}

#[derive(Debug, Default)]
struct HealthCounters {
    consecutive_failures: u32,
    total_requests: u64,
    total_rate_limited: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_backoff_ms: Option<u64>,
}

/// HTTP query client with bounded retries.
///
/// Backoff starts at 1 s and doubles to a 16 s cap, with up to ±400 ms of
/// jitter per sleep. Transport errors, timeouts, 429s, and 5xx responses are
/// retried; other 4xx responses surface immediately.
pub struct HttpQueryClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout_ms: u64,
    max_retries: u32,
    counters: Mutex<HealthCounters>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    data: Vec<TraceRow>,
}

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 16_000;
const BACKOFF_JITTER_MS: i64 = 400;

impl HttpQueryClient {
    pub fn new(section: &QuerySection) -> QueryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(section.timeout_ms))
            .build()?;
        let endpoint = format!(
            "{}{}",
            section.api_url.trim_end_matches('/'),
            section.path
        );
        Ok(Self {
            http,
            endpoint,
            api_key: section.api_key.clone(),
            timeout_ms: section.timeout_ms,
            max_retries: section.max_retries,
            counters: Mutex::new(HealthCounters::default()),
        })
    }

    async fn attempt(&self, sql: &str) -> QueryResult<Vec<TraceRow>> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&QueryRequest { query: sql })
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    QueryError::Timeout(self.timeout_ms)
                } else {
                    QueryError::Transport(err)
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(QueryError::RateLimited);
        }
        if status.is_server_error() {
            return Err(QueryError::Server(status.as_u16()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(QueryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        let payload: QueryResponse = response.json().await?;
        Ok(payload.data)
    }

    fn backoff_for(attempt: u32) -> Duration {
        let base = BACKOFF_BASE_MS
            .saturating_mul(1u64 << attempt.min(4))
            .min(BACKOFF_CAP_MS);
        let jitter = rand::thread_rng().gen_range(-BACKOFF_JITTER_MS..=BACKOFF_JITTER_MS);
        Duration::from_millis((base as i64 + jitter).max(0) as u64)
    }

    fn record_success(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.total_requests += 1;
        counters.consecutive_failures = 0;
        counters.last_success_at = Some(Utc::now());
        counters.last_backoff_ms = None;
    }

    fn record_failure(&self, error: &QueryError, backoff: Option<Duration>) {
        let mut counters = self.counters.lock().unwrap();
        counters.total_requests += 1;
        counters.consecutive_failures += 1;
        counters.last_error_at = Some(Utc::now());
        counters.last_error = Some(error.to_string());
        counters.last_backoff_ms = backoff.map(|d| d.as_millis() as u64);
        if matches!(error, QueryError::RateLimited) {
            counters.total_rate_limited += 1;
        }
    }
}

#[async_trait]
impl QueryClient for HttpQueryClient {
    async fn query(&self, sql: &str) -> QueryResult<Vec<TraceRow>> {
        let mut attempt = 0u32;
        loop {
            match self.attempt(sql).await {
                Ok(rows) => {
                    self.record_success();
                    debug!(target: "query_client", rows = rows.len(), "query succeeded");
                    return Ok(rows);
                }
                Err(err) if err.retryable() && attempt < self.max_retries => {
                    let backoff = Self::backoff_for(attempt);
                    self.record_failure(&err, Some(backoff));
                    warn!(
                        target: "query_client",
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "query failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => {
                    self.record_failure(&err, None);
                    warn!(target: "query_client", error = %err, "query failed");
                    if err.retryable() {
                        return Err(QueryError::RetriesExhausted {
                            attempts: attempt + 1,
                            last: err.to_string(),
                        });
                    }
                    return Err(err);
                }
            }
        }
    }

    fn health(&self) -> QueryHealth {
        let counters = self.counters.lock().unwrap();
        let status = if counters.consecutive_failures == 0 {
            QueryHealthStatus::Healthy
        } else {
            QueryHealthStatus::Degraded
        };
        QueryHealth {
            status,
            consecutive_failures: counters.consecutive_failures,
            total_requests: counters.total_requests,
            total_rate_limited: counters.total_rate_limited,
            last_success_at: counters.last_success_at,
            last_error_at: counters.last_error_at,
            last_error: counters.last_error.clone(),
            last_backoff_ms: counters.last_backoff_ms,
        }
    }
}
