//! Destination store access and the paced JSON client shared by both APIs.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use formbridge_core::{DestinationRecord, FieldKey, MergePlan};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

pub mod notion;

pub use notion::{DestinationSchema, FieldMapping, NotionConfig, NotionStore, PropertyKind, StatusLabels};

pub const CRATE_NAME: &str = "formbridge-storage";

/// When a failed Typeform or Notion call is worth repeating.
///
/// Both APIs throttle with 429 and a `Retry-After` in seconds. Notion reports
/// write contention as 409 `conflict_error`, and both front their APIs with
/// gateways that shed load as 502/503/504.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub first_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a server-requested `Retry-After` wait.
    pub max_throttle_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_throttle_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    fn doubling(&self, retry: usize) -> Duration {
        let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
        self.first_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Wait before retry number `retry` of a request answered with `status`,
    /// or `None` when the answer is final.
    pub fn after_status(
        &self,
        status: StatusCode,
        headers: &HeaderMap,
        retry: usize,
    ) -> Option<Duration> {
        if retry >= self.max_retries {
            return None;
        }
        match status {
            StatusCode::TOO_MANY_REQUESTS => Some(
                retry_after(headers)
                    .map(|wait| wait.min(self.max_throttle_wait))
                    .unwrap_or_else(|| self.doubling(retry)),
            ),
            StatusCode::CONFLICT
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Some(self.doubling(retry)),
            _ => None,
        }
    }

    /// Timeouts and refused connections are retried; anything else is final.
    pub fn after_transport_error(&self, err: &reqwest::Error, retry: usize) -> Option<Duration> {
        (retry < self.max_retries && (err.is_timeout() || err.is_connect()))
            .then(|| self.doubling(retry))
    }
}

/// `Retry-After` as delta seconds; the HTTP-date form is not sent by either API.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    raw.parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Spaces calls on one client at least `interval` apart.
#[derive(Debug)]
pub struct RequestPacer {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait_turn(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(at) = *next_slot {
            tokio::time::sleep_until(at).await;
        }
        *next_slot = Some(Instant::now() + self.interval);
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub retry: RetryPolicy,
    /// Minimum spacing between requests; `None` sends back to back.
    pub pacing: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: None,
            extra_headers: Vec::new(),
            retry: RetryPolicy::default(),
            pacing: Some(Duration::from_millis(350)),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("credential rejected (http {status}) for {url}")]
    Unauthorized { status: u16, url: String },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("undecodable json from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl HttpError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

/// JSON-over-HTTP client with bearer auth, pacing and throttle-aware retries.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    pacer: Option<RequestPacer>,
    retry: RetryPolicy,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Result<Self, HttpError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| HttpError::Config(format!("authorization header: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &config.extra_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| HttpError::Config(format!("header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| HttpError::Config(format!("header value for {name}: {e}")))?;
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            pacer: config
                .pacing
                .filter(|interval| !interval.is_zero())
                .map(RequestPacer::new),
            retry: config.retry,
        })
    }

    pub async fn get_json(&self, url: &str) -> Result<JsonValue, HttpError> {
        self.send_json(Method::GET, url, None).await
    }

    pub async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, HttpError> {
        self.send_json(Method::POST, url, Some(body)).await
    }

    pub async fn patch_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, HttpError> {
        self.send_json(Method::PATCH, url, Some(body)).await
    }

    /// Send one request and decode the body; an empty body decodes to `null`.
    pub async fn send_json(
        &self,
        method: Method,
        url: &str,
        body: Option<&JsonValue>,
    ) -> Result<JsonValue, HttpError> {
        let span = info_span!("http_request", %method, url);
        async move {
            let mut retry = 0usize;
            loop {
                if let Some(pacer) = &self.pacer {
                    pacer.wait_turn().await;
                }
                let mut request = self.client.request(method.clone(), url);
                if let Some(body) = body {
                    request = request.json(body);
                }

                let resp = match request.send().await {
                    Ok(resp) => resp,
                    Err(err) => match self.retry.after_transport_error(&err, retry) {
                        Some(wait) => {
                            debug!(error = %err, retry, ?wait, "transport error, retrying");
                            tokio::time::sleep(wait).await;
                            retry += 1;
                            continue;
                        }
                        None => return Err(HttpError::Request(err)),
                    },
                };

                let status = resp.status();
                if status.is_success() {
                    let bytes = resp.bytes().await?;
                    if bytes.is_empty() {
                        return Ok(JsonValue::Null);
                    }
                    return serde_json::from_slice(&bytes).map_err(|source| HttpError::Decode {
                        url: url.to_string(),
                        source,
                    });
                }
                if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                    return Err(HttpError::Unauthorized {
                        status: status.as_u16(),
                        url: url.to_string(),
                    });
                }
                if let Some(wait) = self.retry.after_status(status, resp.headers(), retry) {
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(retry, ?wait, "rate limited");
                    } else {
                        debug!(status = status.as_u16(), retry, ?wait, "retrying");
                    }
                    tokio::time::sleep(wait).await;
                    retry += 1;
                    continue;
                }
                let body = resp.text().await.unwrap_or_default();
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                    body,
                });
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("unexpected destination response: {0}")]
    Response(String),
    #[error("no destination property configured for {0}")]
    UnmappedField(String),
    #[error("record {0} not found in destination")]
    UnknownRecord(String),
}

impl StoreError {
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Http(err) if err.is_auth())
    }
}

/// Destination workspace the sync augments.
#[async_trait]
pub trait DestinationStore: Send + Sync {
    /// Every record with its current field values.
    async fn list_records(&self) -> Result<Vec<DestinationRecord>, StoreError>;

    /// Records whose name contains `fragment` (no word-boundary semantics).
    async fn search_by_name(&self, fragment: &str) -> Result<Vec<DestinationRecord>, StoreError>;

    async fn update_record(&self, record_id: &str, plan: &MergePlan) -> Result<(), StoreError>;

    /// Create missing field definitions; returns the names that were added.
    async fn ensure_fields(&self, fields: &[FieldKey]) -> Result<Vec<String>, StoreError>;
}

/// Process-local store, used for rehearsals and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: StdMutex<Vec<DestinationRecord>>,
    known_fields: StdMutex<Vec<FieldKey>>,
    updates: StdMutex<Vec<(String, MergePlan)>>,
    failing_ids: StdMutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new(records: Vec<DestinationRecord>) -> Self {
        Self {
            records: StdMutex::new(records),
            ..Self::default()
        }
    }

    /// Make every update of `record_id` fail with `message`.
    pub fn fail_updates_for(&self, record_id: &str, message: &str) {
        lock(&self.failing_ids).insert(record_id.to_string(), message.to_string());
    }

    pub fn records(&self) -> Vec<DestinationRecord> {
        lock(&self.records).clone()
    }

    pub fn updates(&self) -> Vec<(String, MergePlan)> {
        lock(&self.updates).clone()
    }

    pub fn known_fields(&self) -> Vec<FieldKey> {
        lock(&self.known_fields).clone()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl DestinationStore for MemoryStore {
    async fn list_records(&self) -> Result<Vec<DestinationRecord>, StoreError> {
        Ok(self.records())
    }

    async fn search_by_name(&self, fragment: &str) -> Result<Vec<DestinationRecord>, StoreError> {
        let needle = fragment.to_lowercase();
        Ok(lock(&self.records)
            .iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .cloned()
            .collect())
    }

    async fn update_record(&self, record_id: &str, plan: &MergePlan) -> Result<(), StoreError> {
        if let Some(message) = lock(&self.failing_ids).get(record_id) {
            return Err(StoreError::Response(message.clone()));
        }
        let mut records = lock(&self.records);
        let record = records
            .iter_mut()
            .find(|r| r.id == record_id)
            .ok_or_else(|| StoreError::UnknownRecord(record_id.to_string()))?;
        plan.apply_to(record);
        lock(&self.updates).push((record_id.to_string(), plan.clone()));
        Ok(())
    }

    async fn ensure_fields(&self, fields: &[FieldKey]) -> Result<Vec<String>, StoreError> {
        let mut known = lock(&self.known_fields);
        let mut added = Vec::new();
        for field in fields {
            if !known.contains(field) {
                known.push(field.clone());
                added.push(field.label());
            }
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            first_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_throttle_wait: Duration::from_secs(30),
        }
    }

    fn retry_after_header(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn gateway_and_conflict_answers_back_off_exponentially() {
        let none = HeaderMap::new();
        let policy = policy();
        assert_eq!(
            policy.after_status(StatusCode::BAD_GATEWAY, &none, 0),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.after_status(StatusCode::CONFLICT, &none, 1),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            policy.after_status(StatusCode::SERVICE_UNAVAILABLE, &none, 2),
            Some(Duration::from_millis(350))
        );
        assert_eq!(policy.after_status(StatusCode::SERVICE_UNAVAILABLE, &none, 3), None);
    }

    #[test]
    fn throttling_honours_retry_after() {
        let policy = policy();
        assert_eq!(
            policy.after_status(StatusCode::TOO_MANY_REQUESTS, &retry_after_header("2"), 0),
            Some(Duration::from_secs(2))
        );
        assert_eq!(
            policy.after_status(StatusCode::TOO_MANY_REQUESTS, &retry_after_header("0.5"), 0),
            Some(Duration::from_millis(500))
        );
        assert_eq!(
            policy.after_status(StatusCode::TOO_MANY_REQUESTS, &retry_after_header("3600"), 1),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            policy.after_status(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), 1),
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn validation_and_auth_answers_are_final() {
        let none = HeaderMap::new();
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::NOT_FOUND,
        ] {
            assert_eq!(policy().after_status(status, &none, 0), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pacer_spaces_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(350));
        let started = Instant::now();
        pacer.wait_turn().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        pacer.wait_turn().await;
        pacer.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(700));
    }

    #[tokio::test]
    async fn memory_store_applies_plans_and_tracks_fields() {
        let store = MemoryStore::new(vec![DestinationRecord::new("p1", "Jane Smith")]);
        let mut plan = MergePlan::default();
        plan.writes.insert(FieldKey::Phone, "555-1234".into());
        store.update_record("p1", &plan).await.unwrap();
        assert_eq!(store.records()[0].get(&FieldKey::Phone), "555-1234");
        assert!(matches!(
            store.update_record("nope", &plan).await,
            Err(StoreError::UnknownRecord(_))
        ));

        let added = store
            .ensure_fields(&[FieldKey::Status, FieldKey::Profile("Pets".into())])
            .await
            .unwrap();
        assert_eq!(added, vec!["status".to_string(), "profile:Pets".to_string()]);
        assert!(store.ensure_fields(&[FieldKey::Status]).await.unwrap().is_empty());

        let hits = store.search_by_name("smith").await.unwrap();
        assert_eq!(hits.len(), 1);
    }
}
