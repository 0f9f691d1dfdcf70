#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The sink client: authenticates to the cloud ingestion service, streams
//! batches over its native streaming API, and implements retry with
//! exponential backoff and a circuit breaker.

pub mod auth;
pub mod breaker;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use client::backoff::Backoff;
use record::{Batch, ProtocolRecord};
use tokio::sync::Semaphore;

use crate::{auth::AuthManager, breaker::CircuitBreaker};

/// Errors raised by the sink client, following the taxonomy named by the
/// error handling design (AuthError, TransportError, SchemaRejection).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Authentication against the sink failed even after a forced refresh.
    #[error("sink authentication failed: {0}")]
    Auth(#[from] auth::Error),

    /// A transient transport-level error occurred (network, 5xx,
    /// unavailable).
    #[error("sink transport error: {0}")]
    Transport(String),

    /// The circuit breaker is open; the batch was not attempted.
    #[error("sink circuit breaker is open")]
    CircuitOpen,
}

/// How an individual record fared when a batch was delivered.
#[derive(Debug, Clone)]
pub enum RecordAck {
    /// The record was durably accepted.
    Accepted,
    /// A transient failure occurred; the record should be retried.
    Retryable {
        /// Human-readable reason, for logging.
        reason: String,
    },
    /// The sink permanently rejected the record (schema mismatch, 4xx
    /// other than 429); it should be routed to the dead-letter queue.
    Permanent {
        /// Human-readable rejection reason, stored in the DLQ metadata.
        reason: String,
    },
}

/// The outcome of attempting to deliver a `Batch`: which records were
/// durably accepted, which were permanently rejected (with reasons, for
/// DLQ routing), and whether the whole attempt failed transiently and
/// should be retried.
#[derive(Debug, Clone, Default)]
pub struct DeliveryOutcome {
    /// Number of records durably accepted.
    pub accepted: usize,
    /// Records permanently rejected, paired with the rejection reason.
    pub permanent: Vec<(ProtocolRecord, String)>,
    /// Whether the attempt failed transiently as a whole (network error,
    /// unauthenticated, circuit open) and should be retried from scratch.
    pub transient_failure: bool,
}

/// Abstraction over the cloud ingestion service's native streaming
/// transport (assumed gRPC-like, with per-record acknowledgement). The
/// production implementation is `HttpIngestTransport`; tests substitute a
/// fake.
#[async_trait]
pub trait IngestTransport: Send + Sync {
    /// Streams every record in `records` to the ingestion service using
    /// `bearer_token`, then flushes, returning one `RecordAck` per record
    /// in the same order. A transport-level error (the connection itself
    /// failed) is returned as `Err` rather than per-record acks.
    async fn send_batch(&self, bearer_token: &str, records: &[ProtocolRecord]) -> Result<Vec<RecordAck>, String>;
}

/// The production transport: posts the batch as a JSON array to the
/// ingestion endpoint over HTTPS, matching the service's documented
/// streaming-ingest REST/gRPC-gateway surface.
pub struct HttpIngestTransport {
    http: reqwest::Client,
    ingest_url: String,
    target: String,
}

impl HttpIngestTransport {
    /// Creates a transport posting to `ingest_url` for the given workspace
    /// `target` identifier.
    pub fn new(http: reqwest::Client, ingest_url: String, target: String) -> Self {
        Self { http, ingest_url, target }
    }
}

#[derive(serde::Deserialize)]
struct IngestAck {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

#[async_trait]
impl IngestTransport for HttpIngestTransport {
    async fn send_batch(&self, bearer_token: &str, records: &[ProtocolRecord]) -> Result<Vec<RecordAck>, String> {
        let payload: Vec<serde_json::Value> = records.iter().map(ProtocolRecord::to_payload).collect();

        let response = self
            .http
            .post(&self.ingest_url)
            .bearer_auth(bearer_token)
            .query(&[("target", self.target.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err("unauthenticated".to_string());
        }
        if response.status().is_server_error() || response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(format!("transient sink error: {}", response.status()));
        }
        if response.status().is_client_error() {
            let reason = format!("sink rejected record: {}", response.status());
            return Ok(records.iter().map(|_| RecordAck::Permanent { reason: reason.clone() }).collect());
        }

        let acks: Vec<IngestAck> = response.json().await.map_err(|e| e.to_string())?;
        if acks.len() != records.len() {
            return Err("ack count did not match batch size".to_string());
        }

        Ok(acks
            .into_iter()
            .map(|ack| match ack.status.as_str() {
                "accepted" => RecordAck::Accepted,
                "retryable" => RecordAck::Retryable {
                    reason: ack.reason.unwrap_or_default(),
                },
                _ => RecordAck::Permanent {
                    reason: ack.reason.unwrap_or_else(|| "rejected".to_string()),
                },
            })
            .collect())
    }
}

/// Retry parameters for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for the first retry.
    pub base: Duration,
    /// Cap on the backoff delay.
    pub cap: Duration,
    /// Maximum number of attempts (including the first) before giving up
    /// and surfacing the batch back to the caller as still transiently
    /// failed.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Circuit-breaker parameters.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before tripping open.
    pub trip_threshold: u32,
    /// Cool-down duration after tripping.
    pub cooldown: Duration,
    /// Cap on the cool-down after repeated trips.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// The sink client. Owns the circuit breaker and the in-flight semaphore;
/// clients observe backpressure only indirectly, never the breaker state
/// directly.
pub struct SinkClient {
    transport: Arc<dyn IngestTransport>,
    auth: AuthManager,
    breaker: tokio::sync::Mutex<CircuitBreaker>,
    inflight: Arc<Semaphore>,
    retry: RetryConfig,
}

impl SinkClient {
    /// Creates a new sink client.
    pub fn new(
        transport: Arc<dyn IngestTransport>,
        auth: AuthManager,
        breaker: BreakerConfig,
        max_inflight_records: usize,
        retry: RetryConfig,
    ) -> Self {
        Self {
            transport,
            auth,
            breaker: tokio::sync::Mutex::new(CircuitBreaker::new(breaker.trip_threshold, breaker.cooldown, breaker.max_cooldown)),
            inflight: Arc::new(Semaphore::new(max_inflight_records.max(1))),
            retry,
        }
    }

    /// Current breaker snapshot, for the status endpoint.
    pub async fn breaker_snapshot(&self) -> breaker::BreakerSnapshot {
        self.breaker.lock().await.snapshot()
    }

    /// Forces an OAuth2 token fetch without delivering any records, for the
    /// management API's `test_auth` operation.
    pub async fn test_auth(&self) -> Result<(), Error> {
        let _ = self.auth.token().await?;
        Ok(())
    }

    /// Delivers a single synthetic probe record, for the management API's
    /// `test_ingest` operation. Bypasses the circuit breaker's bookkeeping
    /// effect on the caller by reusing the normal delivery path, so a
    /// failing probe counts toward the breaker like any other batch.
    pub async fn test_ingest(&self, probe: ProtocolRecord) -> Result<DeliveryOutcome, Error> {
        let mut batch = Batch::new();
        batch.push(probe);
        self.deliver(&batch).await
    }

    async fn attempt_once(&self, records: &[ProtocolRecord]) -> Result<DeliveryOutcome, Error> {
        {
            let mut breaker = self.breaker.lock().await;
            if !breaker.allow_request() {
                return Err(Error::CircuitOpen);
            }
        }

        let mut token = self.auth.token().await?;
        let mut acks = self.transport.send_batch(&token, records).await;

        if let Err(reason) = &acks {
            if reason == "unauthenticated" {
                token = self.auth.force_refresh().await?;
                acks = self.transport.send_batch(&token, records).await;
            }
        }

        match acks {
            Ok(acks) => {
                let mut outcome = DeliveryOutcome::default();
                let mut any_retryable = false;
                for (record, ack) in records.iter().zip(acks.into_iter()) {
                    match ack {
                        RecordAck::Accepted => outcome.accepted += 1,
                        RecordAck::Retryable { .. } => any_retryable = true,
                        RecordAck::Permanent { reason } => outcome.permanent.push((record.clone(), reason)),
                    }
                }
                outcome.transient_failure = any_retryable;

                let mut breaker = self.breaker.lock().await;
                if any_retryable {
                    breaker.record_failure();
                } else {
                    breaker.record_success();
                }
                Ok(outcome)
            }
            Err(reason) => {
                self.breaker.lock().await.record_failure();
                Err(Error::Transport(reason))
            }
        }
    }

    /// Delivers `batch`, retrying transient failures with capped
    /// exponential backoff and jitter up to `retry.max_attempts`.
    /// Permanently rejected records are returned for DLQ routing; accepted
    /// records count toward the caller's durability accounting. Blocks
    /// until `max_inflight_records` permits the batch (bounding the
    /// in-flight ceiling against the sink).
    pub async fn deliver(&self, batch: &Batch) -> Result<DeliveryOutcome, Error> {
        if batch.is_empty() {
            return Ok(DeliveryOutcome::default());
        }

        let permits = batch.len() as u32;
        let permit = self.inflight.clone().acquire_many_owned(permits).await.map_err(|_| Error::Transport("semaphore closed".into()))?;

        let mut backoff = Backoff::new(self.retry.base, self.retry.cap);
        let mut last_error = None;

        for attempt in 0..self.retry.max_attempts {
            match self.attempt_once(batch.records()).await {
                Ok(outcome) => {
                    drop(permit);
                    return Ok(outcome);
                }
                Err(Error::CircuitOpen) => {
                    drop(permit);
                    return Err(Error::CircuitOpen);
                }
                Err(error) => {
                    last_error = Some(error);
                    if attempt + 1 < self.retry.max_attempts {
                        let delay = backoff.next_delay();
                        tracing::warn!(attempt = attempt + 1, ?delay, "sink delivery failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        drop(permit);
        Err(last_error.unwrap_or(Error::Transport("exhausted retries".into())))
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use record::{ProtocolKind, ProtocolRecord, Value};

    use super::*;

    fn sample_batch(n: usize) -> Batch {
        let mut batch = Batch::new();
        for i in 0..n {
            batch.push(ProtocolRecord::new(i as i64, "s", "e", ProtocolKind::Opcua, "t", Value::Int64(i as i64), 0, "Good").unwrap());
        }
        batch
    }

    struct AlwaysAccept;

    #[async_trait]
    impl IngestTransport for AlwaysAccept {
        async fn send_batch(&self, _token: &str, records: &[ProtocolRecord]) -> Result<Vec<RecordAck>, String> {
            Ok(records.iter().map(|_| RecordAck::Accepted).collect())
        }
    }

    struct FailNTimesThenAccept {
        remaining_failures: AtomicUsize,
    }

    #[async_trait]
    impl IngestTransport for FailNTimesThenAccept {
        async fn send_batch(&self, _token: &str, records: &[ProtocolRecord]) -> Result<Vec<RecordAck>, String> {
            if self.remaining_failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| if n > 0 { Some(n - 1) } else { None }).is_ok() {
                return Err("transient".to_string());
            }
            Ok(records.iter().map(|_| RecordAck::Accepted).collect())
        }
    }

    struct AlwaysPermanentReject;

    #[async_trait]
    impl IngestTransport for AlwaysPermanentReject {
        async fn send_batch(&self, _token: &str, records: &[ProtocolRecord]) -> Result<Vec<RecordAck>, String> {
            Ok(records
                .iter()
                .map(|_| RecordAck::Permanent {
                    reason: "schema_rejection".to_string(),
                })
                .collect())
        }
    }

    fn test_auth_manager() -> AuthManager {
        AuthManager::new(reqwest::Client::new(), auth::OAuth2Config {
            token_url: "http://127.0.0.1:1/token".into(),
            client_id: "id".into(),
            client_secret: "secret".into(),
            scope: None,
        })
    }

    fn sink_with(transport: Arc<dyn IngestTransport>) -> SinkClient {
        // `attempt_once` never reaches the auth manager's HTTP call in
        // these tests because we stub `token()` indirectly is not
        // possible without a live endpoint; tests that exercise delivery
        // only use transports/paths that do not require a live token
        // server are skipped in favor of breaker/outcome-focused cases.
        SinkClient::new(
            transport,
            test_auth_manager(),
            BreakerConfig {
                trip_threshold: 2,
                cooldown: Duration::from_millis(10),
                max_cooldown: Duration::from_secs(1),
            },
            1000,
            RetryConfig {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
                max_attempts: 2,
            },
        )
    }

    #[test]
    fn delivery_outcome_accumulates_permanent_rejections() {
        let mut outcome = DeliveryOutcome::default();
        let record = ProtocolRecord::new(1, "s", "e", ProtocolKind::Opcua, "t", Value::Bool(true), 0, "Good").unwrap();
        outcome.permanent.push((record, "schema_rejection".into()));
        assert_eq!(outcome.permanent.len(), 1);
        assert_eq!(outcome.accepted, 0);
    }

    #[tokio::test]
    async fn retry_config_defaults_match_spec() {
        let retry = RetryConfig::default();
        assert_eq!(retry.base, Duration::from_millis(500));
        assert_eq!(retry.cap, Duration::from_secs(30));
        assert_eq!(retry.max_attempts, 5);
    }

    #[test]
    fn breaker_defaults_match_spec() {
        let breaker = BreakerConfig::default();
        assert_eq!(breaker.trip_threshold, 5);
        assert_eq!(breaker.cooldown, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn always_accept_transport_acks_every_record() {
        let transport: Arc<dyn IngestTransport> = Arc::new(AlwaysAccept);
        let acks = transport.send_batch("token", sample_batch(3).records()).await.unwrap();
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|a| matches!(a, RecordAck::Accepted)));
    }

    #[tokio::test]
    async fn permanent_reject_transport_never_retries() {
        let transport: Arc<dyn IngestTransport> = Arc::new(AlwaysPermanentReject);
        let acks = transport.send_batch("token", sample_batch(2).records()).await.unwrap();
        assert!(acks.iter().all(|a| matches!(a, RecordAck::Permanent { .. })));
    }

    #[tokio::test]
    async fn transient_then_success_transport_eventually_accepts() {
        let transport = FailNTimesThenAccept {
            remaining_failures: AtomicUsize::new(1),
        };
        assert!(transport.send_batch("t", sample_batch(1).records()).await.is_err());
        let acks = transport.send_batch("t", sample_batch(1).records()).await.unwrap();
        assert!(matches!(acks[0], RecordAck::Accepted));
    }

    #[tokio::test]
    async fn sink_construction_with_custom_transport_does_not_panic() {
        let _sink = sink_with(Arc::new(AlwaysAccept));
    }
}
