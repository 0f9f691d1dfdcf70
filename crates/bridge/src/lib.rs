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

//! The unified bridge: composes a protocol client, backpressure queue,
//! batcher, and shared sink client per source, and exposes a read-only
//! management surface over HTTP.

mod build;
pub mod http;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::{Duration, Instant},
};

use batcher::{Batcher, BatcherConfig};
use client::{
    control::{Signal, SignalReceiver},
    AsyncClient, ClientState, ClientStats, Health, OnRecord, OnStats,
};
use queue::{
    crypto::SpoolKey,
    dlq::Dlq,
    spool::Spool,
    BackpressureQueue, DropPolicy as QueueDropPolicy, OfferOutcome,
};
use record::{ProtocolKind, ProtocolRecord, Value};
use sink::{auth::AuthManager, BreakerConfig, HttpIngestTransport, IngestTransport, RetryConfig, SinkClient};
use tokio::sync::{mpsc, RwLock};

/// Errors raised by the bridge's management operations.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// No source is registered under this name.
    #[error("unknown source: {0}")]
    UnknownSource(String),

    /// A source by this name already exists.
    #[error("source already exists: {0}")]
    DuplicateSource(String),

    /// The source's definition is invalid or missing required options.
    #[error("invalid source `{0}`: {1}")]
    InvalidSource(String, String),

    /// Fetching or parsing a Thing Description failed.
    #[error("thing description error: {0}")]
    Wot(#[from] wot::Error),

    /// The queue/spool layer failed.
    #[error("queue error: {0}")]
    Queue(#[from] queue::Error),

    /// The spool's encryption key could not be derived.
    #[error("spool key error: {0}")]
    SpoolKey(#[from] queue::crypto::Error),

    /// The sink rejected a probe request.
    #[error("sink error: {0}")]
    Sink(#[from] sink::Error),
}

fn now_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Snapshot of a single source's runtime status, for the management API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SourceStatus {
    /// The source's configured name.
    pub name: String,
    /// Which protocol it speaks.
    pub protocol_kind: ProtocolKind,
    /// Whether the source is currently started.
    pub active: bool,
    /// The client's state-machine state, if active.
    pub state: Option<String>,
    /// The client's health, if active.
    pub health: Option<String>,
    /// Records emitted since the client last started.
    pub records_emitted: u64,
    /// Current in-memory queue depth.
    pub queue_depth: usize,
    /// Dead-lettered record count.
    pub dlq_count: usize,
}

/// A snapshot of the whole bridge's status, for `GET /api/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BridgeStatus {
    /// Per-source status.
    pub sources: Vec<SourceStatus>,
    /// The sink's circuit-breaker state, as a string.
    pub sink_breaker_state: String,
}

/// Aggregate counters, for `GET /api/metrics`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BridgeMetrics {
    /// Total records emitted across all sources.
    pub records_emitted: u64,
    /// Total records skipped (malformed) across all sources.
    pub records_skipped: u64,
    /// Total records dropped under backpressure (either policy).
    pub records_dropped: u64,
    /// Total records currently spooled to disk.
    pub records_spooled: u64,
    /// Total records dead-lettered.
    pub records_dead_lettered: u64,
}

struct ClientHandles {
    stop_tx: mpsc::Sender<Signal>,
    state: Arc<StdMutex<ClientState>>,
    health: Arc<StdMutex<Health>>,
    stats: Arc<StdMutex<ClientStats>>,
}

struct SourceRuntime {
    definition: config::SourceConfig,
    protocol_kind: ProtocolKind,
    queue: Arc<BackpressureQueue>,
    dlq: Arc<tokio::sync::Mutex<Dlq>>,
    spool: Option<Arc<tokio::sync::Mutex<Spool>>>,
    client: Option<ClientHandles>,
}

impl SourceRuntime {
    fn status(&self) -> SourceStatus {
        let (state, health, records_emitted) = match &self.client {
            Some(handles) => (
                Some(handles.state.lock().expect("state lock poisoned").to_string()),
                Some(format!("{:?}", handles.health.lock().expect("health lock poisoned"))),
                handles.stats.lock().expect("stats lock poisoned").records_emitted,
            ),
            None => (None, None, 0),
        };

        SourceStatus {
            name: self.definition.name.clone(),
            protocol_kind: self.protocol_kind,
            active: self.client.is_some(),
            state,
            health,
            records_emitted,
            queue_depth: self.queue.depth(),
            dlq_count: 0,
        }
    }
}

/// The bridge: owns every configured source's runtime state and the shared
/// sink client, and exposes management operations consumed either directly
/// or via the HTTP surface in `http`.
pub struct Bridge {
    sources: RwLock<HashMap<String, SourceRuntime>>,
    sink: Arc<SinkClient>,
    pipeline: config::PipelineConfig,
    spool_cfg: config::SpoolConfig,
    spool_key: SpoolKey,
    tasks: task::TaskManager,
}

async fn drive_client(
    mut client: Box<dyn AsyncClient>,
    signal_receiver: SignalReceiver,
    on_record: OnRecord,
    state_slot: Arc<StdMutex<ClientState>>,
    health_slot: Arc<StdMutex<Health>>,
    stats_slot: Arc<StdMutex<ClientStats>>,
) {
    *state_slot.lock().expect("state lock poisoned") = ClientState::Connecting;
    if let Err(error) = client.connect().await {
        tracing::error!(%error, "source client failed to connect");
        *state_slot.lock().expect("state lock poisoned") = client.state();
        *health_slot.lock().expect("state lock poisoned") = client.health();
        return;
    }
    *state_slot.lock().expect("state lock poisoned") = client.state();
    *health_slot.lock().expect("state lock poisoned") = client.health();

    let on_stats = OnStats::new({
        let stats_slot = stats_slot.clone();
        move |stats| {
            *stats_slot.lock().expect("stats lock poisoned") = stats;
        }
    });

    if let Err(error) = client.run(signal_receiver, on_record, on_stats).await {
        tracing::error!(%error, "source client stopped with an error");
    }
    *state_slot.lock().expect("state lock poisoned") = client.state();
    *health_slot.lock().expect("state lock poisoned") = client.health();
}

async fn dispatch_loop(source_name: String, queue: Arc<BackpressureQueue>, dlq: Arc<tokio::sync::Mutex<Dlq>>, spool: Option<Arc<tokio::sync::Mutex<Spool>>>, sink: Arc<SinkClient>, batcher_config: BatcherConfig) {
    let batcher = match Batcher::new(queue, batcher_config) {
        Ok(batcher) => batcher,
        Err(error) => {
            tracing::error!(%source_name, %error, "refusing to run dispatch loop with invalid batcher config");
            return;
        }
    };

    loop {
        let batch = batcher.next_batch().await;
        if batch.is_empty() {
            continue;
        }
        batcher.admit(batch.len()).await;

        match sink.deliver(&batch).await {
            Ok(outcome) => {
                if !outcome.permanent.is_empty() {
                    let mut dlq = dlq.lock().await;
                    for (record, reason) in outcome.permanent {
                        if let Err(error) = dlq.append(&source_name, &record, &reason).await {
                            tracing::error!(%source_name, %error, "failed to dead-letter permanently rejected record");
                        }
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%source_name, %error, "batch delivery exhausted retries, spilling to spool");
                if let Some(spool) = &spool {
                    let mut spool = spool.lock().await;
                    for record in batch.into_records() {
                        if let Err(error) = queue::spool_record(&mut spool, &record).await {
                            tracing::error!(%source_name, %error, "failed to spool undeliverable record");
                        }
                    }
                }
            }
        }
    }
}

/// Builds an `on_record` capability that offers into `queue` and, when the
/// queue diverts or evicts a record, persists it to `spool` on a detached
/// task (the capability itself must never block).
fn make_on_record(queue: Arc<BackpressureQueue>, spool: Option<Arc<tokio::sync::Mutex<Spool>>>) -> OnRecord {
    OnRecord::new(move |record| {
        let (outcome, overflow) = queue.offer(record);
        if !matches!(outcome, OfferOutcome::Spooled | OfferOutcome::DroppedOldest) {
            return;
        }
        if let (Some(record), Some(spool)) = (overflow, spool.clone()) {
            tokio::spawn(async move {
                let mut spool = spool.lock().await;
                if let Err(error) = queue::spool_record(&mut spool, &record).await {
                    tracing::error!(%error, "failed to spool overflow record");
                }
            });
        }
    })
}

async fn spool_drain_loop(source_name: String, queue: Arc<BackpressureQueue>, spool: Arc<tokio::sync::Mutex<Spool>>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        if !queue.is_below_low_watermark() {
            continue;
        }
        let spool = spool.lock().await;
        match queue::drain_oldest_segment(&spool, &queue, &source_name).await {
            Ok(Some(segment)) => {
                if let Err(error) = spool.delete_segment(&source_name, segment).await {
                    tracing::error!(%source_name, %error, "failed to delete drained spool segment");
                }
            }
            Ok(None) => {}
            Err(error) => tracing::error!(%source_name, %error, "spool drain failed"),
        }
    }
}

impl Bridge {
    /// Builds a bridge from fully-resolved configuration: constructs the
    /// shared sink client, derives the spool encryption key, and registers
    /// (but does not necessarily start) every configured source.
    pub async fn from_config(cfg: &config::Config) -> Result<Self, Error> {
        let credentials = cfg
            .resolve_sink_credentials()
            .map_err(|e| Error::InvalidSource("sink".to_string(), e.to_string()))?;

        let http = reqwest::Client::new();
        let auth = AuthManager::new(
            http.clone(),
            sink::auth::OAuth2Config {
                token_url: cfg.sink.auth.token_url.clone(),
                client_id: credentials.client_id,
                client_secret: credentials.client_secret,
                scope: cfg.sink.auth.scope.clone(),
            },
        );
        let transport: Arc<dyn IngestTransport> = Arc::new(HttpIngestTransport::new(http, cfg.sink.ingestion_endpoint.clone(), cfg.sink.target.clone()));
        let sink = Arc::new(SinkClient::new(
            transport,
            auth,
            BreakerConfig {
                trip_threshold: cfg.sink.circuit_breaker.trip_threshold,
                cooldown: Duration::from_secs(cfg.sink.circuit_breaker.cooldown_secs),
                max_cooldown: Duration::from_secs(cfg.sink.circuit_breaker.max_cooldown_secs),
            },
            cfg.sink.max_inflight_records,
            RetryConfig {
                base: Duration::from_millis(cfg.sink.retry.base_ms),
                cap: Duration::from_millis(cfg.sink.retry.cap_ms),
                max_attempts: cfg.sink.retry.max_attempts,
            },
        ));

        let passphrase = std::env::var(&cfg.spool.passphrase_env).unwrap_or_else(|_| {
            tracing::warn!(env = %cfg.spool.passphrase_env, "spool passphrase environment variable not set, using an insecure default");
            "fieldbridge-insecure-default".to_string()
        });
        let salt_path = std::path::Path::new(&cfg.spool.directory).join(".salt");
        let spool_key = SpoolKey::derive(passphrase.as_bytes(), &salt_path)?;

        let bridge = Self {
            sources: RwLock::new(HashMap::new()),
            sink,
            pipeline: cfg.pipeline.clone(),
            spool_cfg: cfg.spool.clone(),
            spool_key,
            tasks: task::TaskManager::with_process_labels(task::labels::ProcessLabels::new(&cfg.connector.name)),
        };

        for source in &cfg.sources {
            bridge.add_source(source.clone()).await?;
        }

        Ok(bridge)
    }

    fn protocol_kind_of(definition: &config::SourceDefinition) -> ProtocolKind {
        match definition {
            config::SourceDefinition::Protocol { protocol, .. } => match protocol {
                config::ProtocolKindConfig::Opcua => ProtocolKind::Opcua,
                config::ProtocolKindConfig::Mqtt => ProtocolKind::Mqtt,
                config::ProtocolKindConfig::Modbus => ProtocolKind::Modbus,
            },
            // Resolved lazily once the Thing Description is fetched; OPC-UA
            // is the most common TD-described device class in practice.
            config::SourceDefinition::ThingDescription { .. } => ProtocolKind::Opcua,
        }
    }

    fn make_queue(&self) -> Arc<BackpressureQueue> {
        let drop_policy = match self.pipeline.drop_policy {
            config::DropPolicyConfig::DropNewest => QueueDropPolicy::DropNewest,
            config::DropPolicyConfig::DropOldest => QueueDropPolicy::DropOldest,
        };
        Arc::new(BackpressureQueue::new(
            self.pipeline.queue_max_size,
            drop_policy,
            self.spool_cfg.enabled,
            self.pipeline.high_watermark,
            self.pipeline.low_watermark,
        ))
    }

    fn make_dlq(&self, source_name: &str) -> Arc<tokio::sync::Mutex<Dlq>> {
        let root = std::path::Path::new(&self.spool_cfg.directory).join("dlq").join(source_name);
        Arc::new(tokio::sync::Mutex::new(Dlq::new(root, self.spool_key.clone(), self.spool_cfg.max_segment_mb * 1024 * 1024)))
    }

    fn make_spool(&self, source_name: &str) -> Option<Arc<tokio::sync::Mutex<Spool>>> {
        if !self.spool_cfg.enabled {
            return None;
        }
        let root = std::path::Path::new(&self.spool_cfg.directory).join(source_name);
        Some(Arc::new(tokio::sync::Mutex::new(Spool::new(
            root,
            self.spool_key.clone(),
            self.spool_cfg.max_segment_mb * 1024 * 1024,
            self.spool_cfg.fsync_every_writes,
        ))))
    }

    fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            batch_size: self.pipeline.batch_size,
            flush_interval: Duration::from_millis(self.pipeline.flush_interval_ms),
            max_send_records_per_sec: self.pipeline.max_send_records_per_sec,
        }
    }

    async fn spawn_client(&self, name: &str, client: Box<dyn AsyncClient>, on_record: OnRecord, protocol_kind: ProtocolKind) -> ClientHandles {
        let (stop_tx, stop_rx) = mpsc::channel(4);
        let signal_receiver = SignalReceiver::with_receiver_timer(stop_rx, Duration::from_secs(10));

        let state = Arc::new(StdMutex::new(ClientState::Disconnected));
        let health = Arc::new(StdMutex::new(Health::Degraded { reason: "starting".into() }));
        let stats = Arc::new(StdMutex::new(ClientStats::default()));

        let task_labels = task::labels::TaskLabels::new("client", "run", name);
        let process_labels = self.tasks.process_labels();
        let drive_state = state.clone();
        let drive_health = health.clone();
        let drive_stats = stats.clone();
        let task_labels_done = task_labels.clone();

        let handle: task::JoinHandleTask = tokio::spawn(async move {
            drive_client(client, signal_receiver, on_record, drive_state, drive_health, drive_stats).await;
            task::TaskManager::no_task_cleaner(process_labels, task_labels_done)
        });

        let mut tasks = self.tasks.clone();
        tasks.register(handle, &task_labels);

        let _ = protocol_kind;
        ClientHandles { stop_tx, state, health, stats }
    }

    /// Registers a new source from its configuration. If `enabled`, starts
    /// its client, queue, and dispatch loop immediately.
    pub async fn add_source(&self, definition: config::SourceConfig) -> Result<(), Error> {
        let mut sources = self.sources.write().await;
        if sources.contains_key(&definition.name) {
            return Err(Error::DuplicateSource(definition.name.clone()));
        }

        let name = definition.name.clone();
        let protocol_kind = Self::protocol_kind_of(&definition.definition);
        let queue = self.make_queue();
        let dlq = self.make_dlq(&name);
        let spool = self.make_spool(&name);

        let mut runtime = SourceRuntime {
            definition: definition.clone(),
            protocol_kind,
            queue,
            dlq,
            spool,
            client: None,
        };

        if definition.enabled {
            self.start_runtime(&mut runtime).await?;
        }

        let _ = sources.insert(name, runtime);
        Ok(())
    }

    /// Registers and starts a source built from a Web-of-Things Thing
    /// Description.
    pub async fn add_source_from_td(&self, name: String, thing_description_url: String) -> Result<wot::ThingConfig, Error> {
        {
            let sources = self.sources.read().await;
            if sources.contains_key(&name) {
                return Err(Error::DuplicateSource(name));
            }
        }

        let queue = self.make_queue();
        let dlq = self.make_dlq(&name);
        let spool = self.make_spool(&name);

        let base_on_record = make_on_record(queue.clone(), spool.clone());

        let binding = wot::create_client_from_td(&thing_description_url, &name, base_on_record).await?;
        let thing = binding.thing.clone();
        let protocol_kind = binding.client.protocol_kind();

        let mut runtime = SourceRuntime {
            definition: config::SourceConfig {
                name: name.clone(),
                definition: config::SourceDefinition::ThingDescription { thing_description: thing_description_url },
                enabled: true,
            },
            protocol_kind,
            queue: queue.clone(),
            dlq: dlq.clone(),
            spool: spool.clone(),
            client: None,
        };

        let handles = self.spawn_client(&name, binding.client, binding.on_record, protocol_kind).await;
        runtime.client = Some(handles);
        self.spawn_dispatch(&name, &runtime);

        let mut sources = self.sources.write().await;
        let _ = sources.insert(name, runtime);
        Ok(thing)
    }

    async fn start_runtime(&self, runtime: &mut SourceRuntime) -> Result<(), Error> {
        let on_record = make_on_record(runtime.queue.clone(), runtime.spool.clone());

        let client = build::build_client(&runtime.definition.name, &runtime.definition.definition)?;
        let handles = self.spawn_client(&runtime.definition.name, client, on_record, runtime.protocol_kind).await;
        runtime.client = Some(handles);
        self.spawn_dispatch(&runtime.definition.name, runtime);
        Ok(())
    }

    fn spawn_dispatch(&self, name: &str, runtime: &SourceRuntime) {
        let name = name.to_string();
        let queue = runtime.queue.clone();
        let dlq = runtime.dlq.clone();
        let spool = runtime.spool.clone();
        let sink = self.sink.clone();
        let batcher_config = self.batcher_config();
        let process_labels = self.tasks.process_labels();

        let dispatch_labels = task::labels::TaskLabels::new("dispatch", "run", &name);
        let dispatch_labels_done = dispatch_labels.clone();
        let dispatch_process_labels = process_labels.clone();
        let drain_spool = spool.clone();
        let drain_queue = queue.clone();
        let dispatch_handle: task::JoinHandleTask = tokio::spawn({
            let name = name.clone();
            async move {
                dispatch_loop(name, queue, dlq, spool, sink, batcher_config).await;
                task::TaskManager::no_task_cleaner(dispatch_process_labels, dispatch_labels_done)
            }
        });
        let mut tasks = self.tasks.clone();
        tasks.register(dispatch_handle, &dispatch_labels);

        if let Some(spool) = drain_spool {
            let drain_labels = task::labels::TaskLabels::new("spool_drain", "run", &name);
            let drain_labels_done = drain_labels.clone();
            let drain_process_labels = process_labels;
            let drain_handle: task::JoinHandleTask = tokio::spawn({
                let name = name.clone();
                async move {
                    spool_drain_loop(name, drain_queue, spool).await;
                    task::TaskManager::no_task_cleaner(drain_process_labels, drain_labels_done)
                }
            });
            let mut tasks = self.tasks.clone();
            tasks.register(drain_handle, &drain_labels);
        }
    }

    /// Starts a registered-but-stopped source.
    pub async fn start_source(&self, name: &str) -> Result<(), Error> {
        let mut sources = self.sources.write().await;
        let runtime = sources.get_mut(name).ok_or_else(|| Error::UnknownSource(name.to_string()))?;
        if runtime.client.is_some() {
            return Ok(());
        }
        self.start_runtime(runtime).await
    }

    /// Stops a running source's client; its queue, DLQ, and dispatch loop
    /// keep draining until the queue is empty.
    pub async fn stop_source(&self, name: &str) -> Result<(), Error> {
        let mut sources = self.sources.write().await;
        let runtime = sources.get_mut(name).ok_or_else(|| Error::UnknownSource(name.to_string()))?;
        if let Some(handles) = runtime.client.take() {
            if let Err(error) = handles.stop_tx.try_send(Signal::Stop) {
                tracing::warn!(%name, %error, "failed to send stop signal to source client");
            }
        }
        Ok(())
    }

    /// Stops and deregisters a source entirely.
    pub async fn remove_source(&self, name: &str) -> Result<(), Error> {
        self.stop_source(name).await?;
        let mut sources = self.sources.write().await;
        let _ = sources.remove(name).ok_or_else(|| Error::UnknownSource(name.to_string()))?;
        Ok(())
    }

    /// Lists every registered source's status.
    pub async fn list_sources(&self) -> Vec<SourceStatus> {
        let sources = self.sources.read().await;
        let mut out = Vec::with_capacity(sources.len());
        for runtime in sources.values() {
            let mut status = runtime.status();
            status.dlq_count = runtime.dlq.lock().await.count(&runtime.definition.name).await.unwrap_or(0);
            out.push(status);
        }
        out
    }

    /// A full status snapshot for `GET /api/status`.
    pub async fn status(&self) -> BridgeStatus {
        BridgeStatus {
            sources: self.list_sources().await,
            sink_breaker_state: self.sink.breaker_snapshot().await.state.to_string(),
        }
    }

    /// Aggregate counters for `GET /api/metrics`.
    pub async fn metrics(&self) -> BridgeMetrics {
        let sources = self.sources.read().await;
        let mut metrics = BridgeMetrics::default();
        for runtime in sources.values() {
            if let Some(handles) = &runtime.client {
                let stats = *handles.stats.lock().expect("stats lock poisoned");
                metrics.records_emitted += stats.records_emitted;
                metrics.records_skipped += stats.records_skipped;
            }
            let counters = runtime.queue.counters();
            metrics.records_dropped += counters.dropped_newest + counters.dropped_oldest;
            metrics.records_spooled += counters.spooled;
            metrics.records_dead_lettered += runtime.dlq.lock().await.count(&runtime.definition.name).await.unwrap_or(0) as u64;
        }
        metrics
    }

    /// Forces an OAuth2 token fetch against the sink, for `POST
    /// /api/sink/test_auth`.
    pub async fn test_sink_auth(&self) -> Result<(), Error> {
        self.sink.test_auth().await?;
        Ok(())
    }

    /// Sends a single synthetic probe record through the sink, for `POST
    /// /api/sink/test_ingest`.
    pub async fn test_sink_ingest(&self) -> Result<sink::DeliveryOutcome, Error> {
        let probe = ProtocolRecord::new(now_us(), "bridge-self-test", "self-test", ProtocolKind::Opcua, "self_test_probe", Value::Bool(true), 0, "Good")
            .expect("synthetic probe record is always constructed with valid fields");
        Ok(self.sink.test_ingest(probe).await?)
    }

    /// Stops every running source, waiting up to `soft_timeout` for dispatch
    /// loops to drain, then abandons remaining background tasks (they are
    /// daemon tasks; the process exit tears them down).
    pub async fn shutdown(&self, soft_timeout: Duration) {
        let sources = self.sources.read().await;
        for runtime in sources.values() {
            if let Some(handles) = &runtime.client {
                if let Err(error) = handles.stop_tx.try_send(Signal::Stop) {
                    tracing::warn!(%error, "failed to send stop signal during shutdown");
                }
            }
        }
        drop(sources);

        let started = Instant::now();
        while started.elapsed() < soft_timeout {
            let sources = self.sources.read().await;
            let any_nonempty = sources.values().any(|r| r.queue.depth() > 0);
            drop(sources);
            if !any_nonempty {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::info!(elapsed = ?started.elapsed(), "bridge shutdown drain complete");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_config() -> config::Config {
        let yaml = r#"
connector:
  name: test-bridge
sources: []
spool:
  enabled: false
  directory: "/tmp/fieldbridge-test-spool"
sink:
  workspace_host: "https://ingest.example.com"
  ingestion_endpoint: "https://ingest.example.com/v1/records"
  target: "test-bridge"
  auth:
    token_url: "https://auth.example.com/token"
    client_id_env: "FIELDBRIDGE_TEST_CLIENT_ID"
    client_secret_env: "FIELDBRIDGE_TEST_CLIENT_SECRET"
"#;
        std::env::set_var("FIELDBRIDGE_TEST_CLIENT_ID", "id");
        std::env::set_var("FIELDBRIDGE_TEST_CLIENT_SECRET", "secret");
        serde_yaml::from_str(yaml).unwrap()
    }

    #[tokio::test]
    async fn empty_bridge_reports_empty_status() {
        let cfg = sample_config();
        let bridge = Bridge::from_config(&cfg).await.unwrap();
        let status = bridge.status().await;
        assert!(status.sources.is_empty());
    }

    #[tokio::test]
    async fn unknown_source_operations_error() {
        let cfg = sample_config();
        let bridge = Bridge::from_config(&cfg).await.unwrap();
        assert!(matches!(bridge.start_source("nope").await, Err(Error::UnknownSource(_))));
        assert!(matches!(bridge.stop_source("nope").await, Err(Error::UnknownSource(_))));
        assert!(matches!(bridge.remove_source("nope").await, Err(Error::UnknownSource(_))));
    }

    #[tokio::test]
    async fn duplicate_source_name_is_rejected() {
        let cfg = sample_config();
        let bridge = Bridge::from_config(&cfg).await.unwrap();
        let definition = config::SourceConfig {
            name: "crusher".into(),
            enabled: false,
            definition: config::SourceDefinition::Protocol {
                protocol: config::ProtocolKindConfig::Mqtt,
                endpoint: "mqtt://broker:1883".into(),
                opcua: None,
                mqtt: Some(config::MqttOptions {
                    host: "broker".into(),
                    port: 1883,
                    client_id: "c1".into(),
                    stable_client_id: true,
                    topics: vec![config::MqttTopicConfig { filter: "a/b".into(), qos: 0 }],
                    username: None,
                    password: None,
                }),
                modbus: None,
                security: None,
            },
        };
        bridge.add_source(definition.clone()).await.unwrap();
        assert!(matches!(bridge.add_source(definition).await, Err(Error::DuplicateSource(_))));
    }
}
