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

//! YAML configuration for the connector: `connector`, `sources`,
//! `pipeline`, `spool`, `sink`. Loaded once at startup (`ConfigError` is
//! the only class that stops the process before it ever starts running).

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Errors raised while loading or validating configuration. Fatal at
/// startup: the bridge refuses to start.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read.
    #[error("configuration file `{path}` could not be read: {message}")]
    Io {
        /// The path that was opened.
        path: String,
        /// The error message.
        message: String,
    },

    /// The config file is not valid YAML or does not match the expected
    /// shape.
    #[error("configuration file `{path}` is malformed: {message}")]
    Malformed {
        /// The path that was opened.
        path: String,
        /// The error message.
        message: String,
    },

    /// A field failed validation (range, length, required combination).
    #[error("configuration invalid: {0}")]
    Invalid(String),

    /// A referenced environment variable (sink credentials) was not set.
    #[error("environment variable `{0}` is not set")]
    MissingEnvVar(String),

    /// Two sources share the same name.
    #[error("duplicate source name: {0}")]
    DuplicateSourceName(String),
}

/// Top-level connector identity and log verbosity.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ConnectorConfig {
    /// The connector's name, used in logs and the `process_id` label.
    pub name: String,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `info` or
    /// `fieldbridge=debug,warn`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bind address for the read-only management HTTP surface.
    #[serde(default = "default_management_bind_address")]
    pub management_bind_address: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_management_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

/// Which field protocol a source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKindConfig {
    /// OPC-UA.
    Opcua,
    /// MQTT.
    Mqtt,
    /// Modbus TCP.
    Modbus,
}

/// Requested OPC-UA secure-channel security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityModeConfig {
    /// No message security.
    None,
    /// Signed, not encrypted.
    Sign,
    /// Signed and encrypted.
    SignAndEncrypt,
}

/// Certificate pair and security mode for an OPC-UA source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Requested security mode.
    pub mode: SecurityModeConfig,
    /// Path to the client's own certificate.
    pub certificate_path: Option<String>,
    /// Path to the trusted server certificate, validated before connecting.
    pub server_certificate_path: Option<String>,
}

/// A single OPC-UA node to subscribe to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpcUaNodeConfig {
    /// The NodeId string.
    pub node_id: String,
    /// Known browse path, surfaced in `metadata` if set.
    pub browse_path: Option<String>,
}

/// OPC-UA protocol-specific options.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct OpcUaOptions {
    /// Nodes to subscribe to.
    #[validate(length(min = 1))]
    pub nodes: Vec<OpcUaNodeConfig>,
    /// Subscription publishing interval, in milliseconds.
    #[serde(default = "default_publishing_interval_ms")]
    pub publishing_interval_ms: u64,
    /// Optional sampling interval; defaults to the publishing interval.
    pub sampling_interval_ms: Option<u64>,
}

fn default_publishing_interval_ms() -> u64 {
    1000
}

/// A subscribed MQTT topic filter with its QoS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttTopicConfig {
    /// The topic filter string.
    pub filter: String,
    /// Requested QoS (0, 1, or 2).
    #[serde(default)]
    pub qos: u8,
}

/// MQTT protocol-specific options.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MqttOptions {
    /// Broker host.
    pub host: String,
    /// Broker port.
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client identifier. A stable id implies `clean_session = false`.
    pub client_id: String,
    /// Whether `client_id` is stable across restarts.
    #[serde(default = "default_true")]
    pub stable_client_id: bool,
    /// Topic filters to subscribe to.
    #[validate(length(min = 1))]
    pub topics: Vec<MqttTopicConfig>,
    /// Username, if the broker requires authentication.
    pub username: Option<String>,
    /// Password, if the broker requires authentication.
    pub password: Option<String>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_true() -> bool {
    true
}

/// The Modbus register function used to read a mapped point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFunctionConfig {
    /// Read holding registers (function code 3).
    Holding,
    /// Read input registers (function code 4).
    Input,
    /// Read coils (function code 1).
    Coil,
}

/// A single polled Modbus register.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusRegisterConfig {
    /// Modbus unit (slave) id.
    pub unit_id: u8,
    /// Register function.
    pub function: RegisterFunctionConfig,
    /// Starting register address.
    pub address: u16,
    /// Number of registers to read (ignored for coils).
    #[serde(default = "default_register_length")]
    pub length: u16,
    /// Raw-to-scaled conversion factor.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

fn default_register_length() -> u16 {
    1
}

fn default_scale() -> f64 {
    1.0
}

/// Modbus TCP protocol-specific options.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ModbusOptions {
    /// Slave host.
    pub host: String,
    /// Slave port, typically 502.
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    /// Registers to poll.
    #[validate(length(min = 1))]
    pub registers: Vec<ModbusRegisterConfig>,
    /// Scan cycle period, in milliseconds (50-500 typical).
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_scan_interval_ms() -> u64 {
    200
}

/// How a source is defined: either an explicit protocol configuration, or
/// a Thing Description URL the WoT binding layer resolves at source-add
/// time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceDefinition {
    /// Built from a Thing Description fetched at add-time.
    ThingDescription {
        /// The Thing Description URL.
        thing_description: String,
    },
    /// Built from an explicit protocol configuration.
    Protocol {
        /// Which protocol this source speaks.
        protocol: ProtocolKindConfig,
        /// Resolved connection string/endpoint.
        endpoint: String,
        /// OPC-UA options, required when `protocol == opcua`.
        opcua: Option<OpcUaOptions>,
        /// MQTT options, required when `protocol == mqtt`.
        mqtt: Option<MqttOptions>,
        /// Modbus options, required when `protocol == modbus`.
        modbus: Option<ModbusOptions>,
        /// OPC-UA security configuration, ignored for other protocols.
        security: Option<SecurityConfig>,
    },
}

/// A single configured field-data source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name; invariant enforced across the whole `sources` list.
    pub name: String,
    /// How this source is defined.
    #[serde(flatten)]
    pub definition: SourceDefinition,
    /// Whether the source starts enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl SourceConfig {
    /// Validates protocol-specific option presence: a `Protocol` source
    /// must carry the options struct matching its declared `protocol`.
    pub fn validate_shape(&self) -> Result<(), Error> {
        if let SourceDefinition::Protocol {
            protocol,
            opcua,
            mqtt,
            modbus,
            ..
        } = &self.definition
        {
            let present = match protocol {
                ProtocolKindConfig::Opcua => opcua.is_some(),
                ProtocolKindConfig::Mqtt => mqtt.is_some(),
                ProtocolKindConfig::Modbus => modbus.is_some(),
            };
            if !present {
                return Err(Error::Invalid(format!(
                    "source `{}` declares protocol `{:?}` but is missing its options block",
                    self.name, protocol
                )));
            }
        }
        Ok(())
    }
}

/// Drop policy applied when the in-memory queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropPolicyConfig {
    /// Refuse the new record.
    DropNewest,
    /// Evict the oldest queued record.
    DropOldest,
}

/// Queue, batching, and rate-limit parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    /// In-memory queue capacity.
    #[serde(default = "default_queue_max_size")]
    #[validate(range(min = 1))]
    pub queue_max_size: usize,
    /// Policy applied when the queue is at capacity and cannot spool.
    #[serde(default = "default_drop_policy")]
    pub drop_policy: DropPolicyConfig,
    /// Maximum records per emitted batch.
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// Maximum age, in milliseconds, before a partial batch is flushed.
    #[serde(default = "default_flush_interval_ms")]
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,
    /// Records-per-second ceiling enforced toward the sink.
    #[serde(default = "default_max_send_records_per_sec")]
    #[validate(range(min = 1))]
    pub max_send_records_per_sec: u32,
    /// Fraction of capacity at which overflow diverts to the spool.
    #[serde(default = "default_high_watermark")]
    pub high_watermark: f64,
    /// Fraction of capacity below which the spool drainer resumes.
    #[serde(default = "default_low_watermark")]
    pub low_watermark: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_max_size: default_queue_max_size(),
            drop_policy: default_drop_policy(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_send_records_per_sec: default_max_send_records_per_sec(),
            high_watermark: default_high_watermark(),
            low_watermark: default_low_watermark(),
        }
    }
}

fn default_queue_max_size() -> usize {
    10_000
}
fn default_drop_policy() -> DropPolicyConfig {
    DropPolicyConfig::DropNewest
}
fn default_batch_size() -> usize {
    50
}
fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_max_send_records_per_sec() -> u32 {
    500
}
fn default_high_watermark() -> f64 {
    0.9
}
fn default_low_watermark() -> f64 {
    0.5
}

/// On-disk spool parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SpoolConfig {
    /// Whether spool overflow is enabled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Root directory for per-source spool segments.
    #[serde(default = "default_spool_directory")]
    pub directory: String,
    /// Segment rotation size.
    #[serde(default = "default_max_segment_mb")]
    #[validate(range(min = 1))]
    pub max_segment_mb: u64,
    /// Soft cap on total spool size across all sources, informational.
    pub max_total_mb: Option<u64>,
    /// Whether segments are encrypted at rest.
    #[serde(default = "default_true")]
    pub encryption_enabled: bool,
    /// How many writes to batch before an fsync.
    #[serde(default = "default_fsync_every_writes")]
    pub fsync_every_writes: u32,
    /// Passphrase environment variable used to derive the spool encryption
    /// key, when `encryption_enabled`.
    #[serde(default = "default_passphrase_env")]
    pub passphrase_env: String,
}

fn default_spool_directory() -> String {
    "state/spool".to_string()
}
fn default_max_segment_mb() -> u64 {
    100
}
fn default_fsync_every_writes() -> u32 {
    32
}
fn default_passphrase_env() -> String {
    "FIELDBRIDGE_SPOOL_PASSPHRASE".to_string()
}

/// Sink authentication configuration: environment-variable indirection for
/// credentials, resolved once at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkAuthConfig {
    /// OAuth2 token endpoint.
    pub token_url: String,
    /// Environment variable holding the client id.
    pub client_id_env: String,
    /// Environment variable holding the client secret.
    pub client_secret_env: String,
    /// Optional OAuth2 scope.
    pub scope: Option<String>,
}

/// Retry parameters for transient sink failures.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetryConfigYaml {
    /// Base backoff delay, in milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub base_ms: u64,
    /// Cap on the backoff delay, in milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub cap_ms: u64,
    /// Maximum attempts before giving up on a batch.
    #[serde(default = "default_retry_max_attempts")]
    #[validate(range(min = 1))]
    pub max_attempts: u32,
}

impl Default for RetryConfigYaml {
    fn default() -> Self {
        Self {
            base_ms: default_retry_base_ms(),
            cap_ms: default_retry_cap_ms(),
            max_attempts: default_retry_max_attempts(),
        }
    }
}

fn default_retry_base_ms() -> u64 {
    500
}
fn default_retry_cap_ms() -> u64 {
    30_000
}
fn default_retry_max_attempts() -> u32 {
    5
}

/// Circuit-breaker parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BreakerConfigYaml {
    /// Consecutive failures before tripping open.
    #[serde(default = "default_trip_threshold")]
    #[validate(range(min = 1))]
    pub trip_threshold: u32,
    /// Cool-down duration, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Cap on the cool-down after repeated trips, in seconds.
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfigYaml {
    fn default() -> Self {
        Self {
            trip_threshold: default_trip_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

fn default_trip_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_max_cooldown_secs() -> u64 {
    300
}

/// Cloud ingestion sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SinkConfig {
    /// The workspace/tenant host.
    pub workspace_host: String,
    /// The streaming ingestion endpoint.
    pub ingestion_endpoint: String,
    /// OAuth2 client-credentials configuration.
    pub auth: SinkAuthConfig,
    /// Workspace target identifier the ingested records are attributed to.
    pub target: String,
    /// In-flight record ceiling; the batcher blocks once saturated.
    #[serde(default = "default_max_inflight")]
    #[validate(range(min = 1))]
    pub max_inflight_records: usize,
    /// Retry parameters.
    #[serde(default)]
    pub retry: RetryConfigYaml,
    /// Circuit-breaker parameters.
    #[serde(default)]
    pub circuit_breaker: BreakerConfigYaml,
}

fn default_max_inflight() -> usize {
    1000
}

/// The fully parsed, validated configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Connector identity and log level.
    pub connector: ConnectorConfig,
    /// Configured field-data sources.
    pub sources: Vec<SourceConfig>,
    /// Queue/batch/rate-limit parameters.
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// On-disk spool parameters.
    pub spool: SpoolConfig,
    /// Cloud ingestion sink parameters.
    pub sink: SinkConfig,
}

/// Resolved sink credentials, read from the environment at load time.
#[derive(Clone)]
pub struct ResolvedSinkCredentials {
    /// The OAuth2 client id.
    pub client_id: String,
    /// The OAuth2 client secret.
    pub client_secret: String,
}

impl Config {
    /// Loads, parses, and validates configuration from `path`. Returns
    /// only a `ConfigError`-class failure; no other error variant is
    /// expected from this entry point.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path_display = path.as_ref().display().to_string();

        let raw = fs::read_to_string(&path).map_err(|e| Error::Io {
            path: path_display.clone(),
            message: e.to_string(),
        })?;

        let config: Config = serde_yaml::from_str(&raw).map_err(|e| Error::Malformed {
            path: path_display.clone(),
            message: e.to_string(),
        })?;

        config.validate_all()?;
        Ok(config)
    }

    fn validate_all(&self) -> Result<(), Error> {
        self.pipeline.validate().map_err(|e| Error::Invalid(e.to_string()))?;
        self.spool.validate().map_err(|e| Error::Invalid(e.to_string()))?;
        self.sink.validate().map_err(|e| Error::Invalid(e.to_string()))?;
        self.sink.retry.validate().map_err(|e| Error::Invalid(e.to_string()))?;
        self.sink.circuit_breaker.validate().map_err(|e| Error::Invalid(e.to_string()))?;

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(source.name.clone()) {
                return Err(Error::DuplicateSourceName(source.name.clone()));
            }
            source.validate_shape()?;
            if let SourceDefinition::Protocol { opcua: Some(opts), .. } = &source.definition {
                opts.validate().map_err(|e| Error::Invalid(e.to_string()))?;
            }
            if let SourceDefinition::Protocol { mqtt: Some(opts), .. } = &source.definition {
                opts.validate().map_err(|e| Error::Invalid(e.to_string()))?;
            }
            if let SourceDefinition::Protocol { modbus: Some(opts), .. } = &source.definition {
                opts.validate().map_err(|e| Error::Invalid(e.to_string()))?;
            }
        }

        Ok(())
    }

    /// Resolves the sink's OAuth2 credentials from the environment
    /// variables named in `sink.auth`.
    pub fn resolve_sink_credentials(&self) -> Result<ResolvedSinkCredentials, Error> {
        let client_id = std::env::var(&self.sink.auth.client_id_env).map_err(|_| Error::MissingEnvVar(self.sink.auth.client_id_env.clone()))?;
        let client_secret = std::env::var(&self.sink.auth.client_secret_env).map_err(|_| Error::MissingEnvVar(self.sink.auth.client_secret_env.clone()))?;
        Ok(ResolvedSinkCredentials { client_id, client_secret })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
connector:
  name: plant-dmz-1
sources:
  - name: crusher-opcua
    protocol: opcua
    endpoint: "opc.tcp://plc-1:4840"
    opcua:
      nodes:
        - node_id: "ns=2;s=Motor.Power"
spool:
  directory: "state/spool"
sink:
  workspace_host: "https://ingest.example.com"
  ingestion_endpoint: "https://ingest.example.com/v1/records"
  target: "plant-dmz-1"
  auth:
    token_url: "https://auth.example.com/token"
    client_id_env: "SINK_CLIENT_ID"
    client_secret_env: "SINK_CLIENT_SECRET"
"#
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, minimal_yaml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.pipeline.batch_size, 50);
        assert_eq!(config.pipeline.drop_policy, DropPolicyConfig::DropNewest);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sink.max_inflight_records, 1000);
    }

    #[test]
    fn rejects_duplicate_source_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = format!(
            "{}\n  - name: crusher-opcua\n    protocol: mqtt\n    endpoint: \"mqtt://broker:1883\"\n    mqtt:\n      host: broker\n      client_id: c1\n      topics:\n        - filter: \"a/b\"\n",
            minimal_yaml().trim_end()
        );
        fs::write(&path, yaml).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::DuplicateSourceName(_)));
    }

    #[test]
    fn rejects_protocol_source_missing_its_options_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let yaml = minimal_yaml().replace("protocol: opcua", "protocol: mqtt");
        fs::write(&path, yaml).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn missing_env_var_surfaces_as_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, minimal_yaml()).unwrap();
        let config = Config::load(&path).unwrap();

        std::env::remove_var("SINK_CLIENT_ID_DOES_NOT_EXIST_12345");
        let mut auth = config.sink.auth.clone();
        auth.client_id_env = "SINK_CLIENT_ID_DOES_NOT_EXIST_12345".to_string();
        let mut config = config;
        config.sink.auth = auth;

        let err = config.resolve_sink_credentials().unwrap_err();
        assert!(matches!(err, Error::MissingEnvVar(_)));
    }

    #[test]
    fn thing_description_source_parses_without_protocol_fields() {
        let yaml = r#"
connector:
  name: plant-dmz-1
sources:
  - name: crusher-wot
    thing_description: "https://wot.example.com/crusher.td.json"
spool:
  directory: "state/spool"
sink:
  workspace_host: "https://ingest.example.com"
  ingestion_endpoint: "https://ingest.example.com/v1/records"
  target: "plant-dmz-1"
  auth:
    token_url: "https://auth.example.com/token"
    client_id_env: "SINK_CLIENT_ID"
    client_secret_env: "SINK_CLIENT_SECRET"
"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, yaml).unwrap();

        let config = Config::load(&path).unwrap();
        assert!(matches!(config.sources[0].definition, SourceDefinition::ThingDescription { .. }));
    }
}
