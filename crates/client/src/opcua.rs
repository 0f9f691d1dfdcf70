//! OPC-UA protocol client.
//!
//! Opens a secure channel using the configured certificate pair, subscribes
//! to a configured node set, and emits one record per monitored-item
//! notification.

use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use opcua::client::prelude::*;
use record::{ProtocolKind, ProtocolRecord, Value};
use tokio::sync::mpsc;

use crate::{
    backoff::Backoff,
    control::{Signal, SignalReceiver},
    AsyncClient, ClientState, ClientStats, Error, Health, OnRecord, OnStats,
};

/// Security mode requested for the secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    /// No message security.
    None,
    /// Messages are signed but not encrypted.
    Sign,
    /// Messages are signed and encrypted.
    SignAndEncrypt,
}

/// A single monitored OPC-UA node.
#[derive(Debug, Clone)]
pub struct NodeMapping {
    /// The NodeId string, e.g. `ns=2;s=Motor.Power`.
    pub node_id: String,
    /// Known browse path, if any, surfaced in `metadata`.
    pub browse_path: Option<String>,
}

/// Configuration for an OPC-UA client instance.
#[derive(Debug, Clone)]
pub struct OpcUaConfig {
    /// The source name this client serves.
    pub source_name: String,
    /// `opc.tcp://host:port/path` endpoint URL.
    pub endpoint_url: String,
    /// Requested security mode.
    pub security_mode: SecurityMode,
    /// Path to the client's certificate file, used when security is enabled.
    pub certificate_path: Option<PathBuf>,
    /// Path to the trusted server certificate, validated before connecting.
    pub server_certificate_path: Option<PathBuf>,
    /// Nodes to subscribe to.
    pub nodes: Vec<NodeMapping>,
    /// Subscription publishing interval.
    pub publishing_interval: Duration,
    /// Optional sampling interval, defaults to the publishing interval.
    pub sampling_interval: Option<Duration>,
}

/// Validates a server certificate per the connector's certificate policy:
/// exists, parses as DER/PEM, not expired or not-yet-valid, and does not use
/// a SHA-1 or MD5 signature algorithm.
pub fn validate_server_certificate(path: &std::path::Path) -> Result<(), Error> {
    let der = std::fs::read(path).map_err(|e| Error::Certificate {
        source_name: String::new(),
        message: format!("certificate not readable at {}: {e}", path.display()),
    })?;

    let der = match x509_parser::pem::parse_x509_pem(&der) {
        Ok((_, pem)) => pem.contents,
        Err(_) => der,
    };

    let (_, cert) = x509_parser::parse_x509_certificate(&der).map_err(|e| Error::Certificate {
        source_name: String::new(),
        message: format!("unparseable certificate: {e}"),
    })?;

    let now = x509_parser::time::ASN1Time::from(SystemTime::now());
    if !cert.validity().is_valid_at(now) {
        return Err(Error::Certificate {
            source_name: String::new(),
            message: "certificate expired or not yet valid".into(),
        });
    }

    let sig_algo = cert.signature_algorithm.algorithm.to_string();
    let weak = sig_algo.contains("1.2.840.113549.1.1.5") // sha1WithRSAEncryption
        || sig_algo.contains("1.2.840.113549.1.1.4"); // md5WithRSAEncryption
    if weak {
        return Err(Error::Certificate {
            source_name: String::new(),
            message: "weak signature algorithm".into(),
        });
    }

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|a| a.as_str().ok())
        .unwrap_or("<unknown>")
        .to_string();
    tracing::info!(%cn, "validated server certificate");

    Ok(())
}

fn message_security_mode(mode: SecurityMode) -> MessageSecurityMode {
    match mode {
        SecurityMode::None => MessageSecurityMode::None,
        SecurityMode::Sign => MessageSecurityMode::Sign,
        SecurityMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
    }
}

/// The OPC-UA protocol client.
pub struct OpcUaClient {
    config: OpcUaConfig,
    state: ClientState,
    health: Health,
    stats: ClientStats,
    records_emitted: Arc<AtomicU64>,
}

impl OpcUaClient {
    /// Creates a new, unconnected OPC-UA client.
    pub fn new(config: OpcUaConfig) -> Self {
        Self {
            config,
            state: ClientState::Disconnected,
            health: Health::Degraded {
                reason: "not yet connected".into(),
            },
            stats: ClientStats::default(),
            records_emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    fn build_client(&self) -> Result<Client, Error> {
        let mut builder = ClientBuilder::new()
            .application_name("fieldbridge")
            .application_uri("urn:fieldbridge:connector")
            .pki_dir("./pki");

        if self.config.security_mode != SecurityMode::None {
            if let Some(server_cert) = &self.config.server_certificate_path {
                validate_server_certificate(server_cert).map_err(|e| match e {
                    Error::Certificate { message, .. } => Error::Certificate {
                        source_name: self.config.source_name.clone(),
                        message,
                    },
                    other => other,
                })?;
            }
            builder = builder.trust_server_certs(false).session_retry_limit(5);
        }

        builder.client().ok_or_else(|| Error::Config {
            source_name: self.config.source_name.clone(),
            message: "failed to build OPC-UA client".into(),
        })
    }

    /// Connects to the endpoint, creates a subscription over the configured
    /// nodes, and registers a data-change callback that forwards every
    /// monitored-item notification into `notification_tx`. Runs the
    /// session's synchronous event loop until the session drops; must be
    /// called from `spawn_blocking`, never from an async context directly.
    fn connect_and_subscribe(&self, notification_tx: mpsc::UnboundedSender<(String, Option<String>, Variant, StatusCode)>) -> Result<(), Error> {
        let mut client = self.build_client()?;

        let endpoint: EndpointDescription = (
            self.config.endpoint_url.as_ref(),
            SecurityPolicy::None.to_str(),
            message_security_mode(self.config.security_mode),
            UserTokenPolicy::anonymous(),
        )
            .into();

        let session = client.connect_to_endpoint(endpoint, IdentityToken::Anonymous).map_err(|status| Error::Transport {
            source_name: self.config.source_name.clone(),
            message: format!("connect_to_endpoint failed: {status}"),
        })?;

        let publishing_interval = self.config.publishing_interval.as_secs_f64().max(0.1);
        let subscription_id = session
            .write()
            .create_subscription(publishing_interval, 10, 30, 0, 0, true, DataChangeCallback::new({
                let nodes = self.config.nodes.clone();
                move |items| {
                    for item in items {
                        let node_index = item.item_to_monitor().node_id.clone();
                        let browse_path = nodes
                            .iter()
                            .find(|n| n.node_id == node_index.to_string())
                            .and_then(|n| n.browse_path.clone());
                        if let Some(value) = item.last_value().value.clone() {
                            let status = item.last_value().status.unwrap_or(StatusCode::Good);
                            if notification_tx.send((node_index.to_string(), browse_path, value, status)).is_err() {
                                return;
                            }
                        }
                    }
                }
            }))
            .map_err(|status| Error::Transport {
                source_name: self.config.source_name.clone(),
                message: format!("create_subscription failed: {status}"),
            })?;

        let items_to_create: Vec<MonitoredItemCreateRequest> = self
            .config
            .nodes
            .iter()
            .map(|n| NodeId::from_str(&n.node_id).map(MonitoredItemCreateRequest::from))
            .collect::<Result<_, _>>()
            .map_err(|_| Error::Config {
                source_name: self.config.source_name.clone(),
                message: "one or more configured node ids are not well-formed".into(),
            })?;

        session
            .write()
            .create_monitored_items(subscription_id, TimestampsToReturn::Both, &items_to_create)
            .map_err(|status| Error::Transport {
                source_name: self.config.source_name.clone(),
                message: format!("create_monitored_items failed: {status}"),
            })?;

        Session::run(session);
        Ok(())
    }
}

#[async_trait]
impl AsyncClient for OpcUaClient {
    async fn connect(&mut self) -> Result<(), Error> {
        self.state = ClientState::Connecting;
        let _client = self.build_client()?;

        // Session establishment against the endpoint is performed via
        // spawn_blocking by `run`, since the opcua client's session API is
        // synchronous; `connect` here only validates configuration and
        // certificates up front so config errors surface before the
        // client is ever registered as running.
        self.state = ClientState::Connected;
        self.health = Health::Healthy;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        self.state = ClientState::Stopped;
        Ok(())
    }

    async fn run(
        &mut self,
        mut signal_receiver: SignalReceiver,
        on_record: OnRecord,
        on_stats: OnStats,
    ) -> Result<(), Error> {
        self.state = ClientState::Running;
        let mut backoff = Backoff::default();

        let source_name = self.config.source_name.clone();
        let endpoint = self.config.endpoint_url.clone();
        let records_emitted = self.records_emitted.clone();

        // Each connection attempt owns a fresh channel; the blocking session
        // task is the sole sender, so the channel closing (`recv` returns
        // `None`) is exactly the signal that the session ended and a
        // reconnect is due.
        let spawn_session = |config: OpcUaConfig| {
            let (tx, rx) = mpsc::unbounded_channel::<(String, Option<String>, Variant, StatusCode)>();
            let handle = tokio::task::spawn_blocking(move || {
                let session_client = OpcUaClient {
                    config,
                    state: ClientState::Connected,
                    health: Health::Healthy,
                    stats: ClientStats::default(),
                    records_emitted: Arc::new(AtomicU64::new(0)),
                };
                session_client.connect_and_subscribe(tx)
            });
            (handle, rx)
        };

        let (mut session_task, mut notification_rx) = spawn_session(self.config.clone());

        loop {
            tokio::select! {
                biased;

                signal = signal_receiver.recv() => {
                    match signal {
                        Signal::Stop => {
                            session_task.abort();
                            self.state = ClientState::Stopped;
                            return Ok(());
                        }
                        Signal::TimerTick { .. } => {
                            on_stats.call(self.stats);
                        }
                    }
                }

                notification = notification_rx.recv() => {
                    match notification {
                        Some((node_id, browse_path, variant, status)) => {
                            let value = variant_to_value(&variant);
                            let now_us = SystemTime::now()
                                .duration_since(UNIX_EPOCH)
                                .map(|d| d.as_micros() as i64)
                                .unwrap_or(0);

                            let mut record = match ProtocolRecord::new(
                                now_us,
                                source_name.clone(),
                                endpoint.clone(),
                                ProtocolKind::Opcua,
                                node_id.clone(),
                                value,
                                status.bits() as i32,
                                status_label(status),
                            ) {
                                Ok(record) => record,
                                Err(_) => {
                                    self.stats.records_skipped += 1;
                                    continue;
                                }
                            };

                            if let Some(path) = browse_path {
                                let _ = record.metadata.insert("browse_path".into(), path);
                            }

                            on_record.call(record);
                            self.stats.records_emitted = records_emitted.fetch_add(1, Ordering::Relaxed) + 1;
                        }
                        None => {
                            // The blocking session task's sender dropped: the
                            // session ended, either because the connection
                            // failed or because the server closed it.
                            let outcome = session_task.await;
                            self.state = ClientState::Reconnecting;
                            self.stats.reconnects += 1;

                            if let Ok(Err(error)) = &outcome {
                                if error.is_fatal() {
                                    self.state = ClientState::Failed;
                                    self.health = Health::Failed { reason: error.to_string() };
                                    return Err(Error::Transport {
                                        source_name: source_name.clone(),
                                        message: error.to_string(),
                                    });
                                }
                            }

                            let delay = backoff.next_delay();
                            tracing::warn!(%source_name, attempt = backoff.attempt(), ?delay, "opc-ua session lost, reconnecting");
                            tokio::time::sleep(delay).await;

                            match self.build_client() {
                                Ok(_client) => {
                                    backoff.reset();
                                    self.health = Health::Healthy;
                                    self.state = ClientState::Running;
                                }
                                Err(error) if error.is_fatal() => {
                                    self.state = ClientState::Failed;
                                    self.health = Health::Failed { reason: error.to_string() };
                                    return Err(error);
                                }
                                Err(_) => {
                                    self.health = Health::Degraded { reason: "reconnecting".into() };
                                }
                            }

                            // Always rearm a fresh session and channel for
                            // the next iteration, whether or not this
                            // validation attempt succeeded: the only way out
                            // of a bad endpoint is another round through
                            // `connect_and_subscribe`'s own connection error.
                            let (next_task, next_rx) = spawn_session(self.config.clone());
                            session_task = next_task;
                            notification_rx = next_rx;
                        }
                    }
                }
            }
        }
    }

    fn stats(&self) -> ClientStats {
        self.stats
    }

    fn health(&self) -> Health {
        self.health.clone()
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn protocol_kind(&self) -> ProtocolKind {
        ProtocolKind::Opcua
    }
}

fn variant_to_value(variant: &Variant) -> Value {
    match variant {
        Variant::Boolean(b) => Value::Bool(*b),
        Variant::SByte(v) => Value::Int64(*v as i64),
        Variant::Byte(v) => Value::Int64(*v as i64),
        Variant::Int16(v) => Value::Int64(*v as i64),
        Variant::UInt16(v) => Value::Int64(*v as i64),
        Variant::Int32(v) => Value::Int64(*v as i64),
        Variant::UInt32(v) => Value::Int64(*v as i64),
        Variant::Int64(v) => Value::Int64(*v),
        Variant::UInt64(v) => Value::Int64(*v as i64),
        Variant::Float(v) => Value::Float64(*v as f64),
        Variant::Double(v) => Value::Float64(*v),
        Variant::String(s) => Value::String(s.value.clone().unwrap_or_default()),
        other => Value::String(format!("{other:?}")),
    }
}

fn status_label(status: StatusCode) -> &'static str {
    if status.is_good() {
        "Good"
    } else if status.is_uncertain() {
        "Uncertain"
    } else {
        "Bad"
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn variant_to_value_maps_numeric_kinds() {
        assert!(matches!(variant_to_value(&Variant::Boolean(true)), Value::Bool(true)));
        assert!(matches!(variant_to_value(&Variant::Int32(42)), Value::Int64(42)));
        assert!(matches!(variant_to_value(&Variant::Double(1.5)), Value::Float64(v) if v == 1.5));
    }

    #[test]
    fn variant_to_value_falls_back_to_string_for_unmapped_kinds() {
        assert!(matches!(variant_to_value(&Variant::Empty), Value::String(_)));
    }

    #[test]
    fn status_label_matches_quality_bucket() {
        assert_eq!(status_label(StatusCode::Good), "Good");
        assert_eq!(status_label(StatusCode::Bad), "Bad");
    }

    #[test]
    fn unparseable_certificate_bytes_are_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not a certificate").unwrap();
        assert!(matches!(validate_server_certificate(tmp.path()), Err(Error::Certificate { .. })));
    }

    /// Self-signed, `sha1WithRSAEncryption`-signed certificate for
    /// `CN=weak-test-server` (`openssl req -x509 -sha1 -newkey rsa:1024`),
    /// valid for 100 years so the fixture never expires.
    const WEAK_SIGNATURE_CERT_PEM: &str = "-----BEGIN CERTIFICATE-----\n\
MIICFDCCAX2gAwIBAgIUR+uKzAjsc0rs3wz8QbinZpreYsgwDQYJKoZIhvcNAQEF\n\
BQAwGzEZMBcGA1UEAwwQd2Vhay10ZXN0LXNlcnZlcjAgFw0yNjA3MzAyMTI5MjBa\n\
GA8yMTI2MDcwNjIxMjkyMFowGzEZMBcGA1UEAwwQd2Vhay10ZXN0LXNlcnZlcjCB\n\
nzANBgkqhkiG9w0BAQEFAAOBjQAwgYkCgYEAug5ybaOpY+umqT1EKBA1GvvAbsKF\n\
jdUh//8Q262d8dzL6nM50qNlBWNLRD0o2j3ASAaVUqUwRxNEfkV1ATjPHbmp1pna\n\
rfU9SyIhAWJ1REhadcuGoIAUjjYhubEK0HoTR8g3Y+CUtN1OufZrRtbkNy0yhiAs\n\
W5kFWmXB2gvUvd0CAwEAAaNTMFEwHQYDVR0OBBYEFNogC4fHsAQrn66YGumDWd77\n\
gE5/MB8GA1UdIwQYMBaAFNogC4fHsAQrn66YGumDWd77gE5/MA8GA1UdEwEB/wQF\n\
MAMBAf8wDQYJKoZIhvcNAQEFBQADgYEAor+nfQcdqCNAfSfL1gzad1Mht7tGpHx9\n\
mDXAA4e+arj6l07fhHlaqE9dka96VSSrdsHxAY8MNBCobTmBKEcbs2hQY+fD6RcD\n\
SpcyI0Ihi3hfxL6twPH1u5TgGdvVOeQrm8ueSueftnuHqc+Jl4xVRtQKeFtmFndZ\n\
oG2VXtNeU68=\n\
-----END CERTIFICATE-----\n";

    #[test]
    fn weak_signature_algorithm_is_rejected() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), WEAK_SIGNATURE_CERT_PEM).unwrap();
        let err = validate_server_certificate(tmp.path()).unwrap_err();
        assert!(matches!(&err, Error::Certificate { message, .. } if message.contains("weak signature algorithm")));
    }

    #[test]
    fn missing_certificate_file_is_rejected() {
        let err = validate_server_certificate(std::path::Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert!(matches!(err, Error::Certificate { .. }));
    }
}
