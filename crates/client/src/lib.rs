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

//! Definition of the `AsyncClient` trait shared by all protocol clients
//! (OPC-UA, MQTT, Modbus TCP).

pub mod backoff;
pub mod control;
pub mod modbus;
pub mod mqtt;
pub mod opcua;

use std::sync::Arc;

use async_trait::async_trait;
use record::{ProtocolKind, ProtocolRecord};

use crate::control::{Signal, SignalReceiver};

/// All the errors that can occur within a protocol client, following the
/// taxonomy named by the error handling design (ConfigError, AuthError,
/// TransportError, ProtocolError, CertificateError).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The client configuration is invalid or incomplete.
    #[error("invalid configuration (source: {source_name}, reason: {message})")]
    Config {
        /// The source this client belongs to.
        source_name: String,
        /// The error message.
        message: String,
    },

    /// Authentication against the field endpoint failed.
    #[error("authentication failed (source: {source_name}, reason: {message})")]
    Auth {
        /// The source this client belongs to.
        source_name: String,
        /// The error message.
        message: String,
    },

    /// A transient I/O error occurred toward the field endpoint.
    #[error("transport error (source: {source_name}, reason: {message})")]
    Transport {
        /// The source this client belongs to.
        source_name: String,
        /// The error message.
        message: String,
    },

    /// A malformed or unexpected message was received from the field device.
    #[error("protocol error (source: {source_name}, reason: {message})")]
    Protocol {
        /// The source this client belongs to.
        source_name: String,
        /// The error message.
        message: String,
    },

    /// A server certificate was missing, expired, weak, or unparseable.
    #[error("certificate error (source: {source_name}, reason: {message})")]
    Certificate {
        /// The source this client belongs to.
        source_name: String,
        /// The error message.
        message: String,
    },
}

impl Error {
    /// Whether this error class should trigger the client's reconnect loop
    /// rather than a permanent `failed` transition.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport { .. } | Error::Protocol { .. })
    }

    /// Whether this error class is a permanent configuration-class failure
    /// that should stop the client (`health() == failed`).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::Auth { .. } | Error::Certificate { .. })
    }

    /// Coarse category, used for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::Auth { .. } => "auth",
            Error::Transport { .. } => "transport",
            Error::Protocol { .. } => "protocol",
            Error::Certificate { .. } => "certificate",
        }
    }
}

/// The client state machine. States: `disconnected -> connecting ->
/// connected -> running (<-> reconnecting) -> {running | failed}`, with
/// `stopped` reachable from any state on an explicit stop signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not yet connected; the initial state.
    Disconnected,
    /// A connection attempt is in progress.
    Connecting,
    /// Connected, subscription/polling not yet established.
    Connected,
    /// Running its subscription or polling loop.
    Running,
    /// Lost connection while running; attempting to reconnect.
    Reconnecting,
    /// Permanently stopped after exceeding the retry budget for a
    /// configured permanent-error class. Requires operator action.
    Failed,
    /// Stopped in an orderly fashion in response to a stop signal.
    Stopped,
}

impl ClientState {
    /// Whether this state is terminal (no further automatic transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClientState::Failed | ClientState::Stopped)
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Running => "running",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Failed => "failed",
            ClientState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Health as surfaced to the bridge's status endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    /// The client is connected and making progress.
    Healthy,
    /// The client is reconnecting but not yet considered failed.
    Degraded {
        /// Human-readable reason.
        reason: String,
    },
    /// The client has permanently failed and requires operator action.
    Failed {
        /// Human-readable reason.
        reason: String,
    },
}

/// Periodic counters reported by a client via `on_stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    /// Total records emitted since the client started.
    pub records_emitted: u64,
    /// Total records skipped due to malformed data.
    pub records_skipped: u64,
    /// Total reconnect attempts.
    pub reconnects: u64,
    /// Total transient errors encountered.
    pub transient_errors: u64,
}

/// A small capability passed by value into each client: a non-blocking
/// record offer. The WoT binding layer wraps this same capability rather
/// than introducing a global dispatcher.
#[derive(Clone)]
pub struct OnRecord {
    offer: Arc<dyn Fn(ProtocolRecord) + Send + Sync>,
}

impl OnRecord {
    /// Creates a new `OnRecord` from an offer closure. The closure must
    /// never block; it is expected to forward to a bounded queue's
    /// non-blocking `offer`.
    pub fn new(offer: impl Fn(ProtocolRecord) + Send + Sync + 'static) -> Self {
        Self { offer: Arc::new(offer) }
    }

    /// Delivers a record. Never blocks, never fails from the client's
    /// perspective; downstream accounting (accepted/dropped) happens
    /// inside the queue.
    pub fn call(&self, record: ProtocolRecord) {
        (self.offer)(record)
    }
}

/// A small capability passed by value into each client: periodic stats
/// reporting.
#[derive(Clone)]
pub struct OnStats {
    report: Arc<dyn Fn(ClientStats) + Send + Sync>,
}

impl OnStats {
    /// Creates a new `OnStats` from a reporting closure.
    pub fn new(report: impl Fn(ClientStats) + Send + Sync + 'static) -> Self {
        Self { report: Arc::new(report) }
    }

    /// Reports a stats snapshot.
    pub fn call(&self, stats: ClientStats) {
        (self.report)(stats)
    }
}

/// A protocol client: owns its own transport, subscription/polling loop,
/// and reconnect policy. Implemented once per protocol (OPC-UA, MQTT,
/// Modbus TCP).
#[async_trait]
pub trait AsyncClient: Send {
    /// Opens the underlying transport connection.
    async fn connect(&mut self) -> Result<(), Error>;

    /// Closes the underlying transport connection.
    async fn disconnect(&mut self) -> Result<(), Error>;

    /// The long-lived operation. Returns only on shutdown (`signal_receiver`
    /// yields `Signal::Stop`) or permanent failure. Records are delivered
    /// synchronously via `on_record`; `on_stats` is called periodically.
    async fn run(
        &mut self,
        signal_receiver: SignalReceiver,
        on_record: OnRecord,
        on_stats: OnStats,
    ) -> Result<(), Error>;

    /// Returns the most recent stats snapshot.
    fn stats(&self) -> ClientStats;

    /// Returns the current health as surfaced to the status endpoint.
    fn health(&self) -> Health;

    /// Returns the current state-machine state.
    fn state(&self) -> ClientState;

    /// The protocol kind implemented by this client.
    fn protocol_kind(&self) -> ProtocolKind;
}

/// Clients manager: tracks one stop-signal sender per source, mirroring the
/// shape of a receivers controller.
#[derive(Default)]
pub struct ClientsController {
    clients: std::collections::HashMap<String, tokio::sync::mpsc::Sender<Signal>>,
}

impl ClientsController {
    /// Creates an empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client's stop-signal sender under `source_name`.
    pub fn add_client(&mut self, source_name: String, sender: tokio::sync::mpsc::Sender<Signal>) {
        let _ = self.clients.insert(source_name, sender);
    }

    /// Removes a client's registration, returning whether one existed.
    pub fn remove_client(&mut self, source_name: &str) -> bool {
        self.clients.remove(source_name).is_some()
    }

    /// Sends a stop signal to every registered client.
    pub fn stop_all(&self) {
        for (source_name, sender) in self.clients.iter() {
            tracing::info!(%source_name, "stopping client");
            if let Err(error) = sender.try_send(Signal::Stop) {
                tracing::error!(%error, %source_name, "sending stop signal to client failed");
            }
        }
    }

    /// Sends a stop signal to a single client by source name.
    pub fn stop_client(&self, source_name: &str) {
        if let Some(sender) = self.clients.get(source_name) {
            if let Err(error) = sender.try_send(Signal::Stop) {
                tracing::error!(%error, %source_name, "sending stop signal to client failed");
            }
        }
    }

    /// Names of all registered sources.
    pub fn source_names(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_vs_fatal_are_disjoint() {
        let errors = [
            Error::Config {
                source_name: "s".into(),
                message: "m".into(),
            },
            Error::Auth {
                source_name: "s".into(),
                message: "m".into(),
            },
            Error::Transport {
                source_name: "s".into(),
                message: "m".into(),
            },
            Error::Protocol {
                source_name: "s".into(),
                message: "m".into(),
            },
            Error::Certificate {
                source_name: "s".into(),
                message: "m".into(),
            },
        ];

        for error in &errors {
            assert_ne!(error.is_retryable(), error.is_fatal());
        }
    }

    #[test]
    fn terminal_states() {
        assert!(ClientState::Failed.is_terminal());
        assert!(ClientState::Stopped.is_terminal());
        assert!(!ClientState::Running.is_terminal());
        assert!(!ClientState::Disconnected.is_terminal());
    }
}
