//! Modbus TCP protocol client.
//!
//! Polls each configured register map entry at the configured scan cycle,
//! emitting one record per register read. Quality is synthesized: `Good`
//! if the read succeeds, `Bad` with an error code on timeout or exception
//! response.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use record::{ProtocolKind, ProtocolRecord, Value};
use tokio_modbus::{client::Context as ModbusContext, prelude::*};

use crate::{
    backoff::Backoff,
    control::{Signal, SignalReceiver},
    AsyncClient, ClientState, ClientStats, Error, Health, OnRecord, OnStats,
};

/// The register function used to read a mapped point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterFunction {
    /// Read holding registers (function code 3).
    Holding,
    /// Read input registers (function code 4).
    Input,
    /// Read coils (function code 1).
    Coil,
}

/// A single polled register.
#[derive(Debug, Clone)]
pub struct RegisterMapping {
    /// Modbus unit (slave) id.
    pub unit_id: u8,
    /// Register function.
    pub function: RegisterFunction,
    /// Starting register address.
    pub address: u16,
    /// Number of registers to read (ignored for coils, which read 1 bit).
    pub length: u16,
    /// Raw-to-scaled conversion factor, surfaced in `metadata`.
    pub scale: f64,
}

impl RegisterMapping {
    /// Canonical `topic_or_path` encoding `(unit, function, address, length)`.
    pub fn topic_or_path(&self) -> String {
        let function = match self.function {
            RegisterFunction::Holding => "holding",
            RegisterFunction::Input => "input",
            RegisterFunction::Coil => "coil",
        };
        format!("unit={}/fn={}/addr={}/len={}", self.unit_id, function, self.address, self.length)
    }
}

/// Configuration for a Modbus TCP client instance.
#[derive(Debug, Clone)]
pub struct ModbusConfig {
    /// The source name this client serves.
    pub source_name: String,
    /// Slave host.
    pub host: String,
    /// Slave port (typically 502).
    pub port: u16,
    /// Registers to poll.
    pub registers: Vec<RegisterMapping>,
    /// Scan cycle period (50-500 ms typical).
    pub scan_interval: Duration,
}

/// The Modbus TCP protocol client.
pub struct ModbusClient {
    config: ModbusConfig,
    state: ClientState,
    health: Health,
    stats: ClientStats,
}

impl ModbusClient {
    /// Creates a new, unconnected Modbus TCP client.
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            state: ClientState::Disconnected,
            health: Health::Degraded {
                reason: "not yet connected".into(),
            },
            stats: ClientStats::default(),
        }
    }

    async fn connect_context(&self) -> Result<ModbusContext, Error> {
        let socket_addr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| Error::Config {
                source_name: self.config.source_name.clone(),
                message: format!("invalid modbus address: {e}"),
            })?;

        tcp::connect(socket_addr).await.map_err(|e| Error::Transport {
            source_name: self.config.source_name.clone(),
            message: e.to_string(),
        })
    }

    /// Reads one mapped register. The outer `Result` distinguishes a
    /// transport-level failure (connection lost, timeout) — which should
    /// trigger the client's reconnect loop — from a Modbus exception
    /// response (illegal address, illegal function, …), which is a
    /// per-point protocol error: the point reads as `Bad` and polling of
    /// the other mapped points continues.
    async fn read_one(
        source_name: &str,
        context: &mut ModbusContext,
        mapping: &RegisterMapping,
    ) -> Result<Result<Value, Error>, Error> {
        let _ = context.set_slave(Slave(mapping.unit_id));

        let transport_err = |e: std::io::Error| Error::Transport {
            source_name: source_name.to_string(),
            message: e.to_string(),
        };
        let protocol_err = |e: tokio_modbus::ExceptionCode| {
            Error::Protocol {
                source_name: source_name.to_string(),
                message: e.to_string(),
            }
        };

        match mapping.function {
            RegisterFunction::Holding => context
                .read_holding_registers(mapping.address, mapping.length)
                .await
                .map_err(transport_err)
                .map(|inner| inner.map(|regs| Value::Float64(registers_to_scaled(&regs, mapping.scale))).map_err(protocol_err)),
            RegisterFunction::Input => context
                .read_input_registers(mapping.address, mapping.length)
                .await
                .map_err(transport_err)
                .map(|inner| inner.map(|regs| Value::Float64(registers_to_scaled(&regs, mapping.scale))).map_err(protocol_err)),
            RegisterFunction::Coil => context
                .read_coils(mapping.address, 1)
                .await
                .map_err(transport_err)
                .map(|inner| inner.map(|bits| Value::Bool(bits.first().copied().unwrap_or(false))).map_err(protocol_err)),
        }
    }
}

fn registers_to_scaled(registers: &[u16], scale: f64) -> f64 {
    let raw: u32 = registers
        .iter()
        .fold(0u32, |acc, word| (acc << 16) | (*word as u32));
    raw as f64 * scale
}

#[async_trait]
impl AsyncClient for ModbusClient {
    async fn connect(&mut self) -> Result<(), Error> {
        if self.config.registers.is_empty() {
            return Err(Error::Config {
                source_name: self.config.source_name.clone(),
                message: "no registers configured".into(),
            });
        }
        self.state = ClientState::Connecting;
        let mut context = self.connect_context().await?;
        drop(context.disconnect().await);
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
        let endpoint = format!("modbus://{}:{}", self.config.host, self.config.port);

        let mut context = loop {
            match self.connect_context().await {
                Ok(context) => break context,
                Err(error) => {
                    self.state = ClientState::Reconnecting;
                    self.health = Health::Degraded { reason: error.to_string() };
                    let delay = backoff.next_delay();
                    tracing::warn!(source_name = %self.config.source_name, %error, attempt = backoff.attempt(), ?delay, "modbus connect failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        };
        self.state = ClientState::Running;
        self.health = Health::Healthy;

        let mut scan_timer = tokio::time::interval(self.config.scan_interval);

        loop {
            tokio::select! {
                biased;

                signal = signal_receiver.recv() => {
                    match signal {
                        Signal::Stop => {
                            self.state = ClientState::Stopped;
                            return Ok(());
                        }
                        Signal::TimerTick { .. } => {
                            on_stats.call(self.stats);
                        }
                    }
                }

                _ = scan_timer.tick() => {
                        let mut lost_connection = false;

                        for mapping in self.config.registers.clone() {
                            let now_us = SystemTime::now()
                                .duration_since(UNIX_EPOCH)
                                .map(|d| d.as_micros() as i64)
                                .unwrap_or(0);

                            match Self::read_one(&self.config.source_name, &mut context, &mapping).await {
                                Ok(Ok(value)) => {
                                    backoff.reset();
                                    self.health = Health::Healthy;

                                    match ProtocolRecord::new(
                                        now_us,
                                        self.config.source_name.clone(),
                                        endpoint.clone(),
                                        ProtocolKind::Modbus,
                                        mapping.topic_or_path(),
                                        value,
                                        0,
                                        "Good",
                                    ) {
                                        Ok(mut record) => {
                                            let _ = record.metadata.insert("scale".into(), mapping.scale.to_string());
                                            on_record.call(record);
                                            self.stats.records_emitted += 1;
                                        }
                                        Err(_) => self.stats.records_skipped += 1,
                                    }
                                }
                                Ok(Err(error)) => {
                                    // A Modbus exception response: the point
                                    // itself is bad, the connection is fine.
                                    self.stats.records_skipped += 1;
                                    tracing::warn!(source_name = %self.config.source_name, %error, path = %mapping.topic_or_path(), "modbus exception response");

                                    let bad = ProtocolRecord::new(
                                        now_us,
                                        self.config.source_name.clone(),
                                        endpoint.clone(),
                                        ProtocolKind::Modbus,
                                        mapping.topic_or_path(),
                                        Value::String(error.to_string()),
                                        1,
                                        "Bad",
                                    );
                                    if let Ok(record) = bad {
                                        on_record.call(record);
                                    }
                                }
                                Err(error) => {
                                    // Transport-level failure: the socket is
                                    // gone, further reads this scan cycle
                                    // will fail too. Stop this cycle and
                                    // reconnect.
                                    self.stats.transient_errors += 1;
                                    tracing::warn!(source_name = %self.config.source_name, %error, "modbus connection lost, reconnecting");
                                    lost_connection = true;
                                    break;
                                }
                            }
                        }

                        if lost_connection {
                            self.state = ClientState::Reconnecting;
                            self.stats.reconnects += 1;
                            context = loop {
                                let delay = backoff.next_delay();
                                tracing::warn!(source_name = %self.config.source_name, attempt = backoff.attempt(), ?delay, "modbus reconnecting");
                                tokio::time::sleep(delay).await;
                                match self.connect_context().await {
                                    Ok(context) => break context,
                                    Err(error) => {
                                        self.health = Health::Degraded { reason: error.to_string() };
                                        tracing::warn!(source_name = %self.config.source_name, %error, "modbus reconnect attempt failed");
                                    }
                                }
                            };
                            backoff.reset();
                            self.state = ClientState::Running;
                            self.health = Health::Healthy;
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
        ProtocolKind::Modbus
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registers_to_scaled_combines_two_words_big_endian() {
        let value = registers_to_scaled(&[0x0001, 0x0000], 1.0);
        assert_eq!(value, 65536.0);
    }

    #[test]
    fn registers_to_scaled_applies_conversion_factor() {
        let value = registers_to_scaled(&[100], 0.1);
        assert_eq!(value, 10.0);
    }

    #[test]
    fn topic_or_path_encodes_unit_function_address_length() {
        let mapping = RegisterMapping {
            unit_id: 1,
            function: RegisterFunction::Holding,
            address: 40001,
            length: 2,
            scale: 0.1,
        };
        assert_eq!(mapping.topic_or_path(), "unit=1/fn=holding/addr=40001/len=2");
    }

    #[tokio::test]
    async fn connect_rejects_a_source_with_no_registers() {
        let mut client = ModbusClient::new(ModbusConfig {
            source_name: "empty".into(),
            host: "10.0.0.1".into(),
            port: 502,
            registers: vec![],
            scan_interval: Duration::from_millis(200),
        });
        assert!(matches!(client.connect().await, Err(Error::Config { .. })));
    }
}
