//! MQTT protocol client.
//!
//! Connects to a broker, subscribes to configured topic filters, and emits
//! one record per received publish. When the broker is unreachable the
//! client enters a *headless* mode: it still reports as up but emits no
//! records.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use record::{ProtocolKind, ProtocolRecord, Value};
use rumqttc::{AsyncClient as RumqttcClient, Event, EventLoop, MqttOptions, Packet, QoS};

use crate::{
    backoff::Backoff,
    control::{Signal, SignalReceiver},
    AsyncClient, ClientState, ClientStats, Error, Health, OnRecord, OnStats,
};

/// A configured topic filter with its subscription QoS.
#[derive(Debug, Clone)]
pub struct TopicFilter {
    /// The topic filter string, e.g. `plant/+/temperature`.
    pub filter: String,
    /// Requested QoS (0, 1, or 2).
    pub qos: u8,
}

fn to_qos(value: u8) -> QoS {
    match value {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

/// Configuration for an MQTT client instance.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    /// The source name this client serves.
    pub source_name: String,
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Client identifier. A stable id implies `clean_session = false`; an
    /// empty/ephemeral one implies `clean_session = true`.
    pub client_id: String,
    /// Whether the client id is considered stable across restarts.
    pub stable_client_id: bool,
    /// Topic filters to subscribe to.
    pub topics: Vec<TopicFilter>,
    /// Username, if the broker requires authentication.
    pub username: Option<String>,
    /// Password, if the broker requires authentication.
    pub password: Option<String>,
}

/// The MQTT protocol client.
pub struct MqttClient {
    config: MqttConfig,
    state: ClientState,
    health: Health,
    stats: ClientStats,
    headless: bool,
}

impl MqttClient {
    /// Creates a new, unconnected MQTT client.
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            state: ClientState::Disconnected,
            health: Health::Degraded {
                reason: "not yet connected".into(),
            },
            stats: ClientStats::default(),
            headless: false,
        }
    }

    fn build_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.config.client_id.clone(), self.config.host.clone(), self.config.port);
        let _ = options.set_clean_session(!self.config.stable_client_id);
        let _ = options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            let _ = options.set_credentials(username.clone(), password.clone());
        }
        options
    }
}

#[async_trait]
impl AsyncClient for MqttClient {
    async fn connect(&mut self) -> Result<(), Error> {
        if self.config.topics.is_empty() {
            return Err(Error::Config {
                source_name: self.config.source_name.clone(),
                message: "no topic filters configured".into(),
            });
        }
        self.state = ClientState::Connecting;
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

        let options = self.build_options();
        let (mqtt_client, mut event_loop): (RumqttcClient, EventLoop) = RumqttcClient::new(options, 100);

        for topic in &self.config.topics {
            if let Err(error) = mqtt_client.subscribe(topic.filter.clone(), to_qos(topic.qos)).await {
                tracing::warn!(source_name = %self.config.source_name, %error, filter = %topic.filter, "mqtt subscribe failed");
            }
        }

        let endpoint = format!("mqtt://{}:{}", self.config.host, self.config.port);

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

                polled = event_loop.poll() => {
                    match polled {
                        Ok(Event::Incoming(Packet::Publish(publish))) => {
                            self.headless = false;
                            backoff.reset();
                            self.health = Health::Healthy;

                            let now_us = SystemTime::now()
                                .duration_since(UNIX_EPOCH)
                                .map(|d| d.as_micros() as i64)
                                .unwrap_or(0);

                            let payload = String::from_utf8_lossy(&publish.payload).to_string();

                            match ProtocolRecord::new(
                                now_us,
                                self.config.source_name.clone(),
                                endpoint.clone(),
                                ProtocolKind::Mqtt,
                                publish.topic.clone(),
                                Value::String(payload),
                                0,
                                "Good",
                            ) {
                                Ok(mut record) => {
                                    let _ = record.metadata.insert("qos".into(), format!("{:?}", publish.qos));
                                    let _ = record.metadata.insert("retain".into(), publish.retain.to_string());
                                    on_record.call(record);
                                    self.stats.records_emitted += 1;
                                }
                                Err(_) => self.stats.records_skipped += 1,
                            }
                        }
                        Ok(_other_event) => {
                            // Connection/subscription acknowledgements, pings, etc.
                        }
                        Err(error) => {
                            self.stats.transient_errors += 1;
                            self.state = ClientState::Reconnecting;
                            self.headless = true;
                            self.health = Health::Degraded { reason: format!("broker unreachable: {error}") };

                            let delay = backoff.next_delay();
                            tracing::warn!(source_name = %self.config.source_name, %error, attempt = backoff.attempt(), ?delay, "mqtt connection error, entering headless mode");
                            tokio::time::sleep(delay).await;
                            self.state = ClientState::Running;
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
        // Headless mode still reports as up, per the common contract.
        if self.headless {
            Health::Healthy
        } else {
            self.health.clone()
        }
    }

    fn state(&self) -> ClientState {
        self.state
    }

    fn protocol_kind(&self) -> ProtocolKind {
        ProtocolKind::Mqtt
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn qos_values_map_to_rumqttc_levels() {
        assert_eq!(to_qos(0), QoS::AtMostOnce);
        assert_eq!(to_qos(1), QoS::AtLeastOnce);
        assert_eq!(to_qos(2), QoS::ExactlyOnce);
        assert_eq!(to_qos(9), QoS::AtMostOnce);
    }

    #[tokio::test]
    async fn connect_rejects_a_source_with_no_topics() {
        let mut client = MqttClient::new(MqttConfig {
            source_name: "empty".into(),
            host: "broker".into(),
            port: 1883,
            client_id: "c1".into(),
            stable_client_id: true,
            topics: vec![],
            username: None,
            password: None,
        });
        assert!(matches!(client.connect().await, Err(Error::Config { .. })));
    }

    #[test]
    fn stable_client_id_implies_persistent_session() {
        let client = MqttClient::new(MqttConfig {
            source_name: "s".into(),
            host: "broker".into(),
            port: 1883,
            client_id: "c1".into(),
            stable_client_id: true,
            topics: vec![TopicFilter { filter: "a/b".into(), qos: 1 }],
            username: None,
            password: None,
        });
        assert!(!client.build_options().clean_session());
    }
}
