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

//! The universal event carried from a protocol client to the sink.
//!
//! `ProtocolRecord` is the `Msg` type threaded through the `client`, `queue`,
//! `batcher` and `sink` crates: immutable once emitted, owned by exactly one
//! component at a time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Errors raised while building or serializing a record.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// `event_time_us` was negative.
    #[error("invalid event_time_us: {0}")]
    InvalidEventTime(i64),
}

/// Which protocol produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// OPC-UA.
    Opcua,
    /// MQTT.
    Mqtt,
    /// Modbus TCP.
    Modbus,
}

impl ProtocolKind {
    /// Returns the wire name of this protocol kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Opcua => "opcua",
            ProtocolKind::Mqtt => "mqtt",
            ProtocolKind::Modbus => "modbus",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed set of scalar value variants. Deliberately not a dynamic any-type:
/// downstream consumers match on the tag rather than probing at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "value")]
pub enum Value {
    /// A boolean reading.
    #[serde(rename = "bool")]
    Bool(bool),
    /// A signed 64-bit integer reading.
    #[serde(rename = "int64")]
    Int64(i64),
    /// A 64-bit float reading.
    #[serde(rename = "float64")]
    Float64(f64),
    /// A string reading.
    #[serde(rename = "string")]
    String(String),
    /// A raw byte-string reading.
    #[serde(rename = "bytes")]
    Bytes(Vec<u8>),
}

impl Value {
    /// Canonical name of the value's variant, as used in `value_type`.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int64(_) => "int64",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Numeric projection, populated iff the value is numerically
    /// interpretable (`int64`, `float64`, or `bool` mapped to `{0, 1}`).
    pub fn as_num(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            Value::String(_) | Value::Bytes(_) => None,
        }
    }

    /// Canonical string form used on the wire.
    pub fn as_canonical_string(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Int64(i) => i.to_string(),
            Value::Float64(f) => f.to_string(),
            Value::String(s) => s.clone(),
            Value::Bytes(b) => hex::encode(b),
        }
    }
}

/// Optional semantic enrichment attached by the WoT binding layer. Set
/// together or left entirely absent, never partially populated.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WotEnrichment {
    /// Identifier of the originating Thing.
    pub thing_id: String,
    /// Human-readable title of the Thing.
    pub thing_title: String,
    /// Semantic type of the property (`@type` in the Thing Description).
    pub semantic_type: String,
    /// Unit URI of the property.
    pub unit_uri: String,
}

/// The universal event emitted by a protocol client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolRecord {
    /// Monotonic microsecond epoch asserted by the source.
    pub event_time_us: i64,
    /// Set by the bridge when the record enters the queue.
    pub ingest_time_us: i64,
    /// Free-form key from configuration.
    pub source_name: String,
    /// Resolved connection string used.
    pub endpoint: String,
    /// Tag identifying which client produced this record.
    pub protocol_kind: ProtocolKind,
    /// Protocol-native identifier (OPC-UA NodeId, MQTT topic, Modbus register path).
    pub topic_or_path: String,
    /// Raw value as a tagged variant.
    pub value: Value,
    /// Key/value map for protocol-native side-channel data.
    pub metadata: HashMap<String, String>,
    /// Integer quality/status code, protocol-native.
    pub status_code: i32,
    /// Human-readable status string.
    pub status: String,
    /// Optional WoT enrichment; `None` when the source was not TD-configured.
    pub wot: Option<WotEnrichment>,
}

impl ProtocolRecord {
    /// Creates a new record. `ingest_time_us` is left at zero; the queue
    /// sets it when the record is accepted.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_time_us: i64,
        source_name: impl Into<String>,
        endpoint: impl Into<String>,
        protocol_kind: ProtocolKind,
        topic_or_path: impl Into<String>,
        value: Value,
        status_code: i32,
        status: impl Into<String>,
    ) -> Result<Self, Error> {
        if event_time_us < 0 {
            return Err(Error::InvalidEventTime(event_time_us));
        }

        Ok(Self {
            event_time_us,
            ingest_time_us: 0,
            source_name: source_name.into(),
            endpoint: endpoint.into(),
            protocol_kind,
            topic_or_path: topic_or_path.into(),
            value,
            metadata: HashMap::new(),
            status_code,
            status: status.into(),
            wot: None,
        })
    }

    /// Marks this record as having entered the queue at `ingest_time_us`.
    pub fn with_ingest_time(mut self, ingest_time_us: i64) -> Self {
        self.ingest_time_us = ingest_time_us;
        self
    }

    /// Attaches WoT enrichment fields.
    pub fn with_wot(mut self, wot: WotEnrichment) -> Self {
        self.wot = Some(wot);
        self
    }

    /// Produces the canonical key/value map used by the spool and the sink
    /// wire payload (see the record payload schema).
    pub fn to_payload(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        let _ = map.insert("event_time".into(), self.event_time_us.into());
        let _ = map.insert("ingest_time".into(), self.ingest_time_us.into());
        let _ = map.insert("source_name".into(), self.source_name.clone().into());
        let _ = map.insert("endpoint".into(), self.endpoint.clone().into());
        let _ = map.insert("protocol_type".into(), self.protocol_kind.as_str().into());
        let _ = map.insert("topic_or_path".into(), self.topic_or_path.clone().into());
        let _ = map.insert("value".into(), self.value.as_canonical_string().into());
        let _ = map.insert("value_type".into(), self.value.type_name().into());
        let _ = map.insert(
            "value_num".into(),
            match self.value.as_num() {
                Some(n) => serde_json::Number::from_f64(n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
                None => serde_json::Value::Null,
            },
        );
        let _ = map.insert(
            "metadata".into(),
            serde_json::to_value(&self.metadata).unwrap_or(serde_json::Value::Null),
        );
        let _ = map.insert("status_code".into(), self.status_code.into());
        let _ = map.insert("status".into(), self.status.clone().into());

        if let Some(wot) = &self.wot {
            let _ = map.insert("thing_id".into(), wot.thing_id.clone().into());
            let _ = map.insert("thing_title".into(), wot.thing_title.clone().into());
            let _ = map.insert("semantic_type".into(), wot.semantic_type.clone().into());
            let _ = map.insert("unit_uri".into(), wot.unit_uri.clone().into());
        }

        serde_json::Value::Object(map)
    }
}

/// Derived once per Thing Description fetch; cached until the source is
/// reconfigured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThingConfig {
    /// Identifier of the Thing.
    pub thing_id: String,
    /// Title of the Thing.
    pub title: String,
    /// Base URL of the Thing, whose scheme identifies the protocol.
    pub endpoint: String,
    /// Detected protocol kind.
    pub protocol_kind: Option<ProtocolKind>,
    /// Property names extracted from the TD.
    pub properties: Vec<String>,
    /// Property name -> semantic type (`@type`).
    pub semantic_types: HashMap<String, String>,
    /// Property name -> unit URI.
    pub unit_uris: HashMap<String, String>,
    /// Opaque raw TD, kept for diagnostics.
    pub raw: serde_json::Value,
}

/// Ordered sequence of records, the unit of acknowledgement from the sink.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    records: Vec<ProtocolRecord>,
}

impl Batch {
    /// Creates a new, empty batch.
    pub fn new() -> Self {
        Self { records: Vec::new() }
    }

    /// Creates a batch from an already-ordered vector of records.
    pub fn from_records(records: Vec<ProtocolRecord>) -> Self {
        Self { records }
    }

    /// Appends a record, preserving dequeue order.
    pub fn push(&mut self, record: ProtocolRecord) {
        self.records.push(record);
    }

    /// Number of records in this batch.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether this batch has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Borrows the records in dequeue order.
    pub fn records(&self) -> &[ProtocolRecord] {
        &self.records
    }

    /// Consumes the batch, returning its records in dequeue order.
    pub fn into_records(self) -> Vec<ProtocolRecord> {
        self.records
    }

    /// Age of the oldest record in this batch, in microseconds, relative to
    /// `now_us`.
    pub fn oldest_age_us(&self, now_us: i64) -> Option<i64> {
        self.records.iter().map(|r| now_us - r.ingest_time_us).max()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample(event_time_us: i64) -> ProtocolRecord {
        ProtocolRecord::new(
            event_time_us,
            "plc-1",
            "opc.tcp://plc-1:4840",
            ProtocolKind::Opcua,
            "ns=2;s=Motor.Power",
            Value::Float64(42.5),
            0,
            "Good",
        )
        .unwrap()
    }

    #[test]
    fn rejects_negative_event_time() {
        let err = ProtocolRecord::new(
            -1,
            "s",
            "e",
            ProtocolKind::Mqtt,
            "t",
            Value::Bool(true),
            0,
            "Good",
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidEventTime(-1)));
    }

    #[test]
    fn value_num_populated_for_numeric_types() {
        assert_eq!(Value::Int64(7).as_num(), Some(7.0));
        assert_eq!(Value::Float64(1.5).as_num(), Some(1.5));
        assert_eq!(Value::Bool(true).as_num(), Some(1.0));
        assert_eq!(Value::Bool(false).as_num(), Some(0.0));
        assert_eq!(Value::String("x".into()).as_num(), None);
    }

    #[test]
    fn to_payload_omits_wot_fields_when_absent() {
        let record = sample(1_000_000);
        let payload = record.to_payload();
        assert!(payload.get("thing_id").is_none());
        assert_eq!(payload["value_type"], "float64");
        assert_eq!(payload["protocol_type"], "opcua");
    }

    #[test]
    fn to_payload_includes_wot_fields_when_set_together() {
        let record = sample(1_000_000).with_wot(WotEnrichment {
            thing_id: "thing-1".into(),
            thing_title: "Crusher".into(),
            semantic_type: "saref:PowerSensor".into(),
            unit_uri: "http://qudt.org/vocab/unit/KiloW".into(),
        });
        let payload = record.to_payload();
        assert_eq!(payload["semantic_type"], "saref:PowerSensor");
        assert_eq!(payload["unit_uri"], "http://qudt.org/vocab/unit/KiloW");
    }

    #[test]
    fn batch_preserves_dequeue_order() {
        let mut batch = Batch::new();
        batch.push(sample(1));
        batch.push(sample(2));
        batch.push(sample(3));
        let times: Vec<i64> = batch.records().iter().map(|r| r.event_time_us).collect();
        assert_eq!(times, vec![1, 2, 3]);
    }
}
