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

//! Web-of-Things binding layer: fetches and parses a Thing Description and
//! builds the appropriate protocol client, wrapping its `on_record`
//! callback to inject semantic fields. The wrapper is a pure decoration —
//! it never blocks, mutates the record before delivery, or fails.

use std::{sync::Arc, time::Duration};

use client::{opcua::NodeMapping, AsyncClient, OnRecord};
use record::{ProtocolKind, ThingConfig, WotEnrichment};

/// Maximum size, in bytes, of a fetched Thing Description.
const MAX_TD_SIZE_BYTES: usize = 2 * 1024 * 1024;

/// Timeout for fetching a Thing Description.
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised while fetching, parsing, or binding a Thing Description.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The TD could not be fetched over HTTPS.
    #[error("failed to fetch thing description from {url}: {message}")]
    Fetch {
        /// The URL that was fetched.
        url: String,
        /// The error message.
        message: String,
    },

    /// The fetched TD exceeded the size bound.
    #[error("thing description from {url} exceeded the {MAX_TD_SIZE_BYTES} byte limit")]
    TooLarge {
        /// The URL that was fetched.
        url: String,
    },

    /// The TD is missing a `base` URL, or its scheme could not be mapped to
    /// a known protocol.
    #[error("invalid thing description: {message}")]
    InvalidTd {
        /// The error message.
        message: String,
    },

    /// The TD described a protocol for which auto-configuration from a TD
    /// alone is not supported.
    #[error("cannot build a {protocol_kind} client from a thing description alone: {reason}")]
    UnsupportedProtocol {
        /// The protocol kind detected.
        protocol_kind: String,
        /// Why this protocol cannot be auto-configured.
        reason: String,
    },
}

/// Fetches a Thing Description via HTTPS GET. The content-type is expected
/// to be JSON-LD but is parsed as plain JSON; the response is size-bounded
/// and timeout-bounded.
pub async fn fetch_td(url: &str) -> Result<serde_json::Value, Error> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;

    let response = client.get(url).send().await.map_err(|e| Error::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let bytes = response.bytes().await.map_err(|e| Error::Fetch {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    if bytes.len() > MAX_TD_SIZE_BYTES {
        return Err(Error::TooLarge { url: url.to_string() });
    }

    serde_json::from_slice(&bytes).map_err(|e| Error::InvalidTd {
        message: format!("thing description is not valid JSON: {e}"),
    })
}

/// Parses a fetched Thing Description into a `ThingConfig`.
///
/// Protocol kind is detected by the scheme prefix of the top-level `base`
/// field (`opc.tcp://` -> opcua, `mqtt(s)://` -> mqtt, `modbus(tcp)://` ->
/// modbus). Fails with `InvalidTd` when `base` is missing or its scheme is
/// unrecognized.
pub fn parse_td(td: &serde_json::Value) -> Result<ThingConfig, Error> {
    let base = td.get("base").and_then(|v| v.as_str()).ok_or_else(|| Error::InvalidTd {
        message: "missing top-level `base` field".into(),
    })?;

    let protocol_kind = detect_protocol(base).ok_or_else(|| Error::InvalidTd {
        message: format!("unrecognized protocol scheme in base URL: {base}"),
    })?;

    let thing_id = td
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or(base)
        .to_string();
    let title = td.get("title").and_then(|v| v.as_str()).unwrap_or("").to_string();

    let mut properties = Vec::new();
    let mut semantic_types = std::collections::HashMap::new();
    let mut unit_uris = std::collections::HashMap::new();

    if let Some(props) = td.get("properties").and_then(|v| v.as_object()) {
        for (name, prop) in props {
            properties.push(name.clone());

            if let Some(semantic_type) = prop.get("@type").and_then(property_type_as_string) {
                let _ = semantic_types.insert(name.clone(), semantic_type);
            }

            let unit = prop
                .get("unit")
                .and_then(|v| v.as_str())
                .or_else(|| prop.get("qudt:unit").and_then(|v| v.as_str()));
            if let Some(unit) = unit {
                let _ = unit_uris.insert(name.clone(), unit.to_string());
            }
        }
    }

    Ok(ThingConfig {
        thing_id,
        title,
        endpoint: base.to_string(),
        protocol_kind: Some(protocol_kind),
        properties,
        semantic_types,
        unit_uris,
        raw: td.clone(),
    })
}

fn property_type_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => items.first().and_then(|v| v.as_str()).map(|s| s.to_string()),
        _ => None,
    }
}

fn detect_protocol(base: &str) -> Option<ProtocolKind> {
    if base.starts_with("opc.tcp://") {
        Some(ProtocolKind::Opcua)
    } else if base.starts_with("mqtt://") || base.starts_with("mqtts://") {
        Some(ProtocolKind::Mqtt)
    } else if base.starts_with("modbus://") || base.starts_with("modbustcp://") {
        Some(ProtocolKind::Modbus)
    } else {
        None
    }
}

/// Wraps an `on_record` capability so that each delivered record has
/// `thing_id`, `thing_title`, `semantic_type`, and `unit_uri` filled in
/// when its `topic_or_path` is a known property of `thing`. Records for
/// unknown properties pass through unchanged.
pub fn wrap_on_record(thing: Arc<ThingConfig>, inner: OnRecord) -> OnRecord {
    OnRecord::new(move |record| {
        let mut record = record;
        if thing.properties.iter().any(|p| p == &record.topic_or_path) {
            let semantic_type = thing.semantic_types.get(&record.topic_or_path).cloned().unwrap_or_default();
            let unit_uri = thing.unit_uris.get(&record.topic_or_path).cloned().unwrap_or_default();
            record = record.with_wot(WotEnrichment {
                thing_id: thing.thing_id.clone(),
                thing_title: thing.title.clone(),
                semantic_type,
                unit_uri,
            });
        }
        inner.call(record);
    })
}

/// Result of building a protocol client from a Thing Description: the
/// client itself, the derived `ThingConfig`, and an `on_record` capability
/// already wrapped with semantic enrichment.
pub struct WotBinding {
    /// The constructed protocol client, not yet connected.
    pub client: Box<dyn AsyncClient>,
    /// The parsed Thing Description.
    pub thing: ThingConfig,
    /// The wrapped record callback; pass this, not the caller's original
    /// `on_record`, into `client.run`.
    pub on_record: OnRecord,
}

/// Fetches, parses, and builds the appropriate protocol client for `url`,
/// wrapping `on_record` with semantic enrichment derived from the TD.
pub async fn create_client_from_td(url: &str, source_name: &str, on_record: OnRecord) -> Result<WotBinding, Error> {
    let td = fetch_td(url).await?;
    let thing = parse_td(&td)?;
    let wrapped = wrap_on_record(Arc::new(thing.clone()), on_record);

    let client: Box<dyn AsyncClient> = match thing.protocol_kind {
        Some(ProtocolKind::Opcua) => Box::new(client::opcua::OpcUaClient::new(client::opcua::OpcUaConfig {
            source_name: source_name.to_string(),
            endpoint_url: thing.endpoint.clone(),
            security_mode: client::opcua::SecurityMode::None,
            certificate_path: None,
            server_certificate_path: None,
            nodes: thing
                .properties
                .iter()
                .map(|name| NodeMapping {
                    node_id: name.clone(),
                    browse_path: None,
                })
                .collect(),
            publishing_interval: Duration::from_millis(1000),
            sampling_interval: None,
        })),
        Some(ProtocolKind::Mqtt) => {
            let url = url::Url::parse(&thing.endpoint).map_err(|e| Error::InvalidTd {
                message: format!("invalid mqtt base URL: {e}"),
            })?;
            Box::new(client::mqtt::MqttClient::new(client::mqtt::MqttConfig {
                source_name: source_name.to_string(),
                host: url.host_str().unwrap_or("").to_string(),
                port: url.port().unwrap_or(1883),
                client_id: format!("fieldbridge-{source_name}"),
                stable_client_id: true,
                topics: thing
                    .properties
                    .iter()
                    .map(|name| client::mqtt::TopicFilter {
                        filter: name.clone(),
                        qos: 0,
                    })
                    .collect(),
                username: None,
                password: None,
            }))
        }
        Some(ProtocolKind::Modbus) => {
            return Err(Error::UnsupportedProtocol {
                protocol_kind: "modbus".into(),
                reason: "register addresses cannot be derived from property names alone".into(),
            })
        }
        None => {
            return Err(Error::InvalidTd {
                message: "thing description did not resolve to a known protocol".into(),
            })
        }
    };

    Ok(WotBinding {
        client,
        thing,
        on_record: wrapped,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_td() -> serde_json::Value {
        serde_json::json!({
            "id": "urn:thing:crusher-1",
            "title": "Crusher 1",
            "base": "opc.tcp://sim:4840/",
            "properties": {
                "crusher_1_motor_power": {
                    "@type": "saref:PowerSensor",
                    "unit": "http://qudt.org/vocab/unit/KiloW"
                },
                "crusher_1_status": {
                    "@type": "saref:OnOffState"
                }
            }
        })
    }

    #[test]
    fn parses_protocol_kind_from_base_scheme() {
        let thing = parse_td(&sample_td()).unwrap();
        assert_eq!(thing.protocol_kind, Some(ProtocolKind::Opcua));
        assert_eq!(thing.properties.len(), 2);
        assert_eq!(
            thing.semantic_types.get("crusher_1_motor_power").unwrap(),
            "saref:PowerSensor"
        );
        assert_eq!(
            thing.unit_uris.get("crusher_1_motor_power").unwrap(),
            "http://qudt.org/vocab/unit/KiloW"
        );
    }

    #[test]
    fn rejects_missing_base() {
        let td = serde_json::json!({ "properties": {} });
        let err = parse_td(&td).unwrap_err();
        assert!(matches!(err, Error::InvalidTd { .. }));
    }

    #[test]
    fn rejects_unrecognized_scheme() {
        let td = serde_json::json!({ "base": "ftp://example.com", "properties": {} });
        let err = parse_td(&td).unwrap_err();
        assert!(matches!(err, Error::InvalidTd { .. }));
    }

    #[test]
    fn wrap_on_record_enriches_known_properties_only() {
        let thing = Arc::new(parse_td(&sample_td()).unwrap());

        let captured = Arc::new(std::sync::Mutex::new(Vec::new()));
        let captured_clone = captured.clone();
        let inner = OnRecord::new(move |record| captured_clone.lock().unwrap().push(record));
        let wrapped = wrap_on_record(thing, inner);

        let known = record::ProtocolRecord::new(
            1,
            "s",
            "opc.tcp://sim:4840/",
            ProtocolKind::Opcua,
            "crusher_1_motor_power",
            record::Value::Float64(10.0),
            0,
            "Good",
        )
        .unwrap();
        let unknown = record::ProtocolRecord::new(
            1,
            "s",
            "opc.tcp://sim:4840/",
            ProtocolKind::Opcua,
            "unrelated_tag",
            record::Value::Float64(10.0),
            0,
            "Good",
        )
        .unwrap();

        wrapped.call(known);
        wrapped.call(unknown);

        let records = captured.lock().unwrap();
        assert!(records[0].wot.as_ref().unwrap().semantic_type == "saref:PowerSensor");
        assert!(records[1].wot.is_none());
    }
}
