//! Builds a protocol client from a `config::SourceConfig`'s explicit
//! protocol definition. Thing-Description-defined sources go through
//! `wot::create_client_from_td` instead.

use client::{modbus, mqtt, opcua, AsyncClient};
use config::{ModbusOptions, MqttOptions, OpcUaOptions, ProtocolKindConfig, SecurityConfig, SecurityModeConfig, SourceDefinition};

use crate::Error;

fn security_mode(security: &Option<SecurityConfig>) -> opcua::SecurityMode {
    match security.as_ref().map(|s| s.mode) {
        Some(SecurityModeConfig::Sign) => opcua::SecurityMode::Sign,
        Some(SecurityModeConfig::SignAndEncrypt) => opcua::SecurityMode::SignAndEncrypt,
        _ => opcua::SecurityMode::None,
    }
}

fn build_opcua(source_name: &str, endpoint: &str, opts: &OpcUaOptions, security: &Option<SecurityConfig>) -> Box<dyn AsyncClient> {
    Box::new(opcua::OpcUaClient::new(opcua::OpcUaConfig {
        source_name: source_name.to_string(),
        endpoint_url: endpoint.to_string(),
        security_mode: security_mode(security),
        certificate_path: security.as_ref().and_then(|s| s.certificate_path.clone()).map(Into::into),
        server_certificate_path: security.as_ref().and_then(|s| s.server_certificate_path.clone()).map(Into::into),
        nodes: opts
            .nodes
            .iter()
            .map(|n| opcua::NodeMapping {
                node_id: n.node_id.clone(),
                browse_path: n.browse_path.clone(),
            })
            .collect(),
        publishing_interval: std::time::Duration::from_millis(opts.publishing_interval_ms),
        sampling_interval: opts.sampling_interval_ms.map(std::time::Duration::from_millis),
    }))
}

fn build_mqtt(source_name: &str, opts: &MqttOptions) -> Box<dyn AsyncClient> {
    Box::new(mqtt::MqttClient::new(mqtt::MqttConfig {
        source_name: source_name.to_string(),
        host: opts.host.clone(),
        port: opts.port,
        client_id: opts.client_id.clone(),
        stable_client_id: opts.stable_client_id,
        topics: opts
            .topics
            .iter()
            .map(|t| mqtt::TopicFilter {
                filter: t.filter.clone(),
                qos: t.qos,
            })
            .collect(),
        username: opts.username.clone(),
        password: opts.password.clone(),
    }))
}

fn build_modbus(source_name: &str, opts: &ModbusOptions) -> Box<dyn AsyncClient> {
    Box::new(modbus::ModbusClient::new(modbus::ModbusConfig {
        source_name: source_name.to_string(),
        host: opts.host.clone(),
        port: opts.port,
        registers: opts
            .registers
            .iter()
            .map(|r| modbus::RegisterMapping {
                unit_id: r.unit_id,
                function: match r.function {
                    config::RegisterFunctionConfig::Holding => modbus::RegisterFunction::Holding,
                    config::RegisterFunctionConfig::Input => modbus::RegisterFunction::Input,
                    config::RegisterFunctionConfig::Coil => modbus::RegisterFunction::Coil,
                },
                address: r.address,
                length: r.length,
                scale: r.scale,
            })
            .collect(),
        scan_interval: std::time::Duration::from_millis(opts.scan_interval_ms),
    }))
}

/// Builds a protocol client for an explicit `Protocol`-defined source.
/// Returns `Error::InvalidSource` if the declared protocol's options block
/// is missing, or if called with a `ThingDescription` definition (those go
/// through `wot::create_client_from_td` instead).
pub fn build_client(source_name: &str, definition: &SourceDefinition) -> Result<Box<dyn AsyncClient>, Error> {
    match definition {
        SourceDefinition::Protocol {
            protocol,
            endpoint,
            opcua,
            mqtt,
            modbus,
            security,
        } => match protocol {
            ProtocolKindConfig::Opcua => {
                let opts = opcua.as_ref().ok_or_else(|| Error::InvalidSource(source_name.to_string(), "missing opcua options".into()))?;
                Ok(build_opcua(source_name, endpoint, opts, security))
            }
            ProtocolKindConfig::Mqtt => {
                let opts = mqtt.as_ref().ok_or_else(|| Error::InvalidSource(source_name.to_string(), "missing mqtt options".into()))?;
                Ok(build_mqtt(source_name, opts))
            }
            ProtocolKindConfig::Modbus => {
                let opts = modbus.as_ref().ok_or_else(|| Error::InvalidSource(source_name.to_string(), "missing modbus options".into()))?;
                Ok(build_modbus(source_name, opts))
            }
        },
        SourceDefinition::ThingDescription { .. } => Err(Error::InvalidSource(
            source_name.to_string(),
            "thing-description sources are built via add_source_from_td".into(),
        )),
    }
}
