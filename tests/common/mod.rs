use record::{ProtocolKind, ProtocolRecord, Value};

/// Builds a synthetic record for a given source/sequence, mirroring the
/// shape a protocol client would emit.
pub fn sample_record(source_name: &str, seq: i64) -> ProtocolRecord {
    ProtocolRecord::new(seq, source_name, "test://endpoint", ProtocolKind::Opcua, format!("node-{seq}"), Value::Int64(seq), 0, "Good").expect("sample records are always well-formed")
}
