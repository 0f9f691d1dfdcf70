//! The dead-letter queue: records the sink permanently rejected, appended
//! to a segment store parallel to (but separate from) the backpressure
//! spool. Never drained automatically.

use std::path::PathBuf;

use record::ProtocolRecord;

use crate::{
    crypto::SpoolKey,
    spool::{Spool, SpoolAddress},
};

/// Re-exported so callers don't need to depend on the `spool` module
/// directly just to handle DLQ errors.
pub use crate::spool::Error;

/// Dead-letter storage: one parallel per-source directory, written to but
/// never automatically drained.
pub struct Dlq {
    spool: Spool,
}

impl Dlq {
    /// Creates a DLQ rooted at `root`, encrypting segments with `key`.
    pub fn new(root: PathBuf, key: SpoolKey, max_segment_bytes: u64) -> Self {
        Self {
            spool: Spool::new(root, key, max_segment_bytes, 1),
        }
    }

    /// Appends `record` with its rejection `reason` recorded in metadata.
    pub async fn append(&mut self, source_name: &str, record: &ProtocolRecord, reason: &str) -> Result<SpoolAddress, Error> {
        let mut payload = record.to_payload();
        if let serde_json::Value::Object(ref mut map) = payload {
            let _ = map.insert("dlq_reason".into(), reason.into());
        }
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        self.spool.append(source_name, &bytes).await
    }

    /// Total number of dead-lettered records currently stored for
    /// `source_name`, across all segments.
    pub async fn count(&self, source_name: &str) -> Result<usize, Error> {
        let segments = self.spool.list_segments(source_name).await?;
        let mut total = 0;
        for segment in segments {
            total += self.spool.read_segment(source_name, segment).await?.len();
        }
        Ok(total)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use record::{ProtocolKind, Value};

    #[tokio::test]
    async fn appended_records_are_counted() {
        let dir = tempfile::tempdir().unwrap();
        let key = SpoolKey::derive(b"pw", &dir.path().join("salt")).unwrap();
        let mut dlq = Dlq::new(dir.path().join("dlq"), key, 1024 * 1024);

        let record = ProtocolRecord::new(1, "s", "e", ProtocolKind::Opcua, "t", Value::Bool(true), 0, "Good").unwrap();
        let _ = dlq.append("s", &record, "schema_rejection").await.unwrap();
        let _ = dlq.append("s", &record, "schema_rejection").await.unwrap();

        assert_eq!(dlq.count("s").await.unwrap(), 2);
    }
}
