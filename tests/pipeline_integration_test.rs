//! End-to-end exercise of the queue -> batcher -> sink chain, independent
//! of any protocol client: verifies the backpressure drop policies and the
//! batch-ordering/ack-accounting guarantees named in spec.md's testable
//! properties.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use batcher::{Batcher, BatcherConfig};
use queue::{BackpressureQueue, DropPolicy, OfferOutcome};
use sink::{IngestTransport, RecordAck};

use crate::common::sample_record;

// `SinkClient::deliver` always fetches a token from the configured OAuth2
// endpoint before handing off to the transport, so exercising it here would
// require a live auth server. Like the sink crate's own tests, we verify
// ordering and ack accounting against `IngestTransport` directly instead.
struct AcceptAllTransport;

#[async_trait]
impl IngestTransport for AcceptAllTransport {
    async fn send_batch(&self, _bearer_token: &str, records: &[record::ProtocolRecord]) -> Result<Vec<RecordAck>, String> {
        Ok(records.iter().map(|_| RecordAck::Accepted).collect())
    }
}

#[tokio::test]
async fn drop_newest_keeps_a_prefix_of_the_produced_sequence() {
    let queue = Arc::new(BackpressureQueue::new(100, DropPolicy::DropNewest, false, 0.9, 0.5));

    let mut accepted = 0;
    let mut dropped = 0;
    for seq in 0..150 {
        let (outcome, _) = queue.offer(sample_record("opcua-1", seq));
        match outcome {
            OfferOutcome::Accepted => accepted += 1,
            OfferOutcome::DroppedNewest => dropped += 1,
            other => panic!("unexpected offer outcome under drop_newest with no spool: {other:?}"),
        }
    }

    assert_eq!(accepted, 100);
    assert_eq!(dropped, 50);
    assert_eq!(queue.depth(), 100);
    assert_eq!(queue.counters().dropped_newest, 50);
}

#[tokio::test]
async fn drop_oldest_keeps_a_suffix_of_the_produced_sequence() {
    let queue = Arc::new(BackpressureQueue::new(10, DropPolicy::DropOldest, false, 0.9, 0.5));

    for seq in 0..25 {
        let _ = queue.offer(sample_record("mqtt-1", seq));
    }

    assert_eq!(queue.depth(), 10);
    // The surviving tail is the last 10 produced records: seq 15..=24.
    for expected_seq in 15..25 {
        let record = queue.take(std::time::Duration::from_millis(50)).await.expect("record present");
        assert_eq!(record.event_time_us, expected_seq);
    }
}

#[tokio::test]
async fn batcher_respects_both_size_and_age_bounds() {
    let queue = Arc::new(BackpressureQueue::new(1000, DropPolicy::DropNewest, false, 0.9, 0.5));
    for seq in 0..120 {
        let _ = queue.offer(sample_record("modbus-1", seq));
    }

    let batcher = Batcher::new(
        queue,
        BatcherConfig {
            batch_size: 50,
            flush_interval: std::time::Duration::from_millis(200),
            max_send_records_per_sec: 10_000,
        },
    )
    .expect("valid batcher config");

    let first = batcher.next_batch().await;
    assert_eq!(first.len(), 50);

    let second = batcher.next_batch().await;
    assert_eq!(second.len(), 50);

    // Only 20 records remain; the batcher must flush them on the age bound
    // rather than waiting forever for a full batch.
    let third = batcher.next_batch().await;
    assert_eq!(third.len(), 20);
}

#[tokio::test]
async fn batched_records_reach_the_transport_in_dequeue_order() {
    let queue = Arc::new(BackpressureQueue::new(100, DropPolicy::DropNewest, false, 0.9, 0.5));
    for seq in 0..10 {
        let _ = queue.offer(sample_record("opcua-1", seq));
    }

    let batcher = Batcher::new(
        queue,
        BatcherConfig {
            batch_size: 10,
            flush_interval: std::time::Duration::from_millis(200),
            max_send_records_per_sec: 10_000,
        },
    )
    .expect("valid batcher config");

    let batch = batcher.next_batch().await;
    assert_eq!(batch.len(), 10);

    let transport = AcceptAllTransport;
    let acks = transport.send_batch("token", batch.records()).await.expect("accept-all transport never fails");

    assert_eq!(acks.len(), 10);
    assert!(acks.iter().all(|a| matches!(a, RecordAck::Accepted)));
    for (record, expected_seq) in batch.records().iter().zip(0..10) {
        assert_eq!(record.event_time_us, expected_seq);
    }
}
