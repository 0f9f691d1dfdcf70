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

//! The backpressure queue: an in-memory bounded FIFO with a configurable
//! drop policy, whose overflow spills to an encrypted, append-only on-disk
//! spool organized per source.

pub mod crypto;
pub mod dlq;
pub mod spool;

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use record::ProtocolRecord;
use tokio::sync::Notify;

use crate::spool::Spool;

/// Errors raised by the backpressure queue and its spool integration.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The spool rejected a write.
    #[error("spool error: {0}")]
    Spool(#[from] spool::Error),
}

/// Policy applied when the in-memory queue is at capacity and spooling
/// cannot absorb the excess (spool disabled, or already diverting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    /// Refuse the new record; the existing queue contents are unchanged.
    DropNewest,
    /// Evict the head of the queue (oldest record) to make room for the
    /// new one.
    DropOldest,
}

/// Running counters for the queue, surfaced on the metrics endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounters {
    /// Records refused under `drop_newest`.
    pub dropped_newest: u64,
    /// Records evicted under `drop_oldest`.
    pub dropped_oldest: u64,
    /// Records diverted to the spool instead of being dropped.
    pub spooled: u64,
    /// Records drained back from the spool into the live queue.
    pub drained_from_spool: u64,
}

/// The outcome of a single `offer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// The record was appended to the in-memory queue.
    Accepted,
    /// The record was refused under `drop_newest`.
    DroppedNewest,
    /// An older record was evicted to the spool (or discarded) to admit
    /// this one under `drop_oldest`.
    DroppedOldest,
    /// The record was diverted to the spool because the queue is at or
    /// above its high watermark.
    Spooled,
}

fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

struct State {
    items: VecDeque<ProtocolRecord>,
}

/// A bounded FIFO of records with configurable drop policy and optional
/// disk-spool overflow.
pub struct BackpressureQueue {
    capacity: usize,
    high_watermark: f64,
    low_watermark: f64,
    drop_policy: DropPolicy,
    spool_enabled: bool,
    state: Mutex<State>,
    counters: Mutex<QueueCounters>,
    notify: Notify,
}

impl BackpressureQueue {
    /// Creates a new backpressure queue. `high_watermark`/`low_watermark`
    /// are fractions of `capacity` (e.g. `0.9`/`0.5`).
    pub fn new(capacity: usize, drop_policy: DropPolicy, spool_enabled: bool, high_watermark: f64, low_watermark: f64) -> Self {
        Self {
            capacity,
            high_watermark,
            low_watermark,
            drop_policy,
            spool_enabled,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
            }),
            counters: Mutex::new(QueueCounters::default()),
            notify: Notify::new(),
        }
    }

    fn high_watermark_count(&self) -> usize {
        ((self.capacity as f64) * self.high_watermark) as usize
    }

    fn low_watermark_count(&self) -> usize {
        ((self.capacity as f64) * self.low_watermark) as usize
    }

    /// Current number of records held in memory.
    pub fn depth(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").items.len()
    }

    /// Whether the in-memory queue is at or above its high watermark.
    pub fn is_above_high_watermark(&self) -> bool {
        self.depth() >= self.high_watermark_count()
    }

    /// Whether the in-memory queue is at or below its low watermark.
    pub fn is_below_low_watermark(&self) -> bool {
        self.depth() <= self.low_watermark_count()
    }

    /// A snapshot of the running counters.
    pub fn counters(&self) -> QueueCounters {
        *self.counters.lock().expect("counters lock poisoned")
    }

    /// Offers a record. Non-blocking. Returns which of accept / drop /
    /// spool occurred; when `Spooled` or an evicted `DroppedOldest` record
    /// needs persisting, the caller is responsible for writing it to the
    /// spool via the returned record (see `offer_with_spool`).
    pub fn offer(&self, record: ProtocolRecord) -> (OfferOutcome, Option<ProtocolRecord>) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        let record = record.with_ingest_time(now_us());

        if self.spool_enabled && state.items.len() >= self.high_watermark_count() {
            let mut counters = self.counters.lock().expect("counters lock poisoned");
            counters.spooled += 1;
            return (OfferOutcome::Spooled, Some(record));
        }

        if state.items.len() < self.capacity {
            state.items.push_back(record);
            drop(state);
            self.notify.notify_one();
            return (OfferOutcome::Accepted, None);
        }

        match self.drop_policy {
            DropPolicy::DropNewest => {
                self.counters.lock().expect("counters lock poisoned").dropped_newest += 1;
                (OfferOutcome::DroppedNewest, None)
            }
            DropPolicy::DropOldest => {
                let evicted = state.items.pop_front();
                state.items.push_back(record);
                drop(state);
                self.notify.notify_one();
                self.counters.lock().expect("counters lock poisoned").dropped_oldest += 1;
                (OfferOutcome::DroppedOldest, evicted)
            }
        }
    }

    /// Re-injects a record drained from the spool directly into the
    /// in-memory queue, bypassing the high-watermark diversion check.
    /// Returns `false` if the queue was already at capacity.
    pub fn offer_drained(&self, record: ProtocolRecord) -> bool {
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.items.len() >= self.capacity {
            return false;
        }
        state.items.push_back(record);
        drop(state);
        self.notify.notify_one();
        self.counters.lock().expect("counters lock poisoned").drained_from_spool += 1;
        true
    }

    /// Blocking take with a timeout, used by the batcher. Returns `None`
    /// on timeout with nothing available.
    pub async fn take(&self, timeout: Duration) -> Option<ProtocolRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(record) = state.items.pop_front() {
                    return Some(record);
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return None;
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(deadline - now) => return None,
            }
        }
    }
}

/// Serializes a record for spool/DLQ storage.
pub fn serialize_for_spool(record: &ProtocolRecord) -> Vec<u8> {
    serde_json::to_vec(record).unwrap_or_default()
}

/// Deserializes a record previously written with `serialize_for_spool`.
pub fn deserialize_from_spool(bytes: &[u8]) -> Result<ProtocolRecord, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Writes a record that the queue decided to spool (either `Spooled` or an
/// evicted `drop_oldest` victim) into the given spool.
pub async fn spool_record(spool: &mut Spool, record: &ProtocolRecord) -> Result<spool::SpoolAddress, Error> {
    let bytes = serialize_for_spool(record);
    Ok(spool.append(&record.source_name, &bytes).await?)
}

/// Drains the oldest available spool segment for `source_name` and
/// re-injects its records into `queue` in (segment, offset) order, per the
/// configured canonical drain-ordering (spooled records ahead of newly
/// produced ones for the same source). Returns the drained segment's
/// sequence number so the caller can decide when it is safe to delete
/// (only once every record's delivery has been acknowledged by the sink).
pub async fn drain_oldest_segment(
    spool: &Spool,
    queue: &BackpressureQueue,
    source_name: &str,
) -> Result<Option<u64>, Error> {
    let segments = spool.list_segments(source_name).await?;
    let Some(oldest) = segments.first().copied() else {
        return Ok(None);
    };

    let raw_records = spool.read_segment(source_name, oldest).await?;
    for bytes in raw_records {
        if let Ok(record) = deserialize_from_spool(&bytes) {
            if !queue.offer_drained(record) {
                // Queue filled up mid-drain; stop early, the segment stays
                // for the next drain pass.
                return Ok(None);
            }
        }
    }

    Ok(Some(oldest))
}

#[cfg(test)]
mod test {
    use super::*;
    use record::{ProtocolKind, Value};

    fn sample(i: i64) -> ProtocolRecord {
        ProtocolRecord::new(i, "plc-1", "e", ProtocolKind::Opcua, "t", Value::Int64(i), 0, "Good").unwrap()
    }

    #[test]
    fn drop_newest_keeps_prefix_under_saturation() {
        let queue = BackpressureQueue::new(3, DropPolicy::DropNewest, false, 0.9, 0.5);
        let mut accepted = Vec::new();
        let mut dropped = 0;

        for i in 0..5 {
            let (outcome, _) = queue.offer(sample(i));
            match outcome {
                OfferOutcome::Accepted => accepted.push(i),
                OfferOutcome::DroppedNewest => dropped += 1,
                _ => panic!("unexpected outcome"),
            }
        }

        assert_eq!(accepted, vec![0, 1, 2]);
        assert_eq!(dropped, 2);
        assert_eq!(queue.counters().dropped_newest, 2);
    }

    #[test]
    fn drop_oldest_keeps_suffix_under_saturation() {
        let queue = BackpressureQueue::new(3, DropPolicy::DropOldest, false, 0.9, 0.5);
        for i in 0..5 {
            let _ = queue.offer(sample(i));
        }

        let mut remaining = Vec::new();
        while let Some(record) = futures::executor::block_on(queue.take(Duration::from_millis(1))) {
            remaining.push(record.event_time_us);
        }

        assert_eq!(remaining, vec![2, 3, 4]);
        assert_eq!(queue.counters().dropped_oldest, 2);
    }

    #[test]
    fn in_memory_depth_never_exceeds_capacity() {
        let queue = BackpressureQueue::new(3, DropPolicy::DropNewest, true, 0.9, 0.5);
        for i in 0..10 {
            let _ = queue.offer(sample(i));
            assert!(queue.depth() <= 3);
        }
    }

    #[tokio::test]
    async fn spool_diversion_engages_at_high_watermark() {
        let queue = BackpressureQueue::new(10, DropPolicy::DropNewest, true, 0.5, 0.2);
        for i in 0..4 {
            let (outcome, _) = queue.offer(sample(i));
            assert_eq!(outcome, OfferOutcome::Accepted);
        }

        let (outcome, spooled) = queue.offer(sample(4));
        assert_eq!(outcome, OfferOutcome::Spooled);
        assert!(spooled.is_some());
        assert_eq!(queue.counters().spooled, 1);
    }
}
