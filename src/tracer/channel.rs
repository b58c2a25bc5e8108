//! Bounded, lossy-on-overflow record transport from the agent to the
//! aggregator.
//!
//! Any number of producers may push concurrently; a single consumer drains in
//! publish order. A push against a full channel is dropped without telling
//! the producer: exact totals come from the agent counters, not from channel
//! traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};

use super::event::{RequestRecord, RECORD_WIRE_SIZE};

/// Default channel capacity in bytes (1 MiB).
pub const DEFAULT_CAPACITY_BYTES: usize = 1024 * 1024;

/// Create a channel able to hold `capacity_bytes` worth of records.
pub fn channel(capacity_bytes: usize) -> (RecordProducer, RecordConsumer) {
    let slots = record_slots(capacity_bytes);
    let (tx, rx) = mpsc::channel(slots);
    let dropped = Arc::new(AtomicU64::new(0));

    (
        RecordProducer {
            tx,
            dropped: Arc::clone(&dropped),
        },
        RecordConsumer { rx, slots, dropped },
    )
}

/// Number of records that fit in `capacity_bytes` (at least one).
pub fn record_slots(capacity_bytes: usize) -> usize {
    (capacity_bytes / RECORD_WIRE_SIZE).max(1)
}

/// Producer half. Cheap to clone; every clone feeds the same consumer.
#[derive(Clone)]
pub struct RecordProducer {
    tx: mpsc::Sender<RequestRecord>,
    dropped: Arc<AtomicU64>,
}

impl RecordProducer {
    /// Best-effort publish. Returns whether the record was accepted; callers
    /// on the agent path ignore it.
    pub fn push(&self, record: RequestRecord) -> bool {
        match self.tx.try_send(record) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Outcome of a non-blocking receive.
#[derive(Debug, PartialEq, Eq)]
pub enum Recv {
    Record(RequestRecord),
    Empty,
    /// Every producer is gone and the channel is drained.
    Closed,
}

/// Single consumer half.
pub struct RecordConsumer {
    rx: mpsc::Receiver<RequestRecord>,
    slots: usize,
    dropped: Arc<AtomicU64>,
}

impl RecordConsumer {
    /// Zero-wait receive.
    pub fn try_recv(&mut self) -> Recv {
        match self.rx.try_recv() {
            Ok(record) => Recv::Record(record),
            Err(TryRecvError::Empty) => Recv::Empty,
            Err(TryRecvError::Disconnected) => Recv::Closed,
        }
    }

    /// Wait at most `timeout` for the next record.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(record)) => Recv::Record(record),
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Empty,
        }
    }

    /// Capacity in records.
    pub fn capacity(&self) -> usize {
        self.slots
    }

    /// Records currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Total records dropped on a full channel since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::RequestId;

    fn rec(id: u64) -> RequestRecord {
        RequestRecord {
            id: RequestId(id),
            start_ns: id * 10,
            end_ns: id * 10 + 5,
            payload_bytes: 4096,
        }
    }

    #[test]
    fn test_capacity_in_records() {
        assert_eq!(record_slots(DEFAULT_CAPACITY_BYTES), 32 * 1024);
        assert_eq!(record_slots(64), 2);
        assert_eq!(record_slots(0), 1);
    }

    #[test]
    fn test_fifo_delivery() {
        let (tx, mut rx) = channel(1024);
        for id in 1..=5 {
            assert!(tx.push(rec(id)));
        }
        for id in 1..=5 {
            assert_eq!(rx.try_recv(), Recv::Record(rec(id)));
        }
        assert_eq!(rx.try_recv(), Recv::Empty);
    }

    #[test]
    fn test_full_channel_drops_silently() {
        let (tx, mut rx) = channel(2 * RECORD_WIRE_SIZE);
        assert_eq!(rx.capacity(), 2);

        assert!(tx.push(rec(1)));
        assert!(tx.push(rec(2)));
        assert!(!tx.push(rec(3)));
        assert_eq!(rx.dropped(), 1);
        assert_eq!(rx.len(), 2);

        assert_eq!(rx.try_recv(), Recv::Record(rec(1)));
        assert_eq!(rx.try_recv(), Recv::Record(rec(2)));
        assert_eq!(rx.try_recv(), Recv::Empty);
    }

    #[test]
    fn test_closed_after_producers_dropped() {
        let (tx, mut rx) = channel(1024);
        tx.push(rec(1));
        drop(tx);
        assert_eq!(rx.try_recv(), Recv::Record(rec(1)));
        assert_eq!(rx.try_recv(), Recv::Closed);
    }

    #[test]
    fn test_concurrent_producers() {
        let (tx, mut rx) = channel(1024 * RECORD_WIRE_SIZE);
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        tx.push(rec(t * 1000 + i + 1));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut received = 0;
        while let Recv::Record(_) = rx.try_recv() {
            received += 1;
        }
        assert_eq!(received, 400);
        assert_eq!(rx.dropped(), 0);
    }

    #[tokio::test]
    async fn test_recv_timeout_returns_empty() {
        let (_tx, mut rx) = channel(1024);
        let got = rx.recv_timeout(Duration::from_millis(5)).await;
        assert_eq!(got, Recv::Empty);
    }
}
