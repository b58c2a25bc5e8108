//! In-process instrumentation agent.
//!
//! Mirrors the four kernel observation points (request issued, dispatch
//! sampled, completion notified, request finalized) on top of lock-free
//! shared state, so the agent semantics can run and be tested without BPF.
//! Handlers may be called concurrently from any number of threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::clock::NanoClock;

use super::channel::RecordProducer;
use super::event::{CounterSnapshot, IssueSample, RequestId, RequestRecord};
use super::stats::{DropReason, DropStats};

/// Default request table capacity (matches the kernel hash map).
pub const DEFAULT_TABLE_CAPACITY: usize = 1024;

/// Dispatch queue metadata visible at sample time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub depth: u32,
}

/// The observable parts of one block request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub id: RequestId,
    pub payload_bytes: u64,
    /// Owning dispatch queue, if the request is attached to one.
    pub queue: Option<QueueInfo>,
}

/// Per-in-flight-request records keyed by identity.
///
/// Finalized entries stay in place until a new identity arrives at a full
/// table, which then evicts the oldest finalized entry. In-flight entries are
/// never evicted.
pub struct RequestTable {
    map: DashMap<RequestId, RequestRecord>,
    len: AtomicUsize,
    capacity: usize,
    /// Finalized (id, end_ns) pairs, oldest first. Pairs whose entry was
    /// reissued or removed since are stale and skipped on eviction.
    finalized: Mutex<VecDeque<(RequestId, u64)>>,
}

impl RequestTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            map: DashMap::with_capacity(capacity.min(4096)),
            len: AtomicUsize::new(0),
            capacity,
            finalized: Mutex::new(VecDeque::new()),
        }
    }

    /// Insert or overwrite the record for `record.id`. Returns false when a
    /// new identity does not fit and no finalized entry can be evicted.
    pub fn upsert(&self, record: RequestRecord) -> bool {
        loop {
            if self.try_upsert(record) {
                return true;
            }
            if !self.evict_oldest_finalized() {
                return false;
            }
        }
    }

    fn try_upsert(&self, record: RequestRecord) -> bool {
        match self.map.entry(record.id) {
            Entry::Occupied(mut e) => {
                e.insert(record);
                true
            }
            Entry::Vacant(e) => {
                let reserved = self
                    .len
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < self.capacity).then_some(n + 1)
                    })
                    .is_ok();
                if reserved {
                    e.insert(record);
                }
                reserved
            }
        }
    }

    fn evict_oldest_finalized(&self) -> bool {
        loop {
            let Some((id, end_ns)) = self.finalized.lock().pop_front() else {
                return false;
            };
            if self
                .map
                .remove_if(&id, |_, r| r.end_ns == end_ns)
                .is_some()
            {
                self.len.fetch_sub(1, Ordering::AcqRel);
                return true;
            }
        }
    }

    fn track_finalized(&self, id: RequestId, end_ns: u64) {
        // end_ns 0 marks an in-flight entry.
        if end_ns == 0 {
            return;
        }
        let mut finalized = self.finalized.lock();
        finalized.push_back((id, end_ns));

        // Recycled ids leave stale pairs behind; drop them once they pile up.
        if finalized.len() > self.capacity.saturating_mul(2) {
            finalized.retain(|&(id, end_ns)| {
                self.map.get(&id).is_some_and(|r| r.end_ns == end_ns)
            });
        }
    }

    /// Stamp the completion time in place and return the finalized record.
    pub fn finalize(&self, id: RequestId, end_ns: u64) -> Option<RequestRecord> {
        let record = {
            let mut entry = self.map.get_mut(&id)?;
            entry.end_ns = end_ns;
            *entry
        };
        self.track_finalized(id, end_ns);
        Some(record)
    }

    pub fn get(&self, id: RequestId) -> Option<RequestRecord> {
        self.map.get(&id).map(|r| *r)
    }

    pub fn remove(&self, id: RequestId) -> Option<RequestRecord> {
        let (_, record) = self.map.remove(&id)?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Queue-depth sum and sample count packed into one atomic slot.
#[derive(Debug, Default)]
pub struct IssueAccumulator {
    slot: AtomicU64,
}

impl IssueAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one depth sample. Compare-and-swap, so concurrent samples are
    /// never lost.
    pub fn merge(&self, depth: u32) {
        let mut current = self.slot.load(Ordering::Acquire);
        loop {
            let next = IssueSample::unpack(current).merge(depth).pack();
            match self.slot.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn load(&self) -> IssueSample {
        IssueSample::unpack(self.slot.load(Ordering::Acquire))
    }

    /// Read and zero in one step.
    pub fn take(&self) -> IssueSample {
        IssueSample::unpack(self.slot.swap(0, Ordering::AcqRel))
    }
}

/// Completion notifications since the last reset.
#[derive(Debug, Default)]
pub struct CompletionCounter {
    count: AtomicU32,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn load(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Read and zero in one step.
    pub fn take(&self) -> u32 {
        self.count.swap(0, Ordering::AcqRel)
    }
}

/// Agent tuning.
#[derive(Debug, Clone, Copy)]
pub struct ProbeConfig {
    pub table_capacity: usize,
    /// Remove a request's entry once its record is published.
    pub evict_completed: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            table_capacity: DEFAULT_TABLE_CAPACITY,
            evict_completed: false,
        }
    }
}

/// The instrumentation agent: request table, both counters, and the
/// producer side of the event channel.
pub struct Probe {
    table: RequestTable,
    issue: IssueAccumulator,
    completions: CompletionCounter,
    completion_errors: AtomicU64,
    producer: RecordProducer,
    clock: Arc<dyn NanoClock>,
    drops: Arc<DropStats>,
    evict_completed: bool,
}

impl Probe {
    pub fn new(cfg: ProbeConfig, producer: RecordProducer, clock: Arc<dyn NanoClock>) -> Self {
        Self {
            table: RequestTable::new(cfg.table_capacity),
            issue: IssueAccumulator::new(),
            completions: CompletionCounter::new(),
            completion_errors: AtomicU64::new(0),
            producer,
            clock,
            drops: Arc::new(DropStats::new()),
            evict_completed: cfg.evict_completed,
        }
    }

    /// Request issued: start tracking it, replacing any stale entry.
    pub fn on_issue_start(&self, req: &BlockRequest) {
        let record = RequestRecord::issued(req.id, self.clock.now_ns(), req.payload_bytes);
        if !self.table.upsert(record) {
            debug!(request = %req.id, capacity = self.table.capacity(), "request table full");
            self.drops.record(DropReason::TableFull);
        }
    }

    /// Dispatch sampled: fold the owning queue's depth into the accumulator.
    pub fn on_queue_sample(&self, req: &BlockRequest) {
        let Some(queue) = req.queue else {
            debug!(request = %req.id, "dispatch sample without queue");
            self.drops.record(DropReason::QueueUnavailable);
            return;
        };
        if queue.depth == 0 {
            debug!(request = %req.id, "dispatch sample with zero queue depth");
            self.drops.record(DropReason::ZeroQueueDepth);
            return;
        }
        self.issue.merge(queue.depth);
    }

    /// Completion notified. Counts every notification; `error` is tallied
    /// separately and `bytes` is not used.
    pub fn on_completion(&self, req: &BlockRequest, error: i32, bytes: u32) {
        self.completions.increment();
        if error != 0 {
            self.completion_errors.fetch_add(1, Ordering::Relaxed);
            debug!(request = %req.id, error, bytes, "completion reported error");
        }
    }

    /// Request finalized: stamp the end time and publish the record.
    pub fn on_request_done(&self, req: &BlockRequest) {
        let Some(record) = self.table.finalize(req.id, self.clock.now_ns()) else {
            debug!(request = %req.id, "no issue record for finalized request");
            self.drops.record(DropReason::MissingRecord);
            return;
        };

        if !self.producer.push(record) {
            self.drops.record(DropReason::ChannelFull);
        }

        if self.evict_completed {
            self.table.remove(req.id);
        }
    }

    /// Non-resetting read of both counters.
    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            completions: self.completions.load(),
            issue: self.issue.load(),
        }
    }

    /// Read and reset both counters.
    pub fn take_counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            completions: self.completions.take(),
            issue: self.issue.take(),
        }
    }

    pub fn completion_errors(&self) -> u64 {
        self.completion_errors.load(Ordering::Relaxed)
    }

    pub fn table(&self) -> &RequestTable {
        &self.table
    }

    pub fn drops(&self) -> &Arc<DropStats> {
        &self.drops
    }
}
