use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Why the agent dropped a single observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DropReason {
    /// Dispatch sample without an owning queue.
    QueueUnavailable = 0,
    /// Dispatch sample whose queue reported depth 0.
    ZeroQueueDepth = 1,
    /// Request finalized without a matching issue record.
    MissingRecord = 2,
    /// Request state table at capacity for a new identity.
    TableFull = 3,
    /// Event channel had no room for the finalized record.
    ChannelFull = 4,
}

/// Number of [`DropReason`] variants, used for array sizing.
pub const DROP_REASON_CARDINALITY: usize = 5;

impl DropReason {
    /// Canonical metric/log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueueUnavailable => "queue_unavailable",
            Self::ZeroQueueDepth => "zero_queue_depth",
            Self::MissingRecord => "missing_record",
            Self::TableFull => "table_full",
            Self::ChannelFull => "channel_full",
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::QueueUnavailable),
            1 => Some(Self::ZeroQueueDepth),
            2 => Some(Self::MissingRecord),
            3 => Some(Self::TableFull),
            4 => Some(Self::ChannelFull),
            _ => None,
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::QueueUnavailable,
            Self::ZeroQueueDepth,
            Self::MissingRecord,
            Self::TableFull,
            Self::ChannelFull,
        ]
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free per-reason drop counters.
///
/// `snapshot()` reads and resets all counters, making it suitable for
/// periodic reporting without contention.
pub struct DropStats {
    counts: [AtomicU64; DROP_REASON_CARDINALITY],
}

impl DropStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Count one dropped observation.
    pub fn record(&self, reason: DropReason) {
        self.add(reason, 1);
    }

    /// Count `n` dropped observations, e.g. when folding in kernel counts.
    pub fn add(&self, reason: DropReason, n: u64) {
        if n == 0 {
            return;
        }
        if let Some(counter) = self.counts.get(reason as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current count for one reason, without resetting.
    pub fn get(&self, reason: DropReason) -> u64 {
        self.counts
            .get(reason as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(DropReason, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(reason) = DropReason::from_u8(i as u8) {
                    result.push((reason, v));
                }
            }
        }

        result
    }
}

impl Default for DropStats {
    fn default() -> Self {
        Self::new()
    }
}
