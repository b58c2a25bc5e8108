use std::fmt;

/// Size of a [`RequestRecord`] on the wire (matches `struct request_record`
/// in `bpf/include/blkwatch.h`).
pub const RECORD_WIRE_SIZE: usize = 32;

/// Opaque identity of an in-flight block request.
///
/// The kernel agent uses the address of `struct request`, so an identity can
/// alias two distinct requests once the kernel recycles the object. Replayed
/// traces carry their own ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Per-request record, created at issue and finalized at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRecord {
    pub id: RequestId,
    /// Monotonic issue timestamp in nanoseconds.
    pub start_ns: u64,
    /// Monotonic completion timestamp in nanoseconds, 0 until finalized.
    pub end_ns: u64,
    pub payload_bytes: u64,
}

impl RequestRecord {
    /// Record created at issue time.
    pub fn issued(id: RequestId, start_ns: u64, payload_bytes: u64) -> Self {
        Self {
            id,
            start_ns,
            end_ns: 0,
            payload_bytes,
        }
    }

    /// Time the device spent on this request.
    pub fn busy_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    /// Whether both timestamps were captured.
    pub fn has_timestamps(&self) -> bool {
        self.start_ns > 0 && self.end_ns > 0
    }

    /// Encode into the fixed little-endian wire layout.
    pub fn to_bytes(&self) -> [u8; RECORD_WIRE_SIZE] {
        let mut out = [0u8; RECORD_WIRE_SIZE];
        out[0..8].copy_from_slice(&self.start_ns.to_le_bytes());
        out[8..16].copy_from_slice(&self.end_ns.to_le_bytes());
        out[16..24].copy_from_slice(&self.payload_bytes.to_le_bytes());
        out[24..32].copy_from_slice(&self.id.0.to_le_bytes());
        out
    }
}

/// A record as handed to the aggregator, stamped on the consumer clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub record: RequestRecord,
    pub arrival_ns: u64,
}

/// Dispatch-side queue depth samples, packed into one 64-bit slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IssueSample {
    pub queue_depth_sum: u32,
    pub event_count: u32,
}

impl IssueSample {
    /// Depth sum in the high half, event count in the low half.
    pub const fn pack(self) -> u64 {
        ((self.queue_depth_sum as u64) << 32) | self.event_count as u64
    }

    pub const fn unpack(raw: u64) -> Self {
        Self {
            queue_depth_sum: (raw >> 32) as u32,
            event_count: (raw & 0xFFFF_FFFF) as u32,
        }
    }

    /// Merge one depth observation, wrapping each half independently.
    pub const fn merge(self, depth: u32) -> Self {
        Self {
            queue_depth_sum: self.queue_depth_sum.wrapping_add(depth),
            event_count: self.event_count.wrapping_add(1),
        }
    }

    /// Sum two partitions of the accumulator.
    pub const fn combine(self, other: Self) -> Self {
        Self {
            queue_depth_sum: self.queue_depth_sum.wrapping_add(other.queue_depth_sum),
            event_count: self.event_count.wrapping_add(other.event_count),
        }
    }

    /// Mean observed depth, or `None` when nothing was sampled.
    pub fn average_depth(&self) -> Option<f64> {
        if self.event_count == 0 {
            return None;
        }
        Some(f64::from(self.queue_depth_sum) / f64::from(self.event_count))
    }
}

/// Point-in-time read of both agent counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub completions: u32,
    pub issue: IssueSample,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_sample_packing() {
        let sample = IssueSample {
            queue_depth_sum: 96,
            event_count: 3,
        };
        let raw = sample.pack();
        assert_eq!(raw >> 32, 96);
        assert_eq!(raw & 0xFFFF_FFFF, 3);
        assert_eq!(IssueSample::unpack(raw), sample);
    }

    #[test]
    fn test_issue_sample_merge_wraps_halves_independently() {
        let sample = IssueSample {
            queue_depth_sum: u32::MAX,
            event_count: u32::MAX,
        }
        .merge(2);
        assert_eq!(sample.queue_depth_sum, 1);
        assert_eq!(sample.event_count, 0);
    }

    #[test]
    fn test_combine_partitions() {
        let a = IssueSample::default().merge(8).merge(4);
        let b = IssueSample::default().merge(20);
        let total = a.combine(b);
        assert_eq!(total.queue_depth_sum, 32);
        assert_eq!(total.event_count, 3);
        assert_eq!(IssueSample::default().combine(a), a);
    }

    #[test]
    fn test_average_depth() {
        assert_eq!(IssueSample::default().average_depth(), None);

        let sample = IssueSample::default().merge(32).merge(16).merge(0);
        assert_eq!(sample.average_depth(), Some(16.0));
    }

    #[test]
    fn test_busy_ns_saturates() {
        let mut rec = RequestRecord::issued(RequestId(1), 500, 4096);
        assert_eq!(rec.busy_ns(), 0);
        assert!(!rec.has_timestamps());

        rec.end_ns = 1_250;
        assert_eq!(rec.busy_ns(), 750);
        assert!(rec.has_timestamps());
    }
}
