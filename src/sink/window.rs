//! Fixed-length time windows over delivered records.
//!
//! [`advance`] is a pure transition: it never touches the agent counters or
//! the output, so rollover can be tested directly.

use std::time::Duration;

use crate::tracer::event::Delivery;

/// Default window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// Aggregator window bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WindowState {
    /// No record delivered yet.
    #[default]
    Uninitialized,
    Accumulating {
        /// Arrival time of the record that opened the window.
        start_ns: u64,
        bytes: u64,
        busy_ns: u64,
    },
}

/// Totals of a window that just closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosedWindow {
    /// Raw byte total over the window, not divided by time.
    pub bytes: u64,
    pub busy_ns: u64,
    pub elapsed_ns: u64,
}

impl ClosedWindow {
    /// Summed busy time over elapsed time, in percent. Not clamped:
    /// overlapping requests push this past 100.
    pub fn utilization_percent(&self) -> f64 {
        if self.elapsed_ns == 0 {
            return 0.0;
        }
        self.busy_ns as f64 / self.elapsed_ns as f64 * 100.0
    }
}

/// Fold one delivery into the window.
///
/// The first delivery opens a window. A delivery arriving `window` or more
/// after the window opened closes it with the totals accumulated *before*
/// it; that delivery then opens the next window with its bytes and zero busy
/// time.
pub fn advance(
    state: WindowState,
    delivery: &Delivery,
    window: Duration,
) -> (WindowState, Option<ClosedWindow>) {
    let record = &delivery.record;
    let now = delivery.arrival_ns;

    match state {
        WindowState::Uninitialized => (
            WindowState::Accumulating {
                start_ns: now,
                bytes: record.payload_bytes,
                busy_ns: record.busy_ns(),
            },
            None,
        ),
        WindowState::Accumulating {
            start_ns,
            bytes,
            busy_ns,
        } => {
            let elapsed_ns = now.saturating_sub(start_ns);
            if u128::from(elapsed_ns) < window.as_nanos() {
                let busy_ns = if record.has_timestamps() {
                    busy_ns.saturating_add(record.busy_ns())
                } else {
                    busy_ns
                };
                return (
                    WindowState::Accumulating {
                        start_ns,
                        bytes: bytes.saturating_add(record.payload_bytes),
                        busy_ns,
                    },
                    None,
                );
            }

            (
                WindowState::Accumulating {
                    start_ns: now,
                    bytes: record.payload_bytes,
                    busy_ns: 0,
                },
                Some(ClosedWindow {
                    bytes,
                    busy_ns,
                    elapsed_ns,
                }),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::{RequestId, RequestRecord};

    const SEC: u64 = 1_000_000_000;

    fn delivery(arrival_ns: u64, bytes: u64, busy_ns: u64) -> Delivery {
        Delivery {
            record: RequestRecord {
                id: RequestId(arrival_ns),
                start_ns: 1_000,
                end_ns: 1_000 + busy_ns,
                payload_bytes: bytes,
            },
            arrival_ns,
        }
    }

    #[test]
    fn test_first_delivery_seeds_without_report() {
        let (state, closed) = advance(
            WindowState::Uninitialized,
            &delivery(0, 100, 10),
            DEFAULT_WINDOW,
        );
        assert!(closed.is_none());
        assert_eq!(
            state,
            WindowState::Accumulating {
                start_ns: 0,
                bytes: 100,
                busy_ns: 10
            }
        );
    }

    #[test]
    fn test_five_second_scenario() {
        let w = DEFAULT_WINDOW;
        let (s, c) = advance(WindowState::Uninitialized, &delivery(0, 100, 10), w);
        assert!(c.is_none());

        let (s, c) = advance(s, &delivery(SEC, 200, 20), w);
        assert!(c.is_none());
        assert_eq!(
            s,
            WindowState::Accumulating {
                start_ns: 0,
                bytes: 300,
                busy_ns: 30
            }
        );

        let (s, c) = advance(s, &delivery(6 * SEC, 300, 30), w);
        let closed = c.expect("window should close");
        assert_eq!(closed.bytes, 300);
        assert_eq!(closed.busy_ns, 30);
        assert_eq!(closed.elapsed_ns, 6 * SEC);
        let expected = 30.0 / 6e9 * 100.0;
        assert!((closed.utilization_percent() - expected).abs() < 1e-15);

        assert_eq!(
            s,
            WindowState::Accumulating {
                start_ns: 6 * SEC,
                bytes: 300,
                busy_ns: 0
            }
        );
    }

    #[test]
    fn test_boundary_is_inclusive() {
        let w = Duration::from_secs(5);
        let (s, _) = advance(WindowState::Uninitialized, &delivery(10, 1, 1), w);

        let (s, c) = advance(s, &delivery(10 + 5 * SEC - 1, 1, 1), w);
        assert!(c.is_none());

        let (_, c) = advance(s, &delivery(10 + 5 * SEC, 1, 1), w);
        assert!(c.is_some());
    }

    #[test]
    fn test_bytes_sum_without_boundary() {
        let w = Duration::from_secs(3600);
        let sizes = [512u64, 4096, 8192, 1, 65536, 0, 131072];
        let mut state = WindowState::Uninitialized;
        for (i, size) in sizes.iter().enumerate() {
            let (next, closed) = advance(state, &delivery(i as u64 * SEC, *size, 5), w);
            assert!(closed.is_none());
            state = next;
        }
        let WindowState::Accumulating { bytes, busy_ns, .. } = state else {
            panic!("expected accumulating");
        };
        assert_eq!(bytes, sizes.iter().sum::<u64>());
        assert_eq!(busy_ns, 5 * sizes.len() as u64);
    }

    #[test]
    fn test_missing_timestamps_do_not_add_busy_time() {
        let w = DEFAULT_WINDOW;
        let (s, _) = advance(WindowState::Uninitialized, &delivery(0, 10, 10), w);
        let mut d = delivery(SEC, 20, 0);
        d.record.start_ns = 0;
        d.record.end_ns = 400;
        let (s, _) = advance(s, &d, w);
        assert_eq!(
            s,
            WindowState::Accumulating {
                start_ns: 0,
                bytes: 30,
                busy_ns: 10
            }
        );
    }

    #[test]
    fn test_utilization_can_exceed_hundred_percent() {
        let closed = ClosedWindow {
            bytes: 0,
            busy_ns: 12 * SEC,
            elapsed_ns: 5 * SEC,
        };
        assert!((closed.utilization_percent() - 240.0).abs() < 1e-9);
    }

    #[test]
    fn test_arrival_before_window_start_does_not_close() {
        let w = DEFAULT_WINDOW;
        let (s, _) = advance(WindowState::Uninitialized, &delivery(10 * SEC, 1, 1), w);
        let (_, c) = advance(s, &delivery(SEC, 1, 1), w);
        assert!(c.is_none());
    }
}
