use std::fmt;

use crate::tracer::event::CounterSnapshot;

use super::window::ClosedWindow;

/// Separator written after every report.
pub const SEPARATOR: &str =
    "===============================================================";

/// One emitted window report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Report {
    /// Raw byte total of the window.
    pub bytes: u64,
    pub utilization_percent: f64,
    /// Completions counted by the agent during the window.
    pub completions: u32,
    /// `None` when no dispatch sample was taken.
    pub average_queue_depth: Option<f64>,
    pub elapsed_ns: u64,
}

impl Report {
    pub fn new(window: &ClosedWindow, counters: &CounterSnapshot) -> Self {
        Self {
            bytes: window.bytes,
            utilization_percent: window.utilization_percent(),
            completions: counters.completions,
            average_queue_depth: counters.issue.average_depth(),
            elapsed_ns: window.elapsed_ns,
        }
    }
}

/// Plain-text layout, separator line included.
impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Accumulated bytes: {} bytes", self.bytes)?;
        writeln!(f, "Disk utilization: {:.2}%", self.utilization_percent)?;
        writeln!(f, "I/O requests: {}", self.completions)?;
        if let Some(depth) = self.average_queue_depth {
            writeln!(f, "Average queue depth: {depth:.2}")?;
        }
        writeln!(f, "{SEPARATOR}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::IssueSample;

    fn window() -> ClosedWindow {
        ClosedWindow {
            bytes: 1_048_576,
            busy_ns: 2_500_000_000,
            elapsed_ns: 5_000_000_000,
        }
    }

    #[test]
    fn test_report_text() {
        let counters = CounterSnapshot {
            completions: 256,
            issue: IssueSample {
                queue_depth_sum: 70,
                event_count: 4,
            },
        };
        let text = Report::new(&window(), &counters).to_string();
        let expected = format!(
            "Accumulated bytes: 1048576 bytes\n\
             Disk utilization: 50.00%\n\
             I/O requests: 256\n\
             Average queue depth: 17.50\n\
             {SEPARATOR}\n"
        );
        assert_eq!(text, expected);
    }

    #[test]
    fn test_queue_depth_line_omitted_without_samples() {
        let counters = CounterSnapshot {
            completions: 3,
            issue: IssueSample::default(),
        };
        let report = Report::new(&window(), &counters);
        assert_eq!(report.average_queue_depth, None);

        let text = report.to_string();
        assert!(!text.contains("queue depth"));
        assert_eq!(text.lines().count(), 4);
        assert_eq!(text.lines().last(), Some(SEPARATOR));
    }
}
