//! Windowed aggregation of delivered records into periodic reports.

pub mod report;
pub mod window;
pub mod writer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};

use crate::export::health::HealthMetrics;
use crate::tracer::event::Delivery;
use crate::tracer::Tracer;

use self::report::Report;
use self::window::{advance, WindowState};
use self::writer::ReportWriter;

/// Folds deliveries into fixed windows and writes one report per window.
pub struct Aggregator {
    window: Duration,
    state: WindowState,
    writers: Vec<ReportWriter>,
    health: Option<Arc<HealthMetrics>>,
    reports: u64,
}

impl Aggregator {
    pub fn new(window: Duration, writers: Vec<ReportWriter>) -> Self {
        Self {
            window,
            state: WindowState::Uninitialized,
            writers,
            health: None,
            reports: 0,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Reports emitted so far.
    pub fn reports(&self) -> u64 {
        self.reports
    }

    /// Fold one delivery. When it closes a window, the tracer counters are
    /// read and reset and the report is written.
    ///
    /// Returns the emitted report, if any. A write failure is logged and the
    /// loop carries on; a counter read failure is returned.
    pub fn fold<T: Tracer>(
        &mut self,
        tracer: &mut T,
        delivery: &Delivery,
    ) -> Result<Option<Report>> {
        if let Some(health) = &self.health {
            health.records_received.inc();
        }

        let (next, closed) = advance(self.state, delivery, self.window);
        self.state = next;

        let Some(closed) = closed else {
            return Ok(None);
        };

        let counters = tracer.take_counters()?;
        let report = Report::new(&closed, &counters);

        for writer in &mut self.writers {
            if let Err(e) = writer.write(&report) {
                warn!(writer = writer.name(), error = %e, "report write failed");
            }
        }

        self.reports += 1;
        if let Some(health) = &self.health {
            health.observe_report(&report, &counters);
        }

        info!(
            bytes = report.bytes,
            utilization = format_args!("{:.2}", report.utilization_percent),
            completions = report.completions,
            "window closed"
        );

        Ok(Some(report))
    }
}
