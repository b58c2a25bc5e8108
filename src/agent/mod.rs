use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Config, TracerKind};
use crate::export::health::HealthMetrics;
use crate::sink::writer::ReportWriter;
use crate::sink::Aggregator;
use crate::tracer::replay::ReplayTracer;
use crate::tracer::stats::DropStats;
use crate::tracer::{Source, Tracer};

#[cfg(feature = "bpf")]
use crate::tracer::bpf::{BpfConfig, BpfTracer};

/// How often agent-side drop counts are logged and exported.
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Why the consumption loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    /// The record source reported it is closed and drained.
    SourceClosed,
}

/// Agent orchestrates the tracer, the aggregator, and health metrics.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            cancel: CancellationToken::new(),
        })
    }

    /// Token that stops [`Agent::run`] when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start every component and consume records until cancelled or the
    /// source closes. Setup and poll failures are returned.
    pub async fn run(&mut self) -> Result<StopReason> {
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        let writers = self.build_writers()?;
        let mut aggregator =
            Aggregator::new(self.cfg.window.length, writers).with_health(Arc::clone(&self.health));

        let mut tracer = self.build_tracer()?;
        tracer
            .start()
            .await
            .with_context(|| format!("starting {} tracer", tracer.name()))?;

        self.spawn_drop_reporter(tracer.drop_stats());

        info!(
            tracer = tracer.name(),
            window = ?self.cfg.window.length,
            idle_wait = ?self.cfg.window.idle_wait,
            "agent started"
        );

        let result = consume(
            &mut tracer,
            &mut aggregator,
            self.cfg.window.idle_wait,
            &self.cancel,
        )
        .await;

        // Stop background tasks, then tear down regardless of the loop result.
        self.cancel.cancel();

        if let Err(e) = tracer.stop().await {
            error!(error = %e, "error stopping tracer");
        }

        // Flush whatever the drop reporter had not picked up yet.
        self.health.observe_drops(&tracer.drop_stats().snapshot());

        self.health.stop().await?;

        info!(reports = aggregator.reports(), "agent stopped");

        result
    }

    fn build_writers(&self) -> Result<Vec<ReportWriter>> {
        let mut writers = Vec::with_capacity(2);

        if !self.cfg.output.path.is_empty() {
            writers.push(ReportWriter::file(&self.cfg.output.path)?);
        }
        if self.cfg.output.stdout {
            writers.push(ReportWriter::Stdout);
        }

        for writer in &writers {
            debug!(writer = writer.name(), "report writer configured");
        }

        Ok(writers)
    }

    fn build_tracer(&self) -> Result<Source> {
        match self.cfg.tracer.kind {
            TracerKind::Replay => {
                let path = self
                    .cfg
                    .tracer
                    .replay_path
                    .clone()
                    .context("tracer.replay_path is required for the replay tracer")?;
                Ok(Source::Replay(ReplayTracer::new(
                    path,
                    self.cfg.probe(),
                    self.cfg.ring_buffer_size,
                )))
            }
            #[cfg(feature = "bpf")]
            TracerKind::Bpf => {
                let bpf_cfg = BpfConfig {
                    ring_buffer_size: u32::try_from(self.cfg.ring_buffer_size)
                        .context("ring_buffer_size exceeds u32")?,
                    table_capacity: u32::try_from(self.cfg.request_table.capacity)
                        .context("request_table.capacity exceeds u32")?,
                    evict_completed: self.cfg.request_table.evict_completed,
                };
                Ok(Source::Bpf(BpfTracer::new(
                    bpf_cfg,
                    Some(Arc::clone(&self.health)),
                )))
            }
            #[cfg(not(feature = "bpf"))]
            TracerKind::Bpf => {
                anyhow::bail!(
                    "the bpf tracer is not available: blkwatch was built without the `bpf` feature"
                )
            }
        }
    }

    /// Spawn background drop stats reporter.
    fn spawn_drop_reporter(&self, drops: Arc<DropStats>) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DROP_REPORT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = drops.snapshot();
                        let total: u64 = snapshot.iter().map(|(_, n)| n).sum();

                        if total == 0 {
                            continue;
                        }

                        info!(dropped = total, "agent drop stats (60s)");

                        for (reason, count) in &snapshot {
                            debug!(reason = %reason, count, "  by reason (60s)");
                        }

                        health.observe_drops(&snapshot);
                    }
                }
            }
        });
    }
}

/// The consumption loop: poll, fold, repeat.
///
/// A zero `idle_wait` busy-polls, yielding to the runtime between empty
/// polls.
pub async fn consume<T: Tracer>(
    tracer: &mut T,
    aggregator: &mut Aggregator,
    idle_wait: Duration,
    cancel: &CancellationToken,
) -> Result<StopReason> {
    let mut batch = Vec::with_capacity(256);

    loop {
        batch.clear();

        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(StopReason::Cancelled),
            polled = tracer.poll(&mut batch, idle_wait) => polled,
        };

        let Some(n) = polled.with_context(|| format!("polling {} tracer", tracer.name()))? else {
            info!(tracer = tracer.name(), "record source closed");
            return Ok(StopReason::SourceClosed);
        };

        for delivery in &batch {
            aggregator.fold(tracer, delivery)?;
        }

        if n == 0 && idle_wait.is_zero() {
            tokio::task::yield_now().await;
        }
    }
}
