//! Trace replay: feeds recorded kernel observations through the in-process
//! agent.
//!
//! Input is JSON lines, one observation per line:
//!
//! ```text
//! {"kind":"issue","ts_ns":1000,"request":1,"bytes":4096}
//! {"kind":"dispatch","ts_ns":1100,"request":1,"queue_depth":32}
//! {"kind":"complete","ts_ns":9000,"request":1,"error":0,"bytes":4096}
//! {"kind":"done","ts_ns":9050,"request":1}
//! ```
//!
//! The agent clock follows the trace timestamps, and every record published
//! by a `done` observation is delivered with that timestamp as its arrival
//! time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::{info, warn};

use crate::clock::{ManualClock, NanoClock};

use super::channel::{self, RecordConsumer, Recv};
use super::event::{CounterSnapshot, Delivery, RequestId};
use super::probe::{BlockRequest, Probe, ProbeConfig, QueueInfo};
use super::stats::DropStats;
use super::Tracer;

/// Lines processed per `poll` call before yielding back to the loop. A poll
/// also returns as soon as a `done` line delivers a record.
const LINES_PER_POLL: usize = 256;

type TraceLines = Lines<Box<dyn AsyncBufRead + Unpin + Send>>;

/// One recorded kernel observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    Issue {
        ts_ns: u64,
        request: u64,
        #[serde(default)]
        bytes: u64,
    },
    Dispatch {
        ts_ns: u64,
        request: u64,
        /// Absent when the request had no owning queue.
        #[serde(default)]
        queue_depth: Option<u32>,
    },
    Complete {
        ts_ns: u64,
        request: u64,
        #[serde(default)]
        error: i32,
        #[serde(default)]
        bytes: u32,
    },
    Done {
        ts_ns: u64,
        request: u64,
    },
}

impl TraceEvent {
    pub fn ts_ns(&self) -> u64 {
        match *self {
            Self::Issue { ts_ns, .. }
            | Self::Dispatch { ts_ns, .. }
            | Self::Complete { ts_ns, .. }
            | Self::Done { ts_ns, .. } => ts_ns,
        }
    }
}

/// Replays a JSON-lines trace through a [`Probe`].
pub struct ReplayTracer {
    path: Option<PathBuf>,
    lines: Option<TraceLines>,
    probe: Probe,
    consumer: RecordConsumer,
    clock: Arc<ManualClock>,
    line_no: u64,
    malformed: u64,
    exhausted: bool,
}

impl ReplayTracer {
    /// Replay the trace at `path`; the file is opened by `start`.
    pub fn new(path: PathBuf, probe_cfg: ProbeConfig, capacity_bytes: usize) -> Self {
        let mut tracer = Self::build(probe_cfg, capacity_bytes);
        tracer.path = Some(path);
        tracer
    }

    /// Replay from an already open reader.
    pub fn from_reader<R>(reader: R, probe_cfg: ProbeConfig, capacity_bytes: usize) -> Self
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let mut tracer = Self::build(probe_cfg, capacity_bytes);
        let boxed: Box<dyn AsyncBufRead + Unpin + Send> = Box::new(reader);
        tracer.lines = Some(boxed.lines());
        tracer
    }

    fn build(probe_cfg: ProbeConfig, capacity_bytes: usize) -> Self {
        let (producer, consumer) = channel::channel(capacity_bytes);
        let clock = Arc::new(ManualClock::new(0));
        let probe = Probe::new(probe_cfg, producer, Arc::clone(&clock) as Arc<dyn NanoClock>);

        Self {
            path: None,
            lines: None,
            probe,
            consumer,
            clock,
            line_no: 0,
            malformed: 0,
            exhausted: false,
        }
    }

    /// Agent-side drop counters.
    pub fn drop_stats(&self) -> Arc<DropStats> {
        Arc::clone(self.probe.drops())
    }

    /// Lines skipped because they did not parse.
    pub fn malformed_lines(&self) -> u64 {
        self.malformed
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }

    fn apply(&mut self, event: TraceEvent, out: &mut Vec<Delivery>) -> usize {
        self.clock.set(event.ts_ns());

        match event {
            TraceEvent::Issue { request, bytes, .. } => {
                self.probe.on_issue_start(&block_request(request, bytes, None));
                0
            }
            TraceEvent::Dispatch {
                request,
                queue_depth,
                ..
            } => {
                let queue = queue_depth.map(|depth| QueueInfo { depth });
                self.probe.on_queue_sample(&block_request(request, 0, queue));
                0
            }
            TraceEvent::Complete {
                request,
                error,
                bytes,
                ..
            } => {
                self.probe
                    .on_completion(&block_request(request, 0, None), error, bytes);
                0
            }
            TraceEvent::Done { ts_ns, request } => {
                self.probe.on_request_done(&block_request(request, 0, None));
                self.drain(out, ts_ns)
            }
        }
    }

    fn drain(&mut self, out: &mut Vec<Delivery>, arrival_ns: u64) -> usize {
        let mut n = 0;
        while let Recv::Record(record) = self.consumer.try_recv() {
            out.push(Delivery { record, arrival_ns });
            n += 1;
        }
        n
    }
}

fn block_request(request: u64, payload_bytes: u64, queue: Option<QueueInfo>) -> BlockRequest {
    BlockRequest {
        id: RequestId(request),
        payload_bytes,
        queue,
    }
}

impl Tracer for ReplayTracer {
    fn name(&self) -> &str {
        "replay"
    }

    async fn start(&mut self) -> Result<()> {
        if self.lines.is_some() {
            return Ok(());
        }

        let path = self
            .path
            .clone()
            .ok_or_else(|| anyhow::anyhow!("replay tracer has no input"))?;
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening replay trace {}", path.display()))?;
        let boxed: Box<dyn AsyncBufRead + Unpin + Send> = Box::new(BufReader::new(file));
        self.lines = Some(boxed.lines());

        info!(path = %path.display(), "replay tracer started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.lines = None;
        info!(
            lines = self.line_no,
            malformed = self.malformed,
            "replay tracer stopped"
        );
        Ok(())
    }

    async fn poll(
        &mut self,
        out: &mut Vec<Delivery>,
        _idle_wait: Duration,
    ) -> Result<Option<usize>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut delivered = 0;
        for _ in 0..LINES_PER_POLL {
            let lines = self
                .lines
                .as_mut()
                .ok_or_else(|| anyhow::anyhow!("replay tracer not started"))?;

            let Some(line) = lines
                .next_line()
                .await
                .with_context(|| format!("reading replay trace line {}", self.line_no + 1))?
            else {
                self.exhausted = true;
                break;
            };
            self.line_no += 1;

            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match serde_json::from_str::<TraceEvent>(line) {
                Ok(event) => {
                    delivered += self.apply(event, out);
                    // Later observations belong after this delivery's fold.
                    if delivered > 0 {
                        break;
                    }
                }
                Err(e) => {
                    self.malformed += 1;
                    warn!(line = self.line_no, error = %e, "skipping malformed trace line");
                }
            }
        }

        if self.exhausted && delivered == 0 {
            return Ok(None);
        }
        Ok(Some(delivered))
    }

    fn take_counters(&mut self) -> Result<CounterSnapshot> {
        Ok(self.probe.take_counters())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::stats::DropReason;

    const TRACE: &str = r#"
# two requests, one without an issue record
{"kind":"issue","ts_ns":1000,"request":1,"bytes":4096}
{"kind":"dispatch","ts_ns":1100,"request":1,"queue_depth":32}
{"kind":"issue","ts_ns":1200,"request":2,"bytes":512}
{"kind":"dispatch","ts_ns":1300,"request":2,"queue_depth":16}
{"kind":"complete","ts_ns":9000,"request":1,"error":0,"bytes":4096}
{"kind":"done","ts_ns":9050,"request":1}
{"kind":"complete","ts_ns":9500,"request":2,"error":-5}
{"kind":"done","ts_ns":9600,"request":2}
{"kind":"done","ts_ns":9700,"request":3}
not json
"#;

    fn tracer(input: &'static str) -> ReplayTracer {
        ReplayTracer::from_reader(input.as_bytes(), ProbeConfig::default(), 1024)
    }

    #[tokio::test]
    async fn test_replay_delivers_records() {
        let mut t = tracer(TRACE);
        t.start().await.unwrap();

        let mut out = Vec::new();
        while t.poll(&mut out, Duration::ZERO).await.unwrap().is_some() {}
        assert_eq!(out.len(), 2);

        assert_eq!(out[0].record.id, RequestId(1));
        assert_eq!(out[0].record.start_ns, 1000);
        assert_eq!(out[0].record.end_ns, 9050);
        assert_eq!(out[0].record.payload_bytes, 4096);
        assert_eq!(out[0].arrival_ns, 9050);

        assert_eq!(out[1].record.id, RequestId(2));
        assert_eq!(out[1].record.busy_ns(), 8400);
        assert_eq!(out[1].arrival_ns, 9600);

        assert_eq!(t.malformed_lines(), 1);
        assert_eq!(t.drop_stats().get(DropReason::MissingRecord), 1);
        assert_eq!(t.probe().completion_errors(), 1);

        let snap = t.take_counters().unwrap();
        assert_eq!(snap.completions, 2);
        assert_eq!(snap.issue.queue_depth_sum, 48);
        assert_eq!(snap.issue.event_count, 2);

        assert_eq!(t.poll(&mut out, Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_poll_returns_at_first_delivery() {
        let mut t = tracer(TRACE);
        t.start().await.unwrap();

        let mut out = Vec::new();
        assert_eq!(t.poll(&mut out, Duration::ZERO).await.unwrap(), Some(1));
        assert_eq!(out[0].record.id, RequestId(1));

        // Request 2's completion comes after the first done line.
        let snap = t.take_counters().unwrap();
        assert_eq!(snap.completions, 1);
        assert_eq!(snap.issue.event_count, 2);
        assert_eq!(t.probe().completion_errors(), 0);

        assert_eq!(t.poll(&mut out, Duration::ZERO).await.unwrap(), Some(1));
        assert_eq!(out[1].record.id, RequestId(2));
        assert_eq!(t.take_counters().unwrap().completions, 1);
    }

    #[tokio::test]
    async fn test_dispatch_without_queue_is_dropped() {
        let mut t = tracer("{\"kind\":\"dispatch\",\"ts_ns\":5,\"request\":1}\n");
        t.start().await.unwrap();
        let mut out = Vec::new();
        assert_eq!(t.poll(&mut out, Duration::ZERO).await.unwrap(), None);
        assert_eq!(t.drop_stats().get(DropReason::QueueUnavailable), 1);
    }

    #[tokio::test]
    async fn test_poll_before_start_fails() {
        let mut t =
            ReplayTracer::new(PathBuf::from("/nonexistent"), ProbeConfig::default(), 1024);
        let mut out = Vec::new();
        assert!(t.poll(&mut out, Duration::ZERO).await.is_err());
        assert!(t.start().await.is_err());
    }

    #[test]
    fn test_trace_event_parsing() {
        let ev: TraceEvent =
            serde_json::from_str(r#"{"kind":"complete","ts_ns":7,"request":9}"#).unwrap();
        assert_eq!(
            ev,
            TraceEvent::Complete {
                ts_ns: 7,
                request: 9,
                error: 0,
                bytes: 0
            }
        );
        assert_eq!(ev.ts_ns(), 7);
    }
}
