pub mod channel;
pub mod event;
pub mod parse;
pub mod probe;
pub mod replay;
pub mod stats;

#[cfg(feature = "bpf")]
pub mod bpf;

use std::time::Duration;

use anyhow::Result;

use self::event::{CounterSnapshot, Delivery};

/// A source of finalized request records plus the agent counters behind it.
///
/// Implemented by the BPF loader and by trace replay; the aggregator drives
/// either one from a single task.
pub trait Tracer: Send {
    /// Returns the tracer's name for logging.
    fn name(&self) -> &str;

    /// Load and attach the agent, or open the input.
    fn start(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Detach the agent and release its resources.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Append available deliveries to `out`, waiting at most `idle_wait`
    /// when none are ready. A zero `idle_wait` never waits.
    ///
    /// Returns the number appended, or `None` once the source is closed and
    /// drained. Errors are fatal to the consumption loop.
    fn poll(
        &mut self,
        out: &mut Vec<Delivery>,
        idle_wait: Duration,
    ) -> impl std::future::Future<Output = Result<Option<usize>>> + Send;

    /// Read and reset the completion counter and the issue accumulator.
    fn take_counters(&mut self) -> Result<CounterSnapshot>;
}

/// The configured record source.
///
/// Enum dispatch, since [`Tracer`] returns `impl Future` and is not object
/// safe.
pub enum Source {
    Replay(replay::ReplayTracer),
    #[cfg(feature = "bpf")]
    Bpf(bpf::BpfTracer),
}

impl Source {
    /// Agent-side drop counters.
    pub fn drop_stats(&self) -> std::sync::Arc<stats::DropStats> {
        match self {
            Self::Replay(t) => t.drop_stats(),
            #[cfg(feature = "bpf")]
            Self::Bpf(t) => t.drop_stats(),
        }
    }
}

impl Tracer for Source {
    fn name(&self) -> &str {
        match self {
            Self::Replay(t) => t.name(),
            #[cfg(feature = "bpf")]
            Self::Bpf(t) => t.name(),
        }
    }

    async fn start(&mut self) -> Result<()> {
        match self {
            Self::Replay(t) => t.start().await,
            #[cfg(feature = "bpf")]
            Self::Bpf(t) => t.start().await,
        }
    }

    async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Replay(t) => t.stop().await,
            #[cfg(feature = "bpf")]
            Self::Bpf(t) => t.stop().await,
        }
    }

    async fn poll(
        &mut self,
        out: &mut Vec<Delivery>,
        idle_wait: Duration,
    ) -> Result<Option<usize>> {
        match self {
            Self::Replay(t) => t.poll(out, idle_wait).await,
            #[cfg(feature = "bpf")]
            Self::Bpf(t) => t.poll(out, idle_wait).await,
        }
    }

    fn take_counters(&mut self) -> Result<CounterSnapshot> {
        match self {
            Self::Replay(t) => t.take_counters(),
            #[cfg(feature = "bpf")]
            Self::Bpf(t) => t.take_counters(),
        }
    }
}
