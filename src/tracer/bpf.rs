//! Kernel agent loading, attachment, and ring buffer reading.
//!
//! Implements the [`Tracer`] trait using aya. Gated behind the `bpf` feature.
//!
//! Counter reset is read-then-zero on the kernel maps: increments landing
//! between the read and the zero are lost. Requests are keyed by their kernel
//! address, so a reused address aliases the earlier request's entry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::unix::AsyncFd;

use aya::maps::{Array, MapData, PerCpuArray, PerCpuValues, RingBuf};
use aya::programs::{BtfTracePoint, KProbe};
use aya::{Btf, Ebpf, EbpfLoader};

use crate::clock;
use crate::export::health::HealthMetrics;

use super::event::{CounterSnapshot, Delivery, IssueSample};
use super::parse::parse_record;
use super::stats::{DropReason, DropStats};
use super::Tracer;

/// Compiled kernel object, embedded at build time.
///
/// `include_bytes_aligned!` guarantees the alignment aya's ELF parser needs.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/blkwatch.bpf.o"));

/// Index of the evict flag in the `settings` map.
const SETTING_EVICT_COMPLETED: u32 = 0;

/// Settings pushed into the kernel maps at load time.
#[derive(Debug, Clone, Copy)]
pub struct BpfConfig {
    pub ring_buffer_size: u32,
    pub table_capacity: u32,
    pub evict_completed: bool,
}

/// Program attachment statistics for Prometheus metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentStats {
    pub kprobes_attached: u32,
    pub tracepoints_attached: u32,
}

/// Kernel-resident agent.
pub struct BpfTracer {
    cfg: BpfConfig,
    health: Option<Arc<HealthMetrics>>,
    drops: Arc<DropStats>,
    ebpf: Option<Ebpf>,
    ring: Option<AsyncFd<RingBuf<MapData>>>,
    nr_cpus: usize,
    attach_stats: AttachmentStats,
}

impl BpfTracer {
    pub fn new(cfg: BpfConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            health,
            drops: Arc::new(DropStats::new()),
            ebpf: None,
            ring: None,
            nr_cpus: 0,
            attach_stats: AttachmentStats::default(),
        }
    }

    /// Kernel drop counters, refreshed on every counter take.
    pub fn drop_stats(&self) -> Arc<DropStats> {
        Arc::clone(&self.drops)
    }

    pub fn attachment_stats(&self) -> AttachmentStats {
        self.attach_stats
    }

    fn loaded(&mut self) -> Result<&mut Ebpf> {
        self.ebpf
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("BPF objects not loaded"))
    }

    /// Fold the kernel `drops` array into [`DropStats`] and zero it.
    fn collect_drops(&mut self) -> Result<()> {
        let drops = Arc::clone(&self.drops);
        let ebpf = self.loaded()?;
        let mut map: Array<_, u64> = Array::try_from(
            ebpf.map_mut("drops")
                .ok_or_else(|| anyhow::anyhow!("drops map not found"))?,
        )?;

        for reason in DropReason::all() {
            let idx = u32::from(*reason as u8);
            let n = map.get(&idx, 0)?;
            if n > 0 {
                map.set(idx, 0, 0)?;
                drops.add(*reason, n);
            }
        }

        Ok(())
    }
}

impl Tracer for BpfTracer {
    fn name(&self) -> &str {
        "bpf"
    }

    async fn start(&mut self) -> Result<()> {
        let mut ebpf = EbpfLoader::new()
            .set_max_entries("events", self.cfg.ring_buffer_size)
            .set_max_entries("requests", self.cfg.table_capacity)
            .load(BPF_OBJ)
            .context("loading BPF objects")?;

        {
            let mut settings: Array<_, u32> = Array::try_from(
                ebpf.map_mut("settings")
                    .ok_or_else(|| anyhow::anyhow!("settings map not found"))?,
            )?;
            settings
                .set(SETTING_EVICT_COMPLETED, u32::from(self.cfg.evict_completed), 0)
                .context("writing settings map")?;
        }

        self.attach_stats = attach_programs(&mut ebpf)?;
        tracing::info!(
            kprobes = self.attach_stats.kprobes_attached,
            tracepoints = self.attach_stats.tracepoints_attached,
            "BPF program attachment summary"
        );

        let events_map = ebpf
            .take_map("events")
            .ok_or_else(|| anyhow::anyhow!("events map not found"))?;
        let ring_buf =
            RingBuf::try_from(events_map).context("creating ring buffer from events map")?;
        let ring = AsyncFd::new(ring_buf).context("registering ring buffer fd")?;

        self.nr_cpus = aya::util::nr_cpus()
            .map_err(|(path, e)| anyhow::anyhow!("reading possible CPUs from {path}: {e}"))?;

        if let Some(health) = &self.health {
            health
                .ringbuf_capacity_bytes
                .set(f64::from(self.cfg.ring_buffer_size));
            health
                .programs_attached
                .with_label_values(&["kprobe"])
                .set(f64::from(self.attach_stats.kprobes_attached));
            health
                .programs_attached
                .with_label_values(&["tracepoint"])
                .set(f64::from(self.attach_stats.tracepoints_attached));
        }

        self.ring = Some(ring);
        self.ebpf = Some(ebpf);

        tracing::info!(
            ring_buffer_size = self.cfg.ring_buffer_size,
            table_capacity = self.cfg.table_capacity,
            "BPF tracer started"
        );
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.ring = None;
        // Dropping the Ebpf object detaches all programs and closes maps.
        self.ebpf = None;

        tracing::info!("BPF tracer stopped");
        Ok(())
    }

    async fn poll(
        &mut self,
        out: &mut Vec<Delivery>,
        idle_wait: Duration,
    ) -> Result<Option<usize>> {
        let health = self.health.as_deref();
        let ring = self
            .ring
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("BPF tracer not started"))?;

        let n = drain(ring.get_mut(), out, health);
        if n > 0 || idle_wait.is_zero() {
            return Ok(Some(n));
        }

        match tokio::time::timeout(idle_wait, ring.readable_mut()).await {
            Err(_elapsed) => Ok(Some(0)),
            Ok(Err(e)) => Err(e).context("polling ring buffer"),
            Ok(Ok(mut guard)) => {
                let n = drain(guard.get_inner_mut(), out, health);
                guard.clear_ready();
                Ok(Some(n))
            }
        }
    }

    fn take_counters(&mut self) -> Result<CounterSnapshot> {
        self.collect_drops()?;

        let nr_cpus = self.nr_cpus;
        let ebpf = self.loaded()?;

        let completions = {
            let mut map: Array<_, u32> = Array::try_from(
                ebpf.map_mut("completions")
                    .ok_or_else(|| anyhow::anyhow!("completions map not found"))?,
            )?;
            let value = map.get(&0, 0).context("reading completions")?;
            map.set(0, 0, 0).context("resetting completions")?;
            value
        };

        let issue = {
            let mut map: PerCpuArray<_, u64> = PerCpuArray::try_from(
                ebpf.map_mut("issue_acc")
                    .ok_or_else(|| anyhow::anyhow!("issue_acc map not found"))?,
            )?;
            let values = map.get(&0, 0).context("reading issue accumulator")?;
            let merged = values
                .iter()
                .fold(IssueSample::default(), |acc, raw| acc.combine(IssueSample::unpack(*raw)));

            let zeros = PerCpuValues::try_from(vec![0u64; nr_cpus])
                .context("building per-CPU zero values")?;
            map.set(0, zeros, 0).context("resetting issue accumulator")?;
            merged
        };

        Ok(CounterSnapshot { completions, issue })
    }
}

// ---------------------------------------------------------------------------
// Ring buffer draining
// ---------------------------------------------------------------------------

/// Drain every available sample, stamping each with its arrival time.
fn drain(
    ring: &mut RingBuf<MapData>,
    out: &mut Vec<Delivery>,
    health: Option<&HealthMetrics>,
) -> usize {
    let mut n = 0;
    while let Some(item) = ring.next() {
        let data: &[u8] = &item;

        // Empty record indicates ring buffer overflow.
        if data.is_empty() {
            tracing::warn!("ring buffer overflow detected");
            if let Some(h) = health {
                h.ringbuf_overflows.inc();
            }
            continue;
        }

        match parse_record(data) {
            Ok(record) => {
                out.push(Delivery {
                    record,
                    arrival_ns: clock::monotonic_ns(),
                });
                n += 1;
            }
            Err(e) => {
                tracing::debug!(error = %e, "record parse error");
                if let Some(h) = health {
                    h.parse_errors.with_label_values(&["truncated"]).inc();
                }
            }
        }
    }
    n
}

// ---------------------------------------------------------------------------
// Program attachment
// ---------------------------------------------------------------------------

fn attach_programs(ebpf: &mut Ebpf) -> Result<AttachmentStats> {
    let mut stats = AttachmentStats::default();

    // The accounting hooks were renamed across kernel versions; try the
    // public symbol first, then the double-underscore one.
    let kprobes: &[(&str, &str, &str, &str)] = &[
        (
            "kprobe_blk_account_io_start",
            "blk_account_io_start",
            "kprobe___blk_account_io_start",
            "__blk_account_io_start",
        ),
        (
            "kprobe_blk_account_io_done",
            "blk_account_io_done",
            "kprobe___blk_account_io_done",
            "__blk_account_io_done",
        ),
    ];

    for (prog, symbol, fallback_prog, fallback_symbol) in kprobes {
        match attach_kprobe(ebpf, prog, symbol) {
            Ok(()) => {}
            Err(e) => {
                tracing::debug!(symbol, error = %e, "kprobe attach failed, trying fallback");
                attach_kprobe(ebpf, fallback_prog, fallback_symbol).with_context(|| {
                    format!("attaching kprobe {symbol} or {fallback_symbol}")
                })?;
            }
        }
        stats.kprobes_attached += 1;
    }

    let btf = Btf::from_sys_fs().context("loading kernel BTF")?;
    for name in ["block_rq_issue", "block_rq_complete"] {
        let prog: &mut BtfTracePoint = ebpf
            .program_mut(name)
            .ok_or_else(|| anyhow::anyhow!("tracepoint program '{name}' not found"))?
            .try_into()
            .with_context(|| format!("'{name}' is not a BTF tracepoint program"))?;
        prog.load(name, &btf)
            .with_context(|| format!("loading tracepoint {name}"))?;
        prog.attach()
            .with_context(|| format!("attaching tracepoint {name}"))?;
        stats.tracepoints_attached += 1;
        tracing::debug!(name, "attached tracepoint");
    }

    Ok(stats)
}

fn attach_kprobe(ebpf: &mut Ebpf, prog_name: &str, symbol: &str) -> Result<()> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("kprobe program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a kprobe program"))?;
    prog.load()
        .with_context(|| format!("loading kprobe {symbol}"))?;
    prog.attach(symbol, 0)
        .with_context(|| format!("attaching kprobe {symbol}"))?;
    tracing::debug!(symbol, "attached kprobe");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bpf_object_is_valid_elf() {
        assert!(
            BPF_OBJ.len() > 64,
            "BPF object is too small: {} bytes",
            BPF_OBJ.len()
        );

        let magic = BPF_OBJ.get(..4).expect("BPF object too small for magic");
        assert_eq!(magic, b"\x7fELF", "invalid ELF magic: {magic:02x?}");

        // e_machine at offset 18 (2 bytes LE) should be EM_BPF (247).
        let em_lo = BPF_OBJ.get(18).copied().expect("missing e_machine lo");
        let em_hi = BPF_OBJ.get(19).copied().expect("missing e_machine hi");
        let e_machine = u16::from_le_bytes([em_lo, em_hi]);
        assert_eq!(e_machine, 247, "e_machine is not EM_BPF (got {e_machine})");
    }

    #[test]
    fn test_bpf_object_alignment() {
        let ptr = BPF_OBJ.as_ptr() as usize;
        assert_eq!(ptr % 8, 0, "BPF object pointer {ptr:#x} is not 8-byte aligned");
    }
}
