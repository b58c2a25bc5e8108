use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tracer::event::RECORD_WIRE_SIZE;
use crate::tracer::probe::ProbeConfig;

/// Top-level configuration for the blkwatch monitor.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    /// Overridden by `--log-level`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Report window configuration.
    #[serde(default)]
    pub window: WindowConfig,

    /// Event channel size in bytes. Default: 1MiB.
    #[serde(default = "default_ring_buffer_size")]
    pub ring_buffer_size: usize,

    /// In-flight request table configuration.
    #[serde(default)]
    pub request_table: RequestTableConfig,

    /// Record source configuration.
    #[serde(default)]
    pub tracer: TracerConfig,

    /// Report output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Report window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WindowConfig {
    /// Minimum time between reports. Default: 5s.
    #[serde(default = "default_window_length", with = "humantime_serde")]
    pub length: Duration,

    /// Longest wait for new records before polling again. Zero busy-polls.
    /// Default: 1ms.
    #[serde(default = "default_idle_wait", with = "humantime_serde")]
    pub idle_wait: Duration,
}

/// In-flight request table configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestTableConfig {
    /// Maximum tracked requests. Default: 1024.
    #[serde(default = "default_table_capacity")]
    pub capacity: usize,

    /// Remove an entry once its record is published. Default: false.
    #[serde(default)]
    pub evict_completed: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TracerKind {
    /// Kernel-resident agent (requires the `bpf` feature).
    #[default]
    Bpf,
    /// JSON-lines trace replayed through the in-process agent.
    Replay,
}

/// Record source configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracerConfig {
    #[serde(default)]
    pub kind: TracerKind,

    /// Trace file for `kind: replay`.
    #[serde(default)]
    pub replay_path: Option<PathBuf>,
}

/// Report output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Append-only report file. Empty disables it. Default: "blkwatch.log".
    #[serde(default = "default_output_path")]
    pub path: String,

    /// Also print reports to stdout. Default: true.
    #[serde(default = "default_true")]
    pub stdout: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ring_buffer_size() -> usize {
    1024 * 1024
}

fn default_window_length() -> Duration {
    Duration::from_secs(5)
}

fn default_idle_wait() -> Duration {
    Duration::from_millis(1)
}

fn default_table_capacity() -> usize {
    crate::tracer::probe::DEFAULT_TABLE_CAPACITY
}

fn default_output_path() -> String {
    "blkwatch.log".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            window: WindowConfig::default(),
            ring_buffer_size: default_ring_buffer_size(),
            request_table: RequestTableConfig::default(),
            tracer: TracerConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            length: default_window_length(),
            idle_wait: default_idle_wait(),
        }
    }
}

impl Default for RequestTableConfig {
    fn default() -> Self {
        Self {
            capacity: default_table_capacity(),
            evict_completed: false,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
            stdout: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(data: &str) -> Result<Self> {
        // An empty document means all defaults.
        let cfg: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(data).context("parsing config")?
        };

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.window.length.is_zero() {
            bail!("window.length must be positive");
        }

        if self.ring_buffer_size < RECORD_WIRE_SIZE {
            bail!(
                "ring_buffer_size must hold at least one record ({RECORD_WIRE_SIZE} bytes), got {}",
                self.ring_buffer_size
            );
        }

        if self.request_table.capacity == 0 {
            bail!("request_table.capacity must be positive");
        }

        match self.tracer.kind {
            TracerKind::Bpf => {
                // The kernel ring buffer must be a power-of-two multiple of
                // the page size.
                if !self.ring_buffer_size.is_power_of_two() || self.ring_buffer_size < 4096 {
                    bail!(
                        "bpf ring_buffer_size must be a power of two of at least 4096, got {}",
                        self.ring_buffer_size
                    );
                }
                if u32::try_from(self.request_table.capacity).is_err() {
                    bail!("request_table.capacity exceeds the kernel map limit");
                }
            }
            TracerKind::Replay => {
                if self.tracer.replay_path.is_none() {
                    bail!("tracer.replay_path is required when tracer.kind is replay");
                }
            }
        }

        if self.output.path.is_empty() && !self.output.stdout {
            bail!("at least one of output.path or output.stdout must be set");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled is true");
        }

        Ok(())
    }

    /// Settings for the in-process agent.
    pub fn probe(&self) -> ProbeConfig {
        ProbeConfig {
            table_capacity: self.request_table.capacity,
            evict_completed: self.request_table.evict_completed,
        }
    }
}
