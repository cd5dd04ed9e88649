use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::perf::{PerfCapabilities, RingBufferConfig};
use crate::pmu::{CpuDescriptor, UncoreDescriptor};

/// Top-level configuration for the capture daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    #[allow(dead_code)]
    pub log_level: String,

    /// Capture session parameters.
    #[serde(default)]
    pub session: SessionConfig,

    /// Kernel capability flags, normally probed but overridable.
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,

    /// Extra PMU descriptors merged into the built-in catalog.
    #[serde(default)]
    pub pmu: PmuConfig,

    /// CPU identification behavior.
    #[serde(default)]
    pub identification: IdentificationConfig,
}

/// Capture session parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Whole-system capture instead of a single app's task tree. Default: true.
    #[serde(default = "default_true")]
    pub system_wide: bool,

    /// Samples per second; 0 disables rate-driven sampling. Default: 1000.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u64,

    /// Add a periodic program-counter sampler to CPU groups. Default: true.
    #[serde(default = "default_true")]
    pub enable_periodic_sampling: bool,

    /// Callchain depth; 0 disables callchain collection. Default: 0.
    #[serde(default)]
    pub backtrace_depth: u32,

    /// Exclude kernel-space samples where the event allows it. Default: false.
    #[serde(default)]
    pub exclude_kernel_events: bool,

    /// Capacity of the outbound frame ring in bytes. Default: 1MB.
    #[serde(default = "default_capture_ring_size")]
    pub capture_ring_size: usize,

    /// Per-event kernel data mmap size in bytes (power of two). Default: 4MB.
    #[serde(default = "default_data_buffer_size")]
    pub data_buffer_size: usize,

    /// Per-event kernel aux mmap size in bytes (power of two). Default: 4MB.
    #[serde(default = "default_aux_buffer_size")]
    pub aux_buffer_size: usize,

    /// How long a capture may run before stopping; unset means unbounded.
    #[serde(default, with = "humantime_serde::option")]
    pub duration: Option<Duration>,
}

/// Kernel capability flags.
///
/// Defaults assume a reasonably modern (4.x+) kernel; targets running
/// older kernels override the flags they lack.
#[derive(Debug, Clone, Deserialize)]
pub struct CapabilitiesConfig {
    #[serde(default)]
    pub exclude_kernel: bool,
    #[serde(default = "default_true")]
    pub can_access_tracepoints: bool,
    #[serde(default = "default_true")]
    pub has_sample_identifier: bool,
    #[serde(default = "default_true")]
    pub has_attr_comm_exec: bool,
    #[serde(default = "default_true")]
    pub has_attr_clockid_support: bool,
    #[serde(default = "default_true")]
    pub has_attr_context_switch: bool,
    #[serde(default = "default_true")]
    pub has_count_sw_dummy: bool,
    #[serde(default = "default_true")]
    pub has_exclude_callchain_kernel: bool,
    #[serde(default = "default_use_64bit_register_set")]
    pub use_64bit_register_set: bool,
}

/// Extra PMU descriptors supplied by the deployment.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PmuConfig {
    #[serde(default)]
    pub extra_cpus: Vec<CpuDescriptor>,

    #[serde(default)]
    pub extra_uncores: Vec<UncoreDescriptor>,
}

/// CPU identification behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentificationConfig {
    /// Probe cores in place instead of forcing offline cores online.
    /// Default: false.
    #[serde(default)]
    pub ignore_offline: bool,

    /// Read the hardware name from /proc/cpuinfo. Default: true.
    #[serde(default = "default_true")]
    pub wants_hardware_name: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sample_rate() -> u64 {
    1000
}

fn default_capture_ring_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_data_buffer_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_aux_buffer_size() -> usize {
    4 * 1024 * 1024 // 4MB
}

fn default_use_64bit_register_set() -> bool {
    cfg!(target_pointer_width = "64")
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session: SessionConfig::default(),
            capabilities: CapabilitiesConfig::default(),
            pmu: PmuConfig::default(),
            identification: IdentificationConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            system_wide: true,
            sample_rate: default_sample_rate(),
            enable_periodic_sampling: true,
            backtrace_depth: 0,
            exclude_kernel_events: false,
            capture_ring_size: default_capture_ring_size(),
            data_buffer_size: default_data_buffer_size(),
            aux_buffer_size: default_aux_buffer_size(),
            duration: None,
        }
    }
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            exclude_kernel: false,
            can_access_tracepoints: true,
            has_sample_identifier: true,
            has_attr_comm_exec: true,
            has_attr_clockid_support: true,
            has_attr_context_switch: true,
            has_count_sw_dummy: true,
            has_exclude_callchain_kernel: true,
            use_64bit_register_set: default_use_64bit_register_set(),
        }
    }
}

impl Default for IdentificationConfig {
    fn default() -> Self {
        Self {
            ignore_offline: false,
            wants_hardware_name: true,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.session.capture_ring_size == 0 {
            bail!("session.capture_ring_size must be positive");
        }

        if !self.session.data_buffer_size.is_power_of_two() {
            bail!("session.data_buffer_size must be a power of two");
        }

        if !self.session.aux_buffer_size.is_power_of_two() {
            bail!("session.aux_buffer_size must be a power of two");
        }

        if self.session.sample_rate > 100_000 {
            bail!("session.sample_rate is unreasonably high (max 100000)");
        }

        for cpu in &self.pmu.extra_cpus {
            if cpu.cpu_ids.is_empty() {
                bail!("pmu.extra_cpus entry '{}' has no cpu_ids", cpu.id);
            }
        }

        Ok(())
    }

    /// Resolve the kernel capability flags for group construction.
    pub fn perf_capabilities(&self) -> PerfCapabilities {
        let caps = &self.capabilities;
        PerfCapabilities {
            is_system_wide: self.session.system_wide,
            exclude_kernel: caps.exclude_kernel,
            can_access_tracepoints: caps.can_access_tracepoints,
            has_sample_identifier: caps.has_sample_identifier,
            has_attr_comm_exec: caps.has_attr_comm_exec,
            has_attr_clockid_support: caps.has_attr_clockid_support,
            has_attr_context_switch: caps.has_attr_context_switch,
            has_count_sw_dummy: caps.has_count_sw_dummy,
            has_exclude_callchain_kernel: caps.has_exclude_callchain_kernel,
            use_64bit_register_set: caps.use_64bit_register_set,
        }
    }

    /// Resolve the kernel ring-buffer sizing.
    pub fn ring_buffer_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            data_buffer_size: self.session.data_buffer_size,
            aux_buffer_size: self.session.aux_buffer_size,
        }
    }
}
