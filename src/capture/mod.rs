//! Capture orchestrator.
//!
//! Wires the acquisition pipeline together: PMU catalog and CPU
//! identification feed per-cluster event-group construction, the
//! resulting descriptors are marshaled onto the attrs frame stream,
//! agents are spawned under the supervisor, and external counter bytes
//! flow in through the external source.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agents::{AgentKind, AgentSpawner, SelfExecSpawner, Supervisor, SupervisorDelegate};
use crate::clock::CaptureClock;
use crate::config::Config;
use crate::cpuid::{self, INVALID_CPU_ID};
use crate::drivers::{enumerate_mali_devices, AtraceDriver};
use crate::frame::{frame_ring, FrameConsumer, PerfAttrsWriter};
use crate::perf::constants::{PERF_SAMPLE_READ, PERF_TYPE_HARDWARE};
use crate::perf::{
    EventGroup, EventRequest, GroupConfig, GroupKind, PerfEventAttr, UNKNOWN_TRACEPOINT_ID,
};
use crate::pmu::PmuCatalog;
use crate::source::{ExternalSource, Source};

/// Reacts to supervisor-level events on behalf of the daemon.
struct CaptureDelegate {
    terminal: CancellationToken,
}

impl SupervisorDelegate for CaptureDelegate {
    fn on_terminal_signal(&self, signo: i32) {
        info!(signo, "received terminal signal");
        self.terminal.cancel();
    }

    fn on_agent_thread_terminated(&self) {
        info!("all agent workers terminated");
    }
}

/// The assembled capture pipeline.
pub struct Capture {
    cfg: Config,
    catalog: Arc<PmuCatalog>,
    clock: CaptureClock,
    cancel: CancellationToken,
    terminal: CancellationToken,
    spawner: Arc<dyn AgentSpawner>,

    supervisor: Option<Supervisor>,
    external: Option<ExternalSource>,
    atrace: Option<AtraceDriver>,
    attrs_writer: Option<PerfAttrsWriter>,
    attrs_consumer: Option<FrameConsumer>,
    external_consumer: Option<FrameConsumer>,

    hardware_name: Option<String>,
    cpu_ids: Vec<i32>,
    groups: Vec<EventGroup>,
}

impl Capture {
    /// Build a capture that re-executes this binary for its agents.
    pub fn new(cfg: Config) -> Result<Self> {
        let spawner = Arc::new(SelfExecSpawner::new()?);
        Ok(Self::with_spawner(cfg, spawner))
    }

    /// Build a capture with an injected agent spawner.
    pub fn with_spawner(cfg: Config, spawner: Arc<dyn AgentSpawner>) -> Self {
        let catalog = Arc::new(PmuCatalog::new(
            cfg.pmu.extra_cpus.clone(),
            cfg.pmu.extra_uncores.clone(),
        ));

        Self {
            cfg,
            catalog,
            clock: CaptureClock::start().unwrap_or_default(),
            cancel: CancellationToken::new(),
            terminal: CancellationToken::new(),
            spawner,
            supervisor: None,
            external: None,
            atrace: None,
            attrs_writer: None,
            attrs_consumer: None,
            external_consumer: None,
            hardware_name: None,
            cpu_ids: Vec::new(),
            groups: Vec::new(),
        }
    }

    /// Start all components and begin acquisition.
    pub async fn start(&mut self) -> Result<()> {
        self.clock = CaptureClock::start().context("starting capture clock")?;

        // 1. Identify every possible CPU, onlining idle cores if allowed.
        let core_count = cpuid::max_core_count().context("sizing the CPU slot array")?;
        let ignore_offline = self.cfg.identification.ignore_offline;
        let wants_hardware_name = self.cfg.identification.wants_hardware_name;

        let (cpu_ids, hardware_name) = tokio::task::spawn_blocking(move || {
            let mut cpu_ids = vec![INVALID_CPU_ID; core_count];
            let name = cpuid::read_cpu_info(ignore_offline, wants_hardware_name, &mut cpu_ids)?;
            Ok::<_, anyhow::Error>((cpu_ids, name))
        })
        .await
        .context("identification task panicked")??;

        info!(
            cores = core_count,
            hardware = hardware_name.as_deref().unwrap_or("unknown"),
            "identified target",
        );
        self.cpu_ids = cpu_ids;
        self.hardware_name = hardware_name;

        // 2. Open the attrs stream and record the online CPUs.
        let (attrs_ring, attrs_consumer) = frame_ring(self.cfg.session.capture_ring_size);
        let mut writer = PerfAttrsWriter::new(attrs_ring);
        self.attrs_consumer = Some(attrs_consumer);

        for (cpu, &cpu_id) in self.cpu_ids.iter().enumerate() {
            if cpu_id != INVALID_CPU_ID {
                writer.online_cpu(self.clock.now(), cpu as i32);
            }
        }

        // 3. Build one event group per detected cluster and marshal the
        // resulting descriptors.
        let mut group_config = GroupConfig::new(
            self.cfg.perf_capabilities(),
            self.cfg.ring_buffer_config(),
            self.cfg.session.exclude_kernel_events,
            read_sched_switch_id(),
            1,
            self.cfg.session.sample_rate,
            self.cfg.session.enable_periodic_sampling,
            self.cfg.session.backtrace_depth,
        );

        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut next_key: i32 = 2;

        for cluster in self.detected_clusters() {
            let mut group = EventGroup::new(GroupKind::PerClusterCpu);
            if let Err(e) = group.create_leader(&mut group_config, &mut tracker) {
                // Abandon this group, continue with the others.
                warn!(cluster = %cluster, error = %e, "cluster group not configured");
                continue;
            }

            // A cycle counter exercises the catalog-driven member path.
            let cycles = EventRequest {
                _type: PERF_TYPE_HARDWARE,
                config: 0, // PERF_COUNT_HW_CPU_CYCLES
                sample_type: PERF_SAMPLE_READ,
                ..Default::default()
            };
            if let Err(e) = group.add_event(&group_config, false, &mut tracker, next_key, &cycles, false)
            {
                warn!(cluster = %cluster, error = %e, "cycle counter not configured");
            } else {
                next_key += 1;
            }

            self.groups.push(group);
        }

        // Uncore PMUs the kernel actually exposes get their own groups.
        let present_uncores: Vec<String> = self
            .catalog
            .uncores()
            .iter()
            .filter(|u| uncore_pmu_present(&u.id))
            .map(|u| u.id.clone())
            .collect();

        for uncore in present_uncores {
            let mut group = EventGroup::new(GroupKind::UncorePmu);
            if let Err(e) = group.create_leader(&mut group_config, &mut tracker) {
                warn!(uncore = %uncore, error = %e, "uncore group not configured");
                continue;
            }
            info!(uncore = %uncore, "uncore group configured");
            self.groups.push(group);
        }

        for (key, attr) in &tracker {
            writer.marshal_pea(attr, *key);
        }
        writer.flush();
        self.attrs_writer = Some(writer);

        info!(
            groups = self.groups.len(),
            events = tracker.len(),
            "event groups configured",
        );

        // 4. GPU and atrace discovery.
        let mali_devices = enumerate_mali_devices();
        for device in &mali_devices {
            info!(
                id = device.id,
                clock = ?device.clock_path,
                "mali device available",
            );
        }

        let atrace = AtraceDriver::detect(ftrace_supported());
        if atrace.is_supported() {
            atrace.start();
        }
        self.atrace = Some(atrace);

        // 5. External source for agent-produced bytes.
        let (external_ring, external_consumer) = frame_ring(self.cfg.session.capture_ring_size);
        let mut external = ExternalSource::new(external_ring);
        external
            .start(self.cancel.child_token())
            .await
            .context("starting external source")?;
        self.external_consumer = Some(external_consumer);

        // 6. Supervisor and agent processes.
        let delegate = Arc::new(CaptureDelegate {
            terminal: self.terminal.clone(),
        });
        let supervisor = Supervisor::start(Arc::clone(&self.spawner), delegate);

        let pipe = external.add_agent_pipe().context("creating agent pipe")?;
        if !supervisor
            .add_agent(AgentKind::ExternalSource, Some(pipe))
            .await
        {
            // A missing agent degrades that feed; the capture carries on.
            warn!("external source agent did not launch");
        }

        if !supervisor.add_agent(AgentKind::Perf, None).await {
            warn!("perf agent did not launch");
        }

        self.external = Some(external);
        self.supervisor = Some(supervisor);

        info!("capture fully started");
        Ok(())
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(atrace) = &self.atrace {
            atrace.stop();
        }

        // Signal background tasks to stop.
        self.cancel.cancel();

        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown();
            supervisor.stopped().cancelled().await;
        }

        if let Some(external) = &mut self.external {
            external.stop().await?;
        }

        // Closing the writer ends the attrs stream at a frame boundary.
        if let Some(mut writer) = self.attrs_writer.take() {
            writer.flush();
        }

        info!("capture stopped");
        Ok(())
    }

    /// Fires when a terminal signal asks the daemon to wind down.
    pub fn terminal_token(&self) -> CancellationToken {
        self.terminal.clone()
    }

    /// Hand the attrs frame stream to the transport.
    pub fn take_attrs_consumer(&mut self) -> Option<FrameConsumer> {
        self.attrs_consumer.take()
    }

    /// Hand the external frame stream to the transport.
    pub fn take_external_consumer(&mut self) -> Option<FrameConsumer> {
        self.external_consumer.take()
    }

    pub fn hardware_name(&self) -> Option<&str> {
        self.hardware_name.as_deref()
    }

    pub fn cpu_ids(&self) -> &[i32] {
        &self.cpu_ids
    }

    pub fn groups(&self) -> &[EventGroup] {
        &self.groups
    }

    pub fn catalog(&self) -> &PmuCatalog {
        &self.catalog
    }

    /// Distinct core names detected on this target, unknown cores last.
    fn detected_clusters(&self) -> Vec<String> {
        let mut clusters: Vec<String> = Vec::new();
        let mut saw_unknown = false;

        for &cpu_id in &self.cpu_ids {
            if cpu_id == INVALID_CPU_ID {
                saw_unknown = true;
                continue;
            }
            let name = match self.catalog.find_cpu_by_id(cpu_id) {
                Some(descriptor) => descriptor.core_name.clone(),
                None => {
                    debug!(cpu_id = format_args!("{cpu_id:#x}"), "cpu id not in catalog");
                    format!("unknown-{cpu_id:#x}")
                }
            };
            if !clusters.contains(&name) {
                clusters.push(name);
            }
        }

        if clusters.is_empty() && saw_unknown {
            // Nothing identified; still drive one group so the capture
            // produces samples.
            clusters.push("unknown".to_owned());
        }

        clusters
    }
}

/// Resolve the sched_switch tracepoint id from tracefs.
fn read_sched_switch_id() -> i64 {
    for base in ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"] {
        let path = format!("{base}/events/sched/sched_switch/id");
        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(id) = content.trim().parse::<i64>() {
                return id;
            }
        }
    }
    debug!("sched_switch tracepoint id unavailable");
    UNKNOWN_TRACEPOINT_ID
}

/// Whether the kernel exposes a PMU under `/sys/bus/event_source`.
fn uncore_pmu_present(name: &str) -> bool {
    std::path::Path::new("/sys/bus/event_source/devices")
        .join(name)
        .exists()
}

/// Whether an ftrace mount point is present.
fn ftrace_supported() -> bool {
    ["/sys/kernel/tracing", "/sys/kernel/debug/tracing"]
        .iter()
        .any(|base| std::path::Path::new(base).join("trace").exists())
}
