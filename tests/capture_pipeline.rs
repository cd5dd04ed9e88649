//! Black-box scenarios for group configuration and agent supervision.

use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use perfcapd::agents::{
    AgentKind, AgentSpawner, ProcessState, SpawnedAgent, Supervisor, SupervisorDelegate,
};
use perfcapd::perf::constants::{
    PERF_COUNT_SW_CONTEXT_SWITCHES, PERF_COUNT_SW_CPU_CLOCK, PERF_COUNT_SW_DUMMY,
    PERF_COUNT_SW_TASK_CLOCK, PERF_SAMPLE_TID, PERF_TYPE_SOFTWARE,
};
use perfcapd::perf::{
    EventGroup, EventRequest, GroupConfig, GroupError, GroupKind, PerfCapabilities,
    PerfEventAttr, RingBufferConfig, UNKNOWN_TRACEPOINT_ID,
};

fn group_config(caps: PerfCapabilities) -> GroupConfig {
    GroupConfig::new(
        caps,
        RingBufferConfig {
            data_buffer_size: 4 * 1024 * 1024,
            aux_buffer_size: 4 * 1024 * 1024,
        },
        false,
        UNKNOWN_TRACEPOINT_ID,
        1,
        1000,
        true,
        0,
    )
}

#[test]
fn system_wide_capture_on_a_dummy_capable_kernel() {
    let caps = PerfCapabilities {
        is_system_wide: true,
        has_attr_context_switch: true,
        has_count_sw_dummy: true,
        ..Default::default()
    };
    let mut config = group_config(caps);
    let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();

    let mut group = EventGroup::new(GroupKind::PerClusterCpu);
    group
        .create_leader(&mut config, &mut tracker)
        .expect("leader");

    let leader = &group.events()[0];
    assert_eq!(leader.attr._type, PERF_TYPE_SOFTWARE);
    assert_eq!(leader.attr.config, PERF_COUNT_SW_DUMMY);
    assert_eq!(leader.attr.sample_period, 0);
    assert_eq!(leader.attr.flags.context_switch(), 1);
    assert_eq!(leader.attr.flags.pinned(), 1);

    let sampler = &group.events()[1];
    assert_eq!(sampler.attr.config, PERF_COUNT_SW_CPU_CLOCK);
    assert_eq!(sampler.attr.sample_period, 1_000_000);
    assert_eq!(sampler.attr.flags.pinned(), 0);
}

#[test]
fn app_mode_without_context_switch_support() {
    let caps = PerfCapabilities::default();
    let mut config = group_config(caps);
    config.enable_periodic_sampling = false;
    let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();

    let mut group = EventGroup::new(GroupKind::PerClusterCpu);
    group
        .create_leader(&mut config, &mut tracker)
        .expect("leader");

    let leader = &group.events()[0];
    assert_eq!(leader.attr.config, PERF_COUNT_SW_CONTEXT_SWITCHES);
    assert_eq!(leader.attr.sample_period, 1);

    let task_clock = &group.events()[1];
    assert_eq!(task_clock.attr.config, PERF_COUNT_SW_TASK_CLOCK);
    assert_eq!(task_clock.attr.sample_period, 100_000);
    assert_ne!(task_clock.attr.sample_type & PERF_SAMPLE_TID, 0);
}

#[test]
fn spe_needs_context_switch_support() {
    let caps = PerfCapabilities {
        is_system_wide: true,
        has_attr_context_switch: false,
        ..Default::default()
    };
    let config = group_config(caps);
    let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();

    let mut group = EventGroup::new(GroupKind::Spe);
    let request = EventRequest {
        _type: 8,
        period_or_freq: 2048,
        ..Default::default()
    };

    let result = group.add_event(&config, false, &mut tracker, 9, &request, true);
    assert_eq!(result, Err(GroupError::SpeRequiresContextSwitch));
    assert!(group.is_empty());
    assert!(tracker.is_empty());
}

// --- Supervisor lifecycle ---

struct PipeSpawner {
    next_pid: AtomicI32,
    ready_writers: parking_lot::Mutex<Vec<(i32, File)>>,
}

impl PipeSpawner {
    fn new() -> Self {
        Self {
            next_pid: AtomicI32::new(60_000),
            ready_writers: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn make_ready(&self, pid: i32) {
        let mut writers = self.ready_writers.lock();
        let idx = writers
            .iter()
            .position(|(p, _)| *p == pid)
            .expect("agent exists");
        writeln!(writers[idx].1, "ready").expect("handshake");
    }
}

impl AgentSpawner for PipeSpawner {
    fn spawn(&self, _kind: AgentKind, _data_fd: Option<OwnedFd>) -> anyhow::Result<SpawnedAgent> {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let (control_read, control_write): (OwnedFd, OwnedFd) = nix::unistd::pipe()?;
        let (event_read, event_write): (OwnedFd, OwnedFd) = nix::unistd::pipe()?;

        // Keep the agent-side ends open for the duration of the test.
        std::mem::forget(File::from(control_read));
        self.ready_writers.lock().push((pid, File::from(event_write)));

        Ok(SpawnedAgent {
            pid,
            control: Box::new(File::from(control_write)),
            events: Box::new(File::from(event_read)),
        })
    }
}

#[derive(Default)]
struct RecordingDelegate {
    terminated: AtomicUsize,
}

impl SupervisorDelegate for RecordingDelegate {
    fn on_terminal_signal(&self, _signo: i32) {}

    fn on_agent_thread_terminated(&self) {
        self.terminated.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn supervisor_survives_one_agent_dying_and_drains_on_shutdown() {
    let spawner = Arc::new(PipeSpawner::new());
    let delegate = Arc::new(RecordingDelegate::default());
    let supervisor = Supervisor::start(
        Arc::clone(&spawner) as Arc<dyn AgentSpawner>,
        Arc::clone(&delegate) as Arc<dyn SupervisorDelegate>,
    );

    for pid in [60_000, 60_001] {
        let add = supervisor.add_agent(AgentKind::ExternalSource, None);
        tokio::pin!(add);

        // Complete the handshake once the fake agent exists.
        loop {
            tokio::select! {
                ready = &mut add => {
                    assert!(ready);
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    if spawner.ready_writers.lock().iter().any(|(p, _)| *p == pid) {
                        spawner.make_ready(pid);
                    }
                }
            }
        }
    }

    // One agent dies; the supervisor keeps running.
    supervisor
        .monitor()
        .notify(60_000, ProcessState::TerminatedSignal(9));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!supervisor.is_terminated());
    assert_eq!(delegate.terminated.load(Ordering::SeqCst), 0);

    // Shutdown asks the survivor to exit; once it does, the supervisor
    // terminates and notifies the parent exactly once.
    supervisor.shutdown();
    supervisor
        .monitor()
        .notify(60_001, ProcessState::TerminatedExit(0));

    tokio::time::timeout(Duration::from_secs(2), supervisor.stopped().cancelled())
        .await
        .expect("supervisor stops");
    assert!(supervisor.is_terminated());
    assert_eq!(delegate.terminated.load(Ordering::SeqCst), 1);

    // Late operations are inert.
    supervisor.shutdown();
    assert!(!supervisor.add_agent(AgentKind::Perf, None).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(delegate.terminated.load(Ordering::SeqCst), 1);
}
