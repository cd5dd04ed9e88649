//! Event-group construction for `perf_event_open`.
//!
//! Builds per-group sampling descriptors from a capture configuration and
//! the detected kernel capabilities. Group leaders are synthesized here;
//! catalog-driven member events arrive through [`EventGroup::add_event`].
//! Every successfully added event is reported to the [`AttrKeyTracker`]
//! exactly once, with the attribute bytes that end up in the group.

use thiserror::Error;
use tracing::debug;

use super::attr::PerfEventAttr;
use super::constants::*;

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const NANOS_PER_100_MS: u64 = 100_000_000;

const MAX_AUX_WATERMARK: u32 = 2048 * 1024;
const MIN_AUX_WATERMARK: u32 = 4096;

/// Sentinel for an unresolved `sched_switch` tracepoint id.
pub const UNKNOWN_TRACEPOINT_ID: i64 = -1;

/// Kernel capability flags probed at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCapabilities {
    /// Capture covers the whole system rather than one app's task tree.
    pub is_system_wide: bool,
    /// Kernel space is inaccessible (paranoid level or explicit request).
    pub exclude_kernel: bool,
    /// Tracefs event ids are readable.
    pub can_access_tracepoints: bool,
    pub has_sample_identifier: bool,
    pub has_attr_comm_exec: bool,
    pub has_attr_clockid_support: bool,
    pub has_attr_context_switch: bool,
    pub has_count_sw_dummy: bool,
    pub has_exclude_callchain_kernel: bool,
    /// AArch64 register file (AArch32 otherwise).
    pub use_64bit_register_set: bool,
}

/// Sizes of the per-event mmap regions, in bytes.
#[derive(Debug, Clone, Copy)]
pub struct RingBufferConfig {
    pub data_buffer_size: usize,
    pub aux_buffer_size: usize,
}

/// Capture-wide inputs to group construction.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub capabilities: PerfCapabilities,
    pub ringbuffer: RingBufferConfig,
    /// Exclude kernel-space samples from every event that allows it.
    pub exclude_kernel_events: bool,
    /// Tracepoint id of `sched/sched_switch`, or [`UNKNOWN_TRACEPOINT_ID`].
    pub sched_switch_id: i64,
    /// Capture key reserved for the sched-switch leader.
    pub sched_switch_key: i32,
    /// Samples per second; 0 disables rate-driven sampling.
    pub sample_rate: u64,
    pub enable_periodic_sampling: bool,
    /// Callchain depth; 0 disables callchain collection.
    pub backtrace_depth: u32,
    /// Next synthesized event key, decreasing from -1.
    dummy_key_counter: i32,
}

impl GroupConfig {
    pub fn new(
        capabilities: PerfCapabilities,
        ringbuffer: RingBufferConfig,
        exclude_kernel_events: bool,
        sched_switch_id: i64,
        sched_switch_key: i32,
        sample_rate: u64,
        enable_periodic_sampling: bool,
        backtrace_depth: u32,
    ) -> Self {
        Self {
            capabilities,
            ringbuffer,
            exclude_kernel_events,
            sched_switch_id,
            sched_switch_key,
            sample_rate,
            enable_periodic_sampling,
            backtrace_depth,
            dummy_key_counter: -1,
        }
    }

    /// Allocate a key for an event that has no counter-catalog entry.
    pub fn next_dummy_key(&mut self) -> i32 {
        let key = self.dummy_key_counter;
        self.dummy_key_counter -= 1;
        key
    }
}

/// What a group is attached to, which determines leader policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// One group per CPU cluster, leader drives sched tracking.
    PerClusterCpu,
    /// One group per uncore PMU, leader drives periodic reads.
    UncorePmu,
    /// Events bound to a single CPU; every event stands alone.
    SpecificCpu,
    /// Process-wide software events; every event stands alone.
    Global,
    /// Statistical Profiling Extension aux-data events.
    Spe,
}

impl GroupKind {
    /// Whether members are tied to a mandatory `perf_event_open` leader.
    pub fn requires_leader(self) -> bool {
        matches!(self, GroupKind::PerClusterCpu | GroupKind::UncorePmu)
    }
}

/// Per-event request coming from the counter catalog (or synthesized).
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRequest {
    pub _type: u32,
    pub config: u64,
    pub config1: u64,
    pub config2: u64,
    pub sample_type: u64,
    pub period_or_freq: u64,
    pub freq: bool,
    pub mmap: bool,
    pub comm: bool,
    pub task: bool,
    pub context_switch: bool,
}

/// One configured event: the kernel descriptor plus its capture key.
#[derive(Debug, Clone)]
pub struct PerfEvent {
    pub attr: PerfEventAttr,
    pub key: i32,
}

/// Sink observing each `(key, attr)` pair as it is added to a group.
pub trait AttrKeyTracker {
    fn record(&mut self, key: i32, attr: &PerfEventAttr);
}

impl AttrKeyTracker for Vec<(i32, PerfEventAttr)> {
    fn record(&mut self, key: i32, attr: &PerfEventAttr) {
        self.push((key, *attr));
    }
}

/// Why a group could not be configured. The group is left untouched.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GroupError {
    #[error("SPE requires context switch information")]
    SpeRequiresContextSwitch,
    #[error("cannot set leader for non-empty group")]
    LeaderInNonEmptyGroup,
    #[error("group member count saturated")]
    GroupFull,
    #[error("sched_switch tracepoint id is unknown")]
    UnknownSchedSwitchId,
}

/// An ordered sequence of events sharing one `perf_event_open` grouping.
#[derive(Debug)]
pub struct EventGroup {
    kind: GroupKind,
    events: Vec<PerfEvent>,
}

impl EventGroup {
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind,
            events: Vec::new(),
        }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    pub fn events(&self) -> &[PerfEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The group leader, when the group kind mandates one and it exists.
    pub fn leader(&self) -> Option<&PerfEvent> {
        if self.kind.requires_leader() {
            self.events.first()
        } else {
            None
        }
    }

    /// Append one event.
    ///
    /// On error nothing is appended and the tracker sees nothing.
    pub fn add_event(
        &mut self,
        config: &GroupConfig,
        leader: bool,
        tracker: &mut dyn AttrKeyTracker,
        key: i32,
        request: &EventRequest,
        has_aux_data: bool,
    ) -> Result<(), GroupError> {
        if leader && !self.events.is_empty() {
            return Err(GroupError::LeaderInNonEmptyGroup);
        }
        if self.events.len() >= i32::MAX as usize {
            return Err(GroupError::GroupFull);
        }

        let attr = init_event(
            config,
            self.kind,
            false,
            self.kind.requires_leader(),
            leader,
            request,
            has_aux_data,
        )?;

        tracker.record(key, &attr);
        self.events.push(PerfEvent { attr, key });
        Ok(())
    }

    /// Synthesize the mandatory leader for this group's kind.
    ///
    /// Only meaningful for [`GroupKind::PerClusterCpu`] and
    /// [`GroupKind::UncorePmu`]; other kinds never call this.
    pub fn create_leader(
        &mut self,
        config: &mut GroupConfig,
        tracker: &mut dyn AttrKeyTracker,
    ) -> Result<(), GroupError> {
        match self.kind {
            GroupKind::PerClusterCpu => self.create_cpu_group_leader(config, tracker),
            GroupKind::UncorePmu => self.create_uncore_group_leader(config, tracker),
            kind => unreachable!("group kind {kind:?} has no synthesized leader"),
        }
    }

    fn create_cpu_group_leader(
        &mut self,
        config: &mut GroupConfig,
        tracker: &mut dyn AttrKeyTracker,
    ) -> Result<(), GroupError> {
        let caps = config.capabilities;
        let enable_callchain = config.backtrace_depth > 0;
        let callchain_bits = if enable_callchain {
            PERF_SAMPLE_CALLCHAIN
        } else {
            0
        };

        let mut request = EventRequest {
            sample_type: PERF_SAMPLE_TID | PERF_SAMPLE_READ,
            mmap: true,
            comm: true,
            task: true,
            ..Default::default()
        };
        let mut enable_task_clock = false;

        if caps.can_access_tracepoints && caps.is_system_wide {
            // Drive sampling from sched_switch so counts attribute exactly
            // to each thread.
            if config.sched_switch_id == UNKNOWN_TRACEPOINT_ID {
                debug!("unable to read sched_switch id");
                return Err(GroupError::UnknownSchedSwitchId);
            }
            request._type = PERF_TYPE_TRACEPOINT;
            request.config = config.sched_switch_id as u64;
            request.period_or_freq = 1;
            request.sample_type |= PERF_SAMPLE_RAW;
        } else {
            request._type = PERF_TYPE_SOFTWARE;
            if caps.has_attr_context_switch {
                // Collect sched switch info directly from perf.
                request.context_switch = true;

                if caps.has_count_sw_dummy {
                    request.config = PERF_COUNT_SW_DUMMY;
                    request.period_or_freq = 0;
                } else {
                    request.config = PERF_COUNT_SW_CPU_CLOCK;
                    request.period_or_freq = sampling_period(config);
                    request.sample_type |= PERF_SAMPLE_TID
                        | PERF_SAMPLE_IP
                        | PERF_SAMPLE_READ
                        | callchain_bits;
                }
            } else if !caps.exclude_kernel {
                // Context switches give us switch-out events.
                request.config = PERF_COUNT_SW_CONTEXT_SWITCHES;
                request.period_or_freq = 1;
                request.sample_type |= PERF_SAMPLE_TID;
                enable_task_clock = true;
            } else {
                // No context switch information at all.
                request.config = PERF_COUNT_SW_CPU_CLOCK;
                request.period_or_freq = sampling_period(config);
                request.sample_type |=
                    PERF_SAMPLE_TID | PERF_SAMPLE_IP | PERF_SAMPLE_READ | callchain_bits;
            }
        }

        self.add_event(
            config,
            true,
            tracker,
            config.sched_switch_key,
            &request,
            false,
        )?;

        // Periodic PC sampling, unless the leader already samples the clock.
        if request.config != PERF_COUNT_SW_CPU_CLOCK
            && config.sample_rate > 0
            && config.enable_periodic_sampling
        {
            let pc_request = EventRequest {
                _type: PERF_TYPE_SOFTWARE,
                config: PERF_COUNT_SW_CPU_CLOCK,
                sample_type: PERF_SAMPLE_TID | PERF_SAMPLE_IP | PERF_SAMPLE_READ | callchain_bits,
                period_or_freq: NANOS_PER_SECOND / config.sample_rate,
                ..Default::default()
            };
            let key = config.next_dummy_key();
            self.add_event(config, false, tracker, key, &pc_request, false)?;
        }

        // High frequency task clock to approximate switch-in events after a
        // context-switch-out leader.
        if enable_task_clock {
            let task_clock_request = EventRequest {
                _type: PERF_TYPE_SOFTWARE,
                config: PERF_COUNT_SW_TASK_CLOCK,
                period_or_freq: 100_000, // 100us
                sample_type: PERF_SAMPLE_TID,
                ..Default::default()
            };
            let key = config.next_dummy_key();
            self.add_event(config, false, tracker, key, &task_clock_request, false)?;
        }

        Ok(())
    }

    fn create_uncore_group_leader(
        &mut self,
        config: &mut GroupConfig,
        tracker: &mut dyn AttrKeyTracker,
    ) -> Result<(), GroupError> {
        // Uncore PMUs are read every 100ms when rate-driven sampling is off,
        // otherwise they would never be sampled.
        let request = EventRequest {
            _type: PERF_TYPE_SOFTWARE,
            config: PERF_COUNT_SW_CPU_CLOCK,
            sample_type: PERF_SAMPLE_READ,
            period_or_freq: if config.sample_rate > 0 {
                NANOS_PER_SECOND / config.sample_rate
            } else {
                NANOS_PER_100_MS
            },
            ..Default::default()
        };

        let key = config.next_dummy_key();
        self.add_event(config, true, tracker, key, &request, false)
    }
}

fn sampling_period(config: &GroupConfig) -> u64 {
    if config.sample_rate > 0 && config.enable_periodic_sampling {
        NANOS_PER_SECOND / config.sample_rate
    } else {
        0
    }
}

/// Decode whether `exclude_kernel` (and friends) should be set.
///
/// Software context-switch counters stay unfiltered: excluding kernel
/// space there would suppress the switch records themselves.
pub fn should_exclude_kernel(_type: u32, config: u64, exclude_requested: bool) -> bool {
    if !exclude_requested {
        return false;
    }
    if _type == PERF_TYPE_SOFTWARE {
        return config != PERF_COUNT_SW_CONTEXT_SWITCHES;
    }
    true
}

/// Pick the aux ring wake-up threshold from the sampling rate.
///
/// Wakes after roughly 1/10th of a second of data (assuming 24 bytes per
/// sample) or half the mmap, clamped to keep per-wake processing sane in
/// system-wide captures.
fn calculate_aux_watermark(mmap_size: usize, sample_period: u64) -> u32 {
    const FRACTION_OF_SECOND: u64 = 10;

    let frequency = (NANOS_PER_SECOND / sample_period.max(1)).max(1);
    let bps = 24 * frequency;

    let pref_watermark = (mmap_size as u64 / 2).min(bps / FRACTION_OF_SECOND);

    (pref_watermark.min(u64::from(MAX_AUX_WATERMARK)) as u32).max(MIN_AUX_WATERMARK)
}

/// Build the kernel descriptor for one event.
fn init_event(
    config: &GroupConfig,
    kind: GroupKind,
    is_header: bool,
    requires_leader: bool,
    leader: bool,
    request: &EventRequest,
    has_aux_data: bool,
) -> Result<PerfEventAttr, GroupError> {
    let caps = config.capabilities;
    let mut attr = PerfEventAttr::new();

    // PERF_SAMPLE_READ is not allowed together with inherit, so strip it in
    // application mode.
    let sample_read_mask = if caps.is_system_wide {
        0
    } else {
        PERF_SAMPLE_READ
    };
    attr.sample_type = PERF_SAMPLE_TIME
        | (request.sample_type & !sample_read_mask)
        // required fields for reading 'id'
        | if caps.has_sample_identifier {
            PERF_SAMPLE_IDENTIFIER
        } else {
            PERF_SAMPLE_TID | PERF_SAMPLE_IP | PERF_SAMPLE_ID
        }
        // tracepoints deliver their payload via PERIOD
        | if request._type == PERF_TYPE_TRACEPOINT {
            PERF_SAMPLE_PERIOD
        } else {
            0
        }
        // always sample TID in application mode; counter values are
        // attributed to their processes with it
        | if caps.is_system_wide && !request.context_switch {
            0
        } else {
            PERF_SAMPLE_TID
        }
        // the actual period value is only readable via PERIOD when freq
        | if request.freq { PERF_SAMPLE_PERIOD } else { 0 };

    // Collect the user mode registers when sampling the callchain.
    if attr.sample_type & PERF_SAMPLE_CALLCHAIN != 0 {
        attr.sample_type |= PERF_SAMPLE_REGS_USER;
        attr.sample_regs_user = if caps.use_64bit_register_set {
            SAMPLE_REGS_USER_ARM64
        } else {
            SAMPLE_REGS_USER_ARM32
        };
    }

    // Count new children in application mode; never in system-wide mode.
    let use_inherit = !(caps.is_system_wide || is_header);
    // With no mandatory leader every event is in its own group.
    let every_attribute_in_own_group = use_inherit || !requires_leader || is_header;
    // PERF_FORMAT_GROUP only on a true leader; it is incompatible with
    // inherit.
    let use_read_format_group =
        leader && !use_inherit && !every_attribute_in_own_group && !is_header;

    let exclude_kernel =
        should_exclude_kernel(request._type, request.config, config.exclude_kernel_events);

    attr.flags.set_inherit(u64::from(use_inherit));
    attr.flags.set_inherit_stat(u64::from(use_inherit));
    attr.read_format = if use_read_format_group {
        PERF_FORMAT_ID | PERF_FORMAT_GROUP
    } else {
        PERF_FORMAT_ID
    };

    // Only a perf_event_open group leader can be pinned; stand-alone events
    // are their own leader.
    let pinned = leader || every_attribute_in_own_group || is_header;
    attr.flags.set_pinned(u64::from(pinned));
    // Group leaders start disabled and are enabled once the whole group is
    // configured; members follow their leader.
    attr.flags.set_disabled(u64::from(pinned));
    attr.flags.set_watermark(1);
    attr.wakeup_watermark = (config.ringbuffer.data_buffer_size / 2) as u32;

    if caps.has_attr_clockid_support {
        attr.flags.set_use_clockid(1);
        attr.clockid = CLOCK_MONOTONIC_RAW;
    }

    attr._type = request._type;
    attr.config = request.config;
    attr.config1 = request.config1;
    attr.config2 = request.config2;
    attr.sample_period = request.period_or_freq;
    attr.flags.set_mmap(u64::from(request.mmap));
    attr.flags.set_comm(u64::from(request.comm));
    attr.flags
        .set_comm_exec(u64::from(request.comm && caps.has_attr_comm_exec));
    attr.flags.set_freq(u64::from(request.freq));
    attr.flags.set_task(u64::from(request.task));
    // Required for any non-grouped event; ignored for grouped non-leaders.
    attr.flags.set_sample_id_all(1);
    attr.flags
        .set_context_switch(u64::from(request.context_switch));
    attr.flags.set_exclude_kernel(u64::from(exclude_kernel));
    attr.flags.set_exclude_hv(u64::from(exclude_kernel));
    attr.flags.set_exclude_idle(u64::from(exclude_kernel));
    attr.flags.set_exclude_callchain_kernel(u64::from(
        config.exclude_kernel_events && caps.has_exclude_callchain_kernel,
    ));
    attr.aux_watermark = if has_aux_data {
        calculate_aux_watermark(config.ringbuffer.aux_buffer_size, attr.sample_period)
    } else {
        0
    };

    // SPE needs context switch boundaries in the stream; ITRACE_START is
    // not guaranteed between two processes sampled by the same attribute.
    if kind == GroupKind::Spe {
        if !caps.has_attr_context_switch {
            return Err(GroupError::SpeRequiresContextSwitch);
        }
        attr.flags.set_context_switch(1);
    }

    Ok(attr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(caps: PerfCapabilities) -> GroupConfig {
        GroupConfig::new(
            caps,
            RingBufferConfig {
                data_buffer_size: 1 << 20,
                aux_buffer_size: 1 << 22,
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
    fn test_system_wide_dummy_leader() {
        // Kernel with PERF_COUNT_SW_DUMMY and attr.context_switch.
        let caps = PerfCapabilities {
            is_system_wide: true,
            has_attr_context_switch: true,
            has_count_sw_dummy: true,
            ..Default::default()
        };
        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::PerClusterCpu);

        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");

        assert_eq!(group.events().len(), 2);

        let leader = &group.events()[0];
        assert_eq!(leader.attr._type, PERF_TYPE_SOFTWARE);
        assert_eq!(leader.attr.config, PERF_COUNT_SW_DUMMY);
        assert_eq!(leader.attr.sample_period, 0);
        assert_eq!(leader.attr.flags.context_switch(), 1);
        assert_eq!(leader.attr.flags.pinned(), 1);
        assert_eq!(leader.attr.flags.disabled(), 1);
        assert_eq!(leader.key, 1);

        let sampler = &group.events()[1];
        assert_eq!(sampler.attr.config, PERF_COUNT_SW_CPU_CLOCK);
        assert_eq!(sampler.attr.sample_period, 1_000_000);
        assert_eq!(sampler.attr.flags.pinned(), 0);
        assert_eq!(sampler.attr.flags.disabled(), 0);
        assert_eq!(sampler.key, -1);
    }

    #[test]
    fn test_app_mode_context_switches_leader_with_task_clock() {
        // No attr.context_switch, kernel space accessible, app mode.
        let caps = PerfCapabilities::default();
        let mut config = test_config(caps);
        config.enable_periodic_sampling = false;

        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::PerClusterCpu);

        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");

        assert_eq!(group.events().len(), 2);

        let leader = &group.events()[0];
        assert_eq!(leader.attr.config, PERF_COUNT_SW_CONTEXT_SWITCHES);
        assert_eq!(leader.attr.sample_period, 1);
        assert_eq!(leader.attr.flags.inherit(), 1);

        let task_clock = &group.events()[1];
        assert_eq!(task_clock.attr.config, PERF_COUNT_SW_TASK_CLOCK);
        assert_eq!(task_clock.attr.sample_period, 100_000);
        assert_ne!(task_clock.attr.sample_type & PERF_SAMPLE_TID, 0);
    }

    #[test]
    fn test_spe_without_context_switch_fails_cleanly() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            ..Default::default()
        };
        let config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::Spe);

        let request = EventRequest {
            _type: 8, // an SPE PMU type id
            period_or_freq: 2048,
            ..Default::default()
        };
        let result = group.add_event(&config, false, &mut tracker, 5, &request, true);

        assert_eq!(result, Err(GroupError::SpeRequiresContextSwitch));
        assert!(group.is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_tracepoint_leader_needs_sched_switch_id() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            can_access_tracepoints: true,
            ..Default::default()
        };
        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::PerClusterCpu);

        assert_eq!(
            group.create_leader(&mut config, &mut tracker),
            Err(GroupError::UnknownSchedSwitchId)
        );
        assert!(group.is_empty());

        config.sched_switch_id = 317;
        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");

        let leader = &group.events()[0];
        assert_eq!(leader.attr._type, PERF_TYPE_TRACEPOINT);
        assert_eq!(leader.attr.config, 317);
        assert_ne!(leader.attr.sample_type & PERF_SAMPLE_RAW, 0);
        // Tracepoints always carry PERIOD.
        assert_ne!(leader.attr.sample_type & PERF_SAMPLE_PERIOD, 0);
    }

    #[test]
    fn test_leader_on_non_empty_group_rejected() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            has_attr_context_switch: true,
            has_count_sw_dummy: true,
            ..Default::default()
        };
        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::PerClusterCpu);

        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");
        let before = group.events().len();

        let result = group.add_event(
            &config,
            true,
            &mut tracker,
            99,
            &EventRequest::default(),
            false,
        );
        assert_eq!(result, Err(GroupError::LeaderInNonEmptyGroup));
        assert_eq!(group.events().len(), before);
    }

    #[test]
    fn test_tracker_sees_final_attr_bytes() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            has_attr_context_switch: true,
            has_count_sw_dummy: true,
            has_sample_identifier: true,
            ..Default::default()
        };
        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::PerClusterCpu);

        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");

        let request = EventRequest {
            _type: PERF_TYPE_RAW,
            config: 0x11, // CPU_CYCLES on an Arm PMU
            sample_type: PERF_SAMPLE_READ,
            ..Default::default()
        };
        group
            .add_event(&config, false, &mut tracker, 7, &request, false)
            .expect("member");

        assert_eq!(tracker.len(), group.events().len());
        for ((key, tracked), event) in tracker.iter().zip(group.events()) {
            assert_eq!(*key, event.key);
            assert_eq!(tracked.as_bytes(), event.attr.as_bytes());
        }
    }

    #[test]
    fn test_pinned_leader_is_first_and_unique() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            has_attr_context_switch: true,
            has_count_sw_dummy: true,
            ..Default::default()
        };
        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::PerClusterCpu);

        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");
        for i in 0..3 {
            let request = EventRequest {
                _type: PERF_TYPE_RAW,
                config: 0x10 + i,
                sample_type: PERF_SAMPLE_READ,
                ..Default::default()
            };
            group
                .add_event(&config, false, &mut tracker, 10 + i as i32, &request, false)
                .expect("member");
        }

        let pinned: Vec<usize> = group
            .events()
            .iter()
            .enumerate()
            .filter(|(_, e)| e.attr.flags.pinned() == 1)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pinned, vec![0]);
        assert_eq!(group.leader().expect("leader").key, 1);
    }

    #[test]
    fn test_callchain_sets_user_register_masks() {
        for (use_64bit, expected) in [
            (true, SAMPLE_REGS_USER_ARM64),
            (false, SAMPLE_REGS_USER_ARM32),
        ] {
            let caps = PerfCapabilities {
                is_system_wide: true,
                use_64bit_register_set: use_64bit,
                ..Default::default()
            };
            let mut config = test_config(caps);
            config.backtrace_depth = 16;
            config.capabilities.exclude_kernel = true; // forces CPU_CLOCK leader

            let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
            let mut group = EventGroup::new(GroupKind::PerClusterCpu);
            group
                .create_leader(&mut config, &mut tracker)
                .expect("leader");

            let leader = &group.events()[0];
            assert_ne!(leader.attr.sample_type & PERF_SAMPLE_CALLCHAIN, 0);
            assert_ne!(leader.attr.sample_type & PERF_SAMPLE_REGS_USER, 0);
            assert_eq!(leader.attr.sample_regs_user, expected);
        }
    }

    #[test]
    fn test_aux_watermark_clamped() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            has_attr_context_switch: true,
            ..Default::default()
        };

        // Long period => tiny preferred watermark => clamped up to the min.
        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::Spe);
        let request = EventRequest {
            _type: 8,
            period_or_freq: 1_000_000_000,
            ..Default::default()
        };
        group
            .add_event(&config, false, &mut tracker, 3, &request, true)
            .expect("event");
        assert_eq!(group.events()[0].attr.aux_watermark, MIN_AUX_WATERMARK);

        // Tiny period with a huge aux mmap => clamped down to the max.
        config.ringbuffer.aux_buffer_size = 1 << 30;
        let mut group = EventGroup::new(GroupKind::Spe);
        let request = EventRequest {
            _type: 8,
            period_or_freq: 1,
            ..Default::default()
        };
        group
            .add_event(&config, false, &mut tracker, 4, &request, true)
            .expect("event");
        let wm = group.events()[0].attr.aux_watermark;
        assert!(wm >= MIN_AUX_WATERMARK && wm <= MAX_AUX_WATERMARK);
        assert_eq!(wm, MAX_AUX_WATERMARK);

        // Non-aux events carry no watermark.
        let mut group = EventGroup::new(GroupKind::Global);
        group
            .add_event(
                &config,
                false,
                &mut tracker,
                5,
                &EventRequest::default(),
                false,
            )
            .expect("event");
        assert_eq!(group.events()[0].attr.aux_watermark, 0);
    }

    #[test]
    fn test_should_exclude_kernel_table() {
        // Software context switches are never excluded.
        assert!(!should_exclude_kernel(
            PERF_TYPE_SOFTWARE,
            PERF_COUNT_SW_CONTEXT_SWITCHES,
            true
        ));

        // Everything else follows the request.
        for (t, c) in [
            (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK),
            (PERF_TYPE_SOFTWARE, PERF_COUNT_SW_DUMMY),
            (PERF_TYPE_HARDWARE, 0),
            (PERF_TYPE_TRACEPOINT, 317),
            (PERF_TYPE_RAW, 0x11),
        ] {
            assert!(should_exclude_kernel(t, c, true), "type={t} config={c}");
            assert!(!should_exclude_kernel(t, c, false), "type={t} config={c}");
        }
    }

    #[test]
    fn test_dummy_keys_decrease_monotonically() {
        let caps = PerfCapabilities::default();
        let mut config = test_config(caps);
        assert_eq!(config.next_dummy_key(), -1);
        assert_eq!(config.next_dummy_key(), -2);
        assert_eq!(config.next_dummy_key(), -3);
    }

    #[test]
    fn test_uncore_leader_period() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            ..Default::default()
        };

        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();
        let mut group = EventGroup::new(GroupKind::UncorePmu);
        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");
        assert_eq!(group.events()[0].attr.sample_period, 1_000_000);

        // Sample rate "none" falls back to 100ms.
        let mut config = test_config(caps);
        config.sample_rate = 0;
        let mut group = EventGroup::new(GroupKind::UncorePmu);
        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");
        assert_eq!(group.events()[0].attr.sample_period, 100_000_000);
    }

    #[test]
    fn test_read_format_group_only_on_true_leader() {
        let caps = PerfCapabilities {
            is_system_wide: true,
            has_attr_context_switch: true,
            has_count_sw_dummy: true,
            ..Default::default()
        };
        let mut config = test_config(caps);
        let mut tracker: Vec<(i32, PerfEventAttr)> = Vec::new();

        let mut group = EventGroup::new(GroupKind::PerClusterCpu);
        group
            .create_leader(&mut config, &mut tracker)
            .expect("leader");
        assert_eq!(
            group.events()[0].attr.read_format,
            PERF_FORMAT_ID | PERF_FORMAT_GROUP
        );
        assert_eq!(group.events()[1].attr.read_format, PERF_FORMAT_ID);

        // Stand-alone kinds never use the group format.
        let mut group = EventGroup::new(GroupKind::Global);
        group
            .add_event(
                &config,
                false,
                &mut tracker,
                8,
                &EventRequest::default(),
                false,
            )
            .expect("event");
        assert_eq!(group.events()[0].attr.read_format, PERF_FORMAT_ID);
    }
}
