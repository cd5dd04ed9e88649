//! Kernel-facing `perf_event_attr` descriptor.
//!
//! The struct layout is bit-for-bit the one consumed by
//! `perf_event_open(2)` (through the `aux_sample_size` extension), so it
//! can be handed to the syscall and marshaled onto the wire as raw bytes.

use std::mem;
use std::slice;

use bitfield::bitfield;

bitfield! {
    /// The packed flag word of `perf_event_attr`.
    #[derive(Clone, Copy)]
    pub struct PerfEventAttrFlags(u64);
    impl Debug;
    pub disabled, set_disabled: 0, 0;
    pub inherit, set_inherit: 1, 1;
    pub pinned, set_pinned: 2, 2;
    pub exclusive, set_exclusive: 3, 3;
    pub exclude_user, set_exclude_user: 4, 4;
    pub exclude_kernel, set_exclude_kernel: 5, 5;
    pub exclude_hv, set_exclude_hv: 6, 6;
    pub exclude_idle, set_exclude_idle: 7, 7;
    pub mmap, set_mmap: 8, 8;
    pub comm, set_comm: 9, 9;
    pub freq, set_freq: 10, 10;
    pub inherit_stat, set_inherit_stat: 11, 11;
    pub enable_on_exec, set_enable_on_exec: 12, 12;
    pub task, set_task: 13, 13;
    pub watermark, set_watermark: 14, 14;
    pub precise_ip, set_precise_ip: 15, 16;
    pub mmap_data, set_mmap_data: 17, 17;
    pub sample_id_all, set_sample_id_all: 18, 18;
    pub exclude_host, set_exclude_host: 19, 19;
    pub exclude_guest, set_exclude_guest: 20, 20;
    pub exclude_callchain_kernel, set_exclude_callchain_kernel: 21, 21;
    pub exclude_callchain_user, set_exclude_callchain_user: 22, 22;
    pub mmap2, set_mmap2: 23, 23;
    pub comm_exec, set_comm_exec: 24, 24;
    pub use_clockid, set_use_clockid: 25, 25;
    pub context_switch, set_context_switch: 26, 26;
    pub write_backward, set_write_backward: 27, 27;
    pub namespaces, set_namespaces: 28, 28;
    pub ksymbol, set_ksymbol: 29, 29;
    pub bpf_event, set_bpf_event: 30, 30;
    pub aux_output, set_aux_output: 31, 31;
    pub cgroup, set_cgroup: 32, 32;
    pub text_poke, set_text_poke: 33, 33;
    pub build_id, set_build_id: 34, 34;
    pub inherit_thread, set_inherit_thread: 35, 35;
    pub remove_on_exec, set_remove_on_exec: 36, 36;
    pub sigtrap, set_sigtrap: 37, 37;
    pub reserved_1, _: 38, 63;
}

/// `perf_event_attr`, laid out as the kernel expects it.
///
/// `sample_period` doubles as `sample_freq` when the `freq` flag is set,
/// `wakeup_watermark` as `wakeup_events` when `watermark` is clear, and
/// `config1`/`config2` alias the breakpoint fields; the aliased members
/// share storage in the kernel header so a plain field keeps the layout.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PerfEventAttr {
    pub _type: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: PerfEventAttrFlags,
    pub wakeup_watermark: u32,
    pub bp_type: u32,
    pub config1: u64,
    pub config2: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub reserved_2: u16,
    pub aux_sample_size: u32,
    pub reserved_3: u32,
}

impl PerfEventAttr {
    /// A zeroed attribute with `size` pre-set to this struct's length.
    pub fn new() -> Self {
        let mut attr: Self = unsafe { mem::zeroed() };
        attr.size = mem::size_of::<Self>() as u32;
        attr
    }

    /// The attribute viewed as the byte span the kernel and the wire see.
    ///
    /// The span length is `size`, never more than the struct itself.
    pub fn as_bytes(&self) -> &[u8] {
        let len = (self.size as usize).min(mem::size_of::<Self>());
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, len) }
    }
}

impl Default for PerfEventAttr {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for PerfEventAttr {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for PerfEventAttr {}

impl std::fmt::Debug for PerfEventAttr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfEventAttr")
            .field("type", &self._type)
            .field("config", &self.config)
            .field("sample_period", &self.sample_period)
            .field("sample_type", &format_args!("{:#x}", self.sample_type))
            .field("read_format", &self.read_format)
            .field("flags", &self.flags)
            .field("aux_watermark", &self.aux_watermark)
            .finish_non_exhaustive()
    }
}
