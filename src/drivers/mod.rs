//! Counter drivers.
//!
//! Each driver owns an ordered sequence of [`Counter`]s. The counter kinds
//! form a closed sum so that iteration over a driver's counters is
//! exhaustive by tag.

pub mod atrace;
pub mod mali;

pub use atrace::AtraceDriver;
pub use mali::{enumerate_mali_devices, MaliDevice};

use crate::perf::EventRequest;

/// Counter controlled by the atrace property mechanism.
#[derive(Debug, Clone)]
pub struct AtraceCounter {
    pub name: String,
    /// Bit contributed to `debug.atrace.tags.enableflags`.
    pub flag: i32,
    pub enabled: bool,
}

/// Counter backed by a perf event.
#[derive(Debug, Clone)]
pub struct PerfCounter {
    pub name: String,
    pub event: EventRequest,
    pub key: i32,
    pub enabled: bool,
}

/// Counter read from a Mali GPU device.
#[derive(Debug, Clone)]
pub struct MaliCounter {
    pub name: String,
    pub device: u32,
    pub enabled: bool,
}

/// A counter a driver can expose.
#[derive(Debug, Clone)]
pub enum Counter {
    Atrace(AtraceCounter),
    Perf(PerfCounter),
    Mali(MaliCounter),
}

impl Counter {
    pub fn name(&self) -> &str {
        match self {
            Counter::Atrace(c) => &c.name,
            Counter::Perf(c) => &c.name,
            Counter::Mali(c) => &c.name,
        }
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            Counter::Atrace(c) => c.enabled,
            Counter::Perf(c) => c.enabled,
            Counter::Mali(c) => c.enabled,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        match self {
            Counter::Atrace(c) => c.enabled = enabled,
            Counter::Perf(c) => c.enabled = enabled,
            Counter::Mali(c) => c.enabled = enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_accessors_cover_all_tags() {
        let mut counters = vec![
            Counter::Atrace(AtraceCounter {
                name: "atrace_gfx".into(),
                flag: 1 << 1,
                enabled: false,
            }),
            Counter::Perf(PerfCounter {
                name: "cpu_cycles".into(),
                event: EventRequest::default(),
                key: 42,
                enabled: false,
            }),
            Counter::Mali(MaliCounter {
                name: "mali_gpu_active".into(),
                device: 0,
                enabled: false,
            }),
        ];

        for counter in &mut counters {
            assert!(!counter.is_enabled());
            counter.set_enabled(true);
            assert!(counter.is_enabled());
            assert!(!counter.name().is_empty());
        }
    }
}
