//! Capture timestamps.
//!
//! All record timestamps are nanoseconds since capture start on
//! `CLOCK_MONOTONIC_RAW`, the same clock the kernel stamps perf samples
//! with when `use_clockid` is honored.

use anyhow::{Context, Result};
use nix::time::{clock_gettime, ClockId};

/// Monotonic-raw clock anchored at capture start.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaptureClock {
    start_ns: u64,
}

impl CaptureClock {
    /// Anchor the clock at the current instant.
    pub fn start() -> Result<Self> {
        Ok(Self {
            start_ns: raw_monotonic_ns()?,
        })
    }

    /// Nanoseconds elapsed since capture start.
    pub fn now(&self) -> u64 {
        raw_monotonic_ns()
            .map(|now| now.saturating_sub(self.start_ns))
            .unwrap_or(0)
    }
}

fn raw_monotonic_ns() -> Result<u64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC_RAW).context("reading CLOCK_MONOTONIC_RAW")?;
    Ok(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let clock = CaptureClock::start().expect("clock");
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_now_advances() {
        let clock = CaptureClock::start().expect("clock");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(clock.now() >= 5_000_000);
    }
}
