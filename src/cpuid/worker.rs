//! Per-core identification workers.
//!
//! Each worker pins itself to one logical CPU, forcing an offline core
//! online for the duration, reads `MIDR_EL1` and the core's topology
//! entries, reports back, and then stays parked on a release gate so the
//! core remains online while `/proc/cpuinfo` is re-read.

use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// Sentinel for an unreadable `MIDR_EL1`.
pub const INVALID_MIDR_EL1: u64 = u64::MAX;

/// Sentinel for an unreadable `physical_package_id`.
pub const INVALID_PACKAGE_ID: i32 = -1;

/// What one identification pass learned about a logical CPU.
#[derive(Debug, Clone)]
pub struct CpuIdentificationRecord {
    pub cpu: usize,
    pub midr_el1: u64,
    pub physical_package_id: i32,
    pub core_siblings: Vec<usize>,
}

/// Latch that keeps identification workers parked until released.
#[derive(Default)]
pub struct ReleaseGate {
    released: Mutex<bool>,
    cv: Condvar,
}

impl ReleaseGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpark every waiting worker.
    pub fn release(&self) {
        let mut released = self.released.lock();
        *released = true;
        self.cv.notify_all();
    }

    fn wait(&self) {
        let mut released = self.released.lock();
        while !*released {
            self.cv.wait(&mut released);
        }
    }
}

fn sysfs_cpu_dir(cpu: usize) -> PathBuf {
    PathBuf::from(format!("/sys/devices/system/cpu/cpu{cpu}"))
}

fn read_trimmed(path: PathBuf) -> Option<String> {
    match fs::read_to_string(&path) {
        Ok(s) => Some(s.trim().to_owned()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "sysfs read failed");
            None
        }
    }
}

fn parse_prefixed_int(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Parse a sysfs cpulist such as `0-3` or `0,4-7`.
fn parse_cpu_list(list: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    for range in list.trim().split(',') {
        if range.is_empty() {
            continue;
        }
        if let Some((start, end)) = range.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = range.parse::<usize>() {
            cpus.push(cpu);
        }
    }
    cpus
}

/// Read the identification data for `cpu` from the current thread.
///
/// Offline CPUs yield the invalid sentinels.
pub fn detect_for(cpu: usize) -> CpuIdentificationRecord {
    let dir = sysfs_cpu_dir(cpu);

    let midr_el1 = read_trimmed(dir.join("regs/identification/midr_el1"))
        .and_then(|s| parse_prefixed_int(&s))
        .map(|v| v as u64)
        .unwrap_or(INVALID_MIDR_EL1);

    let physical_package_id = read_trimmed(dir.join("topology/physical_package_id"))
        .and_then(|s| parse_prefixed_int(&s))
        .map(|v| v as i32)
        .unwrap_or(INVALID_PACKAGE_ID);

    let core_siblings = read_trimmed(dir.join("topology/core_siblings_list"))
        .map(|s| parse_cpu_list(&s))
        .unwrap_or_default();

    CpuIdentificationRecord {
        cpu,
        midr_el1,
        physical_package_id,
        core_siblings,
    }
}

/// Force `cpu` online, remembering whether it was offline before.
///
/// cpu0 has no online file on many systems; absence means always-online.
fn force_online(cpu: usize) -> bool {
    let path = sysfs_cpu_dir(cpu).join("online");
    match fs::read_to_string(&path) {
        Ok(s) if s.trim() == "0" => match fs::write(&path, "1") {
            Ok(()) => true,
            Err(e) => {
                debug!(cpu, error = %e, "failed to online core");
                false
            }
        },
        _ => false,
    }
}

fn restore_offline(cpu: usize) {
    let path = sysfs_cpu_dir(cpu).join("online");
    if let Err(e) = fs::write(&path, "0") {
        debug!(cpu, error = %e, "failed to restore core offline state");
    }
}

fn pin_to(cpu: usize) -> bool {
    let mut cpu_set = nix::sched::CpuSet::new();
    if cpu_set.set(cpu).is_err() {
        return false;
    }
    if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpu_set) {
        debug!(cpu, error = %e, "sched_setaffinity failed");
        return false;
    }

    // Wait until actually scheduled on the target core.
    for _ in 0..1000 {
        match nix::sched::sched_getcpu() {
            Ok(current) if current == cpu => return true,
            Ok(_) => thread::yield_now(),
            Err(_) => return false,
        }
    }
    false
}

/// Spawn one identification worker for `cpu`.
///
/// The worker onlines and pins to the core, reports its record through
/// `tx`, then parks on `gate` until the identifier has finished. The
/// caller joins the handle after releasing the gate.
pub fn spawn(
    cpu: usize,
    tx: Sender<CpuIdentificationRecord>,
    gate: Arc<ReleaseGate>,
) -> JoinHandle<()> {
    thread::Builder::new()
        .name(format!("cpuid-{cpu}"))
        .spawn(move || {
            let onlined = force_online(cpu);
            let pinned = pin_to(cpu);
            if !pinned {
                debug!(cpu, "could not pin to core, reading best-effort");
            }

            let record = detect_for(cpu);
            // Receiver may already have timed out; park regardless so the
            // core stays online for the cpuinfo pass.
            let _ = tx.send(record);

            gate.wait();

            if onlined {
                restore_offline(cpu);
            }
        })
        .expect("spawn identification worker")
}
