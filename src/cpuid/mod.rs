//! Per-core CPU identification.
//!
//! Fills one CPU-ID slot per possible logical CPU. In the default
//! force-online mode, one native worker thread per core pins itself there
//! (onlining the core if needed) and samples `MIDR_EL1` plus topology;
//! the workers stay parked until the pass finishes so offline cores remain
//! online while `/proc/cpuinfo` is consulted. Native threads are the point
//! here: occupying each CPU is the mechanism, so this component does not
//! run on the async reactor.

pub mod proc_cpuinfo;
pub mod topology;
pub mod worker;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::debug;

pub use worker::{CpuIdentificationRecord, INVALID_MIDR_EL1, INVALID_PACKAGE_ID};

use worker::ReleaseGate;

/// Slot value for a CPU whose type is unknown.
pub const INVALID_CPU_ID: i32 = -1;

/// Bound on the force-online collection pass.
const IDENTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Derive the 24-bit CPU-ID code from a `MIDR_EL1` value:
/// implementer byte in bits 12..20, part number in bits 0..12.
pub fn make_cpu_id(midr: u64) -> i32 {
    (((midr & 0xff00_0000) >> 12) | ((midr & 0xfff0) >> 4)) as i32
}

/// Number of possible logical CPUs, from the `cpuN` entries in sysfs.
///
/// Failure here is fatal: without a core count no capture can be sized.
pub fn max_core_count() -> Result<usize> {
    let entries = fs::read_dir("/sys/devices/system/cpu")
        .context("unable to determine the number of cores on the target")?;

    let mut max_core: Option<usize> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(rest) = name.to_str().and_then(|n| n.strip_prefix("cpu")) else {
            continue;
        };
        if let Ok(n) = rest.parse::<usize>() {
            max_core = Some(max_core.map_or(n + 1, |m| m.max(n + 1)));
        }
    }

    max_core.context("no cpu# directories found under /sys/devices/system/cpu")
}

/// Run one identification pass over `cpu_ids` (one slot per possible CPU).
///
/// Returns the hardware name when `wants_hardware_name` is set and
/// `/proc/cpuinfo` carries one. With `ignore_offline`, cores are probed
/// synchronously and offline ones keep [`INVALID_CPU_ID`].
pub fn read_cpu_info(
    ignore_offline: bool,
    wants_hardware_name: bool,
    cpu_ids: &mut [i32],
) -> Result<Option<String>> {
    let mut cpu_to_package: HashMap<usize, i32> = HashMap::new();
    let mut package_to_cpu_ids: HashMap<i32, BTreeSet<i32>> = HashMap::new();
    let mut cpu_to_cpu_id: HashMap<usize, i32> = HashMap::new();

    let mut collected: BTreeMap<usize, CpuIdentificationRecord> = BTreeMap::new();

    // Workers stay parked on the gate until after /proc/cpuinfo is read.
    let gate = Arc::new(ReleaseGate::new());
    let mut workers = Vec::new();

    if !ignore_offline {
        let (tx, rx) = mpsc::channel();
        for cpu in 0..cpu_ids.len() {
            workers.push(worker::spawn(cpu, tx.clone(), Arc::clone(&gate)));
        }
        drop(tx);

        let deadline = Instant::now() + IDENTIFICATION_TIMEOUT;
        while collected.len() < cpu_ids.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok(record) => {
                    collected.insert(record.cpu, record);
                }
                Err(_) => break,
            }
        }

        if collected.len() < cpu_ids.len() {
            debug!(
                activated = collected.len(),
                total = cpu_ids.len(),
                "could not identify all CPU cores within the timeout period",
            );
        }
    } else {
        for cpu in 0..cpu_ids.len() {
            collected.insert(cpu, worker::detect_for(cpu));
        }
    }

    for (&cpu, record) in &collected {
        let cpu_id = make_cpu_id(record.midr_el1);

        // Cluster/core mappings let us fill gaps later by assuming the
        // same core type per cluster.
        if record.physical_package_id != INVALID_PACKAGE_ID {
            cpu_to_package.insert(cpu, record.physical_package_id);

            if record.midr_el1 != INVALID_MIDR_EL1 {
                package_to_cpu_ids
                    .entry(record.physical_package_id)
                    .or_default()
                    .insert(cpu_id);
            }

            for &sibling in &record.core_siblings {
                cpu_to_package
                    .entry(sibling)
                    .or_insert(record.physical_package_id);
            }
        }

        if record.midr_el1 != INVALID_MIDR_EL1 {
            cpu_to_cpu_id.insert(cpu, cpu_id);
        }
    }

    for (cpu, cpu_id) in &cpu_to_cpu_id {
        debug!(cpu, cpu_id = format_args!("{cpu_id:#07x}"), "read cpu id from MIDR_EL1");
    }
    for (cpu, package) in &cpu_to_package {
        debug!(cpu, package, "read cpu package");
    }

    let know_all_midr_values = cpu_to_cpu_id.len() == cpu_ids.len();

    let hardware_name = if wants_hardware_name || !know_all_midr_values {
        proc_cpuinfo::read(know_all_midr_values, cpu_ids)?
    } else {
        None
    };

    // Override anything read from /proc/cpuinfo with direct MIDR reads and
    // topology agreement.
    topology::update_from_topology(
        cpu_ids,
        &cpu_to_cpu_id,
        &cpu_to_package,
        &package_to_cpu_ids,
    );

    gate.release();
    for handle in workers {
        if handle.join().is_err() {
            debug!("identification worker panicked");
        }
    }

    Ok(hardware_name)
}
