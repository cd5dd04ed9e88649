//! Topology-based CPU-ID completion.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

/// Fill `cpu_ids` from directly-read MIDR values and package topology.
///
/// Directly-read values override whatever `/proc/cpuinfo` produced. A CPU
/// that is still unknown adopts its package's CPU-ID, but only when every
/// known CPU-ID inside that package agrees.
pub fn update_from_topology(
    cpu_ids: &mut [i32],
    cpu_to_cpu_id: &HashMap<usize, i32>,
    cpu_to_package: &HashMap<usize, i32>,
    package_to_cpu_ids: &HashMap<i32, BTreeSet<i32>>,
) {
    for (&cpu, &cpu_id) in cpu_to_cpu_id {
        if cpu < cpu_ids.len() {
            cpu_ids[cpu] = cpu_id;
        }
    }

    for (cpu, slot) in cpu_ids.iter_mut().enumerate() {
        if *slot != -1 {
            continue;
        }

        let Some(package) = cpu_to_package.get(&cpu) else {
            continue;
        };
        let Some(known) = package_to_cpu_ids.get(package) else {
            continue;
        };

        if known.len() == 1 {
            let adopted = *known.iter().next().expect("non-empty set");
            debug!(
                cpu,
                package,
                cpu_id = format_args!("{adopted:#x}"),
                "adopting package cpu id",
            );
            *slot = adopted;
        }
    }
}
