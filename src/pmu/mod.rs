//! Catalog of known CPU and uncore PMUs.
//!
//! The catalog is assembled once at startup from a built-in descriptor
//! table plus any extras supplied through the configuration, and is
//! read-only afterwards; concurrent readers need no synchronization.

use serde::Deserialize;

/// Descriptor for one CPU PMU (a core type).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CpuDescriptor {
    /// Human-readable core name, e.g. "Cortex-A76".
    pub core_name: String,
    /// Stable identifier, e.g. "ARMv8_Cortex_A76".
    pub id: String,
    /// Counter-set id used by the counter catalog.
    pub counter_set: String,
    /// Device-tree compatible string, when one exists.
    #[serde(default)]
    pub dt_name: Option<String>,
    /// SPE PMU name, when the core has the Statistical Profiling Extension.
    #[serde(default)]
    pub spe_name: Option<String>,
    /// CPU-ID codes ((implementer << 12) | part), ascending, non-empty.
    pub cpu_ids: Vec<i32>,
    /// Number of programmable PMU counters.
    pub pmnc_counters: i32,
    /// Whether this is an ARMv8 core.
    #[serde(default)]
    pub is_v8: bool,
}

impl CpuDescriptor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core_name: &str,
        id: &str,
        counter_set: &str,
        dt_name: Option<&str>,
        spe_name: Option<&str>,
        mut cpu_ids: Vec<i32>,
        pmnc_counters: i32,
        is_v8: bool,
    ) -> Self {
        assert!(!cpu_ids.is_empty(), "descriptor requires at least one cpu id");
        cpu_ids.sort_unstable();
        cpu_ids.dedup();

        Self {
            core_name: core_name.to_owned(),
            id: id.to_owned(),
            counter_set: counter_set.to_owned(),
            dt_name: dt_name.map(str::to_owned),
            spe_name: spe_name.map(str::to_owned),
            cpu_ids,
            pmnc_counters,
            is_v8,
        }
    }

    /// A copy of this descriptor with the SPE PMU name filled in.
    pub fn with_spe_name(&self, spe_name: &str) -> Self {
        Self {
            spe_name: Some(spe_name.to_owned()),
            ..self.clone()
        }
    }

    pub fn min_cpu_id(&self) -> i32 {
        self.cpu_ids[0]
    }

    pub fn max_cpu_id(&self) -> i32 {
        self.cpu_ids[self.cpu_ids.len() - 1]
    }

    pub fn has_cpu_id(&self, cpu_id: i32) -> bool {
        self.cpu_ids.contains(&cpu_id)
    }
}

impl PartialOrd for CpuDescriptor {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CpuDescriptor {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

/// Descriptor for one uncore PMU (interconnect, memory controller, DSU...).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UncoreDescriptor {
    pub core_name: String,
    pub id: String,
    pub counter_set: String,
    /// Device instance suffix; empty means the PMU is uninstanced.
    #[serde(default)]
    pub device_instance: String,
    pub pmnc_counters: i32,
    /// Whether the PMU exposes a fixed cycles counter.
    #[serde(default)]
    pub has_cycles_counter: bool,
}

impl UncoreDescriptor {
    pub fn new(
        core_name: &str,
        id: &str,
        counter_set: &str,
        device_instance: &str,
        pmnc_counters: i32,
        has_cycles_counter: bool,
    ) -> Self {
        Self {
            core_name: core_name.to_owned(),
            id: id.to_owned(),
            counter_set: counter_set.to_owned(),
            device_instance: device_instance.to_owned(),
            pmnc_counters,
            has_cycles_counter,
        }
    }

    /// The device instance, or `None` when the PMU is uninstanced.
    pub fn device_instance(&self) -> Option<&str> {
        if self.device_instance.is_empty() {
            None
        } else {
            Some(&self.device_instance)
        }
    }
}

/// Read-only map from CPU-ID / PMU name to descriptors.
#[derive(Debug)]
pub struct PmuCatalog {
    cpus: Vec<CpuDescriptor>,
    uncores: Vec<UncoreDescriptor>,
}

impl PmuCatalog {
    /// Build the catalog from the built-in table plus configured extras.
    pub fn new(extra_cpus: Vec<CpuDescriptor>, extra_uncores: Vec<UncoreDescriptor>) -> Self {
        let mut cpus = builtin_cpus();
        // Configured descriptors arrive unnormalized.
        cpus.extend(extra_cpus.into_iter().map(|mut cpu| {
            cpu.cpu_ids.sort_unstable();
            cpu.cpu_ids.dedup();
            cpu
        }));
        let mut uncores = builtin_uncores();
        uncores.extend(extra_uncores);

        Self { cpus, uncores }
    }

    pub fn cpus(&self) -> &[CpuDescriptor] {
        &self.cpus
    }

    pub fn uncores(&self) -> &[UncoreDescriptor] {
        &self.uncores
    }

    /// Look up a CPU descriptor by its identifier or core name.
    pub fn find_cpu_by_name(&self, name: &str) -> Option<&CpuDescriptor> {
        self.cpus
            .iter()
            .find(|cpu| cpu.id == name || cpu.core_name == name)
    }

    /// Look up a CPU descriptor by a numeric CPU-ID code.
    pub fn find_cpu_by_id(&self, cpu_id: i32) -> Option<&CpuDescriptor> {
        self.cpus.iter().find(|cpu| cpu.has_cpu_id(cpu_id))
    }

    /// Look up an uncore descriptor by its identifier or name.
    pub fn find_uncore_by_name(&self, name: &str) -> Option<&UncoreDescriptor> {
        self.uncores
            .iter()
            .find(|u| u.id == name || u.core_name == name)
    }
}

impl Default for PmuCatalog {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

fn builtin_cpus() -> Vec<CpuDescriptor> {
    vec![
        CpuDescriptor::new(
            "Cortex-A35",
            "ARMv8_Cortex_A35",
            "ARMv8_Cortex_A35_cnt",
            Some("arm,cortex-a35"),
            None,
            vec![0x41d04],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A53",
            "ARMv8_Cortex_A53",
            "ARMv8_Cortex_A53_cnt",
            Some("arm,cortex-a53"),
            None,
            vec![0x41d03],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A55",
            "ARMv8_Cortex_A55",
            "ARMv8_Cortex_A55_cnt",
            Some("arm,cortex-a55"),
            None,
            vec![0x41d05],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A57",
            "ARMv8_Cortex_A57",
            "ARMv8_Cortex_A57_cnt",
            Some("arm,cortex-a57"),
            None,
            vec![0x41d07],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A72",
            "ARMv8_Cortex_A72",
            "ARMv8_Cortex_A72_cnt",
            Some("arm,cortex-a72"),
            None,
            vec![0x41d08],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A73",
            "ARMv8_Cortex_A73",
            "ARMv8_Cortex_A73_cnt",
            Some("arm,cortex-a73"),
            None,
            vec![0x41d09],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A75",
            "ARMv8_Cortex_A75",
            "ARMv8_Cortex_A75_cnt",
            Some("arm,cortex-a75"),
            None,
            vec![0x41d0a],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A76",
            "ARMv8_Cortex_A76",
            "ARMv8_Cortex_A76_cnt",
            Some("arm,cortex-a76"),
            Some("arm_spe_0"),
            vec![0x41d0b],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A77",
            "ARMv8_Cortex_A77",
            "ARMv8_Cortex_A77_cnt",
            Some("arm,cortex-a77"),
            Some("arm_spe_0"),
            vec![0x41d0d],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A78",
            "ARMv8_Cortex_A78",
            "ARMv8_Cortex_A78_cnt",
            Some("arm,cortex-a78"),
            Some("arm_spe_0"),
            // A78 and A78AE report distinct parts.
            vec![0x41d41, 0x41d42],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-X1",
            "ARMv8_Cortex_X1",
            "ARMv8_Cortex_X1_cnt",
            Some("arm,cortex-x1"),
            Some("arm_spe_0"),
            vec![0x41d44],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Neoverse-N1",
            "ARMv8_Neoverse_N1",
            "ARMv8_Neoverse_N1_cnt",
            Some("arm,neoverse-n1"),
            Some("arm_spe_0"),
            vec![0x41d0c],
            6,
            true,
        ),
        CpuDescriptor::new(
            "Cortex-A7",
            "ARMv7_Cortex_A7",
            "ARMv7_Cortex_A7_cnt",
            Some("arm,cortex-a7"),
            None,
            vec![0x41c07],
            4,
            false,
        ),
        CpuDescriptor::new(
            "Cortex-A15",
            "ARMv7_Cortex_A15",
            "ARMv7_Cortex_A15_cnt",
            Some("arm,cortex-a15"),
            None,
            vec![0x41c0f],
            6,
            false,
        ),
    ]
}

fn builtin_uncores() -> Vec<UncoreDescriptor> {
    vec![
        UncoreDescriptor::new("CCI-400", "CCI_400", "CCI_400_cnt", "", 4, false),
        UncoreDescriptor::new("CCI-500", "CCI_500", "CCI_500_cnt", "", 8, false),
        UncoreDescriptor::new("CCN-504", "ARM_CCN_5XX", "ARM_CCN_5XX_cnt", "", 4, true),
        UncoreDescriptor::new("CMN-600", "ARM_CMN_600", "ARM_CMN_600_cnt", "", 8, true),
        UncoreDescriptor::new("DSU", "ARM_DSU", "ARM_DSU_cnt", "", 6, true),
    ]
}
