//! `/proc/cpuinfo` fallback parser.
//!
//! Used when `MIDR_EL1` could not be read for every core, or when the
//! caller wants the `Hardware:` name. Recognizes the post-Linux-3.8
//! per-section format as well as the older flat format, where
//! implementer/part values appear once and are broadcast to the processor
//! range seen in the file.

use anyhow::{bail, Result};
use tracing::debug;

const HARDWARE: &str = "Hardware";
const CPU_IMPLEMENTER: &str = "CPU implementer";
const CPU_PART: &str = "CPU part";
const PROCESSOR: &str = "processor";

fn set_implementer(cpu_id: &mut i32, implementer: i32) {
    if *cpu_id == -1 {
        *cpu_id = 0;
    }
    *cpu_id |= implementer << 12;
}

fn set_part(cpu_id: &mut i32, part: i32) {
    if *cpu_id == -1 {
        *cpu_id = 0;
    }
    *cpu_id |= part;
}

fn parse_int(value: &str) -> Option<i32> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        i32::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Read and parse `/proc/cpuinfo`, filling still-unknown `cpu_ids` slots.
pub fn read(just_get_hardware_name: bool, cpu_ids: &mut [i32]) -> Result<Option<String>> {
    match std::fs::read_to_string("/proc/cpuinfo") {
        Ok(content) => parse(just_get_hardware_name, cpu_ids, &content),
        Err(e) => {
            debug!(error = %e, "error opening /proc/cpuinfo; the core name will be 'unknown'");
            Ok(None)
        }
    }
}

/// Parse cpuinfo-format `content`, filling still-unknown `cpu_ids` slots.
///
/// Returns the `Hardware:` name when present. Fails only on a processor
/// index beyond the slot array, which indicates an inconsistent target.
pub fn parse(
    just_get_hardware_name: bool,
    cpu_ids: &mut [i32],
    content: &str,
) -> Result<Option<String>> {
    let mut hardware_name: Option<String> = None;
    let mut found_core_name = false;

    let mut processor: Option<usize> = None;
    let mut min_processor = cpu_ids.len();
    let mut max_processor = 0usize;
    let mut found_processor_in_section = false;
    let mut out_of_place_cpu_id: i32 = -1;
    let mut invalid_format = false;

    for line in content.lines() {
        debug!(cpuinfo = line);

        if line.is_empty() {
            // New section. The processor index does not carry across
            // sections, so pre-3.8 cpuinfo yields no per-slot data here.
            processor = None;
            found_processor_in_section = false;
            continue;
        }

        let found_hardware = !found_core_name && line.starts_with(HARDWARE);
        let found_implementer = line.starts_with(CPU_IMPLEMENTER);
        let found_part = line.starts_with(CPU_PART);
        let found_processor = line.starts_with(PROCESSOR);

        if !(found_hardware || found_implementer || found_part || found_processor) {
            continue;
        }

        let value = match line.split_once(':') {
            Some((_, rest)) if !rest.trim().is_empty() => rest.trim(),
            _ => {
                debug!("unknown format of /proc/cpuinfo; the core name will be 'unknown'");
                return Ok(hardware_name);
            }
        };

        if found_hardware {
            hardware_name = Some(value.to_owned());
            if just_get_hardware_name {
                return Ok(hardware_name);
            }
            found_core_name = true;
        }

        if found_implementer {
            if let Some(implementer) = parse_int(value) {
                match processor {
                    Some(p) => set_implementer(&mut cpu_ids[p], implementer),
                    None => {
                        set_implementer(&mut out_of_place_cpu_id, implementer);
                        invalid_format = true;
                    }
                }
            }
        }

        if found_part {
            if let Some(part) = parse_int(value) {
                match processor {
                    Some(p) => set_part(&mut cpu_ids[p], part),
                    None => {
                        set_part(&mut out_of_place_cpu_id, part);
                        invalid_format = true;
                    }
                }
            }
        }

        if found_processor {
            let converted = parse_int(value).and_then(|v| usize::try_from(v).ok());

            if let Some(id) = converted {
                min_processor = min_processor.min(id);
                max_processor = max_processor.max(id);
            }

            if found_processor_in_section {
                // A second processor line in one section: the old flat
                // format. Stop attributing values to any single slot.
                processor = None;
                invalid_format = true;
            } else if let Some(id) = converted {
                if id >= cpu_ids.len() {
                    bail!("found processor {id} but max is {}", cpu_ids.len());
                }
                processor = Some(id);
                found_processor_in_section = true;
            }
        }
    }

    if invalid_format && out_of_place_cpu_id != -1 && min_processor <= max_processor {
        let end = (max_processor + 1).min(cpu_ids.len());

        for (p, slot) in cpu_ids.iter_mut().enumerate().take(end).skip(min_processor) {
            if *slot == -1 {
                debug!(
                    cpu_id = format_args!("{out_of_place_cpu_id:#x}"),
                    processor = p,
                    "setting global cpu id",
                );
                *slot = out_of_place_cpu_id;
            }
        }
    }

    if !found_core_name {
        debug!("could not determine core name from /proc/cpuinfo");
    }

    Ok(hardware_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: &str = "\
processor\t: 0
BogoMIPS\t: 38.40
CPU implementer\t: 0x41
CPU architecture: 8
CPU part\t: 0xd03

processor\t: 1
CPU implementer\t: 0x41
CPU part\t: 0xd09

Hardware\t: Example Board
";

    #[test]
    fn test_modern_per_section_format() {
        let mut cpu_ids = vec![-1; 2];
        let name = parse(false, &mut cpu_ids, MODERN).expect("parses");

        assert_eq!(cpu_ids, vec![0x41d03, 0x41d09]);
        assert_eq!(name.as_deref(), Some("Example Board"));
    }

    #[test]
    fn test_just_hardware_name_returns_early() {
        let mut cpu_ids = vec![-1; 2];
        let name = parse(true, &mut cpu_ids, MODERN).expect("parses");

        assert_eq!(name.as_deref(), Some("Example Board"));
        // Slots before the Hardware line were still filled.
        assert_eq!(cpu_ids[0], 0x41d03);
    }

    #[test]
    fn test_old_flat_format_broadcasts_to_unset_slots() {
        // Pre-3.8: all processor lines in one section, one implementer/part.
        let content = "\
Processor\t: ARMv7 Processor rev 3 (v7l)
processor\t: 0
processor\t: 1
processor\t: 2
processor\t: 3
CPU implementer\t: 0x41
CPU part\t: 0xc07

Hardware\t: Legacy Board
";
        let mut cpu_ids = vec![-1, 0x41c0f, -1, -1];
        let name = parse(false, &mut cpu_ids, content).expect("parses");

        // Only slots still unset receive the broadcast value.
        assert_eq!(cpu_ids, vec![0x41c07, 0x41c0f, 0x41c07, 0x41c07]);
        assert_eq!(name.as_deref(), Some("Legacy Board"));
    }

    #[test]
    fn test_no_processor_line_skips_broadcast() {
        // Implementer/part with no processor line anywhere: nothing can be
        // attributed, so every slot stays unset.
        let content = "\
CPU implementer\t: 0x41
CPU part\t: 0xd03
";
        let mut cpu_ids = vec![-1; 4];
        parse(false, &mut cpu_ids, content).expect("parses");
        assert_eq!(cpu_ids, vec![-1; 4]);
    }

    #[test]
    fn test_second_processor_line_invalidates_section() {
        let content = "\
processor\t: 0
processor\t: 1
CPU implementer\t: 0x41
CPU part\t: 0xd05
";
        let mut cpu_ids = vec![-1; 2];
        parse(false, &mut cpu_ids, content).expect("parses");

        // Values after the invalidation are out-of-place and broadcast.
        assert_eq!(cpu_ids, vec![0x41d05, 0x41d05]);
    }

    #[test]
    fn test_processor_index_out_of_range_is_fatal() {
        let content = "processor\t: 9\n";
        let mut cpu_ids = vec![-1; 2];
        let err = parse(false, &mut cpu_ids, content).expect_err("out of range");
        assert!(err.to_string().contains("processor 9"));
    }

    #[test]
    fn test_malformed_field_aborts_parse() {
        let content = "\
processor\t: 0
CPU implementer\t:
CPU part\t: 0xd03
";
        let mut cpu_ids = vec![-1; 1];
        let name = parse(false, &mut cpu_ids, content).expect("parses");

        // Parsing stops at the malformed line.
        assert_eq!(name, None);
        assert_eq!(cpu_ids, vec![-1]);
    }

    #[test]
    fn test_hardware_name_absent() {
        let mut cpu_ids = vec![-1; 1];
        let name = parse(false, &mut cpu_ids, "processor\t: 0\n").expect("parses");
        assert_eq!(name, None);
    }
}
