//! Mali GPU userspace counter discovery.
//!
//! Mali devices surface as `/dev/maliN` character devices. The GPU clock
//! frequency is read from a `clock` file that lives either inside the
//! device's `misc/maliN/` sysfs directory or as a sibling of the `misc`
//! directory itself.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Highest `/dev/maliN` minor probed.
const MAX_DEV_MALI_TO_SCAN_FOR: u32 = 16;

/// One detected Mali GPU instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaliDevice {
    pub id: u32,
    pub device_path: PathBuf,
    pub clock_path: Option<PathBuf>,
}

/// Probe for Mali devices and attach their clock paths.
pub fn enumerate_mali_devices() -> Vec<MaliDevice> {
    let mut detected = Vec::new();

    for id in 0..MAX_DEV_MALI_TO_SCAN_FOR {
        let device_path = PathBuf::from(format!("/dev/mali{id}"));
        if device_path.exists() {
            debug!(id, path = %device_path.display(), "detected mali device");
            detected.push((id, device_path));
        }
    }

    if detected.is_empty() {
        return Vec::new();
    }

    let mut clock_paths = BTreeMap::new();
    enumerate_gpu_clock_paths(Path::new("/sys"), &mut clock_paths);

    detected
        .into_iter()
        .map(|(id, device_path)| MaliDevice {
            id,
            device_path,
            clock_path: clock_paths.remove(&id),
        })
        .collect()
}

/// Recursively scan `current` for `misc/maliN` directories with a usable
/// `clock` file, falling back to the `misc` parent's `clock` sibling.
pub fn enumerate_gpu_clock_paths(current: &Path, clock_paths: &mut BTreeMap<u32, PathBuf>) {
    let Ok(entries) = fs::read_dir(current) else {
        debug!(path = %current.display(), "failed to open sysfs directory");
        return;
    };

    let dir_is_called_misc = current.file_name().is_some_and(|n| n == "misc");
    let parent_clock_path = current.parent().map(|p| p.join("clock"));

    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(metadata) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !metadata.is_dir() {
            continue;
        }

        let name = entry.file_name();
        let mali_id = name
            .to_str()
            .and_then(|n| n.strip_prefix("mali"))
            .and_then(|rest| rest.parse::<u32>().ok());

        match mali_id {
            Some(id) if dir_is_called_misc => {
                if clock_paths.contains_key(&id) {
                    continue;
                }

                let child_clock = path.join("clock");
                if child_clock.is_file() {
                    clock_paths.insert(id, child_clock);
                } else if let Some(parent_clock) = &parent_clock_path {
                    if parent_clock.is_file() {
                        clock_paths.insert(id, parent_clock.clone());
                    }
                }
            }
            // Symlinks are skipped to keep the walk acyclic.
            _ => enumerate_gpu_clock_paths(&path, clock_paths),
        }
    }
}
