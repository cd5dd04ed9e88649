//! Android atrace control.
//!
//! Atrace categories are enabled by setting the
//! `debug.atrace.tags.enableflags` system property and poking the running
//! apps through `Notify` (shipped as `notify.dex` next to the daemon
//! binary). Only usable on Android targets where `setprop` exists, ftrace
//! works, and the dex is present.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use nix::unistd::{access, AccessFlags};
use tracing::{debug, error, info};

use super::{AtraceCounter, Counter};

const SETPROP_PATH: &str = "/system/bin/setprop";

/// Driver for atrace-flag counters.
pub struct AtraceDriver {
    supported: bool,
    notify_path: PathBuf,
    counters: Vec<Counter>,
}

impl AtraceDriver {
    /// Probe the target for atrace support.
    ///
    /// `ftrace_supported` comes from the ftrace driver; atrace data only
    /// flows when ftrace capture works.
    pub fn detect(ftrace_supported: bool) -> Self {
        let notify_path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_owned))
            .unwrap_or_default()
            .join("notify.dex");

        Self::detect_with(Path::new(SETPROP_PATH), ftrace_supported, notify_path)
    }

    fn detect_with(setprop: &Path, ftrace_supported: bool, notify_path: PathBuf) -> Self {
        let mut driver = Self {
            supported: false,
            notify_path,
            counters: Vec::new(),
        };

        if access(setprop, AccessFlags::X_OK).is_err() {
            // Not an Android target; stay quiet to reduce warning noise.
            return driver;
        }
        if !ftrace_supported {
            info!("atrace is disabled: support for ftrace is required");
            return driver;
        }
        if access(driver.notify_path.as_path(), AccessFlags::W_OK).is_err() {
            info!(
                notify = %driver.notify_path.display(),
                "atrace is disabled: unable to locate notify.dex",
            );
            return driver;
        }

        driver.supported = true;
        driver
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Register an atrace category counter.
    pub fn add_counter(&mut self, name: &str, flag: i32) {
        self.counters.push(Counter::Atrace(AtraceCounter {
            name: name.to_owned(),
            flag,
            enabled: false,
        }));
    }

    pub fn counters(&self) -> &[Counter] {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut [Counter] {
        &mut self.counters
    }

    /// OR together the flags of every enabled counter.
    pub fn enabled_flags(&self) -> i32 {
        self.counters
            .iter()
            .filter_map(|counter| match counter {
                Counter::Atrace(c) if c.enabled => Some(c.flag),
                _ => None,
            })
            .fold(0, |flags, flag| flags | flag)
    }

    /// Enable the configured categories at capture start.
    pub fn start(&self) {
        if !self.supported {
            return;
        }
        self.set_atrace(self.enabled_flags());
    }

    /// Clear every category at capture stop.
    pub fn stop(&self) {
        if !self.supported {
            return;
        }
        self.set_atrace(0);
    }

    fn set_atrace(&self, flags: i32) {
        debug!(flags, "setting atrace flags");

        let script = format!(
            "setprop debug.atrace.tags.enableflags {flags}; \
             CLASSPATH={} app_process /system/bin Notify",
            self.notify_path.display(),
        );

        // The child is reaped by the process monitor on SIGCHLD.
        match Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .spawn()
        {
            Ok(child) => debug!(pid = child.id(), "atrace notify spawned"),
            Err(e) => error!(error = %e, "failed to spawn atrace notify shell"),
        }
    }
}
