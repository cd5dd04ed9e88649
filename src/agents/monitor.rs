//! SIGCHLD-driven process monitor.
//!
//! Exposes an asynchronous event stream per observed pid. The signal
//! dispatcher feeds [`ProcessMonitor::on_sigchild`], which reaps every
//! pending child state change and fans the resulting events out to the
//! stream of whoever is watching that pid. Consumers loop until they see
//! a terminal state.

use std::collections::HashMap;

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Observed lifecycle state of a monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// The process is being attached to.
    Attaching,
    /// The process is alive and observed.
    Attached,
    /// The pid does not exist (or is not our child).
    NoSuchProcess,
    /// The process exited with the given code.
    TerminatedExit(i32),
    /// The process was killed by the given signal.
    TerminatedSignal(i32),
}

impl ProcessState {
    /// Whether no further events will follow for this process.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::NoSuchProcess
                | ProcessState::TerminatedExit(_)
                | ProcessState::TerminatedSignal(_)
        )
    }
}

/// One state-change event for a monitored pid.
#[derive(Debug, Clone, Copy)]
pub struct ProcessEvent {
    pub pid: i32,
    pub state: ProcessState,
}

/// Stream of [`ProcessEvent`]s for a single pid.
pub struct ProcessEventStream {
    rx: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl ProcessEventStream {
    /// The next event, or `None` when the monitor dropped the pid after a
    /// terminal state.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.rx.recv().await
    }
}

/// Fans child state changes out to per-pid event streams.
#[derive(Default)]
pub struct ProcessMonitor {
    watchers: Mutex<HashMap<i32, mpsc::UnboundedSender<ProcessEvent>>>,
}

impl ProcessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start observing a forked child, returning its event stream.
    pub fn monitor_forked_pid(&self, pid: i32) -> ProcessEventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ProcessEvent {
            pid,
            state: ProcessState::Attached,
        });
        self.watchers.lock().insert(pid, tx);
        ProcessEventStream { rx }
    }

    /// Reap all pending child state changes and dispatch them.
    ///
    /// Called from the signal dispatcher on every `SIGCHLD`; also safe to
    /// call speculatively since reaping is non-blocking.
    pub fn on_sigchild(&self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.notify(pid.as_raw(), ProcessState::TerminatedExit(code));
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.notify(pid.as_raw(), ProcessState::TerminatedSignal(signal as i32));
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(other) => {
                    trace!(?other, "ignoring intermediate child state");
                }
                Err(nix::errno::Errno::ECHILD) => break,
                Err(e) => {
                    debug!(error = %e, "waitpid failed");
                    break;
                }
            }
        }
    }

    /// Dispatch one event to the pid's stream.
    ///
    /// Terminal states drop the watcher entry; events for unobserved pids
    /// are logged and discarded.
    pub fn notify(&self, pid: i32, state: ProcessState) {
        let mut watchers = self.watchers.lock();

        let Some(tx) = watchers.get(&pid) else {
            debug!(pid, ?state, "state change for unobserved pid");
            return;
        };

        let _ = tx.send(ProcessEvent { pid, state });

        if state.is_terminal() {
            watchers.remove(&pid);
        }
    }

    /// Number of pids currently observed.
    pub fn observed_count(&self) -> usize {
        self.watchers.lock().len()
    }
}
