//! Shell-side handle for one agent subprocess.

use std::io::{BufRead, BufReader, Write};
use std::thread;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use super::spawner::{AgentKind, SpawnedAgent};

/// Lifecycle of an agent as seen from the shell side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, handshake not yet observed.
    Launching,
    /// The agent reported itself ready.
    Ready,
    /// The agent process is gone.
    Terminated,
}

/// Line the agent prints on its event channel once it is operational.
pub const READY_HANDSHAKE: &str = "ready";

/// Control command requesting a graceful agent exit.
pub const SHUTDOWN_COMMAND: &str = "shutdown";

/// One supervised agent subprocess.
pub struct AgentWorker {
    pid: i32,
    kind: AgentKind,
    state_tx: watch::Sender<WorkerState>,
    control: Mutex<Box<dyn Write + Send>>,
}

impl AgentWorker {
    /// Wrap a spawned agent and start watching for its ready handshake.
    ///
    /// The handshake reader runs on a detached native thread: it performs
    /// a blocking pipe read and exits at pipe EOF, which is at the latest
    /// when the agent terminates.
    pub fn launch(spawned: SpawnedAgent, kind: AgentKind) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Launching);

        let events = spawned.events;
        let handshake_tx = state_tx.clone();
        let pid = spawned.pid;
        thread::Builder::new()
            .name(format!("agent-hs-{pid}"))
            .spawn(move || {
                let mut reader = BufReader::new(events);
                let mut line = String::new();
                while let Ok(n) = reader.read_line(&mut line) {
                    if n == 0 {
                        return; // EOF, agent gone
                    }
                    if line.trim() == READY_HANDSHAKE {
                        // Never regress a Terminated state.
                        handshake_tx.send_if_modified(|state| {
                            if *state == WorkerState::Launching {
                                *state = WorkerState::Ready;
                                true
                            } else {
                                false
                            }
                        });
                        return;
                    }
                    line.clear();
                }
            })
            .expect("spawn handshake reader");

        Self {
            pid,
            kind,
            state_tx,
            control: Mutex::new(spawned.control),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Wait until the agent is ready; `false` when it terminated first.
    pub async fn wait_launched(&self) -> bool {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                WorkerState::Ready => return true,
                WorkerState::Terminated => return false,
                WorkerState::Launching => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Ask the agent to exit gracefully.
    pub fn shutdown(&self) {
        let mut control = self.control.lock();
        if let Err(e) = writeln!(control, "{SHUTDOWN_COMMAND}").and_then(|()| control.flush()) {
            // Control pipe already closed: the agent is on its way out.
            debug!(pid = self.pid, error = %e, "shutdown request not delivered");
        }
    }

    /// The process monitor observed this agent's termination.
    pub fn on_sigchild(&self) {
        self.state_tx.send_replace(WorkerState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::OwnedFd;

    use super::*;

    /// A fake agent backed by plain pipes.
    fn fake_spawned(pid: i32) -> (SpawnedAgent, File, File) {
        let (control_read, control_write) = pipe_pair();
        let (event_read, event_write) = pipe_pair();

        let spawned = SpawnedAgent {
            pid,
            control: Box::new(control_write),
            events: Box::new(event_read),
        };
        (spawned, control_read, event_write)
    }

    fn pipe_pair() -> (File, File) {
        let (read, write): (OwnedFd, OwnedFd) = nix::unistd::pipe().expect("pipe");
        (File::from(read), File::from(write))
    }

    #[tokio::test]
    async fn test_ready_handshake_transitions_state() {
        let (spawned, _control_read, mut event_write) = fake_spawned(101);
        let worker = AgentWorker::launch(spawned, AgentKind::ExternalSource);
        assert_eq!(worker.state(), WorkerState::Launching);

        writeln!(event_write, "ready").expect("handshake");

        assert!(worker.wait_launched().await);
        assert_eq!(worker.state(), WorkerState::Ready);
    }

    #[tokio::test]
    async fn test_termination_before_ready_fails_launch() {
        let (spawned, _control_read, _event_write) = fake_spawned(102);
        let worker = AgentWorker::launch(spawned, AgentKind::Perf);

        worker.on_sigchild();

        assert!(!worker.wait_launched().await);
        assert_eq!(worker.state(), WorkerState::Terminated);
    }

    #[tokio::test]
    async fn test_shutdown_writes_control_command() {
        let (spawned, mut control_read, mut event_write) = fake_spawned(103);
        let worker = AgentWorker::launch(spawned, AgentKind::ExternalSource);
        writeln!(event_write, "ready").expect("handshake");
        assert!(worker.wait_launched().await);

        worker.shutdown();
        drop(worker); // closes the control write end

        let mut buf = String::new();
        control_read.read_to_string(&mut buf).expect("read");
        assert_eq!(buf.trim(), SHUTDOWN_COMMAND);
    }

    #[tokio::test]
    async fn test_ready_after_termination_is_ignored() {
        let (spawned, _control_read, mut event_write) = fake_spawned(104);
        let worker = AgentWorker::launch(spawned, AgentKind::Perf);

        worker.on_sigchild();
        writeln!(event_write, "ready").expect("late handshake");

        // Give the handshake reader a moment to process the line.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(worker.state(), WorkerState::Terminated);
    }
}
