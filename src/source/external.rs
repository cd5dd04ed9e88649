//! Feed of externally-produced counter bytes.
//!
//! Agents receive the write end of a pipe; whatever arrives on the read
//! end is framed into `External` frames on this source's ring. One
//! blocking reader thread serves each pipe and exits at pipe EOF, which
//! the agent's termination guarantees.

use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use anyhow::{Context, Result};
use nix::fcntl::OFlag;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::frame::{FrameRing, FrameType, MAX_FRAME_HEADER_SIZE};

use super::Source;

/// Largest chunk relayed into a single `External` frame.
const READ_CHUNK: usize = 4096;

/// Collects bytes from agent-owned pipe endpoints into `External` frames.
pub struct ExternalSource {
    ring: Arc<Mutex<FrameRing>>,
    pipe_tx: mpsc::UnboundedSender<OwnedFd>,
    pipe_rx: Option<mpsc::UnboundedReceiver<OwnedFd>>,
}

impl ExternalSource {
    pub fn new(ring: FrameRing) -> Self {
        let (pipe_tx, pipe_rx) = mpsc::unbounded_channel();
        Self {
            ring: Arc::new(Mutex::new(ring)),
            pipe_tx,
            pipe_rx: Some(pipe_rx),
        }
    }

    /// Create a pipe and return its write end for a freshly spawned agent.
    ///
    /// The read end stays with this source and is drained into the frame
    /// stream once the source runs.
    pub fn add_agent_pipe(&self) -> Result<OwnedFd> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).context("creating agent pipe")?;
        self.pipe_tx
            .send(read)
            .context("external source dispatcher gone")?;
        Ok(write)
    }

    fn spawn_reader(ring: Arc<Mutex<FrameRing>>, fd: OwnedFd) {
        std::thread::Builder::new()
            .name("extsrc-pipe".to_owned())
            .spawn(move || {
                let mut file = File::from(fd);
                let mut buf = [0u8; READ_CHUNK];

                loop {
                    match file.read(&mut buf) {
                        Ok(0) => {
                            debug!("agent pipe closed");
                            return;
                        }
                        Ok(n) => {
                            // Holding the lock across the blocking space
                            // wait serializes producers; back-pressure from
                            // the consumer applies to all pipes equally.
                            let ring = ring.lock();
                            ring.wait_for_space(MAX_FRAME_HEADER_SIZE + n);
                            ring.begin_frame(FrameType::External);
                            ring.write_bytes(&buf[..n]);
                            ring.end_frame();
                        }
                        Err(e) => {
                            debug!(error = %e, "agent pipe read failed");
                            return;
                        }
                    }
                }
            })
            .expect("spawn pipe reader");
    }
}

impl Source for ExternalSource {
    fn name(&self) -> &str {
        "external"
    }

    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let mut pipe_rx = self
            .pipe_rx
            .take()
            .context("external source already started")?;
        let ring = Arc::clone(&self.ring);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        debug!("external source dispatcher stopping");
                        return;
                    }
                    fd = pipe_rx.recv() => {
                        match fd {
                            Some(fd) => Self::spawn_reader(Arc::clone(&ring), fd),
                            None => return,
                        }
                    }
                }
            }
        });

        info!("external source started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        // Readers exit at pipe EOF once the agents are gone; nothing to
        // tear down actively.
        Ok(())
    }
}
