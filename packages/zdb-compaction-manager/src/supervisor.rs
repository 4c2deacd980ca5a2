//! Supervisor - runs the server and restarts it around compactions
//!
//! # Lifecycle
//!
//! ```text
//!   Starting ──spawn──▶ Running ──exit──▶ Stopped
//!      ▲                                    │
//!      └──── compaction ◀── ForCompaction ──┤
//!                                           └── Final(status) ──▶ return
//! ```
//!
//! The supervisor owns the server's `Child`. Other threads reach it only
//! through a [`CompactionTrigger`], which sends requests over a channel.
//! While the server runs, the loop waits on that channel with a short
//! timeout and polls the child in between, so signals are only ever sent
//! to a process that has not been reaped yet.
//!
//! An exit is classified once, after it is observed: if a compaction request
//! was received before (or queued at) that moment, the exit is
//! `ForCompaction`; otherwise it is `Final` and the loop returns the
//! server's exit status verbatim.
//!
//! Requests that arrive while a compaction is already running are folded
//! into it. The restarted server is not interrupted again for them.

use std::io;
use std::process::{Child, ExitStatus};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::compaction::compact;
use crate::error::{ManagerError, Result};
use crate::state::BackendState;
use crate::tools::{ServerSettings, Toolchain};

/// How often the child is polled while no request arrives
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Phase of the supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Starting,
    Running,
    Stopped,
}

/// Why the server stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ForCompaction,
    Final(ExitStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    Compact,
    Shutdown,
}

/// Cross-thread handle into the supervisor
///
/// Cheap to clone. Requests sent after the supervisor is gone are dropped.
#[derive(Debug, Clone)]
pub struct CompactionTrigger {
    requests: Sender<Request>,
}

impl CompactionTrigger {
    #[cfg(test)]
    pub(crate) fn pair() -> (Self, Receiver<Request>) {
        let (tx, rx) = unbounded();
        (Self { requests: tx }, rx)
    }

    /// Ask for a compaction
    ///
    /// The supervisor interrupts the server if it is running. If it is not,
    /// the request is picked up when the next exit is classified.
    pub fn fire(&self) {
        self.send(Request::Compact);
    }

    /// Ask the supervisor to stop the server and return without restarting
    pub fn shutdown(&self) {
        self.send(Request::Shutdown);
    }

    fn send(&self, request: Request) {
        if self.requests.send(request).is_err() {
            tracing::debug!(?request, "supervisor gone, request dropped");
        }
    }
}

pub struct Supervisor {
    state: BackendState,
    settings: ServerSettings,
    tools: Toolchain,
    requests: Receiver<Request>,
    sender: Sender<Request>,
    poll_interval: Duration,
    phase: ServerPhase,
    compaction_pending: bool,
    shutdown_requested: bool,
}

impl Supervisor {
    pub fn new(state: BackendState, settings: ServerSettings, tools: Toolchain) -> Self {
        let (sender, requests) = unbounded();
        Self {
            state,
            settings,
            tools,
            requests,
            sender,
            poll_interval: DEFAULT_POLL_INTERVAL,
            phase: ServerPhase::Stopped,
            compaction_pending: false,
            shutdown_requested: false,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Handle for the scheduler (and signal handlers)
    pub fn trigger(&self) -> CompactionTrigger {
        CompactionTrigger {
            requests: self.sender.clone(),
        }
    }

    pub fn backend(&self) -> &BackendState {
        &self.state
    }

    pub fn phase(&self) -> ServerPhase {
        self.phase
    }

    /// Run the server until it stops for a reason other than compaction
    ///
    /// Returns the server's exit status, successful or not. Errors are
    /// reserved for the manager's own failures: spawning the server or
    /// waiting on it.
    pub fn run(&mut self) -> Result<ExitStatus> {
        loop {
            self.transition(ServerPhase::Starting);
            let mut child = self.tools.spawn_server(&self.settings, self.state.active())?;
            self.state.set_running(true);
            self.transition(ServerPhase::Running);

            tracing::info!(
                generation = self.state.generation(),
                pid = child.id(),
                "server started"
            );

            let (status, reason) = self.supervise(&mut child)?;
            self.transition(ServerPhase::Stopped);

            match reason {
                ExitReason::Final(status) => {
                    tracing::info!(%status, "server exited");
                    return Ok(status);
                }
                ExitReason::ForCompaction => {
                    self.run_compaction();
                    self.collect_requests();
                    self.compaction_pending = false;
                    if self.shutdown_requested {
                        tracing::info!("shutdown requested during compaction, not restarting");
                        return Ok(status);
                    }
                }
            }
        }
    }

    /// Wait for the child to exit while serving requests
    fn supervise(&mut self, child: &mut Child) -> Result<(ExitStatus, ExitReason)> {
        loop {
            let exited = match child.try_wait() {
                Ok(exited) => exited,
                Err(source) => {
                    abandon(child);
                    self.state.set_running(false);
                    return Err(ManagerError::Process {
                        op: "wait for server",
                        source,
                    });
                }
            };

            if let Some(status) = exited {
                self.state.set_running(false);
                self.collect_requests();
                return Ok((status, self.classify(status)));
            }

            match self.requests.recv_timeout(self.poll_interval) {
                Ok(request) => self.handle_request(request, child),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
            }
        }
    }

    fn classify(&mut self, status: ExitStatus) -> ExitReason {
        let pending = std::mem::take(&mut self.compaction_pending);
        if pending && !self.shutdown_requested {
            ExitReason::ForCompaction
        } else {
            ExitReason::Final(status)
        }
    }

    fn handle_request(&mut self, request: Request, child: &Child) {
        match request {
            Request::Compact => {
                tracing::info!(pid = child.id(), "compaction triggered, interrupting server");
                self.compaction_pending = true;
            }
            Request::Shutdown => {
                tracing::info!(pid = child.id(), "shutdown requested, interrupting server");
                self.shutdown_requested = true;
            }
        }
        if let Err(e) = interrupt(child) {
            tracing::warn!(pid = child.id(), error = %e, "failed to interrupt server");
        }
    }

    /// Fold queued requests into the flags without signalling anyone
    fn collect_requests(&mut self) {
        for request in self.requests.try_iter() {
            match request {
                Request::Compact => self.compaction_pending = true,
                Request::Shutdown => self.shutdown_requested = true,
            }
        }
    }

    fn run_compaction(&mut self) {
        tracing::info!(generation = self.state.generation(), "compacting");
        match compact(&mut self.state, &self.tools) {
            Ok(report) => tracing::info!(
                from = report.previous_generation,
                to = report.generation,
                namespaces = report.namespaces.len(),
                duration_ms = report.duration_ms,
                "compaction finished"
            ),
            Err(e @ ManagerError::StaleGeneration { .. }) => {
                tracing::error!(code = e.code(), error = %e, "old generation left on disk, remove it manually")
            }
            Err(e) => tracing::error!(
                code = e.code(),
                error = %e,
                generation = self.state.generation(),
                "compaction failed, keeping current generation"
            ),
        }
    }

    fn transition(&mut self, phase: ServerPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "server phase");
        self.phase = phase;
    }
}

/// Kill and reap a child whose state can no longer be polled
fn abandon(child: &mut Child) {
    let pid = child.id();
    if let Err(e) = child.kill() {
        tracing::warn!(pid, error = %e, "failed to kill server");
    }
    if let Err(e) = child.wait() {
        tracing::warn!(pid, error = %e, "failed to reap server");
    }
}

/// Send SIGINT to a child that has not been reaped yet
fn interrupt(child: &Child) -> io::Result<()> {
    let pid = child.id() as libc::pid_t;
    // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs to
    // our unreaped child, so it cannot have been recycled.
    let rc = unsafe { libc::kill(pid, libc::SIGINT) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
