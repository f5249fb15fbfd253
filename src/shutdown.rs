/// Shutdown coordination: the escalating, deadline-bounded protocol that runs
/// once a termination reason arrives.
///
/// Running → Escalating → Terminated. The first reason starts the sequence;
/// later ones are logged and ignored. On entry to Escalating the absolute
/// deadline is armed before anything touches the child. Then, by strategy:
/// run the helper and relay its output into the child, or write the shutdown
/// text, or close the child's streams. The shutdown timeout is armed only
/// after the helper has exited (or the text was written). Whichever deadline
/// fires first force-kills the child.
use crate::bridge::{self, Console, ConsoleLine, LineOrigin, OUTPUT_CHANNEL_CAPACITY};
use crate::config::{CommandSpec, ShutdownConfig, ShutdownStrategy};
use crate::process::{OutputStream, ProcessHandle, StdinMode, WaitOutcome};
use crate::signals::{ShutdownEvents, ShutdownReason};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Exit code when the absolute deadline forced the kill.
pub const EXIT_FORCED_ABSOLUTE: i32 = 100;
/// Exit code when the shutdown timeout forced the kill.
pub const EXIT_FORCED_SHUTDOWN_TIMEOUT: i32 = 101;
/// Exit code reported for a child that was killed by a signal.
pub const EXIT_CHILD_SIGNALED: i32 = -1;

/// How long to wait for a SIGKILLed process to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Coordinator state, published read-only through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Escalating { reason: ShutdownReason },
    Terminated,
}

impl ShutdownState {
    pub fn is_terminated(&self) -> bool {
        matches!(self, ShutdownState::Terminated)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShutdownState::Running => "running",
            ShutdownState::Escalating { .. } => "escalating",
            ShutdownState::Terminated => "terminated",
        }
    }

    fn can_become(&self, next: &ShutdownState) -> bool {
        matches!(
            (self, next),
            (ShutdownState::Running, ShutdownState::Escalating { .. })
                | (ShutdownState::Running, ShutdownState::Terminated)
                | (ShutdownState::Escalating { .. }, ShutdownState::Terminated)
        )
    }
}

/// The deadline that forced a kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    Absolute,
    ShutdownTimeout,
}

/// How the child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child exited without being killed by a deadline.
    ChildExited { code: Option<i32> },
    /// A deadline fired and the child was force-killed.
    Forced(Deadline),
}

/// Everything the supervisor needs to know once the child is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// The first termination reason (None if the child exited on its own).
    pub reason: Option<ShutdownReason>,
    pub termination: Termination,
    /// Lines relayed from the helper into the child (None if no helper ran).
    pub helper_lines: Option<usize>,
    /// Time from escalation to arming the shutdown timeout (None if never armed).
    pub shutdown_timer_armed_after: Option<Duration>,
    /// Time from escalation to termination (zero without a reason).
    pub elapsed: Duration,
}

/// The supervisor's own exit code, and whether it may call a hard exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitDecision {
    pub code: i32,
    /// False for session-ending reasons: the host is already tearing us down.
    pub hard_exit: bool,
}

impl ShutdownOutcome {
    /// The single place the supervisor's exit code is decided.
    pub fn exit_decision(&self) -> ExitDecision {
        let session_ending = self.reason.is_some_and(ShutdownReason::is_session_ending);
        let code = match self.termination {
            Termination::Forced(Deadline::Absolute) => EXIT_FORCED_ABSOLUTE,
            Termination::Forced(Deadline::ShutdownTimeout) => EXIT_FORCED_SHUTDOWN_TIMEOUT,
            Termination::ChildExited { .. } if session_ending => 0,
            Termination::ChildExited { code } => code.unwrap_or(EXIT_CHILD_SIGNALED),
        };
        ExitDecision {
            code,
            hard_exit: !session_ending,
        }
    }
}

/// Mutable bookkeeping of an escalation in flight. Never held across an await.
#[derive(Default)]
struct Progress {
    helper: Option<Arc<ProcessHandle>>,
    helper_lines: Option<usize>,
    timer_armed: Option<Instant>,
    forced: Option<Deadline>,
}

/// Owns the shutdown state and both deadline timers for one child.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    child: Arc<ProcessHandle>,
    console: Console,
    state: watch::Sender<ShutdownState>,
    progress: Mutex<Progress>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig, child: Arc<ProcessHandle>, console: Console) -> Self {
        let (state, _) = watch::channel(ShutdownState::Running);
        Self {
            config,
            child,
            console,
            state,
            progress: Mutex::new(Progress::default()),
        }
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ShutdownState> {
        self.state.subscribe()
    }

    /// The one guarded state transition. Returns false for an illegal move,
    /// which includes any second entry into Escalating.
    fn transition(&self, next: ShutdownState) -> bool {
        self.state.send_if_modified(|current| {
            if current.can_become(&next) {
                tracing::debug!(from = current.name(), to = next.name(), "shutdown state transition");
                *current = next;
                true
            } else {
                false
            }
        })
    }

    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drive the child to termination.
    ///
    /// Returns when the child has exited on its own, or after the first
    /// termination reason once the shutdown sequence has run to completion or
    /// to a forced kill.
    pub async fn run(self, mut events: ShutdownEvents) -> ShutdownOutcome {
        let reason = tokio::select! {
            code = self.child.wait() => {
                self.transition(ShutdownState::Terminated);
                tracing::info!(exit_code = ?code, "child exited");
                return ShutdownOutcome {
                    reason: None,
                    termination: Termination::ChildExited { code },
                    helper_lines: None,
                    shutdown_timer_armed_after: None,
                    elapsed: Duration::ZERO,
                };
            }
            Some(reason) = events.recv() => reason,
        };

        self.transition(ShutdownState::Escalating { reason });
        let started = Instant::now();
        tracing::warn!(
            %reason,
            strategy = self.config.strategy.name(),
            absolute_timeout_ms = self.config.absolute_timeout.as_millis() as u64,
            "shutdown requested"
        );

        // Armed before the sequence is first polled, so a hung helper cannot starve it.
        let absolute = tokio::time::sleep(self.config.absolute_timeout);
        tokio::pin!(absolute);
        let sequence = self.escalate();
        tokio::pin!(sequence);

        loop {
            tokio::select! {
                biased;
                () = &mut sequence => break,
                _ = self.child.wait() => break,
                () = &mut absolute => {
                    tracing::warn!(
                        timeout_ms = self.config.absolute_timeout.as_millis() as u64,
                        "absolute shutdown deadline expired, force-killing"
                    );
                    self.force_kill(Deadline::Absolute);
                    let helper = self.progress().helper.clone();
                    if let Some(helper) = helper {
                        helper.kill();
                    }
                    self.child.wait_for_exit(Some(KILL_GRACE)).await;
                    break;
                }
                Some(again) = events.recv() => {
                    tracing::warn!(
                        reason = %again,
                        first = %reason,
                        "shutdown already in progress, ignoring termination signal"
                    );
                }
            }
        }

        self.transition(ShutdownState::Terminated);
        let elapsed = started.elapsed();

        let progress = std::mem::take(&mut *self.progress());
        if let Some(helper) = progress.helper.as_ref().filter(|h| !h.has_exited()) {
            tracing::warn!(pid = helper.pid(), "shutdown helper still running, killing it");
            helper.kill();
            helper.wait_for_exit(Some(KILL_GRACE)).await;
        }

        let termination = match progress.forced {
            Some(deadline) => Termination::Forced(deadline),
            None => Termination::ChildExited {
                code: self.child.exit_status().and_then(|e| e.code),
            },
        };
        tracing::info!(
            ?termination,
            elapsed_ms = elapsed.as_millis() as u64,
            "shutdown complete"
        );

        ShutdownOutcome {
            reason: Some(reason),
            termination,
            helper_lines: progress.helper_lines,
            shutdown_timer_armed_after: progress.timer_armed.map(|at| at.duration_since(started)),
            elapsed,
        }
    }

    /// The strategy-specific part of the sequence. Completes once the child has
    /// exited or been killed by the shutdown timeout.
    async fn escalate(&self) {
        match &self.config.strategy {
            ShutdownStrategy::Helper(command) => {
                self.run_helper(command).await;
                self.await_child().await;
            }
            ShutdownStrategy::Text(text) => {
                tracing::info!(text = %text, "sending shutdown text to child");
                let _ = self
                    .console
                    .send(ConsoleLine {
                        origin: LineOrigin::Shutdown,
                        stream: OutputStream::Stdout,
                        text: text.clone(),
                    })
                    .await;
                // A child that stopped reading stdin can leave the pipe full.
                let write = self.child.write_line(text);
                match tokio::time::timeout(self.config.shutdown_timeout, write).await {
                    Ok(true) => {}
                    Ok(false) => tracing::debug!("child did not accept shutdown text"),
                    Err(_) => tracing::warn!(
                        timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                        "child stdin blocked, shutdown text not delivered"
                    ),
                }
                self.await_child().await;
            }
            ShutdownStrategy::None => {
                tracing::info!("no shutdown strategy configured, closing child streams");
                self.child.close_streams().await;
                self.child.wait().await;
            }
        }
    }

    /// Run the helper to completion, relaying its output into the child.
    /// A helper that fails to start is logged and treated as already exited.
    async fn run_helper(&self, command: &CommandSpec) {
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let helper = match ProcessHandle::start(command, &self.config.working_dir, StdinMode::Null, tx) {
            Ok(helper) => Arc::new(helper),
            Err(e) => {
                tracing::error!(error = %e, "failed to start shutdown helper, continuing without it");
                return;
            }
        };
        self.progress().helper = Some(helper.clone());

        let relay = bridge::relay_output(rx, self.child.clone(), self.console.clone());
        let code = helper.wait().await;
        // Drain whatever the helper wrote before it exited.
        let relayed = match relay.await {
            Ok(relayed) => relayed,
            Err(e) => {
                tracing::warn!(error = %e, "helper relay task failed");
                0
            }
        };
        tracing::info!(exit_code = ?code, relayed, "shutdown helper finished");
        self.progress().helper_lines = Some(relayed);
    }

    /// Arm the shutdown timeout and wait for the child, force-killing on expiry.
    async fn await_child(&self) {
        let timeout = self.config.shutdown_timeout;
        self.progress().timer_armed = Some(Instant::now());
        tracing::info!(timeout_ms = timeout.as_millis() as u64, "waiting for child to exit");

        match self.child.wait_for_exit(Some(timeout)).await {
            WaitOutcome::Exited(code) => {
                tracing::info!(exit_code = ?code, "child exited within shutdown timeout");
            }
            WaitOutcome::TimedOut => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "shutdown timeout expired, force-killing child"
                );
                self.force_kill(Deadline::ShutdownTimeout);
                self.child.wait_for_exit(Some(KILL_GRACE)).await;
            }
        }
    }

    /// Kill the child, recording the first deadline that demanded it.
    fn force_kill(&self, deadline: Deadline) {
        {
            let mut progress = self.progress();
            if progress.forced.is_none() && !self.child.has_exited() {
                progress.forced = Some(deadline);
            }
        }
        self.child.kill();
    }
}
