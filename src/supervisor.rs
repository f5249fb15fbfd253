/// Root wiring: register termination sources, start the child, attach the
/// console bridge and status file, then run the shutdown coordinator until
/// the child is gone.
use crate::bridge::{self, LineOrigin, OUTPUT_CHANNEL_CAPACITY};
use crate::config::SupervisorConfig;
use crate::process::{ProcessError, ProcessHandle, StdinMode};
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::signals::{self, ShutdownEvents, ShutdownHandle};
use crate::status::{self, StatusTracker};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long to wait for buffered output to reach the console after the child is gone.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that stop the supervisor before the shutdown logic applies.
#[derive(Debug)]
pub enum SupervisorError {
    /// The child could not be launched.
    Child(ProcessError),
    /// OS signal handlers could not be registered.
    Signals(std::io::Error),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Child(e) => write!(f, "failed to start child: {e}"),
            SupervisorError::Signals(e) => write!(f, "failed to register signal handlers: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Child(e) => Some(e),
            SupervisorError::Signals(e) => Some(e),
        }
    }
}

/// Supervises one child process from launch to final exit.
pub struct Supervisor {
    config: SupervisorConfig,
    handle: ShutdownHandle,
    events: ShutdownEvents,
    console_input: bool,
    os_signals: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (handle, events) = signals::shutdown_channel();
        Self {
            config,
            handle,
            events,
            console_input: true,
            os_signals: true,
        }
    }

    /// Don't read the console; the child's stdin is then only written by shutdown.
    pub fn without_console_input(mut self) -> Self {
        self.console_input = false;
        self
    }

    /// Don't register OS signal handlers; only the stop file and
    /// [`shutdown_handle`](Self::shutdown_handle) can start a shutdown.
    pub fn without_os_signals(mut self) -> Self {
        self.os_signals = false;
        self
    }

    /// Handle for requesting a shutdown programmatically.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.handle.clone()
    }

    /// Run until the child has terminated.
    pub async fn run(self) -> Result<ShutdownOutcome, SupervisorError> {
        let Supervisor {
            config,
            handle,
            events,
            console_input,
            os_signals,
        } = self;

        // Signals are registered first so a Ctrl-C during startup is not lost.
        if os_signals {
            signals::install(handle.clone()).map_err(SupervisorError::Signals)?;
        }
        if let Some(stop_file) = config.stop_file.clone() {
            signals::watch_stop_file(stop_file, handle.clone());
        }

        let (console, console_rx) = bridge::console_channel();
        let writer = bridge::spawn_console_writer(console_rx);

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let child = ProcessHandle::start(&config.child, &config.working_dir, StdinMode::Piped, output_tx)
            .map_err(SupervisorError::Child)?;
        let child = Arc::new(child);
        tracing::info!(
            pid = child.pid(),
            command = %child.command(),
            working_dir = %child.working_dir().display(),
            strategy = config.shutdown.strategy.name(),
            "supervising child"
        );

        let echo = bridge::echo_output(output_rx, console.clone(), LineOrigin::Child);
        let coordinator = ShutdownCoordinator::new(config.shutdown.clone(), child.clone(), console.clone());

        if console_input {
            match bridge::spawn_stdin_reader() {
                Ok(lines) => {
                    bridge::forward_input(lines, child.clone(), coordinator.subscribe());
                }
                Err(e) => tracing::warn!(error = %e, "console input unavailable"),
            }
        }

        let status = config.status_file.clone().map(|path| {
            tracing::debug!(path = %path.display(), "writing status file");
            status::spawn_status_writer(StatusTracker::new(path, &child), coordinator.subscribe())
        });

        let outcome = coordinator.run(events).await;
        let decision = outcome.exit_decision();

        drain("child output", echo).await;
        drop(console);
        drain("console writer", writer).await;

        if let Some(status) = status {
            match status.await {
                Ok(mut tracker) => tracker.finish(decision.code),
                Err(e) => tracing::warn!(error = %e, "status writer failed"),
            }
        }

        tracing::info!(
            exit_code = decision.code,
            hard_exit = decision.hard_exit,
            uptime_secs = child.uptime().as_secs(),
            "supervisor finished"
        );
        Ok(outcome)
    }
}

/// Wait briefly for a task to finish so trailing output is not lost.
async fn drain<T>(what: &str, task: JoinHandle<T>) {
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
        tracing::debug!(what, "gave up waiting for output to drain");
    }
}
