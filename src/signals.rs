/// Termination events for the shutdown coordinator.
///
/// OS signals, the stop file, and programmatic stop requests all arrive as a
/// `ShutdownReason` on one event channel. The coordinator drains it; nothing
/// here acts on the child directly.
///
/// Unix mapping: SIGINT → Interrupt, SIGQUIT → Break, SIGHUP → ConsoleClose,
/// SIGTERM → SystemShutdown.
use crate::config::StopFileConfig;
use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Queue depth for termination events. Reasons beyond the first are only
/// logged, so a short queue is plenty.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Why the supervisor was asked to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    /// Interactive interrupt (Ctrl-C).
    Interrupt,
    /// Break / quit request.
    Break,
    /// The controlling console went away.
    ConsoleClose,
    /// The user is logging off.
    Logoff,
    /// The system is shutting down.
    SystemShutdown,
    /// The desktop session is ending because of a logoff.
    SessionLogoff,
    /// The desktop session is ending because of a shutdown.
    SessionShutdown,
    /// Explicit close request: stop file, or a programmatic stop.
    CloseRequest,
}

impl ShutdownReason {
    /// Session-ending reasons: the host is already tearing the process down,
    /// so the supervisor must not hard-exit with a non-zero code itself.
    pub fn is_session_ending(self) -> bool {
        matches!(
            self,
            ShutdownReason::SessionLogoff | ShutdownReason::SessionShutdown
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownReason::Interrupt => "interrupt",
            ShutdownReason::Break => "break",
            ShutdownReason::ConsoleClose => "console_close",
            ShutdownReason::Logoff => "logoff",
            ShutdownReason::SystemShutdown => "system_shutdown",
            ShutdownReason::SessionLogoff => "session_logoff",
            ShutdownReason::SessionShutdown => "session_shutdown",
            ShutdownReason::CloseRequest => "close_request",
        }
    }
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sending half of the termination event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<ShutdownReason>,
}

/// Receiving half, drained by the coordinator.
#[derive(Debug)]
pub struct ShutdownEvents {
    rx: mpsc::Receiver<ShutdownReason>,
}

/// Create a linked handle/events pair.
pub fn shutdown_channel() -> (ShutdownHandle, ShutdownEvents) {
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    (ShutdownHandle { tx }, ShutdownEvents { rx })
}

impl ShutdownHandle {
    /// Deliver a termination reason. Returns `false` once the coordinator is gone.
    pub async fn request(&self, reason: ShutdownReason) -> bool {
        self.tx.send(reason).await.is_ok()
    }

    /// Programmatic stop.
    pub async fn stop(&self) -> bool {
        self.request(ShutdownReason::CloseRequest).await
    }
}

impl ShutdownEvents {
    /// Next termination reason, or `None` when every handle has been dropped.
    pub async fn recv(&mut self) -> Option<ShutdownReason> {
        self.rx.recv().await
    }
}

/// Register OS signal handlers and forward each delivery as a reason.
///
/// Every signal occurrence is forwarded, including repeats; deduplication is
/// the coordinator's job.
pub fn install(handle: ShutdownHandle) -> std::io::Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        loop {
            let reason = tokio::select! {
                Some(()) = sigint.recv() => ShutdownReason::Interrupt,
                Some(()) = sigquit.recv() => ShutdownReason::Break,
                Some(()) = sighup.recv() => ShutdownReason::ConsoleClose,
                Some(()) = sigterm.recv() => ShutdownReason::SystemShutdown,
                else => break,
            };
            tracing::info!(%reason, "termination signal received");
            if !handle.request(reason).await {
                break;
            }
        }
    }))
}

/// Poll for the stop file; when it appears, remove it and request a close.
pub fn watch_stop_file(config: StopFileConfig, handle: ShutdownHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if !config.path.exists() {
                continue;
            }
            tracing::info!(path = %config.path.display(), "stop file detected");
            if let Err(e) = std::fs::remove_file(&config.path) {
                tracing::warn!(
                    path = %config.path.display(),
                    error = %e,
                    "failed to remove stop file"
                );
            }
            handle.stop().await;
            break;
        }
    })
}
