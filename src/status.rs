/// Status file: a JSON snapshot of the supervisor on every shutdown state
/// transition, plus a final write carrying the exit code.
use crate::process::ProcessHandle;
use crate::shutdown::ShutdownState;
use crate::signals::ShutdownReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::ffi::OsString;
use std::path::PathBuf;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Supervisor states written to the status file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Running,
    Escalating,
    Terminated,
}

impl From<ShutdownState> for SupervisorState {
    fn from(state: ShutdownState) -> Self {
        match state {
            ShutdownState::Running => SupervisorState::Running,
            ShutdownState::Escalating { .. } => SupervisorState::Escalating,
            ShutdownState::Terminated => SupervisorState::Terminated,
        }
    }
}

/// The JSON payload written to the status file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusData {
    pub pid: u32,
    pub child_pid: u32,
    pub child_command: String,
    pub state: SupervisorState,
    pub reason: Option<ShutdownReason>,
    pub child_started: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub exit_code: Option<i32>,
}

/// A status file replaced wholesale on every write.
///
/// The snapshot is staged next to the target as `<name>.partial` and renamed
/// over it, so readers see either the previous snapshot or the new one.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let bytes = serde_json::to_vec_pretty(data).map_err(StatusError::Encode)?;
        let staged = self.staging_path();
        std::fs::write(&staged, &bytes)
            .and_then(|()| std::fs::rename(&staged, &self.path))
            .map_err(|source| {
                let _ = std::fs::remove_file(&staged);
                StatusError::Persist {
                    path: self.path.clone(),
                    source,
                }
            })
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("warden.status"));
        name.push(".partial");
        self.path.with_file_name(name)
    }
}

/// Builds StatusData for each update from the fixed child details and the
/// latest shutdown state.
pub struct StatusTracker {
    file: StatusFile,
    pid: u32,
    child_pid: u32,
    child_command: String,
    child_started: DateTime<Utc>,
    state: ShutdownState,
    reason: Option<ShutdownReason>,
}

impl StatusTracker {
    pub fn new(path: PathBuf, child: &ProcessHandle) -> Self {
        Self {
            file: StatusFile::new(path),
            pid: std::process::id(),
            child_pid: child.pid(),
            child_command: child.command().to_string(),
            child_started: child.started_at(),
            state: ShutdownState::Running,
            reason: None,
        }
    }

    /// Record a state and write the status file.
    pub fn update(&mut self, state: ShutdownState) {
        if let ShutdownState::Escalating { reason } = state {
            self.reason = Some(reason);
        }
        self.state = state;
        self.write(None);
    }

    /// Final write with the supervisor's exit code.
    pub fn finish(&mut self, exit_code: i32) {
        self.state = ShutdownState::Terminated;
        self.write(Some(exit_code));
    }

    fn write(&self, exit_code: Option<i32>) {
        let data = StatusData {
            pid: self.pid,
            child_pid: self.child_pid,
            child_command: self.child_command.clone(),
            state: self.state.into(),
            reason: self.reason,
            child_started: self.child_started,
            last_update: Utc::now(),
            exit_code,
        };

        if let Err(e) = self.file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}

/// Write the status file on every state change until the coordinator is gone,
/// then hand the tracker back for the final write.
pub fn spawn_status_writer(
    mut tracker: StatusTracker,
    mut states: watch::Receiver<ShutdownState>,
) -> JoinHandle<StatusTracker> {
    tokio::spawn(async move {
        let mut last = *states.borrow_and_update();
        tracker.update(last);
        while states.changed().await.is_ok() {
            last = *states.borrow_and_update();
            tracker.update(last);
        }
        let current = *states.borrow();
        if current != last {
            tracker.update(current);
        }
        tracker
    })
}

/// Why a status snapshot could not be recorded.
#[derive(Debug)]
pub enum StatusError {
    /// The snapshot could not be encoded as JSON.
    Encode(serde_json::Error),
    /// Staging or renaming the snapshot into place failed.
    Persist { path: PathBuf, source: std::io::Error },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Encode(e) => write!(f, "cannot encode status snapshot: {e}"),
            StatusError::Persist { path, source } => {
                write!(f, "cannot update status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(e) => Some(e),
            StatusError::Persist { source, .. } => Some(source),
        }
    }
}
