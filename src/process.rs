/// Lifecycle of one spawned process (the supervised child or a shutdown helper):
/// spawn with redirected stdio, pump output lines to a sink, write to stdin,
/// detect exit, and force-kill the whole process tree.
use crate::config::CommandSpec;
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;

/// Which pipe an output line was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// How the process's standard input is wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdinMode {
    /// Piped, so lines can be written with [`ProcessHandle::write_line`].
    Piped,
    /// Never given input (shutdown helpers are pure producers).
    Null,
}

impl StdinMode {
    fn stdio(self) -> Stdio {
        match self {
            StdinMode::Piped => Stdio::piped(),
            StdinMode::Null => Stdio::null(),
        }
    }
}

/// Final state of an exited process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code (None if killed by signal).
    pub code: Option<i32>,
}

/// Result of [`ProcessHandle::wait_for_exit`]. Expiry is a normal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited(Option<i32>),
    TimedOut,
}

/// Errors that can occur while starting a process.
#[derive(Debug)]
pub enum ProcessError {
    /// The program could not be launched (not found, permission denied, bad working dir).
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Spawn { program, source } => {
                write!(f, "failed to spawn {}: {}", program.display(), source)
            }
        }
    }
}

impl std::error::Error for ProcessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProcessError::Spawn { source, .. } => Some(source),
        }
    }
}

/// Handle to a running (or exited) process.
///
/// The OS child is owned by a reaper task that publishes the exit through a
/// watch channel, so the handle itself can be shared behind an `Arc` and used
/// concurrently by the input bridge and the shutdown coordinator.
pub struct ProcessHandle {
    command: CommandSpec,
    working_dir: PathBuf,
    pid: u32,
    started_at: DateTime<Utc>,
    started: Instant,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    pumps: Mutex<Vec<AbortHandle>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Spawn `command` in `working_dir` and start pumping its stdout and stderr
    /// into `sink`, one [`OutputLine`] per line.
    ///
    /// The process is placed in its own process group (via `process_group(0)`)
    /// so [`kill`](Self::kill) can take down anything it spawned as well.
    pub fn start(
        command: &CommandSpec,
        working_dir: &Path,
        stdin: StdinMode,
        sink: mpsc::Sender<OutputLine>,
    ) -> Result<Self, ProcessError> {
        tracing::info!(
            program = %command.program.display(),
            args = ?command.args,
            working_dir = %working_dir.display(),
            "spawning process"
        );

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(working_dir)
            .stdin(stdin.stdio())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| ProcessError::Spawn {
                program: command.program.clone(),
                source: e,
            })?;

        let pid = child.id().unwrap_or(0);
        let child_stdin = child.stdin.take();

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let task = tokio::spawn(pump_lines(stdout, OutputStream::Stdout, sink.clone()));
            pumps.push(task.abort_handle());
        }
        if let Some(stderr) = child.stderr.take() {
            let task = tokio::spawn(pump_lines(stderr, OutputStream::Stderr, sink));
            pumps.push(task.abort_handle());
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(pid, error = %e, "failed to wait on process");
                    None
                }
            };
            tracing::debug!(pid, exit_code = ?code, "process exited");
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        tracing::info!(pid, "process started");

        Ok(Self {
            command: command.clone(),
            working_dir: working_dir.to_path_buf(),
            pid,
            started_at: Utc::now(),
            started: Instant::now(),
            stdin: tokio::sync::Mutex::new(child_stdin),
            pumps: Mutex::new(pumps),
            exit: exit_rx,
        })
    }

    pub fn command(&self) -> &CommandSpec {
        &self.command
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Wall-clock time since the process was spawned.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Exit state, once the process has exited.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    /// Write `text` plus a newline to the process's stdin.
    ///
    /// A no-op returning `false` when the process has exited, its stdin is
    /// closed or null, or the write fails (the pipe is then dropped).
    pub async fn write_line(&self, text: &str) -> bool {
        if self.has_exited() {
            return false;
        }

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };

        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');

        match write_and_flush(stdin, line.as_bytes()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(pid = self.pid, error = %e, "stdin write failed, closing pipe");
                *guard = None;
                false
            }
        }
    }

    /// Close stdin and stop pumping output.
    pub async fn close_streams(&self) {
        self.stdin.lock().await.take();
        let mut pumps = self.pumps.lock().unwrap_or_else(|e| e.into_inner());
        for pump in pumps.drain(..) {
            pump.abort();
        }
        tracing::debug!(pid = self.pid, "process streams closed");
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&self) -> Option<i32> {
        wait_exited(self.exit.clone()).await
    }

    /// Wait until the process exits or `timeout` elapses (`None` waits forever).
    pub async fn wait_for_exit(&self, timeout: Option<Duration>) -> WaitOutcome {
        let exited = wait_exited(self.exit.clone());
        match timeout {
            None => WaitOutcome::Exited(exited.await),
            Some(limit) => match tokio::time::timeout(limit, exited).await {
                Ok(code) => WaitOutcome::Exited(code),
                Err(_) => WaitOutcome::TimedOut,
            },
        }
    }

    /// Send SIGKILL to the process group. Safe to call repeatedly and after exit.
    pub fn kill(&self) {
        if self.has_exited() || self.pid == 0 {
            return;
        }

        let pgid = Pid::from_raw(self.pid as i32);
        match signal::killpg(pgid, Signal::SIGKILL) {
            Ok(()) => tracing::info!(pid = self.pid, "sent SIGKILL to process group"),
            Err(Errno::ESRCH) => tracing::debug!(pid = self.pid, "process group already gone"),
            Err(e) => {
                tracing::warn!(pid = self.pid, error = %e, "killpg failed, killing process directly");
                if let Err(e) = signal::kill(pgid, Signal::SIGKILL) {
                    tracing::debug!(pid = self.pid, error = %e, "kill failed");
                }
            }
        }
    }
}

async fn write_and_flush(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

async fn wait_exited(mut exit: watch::Receiver<Option<ProcessExit>>) -> Option<i32> {
    match exit.wait_for(Option::is_some).await {
        Ok(state) => {
            let state: Option<ProcessExit> = *state;
            state.and_then(|e| e.code)
        }
        // The reaper always publishes before dropping its sender.
        Err(_) => None,
    }
}

/// Read `reader` line by line into `sink` until EOF, a read error, or the
/// sink is dropped. Invalid UTF-8 is replaced rather than ending the pump.
async fn pump_lines<R>(reader: R, stream: OutputStream, sink: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                let text = String::from_utf8_lossy(&buf).into_owned();
                if sink.send(OutputLine { stream, text }).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, ?stream, "output pump stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
        }
    }

    fn start(command: &CommandSpec) -> (ProcessHandle, mpsc::Receiver<OutputLine>) {
        let (tx, rx) = mpsc::channel(64);
        let handle = ProcessHandle::start(command, Path::new("."), StdinMode::Piped, tx).unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_start_pumps_stdout_lines() {
        let (handle, mut rx) = start(&sh("echo one; echo two"));
        assert!(handle.pid() > 0);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.stream, OutputStream::Stdout);
        assert_eq!(first.text, "one");
        assert_eq!(rx.recv().await.unwrap().text, "two");
        assert_eq!(handle.wait_for_exit(None).await, WaitOutcome::Exited(Some(0)));
    }

    #[tokio::test]
    async fn test_start_pumps_stderr_lines() {
        let (handle, mut rx) = start(&sh("echo oops >&2"));
        let line = rx.recv().await.unwrap();
        assert_eq!(line.stream, OutputStream::Stderr);
        assert_eq!(line.text, "oops");
        handle.wait_for_exit(None).await;
    }

    #[tokio::test]
    async fn test_channel_closes_after_output_eof() {
        let (handle, mut rx) = start(&sh("printf 'no newline'"));
        assert_eq!(rx.recv().await.unwrap().text, "no newline");
        assert!(rx.recv().await.is_none());
        handle.wait_for_exit(None).await;
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let (tx, _rx) = mpsc::channel(1);
        let command = CommandSpec {
            program: PathBuf::from("nonexistent-binary-xyz"),
            args: vec![],
        };
        let err = ProcessHandle::start(&command, Path::new("."), StdinMode::Piped, tx)
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_spawn_failure_bad_working_dir() {
        let (tx, _rx) = mpsc::channel(1);
        let result = ProcessHandle::start(
            &sh("true"),
            Path::new("/nonexistent-dir/impossible"),
            StdinMode::Piped,
            tx,
        );
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_working_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ProcessHandle::start(&sh("pwd"), dir.path(), StdinMode::Piped, tx).unwrap();
        let line = rx.recv().await.unwrap();
        assert_eq!(
            PathBuf::from(line.text).canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(handle.working_dir(), dir.path());
        handle.wait_for_exit(None).await;
    }

    #[tokio::test]
    async fn test_write_line_reaches_stdin() {
        let (handle, mut rx) = start(&sh("read line; echo \"got $line\""));
        assert!(handle.write_line("hello").await);
        assert_eq!(rx.recv().await.unwrap().text, "got hello");
        assert_eq!(handle.wait_for_exit(None).await, WaitOutcome::Exited(Some(0)));
    }

    #[tokio::test]
    async fn test_write_line_after_exit_is_noop() {
        let (handle, _rx) = start(&sh("exit 3"));
        assert_eq!(handle.wait_for_exit(None).await, WaitOutcome::Exited(Some(3)));
        assert!(handle.has_exited());
        assert!(!handle.write_line("ignored").await);
        assert_eq!(handle.exit_status(), Some(ProcessExit { code: Some(3) }));
    }

    #[tokio::test]
    async fn test_write_line_with_null_stdin_is_noop() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ProcessHandle::start(&sh("sleep 5"), Path::new("."), StdinMode::Null, tx).unwrap();
        assert!(!handle.write_line("ignored").await);
        handle.kill();
        handle.wait_for_exit(None).await;
    }

    #[tokio::test]
    async fn test_wait_for_exit_times_out() {
        let (handle, _rx) = start(&sh("sleep 5"));
        let outcome = handle.wait_for_exit(Some(Duration::from_millis(50))).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert!(!handle.has_exited());
        handle.kill();
        assert_eq!(handle.wait_for_exit(None).await, WaitOutcome::Exited(None));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let (handle, _rx) = start(&sh("sleep 5"));
        handle.kill();
        handle.kill();
        assert_eq!(
            handle.wait_for_exit(Some(Duration::from_secs(5))).await,
            WaitOutcome::Exited(None)
        );
        handle.kill();
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_kill_takes_down_process_group() {
        // The grandchild holds stdout open; the pump only ends once it dies too.
        let (handle, mut rx) = start(&sh("sleep 30 & echo started; wait"));
        assert_eq!(rx.recv().await.unwrap().text, "started");
        handle.kill();
        handle.wait_for_exit(Some(Duration::from_secs(5))).await;
        let eof = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await;
        assert_eq!(eof.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_streams_sends_eof() {
        let (handle, _rx) = start(&sh("cat > /dev/null; exit 4"));
        handle.close_streams().await;
        assert_eq!(
            handle.wait_for_exit(Some(Duration::from_secs(5))).await,
            WaitOutcome::Exited(Some(4))
        );
        assert!(!handle.write_line("after close").await);
    }

    #[tokio::test]
    async fn test_uptime_and_start_time() {
        let before = Utc::now();
        let (handle, _rx) = start(&sh("sleep 0.1"));
        handle.wait_for_exit(None).await;
        assert!(handle.started_at() >= before);
        assert!(handle.uptime().as_millis() >= 80);
        assert_eq!(handle.command().program, PathBuf::from("sh"));
    }
}
