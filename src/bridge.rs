/// Console plumbing between the terminal and the supervised processes.
///
/// - console input → child stdin (while the child is alive)
/// - child output → console
/// - helper output → console and child stdin (during shutdown)
///
/// A single writer task owns stdout and stderr; everything else sends it `ConsoleLine`s.
use crate::process::{OutputLine, OutputStream, ProcessHandle};
use crate::shutdown::ShutdownState;
use std::io::BufRead;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const CONSOLE_CHANNEL_CAPACITY: usize = 1024;
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// Which process produced a console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineOrigin {
    Child,
    Helper,
    /// Written by the shutdown sequence itself (the shutdown text).
    Shutdown,
}

/// A line bound for the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub origin: LineOrigin,
    /// Child stderr lines go to the supervisor's stderr.
    pub stream: OutputStream,
    pub text: String,
}

/// Sender side of the console writer.
pub type Console = mpsc::Sender<ConsoleLine>;

pub fn console_channel() -> (Console, mpsc::Receiver<ConsoleLine>) {
    mpsc::channel(CONSOLE_CHANNEL_CAPACITY)
}

/// Spawn the task that owns stdout and stderr.
pub fn spawn_console_writer(rx: mpsc::Receiver<ConsoleLine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        let written = write_console(rx, &mut stdout, &mut stderr).await;
        tracing::debug!(written, "console writer finished");
    })
}

/// Write every line from `rx` until all senders are gone, flushing per line.
/// Returns the number of lines written.
///
/// A stream whose write fails (hangup, closed pipe) is logged once and its
/// later lines are discarded. The receiver keeps draining, so producers and
/// the pipes behind them never see the console go away.
pub async fn write_console<O, E>(mut rx: mpsc::Receiver<ConsoleLine>, out: &mut O, err: &mut E) -> usize
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut written = 0;
    let mut out_broken = false;
    let mut err_broken = false;
    while let Some(line) = rx.recv().await {
        let (result, broken) = match line.stream {
            OutputStream::Stdout if !out_broken => (write_rendered(out, &line).await, &mut out_broken),
            OutputStream::Stderr if !err_broken => (write_rendered(err, &line).await, &mut err_broken),
            _ => continue,
        };
        match result {
            Ok(()) => written += 1,
            Err(e) => {
                tracing::warn!(error = %e, stream = ?line.stream, "console write failed, discarding further output");
                *broken = true;
            }
        }
    }
    written
}

async fn write_rendered<W>(w: &mut W, line: &ConsoleLine) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let rendered = match line.origin {
        LineOrigin::Child => format!("{}\n", line.text),
        LineOrigin::Helper => format!("[shutdown helper] {}\n", line.text),
        LineOrigin::Shutdown => format!("[shutdown] {}\n", line.text),
    };
    w.write_all(rendered.as_bytes()).await?;
    w.flush().await
}

/// Echo process output to the console. Resolves to the number of lines echoed
/// once the process's output pipes reach EOF.
///
/// Output keeps being drained after the console is gone: dropping the
/// receiver would close the pipes and kill the process with SIGPIPE.
pub fn echo_output(
    mut output: mpsc::Receiver<OutputLine>,
    console: Console,
    origin: LineOrigin,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut echoed = 0;
        let mut console_gone = false;
        while let Some(line) = output.recv().await {
            if console_gone {
                continue;
            }
            let sent = console
                .send(ConsoleLine {
                    origin,
                    stream: line.stream,
                    text: line.text,
                })
                .await;
            if sent.is_ok() {
                echoed += 1;
            } else {
                tracing::debug!(?origin, "console writer gone, discarding output");
                console_gone = true;
            }
        }
        echoed
    })
}

/// Relay helper output into the child's stdin, echoing each line to the console.
/// Resolves to the number of lines actually written to the child.
pub fn relay_output(
    mut output: mpsc::Receiver<OutputLine>,
    child: Arc<ProcessHandle>,
    console: Console,
) -> JoinHandle<usize> {
    tokio::spawn(async move {
        let mut relayed = 0;
        while let Some(line) = output.recv().await {
            let _ = console
                .send(ConsoleLine {
                    origin: LineOrigin::Helper,
                    stream: line.stream,
                    text: line.text.clone(),
                })
                .await;
            if child.write_line(&line.text).await {
                relayed += 1;
            } else {
                tracing::debug!(line = %line.text, "child gone, helper line dropped");
            }
        }
        tracing::debug!(relayed, "helper output relay finished");
        relayed
    })
}

/// Read console lines on a dedicated OS thread.
///
/// A blocked stdin read never holds up the runtime; the thread is abandoned
/// when the supervisor exits.
pub fn spawn_stdin_reader() -> std::io::Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
    std::thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "console input closed");
                        break;
                    }
                }
            }
        })?;
    Ok(rx)
}

/// Forward console lines to the child until it exits or shutdown completes.
///
/// A line that arrives after the child exited is discarded, never written.
pub fn forward_input(
    mut lines: mpsc::Receiver<String>,
    child: Arc<ProcessHandle>,
    state: watch::Receiver<ShutdownState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            if child.has_exited() || state.borrow().is_terminated() {
                tracing::debug!("child no longer accepting input, discarding console line");
                break;
            }
            child.write_line(&line).await;
        }
    })
}
