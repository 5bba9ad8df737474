//! One way of running the external tool, in two modes: capture everything and
//! return it, or stream typed line events while the process runs.

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("I/O error while reading subprocess output: {0}")]
    Io(#[from] io::Error),
    #[error("subprocess did not finish within {0:?}")]
    Timeout(Duration),
    #[error("subprocess output exceeded {0} bytes")]
    OutputTooLarge(usize),
}

#[derive(Debug)]
pub struct CapturedOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
    /// Always the last event. `None` when the process was killed by a signal.
    Exited(Option<i32>),
}

/// A running tool invocation, seen as a sequence of events.
#[async_trait]
pub trait ToolProcess: Send {
    async fn next_event(&mut self) -> Option<ProcessEvent>;
    async fn kill(&mut self);
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs to completion and returns everything it printed. Stdout beyond
    /// `limit` bytes, or a run longer than `timeout`, kills the process.
    async fn capture(
        &self,
        program: &Path,
        args: &[String],
        limit: usize,
        timeout: Duration,
    ) -> Result<CapturedOutput, RunError>;

    async fn stream(&self, program: &Path, args: &[String]) -> Result<Box<dyn ToolProcess>, RunError>;
}

/// Runs real processes through tokio.
pub struct SystemRunner;

impl SystemRunner {
    /// Spawns with stdout/stderr left as pipes for the caller to consume.
    pub fn spawn_piped(&self, program: &Path, args: &[String]) -> Result<Child, RunError> {
        command(program, args).spawn().map_err(|source| RunError::Spawn {
            program: program.display().to_string(),
            source,
        })
    }
}

/// Drops yt-dlp's `ERROR:` markers and blank lines. `None` when nothing is left.
pub fn clean_error_text(stderr: &str) -> Option<String> {
    let cleaned: Vec<String> = stderr
        .lines()
        .map(|line| line.replace("ERROR:", "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.join("\n"))
    }
}

fn command(program: &Path, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn missing_pipe(name: &str) -> RunError {
    RunError::Io(io::Error::new(io::ErrorKind::Other, format!("{} was not captured", name)))
}

#[async_trait]
impl ToolRunner for SystemRunner {
    async fn capture(
        &self,
        program: &Path,
        args: &[String],
        limit: usize,
        timeout: Duration,
    ) -> Result<CapturedOutput, RunError> {
        let mut child = self.spawn_piped(program, args)?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let result = tokio::time::timeout(timeout, async {
            let mut out = Vec::new();
            stdout.take(limit as u64 + 1).read_to_end(&mut out).await?;
            if out.len() > limit {
                return Err(RunError::OutputTooLarge(limit));
            }
            let status = child.wait().await?;
            Ok::<_, RunError>((status, out))
        })
        .await;

        match result {
            Ok(Ok((status, stdout))) => {
                let stderr = stderr_task.await.unwrap_or_default();
                Ok(CapturedOutput {
                    status: status.code(),
                    stdout,
                    stderr: String::from_utf8_lossy(&stderr).to_string(),
                })
            }
            Ok(Err(e)) => {
                let _ = child.kill().await;
                Err(e)
            }
            Err(_) => {
                tracing::warn!("{} timed out after {:?}, killing it", program.display(), timeout);
                let _ = child.kill().await;
                Err(RunError::Timeout(timeout))
            }
        }
    }

    async fn stream(&self, program: &Path, args: &[String]) -> Result<Box<dyn ToolProcess>, RunError> {
        let mut child = self.spawn_piped(program, args)?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(forward_lines(stdout, tx.clone(), ProcessEvent::Stdout));
        tokio::spawn(forward_lines(stderr, tx, ProcessEvent::Stderr));

        Ok(Box::new(SpawnedProcess { child, events: rx, exited: false }))
    }
}

/// Forwards one pipe line by line. Bytes that are not UTF-8 are replaced
/// rather than ending the read, so the pipe is drained until the tool closes it.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<ProcessEvent>, wrap: fn(String) -> ProcessEvent)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(wrap(line)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!("Failed to read subprocess output: {}", e);
                break;
            }
        }
    }
}

/// A real child process. Both pipe readers feed one channel; once both have
/// closed the exit status is reported. Dropping it kills the child.
struct SpawnedProcess {
    child: Child,
    events: mpsc::Receiver<ProcessEvent>,
    exited: bool,
}

#[async_trait]
impl ToolProcess for SpawnedProcess {
    async fn next_event(&mut self) -> Option<ProcessEvent> {
        if self.exited {
            return None;
        }
        if let Some(event) = self.events.recv().await {
            return Some(event);
        }
        self.exited = true;
        match self.child.wait().await {
            Ok(status) => Some(ProcessEvent::Exited(status.code())),
            Err(e) => {
                tracing::warn!("Failed to collect subprocess exit status: {}", e);
                Some(ProcessEvent::Exited(None))
            }
        }
    }

    async fn kill(&mut self) {
        self.exited = true;
        if let Err(e) = self.child.kill().await {
            tracing::debug!("Kill on already finished subprocess: {}", e);
        }
    }
}
