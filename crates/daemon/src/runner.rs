//! Encoder process runner
//!
//! Spawns the encoder, streams its stderr line by line to a callback and
//! enforces cancellation. The child handle never outlives [`EncoderRunner::run`]:
//! it is either reaped normally, killed and reaped on cancellation, or killed
//! on drop when an I/O error unwinds the call.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Diagnostic lines kept from the end of stderr.
pub const STDERR_TAIL_LINES: usize = 40;

/// Error type for process execution
#[derive(Debug, Error)]
pub enum RunError {
    /// The encoder binary could not be started
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Reading output or waiting for exit failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Cancellation was requested; the child has been killed
    #[error("encode cancelled")]
    Cancelled,
}

/// How a finished process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// None when terminated by a signal.
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one encoder invocation to completion.
#[async_trait]
pub trait EncoderRunner: Send + Sync {
    async fn run(
        &self,
        args: &[String],
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError>;
}

/// Splits a byte stream on both `\r` and `\n`.
///
/// ffmpeg redraws its status line with bare carriage returns.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\r' || b == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(b);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            Some(line)
        }
    }
}

/// Bounded buffer of the most recent lines.
#[derive(Debug)]
struct Tail {
    lines: VecDeque<String>,
}

impl Tail {
    fn new() -> Self {
        Self {
            lines: VecDeque::with_capacity(STDERR_TAIL_LINES),
        }
    }

    fn push(&mut self, line: &str) {
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    fn join(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

/// Runner backed by a local ffmpeg binary.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    program: PathBuf,
}

impl FfmpegRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

/// Kill and reap; errors mean the child already exited.
async fn terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill after cancellation failed, child already gone");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap cancelled encoder");
    }
}

#[async_trait]
impl EncoderRunner for FfmpegRunner {
    async fn run(
        &self,
        args: &[String],
        on_line: &mut (dyn for<'l> FnMut(&'l str) + Send),
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        debug!(program = %self.program.display(), ?args, "spawning encoder");
        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        let mut stderr = child.stderr.take().ok_or_else(|| {
            RunError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "encoder stderr was not captured",
            ))
        })?;

        let mut splitter = LineSplitter::default();
        let mut tail = Tail::new();
        let mut buf = [0u8; 8192];

        loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Err(RunError::Cancelled);
                }
                read = stderr.read(&mut buf) => read?,
            };
            if read == 0 {
                break;
            }
            for line in splitter.push(&buf[..read]) {
                on_line(&line);
                tail.push(&line);
            }
        }
        if let Some(line) = splitter.finish() {
            on_line(&line);
            tail.push(&line);
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Err(RunError::Cancelled);
            }
            status = child.wait() => status?,
        };

        Ok(RunOutcome {
            exit_code: status.code(),
            stderr_tail: tail.join(),
        })
    }
}
