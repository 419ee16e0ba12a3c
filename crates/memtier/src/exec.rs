//! External tool execution
//!
//! Runs a tool from a pre-resolved absolute executable path (never a `PATH` lookup) and streams
//! its stdout line by line, keeping at most `max_output_bytes` of it. Reads are capped at the
//! byte level, so a single endless line is cut off at the cap rather than buffered. A tool that
//! keeps writing past the cap is killed.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{MemtierError, Result};

const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Output retained from a tool run
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    /// Retained stdout, at most the configured byte cap
    pub stdout: String,
    /// True when output past the cap was dropped and the tool killed
    pub truncated: bool,
    /// Exit code (None if the process was killed)
    pub exit_code: Option<i32>,
}

/// An external tool invocation
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    max_output_bytes: usize,
    timeout: Duration,
}

impl ToolCommand {
    /// Fails with `Validation` unless `program` is an absolute path
    pub fn new(program: impl Into<PathBuf>) -> Result<Self> {
        let program = program.into();
        if !program.is_absolute() {
            return Err(MemtierError::Validation(format!(
                "tool path must be absolute, got {}",
                program.display()
            )));
        }
        Ok(Self {
            program,
            args: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the tool, feeding `input` on stdin and collecting bounded stdout
    pub async fn run(&self, input: Option<&str>) -> Result<ToolOutput> {
        self.run_streaming(input, |_| {}).await
    }

    /// Run the tool, calling `on_line` for every stdout line as it arrives.
    ///
    /// Timeouts are transient; spawn failures and non-zero exits are permanent.
    pub async fn run_streaming<F>(&self, input: Option<&str>, mut on_line: F) -> Result<ToolOutput>
    where
        F: FnMut(&str),
    {
        debug!(program = %self.program.display(), args = ?self.args, "Running tool");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                MemtierError::PermanentCollaborator(format!(
                    "failed to spawn {}: {e}",
                    self.program.display()
                ))
            })?;

        if let (Some(text), Some(mut stdin)) = (input, child.stdin.take()) {
            let text = text.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    debug!(error = %e, "Tool closed stdin early");
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let program = self.program.display().to_string();
            let cap = self.max_output_bytes;
            tokio::spawn(async move {
                // drained to EOF so the tool never blocks on a full pipe, logged up to the cap
                let mut reader = BufReader::new(stderr);
                let mut chunk = Vec::new();
                let mut logged = 0usize;
                loop {
                    chunk.clear();
                    let read = (&mut reader)
                        .take(cap.max(1) as u64)
                        .read_until(b'\n', &mut chunk)
                        .await;
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) if logged < cap => {
                            logged += n;
                            let line = String::from_utf8_lossy(&chunk);
                            debug!(program = %program, line = %line.trim_end(), "Tool stderr");
                        }
                        Ok(_) => {}
                    }
                }
            });
        }

        let stdout = child.stdout.take().ok_or_else(|| {
            MemtierError::PermanentCollaborator("tool stdout unavailable".to_string())
        })?;

        let cap = self.max_output_bytes;
        let collect = async {
            // one byte past the cap is enough to know the tool overran it
            let mut reader = BufReader::new(stdout).take(cap as u64 + 1);
            let mut line = Vec::new();
            let mut retained = String::new();
            let mut consumed = 0usize;
            let mut truncated = false;

            loop {
                line.clear();
                let read = reader.read_until(b'\n', &mut line).await?;
                if read == 0 {
                    break;
                }
                consumed += read;
                if consumed > cap {
                    truncated = true;
                    break;
                }
                let raw = String::from_utf8_lossy(&line);
                let text: &str = raw.as_ref();
                let ended = text.ends_with('\n');
                let text = text.strip_suffix('\n').unwrap_or(text);
                let text = text.strip_suffix('\r').unwrap_or(text);
                on_line(text);
                retained.push_str(text);
                if ended {
                    retained.push('\n');
                }
            }
            Ok::<_, MemtierError>((retained, truncated))
        };

        let (stdout, truncated) = match tokio::time::timeout(self.timeout, collect).await {
            Ok(result) => result?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(MemtierError::TransientCollaborator(format!(
                    "{} timed out after {:?}",
                    self.program.display(),
                    self.timeout
                )));
            }
        };

        if truncated {
            warn!(program = %self.program.display(), cap, "Tool output exceeded cap, killing");
            let _ = child.kill().await;
            return Ok(ToolOutput {
                stdout,
                truncated,
                exit_code: None,
            });
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(MemtierError::PermanentCollaborator(format!(
                "{} exited with {status}",
                self.program.display()
            )));
        }

        Ok(ToolOutput {
            stdout,
            truncated,
            exit_code: status.code(),
        })
    }
}
