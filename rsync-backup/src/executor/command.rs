//! External process invocation with line-streamed output.

use crate::utils::errors::{BackupError, Result};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, warn};

/// How long a process may linger after closing its output before it is killed
pub const EXIT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A command line plus environment overrides
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// Append a command template, split on spaces
    pub fn push_template(&mut self, template: &str) {
        self.argv.extend(split_template(template));
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.argv.push(arg.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render_command(&self.argv, &self.env))
    }
}

/// Split a configured command template on spaces, dropping empty parts
pub fn split_template(template: &str) -> impl Iterator<Item = String> + '_ {
    template
        .split(' ')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
}

/// Render a command line the way a shell would accept it.
///
/// Arguments with whitespace, quotes or backslashes are double quoted, with
/// quotes and backslashes escaped. Empty arguments are dropped. Environment
/// overrides come first as `KEY="value"`.
pub fn render_command(argv: &[String], env: &[(String, String)]) -> String {
    let mut parts: Vec<String> = env
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, value))
        .collect();

    for arg in argv.iter().filter(|a| !a.is_empty()) {
        let mut quote = false;
        let mut escaped = String::with_capacity(arg.len());
        for c in arg.chars() {
            match c {
                '"' | '\\' => {
                    escaped.push('\\');
                    quote = true;
                }
                ' ' | '\t' | '\r' | '\n' => quote = true,
                _ => {}
            }
            escaped.push(c);
        }

        if quote {
            parts.push(format!("\"{}\"", escaped));
        } else {
            parts.push(escaped);
        }
    }

    parts.join(" ")
}

/// Receives process output one line at a time
pub trait LineSink: Send {
    fn line(&mut self, line: &str);
}

/// Writes each line to the debug log under a stage label
#[derive(Debug, Clone)]
pub struct LogSink {
    label: String,
}

impl LogSink {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

impl LineSink for LogSink {
    fn line(&mut self, line: &str) {
        debug!("{}: {}", self.label, line);
    }
}

/// Runs external commands and reports their exit code
pub trait CommandRunner: Send + Sync {
    fn run<'a>(
        &'a self,
        label: &'a str,
        command: &'a CommandSpec,
        sink: &'a mut dyn LineSink,
    ) -> BoxFuture<'a, Result<i32>>;
}

/// [`CommandRunner`] backed by real child processes
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            grace: EXIT_GRACE_PERIOD,
        }
    }
}

impl ProcessRunner {
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    async fn execute(
        &self,
        label: &str,
        command: &CommandSpec,
        sink: &mut dyn LineSink,
    ) -> Result<i32> {
        let (program, args) = command
            .argv
            .split_first()
            .ok_or_else(|| BackupError::Process(format!("{}: empty command line", label)))?;

        let mut child = Command::new(program)
            .args(args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackupError::Process(format!("Cannot start {}: {}", program, e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(BackupError::Process(format!("{}: output not captured", label)));
        };

        let stdout = FramedRead::new(stdout, line_codec());
        let stderr = FramedRead::new(stderr, line_codec());
        let mut lines = futures_util::stream::select(stdout, stderr);

        while let Some(frame) = lines.next().await {
            match frame {
                Ok(bytes) => {
                    let line = String::from_utf8_lossy(&bytes);
                    sink.line(line.trim_end_matches('\r'));
                }
                Err(e) => {
                    warn!("{}: failed to read process output: {}", label, e);
                    break;
                }
            }
        }
        drop(lines);

        match tokio::time::timeout(self.grace, child.wait()).await {
            Ok(status) => {
                let status = status?;
                status.code().ok_or_else(|| {
                    BackupError::Process(format!("{} terminated by signal ({})", program, status))
                })
            }
            Err(_) => {
                warn!("{} did not terminate, killing it", program);
                child.kill().await?;
                Err(BackupError::ProcessKilled(command.to_string()))
            }
        }
    }
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec())
}

impl CommandRunner for ProcessRunner {
    fn run<'a>(
        &'a self,
        label: &'a str,
        command: &'a CommandSpec,
        sink: &'a mut dyn LineSink,
    ) -> BoxFuture<'a, Result<i32>> {
        Box::pin(self.execute(label, command, sink))
    }
}
