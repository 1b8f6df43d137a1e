//! Session boundary notifications sent to an external marker command.
//!
//! The marker command hands out session ids (`nextid`) and is told when a
//! session starts and how it ended (`start`, `stop`, `term`). The default
//! implementation pipes a one-line script into a shell, so the command may be
//! anything the shell can run.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use benchconf::MarkerConfig;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Verb passed to the marker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerVerb {
    NextId,
    Start,
    /// Session ran its full benchmark duration
    Stop,
    /// Session was cut short by a stop request
    Term,
}

impl MarkerVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarkerVerb::NextId => "nextid",
            MarkerVerb::Start => "start",
            MarkerVerb::Stop => "stop",
            MarkerVerb::Term => "term",
        }
    }
}

impl fmt::Display for MarkerVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("failed to spawn marker shell {shell}: {source}")]
    Spawn {
        shell: PathBuf,
        source: std::io::Error,
    },

    #[error("marker command i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("marker command `{script}` exited with {status}: {output}")]
    Failed {
        script: String,
        status: ExitStatus,
        output: String,
    },

    #[error("marker command `{script}` printed no session id")]
    EmptyId { script: String },
}

/// External command marking session boundaries.
#[async_trait]
pub trait Marker: Send + Sync {
    /// Ask for the id of the next session.
    async fn next_id(&self) -> Result<String, MarkerError>;

    /// Report `verb` for session `id`, returning the command's diagnostic output.
    async fn notify(&self, verb: MarkerVerb, id: &str) -> Result<String, MarkerError>;
}

/// Runs `<command> <verb> [id]` through `<shell> -s`.
#[derive(Debug, Clone)]
pub struct ShellMarker {
    shell: PathBuf,
    command: String,
}

struct ScriptOutput {
    stdout: String,
    stderr: String,
}

impl ShellMarker {
    pub fn new(shell: impl Into<PathBuf>, command: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            command: command.into(),
        }
    }

    pub fn from_config(config: &MarkerConfig) -> Self {
        Self::new(config.shell.clone(), config.command.clone())
    }

    fn script(&self, verb: MarkerVerb, id: Option<&str>) -> String {
        match id {
            Some(id) => format!("{} {} {}", self.command, verb, shell_quote(id)),
            None => format!("{} {}", self.command, verb),
        }
    }

    async fn run(&self, script: &str) -> Result<ScriptOutput, MarkerError> {
        debug!(shell = %self.shell.display(), script, "running marker command");

        let mut child = Command::new(&self.shell)
            .arg("-s")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| MarkerError::Spawn {
                shell: self.shell.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            // Closing stdin ends the script
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(MarkerError::Failed {
                script: script.to_string(),
                status: output.status,
                output: format!("{stdout}{stderr}"),
            });
        }

        Ok(ScriptOutput { stdout, stderr })
    }
}

#[async_trait]
impl Marker for ShellMarker {
    async fn next_id(&self) -> Result<String, MarkerError> {
        let script = self.script(MarkerVerb::NextId, None);
        let output = self.run(&script).await?;

        let id = output.stdout.trim();
        if id.is_empty() {
            return Err(MarkerError::EmptyId { script });
        }
        Ok(id.to_string())
    }

    async fn notify(&self, verb: MarkerVerb, id: &str) -> Result<String, MarkerError> {
        let script = self.script(verb, Some(id));
        let output = self.run(&script).await?;
        Ok(format!("{}{}", output.stdout, output.stderr))
    }
}

/// Single-quote `s` for a POSIX shell.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
