//! Agent process launching.
//!
//! `AgentLauncher` is the seam between the session manager and the thing
//! that produces a transport: `ProcessLauncher` spawns the agent binary with
//! piped stdio; tests plug in-memory transports in instead.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::api::types::ApiError;
use crate::protocols::rpc::{BoxedReader, BoxedWriter};

/// Command specification for launching the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentCommand {
    /// Path to the executable (or interpreter, e.g. `node`)
    pub path: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Environment variables to set
    pub env: BTreeMap<String, String>,
    /// Working directory; inherits the host's when absent
    pub cwd: Option<PathBuf>,
    /// When set, `--log=<path>` is appended to the arguments
    pub log_path: Option<PathBuf>,
}

impl AgentCommand {
    /// Final argument list passed to the process.
    pub fn effective_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(log_path) = &self.log_path {
            args.push(format!("--log={}", log_path.display()));
        }
        args
    }
}

/// Byte streams of a freshly launched agent.
pub struct AgentStreams {
    /// Agent output (stdout)
    pub reader: BoxedReader,
    /// Agent input (stdin)
    pub writer: BoxedWriter,
    /// The process, when the agent is one
    pub child: Option<Child>,
}

/// Produces a new agent transport for every session.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    async fn launch(&self) -> Result<AgentStreams, ApiError>;
}

/// Spawns the agent as a child process speaking over stdio.
pub struct ProcessLauncher {
    command: AgentCommand,
}

impl ProcessLauncher {
    pub fn new(command: AgentCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<AgentStreams, ApiError> {
        let cmd = &self.command;
        log::info!("Launching agent: bin={:?}, cwd={:?}", cmd.path, cmd.cwd);

        let mut command = Command::new(&cmd.path);
        command
            .args(cmd.effective_args())
            .envs(&cmd.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &cmd.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| ApiError::IoError {
            message: format!("Failed to spawn agent process {:?}: {e}", cmd.path),
        })?;
        log::debug!("Agent process spawned: pid={:?}", child.id());

        // A crash on startup shows up as an immediate exit.
        match child.try_wait() {
            Ok(Some(status)) => {
                log::error!("Agent process exited immediately: exit_status={status:?}");
                return Err(ApiError::IoError {
                    message: format!(
                        "Agent process exited immediately with status: {:?}",
                        status.code()
                    ),
                });
            }
            Ok(None) => log::debug!("Agent process is running"),
            Err(e) => log::warn!("Failed to check agent process status: {e}"),
        }

        let stdin = child.stdin.take().ok_or_else(|| ApiError::IoError {
            message: "Failed to get agent stdin handle".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ApiError::IoError {
            message: "Failed to get agent stdout handle".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| ApiError::IoError {
            message: "Failed to get agent stderr handle".to_string(),
        })?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                log::debug!("[agent stderr] {line}");
            }
            log::debug!("Agent stderr closed");
        });

        Ok(AgentStreams {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}
