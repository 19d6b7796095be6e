//! Launches the wrapped command and waits for it.
//!
//! Signals received while the child runs are relayed to it by [`SigForward`]. The supervisor
//! itself never terminates the child.

use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tokio::process::Command;

use crate::util::SigForward;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("executable '{program}' not found: {source}")]
    NotFound {
        program: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to register signal handlers: {0}")]
    SignalRegistration(#[source] std::io::Error),
}

impl SupervisorError {
    /// Exit code the coordinator terminates with when supervision fails.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupervisorError::NotFound { .. } => 127,
            SupervisorError::Spawn { .. } => 126,
            SupervisorError::Wait { .. } | SupervisorError::SignalRegistration(_) => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    program: String,
    args: Vec<String>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Splits a full command line into program and arguments. `None` for an empty command.
    pub fn from_command(command: Vec<String>) -> Option<Self> {
        let mut parts = command.into_iter();
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Resolves the program on `PATH`, spawns it with inherited stdio and waits for it to exit.
    ///
    /// Signal forwarding is in place before the spawn and torn down after the child exits.
    pub async fn run(self) -> Result<i32, SupervisorError> {
        let resolved = which::which(&self.program).map_err(|source| SupervisorError::NotFound {
            program: self.program.clone(),
            source,
        })?;
        let forward = SigForward::try_new().map_err(SupervisorError::SignalRegistration)?;

        let spawned = Command::new(&resolved)
            .arg0(&self.program)
            .args(&self.args)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                forward.shutdown().await;
                return Err(SupervisorError::Spawn {
                    program: self.program,
                    source,
                });
            }
        };
        if let Some(pid) = child.id() {
            forward.child().set(Pid::from_raw(pid as i32));
            tracing::debug!(pid, "Started {}", resolved.display());
        }

        let status = child.wait().await;
        forward.shutdown().await;
        let status = status.map_err(|source| SupervisorError::Wait {
            program: self.program.clone(),
            source,
        })?;
        let code = exit_code(status);
        tracing::info!(code, "{} exited", self.program);
        Ok(code)
    }
}

/// The child's exit code, or `128 + signal` when it was terminated by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}
