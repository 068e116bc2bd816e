//! Launching one cycle as a time-boxed child process

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::CycleOutcome;
use crate::config::SupervisorConfig;

/// Runs exactly one cycle and reports how it ended
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, time_box: Duration) -> CycleOutcome;
}

/// Executes the cycle binary and waits for it, killing it once the time box
/// expires.
#[derive(Debug, Clone)]
pub struct ChildProcessRunner {
    program: PathBuf,
    args: Vec<String>,
}

impl ChildProcessRunner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `cycle_command` if configured, otherwise `fleet-cycle` next to the
    /// running executable.
    pub fn from_config(config: &SupervisorConfig) -> std::io::Result<Self> {
        let program = match &config.cycle_command {
            Some(command) => command.clone(),
            None => default_cycle_program()?,
        };
        Ok(Self::new(program, config.cycle_args.clone()))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

fn default_cycle_program() -> std::io::Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "executable has no parent directory",
        )
    })?;
    Ok(dir.join(format!("fleet-cycle{}", std::env::consts::EXE_SUFFIX)))
}

#[async_trait]
impl CycleRunner for ChildProcessRunner {
    async fn run_cycle(&self, time_box: Duration) -> CycleOutcome {
        debug!("launching {} {:?}", self.program.display(), self.args);

        let mut child = match tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return CycleOutcome::Failure {
                    code: None,
                    message: format!("failed to launch {}: {e}", self.program.display()),
                };
            }
        };

        match tokio::time::timeout(time_box, child.wait()).await {
            Ok(Ok(status)) if status.success() => CycleOutcome::Success,
            Ok(Ok(status)) => CycleOutcome::Failure {
                code: status.code(),
                message: format!("cycle exited with {status}"),
            },
            Ok(Err(e)) => CycleOutcome::Failure {
                code: None,
                message: format!("failed to wait for cycle: {e}"),
            },
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill timed out cycle: {e}");
                }
                CycleOutcome::Timeout
            }
        }
    }
}
