//! Self-restart

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tracing::info;

/// Starts a fresh supervisor instance. `Ok` means the new instance was
/// launched and the caller may exit.
#[async_trait]
pub trait Restarter: Send + Sync {
    async fn spawn_replacement(&self) -> std::io::Result<u32>;
}

/// Re-executes the current binary with the current arguments, detached from
/// this process's lifetime.
#[derive(Debug, Clone)]
pub struct ExecRestarter {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ExecRestarter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn current() -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            std::env::args_os().skip(1).collect(),
        ))
    }
}

#[async_trait]
impl Restarter for ExecRestarter {
    async fn spawn_replacement(&self) -> std::io::Result<u32> {
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .spawn()?;
        let pid = child.id().unwrap_or_default();
        info!("replacement started as pid {pid}");
        // the replacement must outlive this process, so the handle is dropped
        // without waiting
        drop(child);
        Ok(pid)
    }
}
