//! Subprocess execution.
//!
//! Every host mutation that is not a file write goes through a
//! [`CommandRunner`], so tests can record the exact argument vectors
//! instead of touching the host.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::ComputeError;

/// Exit status and captured output of a finished subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful run with empty output.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// A failed run with the given exit code and stderr.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Convert a non-zero exit into [`ComputeError::ExternalTool`].
    ///
    /// # Errors
    /// Returns [`ComputeError::ExternalTool`] naming `tool` when the run failed.
    pub fn check(self, tool: &str) -> Result<Self, ComputeError> {
        if self.success() {
            return Ok(self);
        }
        let code = self
            .status
            .map_or_else(|| "signal".to_owned(), |c| c.to_string());
        Err(ComputeError::ExternalTool {
            tool: tool.to_owned(),
            reason: format!("exit status {code}: {}", self.stderr.trim()),
        })
    }
}

/// Runs an argument vector to completion.
///
/// `argv[0]` is the program. Arguments are passed verbatim; no shell is
/// involved.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command and capture its output.
    ///
    /// # Errors
    /// Returns [`ComputeError::ExternalTool`] if the program cannot be spawned.
    /// A non-zero exit is reported through [`CommandOutput::status`], not as
    /// an error.
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, ComputeError>;
}

/// [`CommandRunner`] backed by `tokio::process`. Stdin is always closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput, ComputeError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ComputeError::ExternalTool {
                tool: String::new(),
                reason: "empty command line".to_owned(),
            });
        };

        tracing::debug!(command = %argv.join(" "), "running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ComputeError::ExternalTool {
                tool: program.clone(),
                reason: format!("spawn: {e}"),
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run commands in order, stopping at the first failure.
///
/// Steps that already ran are not rolled back.
///
/// # Errors
/// Returns [`ComputeError::ExternalTool`] for the first command that fails
/// to spawn or exits non-zero.
pub async fn run_chain<R>(runner: &R, commands: &[Vec<String>]) -> Result<(), ComputeError>
where
    R: CommandRunner + ?Sized,
{
    for argv in commands {
        let tool = argv.first().cloned().unwrap_or_default();
        runner.run(argv).await?.check(&tool)?;
    }
    Ok(())
}

/// Build an owned argument vector from string slices.
pub(crate) fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|s| s.as_ref().to_owned()).collect()
}

/// Check that a binary is present, either at an absolute path or on `PATH`.
#[must_use]
pub fn binary_on_path(name: &str) -> bool {
    let path = Path::new(name);
    if path.is_absolute() {
        return path.exists();
    }
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(path).is_file())
    })
}
