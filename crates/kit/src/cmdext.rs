//! Process runner (C1): a typed wrapper over [`std::process::Command`].
//!
//! Every external tool in the pipeline — container engine, `qemu-nbd`,
//! `veritysetup`, `rsync`, the hypervisor launcher itself — is invoked
//! through this trait so that failures are reported uniformly.

use std::process::{Command, Output, Stdio};

use crate::error::{CommandFailed, PipelineError, Result};

/// Render a [`Command`]'s program and arguments as a single display string,
/// for error messages and debug logging.
fn command_line(cmd: &Command) -> String {
    let mut parts = vec![cmd.get_program().to_string_lossy().into_owned()];
    parts.extend(cmd.get_args().map(|a| a.to_string_lossy().into_owned()));
    parts.join(" ")
}

/// Output captured from a checked command run.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Captured standard output (empty unless the caller requested capture).
    pub stdout: String,
    /// Captured standard error (empty unless the caller requested capture).
    pub stderr: String,
}

/// Extension trait adding typed, logged execution to [`Command`].
pub trait CommandRunExt {
    /// Run the command, inheriting stdio, failing with a [`PipelineError::CommandFailed`]
    /// on non-zero exit. `description` is used only in the error message.
    fn run_checked(&mut self, description: &str) -> Result<()>;

    /// Run the command, capturing stdout/stderr, failing the same way as
    /// [`CommandRunExt::run_checked`] but returning the captured streams on success.
    fn run_captured(&mut self, description: &str) -> Result<CommandOutput>;

    /// Run the command, ignoring its exit status entirely (best-effort
    /// cleanup invocations, matching the original's `run_command_silent`).
    fn run_best_effort(&mut self);

    /// Run and parse the captured stdout as JSON.
    fn run_and_parse_json<T: serde::de::DeserializeOwned>(
        &mut self,
        description: &str,
    ) -> Result<T>;
}

impl CommandRunExt for Command {
    fn run_checked(&mut self, description: &str) -> Result<()> {
        let line = command_line(self);
        tracing::debug!("Running: {line}");
        let status = self
            .status()
            .map_err(|e| PipelineError::Dependency(format!("failed to spawn `{line}`: {e}")))?;
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::CommandFailed(
                CommandFailed {
                    command: line,
                    exit_code: status.code().unwrap_or(-1),
                    stdout: String::new(),
                    stderr: String::new(),
                }
                .into(),
            ))
            .map_err(|e: PipelineError| annotate(e, description))
        }
    }

    fn run_captured(&mut self, description: &str) -> Result<CommandOutput> {
        let line = command_line(self);
        tracing::debug!("Running (captured): {line}");
        let out: Output = self
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| PipelineError::Dependency(format!("failed to spawn `{line}`: {e}")))?;
        let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
        if out.status.success() {
            Ok(CommandOutput { stdout, stderr })
        } else {
            let err = PipelineError::CommandFailed(
                CommandFailed {
                    command: line,
                    exit_code: out.status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                }
                .into(),
            );
            Err(annotate(err, description))
        }
    }

    fn run_best_effort(&mut self) {
        let line = command_line(self);
        tracing::debug!("Running (best-effort): {line}");
        let _ = self
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    fn run_and_parse_json<T: serde::de::DeserializeOwned>(
        &mut self,
        description: &str,
    ) -> Result<T> {
        let out = self.run_captured(description)?;
        serde_json::from_str(&out.stdout)
            .map_err(|e| PipelineError::Build(format!("{description}: invalid JSON output: {e}")))
    }
}

fn annotate(err: PipelineError, description: &str) -> PipelineError {
    match err {
        PipelineError::CommandFailed(inner) => {
            PipelineError::Build(format!("{description}: {inner}"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_checked_succeeds_on_true() {
        Command::new("true").run_checked("test").unwrap();
    }

    #[test]
    fn run_checked_fails_on_false() {
        let err = Command::new("false").run_checked("expected failure").unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(err.to_string().contains("expected failure"));
    }

    #[test]
    fn run_captured_collects_stdout() {
        let out = Command::new("echo")
            .arg("hello")
            .run_captured("echo")
            .unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }
}
