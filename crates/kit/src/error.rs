//! Typed error taxonomy for the build-and-launch pipeline.
//!
//! Every category below carries its own numeric exit code, mirroring the
//! original implementation's `HyperBeamError` subclass hierarchy
//! (`error_code` per class). `CommandFailed` is the common leaf wrapped by
//! the category that observed the failing external tool.

use thiserror::Error;

/// Context for a failed external command invocation.
#[derive(Debug, Clone)]
pub struct CommandFailed {
    /// The full command line as it was invoked (already shell-quoted where relevant).
    pub command: String,
    /// Process exit code, or -1 if the process was terminated by a signal.
    pub exit_code: i32,
    /// Captured standard output, if the caller asked for it.
    pub stdout: String,
    /// Captured standard error, if the caller asked for it.
    pub stderr: String,
}

impl std::fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "command `{}` exited with status {}",
            self.command, self.exit_code
        )?;
        if !self.stderr.trim().is_empty() {
            write!(f, "\nstderr: {}", self.stderr.trim())?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailed {}

/// The pipeline's error taxonomy, one variant per category in the error
/// handling design. Each variant's numeric payload is the taxonomy code
/// returned as the process exit code when it escapes to the CLI boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad or missing configuration/options.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A build stage failed end-to-end.
    #[error("build failed: {0}")]
    Build(String),

    /// A required external tool is absent or unusable.
    #[error("dependency error: {0}")]
    Dependency(String),

    /// Hypervisor launch or SSH failure.
    #[error("VM operation failed: {0}")]
    Vm(String),

    /// Container-engine failure.
    #[error("container operation failed: {0}")]
    Container(String),

    /// Path missing, permission denied, or non-regular node.
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// Privileged-user / `sudo` preconditions violated.
    #[error("security error: {0}")]
    Security(String),

    /// Any failure inside the verity image builder (C5).
    #[error("guest setup failed: {0}")]
    GuestSetup(String),

    /// A command invocation returned a non-zero exit status.
    #[error(transparent)]
    CommandFailed(#[from] CommandFailedError),

    /// One or more required artifact paths did not exist.
    #[error("missing required files:\n{}", .0.join("\n"))]
    MissingArtifact(Vec<String>),

    /// The user interrupted the process (SIGINT).
    #[error("cancelled")]
    Cancelled,
}

/// Newtype so `CommandFailed` can participate in `#[from]` while keeping
/// the plain struct usable on its own (e.g. attached to a category error).
#[derive(Debug)]
pub struct CommandFailedError(pub CommandFailed);

impl std::fmt::Display for CommandFailedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for CommandFailedError {}

impl From<CommandFailed> for CommandFailedError {
    fn from(value: CommandFailed) -> Self {
        Self(value)
    }
}

impl PipelineError {
    /// Taxonomy code (§7), used as the process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Configuration(_) => 2,
            PipelineError::Build(_) => 3,
            PipelineError::Dependency(_) => 4,
            PipelineError::Vm(_) => 5,
            PipelineError::Container(_) => 6,
            PipelineError::Filesystem(_) | PipelineError::MissingArtifact(_) => 7,
            PipelineError::Security(_) => 8,
            PipelineError::GuestSetup(_) => 9,
            PipelineError::CommandFailed(e) => e.0.exit_code,
            PipelineError::Cancelled => 130,
        }
    }
}

/// Convenience result alias used throughout the pipeline modules.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_taxonomy() {
        assert_eq!(PipelineError::Configuration("x".into()).exit_code(), 2);
        assert_eq!(PipelineError::Build("x".into()).exit_code(), 3);
        assert_eq!(PipelineError::Dependency("x".into()).exit_code(), 4);
        assert_eq!(PipelineError::Vm("x".into()).exit_code(), 5);
        assert_eq!(PipelineError::Container("x".into()).exit_code(), 6);
        assert_eq!(PipelineError::Filesystem("x".into()).exit_code(), 7);
        assert_eq!(PipelineError::Security("x".into()).exit_code(), 8);
        assert_eq!(PipelineError::GuestSetup("x".into()).exit_code(), 9);
        assert_eq!(PipelineError::Cancelled.exit_code(), 130);
    }

    #[test]
    fn missing_artifact_enumerates_all() {
        let err = PipelineError::MissingArtifact(vec![
            "Verity image (build/verity/image)".into(),
            "Kernel (build/kernel/vmlinuz)".into(),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("Verity image"));
        assert!(msg.contains("Kernel"));
    }
}
