//! Integration tests for cvmctl

use camino::Utf8Path;
use std::process::Output;

use color_eyre::eyre::eyre;
use color_eyre::Result;
use libtest_mimic::{Arguments, Trial};

// Re-export constants from lib for internal use
pub(crate) use integration_tests::{IntegrationTest, INTEGRATION_TESTS};
use linkme::distributed_slice;

mod tests {
    pub mod cli;
    pub mod ssh_keypair;
    pub mod verity_pipeline;
}

/// Get the path to the cvmctl binary, checking CVMCTL_PATH env var first,
/// then falling back to the debug/release build in `target/`.
pub(crate) fn get_cvmctl_command() -> Result<String> {
    if let Ok(path) = std::env::var("CVMCTL_PATH") {
        return Ok(path);
    }
    if let Some(path) = ["target/debug/cvmctl", "target/release/cvmctl"]
        .into_iter()
        .find(|p| Utf8Path::new(p).exists())
    {
        return Ok(path.to_owned());
    }
    Err(eyre!(
        "cvmctl binary not found; set CVMCTL_PATH or build target/{{debug,release}}/cvmctl first"
    ))
}

/// Captured output from a command with decoded stdout/stderr strings
pub(crate) struct CapturedOutput {
    pub output: Output,
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    /// Create from a raw Output
    pub fn new(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Self {
            output,
            stdout,
            stderr,
        }
    }

    /// Assert that the command succeeded, printing debug info on failure
    pub fn assert_success(&self, context: &str) {
        assert!(
            self.output.status.success(),
            "{} failed: {}",
            context,
            self.stderr
        );
    }

    /// Get the exit code
    pub fn exit_code(&self) -> Option<i32> {
        self.output.status.code()
    }
}

/// Run a command, capturing output
pub(crate) fn run_command(program: &str, args: &[&str]) -> std::io::Result<CapturedOutput> {
    let output = std::process::Command::new(program).args(args).output()?;
    Ok(CapturedOutput::new(output))
}

/// Run a command with a given working directory, capturing output
pub(crate) fn run_command_in(
    program: &str,
    args: &[&str],
    cwd: &Utf8Path,
) -> std::io::Result<CapturedOutput> {
    let output = std::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output()?;
    Ok(CapturedOutput::new(output))
}

/// Run the cvmctl command, capturing output
pub(crate) fn run_cvmctl(args: &[&str]) -> Result<CapturedOutput> {
    let bin = get_cvmctl_command()?;
    Ok(run_command(&bin, args)?)
}

/// Run the cvmctl command in the given working directory, capturing output
pub(crate) fn run_cvmctl_in(args: &[&str], cwd: &Utf8Path) -> Result<CapturedOutput> {
    let bin = get_cvmctl_command()?;
    Ok(run_command_in(&bin, args, cwd)?)
}

fn main() {
    let args = Arguments::from_args();

    let tests: Vec<Trial> = INTEGRATION_TESTS
        .iter()
        .map(|test| {
            let name = test.name;
            let f = test.f;
            Trial::test(name, move || f().map_err(|e| format!("{:?}", e).into()))
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
