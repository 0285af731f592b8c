//! Integration tests exercising the `cvmctl` binary's CLI surface.
//!
//! These spawn the real binary rather than calling library functions
//! directly, so a regression in argument parsing or exit-code mapping
//! shows up the same way it would for an operator on the command line.

use camino::Utf8PathBuf;
use color_eyre::Result;
use integration_tests::integration_test;

use crate::{run_cvmctl, run_cvmctl_in};

/// `cvmctl --help` should succeed and list every top-level subcommand.
fn test_help_lists_subcommands() -> Result<()> {
    let output = run_cvmctl(&["--help"])?;
    output.assert_success("cvmctl --help");

    for subcommand in [
        "init",
        "setup-host",
        "build-base",
        "build-guest",
        "start",
        "start-release",
        "package-release",
        "download-release",
        "ssh",
        "clean",
    ] {
        assert!(
            output.stdout.contains(subcommand),
            "--help output missing subcommand {subcommand:?}:\n{}",
            output.stdout
        );
    }
    Ok(())
}

/// `cvmctl init` in a fresh directory creates the full build layout.
fn test_init_creates_build_layout() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cwd = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .expect("tempdir path is valid UTF-8");

    let output = run_cvmctl_in(&["init"], &cwd)?;
    output.assert_success("cvmctl init");

    for subdir in ["bin", "kernel", "snp-release", "guest", "verity", "content"] {
        let path = cwd.join("build").join(subdir);
        assert!(path.is_dir(), "expected {path} to exist after init");
    }
    Ok(())
}

/// `cvmctl clean` on a directory with no build state is a harmless no-op.
fn test_clean_on_untouched_directory_succeeds() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cwd = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .expect("tempdir path is valid UTF-8");

    let output = run_cvmctl_in(&["clean"], &cwd)?;
    output.assert_success("cvmctl clean on empty directory");
    assert!(!cwd.join("build").exists());
    Ok(())
}

/// `cvmctl start` without a prior `build-guest` fails with the
/// missing-artifact exit code rather than panicking or hanging.
fn test_start_without_descriptor_reports_missing_artifact() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cwd = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .expect("tempdir path is valid UTF-8");
    run_cvmctl_in(&["init"], &cwd)?.assert_success("cvmctl init");

    let output = run_cvmctl_in(&["start"], &cwd)?;
    assert!(
        !output.output.status.success(),
        "expected `start` with no VM descriptor to fail"
    );
    assert_eq!(
        output.exit_code(),
        Some(7),
        "expected the missing-artifact exit code; stderr: {}",
        output.stderr
    );
    assert!(
        output.stderr.contains("vm-config") || output.stderr.contains("descriptor"),
        "stderr should name the missing descriptor: {}",
        output.stderr
    );
    Ok(())
}

/// `cvmctl build-guest` before `build-base` also fails fast, since the
/// base image is a prerequisite the descriptor-builder checks for.
fn test_build_guest_without_base_image_fails() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let cwd = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .expect("tempdir path is valid UTF-8");
    run_cvmctl_in(&["init"], &cwd)?.assert_success("cvmctl init");

    let output = run_cvmctl_in(&["build-guest"], &cwd)?;
    assert!(
        !output.output.status.success(),
        "expected `build-guest` with no base image to fail"
    );
    Ok(())
}

integration_test!(test_help_lists_subcommands);
integration_test!(test_init_creates_build_layout);
integration_test!(test_clean_on_untouched_directory_succeeds);
integration_test!(test_start_without_descriptor_reports_missing_artifact);
integration_test!(test_build_guest_without_base_image_fails);
