//! Exercises the `cvmctl ssh` keypair bootstrap against a real filesystem.
//!
//! `cvmctl ssh` itself needs a running guest to connect to, which this
//! harness can't assume is available, so these tests drive the public
//! `cvmctl::ssh` keypair API directly and only check the parts of the
//! `ssh` subcommand that don't require a live VM.

use camino::Utf8PathBuf;
use color_eyre::Result;
use cvmctl::ssh;
use integration_tests::integration_test;

/// Generating a keypair twice in the same directory reuses the first one
/// instead of clobbering it, matching what repeated `cvmctl ssh`
/// invocations against the same build tree expect.
fn test_keypair_generation_is_idempotent_on_disk() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .expect("tempdir path is valid UTF-8");

    let first = ssh::generate_ssh_keypair(&dir, "guest")?;
    let first_contents = std::fs::read_to_string(&first.private_key_path)?;

    let second = ssh::generate_ssh_keypair(&dir, "guest")?;
    let second_contents = std::fs::read_to_string(&second.private_key_path)?;

    assert_eq!(first.private_key_path, second.private_key_path);
    assert_eq!(
        first_contents, second_contents,
        "a second generation call should not rotate the existing key"
    );
    Ok(())
}

/// The generated private key is only readable by its owner.
fn test_keypair_private_key_has_restrictive_permissions() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir()?;
    let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .expect("tempdir path is valid UTF-8");

    let keypair = ssh::generate_ssh_keypair(&dir, "guest")?;
    let mode = std::fs::metadata(&keypair.private_key_path)?.permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    Ok(())
}

integration_test!(test_keypair_generation_is_idempotent_on_disk);
integration_test!(test_keypair_private_key_has_restrictive_permissions);
