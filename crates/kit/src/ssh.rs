//! SSH access to a running guest VM.
//!
//! The guest is reached over the host-forwarded port the launcher exposes
//! (spec.md §6.2's `-hb-port`), not through a container, since the guest
//! here is a directly QEMU-launched SEV-SNP VM rather than a
//! container-hosted one. Keypair generation and command-line escaping are
//! carried over from the teacher's `ssh.rs` largely unchanged.

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::{eyre::eyre, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::process::{Command, Stdio};
use tracing::debug;

/// Combine multiple command arguments into a properly escaped shell command string.
///
/// Necessary because SSH sends remote commands as a single string, not an
/// argument array: when the caller passes `["/bin/sh", "-c", "echo hi"]`
/// they must be joined into one string the remote shell parses correctly.
/// Uses the `shlex` crate for POSIX-compliant escaping.
pub fn shell_escape_command(args: &[String]) -> Result<String, shlex::QuoteError> {
    shlex::try_join(args.iter().map(|s| s.as_str()))
}

/// An SSH keypair's file paths.
#[derive(Debug, Clone)]
pub struct SshKeyPair {
    /// Path to the private key file.
    pub private_key_path: Utf8PathBuf,
    /// Path to the public key file (`private_key_path` + `.pub`).
    pub public_key_path: Utf8PathBuf,
}

/// Generate a 4096-bit RSA keypair with no passphrase under `output_dir`,
/// securing the private key with `0600` permissions.
pub fn generate_ssh_keypair(output_dir: &Utf8Path, key_name: &str) -> Result<SshKeyPair> {
    fs::create_dir_all(output_dir.as_std_path())?;

    let private_key_path = output_dir.join(key_name);
    let public_key_path = output_dir.join(format!("{key_name}.pub"));

    if private_key_path.is_file() {
        debug!("Reusing existing SSH keypair at {private_key_path}");
        return Ok(SshKeyPair {
            private_key_path,
            public_key_path,
        });
    }

    debug!("Generating SSH keypair at {private_key_path}");
    let output = Command::new("ssh-keygen")
        .args([
            "-t",
            "rsa",
            "-b",
            "4096",
            "-f",
            private_key_path.as_str(),
            "-N",
            "",
            "-C",
            &format!("cvmctl-{key_name}"),
        ])
        .output()?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(eyre!("ssh-keygen failed: {stderr}"));
    }

    let metadata = fs::metadata(private_key_path.as_std_path())?;
    let mut permissions = metadata.permissions();
    permissions.set_mode(0o600);
    fs::set_permissions(private_key_path.as_std_path(), permissions)?;

    Ok(SshKeyPair {
        private_key_path,
        public_key_path,
    })
}

/// Directory, relative to the build layout, that the guest's access
/// keypair is generated into.
const DEFAULT_KEY_DIR: &str = "build/ssh";

/// Generate (or reuse) the default keypair under `<cwd>/build/ssh`.
pub fn generate_default_keypair() -> Result<SshKeyPair> {
    generate_ssh_keypair(Utf8Path::new(DEFAULT_KEY_DIR), "guest")
}

/// Connect to the guest over its forwarded SSH port on localhost.
///
/// `port` is the host port the launcher forwarded to the guest's SSH
/// daemon (spec.md §6.2's `-hb-port`). An empty `args` opens an
/// interactive shell; a non-empty `args` is escaped into a single remote
/// command string, matching SSH's string-based remote-command protocol.
pub fn connect_to_guest_port(port: u32, args: Vec<String>) -> Result<std::process::ExitStatus> {
    connect_to_guest_port_opts(port, args, &SshConnectionOptions::default())
}

/// As [`connect_to_guest_port`], with explicit connection options.
pub fn connect_to_guest_port_opts(
    port: u32,
    args: Vec<String>,
    options: &SshConnectionOptions,
) -> Result<std::process::ExitStatus> {
    let keypair = generate_default_keypair()?;

    let mut cmd = Command::new("ssh");
    cmd.args(["-i", keypair.private_key_path.as_str()]);
    cmd.args(["-p", &port.to_string()]);
    options.common.apply_to_command(&mut cmd);
    cmd.args(["-o", "BatchMode=yes"]);

    if options.allocate_tty {
        cmd.arg("-t");
    }

    cmd.arg("root@127.0.0.1");

    let ssh_args = build_ssh_command(&args)?;
    if !ssh_args.is_empty() {
        debug!("Adding SSH arguments: {ssh_args:?}");
        cmd.args(&ssh_args);
    }

    if options.suppress_output {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    } else {
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    }

    debug!(
        "Executing: ssh {}",
        cmd.get_args()
            .map(|s| s.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(" ")
    );

    cmd.status()
        .map_err(|e| eyre!("Failed to execute SSH command: {e}"))
}

/// SSH connection configuration options.
#[derive(Debug, Clone)]
pub struct SshConnectionOptions {
    /// Common SSH options shared across callers.
    pub common: CommonSshOptions,
    /// Allocate a TTY (default: true).
    pub allocate_tty: bool,
    /// Suppress output to stdout/stderr (default: false).
    pub suppress_output: bool,
}

/// Common SSH options shared across connection helpers.
#[derive(Debug, Clone)]
pub struct CommonSshOptions {
    /// Use strict host key checking.
    pub strict_host_keys: bool,
    /// SSH connection timeout in seconds.
    pub connect_timeout: u32,
    /// Server alive interval in seconds.
    pub server_alive_interval: u32,
    /// SSH log level.
    pub log_level: String,
    /// Additional SSH options as key-value pairs.
    pub extra_options: Vec<(String, String)>,
}

impl Default for CommonSshOptions {
    fn default() -> Self {
        Self {
            strict_host_keys: false,
            connect_timeout: 30,
            server_alive_interval: 60,
            log_level: "ERROR".to_string(),
            extra_options: vec![],
        }
    }
}

impl CommonSshOptions {
    /// Apply these options to an SSH command.
    pub fn apply_to_command(&self, cmd: &mut std::process::Command) {
        cmd.args(["-o", "IdentitiesOnly=yes"]);
        cmd.args(["-o", "PasswordAuthentication=no"]);
        cmd.args(["-o", "KbdInteractiveAuthentication=no"]);
        cmd.args(["-o", "GSSAPIAuthentication=no"]);

        cmd.args(["-o", &format!("ConnectTimeout={}", self.connect_timeout)]);
        cmd.args([
            "-o",
            &format!("ServerAliveInterval={}", self.server_alive_interval),
        ]);
        cmd.args(["-o", &format!("LogLevel={}", self.log_level)]);

        if !self.strict_host_keys {
            cmd.args(["-o", "StrictHostKeyChecking=no"]);
            cmd.args(["-o", "UserKnownHostsFile=/dev/null"]);
        }

        for (key, value) in &self.extra_options {
            cmd.args(["-o", &format!("{key}={value}")]);
        }
    }
}

impl Default for SshConnectionOptions {
    fn default() -> Self {
        Self {
            common: CommonSshOptions::default(),
            allocate_tty: true,
            suppress_output: false,
        }
    }
}

impl SshConnectionOptions {
    /// Options suitable for a quick connectivity probe: short timeout, no TTY.
    pub fn for_connectivity_test() -> Self {
        Self {
            common: CommonSshOptions {
                connect_timeout: 2,
                ..CommonSshOptions::default()
            },
            allocate_tty: false,
            suppress_output: true,
        }
    }
}

/// Build the SSH remote-command argv: empty for an interactive shell, a
/// single joined/escaped string otherwise.
fn build_ssh_command(args: &[String]) -> Result<Vec<String>> {
    if args.is_empty() {
        return Ok(vec![]);
    }

    if args.len() > 1 {
        let combined_command =
            shell_escape_command(args).map_err(|e| eyre!("Failed to escape shell command: {e}"))?;
        debug!("Combined escaped command: {combined_command}");
        Ok(vec![combined_command])
    } else {
        Ok(args.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generate_ssh_keypair_creates_secure_private_key() {
        let temp_dir = TempDir::new().unwrap();
        let key_pair =
            generate_ssh_keypair(Utf8Path::from_path(temp_dir.path()).unwrap(), "test_key")
                .unwrap();

        assert!(key_pair.private_key_path.exists());
        assert!(key_pair.public_key_path.exists());

        let content = std::fs::read_to_string(key_pair.public_key_path.as_std_path()).unwrap();
        assert!(content.starts_with("ssh-rsa"));

        let metadata = std::fs::metadata(key_pair.private_key_path.as_std_path()).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn generate_ssh_keypair_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let dir = Utf8Path::from_path(temp_dir.path()).unwrap();
        let first = generate_ssh_keypair(dir, "guest").unwrap();
        let second = generate_ssh_keypair(dir, "guest").unwrap();
        assert_eq!(first.private_key_path, second.private_key_path);
    }

    #[test]
    fn ssh_connection_option_defaults() {
        let default_opts = SshConnectionOptions::default();
        assert_eq!(default_opts.common.connect_timeout, 30);
        assert!(default_opts.allocate_tty);
        assert!(!default_opts.suppress_output);

        let test_opts = SshConnectionOptions::for_connectivity_test();
        assert_eq!(test_opts.common.connect_timeout, 2);
        assert!(!test_opts.allocate_tty);
        assert!(test_opts.suppress_output);
    }

    #[test]
    fn shell_escape_command_joins_and_quotes() {
        assert_eq!(shell_escape_command(&["echo".to_string()]).unwrap(), "echo");

        let result = shell_escape_command(&[
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo hello; sleep 5; echo world".to_string(),
        ])
        .unwrap();
        assert_eq!(result, "/bin/sh -c 'echo hello; sleep 5; echo world'");
    }

    #[test]
    fn build_ssh_command_combines_multiple_args() {
        let built = build_ssh_command(&["systemctl".to_string(), "status".to_string()]).unwrap();
        assert_eq!(built, vec!["systemctl status".to_string()]);
    }

    #[test]
    fn build_ssh_command_passes_single_arg_through() {
        let built = build_ssh_command(&["uptime".to_string()]).unwrap();
        assert_eq!(built, vec!["uptime".to_string()]);
    }
}
