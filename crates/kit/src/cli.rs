//! The `cvmctl` clap command tree.
//!
//! Lives in the library (rather than only in `main.rs`) so `xtask`'s
//! `manpages` task can hand [`cli_command`] to `clap_mangen` without
//! linking the binary.

use clap::{CommandFactory, Parser, Subcommand};

use crate::common_opts::{self, LaunchOpts};

/// A build-and-launch orchestrator for an AMD SEV-SNP confidential VM.
#[derive(Parser)]
#[command(name = "cvmctl", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand)]
pub enum Commands {
    /// Create the build directory layout.
    Init,
    /// Install host-side build dependencies.
    SetupHost,
    /// Configure GPU passthrough for the guest.
    SetupGpu,
    /// Fetch and compile the SNP kernel/OVMF/QEMU stack.
    BuildSnpRelease,
    /// Build the unhardened base VM image and finalize cloud-init.
    BuildBase,
    /// Build the hardened, verity-protected guest image and VM descriptor.
    BuildGuest {
        #[command(flatten)]
        branches: common_opts::BranchOpts,
        /// Leave the guest accessible instead of hardening it.
        #[clap(long)]
        debug: bool,
    },
    /// Launch the guest from the build directory.
    Start {
        #[command(flatten)]
        launch: LaunchOpts,
    },
    /// Launch the guest from a packaged `./release/` bundle.
    StartRelease {
        #[command(flatten)]
        launch: LaunchOpts,
    },
    /// Package the build directory into a relocatable `./release/` bundle.
    PackageRelease,
    /// Download and extract a release bundle.
    DownloadRelease {
        /// URL of the release tarball to fetch.
        #[clap(long)]
        url: String,
    },
    /// Open an SSH session to the running guest.
    Ssh {
        /// Command to run remotely instead of an interactive shell.
        command: Vec<String>,
    },
    /// Show which build/release artifacts are present on disk.
    Status,
    /// Remove the build directory and any packaged release.
    Clean,
}

/// Build the `clap::Command` tree without parsing `std::env::args`, for
/// use by `xtask`'s man-page generator.
pub fn cli_command() -> clap::Command {
    Cli::command()
}
