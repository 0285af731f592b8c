//! Library surface for the `cvmctl` binary: process running, filesystem
//! helpers, the container driver, initramfs/verity/descriptor builders,
//! the launch composer and release packager, and their shared value types.

pub mod cli;
pub mod cloud_init;
pub mod cmdext;
pub mod common_opts;
pub mod container;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod fs_helpers;
pub mod initramfs;
pub mod launch;
pub mod layout;
pub mod model;
pub mod release;
pub mod snp_release;
pub mod ssh;
pub mod status;
pub mod verity;

pub use cli::cli_command;
