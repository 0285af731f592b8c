//! Build-wide options shared across subcommands.
//!
//! Adapted from the teacher's per-concern option-struct idiom
//! (`#[derive(Parser, ... Serialize, Deserialize)]` with a `default_value`
//! constant and a `#[serde(default = "...")]` function per field); the
//! concrete fields are `BuildOptions` from spec.md §3, grounded in
//! `original_source/config.py`'s `BuildConfig`.

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HB_BRANCH: &str = "edge";
pub const DEFAULT_AO_BRANCH: &str = "main";

/// Upstream source selection, flattened into `build_guest`.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct BranchOpts {
    /// Branch of the workload application source to build.
    #[clap(long, default_value = DEFAULT_HB_BRANCH)]
    #[serde(default = "default_hb_branch")]
    pub hb_branch: String,

    /// Branch of the auxiliary orchestration source to build.
    #[clap(long, default_value = DEFAULT_AO_BRANCH)]
    #[serde(default = "default_ao_branch")]
    pub ao_branch: String,
}

fn default_hb_branch() -> String {
    DEFAULT_HB_BRANCH.to_string()
}

fn default_ao_branch() -> String {
    DEFAULT_AO_BRANCH.to_string()
}

impl Default for BranchOpts {
    fn default() -> Self {
        Self {
            hb_branch: DEFAULT_HB_BRANCH.to_string(),
            ao_branch: DEFAULT_AO_BRANCH.to_string(),
        }
    }
}

/// Hardening and virtualization toggles, flattened into `build_guest` and
/// `start`/`start_release`.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct BuildOptions {
    #[command(flatten)]
    pub branches: BranchOpts,

    /// Leave the guest accessible (root/ssh enabled) instead of hardening it.
    #[clap(long)]
    #[serde(default)]
    pub debug: bool,

    /// Enable hardware-accelerated virtualization (`-enable-kvm 1`).
    #[clap(long, default_value_t = true)]
    #[serde(default = "default_true")]
    pub enable_kvm: bool,

    /// Enable the virtual TPM device (`-enable-tpm 1`).
    #[clap(long, default_value_t = true)]
    #[serde(default = "default_true")]
    pub enable_tpm: bool,

    /// Pass a GPU through to the guest (`-enable-gpu 1`).
    #[clap(long)]
    #[serde(default)]
    pub enable_gpu: bool,
}

fn default_true() -> bool {
    true
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            branches: BranchOpts::default(),
            debug: false,
            enable_kvm: true,
            enable_tpm: true,
            enable_gpu: false,
        }
    }
}

/// Options shared by `start` and `start_release`: data disk and SSL toggle.
#[derive(Parser, Debug, Clone, Default)]
pub struct LaunchOpts {
    /// Optional path to an additional data disk image.
    #[clap(long)]
    pub data_disk: Option<camino::Utf8PathBuf>,

    /// Enable SSL port forwarding (`-enableSSL 1`).
    #[clap(long)]
    pub enable_ssl: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let opts = BuildOptions::default();
        assert_eq!(opts.branches.hb_branch, "edge");
        assert!(opts.enable_kvm);
        assert!(opts.enable_tpm);
        assert!(!opts.debug);
        assert!(!opts.enable_gpu);
    }
}
