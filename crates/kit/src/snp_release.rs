//! `build_snp_release`: fetches and compiles the SNP-capable
//! hypervisor/firmware/kernel stack (kernel, OVMF, QEMU).
//!
//! This is a surrounding collaborator, out of scope per spec.md §1 ("SNP-
//! component source compilation... are OUT of scope and specified only
//! via the interfaces the core consumes"): this module only drives the
//! upstream AMDSEV build scripts through C1 and records what landed in
//! `build/snp-release/`; it does not reimplement or patch any SNP source.
//! Grounded in `original_source/src/facades/build_facade.py` and
//! `config.py`'s `SNPConfig`.

use std::process::Command;

use camino::Utf8PathBuf;
use comfy_table::{Cell, Table};

use crate::cmdext::CommandRunExt;
use crate::error::{PipelineError, Result};
use crate::layout::BuildLayout;

/// Upstream repository the AMDSEV build scripts live in.
const AMDSEV_REPO: &str = "https://github.com/AMDESE/AMDSEV.git";

/// One compiled artifact expected under `build/snp-release/` after a
/// successful run: the installer's `launch.sh`, OVMF firmware, and kernel
/// package directory.
struct ExpectedArtifact {
    label: &'static str,
    relative_path: &'static str,
}

const EXPECTED_ARTIFACTS: &[ExpectedArtifact] = &[
    ExpectedArtifact {
        label: "OVMF firmware",
        relative_path: "usr/local/share/qemu/OVMF.fd",
    },
    ExpectedArtifact {
        label: "Guest kernel",
        relative_path: "linux/guest/vmlinuz",
    },
    ExpectedArtifact {
        label: "Launch installer",
        relative_path: "launch.sh",
    },
];

/// Clone (or update) the AMDSEV source tree under `layout.snp`, then run
/// its `build.sh` to compile SNP kernel/OVMF/QEMU. Prints a summary table
/// of which expected artifacts actually landed.
pub fn build_snp_release(layout: &BuildLayout) -> Result<()> {
    crate::fs_helpers::ensure_dir(&layout.snp)?;
    let src_dir = layout.snp.join("AMDSEV");

    if src_dir.is_dir() {
        tracing::info!("Updating existing SNP source tree at {src_dir}");
        Command::new("git")
            .args(["pull"])
            .current_dir(&src_dir)
            .run_checked("updating AMDSEV source tree")?;
    } else {
        tracing::info!("Cloning SNP source tree from {AMDSEV_REPO}");
        Command::new("git")
            .args(["clone", AMDSEV_REPO, src_dir.as_str()])
            .run_checked("cloning AMDSEV source tree")?;
    }

    tracing::info!("Building SNP kernel/OVMF/QEMU (this can take a long time)");
    Command::new("./build.sh")
        .arg("--package")
        .current_dir(&src_dir)
        .run_checked("building SNP release components")?;

    let installer_dir = find_installer_dir(&src_dir)?;
    print_artifact_summary(&installer_dir);

    Ok(())
}

/// AMDSEV's `build.sh --package` writes its output under a
/// `snp-release-<date>` directory; pick the most recently modified one.
fn find_installer_dir(src_dir: &camino::Utf8Path) -> Result<Utf8PathBuf> {
    let mut candidates: Vec<_> = std::fs::read_dir(src_dir)
        .map_err(|e| PipelineError::Filesystem(format!("reading {src_dir}: {e}")))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_string_lossy()
                .starts_with("snp-release-")
        })
        .collect();

    candidates.sort_by_key(|e| {
        e.metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
    });

    candidates
        .pop()
        .map(|e| Utf8PathBuf::from_path_buf(e.path()).unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy())))
        .ok_or_else(|| PipelineError::Build(format!("no snp-release-* directory found under {src_dir}")))
}

fn print_artifact_summary(installer_dir: &camino::Utf8Path) {
    let mut table = Table::new();
    table.set_header(vec!["Artifact", "Present"]);
    for artifact in EXPECTED_ARTIFACTS {
        let present = installer_dir.join(artifact.relative_path).exists();
        table.add_row(vec![
            Cell::new(artifact.label),
            Cell::new(if present { "yes" } else { "no" }),
        ]);
    }
    tracing::info!("SNP release build summary:\n{table}");
}
