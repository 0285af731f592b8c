//! [`BuildLayout`]: the immutable directory map constructed once at process
//! start and passed by reference to every component.
//!
//! Grounded in `original_source/config.py`'s `DirectoryConfig`, rendered
//! here as an immutable value rather than a process-wide singleton, per
//! the Design Notes ("globally mutable configuration... becomes an
//! immutable value constructed at the entry point and passed down").

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{PipelineError, Result};

/// Absolute, normalized paths for every role the pipeline writes to.
///
/// Invariant: every field is an absolute directory path that the process
/// may create and mutate. Constructed once; never rewritten.
#[derive(Debug, Clone)]
pub struct BuildLayout {
    /// Root of all generated state, `<cwd>/build` by default.
    pub build: Utf8PathBuf,
    /// Tool binaries copied into the initramfs.
    pub bin: Utf8PathBuf,
    /// Unpacked kernel package.
    pub kernel: Utf8PathBuf,
    /// Firmware + kernel packages + installer (SNP release tree).
    pub snp: Utf8PathBuf,
    /// Base image, cloud-init blob, VM descriptor.
    pub guest: Utf8PathBuf,
    /// Verity image, hash tree, root-hash text.
    pub verity: Utf8PathBuf,
    /// Workload content tree copied into the guest root.
    pub content: Utf8PathBuf,
    /// Static resources shipped with the repo (recipes, init scripts).
    pub resources: Utf8PathBuf,
    /// Helper shell scripts shipped with the repo.
    pub scripts: Utf8PathBuf,
}

impl BuildLayout {
    /// Build the layout rooted at `cwd`, creating no directories yet
    /// (callers run `init` / C2 to materialize them).
    pub fn new(cwd: &Utf8Path) -> Self {
        let build = cwd.join("build");
        Self {
            bin: build.join("bin"),
            kernel: build.join("kernel"),
            snp: build.join("snp-release"),
            guest: build.join("guest"),
            verity: build.join("verity"),
            content: build.join("content"),
            resources: cwd.join("resources"),
            scripts: cwd.join("scripts"),
            build,
        }
    }

    /// Construct from the current process working directory.
    pub fn from_current_dir() -> Result<Self> {
        let cwd = std::env::current_dir()
            .map_err(|e| PipelineError::Configuration(format!("getting current dir: {e}")))?;
        let cwd = Utf8PathBuf::from_path_buf(cwd)
            .map_err(|p| PipelineError::Configuration(format!("non-UTF-8 cwd: {p:?}")))?;
        Ok(Self::new(&cwd))
    }

    /// Path to the workload content tree consumed at guest-image overlay time.
    pub fn content_hb(&self) -> Utf8PathBuf {
        self.content.join("hb")
    }

    /// Path to the generated initramfs archive.
    pub fn initramfs_archive(&self) -> Utf8PathBuf {
        self.build.join("initramfs.cpio.gz")
    }

    /// Path to the generated VM descriptor.
    pub fn vm_config_file(&self) -> Utf8PathBuf {
        self.guest.join("vm-config.toml")
    }

    /// Path to the verity-protected guest image.
    pub fn verity_image(&self) -> Utf8PathBuf {
        self.verity.join("guest.img")
    }

    /// Path to the verity hash tree.
    pub fn verity_hash_tree(&self) -> Utf8PathBuf {
        self.verity.join("hash_tree.img")
    }

    /// Path to the recorded root-hash text file.
    pub fn verity_root_hash(&self) -> Utf8PathBuf {
        self.verity.join("root_hash")
    }

    /// Path to the unhardened base image.
    pub fn base_image(&self) -> Utf8PathBuf {
        self.guest.join("base.qcow2")
    }

    /// Create every directory role via C2. Idempotent.
    pub fn ensure_all(&self) -> Result<()> {
        for dir in [
            &self.build,
            &self.bin,
            &self.kernel,
            &self.snp,
            &self.guest,
            &self.verity,
            &self.content,
        ] {
            crate::fs_helpers::ensure_dir(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_rooted_under_build() {
        let layout = BuildLayout::new(Utf8Path::new("/work"));
        assert_eq!(layout.build, Utf8PathBuf::from("/work/build"));
        assert_eq!(layout.bin, Utf8PathBuf::from("/work/build/bin"));
        assert_eq!(
            layout.verity_image(),
            Utf8PathBuf::from("/work/build/verity/guest.img")
        );
        assert_eq!(
            layout.resources,
            Utf8PathBuf::from("/work/resources")
        );
    }
}
