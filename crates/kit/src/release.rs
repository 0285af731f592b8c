//! Release packager (C9).
//!
//! Builds a relocatable bundle under `./release/`: copies the verity image
//! and hash tree in, rewrites the VM descriptor's path fields to point at
//! the relocated copies, and archives the directory as a gzipped tar.
//! Grounded in `original_source/src/services/release_manager.py`'s
//! `package_release`/`download_release`/`clean`.

use std::fs::File;

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::descriptor::VMDescriptor;
use crate::error::{PipelineError, Result};
use crate::layout::BuildLayout;

/// Directory the release bundle is assembled in, relative to the process
/// working directory.
pub const RELEASE_DIR: &str = "release";

/// Copy a file referenced by a descriptor field into `release_dir`,
/// returning the relocated `./release/<basename>` path to substitute back
/// into the descriptor.
fn relocate_file(src: &Utf8Path, release_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let basename = src
        .file_name()
        .ok_or_else(|| PipelineError::Configuration(format!("path has no file name: {src}")))?;
    let dst = release_dir.join(basename);
    std::fs::copy(src, &dst)
        .map_err(|e| PipelineError::Filesystem(format!("copying {src} to {dst}: {e}")))?;
    Ok(Utf8PathBuf::from(format!("./{RELEASE_DIR}/{basename}")))
}

/// Assemble `./release/`: verity image + hash tree, the three descriptor
/// file references (kernel/OVMF/initrd) each relocated and the descriptor
/// rewritten to point at the relocated copies, then the rewritten
/// descriptor itself. Returns the path to the gzipped tar archive.
pub fn package_release(layout: &BuildLayout, descriptor: &VMDescriptor) -> Result<Utf8PathBuf> {
    let cwd = std::env::current_dir()
        .map_err(|e| PipelineError::Configuration(format!("getting current dir: {e}")))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| PipelineError::Configuration(format!("non-UTF-8 cwd: {p:?}")))?;
    let release_dir = cwd.join(RELEASE_DIR);

    crate::fs_helpers::remove_dir_all_if_exists(&release_dir)?;
    crate::fs_helpers::ensure_dir(&release_dir)?;

    tracing::info!("Copying verity artifacts into {release_dir}");
    std::fs::copy(layout.verity_image(), release_dir.join("guest.img"))
        .map_err(|e| PipelineError::Filesystem(format!("copying verity image: {e}")))?;
    std::fs::copy(layout.verity_hash_tree(), release_dir.join("hash_tree.img"))
        .map_err(|e| PipelineError::Filesystem(format!("copying verity hash tree: {e}")))?;

    tracing::info!("Relocating descriptor file references");
    let mut rewritten = descriptor.clone();
    rewritten.kernel_file = relocate_file(&descriptor.kernel_file, &release_dir)?;
    rewritten.ovmf_file = relocate_file(&descriptor.ovmf_file, &release_dir)?;
    rewritten.initrd_file = relocate_file(&descriptor.initrd_file, &release_dir)?;

    let descriptor_path = release_dir.join("vm-config.toml");
    std::fs::write(&descriptor_path, rewritten.render())
        .map_err(|e| PipelineError::Filesystem(format!("writing {descriptor_path}: {e}")))?;

    let archive_path = cwd.join("release.tar.gz");
    archive_release_dir(&release_dir, &archive_path)?;
    tracing::info!("Release archive written to {archive_path}");
    Ok(archive_path)
}

/// Archive `release_dir` as a gzipped tar, preserving the `release/` path
/// prefix inside the archive.
fn archive_release_dir(release_dir: &Utf8Path, archive_path: &Utf8Path) -> Result<()> {
    let file = File::create(archive_path)
        .map_err(|e| PipelineError::Filesystem(format!("creating {archive_path}: {e}")))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(RELEASE_DIR, release_dir)
        .map_err(|e| PipelineError::Build(format!("archiving {release_dir}: {e}")))?;
    builder
        .into_inner()
        .map_err(|e| PipelineError::Build(format!("finishing tar stream: {e}")))?
        .finish()
        .map_err(|e| PipelineError::Build(format!("finishing gzip stream: {e}")))?;
    Ok(())
}

/// Clear `./release/` and any previously produced `release.tar.gz`,
/// mirroring `release_manager.py`'s `clean`.
pub fn clean_release(cwd: &Utf8Path) -> Result<()> {
    crate::fs_helpers::remove_dir_all_if_exists(&cwd.join(RELEASE_DIR))?;
    let archive = cwd.join("release.tar.gz");
    if archive.exists() {
        std::fs::remove_file(&archive)
            .map_err(|e| PipelineError::Filesystem(format!("removing {archive}: {e}")))?;
    }
    Ok(())
}

/// Fetch a release tarball from `url` and extract it into `./release/`,
/// mirroring `download_release`.
pub fn download_release(url: &str, cwd: &Utf8Path) -> Result<Utf8PathBuf> {
    tracing::info!("Downloading release bundle from {url}");
    let response = reqwest::blocking::get(url)
        .map_err(|e| PipelineError::Dependency(format!("fetching {url}: {e}")))?;
    if !response.status().is_success() {
        return Err(PipelineError::Dependency(format!(
            "fetching {url}: server responded with {}",
            response.status()
        )));
    }
    let bytes = response
        .bytes()
        .map_err(|e| PipelineError::Dependency(format!("reading response body from {url}: {e}")))?;

    let release_dir = cwd.join(RELEASE_DIR);
    crate::fs_helpers::remove_dir_all_if_exists(&release_dir)?;
    crate::fs_helpers::ensure_dir(&release_dir)?;

    let decoder = flate2::read::GzDecoder::new(std::io::Cursor::new(bytes));
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(cwd)
        .map_err(|e| PipelineError::Filesystem(format!("extracting release archive: {e}")))?;

    tracing::info!("Release bundle extracted to {release_dir}");
    Ok(release_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GuestPolicy, TCBFloor};

    fn write_sample_artifacts(layout: &BuildLayout) -> VMDescriptor {
        layout.ensure_all().unwrap();
        std::fs::write(layout.verity_image(), b"image-bytes").unwrap();
        std::fs::write(layout.verity_hash_tree(), b"hash-tree-bytes").unwrap();
        std::fs::write(layout.kernel.join("vmlinuz"), b"kernel-bytes").unwrap();
        std::fs::write(layout.snp.join("OVMF.fd"), b"ovmf-bytes").unwrap();
        std::fs::write(layout.build.join("initramfs.cpio.gz"), b"initrd-bytes").unwrap();

        VMDescriptor::new(
            layout.snp.join("OVMF.fd"),
            layout.kernel.join("vmlinuz"),
            layout.build.join("initramfs.cpio.gz"),
            "console=ttyS0 root=/dev/sda verity_roothash=deadbeef".to_string(),
            &GuestPolicy::default(),
            TCBFloor::default(),
        )
    }

    #[test]
    fn package_release_rewrites_paths_under_release_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(&cwd).unwrap();

        let layout = BuildLayout::new(&cwd);
        let descriptor = write_sample_artifacts(&layout);

        let archive = package_release(&layout, &descriptor).unwrap();
        assert!(archive.exists());

        let rewritten = VMDescriptor::parse(
            &std::fs::read_to_string(cwd.join(RELEASE_DIR).join("vm-config.toml")).unwrap(),
        )
        .unwrap();
        assert!(rewritten.kernel_file.as_str().starts_with("./release/"));
        assert!(rewritten.ovmf_file.as_str().starts_with("./release/"));
        assert!(rewritten.initrd_file.as_str().starts_with("./release/"));
        assert!(cwd.join(rewritten.kernel_file.strip_prefix("./").unwrap()).exists());

        std::env::set_current_dir(prev).unwrap();
    }
}
