//! Initramfs builder (C4).
//!
//! Generalizes the embedded-unit CPIO writer to walk an arbitrary prepared
//! filesystem tree, and reimplements the nine-step pipeline of
//! `original_source/src/core/build_initramfs.py` (validate inputs, prepare
//! directories, build+export the container, copy kernel modules/binaries/
//! init script, strip unneeded paths, archive, clean up) entirely
//! in-process rather than shelling out to `find | cpio | pv | gzip`.

use std::fs;
use std::io::{self, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::container::ContainerDriver;
use crate::error::{PipelineError, Result};

const CPIO_MAGIC: &str = "070701";

/// Directories removed from the exported container filesystem before
/// archiving — matches `cleanup_initramfs_filesystem`'s `dirs_to_remove`.
const DIRS_TO_STRIP: &[&str] = &[
    "dev", "proc", "sys", "boot", "home", "media", "mnt", "opt", "root", "srv", "tmp",
];

/// Files removed alongside the stripped directories.
const FILES_TO_STRIP: &[&str] = &[".dockerenv"];

fn write_header<W: Write>(writer: &mut W, name: &str, mode: u32, file_size: u32) -> io::Result<()> {
    let name_with_nul = format!("{name}\0");
    let namesize: u32 = name_with_nul
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry name too long"))?;

    write!(
        writer,
        "{CPIO_MAGIC}{ino:08x}{mode:08x}{uid:08x}{gid:08x}{nlink:08x}{mtime:08x}{filesize:08x}{devmajor:08x}{devminor:08x}{rdevmajor:08x}{rdevminor:08x}{namesize:08x}{check:08x}",
        ino = 0u32,
        uid = 0u32,
        gid = 0u32,
        nlink = 1u32,
        mtime = 0u32,
        filesize = file_size,
        devmajor = 0u32,
        devminor = 0u32,
        rdevmajor = 0u32,
        rdevminor = 0u32,
        check = 0u32,
    )?;

    writer.write_all(name_with_nul.as_bytes())?;
    let header_plus_name = 110 + namesize;
    let padding = (4 - (header_plus_name % 4)) % 4;
    writer.write_all(&b"\0\0\0"[..padding as usize])
}

fn write_data_padding<W: Write>(writer: &mut W, data_len: u32) -> io::Result<()> {
    let padding = (4 - (data_len % 4)) % 4;
    writer.write_all(&b"\0\0\0"[..padding as usize])
}

fn write_directory<W: Write>(writer: &mut W, path: &str) -> io::Result<()> {
    write_header(writer, path, 0o40755, 0)
}

fn write_file<W: Write>(writer: &mut W, path: &str, content: &[u8], mode: u32) -> io::Result<()> {
    let full_mode = 0o100000 | mode;
    let content_len: u32 = content
        .len()
        .try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry too large"))?;
    write_header(writer, path, full_mode, content_len)?;
    writer.write_all(content)?;
    write_data_padding(writer, content_len)
}

fn write_trailer<W: Write>(writer: &mut W) -> io::Result<()> {
    write_header(writer, "TRAILER!!!", 0, 0)
}

#[cfg(unix)]
fn entry_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn entry_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}

/// Walk `root` depth-first (directories before their contents, entries
/// sorted by name within each directory) and write every directory and
/// regular file as a newc CPIO entry relative to `root`. Symlinks and
/// other non-regular nodes are skipped; the filesystem trees this builder
/// consumes are container-exported rootfs trees that may contain device
/// nodes the build process has already stripped.
pub fn write_tree_cpio<W: Write>(writer: &mut W, root: &Utf8Path) -> Result<()> {
    let mut stack = vec![Utf8PathBuf::new()];
    let io_err = |e: io::Error, path: &Utf8Path| {
        PipelineError::Build(format!("archiving {path}: {e}"))
    };

    while let Some(rel) = stack.pop() {
        let abs = if rel.as_str().is_empty() {
            root.to_owned()
        } else {
            root.join(&rel)
        };
        let mut entries: Vec<_> = fs::read_dir(&abs)
            .map_err(|e| io_err(e, &abs))?
            .filter_map(|e| e.ok())
            .collect();
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let rel_path = if rel.as_str().is_empty() {
                Utf8PathBuf::from(name.as_ref())
            } else {
                rel.join(name.as_ref())
            };
            let meta = entry.metadata().map_err(|e| io_err(e, &rel_path))?;
            if meta.is_dir() {
                write_directory(writer, rel_path.as_str()).map_err(|e| io_err(e, &rel_path))?;
                stack.push(rel_path);
            } else if meta.is_file() {
                let content = fs::read(entry.path()).map_err(|e| io_err(e, &rel_path))?;
                write_file(writer, rel_path.as_str(), &content, entry_mode(&meta))
                    .map_err(|e| io_err(e, &rel_path))?;
            }
            // symlinks and other special files are intentionally skipped
        }
    }

    write_trailer(writer).map_err(|e| io_err(e, root))?;
    Ok(())
}

/// Required inputs the kernel-modules directory and init script must
/// satisfy before a build starts.
pub fn validate_initramfs_inputs(kernel_dir: &Utf8Path, init_script: &Utf8Path) -> Result<()> {
    if !kernel_dir.is_dir() {
        return Err(PipelineError::Configuration(format!(
            "can't locate kernel modules directory: {kernel_dir}"
        )));
    }
    if !init_script.is_file() {
        return Err(PipelineError::Configuration(format!(
            "can't locate init script: {init_script}"
        )));
    }
    Ok(())
}

/// Recreate a clean `build/initramfs` working directory.
pub fn prepare_initramfs_directories(build_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    tracing::info!("Preparing directories");
    let initrd_dir = build_dir.join("initramfs");
    crate::fs_helpers::remove_dir_all_if_exists(&initrd_dir)?;
    crate::fs_helpers::ensure_dir(&initrd_dir)?;
    Ok(initrd_dir)
}

fn copy_dir_recursive(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    crate::fs_helpers::ensure_dir(dest)?;
    for entry in fs::read_dir(src)
        .map_err(|e| PipelineError::Filesystem(format!("reading {src}: {e}")))?
    {
        let entry = entry.map_err(|e| PipelineError::Filesystem(format!("reading {src}: {e}")))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let src_path = src.join(name.as_ref());
        let dest_path = dest.join(name.as_ref());
        let meta = entry
            .metadata()
            .map_err(|e| PipelineError::Filesystem(format!("stat {src_path}: {e}")))?;
        if meta.is_dir() {
            copy_dir_recursive(&src_path, &dest_path)?;
        } else if meta.is_file() {
            fs::copy(&src_path, &dest_path)
                .map_err(|e| PipelineError::Filesystem(format!("copying {src_path} to {dest_path}: {e}")))?;
        }
    }
    Ok(())
}

/// Copy kernel modules, binaries, and the (optionally patched) init script
/// into the prepared initramfs tree.
///
/// Mirrors `copy_initramfs_components`: kernel modules come from
/// `<kernel_dir>/lib`, binaries from `<build_dir>/bin`, both landing under
/// `<initrd_dir>/usr`.
pub fn copy_initramfs_components(
    kernel_dir: &Utf8Path,
    build_dir: &Utf8Path,
    init_script: &Utf8Path,
    init_patch: Option<&Utf8Path>,
    initrd_dir: &Utf8Path,
) -> Result<()> {
    tracing::info!("Copying kernel modules");
    let src_lib = kernel_dir.join("lib");
    let dest_usr = initrd_dir.join("usr");
    crate::fs_helpers::ensure_dir(&dest_usr)?;
    copy_dir_recursive(&src_lib, &dest_usr.join("lib"))?;

    tracing::info!("Copying binaries");
    let src_bin = build_dir.join("bin");
    copy_dir_recursive(&src_bin, &dest_usr.join("bin"))?;

    tracing::info!("Copying init script");
    let dest_init = initrd_dir.join("init");
    fs::copy(init_script, &dest_init)
        .map_err(|e| PipelineError::Filesystem(format!("copying init script: {e}")))?;

    if let Some(patch) = init_patch {
        if patch.is_file() {
            tracing::info!("Patching init script");
            use crate::cmdext::CommandRunExt;
            std::process::Command::new("patch")
                .arg(dest_init.as_str())
                .arg(patch.as_str())
                .run_checked("patching init script")?;
        }
    }

    Ok(())
}

/// Remove container-only paths and strip setuid/setgid/sticky bits from
/// every binary, matching `cleanup_initramfs_filesystem`.
pub fn cleanup_initramfs_filesystem(initrd_dir: &Utf8Path) -> Result<()> {
    tracing::info!("Removing unnecessary files and directories");
    for d in DIRS_TO_STRIP {
        let path = initrd_dir.join(d);
        if path.exists() {
            crate::fs_helpers::remove_dir_all_if_exists(&path)?;
        }
    }
    for f in FILES_TO_STRIP {
        let path = initrd_dir.join(f);
        if path.exists() {
            tracing::debug!("Removing file: {f}");
            fs::remove_file(&path)
                .map_err(|e| PipelineError::Filesystem(format!("removing {path}: {e}")))?;
        }
    }

    tracing::info!("Changing permissions");
    let bin_usr = initrd_dir.join("usr").join("bin");
    if bin_usr.is_dir() {
        strip_setid_bits(&bin_usr)?;
    }
    Ok(())
}

#[cfg(unix)]
fn strip_setid_bits(dir: &Utf8Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    for entry in fs::read_dir(dir).map_err(|e| PipelineError::Filesystem(format!("reading {dir}: {e}")))? {
        let entry = entry.map_err(|e| PipelineError::Filesystem(format!("reading {dir}: {e}")))?;
        let path = entry.path();
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !meta.is_file() {
            continue;
        }
        let mode = meta.permissions().mode() & 0o0777;
        let _ = fs::set_permissions(&path, fs::Permissions::from_mode(mode));
    }
    Ok(())
}

#[cfg(not(unix))]
fn strip_setid_bits(_dir: &Utf8Path) -> Result<()> {
    Ok(())
}

/// Archive the prepared tree at `initrd_dir` into a gzip-level-1 newc CPIO
/// image at `output_path`, fully in-process.
pub fn create_initramfs_archive(initrd_dir: &Utf8Path, output_path: &Utf8Path) -> Result<()> {
    tracing::info!("Repackaging initrd");
    crate::fs_helpers::ensure_parent_dir(output_path)?;
    let file = fs::File::create(output_path)
        .map_err(|e| PipelineError::Filesystem(format!("creating {output_path}: {e}")))?;
    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::new(1));
    write_tree_cpio(&mut encoder, initrd_dir)?;
    encoder
        .finish()
        .map_err(|e| PipelineError::Build(format!("flushing gzip stream: {e}")))?;
    Ok(())
}

/// Build and export the rootfs container image used as the initramfs base.
/// Returns the name of the (now stopped) container whose filesystem was
/// exported into `initrd_dir`.
pub fn build_and_export_container(
    driver: &impl ContainerDriver,
    dockerfile: &Utf8Path,
    context_dir: &Utf8Path,
    initrd_dir: &Utf8Path,
) -> Result<()> {
    const IMAGE_NAME: &str = "cvm-initramfs-rootfs";
    const CONTAINER_NAME: &str = "cvm-initramfs-rootfs";

    let (context_dir, dockerfile_name) = if dockerfile.is_file() {
        (
            dockerfile.parent().unwrap_or(context_dir).to_owned(),
            dockerfile.file_name().unwrap_or("Dockerfile").to_string(),
        )
    } else {
        (context_dir.to_owned(), dockerfile.to_string())
    };

    tracing::info!("Building container image");
    let cachebust = crate::container::cachebust_value();
    driver.build_image(
        &context_dir,
        &dockerfile_name,
        IMAGE_NAME,
        &[("CACHEBUST", cachebust.as_str())],
    )?;

    let result = crate::container::managed_container(
        driver,
        IMAGE_NAME,
        CONTAINER_NAME,
        "sleep 3600",
        |container| {
            tracing::info!("Exporting filesystem");
            driver.export_filesystem(container, initrd_dir)
        },
    );
    result
}

/// Inputs to a full initramfs build, grouped to avoid an unwieldy function
/// signature.
pub struct InitramfsBuildSpec<'a> {
    pub kernel_dir: &'a Utf8Path,
    pub init_script: &'a Utf8Path,
    pub dockerfile: &'a Utf8Path,
    pub context_dir: &'a Utf8Path,
    pub build_dir: &'a Utf8Path,
    pub init_patch: Option<&'a Utf8Path>,
    pub out: Option<&'a Utf8Path>,
}

/// Run the full nine-step pipeline: validate, prepare, build+export
/// container, copy components, clean up filesystem, archive, and finally
/// stop the container regardless of outcome.
pub fn build_initramfs(driver: &impl ContainerDriver, spec: &InitramfsBuildSpec<'_>) -> Result<Utf8PathBuf> {
    let out = spec
        .out
        .map(|p| p.to_owned())
        .unwrap_or_else(|| spec.build_dir.join("initramfs.cpio.gz"));

    validate_initramfs_inputs(spec.kernel_dir, spec.init_script)?;
    let initrd_dir = prepare_initramfs_directories(spec.build_dir)?;

    build_and_export_container(driver, spec.dockerfile, spec.context_dir, &initrd_dir)?;

    copy_initramfs_components(
        spec.kernel_dir,
        spec.build_dir,
        spec.init_script,
        spec.init_patch,
        &initrd_dir,
    )?;
    cleanup_initramfs_filesystem(&initrd_dir)?;
    create_initramfs_archive(&initrd_dir, &out)?;

    tracing::info!("Done! New initrd can be found at {out}");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_tree_cpio_round_trips_structure() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join("usr/bin/init"), b"#!/bin/sh\necho hi\n").unwrap();
        fs::write(root.join("top-level.txt"), b"hello").unwrap();

        let mut buf = Vec::new();
        write_tree_cpio(&mut buf, &root).unwrap();

        assert!(buf.starts_with(CPIO_MAGIC.as_bytes()));
        let text = String::from_utf8_lossy(&buf);
        assert!(text.contains("usr/bin/init"));
        assert!(text.contains("top-level.txt"));
        assert!(text.contains("TRAILER!!!"));
    }

    #[test]
    fn validate_inputs_rejects_missing_kernel_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let init = root.join("init.sh");
        fs::write(&init, b"").unwrap();
        let err = validate_initramfs_inputs(&root.join("nope"), &init).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn cleanup_strips_container_only_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        fs::create_dir_all(root.join("dev")).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(root.join(".dockerenv"), b"").unwrap();
        fs::write(root.join("usr/bin/true"), b"").unwrap();

        cleanup_initramfs_filesystem(&root).unwrap();

        assert!(!root.join("dev").exists());
        assert!(!root.join(".dockerenv").exists());
        assert!(root.join("usr/bin/true").exists());
    }
}
