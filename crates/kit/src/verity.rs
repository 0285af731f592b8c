//! Verity image builder (C5), the largest component.
//!
//! Stage-by-stage grounded in `original_source/src/core/setup_guest.py`'s
//! `GuestSetup` class. Where the original relies on a single context
//! manager's `__enter__`/`__exit__` to tear down NBD/mount/LVM/LUKS state
//! in the right order no matter where it fails, this module factors each
//! resource into its own RAII guard so the compiler enforces the same
//! release order (reverse of acquisition) without a hand-written
//! `finally` block.

use std::fs;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::cmdext::CommandRunExt;
use crate::error::{PipelineError, Result};

const SRC_DEVICE: &str = "/dev/nbd0";
const DST_DEVICE: &str = "/dev/nbd1";
const LUKS_MAPPER_NAME: &str = "snpguard_root";

fn sudo(args: &[&str]) -> Command {
    let mut cmd = Command::new("sudo");
    cmd.args(args);
    cmd
}

/// Loads the `nbd` kernel module on construction, unloads it on drop.
/// Matches `_initialize_nbd`'s `modprobe nbd max_part=8` and `_cleanup`'s
/// `modprobe -r nbd`.
pub struct NbdModule;

impl NbdModule {
    pub fn load() -> Result<Self> {
        sudo(&["modprobe", "nbd", "max_part=8"]).run_checked("loading nbd module")?;
        Ok(Self)
    }
}

impl Drop for NbdModule {
    fn drop(&mut self) {
        sudo(&["modprobe", "-r", "nbd"]).run_best_effort();
    }
}

/// A single `qemu-nbd --connect` attachment, disconnected on drop.
pub struct NbdAttachment {
    device: String,
}

impl NbdAttachment {
    pub fn connect(device: &str, image: &Utf8Path) -> Result<Self> {
        sudo(&["qemu-nbd", &format!("--connect={device}"), image.as_str()])
            .run_checked(&format!("connecting {device} to {image}"))?;
        Ok(Self {
            device: device.to_string(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for NbdAttachment {
    fn drop(&mut self) {
        if std::path::Path::new(&self.device).exists() {
            tracing::debug!("Disconnecting {}", self.device);
            sudo(&["qemu-nbd", "--disconnect", &self.device]).run_best_effort();
            std::thread::sleep(std::time::Duration::from_secs(2));
        }
    }
}

/// A mount point, unmounted on drop (`umount -q`, matching the original's
/// best-effort cleanup).
pub struct MountGuard {
    path: Utf8PathBuf,
}

impl MountGuard {
    pub fn mount(device: &str, path: &Utf8Path) -> Result<Self> {
        sudo(&["mount", device, path.as_str()]).run_checked(&format!("mounting {device} at {path}"))?;
        Ok(Self { path: path.to_owned() })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for MountGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            tracing::debug!("Unmounting {}", self.path);
            sudo(&["umount", "-q", self.path.as_str()]).run_best_effort();
        }
    }
}

/// LUKS mapper device, closed on drop. Defensive: mirrors `_cleanup`'s
/// unconditional `cryptsetup luksClose snpguard_root` guard, which exists
/// in the original to catch a mapper left open by a previous crashed run
/// even though this pipeline does not itself open one.
pub struct LuksMapper {
    name: String,
}

impl LuksMapper {
    pub fn open(device: &str, name: &str) -> Result<Self> {
        sudo(&["cryptsetup", "luksOpen", device, name]).run_checked(&format!("opening LUKS mapper {name}"))?;
        Ok(Self { name: name.to_string() })
    }

    /// Close a possibly-already-open mapper left behind by a previous
    /// crashed run, without first having opened one ourselves.
    pub fn close_stale(name: &str) {
        let mapper_path = format!("/dev/mapper/{name}");
        if std::path::Path::new(&mapper_path).exists() {
            tracing::info!("Closing mapper device {name}");
            sudo(&["cryptsetup", "luksClose", name]).run_best_effort();
        }
    }
}

impl Drop for LuksMapper {
    fn drop(&mut self) {
        sudo(&["cryptsetup", "luksClose", &self.name]).run_best_effort();
    }
}

fn lvdisplay_stdout() -> String {
    sudo(&["lvdisplay"])
        .run_captured("listing LVM devices")
        .map(|o| o.stdout)
        .unwrap_or_default()
}

fn count_lv_paths(stdout: &str) -> usize {
    stdout.matches("LV Path").count()
}

/// Snapshot of LVM activation state taken before mounting the source
/// image; deactivates any LV/VG that newly appeared by the time it drops.
/// Mirrors `_check_lvm`/`_unmount_lvm_device`.
pub struct LvmActivation {
    initial_count: usize,
}

impl LvmActivation {
    pub fn snapshot() -> Self {
        let stdout = lvdisplay_stdout();
        let initial_count = count_lv_paths(&stdout);
        if initial_count > 0 {
            tracing::warn!(
                "a LVM filesystem is currently in use on your system; \
                 if your guest VM image uses LVM as well, this script might not work as intended"
            );
        }
        Self { initial_count }
    }

    /// Find the device path of a newly-appeared LVM root filesystem, if any.
    pub fn find_new_device(&self) -> Option<String> {
        let stdout = lvdisplay_stdout();
        if count_lv_paths(&stdout) <= self.initial_count {
            return None;
        }
        stdout
            .lines()
            .filter(|line| line.contains("LV Path"))
            .last()
            .and_then(|line| line.split_whitespace().nth(2))
            .map(|s| s.to_string())
    }
}

impl Drop for LvmActivation {
    fn drop(&mut self) {
        let stdout = lvdisplay_stdout();
        if count_lv_paths(&stdout) <= self.initial_count {
            return;
        }
        tracing::info!("Unmounting LVM device");
        let lv_path = stdout
            .lines()
            .filter(|l| l.contains("LV Path"))
            .last()
            .and_then(|l| l.split_whitespace().nth(2))
            .map(|s| s.to_string());
        let vg_name = stdout
            .lines()
            .filter(|l| l.contains("VG Name"))
            .last()
            .and_then(|l| l.split_whitespace().nth(2))
            .map(|s| s.to_string());
        if let (Some(lv_path), Some(vg_name)) = (lv_path, vg_name) {
            sudo(&["lvchange", "-an", &lv_path]).run_best_effort();
            sudo(&["vgchange", "-an", &vg_name]).run_best_effort();
        }
    }
}

/// Determine the root filesystem device of a source image already
/// attached at `nbd_device`: prefer a newly-activated LVM device, else
/// fall back to `fdisk -l` and a "Linux filesystem" partition-table match.
/// Mirrors `_find_root_fs_device`.
pub fn find_root_fs_device(nbd_device: &str, lvm: &LvmActivation, non_interactive: bool) -> Result<String> {
    if let Some(dev) = lvm.find_new_device() {
        tracing::info!("Found LVM2 filesystem: {dev}");
        return Ok(dev);
    }

    let fdisk_output = sudo(&["fdisk", nbd_device, "-l"])
        .run_captured("listing partitions")?
        .stdout;

    let re = Regex::new(r"(?i)(/dev/\S+).*Linux filesystem").expect("static regex is valid");
    let found = re
        .captures(&fdisk_output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());

    match found {
        Some(device) if std::path::Path::new(&device).exists() => {
            tracing::info!("Found the following filesystem: {device}");
            Ok(device)
        }
        _ if non_interactive => Err(PipelineError::GuestSetup(format!(
            "failed to identify root filesystem from fdisk output:\n{fdisk_output}"
        ))),
        _ => Err(PipelineError::GuestSetup(
            "failed to identify root filesystem and no device was supplied for non-interactive use".to_string(),
        )),
    }
}

/// Create `dst_image` sized to match `src_image`'s virtual size. Mirrors
/// `_create_output_image`.
pub fn create_output_image(src_image: &Utf8Path, dst_image: &Utf8Path) -> Result<()> {
    let info = Command::new("qemu-img")
        .args(["info", src_image.as_str()])
        .run_captured("reading source image info")?
        .stdout;

    let size = info
        .lines()
        .find(|line| line.contains("virtual size:"))
        .and_then(|line| line.split_whitespace().nth(2))
        .map(|s| format!("{s}G"))
        .ok_or_else(|| PipelineError::GuestSetup("could not determine image size from qemu-img info".to_string()))?;

    Command::new("qemu-img")
        .args(["create", "-f", "qcow2", dst_image.as_str(), &size])
        .run_checked("creating output image")?;
    Ok(())
}

/// `rsync -axHAWXS --numeric-ids` one tree onto another, mirroring every
/// `_copy_filesystem`/`_copy_hyperbeam_components` rsync invocation.
fn rsync(src: &Utf8Path, dst: &Utf8Path) -> Result<()> {
    sudo(&[
        "rsync",
        "-axHAWXS",
        "--numeric-ids",
        "--info=progress2",
        src.as_str(),
        dst.as_str(),
    ])
    .run_checked(&format!("copying {src} to {dst}"))?;
    Ok(())
}

/// Copy the entire source root filesystem onto the destination filesystem.
pub fn copy_filesystem(src_folder: &Utf8Path, dst_folder: &Utf8Path) -> Result<()> {
    let src_with_slash = Utf8PathBuf::from(format!("{src_folder}/"));
    let dst_with_slash = Utf8PathBuf::from(format!("{dst_folder}/"));
    rsync(&src_with_slash, &dst_with_slash)
}

/// Copy the workload content tree and (unless `debug`) its systemd unit
/// onto the destination filesystem, enabling the unit in a chroot.
pub fn copy_workload_components(build_dir: &Utf8Path, dst_folder: &Utf8Path, debug: bool) -> Result<()> {
    let content_hb = build_dir.join("content").join("hb");
    rsync(&content_hb, &dst_folder.join("root"))?;

    if !debug {
        tracing::info!("Copying workload service unit");
        let service_src = build_dir.join("content").join("hyperbeam.service");
        let service_dst = dst_folder.join("etc").join("systemd").join("system").join("hyperbeam.service");
        rsync(&service_src, &service_dst)?;

        tracing::info!("Enabling workload service");
        sudo(&[
            "chroot",
            dst_folder.as_str(),
            "systemctl",
            "enable",
            "hyperbeam.service",
        ])
        .run_checked("enabling workload service")?;
    } else {
        tracing::info!("Debug mode enabled: skipping workload service unit");
    }
    Ok(())
}

/// Console kernel-cmdline/GRUB tokens to strip in secure mode. Enumerated
/// explicitly rather than matched with one greedy `console=.*` regex, so a
/// stray unrelated `console=` value in a future GRUB line is never
/// silently swallowed.
const CONSOLE_TOKENS: &[&str] = &["console=ttyS0", "console=tty0", "console=ttyAMA0"];

/// Strip known console tokens (plus any bare `console=<value>` token) from
/// a GRUB defaults file, matching `_configure_secure_mode`'s `sed` pair.
pub fn strip_console_tokens(grub_path: &Utf8Path) -> Result<()> {
    if !grub_path.is_file() {
        return Ok(());
    }
    let content = fs::read_to_string(grub_path)
        .map_err(|e| PipelineError::Filesystem(format!("reading {grub_path}: {e}")))?;

    let bare_console = Regex::new(r"console=\S*").expect("static regex is valid");
    let mut stripped = content;
    for token in CONSOLE_TOKENS {
        stripped = stripped.replace(token, "");
    }
    stripped = bare_console.replace_all(&stripped, "").into_owned();

    let cmdline_re =
        Regex::new(r#"GRUB_CMDLINE_LINUX_DEFAULT="(.*)""#).expect("static regex is valid");
    let stripped = cmdline_re
        .replace(&stripped, |caps: &regex::Captures| {
            format!(r#"GRUB_CMDLINE_LINUX_DEFAULT="{} console=none""#, &caps[1])
        })
        .into_owned();

    fs::write(grub_path, stripped).map_err(|e| PipelineError::Filesystem(format!("writing {grub_path}: {e}")))?;
    Ok(())
}

const DISABLED_TTY_DEVICES: &[&str] = &["tty", "tty0", "tty1", "tty2", "tty3", "tty4", "tty5", "tty6", "ttyS0"];

fn chroot_systemctl(dst_folder: &Utf8Path, action: &str, unit: &str) -> Result<()> {
    Command::new("sudo")
        .args(["chroot", dst_folder.as_str(), "systemctl", action, unit])
        .run_checked(&format!("systemctl {action} {unit}"))?;
    Ok(())
}

/// Lock the image down: disable SSH/getty/serial-console units, remove
/// `/bin/bash` logins from `/etc/passwd`, strip console tokens from GRUB,
/// rename TTY device nodes, and silence kernel console messages. Mirrors
/// `_configure_secure_mode`.
pub fn configure_secure_mode(dst_folder: &Utf8Path) -> Result<()> {
    tracing::info!("Configuring secure mode - disabling access interfaces");

    chroot_systemctl(dst_folder, "disable", "ssh.service")?;
    chroot_systemctl(dst_folder, "mask", "ssh.service")?;

    let passwd_file = dst_folder.join("etc").join("passwd");
    let bash_login = Regex::new(r"^([^:]*:[^:]*:[^:]*:[^:]*:[^:]*:[^:]*):/bin/bash$")
        .expect("static regex is valid");
    if passwd_file.is_file() {
        let content = fs::read_to_string(&passwd_file)
            .map_err(|e| PipelineError::Filesystem(format!("reading {passwd_file}: {e}")))?;
        let rewritten: String = content
            .lines()
            .map(|line| {
                if bash_login.is_match(line) {
                    line.replace("/bin/bash", "/usr/sbin/nologin")
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        fs::write(&passwd_file, rewritten + "\n")
            .map_err(|e| PipelineError::Filesystem(format!("writing {passwd_file}: {e}")))?;
    }

    for i in 1..=6 {
        let unit = format!("getty@tty{i}.service");
        chroot_systemctl(dst_folder, "disable", &unit)?;
        chroot_systemctl(dst_folder, "mask", &unit)?;
    }

    chroot_systemctl(dst_folder, "disable", "serial-getty@ttyS0.service")?;
    chroot_systemctl(dst_folder, "mask", "serial-getty@ttyS0.service")?;

    let grub_path = dst_folder.join("etc").join("default").join("grub");
    if grub_path.is_file() {
        tracing::info!("Removing TTY kernel console configuration from GRUB");
        strip_console_tokens(&grub_path)?;
    }

    tracing::info!("Disabling TTY devices");
    for dev in DISABLED_TTY_DEVICES {
        let dev_path = dst_folder.join("dev").join(dev);
        if dev_path.exists() {
            let new_path = dst_folder.join("dev").join(format!("{dev}_disabled"));
            let _ = fs::rename(&dev_path, &new_path);
        }
    }

    tracing::info!("Disabling kernel messages to console");
    Command::new("sudo")
        .args(["chroot", dst_folder.as_str(), "dmesg", "--console-off"])
        .run_best_effort();

    tracing::info!("Black box preparation complete; no TTY or console interfaces are accessible");
    Ok(())
}

/// Leave SSH and root login enabled for debugging. Mirrors
/// `_configure_debug_mode`.
pub fn configure_debug_mode(dst_folder: &Utf8Path) -> Result<()> {
    tracing::info!("Debug mode enabled: configuring root user");

    Command::new("sudo")
        .args(["chroot", dst_folder.as_str(), "sh", "-c", "echo 'root:hb' | chpasswd"])
        .run_checked("setting root password")?;

    let sshd_config = dst_folder.join("etc").join("ssh").join("sshd_config");
    Command::new("sudo")
        .args([
            "sed",
            "-i",
            "-E",
            "-e",
            r"s/^\s*#?\s*PermitRootLogin\s+.*/PermitRootLogin yes/",
            "-e",
            r"s/^\s*#?\s*PasswordAuthentication\s+.*/PasswordAuthentication yes/",
            sshd_config.as_str(),
        ])
        .run_checked("updating sshd configuration")?;

    chroot_systemctl(dst_folder, "enable", "ssh.service")?;
    tracing::info!("Debug mode configuration complete");
    Ok(())
}

/// Restructure the destination tree for read-only-root verity: move
/// `root`/`etc`/`var` aside as `_ro` originals, recreate writable
/// `home`/`etc`/`var`/`tmp`, and copy the original root content back into
/// the new (to-be-hashed) `root`. Mirrors `_finalize_filesystem_structure`.
pub fn finalize_filesystem_structure(dst_folder: &Utf8Path) -> Result<()> {
    sudo(&["rm", "-rf", dst_folder.join("tmp").as_str()]).run_checked("clearing tmp")?;

    for name in ["root", "etc", "var"] {
        sudo(&[
            "mv",
            dst_folder.join(name).as_str(),
            dst_folder.join(format!("{name}_ro")).as_str(),
        ])
        .run_checked(&format!("renaming {name} to {name}_ro"))?;
    }

    sudo(&[
        "mkdir",
        "-p",
        dst_folder.join("home").as_str(),
        dst_folder.join("etc").as_str(),
        dst_folder.join("var").as_str(),
        dst_folder.join("tmp").as_str(),
    ])
    .run_checked("recreating writable directories")?;

    sudo(&[
        "cp",
        "-r",
        dst_folder.join("root_ro").as_str(),
        dst_folder.join("root").as_str(),
    ])
    .run_checked("restoring root contents")?;

    Ok(())
}

/// Remove the pre-regeneration SSH host keys, harden or leave debuggable
/// per `debug`, and finalize the filesystem structure. Mirrors
/// `_prepare_verity_fs`.
pub fn prepare_verity_fs(dst_folder: &Utf8Path, debug: bool) -> Result<()> {
    let ssh_glob = dst_folder.join("etc").join("ssh");
    if ssh_glob.is_dir() {
        for entry in fs::read_dir(&ssh_glob)
            .map_err(|e| PipelineError::Filesystem(format!("reading {ssh_glob}: {e}")))?
        {
            let entry = entry.map_err(|e| PipelineError::Filesystem(format!("reading {ssh_glob}: {e}")))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with("ssh_host_") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    if debug {
        configure_debug_mode(dst_folder)?;
    } else {
        configure_secure_mode(dst_folder)?;
    }

    finalize_filesystem_structure(dst_folder)
}

/// Run `veritysetup format --batch-mode`, extract the root hash, and
/// persist it to `root_hash_path`. `--batch-mode` makes repeated runs
/// (e.g. after a cancelled prior attempt) overwrite the destination
/// unconditionally instead of prompting. Mirrors `_compute_hash_tree`.
pub fn compute_hash_tree(dst_device: &str, hash_tree_path: &Utf8Path, root_hash_path: &Utf8Path) -> Result<String> {
    crate::fs_helpers::ensure_parent_dir(hash_tree_path)?;
    crate::fs_helpers::ensure_parent_dir(root_hash_path)?;

    let out = sudo(&["veritysetup", "format", "--batch-mode", dst_device, hash_tree_path.as_str()])
        .run_captured("computing verity hash tree")?;

    let root_hash = out
        .stdout
        .lines()
        .find(|line| line.contains("Root hash"))
        .and_then(|line| line.split('\t').nth(1).or_else(|| line.split(':').nth(1)))
        .map(|s| s.trim().trim_end_matches('%').to_string())
        .ok_or_else(|| PipelineError::GuestSetup("veritysetup output did not contain a root hash".to_string()))?;

    fs::write(root_hash_path, &root_hash)
        .map_err(|e| PipelineError::Filesystem(format!("writing {root_hash_path}: {e}")))?;

    Ok(root_hash)
}

/// All inputs needed to build a verity-protected guest image from an
/// unhardened source image.
pub struct VeritySetupSpec<'a> {
    pub src_image: &'a Utf8Path,
    pub build_dir: &'a Utf8Path,
    pub dst_image: &'a Utf8Path,
    pub hash_tree: &'a Utf8Path,
    pub root_hash: &'a Utf8Path,
    pub debug: bool,
    pub non_interactive: bool,
}

/// Run the full pipeline end to end, acquiring every scoped resource in
/// order and releasing them in reverse order regardless of outcome.
/// Mirrors `GuestSetup.setup`.
pub fn setup_guest(spec: &VeritySetupSpec<'_>) -> Result<String> {
    LuksMapper::close_stale(LUKS_MAPPER_NAME);

    let lvm = LvmActivation::snapshot();

    tracing::info!("Creating output image");
    create_output_image(spec.src_image, spec.dst_image)?;

    tracing::info!("Initializing NBD module");
    let _nbd_module = NbdModule::load()?;
    let src_attachment = NbdAttachment::connect(SRC_DEVICE, spec.src_image)?;
    let dst_attachment = NbdAttachment::connect(DST_DEVICE, spec.dst_image)?;

    tracing::info!("Finding root filesystem");
    let src_root_fs_device = find_root_fs_device(src_attachment.device(), &lvm, spec.non_interactive)?;
    tracing::info!("Rootfs device selected: {src_root_fs_device}");

    Command::new("sudo")
        .args(["mkfs.ext4", dst_attachment.device()])
        .run_checked("formatting destination device")?;

    let src_folder = tempfile::Builder::new()
        .prefix("src_folder_")
        .tempdir()
        .map_err(|e| PipelineError::GuestSetup(format!("creating temp mount dir: {e}")))?;
    let dst_folder = tempfile::Builder::new()
        .prefix("dst_folder_")
        .tempdir()
        .map_err(|e| PipelineError::GuestSetup(format!("creating temp mount dir: {e}")))?;
    let src_folder = Utf8PathBuf::from_path_buf(src_folder.path().to_path_buf())
        .map_err(|p| PipelineError::GuestSetup(format!("non-UTF-8 temp dir: {p:?}")))?;
    let dst_folder = Utf8PathBuf::from_path_buf(dst_folder.path().to_path_buf())
        .map_err(|p| PipelineError::GuestSetup(format!("non-UTF-8 temp dir: {p:?}")))?;

    tracing::info!("Mounting images");
    let src_mount = MountGuard::mount(&src_root_fs_device, &src_folder)?;
    let dst_mount = MountGuard::mount(dst_attachment.device(), &dst_folder)?;

    tracing::info!("Copying files (this may take some time)");
    copy_filesystem(src_mount.path(), dst_mount.path())?;

    tracing::info!("Copying workload components");
    copy_workload_components(spec.build_dir, dst_mount.path(), spec.debug)?;

    tracing::info!("Preparing output filesystem for dm-verity");
    prepare_verity_fs(dst_mount.path(), spec.debug)?;

    drop(src_mount);
    drop(dst_mount);

    tracing::info!("Computing hash tree");
    let root_hash = compute_hash_tree(dst_attachment.device(), spec.hash_tree, spec.root_hash)?;

    drop(src_attachment);
    drop(dst_attachment);

    tracing::info!("Root hash: {root_hash}");
    tracing::info!("Guest setup complete");
    Ok(root_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_lv_paths_counts_occurrences() {
        let stdout = "  LV Path                /dev/vg/lv1\n  LV Path                /dev/vg/lv2\n";
        assert_eq!(count_lv_paths(stdout), 2);
        assert_eq!(count_lv_paths(""), 0);
    }

    #[test]
    fn strip_console_tokens_removes_enumerated_and_bare_tokens() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("grub")).unwrap();
        fs::write(
            &path,
            "GRUB_CMDLINE_LINUX_DEFAULT=\"quiet console=ttyS0 console=tty0\"\n",
        )
        .unwrap();

        strip_console_tokens(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(!content.contains("console=ttyS0"));
        assert!(!content.contains("console=tty0"));
        assert!(content.contains("console=none"));
    }

    #[test]
    fn strip_console_tokens_is_a_no_op_when_file_absent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("missing-grub")).unwrap();
        strip_console_tokens(&path).unwrap();
        assert!(!path.exists());
    }
}
