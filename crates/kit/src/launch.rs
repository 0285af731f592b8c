//! Launch composer (C8).
//!
//! Assembles the single-dash, space-separated flag vocabulary of spec.md
//! §6.2 for the external hypervisor-launcher shell script. Adapts the
//! teacher's `qemu.rs` chained-builder idiom (`&mut self -> &mut Self`
//! methods plus a terminal `build()`) to that flag vocabulary; exact flag
//! set and ordering grounded in
//! `original_source/src/utils/utils.py`'s `QEMUCommandBuilder` and
//! `original_source/src/core/vm_manager.py`'s
//! `VMLauncher::_build_complete_command`.

use camino::Utf8PathBuf;

use crate::common_opts::{BuildOptions, LaunchOpts};
use crate::descriptor::VMDescriptor;
use crate::error::{PipelineError, Result};
use crate::layout::BuildLayout;
use crate::model::{LaunchMode, VerityArtifact};

/// Host port forwarded to the workload's service port inside the guest.
pub const HB_PORT: u32 = 8080;
/// Host port forwarded to the hypervisor's own monitor/control port.
pub const QEMU_PORT: u32 = 9000;
/// Guest memory size, in MiB.
pub const MEM_MIB: u32 = 4096;

/// A single artifact path the composer needs, paired with a human name
/// for the `MissingArtifact` error enumeration.
struct RequiredArtifact {
    name: &'static str,
    path: Utf8PathBuf,
}

/// Deterministic, fluent builder for the launcher's argv. Every method
/// appends flags in a fixed position so that [`LaunchComposer::build`]'s
/// output is stable given identical inputs (Testable Property 5).
#[derive(Debug, Default, Clone)]
pub struct LaunchComposer {
    flags: Vec<String>,
}

impl LaunchComposer {
    fn new() -> Self {
        Self { flags: Vec::new() }
    }

    fn flag(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        self.flags.push(format!("-{key} {value}"));
        self
    }

    fn bare_flag(&mut self, key: &str) -> &mut Self {
        self.flags.push(format!("-{key}"));
        self
    }

    fn build(&self) -> String {
        self.flags.join(" ")
    }
}

/// Required artifact paths for a `live` or `release` launch: the VM
/// descriptor, the verity image, and the verity hash tree.
fn artifact_set(layout: &BuildLayout, mode: LaunchMode) -> Vec<RequiredArtifact> {
    let (descriptor, image, hash_tree) = match mode {
        LaunchMode::Live => (
            layout.vm_config_file(),
            layout.verity_image(),
            layout.verity_hash_tree(),
        ),
        LaunchMode::Release => (
            Utf8PathBuf::from("./release/vm-config.toml"),
            Utf8PathBuf::from("./release/guest.img"),
            Utf8PathBuf::from("./release/hash_tree.img"),
        ),
    };
    vec![
        RequiredArtifact {
            name: "VM descriptor",
            path: descriptor,
        },
        RequiredArtifact {
            name: "Verity image",
            path: image,
        },
        RequiredArtifact {
            name: "Verity hash tree",
            path: hash_tree,
        },
    ]
}

/// Validate that every artifact a launch needs exists, returning a typed
/// `MissingArtifact` error enumerating every missing path — not just the
/// first one found (Testable Property / Scenario S3).
pub fn validate_artifacts(layout: &BuildLayout, mode: LaunchMode) -> Result<()> {
    let missing: Vec<String> = artifact_set(layout, mode)
        .into_iter()
        .filter(|a| !a.path.is_file())
        .map(|a| format!("{} ({})", a.name, a.path))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Vm(format!(
            "cannot launch: {}",
            PipelineError::MissingArtifact(missing)
        )))
    }
}

/// Compose the guest-boot launcher command for `mode`, reading descriptor
/// and verity artifacts from either the build directory (`Live`) or
/// `./release/` (`Release`), per spec.md §4.8.
pub fn compose_launch_command(
    layout: &BuildLayout,
    descriptor: &VMDescriptor,
    verity: &VerityArtifact,
    opts: &BuildOptions,
    launch: &LaunchOpts,
    mode: LaunchMode,
) -> Result<String> {
    validate_artifacts(layout, mode)?;

    let log_path = layout.build.join("qemu.log");

    let mut c = LaunchComposer::new();
    c.flag("log", log_path)
        .flag("mem", MEM_MIB)
        .flag("smp", 1)
        .bare_flag("sev-snp")
        .flag("hda", &verity.image)
        .flag("hdb", &verity.hash_tree)
        .flag("load-config", &descriptor.ovmf_file_sibling_config(layout, mode))
        .flag("hb-port", HB_PORT)
        .flag("qemu-port", QEMU_PORT)
        .flag("debug", bool_flag(opts.debug))
        .flag("enable-kvm", bool_flag(opts.enable_kvm))
        .flag("enable-tpm", bool_flag(opts.enable_tpm))
        .flag("enable-gpu", bool_flag(opts.enable_gpu));

    if let Some(data_disk) = &launch.data_disk {
        c.flag("data-disk", data_disk);
    }
    if launch.enable_ssl {
        c.flag("enableSSL", 1);
    }

    Ok(c.build())
}

/// Compose the first-boot launch command for `build_base`: boots the
/// unhardened base image with OVMF firmware and the cloud-init ConfigDrive
/// as `-hdb` instead of a verity hash tree, and without the `-sev-snp`
/// policy toggle (the base image has not yet been measured).
pub fn compose_base_boot_command(
    layout: &BuildLayout,
    firmware: &Utf8PathBuf,
    base_image: &Utf8PathBuf,
    cloud_init_configdrive: &Utf8PathBuf,
) -> Result<String> {
    for (name, path) in [
        ("firmware", firmware),
        ("base image", base_image),
        ("cloud-init ConfigDrive", cloud_init_configdrive),
    ] {
        if !path.is_file() {
            return Err(PipelineError::MissingArtifact(vec![format!(
                "{name} ({path})"
            )]));
        }
    }

    let log_path = layout.build.join("qemu-base-boot.log");
    let mut c = LaunchComposer::new();
    c.flag("log", log_path)
        .flag("mem", MEM_MIB)
        .flag("smp", 1)
        .flag("bios", firmware)
        .flag("hda", base_image)
        .flag("hdb", cloud_init_configdrive)
        .flag("hb-port", HB_PORT)
        .flag("qemu-port", QEMU_PORT)
        .flag("debug", 0)
        .flag("enable-kvm", 1)
        .flag("enable-tpm", 0)
        .flag("enable-gpu", 0)
        .bare_flag("default-network");

    Ok(c.build())
}

fn bool_flag(b: bool) -> u8 {
    if b {
        1
    } else {
        0
    }
}

impl VMDescriptor {
    /// Path the launcher's `-load-config` should point at for `mode`.
    fn ovmf_file_sibling_config(&self, layout: &BuildLayout, mode: LaunchMode) -> Utf8PathBuf {
        match mode {
            LaunchMode::Live => layout.vm_config_file(),
            LaunchMode::Release => Utf8PathBuf::from("./release/vm-config.toml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GuestPolicy, TCBFloor};

    fn sample_descriptor() -> VMDescriptor {
        VMDescriptor::new(
            Utf8PathBuf::from("/build/snp-release/OVMF.fd"),
            Utf8PathBuf::from("/build/kernel/vmlinuz"),
            Utf8PathBuf::from("/build/initramfs.cpio.gz"),
            "console=ttyS0 root=/dev/sda".to_string(),
            &GuestPolicy::default(),
            TCBFloor::default(),
        )
    }

    fn sample_verity() -> VerityArtifact {
        VerityArtifact {
            image: Utf8PathBuf::from("/build/verity/guest.img"),
            hash_tree: Utf8PathBuf::from("/build/verity/hash_tree.img"),
            root_hash: "deadbeef".to_string(),
        }
    }

    #[test]
    fn missing_artifacts_are_all_enumerated() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let layout = BuildLayout::new(&cwd);

        let err = validate_artifacts(&layout, LaunchMode::Live).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("VM descriptor"));
        assert!(msg.contains("Verity image"));
        assert!(msg.contains("Verity hash tree"));
    }

    #[test]
    fn compose_launch_command_uses_single_dash_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let layout = BuildLayout::new(&cwd);
        layout.ensure_all().unwrap();
        std::fs::write(layout.vm_config_file(), "x").unwrap();
        std::fs::write(layout.verity_image(), "x").unwrap();
        std::fs::write(layout.verity_hash_tree(), "x").unwrap();

        let opts = BuildOptions::default();
        let launch = crate::common_opts::LaunchOpts {
            data_disk: Some(Utf8PathBuf::from("/x.img")),
            enable_ssl: true,
        };

        let cmd = compose_launch_command(
            &layout,
            &sample_descriptor(),
            &sample_verity(),
            &opts,
            &launch,
            LaunchMode::Live,
        )
        .unwrap();

        assert!(cmd.contains("-data-disk /x.img"));
        assert!(cmd.contains("-enableSSL 1"));
        assert!(!cmd.contains("--data-disk"));
        assert!(!cmd.contains("data-disk=/x.img"));
        assert!(cmd.contains("-sev-snp"));
        assert!(cmd.starts_with("-log"));
    }

    #[test]
    fn compose_is_deterministic() {
        let tmp = tempfile::tempdir().unwrap();
        let cwd = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let layout = BuildLayout::new(&cwd);
        layout.ensure_all().unwrap();
        std::fs::write(layout.vm_config_file(), "x").unwrap();
        std::fs::write(layout.verity_image(), "x").unwrap();
        std::fs::write(layout.verity_hash_tree(), "x").unwrap();

        let opts = BuildOptions::default();
        let launch = LaunchOpts::default();

        let a = compose_launch_command(
            &layout,
            &sample_descriptor(),
            &sample_verity(),
            &opts,
            &launch,
            LaunchMode::Live,
        )
        .unwrap();
        let b = compose_launch_command(
            &layout,
            &sample_descriptor(),
            &sample_verity(),
            &opts,
            &launch,
            LaunchMode::Live,
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
