//! cvmctl — build-and-launch orchestrator for an AMD SEV-SNP confidential VM.
//!
//! Drives the guest image preparation and measured-launch pipeline of
//! spec.md: assembling a dm-verity-protected root image from a generic
//! base VM image, building a matching initramfs, emitting the VM launch
//! descriptor and its attestation digest, and composing the QEMU launch
//! command that boots the measured guest.

use camino::Utf8PathBuf;
use clap::Parser;

use cvmctl::cli::{Cli, Commands};
use cvmctl::cloud_init;
use cvmctl::common_opts::{self, BuildOptions, LaunchOpts};
use cvmctl::container::{self, ContainerDriver};
use cvmctl::descriptor;
use cvmctl::digest;
use cvmctl::error::{PipelineError, Result};
use cvmctl::fs_helpers;
use cvmctl::initramfs;
use cvmctl::launch;
use cvmctl::layout::BuildLayout;
use cvmctl::model::{self, GuestPolicy, LaunchMode};
use cvmctl::release;
use cvmctl::snp_release;
use cvmctl::ssh;
use cvmctl::status;
use cvmctl::verity;

/// Install and configure the tracing/logging system.
///
/// Sets up structured logging with environment-based filtering and
/// compact console output. Logs are filtered by `RUST_LOG`, defaulting to
/// `info`.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let format = fmt::format().without_time().with_target(false).compact();

    let fmt_layer = fmt::layer()
        .event_format(format)
        .with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Register a SIGINT handler surfacing a typed `Cancelled` error's exit
/// code (130) rather than letting the default handler kill the process
/// with an unreported signal. The pipeline has no internal retry-on-
/// cancellation logic (spec.md §5); on interrupt we exit immediately
/// after the in-flight external command (if any) has also received the
/// signal, since scoped cleanup (C5's RAII guards) runs via `Drop` as the
/// current stack unwinds only for panics, not process exit — long-running
/// stages are expected to be interruption-safe at the OS level via their
/// own signal handling (e.g. `qemu-nbd`, `veritysetup`).
fn install_cancellation_handler() {
    let _ = ctrlc::set_handler(|| {
        tracing::warn!("interrupted");
        std::process::exit(PipelineError::Cancelled.exit_code());
    });
}

fn current_layout() -> Result<BuildLayout> {
    BuildLayout::from_current_dir()
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::SetupHost => cmd_setup_host(),
        Commands::SetupGpu => cmd_setup_gpu(),
        Commands::BuildSnpRelease => cmd_build_snp_release(),
        Commands::BuildBase => cmd_build_base(),
        Commands::BuildGuest { branches, debug } => cmd_build_guest(branches, debug),
        Commands::Start { launch } => cmd_start(launch, LaunchMode::Live),
        Commands::StartRelease { launch } => cmd_start(launch, LaunchMode::Release),
        Commands::PackageRelease => cmd_package_release(),
        Commands::DownloadRelease { url } => cmd_download_release(&url),
        Commands::Ssh { command } => cmd_ssh(command),
        Commands::Status => cmd_status(),
        Commands::Clean => cmd_clean(),
    }
}

fn cmd_init() -> Result<()> {
    let layout = current_layout()?;
    layout.ensure_all()?;
    tracing::info!("Initialized build directory at {}", layout.build);
    Ok(())
}

fn cmd_setup_host() -> Result<()> {
    use cvmctl::cmdext::CommandRunExt;
    tracing::info!("Installing host build dependencies");
    std::process::Command::new("sudo")
        .args([
            "dnf",
            "install",
            "-y",
            "qemu-kvm",
            "cryptsetup",
            "nbd",
            "podman",
            "rsync",
            "lvm2",
        ])
        .run_checked("installing host dependencies")?;
    Ok(())
}

fn cmd_setup_gpu() -> Result<()> {
    use cvmctl::cmdext::CommandRunExt;
    // Visible to every subsequent invocation within this process, per
    // spec.md §4.1: "the environment variable set for GPU setup
    // (`GPU_SETUP=1`) is visible to subsequent invocations within the
    // same process."
    std::env::set_var("GPU_SETUP", "1");
    tracing::info!("Configuring GPU passthrough (vfio-pci)");
    std::process::Command::new("sudo")
        .args(["modprobe", "vfio-pci"])
        .run_checked("loading vfio-pci module")?;
    Ok(())
}

fn cmd_build_snp_release() -> Result<()> {
    let layout = current_layout()?;
    snp_release::build_snp_release(&layout)
}

fn cmd_build_base() -> Result<()> {
    let layout = current_layout()?;
    layout.ensure_all()?;

    let driver = container::PodmanDriver;
    let context_dir = layout.resources.clone();

    tracing::info!("Building base image content");
    let cachebust = container::cachebust_value();
    driver.build_image(
        &context_dir,
        "base.Dockerfile",
        "cvm-base-content",
        &[("CACHEBUST", &cachebust)],
    )?;

    tracing::info!("Building initramfs");
    let initramfs_spec = initramfs::InitramfsBuildSpec {
        kernel_dir: &layout.kernel,
        init_script: &layout.resources.join("init"),
        dockerfile: &layout.resources.join("initramfs.Dockerfile"),
        context_dir: &layout.resources,
        build_dir: &layout.build,
        init_patch: None,
        out: None,
    };
    initramfs::build_initramfs(&driver, &initramfs_spec)?;

    // The unhardened base qcow2 and its cloud-init ConfigDrive are
    // produced by the external VM-creator collaborator (spec.md §2's
    // "external VM-creator"); this step is out of scope for the core and
    // is expected to have already populated `layout.base_image()`.
    let base_image = layout.base_image();
    if !base_image.is_file() {
        return Err(PipelineError::Configuration(format!(
            "base image not found at {base_image}; run the external VM-creator collaborator first"
        )));
    }

    let configdrive = layout.guest.join("cloud-init.vfat");
    let cloud_init = cloud_init::CloudInitConfig::new();
    cloud_init
        .generate_vfat_configdrive(&configdrive)
        .map_err(|e| PipelineError::Build(format!("generating cloud-init ConfigDrive: {e}")))?;

    let firmware = layout.snp.join("OVMF.fd");
    let launch_cmd = launch::compose_base_boot_command(&layout, &firmware, &base_image, &configdrive)?;
    tracing::info!("First boot to finalize cloud-init: launch.sh {launch_cmd}");

    use cvmctl::cmdext::CommandRunExt;
    std::process::Command::new("sh")
        .arg(layout.scripts.join("launch.sh").as_str())
        .args(launch_cmd.split(' '))
        .run_checked("booting base image to finalize cloud-init")?;

    Ok(())
}

fn cmd_build_guest(branches: common_opts::BranchOpts, debug: bool) -> Result<()> {
    let layout = current_layout()?;
    layout.ensure_all()?;
    let opts = BuildOptions {
        branches,
        debug,
        ..BuildOptions::default()
    };

    let driver = container::PodmanDriver;
    let content_context = layout.resources.join("content");
    tracing::info!(
        "Building workload content image (hb_branch={}, ao_branch={})",
        opts.branches.hb_branch,
        opts.branches.ao_branch
    );
    let cachebust = container::cachebust_value();
    driver.build_image(
        &content_context,
        "Dockerfile",
        "cvm-content",
        &[("CACHEBUST", &cachebust)],
    )?;
    container::managed_container(&driver, "cvm-content", "cvm-content-export", "sleep 3600", |c| {
        driver.export_filesystem(c, &layout.content_hb())
    })?;

    let verity_spec = verity::VeritySetupSpec {
        src_image: &layout.base_image(),
        build_dir: &layout.build,
        dst_image: &layout.verity_image(),
        hash_tree: &layout.verity_hash_tree(),
        root_hash: &layout.verity_root_hash(),
        debug: opts.debug,
        non_interactive: true,
    };
    let root_hash = verity::setup_guest(&verity_spec)?;

    let cmdline = model::KernelCommandLine(format!(
        "console=ttyS0 root=/dev/sda ro boot=verity verity_disk=/dev/sdb verity_roothash={root_hash}"
    ));
    let descriptor = descriptor::VMDescriptor::new(
        layout.snp.join("OVMF.fd"),
        layout.kernel.join("vmlinuz*"),
        layout.initramfs_archive(),
        cmdline.0,
        &GuestPolicy::default(),
        model::TCBFloor::default(),
    );
    descriptor.write_resolved(&layout.vm_config_file())?;

    digest::compute_digest_default(&layout.vm_config_file())?;

    tracing::info!("Guest build complete; root hash {root_hash}");
    Ok(())
}

fn cmd_start(launch_opts: LaunchOpts, mode: LaunchMode) -> Result<()> {
    let layout = current_layout()?;
    let descriptor_path = match mode {
        LaunchMode::Live => layout.vm_config_file(),
        LaunchMode::Release => Utf8PathBuf::from("./release/vm-config.toml"),
    };
    if !descriptor_path.is_file() {
        return Err(PipelineError::MissingArtifact(vec![format!(
            "VM descriptor ({descriptor_path})"
        )]));
    }
    let descriptor = descriptor::VMDescriptor::parse(
        &std::fs::read_to_string(&descriptor_path)
            .map_err(|e| PipelineError::Filesystem(format!("reading {descriptor_path}: {e}")))?,
    )?;

    let verity = model::VerityArtifact {
        image: match mode {
            LaunchMode::Live => layout.verity_image(),
            LaunchMode::Release => Utf8PathBuf::from("./release/guest.img"),
        },
        hash_tree: match mode {
            LaunchMode::Live => layout.verity_hash_tree(),
            LaunchMode::Release => Utf8PathBuf::from("./release/hash_tree.img"),
        },
        root_hash: String::new(),
    };

    let opts = BuildOptions::default();
    let launch_cmd =
        launch::compose_launch_command(&layout, &descriptor, &verity, &opts, &launch_opts, mode)?;

    tracing::info!("Launching guest: launch.sh {launch_cmd}");
    use cvmctl::cmdext::CommandRunExt;
    std::process::Command::new("sh")
        .arg(layout.scripts.join("launch.sh").as_str())
        .args(launch_cmd.split(' '))
        .run_checked("launching guest VM")?;
    Ok(())
}

fn cmd_package_release() -> Result<()> {
    let layout = current_layout()?;
    let descriptor = descriptor::VMDescriptor::parse(
        &std::fs::read_to_string(layout.vm_config_file())
            .map_err(|e| PipelineError::Filesystem(format!("reading VM descriptor: {e}")))?,
    )?;
    let archive = release::package_release(&layout, &descriptor)?;
    tracing::info!("Packaged release at {archive}");
    Ok(())
}

fn cmd_download_release(url: &str) -> Result<()> {
    let cwd = std::env::current_dir()
        .map_err(|e| PipelineError::Configuration(format!("getting current dir: {e}")))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| PipelineError::Configuration(format!("non-UTF-8 cwd: {p:?}")))?;
    release::download_release(url, &cwd)?;
    Ok(())
}

fn cmd_ssh(command: Vec<String>) -> Result<()> {
    ssh::generate_default_keypair().map_err(|e| PipelineError::Vm(format!("preparing SSH key: {e}")))?;
    let status = ssh::connect_to_guest_port(launch::HB_PORT, command)
        .map_err(|e| PipelineError::Vm(format!("SSH session failed: {e}")))?;
    if !status.success() {
        return Err(PipelineError::Vm(format!(
            "SSH exited with status {status}"
        )));
    }
    Ok(())
}

fn cmd_clean() -> Result<()> {
    let layout = current_layout()?;
    fs_helpers::remove_dir_all_if_exists(&layout.build)?;
    let cwd = std::env::current_dir()
        .map_err(|e| PipelineError::Configuration(format!("getting current dir: {e}")))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|p| PipelineError::Configuration(format!("non-UTF-8 cwd: {p:?}")))?;
    release::clean_release(&cwd)?;
    tracing::info!("Build directory and release bundle removed");
    Ok(())
}

fn cmd_status() -> Result<()> {
    let layout = current_layout()?;
    let entries = status::get_vm_status(&layout);
    println!("{}", status::render_status_table(&entries));
    Ok(())
}

fn main() {
    install_tracing();
    install_cancellation_handler();

    if let Err(err) = run() {
        let code = err.exit_code();
        eprintln!("error: {err}");
        std::process::exit(code);
    }
    std::process::exit(0);
}
