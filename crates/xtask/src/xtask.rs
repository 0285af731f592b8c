//! See https://github.com/matklad/cargo-xtask
//! This is kind of like "Justfile but in Rust".

use std::process::Command;

use color_eyre::eyre::{eyre, Context, Report};
use color_eyre::Result;
use xshell::Shell;

#[allow(clippy::type_complexity)]
const TASKS: &[(&str, fn(&Shell) -> Result<()>)] =
    &[("manpages", manpages), ("package", package)];

const NAME: &str = "cvmctl";
const TAR_REPRODUCIBLE_OPTS: &[&str] = &[
    "--sort=name",
    "--owner=0",
    "--group=0",
    "--numeric-owner",
];

fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;
    // Ensure our working directory is the toplevel
    {
        let toplevel_path = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .context("Invoking git rev-parse")?;
        if !toplevel_path.status.success() {
            return Err(eyre!("Failed to invoke git rev-parse"));
        }
        let path = String::from_utf8(toplevel_path.stdout)?;
        std::env::set_current_dir(path.trim()).context("Changing to toplevel")?;
    }

    let task = std::env::args().nth(1);

    let sh = xshell::Shell::new()?;
    if let Some(cmd) = task.as_deref() {
        let f = TASKS
            .iter()
            .find_map(|(k, f)| (*k == cmd).then_some(*f))
            .unwrap_or(print_help);
        f(&sh)?;
    } else {
        print_help(&sh)?;
    }
    Ok(())
}

fn print_help(_sh: &Shell) -> Result<()> {
    println!("Tasks:");
    for (name, _) in TASKS {
        println!("  - {name}");
    }
    Ok(())
}

/// Regenerate man pages from the `cvmctl` clap command tree under `docs/man/`.
fn manpages(sh: &Shell) -> Result<()> {
    let outdir = camino::Utf8Path::new("docs/man");
    sh.create_dir(outdir)?;
    let cmd = cvmctl::cli_command();
    clap_mangen::generate_to(cmd, outdir.as_std_path())
        .with_context(|| format!("Generating man pages into {outdir}"))?;
    println!("Generated man pages in {outdir}");
    Ok(())
}

fn gitrev_to_version(v: &str) -> String {
    let v = v.trim().trim_start_matches('v');
    v.replace('-', ".")
}

fn gitrev(sh: &Shell) -> Result<String> {
    use xshell::cmd;
    if let Ok(rev) = cmd!(sh, "git describe --tags --exact-match")
        .ignore_stderr()
        .read()
    {
        Ok(gitrev_to_version(&rev))
    } else {
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }
}

/// Produce a reproducible source tarball via `git archive`, for distribution packaging.
fn package(sh: &Shell) -> Result<()> {
    use camino::Utf8Path;
    use xshell::cmd;

    let v = gitrev(sh)?;
    let namev = format!("{NAME}-{v}");
    let p = Utf8Path::new("target").join(format!("{namev}.tar"));
    let prefix = format!("{namev}/");
    sh.create_dir("target")?;
    cmd!(sh, "git archive --format=tar --prefix={prefix} -o {p} HEAD").run()?;
    cmd!(
        sh,
        "tar {TAR_REPRODUCIBLE_OPTS...} -rf {p} --files-from=/dev/null"
    )
    .run()?;
    println!("Generated: {p}");
    Ok(())
}
