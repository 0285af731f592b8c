//! Container driver (C3): build, run, copy-out, export, stop.
//!
//! Grounded in `original_source/src/services/docker_service.py`'s
//! `DockerService`/`DockerfileTemplateProcessor`, adapted to a podman
//! backend and a `TemplateGuard` RAII type standing in for the Python
//! `managed_template` context manager.

use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};

use crate::cmdext::CommandRunExt;
use crate::error::{PipelineError, Result};

/// Driver for the container engine used to build guest/initramfs content.
///
/// A trait (rather than a bare struct) so tests can substitute a fake
/// driver without invoking podman.
pub trait ContainerDriver {
    fn build_image(
        &self,
        context_dir: &Utf8Path,
        dockerfile_name: &str,
        image_name: &str,
        build_args: &[(&str, &str)],
    ) -> Result<()>;
    fn run_container(&self, image_name: &str, container_name: &str, command: &str) -> Result<()>;
    fn stop_container(&self, container_name: &str) -> Result<()>;
    fn copy_from_container(&self, container_name: &str, src_path: &str, dest_path: &Utf8Path) -> Result<()>;
    fn export_filesystem(&self, container_name: &str, dest_dir: &Utf8Path) -> Result<()>;
}

/// Podman-backed [`ContainerDriver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PodmanDriver;

impl ContainerDriver for PodmanDriver {
    fn build_image(
        &self,
        context_dir: &Utf8Path,
        dockerfile_name: &str,
        image_name: &str,
        build_args: &[(&str, &str)],
    ) -> Result<()> {
        let dockerfile_path = context_dir.join(dockerfile_name);
        if !context_dir.exists() {
            return Err(PipelineError::Container(format!(
                "build context directory not found: {context_dir}"
            )));
        }
        if !dockerfile_path.exists() {
            return Err(PipelineError::Container(format!(
                "Dockerfile not found: {dockerfile_path}"
            )));
        }

        tracing::info!("Building container image: {image_name}");
        let mut cmd = Command::new("podman");
        cmd.args(["build", "-t", image_name, "-f", dockerfile_name]);
        for (key, value) in build_args {
            cmd.arg("--build-arg").arg(format!("{key}={value}"));
        }
        cmd.arg(".");
        cmd.current_dir(context_dir)
            .run_checked(&format!("building image {image_name}"))?;
        Ok(())
    }

    fn run_container(&self, image_name: &str, container_name: &str, command: &str) -> Result<()> {
        // stop any stale container with the same name, ignoring failure
        let _ = self.stop_container(container_name);

        tracing::info!("Running container: {container_name}");
        let mut cmd = Command::new("podman");
        cmd.args(["run", "-d", "--name", container_name, "--rm", image_name]);
        cmd.args(command.split_whitespace());
        cmd.run_checked(&format!("starting container {container_name}"))?;
        Ok(())
    }

    fn stop_container(&self, container_name: &str) -> Result<()> {
        tracing::debug!("Stopping container: {container_name}");
        Command::new("podman")
            .args(["stop", container_name])
            .run_best_effort();
        Ok(())
    }

    fn copy_from_container(&self, container_name: &str, src_path: &str, dest_path: &Utf8Path) -> Result<()> {
        if dest_path.as_str().ends_with('/') || dest_path.is_dir() {
            crate::fs_helpers::ensure_dir(dest_path)?;
        } else {
            crate::fs_helpers::ensure_parent_dir(dest_path)?;
        }
        tracing::info!("Copying {src_path} from {container_name} to {dest_path}");
        Command::new("podman")
            .args(["cp", &format!("{container_name}:{src_path}"), dest_path.as_str()])
            .run_checked(&format!("copying {src_path} from {container_name}"))?;
        Ok(())
    }

    fn export_filesystem(&self, container_name: &str, dest_dir: &Utf8Path) -> Result<()> {
        crate::fs_helpers::ensure_dir(dest_dir)?;
        tracing::info!("Exporting filesystem from {container_name} to {dest_dir}");
        Command::new("sh")
            .arg("-c")
            .arg(format!("podman export {container_name} | tar xpf - -C {dest_dir}"))
            .run_checked(&format!("exporting filesystem from {container_name}"))?;
        Ok(())
    }
}

/// A fresh value for the `CACHEBUST` build argument, forcing podman to
/// re-run any layer that consumes it instead of reusing a stale cached
/// layer across otherwise-identical builds.
pub fn cachebust_value() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .to_string()
}

/// Run `container_name` for the duration of `body`, guaranteeing
/// best-effort cleanup even if `body` returns an error.
///
/// Adapts `DockerService.managed_container`'s try/finally contract to a
/// closure-scoped helper instead of a generator-based context manager.
pub fn managed_container<D, F, T>(
    driver: &D,
    image_name: &str,
    container_name: &str,
    command: &str,
    body: F,
) -> Result<T>
where
    D: ContainerDriver,
    F: FnOnce(&str) -> Result<T>,
{
    driver.run_container(image_name, container_name, command)?;
    let result = body(container_name);
    let _ = driver.stop_container(container_name);
    result
}

/// Write-then-restore guard for Dockerfile template variable substitution.
///
/// Mirrors `DockerfileTemplateProcessor.managed_template`: on construction,
/// every `<VAR>` placeholder in the file is replaced by its value; on
/// drop, the original file content is written back regardless of how the
/// guard's scope was exited.
pub struct TemplateGuard {
    path: Utf8PathBuf,
    original_content: String,
}

impl TemplateGuard {
    /// Substitute `template_vars` (`VAR` -> replacement, matched as `<VAR>`)
    /// into the file at `path`, recording its original content for restore.
    pub fn apply(path: &Utf8Path, template_vars: &[(&str, &str)]) -> Result<Self> {
        if !path.exists() {
            return Err(PipelineError::Container(format!(
                "Dockerfile template not found: {path}"
            )));
        }
        let original_content = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Filesystem(format!("reading {path}: {e}")))?;

        let replacements: Vec<(String, &str)> = template_vars
            .iter()
            .map(|(var, value)| (format!("<{var}>"), *value))
            .collect();
        let pairs: Vec<(&str, &str)> = replacements.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        crate::fs_helpers::replace_in_file(path, &pairs)?;

        Ok(Self {
            path: path.to_owned(),
            original_content,
        })
    }
}

impl Drop for TemplateGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::write(&self.path, &self.original_content) {
            tracing::error!("failed to restore template {}: {e}", self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn template_guard_restores_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("Dockerfile")).unwrap();
        std::fs::write(&path, "FROM <BASE>\n").unwrap();

        {
            let _guard = TemplateGuard::apply(&path, &[("BASE", "fedora:40")]).unwrap();
            assert_eq!(std::fs::read_to_string(&path).unwrap(), "FROM fedora:40\n");
        }

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "FROM <BASE>\n");
    }

    #[derive(Default)]
    struct FakeDriver {
        calls: RefCell<Vec<String>>,
    }

    impl ContainerDriver for FakeDriver {
        fn build_image(&self, _: &Utf8Path, _: &str, _: &str, _: &[(&str, &str)]) -> Result<()> {
            Ok(())
        }
        fn run_container(&self, _image: &str, name: &str, _command: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("run:{name}"));
            Ok(())
        }
        fn stop_container(&self, name: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("stop:{name}"));
            Ok(())
        }
        fn copy_from_container(&self, _: &str, _: &str, _: &Utf8Path) -> Result<()> {
            Ok(())
        }
        fn export_filesystem(&self, _: &str, _: &Utf8Path) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn managed_container_stops_even_when_body_fails() {
        let driver = FakeDriver::default();
        let result: Result<()> = managed_container(&driver, "img", "c1", "sleep 1", |_name| {
            Err(PipelineError::Build("boom".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(
            driver.calls.borrow().as_slice(),
            &["run:c1".to_string(), "stop:c1".to_string()]
        );
    }
}
