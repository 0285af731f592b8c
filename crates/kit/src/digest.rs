//! Measurement digest (C7).
//!
//! Invokes the external digest tool against a VM descriptor and writes its
//! stdout — a JSON object, the single source of truth for "what will this
//! VM measure" — to `inputs.json`. Grounded in
//! `original_source/src/services/release_manager.py`'s
//! `digest_calc --vm-definition ... > inputs.json` invocation; this module
//! does not reimplement the digest algorithm itself.

use camino::Utf8Path;
use std::process::Command;

use crate::cmdext::CommandRunExt;
use crate::error::{PipelineError, Result};

/// Name of the external tool that computes the attestation measurement
/// input from a VM descriptor.
const DIGEST_TOOL: &str = "digest-calc";

/// Default name of the file the digest JSON is written to, relative to
/// the process's current working directory (matching the original, which
/// writes `inputs.json` in `cwd` rather than under `build/`).
pub const INPUTS_JSON: &str = "inputs.json";

/// Run the digest tool against `descriptor_path` and write its stdout to
/// `inputs_json_path`. Fails with `Dependency` if the tool itself cannot
/// be found/executed (propagated as `CommandFailed` by [`CommandRunExt`]),
/// and with `Filesystem` if the resulting JSON cannot be persisted.
pub fn compute_digest(descriptor_path: &Utf8Path, inputs_json_path: &Utf8Path) -> Result<String> {
    if !descriptor_path.is_file() {
        return Err(PipelineError::Configuration(format!(
            "VM descriptor not found: {descriptor_path}"
        )));
    }

    tracing::info!("Computing attestation measurement from {descriptor_path}");
    let output = Command::new(DIGEST_TOOL)
        .args(["--vm-definition", descriptor_path.as_str()])
        .run_captured("computing attestation digest")?;

    validate_json(&output.stdout)?;

    crate::fs_helpers::ensure_parent_dir(inputs_json_path)?;
    std::fs::write(inputs_json_path, &output.stdout)
        .map_err(|e| PipelineError::Filesystem(format!("writing {inputs_json_path}: {e}")))?;
    tracing::info!("Wrote attestation input to {inputs_json_path}");

    Ok(output.stdout)
}

/// Run [`compute_digest`] writing to the conventional `./inputs.json`.
pub fn compute_digest_default(descriptor_path: &Utf8Path) -> Result<String> {
    compute_digest(descriptor_path, Utf8Path::new(INPUTS_JSON))
}

fn validate_json(stdout: &str) -> Result<()> {
    serde_json::from_str::<serde_json::Value>(stdout).map_err(|e| {
        PipelineError::Build(format!(
            "{DIGEST_TOOL} did not emit valid JSON on stdout: {e}"
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_json_accepts_object() {
        assert!(validate_json(r#"{"measurement": "deadbeef"}"#).is_ok());
    }

    #[test]
    fn validate_json_rejects_garbage() {
        assert!(validate_json("not json").is_err());
    }

    #[test]
    fn compute_digest_rejects_missing_descriptor() {
        let err = compute_digest(
            Utf8Path::new("/nonexistent/vm-config.toml"),
            Utf8Path::new("/tmp/inputs.json"),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
