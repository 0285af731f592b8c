//! Core value types from spec.md §3: `GuestPolicy`, `TCBFloor`,
//! `VerityArtifact`, `KernelCommandLine`, `LaunchSpec`.
//!
//! Defaults are grounded in `original_source/src/core/create_vm_config.py`
//! and `original_source/config.py`'s `VMConfig`/`TCBConfig`.

use camino::Utf8PathBuf;

use crate::descriptor::VMDescriptor;

/// SEV-SNP guest policy and auxiliary firmware-consumed fields.
///
/// Invariant: once written into a [`VMDescriptor`], these values MUST
/// match the values that were hashed into the attestation input — callers
/// must not mutate a `GuestPolicy` between writing the descriptor and
/// invoking the digest tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestPolicy {
    /// Opaque 64-bit SNP guest policy bitmask.
    pub guest_policy: u64,
    /// Guest feature bitmask the firmware consumes verbatim.
    pub guest_features: u64,
    /// Platform info bitmask.
    pub platform_info: u64,
    /// 32 hex chars identifying the guest family.
    pub family_id: String,
    /// 32 hex chars identifying the guest image.
    pub image_id: String,
}

impl Default for GuestPolicy {
    fn default() -> Self {
        Self {
            guest_policy: 0x30000,
            guest_features: 0x1,
            platform_info: 0x3,
            family_id: "0".repeat(32),
            image_id: "0".repeat(32),
        }
    }
}

/// Minimum acceptable platform TCB an attestation verifier will trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TCBFloor {
    pub bootloader: u32,
    pub tee: u32,
    pub snp: u32,
    pub microcode: u32,
    pub reserved: [u32; 4],
}

impl Default for TCBFloor {
    fn default() -> Self {
        Self {
            bootloader: 4,
            tee: 0,
            snp: 22,
            microcode: 213,
            reserved: [0, 0, 0, 0],
        }
    }
}

/// The dm-verity artifact triple produced by C5 and consumed by C6/C8.
///
/// Invariant: `root_hash` MUST equal the hex substring embedded in the
/// kernel command line of the descriptor written after this artifact.
#[derive(Debug, Clone)]
pub struct VerityArtifact {
    /// Block image containing exactly one ext4 filesystem.
    pub image: Utf8PathBuf,
    /// Merkle tree as produced by `veritysetup format`.
    pub hash_tree: Utf8PathBuf,
    /// ASCII hex root hash.
    pub root_hash: String,
}

/// Sentinel marking an unresolved shell-command root-hash interpolation in
/// a kernel command line, e.g. `verity_roothash='cat build/verity/root_hash'`.
const SENTINEL_PREFIX: &str = "verity_roothash='";

/// A kernel command-line string, with helpers for the verity root-hash
/// late-binding token described in spec.md §4.6 and §9.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelCommandLine(pub String);

impl KernelCommandLine {
    /// `true` if the command line still contains an unresolved
    /// `verity_roothash='<shell-command>'` interpolation sentinel.
    ///
    /// The Design Notes require implementations to reject descriptors
    /// still containing this sentinel rather than resolve it lazily at
    /// launch time.
    pub fn contains_unresolved_sentinel(&self) -> bool {
        find_sentinel(&self.0).is_some()
    }

    /// Replace the `verity_roothash='<cmd>'` sentinel, if present, with
    /// `verity_roothash=<hex>`. No-op if no sentinel is present.
    pub fn resolve_root_hash(&self, hex: &str) -> Self {
        match find_sentinel(&self.0) {
            Some((start, end)) => {
                let mut out = String::with_capacity(self.0.len());
                out.push_str(&self.0[..start]);
                out.push_str("verity_roothash=");
                out.push_str(hex);
                out.push_str(&self.0[end..]);
                Self(out)
            }
            None => self.clone(),
        }
    }
}

/// Find the byte range `[start, end)` of a `verity_roothash='...'` token,
/// where `start` is the index of `verity_roothash=` and `end` is just past
/// the closing quote.
fn find_sentinel(s: &str) -> Option<(usize, usize)> {
    let rel_start = s.find(SENTINEL_PREFIX)?;
    let quote_body_start = rel_start + SENTINEL_PREFIX.len();
    let rel_end = s[quote_body_start..].find('\'')?;
    Some((rel_start, quote_body_start + rel_end + 1))
}

/// Which set of artifact paths a launch reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Read artifacts from the build directory.
    Live,
    /// Read identically-named artifacts from `./release/`.
    Release,
}

/// The transient object fed to the launch composer (C8).
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub descriptor: VMDescriptor,
    pub verity: VerityArtifact,
    pub data_disk: Option<Utf8PathBuf>,
    pub enable_ssl: bool,
    pub mode: LaunchMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_source() {
        let policy = GuestPolicy::default();
        assert_eq!(policy.guest_policy, 0x30000);
        assert_eq!(policy.family_id.len(), 32);

        let tcb = TCBFloor::default();
        assert_eq!(tcb.bootloader, 4);
        assert_eq!(tcb.snp, 22);
        assert_eq!(tcb.microcode, 213);
        assert_eq!(tcb.reserved, [0, 0, 0, 0]);
    }

    #[test]
    fn sentinel_detection_and_resolution() {
        let cmdline = KernelCommandLine(
            "console=ttyS0 root=/dev/sda boot=verity verity_disk=/dev/sdb verity_roothash='cat build/verity/root_hash'".to_string(),
        );
        assert!(cmdline.contains_unresolved_sentinel());
        let resolved = cmdline.resolve_root_hash("deadbeef");
        assert!(!resolved.contains_unresolved_sentinel());
        assert!(resolved.0.contains("verity_roothash=deadbeef"));
        assert!(!resolved.0.contains("cat build/verity/root_hash"));
    }

    #[test]
    fn no_sentinel_is_a_no_op() {
        let cmdline = KernelCommandLine("console=ttyS0 verity_roothash=abc123".to_string());
        assert!(!cmdline.contains_unresolved_sentinel());
        let resolved = cmdline.resolve_root_hash("deadbeef");
        assert_eq!(resolved, cmdline);
    }
}
