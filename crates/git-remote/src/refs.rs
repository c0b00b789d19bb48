//! Pseudo-ref and pack-infix codecs.
//!
//! Each device publishes its branches under `refs/heads/<device>/...`; the
//! reserved device `latest` names the synthetic per-branch merged view.
//! git-annex's `refs/heads/synced/...` namespace is transposed so that
//! `synced/<device>/<branch>` on the wire maps to branch `synced/<branch>`
//! on `<device>`.

use anyhow::{bail, Result};

/// Reserved device name for the merged view.
pub const LATEST_DEVICE: &str = "latest";

const BRANCH_PREFIX: &str = "refs/heads/";
const SYNCED_PREFIX: &str = "synced/";
const SYNCED_ANNEX_PATH: &str = "synced/git-annex";

/// Not complete validation, just enough for safety: printable ASCII,
/// no spaces, no tilde.
pub fn validate_ref_name(name: &str) -> Result<()> {
    for c in name.bytes() {
        if c <= b' ' || c >= b'~' {
            bail!("invalid ref name");
        }
    }
    if name.is_empty() {
        bail!("ref name is too short");
    }
    Ok(())
}

/// A listed commit is either 40 hex digits or `@` followed by the ref a
/// symbolic ref points at.
pub fn validate_commit(commit: &str) -> Result<()> {
    if let Some(target) = commit.strip_prefix('@') {
        validate_ref_name(target)?;
        // re-check the marker form as a whole
        return validate_ref_name(commit);
    }
    if commit.len() != 40 || !commit.bytes().all(|c| c.is_ascii_hexdigit()) {
        bail!("wrong length for a commit hash");
    }
    Ok(())
}

/// Decode an on-the-wire ref into `(device, branch)`.
pub fn decode_pseudo_ref(ref_name: &str) -> Result<(String, String)> {
    validate_ref_name(ref_name)?;
    let Some(rest) = ref_name.strip_prefix(BRANCH_PREFIX) else {
        bail!("invalid remote ref: {ref_name:?}");
    };
    if rest == SYNCED_ANNEX_PATH {
        return Ok((LATEST_DEVICE.to_string(), SYNCED_ANNEX_PATH.to_string()));
    }
    if let Some(synced) = rest.strip_prefix(SYNCED_PREFIX) {
        // transpose "synced/<device>/<branch>" into (<device>, "synced/<branch>")
        let Some((device, branch)) = synced.split_once('/') else {
            bail!("invalid remote ref: {synced:?}");
        };
        return Ok((device.to_string(), format!("{SYNCED_PREFIX}{branch}")));
    }
    let Some((device, branch)) = rest.split_once('/') else {
        bail!("invalid remote ref: {rest:?}");
    };
    Ok((device.to_string(), branch.to_string()))
}

/// Encode `(device, branch)` into an on-the-wire ref; inverse of
/// [`decode_pseudo_ref`].
pub fn encode_pseudo_ref(device: &str, branch: &str) -> Result<String> {
    if device == LATEST_DEVICE && branch == SYNCED_ANNEX_PATH {
        return Ok(format!("{BRANCH_PREFIX}{SYNCED_ANNEX_PATH}"));
    }
    validate_ref_name(device)?;
    validate_ref_name(branch)?;
    if device.contains('/') {
        bail!("invalid device name: {device:?}");
    }
    if let Some(rest) = branch.strip_prefix(SYNCED_PREFIX) {
        return Ok(format!("{BRANCH_PREFIX}{SYNCED_PREFIX}{device}/{rest}"));
    }
    Ok(format!("{BRANCH_PREFIX}{device}/{branch}"))
}

/// Decode a pack infix `push-<device_index>-<global_index>`.
///
/// Returns `None` for infixes in other namespaces (such as blob uploads),
/// which the reference helper skips.
pub fn decode_infix(infix: &str) -> Result<Option<(u64, u64)>> {
    let parts: Vec<&str> = infix.split('-').collect();
    if parts[0] != "push" {
        return Ok(None);
    }
    if parts.len() != 3 {
        bail!("invalid filename infix {infix:?}");
    }
    let device_index: u64 = parts[1].parse()?;
    let global_index: u64 = parts[2].parse()?;
    Ok(Some((device_index, global_index)))
}

pub fn encode_infix(device_index: u64, global_index: u64) -> String {
    format!("push-{device_index}-{global_index}")
}
