// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Boot-configuration text embedded in the initrd images: line-oriented
//! `key = "value"` / `key = number` assignments. Exactly the vbmeta digest
//! and size entries are rewritten; every other line must pass through
//! untouched.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static AVB_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"androidboot\.vbmeta\.avb_version = "([^"]*)""#).unwrap()
});
static DIGEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"androidboot\.vbmeta\.digest = "[^"]*""#).unwrap());
static SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"androidboot\.vbmeta\.size = [0-9]+").unwrap());

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to find androidboot.vbmeta.avb_version")]
    MissingAvbVersion,
    #[error("Failed to find androidboot.vbmeta.digest")]
    MissingDigest,
    #[error("Failed to find androidboot.vbmeta.size")]
    MissingSize,
}

type Result<T> = std::result::Result<T, Error>;

/// The avbtool version recorded when the bootconfig was generated.
pub fn avb_version(text: &str) -> Result<&str> {
    AVB_VERSION_RE
        .captures(text)
        .map(|c| c.get(1).unwrap().as_str())
        .ok_or(Error::MissingAvbVersion)
}

pub fn set_vbmeta_digest(text: &str, digest: &str) -> Result<String> {
    if !DIGEST_RE.is_match(text) {
        return Err(Error::MissingDigest);
    }

    Ok(DIGEST_RE
        .replace(text, format!(r#"androidboot.vbmeta.digest = "{digest}""#))
        .into_owned())
}

pub fn set_vbmeta_size(text: &str, size: u64) -> Result<String> {
    if !SIZE_RE.is_match(text) {
        return Err(Error::MissingSize);
    }

    Ok(SIZE_RE
        .replace(text, format!("androidboot.vbmeta.size = {size}"))
        .into_owned())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    const BOOTCONFIG: &str = r#"androidboot.hypervisor.protected_vm.supported = 1
androidboot.vbmeta.avb_version = "1.3"
androidboot.vbmeta.hash_alg = "sha256"
androidboot.vbmeta.digest = "deadbeef"
androidboot.vbmeta.size = 65536
androidboot.verifiedbootstate = "green"
"#;

    #[test]
    fn rewrites_digest_and_size_only() {
        let patched = set_vbmeta_digest(BOOTCONFIG, "0123abcd").unwrap();
        let patched = set_vbmeta_size(&patched, 5440).unwrap();

        assert!(patched.contains(r#"androidboot.vbmeta.digest = "0123abcd""#));
        assert!(patched.contains("androidboot.vbmeta.size = 5440"));

        // Every other line is untouched.
        let unchanged = |line: &str| {
            !line.contains("vbmeta.digest") && !line.contains("vbmeta.size")
        };
        let old_rest = BOOTCONFIG.lines().filter(|l| unchanged(l)).collect::<Vec<_>>();
        let new_rest = patched.lines().filter(|l| unchanged(l)).collect::<Vec<_>>();
        assert_eq!(old_rest, new_rest);
        assert_eq!(BOOTCONFIG.lines().count(), patched.lines().count());
    }

    #[test]
    fn reads_avb_version() {
        assert_eq!(avb_version(BOOTCONFIG).unwrap(), "1.3");
        assert_matches!(avb_version("foo = 1\n"), Err(Error::MissingAvbVersion));
    }

    #[test]
    fn missing_entries_are_errors() {
        assert_matches!(set_vbmeta_digest("", "x"), Err(Error::MissingDigest));
        assert_matches!(set_vbmeta_size("", 1), Err(Error::MissingSize));
    }
}
