// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Resolution of the fixed payload layout to filesystem paths, plus the
//! signing key and its per-file override table.

use std::{
    collections::HashMap,
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    str::FromStr,
};

/// GKI kernel versions a payload may bundle. The bundles are optional and
/// detected by the existence of the kernel file.
pub const GKI_VERSIONS: &[&str] = &["android15-6.6"];

/// Kernel image together with the initrd variants its descriptors cover.
#[derive(Clone, Debug)]
pub struct KernelEntry {
    /// Logical name, used for key overrides, scratch file names, and
    /// diagnostics.
    pub name: String,
    pub kernel: PathBuf,
    pub initrd_normal: PathBuf,
    pub initrd_debug: PathBuf,
}

/// The images of one payload directory.
#[derive(Clone, Debug)]
pub struct ImageSet {
    pub kernel: PathBuf,
    pub vbmeta: PathBuf,
    pub super_image: PathBuf,
    pub initrd_normal: PathBuf,
    pub initrd_debug: PathBuf,
    /// Secondary boot-stage image; only exists on arm64 targets.
    pub rialto: PathBuf,
    pub gki: Vec<KernelEntry>,
}

impl ImageSet {
    pub fn resolve(input_dir: &Path) -> Self {
        let gki = GKI_VERSIONS
            .iter()
            .map(|version| KernelEntry {
                name: format!("gki-{version}_kernel"),
                kernel: input_dir.join(format!("etc/fs/microdroid_gki-{version}_kernel")),
                initrd_normal: input_dir
                    .join(format!("etc/microdroid_gki-{version}_initrd_normal.img")),
                initrd_debug: input_dir
                    .join(format!("etc/microdroid_gki-{version}_initrd_debuggable.img")),
            })
            .filter(|entry| entry.kernel.is_file())
            .collect();

        Self {
            kernel: input_dir.join("etc/fs/microdroid_kernel"),
            vbmeta: input_dir.join("etc/fs/microdroid_vbmeta.img"),
            super_image: input_dir.join("etc/fs/microdroid_super.img"),
            initrd_normal: input_dir.join("etc/microdroid_initrd_normal.img"),
            initrd_debug: input_dir.join("etc/microdroid_initrd_debuggable.img"),
            rialto: input_dir.join("etc/rialto.bin"),
            gki,
        }
    }

    /// All kernel entries: the default kernel plus any detected GKI bundles.
    pub fn kernels(&self) -> Vec<KernelEntry> {
        let mut entries = vec![KernelEntry {
            name: "kernel".to_owned(),
            kernel: self.kernel.clone(),
            initrd_normal: self.initrd_normal.clone(),
            initrd_debug: self.initrd_debug.clone(),
        }];
        entries.extend(self.gki.iter().cloned());
        entries
    }

    /// All initrd variants, GKI bundles included.
    pub fn initrds(&self) -> Vec<PathBuf> {
        self.kernels()
            .into_iter()
            .flat_map(|entry| [entry.initrd_normal, entry.initrd_debug])
            .collect()
    }
}

/// One `FILE=KEY` signing key override.
#[derive(Clone, Debug)]
pub struct KeyOverride {
    pub file: OsString,
    pub key: PathBuf,
}

impl FromStr for KeyOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (file, key) = s
            .split_once('=')
            .ok_or_else(|| format!("Expected FILE=KEY, got {s:?}"))?;

        Ok(Self {
            file: OsString::from(file),
            key: PathBuf::from(key),
        })
    }
}

/// The run's signing key with its per-file override table.
#[derive(Clone, Debug)]
pub struct SigningKey {
    key: PathBuf,
    overrides: HashMap<OsString, PathBuf>,
}

impl SigningKey {
    pub fn new(key: PathBuf, overrides: Vec<KeyOverride>) -> Self {
        Self {
            key,
            overrides: overrides.into_iter().map(|o| (o.file, o.key)).collect(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.key
    }

    /// Key for a named entity (a chained partition, or a file name).
    pub fn for_name(&self, name: &str) -> &Path {
        self.overrides
            .get(OsStr::new(name))
            .map(PathBuf::as_path)
            .unwrap_or(&self.key)
    }

    /// Key for an image, honoring an override registered for its file name.
    pub fn for_image(&self, image: &Path) -> &Path {
        image
            .file_name()
            .and_then(|name| self.overrides.get(name))
            .map(PathBuf::as_path)
            .unwrap_or(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn resolves_fixed_layout() {
        let images = ImageSet::resolve(Path::new("/payload"));

        assert_eq!(images.kernel, Path::new("/payload/etc/fs/microdroid_kernel"));
        assert_eq!(
            images.vbmeta,
            Path::new("/payload/etc/fs/microdroid_vbmeta.img"),
        );
        assert_eq!(images.rialto, Path::new("/payload/etc/rialto.bin"));
        assert!(images.gki.is_empty());

        assert_eq!(images.kernels().len(), 1);
        assert_eq!(images.initrds().len(), 2);
    }

    #[test]
    fn detects_gki_bundles_by_kernel_existence() {
        let dir = tempfile::tempdir().unwrap();
        let fs_dir = dir.path().join("etc/fs");
        fs::create_dir_all(&fs_dir).unwrap();
        fs::write(fs_dir.join("microdroid_gki-android15-6.6_kernel"), b"").unwrap();

        let images = ImageSet::resolve(dir.path());
        assert_eq!(images.gki.len(), 1);
        assert_eq!(images.gki[0].name, "gki-android15-6.6_kernel");
        assert_eq!(images.kernels().len(), 2);
        assert_eq!(images.initrds().len(), 4);
    }

    #[test]
    fn key_override_parsing() {
        let o = KeyOverride::from_str("microdroid_vbmeta.img=/keys/test.pem").unwrap();
        assert_eq!(o.file, "microdroid_vbmeta.img");
        assert_eq!(o.key, Path::new("/keys/test.pem"));

        assert!(KeyOverride::from_str("no-separator").is_err());
    }

    #[test]
    fn key_overrides_apply_by_file_name() {
        let key = SigningKey::new(
            PathBuf::from("/keys/release.pem"),
            vec![KeyOverride::from_str("microdroid_vbmeta.img=/keys/test.pem").unwrap()],
        );

        assert_eq!(
            key.for_image(Path::new("/payload/etc/fs/microdroid_vbmeta.img")),
            Path::new("/keys/test.pem"),
        );
        assert_eq!(
            key.for_image(Path::new("/payload/etc/fs/microdroid_kernel")),
            Path::new("/keys/release.pem"),
        );
        assert_eq!(key.for_name("vbmeta_system"), Path::new("/keys/release.pem"));
    }
}
