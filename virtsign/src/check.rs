// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Consistency check run after every footer rebuild: the public key
//! fingerprint must change (and be the same new fingerprint across the whole
//! run), while everything else in the metadata must be untouched except the
//! digests.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use thiserror::Error;

use crate::format::avbinfo::{self, ImageInfo, PUBLIC_KEY_PROPERTY};

#[derive(Debug, Error)]
pub enum Error {
    #[error("No metadata on original image: {0:?}")]
    MissingOldMetadata(PathBuf),
    #[error("No metadata on resigned image: {0:?}")]
    MissingNewMetadata(PathBuf),
    #[error("Public key fingerprint did not change for {path:?}: {fingerprint}")]
    FingerprintUnchanged { path: PathBuf, fingerprint: String },
    #[error(
        "All images must be resigned with the same key; expected fingerprint \
         {expected}, but got {actual} for {path:?}"
    )]
    FingerprintMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error(
        "Property {key:?} changed for {path:?}: {} -> {}",
        old.as_deref().unwrap_or("<absent>"),
        new.as_deref().unwrap_or("<absent>"),
    )]
    PropertyChanged {
        path: PathBuf,
        key: String,
        old: Option<String>,
        new: Option<String>,
    },
    #[error("Descriptor count changed for {path:?}: {old} -> {new}")]
    DescriptorCountChanged {
        path: PathBuf,
        old: usize,
        new: usize,
    },
    #[error("Prop descriptors changed for {path:?}: {old:?} -> {new:?}")]
    PropDescriptorsChanged {
        path: PathBuf,
        old: Vec<String>,
        new: Vec<String>,
    },
    #[error("Hash descriptor of partition {partition:?} changed for {path:?}")]
    HashDescriptorChanged { path: PathBuf, partition: String },
    #[error("Metadata error for {path:?}")]
    Info {
        path: PathBuf,
        #[source]
        source: avbinfo::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// First new-key fingerprint observed in this run. Written once; any later
/// differing value is a conflict, never an overwrite.
#[derive(Debug, Default)]
pub struct FingerprintSlot(Mutex<Option<String>>);

impl FingerprintSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &Path, fingerprint: &str) -> Result<()> {
        let mut slot = self.0.lock().unwrap();

        match slot.as_deref() {
            None => {
                *slot = Some(fingerprint.to_owned());
                Ok(())
            }
            Some(expected) if expected == fingerprint => Ok(()),
            Some(expected) => Err(Error::FingerprintMismatch {
                path: path.to_owned(),
                expected: expected.to_owned(),
                actual: fingerprint.to_owned(),
            }),
        }
    }
}

fn info_error(path: &Path) -> impl FnOnce(avbinfo::Error) -> Error {
    let path = path.to_owned();
    move |source| Error::Info { path, source }
}

/// Assert that resigning `path` changed nothing but the key fingerprint and
/// the hash descriptor digests.
pub fn check_resigned(
    path: &Path,
    old: Option<&ImageInfo>,
    new: Option<&ImageInfo>,
    slot: &FingerprintSlot,
) -> Result<()> {
    let old = old.ok_or_else(|| Error::MissingOldMetadata(path.to_owned()))?;
    let new = new.ok_or_else(|| Error::MissingNewMetadata(path.to_owned()))?;

    let old_fingerprint = old
        .require_property(PUBLIC_KEY_PROPERTY)
        .map_err(info_error(path))?;
    let new_fingerprint = new
        .require_property(PUBLIC_KEY_PROPERTY)
        .map_err(info_error(path))?;

    if old_fingerprint == new_fingerprint {
        return Err(Error::FingerprintUnchanged {
            path: path.to_owned(),
            fingerprint: new_fingerprint.to_owned(),
        });
    }

    slot.record(path, new_fingerprint)?;

    // Every other top-level property must be untouched.
    let keys = old
        .properties
        .keys()
        .chain(new.properties.keys())
        .filter(|k| k.as_str() != PUBLIC_KEY_PROPERTY);
    for key in keys {
        let old_value = old.property(key);
        let new_value = new.property(key);

        if old_value != new_value {
            return Err(Error::PropertyChanged {
                path: path.to_owned(),
                key: key.clone(),
                old: old_value.map(str::to_owned),
                new: new_value.map(str::to_owned),
            });
        }
    }

    if old.descriptors.len() != new.descriptors.len() {
        return Err(Error::DescriptorCountChanged {
            path: path.to_owned(),
            old: old.descriptors.len(),
            new: new.descriptors.len(),
        });
    }

    // Prop descriptors must match as an unordered multiset.
    let mut old_props = old.props().map(str::to_owned).collect::<Vec<_>>();
    let mut new_props = new.props().map(str::to_owned).collect::<Vec<_>>();
    old_props.sort();
    new_props.sort();
    if old_props != new_props {
        return Err(Error::PropDescriptorsChanged {
            path: path.to_owned(),
            old: old_props,
            new: new_props,
        });
    }

    // Hash descriptors must match field for field, digests excluded.
    let old_hashes = old.hash_descriptors().map_err(info_error(path))?;
    let new_hashes = new.hash_descriptors().map_err(info_error(path))?;
    let dropped = |hashes: &BTreeMap<&str, &BTreeMap<String, String>>| {
        hashes
            .iter()
            .map(|(name, fields)| (name.to_string(), avbinfo::drop_digest(fields)))
            .collect::<BTreeMap<_, _>>()
    };
    let old_dropped = dropped(&old_hashes);
    let new_dropped = dropped(&new_hashes);

    if old_dropped != new_dropped {
        let partition = old_dropped
            .keys()
            .chain(new_dropped.keys())
            .find(|name| old_dropped.get(*name) != new_dropped.get(*name))
            .expect("Maps differ")
            .clone();

        return Err(Error::HashDescriptorChanged {
            path: path.to_owned(),
            partition,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::format::avbinfo::Descriptor;

    fn image_info(fingerprint: &str, digest: &str) -> ImageInfo {
        let mut info = ImageInfo::default();
        info.properties
            .insert(PUBLIC_KEY_PROPERTY.to_owned(), fingerprint.to_owned());
        info.properties
            .insert("Algorithm".to_owned(), "SHA256_RSA4096".to_owned());
        info.properties
            .insert("Rollback Index".to_owned(), "1".to_owned());

        info.descriptors.push(Descriptor::Prop(
            "com.android.virt.cap -> 'guest_debug'".to_owned(),
        ));
        info.descriptors.push(Descriptor::Node {
            name: avbinfo::HASH_DESCRIPTOR.to_owned(),
            fields: [
                ("Partition Name", "boot"),
                ("Salt", "aabb"),
                ("Digest", digest),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        });

        info
    }

    #[test]
    fn passes_when_only_fingerprint_and_digest_change() {
        let old = image_info("old-fp", "11aa");
        let new = image_info("new-fp", "22bb");
        let slot = FingerprintSlot::new();

        check_resigned(Path::new("img"), Some(&old), Some(&new), &slot).unwrap();
    }

    #[test]
    fn identical_metadata_requires_fingerprint_change() {
        let info = image_info("same-fp", "11aa");
        let slot = FingerprintSlot::new();

        assert_matches!(
            check_resigned(Path::new("img"), Some(&info), Some(&info), &slot),
            Err(Error::FingerprintUnchanged { .. })
        );
    }

    #[test]
    fn any_other_property_change_fails() {
        let old = image_info("old-fp", "11aa");
        let mut new = image_info("new-fp", "11aa");
        new.properties
            .insert("Rollback Index".to_owned(), "2".to_owned());
        let slot = FingerprintSlot::new();

        assert_matches!(
            check_resigned(Path::new("img"), Some(&old), Some(&new), &slot),
            Err(Error::PropertyChanged { ref key, .. }) if key == "Rollback Index"
        );
    }

    #[test]
    fn missing_metadata_is_fatal() {
        let info = image_info("fp", "11aa");
        let slot = FingerprintSlot::new();

        assert_matches!(
            check_resigned(Path::new("img"), None, Some(&info), &slot),
            Err(Error::MissingOldMetadata(_))
        );
        assert_matches!(
            check_resigned(Path::new("img"), Some(&info), None, &slot),
            Err(Error::MissingNewMetadata(_))
        );
    }

    #[test]
    fn descriptor_count_change_fails() {
        let old = image_info("old-fp", "11aa");
        let mut new = image_info("new-fp", "22bb");
        new.descriptors
            .push(Descriptor::Prop("extra -> 'x'".to_owned()));
        let slot = FingerprintSlot::new();

        assert_matches!(
            check_resigned(Path::new("img"), Some(&old), Some(&new), &slot),
            Err(Error::DescriptorCountChanged { old: 2, new: 3, .. })
        );
    }

    #[test]
    fn prop_descriptors_compare_as_multiset() {
        let mut old = image_info("old-fp", "11aa");
        let mut new = image_info("new-fp", "22bb");

        old.descriptors
            .insert(0, Descriptor::Prop("second -> 'y'".to_owned()));
        new.descriptors
            .push(Descriptor::Prop("second -> 'y'".to_owned()));
        let slot = FingerprintSlot::new();

        check_resigned(Path::new("img"), Some(&old), Some(&new), &slot).unwrap();
    }

    #[test]
    fn changed_prop_descriptor_fails() {
        let old = image_info("old-fp", "11aa");
        let mut new = image_info("new-fp", "22bb");
        new.descriptors[0] = Descriptor::Prop("com.android.virt.cap -> 'other'".to_owned());
        let slot = FingerprintSlot::new();

        assert_matches!(
            check_resigned(Path::new("img"), Some(&old), Some(&new), &slot),
            Err(Error::PropDescriptorsChanged { .. })
        );
    }

    #[test]
    fn changed_hash_descriptor_field_fails() {
        let old = image_info("old-fp", "11aa");
        let mut new = image_info("new-fp", "22bb");
        if let Descriptor::Node { fields, .. } = &mut new.descriptors[1] {
            fields.insert("Salt".to_owned(), "ccdd".to_owned());
        }
        let slot = FingerprintSlot::new();

        assert_matches!(
            check_resigned(Path::new("img"), Some(&old), Some(&new), &slot),
            Err(Error::HashDescriptorChanged { ref partition, .. }) if partition == "boot"
        );
    }

    #[test]
    fn fingerprint_slot_rejects_conflicting_writes() {
        let slot = FingerprintSlot::new();
        slot.record(Path::new("a"), "fp1").unwrap();
        slot.record(Path::new("b"), "fp1").unwrap();

        assert_matches!(
            slot.record(Path::new("c"), "fp2"),
            Err(Error::FingerprintMismatch { ref expected, ref actual, .. })
                if expected == "fp1" && actual == "fp2"
        );
    }

    #[test]
    fn run_wide_fingerprint_must_match_across_images() {
        let slot = FingerprintSlot::new();

        let old_a = image_info("old-fp", "11aa");
        let new_a = image_info("new-fp-1", "22bb");
        check_resigned(Path::new("a"), Some(&old_a), Some(&new_a), &slot).unwrap();

        let old_b = image_info("old-fp", "11aa");
        let new_b = image_info("new-fp-2", "22bb");
        assert_matches!(
            check_resigned(Path::new("b"), Some(&old_b), Some(&new_b), &slot),
            Err(Error::FingerprintMismatch { .. })
        );
    }
}
