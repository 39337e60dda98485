// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Footer rebuild operations, one per image kind. Each op reads the image's
//! old metadata, reconstructs an equivalent footer under the new key, and
//! re-reads the metadata to run the consistency check, all within the
//! enclosing task.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use thiserror::Error;
use tracing::debug;

use crate::{
    avb::{self, AvbTool, HashFooterArgs, HashTreeFooterArgs, VbmetaArgs},
    check::{self, FingerprintSlot},
    format::avbinfo::{self, ImageInfo},
    images::SigningKey,
};

/// The verifier reads the maximum vbmeta size, so the image is padded to
/// exactly this size after the rebuild.
pub const VBMETA_IMAGE_SIZE: u64 = 65536;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No metadata in image: {0:?}")]
    MissingMetadata(PathBuf),
    #[error("No hashtree descriptor in image: {0:?}")]
    MissingHashTreeDescriptor(PathBuf),
    #[error(
        "Expected exactly one hash descriptor in {path:?} after excluding \
         included images, got {count}"
    )]
    AmbiguousHashDescriptor { path: PathBuf, count: usize },
    #[error("No hash descriptor for partition {partition:?} in {path:?}")]
    MissingHashDescriptor { partition: String, path: PathBuf },
    #[error(
        "Hash descriptor of partition {partition:?} in {included:?} does not \
         match the one in {path:?}"
    )]
    IncludedDescriptorMismatch {
        partition: String,
        included: PathBuf,
        path: PathBuf,
    },
    #[error("Hash descriptor field {field:?} missing for partition {partition:?} in {path:?}")]
    MissingDescriptorField {
        field: &'static str,
        partition: String,
        path: PathBuf,
    },
    #[error(
        "Original image size {original:?} does not match the hash \
         descriptor's image size {descriptor:?} for {path:?}"
    )]
    ImageSizeMismatch {
        path: PathBuf,
        original: String,
        descriptor: String,
    },
    #[error("Metadata error for {path:?}")]
    Info {
        path: PathBuf,
        #[source]
        source: avbinfo::Error,
    },
    #[error("Consistency check failed")]
    Check(#[from] check::Error),
    #[error("avbtool error")]
    Avb(#[from] avb::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn info_error(path: &Path) -> impl FnOnce(avbinfo::Error) -> Error {
    let path = path.to_owned();
    move |source| Error::Info { path, source }
}

/// `Prop` descriptors of the old metadata, split into `key:value` pairs for
/// re-declaration on the new footer.
fn prop_pairs(path: &Path, info: &ImageInfo) -> Result<Vec<(String, String)>> {
    info.props()
        .map(|prop| {
            let (key, value) = avbinfo::split_prop(prop).map_err(info_error(path))?;
            Ok((key.to_owned(), value.to_owned()))
        })
        .collect()
}

fn require_field<'a>(
    path: &Path,
    partition: &str,
    fields: &'a BTreeMap<String, String>,
    field: &'static str,
) -> Result<&'a str> {
    fields
        .get(field)
        .map(String::as_str)
        .ok_or_else(|| Error::MissingDescriptorField {
            field,
            partition: partition.to_owned(),
            path: path.to_owned(),
        })
}

/// Rebuild the hashtree footer of a partition image, reusing every parameter
/// of the old footer. An image without metadata is left alone: partition
/// images inside the container are only integrity-protected when they
/// shipped that way.
pub fn add_hash_tree_footer(
    avb: &AvbTool,
    key: &SigningKey,
    slot: &FingerprintSlot,
    image: &Path,
) -> Result<()> {
    let Some(old) = avb.image_info(image)? else {
        debug!("Not an integrity-protected image, leaving alone: {image:?}");
        return Ok(());
    };

    let descriptor = old
        .hashtree_descriptors()
        .next()
        .ok_or_else(|| Error::MissingHashTreeDescriptor(image.to_owned()))?;
    let field = |name| require_field(image, "", descriptor, name);

    avb.add_hashtree_footer(&HashTreeFooterArgs {
        key: key.for_image(image),
        image,
        algorithm: old.require_property("Algorithm").map_err(info_error(image))?,
        partition_name: field("Partition Name")?,
        hash_algorithm: field("Hash Algorithm")?,
        salt: field("Salt")?,
        partition_size: old
            .byte_size_property("Image size")
            .map_err(info_error(image))?,
        props: &prop_pairs(image, &old)?,
    })?;

    let new = avb.image_info(image)?;
    check::check_resigned(image, Some(&old), new.as_ref(), slot)?;

    Ok(())
}

/// The single hash descriptor that covers the image's own content, after
/// excluding (and cross-checking) the descriptors contributed by the
/// included images.
fn original_hash_descriptor<'a>(
    path: &Path,
    info: &'a ImageInfo,
    included: &[(PathBuf, ImageInfo)],
) -> Result<(&'a str, &'a BTreeMap<String, String>)> {
    let descriptors = info.hash_descriptors().map_err(info_error(path))?;
    let mut remaining = descriptors
        .iter()
        .map(|(partition, fields)| (*partition, avbinfo::drop_digest(fields)))
        .collect::<BTreeMap<_, _>>();

    for (included_path, included_info) in included {
        let included_descriptors = included_info
            .hash_descriptors()
            .map_err(info_error(included_path))?;

        for (partition, fields) in included_descriptors {
            let own = remaining
                .remove(partition)
                .ok_or_else(|| Error::MissingHashDescriptor {
                    partition: partition.to_owned(),
                    path: path.to_owned(),
                })?;

            if own != avbinfo::drop_digest(fields) {
                return Err(Error::IncludedDescriptorMismatch {
                    partition: partition.to_owned(),
                    included: included_path.clone(),
                    path: path.to_owned(),
                });
            }
        }
    }

    if remaining.len() != 1 {
        return Err(Error::AmbiguousHashDescriptor {
            path: path.to_owned(),
            count: remaining.len(),
        });
    }

    let partition = *remaining.keys().next().unwrap();

    Ok((partition, descriptors[partition]))
}

/// Rebuild the hash footer of a kernel-style image, optionally including the
/// descriptors of detached stub images. Missing metadata is fatal here: these
/// images always carry a footer.
pub fn add_hash_footer(
    avb: &AvbTool,
    key: &SigningKey,
    slot: &FingerprintSlot,
    image: &Path,
    include_descriptors_from: &[PathBuf],
) -> Result<()> {
    let old = avb
        .image_info(image)?
        .ok_or_else(|| Error::MissingMetadata(image.to_owned()))?;

    let included = include_descriptors_from
        .iter()
        .map(|path| {
            let info = avb
                .image_info(path)?
                .ok_or_else(|| Error::MissingMetadata(path.clone()))?;
            Ok((path.clone(), info))
        })
        .collect::<Result<Vec<_>>>()?;

    let (partition_name, descriptor) = original_hash_descriptor(image, &old, &included)?;

    // The descriptor must still describe the image content that is about to
    // be re-hashed.
    let original_size = old
        .require_property("Original image size")
        .map_err(info_error(image))?;
    let descriptor_size = require_field(image, partition_name, descriptor, "Image Size")?;
    if original_size != descriptor_size {
        return Err(Error::ImageSizeMismatch {
            path: image.to_owned(),
            original: original_size.to_owned(),
            descriptor: descriptor_size.to_owned(),
        });
    }

    avb.add_hash_footer(&HashFooterArgs {
        key: key.for_image(image),
        image,
        algorithm: old.require_property("Algorithm").map_err(info_error(image))?,
        partition_name,
        salt: require_field(image, partition_name, descriptor, "Salt")?,
        partition_size: old
            .byte_size_property("Image size")
            .map_err(info_error(image))?,
        rollback_index: old
            .require_property("Rollback Index")
            .map_err(info_error(image))?,
        props: &prop_pairs(image, &old)?,
        include_descriptors_from,
    })?;

    let new = avb.image_info(image)?;
    check::check_resigned(image, Some(&old), new.as_ref(), slot)?;

    Ok(())
}

/// Rebuild the root vbmeta image, re-declaring the hash contributions of
/// `include_descriptors_from` and re-chaining any chained partitions of the
/// old image. A vbmeta without metadata is left alone.
pub fn make_vbmeta_image(
    avb: &AvbTool,
    key: &SigningKey,
    slot: &FingerprintSlot,
    vbmeta: &Path,
    include_descriptors_from: &[PathBuf],
) -> Result<()> {
    let Some(old) = avb.image_info(vbmeta)? else {
        debug!("Not a vbmeta image, leaving alone: {vbmeta:?}");
        return Ok(());
    };

    let work_dir = TempDir::new()?;

    // Chained partitions keep their layout, but their public keys are
    // replaced with the ones extracted from their designated keys.
    let mut chain_partitions = Vec::new();
    for descriptor in old.chain_descriptors() {
        let partition = require_field(vbmeta, "", descriptor, "Partition Name")?;
        let location = require_field(vbmeta, partition, descriptor, "Rollback Index Location")?;

        let public_key = work_dir.path().join(format!("{partition}.avbpubkey"));
        avb.extract_public_key(key.for_name(partition), &public_key)?;

        chain_partitions.push((partition.to_owned(), location.to_owned(), public_key));
    }

    avb.make_vbmeta_image(&VbmetaArgs {
        key: key.for_image(vbmeta),
        output: vbmeta,
        algorithm: old
            .require_property("Algorithm")
            .map_err(info_error(vbmeta))?,
        rollback_index: old
            .require_property("Rollback Index")
            .map_err(info_error(vbmeta))?,
        rollback_index_location: old
            .require_property("Rollback Index Location")
            .map_err(info_error(vbmeta))?,
        include_descriptors_from,
        chain_partitions: &chain_partitions,
    })?;

    let new = avb.image_info(vbmeta)?;
    check::check_resigned(vbmeta, Some(&old), new.as_ref(), slot)?;

    // The downstream verifier reads the maximum vbmeta size, so provide a
    // file that matches it.
    let file = fs::OpenOptions::new().append(true).open(vbmeta)?;
    file.set_len(VBMETA_IMAGE_SIZE)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::format::avbinfo::{Descriptor, HASH_DESCRIPTOR};

    fn hash_descriptor(partition: &str, salt: &str, digest: &str, size: &str) -> Descriptor {
        Descriptor::Node {
            name: HASH_DESCRIPTOR.to_owned(),
            fields: [
                ("Partition Name", partition),
                ("Salt", salt),
                ("Digest", digest),
                ("Image Size", size),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        }
    }

    fn kernel_info() -> ImageInfo {
        let mut info = ImageInfo::default();
        info.descriptors.push(hash_descriptor(
            "boot",
            "aa",
            "d1",
            "4096 bytes",
        ));
        info.descriptors.push(hash_descriptor(
            "initrd_normal",
            "bb",
            "d2",
            "1024 bytes",
        ));
        info.descriptors.push(hash_descriptor(
            "initrd_debug",
            "cc",
            "d3",
            "1024 bytes",
        ));
        info
    }

    fn stub_info(partition: &str, salt: &str, digest: &str) -> ImageInfo {
        let mut info = ImageInfo::default();
        info.descriptors
            .push(hash_descriptor(partition, salt, digest, "1024 bytes"));
        info
    }

    #[test]
    fn excluding_included_images_leaves_the_original_descriptor() {
        let kernel = kernel_info();
        let included = vec![
            (
                PathBuf::from("normal.hashdesc"),
                // A differing digest must not matter.
                stub_info("initrd_normal", "bb", "other"),
            ),
            (
                PathBuf::from("debug.hashdesc"),
                stub_info("initrd_debug", "cc", "d3"),
            ),
        ];

        let (partition, descriptor) =
            original_hash_descriptor(Path::new("kernel"), &kernel, &included).unwrap();
        assert_eq!(partition, "boot");
        assert_eq!(descriptor["Salt"], "aa");
    }

    #[test]
    fn included_descriptor_mismatch_is_fatal() {
        let kernel = kernel_info();
        let included = vec![(
            PathBuf::from("normal.hashdesc"),
            // Differing salt is a real mismatch.
            stub_info("initrd_normal", "ee", "d2"),
        )];

        assert_matches!(
            original_hash_descriptor(Path::new("kernel"), &kernel, &included),
            Err(Error::IncludedDescriptorMismatch { ref partition, .. })
                if partition == "initrd_normal"
        );
    }

    #[test]
    fn leftover_descriptors_are_ambiguous() {
        let kernel = kernel_info();
        let included = vec![(
            PathBuf::from("normal.hashdesc"),
            stub_info("initrd_normal", "bb", "d2"),
        )];

        assert_matches!(
            original_hash_descriptor(Path::new("kernel"), &kernel, &included),
            Err(Error::AmbiguousHashDescriptor { count: 2, .. })
        );
    }

    #[test]
    fn included_image_without_matching_descriptor_is_fatal() {
        let kernel = kernel_info();
        let included = vec![(
            PathBuf::from("extra.hashdesc"),
            stub_info("unknown", "ff", "d9"),
        )];

        assert_matches!(
            original_hash_descriptor(Path::new("kernel"), &kernel, &included),
            Err(Error::MissingHashDescriptor { ref partition, .. }) if partition == "unknown"
        );
    }
}
