// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Digest patching for the rialto image. Rialto embeds copies of each
//! kernel's initrd digests; after the kernels are resigned, those copies are
//! substituted in place (same byte length, exactly one occurrence each)
//! before rialto's own footer is rebuilt.

use std::collections::BTreeMap;

use memchr::memmem;
use thiserror::Error;

use crate::format::avbinfo::{self, ImageInfo};

/// The kernel's own hash descriptor. Its digest covers the kernel content,
/// which the bootconfig patch does not touch, so it must never change.
pub const BOOT_PARTITION: &str = "boot";

/// The initrd hash descriptors whose digests rialto embeds.
pub const INITRD_PARTITIONS: [&str; 2] = ["initrd_normal", "initrd_debug"];

#[derive(Debug, Error)]
pub enum Error {
    #[error("Digest of partition {partition:?} is not valid hex: {digest:?}")]
    InvalidDigest {
        partition: String,
        digest: String,
        #[source]
        source: hex::FromHexError,
    },
    #[error("Hash descriptor of partition {partition:?} has no digest")]
    MissingDigest { partition: String },
    #[error("Hash descriptor of {BOOT_PARTITION:?} must not change for {kernel}")]
    BootDigestChanged { kernel: String },
    #[error("Missing {BOOT_PARTITION:?} hash descriptor for {kernel}")]
    MissingBootDescriptor { kernel: String },
    #[error(
        "Expected initrd partitions {INITRD_PARTITIONS:?} for {kernel}, \
         got old {old:?} and new {new:?}"
    )]
    UnexpectedPartitions {
        kernel: String,
        old: Vec<String>,
        new: Vec<String>,
    },
    #[error("Digests of initrd partitions must change for {kernel}")]
    DigestsUnchanged { kernel: String },
    #[error(
        "Length of old and new digest must match for partition {partition:?}: \
         {old} != {new}"
    )]
    DigestLengthMismatch {
        partition: String,
        old: usize,
        new: usize,
    },
    #[error("Old digest of partition {partition:?} not found in image")]
    DigestNotFound { partition: String },
    #[error(
        "Old digest of partition {partition:?} occurs {count} times in image; \
         expected exactly one"
    )]
    DigestNotUnique { partition: String, count: usize },
    #[error("Expected exactly two descriptors for rialto, got {0}")]
    WrongDescriptorCount(usize),
    #[error("Expected exactly one Prop descriptor for rialto, got {0}")]
    WrongPropCount(usize),
    #[error("Rollback index must not be zero for rialto")]
    ZeroRollbackIndex,
    #[error("Expected exactly one hash descriptor for rialto, got {0}")]
    WrongHashDescriptorCount(usize),
    #[error("Digest of rialto must change when the bootconfigs are updated")]
    DigestUnchanged,
    #[error("Metadata error")]
    Info(#[from] avbinfo::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Hash descriptor digests of an image, hex-decoded and keyed by partition
/// name.
pub fn hash_digests(info: &ImageInfo) -> Result<BTreeMap<String, Vec<u8>>> {
    info.hash_descriptors()?
        .into_iter()
        .map(|(partition, fields)| {
            let digest = fields.get("Digest").ok_or_else(|| Error::MissingDigest {
                partition: partition.to_owned(),
            })?;
            let decoded = hex::decode(digest).map_err(|source| Error::InvalidDigest {
                partition: partition.to_owned(),
                digest: digest.clone(),
                source,
            })?;

            Ok((partition.to_owned(), decoded))
        })
        .collect()
}

/// Substitute one kernel's old initrd digests with the new ones inside
/// `blob`. Every substitution is located and validated before any byte is
/// written, so a failure leaves the blob untouched.
pub fn patch_digests(
    kernel: &str,
    old: &BTreeMap<String, Vec<u8>>,
    new: &BTreeMap<String, Vec<u8>>,
    blob: &mut [u8],
) -> Result<()> {
    let mut old = old.clone();
    let mut new = new.clone();

    let old_boot = old
        .remove(BOOT_PARTITION)
        .ok_or_else(|| Error::MissingBootDescriptor {
            kernel: kernel.to_owned(),
        })?;
    let new_boot = new
        .remove(BOOT_PARTITION)
        .ok_or_else(|| Error::MissingBootDescriptor {
            kernel: kernel.to_owned(),
        })?;
    if old_boot != new_boot {
        return Err(Error::BootDigestChanged {
            kernel: kernel.to_owned(),
        });
    }

    let names = |digests: &BTreeMap<String, Vec<u8>>| {
        digests.keys().cloned().collect::<Vec<_>>()
    };
    let expected = INITRD_PARTITIONS
        .iter()
        .map(|p| (*p).to_owned())
        .collect::<std::collections::BTreeSet<_>>();
    if old.keys().cloned().collect::<std::collections::BTreeSet<_>>() != expected
        || new.keys().cloned().collect::<std::collections::BTreeSet<_>>() != expected
    {
        return Err(Error::UnexpectedPartitions {
            kernel: kernel.to_owned(),
            old: names(&old),
            new: names(&new),
        });
    }

    // If any digest survived the resign, the initrd content did not actually
    // change.
    if old.values().any(|digest| new.values().any(|n| n == digest)) {
        return Err(Error::DigestsUnchanged {
            kernel: kernel.to_owned(),
        });
    }

    let mut substitutions = Vec::new();

    for (partition, old_digest) in &old {
        let new_digest = &new[partition];

        if old_digest.len() != new_digest.len() {
            return Err(Error::DigestLengthMismatch {
                partition: partition.clone(),
                old: old_digest.len(),
                new: new_digest.len(),
            });
        }

        let mut occurrences = memmem::find_iter(blob, old_digest);
        let offset = occurrences.next().ok_or_else(|| Error::DigestNotFound {
            partition: partition.clone(),
        })?;
        let extra = occurrences.count();
        if extra != 0 {
            return Err(Error::DigestNotUnique {
                partition: partition.clone(),
                count: extra + 1,
            });
        }

        substitutions.push((offset, new_digest.clone()));
    }

    for (offset, digest) in substitutions {
        blob[offset..offset + digest.len()].copy_from_slice(&digest);
    }

    Ok(())
}

/// Assert the expected descriptor shape of rialto after its footer rebuild.
pub fn check_resigned_rialto(
    old: Option<&ImageInfo>,
    new: &ImageInfo,
    bootconfigs_updated: bool,
) -> Result<()> {
    if new.descriptors.len() != 2 {
        return Err(Error::WrongDescriptorCount(new.descriptors.len()));
    }

    let props = new.props().count();
    if props != 1 {
        return Err(Error::WrongPropCount(props));
    }

    if new.require_property("Rollback Index")? == "0" {
        return Err(Error::ZeroRollbackIndex);
    }

    let new_hashes = new.hash_descriptors()?;
    if new_hashes.len() != 1 {
        return Err(Error::WrongHashDescriptorCount(new_hashes.len()));
    }

    // The salt is not updated, so a digest change reflects a change of the
    // kernel content, which only happens when the embedded initrd digests
    // were patched.
    if bootconfigs_updated {
        if let Some(old) = old {
            let old_hashes = old.hash_descriptors()?;
            let old_digest = old_hashes.values().next().and_then(|f| f.get("Digest"));
            let new_digest = new_hashes.values().next().and_then(|f| f.get("Digest"));

            if old_digest == new_digest {
                return Err(Error::DigestUnchanged);
            }
        }
    }

    Ok(())
}
