// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Typed front-end for the external avbtool binary. All footer rebuilds and
//! metadata inspection go through here; the signing itself happens inside
//! avbtool and is out of scope.

use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::{
    compress::{self, Lz4},
    exec,
    format::avbinfo::{self, ImageInfo},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to find image: {0:?}")]
    ImageNotFound(PathBuf),
    #[error("Unexpected avbtool version output: {0:?}")]
    MalformedVersion(String),
    #[error("Process error")]
    Exec(#[from] exec::Error),
    #[error("Compression error")]
    Compress(#[from] compress::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Parameters for rebuilding the hash footer of a kernel-style image.
pub struct HashFooterArgs<'a> {
    pub key: &'a Path,
    pub image: &'a Path,
    pub algorithm: &'a str,
    pub partition_name: &'a str,
    pub salt: &'a str,
    pub partition_size: u64,
    pub rollback_index: &'a str,
    /// `Prop` descriptors re-declared from the old metadata.
    pub props: &'a [(String, String)],
    /// Images whose descriptors are included instead of hashed content.
    pub include_descriptors_from: &'a [PathBuf],
}

/// Parameters for rebuilding the hashtree footer of a partition image.
pub struct HashTreeFooterArgs<'a> {
    pub key: &'a Path,
    pub image: &'a Path,
    pub algorithm: &'a str,
    pub partition_name: &'a str,
    pub hash_algorithm: &'a str,
    pub salt: &'a str,
    pub partition_size: u64,
    pub props: &'a [(String, String)],
}

/// Parameters for rebuilding a root vbmeta image.
pub struct VbmetaArgs<'a> {
    pub key: &'a Path,
    pub output: &'a Path,
    pub algorithm: &'a str,
    pub rollback_index: &'a str,
    pub rollback_index_location: &'a str,
    pub include_descriptors_from: &'a [PathBuf],
    /// `(partition name, rollback index location, public key path)` chain
    /// entries re-declared from the old vbmeta.
    pub chain_partitions: &'a [(String, String, PathBuf)],
}

pub struct AvbTool {
    program: PathBuf,
    signing_args: Vec<String>,
    lz4: Lz4,
}

impl AvbTool {
    pub fn new(program: PathBuf, signing_args: Vec<String>) -> Self {
        Self {
            program,
            signing_args,
            lz4: Lz4::new(),
        }
    }

    fn run(&self, args: &[OsString]) -> Result<exec::Output> {
        Ok(exec::run(&self.program, args)?)
    }

    /// Full avbtool version, eg. `1.3.0`.
    pub fn version(&self) -> Result<String> {
        let output = self.run(&[OsString::from("version")])?;

        // Reported as "avbtool <version>".
        output
            .text
            .split_whitespace()
            .nth(1)
            .map(str::to_owned)
            .ok_or_else(|| Error::MalformedVersion(output.text.clone()))
    }

    /// avbtool version truncated to `major.minor`, the granularity recorded
    /// in the bootconfigs.
    pub fn version_major_minor(&self) -> Result<String> {
        let version = self.version()?;

        match version.rfind('.') {
            Some(pos) => Ok(version[..pos].to_owned()),
            None => Err(Error::MalformedVersion(version)),
        }
    }

    pub fn extract_public_key(&self, key: &Path, output: &Path) -> Result<()> {
        self.run(&[
            OsString::from("extract_public_key"),
            OsString::from("--key"),
            key.into(),
            OsString::from("--output"),
            output.into(),
        ])?;

        Ok(())
    }

    /// SHA-1 fingerprint of the public key extracted from `key`, matching the
    /// `Public key (sha1)` metadata property.
    pub fn key_fingerprint(&self, key: &Path) -> Result<String> {
        let public_key = NamedTempFile::new()?;
        self.extract_public_key(key, public_key.path())?;

        let data = fs::read(public_key.path())?;

        Ok(hex::encode(Sha1::digest(&data)))
    }

    /// Inspect an image, transparently decompressing lz4 images first.
    /// Returns `None` when the image carries no verified-boot footer.
    pub fn image_info(&self, path: &Path) -> Result<Option<ImageInfo>> {
        if !path.try_exists()? {
            return Err(Error::ImageNotFound(path.to_owned()));
        }

        if self.lz4.is_compressed(path)? {
            let decompressed = NamedTempFile::new()?;
            self.lz4.decompress(path, decompressed.path())?;

            return self.image_info(decompressed.path());
        }

        let args = [
            OsString::from("info_image"),
            OsString::from("--image"),
            path.into(),
        ];
        // Status 1 means the image has no metadata, which is a valid state.
        let output = exec::run_with(&self.program, &args, &[], &[0, 1])?;
        if output.code == 1 {
            return Ok(None);
        }

        Ok(Some(avbinfo::parse(&output.text)))
    }

    pub fn calculate_vbmeta_digest(&self, image: &Path) -> Result<String> {
        let output = self.run(&[
            OsString::from("calculate_vbmeta_digest"),
            OsString::from("--image"),
            image.into(),
            OsString::from("--hash_algorithm"),
            OsString::from("sha256"),
        ])?;

        Ok(output.text.trim().to_owned())
    }

    fn push_props(args: &mut Vec<OsString>, props: &[(String, String)]) {
        for (key, value) in props {
            args.push(OsString::from("--prop"));
            args.push(OsString::from(format!("{key}:{value}")));
        }
    }

    fn push_signing_args(&self, args: &mut Vec<OsString>) {
        args.extend(self.signing_args.iter().map(OsString::from));
    }

    pub fn add_hash_footer(&self, footer: &HashFooterArgs) -> Result<()> {
        let mut args = vec![
            OsString::from("add_hash_footer"),
            OsString::from("--key"),
            footer.key.into(),
            OsString::from("--algorithm"),
            OsString::from(footer.algorithm),
            OsString::from("--partition_name"),
            OsString::from(footer.partition_name),
            OsString::from("--salt"),
            OsString::from(footer.salt),
            OsString::from("--partition_size"),
            OsString::from(footer.partition_size.to_string()),
            OsString::from("--image"),
            footer.image.into(),
        ];
        Self::push_props(&mut args, footer.props);
        self.push_signing_args(&mut args);
        for image in footer.include_descriptors_from {
            args.push(OsString::from("--include_descriptors_from_image"));
            args.push(image.into());
        }
        args.push(OsString::from("--rollback_index"));
        args.push(OsString::from(footer.rollback_index));

        self.run(&args)?;

        Ok(())
    }

    pub fn add_hashtree_footer(&self, footer: &HashTreeFooterArgs) -> Result<()> {
        let mut args = vec![
            OsString::from("add_hashtree_footer"),
            OsString::from("--key"),
            footer.key.into(),
            OsString::from("--algorithm"),
            OsString::from(footer.algorithm),
            OsString::from("--partition_name"),
            OsString::from(footer.partition_name),
            OsString::from("--partition_size"),
            OsString::from(footer.partition_size.to_string()),
            OsString::from("--do_not_generate_fec"),
            OsString::from("--hash_algorithm"),
            OsString::from(footer.hash_algorithm),
            OsString::from("--salt"),
            OsString::from(footer.salt),
            OsString::from("--image"),
            footer.image.into(),
        ];
        Self::push_props(&mut args, footer.props);
        self.push_signing_args(&mut args);

        self.run(&args)?;

        Ok(())
    }

    pub fn make_vbmeta_image(&self, vbmeta: &VbmetaArgs) -> Result<()> {
        let mut args = vec![
            OsString::from("make_vbmeta_image"),
            OsString::from("--key"),
            vbmeta.key.into(),
            OsString::from("--algorithm"),
            OsString::from(vbmeta.algorithm),
            OsString::from("--rollback_index"),
            OsString::from(vbmeta.rollback_index),
            OsString::from("--rollback_index_location"),
            OsString::from(vbmeta.rollback_index_location),
            OsString::from("--output"),
            vbmeta.output.into(),
        ];
        for image in vbmeta.include_descriptors_from {
            args.push(OsString::from("--include_descriptors_from_image"));
            args.push(image.into());
        }
        for (partition, location, public_key) in vbmeta.chain_partitions {
            args.push(OsString::from("--chain_partition"));

            let mut chain = OsString::from(format!("{partition}:{location}:"));
            chain.push(public_key);
            args.push(chain);
        }
        self.push_signing_args(&mut args);

        self.run(&args)?;

        Ok(())
    }

    /// Generate a detached hash-footer stub image for `image` without
    /// touching the image itself. The stub's descriptors are later included
    /// in the enclosing kernel's footer.
    pub fn generate_hash_stub(
        &self,
        image: &Path,
        output: &Path,
        partition_name: &str,
        salt: &str,
    ) -> Result<()> {
        self.run(&[
            OsString::from("add_hash_footer"),
            OsString::from("--dynamic_partition_size"),
            OsString::from("--do_not_append_vbmeta_image"),
            OsString::from("--partition_name"),
            OsString::from(partition_name),
            OsString::from("--salt"),
            OsString::from(salt),
            OsString::from("--image"),
            image.into(),
            OsString::from("--output_vbmeta_image"),
            output.into(),
        ])?;

        Ok(())
    }
}
