// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Patching of the boot configuration embedded in the initrd images. After
//! the vbmeta image is rebuilt, its digest and serialized size are
//! recomputed and substituted into every initrd's bootconfig.

use std::{ffi::OsStr, fs, io, path::Path};

use tempfile::TempDir;
use thiserror::Error;

use crate::{
    avb::{self, AvbTool},
    exec,
    format::{
        avbinfo,
        bootconfig::{self, avb_version, set_vbmeta_digest, set_vbmeta_size},
    },
};

const INITRD_BOOTCONFIG: &str = "initrd_bootconfig";

#[derive(Debug, Error)]
pub enum Error {
    #[error("No metadata in vbmeta image: {0:?}")]
    MissingVbmetaMetadata(std::path::PathBuf),
    #[error(
        "avbtool version mismatch between the current tool and the one used \
         to build the bootconfigs: {current} != {embedded}"
    )]
    VersionMismatch { current: String, embedded: String },
    #[error("Bootconfig error")]
    Bootconfig(#[from] bootconfig::Error),
    #[error("Metadata error")]
    Info(#[from] avbinfo::Error),
    #[error("avbtool error")]
    Avb(#[from] avb::Error),
    #[error("Process error")]
    Exec(#[from] exec::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn detach(initrd: &Path, stripped: &Path, config: &Path) -> Result<()> {
    exec::run(
        INITRD_BOOTCONFIG,
        &[
            OsStr::new("detach"),
            initrd.as_os_str(),
            stripped.as_os_str(),
            config.as_os_str(),
        ],
    )?;

    Ok(())
}

fn attach(initrd: &Path, stripped: &Path, config: &Path) -> Result<()> {
    exec::run(
        INITRD_BOOTCONFIG,
        &[
            OsStr::new("attach"),
            stripped.as_os_str(),
            config.as_os_str(),
            OsStr::new("--output"),
            initrd.as_os_str(),
        ],
    )?;

    Ok(())
}

/// Rewrite the vbmeta digest and size recorded in every initrd's bootconfig
/// to match the rebuilt vbmeta image. When `validate_version` is set, the
/// avbtool version recorded in each bootconfig must match the currently
/// invoked tool (major.minor only).
pub fn update_initrds(
    avb: &AvbTool,
    initrds: &[impl AsRef<Path>],
    vbmeta: &Path,
    validate_version: bool,
) -> Result<()> {
    let digest = avb.calculate_vbmeta_digest(vbmeta)?;
    let size = avb
        .image_info(vbmeta)?
        .ok_or_else(|| Error::MissingVbmetaMetadata(vbmeta.to_owned()))?
        .vbmeta_size()?;
    let current_version = if validate_version {
        Some(avb.version_major_minor()?)
    } else {
        None
    };

    let work_dir = TempDir::new()?;
    let stripped = work_dir.path().join("initrd");
    let config = work_dir.path().join("bootconfig");

    for initrd in initrds {
        let initrd = initrd.as_ref();

        detach(initrd, &stripped, &config)?;

        let text = fs::read_to_string(&config)?;

        if let Some(current) = &current_version {
            let embedded = avb_version(&text)?;
            if embedded != current {
                return Err(Error::VersionMismatch {
                    current: current.clone(),
                    embedded: embedded.to_owned(),
                });
            }
        }

        let text = set_vbmeta_digest(&text, &digest)?;
        let text = set_vbmeta_size(&text, size)?;
        fs::write(&config, text)?;

        attach(initrd, &stripped, &config)?;
    }

    Ok(())
}
