// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Front-end for the super image tooling: `simg2img`/`lpunpack` to unpack the
//! sparse super image into raw partition images, and `img2simg`/`lpmake` to
//! pack the resigned partitions back up.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use thiserror::Error;

use crate::exec;

/// Mandatory primary partition of the super image.
pub const SYSTEM_PARTITION: &str = "system_a";
/// Optional secondary partition, present on some targets.
pub const VENDOR_PARTITION: &str = "vendor_a";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process error")]
    Exec(#[from] exec::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Unpack `super_image` into raw per-partition images inside `work_dir`.
pub fn unpack(super_image: &Path, work_dir: &Path) -> Result<()> {
    let raw_super = work_dir.join("super.img");

    exec::run("simg2img", &[super_image.as_os_str(), raw_super.as_os_str()])?;
    exec::run("lpunpack", &[raw_super.as_os_str(), work_dir.as_os_str()])?;

    Ok(())
}

/// Pack `partitions` (name to raw image path) into a new sparse super image
/// at `output`.
pub fn pack(partitions: &BTreeMap<String, PathBuf>, output: &Path) -> Result<()> {
    let work_dir = TempDir::new()?;

    let mut output_arg = OsString::from("--output=");
    output_arg.push(output);

    let mut args = vec![
        OsString::from("--device-size=auto"),
        // Two metadata slots for A/B.
        OsString::from("--metadata-slots=2"),
        OsString::from("--metadata-size=65536"),
        OsString::from("--sparse"),
        output_arg,
    ];

    for (name, image) in partitions {
        let sparse_image = work_dir.path().join(name);
        exec::run("img2simg", &[image.as_os_str(), sparse_image.as_os_str()])?;

        let raw_size = fs::metadata(image)?.len();

        let mut image_arg = OsString::from(format!("--image={name}="));
        image_arg.push(&sparse_image);
        args.push(image_arg);
        args.push(OsString::from(format!(
            "--partition={name}:readonly:{raw_size}:default"
        )));
    }

    exec::run("lpmake", &args)?;

    Ok(())
}
