// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Front-end for the external lz4 binary. Kernel images inside the payload
//! may or may not be lz4-compressed; the probe tolerates the "Unrecognized
//! header" status so it can distinguish the two without failing.

use std::{
    ffi::{OsStr, OsString},
    path::Path,
};

use thiserror::Error;

use crate::exec;

/// Exit status lz4 reports for "Unrecognized header".
const NOT_COMPRESSED: i32 = 44;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Process error")]
    Exec(#[from] exec::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug)]
pub struct Lz4 {
    program: OsString,
}

impl Lz4 {
    pub fn new() -> Self {
        Self {
            program: OsString::from("lz4"),
        }
    }

    pub fn is_compressed(&self, path: &Path) -> Result<bool> {
        let args = [OsStr::new("-t"), path.as_os_str()];
        let output = exec::run_with(&self.program, &args, &[], &[0, NOT_COMPRESSED])?;

        Ok(output.code == 0)
    }

    pub fn decompress(&self, input: &Path, output: &Path) -> Result<()> {
        let args = [
            OsStr::new("-d"),
            OsStr::new("-f"),
            input.as_os_str(),
            output.as_os_str(),
        ];
        exec::run(&self.program, &args)?;

        Ok(())
    }

    pub fn compress(&self, input: &Path, output: &Path) -> Result<()> {
        let args = [
            OsStr::new("-9"),
            OsStr::new("-f"),
            input.as_os_str(),
            output.as_os_str(),
        ];
        exec::run(&self.program, &args)?;

        Ok(())
    }
}

impl Default for Lz4 {
    fn default() -> Self {
        Self::new()
    }
}
