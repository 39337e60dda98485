// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::Parser;
use tracing::Level;

use crate::{cli::resign, images::KeyOverride};

/// Re-sign the verified-boot images of a virt APEX payload directory.
///
/// The payload's super image partitions, vbmeta image, kernels, and rialto
/// are re-signed under the given key, and the vbmeta references embedded in
/// the initrd bootconfigs are updated to match. All external tools (avbtool,
/// lpmake, lpunpack, simg2img, img2simg, lz4, initrd_bootconfig) are assumed
/// to be available via PATH.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Path to the private key to re-sign with.
    #[arg(value_name = "KEY", value_parser)]
    pub key: PathBuf,

    /// Directory containing the images to be re-signed.
    #[arg(value_name = "INPUT_DIR", value_parser)]
    pub input_dir: PathBuf,

    /// Verify the images against the key instead of re-signing them.
    #[arg(long)]
    pub verify: bool,

    /// Override the signing key for a single file (eg.
    /// microdroid_vbmeta.img=/path/to/test.key). For testing only.
    #[arg(long, value_name = "FILE=KEY", value_parser)]
    pub key_override: Vec<KeyOverride>,

    /// avbtool binary to invoke.
    #[arg(long, value_name = "PATH", value_parser, default_value = "avbtool")]
    pub avbtool: PathBuf,

    /// Extra arguments forwarded to avbtool when rebuilding footers.
    #[arg(long, value_name = "ARGS")]
    pub signing_args: Option<String>,

    /// Do not update the vbmeta references in the initrd bootconfigs. For
    /// testing only.
    #[arg(long)]
    pub do_not_update_bootconfigs: bool,

    /// Do not validate the avbtool version recorded in the bootconfigs. For
    /// testing only.
    #[arg(long)]
    pub do_not_validate_avb_version: bool,

    /// Verbose output.
    #[arg(short, long)]
    pub verbose: bool,
}

pub fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);
    logging_initialized.store(true, Ordering::SeqCst);

    if cli.verify {
        resign::verify_main(&cli)
    } else {
        resign::sign_main(&cli)
    }
}
