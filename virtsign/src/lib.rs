// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! virtsign is primarily an application and not a library. The CLI source
//! files use concrete types wherever possible for simplicity, while the
//! "library"-style source files aim to stay independent of the CLI.

pub mod avb;
pub mod check;
pub mod cli;
pub mod compress;
pub mod container;
pub mod exec;
pub mod format;
pub mod graph;
pub mod images;
pub mod patch;
