// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Parser for `avbtool info_image` reports. The report is line oriented:
//! `key: value` pairs, with everything before the `Descriptors:` marker being
//! a top-level property and everything after it forming an ordered descriptor
//! list. A line indented deeper than the current descriptor contributes a
//! field to it; a line at equal or smaller indentation starts a new
//! descriptor. Lines that don't match the pattern are skipped, never an
//! error.

use std::{collections::BTreeMap, sync::LazyLock};

use regex::Regex;
use thiserror::Error;

static LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)([^:]+):\s*(.*)$").unwrap());
static PROP_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.+) -> '(.*)'$").unwrap());

pub const HASH_DESCRIPTOR: &str = "Hash descriptor";
pub const HASHTREE_DESCRIPTOR: &str = "Hashtree descriptor";
pub const CHAIN_PARTITION_DESCRIPTOR: &str = "Chain Partition descriptor";

/// Property holding the SHA-1 fingerprint of the signing public key.
pub const PUBLIC_KEY_PROPERTY: &str = "Public key (sha1)";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing {0:?} property")]
    MissingProperty(&'static str),
    #[error("Invalid byte size in {key:?} property: {value:?}")]
    InvalidByteSize { key: &'static str, value: String },
    #[error("Malformed Prop descriptor value: {0:?}")]
    MalformedProp(String),
    #[error("{HASH_DESCRIPTOR} has no Partition Name field")]
    UnnamedHashDescriptor,
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    /// Property-style descriptor with a scalar value, eg.
    /// `Prop: some.key -> 'value'`.
    Prop(String),
    /// Structured descriptor with a field map, eg. `Hash descriptor`.
    Node {
        name: String,
        fields: BTreeMap<String, String>,
    },
}

impl Descriptor {
    pub fn name(&self) -> &str {
        match self {
            Self::Prop(_) => "Prop",
            Self::Node { name, .. } => name,
        }
    }
}

/// Metadata reported for one image: top-level properties plus the descriptor
/// list in source order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub properties: BTreeMap<String, String>,
    pub descriptors: Vec<Descriptor>,
}

impl ImageInfo {
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn require_property(&self, key: &'static str) -> Result<&str> {
        self.property(key).ok_or(Error::MissingProperty(key))
    }

    /// Parse a `"<n> bytes"` style property, as reported for image and block
    /// sizes.
    pub fn byte_size_property(&self, key: &'static str) -> Result<u64> {
        let value = self.require_property(key)?;
        value
            .strip_suffix(" bytes")
            .unwrap_or(value)
            .parse()
            .map_err(|_| Error::InvalidByteSize {
                key,
                value: value.to_owned(),
            })
    }

    /// Serialized size of a vbmeta blob: the sum of its header,
    /// authentication, and auxiliary blocks.
    pub fn vbmeta_size(&self) -> Result<u64> {
        Ok(self.byte_size_property("Header Block")?
            + self.byte_size_property("Authentication Block")?
            + self.byte_size_property("Auxiliary Block")?)
    }

    /// Scalar values of all `Prop` descriptors, in source order.
    pub fn props(&self) -> impl Iterator<Item = &str> {
        self.descriptors.iter().filter_map(|d| match d {
            Descriptor::Prop(value) => Some(value.as_str()),
            Descriptor::Node { .. } => None,
        })
    }

    fn nodes_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a BTreeMap<String, String>> {
        self.descriptors.iter().filter_map(move |d| match d {
            Descriptor::Node { name: n, fields } if n == name => Some(fields),
            _ => None,
        })
    }

    /// Hash descriptors keyed by partition name.
    pub fn hash_descriptors(&self) -> Result<BTreeMap<&str, &BTreeMap<String, String>>> {
        self.nodes_named(HASH_DESCRIPTOR)
            .map(|fields| {
                let name = fields
                    .get("Partition Name")
                    .ok_or(Error::UnnamedHashDescriptor)?;
                Ok((name.as_str(), fields))
            })
            .collect()
    }

    pub fn hashtree_descriptors(&self) -> impl Iterator<Item = &BTreeMap<String, String>> {
        self.nodes_named(HASHTREE_DESCRIPTOR)
    }

    pub fn chain_descriptors(&self) -> impl Iterator<Item = &BTreeMap<String, String>> {
        self.nodes_named(CHAIN_PARTITION_DESCRIPTOR)
    }
}

/// Split a `Prop` descriptor's `key -> 'value'` scalar into its parts.
pub fn split_prop(value: &str) -> Result<(&str, &str)> {
    let captures = PROP_RE
        .captures(value)
        .ok_or_else(|| Error::MalformedProp(value.to_owned()))?;

    Ok((
        captures.get(1).unwrap().as_str(),
        captures.get(2).unwrap().as_str(),
    ))
}

/// Copy of a descriptor field map with the digest field removed. Digests are
/// the only hash descriptor field expected to change across a resign.
pub fn drop_digest(fields: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut fields = fields.clone();
    fields.remove("Digest");
    fields
}

/// Parse an `avbtool info_image` report.
pub fn parse(report: &str) -> ImageInfo {
    let lines = report
        .lines()
        .filter_map(|line| {
            LINE_RE.captures(line).map(|c| {
                (
                    c.get(1).unwrap().as_str().len(),
                    c.get(2).unwrap().as_str(),
                    c.get(3).unwrap().as_str(),
                )
            })
        })
        .collect::<Vec<_>>();

    let mut info = ImageInfo::default();
    let mut i = 0;

    while i < lines.len() {
        let (_, key, value) = lines[i];
        i += 1;

        if key == "Descriptors" {
            break;
        }

        info.properties.insert(key.to_owned(), value.to_owned());
    }

    while i < lines.len() {
        let (indent, name, value) = lines[i];
        i += 1;

        if name == "Prop" {
            info.descriptors.push(Descriptor::Prop(value.to_owned()));

            // Scalar descriptors have no fields; skip stray deeper lines.
            while i < lines.len() && lines[i].0 > indent {
                i += 1;
            }
        } else {
            let mut fields = BTreeMap::new();

            while i < lines.len() && lines[i].0 > indent {
                fields.insert(lines[i].1.to_owned(), lines[i].2.to_owned());
                i += 1;
            }

            info.descriptors.push(Descriptor::Node {
                name: name.to_owned(),
                fields,
            });
        }
    }

    info
}
