// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder for compiled SELinux kernel policies, versions 15 through 20.
//!
//! [`parse_policy`] reads a binary policy from any [`Read`] source into a [`PolicyImage`]. Symbols
//! and rules refer to one another through typed indices into the image's collections, so a decoded
//! image holds no wire values.

pub mod error;
pub mod metadata;
pub mod parser;

mod arrays;
mod extensible_bitmap;
mod model;
mod ocontext;
mod options;
mod parsed_policy;
mod remap;
mod security_context;
mod symbols;

#[cfg(test)]
mod testing;

pub use error::{error_kind, ErrorKind, ParseError};
pub use metadata::SchemaProfile;
pub use model::*;
pub use options::DecodeOptions;
pub use parser::ByteCursor;

use metadata::{Magic, Signature};

use anyhow::Context as _;
use once_cell::sync::Lazy;
use std::{collections::BTreeMap, io::Read};

/// Binary policy SIDs that may be referenced in the policy without being explicitly introduced in
/// the policy because they are hard-coded in the Linux kernel.
pub(crate) static INITIAL_SIDS_IDENTIFIERS: Lazy<BTreeMap<u32, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        (1, "kernel"),
        (2, "security"),
        (3, "unlabeled"),
        (4, "fs"),
        (5, "file"),
        (6, "file_labels"),
        (7, "init"),
        (8, "any_socket"),
        (9, "port"),
        (10, "netif"),
        (11, "netmsg"),
        (12, "node"),
        (13, "igmp_packet"),
        (14, "icmp_socket"),
        (15, "tcp_socket"),
        (16, "sysctl_modprobe"),
        (17, "sysctl"),
        (18, "sysctl_fs"),
        (19, "sysctl_kernel"),
        (20, "sysctl_net"),
        (21, "sysctl_net_unix"),
        (22, "sysctl_vm"),
        (23, "sysctl_dev"),
        (24, "kmod"),
        (25, "policy"),
        (26, "scmp_packet"),
        (27, "devnull"),
    ])
});

/// Decodes the binary policy read from `reader`, storing the categories selected by `options`.
///
/// Categories that are not selected are still decoded and checked, but are left out of the
/// returned [`PolicyImage`]. Selecting a category also selects the categories it refers to; for
/// example, [`DecodeOptions::AV_RULES`] implies types, classes and permissions.
///
/// Any malformed or truncated input fails the whole decode; no partial image is returned. The
/// [`ParseError`] at the root of the returned error may be recovered with
/// [`anyhow::Error::downcast_ref`] or classified with [`error_kind`].
pub fn parse_policy<R: Read>(
    reader: R,
    options: DecodeOptions,
) -> Result<PolicyImage, anyhow::Error> {
    let mut cursor = ByteCursor::new(reader);
    parsed_policy::decode_policy(&mut cursor, options)
}

/// Decodes the binary policy in `binary_policy`. See [`parse_policy`].
pub fn parse_policy_bytes(
    binary_policy: &[u8],
    options: DecodeOptions,
) -> Result<PolicyImage, anyhow::Error> {
    parse_policy(binary_policy, options)
}

/// Returns whether `reader` starts with the SELinux policy magic number. Consumes at most four
/// bytes.
pub fn is_binary_policy<R: Read>(reader: R) -> bool {
    let mut cursor = ByteCursor::new(reader);
    matches!(cursor.parse::<Magic>().map(|magic| magic.validate()), Ok(Ok(())))
}

/// Returns the policy version of the binary policy read from `reader`, which must be one of the
/// supported versions. Consumes the magic number, signature and version.
pub fn binary_policy_version<R: Read>(reader: R) -> Result<u32, anyhow::Error> {
    let mut cursor = ByteCursor::new(reader);
    let magic = cursor.parse::<Magic>().context("parsing magic")?;
    magic.validate().context("validating magic")?;
    Signature::parse(&mut cursor).context("parsing signature")?;
    let policy_version = cursor.parse_u32().context("parsing policy version")?;
    SchemaProfile::for_version(policy_version).context("validating policy version")?;
    Ok(policy_version)
}

/// Reads a composite wire record from a [`ByteCursor`].
pub(crate) trait Parse: Sized {
    fn parse<R: Read>(cursor: &mut ByteCursor<R>) -> Result<Self, ParseError>;
}

/// Checks internal consistency of a parsed record that does not depend on other records.
pub(crate) trait Validate {
    type Error: std::error::Error + Send + Sync + 'static;

    fn validate(&self) -> Result<(), Self::Error>;
}
