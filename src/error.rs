// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io;
use thiserror::Error;

/// Coarse classification of a [`ParseError`]. Callers that only need to report why a policy could
/// not be loaded should match on this rather than on individual [`ParseError`] variants.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The stream ended before an expected field.
    Truncated,
    /// The stream does not start with the SELinux policy magic number.
    BadMagic,
    /// The policy version is not one of the supported schema profiles.
    UnsupportedVersion,
    /// The policy enables MLS but its version predates MLS support.
    MlsUnsupported,
    /// An index, count or enumerated value is outside its valid range.
    CorruptValue,
    /// A table sized from a wire count could not be allocated.
    OutOfMemory,
    /// The underlying stream failed for a reason other than reaching its end.
    Io,
}

/// Structured errors that may be encountered decoding a binary policy.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("expected {type_name} ({type_size} bytes) but only {num_bytes} bytes remain")]
    Truncated { type_name: &'static str, type_size: usize, num_bytes: usize },
    #[error(
        "expected selinux magic value {:#x}, but found {found_magic:#x}",
        crate::metadata::SELINUX_MAGIC
    )]
    BadMagic { found_magic: u32 },
    #[error(
        "expected policy version in range [{}, {}], but found {found_policy_version}",
        crate::metadata::POLICYDB_VERSION_MIN,
        crate::metadata::POLICYDB_VERSION_MAX
    )]
    UnsupportedVersion { found_policy_version: u32 },
    #[error("policy enables MLS, but policy version {policy_version} does not support it")]
    MlsUnsupported { policy_version: u32 },
    #[error("invalid value {value} for {field}")]
    CorruptValue { field: &'static str, value: u32 },
    #[error("duplicate {category} symbol {name:?}")]
    DuplicateSymbol { category: &'static str, name: String },
    #[error("{category} value {value} is referenced before it is declared")]
    UnresolvedSymbol { category: &'static str, value: u32 },
    #[error("{category} symbol {name:?} is referenced but never declared")]
    UndeclaredSymbol { category: &'static str, name: String },
    #[error("failed to allocate {category} table with {size} entries")]
    OutOfMemory { category: &'static str, size: u32 },
    #[error("failed to read policy stream: {kind}")]
    Io { kind: io::ErrorKind },
}

impl ParseError {
    /// Returns the coarse classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Truncated { .. } => ErrorKind::Truncated,
            Self::BadMagic { .. } => ErrorKind::BadMagic,
            Self::UnsupportedVersion { .. } => ErrorKind::UnsupportedVersion,
            Self::MlsUnsupported { .. } => ErrorKind::MlsUnsupported,
            Self::CorruptValue { .. }
            | Self::DuplicateSymbol { .. }
            | Self::UnresolvedSymbol { .. }
            | Self::UndeclaredSymbol { .. } => ErrorKind::CorruptValue,
            Self::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            Self::Io { .. } => ErrorKind::Io,
        }
    }
}

/// Returns the [`ErrorKind`] of the [`ParseError`] at the root of `error`, if any.
pub fn error_kind(error: &anyhow::Error) -> Option<ErrorKind> {
    error.downcast_ref::<ParseError>().map(ParseError::kind)
}
