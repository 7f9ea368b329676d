// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{error::ParseError, parser::ByteCursor, Parse, Validate};

use std::io::Read;
use zerocopy::{little_endian as le, FromBytes, Immutable, KnownLayout, Unaligned};

pub(crate) const SELINUX_MAGIC: u32 = 0xf97cff8c;

pub(crate) const POLICYDB_SIGNATURE: &str = "SE Linux";

pub(crate) const POLICYDB_VERSION_MIN: u32 = 15;
pub(crate) const POLICYDB_VERSION_MAX: u32 = 20;

pub(crate) const CONFIG_MLS_FLAG: u32 = 1;

/// The capabilities of one on-disk policy format version. Every decoder consults the profile
/// resolved from the policy header rather than comparing version numbers itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SchemaProfile {
    version: u32,
    symbols_count: u32,
    object_contexts_count: u32,
    has_booleans: bool,
    has_ipv6: bool,
    has_mls: bool,
    has_validatetrans: bool,
    has_attributes: bool,
    unified_avtab_format: bool,
}

const fn profile(
    version: u32,
    symbols_count: u32,
    object_contexts_count: u32,
    has_booleans: bool,
    has_ipv6: bool,
    has_mls: bool,
    has_attributes: bool,
) -> SchemaProfile {
    SchemaProfile {
        version,
        symbols_count,
        object_contexts_count,
        has_booleans,
        has_ipv6,
        has_mls,
        has_validatetrans: has_mls,
        has_attributes,
        unified_avtab_format: has_attributes,
    }
}

pub(crate) const SCHEMA_PROFILES: [SchemaProfile; 6] = [
    profile(15, 5, 6, false, false, false, false),
    profile(16, 6, 6, true, false, false, false),
    profile(17, 6, 7, true, true, false, false),
    profile(18, 6, 7, true, true, false, false),
    profile(19, 8, 7, true, true, true, false),
    profile(20, 8, 7, true, true, true, true),
];

impl SchemaProfile {
    /// Returns the profile of policy format `version`.
    pub fn for_version(version: u32) -> Result<Self, ParseError> {
        SCHEMA_PROFILES
            .iter()
            .find(|profile| profile.version == version)
            .copied()
            .ok_or(ParseError::UnsupportedVersion { found_policy_version: version })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Number of symbol tables that follow the header.
    pub fn symbols_count(&self) -> u32 {
        self.symbols_count
    }

    /// Number of object context kinds that follow the role rules.
    pub fn object_contexts_count(&self) -> u32 {
        self.object_contexts_count
    }

    pub fn has_booleans(&self) -> bool {
        self.has_booleans
    }

    pub fn has_ipv6(&self) -> bool {
        self.has_ipv6
    }

    pub fn has_mls(&self) -> bool {
        self.has_mls
    }

    pub fn has_validatetrans(&self) -> bool {
        self.has_validatetrans
    }

    pub fn has_attributes(&self) -> bool {
        self.has_attributes
    }

    /// Whether access vector table entries use 16-bit keys and carry exactly one value.
    pub fn unified_avtab_format(&self) -> bool {
        self.unified_avtab_format
    }
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct Magic(le::U32);

impl Validate for Magic {
    type Error = ParseError;

    fn validate(&self) -> Result<(), Self::Error> {
        let found_magic = self.0.get();
        if found_magic != SELINUX_MAGIC {
            Err(ParseError::BadMagic { found_magic })
        } else {
            Ok(())
        }
    }
}

/// The length-encoded string that follows the magic number; "SE Linux" for kernel policies.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Parse for Signature {
    fn parse<R: Read>(cursor: &mut ByteCursor<R>) -> Result<Self, ParseError> {
        let length = cursor.parse_u32()?;
        let signature = cursor.read_string(length, "policy signature")?;
        if signature != POLICYDB_SIGNATURE {
            tracing::warn!(%signature, "unexpected policy signature");
        }
        Ok(Self(signature))
    }
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct PolicyHeader {
    policy_version: le::U32,
    config: le::U32,
    symbols_count: le::U32,
    object_contexts_count: le::U32,
}

impl PolicyHeader {
    pub fn policy_version(&self) -> u32 {
        self.policy_version.get()
    }

    pub fn mls_enabled(&self) -> bool {
        self.config.get() & CONFIG_MLS_FLAG != 0
    }

    /// Resolves the schema profile of this header, checking that the MLS flag and declared
    /// section counts agree with it.
    pub fn schema_profile(&self) -> Result<SchemaProfile, ParseError> {
        let policy_version = self.policy_version();
        let profile = SchemaProfile::for_version(policy_version)?;

        if self.mls_enabled() && !profile.has_mls() {
            return Err(ParseError::MlsUnsupported { policy_version });
        }

        let symbols_count = self.symbols_count.get();
        if symbols_count != profile.symbols_count() {
            return Err(ParseError::CorruptValue {
                field: "symbol table count",
                value: symbols_count,
            });
        }
        let object_contexts_count = self.object_contexts_count.get();
        if object_contexts_count != profile.object_contexts_count() {
            return Err(ParseError::CorruptValue {
                field: "object context count",
                value: object_contexts_count,
            });
        }

        Ok(profile)
    }
}
