// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    error::ParseError,
    extensible_bitmap::ExtensibleBitmap,
    model::{MlsLevel, MlsRange, SecurityContext},
    parsed_policy::Decoder,
    parser::ByteCursor,
    remap::IndexRemapTables,
    Parse,
};

use std::{collections::BTreeSet, io::Read};
use zerocopy::{little_endian as le, FromBytes, Immutable, KnownLayout, Unaligned};

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct ContextMetadata {
    user: le::U32,
    role: le::U32,
    context_type: le::U32,
}

/// An MLS level as it appears on the wire: a sensitivity value and a bitmap in which bit `i`
/// denotes category value `i + 1`.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RawMlsLevel {
    pub sensitivity: u32,
    pub categories: ExtensibleBitmap,
}

impl RawMlsLevel {
    pub fn resolve(&self, remap: &IndexRemapTables) -> Result<MlsLevel, ParseError> {
        let sensitivity = remap.sensitivities.resolve(self.sensitivity)?;
        let categories = self
            .categories
            .ones()
            .map(|bit| remap.categories.resolve(bit + 1))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(MlsLevel { sensitivity, categories })
    }
}

impl Parse for RawMlsLevel {
    fn parse<R: Read>(cursor: &mut ByteCursor<R>) -> Result<Self, ParseError> {
        let sensitivity = cursor.parse_u32()?;
        let categories = ExtensibleBitmap::parse(cursor)?;
        Ok(Self { sensitivity, categories })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct RawMlsRange {
    pub low: RawMlsLevel,
    pub high: RawMlsLevel,
}

impl RawMlsRange {
    pub fn resolve(&self, remap: &IndexRemapTables) -> Result<MlsRange, ParseError> {
        Ok(MlsRange { low: self.low.resolve(remap)?, high: self.high.resolve(remap)? })
    }
}

impl Parse for RawMlsRange {
    /// Parses a level count of 1 or 2, the sensitivity of each level, and then the low and
    /// (optional) high category bitmaps. A single level is both low and high.
    fn parse<R: Read>(cursor: &mut ByteCursor<R>) -> Result<Self, ParseError> {
        let count = cursor.parse_u32()?;
        if count == 0 || count > 2 {
            return Err(ParseError::CorruptValue { field: "mls range level count", value: count });
        }
        let sensitivities = cursor.parse_u32_array(count as usize)?;
        let (low_sensitivity, high_sensitivity) = match sensitivities.as_slice() {
            [low] => (*low, *low),
            [low, high] => (*low, *high),
            _ => {
                return Err(ParseError::CorruptValue {
                    field: "mls range level count",
                    value: count,
                })
            }
        };

        let low_categories = ExtensibleBitmap::parse(cursor)?;
        let high_categories = if count > 1 {
            ExtensibleBitmap::parse(cursor)?
        } else {
            low_categories.clone()
        };

        Ok(Self {
            low: RawMlsLevel { sensitivity: low_sensitivity, categories: low_categories },
            high: RawMlsLevel { sensitivity: high_sensitivity, categories: high_categories },
        })
    }
}

/// An MLS range whose sensitivities are either still wire values or already resolved.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum DecodedMlsRange {
    Raw(RawMlsRange),
    Resolved(MlsRange),
}

impl<R: Read> Decoder<'_, R> {
    /// Decodes an MLS range. Returns `None` when MLS data is not materialized for this policy.
    ///
    /// With `raw_sensitivities`, sensitivity and category values are returned untranslated, for
    /// data decoded before the sensitivity and category tables exist.
    pub(crate) fn decode_mls_range(
        &mut self,
        raw_sensitivities: bool,
    ) -> Result<Option<DecodedMlsRange>, ParseError> {
        let raw = RawMlsRange::parse(self.cursor)?;
        if !self.mls_materialized() {
            return Ok(None);
        }
        if raw_sensitivities {
            Ok(Some(DecodedMlsRange::Raw(raw)))
        } else {
            Ok(Some(DecodedMlsRange::Resolved(raw.resolve(&self.remap)?)))
        }
    }

    /// Decodes a security context. The context is always consumed in full and its user, role and
    /// type values are always bounds-checked; it is resolved and returned only when `materialize`
    /// is set.
    pub(crate) fn decode_context(
        &mut self,
        materialize: bool,
    ) -> Result<Option<SecurityContext>, ParseError> {
        let metadata = self.cursor.parse::<ContextMetadata>()?;
        self.remap.users.validate(metadata.user.get())?;
        self.remap.roles.validate(metadata.role.get())?;
        self.remap.types.validate(metadata.context_type.get())?;
        let range = if self.profile.has_mls() {
            self.decode_mls_range(!materialize)?
        } else {
            None
        };
        if !materialize {
            return Ok(None);
        }

        let range = match range {
            Some(DecodedMlsRange::Resolved(range)) => Some(range),
            Some(DecodedMlsRange::Raw(_)) | None => None,
        };
        Ok(Some(SecurityContext {
            user: self.remap.users.resolve(metadata.user.get())?,
            role: self.remap.roles.resolve(metadata.role.get())?,
            type_: self.remap.types.resolve(metadata.context_type.get())?,
            range,
        }))
    }

    /// Translates the MLS levels buffered while decoding users, now that sensitivities and
    /// categories have been decoded.
    pub(crate) fn resolve_user_levels(&mut self) -> Result<(), ParseError> {
        for levels in std::mem::take(&mut self.fixups.user_levels) {
            let range = levels.range.resolve(&self.remap)?;
            let default_level = levels.default_level.resolve(&self.remap)?;
            let user = &mut self.image.users[levels.user.index()];
            user.range = Some(range);
            user.default_level = Some(default_level);
        }
        Ok(())
    }
}
