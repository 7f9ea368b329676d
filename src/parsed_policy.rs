// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    metadata::{Magic, PolicyHeader, SchemaProfile, Signature},
    model::PolicyImage,
    options::DecodeOptions,
    parser::ByteCursor,
    remap::{Fixups, IndexRemapTables},
    symbols::SymbolKind,
    Parse, Validate,
};

use anyhow::Context as _;
use std::{fmt, io::Read};

/// The sections of a binary policy, in the order in which they are decoded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DecodeState {
    MagicCheck,
    HeaderCheck,
    SymbolTables,
    AliasAndRoleFixup,
    BaseRules,
    ConditionalPolicy,
    RoleTransitions,
    RoleAllows,
    ObjectContexts,
    GenfsContexts,
    RangeTransitions,
    TypeAttributeMap,
    SensitivityFixup,
    Done,
}

impl DecodeState {
    /// Returns the state that follows this one for a policy with schema `profile`, skipping
    /// sections that the profile does not carry.
    pub fn next(self, profile: &SchemaProfile) -> Self {
        match self {
            Self::MagicCheck => Self::HeaderCheck,
            Self::HeaderCheck => Self::SymbolTables,
            Self::SymbolTables => Self::AliasAndRoleFixup,
            Self::AliasAndRoleFixup => Self::BaseRules,
            Self::BaseRules if profile.has_booleans() => Self::ConditionalPolicy,
            Self::BaseRules | Self::ConditionalPolicy => Self::RoleTransitions,
            Self::RoleTransitions => Self::RoleAllows,
            Self::RoleAllows => Self::ObjectContexts,
            Self::ObjectContexts => Self::GenfsContexts,
            Self::GenfsContexts if profile.has_mls() => Self::RangeTransitions,
            Self::GenfsContexts | Self::RangeTransitions if profile.has_attributes() => {
                Self::TypeAttributeMap
            }
            Self::GenfsContexts | Self::RangeTransitions | Self::TypeAttributeMap
                if profile.has_mls() =>
            {
                Self::SensitivityFixup
            }
            Self::GenfsContexts
            | Self::RangeTransitions
            | Self::TypeAttributeMap
            | Self::SensitivityFixup
            | Self::Done => Self::Done,
        }
    }
}

impl fmt::Display for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MagicCheck => "magic",
            Self::HeaderCheck => "header",
            Self::SymbolTables => "symbol tables",
            Self::AliasAndRoleFixup => "aliases and role types",
            Self::BaseRules => "access vector rules",
            Self::ConditionalPolicy => "conditional policy",
            Self::RoleTransitions => "role transitions",
            Self::RoleAllows => "role allows",
            Self::ObjectContexts => "object contexts",
            Self::GenfsContexts => "genfs contexts",
            Self::RangeTransitions => "range transitions",
            Self::TypeAttributeMap => "type attribute map",
            Self::SensitivityFixup => "user mls levels",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// State of a single in-flight decode: the stream, the schema profile fixed by the header, the
/// wire-value remap tables, values awaiting later sections, and the image built so far.
pub(crate) struct Decoder<'a, R> {
    pub cursor: &'a mut ByteCursor<R>,
    pub profile: SchemaProfile,
    pub options: DecodeOptions,
    pub remap: IndexRemapTables,
    pub fixups: Fixups,
    pub image: PolicyImage,
}

impl<'a, R: Read> Decoder<'a, R> {
    pub fn new(
        cursor: &'a mut ByteCursor<R>,
        profile: SchemaProfile,
        mls_enabled: bool,
        signature: String,
        options: DecodeOptions,
    ) -> Self {
        Self {
            cursor,
            profile,
            options,
            remap: IndexRemapTables::new(),
            fixups: Fixups::default(),
            image: PolicyImage::new(profile, mls_enabled, signature),
        }
    }

    /// Returns whether every category in `flags` is stored in the image.
    pub fn materialize(&self, flags: DecodeOptions) -> bool {
        self.options.contains(flags)
    }

    /// Returns whether MLS levels and ranges are resolved and stored, rather than only consumed.
    pub fn mls_materialized(&self) -> bool {
        self.image.mls_enabled && self.options.contains(DecodeOptions::MLS)
    }

    fn decode_section(&mut self, state: DecodeState) -> Result<(), anyhow::Error> {
        match state {
            DecodeState::SymbolTables => {
                let count = self.profile.symbols_count() as usize;
                for kind in SymbolKind::ALL.into_iter().take(count) {
                    self.decode_symbol_table(kind)
                        .with_context(|| format!("decoding {kind} symbols"))?;
                }
            }
            DecodeState::AliasAndRoleFixup => self.attach_aliases_and_role_types()?,
            DecodeState::BaseRules => self.decode_access_vector_table(
                self.materialize(DecodeOptions::AV_RULES),
                self.materialize(DecodeOptions::TYPE_RULES),
                None,
            )?,
            DecodeState::ConditionalPolicy => self.decode_conditionals()?,
            DecodeState::RoleTransitions => self.decode_role_transitions()?,
            DecodeState::RoleAllows => self.decode_role_allows()?,
            DecodeState::ObjectContexts => self.decode_object_contexts()?,
            DecodeState::GenfsContexts => self.decode_genfs_contexts()?,
            DecodeState::RangeTransitions => self.decode_range_transitions()?,
            DecodeState::TypeAttributeMap => self.decode_type_attribute_map()?,
            DecodeState::SensitivityFixup => self.resolve_user_levels()?,
            DecodeState::MagicCheck | DecodeState::HeaderCheck | DecodeState::Done => {}
        }
        Ok(())
    }
}

/// Decodes a complete binary policy from `cursor`. Categories outside `options` (after adding the
/// categories they depend on) are consumed but not stored in the returned image.
pub(crate) fn decode_policy<R: Read>(
    cursor: &mut ByteCursor<R>,
    options: DecodeOptions,
) -> Result<PolicyImage, anyhow::Error> {
    let options = options.with_dependencies();

    let mut state = DecodeState::MagicCheck;
    tracing::debug!(%state, "decoding");
    let magic = cursor.parse::<Magic>().context("parsing magic")?;
    magic.validate().context("validating magic")?;
    let signature = Signature::parse(cursor).context("parsing signature")?;

    state = DecodeState::HeaderCheck;
    tracing::debug!(%state, "decoding");
    let header = cursor.parse::<PolicyHeader>().context("parsing header")?;
    let profile = header.schema_profile().context("validating header")?;
    tracing::debug!(?profile, mls_enabled = header.mls_enabled(), ?options, "schema profile");

    let mut decoder =
        Decoder::new(cursor, profile, header.mls_enabled(), signature.into_string(), options);
    state = state.next(&profile);
    while state != DecodeState::Done {
        tracing::debug!(%state, position = decoder.cursor.position(), "decoding");
        decoder.decode_section(state).with_context(|| format!("decoding {state}"))?;
        state = state.next(&profile);
    }

    tracing::debug!(
        classes = decoder.image.classes().len(),
        types = decoder.image.types().len(),
        access_vector_rules = decoder.image.access_vector_rules().len(),
        "decoded policy"
    );
    Ok(decoder.image)
}
