// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Builders for binary policy fragments used by unit tests.

use crate::{
    extensible_bitmap::MAP_NODE_BITS,
    metadata::{SchemaProfile, CONFIG_MLS_FLAG, POLICYDB_SIGNATURE, SELINUX_MAGIC},
    options::DecodeOptions,
    parsed_policy::Decoder,
    parser::ByteCursor,
};

use std::collections::BTreeMap;

/// Appends little-endian wire fields. Symbol values passed to the builders below are 1-based wire
/// values; bitmaps of values are encoded with bit `value - 1` set.
#[derive(Default)]
pub(crate) struct PolicyWriter {
    bytes: Vec<u8>,
}

impl PolicyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn u16(self, value: u16) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u32(self, value: u32) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    pub fn u64(self, value: u64) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Appends the bytes of `value` without a length prefix.
    pub fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes())
    }

    fn len(self, value: &str) -> Self {
        self.u32(value.len() as u32)
    }

    /// Appends magic, signature and a header whose section counts match `version`.
    pub fn header(self, version: u32, mls_enabled: bool) -> Self {
        let profile = SchemaProfile::for_version(version).expect("supported version");
        self.u32(SELINUX_MAGIC)
            .len(POLICYDB_SIGNATURE)
            .str(POLICYDB_SIGNATURE)
            .u32(version)
            .u32(if mls_enabled { CONFIG_MLS_FLAG } else { 0 })
            .u32(profile.symbols_count())
            .u32(profile.object_contexts_count())
    }

    /// Appends an extensible bitmap with exactly the bit positions in `bits` set.
    pub fn ebitmap(self, bits: &[u32]) -> Self {
        let mut nodes = BTreeMap::<u32, u64>::new();
        for &bit in bits {
            let start_bit = bit - bit % MAP_NODE_BITS;
            *nodes.entry(start_bit).or_default() |= 1u64 << (bit - start_bit);
        }
        let high_bit =
            nodes.keys().next_back().map_or(MAP_NODE_BITS, |start_bit| start_bit + MAP_NODE_BITS);
        let writer = self.u32(MAP_NODE_BITS).u32(high_bit).u32(nodes.len() as u32);
        nodes.into_iter().fold(writer, |writer, (start_bit, map)| writer.u32(start_bit).u64(map))
    }

    fn value_bitmap(self, values: &[u32]) -> Self {
        let bits: Vec<_> = values.iter().map(|value| value - 1).collect();
        self.ebitmap(&bits)
    }

    pub fn symbol_table(self, size: u32, count: u32) -> Self {
        self.u32(size).u32(count)
    }

    fn permissions(self, permissions: &[(&str, u32)]) -> Self {
        permissions
            .iter()
            .fold(self, |writer, (name, value)| writer.len(name).u32(*value).str(name))
    }

    pub fn common(self, name: &str, value: u32, permissions: &[(&str, u32)]) -> Self {
        self.len(name)
            .u32(value)
            .u32(permissions.len() as u32) // permission count
            .u32(permissions.len() as u32) // permission entries
            .str(name)
            .permissions(permissions)
    }

    /// Appends a class without constraints. `permission_count` includes inherited permissions.
    pub fn class(
        self,
        version: u32,
        name: &str,
        value: u32,
        common: Option<&str>,
        permission_count: u32,
        permissions: &[(&str, u32)],
    ) -> Self {
        let common = common.unwrap_or("");
        let writer = self
            .len(name)
            .len(common)
            .u32(value)
            .u32(permission_count)
            .u32(permissions.len() as u32) // permission entries
            .u32(0) // constraints
            .str(name)
            .str(common)
            .permissions(permissions);
        if version >= 19 {
            writer.u32(0) // validatetrans constraints
        } else {
            writer
        }
    }

    /// Appends a role that dominates only itself.
    pub fn role(self, name: &str, value: u32, types: &[u32]) -> Self {
        self.len(name).u32(value).str(name).value_bitmap(&[value]).value_bitmap(types)
    }

    pub fn type_(self, name: &str, value: u32, primary: bool) -> Self {
        self.len(name).u32(value).u32(primary as u32).str(name)
    }

    /// Appends a user up to its roles; MLS profiles expect a range and default level to follow.
    pub fn user(self, name: &str, value: u32, roles: &[u32]) -> Self {
        self.len(name).u32(value).str(name).value_bitmap(roles)
    }

    pub fn boolean(self, name: &str, value: u32, state: u32) -> Self {
        self.u32(value).u32(state).len(name).str(name)
    }

    pub fn sensitivity(self, name: &str, value: u32, is_alias: bool, categories: &[u32]) -> Self {
        self.len(name).u32(is_alias as u32).str(name).mls_level(value, categories)
    }

    pub fn category(self, name: &str, value: u32, is_alias: bool) -> Self {
        self.len(name).u32(value).u32(is_alias as u32).str(name)
    }

    pub fn mls_level(self, sensitivity: u32, categories: &[u32]) -> Self {
        self.u32(sensitivity).value_bitmap(categories)
    }

    pub fn mls_range_single(self, sensitivity: u32, categories: &[u32]) -> Self {
        self.u32(1).u32(sensitivity).value_bitmap(categories)
    }

    pub fn mls_range(
        self,
        low: u32,
        low_categories: &[u32],
        high: u32,
        high_categories: &[u32],
    ) -> Self {
        self.u32(2).u32(low).u32(high).value_bitmap(low_categories).value_bitmap(high_categories)
    }

    pub fn context(self, user: u32, role: u32, type_: u32) -> Self {
        self.u32(user).u32(role).u32(type_)
    }

    /// Appends one access vector table entry in the layout of `version`. Unified entries carry
    /// only the first of `values`.
    pub fn access_vector(
        self,
        version: u32,
        source: u32,
        target: u32,
        class: u32,
        specified: u32,
        values: &[u32],
    ) -> Self {
        if version >= 20 {
            self.u16(source as u16)
                .u16(target as u16)
                .u16(class as u16)
                .u16(specified as u16)
                .u32(values[0])
        } else {
            let writer = self
                .u32(4 + values.len() as u32) // items
                .u32(source)
                .u32(target)
                .u32(class)
                .u32(specified);
            values.iter().fold(writer, |writer, value| writer.u32(*value))
        }
    }
}

/// Returns a decoder over `cursor` for a policy of `version`, with empty tables.
pub(crate) fn decoder_for_test<'a, 'b>(
    cursor: &'a mut ByteCursor<&'b [u8]>,
    version: u32,
    mls_enabled: bool,
    options: DecodeOptions,
) -> Decoder<'a, &'b [u8]> {
    let profile = SchemaProfile::for_version(version).expect("supported version");
    Decoder::new(cursor, profile, mls_enabled, POLICYDB_SIGNATURE.to_string(), options)
}
