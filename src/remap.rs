// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    error::ParseError,
    extensible_bitmap::ExtensibleBitmap,
    metadata::SchemaProfile,
    model::{
        Attribute, AttributeId, BooleanId, CategoryId, ClassId, CommonId, PermissionId,
        PolicyImage, RoleId, SensitivityId, TypeId, TypeName, TypeRef, UserId,
    },
    security_context::{RawMlsLevel, RawMlsRange},
};

use std::collections::{btree_map, BTreeMap, BTreeSet, HashMap};

/// Largest permission count a class or common permission set may declare: access vector masks
/// carry one bit per permission.
pub(crate) const MAX_PERMISSIONS: u32 = u32::BITS;

/// Allocates one empty position per permission of a class or common permission set.
pub(crate) fn allocate_permission_slots(
    count: u32,
) -> Result<Vec<Option<PermissionId>>, ParseError> {
    if count > MAX_PERMISSIONS {
        return Err(ParseError::CorruptValue { field: "permission count", value: count });
    }
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(count as usize)
        .map_err(|_| ParseError::OutOfMemory { category: "permission", size: count })?;
    slots.resize(count as usize, None);
    Ok(slots)
}

/// Maps the 1-based values that a binary policy uses to refer to the symbols of one category onto
/// entries of the decoded [`PolicyImage`].
///
/// Only recorded entries take up memory, so a declared size is never committed up front.
#[derive(Debug)]
pub(crate) struct RemapTable<T> {
    category: &'static str,
    size: u32,
    entries: BTreeMap<u32, T>,
}

impl<T> RemapTable<T> {
    pub fn new(category: &'static str) -> Self {
        Self { category, size: 0, entries: BTreeMap::new() }
    }

    /// Resets this table to `size` unresolved values.
    pub fn allocate(&mut self, size: u32) {
        self.size = size;
        self.entries.clear();
    }

    /// Returns the declared table size.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Checks that `value` lies in `[1, size]`, returning its 0-based index.
    pub fn validate(&self, value: u32) -> Result<usize, ParseError> {
        if value == 0 || value > self.size {
            return Err(ParseError::CorruptValue { field: self.category, value });
        }
        Ok(value as usize - 1)
    }

    pub fn set(&mut self, value: u32, entry: T) -> Result<(), ParseError> {
        self.validate(value)?;
        match self.entries.entry(value) {
            btree_map::Entry::Occupied(_) => {
                Err(ParseError::CorruptValue { field: self.category, value })
            }
            btree_map::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(())
            }
        }
    }

    pub fn entry(&self, value: u32) -> Result<Option<&T>, ParseError> {
        self.validate(value)?;
        Ok(self.entries.get(&value))
    }

    /// Returns the entry for `value`, which must already have been recorded.
    pub fn resolve_entry(&self, value: u32) -> Result<&T, ParseError> {
        self.entry(value)?
            .ok_or(ParseError::UnresolvedSymbol { category: self.category, value })
    }
}

impl<T: Copy> RemapTable<T> {
    pub fn lookup(&self, value: u32) -> Result<Option<T>, ParseError> {
        Ok(self.entry(value)?.copied())
    }

    pub fn resolve(&self, value: u32) -> Result<T, ParseError> {
        self.resolve_entry(value).copied()
    }
}

/// The bit position order of a class's or common permission set's permissions.
#[derive(Clone, Debug)]
pub(crate) struct PermissionLayout {
    pub name: String,
    /// Permission for each bit position. Slots stay empty when permissions are not materialized.
    pub positions: Vec<Option<PermissionId>>,
}

impl PermissionLayout {
    pub fn permission_count(&self) -> u32 {
        self.positions.len() as u32
    }
}

/// Per-category remap tables for a single decode.
#[derive(Debug)]
pub(crate) struct IndexRemapTables {
    pub commons: RemapTable<CommonId>,
    pub classes: RemapTable<ClassId>,
    pub roles: RemapTable<RoleId>,
    pub types: RemapTable<TypeId>,
    /// Type values that designate attributes rather than types.
    pub attributes: RemapTable<AttributeId>,
    pub users: RemapTable<UserId>,
    pub booleans: RemapTable<BooleanId>,
    pub sensitivities: RemapTable<SensitivityId>,
    pub categories: RemapTable<CategoryId>,

    /// Recorded for every common permission set, whether or not it is materialized, so that
    /// classes can inherit its bit positions.
    pub common_layouts: RemapTable<PermissionLayout>,
    pub common_values: HashMap<String, u32>,
    /// Recorded for every class, whether or not it is materialized.
    pub class_layouts: RemapTable<PermissionLayout>,
}

impl IndexRemapTables {
    pub fn new() -> Self {
        Self {
            commons: RemapTable::new("common"),
            classes: RemapTable::new("class"),
            roles: RemapTable::new("role"),
            types: RemapTable::new("type"),
            attributes: RemapTable::new("attribute"),
            users: RemapTable::new("user"),
            booleans: RemapTable::new("boolean"),
            sensitivities: RemapTable::new("sensitivity"),
            categories: RemapTable::new("category"),
            common_layouts: RemapTable::new("common"),
            common_values: HashMap::new(),
            class_layouts: RemapTable::new("class"),
        }
    }

    /// Resolves a type value appearing as a rule source or target.
    ///
    /// Values that do not name a type designate attributes on profiles with first-class
    /// attributes; an attribute that carries no name in the policy is synthesized on first
    /// reference and reused afterwards.
    pub fn resolve_type_ref(
        &mut self,
        profile: &SchemaProfile,
        image: &mut PolicyImage,
        value: u32,
    ) -> Result<TypeRef, ParseError> {
        if let Some(id) = self.types.lookup(value)? {
            return Ok(TypeRef::Type(id));
        }
        if !profile.has_attributes() {
            return Err(ParseError::UnresolvedSymbol { category: "type", value });
        }
        if let Some(id) = self.attributes.lookup(value)? {
            return Ok(TypeRef::Attribute(id));
        }
        Ok(TypeRef::Attribute(self.synthesize_attribute(image, value)?))
    }

    /// Creates an attribute for type value `value`, named `@ttrNNNN` after the first unused
    /// suffix starting at `value`.
    fn synthesize_attribute(
        &mut self,
        image: &mut PolicyImage,
        value: u32,
    ) -> Result<AttributeId, ParseError> {
        let mut suffix = value;
        let name = loop {
            let candidate = format!("@ttr{suffix:04}");
            if !image.has_symbol_name(&candidate) {
                break candidate;
            }
            suffix = suffix
                .checked_add(1)
                .ok_or(ParseError::CorruptValue { field: "attribute", value })?;
        };

        let id = AttributeId::new(image.attributes.len());
        image.add_type_name(&name, TypeName::Attribute(id));
        tracing::warn!(%name, value, "synthesized unnamed attribute");
        image.attributes.push(Attribute { name, types: BTreeSet::new(), synthesized: true });
        self.attributes.set(value, id)?;
        Ok(id)
    }
}

/// Decoded values whose interpretation needs tables that are complete only after the symbol
/// tables have been decoded.
#[derive(Debug, Default)]
pub(crate) struct Fixups {
    /// Alias name and the value of the type it aliases.
    pub type_aliases: Vec<(String, u32)>,
    /// Role and its type membership, as type values.
    pub role_types: Vec<(RoleId, ExtensibleBitmap)>,
    pub sensitivity_aliases: Vec<(String, u32)>,
    /// Sensitivity and the category values declared with it.
    pub sensitivity_categories: Vec<(SensitivityId, ExtensibleBitmap)>,
    pub category_aliases: Vec<(String, u32)>,
    pub user_levels: Vec<UserLevels>,
}

/// MLS data of a user, decoded before the sensitivity and category tables exist.
#[derive(Debug)]
pub(crate) struct UserLevels {
    pub user: UserId,
    pub range: RawMlsRange,
    pub default_level: RawMlsLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::{Class, CommonPermission, Sensitivity, Type};

    fn image(version: u32) -> PolicyImage {
        PolicyImage::new(
            SchemaProfile::for_version(version).expect("profile"),
            false,
            "SE Linux".to_string(),
        )
    }

    #[test]
    fn boundary_values() {
        let mut table = RemapTable::<TypeId>::new("type");
        table.allocate(3);

        assert_eq!(Ok(2), table.validate(3));
        assert_eq!(Ok(0), table.validate(1));
        assert_eq!(Err(ParseError::CorruptValue { field: "type", value: 4 }), table.validate(4));
        assert_eq!(Err(ParseError::CorruptValue { field: "type", value: 0 }), table.validate(0));

        table.set(3, TypeId::new(0)).expect("set");
        assert_eq!(Ok(TypeId::new(0)), table.resolve(3));
        assert_eq!(Ok(None), table.lookup(2));
        assert_eq!(
            Err(ParseError::UnresolvedSymbol { category: "type", value: 2 }),
            table.resolve(2)
        );
        assert_eq!(
            Err(ParseError::CorruptValue { field: "type", value: 3 }),
            table.set(3, TypeId::new(1))
        );
    }

    #[test]
    fn declared_size_is_not_committed() {
        let mut table = RemapTable::<UserId>::new("user");
        table.allocate(u32::MAX);
        assert_eq!(u32::MAX, table.size());
        table.set(u32::MAX, UserId::new(0)).expect("set");
        assert_eq!(Ok(UserId::new(0)), table.resolve(u32::MAX));
        assert_eq!(Ok(None), table.lookup(1));

        // Reallocating forgets earlier entries.
        table.allocate(1);
        assert_eq!(
            Err(ParseError::CorruptValue { field: "user", value: u32::MAX }),
            table.lookup(u32::MAX)
        );
    }

    #[test]
    fn permission_slots_fit_an_access_vector() {
        assert_eq!(32, allocate_permission_slots(32).expect("slots").len());
        assert_eq!(
            Err(ParseError::CorruptValue { field: "permission count", value: 33 }),
            allocate_permission_slots(33)
        );
    }

    #[test]
    fn unresolved_type_without_attributes_is_corrupt() {
        let profile = SchemaProfile::for_version(19).expect("profile");
        let mut image = image(19);
        let mut remap = IndexRemapTables::new();
        remap.types.allocate(2);

        assert_eq!(
            Err(ParseError::UnresolvedSymbol { category: "type", value: 2 }),
            remap.resolve_type_ref(&profile, &mut image, 2)
        );
        assert_eq!(
            Err(ParseError::CorruptValue { field: "type", value: 3 }),
            remap.resolve_type_ref(&profile, &mut image, 3)
        );
    }

    #[test]
    fn synthesized_attributes_are_unique_and_reused() {
        let profile = SchemaProfile::for_version(20).expect("profile");
        let mut image = image(20);
        let mut remap = IndexRemapTables::new();
        remap.types.allocate(8);
        remap.attributes.allocate(8);

        // A declared type already occupies the name the second attribute would get first.
        image.types.push(Type {
            name: "@ttr0003".to_string(),
            aliases: Vec::new(),
            attributes: BTreeSet::new(),
        });
        image.add_type_name("@ttr0003", TypeName::Type(TypeId::new(0)));
        remap.types.set(1, TypeId::new(0)).expect("set");

        let first = remap.resolve_type_ref(&profile, &mut image, 2).expect("attribute");
        let second = remap.resolve_type_ref(&profile, &mut image, 3).expect("attribute");
        let third = remap.resolve_type_ref(&profile, &mut image, 4).expect("attribute");
        assert_eq!(first, remap.resolve_type_ref(&profile, &mut image, 2).expect("attribute"));
        assert_eq!(
            TypeRef::Type(TypeId::new(0)),
            remap.resolve_type_ref(&profile, &mut image, 1).expect("type")
        );

        let names: Vec<_> = [first, second, third]
            .into_iter()
            .map(|type_ref| image.type_ref_name(type_ref).to_string())
            .collect();
        assert_eq!(vec!["@ttr0002", "@ttr0004", "@ttr0005"], names);
        assert_eq!(3, image.attributes().len());
        assert!(image.attributes().iter().all(|attribute| attribute.synthesized));
    }

    #[test]
    fn synthesized_attributes_skip_names_of_every_symbol_kind() {
        let profile = SchemaProfile::for_version(20).expect("profile");
        let mut image = image(20);
        let mut remap = IndexRemapTables::new();
        remap.types.allocate(4);
        remap.attributes.allocate(4);

        let common = CommonPermission { name: "@ttr0002".to_string(), permissions: Vec::new() };
        image.add_common(common);
        let class = Class { name: "@ttr0003".to_string(), common: None, permissions: Vec::new() };
        assert_eq!(Ok(ClassId::new(0)), image.add_class(class.clone()));
        let sensitivity = image.add_sensitivity(Sensitivity {
            name: "s0".to_string(),
            aliases: Vec::new(),
            dominance: 1,
            categories: BTreeSet::new(),
        });
        image.add_sensitivity_alias(sensitivity, "@ttr0004".to_string());

        assert_eq!(Some(ClassId::new(0)), image.find_class_by_name("@ttr0003"));
        assert!(image.has_symbol_name("s0"));
        assert_eq!(
            Err(ParseError::DuplicateSymbol { category: "class", name: "@ttr0003".to_string() }),
            image.add_class(class)
        );

        let attribute = remap.resolve_type_ref(&profile, &mut image, 2).expect("attribute");
        assert_eq!("@ttr0005", image.type_ref_name(attribute));
    }
}
