// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    error::ParseError,
    extensible_bitmap::ExtensibleBitmap,
    model::{
        Boolean, Category, Class, CommonPermission, PermissionId, Role, Sensitivity, Type, TypeId,
        TypeName, TypeRef, User,
    },
    options::DecodeOptions,
    parsed_policy::Decoder,
    remap::{allocate_permission_slots, PermissionLayout, UserLevels},
    security_context::{DecodedMlsRange, RawMlsLevel},
    Parse,
};

use std::{collections::BTreeSet, fmt, io::Read};
use zerocopy::{little_endian as le, FromBytes, Immutable, KnownLayout, Unaligned};

/// [`ConstraintExpressionMetadata`] type value for a logical negation node.
pub(crate) const CONSTRAINT_EXPRESSION_TYPE_NOT: u32 = 1;
/// [`ConstraintExpressionMetadata`] type value for a node comparing context attributes.
pub(crate) const CONSTRAINT_EXPRESSION_TYPE_ATTRIBUTE: u32 = 4;
/// [`ConstraintExpressionMetadata`] type value for a node that names explicit users, roles or
/// types; only this kind is followed by a names bitmap.
pub(crate) const CONSTRAINT_EXPRESSION_TYPE_NAMES: u32 = 5;

/// The symbol tables of a binary policy, in the order in which they appear. Older policy versions
/// carry only a prefix of this list.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SymbolKind {
    Common,
    Class,
    Role,
    Type,
    User,
    Boolean,
    Sensitivity,
    Category,
}

impl SymbolKind {
    pub const ALL: [SymbolKind; 8] = [
        Self::Common,
        Self::Class,
        Self::Role,
        Self::Type,
        Self::User,
        Self::Boolean,
        Self::Sensitivity,
        Self::Category,
    ];
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Common => "common",
            Self::Class => "class",
            Self::Role => "role",
            Self::Type => "type",
            Self::User => "user",
            Self::Boolean => "boolean",
            Self::Sensitivity => "sensitivity",
            Self::Category => "category",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct SymbolListMetadata {
    /// Number of values (and therefore remap slots) declared for the symbol category.
    primary_names_count: le::U32,
    /// Number of entries that follow.
    count: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct CommonSymbolMetadata {
    length: le::U32,
    value: le::U32,
    primary_names_count: le::U32,
    count: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct ClassMetadata {
    length: le::U32,
    common_length: le::U32,
    value: le::U32,
    /// Total number of permissions, including those inherited from the common permission set.
    primary_names_count: le::U32,
    count: le::U32,
    constraint_count: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct PermissionMetadata {
    length: le::U32,
    value: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct ConstraintMetadata {
    permissions: le::U32,
    expression_count: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct ConstraintExpressionMetadata {
    expression_type: le::U32,
    attribute: le::U32,
    operator: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RoleMetadata {
    length: le::U32,
    value: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct TypeMetadata {
    length: le::U32,
    value: le::U32,
    primary: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct UserMetadata {
    length: le::U32,
    value: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct BooleanMetadata {
    value: le::U32,
    state: le::U32,
    length: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct SensitivityMetadata {
    length: le::U32,
    is_alias: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct CategoryMetadata {
    length: le::U32,
    value: le::U32,
    is_alias: le::U32,
}

impl<R: Read> Decoder<'_, R> {
    /// Decodes one symbol table: its declared size and entry count, followed by the entries.
    pub(crate) fn decode_symbol_table(&mut self, kind: SymbolKind) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<SymbolListMetadata>()?;
        let size = metadata.primary_names_count.get();
        let count = metadata.count.get();
        tracing::trace!(%kind, size, count, "symbol table");

        match kind {
            SymbolKind::Common => {
                self.remap.commons.allocate(size);
                self.remap.common_layouts.allocate(size);
            }
            SymbolKind::Class => {
                self.remap.classes.allocate(size);
                self.remap.class_layouts.allocate(size);
            }
            SymbolKind::Role => self.remap.roles.allocate(size),
            SymbolKind::Type => {
                self.remap.types.allocate(size);
                if self.profile.has_attributes() {
                    self.remap.attributes.allocate(size);
                }
            }
            SymbolKind::User => self.remap.users.allocate(size),
            SymbolKind::Boolean => self.remap.booleans.allocate(size),
            SymbolKind::Sensitivity => self.remap.sensitivities.allocate(size),
            SymbolKind::Category => self.remap.categories.allocate(size),
        }

        for _ in 0..count {
            match kind {
                SymbolKind::Common => self.decode_common()?,
                SymbolKind::Class => self.decode_class()?,
                SymbolKind::Role => self.decode_role()?,
                SymbolKind::Type => self.decode_type()?,
                SymbolKind::User => self.decode_user()?,
                SymbolKind::Boolean => self.decode_boolean()?,
                SymbolKind::Sensitivity => self.decode_sensitivity()?,
                SymbolKind::Category => self.decode_category()?,
            }
        }
        Ok(())
    }

    /// Decodes `count` permissions into `positions`, where permission value `v` occupies position
    /// `v - 1`. Values below `first_value` belong to an inherited common permission set.
    fn decode_permissions(
        &mut self,
        count: u32,
        first_value: u32,
        positions: &mut [Option<PermissionId>],
    ) -> Result<(), ParseError> {
        let materialize = self.materialize(DecodeOptions::PERMISSIONS);
        for _ in 0..count {
            let metadata = self.cursor.parse::<PermissionMetadata>()?;
            let name = self.cursor.read_string(metadata.length.get(), "permission name")?;
            let value = metadata.value.get();
            if value < first_value || value as usize > positions.len() {
                return Err(ParseError::CorruptValue { field: "permission", value });
            }
            if materialize {
                let slot = &mut positions[value as usize - 1];
                if slot.is_some() {
                    return Err(ParseError::DuplicateSymbol { category: "permission", name });
                }
                *slot = Some(self.image.add_permission(name));
            }
        }
        Ok(())
    }

    fn decode_common(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<CommonSymbolMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "common name")?;
        let value = metadata.value.get();
        self.remap.common_layouts.validate(value)?;

        let mut positions = allocate_permission_slots(metadata.primary_names_count.get())?;
        self.decode_permissions(metadata.count.get(), 1, &mut positions)?;

        if self.materialize(DecodeOptions::PERMISSIONS) {
            let id = self.image.add_common(CommonPermission {
                name: name.clone(),
                permissions: positions.iter().flatten().copied().collect(),
            });
            self.remap.commons.set(value, id)?;
        }
        if self.remap.common_values.insert(name.clone(), value).is_some() {
            return Err(ParseError::DuplicateSymbol { category: "common", name });
        }
        self.remap.common_layouts.set(value, PermissionLayout { name, positions })
    }

    fn decode_class(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<ClassMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "class name")?;
        let common_length = metadata.common_length.get();
        let common_name = if common_length > 0 {
            Some(self.cursor.read_string(common_length, "class common name")?)
        } else {
            None
        };
        let value = metadata.value.get();
        self.remap.class_layouts.validate(value)?;

        let permission_count = metadata.primary_names_count.get();
        let mut positions = allocate_permission_slots(permission_count)?;
        let mut common = None;
        let mut inherited_count = 0;
        if let Some(common_name) = common_name {
            let common_value = *self.remap.common_values.get(&common_name).ok_or_else(|| {
                ParseError::UndeclaredSymbol { category: "common", name: common_name.clone() }
            })?;
            let layout = self.remap.common_layouts.resolve_entry(common_value)?;
            if layout.positions.len() > positions.len() {
                return Err(ParseError::CorruptValue {
                    field: "class permission count",
                    value: permission_count,
                });
            }
            positions[..layout.positions.len()].clone_from_slice(&layout.positions);
            inherited_count = layout.permission_count();
            common = self.remap.commons.lookup(common_value)?;
        }
        self.decode_permissions(metadata.count.get(), inherited_count + 1, &mut positions)?;

        self.skip_constraints(metadata.constraint_count.get())?;
        if self.profile.has_validatetrans() {
            let validatetrans_count = self.cursor.parse_u32()?;
            self.skip_constraints(validatetrans_count)?;
        }

        if self.materialize(DecodeOptions::CLASSES) {
            let id = self.image.add_class(Class {
                name: name.clone(),
                common,
                permissions: positions[inherited_count as usize..]
                    .iter()
                    .flatten()
                    .copied()
                    .collect(),
            })?;
            self.remap.classes.set(value, id)?;
        }
        self.remap.class_layouts.set(value, PermissionLayout { name, positions })
    }

    /// Walks constraint expressions to stay aligned; their semantics are not modeled.
    fn skip_constraints(&mut self, count: u32) -> Result<(), ParseError> {
        for _ in 0..count {
            let constraint = self.cursor.parse::<ConstraintMetadata>()?;
            for _ in 0..constraint.expression_count.get() {
                let expression = self.cursor.parse::<ConstraintExpressionMetadata>()?;
                match expression.expression_type.get() {
                    CONSTRAINT_EXPRESSION_TYPE_NAMES => ExtensibleBitmap::skip(self.cursor)?,
                    CONSTRAINT_EXPRESSION_TYPE_NOT..=CONSTRAINT_EXPRESSION_TYPE_ATTRIBUTE => {}
                    value => {
                        return Err(ParseError::CorruptValue {
                            field: "constraint expression type",
                            value,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    fn decode_role(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<RoleMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "role name")?;
        // Dominance is not modeled.
        ExtensibleBitmap::skip(self.cursor)?;
        let types = ExtensibleBitmap::parse(self.cursor)?;
        let value = metadata.value.get();
        self.remap.roles.validate(value)?;

        if self.materialize(DecodeOptions::ROLES) {
            let id = self.image.add_role(Role { name, types: BTreeSet::new() })?;
            self.remap.roles.set(value, id)?;
            self.fixups.role_types.push((id, types));
        }
        Ok(())
    }

    fn decode_type(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<TypeMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "type name")?;
        let value = metadata.value.get();
        self.remap.types.validate(value)?;

        if !self.materialize(DecodeOptions::TYPES) {
            return Ok(());
        }
        if metadata.primary.get() == 0 {
            self.fixups.type_aliases.push((name, value));
            return Ok(());
        }

        let id = TypeId::new(self.image.types.len());
        if !self.image.add_type_name(&name, TypeName::Type(id)) {
            return Err(ParseError::DuplicateSymbol { category: "type", name });
        }
        self.image.types.push(Type { name, aliases: Vec::new(), attributes: BTreeSet::new() });
        self.remap.types.set(value, id)
    }

    fn decode_user(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<UserMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "user name")?;
        let roles = ExtensibleBitmap::parse(self.cursor)?;
        // Sensitivities and categories are declared after users, so levels stay raw for now.
        let levels = if self.profile.has_mls() {
            let range = self.decode_mls_range(true)?;
            let default_level = RawMlsLevel::parse(self.cursor)?;
            match range {
                Some(DecodedMlsRange::Raw(range)) => Some((range, default_level)),
                _ => None,
            }
        } else {
            None
        };
        let value = metadata.value.get();
        self.remap.users.validate(value)?;

        if !self.materialize(DecodeOptions::USERS) {
            return Ok(());
        }
        let roles = roles
            .ones()
            .map(|bit| self.remap.roles.resolve(bit + 1))
            .collect::<Result<BTreeSet<_>, _>>()?;
        let id = self.image.add_user(User { name, roles, default_level: None, range: None })?;
        self.remap.users.set(value, id)?;
        if let Some((range, default_level)) = levels {
            if self.materialize(DecodeOptions::MLS) {
                self.fixups.user_levels.push(UserLevels { user: id, range, default_level });
            }
        }
        Ok(())
    }

    fn decode_boolean(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<BooleanMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "boolean name")?;
        let value = metadata.value.get();
        self.remap.booleans.validate(value)?;
        let state = match metadata.state.get() {
            0 => false,
            1 => true,
            state => return Err(ParseError::CorruptValue { field: "boolean state", value: state }),
        };

        if self.materialize(DecodeOptions::BOOLEANS) {
            let id = self.image.add_boolean(Boolean { name, state })?;
            self.remap.booleans.set(value, id)?;
        }
        Ok(())
    }

    /// Decodes a sensitivity. The sensitivity value of its level is also its position in the
    /// dominance order.
    fn decode_sensitivity(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<SensitivityMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "sensitivity name")?;
        let level = RawMlsLevel::parse(self.cursor)?;
        let value = level.sensitivity;
        self.remap.sensitivities.validate(value)?;

        if !self.materialize(DecodeOptions::MLS) {
            return Ok(());
        }
        if metadata.is_alias.get() != 0 {
            self.fixups.sensitivity_aliases.push((name, value));
            return Ok(());
        }
        let id = self.image.add_sensitivity(Sensitivity {
            name,
            aliases: Vec::new(),
            dominance: value,
            categories: BTreeSet::new(),
        });
        self.remap.sensitivities.set(value, id)?;
        self.fixups.sensitivity_categories.push((id, level.categories));
        Ok(())
    }

    fn decode_category(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<CategoryMetadata>()?;
        let name = self.cursor.read_string(metadata.length.get(), "category name")?;
        let value = metadata.value.get();
        self.remap.categories.validate(value)?;

        if !self.materialize(DecodeOptions::MLS) {
            return Ok(());
        }
        if metadata.is_alias.get() != 0 {
            self.fixups.category_aliases.push((name, value));
            return Ok(());
        }
        let id = self.image.add_category(Category { name, aliases: Vec::new() });
        self.remap.categories.set(value, id)
    }

    /// Attaches the aliases and memberships that were buffered while the symbol tables they refer
    /// to were incomplete.
    pub(crate) fn attach_aliases_and_role_types(&mut self) -> Result<(), ParseError> {
        for (name, value) in std::mem::take(&mut self.fixups.type_aliases) {
            let id = self.remap.types.resolve(value)?;
            if !self.image.add_type_name(&name, TypeName::Alias(id)) {
                return Err(ParseError::DuplicateSymbol { category: "type", name });
            }
            self.image.types[id.index()].aliases.push(name);
        }

        let role_types = std::mem::take(&mut self.fixups.role_types);
        if self.materialize(DecodeOptions::TYPES) {
            for (role, types) in role_types {
                for bit in types.ones() {
                    let id = self.remap.types.resolve(bit + 1)?;
                    self.image.roles[role.index()].types.insert(id);
                }
            }
        }

        for (name, value) in std::mem::take(&mut self.fixups.sensitivity_aliases) {
            let id = self.remap.sensitivities.resolve(value)?;
            self.image.add_sensitivity_alias(id, name);
        }
        for (name, value) in std::mem::take(&mut self.fixups.category_aliases) {
            let id = self.remap.categories.resolve(value)?;
            self.image.add_category_alias(id, name);
        }
        for (sensitivity, categories) in std::mem::take(&mut self.fixups.sensitivity_categories) {
            for bit in categories.ones() {
                let id = self.remap.categories.resolve(bit + 1)?;
                self.image.sensitivities[sensitivity.index()].categories.insert(id);
            }
        }
        Ok(())
    }

    /// Decodes, for every type value, the bitmap of attribute values it belongs to.
    pub(crate) fn decode_type_attribute_map(&mut self) -> Result<(), ParseError> {
        for value in 1..=self.remap.types.size() {
            let attributes = ExtensibleBitmap::parse(self.cursor)?;
            if !self.materialize(DecodeOptions::TYPES) {
                continue;
            }
            let Some(type_id) = self.remap.types.lookup(value)? else {
                continue;
            };
            for bit in attributes.ones() {
                // Bits that name types, including the type itself, carry no attribute.
                let attribute =
                    match self.remap.resolve_type_ref(&self.profile, &mut self.image, bit + 1)? {
                        TypeRef::Attribute(attribute) => attribute,
                        TypeRef::Type(_) => continue,
                    };
                self.image.types[type_id.index()].attributes.insert(attribute);
                self.image.attributes[attribute.index()].types.insert(type_id);
            }
        }
        Ok(())
    }
}
