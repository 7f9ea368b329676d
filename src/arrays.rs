// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    error::ParseError,
    model::{
        AccessVectorRule, AccessVectorRuleId, AccessVectorRuleKind, ConditionalExpressionNode,
        ConditionalPolicy, PermissionId, RangeTransition, RoleAllow, RoleTransition, RuleList,
        TypeRule, TypeRuleId, TypeRuleKind,
    },
    options::DecodeOptions,
    parsed_policy::Decoder,
    security_context::RawMlsRange,
    Parse,
};

use std::{collections::BTreeSet, io::Read};
use zerocopy::{little_endian as le, FromBytes, Immutable, KnownLayout, Unaligned};

pub(crate) const ACCESS_VECTOR_TYPE_ALLOWED_MASK: u16 = 0x0001;
pub(crate) const ACCESS_VECTOR_TYPE_AUDITALLOW_MASK: u16 = 0x0002;
pub(crate) const ACCESS_VECTOR_TYPE_AUDITDENY_MASK: u16 = 0x0004;
pub(crate) const ACCESS_VECTOR_TYPE_AV_MASK: u16 = 0x0007;
pub(crate) const ACCESS_VECTOR_TYPE_TRANSITION_MASK: u16 = 0x0010;
pub(crate) const ACCESS_VECTOR_TYPE_MEMBER_MASK: u16 = 0x0020;
pub(crate) const ACCESS_VECTOR_TYPE_CHANGE_MASK: u16 = 0x0040;
pub(crate) const ACCESS_VECTOR_TYPE_TYPE_MASK: u16 = 0x0070;
pub(crate) const ACCESS_VECTOR_TYPE_ENABLED_MASK: u16 = 0x8000;

/// Enabled bit of the "specified" field in access vector entries that predate the unified format.
pub(crate) const ACCESS_VECTOR_ENABLED_OLD_MASK: u32 = 0x8000_0000;

/// Order in which values follow the key of an access vector entry that predates the unified
/// format.
const ACCESS_VECTOR_VALUE_ORDER: [u16; 6] = [
    ACCESS_VECTOR_TYPE_ALLOWED_MASK,
    ACCESS_VECTOR_TYPE_AUDITDENY_MASK,
    ACCESS_VECTOR_TYPE_AUDITALLOW_MASK,
    ACCESS_VECTOR_TYPE_TRANSITION_MASK,
    ACCESS_VECTOR_TYPE_CHANGE_MASK,
    ACCESS_VECTOR_TYPE_MEMBER_MASK,
];

/// Bounds on the number of 32-bit items in an access vector entry that predates the unified
/// format: a four item key and one to six values.
const ACCESS_VECTOR_MIN_ITEMS: u32 = 5;
const ACCESS_VECTOR_MAX_ITEMS: u32 = 10;

pub(crate) const CONDITIONAL_NODE_TYPE_BOOLEAN: u32 = 1;
pub(crate) const CONDITIONAL_NODE_TYPE_NOT: u32 = 2;
pub(crate) const CONDITIONAL_NODE_TYPE_OR: u32 = 3;
pub(crate) const CONDITIONAL_NODE_TYPE_AND: u32 = 4;
pub(crate) const CONDITIONAL_NODE_TYPE_XOR: u32 = 5;
pub(crate) const CONDITIONAL_NODE_TYPE_EQUAL: u32 = 6;
pub(crate) const CONDITIONAL_NODE_TYPE_NOT_EQUAL: u32 = 7;

/// An access vector entry in the unified format, which carries exactly one value.
#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct AccessVector {
    source_type: le::U16,
    target_type: le::U16,
    class: le::U16,
    access_vector_type: le::U16,
    datum: le::U32,
}

/// One (key, kind, value) triple of an access vector table.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AccessVectorEntry {
    source_type: u32,
    target_type: u32,
    class: u32,
    /// Exactly one of the `ACCESS_VECTOR_TYPE_*` kind bits.
    kind: u16,
    datum: u32,
    enabled: bool,
}

/// Parses one access vector table entry, which may yield several entries in the format that
/// predates the unified one.
pub(crate) fn parse_access_vector<R: Read>(
    cursor: &mut crate::parser::ByteCursor<R>,
    unified: bool,
) -> Result<Vec<AccessVectorEntry>, ParseError> {
    if unified {
        let access_vector = cursor.parse::<AccessVector>()?;
        let specified = access_vector.access_vector_type.get();
        let kind = specified & !ACCESS_VECTOR_TYPE_ENABLED_MASK;
        let known_kinds = ACCESS_VECTOR_TYPE_AV_MASK | ACCESS_VECTOR_TYPE_TYPE_MASK;
        if kind & !known_kinds != 0 || kind.count_ones() != 1 {
            return Err(ParseError::CorruptValue {
                field: "access vector type",
                value: specified as u32,
            });
        }
        return Ok(vec![AccessVectorEntry {
            source_type: access_vector.source_type.get() as u32,
            target_type: access_vector.target_type.get() as u32,
            class: access_vector.class.get() as u32,
            kind,
            datum: access_vector.datum.get(),
            enabled: specified & ACCESS_VECTOR_TYPE_ENABLED_MASK != 0,
        }]);
    }

    let items_count = cursor.parse_u32()?;
    if !(ACCESS_VECTOR_MIN_ITEMS..=ACCESS_VECTOR_MAX_ITEMS).contains(&items_count) {
        return Err(ParseError::CorruptValue {
            field: "access vector item count",
            value: items_count,
        });
    }
    let items = cursor.parse_u32_array(items_count as usize)?;
    let (key, values) = items.split_at(4);
    let specified = key[3];
    let has_av = specified & ACCESS_VECTOR_TYPE_AV_MASK as u32 != 0;
    let has_type = specified & ACCESS_VECTOR_TYPE_TYPE_MASK as u32 != 0;
    if has_av && has_type {
        return Err(ParseError::CorruptValue { field: "access vector type", value: specified });
    }

    let enabled = specified & ACCESS_VECTOR_ENABLED_OLD_MASK != 0;
    let mut values = values.iter();
    let mut entries = Vec::new();
    for kind in ACCESS_VECTOR_VALUE_ORDER {
        if specified & kind as u32 == 0 {
            continue;
        }
        let datum = *values.next().ok_or(ParseError::CorruptValue {
            field: "access vector item count",
            value: items_count,
        })?;
        entries.push(AccessVectorEntry {
            source_type: key[0],
            target_type: key[1],
            class: key[2],
            kind,
            datum,
            enabled,
        });
    }
    if values.next().is_some() || entries.is_empty() {
        return Err(ParseError::CorruptValue {
            field: "access vector item count",
            value: items_count,
        });
    }
    Ok(entries)
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct ConditionalNodeMetadata {
    state: le::U32,
    count: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct ConditionalNodeDatum {
    node_type: le::U32,
    boolean: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RoleTransitionMetadata {
    role: le::U32,
    role_type: le::U32,
    new_role: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RoleAllowMetadata {
    role: le::U32,
    new_role: le::U32,
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct RangeTransitionMetadata {
    source_type: le::U32,
    target_type: le::U32,
}

impl<R: Read> Decoder<'_, R> {
    /// Decodes an access vector table. Rules are materialized according to `av_rules` and
    /// `type_rules`; materialized rules are also recorded in `list`, if given.
    pub(crate) fn decode_access_vector_table(
        &mut self,
        av_rules: bool,
        type_rules: bool,
        mut list: Option<&mut RuleList>,
    ) -> Result<(), ParseError> {
        let count = self.cursor.parse_u32()?;
        tracing::trace!(count, "access vector table");
        let unified = self.profile.unified_avtab_format();
        for _ in 0..count {
            for entry in parse_access_vector(self.cursor, unified)? {
                self.add_access_vector_entry(entry, av_rules, type_rules, list.as_deref_mut())?;
            }
        }
        Ok(())
    }

    fn add_access_vector_entry(
        &mut self,
        entry: AccessVectorEntry,
        av_rules: bool,
        type_rules: bool,
        list: Option<&mut RuleList>,
    ) -> Result<(), ParseError> {
        self.remap.types.validate(entry.source_type)?;
        self.remap.types.validate(entry.target_type)?;
        self.remap.class_layouts.validate(entry.class)?;

        let is_av = entry.kind & ACCESS_VECTOR_TYPE_AV_MASK != 0;
        if (is_av && !av_rules) || (!is_av && !type_rules) {
            return Ok(());
        }
        // Only rules of a conditional branch can be disabled.
        let enabled = list.is_none() || entry.enabled;

        let remap = &mut self.remap;
        let source = remap.resolve_type_ref(&self.profile, &mut self.image, entry.source_type)?;
        let target = remap.resolve_type_ref(&self.profile, &mut self.image, entry.target_type)?;
        let class = self.remap.classes.resolve(entry.class)?;

        if is_av {
            let (kind, mask) = match entry.kind {
                ACCESS_VECTOR_TYPE_ALLOWED_MASK => (AccessVectorRuleKind::Allow, entry.datum),
                ACCESS_VECTOR_TYPE_AUDITALLOW_MASK => {
                    (AccessVectorRuleKind::AuditAllow, entry.datum)
                }
                // Stored as the permissions that are denied without an audit record.
                _ => (AccessVectorRuleKind::DontAudit, !entry.datum),
            };
            let permissions = self.decode_permission_mask(entry.class, mask)?;
            let id = AccessVectorRuleId::new(self.image.access_vector_rules.len());
            self.image.access_vector_rules.push(AccessVectorRule {
                kind,
                source,
                target,
                class,
                permissions,
                enabled,
            });
            if let Some(list) = list {
                list.access_vector_rules.push(id);
            }
        } else {
            let kind = match entry.kind {
                ACCESS_VECTOR_TYPE_TRANSITION_MASK => TypeRuleKind::Transition,
                ACCESS_VECTOR_TYPE_MEMBER_MASK => TypeRuleKind::Member,
                _ => TypeRuleKind::Change,
            };
            let default_type = self.remap.types.resolve(entry.datum)?;
            let id = TypeRuleId::new(self.image.type_rules.len());
            self.image.type_rules.push(TypeRule {
                kind,
                source,
                target,
                class,
                default_type,
                enabled,
            });
            if let Some(list) = list {
                list.type_rules.push(id);
            }
        }
        Ok(())
    }

    /// Expands a permission bitmask of the class with value `class` through the class's
    /// permission positions.
    pub(crate) fn decode_permission_mask(
        &self,
        class: u32,
        mask: u32,
    ) -> Result<BTreeSet<PermissionId>, ParseError> {
        let layout = self.remap.class_layouts.resolve_entry(class)?;
        layout
            .positions
            .iter()
            .take(u32::BITS as usize)
            .enumerate()
            .filter(|(position, _)| mask & (1u32 << *position) != 0)
            .map(|(position, permission)| {
                (*permission).ok_or(ParseError::UnresolvedSymbol {
                    category: "permission",
                    value: position as u32 + 1,
                })
            })
            .collect()
    }

    /// Decodes the list of conditional policies, with their expressions and rule branches.
    pub(crate) fn decode_conditionals(&mut self) -> Result<(), ParseError> {
        let materialize_expressions = self.materialize(DecodeOptions::COND_EXPRESSIONS);
        let materialize_rules = self.materialize(DecodeOptions::COND_RULES);

        let count = self.cursor.parse_u32()?;
        for _ in 0..count {
            let metadata = self.cursor.parse::<ConditionalNodeMetadata>()?;
            let state = match metadata.state.get() {
                0 => false,
                1 => true,
                value => return Err(ParseError::CorruptValue { field: "conditional state", value }),
            };

            let mut expression = Vec::new();
            for _ in 0..metadata.count.get() {
                let datum = self.cursor.parse::<ConditionalNodeDatum>()?;
                let node = match datum.node_type.get() {
                    CONDITIONAL_NODE_TYPE_BOOLEAN => self
                        .remap
                        .booleans
                        .lookup(datum.boolean.get())?
                        .map(ConditionalExpressionNode::Boolean),
                    CONDITIONAL_NODE_TYPE_NOT => Some(ConditionalExpressionNode::Not),
                    CONDITIONAL_NODE_TYPE_OR => Some(ConditionalExpressionNode::Or),
                    CONDITIONAL_NODE_TYPE_AND => Some(ConditionalExpressionNode::And),
                    CONDITIONAL_NODE_TYPE_XOR => Some(ConditionalExpressionNode::Xor),
                    CONDITIONAL_NODE_TYPE_EQUAL => Some(ConditionalExpressionNode::Equal),
                    CONDITIONAL_NODE_TYPE_NOT_EQUAL => Some(ConditionalExpressionNode::NotEqual),
                    value => {
                        return Err(ParseError::CorruptValue {
                            field: "conditional expression type",
                            value,
                        })
                    }
                };
                // Nodes referring to booleans that were not materialized are dropped.
                if let Some(node) = node {
                    expression.push(node);
                }
            }

            let mut true_rules = RuleList::default();
            self.decode_access_vector_table(
                materialize_rules,
                materialize_rules,
                Some(&mut true_rules),
            )?;
            let mut false_rules = RuleList::default();
            self.decode_access_vector_table(
                materialize_rules,
                materialize_rules,
                Some(&mut false_rules),
            )?;

            if materialize_expressions || materialize_rules {
                if !materialize_expressions {
                    expression.clear();
                }
                self.image.conditionals.push(ConditionalPolicy {
                    expression,
                    state,
                    true_rules,
                    false_rules,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn decode_role_transitions(&mut self) -> Result<(), ParseError> {
        let materialize = self.materialize(DecodeOptions::ROLE_RULES);
        let count = self.cursor.parse_u32()?;
        for _ in 0..count {
            let metadata = self.cursor.parse::<RoleTransitionMetadata>()?;
            let role = metadata.role.get();
            let role_type = metadata.role_type.get();
            let new_role = metadata.new_role.get();
            self.remap.roles.validate(role)?;
            self.remap.types.validate(role_type)?;
            self.remap.roles.validate(new_role)?;
            if !materialize {
                continue;
            }

            let transition = RoleTransition {
                source_role: self.remap.roles.resolve(role)?,
                target: self.remap.resolve_type_ref(&self.profile, &mut self.image, role_type)?,
                new_role: self.remap.roles.resolve(new_role)?,
            };
            self.image.role_transitions.push(transition);
        }
        Ok(())
    }

    pub(crate) fn decode_role_allows(&mut self) -> Result<(), ParseError> {
        let materialize = self.materialize(DecodeOptions::ROLE_RULES);
        let count = self.cursor.parse_u32()?;
        for _ in 0..count {
            let metadata = self.cursor.parse::<RoleAllowMetadata>()?;
            let role = metadata.role.get();
            let new_role = metadata.new_role.get();
            self.remap.roles.validate(role)?;
            self.remap.roles.validate(new_role)?;
            if !materialize {
                continue;
            }

            self.image.role_allows.push(RoleAllow {
                source_role: self.remap.roles.resolve(role)?,
                target_role: self.remap.roles.resolve(new_role)?,
            });
        }
        Ok(())
    }

    pub(crate) fn decode_range_transitions(&mut self) -> Result<(), ParseError> {
        let materialize =
            self.materialize(DecodeOptions::RANGE_TRANSITIONS) && self.mls_materialized();
        let count = self.cursor.parse_u32()?;
        for _ in 0..count {
            let metadata = self.cursor.parse::<RangeTransitionMetadata>()?;
            let range = RawMlsRange::parse(self.cursor)?;
            let source_type = metadata.source_type.get();
            let target_type = metadata.target_type.get();
            self.remap.types.validate(source_type)?;
            self.remap.types.validate(target_type)?;
            if !materialize {
                continue;
            }

            let transition = RangeTransition {
                source: self.remap.resolve_type_ref(&self.profile, &mut self.image, source_type)?,
                target: self.remap.resolve_type_ref(&self.profile, &mut self.image, target_type)?,
                range: range.resolve(&self.remap)?,
            };
            self.image.range_transitions.push(transition);
        }
        Ok(())
    }
}
