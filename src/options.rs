// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use bitflags::bitflags;

bitflags! {
    /// Selects which parts of a binary policy are materialized into the decoded
    /// [`crate::PolicyImage`]. Parts that are not selected are still fully decoded, so that the
    /// stream stays aligned and corrupt data is still detected, but their results are discarded.
    ///
    /// Decoding first applies [`DecodeOptions::with_dependencies`]: selecting a rule or context
    /// category also selects the symbol categories it refers to, even ones the caller cleared.
    /// `AV_RULES.difference(TYPES)` therefore still materializes types.
    ///
    /// Rules of a conditional branch are stored with the unconditional rules, in
    /// [`crate::PolicyImage::access_vector_rules`] and [`crate::PolicyImage::type_rules`], and
    /// their [`crate::ConditionalPolicy`] refers to them by id. Selecting `COND_RULES` alone
    /// therefore still fills those lists.
    #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
    pub struct DecodeOptions: u32 {
        const CLASSES = 1 << 0;
        const PERMISSIONS = 1 << 1;
        const TYPES = 1 << 2;
        const ROLES = 1 << 3;
        const USERS = 1 << 4;
        const BOOLEANS = 1 << 5;
        /// Sensitivities, categories and every MLS level or range that refers to them.
        const MLS = 1 << 6;
        /// allow, auditallow and dontaudit rules.
        const AV_RULES = 1 << 7;
        /// type_transition, type_member and type_change rules.
        const TYPE_RULES = 1 << 8;
        const COND_EXPRESSIONS = 1 << 9;
        /// Rules that belong to the true or false branch of a conditional. They are stored in
        /// the image's global rule lists, marked with their `enabled` state.
        const COND_RULES = 1 << 10;
        /// role_transition and role allow rules.
        const ROLE_RULES = 1 << 11;
        const INITIAL_SIDS = 1 << 12;
        /// Port, network interface, node, fs_use and genfs contexts.
        const OBJECT_CONTEXTS = 1 << 13;
        const RANGE_TRANSITIONS = 1 << 14;

        const SYMBOLS = Self::CLASSES.bits()
            | Self::PERMISSIONS.bits()
            | Self::TYPES.bits()
            | Self::ROLES.bits()
            | Self::USERS.bits()
            | Self::BOOLEANS.bits()
            | Self::MLS.bits();
        const TE_RULES = Self::AV_RULES.bits() | Self::TYPE_RULES.bits();
        const CONDITIONALS = Self::COND_EXPRESSIONS.bits() | Self::COND_RULES.bits();
    }
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self::all()
    }
}

impl DecodeOptions {
    /// Returns these options extended with every symbol category that the selected rules and
    /// contexts refer to.
    pub fn with_dependencies(self) -> Self {
        let mut options = self;
        if options.intersects(Self::TE_RULES | Self::COND_RULES) {
            options |= Self::TYPES | Self::CLASSES | Self::PERMISSIONS;
        }
        if options.contains(Self::ROLE_RULES) {
            options |= Self::ROLES | Self::TYPES;
        }
        if options.contains(Self::RANGE_TRANSITIONS) {
            options |= Self::TYPES | Self::MLS;
        }
        if options.intersects(Self::INITIAL_SIDS | Self::OBJECT_CONTEXTS) {
            options |= Self::USERS | Self::ROLES | Self::TYPES;
        }
        if options.contains(Self::USERS) {
            options |= Self::ROLES;
        }
        options
    }
}
