// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{error::ParseError, metadata::SchemaProfile};

use std::{
    collections::{BTreeMap, BTreeSet},
    net::IpAddr,
};

macro_rules! policy_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
        pub struct $name(u32);

        impl $name {
            pub(crate) fn new(index: usize) -> Self {
                Self(index as u32)
            }

            /// Returns the position of the identified entry in its [`PolicyImage`] collection.
            pub fn index(&self) -> usize {
                self.0 as usize
            }
        }
    };
}

policy_id!(
    /// Identifies a [`Permission`].
    PermissionId
);
policy_id!(
    /// Identifies a [`CommonPermission`].
    CommonId
);
policy_id!(
    /// Identifies a [`Class`].
    ClassId
);
policy_id!(
    /// Identifies a [`Role`].
    RoleId
);
policy_id!(
    /// Identifies a [`Type`].
    TypeId
);
policy_id!(
    /// Identifies an [`Attribute`].
    AttributeId
);
policy_id!(
    /// Identifies a [`User`].
    UserId
);
policy_id!(
    /// Identifies a [`Boolean`].
    BooleanId
);
policy_id!(
    /// Identifies a [`Sensitivity`].
    SensitivityId
);
policy_id!(
    /// Identifies a [`Category`].
    CategoryId
);
policy_id!(
    /// Identifies an [`AccessVectorRule`].
    AccessVectorRuleId
);
policy_id!(
    /// Identifies a [`TypeRule`].
    TypeRuleId
);

/// The source or target of a rule, which may name either a concrete type or an attribute.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TypeRef {
    Type(TypeId),
    Attribute(AttributeId),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Permission {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommonPermission {
    pub name: String,
    /// Permissions in bit position order.
    pub permissions: Vec<PermissionId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Class {
    pub name: String,
    pub common: Option<CommonId>,
    /// Permissions declared by the class itself, in bit position order.
    pub permissions: Vec<PermissionId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Role {
    pub name: String,
    pub types: BTreeSet<TypeId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Type {
    pub name: String,
    pub aliases: Vec<String>,
    pub attributes: BTreeSet<AttributeId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub types: BTreeSet<TypeId>,
    /// Whether the name was generated during decoding because the policy format carries no
    /// attribute names.
    pub synthesized: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub name: String,
    pub roles: BTreeSet<RoleId>,
    pub default_level: Option<MlsLevel>,
    pub range: Option<MlsRange>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Boolean {
    pub name: String,
    /// Initial truth value.
    pub state: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Sensitivity {
    pub name: String,
    pub aliases: Vec<String>,
    /// Position in the dominance order; higher values dominate lower ones.
    pub dominance: u32,
    /// Categories that may be combined with this sensitivity.
    pub categories: BTreeSet<CategoryId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Category {
    pub name: String,
    pub aliases: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MlsLevel {
    pub sensitivity: SensitivityId,
    pub categories: BTreeSet<CategoryId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MlsRange {
    pub low: MlsLevel,
    pub high: MlsLevel,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SecurityContext {
    pub user: UserId,
    pub role: RoleId,
    pub type_: TypeId,
    /// Present only when the policy enables MLS.
    pub range: Option<MlsRange>,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum AccessVectorRuleKind {
    Allow,
    AuditAllow,
    DontAudit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AccessVectorRule {
    pub kind: AccessVectorRuleKind,
    pub source: TypeRef,
    pub target: TypeRef,
    pub class: ClassId,
    pub permissions: BTreeSet<PermissionId>,
    pub enabled: bool,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum TypeRuleKind {
    Transition,
    Member,
    Change,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeRule {
    pub kind: TypeRuleKind,
    pub source: TypeRef,
    pub target: TypeRef,
    pub class: ClassId,
    pub default_type: TypeId,
    pub enabled: bool,
}

/// One node of a conditional expression, in postfix order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ConditionalExpressionNode {
    Boolean(BooleanId),
    Not,
    Or,
    And,
    Xor,
    Equal,
    NotEqual,
}

/// Rules that belong to one branch of a [`ConditionalPolicy`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleList {
    pub access_vector_rules: Vec<AccessVectorRuleId>,
    pub type_rules: Vec<TypeRuleId>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConditionalPolicy {
    pub expression: Vec<ConditionalExpressionNode>,
    /// Cached result of the expression for the initial boolean values.
    pub state: bool,
    pub true_rules: RuleList,
    pub false_rules: RuleList,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoleTransition {
    pub source_role: RoleId,
    pub target: TypeRef,
    pub new_role: RoleId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoleAllow {
    pub source_role: RoleId,
    pub target_role: RoleId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RangeTransition {
    pub source: TypeRef,
    pub target: TypeRef,
    pub range: MlsRange,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InitialSid {
    pub sid: u32,
    /// Well-known kernel name of `sid`, if any.
    pub name: Option<&'static str>,
    pub context: SecurityContext,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PortContext {
    pub protocol: Protocol,
    pub low_port: u16,
    pub high_port: u16,
    pub context: SecurityContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkInterfaceContext {
    pub name: String,
    pub interface_context: SecurityContext,
    pub packet_context: SecurityContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeContext {
    pub address: IpAddr,
    pub mask: IpAddr,
    pub context: SecurityContext,
}

#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum FsUseBehavior {
    Xattr,
    Trans,
    Task,
    Genfs,
    None,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FsUseContext {
    pub behavior: FsUseBehavior,
    pub filesystem: String,
    pub context: SecurityContext,
}

/// The kind of file a genfs path entry applies to.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum FileType {
    Any,
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Socket,
    Fifo,
}

impl FileType {
    /// Returns the file type labeled by objects of the class named `class_name`.
    pub(crate) fn for_class_name(class_name: &str) -> Option<Self> {
        match class_name {
            "file" => Some(Self::Regular),
            "dir" => Some(Self::Directory),
            "lnk_file" => Some(Self::Symlink),
            "chr_file" => Some(Self::CharDevice),
            "blk_file" => Some(Self::BlockDevice),
            "sock_file" => Some(Self::Socket),
            "fifo_file" => Some(Self::Fifo),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenfsEntry {
    pub path: String,
    pub file_type: FileType,
    pub context: SecurityContext,
}

#[derive(Clone, Debug, PartialEq)]
pub struct GenfsContext {
    pub filesystem: String,
    pub entries: Vec<GenfsEntry>,
}

/// An entry in the shared namespace of types, type aliases and attributes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TypeName {
    Type(TypeId),
    Alias(TypeId),
    Attribute(AttributeId),
}

/// A decoded binary policy.
///
/// Every identifier stored inside an entry of a `PolicyImage` indexes a collection of the same
/// image.
#[derive(Clone, Debug)]
pub struct PolicyImage {
    pub(crate) profile: SchemaProfile,
    pub(crate) mls_enabled: bool,
    pub(crate) signature: String,

    pub(crate) permissions: Vec<Permission>,
    pub(crate) commons: Vec<CommonPermission>,
    pub(crate) classes: Vec<Class>,
    pub(crate) roles: Vec<Role>,
    pub(crate) types: Vec<Type>,
    pub(crate) attributes: Vec<Attribute>,
    pub(crate) users: Vec<User>,
    pub(crate) booleans: Vec<Boolean>,
    pub(crate) sensitivities: Vec<Sensitivity>,
    pub(crate) categories: Vec<Category>,

    pub(crate) access_vector_rules: Vec<AccessVectorRule>,
    pub(crate) type_rules: Vec<TypeRule>,
    pub(crate) conditionals: Vec<ConditionalPolicy>,
    pub(crate) role_transitions: Vec<RoleTransition>,
    pub(crate) role_allows: Vec<RoleAllow>,
    pub(crate) range_transitions: Vec<RangeTransition>,

    pub(crate) initial_sids: Vec<InitialSid>,
    pub(crate) ports: Vec<PortContext>,
    pub(crate) network_interfaces: Vec<NetworkInterfaceContext>,
    pub(crate) nodes: Vec<NodeContext>,
    pub(crate) fs_uses: Vec<FsUseContext>,
    pub(crate) genfs: Vec<GenfsContext>,

    pub(crate) permission_names: BTreeMap<String, PermissionId>,
    pub(crate) type_names: BTreeMap<String, TypeName>,
    pub(crate) class_names: BTreeMap<String, ClassId>,
    pub(crate) role_names: BTreeMap<String, RoleId>,
    pub(crate) user_names: BTreeMap<String, UserId>,
    pub(crate) boolean_names: BTreeMap<String, BooleanId>,
    /// Names of common permission sets, sensitivities, categories and their aliases.
    pub(crate) other_names: BTreeSet<String>,
}

impl PolicyImage {
    pub(crate) fn new(profile: SchemaProfile, mls_enabled: bool, signature: String) -> Self {
        Self {
            profile,
            mls_enabled,
            signature,
            permissions: Vec::new(),
            commons: Vec::new(),
            classes: Vec::new(),
            roles: Vec::new(),
            types: Vec::new(),
            attributes: Vec::new(),
            users: Vec::new(),
            booleans: Vec::new(),
            sensitivities: Vec::new(),
            categories: Vec::new(),
            access_vector_rules: Vec::new(),
            type_rules: Vec::new(),
            conditionals: Vec::new(),
            role_transitions: Vec::new(),
            role_allows: Vec::new(),
            range_transitions: Vec::new(),
            initial_sids: Vec::new(),
            ports: Vec::new(),
            network_interfaces: Vec::new(),
            nodes: Vec::new(),
            fs_uses: Vec::new(),
            genfs: Vec::new(),
            permission_names: BTreeMap::new(),
            type_names: BTreeMap::new(),
            class_names: BTreeMap::new(),
            role_names: BTreeMap::new(),
            user_names: BTreeMap::new(),
            boolean_names: BTreeMap::new(),
            other_names: BTreeSet::new(),
        }
    }

    /// Returns the policy format version.
    pub fn version(&self) -> u32 {
        self.profile.version()
    }

    /// Returns the capabilities of this policy's format version.
    pub fn profile(&self) -> &SchemaProfile {
        &self.profile
    }

    /// Whether the policy enables multi-level security.
    pub fn mls_enabled(&self) -> bool {
        self.mls_enabled
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn permissions(&self) -> &[Permission] {
        &self.permissions
    }

    pub fn commons(&self) -> &[CommonPermission] {
        &self.commons
    }

    pub fn classes(&self) -> &[Class] {
        &self.classes
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn types(&self) -> &[Type] {
        &self.types
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn booleans(&self) -> &[Boolean] {
        &self.booleans
    }

    pub fn sensitivities(&self) -> &[Sensitivity] {
        &self.sensitivities
    }

    pub fn categories(&self) -> &[Category] {
        &self.categories
    }

    pub fn access_vector_rules(&self) -> &[AccessVectorRule] {
        &self.access_vector_rules
    }

    pub fn type_rules(&self) -> &[TypeRule] {
        &self.type_rules
    }

    pub fn conditionals(&self) -> &[ConditionalPolicy] {
        &self.conditionals
    }

    pub fn role_transitions(&self) -> &[RoleTransition] {
        &self.role_transitions
    }

    pub fn role_allows(&self) -> &[RoleAllow] {
        &self.role_allows
    }

    pub fn range_transitions(&self) -> &[RangeTransition] {
        &self.range_transitions
    }

    pub fn initial_sids(&self) -> &[InitialSid] {
        &self.initial_sids
    }

    pub fn ports(&self) -> &[PortContext] {
        &self.ports
    }

    pub fn network_interfaces(&self) -> &[NetworkInterfaceContext] {
        &self.network_interfaces
    }

    pub fn nodes(&self) -> &[NodeContext] {
        &self.nodes
    }

    pub fn fs_uses(&self) -> &[FsUseContext] {
        &self.fs_uses
    }

    pub fn genfs(&self) -> &[GenfsContext] {
        &self.genfs
    }

    pub fn permission(&self, id: PermissionId) -> &Permission {
        &self.permissions[id.index()]
    }

    pub fn class(&self, id: ClassId) -> &Class {
        &self.classes[id.index()]
    }

    pub fn role(&self, id: RoleId) -> &Role {
        &self.roles[id.index()]
    }

    pub fn type_(&self, id: TypeId) -> &Type {
        &self.types[id.index()]
    }

    pub fn attribute(&self, id: AttributeId) -> &Attribute {
        &self.attributes[id.index()]
    }

    pub fn user(&self, id: UserId) -> &User {
        &self.users[id.index()]
    }

    pub fn sensitivity(&self, id: SensitivityId) -> &Sensitivity {
        &self.sensitivities[id.index()]
    }

    pub fn category(&self, id: CategoryId) -> &Category {
        &self.categories[id.index()]
    }

    /// Returns the name of the type or attribute that `type_ref` identifies.
    pub fn type_ref_name(&self, type_ref: TypeRef) -> &str {
        match type_ref {
            TypeRef::Type(id) => &self.type_(id).name,
            TypeRef::Attribute(id) => &self.attribute(id).name,
        }
    }

    /// Looks up `name` in the shared namespace of types, type aliases and attributes.
    pub fn find_type_name(&self, name: &str) -> Option<TypeName> {
        self.type_names.get(name).copied()
    }

    /// Returns the type named `name`, or aliased as `name`.
    pub fn find_type_by_name(&self, name: &str) -> Option<TypeId> {
        match self.find_type_name(name)? {
            TypeName::Type(id) | TypeName::Alias(id) => Some(id),
            TypeName::Attribute(_) => None,
        }
    }

    pub fn find_attribute_by_name(&self, name: &str) -> Option<AttributeId> {
        match self.find_type_name(name)? {
            TypeName::Attribute(id) => Some(id),
            _ => None,
        }
    }

    pub fn find_permission_by_name(&self, name: &str) -> Option<PermissionId> {
        self.permission_names.get(name).copied()
    }

    pub fn find_class_by_name(&self, name: &str) -> Option<ClassId> {
        self.class_names.get(name).copied()
    }

    pub fn find_role_by_name(&self, name: &str) -> Option<RoleId> {
        self.role_names.get(name).copied()
    }

    pub fn find_user_by_name(&self, name: &str) -> Option<UserId> {
        self.user_names.get(name).copied()
    }

    pub fn find_boolean_by_name(&self, name: &str) -> Option<BooleanId> {
        self.boolean_names.get(name).copied()
    }

    /// Returns every permission of `class`, including those inherited from its common
    /// permission set.
    pub fn class_permissions(&self, class: ClassId) -> Vec<PermissionId> {
        let class = self.class(class);
        let inherited = class
            .common
            .iter()
            .flat_map(|common| self.commons[common.index()].permissions.iter().copied());
        inherited.chain(class.permissions.iter().copied()).collect()
    }

    /// Returns sensitivities from lowest to highest in the dominance order.
    pub fn sensitivities_by_dominance(&self) -> Vec<SensitivityId> {
        let mut sensitivities: Vec<_> =
            (0..self.sensitivities.len()).map(SensitivityId::new).collect();
        sensitivities.sort_by_key(|id| self.sensitivity(*id).dominance);
        sensitivities
    }

    /// Whether `name` is already used by any symbol of this policy.
    pub(crate) fn has_symbol_name(&self, name: &str) -> bool {
        self.type_names.contains_key(name)
            || self.permission_names.contains_key(name)
            || self.class_names.contains_key(name)
            || self.role_names.contains_key(name)
            || self.user_names.contains_key(name)
            || self.boolean_names.contains_key(name)
            || self.other_names.contains(name)
    }

    pub(crate) fn add_common(&mut self, common: CommonPermission) -> CommonId {
        let id = CommonId::new(self.commons.len());
        self.other_names.insert(common.name.clone());
        self.commons.push(common);
        id
    }

    pub(crate) fn add_class(&mut self, class: Class) -> Result<ClassId, ParseError> {
        let id = ClassId::new(self.classes.len());
        insert_name(&mut self.class_names, "class", &class.name, id)?;
        self.classes.push(class);
        Ok(id)
    }

    pub(crate) fn add_role(&mut self, role: Role) -> Result<RoleId, ParseError> {
        let id = RoleId::new(self.roles.len());
        insert_name(&mut self.role_names, "role", &role.name, id)?;
        self.roles.push(role);
        Ok(id)
    }

    pub(crate) fn add_user(&mut self, user: User) -> Result<UserId, ParseError> {
        let id = UserId::new(self.users.len());
        insert_name(&mut self.user_names, "user", &user.name, id)?;
        self.users.push(user);
        Ok(id)
    }

    pub(crate) fn add_boolean(&mut self, boolean: Boolean) -> Result<BooleanId, ParseError> {
        let id = BooleanId::new(self.booleans.len());
        insert_name(&mut self.boolean_names, "boolean", &boolean.name, id)?;
        self.booleans.push(boolean);
        Ok(id)
    }

    pub(crate) fn add_sensitivity(&mut self, sensitivity: Sensitivity) -> SensitivityId {
        let id = SensitivityId::new(self.sensitivities.len());
        self.other_names.insert(sensitivity.name.clone());
        self.sensitivities.push(sensitivity);
        id
    }

    pub(crate) fn add_category(&mut self, category: Category) -> CategoryId {
        let id = CategoryId::new(self.categories.len());
        self.other_names.insert(category.name.clone());
        self.categories.push(category);
        id
    }

    pub(crate) fn add_sensitivity_alias(&mut self, id: SensitivityId, alias: String) {
        self.other_names.insert(alias.clone());
        self.sensitivities[id.index()].aliases.push(alias);
    }

    pub(crate) fn add_category_alias(&mut self, id: CategoryId, alias: String) {
        self.other_names.insert(alias.clone());
        self.categories[id.index()].aliases.push(alias);
    }

    pub(crate) fn add_permission(&mut self, name: String) -> PermissionId {
        if let Some(id) = self.permission_names.get(&name) {
            return *id;
        }
        let id = PermissionId::new(self.permissions.len());
        self.permission_names.insert(name.clone(), id);
        self.permissions.push(Permission { name });
        id
    }

    pub(crate) fn add_type_name(&mut self, name: &str, entry: TypeName) -> bool {
        if self.type_names.contains_key(name) {
            return false;
        }
        self.type_names.insert(name.to_string(), entry);
        true
    }
}

/// Records `name` for `id` unless another symbol of the same category already uses it.
fn insert_name<T>(
    names: &mut BTreeMap<String, T>,
    category: &'static str,
    name: &str,
    id: T,
) -> Result<(), ParseError> {
    if names.contains_key(name) {
        return Err(ParseError::DuplicateSymbol { category, name: name.to_string() });
    }
    names.insert(name.to_string(), id);
    Ok(())
}
