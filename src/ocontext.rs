// Copyright 2023 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::{
    error::ParseError,
    model::{
        FileType, FsUseBehavior, FsUseContext, GenfsContext, GenfsEntry, InitialSid,
        NetworkInterfaceContext, NodeContext, PortContext, Protocol,
    },
    options::DecodeOptions,
    parsed_policy::Decoder,
    INITIAL_SIDS_IDENTIFIERS,
};

use std::{
    io::Read,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};
use zerocopy::{little_endian as le, FromBytes, Immutable, KnownLayout, Unaligned};

/// Object context kinds, in the order in which their lists appear. Older policy versions carry
/// only a prefix of this list.
pub(crate) const OBJECT_CONTEXT_KIND_ISID: u32 = 0;
pub(crate) const OBJECT_CONTEXT_KIND_FS: u32 = 1;
pub(crate) const OBJECT_CONTEXT_KIND_PORT: u32 = 2;
pub(crate) const OBJECT_CONTEXT_KIND_NETIF: u32 = 3;
pub(crate) const OBJECT_CONTEXT_KIND_NODE: u32 = 4;
pub(crate) const OBJECT_CONTEXT_KIND_FSUSE: u32 = 5;
pub(crate) const OBJECT_CONTEXT_KIND_NODE6: u32 = 6;

/// IP protocol numbers of the transports that port contexts may name.
pub(crate) const PROTOCOL_TCP: u32 = 6;
pub(crate) const PROTOCOL_UDP: u32 = 17;

pub(crate) const FS_USE_XATTR: u32 = 1;
pub(crate) const FS_USE_TRANS: u32 = 2;
pub(crate) const FS_USE_TASK: u32 = 3;
pub(crate) const FS_USE_GENFS: u32 = 4;
pub(crate) const FS_USE_NONE: u32 = 5;

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct PortMetadata {
    protocol: le::U32,
    low_port: le::U32,
    high_port: le::U32,
}

/// Node addresses and masks are stored in network byte order.
#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct NodeMetadata {
    address: [u8; 4],
    mask: [u8; 4],
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct IPv6NodeMetadata {
    address: [u8; 16],
    mask: [u8; 16],
}

#[derive(Clone, Debug, FromBytes, Immutable, KnownLayout, PartialEq, Unaligned)]
#[repr(C, packed)]
pub(crate) struct FsUseMetadata {
    behavior: le::U32,
    length: le::U32,
}

fn protocol(value: u32) -> Result<Protocol, ParseError> {
    match value {
        PROTOCOL_TCP => Ok(Protocol::Tcp),
        PROTOCOL_UDP => Ok(Protocol::Udp),
        value => Err(ParseError::CorruptValue { field: "port protocol", value }),
    }
}

fn port(value: u32) -> Result<u16, ParseError> {
    u16::try_from(value).map_err(|_| ParseError::CorruptValue { field: "port", value })
}

fn fs_use_behavior(value: u32) -> Result<FsUseBehavior, ParseError> {
    match value {
        FS_USE_XATTR => Ok(FsUseBehavior::Xattr),
        FS_USE_TRANS => Ok(FsUseBehavior::Trans),
        FS_USE_TASK => Ok(FsUseBehavior::Task),
        FS_USE_GENFS => Ok(FsUseBehavior::Genfs),
        FS_USE_NONE => Ok(FsUseBehavior::None),
        value => Err(ParseError::CorruptValue { field: "fs_use behavior", value }),
    }
}

impl<R: Read> Decoder<'_, R> {
    /// Decodes the object context lists that the schema profile declares.
    pub(crate) fn decode_object_contexts(&mut self) -> Result<(), ParseError> {
        for kind in 0..self.profile.object_contexts_count() {
            let count = self.cursor.parse_u32()?;
            tracing::trace!(kind, count, "object contexts");
            for _ in 0..count {
                match kind {
                    OBJECT_CONTEXT_KIND_ISID => self.decode_initial_sid()?,
                    OBJECT_CONTEXT_KIND_FS => self.skip_filesystem_context()?,
                    OBJECT_CONTEXT_KIND_PORT => self.decode_port_context()?,
                    OBJECT_CONTEXT_KIND_NETIF => self.decode_network_interface_context()?,
                    OBJECT_CONTEXT_KIND_NODE => self.decode_node_context()?,
                    OBJECT_CONTEXT_KIND_FSUSE => self.decode_fs_use_context()?,
                    OBJECT_CONTEXT_KIND_NODE6 => self.decode_ipv6_node_context()?,
                    _ => {
                        return Err(ParseError::CorruptValue {
                            field: "object context kind",
                            value: kind,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    fn decode_initial_sid(&mut self) -> Result<(), ParseError> {
        let sid = self.cursor.parse_u32()?;
        let context = self.decode_context(self.materialize(DecodeOptions::INITIAL_SIDS))?;
        if let Some(context) = context {
            let name = INITIAL_SIDS_IDENTIFIERS.get(&sid).copied();
            self.image.initial_sids.push(InitialSid { sid, name, context });
        }
        Ok(())
    }

    /// Filesystem contexts are not modeled; the entry is consumed to stay aligned.
    fn skip_filesystem_context(&mut self) -> Result<(), ParseError> {
        let length = self.cursor.parse_u32()?;
        self.cursor.skip(length as u64, "filesystem name")?;
        self.decode_context(false)?;
        self.decode_context(false)?;
        Ok(())
    }

    fn decode_port_context(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<PortMetadata>()?;
        let protocol = protocol(metadata.protocol.get())?;
        let low_port = port(metadata.low_port.get())?;
        let high_port = port(metadata.high_port.get())?;
        let context = self.decode_context(self.materialize(DecodeOptions::OBJECT_CONTEXTS))?;
        if let Some(context) = context {
            self.image.ports.push(PortContext { protocol, low_port, high_port, context });
        }
        Ok(())
    }

    fn decode_network_interface_context(&mut self) -> Result<(), ParseError> {
        let length = self.cursor.parse_u32()?;
        let name = self.cursor.read_string(length, "network interface name")?;
        let materialize = self.materialize(DecodeOptions::OBJECT_CONTEXTS);
        let interface_context = self.decode_context(materialize)?;
        let packet_context = self.decode_context(materialize)?;
        if let (Some(interface_context), Some(packet_context)) = (interface_context, packet_context)
        {
            self.image.network_interfaces.push(NetworkInterfaceContext {
                name,
                interface_context,
                packet_context,
            });
        }
        Ok(())
    }

    fn decode_node_context(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<NodeMetadata>()?;
        let context = self.decode_context(self.materialize(DecodeOptions::OBJECT_CONTEXTS))?;
        if let Some(context) = context {
            self.image.nodes.push(NodeContext {
                address: IpAddr::V4(Ipv4Addr::from(metadata.address)),
                mask: IpAddr::V4(Ipv4Addr::from(metadata.mask)),
                context,
            });
        }
        Ok(())
    }

    fn decode_ipv6_node_context(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<IPv6NodeMetadata>()?;
        let context = self.decode_context(self.materialize(DecodeOptions::OBJECT_CONTEXTS))?;
        if let Some(context) = context {
            self.image.nodes.push(NodeContext {
                address: IpAddr::V6(Ipv6Addr::from(metadata.address)),
                mask: IpAddr::V6(Ipv6Addr::from(metadata.mask)),
                context,
            });
        }
        Ok(())
    }

    fn decode_fs_use_context(&mut self) -> Result<(), ParseError> {
        let metadata = self.cursor.parse::<FsUseMetadata>()?;
        let behavior = fs_use_behavior(metadata.behavior.get())?;
        let filesystem = self.cursor.read_string(metadata.length.get(), "fs_use filesystem")?;
        let context = self.decode_context(self.materialize(DecodeOptions::OBJECT_CONTEXTS))?;
        if let Some(context) = context {
            self.image.fs_uses.push(FsUseContext { behavior, filesystem, context });
        }
        Ok(())
    }

    /// Decodes the generic filesystem contexts: per filesystem type, a list of path prefixes with
    /// the file type and context each applies to.
    pub(crate) fn decode_genfs_contexts(&mut self) -> Result<(), ParseError> {
        let materialize = self.materialize(DecodeOptions::OBJECT_CONTEXTS);
        let count = self.cursor.parse_u32()?;
        tracing::trace!(count, "genfs contexts");
        for _ in 0..count {
            let length = self.cursor.parse_u32()?;
            let filesystem = self.cursor.read_string(length, "genfs filesystem")?;
            let entry_count = self.cursor.parse_u32()?;
            let mut entries = Vec::new();
            for _ in 0..entry_count {
                let length = self.cursor.parse_u32()?;
                let path = self.cursor.read_string(length, "genfs path")?;
                let class = self.cursor.parse_u32()?;
                let file_type = self.genfs_file_type(class)?;
                if let Some(context) = self.decode_context(materialize)? {
                    entries.push(GenfsEntry { path, file_type, context });
                }
            }
            if materialize {
                self.image.genfs.push(GenfsContext { filesystem, entries });
            }
        }
        Ok(())
    }

    /// Maps the class value of a genfs path entry to the file type it applies to; zero applies to
    /// every file type.
    fn genfs_file_type(&self, class: u32) -> Result<FileType, ParseError> {
        if class == 0 {
            return Ok(FileType::Any);
        }
        let layout = self.remap.class_layouts.resolve_entry(class)?;
        FileType::for_class_name(&layout.name)
            .ok_or(ParseError::CorruptValue { field: "genfs file type", value: class })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        model::{RoleId, TypeId, UserId},
        parser::ByteCursor,
        remap::PermissionLayout,
        testing::{decoder_for_test, PolicyWriter},
    };

    fn populate(decoder: &mut Decoder<'_, &[u8]>) {
        decoder.remap.users.allocate(1);
        decoder.remap.users.set(1, UserId::new(0)).expect("set");
        decoder.remap.roles.allocate(1);
        decoder.remap.roles.set(1, RoleId::new(0)).expect("set");
        decoder.remap.types.allocate(2);
        decoder.remap.types.set(1, TypeId::new(0)).expect("set");
        decoder.remap.types.set(2, TypeId::new(1)).expect("set");
        decoder.remap.class_layouts.allocate(2);
        for (value, name) in [(1, "file"), (2, "process")] {
            decoder
                .remap
                .class_layouts
                .set(value, PermissionLayout { name: name.to_string(), positions: Vec::new() })
                .expect("set");
        }
    }

    fn object_contexts_v17() -> Vec<u8> {
        PolicyWriter::new()
            .u32(2) // initial SIDs
            .u32(1) // sid
            .context(1, 1, 1)
            .u32(99) // sid
            .context(1, 1, 2)
            .u32(1) // filesystems
            .u32(9) // name length
            .str("selinuxfs")
            .context(1, 1, 1)
            .context(1, 1, 1)
            .u32(1) // ports
            .u32(PROTOCOL_TCP) // protocol
            .u32(80) // low port
            .u32(8080) // high port
            .context(1, 1, 2)
            .u32(1) // network interfaces
            .u32(4) // name length
            .str("eth0")
            .context(1, 1, 1)
            .context(1, 1, 2)
            .u32(1) // nodes
            .bytes(&[10, 0, 0, 1]) // address
            .bytes(&[255, 255, 255, 0]) // mask
            .context(1, 1, 1)
            .u32(1) // fs_use
            .u32(FS_USE_XATTR) // behavior
            .u32(4) // name length
            .str("ext4")
            .context(1, 1, 2)
            .u32(1) // IPv6 nodes
            .bytes(&Ipv6Addr::LOCALHOST.octets()) // address
            .bytes(&[0xff; 16]) // mask
            .context(1, 1, 1)
            .into_bytes()
    }

    #[test]
    fn object_contexts_of_every_kind() {
        let bytes = object_contexts_v17();
        let mut cursor = ByteCursor::new(bytes.as_slice());
        let mut decoder = decoder_for_test(&mut cursor, 17, false, DecodeOptions::all());
        populate(&mut decoder);
        decoder.decode_object_contexts().expect("object contexts");
        assert_eq!(bytes.len() as u64, decoder.cursor.position());

        let image = &decoder.image;
        assert_eq!(2, image.initial_sids().len());
        assert_eq!(Some("kernel"), image.initial_sids()[0].name);
        assert_eq!(None, image.initial_sids()[1].name);
        assert_eq!(TypeId::new(1), image.initial_sids()[1].context.type_);

        let port = &image.ports()[0];
        assert_eq!((Protocol::Tcp, 80, 8080), (port.protocol, port.low_port, port.high_port));

        assert_eq!("eth0", image.network_interfaces()[0].name);
        assert_eq!(TypeId::new(1), image.network_interfaces()[0].packet_context.type_);

        let nodes = image.nodes();
        assert_eq!(2, nodes.len());
        assert_eq!(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), nodes[0].address);
        assert_eq!(IpAddr::V4(Ipv4Addr::new(255, 255, 255, 0)), nodes[0].mask);
        assert_eq!(IpAddr::V6(Ipv6Addr::LOCALHOST), nodes[1].address);

        let fs_use = &image.fs_uses()[0];
        assert_eq!((FsUseBehavior::Xattr, "ext4"), (fs_use.behavior, fs_use.filesystem.as_str()));
    }

    #[test]
    fn unmaterialized_object_contexts_consume_the_same_bytes() {
        let bytes = object_contexts_v17();
        let mut cursor = ByteCursor::new(bytes.as_slice());
        let mut decoder = decoder_for_test(&mut cursor, 17, false, DecodeOptions::empty());
        populate(&mut decoder);
        decoder.decode_object_contexts().expect("object contexts");
        assert_eq!(bytes.len() as u64, decoder.cursor.position());
        assert!(decoder.image.initial_sids().is_empty());
        assert!(decoder.image.nodes().is_empty());
    }

    #[test]
    fn older_profiles_have_no_ipv6_nodes() {
        let bytes = PolicyWriter::new()
            .u32(1) // initial SIDs
            .u32(2) // sid
            .context(1, 1, 1)
            .u32(0) // filesystems
            .u32(0) // ports
            .u32(0) // network interfaces
            .u32(0) // nodes
            .u32(0) // fs_use
            .into_bytes();
        let mut cursor = ByteCursor::new(bytes.as_slice());
        let mut decoder = decoder_for_test(&mut cursor, 16, false, DecodeOptions::all());
        populate(&mut decoder);
        decoder.decode_object_contexts().expect("object contexts");
        assert_eq!(bytes.len() as u64, decoder.cursor.position());
        assert_eq!(Some("security"), decoder.image.initial_sids()[0].name);
    }

    #[test]
    fn mls_contexts_carry_a_range() {
        let bytes = PolicyWriter::new()
            .u32(1) // initial SIDs
            .u32(1) // sid
            .context(1, 1, 1)
            .mls_range_single(1, &[])
            .u32(0) // filesystems
            .u32(0) // ports
            .u32(0) // network interfaces
            .u32(0) // nodes
            .u32(0) // fs_use
            .u32(0) // IPv6 nodes
            .into_bytes();
        let mut cursor = ByteCursor::new(bytes.as_slice());
        let mut decoder = decoder_for_test(&mut cursor, 19, true, DecodeOptions::all());
        populate(&mut decoder);
        decoder.remap.sensitivities.allocate(1);
        decoder.remap.sensitivities.set(1, crate::model::SensitivityId::new(0)).expect("set");
        decoder.decode_object_contexts().expect("object contexts");

        let range = decoder.image.initial_sids()[0].context.range.clone().expect("range");
        assert_eq!(range.low, range.high);
        assert!(range.low.categories.is_empty());
    }

    #[test]
    fn invalid_port_contexts() {
        for (protocol, low_port, expected) in [
            (1, 80, ParseError::CorruptValue { field: "port protocol", value: 1 }),
            (PROTOCOL_UDP, 70000, ParseError::CorruptValue { field: "port", value: 70000 }),
        ] {
            let bytes = PolicyWriter::new()
                .u32(0) // initial SIDs
                .u32(0) // filesystems
                .u32(1) // ports
                .u32(protocol) // protocol
                .u32(low_port) // low port
                .u32(low_port) // high port
                .context(1, 1, 1)
                .into_bytes();
            let mut cursor = ByteCursor::new(bytes.as_slice());
            let mut decoder = decoder_for_test(&mut cursor, 15, false, DecodeOptions::all());
            populate(&mut decoder);
            assert_eq!(Err(expected), decoder.decode_object_contexts());
        }
    }

    #[test]
    fn port_context_naming_no_user_is_corrupt_when_not_stored() {
        for options in
            [DecodeOptions::all(), DecodeOptions::all().difference(DecodeOptions::OBJECT_CONTEXTS)]
        {
            let bytes = PolicyWriter::new()
                .u32(0) // initial SIDs
                .u32(0) // filesystems
                .u32(1) // ports
                .u32(PROTOCOL_TCP) // protocol
                .u32(80) // low port
                .u32(80) // high port
                .context(7, 1, 1)
                .into_bytes();
            let mut cursor = ByteCursor::new(bytes.as_slice());
            let mut decoder = decoder_for_test(&mut cursor, 15, false, options);
            populate(&mut decoder);
            assert_eq!(
                Err(ParseError::CorruptValue { field: "user", value: 7 }),
                decoder.decode_object_contexts()
            );
        }
    }

    #[test]
    fn invalid_fs_use_behavior() {
        let bytes = PolicyWriter::new()
            .u32(0) // initial SIDs
            .u32(0) // filesystems
            .u32(0) // ports
            .u32(0) // network interfaces
            .u32(0) // nodes
            .u32(1) // fs_use
            .u32(6) // behavior
            .u32(4) // name length
            .str("ext4")
            .context(1, 1, 1)
            .into_bytes();
        let mut cursor = ByteCursor::new(bytes.as_slice());
        let mut decoder = decoder_for_test(&mut cursor, 15, false, DecodeOptions::all());
        populate(&mut decoder);
        assert_eq!(
            Err(ParseError::CorruptValue { field: "fs_use behavior", value: 6 }),
            decoder.decode_object_contexts()
        );
    }

    #[test]
    fn genfs_file_types() {
        let bytes = PolicyWriter::new()
            .u32(1) // filesystems
            .u32(4) // name length
            .str("proc")
            .u32(2) // paths
            .u32(1) // path length
            .str("/")
            .u32(0) // class
            .context(1, 1, 1)
            .u32(4) // path length
            .str("/net")
            .u32(1) // class
            .context(1, 1, 2)
            .into_bytes();
        let mut cursor = ByteCursor::new(bytes.as_slice());
        let mut decoder = decoder_for_test(&mut cursor, 18, false, DecodeOptions::all());
        populate(&mut decoder);
        decoder.decode_genfs_contexts().expect("genfs");
        assert_eq!(bytes.len() as u64, decoder.cursor.position());

        let genfs = &decoder.image.genfs()[0];
        assert_eq!("proc", genfs.filesystem);
        let entries: Vec<_> =
            genfs.entries.iter().map(|entry| (entry.path.as_str(), entry.file_type)).collect();
        assert_eq!(vec![("/", FileType::Any), ("/net", FileType::Regular)], entries);
    }

    #[test]
    fn genfs_class_must_label_files() {
        for (class, expected) in [
            (2, ParseError::CorruptValue { field: "genfs file type", value: 2 }),
            (3, ParseError::CorruptValue { field: "class", value: 3 }),
        ] {
            let bytes = PolicyWriter::new()
                .u32(1) // filesystems
                .u32(4) // name length
                .str("proc")
                .u32(1) // paths
                .u32(1) // path length
                .str("/")
                .u32(class) // class
                .context(1, 1, 1)
                .into_bytes();
            let mut cursor = ByteCursor::new(bytes.as_slice());
            let mut decoder = decoder_for_test(&mut cursor, 18, false, DecodeOptions::all());
            populate(&mut decoder);
            assert_eq!(Err(expected), decoder.decode_genfs_contexts());
        }
    }
}
