// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Endpoint identities and metadata.

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use strum::Display;

use crate::ump::{Group, PacketProtocol};

#[cfg(test)]
mod tests;

/// Direction of data flow from the perspective of this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum IoKind {
    /// Data flows from the endpoint into this host.
    Src,
    /// Data flows from this host into the endpoint.
    Dst,
}

/// Identifies an endpoint by the native ids of its source and
/// destination side.
///
/// Bidirectional endpoints use the same id for both sides. Unidirectional
/// endpoints leave the other side empty.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EndpointId {
    src: String,
    dst: String,
}

impl EndpointId {
    #[must_use]
    pub fn new(src: impl Into<String>, dst: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
        }
    }

    #[must_use]
    pub fn bidirectional(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            src: id.clone(),
            dst: id,
        }
    }

    /// Only the side given by `kind` is populated.
    #[must_use]
    pub fn make(kind: IoKind, id: impl Into<String>) -> Self {
        match kind {
            IoKind::Src => Self::new(id, String::new()),
            IoKind::Dst => Self::new(String::new(), id),
        }
    }

    #[must_use]
    pub fn src(&self) -> &str {
        &self.src
    }

    #[must_use]
    pub fn dst(&self) -> &str {
        &self.dst
    }

    #[must_use]
    pub fn get(&self, kind: IoKind) -> &str {
        match kind {
            IoKind::Src => self.src(),
            IoKind::Dst => self.dst(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.src.is_empty() && self.dst.is_empty()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { src, dst } = self;
        if src == dst {
            f.write_str(src)
        } else {
            write!(f, "{src} | {dst}")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BlockDirection {
    #[default]
    Unknown,
    /// The block receives data from this host.
    Receiver,
    /// The block sends data to this host.
    Sender,
    Bidirectional,
}

impl BlockDirection {
    /// Whether data may flow in direction `kind` through the block.
    #[must_use]
    pub const fn supports(self, kind: IoKind) -> bool {
        matches!(
            (self, kind),
            (Self::Bidirectional, _) | (Self::Sender, IoKind::Src) | (Self::Receiver, IoKind::Dst)
        )
    }
}

/// Hint for presenting a block in a user interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum BlockUiHint {
    #[default]
    Unknown,
    Receiver,
    Sender,
    Bidirectional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum BlockMidi1ProxyKind {
    /// The block is not a proxy for a MIDI 1.0 port.
    #[default]
    Inapplicable,
    RestrictedBandwidth,
    UnrestrictedBandwidth,
}

/// Logical sub-port of an endpoint, spanning one or more groups.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub name: String,
    pub direction: BlockDirection,
    pub ui_hint: BlockUiHint,
    pub enabled: bool,
    pub first_group: u8,
    pub num_groups: u8,
    pub max_sysex8_streams: u8,
    pub midi1_proxy_kind: BlockMidi1ProxyKind,
}

impl Block {
    /// A single-group block that proxies a MIDI 1.0 port.
    #[must_use]
    pub fn legacy(name: impl Into<String>, direction: BlockDirection) -> Self {
        let ui_hint = match direction {
            BlockDirection::Receiver => BlockUiHint::Receiver,
            BlockDirection::Sender => BlockUiHint::Sender,
            BlockDirection::Bidirectional => BlockUiHint::Bidirectional,
            BlockDirection::Unknown => BlockUiHint::Unknown,
        };
        Self {
            name: name.into(),
            direction,
            ui_hint,
            enabled: true,
            first_group: 0,
            num_groups: 1,
            max_sysex8_streams: 0,
            midi1_proxy_kind: BlockMidi1ProxyKind::UnrestrictedBandwidth,
        }
    }

    #[must_use]
    pub fn contains_group(&self, group: Group) -> bool {
        let first = u16::from(self.first_group);
        let index = u16::from(group.index());
        (first..first + u16::from(self.num_groups)).contains(&index)
    }
}

/// Device identity as reported by the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceInfo {
    pub manufacturer: [u8; 3],
    pub family: [u8; 2],
    pub model: [u8; 2],
    pub revision: [u8; 4],
}

/// Describes an endpoint at the time of discovery.
///
/// Endpoints are replaced as a whole whenever the device reports an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    protocol: PacketProtocol,
    ump_version: (u8, u8),
    device_info: DeviceInfo,
    product_instance_id: String,
    midi1_support: bool,
    midi2_support: bool,
    blocks: Vec<Block>,
    static_blocks: bool,
    receive_jr_support: bool,
    transmit_jr_support: bool,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: PacketProtocol::Midi1,
            ump_version: (1, 1),
            device_info: DeviceInfo::default(),
            product_instance_id: String::new(),
            midi1_support: false,
            midi2_support: false,
            blocks: Vec::new(),
            static_blocks: false,
            receive_jr_support: false,
            transmit_jr_support: false,
        }
    }
}

impl Endpoint {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub const fn with_protocol(mut self, protocol: PacketProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn with_ump_version(mut self, major: u8, minor: u8) -> Self {
        self.ump_version = (major, minor);
        self
    }

    #[must_use]
    pub const fn with_device_info(mut self, device_info: DeviceInfo) -> Self {
        self.device_info = device_info;
        self
    }

    #[must_use]
    pub fn with_product_instance_id(mut self, product_instance_id: impl Into<String>) -> Self {
        self.product_instance_id = product_instance_id.into();
        self
    }

    #[must_use]
    pub const fn with_midi1_support(mut self, midi1_support: bool) -> Self {
        self.midi1_support = midi1_support;
        self
    }

    #[must_use]
    pub const fn with_midi2_support(mut self, midi2_support: bool) -> Self {
        self.midi2_support = midi2_support;
        self
    }

    #[must_use]
    pub fn with_blocks(mut self, blocks: impl IntoIterator<Item = Block>) -> Self {
        self.blocks = blocks.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn with_static_blocks(mut self, static_blocks: bool) -> Self {
        self.static_blocks = static_blocks;
        self
    }

    #[must_use]
    pub const fn with_receive_jr_support(mut self, receive_jr_support: bool) -> Self {
        self.receive_jr_support = receive_jr_support;
        self
    }

    #[must_use]
    pub const fn with_transmit_jr_support(mut self, transmit_jr_support: bool) -> Self {
        self.transmit_jr_support = transmit_jr_support;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn protocol(&self) -> PacketProtocol {
        self.protocol
    }

    #[must_use]
    pub const fn ump_version(&self) -> (u8, u8) {
        self.ump_version
    }

    #[must_use]
    pub const fn device_info(&self) -> &DeviceInfo {
        &self.device_info
    }

    #[must_use]
    pub fn product_instance_id(&self) -> &str {
        &self.product_instance_id
    }

    #[must_use]
    pub const fn has_midi1_support(&self) -> bool {
        self.midi1_support
    }

    #[must_use]
    pub const fn has_midi2_support(&self) -> bool {
        self.midi2_support
    }

    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Replaces the block at `index`.
    ///
    /// Returns `false` if no such block exists.
    pub fn set_block(&mut self, index: usize, block: Block) -> bool {
        let Some(existing) = self.blocks.get_mut(index) else {
            return false;
        };
        *existing = block;
        true
    }

    #[must_use]
    pub const fn has_static_blocks(&self) -> bool {
        self.static_blocks
    }

    #[must_use]
    pub const fn has_receive_jr_support(&self) -> bool {
        self.receive_jr_support
    }

    #[must_use]
    pub const fn has_transmit_jr_support(&self) -> bool {
        self.transmit_jr_support
    }
}

/// How data is transported natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    #[default]
    Bytestream,
    Ump,
}

/// Metadata that does not change while the device is present.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticDeviceInfo {
    name: String,
    manufacturer: String,
    product: String,
    transport: Transport,
    has_source: bool,
    has_destination: bool,
    legacy_identifiers_src: [String; Group::COUNT],
    legacy_identifiers_dst: [String; Group::COUNT],
}

impl StaticDeviceInfo {
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_manufacturer(mut self, manufacturer: impl Into<String>) -> Self {
        self.manufacturer = manufacturer.into();
        self
    }

    #[must_use]
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        self.product = product.into();
        self
    }

    #[must_use]
    pub const fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = transport;
        self
    }

    #[must_use]
    pub const fn with_has_source(mut self, has_source: bool) -> Self {
        self.has_source = has_source;
        self
    }

    #[must_use]
    pub const fn with_has_destination(mut self, has_destination: bool) -> Self {
        self.has_destination = has_destination;
        self
    }

    #[must_use]
    pub fn with_legacy_identifiers(
        mut self,
        kind: IoKind,
        identifiers: [String; Group::COUNT],
    ) -> Self {
        match kind {
            IoKind::Src => self.legacy_identifiers_src = identifiers,
            IoKind::Dst => self.legacy_identifiers_dst = identifiers,
        }
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.product
    }

    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.transport
    }

    #[must_use]
    pub const fn has_source(&self) -> bool {
        self.has_source
    }

    #[must_use]
    pub const fn has_destination(&self) -> bool {
        self.has_destination
    }

    /// Identifiers of the per-group legacy ports.
    ///
    /// Empty strings denote groups without a legacy port.
    #[must_use]
    pub const fn legacy_identifiers(&self, kind: IoKind) -> &[String; Group::COUNT] {
        match kind {
            IoKind::Src => &self.legacy_identifiers_src,
            IoKind::Dst => &self.legacy_identifiers_dst,
        }
    }
}

/// Registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAndStaticInfo {
    pub id: EndpointId,
    pub endpoint: Endpoint,
    pub info: StaticDeviceInfo,
}

/// Wraps a unidirectional MIDI 1.0 port into an endpoint.
///
/// The endpoint contains a single block that either sends to this host
/// for source ports or receives from this host for destination ports.
#[must_use]
pub fn make_proxy_endpoint(
    kind: IoKind,
    native_id: impl Into<String>,
    name: impl Into<String>,
) -> EndpointAndStaticInfo {
    let native_id = native_id.into();
    let name = name.into();
    let direction = match kind {
        IoKind::Src => BlockDirection::Sender,
        IoKind::Dst => BlockDirection::Receiver,
    };
    let endpoint = Endpoint::default()
        .with_name(name.clone())
        .with_protocol(PacketProtocol::Midi1)
        .with_midi1_support(true)
        .with_static_blocks(true)
        .with_blocks([Block::legacy(name.clone(), direction)]);
    let mut legacy_identifiers: [String; Group::COUNT] = Default::default();
    legacy_identifiers[0].clone_from(&native_id);
    let info = StaticDeviceInfo::default()
        .with_name(name)
        .with_transport(Transport::Bytestream)
        .with_has_source(kind == IoKind::Src)
        .with_has_destination(kind == IoKind::Dst)
        .with_legacy_identifiers(kind, legacy_identifiers);
    EndpointAndStaticInfo {
        id: EndpointId::make(kind, native_id),
        endpoint,
        info,
    }
}

/// Appends "-2", "-3", ... to repeated names in order of appearance.
///
/// Numbers that would collide with any other name are skipped.
pub fn append_numbers_to_duplicates(names: &mut [String]) {
    let mut taken: HashSet<String> = names.iter().cloned().collect();
    let mut seen = HashSet::<String>::with_capacity(names.len());
    let mut next_numbers = HashMap::<String, usize>::new();
    for name in names.iter_mut() {
        if seen.insert(name.clone()) {
            continue;
        }
        let number = next_numbers.entry(name.clone()).or_insert(2);
        let mut numbered = format!("{name}-{number}");
        while taken.contains(&numbered) {
            *number += 1;
            numbered = format!("{name}-{number}");
        }
        *number += 1;
        taken.insert(numbered.clone());
        *name = numbered;
    }
}
