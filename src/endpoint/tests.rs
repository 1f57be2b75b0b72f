// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

use super::*;

#[test]
fn duplicate_names_are_numbered() {
    let mut names = ["USB MIDI 1", "Synth", "USB MIDI 1", "USB MIDI 1", "Synth"]
        .map(String::from)
        .to_vec();
    append_numbers_to_duplicates(&mut names);
    assert_eq!(
        vec![
            "USB MIDI 1",
            "Synth",
            "USB MIDI 1-2",
            "USB MIDI 1-3",
            "Synth-2"
        ],
        names
    );
}

#[test]
fn numbered_names_do_not_collide_with_existing_names() {
    let mut names = ["A", "A", "A-2"].map(String::from).to_vec();
    append_numbers_to_duplicates(&mut names);
    assert_eq!(vec!["A", "A-3", "A-2"], names);

    let mut names = ["B-2", "B", "B", "B"].map(String::from).to_vec();
    append_numbers_to_duplicates(&mut names);
    assert_eq!(vec!["B-2", "B", "B-3", "B-4"], names);
}

#[test]
fn unique_names_are_untouched() {
    let mut names = vec!["A".to_owned(), "B".to_owned()];
    append_numbers_to_duplicates(&mut names);
    assert_eq!(vec!["A", "B"], names);
}

#[test]
fn endpoint_ids() {
    let id = EndpointId::bidirectional("usb-1");
    assert_eq!("usb-1", id.src());
    assert_eq!("usb-1", id.dst());
    assert_eq!("usb-1", id.to_string());

    let src = EndpointId::make(IoKind::Src, "port");
    let dst = EndpointId::make(IoKind::Dst, "port");
    assert_ne!(src, dst);
    assert_eq!("port", src.get(IoKind::Src));
    assert!(src.get(IoKind::Dst).is_empty());
    assert!(!src.is_empty());
    assert!(EndpointId::default().is_empty());
}

#[test]
fn proxy_endpoint_for_source_port() {
    let entry = make_proxy_endpoint(IoKind::Src, "native-in", "Keys");
    assert_eq!(EndpointId::new("native-in", ""), entry.id);
    assert_eq!("Keys", entry.endpoint.name());
    assert_eq!(PacketProtocol::Midi1, entry.endpoint.protocol());
    assert!(entry.endpoint.has_midi1_support());
    assert!(entry.endpoint.has_static_blocks());
    assert_eq!(1, entry.endpoint.blocks().len());
    let block = &entry.endpoint.blocks()[0];
    assert_eq!(BlockDirection::Sender, block.direction);
    assert_eq!(
        BlockMidi1ProxyKind::UnrestrictedBandwidth,
        block.midi1_proxy_kind
    );
    assert!(block.direction.supports(IoKind::Src));
    assert!(!block.direction.supports(IoKind::Dst));
    assert!(entry.info.has_source());
    assert!(!entry.info.has_destination());
    assert_eq!(Transport::Bytestream, entry.info.transport());
    assert_eq!("native-in", entry.info.legacy_identifiers(IoKind::Src)[0]);
}

#[test]
fn proxy_endpoint_for_destination_port() {
    let entry = make_proxy_endpoint(IoKind::Dst, "native-out", "Keys");
    assert_eq!(EndpointId::new("", "native-out"), entry.id);
    assert_eq!(BlockDirection::Receiver, entry.endpoint.blocks()[0].direction);
    assert!(!entry.info.has_source());
    assert!(entry.info.has_destination());
}

#[test]
fn set_block_replaces_existing_blocks_only() {
    let mut endpoint = Endpoint::default().with_blocks([Block::default()]);
    let block = Block::legacy("Out", BlockDirection::Receiver);
    assert!(endpoint.set_block(0, block.clone()));
    assert_eq!(&[block.clone()], endpoint.blocks());
    assert!(!endpoint.set_block(1, block));
}

#[test]
fn block_groups() {
    let block = Block {
        first_group: 2,
        num_groups: 3,
        ..Default::default()
    };
    assert!(!block.contains_group(Group::from_nibble(1)));
    assert!(block.contains_group(Group::from_nibble(2)));
    assert!(block.contains_group(Group::from_nibble(4)));
    assert!(!block.contains_group(Group::from_nibble(5)));
}
