// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

use std::cell::Cell;

use super::{
    bytestream::{message_to_ump, BytestreamToUmp},
    timestamp::{Clock, TimestampConverter},
    to_bytestream::ToBytestream,
    translate::{
        midi2_to_midi1, scale_16_to_7, scale_32_to_7, scale_7_to_16, scale_7_to_32, Midi1ToMidi2,
    },
    views, Group, MessageType, PacketProtocol, View,
};
use crate::ump::GenericConverter;

fn to_ump(bytes: &[u8]) -> Vec<u32> {
    to_ump_with(&mut BytestreamToUmp::new(Group::default()), bytes)
}

fn to_ump_with(converter: &mut BytestreamToUmp, bytes: &[u8]) -> Vec<u32> {
    let mut words = Vec::new();
    converter.push_bytes(bytes, |view| words.extend_from_slice(view.words()));
    words
}

fn to_chunks(words: &[u32]) -> Vec<Vec<u8>> {
    let mut converter = ToBytestream::default();
    let mut chunks = Vec::new();
    converter.convert_words(words, |chunk| chunks.push(chunk.bytes.to_vec()));
    chunks
}

fn to_bytes(words: &[u32]) -> Vec<u8> {
    to_chunks(words).concat()
}

fn midi2_to_midi1_words(words: &[u32]) -> Vec<u32> {
    let mut result = Vec::new();
    for view in views(words) {
        midi2_to_midi1(view, |view| result.extend_from_slice(view.words()));
    }
    result
}

fn midi1_to_midi2_words(words: &[u32]) -> Vec<u32> {
    let mut translator = Midi1ToMidi2::new();
    let mut result = Vec::new();
    for view in views(words) {
        translator.translate(view, |view| result.extend_from_slice(view.words()));
    }
    result
}

#[test]
fn message_type_and_size() {
    assert_eq!(MessageType::Utility, MessageType::from_word(0x0000_0000));
    assert_eq!(MessageType::Sysex7, MessageType::from_word(0x3016_0102));
    assert_eq!(MessageType::Reserved(0x8), MessageType::from_word(0x8000_0000));
    assert_eq!(1, MessageType::from_word(0x2090_3c64).num_words());
    assert_eq!(2, MessageType::Midi2ChannelVoice.num_words());
    assert_eq!(4, MessageType::Data.num_words());
    assert_eq!(3, MessageType::Reserved(0xb).num_words());
}

#[test]
fn views_drop_truncated_tail() {
    let words = [0x2090_3c64, 0x3016_0102];
    let collected = views(&words).collect::<Vec<_>>();
    assert_eq!(1, collected.len());
    assert_eq!(&[0x2090_3c64], collected[0].words());
    assert!(View::split_first(&[]).is_err());
}

#[test]
fn protocol_display() {
    assert_eq!("MIDI 1.0", PacketProtocol::Midi1.to_string());
    assert_eq!(Ok(PacketProtocol::Midi2), "MIDI 2.0".parse());
}

#[test]
fn channel_voice_and_system_to_ump() {
    assert_eq!(vec![0x2090_3c64], to_ump(&[0x90, 0x3c, 0x64]));
    assert_eq!(vec![0x20c3_1000], to_ump(&[0xc3, 0x10]));
    assert_eq!(vec![0x10f8_0000], to_ump(&[0xf8]));
    assert_eq!(vec![0x10f2_0102], to_ump(&[0xf2, 0x01, 0x02]));
    let mut words = Vec::new();
    message_to_ump(Group::from_nibble(5), &[0x90, 0x3c, 0x64], |view| {
        words.extend_from_slice(view.words());
    });
    assert_eq!(vec![0x2590_3c64], words);
}

#[test]
fn empty_input_is_a_no_op() {
    assert!(to_ump(&[]).is_empty());
    assert!(to_chunks(&[]).is_empty());
}

#[test]
fn running_status_is_dropped() {
    assert_eq!(vec![0x2090_3c64], to_ump(&[0x90, 0x3c, 0x64, 0x3e, 0x64]));
    assert!(to_ump(&[0x3c, 0x64]).is_empty());
}

#[test]
fn sysex7_framing() {
    assert_eq!(vec![0x3000_0000, 0x0000_0000], to_ump(&[0xf0, 0xf7]));
    assert_eq!(
        vec![0x3006_0102, 0x0304_0506],
        to_ump(&[0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0xf7])
    );
    let twelve = (1..=12).collect::<Vec<u8>>();
    assert_eq!(
        vec![0x3016_0102, 0x0304_0506, 0x3036_0708, 0x090a_0b0c],
        to_ump(&[&[0xf0], twelve.as_slice(), &[0xf7]].concat())
    );
    let thirteen = (1..=13).collect::<Vec<u8>>();
    assert_eq!(
        vec![
            0x3016_0102,
            0x0304_0506,
            0x3026_0708,
            0x090a_0b0c,
            0x3031_0d00,
            0x0000_0000
        ],
        to_ump(&[&[0xf0], thirteen.as_slice(), &[0xf7]].concat())
    );
}

#[test]
fn sysex7_with_reduced_payload() {
    let mut converter = BytestreamToUmp::new(Group::default()).with_max_sysex_payload(3);
    assert_eq!(
        vec![0x3013_0102, 0x0300_0000, 0x3031_0400, 0x0000_0000],
        to_ump_with(&mut converter, &[0xf0, 0x01, 0x02, 0x03, 0x04, 0xf7])
    );
}

#[test]
fn sysex_split_across_chunks() {
    let mut converter = BytestreamToUmp::new(Group::default());
    let mut words = to_ump_with(&mut converter, &[0xf0, 0x01, 0x02, 0x03]);
    assert!(words.is_empty());
    words.extend(to_ump_with(&mut converter, &[0x04, 0x05, 0x06, 0x07, 0xf7]));
    assert_eq!(
        to_ump(&[0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xf7]),
        words
    );
}

#[test]
fn realtime_inside_sysex() {
    assert_eq!(
        vec![0x10f8_0000, 0x3002_0102, 0x0000_0000],
        to_ump(&[0xf0, 0x01, 0xf8, 0x02, 0xf7])
    );
}

#[test]
fn status_byte_terminates_sysex() {
    assert_eq!(
        vec![0x3002_0102, 0x0000_0000, 0x2090_3c64],
        to_ump(&[0xf0, 0x01, 0x02, 0x90, 0x3c, 0x64])
    );
}

#[test]
fn dispatch_tags_timestamps() {
    let mut converter = BytestreamToUmp::new(Group::default());
    let mut received = Vec::new();
    converter.dispatch(&[0x80, 0x3c, 0x00, 0xfe], 1.5, |view, time| {
        received.push((view.first_word(), time));
    });
    assert_eq!(vec![(0x2080_3c00, 1.5), (0x10fe_0000, 1.5)], received);
}

#[test]
fn round_trip_legacy_messages() {
    let messages: &[&[u8]] = &[
        &[0x80, 0x3c, 0x40],
        &[0x9f, 0x7f, 0x7f],
        &[0xa1, 0x10, 0x20],
        &[0xb2, 0x07, 0x64],
        &[0xc3, 0x05],
        &[0xd4, 0x33],
        &[0xe5, 0x00, 0x40],
        &[0xf1, 0x12],
        &[0xf2, 0x01, 0x02],
        &[0xf3, 0x04],
        &[0xf6],
        &[0xf8],
        &[0xfa],
        &[0xff],
        &[0xf0, 0xf7],
        &[0xf0, 0x7e, 0x7f, 0x06, 0x01, 0xf7],
    ];
    for message in messages {
        assert_eq!(message.to_vec(), to_bytes(&to_ump(message)), "{message:02x?}");
    }
}

#[test]
fn round_trip_huge_sysex() {
    let mut message = vec![0xf0];
    message.extend((0..70_000_usize).map(|i| (i % 0x80) as u8));
    message.push(0xf7);
    let chunks = to_chunks(&to_ump(&message));
    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|chunk| chunk.len() <= 4096));
    assert_eq!(Some(&0xf0), chunks[0].first());
    assert_eq!(Some(&0xf7), chunks[chunks.len() - 1].last());
    assert_eq!(message, chunks.concat());
}

#[test]
fn sysex_reassembly_skips_utility_and_realtime() {
    let words = [
        0x3016_0102,
        0x0304_0506,
        0x0000_0000,
        0x10f8_0000,
        0x3031_0700,
        0x0000_0000,
    ];
    assert_eq!(
        vec![
            vec![0xf8],
            vec![0xf0, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0xf7]
        ],
        to_chunks(&words)
    );
}

#[test]
fn interrupted_sysex_is_discarded() {
    let words = [
        0x3016_0102,
        0x0304_0506,
        0x2090_3c64,
        0x3031_0700,
        0x0000_0000,
        0x3001_0900,
        0x0000_0000,
    ];
    assert_eq!(
        vec![vec![0x90, 0x3c, 0x64], vec![0xf0, 0x09, 0xf7]],
        to_chunks(&words)
    );
}

#[test]
fn malformed_sysex_is_dropped() {
    // Continue and end without start
    assert!(to_chunks(&[0x3021_0100, 0, 0x3031_0200, 0]).is_empty());
    // Byte count out of range
    assert!(to_chunks(&[0x3007_0102, 0x0304_0506]).is_empty());
    // Invalid status
    assert!(to_chunks(&[0x3041_0100, 0]).is_empty());
}

#[test]
fn sysex_is_reassembled_per_group() {
    let words = [
        0x3012_0102,
        0,
        0x3112_0a0b,
        0,
        0x3031_0300,
        0,
        0x3131_0c00,
        0,
    ];
    let mut converter = ToBytestream::default();
    let mut chunks = Vec::new();
    converter.convert_words(&words, |chunk| {
        chunks.push((chunk.group.index(), chunk.bytes.to_vec()));
    });
    assert_eq!(
        vec![
            (0, vec![0xf0, 0x01, 0x02, 0x03, 0xf7]),
            (1, vec![0xf0, 0x0a, 0x0b, 0x0c, 0xf7]),
        ],
        chunks
    );
}

#[test]
fn unrepresentable_packets_are_ignored() {
    assert!(to_chunks(&[0x0010_0000]).is_empty());
    assert!(to_chunks(&[0x5000_0000, 0, 0, 0]).is_empty());
    assert!(to_chunks(&[0xd010_0000, 0, 0, 0]).is_empty());
    assert!(to_chunks(&[0x2070_0000]).is_empty());
}

#[test]
fn midi2_packets_to_bytestream() {
    assert_eq!(vec![0x90, 0x3c, 0x7f], to_bytes(&[0x4090_3c00, 0xffff_0000]));
}

#[test]
fn scaling() {
    assert_eq!(0x1400, scale_7_to_16(0x0a));
    assert_eq!(0x8000, scale_7_to_16(0x40));
    assert_eq!(0xaeba, scale_7_to_16(0x57));
    assert_eq!(0xffff, scale_7_to_16(0x7f));
    assert_eq!(0, scale_7_to_32(0));
    assert_eq!(0xffff_ffff, scale_7_to_32(0x7f));
    for value in 0..0x80 {
        assert_eq!(value, scale_16_to_7(scale_7_to_16(value)));
        assert_eq!(value, scale_32_to_7(scale_7_to_32(value)));
    }
}

#[test]
fn midi2_to_midi1_channel_voice() {
    // Note off
    assert_eq!(
        vec![0x248b_057f],
        midi2_to_midi1_words(&[0x448b_0520, 0xfedc_ba98])
    );
    // Note on
    assert_eq!(
        vec![0x2194_6409],
        midi2_to_midi1_words(&[0x4194_6410, 0x1234_5678])
    );
    // Note on with a velocity that would become zero
    assert_eq!(
        vec![0x2194_6401],
        midi2_to_midi1_words(&[0x4194_6410, 0x0034_5678])
    );
    // Poly pressure
    assert_eq!(
        vec![0x29af_1040],
        midi2_to_midi1_words(&[0x49af_1000, 0x80dc_ba98])
    );
    // Channel pressure
    assert_eq!(
        vec![0x20d2_4000],
        midi2_to_midi1_words(&[0x40d2_0520, 0x80dc_ba98])
    );
    // Pitch bend
    assert_eq!(
        vec![0x2eee_0d09],
        midi2_to_midi1_words(&[0x4eee_0000, 0x1234_0000])
    );
    // Control change
    assert_eq!(
        vec![0x26b2_0a40],
        midi2_to_midi1_words(&[0x46b2_0a00, 0x8000_0000])
    );
}

#[test]
fn midi2_to_midi1_parameters_and_programs() {
    // Registered parameter
    assert_eq!(
        vec![0x24b4_6501, 0x24b4_6423, 0x24b4_0622, 0x24b4_2659],
        midi2_to_midi1_words(&[0x4424_0123, 0x4567_89ab])
    );
    // Assignable parameter
    assert_eq!(
        vec![0x28b4_637f, 0x28b4_627f, 0x28b4_067f, 0x28b4_267f],
        midi2_to_midi1_words(&[0x4834_7f7f, 0xffff_ffff])
    );
    // Program change with bank
    assert_eq!(
        vec![0x2bb2_0040, 0x2bb2_2020, 0x2bc2_7000],
        midi2_to_midi1_words(&[0x4bc2_0001, 0x7000_4020])
    );
    // Program change without bank
    assert_eq!(
        vec![0x2bc2_7000],
        midi2_to_midi1_words(&[0x4bc2_0000, 0x7000_4020])
    );
    // Reserved control changes and per-note messages
    for cc in [0_u32, 6, 32, 38, 98, 99, 100, 101] {
        let word = 0x40b0_0000 | cc << 8;
        assert!(midi2_to_midi1_words(&[word, 0x8000_0000]).is_empty());
    }
    assert!(midi2_to_midi1_words(&[0x40f0_3c00, 0]).is_empty());
    // Other packets pass through
    assert_eq!(vec![0x10f8_0000], midi2_to_midi1_words(&[0x10f8_0000]));
}

#[test]
fn midi1_to_midi2_channel_voice() {
    assert_eq!(
        vec![0x4183_1000, u32::from(scale_7_to_16(0x20)) << 16],
        midi1_to_midi2_words(&[0x2183_1020])
    );
    assert_eq!(
        vec![0x4393_5100, u32::from(scale_7_to_16(0x7f)) << 16],
        midi1_to_midi2_words(&[0x2393_517f])
    );
    // Note on with zero velocity is a note off
    assert_eq!(
        vec![0x4383_5100, 0x0000_0000],
        midi1_to_midi2_words(&[0x2393_5100])
    );
    assert_eq!(
        vec![0x49b1_0100, scale_7_to_32(0x7f)],
        midi1_to_midi2_words(&[0x29b1_017f])
    );
    assert_eq!(
        vec![0x40df_0000, scale_7_to_32(0x30)],
        midi1_to_midi2_words(&[0x20df_3000])
    );
    assert_eq!(
        vec![
            0x40e7_0000,
            super::translate::scale_14_to_32(0x67 << 7 | 0x45)
        ],
        midi1_to_midi2_words(&[0x20e7_4567])
    );
}

#[test]
fn midi1_to_midi2_parameters_and_programs() {
    // Assignable parameter
    assert_eq!(
        vec![
            0x4030_0123,
            super::translate::scale_14_to_32(0x45 << 7 | 0x67)
        ],
        midi1_to_midi2_words(&[0x20b0_6301, 0x20b0_6223, 0x20b0_0645, 0x20b0_2667])
    );
    // Registered parameter
    assert_eq!(
        vec![
            0x4020_4321,
            super::translate::scale_14_to_32(0x45 << 7 | 0x67)
        ],
        midi1_to_midi2_words(&[0x20b0_6543, 0x20b0_6421, 0x20b0_0645, 0x20b0_2667])
    );
    // Data entry without parameter selection
    assert!(midi1_to_midi2_words(&[0x20b0_0645, 0x20b0_2667]).is_empty());
    // Program change with bank
    assert_eq!(
        vec![0x4bc2_0001, 0x4000_3010],
        midi1_to_midi2_words(&[0x2bb2_0030, 0x2bb2_2010, 0x2bc2_4000])
    );
    // Program change without bank
    assert_eq!(
        vec![0x40c0_0000, 0x1000_0000],
        midi1_to_midi2_words(&[0x20c0_1000])
    );
}

#[test]
fn generic_converter_follows_protocol() {
    let mut converter = GenericConverter::new(PacketProtocol::Midi2);
    let mut words = Vec::new();
    for view in views(&[0x2090_3c7f, 0x4090_3c00, 0xffff_0000]) {
        converter.convert(view, |view| words.extend_from_slice(view.words()));
    }
    assert_eq!(
        vec![0x4090_3c00, 0xffff_0000, 0x4090_3c00, 0xffff_0000],
        words
    );

    let mut converter = GenericConverter::new(PacketProtocol::Midi1);
    words.clear();
    for view in views(&[0x2090_3c7f, 0x4090_3c00, 0xffff_0000]) {
        converter.convert(view, |view| words.extend_from_slice(view.words()));
    }
    assert_eq!(vec![0x2090_3c7f, 0x2090_3c7f], words);
}

#[derive(Debug, Default)]
struct ManualClock {
    now: Cell<f64>,
}

impl Clock for ManualClock {
    fn now_millis(&self) -> f64 {
        self.now.get()
    }
}

#[test]
#[allow(clippy::float_cmp)]
fn timestamps_in_the_past_are_kept() {
    let clock = ManualClock::default();
    clock.now.set(1000.0);
    let mut converter = TimestampConverter::with_clock(&clock);
    clock.now.set(1010.0);
    assert_eq!(1005.0 / 1000.0, converter.convert(5.0));
    assert_eq!(1000.0, converter.start_millis());
}

#[test]
#[allow(clippy::float_cmp)]
fn future_timestamps_are_clamped_and_corrected() {
    let clock = ManualClock::default();
    clock.now.set(1000.0);
    let mut converter = TimestampConverter::with_clock(&clock);
    clock.now.set(1010.0);
    // Within the guard interval
    assert_eq!(1010.0 / 1000.0, converter.convert(11.5));
    assert_eq!(1000.0, converter.start_millis());
    // Beyond the guard interval
    assert_eq!(1010.0 / 1000.0, converter.convert(20.0));
    assert_eq!(999.0, converter.start_millis());
}

#[test]
fn timestamps_are_monotonic() {
    let clock = ManualClock::default();
    clock.now.set(0.0);
    let mut converter = TimestampConverter::with_clock(&clock);
    let mut last = f64::MIN;
    for i in 0..1000_u32 {
        // The device clock runs twice as fast as the local clock.
        clock.now.set(f64::from(i) * 0.5);
        let elapsed = f64::from(i);
        let time = converter.convert(elapsed);
        assert!(time >= last);
        assert!(time * 1000.0 <= clock.now_millis() + 2.0);
        last = time;
    }
    assert!(converter.start_millis() < 0.0);
}
