// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Translation of channel voice messages between the MIDI 1.0 and
//! MIDI 2.0 protocols.

use super::{bytes_to_word, word_byte, Group, MessageType, PacketProtocol, View};

const CC_BANK_SELECT_MSB: u8 = 0;
const CC_DATA_ENTRY_MSB: u8 = 6;
const CC_BANK_SELECT_LSB: u8 = 32;
const CC_DATA_ENTRY_LSB: u8 = 38;
const CC_NRPN_LSB: u8 = 98;
const CC_NRPN_MSB: u8 = 99;
const CC_RPN_LSB: u8 = 100;
const CC_RPN_MSB: u8 = 101;

/// Widens a value using the MIDI 2.0 min-center-max scaling.
///
/// Values up to the center are shifted, larger values fill the lower bits
/// by repeating the source bits below the most significant bit.
#[must_use]
pub const fn scale_up(value: u32, src_bits: u32, dst_bits: u32) -> u32 {
    debug_assert!(src_bits > 1 && src_bits < dst_bits && dst_bits <= 32);
    let scale_bits = dst_bits - src_bits;
    let shifted = value << scale_bits;
    let src_center = 1 << (src_bits - 1);
    if value <= src_center {
        return shifted;
    }
    let repeat_bits = src_bits - 1;
    let repeat_mask = (1 << repeat_bits) - 1;
    let mut repeat = value & repeat_mask;
    if scale_bits > repeat_bits {
        repeat <<= scale_bits - repeat_bits;
    } else {
        repeat >>= repeat_bits - scale_bits;
    }
    let mut result = shifted;
    while repeat != 0 {
        result |= repeat;
        repeat >>= repeat_bits;
    }
    result
}

/// Narrows a value by discarding the least significant bits.
#[must_use]
pub const fn scale_down(value: u32, src_bits: u32, dst_bits: u32) -> u32 {
    value >> (src_bits - dst_bits)
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn scale_7_to_16(value: u8) -> u16 {
    scale_up(value as u32, 7, 16) as u16
}

#[must_use]
pub const fn scale_7_to_32(value: u8) -> u32 {
    scale_up(value as u32, 7, 32)
}

#[must_use]
pub const fn scale_14_to_32(value: u16) -> u32 {
    scale_up(value as u32, 14, 32)
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn scale_16_to_7(value: u16) -> u8 {
    scale_down(value as u32, 16, 7) as u8
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn scale_32_to_7(value: u32) -> u8 {
    scale_down(value, 32, 7) as u8
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn scale_32_to_14(value: u32) -> u16 {
    scale_down(value, 32, 14) as u16
}

fn emit_midi1(group: u8, status: u8, data1: u8, data2: u8, sink: &mut impl FnMut(View<'_>)) {
    let word = [bytes_to_word(0x20 | group, status, data1, data2)];
    sink(View::from_words_unchecked(&word));
}

/// Translates a MIDI 2.0 channel voice packet into MIDI 1.0 packets.
///
/// All other packets are passed through unmodified. Messages without
/// a MIDI 1.0 equivalent are dropped.
#[allow(clippy::cast_possible_truncation)]
pub fn midi2_to_midi1(view: View<'_>, mut sink: impl FnMut(View<'_>)) {
    if view.message_type() != MessageType::Midi2ChannelVoice {
        sink(view);
        return;
    }
    let group = view.group().index();
    let opcode = view.byte(1) >> 4;
    let channel = view.byte(1) & 0xf;
    let index = view.byte(2);
    let extra = view.byte(3);
    let value = view.words()[1];
    match opcode {
        0x8 => emit_midi1(
            group,
            0x80 | channel,
            index,
            scale_16_to_7((value >> 16) as u16),
            &mut sink,
        ),
        0x9 => {
            // Note-on with velocity 0 would turn into a note-off.
            let velocity = scale_16_to_7((value >> 16) as u16).max(1);
            emit_midi1(group, 0x90 | channel, index, velocity, &mut sink);
        }
        0xa => emit_midi1(group, 0xa0 | channel, index, scale_32_to_7(value), &mut sink),
        0xb => {
            if matches!(
                index,
                CC_BANK_SELECT_MSB
                    | CC_BANK_SELECT_LSB
                    | CC_DATA_ENTRY_MSB
                    | CC_DATA_ENTRY_LSB
                    | CC_NRPN_LSB..=CC_RPN_MSB
            ) {
                return;
            }
            emit_midi1(group, 0xb0 | channel, index, scale_32_to_7(value), &mut sink);
        }
        0xc => {
            if extra & 0x1 != 0 {
                emit_midi1(
                    group,
                    0xb0 | channel,
                    CC_BANK_SELECT_MSB,
                    word_byte(value, 2),
                    &mut sink,
                );
                emit_midi1(
                    group,
                    0xb0 | channel,
                    CC_BANK_SELECT_LSB,
                    word_byte(value, 3),
                    &mut sink,
                );
            }
            emit_midi1(group, 0xc0 | channel, word_byte(value, 0), 0, &mut sink);
        }
        0xd => emit_midi1(group, 0xd0 | channel, scale_32_to_7(value), 0, &mut sink),
        0xe => {
            let value = scale_32_to_14(value);
            emit_midi1(
                group,
                0xe0 | channel,
                (value & 0x7f) as u8,
                (value >> 7) as u8,
                &mut sink,
            );
        }
        0x2 | 0x3 => {
            let (cc_msb, cc_lsb) = if opcode == 0x2 {
                (CC_RPN_MSB, CC_RPN_LSB)
            } else {
                (CC_NRPN_MSB, CC_NRPN_LSB)
            };
            let value = scale_32_to_14(value);
            let status = 0xb0 | channel;
            emit_midi1(group, status, cc_msb, index, &mut sink);
            emit_midi1(group, status, cc_lsb, extra, &mut sink);
            emit_midi1(group, status, CC_DATA_ENTRY_MSB, (value >> 7) as u8, &mut sink);
            emit_midi1(group, status, CC_DATA_ENTRY_LSB, (value & 0x7f) as u8, &mut sink);
        }
        _ => {
            log::trace!("No MIDI 1.0 equivalent for {view:?}");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParameterKind {
    Registered,
    Assignable,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChannelState {
    bank_msb: Option<u8>,
    bank_lsb: Option<u8>,
    parameter_kind: Option<ParameterKind>,
    parameter_msb: Option<u8>,
    parameter_lsb: Option<u8>,
    data_msb: Option<u8>,
}

impl ChannelState {
    fn select_parameter(&mut self, kind: ParameterKind, msb: Option<u8>, lsb: Option<u8>) {
        if self.parameter_kind != Some(kind) {
            self.parameter_kind = Some(kind);
            self.parameter_msb = None;
            self.parameter_lsb = None;
        }
        self.parameter_msb = msb.or(self.parameter_msb);
        self.parameter_lsb = lsb.or(self.parameter_lsb);
        self.data_msb = None;
    }
}

/// Stateful translation of MIDI 1.0 channel voice packets into MIDI 2.0.
///
/// Bank select and (N)RPN control changes are accumulated per group and
/// channel and emitted as single MIDI 2.0 messages.
#[derive(Debug, Clone)]
pub struct Midi1ToMidi2 {
    channels: Box<[[ChannelState; 16]; Group::COUNT]>,
}

impl Default for Midi1ToMidi2 {
    fn default() -> Self {
        Self {
            channels: Box::new([[ChannelState::default(); 16]; Group::COUNT]),
        }
    }
}

impl Midi1ToMidi2 {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn translate(&mut self, view: View<'_>, mut sink: impl FnMut(View<'_>)) {
        if view.message_type() != MessageType::Midi1ChannelVoice {
            sink(view);
            return;
        }
        let group = view.group().index();
        let status = view.byte(1);
        let opcode = status >> 4;
        let channel = status & 0xf;
        let data1 = view.byte(2) & 0x7f;
        let data2 = view.byte(3) & 0x7f;
        let mut emit = |status: u8, index: u8, extra: u8, value: u32| {
            let words = [bytes_to_word(0x40 | group, status, index, extra), value];
            sink(View::from_words_unchecked(&words));
        };
        match opcode {
            0x8 => emit(status, data1, 0, u32::from(scale_7_to_16(data2)) << 16),
            0x9 if data2 == 0 => emit(0x80 | channel, data1, 0, 0),
            0x9 => emit(status, data1, 0, u32::from(scale_7_to_16(data2)) << 16),
            0xa => emit(status, data1, 0, scale_7_to_32(data2)),
            0xb => {
                let state = &mut self.channels[usize::from(group)][usize::from(channel)];
                match data1 {
                    CC_BANK_SELECT_MSB => state.bank_msb = Some(data2),
                    CC_BANK_SELECT_LSB => state.bank_lsb = Some(data2),
                    CC_RPN_MSB => {
                        state.select_parameter(ParameterKind::Registered, Some(data2), None);
                    }
                    CC_RPN_LSB => {
                        state.select_parameter(ParameterKind::Registered, None, Some(data2));
                    }
                    CC_NRPN_MSB => {
                        state.select_parameter(ParameterKind::Assignable, Some(data2), None);
                    }
                    CC_NRPN_LSB => {
                        state.select_parameter(ParameterKind::Assignable, None, Some(data2));
                    }
                    CC_DATA_ENTRY_MSB => state.data_msb = Some(data2),
                    CC_DATA_ENTRY_LSB => {
                        let (Some(kind), Some(msb), Some(lsb), Some(data_msb)) = (
                            state.parameter_kind,
                            state.parameter_msb,
                            state.parameter_lsb,
                            state.data_msb.take(),
                        ) else {
                            log::trace!("Ignoring data entry without parameter selection");
                            return;
                        };
                        let opcode = match kind {
                            ParameterKind::Registered => 0x20,
                            ParameterKind::Assignable => 0x30,
                        };
                        let value = (u16::from(data_msb) << 7) | u16::from(data2);
                        emit(opcode | channel, msb, lsb, scale_14_to_32(value));
                    }
                    _ => emit(status, data1, 0, scale_7_to_32(data2)),
                }
            }
            0xc => {
                let state = self.channels[usize::from(group)][usize::from(channel)];
                let program = u32::from(data1) << 24;
                match (state.bank_msb, state.bank_lsb) {
                    (Some(msb), Some(lsb)) => {
                        emit(status, 0, 0x1, program | u32::from(msb) << 8 | u32::from(lsb));
                    }
                    _ => emit(status, 0, 0, program),
                }
            }
            0xd => emit(status, 0, 0, scale_7_to_32(data1)),
            0xe => emit(
                status,
                0,
                0,
                scale_14_to_32(u16::from(data2) << 7 | u16::from(data1)),
            ),
            _ => log::trace!("Dropping invalid channel voice packet {view:?}"),
        }
    }
}

/// Converts arbitrary packets into the protocol requested by a consumer.
#[derive(Debug, Clone)]
pub struct GenericConverter {
    protocol: PacketProtocol,
    midi1_to_midi2: Midi1ToMidi2,
}

impl GenericConverter {
    #[must_use]
    pub fn new(protocol: PacketProtocol) -> Self {
        Self {
            protocol,
            midi1_to_midi2: Midi1ToMidi2::new(),
        }
    }

    #[must_use]
    pub const fn protocol(&self) -> PacketProtocol {
        self.protocol
    }

    pub fn convert(&mut self, view: View<'_>, sink: impl FnMut(View<'_>)) {
        match self.protocol {
            PacketProtocol::Midi1 => midi2_to_midi1(view, sink),
            PacketProtocol::Midi2 => self.midi1_to_midi2.translate(view, sink),
        }
    }
}
