// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Legacy MIDI 1.0 byte streams to Universal MIDI Packets.

use super::{bytes_to_word, Group, Sysex7Status, View, MAX_SYSEX7_PAYLOAD};

const SYSEX_START: u8 = 0xf0;
const SYSEX_END: u8 = 0xf7;

/// Canonical length of a message in bytes, including the status byte.
///
/// Returns `None` for bytes that do not start a fixed-size message,
/// i.e. data bytes and the sysex delimiters.
#[must_use]
pub const fn message_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xbf | 0xe0..=0xef | 0xf2 => Some(3),
        0xc0..=0xdf | 0xf1 | 0xf3 => Some(2),
        0xf4..=0xf6 | 0xf8..=0xff => Some(1),
        _ => None,
    }
}

#[must_use]
const fn is_realtime(byte: u8) -> bool {
    byte >= 0xf8
}

#[derive(Debug, Clone, Copy)]
enum State {
    Idle,
    Message {
        bytes: [u8; 3],
        len: usize,
        expected: usize,
    },
    Sysex {
        bytes: [u8; MAX_SYSEX7_PAYLOAD],
        len: usize,
        started: bool,
    },
}

/// Converts MIDI 1.0 byte streams into MIDI 1.0 protocol packets on a
/// single group.
///
/// Bytes may be pushed in arbitrary chunks, e.g. a long sysex message that
/// is split across several native buffers. Running status is not supported:
/// data bytes without a preceding status byte are dropped.
#[derive(Debug, Clone)]
pub struct BytestreamToUmp {
    group: Group,
    max_sysex_payload: usize,
    state: State,
}

impl BytestreamToUmp {
    #[must_use]
    pub const fn new(group: Group) -> Self {
        Self {
            group,
            max_sysex_payload: MAX_SYSEX7_PAYLOAD,
            state: State::Idle,
        }
    }

    /// Limits the number of payload bytes per sysex-7 packet (1..=6).
    #[must_use]
    pub fn with_max_sysex_payload(mut self, max_sysex_payload: usize) -> Self {
        debug_assert!((1..=MAX_SYSEX7_PAYLOAD).contains(&max_sysex_payload));
        self.max_sysex_payload = max_sysex_payload.clamp(1, MAX_SYSEX7_PAYLOAD);
        self
    }

    #[must_use]
    pub const fn group(&self) -> Group {
        self.group
    }

    /// Discards any partially received message.
    pub fn reset(&mut self) {
        self.state = State::Idle;
    }

    /// Converts `bytes` and passes each complete packet to `sink`.
    pub fn push_bytes(&mut self, bytes: &[u8], mut sink: impl FnMut(View<'_>)) {
        for &byte in bytes {
            self.push_byte(byte, &mut sink);
        }
    }

    /// Like [`Self::push_bytes`], but tags every packet with `timestamp`.
    pub fn dispatch(&mut self, bytes: &[u8], timestamp: f64, mut sink: impl FnMut(View<'_>, f64)) {
        self.push_bytes(bytes, |view| sink(view, timestamp));
    }

    fn push_byte(&mut self, byte: u8, sink: &mut impl FnMut(View<'_>)) {
        if is_realtime(byte) {
            self.emit_message(&[byte], sink);
            return;
        }
        if let State::Sysex {
            mut bytes,
            mut len,
            mut started,
        } = self.state
        {
            if byte == SYSEX_END {
                self.state = State::Idle;
                self.emit_sysex(&bytes[..len], started, true, sink);
                return;
            }
            if byte & 0x80 == 0 {
                if len == self.max_sysex_payload {
                    self.emit_sysex(&bytes[..len], started, false, sink);
                    started = true;
                    len = 0;
                }
                bytes[len] = byte;
                len += 1;
                self.state = State::Sysex {
                    bytes,
                    len,
                    started,
                };
                return;
            }
            log::debug!("Sysex interrupted by status byte {byte:#04x}");
            self.state = State::Idle;
            self.emit_sysex(&bytes[..len], started, true, sink);
        }
        if byte & 0x80 == 0 {
            self.push_data_byte(byte, sink);
            return;
        }
        if let State::Message { bytes, len, .. } = self.state {
            log::debug!("Discarding incomplete message {bytes:02x?}", bytes = &bytes[..len]);
        }
        self.state = State::Idle;
        match byte {
            SYSEX_START => {
                self.state = State::Sysex {
                    bytes: [0; MAX_SYSEX7_PAYLOAD],
                    len: 0,
                    started: false,
                };
            }
            SYSEX_END => {
                log::debug!("Dropping stray end of exclusive");
            }
            status => match message_len(status) {
                Some(1) => self.emit_message(&[status], sink),
                Some(expected) => {
                    self.state = State::Message {
                        bytes: [status, 0, 0],
                        len: 1,
                        expected,
                    };
                }
                None => log::debug!("Dropping undefined status byte {status:#04x}"),
            },
        }
    }

    fn push_data_byte(&mut self, byte: u8, sink: &mut impl FnMut(View<'_>)) {
        let State::Message {
            mut bytes,
            mut len,
            expected,
        } = self.state
        else {
            log::trace!("Dropping data byte {byte:#04x} without status");
            return;
        };
        bytes[len] = byte;
        len += 1;
        if len < expected {
            self.state = State::Message {
                bytes,
                len,
                expected,
            };
            return;
        }
        self.state = State::Idle;
        self.emit_message(&bytes[..len], sink);
    }

    fn emit_message(&self, bytes: &[u8], sink: &mut impl FnMut(View<'_>)) {
        debug_assert!(!bytes.is_empty() && bytes.len() <= 3);
        let status = bytes[0];
        let message_type = if status < 0xf0 { 0x20 } else { 0x10 };
        let data = |index: usize| bytes.get(index).copied().unwrap_or(0);
        let word = [bytes_to_word(
            message_type | self.group.index(),
            status,
            data(1),
            data(2),
        )];
        sink(View::from_words_unchecked(&word));
    }

    fn emit_sysex(
        &self,
        payload: &[u8],
        started: bool,
        last: bool,
        sink: &mut impl FnMut(View<'_>),
    ) {
        let status = match (started, last) {
            (false, true) => Sysex7Status::Complete,
            (false, false) => Sysex7Status::Start,
            (true, false) => Sysex7Status::Continue,
            (true, true) => Sysex7Status::End,
        };
        let words = sysex7_words(self.group, status, payload);
        sink(View::from_words_unchecked(&words));
    }
}

/// Encodes a single sysex-7 packet with up to 6 payload bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn sysex7_words(group: Group, status: Sysex7Status, payload: &[u8]) -> [u32; 2] {
    debug_assert!(payload.len() <= MAX_SYSEX7_PAYLOAD);
    let mut bytes = [0; MAX_SYSEX7_PAYLOAD];
    let len = payload.len().min(MAX_SYSEX7_PAYLOAD);
    bytes[..len].copy_from_slice(&payload[..len]);
    [
        bytes_to_word(
            0x30 | group.index(),
            status.nibble() << 4 | len as u8,
            bytes[0],
            bytes[1],
        ),
        bytes_to_word(bytes[2], bytes[3], bytes[4], bytes[5]),
    ]
}

/// Converts a single complete message.
pub fn message_to_ump(group: Group, bytes: &[u8], sink: impl FnMut(View<'_>)) {
    BytestreamToUmp::new(group).push_bytes(bytes, sink);
}
