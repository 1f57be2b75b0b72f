// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Universal MIDI Packets to legacy MIDI 1.0 byte streams.

use super::{
    bytestream::message_len, translate, word_byte, Group, MessageType, ParseError, Sysex7Status,
    View, MAX_SYSEX7_PAYLOAD,
};

/// Default capacity of the sysex reassembly buffer in bytes.
pub const DEFAULT_CAPACITY: usize = 4096;

/// A chunk of legacy bytes that originated from the given group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BytesOnGroup<'a> {
    pub group: Group,
    pub bytes: &'a [u8],
}

#[derive(Debug, Default)]
struct SysexBuffer {
    bytes: Vec<u8>,
    open: bool,
}

impl SysexBuffer {
    fn push(
        &mut self,
        byte: u8,
        capacity: usize,
        group: Group,
        sink: &mut impl FnMut(BytesOnGroup<'_>),
    ) {
        if self.bytes.len() >= capacity {
            self.flush(group, sink);
        }
        self.bytes.push(byte);
    }

    fn flush(&mut self, group: Group, sink: &mut impl FnMut(BytesOnGroup<'_>)) {
        if self.bytes.is_empty() {
            return;
        }
        sink(BytesOnGroup {
            group,
            bytes: &self.bytes,
        });
        self.bytes.clear();
    }

    fn discard(&mut self) {
        self.bytes.clear();
        self.open = false;
    }
}

/// Converts packets into legacy byte chunks.
///
/// Sysex messages are reassembled per group. Messages that exceed the
/// capacity are emitted in multiple consecutive chunks, the first starting
/// with `0xf0` and the last ending with `0xf7`.
#[derive(Debug)]
pub struct ToBytestream {
    capacity: usize,
    sysex: [SysexBuffer; Group::COUNT],
}

impl Default for ToBytestream {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ToBytestream {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug_assert!(capacity >= 3);
        Self {
            capacity: capacity.max(3),
            sysex: Default::default(),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discards all partially reassembled sysex messages.
    pub fn reset(&mut self) {
        for buffer in &mut self.sysex {
            buffer.discard();
        }
    }

    /// Converts a single packet.
    ///
    /// Malformed packets are logged and dropped.
    pub fn convert(&mut self, view: View<'_>, mut sink: impl FnMut(BytesOnGroup<'_>)) {
        if let Err(err) = self.try_convert(view, &mut sink) {
            log::warn!("Dropping malformed packet {view:?}: {err}");
        }
    }

    /// Converts all packets of a word buffer.
    pub fn convert_words(&mut self, words: &[u32], mut sink: impl FnMut(BytesOnGroup<'_>)) {
        for view in super::views(words) {
            self.convert(view, &mut sink);
        }
    }

    fn try_convert(
        &mut self,
        view: View<'_>,
        sink: &mut impl FnMut(BytesOnGroup<'_>),
    ) -> Result<(), ParseError> {
        match view.message_type() {
            MessageType::Utility => Ok(()),
            MessageType::System | MessageType::Midi1ChannelVoice => {
                self.convert_message(view, sink)
            }
            MessageType::Midi2ChannelVoice => {
                let mut result = Ok(());
                translate::midi2_to_midi1(view, |translated| {
                    if result.is_ok() {
                        result = self.convert_message(translated, sink);
                    }
                });
                result
            }
            MessageType::Sysex7 => self.convert_sysex7(view, sink),
            message_type => {
                log::trace!("No byte stream representation for {message_type:?} packet {view:?}");
                Ok(())
            }
        }
    }

    fn convert_message(
        &mut self,
        view: View<'_>,
        sink: &mut impl FnMut(BytesOnGroup<'_>),
    ) -> Result<(), ParseError> {
        let status = view.byte(1);
        let valid = match view.message_type() {
            MessageType::System => status >= 0xf0,
            _ => (0x80..0xf0).contains(&status),
        };
        let Some(len) = message_len(status).filter(|_| valid) else {
            return Err(ParseError::InvalidStatus { status });
        };
        let group = view.group();
        if status < 0xf8 {
            let buffer = &mut self.sysex[usize::from(group.index())];
            if buffer.open {
                log::debug!("Discarding sysex on group {group} interrupted by {status:#04x}");
                buffer.discard();
            }
        }
        let bytes = [status, view.byte(2), view.byte(3)];
        sink(BytesOnGroup {
            group,
            bytes: &bytes[..len],
        });
        Ok(())
    }

    fn convert_sysex7(
        &mut self,
        view: View<'_>,
        sink: &mut impl FnMut(BytesOnGroup<'_>),
    ) -> Result<(), ParseError> {
        let group = view.group();
        let capacity = self.capacity;
        let buffer = &mut self.sysex[usize::from(group.index())];
        let count = view.byte(1) & 0xf;
        if usize::from(count) > MAX_SYSEX7_PAYLOAD {
            buffer.discard();
            return Err(ParseError::SysexByteCount { count });
        }
        let Some(status) = Sysex7Status::from_nibble(view.byte(1) >> 4) else {
            buffer.discard();
            return Err(ParseError::InvalidStatus {
                status: view.byte(1),
            });
        };
        match status {
            Sysex7Status::Complete | Sysex7Status::Start => {
                if buffer.open {
                    log::debug!("{}", ParseError::InterruptedSysex { group });
                    buffer.discard();
                }
                buffer.open = true;
                buffer.push(0xf0, capacity, group, sink);
            }
            Sysex7Status::Continue | Sysex7Status::End => {
                if !buffer.open {
                    return Err(ParseError::UnexpectedSysexStatus { status, group });
                }
            }
        }
        let words = view.words();
        for index in 0..usize::from(count) {
            let byte = word_byte(words[(index + 2) / 4], (index + 2) % 4);
            buffer.push(byte & 0x7f, capacity, group, sink);
        }
        if matches!(status, Sysex7Status::Complete | Sysex7Status::End) {
            buffer.push(0xf7, capacity, group, sink);
            buffer.flush(group, sink);
            buffer.open = false;
        }
        Ok(())
    }
}
