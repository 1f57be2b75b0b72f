// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Universal MIDI Packets.
//!
//! Packets are sequences of 1 to 4 native-endian 32-bit words. The top
//! nibble of the first word selects the message type and thereby the
//! number of words, the second nibble selects the group.

use std::fmt;

use strum::{Display, EnumIter, EnumString};
use thiserror::Error;

pub mod bytestream;
pub use self::bytestream::BytestreamToUmp;

pub mod timestamp;
pub use self::timestamp::TimestampConverter;

pub mod to_bytestream;
pub use self::to_bytestream::{BytesOnGroup, ToBytestream};

pub mod translate;
pub use self::translate::GenericConverter;

#[cfg(test)]
mod tests;

/// Number of words per packet, indexed by message type.
const NUM_WORDS_BY_MESSAGE_TYPE: [usize; 16] = [1, 1, 1, 2, 2, 4, 1, 1, 2, 2, 2, 3, 3, 4, 4, 4];

/// Maximum number of payload bytes of a single sysex-7 packet.
pub const MAX_SYSEX7_PAYLOAD: usize = 6;

#[must_use]
pub(crate) const fn bytes_to_word(b0: u8, b1: u8, b2: u8, b3: u8) -> u32 {
    (b0 as u32) << 24 | (b1 as u32) << 16 | (b2 as u32) << 8 | b3 as u32
}

/// Byte `index` of a word, counted from the most significant byte.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn word_byte(word: u32, index: usize) -> u8 {
    (word >> (24 - 8 * index)) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Utility,
    System,
    Midi1ChannelVoice,
    Sysex7,
    Midi2ChannelVoice,
    /// Sysex-8 and mixed data set messages.
    Data,
    FlexData,
    Stream,
    Reserved(u8),
}

impl MessageType {
    #[must_use]
    pub const fn from_word(word: u32) -> Self {
        match (word >> 28) as u8 {
            0x0 => Self::Utility,
            0x1 => Self::System,
            0x2 => Self::Midi1ChannelVoice,
            0x3 => Self::Sysex7,
            0x4 => Self::Midi2ChannelVoice,
            0x5 => Self::Data,
            0xd => Self::FlexData,
            0xf => Self::Stream,
            nibble => Self::Reserved(nibble),
        }
    }

    #[must_use]
    pub const fn nibble(self) -> u8 {
        match self {
            Self::Utility => 0x0,
            Self::System => 0x1,
            Self::Midi1ChannelVoice => 0x2,
            Self::Sysex7 => 0x3,
            Self::Midi2ChannelVoice => 0x4,
            Self::Data => 0x5,
            Self::FlexData => 0xd,
            Self::Stream => 0xf,
            Self::Reserved(nibble) => nibble & 0xf,
        }
    }

    #[must_use]
    pub const fn num_words(self) -> usize {
        NUM_WORDS_BY_MESSAGE_TYPE[self.nibble() as usize]
    }
}

/// One of the 16 groups of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, derive_more::Display)]
pub struct Group(u8);

impl Group {
    pub const COUNT: usize = 16;

    #[must_use]
    pub const fn new(index: u8) -> Option<Self> {
        if (index as usize) < Self::COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    /// Only the lower nibble is considered.
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Self {
        Self(nibble & 0xf)
    }

    #[must_use]
    pub const fn index(self) -> u8 {
        self.0
    }
}

/// The protocol of channel voice messages exchanged with an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter, EnumString)]
pub enum PacketProtocol {
    #[default]
    #[strum(serialize = "MIDI 1.0")]
    Midi1,
    #[strum(serialize = "MIDI 2.0")]
    Midi2,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated packet: expected {expected} words, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid sysex-7 byte count {count}")]
    SysexByteCount { count: u8 },
    #[error("sysex-7 {status} packet without a preceding start on group {group}")]
    UnexpectedSysexStatus { status: Sysex7Status, group: Group },
    #[error("sysex-7 start while a message is still open on group {group}")]
    InterruptedSysex { group: Group },
    #[error("invalid status byte {status:#04x}")]
    InvalidStatus { status: u8 },
}

/// Framing status of a sysex-7 packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Sysex7Status {
    Complete,
    Start,
    Continue,
    End,
}

impl Sysex7Status {
    #[must_use]
    pub const fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Self::Complete),
            0x1 => Some(Self::Start),
            0x2 => Some(Self::Continue),
            0x3 => Some(Self::End),
            _ => None,
        }
    }

    #[must_use]
    pub const fn nibble(self) -> u8 {
        match self {
            Self::Complete => 0x0,
            Self::Start => 0x1,
            Self::Continue => 0x2,
            Self::End => 0x3,
        }
    }
}

/// Borrowed view of a single, complete packet.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct View<'a> {
    words: &'a [u32],
}

impl<'a> View<'a> {
    /// Splits the leading packet off `words`.
    pub fn split_first(words: &'a [u32]) -> Result<(Self, &'a [u32]), ParseError> {
        let Some(first) = words.first() else {
            return Err(ParseError::Truncated {
                expected: 1,
                actual: 0,
            });
        };
        let expected = MessageType::from_word(*first).num_words();
        if words.len() < expected {
            return Err(ParseError::Truncated {
                expected,
                actual: words.len(),
            });
        }
        let (packet, rest) = words.split_at(expected);
        Ok((Self { words: packet }, rest))
    }

    /// The caller must pass exactly one complete packet.
    #[must_use]
    pub(crate) const fn from_words_unchecked(words: &'a [u32]) -> Self {
        Self { words }
    }

    #[must_use]
    pub const fn words(&self) -> &'a [u32] {
        self.words
    }

    #[must_use]
    pub const fn first_word(&self) -> u32 {
        self.words[0]
    }

    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        MessageType::from_word(self.first_word())
    }

    #[must_use]
    pub const fn group(&self) -> Group {
        Group::from_nibble(word_byte(self.first_word(), 0))
    }

    /// Byte `index` of the first word.
    #[must_use]
    pub const fn byte(&self, index: usize) -> u8 {
        word_byte(self.first_word(), index)
    }
}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.words.iter().map(|word| format!("{word:#010x}")))
            .finish()
    }
}

/// Iterates over the packets of a word buffer.
///
/// A truncated trailing packet ends the iteration and is dropped.
#[derive(Debug, Clone)]
pub struct Views<'a> {
    words: &'a [u32],
}

impl<'a> Iterator for Views<'a> {
    type Item = View<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.words.is_empty() {
            return None;
        }
        match View::split_first(self.words) {
            Ok((view, rest)) => {
                self.words = rest;
                Some(view)
            }
            Err(err) => {
                log::warn!(
                    "Dropping malformed packet data {words:08x?}: {err}",
                    words = self.words
                );
                self.words = &[];
                None
            }
        }
    }
}

#[must_use]
pub const fn views(words: &[u32]) -> Views<'_> {
    Views { words }
}

/// Owned buffer of consecutive packets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packets {
    words: Vec<u32>,
}

impl Packets {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn push(&mut self, view: View<'_>) {
        self.words.extend_from_slice(view.words());
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[must_use]
    pub fn iter(&self) -> Views<'_> {
        views(&self.words)
    }
}

impl<'a> IntoIterator for &'a Packets {
    type Item = View<'a>;
    type IntoIter = Views<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl From<Vec<u32>> for Packets {
    fn from(words: Vec<u32>) -> Self {
        Self { words }
    }
}
