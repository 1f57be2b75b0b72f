// SPDX-FileCopyrightText: The umpio authors
// SPDX-License-Identifier: MPL-2.0

//! Low-level API driven by [`midir`].
//!
//! `midir` transmits every message synchronously. Long messages are thus
//! done as soon as they have been handed over.

use midir::{
    ConnectError, Ignore, InitError, MidiInput, MidiInputConnection, MidiOutput,
    MidiOutputConnection, PortInfoError, SendError,
};
use thiserror::Error;

use super::{
    InputCallback, InputEvent, LowLevelApi, LowLevelDeviceInfo, LowLevelError, LowLevelInput,
    LowLevelOutput, PendingTransfer,
};
use crate::endpoint::IoKind;

#[derive(Debug, Error)]
pub enum MidirError {
    #[error("no port with index {index}")]
    InvalidPort { index: usize },
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    PortInfo(#[from] PortInfoError),
    #[error(transparent)]
    ConnectInput(#[from] ConnectError<MidiInput>),
    #[error(transparent)]
    ConnectOutput(#[from] ConnectError<MidiOutput>),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl From<MidirError> for LowLevelError {
    fn from(err: MidirError) -> Self {
        match err {
            MidirError::InvalidPort { .. } => Self::InvalidHandle,
            err => Self::Other(err.to_string()),
        }
    }
}

/// Native devices as enumerated by [`midir`].
#[derive(Debug, Clone)]
pub struct MidirApi {
    client_name: String,
}

impl MidirApi {
    /// Fails if the platform MIDI API is not available.
    pub fn new(client_name: impl Into<String>) -> Result<Self, MidirError> {
        let client_name = client_name.into();
        // Check availability
        MidiInput::new(&client_name)?;
        Ok(Self { client_name })
    }

    fn new_input(&self) -> Result<MidiInput, MidirError> {
        let mut input = MidiInput::new(&self.client_name)?;
        input.ignore(Ignore::None);
        Ok(input)
    }

    fn new_output(&self) -> Result<MidiOutput, MidirError> {
        MidiOutput::new(&self.client_name).map_err(Into::into)
    }

    fn port_names(&self, kind: IoKind) -> Result<Vec<String>, MidirError> {
        match kind {
            IoKind::Src => {
                let input = self.new_input()?;
                input
                    .ports()
                    .iter()
                    .map(|port| input.port_name(port).map_err(Into::into))
                    .collect()
            }
            IoKind::Dst => {
                let output = self.new_output()?;
                output
                    .ports()
                    .iter()
                    .map(|port| output.port_name(port).map_err(Into::into))
                    .collect()
            }
        }
    }
}

// Adapter for the midir callback closure
fn handle_input(micros: u64, input: &[u8], callback: &mut InputCallback) {
    #[allow(clippy::cast_precision_loss)]
    let elapsed_millis = micros as f64 / 1000.0;
    callback(InputEvent::Data {
        bytes: input,
        elapsed_millis,
    });
}

impl LowLevelApi for MidirApi {
    fn devices(&self, kind: IoKind) -> Result<Vec<LowLevelDeviceInfo>, LowLevelError> {
        let names = self.port_names(kind)?;
        Ok(names
            .into_iter()
            .map(|name| LowLevelDeviceInfo {
                name,
                interface: String::new(),
            })
            .collect())
    }

    fn open_input(
        &self,
        index: usize,
        callback: InputCallback,
    ) -> Result<Box<dyn LowLevelInput>, LowLevelError> {
        let input = self.new_input()?;
        let Some(port) = input.ports().into_iter().nth(index) else {
            return Err(MidirError::InvalidPort { index }.into());
        };
        let port_name = input.port_name(&port).map_err(MidirError::from)?;
        let connection = input
            .connect(&port, &port_name, handle_input, callback)
            .map_err(MidirError::from)?;
        log::debug!("Connected input port \"{port_name}\"");
        Ok(Box::new(MidirInput {
            connection: Some(connection),
        }))
    }

    fn open_output(&self, index: usize) -> Result<Box<dyn LowLevelOutput>, LowLevelError> {
        let output = self.new_output()?;
        let Some(port) = output.ports().into_iter().nth(index) else {
            return Err(MidirError::InvalidPort { index }.into());
        };
        let port_name = output.port_name(&port).map_err(MidirError::from)?;
        let connection = output
            .connect(&port, &port_name)
            .map_err(MidirError::from)?;
        log::debug!("Connected output port \"{port_name}\"");
        Ok(Box::new(MidirOutput { connection }))
    }
}

#[allow(missing_debug_implementations)]
struct MidirInput {
    connection: Option<MidiInputConnection<InputCallback>>,
}

impl LowLevelInput for MidirInput {
    fn close(&mut self) -> Result<(), LowLevelError> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        drop(connection.close());
        Ok(())
    }
}

#[allow(missing_debug_implementations)]
struct MidirOutput {
    connection: MidiOutputConnection,
}

impl LowLevelOutput for MidirOutput {
    fn short_message(&mut self, message: u32) -> Result<(), LowLevelError> {
        let bytes = message.to_le_bytes();
        let len = crate::ump::bytestream::message_len(bytes[0]).unwrap_or(1);
        self.connection
            .send(&bytes[..len.min(3)])
            .map_err(|err| MidirError::from(err).into())
    }

    fn begin_long_message(
        &mut self,
        bytes: &[u8],
    ) -> Result<Box<dyn PendingTransfer>, LowLevelError> {
        self.connection.send(bytes).map_err(MidirError::from)?;
        Ok(Box::new(Sent))
    }
}

/// A long message that has already been transmitted.
struct Sent;

impl PendingTransfer for Sent {
    fn is_done(&self) -> bool {
        true
    }

    fn release(&mut self) -> Result<(), LowLevelError> {
        Ok(())
    }
}
