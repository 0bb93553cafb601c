//! Proprietary reverse-connection protocol.
//!
//! The reader opens a connection with `CONNECT`, then keeps polling with `TRANSCEIVE`,
//! carrying the response to the previous command in the data field and receiving the
//! next command in return. `DISCONNECT` acknowledges a close request or hangs up.

use std::fmt;

use tracing::{debug, info, warn};

use super::{ConnectionCallback, DeactivationReason, ProtocolFault};
use crate::apdu::{CommandApdu, StatusWord};
use crate::channel::{RawChannel, ReaderPoll};

pub const CLA_PROPRIETARY: u8 = 0x80;
pub const INS_CONNECT: u8 = 0x10;
pub const INS_TRANSCEIVE: u8 = 0x12;
pub const INS_DISCONNECT: u8 = 0x14;

/// Nothing queued, poll again.
pub const SW_NO_COMMAND: StatusWord = StatusWord(0x9100);
/// The emulated side wants to close; the reader answers with `DISCONNECT`.
pub const SW_CLOSE_REQUESTED: StatusWord = StatusWord(0x9101);

/// Application protocol behind a selected emulated tag.
pub trait TagProtocol: Send {
    /// Called every time the tag's AID is selected.
    fn on_selected(&mut self) -> Result<(), ProtocolFault> {
        Ok(())
    }

    /// Handles a command addressed to the selected application.
    fn process(&mut self, command: &CommandApdu) -> Result<Vec<u8>, ProtocolFault>;

    /// The link to the reader went away; every live channel must terminate.
    fn on_deactivated(&mut self, reason: DeactivationReason) -> Result<(), ProtocolFault>;

    /// Channel of the most recent connection, if any.
    fn raw_channel(&self) -> Option<RawChannel>;
}

pub struct ReverseConnectionProtocol {
    on_connection: ConnectionCallback,
    current: Option<RawChannel>,
    // superseded by a later CONNECT but not terminated yet
    previous: Vec<RawChannel>,
}

impl ReverseConnectionProtocol {
    pub fn new(on_connection: ConnectionCallback) -> Self {
        Self {
            on_connection,
            current: None,
            previous: Vec::new(),
        }
    }

    fn connect(&mut self) -> Vec<u8> {
        self.previous.retain(|channel| !channel.is_terminated());
        if let Some(superseded) = self.current.take() {
            if !superseded.is_terminated() {
                debug!(channel = superseded.id(), "Connection superseded");
                self.previous.push(superseded);
            }
        }

        let channel = RawChannel::new();
        info!(channel = channel.id(), "Reverse connection accepted");
        self.current = Some(channel.clone());
        (self.on_connection)(channel);
        StatusWord::SUCCESS.into()
    }

    fn transceive(&mut self, response: &[u8]) -> Result<Vec<u8>, ProtocolFault> {
        let Some(channel) = &self.current else {
            return Ok(StatusWord::CONDITIONS_NOT_SATISFIED.into());
        };

        Ok(match channel.on_reader_poll(response)? {
            ReaderPoll::Command(command) => StatusWord::SUCCESS.with_data(&command),
            ReaderPoll::Idle => SW_NO_COMMAND.into(),
            ReaderPoll::CloseRequested => SW_CLOSE_REQUESTED.into(),
            ReaderPoll::Terminated => {
                self.current = None;
                StatusWord::CONDITIONS_NOT_SATISFIED.into()
            }
        })
    }

    fn disconnect(&mut self) -> Vec<u8> {
        match self.current.take() {
            Some(channel) => {
                channel.on_reader_disconnect();
                StatusWord::SUCCESS.into()
            }
            None => StatusWord::CONDITIONS_NOT_SATISFIED.into(),
        }
    }
}

impl TagProtocol for ReverseConnectionProtocol {
    fn process(&mut self, command: &CommandApdu) -> Result<Vec<u8>, ProtocolFault> {
        if command.cla != CLA_PROPRIETARY {
            warn!(cla = command.cla, "Unsupported class byte");
            return Ok(StatusWord::CLA_NOT_SUPPORTED.into());
        }

        match command.ins {
            INS_CONNECT => Ok(self.connect()),
            INS_TRANSCEIVE => self.transceive(&command.data),
            INS_DISCONNECT => Ok(self.disconnect()),
            ins => {
                warn!(ins, "Unsupported instruction");
                Ok(StatusWord::INS_NOT_SUPPORTED.into())
            }
        }
    }

    fn on_deactivated(&mut self, reason: DeactivationReason) -> Result<(), ProtocolFault> {
        for channel in self.current.take().into_iter().chain(self.previous.drain(..)) {
            channel.on_link_lost(reason);
        }
        Ok(())
    }

    fn raw_channel(&self) -> Option<RawChannel> {
        self.current.clone().filter(|channel| !channel.is_terminated())
    }
}

impl fmt::Debug for ReverseConnectionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseConnectionProtocol")
            .field("current", &self.current)
            .field("previous", &self.previous.len())
            .finish()
    }
}
