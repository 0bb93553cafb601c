use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, error, info, warn};

use super::{
    Aid, ConfigurationError, ConnectionCallback, DeactivationReason, ProtocolFault,
    ReverseConnectionProtocol, TagProtocol,
};
use crate::apdu::{CommandApdu, Ins, StatusWord};
use crate::channel::RawChannel;

const SELECT_BY_NAME: u8 = 0x04;

/// Emulated ISO 7816-4 application answering the host's command APDUs.
///
/// Nothing raised while dispatching reaches the host: a faulting exchange yields an
/// empty response and an attempt to deactivate the protocol.
#[derive(Debug)]
pub struct EmulatedTag<P = ReverseConnectionProtocol> {
    aid: Aid,
    selected: bool,
    protocol: P,
}

impl EmulatedTag {
    /// Sets up the reverse-connection protocol under the AID given in hex.
    pub fn initialize(aid_hex: &str, on_connection: ConnectionCallback) -> Result<Self, ConfigurationError> {
        let aid = Aid::from_hex(aid_hex)?;
        info!(%aid, "Emulated tag initialized");
        Ok(Self::with_protocol(aid, ReverseConnectionProtocol::new(on_connection)))
    }
}

impl<P: TagProtocol> EmulatedTag<P> {
    pub fn with_protocol(aid: Aid, protocol: P) -> Self {
        Self {
            aid,
            selected: false,
            protocol,
        }
    }

    pub fn is_selected(&self) -> bool {
        self.selected
    }

    pub fn process_command_apdu(&mut self, apdu: &[u8]) -> Vec<u8> {
        debug!("C-APDU: {}", hex::encode_upper(apdu));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(apdu)))
            .unwrap_or_else(|payload| Err(ProtocolFault::Panicked(panic_message(&*payload))));

        match outcome {
            Ok(response) => {
                debug!("R-APDU: {}", hex::encode_upper(&response));
                response
            }
            Err(fault) => {
                error!(error = %fault, "Couldn't process command APDU");
                self.deactivate(DeactivationReason::LINK_LOSS);
                Vec::new()
            }
        }
    }

    pub fn on_deactivated(&mut self, reason: DeactivationReason) {
        info!(%reason, "Tag deactivated");
        self.deactivate(reason);
    }

    pub fn raw_channel(&self) -> Option<RawChannel> {
        self.protocol.raw_channel()
    }

    fn dispatch(&mut self, apdu: &[u8]) -> Result<Vec<u8>, ProtocolFault> {
        let command = match CommandApdu::parse(apdu) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Malformed command APDU");
                return Ok(StatusWord::WRONG_LENGTH.into());
            }
        };

        if is_select_by_name(&command) {
            if command.data == self.aid.as_bytes() {
                if !self.selected {
                    info!(aid = %self.aid, "Application selected");
                }
                self.selected = true;
                self.protocol.on_selected()?;
                return Ok(StatusWord::SUCCESS.into());
            }
            if self.selected {
                debug!("Another application was selected");
            }
            self.selected = false;
            return Ok(StatusWord::FILE_NOT_FOUND.into());
        }

        if !self.selected {
            return Ok(StatusWord::CONDITIONS_NOT_SATISFIED.into());
        }
        self.protocol.process(&command)
    }

    // Failures here are only logged; the host must never see them.
    fn deactivate(&mut self, reason: DeactivationReason) {
        self.selected = false;
        let protocol = &mut self.protocol;
        match panic::catch_unwind(AssertUnwindSafe(|| protocol.on_deactivated(reason))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Couldn't deactivate protocol"),
            Err(payload) => {
                error!(panic = %panic_message(&*payload), "Protocol panicked during deactivation")
            }
        }
    }
}

fn is_select_by_name(command: &CommandApdu) -> bool {
    command.cla & 0x80 == 0 && command.instruction() == Ins::Select && command.p1 == SELECT_BY_NAME
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
