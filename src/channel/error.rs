use thiserror::Error;

use crate::apdu::{ApduError, StatusWord};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Channel was forcibly aborted")]
    Aborted,

    #[error("Channel is disconnected")]
    Disconnected,

    #[error("Channel is closing")]
    Closing,

    #[error("Reader delivered a response while no command was in flight")]
    UnsolicitedResponse,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Malformed response APDU: {0}")]
    Apdu(#[from] ApduError),

    #[error("{command} failed with status {status}")]
    Status {
        command: &'static str,
        status: StatusWord,
    },

    #[error("Malformed capability container: {0}")]
    MalformedCapabilityContainer(String),

    #[error("Malformed NDEF message: {0}")]
    MalformedMessage(String),

    #[error("NDEF file is not readable")]
    Unreadable,

    #[error("NDEF file is read-only")]
    ReadOnly,

    #[error("NDEF message of {size} bytes exceeds file capacity of {max} bytes")]
    TooLarge { size: usize, max: usize },
}

impl RecordError {
    /// Whether the error stems from the transport being torn down.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            RecordError::Channel(ChannelError::Aborted | ChannelError::Disconnected)
        )
    }
}
