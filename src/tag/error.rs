use thiserror::Error;

use crate::channel::ChannelError;

/// Raised once at startup when the configured AID is unusable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("AID is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("AID must be 5 to 16 bytes long, got {0}")]
    InvalidLength(usize),
}

/// Failure while dispatching a command APDU.
#[derive(Debug, Error)]
pub enum ProtocolFault {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol violation: {0}")]
    Violation(String),

    #[error("Protocol handler panicked: {0}")]
    Panicked(String),
}
