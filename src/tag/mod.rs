pub mod emulated;
pub mod error;
pub mod protocol;

pub use emulated::EmulatedTag;
pub use error::{ConfigurationError, ProtocolFault};
pub use protocol::{ReverseConnectionProtocol, TagProtocol};

use std::fmt;
use std::str::FromStr;

use crate::channel::RawChannel;

/// Invoked once for every raw channel the reader establishes.
pub type ConnectionCallback = Box<dyn FnMut(RawChannel) + Send>;

/// Opaque diagnostic code the host passes when the link goes away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeactivationReason(pub i32);

impl DeactivationReason {
    pub const LINK_LOSS: DeactivationReason = DeactivationReason(0);
    pub const DESELECTED: DeactivationReason = DeactivationReason(1);
}

impl fmt::Display for DeactivationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::LINK_LOSS => write!(f, "link loss (0)"),
            Self::DESELECTED => write!(f, "deselected (1)"),
            Self(code) => write!(f, "unknown ({code})"),
        }
    }
}

/// ISO 7816-4 application identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Aid(Vec<u8>);

impl Aid {
    const MIN_LEN: usize = 5;
    const MAX_LEN: usize = 16;

    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ConfigurationError> {
        let bytes = bytes.into();
        if !(Self::MIN_LEN..=Self::MAX_LEN).contains(&bytes.len()) {
            return Err(ConfigurationError::InvalidLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn from_hex(value: &str) -> Result<Self, ConfigurationError> {
        Self::new(hex::decode(value.trim())?)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for Aid {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Display for Aid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.0))
    }
}
