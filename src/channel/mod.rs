pub mod error;
pub mod ndef;
pub mod raw;
pub mod record;

pub use error::{ChannelError, RecordError};
pub use ndef::{CapabilityContainer, NdefConnection, NdefMessage, NdefRecord, Tnf};
pub use raw::{ChannelState, RawChannel, ReaderPoll};
pub use record::RecordChannel;

use async_trait::async_trait;

/// Command/response transport the record layer talks through.
#[async_trait]
pub trait Transceive: Send + Sync {
    /// Sends a command APDU and waits for the peer's response APDU.
    async fn transceive(&self, command: &[u8]) -> Result<Vec<u8>, ChannelError>;
}
