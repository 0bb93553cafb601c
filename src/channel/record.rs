use std::fmt;
use std::sync::Arc;

use super::{ChannelState, NdefConnection, NdefMessage, RawChannel, RecordError};

type AbortFn = dyn Fn() -> bool + Send + Sync;

struct RecordInner {
    connection: NdefConnection<RawChannel>,
    abort: Box<AbortFn>,
}

/// Record exchange channel layered on a raw channel.
///
/// Forced disconnection runs the abort hook given to [`RecordChannel::wrap`] instead
/// of a close exchange on the record layer, and the channel's state is always the
/// state of the raw channel below it.
#[derive(Clone)]
pub struct RecordChannel {
    inner: Arc<RecordInner>,
}

impl RecordChannel {
    pub fn wrap<F>(connection: NdefConnection<RawChannel>, abort: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(RecordInner {
                connection,
                abort: Box::new(abort),
            }),
        }
    }

    /// Records read while the connection was established.
    pub fn records(&self) -> &NdefMessage {
        self.inner.connection.records()
    }

    pub async fn read_records(&self) -> Result<NdefMessage, RecordError> {
        self.inner.connection.read_records().await
    }

    pub async fn write_records(&self, message: &NdefMessage) -> Result<(), RecordError> {
        self.inner.connection.write_records(message).await
    }

    /// Forcibly terminates the connection. Returns `false` if it had already terminated.
    pub fn force_disconnect(&self) -> bool {
        (self.inner.abort)()
    }

    /// Protocol-level close through the raw channel.
    pub async fn disconnect(&self) -> ChannelState {
        self.raw().disconnect().await
    }

    pub fn state(&self) -> ChannelState {
        self.raw().state()
    }

    pub fn is_terminated(&self) -> bool {
        self.raw().is_terminated()
    }

    pub fn raw(&self) -> &RawChannel {
        self.inner.connection.transport()
    }
}

impl fmt::Debug for RecordChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordChannel")
            .field("raw", self.raw())
            .field("records", &self.records().records().len())
            .finish()
    }
}
