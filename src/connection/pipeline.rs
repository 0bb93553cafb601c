//! Background establishment of a logical connection on top of an accepted raw
//! channel.

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{ConnectionState, CoordinatorMessage, EstablishmentFailure, OwnerId};
use crate::channel::{NdefConnection, RawChannel, RecordChannel};

#[derive(Debug)]
pub enum EstablishmentOutcome {
    Established { raw: RawChannel, record: RecordChannel },
    Failed { raw: RawChannel, error: EstablishmentFailure },
    /// The raw channel terminated before the record channel was ready.
    Cancelled { raw: RawChannel },
}

impl EstablishmentOutcome {
    pub fn raw(&self) -> &RawChannel {
        match self {
            Self::Established { raw, .. } | Self::Failed { raw, .. } | Self::Cancelled { raw } => raw,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Established { .. } => ConnectionState::Established,
            Self::Failed { .. } | Self::Cancelled { .. } => ConnectionState::Disconnected,
        }
    }
}

/// Reads the record layer through `raw`. Forcing the resulting record channel
/// aborts `raw` itself.
pub async fn establish(raw: RawChannel) -> EstablishmentOutcome {
    match NdefConnection::open(raw.clone()).await {
        Ok(connection) => {
            let target = raw.clone();
            let record = RecordChannel::wrap(connection, move || target.force_disconnect());
            EstablishmentOutcome::Established { raw, record }
        }
        Err(e) if e.is_terminated() || raw.is_terminated() => {
            debug!(channel = raw.id(), error = %e, "Record read interrupted");
            EstablishmentOutcome::Cancelled { raw }
        }
        Err(e) => EstablishmentOutcome::Failed {
            raw,
            error: e.into(),
        },
    }
}

/// Runs [`establish`] on `runtime` and hands the outcome to the coordinator.
pub fn spawn(
    runtime: &Handle,
    owner: OwnerId,
    raw: RawChannel,
    coordinator: mpsc::UnboundedSender<CoordinatorMessage>,
) -> JoinHandle<()> {
    debug!(%owner, channel = raw.id(), state = ?ConnectionState::Pending, "Establishing connection");
    runtime.spawn(async move {
        let outcome = establish(raw).await;
        let channel = outcome.raw().id();
        if coordinator
            .send(CoordinatorMessage::Establishment { owner, outcome })
            .is_err()
        {
            warn!(%owner, channel, error = %EstablishmentFailure::HandOff, "Connection dropped");
        }
    })
}
