//! Raw command/response channel of a reverse connection.
//!
//! The emulated side queues command APDUs with [`RawChannel::transceive`]; the reader
//! picks them up by polling through the tag protocol and hands back the response on
//! its next poll. Exactly one exchange is in flight at a time.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ChannelError, Transceive};
use crate::tag::DeactivationReason;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    /// A protocol-level close was requested and waits for the reader's acknowledgement.
    Closing,
    Disconnected,
    Aborted,
}

impl ChannelState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChannelState::Disconnected | ChannelState::Aborted)
    }
}

/// What the reader receives when it polls the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderPoll {
    Command(Vec<u8>),
    Idle,
    CloseRequested,
    Terminated,
}

struct PendingExchange {
    command: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

struct Shared {
    state: ChannelState,
    queued: Option<PendingExchange>,
    in_flight: Option<oneshot::Sender<Vec<u8>>>,
}

struct Inner {
    id: u64,
    shared: Mutex<Shared>,
    exchange: tokio::sync::Mutex<()>,
    terminated: CancellationToken,
}

/// Live command/response transport to a single connected reader.
#[derive(Clone)]
pub struct RawChannel {
    inner: Arc<Inner>,
}

impl RawChannel {
    pub fn new() -> Self {
        let id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(channel = id, "Raw channel opened");
        Self {
            inner: Arc::new(Inner {
                id,
                shared: Mutex::new(Shared {
                    state: ChannelState::Open,
                    queued: None,
                    in_flight: None,
                }),
                exchange: tokio::sync::Mutex::new(()),
                terminated: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn state(&self) -> ChannelState {
        self.inner.shared.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    /// Resolves once the channel reached a terminal state and returns that state.
    pub async fn terminated(&self) -> ChannelState {
        self.inner.terminated.cancelled().await;
        self.state()
    }

    /// Sends a command to the reader and waits for its response.
    ///
    /// Returns as soon as the channel terminates, whether or not the reader has
    /// picked up the command.
    pub async fn transceive(&self, command: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let _exchange = self.inner.exchange.lock().await;
        let (reply, response) = oneshot::channel();
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != ChannelState::Open {
                return Err(state_error(shared.state));
            }
            shared.queued = Some(PendingExchange {
                command: command.to_vec(),
                reply,
            });
        }
        debug!(channel = self.inner.id, "TX: {}", hex::encode_upper(command));

        tokio::select! {
            biased;
            _ = self.inner.terminated.cancelled() => Err(state_error(self.state())),
            response = response => match response {
                Ok(rx) => {
                    debug!(channel = self.inner.id, "RX: {}", hex::encode_upper(&rx));
                    Ok(rx)
                }
                Err(_) => Err(state_error(self.state())),
            },
        }
    }

    /// Requests a protocol-level close and waits until the channel terminated.
    pub async fn disconnect(&self) -> ChannelState {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state == ChannelState::Open {
                info!(channel = self.inner.id, "Close requested");
                shared.state = ChannelState::Closing;
            }
        }
        self.terminated().await
    }

    /// Aborts the channel immediately. Returns `true` only for the call that
    /// performed the transition.
    pub fn force_disconnect(&self) -> bool {
        let aborted = self.terminate(ChannelState::Aborted);
        if aborted {
            info!(channel = self.inner.id, "Raw channel aborted");
        }
        aborted
    }

    /// Reader side: delivers the response to the command in flight (empty if none)
    /// and fetches what the reader should see next.
    pub fn on_reader_poll(&self, response: &[u8]) -> Result<ReaderPoll, ChannelError> {
        let mut shared = self.inner.shared.lock();
        if shared.state.is_terminal() {
            return Ok(ReaderPoll::Terminated);
        }

        match shared.in_flight.take() {
            // the waiting side may have given up already
            Some(reply) => {
                let _ = reply.send(response.to_vec());
            }
            None if !response.is_empty() => return Err(ChannelError::UnsolicitedResponse),
            None => {}
        }

        if shared.state == ChannelState::Closing {
            shared.queued = None;
            return Ok(ReaderPoll::CloseRequested);
        }

        match shared.queued.take() {
            Some(pending) if !pending.reply.is_closed() => {
                shared.in_flight = Some(pending.reply);
                Ok(ReaderPoll::Command(pending.command))
            }
            _ => Ok(ReaderPoll::Idle),
        }
    }

    /// Reader side: the reader acknowledged a close or hung up on its own.
    pub fn on_reader_disconnect(&self) -> bool {
        let disconnected = self.terminate(ChannelState::Disconnected);
        if disconnected {
            info!(channel = self.inner.id, "Reader disconnected");
        }
        disconnected
    }

    /// Reader side: the host reported the link as lost.
    pub fn on_link_lost(&self, reason: DeactivationReason) -> bool {
        let disconnected = self.terminate(ChannelState::Disconnected);
        if disconnected {
            info!(channel = self.inner.id, %reason, "Link lost");
        }
        disconnected
    }

    fn terminate(&self, state: ChannelState) -> bool {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state.is_terminal() {
                return false;
            }
            shared.state = state;
            shared.queued = None;
            shared.in_flight = None;
        }
        self.inner.terminated.cancel();
        true
    }
}

impl Default for RawChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RawChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawChannel")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

#[async_trait]
impl Transceive for RawChannel {
    async fn transceive(&self, command: &[u8]) -> Result<Vec<u8>, ChannelError> {
        RawChannel::transceive(self, command).await
    }
}

fn state_error(state: ChannelState) -> ChannelError {
    match state {
        ChannelState::Aborted => ChannelError::Aborted,
        ChannelState::Closing => ChannelError::Closing,
        ChannelState::Open | ChannelState::Disconnected => ChannelError::Disconnected,
    }
}
