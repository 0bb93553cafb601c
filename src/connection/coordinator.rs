//! Single task that performs every registry write and event publication.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    ConnectionEventBus, ConnectionRegistry, ConnectionState, EstablishmentOutcome, OwnerId,
    SessionId, TagHandle, TechnologyMap,
};
use crate::channel::{RawChannel, RecordChannel};

const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum CoordinatorMessage {
    Establishment {
        owner: OwnerId,
        outcome: EstablishmentOutcome,
    },
    Retire(OwnerId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub established: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retired: u64,
}

impl CoordinatorStats {
    /// Pipelines that reached the coordinator, whatever their outcome.
    pub fn settled(&self) -> u64 {
        self.established + self.failed + self.cancelled
    }
}

pub struct Coordinator {
    registry: Arc<ConnectionRegistry>,
    bus: Arc<ConnectionEventBus>,
    stats: watch::Sender<CoordinatorStats>,
}

impl Coordinator {
    /// Starts the coordinator on `runtime`.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        bus: Arc<ConnectionEventBus>,
        reconcile_interval: Duration,
        runtime: &Handle,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stats, stats_rx) = watch::channel(CoordinatorStats::default());
        let shutdown = CancellationToken::new();

        let coordinator = Self {
            registry,
            bus,
            stats,
        };
        let task = runtime.spawn(coordinator.run(rx, reconcile_interval, shutdown.clone()));

        let handle = CoordinatorHandle {
            tx,
            stats: stats_rx,
            shutdown,
        };
        (handle, task)
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
        reconcile_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let reconcile_interval = reconcile_interval.max(MIN_RECONCILE_INTERVAL);
        let mut reconcile = tokio::time::interval_at(
            tokio::time::Instant::now() + reconcile_interval,
            reconcile_interval,
        );
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(?reconcile_interval, "Connection coordinator started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                // backstop, retire removes entries eagerly
                _ = reconcile.tick() => {
                    self.registry.reconcile();
                }
            }
        }
        info!("Connection coordinator stopped");
    }

    fn handle(&self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Establishment { owner, outcome } => self.on_establishment(owner, outcome),
            CoordinatorMessage::Retire(owner) => {
                self.registry.retire(owner);
                self.stats.send_modify(|stats| stats.retired += 1);
            }
        }
    }

    fn on_establishment(&self, owner: OwnerId, outcome: EstablishmentOutcome) {
        debug!(%owner, channel = outcome.raw().id(), from = ?ConnectionState::Pending, to = ?outcome.state(), "Connection settled");
        match outcome {
            EstablishmentOutcome::Established { raw, record } => self.register(owner, raw, record),
            EstablishmentOutcome::Failed { raw, error } => {
                warn!(%owner, channel = raw.id(), %error, "Connection establishment failed");
                self.stats.send_modify(|stats| stats.failed += 1);
            }
            EstablishmentOutcome::Cancelled { raw } => {
                info!(%owner, channel = raw.id(), "Connection terminated while establishing");
                self.stats.send_modify(|stats| stats.cancelled += 1);
            }
        }
    }

    fn register(&self, owner: OwnerId, raw: RawChannel, record: RecordChannel) {
        if raw.is_terminated() {
            info!(%owner, channel = raw.id(), "Connection terminated before registration");
            self.stats.send_modify(|stats| stats.cancelled += 1);
            return;
        }

        let session_id = SessionId::generate();
        let channel = raw.id();
        if let Err(e) = self
            .registry
            .register(owner, session_id.clone(), TechnologyMap::new(raw, record))
        {
            info!(%owner, channel, error = %e, "Connection discarded");
            self.stats.send_modify(|stats| stats.cancelled += 1);
            return;
        }

        let handle = TagHandle::new(session_id);
        let delivered = self.bus.publish(&handle);
        info!(%owner, channel, session_id = %handle.session_id(), delivered, "Connection established");
        self.stats.send_modify(|stats| stats.established += 1);
    }
}

/// Sending side of a running coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
    stats: watch::Receiver<CoordinatorStats>,
    shutdown: CancellationToken,
}

impl CoordinatorHandle {
    pub fn sender(&self) -> mpsc::UnboundedSender<CoordinatorMessage> {
        self.tx.clone()
    }

    /// Allocates an owner in `registry` that retires itself when dropped.
    pub fn lease(&self, registry: &ConnectionRegistry) -> OwnerLease {
        OwnerLease {
            owner: registry.allocate_owner(),
            retire: self.tx.clone(),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        *self.stats.borrow()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<CoordinatorStats> {
        self.stats.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Owner identity of a live service instance.
#[derive(Debug)]
pub struct OwnerLease {
    owner: OwnerId,
    retire: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl OwnerLease {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl Drop for OwnerLease {
    fn drop(&mut self) {
        // the coordinator may already be gone during shutdown
        let _ = self.retire.send(CoordinatorMessage::Retire(self.owner));
    }
}
