//! Host-facing surface: process-wide runtime and per-instance services.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::apdu::StatusWord;
use crate::channel::RawChannel;
use crate::config::Config;
use crate::connection::{
    ConnectionEventBus, ConnectionRegistry, Coordinator, CoordinatorHandle, CoordinatorStats,
    OwnerId, OwnerLease, TechnologyResolver, pipeline,
};
use crate::tag::{ConnectionCallback, DeactivationReason, EmulatedTag};

/// Process-wide state shared by every service instance.
///
/// Built once at startup; the resolver is handed out from here rather than
/// registered globally.
pub struct EmulationRuntime {
    aid: String,
    runtime: Handle,
    registry: Arc<ConnectionRegistry>,
    events: Arc<ConnectionEventBus>,
    resolver: TechnologyResolver,
    coordinator: CoordinatorHandle,
    task: JoinHandle<()>,
}

impl EmulationRuntime {
    pub fn start(config: &Config, runtime: Handle) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let events = Arc::new(ConnectionEventBus::new());
        let resolver = TechnologyResolver::builder().with(registry.clone()).build();
        let (coordinator, task) = Coordinator::spawn(
            registry.clone(),
            events.clone(),
            config.emulation.reconcile_interval(),
            &runtime,
        );

        Self {
            aid: config.emulation.aid.clone(),
            runtime,
            registry,
            events,
            resolver,
            coordinator,
            task,
        }
    }

    /// Creates a service instance. An unusable AID is logged and leaves the
    /// service without a tag.
    pub fn create_service(&self) -> HceService {
        let lease = self.coordinator.lease(&self.registry);
        let owner = lease.owner();

        let runtime = self.runtime.clone();
        let coordinator = self.coordinator.sender();
        let on_connection: ConnectionCallback = Box::new(move |raw: RawChannel| {
            pipeline::spawn(&runtime, owner, raw, coordinator.clone());
        });

        let tag = match EmulatedTag::initialize(&self.aid, on_connection) {
            Ok(tag) => Some(tag),
            Err(e) => {
                error!(%owner, aid = %self.aid, error = %e, "Couldn't initialize emulated tag");
                None
            }
        };
        info!(%owner, initialized = tag.is_some(), "Service created");

        HceService { tag, lease }
    }

    pub fn events(&self) -> &Arc<ConnectionEventBus> {
        &self.events
    }

    pub fn resolver(&self) -> &TechnologyResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> CoordinatorStats {
        self.coordinator.stats()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<CoordinatorStats> {
        self.coordinator.subscribe_stats()
    }

    /// Stops the coordinator and waits for it to finish.
    pub async fn shutdown(self) {
        self.coordinator.shutdown();
        if let Err(e) = self.task.await {
            error!(error = %e, "Coordinator task failed");
        }
    }
}

/// One card-emulation service instance as created by the host.
#[derive(Debug)]
pub struct HceService {
    tag: Option<EmulatedTag>,
    lease: OwnerLease,
}

impl HceService {
    pub fn process_command_apdu(&mut self, apdu: &[u8]) -> Vec<u8> {
        match self.tag.as_mut() {
            Some(tag) => tag.process_command_apdu(apdu),
            None => StatusWord::FUNC_NOT_SUPPORTED.into(),
        }
    }

    pub fn on_deactivated(&mut self, reason: DeactivationReason) {
        if let Some(tag) = self.tag.as_mut() {
            tag.on_deactivated(reason);
        }
    }

    pub fn raw_channel(&self) -> Option<RawChannel> {
        self.tag.as_ref().and_then(EmulatedTag::raw_channel)
    }

    pub fn owner(&self) -> OwnerId {
        self.lease.owner()
    }

    pub fn is_initialized(&self) -> bool {
        self.tag.is_some()
    }

    /// Tears the instance down. Its registry entry goes with the owner lease.
    pub fn on_destroy(self) {
        info!(owner = %self.lease.owner(), "Service destroyed");
    }
}
