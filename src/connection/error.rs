use thiserror::Error;

use super::{OwnerId, SubscriptionId};
use crate::channel::RecordError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Owner {0} is no longer live")]
    OwnerRetired(OwnerId),
}

/// A connection that never reached the registry.
#[derive(Debug, Error)]
pub enum EstablishmentFailure {
    #[error("Record channel setup failed: {0}")]
    Record(#[from] RecordError),

    #[error("Hand-off to the coordinator failed")]
    HandOff,
}

#[derive(Debug, Error)]
pub enum SubscriberFault {
    #[error("Subscriber {subscriber} failed: {source}")]
    Failed {
        subscriber: SubscriptionId,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Subscriber {subscriber} panicked: {message}")]
    Panicked { subscriber: SubscriptionId, message: String },
}
