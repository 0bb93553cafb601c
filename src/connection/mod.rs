//! Logical connections: identifiers, technology maps and the machinery that
//! registers and announces them.

pub mod coordinator;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod registry;
pub mod resolver;

pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorMessage, CoordinatorStats, OwnerLease};
pub use error::{EstablishmentFailure, RegistryError, SubscriberFault};
pub use events::{ConnectionEventBus, SubscriptionId};
pub use pipeline::EstablishmentOutcome;
pub use registry::{ConnectionRegistry, OwnerId, RegistryEntry};
pub use resolver::{ResolveTechnology, TechnologyResolver, TechnologyResolverBuilder};

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{RawChannel, RecordChannel};

/// Opaque identifier minted once per established logical connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload of a connection event. Channels are looked up through a
/// [`TechnologyResolver`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagHandle {
    session_id: SessionId,
}

impl TagHandle {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TechnologyKind {
    RawChannel,
    RecordChannel,
}

#[derive(Debug, Clone)]
pub enum Technology {
    Raw(RawChannel),
    Record(RecordChannel),
}

impl Technology {
    pub fn kind(&self) -> TechnologyKind {
        match self {
            Technology::Raw(_) => TechnologyKind::RawChannel,
            Technology::Record(_) => TechnologyKind::RecordChannel,
        }
    }

    pub fn into_raw(self) -> Option<RawChannel> {
        match self {
            Technology::Raw(channel) => Some(channel),
            Technology::Record(_) => None,
        }
    }

    pub fn into_record(self) -> Option<RecordChannel> {
        match self {
            Technology::Record(channel) => Some(channel),
            Technology::Raw(_) => None,
        }
    }
}

/// Channels of one logical connection. Both are required up front so a map is
/// never observable with only one of them.
#[derive(Debug, Clone)]
pub struct TechnologyMap {
    raw: RawChannel,
    record: RecordChannel,
}

impl TechnologyMap {
    pub fn new(raw: RawChannel, record: RecordChannel) -> Self {
        Self { raw, record }
    }

    pub fn get(&self, kind: TechnologyKind) -> Technology {
        match kind {
            TechnologyKind::RawChannel => Technology::Raw(self.raw.clone()),
            TechnologyKind::RecordChannel => Technology::Record(self.record.clone()),
        }
    }

    pub fn raw(&self) -> &RawChannel {
        &self.raw
    }

    pub fn record(&self) -> &RecordChannel {
        &self.record
    }

    pub fn state(&self) -> ConnectionState {
        if self.raw.is_terminated() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Established
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Raw channel accepted, record read in flight.
    Pending,
    Established,
    Disconnected,
}

impl ConnectionState {
    pub fn can_transition_to(&self, new_state: &ConnectionState) -> bool {
        matches!(
            (self, new_state),
            (ConnectionState::Pending, ConnectionState::Established)
                | (ConnectionState::Pending, ConnectionState::Disconnected)
                | (ConnectionState::Established, ConnectionState::Disconnected)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::record::tests::record_channel;

    #[test]
    fn test_session_ids_are_unique() {
        let first = SessionId::generate();
        let second = SessionId::generate();
        assert_ne!(first, second);
        assert!(Uuid::parse_str(first.as_str()).is_ok());
    }

    #[test]
    fn test_tag_handle_serialization() {
        let handle = TagHandle::new(SessionId::from("6d1f0b7e-5b0c-4c43-9a53-0f0e8b2c9d11".to_string()));
        let json = serde_json::to_string(&handle).unwrap();
        assert_eq!(json, r#"{"sessionId":"6d1f0b7e-5b0c-4c43-9a53-0f0e8b2c9d11"}"#);
        assert_eq!(serde_json::from_str::<TagHandle>(&json).unwrap(), handle);
    }

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Pending.can_transition_to(&Established));
        assert!(Pending.can_transition_to(&Disconnected));
        assert!(Established.can_transition_to(&Disconnected));
        assert!(!Disconnected.can_transition_to(&Established));
        assert!(!Established.can_transition_to(&Pending));
        assert!(!Disconnected.can_transition_to(&Disconnected));
    }

    #[test]
    fn test_map_follows_raw_channel() {
        let raw = RawChannel::new();
        let map = TechnologyMap::new(raw.clone(), record_channel(&raw));
        assert_eq!(map.get(TechnologyKind::RawChannel).kind(), TechnologyKind::RawChannel);
        assert!(map.get(TechnologyKind::RecordChannel).into_record().is_some());
        assert_eq!(map.state(), ConnectionState::Established);

        map.record().force_disconnect();
        assert_eq!(map.state(), ConnectionState::Disconnected);
    }
}
