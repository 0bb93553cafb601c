use std::fmt;
use std::sync::Arc;

use super::{ConnectionRegistry, SessionId, TagHandle, Technology, TechnologyKind};
use crate::channel::{RawChannel, RecordChannel};

/// Maps a session to one of its channels.
pub trait ResolveTechnology: Send + Sync {
    fn resolve(&self, session_id: &SessionId, kind: TechnologyKind) -> Option<Technology>;
}

impl ResolveTechnology for ConnectionRegistry {
    fn resolve(&self, session_id: &SessionId, kind: TechnologyKind) -> Option<Technology> {
        ConnectionRegistry::resolve(self, session_id, kind)
    }
}

impl<F> ResolveTechnology for F
where
    F: Fn(&SessionId, TechnologyKind) -> Option<Technology> + Send + Sync,
{
    fn resolve(&self, session_id: &SessionId, kind: TechnologyKind) -> Option<Technology> {
        self(session_id, kind)
    }
}

/// Ordered chain of resolvers, built once at startup and handed to whoever maps
/// tag handles to channels. The first resolver returning a channel wins.
#[derive(Clone, Default)]
pub struct TechnologyResolver {
    chain: Arc<[Arc<dyn ResolveTechnology>]>,
}

impl TechnologyResolver {
    pub fn builder() -> TechnologyResolverBuilder {
        TechnologyResolverBuilder::default()
    }

    pub fn resolve(&self, handle: &TagHandle, kind: TechnologyKind) -> Option<Technology> {
        self.resolve_session(handle.session_id(), kind)
    }

    pub fn resolve_session(&self, session_id: &SessionId, kind: TechnologyKind) -> Option<Technology> {
        self.chain
            .iter()
            .find_map(|resolver| resolver.resolve(session_id, kind))
            .filter(|technology| technology.kind() == kind)
    }

    pub fn raw_channel(&self, handle: &TagHandle) -> Option<RawChannel> {
        self.resolve(handle, TechnologyKind::RawChannel)
            .and_then(Technology::into_raw)
    }

    pub fn record_channel(&self, handle: &TagHandle) -> Option<RecordChannel> {
        self.resolve(handle, TechnologyKind::RecordChannel)
            .and_then(Technology::into_record)
    }
}

impl fmt::Debug for TechnologyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TechnologyResolver")
            .field("resolvers", &self.chain.len())
            .finish()
    }
}

#[derive(Default)]
pub struct TechnologyResolverBuilder {
    chain: Vec<Arc<dyn ResolveTechnology>>,
}

impl TechnologyResolverBuilder {
    pub fn with(mut self, resolver: Arc<dyn ResolveTechnology>) -> Self {
        self.chain.push(resolver);
        self
    }

    pub fn build(self) -> TechnologyResolver {
        TechnologyResolver {
            chain: self.chain.into(),
        }
    }
}
