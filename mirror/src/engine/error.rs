use thiserror::Error;

use super::ids::{ChannelId, ClientId, ServerId};

/// A structural operation on one server's graph was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("unknown client {0}")]
    UnknownClient(ClientId),

    #[error("channel {0} already exists")]
    DuplicateChannel(ChannelId),

    #[error("client {0} is already placed in a channel")]
    DuplicateClient(ClientId),

    #[error("channel id 0 is reserved for the root channel")]
    ReservedChannelId,

    #[error("clients cannot be placed in the root channel")]
    ClientInRoot,

    #[error("the root channel cannot be moved or deleted")]
    RootImmutable,

    #[error("moving channel {channel} under {parent} would create a cycle")]
    CyclicMove {
        channel: ChannelId,
        parent: ChannelId,
    },
}

/// Reconciling an inbound frame failed. Every variant means the mirrored
/// graph can no longer be trusted for the affected server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("event references unknown server {0}")]
    UnknownServer(ServerId),

    #[error("server {server}: {source}")]
    Graph {
        server: ServerId,
        #[source]
        source: GraphError,
    },

    #[error(
        "server {server}: {} channel(s) still unresolved after {passes} pass(es): {remaining:?}",
        .remaining.len()
    )]
    UnresolvedChannels {
        server: ServerId,
        passes: usize,
        remaining: Vec<ChannelId>,
    },

    #[error("connect status for server {0} carries no connection info")]
    MissingConnectInfo(ServerId),
}

impl SyncError {
    pub(crate) fn graph(server: ServerId) -> impl FnOnce(GraphError) -> SyncError {
        move |source| SyncError::Graph { server, source }
    }
}
