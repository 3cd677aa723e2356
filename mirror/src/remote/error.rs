use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("transport is not open")]
    NotOpen,

    #[error("handshake has not completed")]
    NotAuthenticated,

    #[error(
        "connection closed before the handshake completed: {}",
        .reason.as_deref().unwrap_or("no reason given")
    )]
    ClosedBeforeReady { reason: Option<String> },

    #[error("handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}
