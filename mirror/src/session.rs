use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::error::SyncError;
use crate::engine::handler::SessionHandler;
use crate::remote::connection::RemoteConnection;
use crate::remote::error::TransportError;
use crate::remote::event::RemoteEvent;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(
        "companion app disconnected: {}",
        .reason.as_deref().unwrap_or("connection lost")
    )]
    Disconnected { reason: Option<String> },
}

/// Binds one transport connection to the handler that mirrors it.
#[derive(Debug)]
pub struct MirrorSession {
    connection: RemoteConnection,
    handler: SessionHandler,
    /// Credential used for the next connect.
    api_key: Option<String>,
}

impl MirrorSession {
    pub fn new(connection: RemoteConnection, api_key: Option<String>) -> Self {
        Self {
            connection,
            handler: SessionHandler::new(),
            api_key,
        }
    }

    pub fn handler(&self) -> &SessionHandler {
        &self.handler
    }

    /// For registering listeners; the graph itself is only changed by `run`.
    pub fn handler_mut(&mut self) -> &mut SessionHandler {
        &mut self.handler
    }

    pub fn connection(&self) -> &RemoteConnection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut RemoteConnection {
        &mut self.connection
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    /// Connect with the remembered credential and remember the one returned.
    pub async fn connect(&mut self) -> Result<String, TransportError> {
        let api_key = self.connection.connect(self.api_key.as_deref()).await?;
        self.api_key = Some(api_key.clone());
        Ok(api_key)
    }

    /// Connect, falling back to a fresh pairing if the stored credential
    /// does not get through the handshake.
    pub async fn connect_or_pair(&mut self) -> Result<String, TransportError> {
        match self.connect().await {
            Ok(api_key) => Ok(api_key),
            Err(e) if self.api_key.is_some() => {
                warn!(error = %e, "connecting with stored credential failed, pairing again");
                self.api_key = None;
                self.connect().await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the mirrored state and go through the handshake again.
    pub async fn restart(&mut self) -> Result<String, TransportError> {
        info!("restarting session");
        self.connection.disconnect();
        self.handler.reset();
        self.connect().await
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
    }

    /// Feed transport events into the handler until `cancel` fires.
    ///
    /// Returns `Ok` on cancellation. Losing the transport resets the handler
    /// and returns `Disconnected`; a consistency fault returns `Sync` with the
    /// connection still open so the caller can decide whether to restart.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), SessionError> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                event = self.connection.next_event() => Some(event),
            };
            let Some(event) = next else {
                self.connection.disconnect();
                return Ok(());
            };

            match event {
                Some(RemoteEvent::Frame(frame)) => {
                    if let Err(e) = self.handler.handle(frame) {
                        error!(error = %e, "failed to reconcile frame");
                        return Err(e.into());
                    }
                }
                Some(RemoteEvent::Ready { api_key }) => {
                    self.api_key = Some(api_key);
                }
                Some(RemoteEvent::Error { message }) => {
                    warn!(%message, "transport reported an error");
                }
                Some(RemoteEvent::Connected) => debug!("transport connected"),
                Some(RemoteEvent::Disconnected { reason }) => {
                    self.handler.reset();
                    return Err(SessionError::Disconnected { reason });
                }
                None => {
                    self.handler.reset();
                    return Err(SessionError::Disconnected { reason: None });
                }
            }
        }
    }
}
