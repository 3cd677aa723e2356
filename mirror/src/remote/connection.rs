use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::{EventBus, EventHandler, RemoveMode};
use super::error::TransportError;
use super::event::{EventKind, RemoteEvent};
use super::frame::{AppIdentity, InboundFrame, OutboundFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5899;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where and how long to wait for the companion app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSettings {
    pub host: String,
    pub port: u16,
    pub handshake_timeout: Duration,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl RemoteSettings {
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    /// Socket open, auth frame sent, waiting for the companion app.
    Open,
    Authenticated,
}

/// What the reader task hands to the owner.
#[derive(Debug)]
enum Inbound {
    Frame(InboundFrame),
    Malformed(String),
    Failed(String),
    Closed(Option<String>),
}

/// One WebSocket session with the companion app.
///
/// Socket I/O runs on a reader and a writer task. Events are only dispatched
/// to subscribers when the owner pulls them through [`connect`](Self::connect)
/// or [`next_event`](Self::next_event), so nothing is dispatched once
/// [`disconnect`](Self::disconnect) has returned.
#[derive(Debug)]
pub struct RemoteConnection {
    settings: RemoteSettings,
    app: AppIdentity,
    session_id: Uuid,
    state: ConnectionState,
    /// Credential supplied to the last `connect`.
    token: Option<String>,
    bus: EventBus,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    /// Events already dispatched but not yet handed out by `next_event`.
    pending: VecDeque<RemoteEvent>,
    cancel: CancellationToken,
}

impl RemoteConnection {
    pub fn new(settings: RemoteSettings, app: AppIdentity) -> Self {
        Self {
            settings,
            app,
            session_id: Uuid::new_v4(),
            state: ConnectionState::Closed,
            token: None,
            bus: EventBus::new(),
            outbound: None,
            inbound: None,
            pending: VecDeque::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn settings(&self) -> &RemoteSettings {
        &self.settings
    }

    pub fn app(&self) -> &AppIdentity {
        &self.app
    }

    /// Port used by the next `connect`.
    pub fn set_port(&mut self, port: u16) {
        self.settings.port = port;
    }

    pub fn on(&mut self, kind: EventKind, handler: EventHandler) {
        self.bus.on(kind, handler);
    }

    pub fn off(&mut self, handler: &EventHandler, mode: RemoveMode) -> usize {
        self.bus.off(handler, mode)
    }

    /// Open the socket and authenticate.
    ///
    /// `token = None` requests a new pairing. Resolves with the credential to
    /// store for next time once the companion app confirms the handshake.
    pub async fn connect(&mut self, token: Option<&str>) -> Result<String, TransportError> {
        self.disconnect();
        self.session_id = Uuid::new_v4();
        self.token = token.map(str::to_owned);

        let limit = self.settings.handshake_timeout;
        match tokio::time::timeout(limit, self.handshake()).await {
            Ok(Ok(api_key)) => Ok(api_key),
            Ok(Err(e)) => {
                warn!(session_id = %self.session_id, error = %e, "handshake failed");
                self.disconnect();
                Err(e)
            }
            Err(_) => {
                warn!(session_id = %self.session_id, ?limit, "handshake timed out");
                self.disconnect();
                Err(TransportError::HandshakeTimeout(limit))
            }
        }
    }

    async fn handshake(&mut self) -> Result<String, TransportError> {
        let url = self.settings.url();
        info!(
            session_id = %self.session_id,
            %url,
            first_time = self.token.is_none(),
            "connecting to companion app"
        );

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|source| TransportError::Connect { url, source })?;
        let (sink, stream) = ws.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.cancel = CancellationToken::new();
        tokio::spawn(write_loop(sink, out_rx));
        tokio::spawn(read_loop(stream, in_tx, self.cancel.clone()));

        self.outbound = Some(out_tx);
        self.inbound = Some(in_rx);
        self.state = ConnectionState::Open;
        self.bus.emit(&RemoteEvent::Connected);
        self.pending.push_back(RemoteEvent::Connected);

        let auth = OutboundFrame::auth(&self.app, self.token.as_deref());
        self.send(&auth, true)?;
        self.await_ready().await
    }

    async fn await_ready(&mut self) -> Result<String, TransportError> {
        loop {
            let inbound = match self.inbound.as_mut() {
                Some(rx) => rx.recv().await,
                None => return Err(TransportError::ClosedBeforeReady { reason: None }),
            };

            let events = self.accept(inbound);
            let mut outcome = None;
            for event in &events {
                match event {
                    RemoteEvent::Ready { api_key } => outcome = Some(Ok(api_key.clone())),
                    RemoteEvent::Disconnected { reason } => {
                        outcome = Some(Err(TransportError::ClosedBeforeReady {
                            reason: reason.clone(),
                        }))
                    }
                    _ => {}
                }
            }
            self.pending.extend(events);

            if let Some(outcome) = outcome {
                return outcome;
            }
        }
    }

    /// Next event in arrival order. Returns `None` once the session is closed
    /// and every remaining event has been handed out.
    pub async fn next_event(&mut self) -> Option<RemoteEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let inbound = self.inbound.as_mut()?.recv().await;
            let events = self.accept(inbound);
            self.pending.extend(events);
        }
    }

    /// Serialize and send a frame. Only the auth frame may bypass the
    /// authentication check.
    pub fn send(&self, frame: &OutboundFrame, bypass_auth_check: bool) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::NotOpen)?;
        if !bypass_auth_check && self.state != ConnectionState::Authenticated {
            return Err(TransportError::NotAuthenticated);
        }

        let text = serde_json::to_string(frame)?;
        outbound
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::NotOpen)
    }

    /// Close the socket. Safe to call at any time; queued and in-flight
    /// events are discarded.
    pub fn disconnect(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(None));
            info!(session_id = %self.session_id, "disconnected from companion app");
        }
        self.inbound = None;
        self.pending.clear();
        self.cancel.cancel();
        self.state = ConnectionState::Closed;
    }

    /// Turn one reader message into events, update state, and dispatch.
    fn accept(&mut self, inbound: Option<Inbound>) -> Vec<RemoteEvent> {
        let events = match inbound {
            Some(Inbound::Frame(InboundFrame::Auth(payload))) => {
                self.state = ConnectionState::Authenticated;
                let api_key = if payload.api_key.is_empty() {
                    self.token.clone().unwrap_or_default()
                } else {
                    payload.api_key.clone()
                };
                info!(
                    session_id = %self.session_id,
                    connections = payload.connections.len(),
                    "authenticated with companion app"
                );
                vec![
                    RemoteEvent::Ready { api_key },
                    RemoteEvent::Frame(InboundFrame::Auth(payload)),
                ]
            }
            Some(Inbound::Frame(frame)) => vec![RemoteEvent::Frame(frame)],
            Some(Inbound::Malformed(message)) => {
                warn!(session_id = %self.session_id, %message, "dropping inbound frame");
                vec![RemoteEvent::Error { message }]
            }
            Some(Inbound::Failed(message)) => {
                warn!(session_id = %self.session_id, %message, "transport error");
                self.close_channels();
                vec![
                    RemoteEvent::Error {
                        message: message.clone(),
                    },
                    RemoteEvent::Disconnected {
                        reason: Some(message),
                    },
                ]
            }
            Some(Inbound::Closed(reason)) => {
                info!(session_id = %self.session_id, ?reason, "companion app closed the connection");
                self.close_channels();
                vec![RemoteEvent::Disconnected { reason }]
            }
            None => {
                self.close_channels();
                vec![RemoteEvent::Disconnected { reason: None }]
            }
        };

        for event in &events {
            self.bus.emit(event);
        }
        events
    }

    fn close_channels(&mut self) {
        self.outbound = None;
        self.inbound = None;
        self.cancel.cancel();
        self.state = ConnectionState::Closed;
    }
}

impl Drop for RemoteConnection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn write_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<Inbound>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => {
                let inbound = match message {
                    Some(Ok(Message::Text(text))) => match InboundFrame::decode(text.as_str()) {
                        Ok(frame) => Inbound::Frame(frame),
                        Err(e) => Inbound::Malformed(format!("malformed frame: {e}")),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.as_str().to_owned())
                            .filter(|r| !r.is_empty());
                        let _ = tx.send(Inbound::Closed(reason));
                        break;
                    }
                    // Ping, pong and binary frames carry nothing for us.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = tx.send(Inbound::Failed(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = tx.send(Inbound::Closed(None));
                        break;
                    }
                };
                if tx.send(inbound).is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app() -> AppIdentity {
        AppIdentity {
            identifier: "test.mirror".into(),
            name: "Test".into(),
            description: "test".into(),
            version: "0.0.0".into(),
        }
    }

    #[test]
    fn test_default_settings_url() {
        assert_eq!(RemoteSettings::default().url(), "ws://localhost:5899");
    }

    #[test]
    fn test_set_port() {
        let mut conn = RemoteConnection::new(RemoteSettings::default(), app());
        conn.set_port(6000);
        assert_eq!(conn.settings().url(), "ws://localhost:6000");
    }

    #[test]
    fn test_send_before_open_fails() {
        let conn = RemoteConnection::new(RemoteSettings::default(), app());
        let frame = OutboundFrame::auth(conn.app(), None);
        assert!(matches!(conn.send(&frame, true), Err(TransportError::NotOpen)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_next_event_on_closed_connection_is_none() {
        let mut conn = RemoteConnection::new(RemoteSettings::default(), app());
        conn.disconnect();
        assert!(conn.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let settings = RemoteSettings {
            host: "127.0.0.1".into(),
            port,
            handshake_timeout: Duration::from_secs(5),
        };
        let mut conn = RemoteConnection::new(settings, app());
        let err = conn.connect(None).await.unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        // Accepts TCP but never answers the WebSocket upgrade.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let settings = RemoteSettings {
            host: "127.0.0.1".into(),
            port,
            handshake_timeout: Duration::from_millis(200),
        };
        let mut conn = RemoteConnection::new(settings, app());
        let err = conn.connect(Some("stored")).await.unwrap_err();
        assert!(matches!(err, TransportError::HandshakeTimeout(d) if d == Duration::from_millis(200)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        hold.abort();
    }
}
