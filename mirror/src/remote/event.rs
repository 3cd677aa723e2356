use super::frame::InboundFrame;

/// Everything the transport reports to its owner, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// The socket opened; the auth frame is about to be sent.
    Connected,
    /// The companion app accepted the handshake.
    Ready { api_key: String },
    Disconnected { reason: Option<String> },
    /// A recoverable problem, e.g. a frame that failed to decode.
    Error { message: String },
    Frame(InboundFrame),
}

/// Subscription category of a [`RemoteEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Ready,
    Disconnected,
    Error,
    Auth,
    ConnectStatusChanged,
    Channels,
    ClientMoved,
    ClientPropertiesUpdated,
    TalkStatusChanged,
    ChannelCreated,
    ChannelMoved,
    ChannelEdited,
    ChannelDeleted,
    Unrecognized,
}

impl EventKind {
    pub fn of_frame(frame: &InboundFrame) -> Self {
        match frame {
            InboundFrame::Auth(_) => EventKind::Auth,
            InboundFrame::ConnectStatusChanged(_) => EventKind::ConnectStatusChanged,
            InboundFrame::Channels(_) => EventKind::Channels,
            InboundFrame::ClientMoved(_) => EventKind::ClientMoved,
            InboundFrame::ClientPropertiesUpdated(_) => EventKind::ClientPropertiesUpdated,
            InboundFrame::TalkStatusChanged(_) => EventKind::TalkStatusChanged,
            InboundFrame::ChannelCreated(_) => EventKind::ChannelCreated,
            InboundFrame::ChannelMoved(_) => EventKind::ChannelMoved,
            InboundFrame::ChannelEdited(_) => EventKind::ChannelEdited,
            InboundFrame::ChannelDeleted(_) => EventKind::ChannelDeleted,
            InboundFrame::Unrecognized { .. } => EventKind::Unrecognized,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Ready => "ready",
            EventKind::Disconnected => "disconnected",
            EventKind::Error => "error",
            EventKind::Auth => "auth",
            EventKind::ConnectStatusChanged => "connectStatusChanged",
            EventKind::Channels => "channels",
            EventKind::ClientMoved => "clientMoved",
            EventKind::ClientPropertiesUpdated => "clientPropertiesUpdated",
            EventKind::TalkStatusChanged => "talkStatusChanged",
            EventKind::ChannelCreated => "channelCreated",
            EventKind::ChannelMoved => "channelMoved",
            EventKind::ChannelEdited => "channelEdited",
            EventKind::ChannelDeleted => "channelDeleted",
            EventKind::Unrecognized => "unrecognized",
        }
    }
}

impl RemoteEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RemoteEvent::Connected => EventKind::Connected,
            RemoteEvent::Ready { .. } => EventKind::Ready,
            RemoteEvent::Disconnected { .. } => EventKind::Disconnected,
            RemoteEvent::Error { .. } => EventKind::Error,
            RemoteEvent::Frame(frame) => EventKind::of_frame(frame),
        }
    }
}
