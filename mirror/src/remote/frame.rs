use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::ids::{ChannelId, ClientId, ServerId, lenient_u64};

/// How this application introduces itself to the companion app when pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    /// Stable identifier; the companion app keys its stored pairing on it.
    pub identifier: String,
    pub name: String,
    pub description: String,
    pub version: String,
}

// ── Outbound ────────────────────────────────────────────────────────

/// Frames sent to the companion app. Only the handshake goes this way.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum OutboundFrame {
    Auth(AuthRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthRequest {
    pub identifier: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub content: AuthContent,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContent {
    /// Previously issued credential, or empty to request a new pairing.
    pub api_key: String,
}

impl OutboundFrame {
    pub fn auth(app: &AppIdentity, api_key: Option<&str>) -> Self {
        OutboundFrame::Auth(AuthRequest {
            identifier: app.identifier.clone(),
            version: app.version.clone(),
            name: app.name.clone(),
            description: app.description.clone(),
            content: AuthContent {
                api_key: api_key.unwrap_or_default().to_string(),
            },
        })
    }
}

// ── Inbound ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// A decoded frame from the companion app.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Handshake accepted; carries the credential and a snapshot of every connection.
    Auth(AuthPayload),
    ConnectStatusChanged(ConnectStatusChanged),
    /// Channel list for a connection that attached after the handshake.
    Channels(ChannelsPayload),
    ClientMoved(ClientMoved),
    ClientPropertiesUpdated(ClientPropertiesUpdated),
    TalkStatusChanged(TalkStatusChanged),
    ChannelCreated(ChannelCreated),
    ChannelMoved(ChannelMoved),
    ChannelEdited(ChannelEdited),
    ChannelDeleted(ChannelDeleted),
    /// A frame type this crate does not mirror.
    Unrecognized { kind: String },
}

impl InboundFrame {
    /// Decode one text message of the `{type, payload}` envelope.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawFrame = serde_json::from_str(text)?;
        let payload = raw.payload;

        Ok(match raw.kind.as_str() {
            "auth" => InboundFrame::Auth(serde_json::from_value(payload)?),
            "connectStatusChanged" => {
                InboundFrame::ConnectStatusChanged(serde_json::from_value(payload)?)
            }
            "channels" => InboundFrame::Channels(serde_json::from_value(payload)?),
            "clientMoved" => InboundFrame::ClientMoved(serde_json::from_value(payload)?),
            "clientPropertiesUpdated" => {
                InboundFrame::ClientPropertiesUpdated(serde_json::from_value(payload)?)
            }
            "talkStatusChanged" => {
                InboundFrame::TalkStatusChanged(serde_json::from_value(payload)?)
            }
            "channelCreated" => InboundFrame::ChannelCreated(serde_json::from_value(payload)?),
            "channelMoved" => InboundFrame::ChannelMoved(serde_json::from_value(payload)?),
            "channelEdited" => InboundFrame::ChannelEdited(serde_json::from_value(payload)?),
            "channelDeleted" => InboundFrame::ChannelDeleted(serde_json::from_value(payload)?),
            _ => InboundFrame::Unrecognized { kind: raw.kind },
        })
    }

    /// The connection a frame refers to, if it is scoped to one.
    pub fn connection_id(&self) -> Option<ServerId> {
        match self {
            InboundFrame::Auth(_) | InboundFrame::Unrecognized { .. } => None,
            InboundFrame::ConnectStatusChanged(p) => Some(p.connection_id),
            InboundFrame::Channels(p) => Some(p.connection_id),
            InboundFrame::ClientMoved(p) => Some(p.connection_id),
            InboundFrame::ClientPropertiesUpdated(p) => Some(p.connection_id),
            InboundFrame::TalkStatusChanged(p) => Some(p.connection_id),
            InboundFrame::ChannelCreated(p) => Some(p.connection_id),
            InboundFrame::ChannelMoved(p) => Some(p.connection_id),
            InboundFrame::ChannelEdited(p) => Some(p.connection_id),
            InboundFrame::ChannelDeleted(p) => Some(p.connection_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub connections: Vec<ConnectionInfo>,
}

/// Bulk snapshot of one server connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ServerId,
    /// Id of the local client on this server.
    pub client_id: ClientId,
    #[serde(default)]
    pub properties: ServerProperties,
    #[serde(default)]
    pub channel_infos: ChannelInfos,
    #[serde(default)]
    pub client_infos: Vec<ClientInfo>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ServerProperties {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfos {
    #[serde(default)]
    pub root_channels: Vec<ChannelInfo>,
    /// Keyed by parent channel id. Key order carries no meaning.
    #[serde(default)]
    pub sub_channels: BTreeMap<String, Vec<ChannelInfo>>,
}

impl ChannelInfos {
    /// Flatten into one descriptor list, top-level channels first.
    pub fn into_descriptors(self) -> Vec<ChannelInfo> {
        let mut all = self.root_channels;
        for list in self.sub_channels.into_values() {
            all.extend(list);
        }
        all
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
    pub id: ChannelId,
    #[serde(default)]
    pub parent_id: ChannelId,
    #[serde(default)]
    pub order: Option<ChannelId>,
    #[serde(default)]
    pub properties: ChannelProperties,
}

impl ChannelInfo {
    /// Predecessor sibling id; descriptors carry it either at the top level or
    /// inside `properties`.
    pub fn order(&self) -> ChannelId {
        self.order.or(self.properties.order).unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.properties.name.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ChannelProperties {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub order: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: ClientId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub properties: ClientProperties,
}

/// Client properties as sent by the companion app. Every field is optional so
/// that partial updates leave the rest untouched.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientProperties {
    /// 0 = regular client, 1 = query client.
    #[serde(rename = "type", default)]
    pub kind: Option<u64>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub talk_power: Option<i64>,
    #[serde(default)]
    pub flag_talking: Option<bool>,
    #[serde(default)]
    pub input_muted: Option<bool>,
    /// Muted locally by the user of the companion app.
    #[serde(default)]
    pub is_muted: Option<bool>,
    /// Input device present and enabled; hardware-muted is the negation.
    #[serde(default)]
    pub input_hardware: Option<bool>,
    #[serde(default)]
    pub output_muted: Option<bool>,
    #[serde(default)]
    pub away: Option<bool>,
    #[serde(default)]
    pub away_message: Option<String>,
    #[serde(default)]
    pub myteamspeak_avatar: Option<String>,
}

/// Connection state codes of `connectStatusChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
    Disconnected,
    Connecting,
    Connected,
    Establishing,
    Established,
    Other(u64),
}

impl From<u64> for ConnectStatus {
    fn from(code: u64) -> Self {
        match code {
            0 => ConnectStatus::Disconnected,
            1 => ConnectStatus::Connecting,
            2 => ConnectStatus::Connected,
            3 => ConnectStatus::Establishing,
            4 => ConnectStatus::Established,
            other => ConnectStatus::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectStatusChanged {
    pub connection_id: ServerId,
    #[serde(deserialize_with = "lenient_u64")]
    pub status: u64,
    #[serde(default)]
    pub info: Option<ConnectInfo>,
}

impl ConnectStatusChanged {
    pub fn status(&self) -> ConnectStatus {
        ConnectStatus::from(self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    pub client_id: ClientId,
    #[serde(default)]
    pub server_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsPayload {
    pub connection_id: ServerId,
    #[serde(default)]
    pub info: ChannelInfos,
}

/// A client changed channel. Destination `0` means the client left the
/// server; a `properties` payload means it just connected.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMoved {
    pub connection_id: ServerId,
    pub client_id: ClientId,
    pub new_channel_id: ChannelId,
    #[serde(default)]
    pub properties: Option<ClientProperties>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientPropertiesUpdated {
    pub connection_id: ServerId,
    pub client_id: ClientId,
    #[serde(default)]
    pub properties: ClientProperties,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TalkStatusChanged {
    pub connection_id: ServerId,
    pub client_id: ClientId,
    #[serde(deserialize_with = "lenient_u64")]
    pub status: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCreated {
    pub connection_id: ServerId,
    pub channel_id: ChannelId,
    pub parent_id: ChannelId,
    #[serde(default)]
    pub properties: ChannelProperties,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMoved {
    pub connection_id: ServerId,
    pub channel_id: ChannelId,
    /// `None` keeps the current parent.
    #[serde(default)]
    pub parent_id: Option<ChannelId>,
    #[serde(default)]
    pub order: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEdited {
    pub connection_id: ServerId,
    pub channel_id: ChannelId,
    #[serde(default)]
    pub properties: ChannelProperties,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDeleted {
    pub connection_id: ServerId,
    pub channel_id: ChannelId,
}
