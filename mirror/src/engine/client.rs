use std::cmp::Ordering;

use bitflags::bitflags;
use chrono::{DateTime, Utc};

use super::ids::{ChannelId, ClientId};
use super::notify::{Listeners, replace_if_changed};
use crate::remote::frame::ClientProperties;

bitflags! {
    /// Status flags of a client as mirrored from the companion app.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ClientFlags: u8 {
        const TALKING        = 1 << 0;
        /// Microphone muted.
        const INPUT_MUTED    = 1 << 1;
        /// Muted locally by the user of the companion app.
        const MUTED_LOCALLY  = 1 << 2;
        /// Input device disabled or absent.
        const HARDWARE_MUTED = 1 << 3;
        /// Speakers muted (deafened).
        const OUTPUT_MUTED   = 1 << 4;
        const AWAY           = 1 << 5;
    }
}

/// Regular voice client or a server-query connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientKind {
    #[default]
    Regular,
    Query,
}

impl From<u64> for ClientKind {
    fn from(code: u64) -> Self {
        if code == 1 {
            ClientKind::Query
        } else {
            ClientKind::Regular
        }
    }
}

/// Field-level change of a client. Fired only when the value actually changed.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    NicknameChanged { old: String, new: String },
    TalkPowerChanged { old: i64, new: i64 },
    TalkingChanged(bool),
    MutedChanged(bool),
    MutedLocallyChanged(bool),
    HardwareMutedChanged(bool),
    SoundMutedChanged(bool),
    AwayChanged { away: bool, message: String },
    AvatarChanged(Option<String>),
    ChannelChanged {
        from: Option<ChannelId>,
        to: Option<ChannelId>,
    },
    Deleted,
}

/// A partial client update; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientUpdate {
    pub nickname: Option<String>,
    pub talk_power: Option<i64>,
    pub talking: Option<bool>,
    pub muted: Option<bool>,
    pub muted_locally: Option<bool>,
    pub hardware_muted: Option<bool>,
    pub sound_muted: Option<bool>,
    pub away: Option<bool>,
    pub away_message: Option<String>,
    pub avatar_url: Option<Option<String>>,
}

impl From<&ClientProperties> for ClientUpdate {
    fn from(p: &ClientProperties) -> Self {
        Self {
            nickname: p.nickname.clone(),
            talk_power: p.talk_power,
            talking: p.flag_talking,
            muted: p.input_muted,
            muted_locally: p.is_muted,
            hardware_muted: p.input_hardware.map(|present| !present),
            sound_muted: p.output_muted,
            away: p.away,
            away_message: p.away_message.clone(),
            avatar_url: p.myteamspeak_avatar.as_deref().map(parse_avatar_url),
        }
    }
}

/// A participant on a server.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    kind: ClientKind,
    nickname: String,
    talk_power: i64,
    flags: ClientFlags,
    away_message: String,
    avatar_url: Option<String>,
    /// Containing channel, maintained by the owning server on every move.
    channel: Option<ChannelId>,
    joined_at: DateTime<Utc>,
    listeners: Listeners<ClientEvent>,
}

impl Client {
    pub fn new(id: ClientId, kind: ClientKind, nickname: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            nickname: nickname.into(),
            talk_power: 0,
            flags: ClientFlags::empty(),
            away_message: String::new(),
            avatar_url: None,
            channel: None,
            joined_at: Utc::now(),
            listeners: Listeners::new(),
        }
    }

    /// Build a client from a snapshot or fresh-connect property payload.
    pub fn from_properties(id: ClientId, properties: &ClientProperties) -> Self {
        let mut client = Self::new(
            id,
            properties.kind.map(ClientKind::from).unwrap_or_default(),
            properties.nickname.clone().unwrap_or_default(),
        );
        let mut update = ClientUpdate::from(properties);
        // No input device reported means no usable input.
        update.hardware_muted.get_or_insert(true);
        // No listeners yet, so applying the update fires nothing.
        client.apply(update);
        client
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn is_query(&self) -> bool {
        self.kind == ClientKind::Query
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn talk_power(&self) -> i64 {
        self.talk_power
    }

    pub fn flags(&self) -> ClientFlags {
        self.flags
    }

    pub fn is_talking(&self) -> bool {
        self.flags.contains(ClientFlags::TALKING)
    }

    pub fn is_muted(&self) -> bool {
        self.flags.contains(ClientFlags::INPUT_MUTED)
    }

    pub fn is_muted_locally(&self) -> bool {
        self.flags.contains(ClientFlags::MUTED_LOCALLY)
    }

    pub fn is_hardware_muted(&self) -> bool {
        self.flags.contains(ClientFlags::HARDWARE_MUTED)
    }

    pub fn is_sound_muted(&self) -> bool {
        self.flags.contains(ClientFlags::OUTPUT_MUTED)
    }

    pub fn is_away(&self) -> bool {
        self.flags.contains(ClientFlags::AWAY)
    }

    pub fn away_message(&self) -> &str {
        &self.away_message
    }

    pub fn avatar_url(&self) -> Option<&str> {
        self.avatar_url.as_deref()
    }

    /// The channel currently containing this client.
    pub fn channel(&self) -> Option<ChannelId> {
        self.channel
    }

    pub fn joined_at(&self) -> DateTime<Utc> {
        self.joined_at
    }

    pub fn on_change(&mut self, callback: impl FnMut(&ClientEvent) + Send + 'static) {
        self.listeners.subscribe(callback);
    }

    // ── Mutation (owning server only) ───────────────────────────────

    pub(crate) fn set_channel(&mut self, channel: Option<ChannelId>) {
        if let Some(from) = replace_if_changed(&mut self.channel, channel) {
            self.listeners.emit(&ClientEvent::ChannelChanged { from, to: channel });
        }
    }

    pub(crate) fn emit(&mut self, event: &ClientEvent) {
        self.listeners.emit(event);
    }

    /// Apply an update, firing one event per changed field.
    /// Returns true if a field that determines channel ordering changed.
    pub(crate) fn apply(&mut self, update: ClientUpdate) -> bool {
        let mut reorder = false;

        if let Some(nickname) = update.nickname {
            let new = nickname.clone();
            if let Some(old) = replace_if_changed(&mut self.nickname, nickname) {
                self.listeners.emit(&ClientEvent::NicknameChanged { old, new });
                reorder = true;
            }
        }

        if let Some(new) = update.talk_power
            && let Some(old) = replace_if_changed(&mut self.talk_power, new)
        {
            self.listeners.emit(&ClientEvent::TalkPowerChanged { old, new });
            reorder = true;
        }

        self.set_flag(ClientFlags::TALKING, update.talking);
        self.set_flag(ClientFlags::INPUT_MUTED, update.muted);
        self.set_flag(ClientFlags::MUTED_LOCALLY, update.muted_locally);
        self.set_flag(ClientFlags::HARDWARE_MUTED, update.hardware_muted);
        self.set_flag(ClientFlags::OUTPUT_MUTED, update.sound_muted);

        // Away state and message change together.
        let was_away = self.is_away();
        let away = update.away.unwrap_or(was_away);
        let message = update
            .away_message
            .unwrap_or_else(|| self.away_message.clone());
        if away != was_away || message != self.away_message {
            self.flags.set(ClientFlags::AWAY, away);
            self.away_message = message.clone();
            self.listeners.emit(&ClientEvent::AwayChanged { away, message });
        }

        if let Some(avatar_url) = update.avatar_url
            && replace_if_changed(&mut self.avatar_url, avatar_url.clone()).is_some()
        {
            self.listeners.emit(&ClientEvent::AvatarChanged(avatar_url));
        }

        reorder
    }

    fn set_flag(&mut self, flag: ClientFlags, value: Option<bool>) {
        let Some(value) = value else { return };
        if self.flags.contains(flag) == value {
            return;
        }
        self.flags.set(flag, value);

        let event = if flag == ClientFlags::TALKING {
            ClientEvent::TalkingChanged(value)
        } else if flag == ClientFlags::INPUT_MUTED {
            ClientEvent::MutedChanged(value)
        } else if flag == ClientFlags::MUTED_LOCALLY {
            ClientEvent::MutedLocallyChanged(value)
        } else if flag == ClientFlags::HARDWARE_MUTED {
            ClientEvent::HardwareMutedChanged(value)
        } else {
            ClientEvent::SoundMutedChanged(value)
        };
        self.listeners.emit(&event);
    }
}

/// Order of clients inside a channel: talk power descending, then nickname.
pub fn client_order(a: &Client, b: &Client) -> Ordering {
    b.talk_power
        .cmp(&a.talk_power)
        .then_with(|| compare_nicknames(&a.nickname, &b.nickname))
}

/// Case-insensitive nickname comparison; on a tie lowercase sorts first.
pub fn compare_nicknames(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| b.cmp(a))
}

/// Extract the avatar URL from the avatar property: a `;`-separated list of
/// `,`-separated entries whose last entry carries the URL second.
pub fn parse_avatar_url(field: &str) -> Option<String> {
    let last = field.split(';').next_back()?;
    let url = last.split(',').nth(1)?;
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorded(client: &mut Client) -> Arc<Mutex<Vec<ClientEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        client.on_change(move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    #[test]
    fn test_from_properties() {
        let props = ClientProperties {
            kind: Some(1),
            nickname: Some("Bot".into()),
            talk_power: Some(50),
            input_hardware: Some(false),
            away: Some(true),
            away_message: Some("lunch".into()),
            myteamspeak_avatar: Some("1,https://a.example/x.png".into()),
            ..Default::default()
        };
        let client = Client::from_properties(ClientId(9), &props);
        assert!(client.is_query());
        assert_eq!(client.nickname(), "Bot");
        assert_eq!(client.talk_power(), 50);
        assert!(client.is_hardware_muted());
        assert!(client.is_away());
        assert_eq!(client.away_message(), "lunch");
        assert_eq!(client.avatar_url(), Some("https://a.example/x.png"));
        assert_eq!(client.channel(), None);
    }

    #[test]
    fn test_missing_input_hardware_means_muted_on_creation() {
        let props = ClientProperties {
            nickname: Some("Alice".into()),
            ..Default::default()
        };
        let mut client = Client::from_properties(ClientId(3), &props);
        assert!(client.is_hardware_muted());

        // Updates leave the flag alone when the field is absent.
        client.apply(ClientUpdate::from(&props));
        assert!(client.is_hardware_muted());
        client.apply(ClientUpdate::from(&ClientProperties {
            input_hardware: Some(true),
            ..Default::default()
        }));
        assert!(!client.is_hardware_muted());
    }

    #[test]
    fn test_update_fires_only_on_change() {
        let mut client = Client::new(ClientId(1), ClientKind::Regular, "Alice");
        let seen = recorded(&mut client);

        let update = ClientUpdate {
            nickname: Some("Alice".into()),
            talking: Some(true),
            ..Default::default()
        };
        client.apply(update.clone());
        client.apply(update);

        assert_eq!(*seen.lock().unwrap(), vec![ClientEvent::TalkingChanged(true)]);
    }

    #[test]
    fn test_update_reports_reorder() {
        let mut client = Client::new(ClientId(1), ClientKind::Regular, "Alice");
        assert!(!client.apply(ClientUpdate {
            muted: Some(true),
            ..Default::default()
        }));
        assert!(client.apply(ClientUpdate {
            talk_power: Some(10),
            ..Default::default()
        }));
        assert!(client.apply(ClientUpdate {
            nickname: Some("Alicia".into()),
            ..Default::default()
        }));
    }

    #[test]
    fn test_away_fires_once_for_state_and_message() {
        let mut client = Client::new(ClientId(1), ClientKind::Regular, "Alice");
        let seen = recorded(&mut client);

        client.apply(ClientUpdate {
            away: Some(true),
            away_message: Some("brb".into()),
            ..Default::default()
        });
        client.apply(ClientUpdate {
            away_message: Some("brb".into()),
            ..Default::default()
        });

        assert_eq!(
            *seen.lock().unwrap(),
            vec![ClientEvent::AwayChanged {
                away: true,
                message: "brb".into()
            }]
        );
    }

    #[test]
    fn test_hardware_muted_is_negated_input_hardware() {
        let update = ClientUpdate::from(&ClientProperties {
            input_hardware: Some(true),
            ..Default::default()
        });
        assert_eq!(update.hardware_muted, Some(false));
        assert_eq!(ClientUpdate::from(&ClientProperties::default()).hardware_muted, None);
    }

    #[test]
    fn test_set_channel_event() {
        let mut client = Client::new(ClientId(1), ClientKind::Regular, "Alice");
        let seen = recorded(&mut client);
        client.set_channel(Some(ChannelId(4)));
        client.set_channel(Some(ChannelId(4)));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ClientEvent::ChannelChanged {
                from: None,
                to: Some(ChannelId(4))
            }]
        );
    }

    #[test]
    fn test_client_order() {
        let mut loud = Client::new(ClientId(1), ClientKind::Regular, "zed");
        loud.apply(ClientUpdate {
            talk_power: Some(75),
            ..Default::default()
        });
        let a = Client::new(ClientId(2), ClientKind::Regular, "anna");
        let b = Client::new(ClientId(3), ClientKind::Regular, "Bert");

        assert_eq!(client_order(&loud, &a), Ordering::Less);
        assert_eq!(client_order(&a, &b), Ordering::Less);
        assert_eq!(client_order(&b, &a), Ordering::Greater);
    }

    #[test]
    fn test_compare_nicknames() {
        assert_eq!(compare_nicknames("alice", "Bob"), Ordering::Less);
        assert_eq!(compare_nicknames("a", "A"), Ordering::Less);
        assert_eq!(compare_nicknames("Same", "Same"), Ordering::Equal);
    }

    #[test]
    fn test_parse_avatar_url() {
        assert_eq!(parse_avatar_url(""), None);
        assert_eq!(parse_avatar_url("nocomma"), None);
        assert_eq!(parse_avatar_url("1,"), None);
        assert_eq!(
            parse_avatar_url("0,https://old.example/a;2,https://new.example/b"),
            Some("https://new.example/b".to_string())
        );
    }
}
