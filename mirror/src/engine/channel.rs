use super::ids::{ChannelId, ClientId};
use super::notify::{Listeners, replace_if_changed};

/// Field-level and structural change of a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    NameChanged { old: String, new: String },
    OrderChanged { old: ChannelId, new: ChannelId },
    SubChannelAdded(ChannelId),
    SubChannelRemoved(ChannelId),
    /// The child list was rebuilt from the predecessor chain and changed.
    SubChannelsReordered,
    ClientAdded(ClientId),
    ClientRemoved(ClientId),
    Deleted,
}

/// A node of a server's channel tree.
///
/// Channels reference their children and clients by id; the owning
/// [`Server`](super::server::Server) keeps the nodes themselves.
#[derive(Debug)]
pub struct Channel {
    id: ChannelId,
    name: String,
    /// Id of the preceding sibling, `ChannelId::ROOT` when first.
    order: ChannelId,
    parent: Option<ChannelId>,
    sub_channels: Vec<ChannelId>,
    clients: Vec<ClientId>,
    listeners: Listeners<ChannelEvent>,
}

impl Channel {
    pub fn new(id: ChannelId, name: impl Into<String>, order: ChannelId) -> Self {
        Self {
            id,
            name: name.into(),
            order,
            parent: None,
            sub_channels: Vec::new(),
            clients: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    /// The synthetic root, named after its server.
    pub(crate) fn root(server_name: impl Into<String>) -> Self {
        Self::new(ChannelId::ROOT, server_name, ChannelId::ROOT)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.id.is_root()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> ChannelId {
        self.order
    }

    pub fn parent(&self) -> Option<ChannelId> {
        self.parent
    }

    /// Child channels in display order.
    pub fn sub_channels(&self) -> &[ChannelId] {
        &self.sub_channels
    }

    /// Member clients, sorted by talk power then nickname.
    pub fn clients(&self) -> &[ClientId] {
        &self.clients
    }

    pub fn on_change(&mut self, callback: impl FnMut(&ChannelEvent) + Send + 'static) {
        self.listeners.subscribe(callback);
    }

    // ── Mutation (owning server only) ───────────────────────────────

    pub(crate) fn set_name(&mut self, name: String) {
        let new = name.clone();
        if let Some(old) = replace_if_changed(&mut self.name, name) {
            self.listeners.emit(&ChannelEvent::NameChanged { old, new });
        }
    }

    pub(crate) fn set_order(&mut self, order: ChannelId) {
        if let Some(old) = replace_if_changed(&mut self.order, order) {
            self.listeners
                .emit(&ChannelEvent::OrderChanged { old, new: order });
        }
    }

    pub(crate) fn set_parent(&mut self, parent: Option<ChannelId>) {
        self.parent = parent;
    }

    /// Splice `child` in right after its predecessor `order`, or at the front
    /// when `order` is root. An unknown predecessor appends at the end.
    /// Returns false in that last case.
    pub(crate) fn insert_sub_channel(&mut self, child: ChannelId, order: ChannelId) -> bool {
        if order.is_root() {
            self.sub_channels.insert(0, child);
            return true;
        }
        match self.sub_channels.iter().position(|id| *id == order) {
            Some(index) => {
                self.sub_channels.insert(index + 1, child);
                true
            }
            None => {
                self.sub_channels.push(child);
                false
            }
        }
    }

    pub(crate) fn remove_sub_channel(&mut self, child: ChannelId) -> bool {
        let before = self.sub_channels.len();
        self.sub_channels.retain(|id| *id != child);
        self.sub_channels.len() != before
    }

    pub(crate) fn replace_sub_channels(&mut self, ordered: Vec<ChannelId>) -> bool {
        if ordered == self.sub_channels {
            return false;
        }
        self.sub_channels = ordered;
        true
    }

    pub(crate) fn insert_client_at(&mut self, index: usize, client: ClientId) {
        self.clients.insert(index.min(self.clients.len()), client);
    }

    pub(crate) fn remove_client(&mut self, client: ClientId) -> bool {
        let before = self.clients.len();
        self.clients.retain(|id| *id != client);
        self.clients.len() != before
    }

    pub(crate) fn replace_clients(&mut self, ordered: Vec<ClientId>) {
        self.clients = ordered;
    }

    pub(crate) fn emit(&mut self, event: &ChannelEvent) {
        self.listeners.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ids(raw: &[u64]) -> Vec<ChannelId> {
        raw.iter().copied().map(ChannelId).collect()
    }

    #[test]
    fn test_insert_after_predecessor() {
        let mut parent = Channel::new(ChannelId(1), "Parent", ChannelId::ROOT);
        assert!(parent.insert_sub_channel(ChannelId(10), ChannelId::ROOT));
        assert!(parent.insert_sub_channel(ChannelId(12), ChannelId(10)));
        assert!(parent.insert_sub_channel(ChannelId(11), ChannelId(10)));
        assert_eq!(parent.sub_channels(), ids(&[10, 11, 12]).as_slice());
    }

    #[test]
    fn test_insert_first_goes_to_front() {
        let mut parent = Channel::new(ChannelId(1), "Parent", ChannelId::ROOT);
        parent.insert_sub_channel(ChannelId(10), ChannelId::ROOT);
        parent.insert_sub_channel(ChannelId(9), ChannelId::ROOT);
        assert_eq!(parent.sub_channels(), ids(&[9, 10]).as_slice());
    }

    #[test]
    fn test_insert_unknown_predecessor_appends() {
        let mut parent = Channel::new(ChannelId(1), "Parent", ChannelId::ROOT);
        parent.insert_sub_channel(ChannelId(10), ChannelId::ROOT);
        assert!(!parent.insert_sub_channel(ChannelId(20), ChannelId(99)));
        assert_eq!(parent.sub_channels(), ids(&[10, 20]).as_slice());
    }

    #[test]
    fn test_rename_fires_only_on_change() {
        let mut channel = Channel::new(ChannelId(3), "Lobby", ChannelId::ROOT);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.on_change(move |e| sink.lock().unwrap().push(e.clone()));

        channel.set_name("Lobby".into());
        channel.set_name("Hall".into());
        channel.set_order(ChannelId::ROOT);
        channel.set_order(ChannelId(2));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ChannelEvent::NameChanged {
                    old: "Lobby".into(),
                    new: "Hall".into()
                },
                ChannelEvent::OrderChanged {
                    old: ChannelId::ROOT,
                    new: ChannelId(2)
                },
            ]
        );
    }

    #[test]
    fn test_root_channel() {
        let root = Channel::root("Home");
        assert!(root.is_root());
        assert_eq!(root.name(), "Home");
        assert_eq!(root.parent(), None);
    }
}
