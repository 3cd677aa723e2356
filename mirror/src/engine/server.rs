use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::channel::{Channel, ChannelEvent};
use super::client::{Client, ClientEvent, ClientUpdate, client_order};
use super::error::GraphError;
use super::ids::{ChannelId, ClientId, ServerId};
use super::notify::{Listeners, replace_if_changed};
use crate::remote::frame::ClientMoved;

/// Where a server is in its initial synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Attached from a connect-status event; the channel list has not arrived.
    AwaitingChannels,
    /// Channel tree imported; only incremental events from here on.
    Synchronized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    NameChanged { old: String, new: String },
    Synchronized,
    Deleted,
}

/// In-memory mirror of one server connection.
///
/// Channels and clients live in id-keyed arenas. Every channel except the
/// synthetic root is reachable from the root through `sub_channels`, and every
/// client is listed by exactly the channel its back-reference names.
#[derive(Debug)]
pub struct Server {
    id: ServerId,
    name: String,
    local_client_id: ClientId,
    sync_state: SyncState,
    attached_at: DateTime<Utc>,
    channels: HashMap<ChannelId, Channel>,
    clients: HashMap<ClientId, Client>,
    /// Client moves into channels that were not known yet, in arrival order.
    deferred_moves: Vec<ClientMoved>,
    listeners: Listeners<ServerEvent>,
}

impl Server {
    pub fn new(id: ServerId, name: impl Into<String>, local_client_id: ClientId) -> Self {
        let name = name.into();
        let mut channels = HashMap::new();
        channels.insert(ChannelId::ROOT, Channel::root(name.clone()));

        Self {
            id,
            name,
            local_client_id,
            sync_state: SyncState::AwaitingChannels,
            attached_at: Utc::now(),
            channels,
            clients: HashMap::new(),
            deferred_moves: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn id(&self) -> ServerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_client_id(&self) -> ClientId {
        self.local_client_id
    }

    /// The local client, once it has been placed in a channel.
    pub fn local_client(&self) -> Option<&Client> {
        self.clients.get(&self.local_client_id)
    }

    pub fn sync_state(&self) -> SyncState {
        self.sync_state
    }

    pub fn attached_at(&self) -> DateTime<Utc> {
        self.attached_at
    }

    pub fn root_channel(&self) -> &Channel {
        // The root is inserted on construction and never removed.
        &self.channels[&ChannelId::ROOT]
    }

    /// Look up a channel; `ChannelId::ROOT` yields the root.
    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Look up `id` within the subtree rooted at `ancestor` (inclusive).
    pub fn find_channel_in(&self, ancestor: ChannelId, id: ChannelId) -> Option<&Channel> {
        if id == ancestor || self.is_ancestor(ancestor, id) {
            self.channels.get(&id)
        } else {
            None
        }
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    /// The channel containing `client`, via its back-reference.
    pub fn client_channel(&self, client: ClientId) -> Option<&Channel> {
        let channel = self.clients.get(&client)?.channel()?;
        self.channels.get(&channel)
    }

    /// Number of channels, not counting the root.
    pub fn channel_count(&self) -> usize {
        self.channels.len() - 1
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Depth-first, display-ordered walk of the tree below the root.
    /// Yields `(depth, channel)` with top-level channels at depth 0.
    pub fn walk(&self) -> Vec<(usize, &Channel)> {
        let mut out = Vec::with_capacity(self.channel_count());
        let mut stack: Vec<(usize, ChannelId)> = self
            .root_channel()
            .sub_channels()
            .iter()
            .rev()
            .map(|id| (0, *id))
            .collect();

        while let Some((depth, id)) = stack.pop() {
            let Some(channel) = self.channels.get(&id) else {
                continue;
            };
            out.push((depth, channel));
            stack.extend(channel.sub_channels().iter().rev().map(|c| (depth + 1, *c)));
        }
        out
    }

    /// True if `ancestor` lies on the parent chain of `id`.
    pub fn is_ancestor(&self, ancestor: ChannelId, id: ChannelId) -> bool {
        let mut current = self.channels.get(&id).and_then(Channel::parent);
        let mut steps = 0;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.channels.len() {
                break;
            }
            current = self.channels.get(&parent).and_then(Channel::parent);
        }
        false
    }

    /// Clients in `id` and all channels below it.
    pub fn clients_in_subtree(&self, id: ChannelId) -> Vec<ClientId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(channel) = self.channels.get(&next) {
                out.extend_from_slice(channel.clients());
                stack.extend_from_slice(channel.sub_channels());
            }
        }
        out
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub fn on_change(&mut self, callback: impl FnMut(&ServerEvent) + Send + 'static) {
        self.listeners.subscribe(callback);
    }

    pub fn on_channel_change(
        &mut self,
        id: ChannelId,
        callback: impl FnMut(&ChannelEvent) + Send + 'static,
    ) -> Result<(), GraphError> {
        self.channels
            .get_mut(&id)
            .ok_or(GraphError::UnknownChannel(id))?
            .on_change(callback);
        Ok(())
    }

    pub fn on_client_change(
        &mut self,
        id: ClientId,
        callback: impl FnMut(&ClientEvent) + Send + 'static,
    ) -> Result<(), GraphError> {
        self.clients
            .get_mut(&id)
            .ok_or(GraphError::UnknownClient(id))?
            .on_change(callback);
        Ok(())
    }

    // ── Server state ────────────────────────────────────────────────

    pub(crate) fn set_name(&mut self, name: String) {
        let new = name.clone();
        if let Some(old) = replace_if_changed(&mut self.name, name) {
            if let Some(root) = self.channels.get_mut(&ChannelId::ROOT) {
                root.set_name(new.clone());
            }
            self.listeners.emit(&ServerEvent::NameChanged { old, new });
        }
    }

    pub(crate) fn mark_synchronized(&mut self) {
        if replace_if_changed(&mut self.sync_state, SyncState::Synchronized).is_some() {
            self.listeners.emit(&ServerEvent::Synchronized);
        }
    }

    pub(crate) fn defer_move(&mut self, event: ClientMoved) {
        self.deferred_moves.push(event);
    }

    /// Drain the deferred moves, leaving the queue empty.
    pub(crate) fn take_deferred_moves(&mut self) -> Vec<ClientMoved> {
        std::mem::take(&mut self.deferred_moves)
    }

    pub fn deferred_move_count(&self) -> usize {
        self.deferred_moves.len()
    }

    // ── Channel structure ───────────────────────────────────────────

    /// Attach a new channel under `parent`, spliced after its predecessor.
    pub(crate) fn add_sub_channel(
        &mut self,
        parent: ChannelId,
        channel: Channel,
    ) -> Result<(), GraphError> {
        let id = channel.id();
        if id.is_root() {
            return Err(GraphError::ReservedChannelId);
        }
        if self.channels.contains_key(&id) {
            return Err(GraphError::DuplicateChannel(id));
        }
        if !self.channels.contains_key(&parent) {
            return Err(GraphError::UnknownChannel(parent));
        }

        self.channels.insert(id, channel);
        self.attach(parent, id);
        Ok(())
    }

    /// Detach `child` from `parent`'s list. The node stays in the arena.
    pub(crate) fn remove_sub_channel(&mut self, parent: ChannelId, child: ChannelId) {
        if let Some(channel) = self.channels.get_mut(&child) {
            channel.set_parent(None);
        }
        if let Some(parent) = self.channels.get_mut(&parent)
            && parent.remove_sub_channel(child)
        {
            parent.emit(&ChannelEvent::SubChannelRemoved(child));
        }
    }

    fn attach(&mut self, parent: ChannelId, child: ChannelId) {
        let Some(channel) = self.channels.get_mut(&child) else {
            return;
        };
        channel.set_parent(Some(parent));
        let order = channel.order();

        let Some(parent_channel) = self.channels.get_mut(&parent) else {
            return;
        };
        if !parent_channel.insert_sub_channel(child, order) {
            debug!(
                server = %self.id,
                channel = %child,
                predecessor = %order,
                "predecessor not among siblings yet, appending"
            );
        }
        parent_channel.emit(&ChannelEvent::SubChannelAdded(child));
    }

    /// Reparent and/or reorder a channel. `parent = None` keeps the parent.
    pub(crate) fn move_channel(
        &mut self,
        id: ChannelId,
        parent: Option<ChannelId>,
        order: ChannelId,
    ) -> Result<(), GraphError> {
        if id.is_root() {
            return Err(GraphError::RootImmutable);
        }
        let current_parent = self
            .channels
            .get(&id)
            .ok_or(GraphError::UnknownChannel(id))?
            .parent()
            .unwrap_or(ChannelId::ROOT);
        let new_parent = parent.unwrap_or(current_parent);

        if !self.channels.contains_key(&new_parent) {
            return Err(GraphError::UnknownChannel(new_parent));
        }
        if new_parent == id || self.is_ancestor(id, new_parent) {
            return Err(GraphError::CyclicMove {
                channel: id,
                parent: new_parent,
            });
        }

        if let Some(channel) = self.channels.get_mut(&id) {
            channel.set_order(order);
        }
        // Remove and re-add so the new predecessor takes effect.
        self.remove_sub_channel(current_parent, id);
        self.attach(new_parent, id);
        Ok(())
    }

    pub(crate) fn rename_channel(&mut self, id: ChannelId, name: String) -> Result<(), GraphError> {
        self.channels
            .get_mut(&id)
            .ok_or(GraphError::UnknownChannel(id))?
            .set_name(name);
        Ok(())
    }

    /// Delete a channel and everything below it.
    ///
    /// `detach_from_parent = false` skips unlinking from the parent, for when
    /// the parent is itself being torn down. Clients still inside stay on the
    /// server, detached, until their own removal arrives.
    pub(crate) fn delete_channel(
        &mut self,
        id: ChannelId,
        detach_from_parent: bool,
    ) -> Result<(), GraphError> {
        if id.is_root() {
            return Err(GraphError::RootImmutable);
        }
        let channel = self
            .channels
            .get(&id)
            .ok_or(GraphError::UnknownChannel(id))?;
        let parent = channel.parent();
        let children = channel.sub_channels().to_vec();

        if detach_from_parent && let Some(parent) = parent {
            self.remove_sub_channel(parent, id);
        }
        for child in children {
            self.delete_channel(child, false)?;
        }

        if let Some(mut channel) = self.channels.remove(&id) {
            for client_id in channel.clients() {
                if let Some(client) = self.clients.get_mut(client_id) {
                    client.set_channel(None);
                }
            }
            channel.emit(&ChannelEvent::Deleted);
        }
        Ok(())
    }

    /// Rebuild `parent`'s child list by following the predecessor chain from
    /// the child whose order is root. Siblings the chain never reaches
    /// (dangling predecessor or a cycle) keep their relative order at the end
    /// and are returned.
    pub(crate) fn sort_sub_channels(&mut self, parent: ChannelId) -> Vec<ChannelId> {
        let Some(channel) = self.channels.get(&parent) else {
            return Vec::new();
        };
        let mut remaining = channel.sub_channels().to_vec();
        let mut ordered = Vec::with_capacity(remaining.len());
        let mut predecessor = ChannelId::ROOT;

        while let Some(index) = remaining
            .iter()
            .position(|id| self.channels.get(id).map(Channel::order) == Some(predecessor))
        {
            let next = remaining.remove(index);
            ordered.push(next);
            predecessor = next;
        }

        let unreachable = remaining.clone();
        ordered.extend(remaining);

        if let Some(channel) = self.channels.get_mut(&parent)
            && channel.replace_sub_channels(ordered)
        {
            channel.emit(&ChannelEvent::SubChannelsReordered);
        }
        unreachable
    }

    /// Re-sort every child list in the subtree rooted at `from`.
    pub(crate) fn sort_sub_channels_recursively(&mut self, from: ChannelId) -> Vec<ChannelId> {
        let mut unreachable = Vec::new();
        let mut stack = vec![from];
        while let Some(next) = stack.pop() {
            unreachable.extend(self.sort_sub_channels(next));
            if let Some(channel) = self.channels.get(&next) {
                stack.extend_from_slice(channel.sub_channels());
            }
        }
        unreachable
    }

    // ── Clients ─────────────────────────────────────────────────────

    pub(crate) fn add_client(
        &mut self,
        channel: ChannelId,
        mut client: Client,
    ) -> Result<(), GraphError> {
        if channel.is_root() {
            return Err(GraphError::ClientInRoot);
        }
        if !self.channels.contains_key(&channel) {
            return Err(GraphError::UnknownChannel(channel));
        }
        let id = client.id();
        if self.clients.contains_key(&id) {
            return Err(GraphError::DuplicateClient(id));
        }

        client.set_channel(Some(channel));
        self.clients.insert(id, client);
        self.place_client(channel, id);
        Ok(())
    }

    /// Move an existing client to another channel.
    pub(crate) fn move_client(&mut self, id: ClientId, to: ChannelId) -> Result<(), GraphError> {
        if to.is_root() {
            return Err(GraphError::ClientInRoot);
        }
        if !self.channels.contains_key(&to) {
            return Err(GraphError::UnknownChannel(to));
        }
        let from = self
            .clients
            .get(&id)
            .ok_or(GraphError::UnknownClient(id))?
            .channel();
        if from == Some(to) {
            return Ok(());
        }

        if let Some(from) = from {
            self.unplace_client(from, id);
        }
        if let Some(client) = self.clients.get_mut(&id) {
            client.set_channel(Some(to));
        }
        self.place_client(to, id);
        Ok(())
    }

    /// Remove a client from the server entirely.
    pub(crate) fn remove_client(&mut self, id: ClientId) -> Result<Client, GraphError> {
        let mut client = self
            .clients
            .remove(&id)
            .ok_or(GraphError::UnknownClient(id))?;
        if let Some(channel) = client.channel() {
            self.unplace_client(channel, id);
        }
        client.set_channel(None);
        client.emit(&ClientEvent::Deleted);
        Ok(client)
    }

    pub(crate) fn update_client(
        &mut self,
        id: ClientId,
        update: ClientUpdate,
    ) -> Result<(), GraphError> {
        let client = self
            .clients
            .get_mut(&id)
            .ok_or(GraphError::UnknownClient(id))?;
        let reorder = client.apply(update);
        if reorder && let Some(channel) = client.channel() {
            self.sort_clients(channel);
        }
        Ok(())
    }

    fn place_client(&mut self, channel: ChannelId, id: ClientId) {
        let Some(client) = self.clients.get(&id) else {
            return;
        };
        let Some(target) = self.channels.get_mut(&channel) else {
            return;
        };
        let clients = &self.clients;
        let index = target
            .clients()
            .iter()
            .position(|other| {
                clients
                    .get(other)
                    .is_some_and(|other| client_order(client, other) == Ordering::Less)
            })
            .unwrap_or(target.clients().len());
        target.insert_client_at(index, id);
        target.emit(&ChannelEvent::ClientAdded(id));
    }

    fn unplace_client(&mut self, channel: ChannelId, id: ClientId) {
        if let Some(source) = self.channels.get_mut(&channel)
            && source.remove_client(id)
        {
            source.emit(&ChannelEvent::ClientRemoved(id));
        }
    }

    fn sort_clients(&mut self, channel: ChannelId) {
        let Some(target) = self.channels.get_mut(&channel) else {
            return;
        };
        let clients = &self.clients;
        let mut ordered = target.clients().to_vec();
        ordered.sort_by(|a, b| match (clients.get(a), clients.get(b)) {
            (Some(a), Some(b)) => client_order(a, b),
            _ => Ordering::Equal,
        });
        target.replace_clients(ordered);
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Delete the whole tree, firing deletion events bottom-up per branch.
    pub(crate) fn teardown(mut self) {
        let top_level = self.root_channel().sub_channels().to_vec();
        for channel in top_level {
            if let Err(e) = self.delete_channel(channel, false) {
                warn!(server = %self.id, error = %e, "teardown skipped a channel");
            }
        }
        for (_, mut client) in self.clients.drain() {
            client.emit(&ClientEvent::Deleted);
        }
        if let Some(root) = self.channels.get_mut(&ChannelId::ROOT) {
            root.emit(&ChannelEvent::Deleted);
        }
        self.listeners.emit(&ServerEvent::Deleted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::client::ClientKind;
    use std::sync::{Arc, Mutex};

    fn server() -> Server {
        Server::new(ServerId(1), "Home", ClientId(5))
    }

    fn add(server: &mut Server, parent: u64, id: u64, order: u64) {
        server
            .add_sub_channel(
                ChannelId(parent),
                Channel::new(ChannelId(id), format!("ch{id}"), ChannelId(order)),
            )
            .unwrap();
    }

    fn client(id: u64, nickname: &str, talk_power: i64) -> Client {
        let mut client = Client::new(ClientId(id), ClientKind::Regular, nickname);
        client.apply(ClientUpdate {
            talk_power: Some(talk_power),
            ..Default::default()
        });
        client
    }

    fn children(server: &Server, id: u64) -> Vec<u64> {
        server
            .channel(ChannelId(id))
            .unwrap()
            .sub_channels()
            .iter()
            .map(|c| c.get())
            .collect()
    }

    fn members(server: &Server, id: u64) -> Vec<u64> {
        server
            .channel(ChannelId(id))
            .unwrap()
            .clients()
            .iter()
            .map(|c| c.get())
            .collect()
    }

    fn record_channel(server: &mut Server, id: u64) -> Arc<Mutex<Vec<ChannelEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        server
            .on_channel_change(ChannelId(id), move |e| sink.lock().unwrap().push(e.clone()))
            .unwrap();
        seen
    }

    #[test]
    fn test_new_server_has_root() {
        let server = server();
        assert!(server.root_channel().is_root());
        assert_eq!(server.root_channel().name(), "Home");
        assert_eq!(server.channel_count(), 0);
        assert_eq!(server.sync_state(), SyncState::AwaitingChannels);
        assert!(server.local_client().is_none());
    }

    #[test]
    fn test_add_sub_channel_splices_after_predecessor() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 0, 30, 10);
        add(&mut server, 0, 20, 10);
        assert_eq!(children(&server, 0), vec![10, 20, 30]);
        assert_eq!(
            server.channel(ChannelId(20)).unwrap().parent(),
            Some(ChannelId::ROOT)
        );
    }

    #[test]
    fn test_add_sub_channel_rejections() {
        let mut server = server();
        add(&mut server, 0, 10, 0);

        let dup = server.add_sub_channel(ChannelId::ROOT, Channel::new(ChannelId(10), "x", ChannelId::ROOT));
        assert_eq!(dup, Err(GraphError::DuplicateChannel(ChannelId(10))));

        let orphan = server.add_sub_channel(ChannelId(99), Channel::new(ChannelId(11), "x", ChannelId::ROOT));
        assert_eq!(orphan, Err(GraphError::UnknownChannel(ChannelId(99))));

        let root = server.add_sub_channel(ChannelId(10), Channel::new(ChannelId::ROOT, "x", ChannelId::ROOT));
        assert_eq!(root, Err(GraphError::ReservedChannelId));
    }

    #[test]
    fn test_structural_events_fire_once() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        let seen = record_channel(&mut server, 10);

        add(&mut server, 10, 11, 0);
        server.add_client(ChannelId(10), client(5, "Alice", 0)).unwrap();
        server.remove_client(ClientId(5)).unwrap();
        server.delete_channel(ChannelId(11), true).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ChannelEvent::SubChannelAdded(ChannelId(11)),
                ChannelEvent::ClientAdded(ClientId(5)),
                ChannelEvent::ClientRemoved(ClientId(5)),
                ChannelEvent::SubChannelRemoved(ChannelId(11)),
            ]
        );
    }

    #[test]
    fn test_find_channel_in_subtree_only() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 10, 11, 0);
        add(&mut server, 0, 20, 10);

        assert!(server.find_channel_in(ChannelId(10), ChannelId(11)).is_some());
        assert!(server.find_channel_in(ChannelId(10), ChannelId(10)).is_some());
        assert!(server.find_channel_in(ChannelId(11), ChannelId(20)).is_none());
        assert!(server.find_channel_in(ChannelId::ROOT, ChannelId(20)).is_some());
    }

    #[test]
    fn test_clients_sorted_by_talk_power_then_nickname() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        server.add_client(ChannelId(10), client(1, "carl", 0)).unwrap();
        server.add_client(ChannelId(10), client(2, "Anna", 0)).unwrap();
        server.add_client(ChannelId(10), client(3, "zoe", 50)).unwrap();
        server.add_client(ChannelId(10), client(4, "bob", 0)).unwrap();
        assert_eq!(members(&server, 10), vec![3, 2, 4, 1]);

        server
            .update_client(
                ClientId(1),
                ClientUpdate {
                    talk_power: Some(100),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(members(&server, 10), vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_client_in_root_rejected() {
        let mut server = server();
        assert_eq!(
            server.add_client(ChannelId::ROOT, client(1, "a", 0)),
            Err(GraphError::ClientInRoot)
        );
        add(&mut server, 0, 10, 0);
        server.add_client(ChannelId(10), client(1, "a", 0)).unwrap();
        assert_eq!(
            server.move_client(ClientId(1), ChannelId::ROOT),
            Err(GraphError::ClientInRoot)
        );
    }

    #[test]
    fn test_move_client_keeps_single_membership() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 0, 20, 10);
        server.add_client(ChannelId(10), client(1, "a", 0)).unwrap();

        server.move_client(ClientId(1), ChannelId(20)).unwrap();
        assert!(members(&server, 10).is_empty());
        assert_eq!(members(&server, 20), vec![1]);
        assert_eq!(server.client_channel(ClientId(1)).unwrap().id(), ChannelId(20));

        assert_eq!(
            server.add_client(ChannelId(10), client(1, "a", 0)),
            Err(GraphError::DuplicateClient(ClientId(1)))
        );
    }

    #[test]
    fn test_move_channel_reparents() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 0, 20, 10);
        add(&mut server, 20, 21, 0);

        server.move_channel(ChannelId(10), Some(ChannelId(20)), ChannelId::ROOT).unwrap();
        assert_eq!(children(&server, 0), vec![20]);
        assert_eq!(children(&server, 20), vec![10, 21]);
        assert_eq!(server.channel(ChannelId(10)).unwrap().parent(), Some(ChannelId(20)));
    }

    #[test]
    fn test_move_channel_rejects_cycles() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 10, 11, 0);
        add(&mut server, 11, 12, 0);

        let err = server.move_channel(ChannelId(10), Some(ChannelId(12)), ChannelId::ROOT);
        assert_eq!(
            err,
            Err(GraphError::CyclicMove {
                channel: ChannelId(10),
                parent: ChannelId(12)
            })
        );
        assert_eq!(
            server.move_channel(ChannelId(10), Some(ChannelId(10)), ChannelId::ROOT),
            Err(GraphError::CyclicMove {
                channel: ChannelId(10),
                parent: ChannelId(10)
            })
        );
        assert_eq!(
            server.move_channel(ChannelId::ROOT, None, ChannelId::ROOT),
            Err(GraphError::RootImmutable)
        );
        assert_eq!(children(&server, 10), vec![11]);
    }

    #[test]
    fn test_delete_cascades_to_subtree() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 10, 11, 0);
        add(&mut server, 11, 12, 0);
        add(&mut server, 0, 20, 10);
        server.add_client(ChannelId(12), client(7, "deep", 0)).unwrap();
        let deleted = record_channel(&mut server, 12);
        let client_events = Arc::new(Mutex::new(Vec::new()));
        let sink = client_events.clone();
        server
            .on_client_change(ClientId(7), move |e| sink.lock().unwrap().push(e.clone()))
            .unwrap();

        server.delete_channel(ChannelId(10), true).unwrap();

        assert_eq!(children(&server, 0), vec![20]);
        assert!(server.channel(ChannelId(11)).is_none());
        assert!(server.channel(ChannelId(12)).is_none());
        // The client waits, detached, for its own removal.
        assert_eq!(server.client(ClientId(7)).unwrap().channel(), None);
        assert_eq!(server.client_count(), 1);
        assert_eq!(
            *client_events.lock().unwrap(),
            vec![ClientEvent::ChannelChanged {
                from: Some(ChannelId(12)),
                to: None,
            }]
        );
        server.remove_client(ClientId(7)).unwrap();
        assert!(server.client(ClientId(7)).is_none());
        assert_eq!(*deleted.lock().unwrap(), vec![ChannelEvent::Deleted]);
        assert_eq!(
            server.delete_channel(ChannelId::ROOT, true),
            Err(GraphError::RootImmutable)
        );
    }

    #[test]
    fn test_sort_follows_predecessor_chain() {
        let mut server = server();
        // Predecessors arrive late, so splicing leaves [30, 20, 10].
        add(&mut server, 0, 20, 10);
        add(&mut server, 0, 10, 30);
        add(&mut server, 0, 30, 0);
        assert_eq!(children(&server, 0), vec![30, 20, 10]);
        let seen = record_channel(&mut server, 0);

        let unreachable = server.sort_sub_channels(ChannelId::ROOT);
        assert!(unreachable.is_empty());
        assert_eq!(children(&server, 0), vec![30, 10, 20]);
        assert_eq!(*seen.lock().unwrap(), vec![ChannelEvent::SubChannelsReordered]);

        // Already ordered: no event.
        server.sort_sub_channels(ChannelId::ROOT);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_sort_reports_dangling_and_cyclic_siblings() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 0, 40, 99);
        add(&mut server, 0, 50, 60);
        add(&mut server, 0, 60, 50);
        add(&mut server, 0, 20, 10);

        let mut unreachable = server.sort_sub_channels(ChannelId::ROOT);
        unreachable.sort();
        assert_eq!(unreachable, vec![ChannelId(40), ChannelId(50), ChannelId(60)]);
        let order = children(&server, 0);
        assert_eq!(&order[..2], &[10, 20]);
        assert_eq!(order.len(), 5);
    }

    #[test]
    fn test_walk_is_depth_first_in_display_order() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        add(&mut server, 10, 11, 0);
        add(&mut server, 0, 20, 10);

        let walked: Vec<(usize, u64)> = server
            .walk()
            .into_iter()
            .map(|(depth, c)| (depth, c.id().get()))
            .collect();
        assert_eq!(walked, vec![(0, 10), (1, 11), (0, 20)]);
    }

    #[test]
    fn test_deferred_moves_drain_once() {
        let mut server = server();
        server.defer_move(ClientMoved {
            connection_id: ServerId(1),
            client_id: ClientId(5),
            new_channel_id: ChannelId(42),
            properties: None,
        });
        assert_eq!(server.deferred_move_count(), 1);
        assert_eq!(server.take_deferred_moves().len(), 1);
        assert!(server.take_deferred_moves().is_empty());
    }

    #[test]
    fn test_teardown_fires_deleted() {
        let mut server = server();
        add(&mut server, 0, 10, 0);
        server.add_client(ChannelId(10), client(5, "Alice", 0)).unwrap();
        let client_events = Arc::new(Mutex::new(Vec::new()));
        let client_sink = client_events.clone();
        server
            .on_client_change(ClientId(5), move |e| client_sink.lock().unwrap().push(e.clone()))
            .unwrap();
        let channel_events = record_channel(&mut server, 10);
        let server_events = Arc::new(Mutex::new(Vec::new()));
        let sink = server_events.clone();
        server.on_change(move |e| sink.lock().unwrap().push(e.clone()));

        server.teardown();

        assert_eq!(
            client_events.lock().unwrap().last(),
            Some(&ClientEvent::Deleted)
        );
        assert_eq!(*channel_events.lock().unwrap(), vec![ChannelEvent::Deleted]);
        assert_eq!(*server_events.lock().unwrap(), vec![ServerEvent::Deleted]);
    }
}
