use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelEvent};
use super::client::{Client, ClientEvent, ClientUpdate};
use super::error::{GraphError, SyncError};
use super::ids::{ChannelId, ClientId, ServerId};
use super::notify::{Listeners, replace_if_changed};
use super::server::{Server, ServerEvent, SyncState};
use crate::remote::frame::{
    AuthPayload, ChannelCreated, ChannelDeleted, ChannelEdited, ChannelInfo, ChannelMoved,
    ChannelsPayload, ClientInfo, ClientMoved, ClientPropertiesUpdated, ConnectStatus,
    ConnectStatusChanged, ConnectionInfo, InboundFrame, TalkStatusChanged,
};

/// Upper bound on resolution passes during a channel import. A descriptor
/// chain nested deeper than this cannot be resolved.
pub const MAX_RESOLUTION_PASSES: usize = 1000;

/// Notifications about the set of attached servers.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    ServerAdded(ServerId),
    ServerRemoved(ServerId),
    ActiveServerChanged {
        old: Option<ServerId>,
        new: Option<ServerId>,
    },
}

/// Reconciles inbound frames into the mirrored graphs of every attached server.
///
/// The handler is the only writer of the graph. Frames are applied one at a
/// time, and every listener fires synchronously before `handle` returns.
#[derive(Debug)]
pub struct SessionHandler {
    /// Attached servers, in attachment order.
    servers: Vec<Server>,
    active: watch::Sender<Option<ServerId>>,
    listeners: Listeners<HandlerEvent>,
}

impl Default for SessionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHandler {
    pub fn new() -> Self {
        Self {
            servers: Vec::new(),
            active: watch::Sender::new(None),
            listeners: Listeners::new(),
        }
    }

    /// Apply one inbound frame.
    ///
    /// An error means the frame referenced state that does not exist (or a
    /// snapshot could not be resolved) and the affected server's graph should
    /// be considered out of sync.
    pub fn handle(&mut self, frame: InboundFrame) -> Result<(), SyncError> {
        match frame {
            InboundFrame::Auth(payload) => self.on_auth(payload),
            InboundFrame::ConnectStatusChanged(event) => self.on_connect_status_changed(event),
            InboundFrame::Channels(event) => self.on_channels(event),
            InboundFrame::ClientMoved(event) => self.on_client_moved(event),
            InboundFrame::ClientPropertiesUpdated(event) => self.on_client_properties_updated(event),
            InboundFrame::TalkStatusChanged(event) => self.on_talk_status_changed(event),
            InboundFrame::ChannelCreated(event) => self.on_channel_created(event),
            InboundFrame::ChannelMoved(event) => self.on_channel_moved(event),
            InboundFrame::ChannelEdited(event) => self.on_channel_edited(event),
            InboundFrame::ChannelDeleted(event) => self.on_channel_deleted(event),
            InboundFrame::Unrecognized { kind } => {
                debug!(%kind, "ignoring unrecognized frame");
                Ok(())
            }
        }
    }

    /// Tear down every attached server. Used when the transport is lost.
    pub fn reset(&mut self) {
        self.teardown_servers();
        self.set_active_server(None);
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.servers.iter().find(|s| s.id() == id)
    }

    pub fn server_by_name(&self, name: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.name() == name)
    }

    pub fn active_server_id(&self) -> Option<ServerId> {
        *self.active.borrow()
    }

    pub fn active_server(&self) -> Option<&Server> {
        self.active_server_id().and_then(|id| self.server(id))
    }

    /// A receiver that observes every change of the active server.
    pub fn watch_active_server(&self) -> watch::Receiver<Option<ServerId>> {
        self.active.subscribe()
    }

    // ── Subscriptions ───────────────────────────────────────────────

    pub fn subscribe(&mut self, callback: impl FnMut(&HandlerEvent) + Send + 'static) {
        self.listeners.subscribe(callback);
    }

    pub fn subscribe_server(
        &mut self,
        server: ServerId,
        callback: impl FnMut(&ServerEvent) + Send + 'static,
    ) -> Result<(), SyncError> {
        self.server_mut(server)?.on_change(callback);
        Ok(())
    }

    pub fn subscribe_channel(
        &mut self,
        server: ServerId,
        channel: ChannelId,
        callback: impl FnMut(&ChannelEvent) + Send + 'static,
    ) -> Result<(), SyncError> {
        self.server_mut(server)?
            .on_channel_change(channel, callback)
            .map_err(SyncError::graph(server))
    }

    pub fn subscribe_client(
        &mut self,
        server: ServerId,
        client: ClientId,
        callback: impl FnMut(&ClientEvent) + Send + 'static,
    ) -> Result<(), SyncError> {
        self.server_mut(server)?
            .on_client_change(client, callback)
            .map_err(SyncError::graph(server))
    }

    // ── Server lifecycle ────────────────────────────────────────────

    fn on_auth(&mut self, payload: AuthPayload) -> Result<(), SyncError> {
        self.teardown_servers();

        let mut first_error = None;
        for connection in payload.connections {
            let id = connection.id;
            match load_connection(connection) {
                Ok(server) => self.attach_server(server),
                Err(e) => {
                    error!(server = %id, error = %e, "failed to load server snapshot");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.update_active_server();
        first_error.map_or(Ok(()), Err)
    }

    fn on_connect_status_changed(&mut self, event: ConnectStatusChanged) -> Result<(), SyncError> {
        let id = event.connection_id;
        let known = self.server(id).is_some();

        match (known, event.status()) {
            (false, ConnectStatus::Connected) => {
                let info = event.info.ok_or(SyncError::MissingConnectInfo(id))?;
                self.attach_server(Server::new(id, info.server_name, info.client_id));
                if self.active_server_id().is_none() {
                    self.update_active_server();
                }
            }
            (true, ConnectStatus::Disconnected) => self.remove_server(id),
            (_, status) => debug!(server = %id, ?status, known, "connect status ignored"),
        }
        Ok(())
    }

    fn attach_server(&mut self, server: Server) {
        let id = server.id();
        if self.server(id).is_some() {
            warn!(server = %id, "server attached twice, replacing");
            self.remove_server(id);
        }

        info!(
            server = %id,
            name = %server.name(),
            channels = server.channel_count(),
            clients = server.client_count(),
            "server attached"
        );
        self.servers.push(server);
        self.listeners.emit(&HandlerEvent::ServerAdded(id));
    }

    fn remove_server(&mut self, id: ServerId) {
        let Some(index) = self.servers.iter().position(|s| s.id() == id) else {
            return;
        };
        self.servers.remove(index).teardown();
        info!(server = %id, "server detached");
        self.listeners.emit(&HandlerEvent::ServerRemoved(id));

        if self.active_server_id() == Some(id) {
            self.update_active_server();
        }
    }

    fn teardown_servers(&mut self) {
        for server in std::mem::take(&mut self.servers) {
            let id = server.id();
            server.teardown();
            self.listeners.emit(&HandlerEvent::ServerRemoved(id));
        }
    }

    // ── Channel list ────────────────────────────────────────────────

    fn on_channels(&mut self, event: ChannelsPayload) -> Result<(), SyncError> {
        let id = event.connection_id;
        let server = self.server_mut(id)?;
        import_channels(server, event.info.into_descriptors(), Vec::new())?;
        server.mark_synchronized();

        let deferred = server.take_deferred_moves();
        info!(
            server = %id,
            channels = server.channel_count(),
            replayed = deferred.len(),
            "channel list imported"
        );
        for moved in deferred {
            self.on_client_moved(moved)?;
        }
        Ok(())
    }

    // ── Clients ─────────────────────────────────────────────────────

    fn on_client_moved(&mut self, event: ClientMoved) -> Result<(), SyncError> {
        let server_id = event.connection_id;
        let client_id = event.client_id;
        let destination = event.new_channel_id;
        let server = self.server_mut(server_id)?;

        if server.sync_state() == SyncState::AwaitingChannels {
            let destination_known = destination.is_root() || server.channel(destination).is_some();
            let client_known = server.client(client_id).is_some();
            if !destination_known || (!client_known && event.properties.is_none()) {
                debug!(
                    server = %server_id,
                    client = %client_id,
                    channel = %destination,
                    "channel list pending, deferring move"
                );
                server.defer_move(event);
                return Ok(());
            }
        }

        if destination.is_root() {
            server
                .remove_client(client_id)
                .map_err(SyncError::graph(server_id))?;
            debug!(server = %server_id, client = %client_id, "client disconnected");
            return Ok(());
        }

        let Some(properties) = event.properties else {
            server
                .move_client(client_id, destination)
                .map_err(SyncError::graph(server_id))?;
            debug!(server = %server_id, client = %client_id, channel = %destination, "client switched channel");
            return Ok(());
        };

        if server.client(client_id).is_some() {
            server
                .remove_client(client_id)
                .map_err(SyncError::graph(server_id))?;
        }
        let client = Client::from_properties(client_id, &properties);
        let local_unmuted =
            client_id == server.local_client_id() && !client.is_hardware_muted();
        server
            .add_client(destination, client)
            .map_err(SyncError::graph(server_id))?;
        debug!(server = %server_id, client = %client_id, channel = %destination, "client connected");

        if local_unmuted {
            self.set_active_server(Some(server_id));
        }
        Ok(())
    }

    fn on_client_properties_updated(
        &mut self,
        event: ClientPropertiesUpdated,
    ) -> Result<(), SyncError> {
        let server_id = event.connection_id;
        let server = self.server_mut(server_id)?;
        let update = ClientUpdate::from(&event.properties);

        let was_muted = server
            .client(event.client_id)
            .is_some_and(Client::is_hardware_muted);
        let unmuting = event.client_id == server.local_client_id()
            && was_muted
            && update.hardware_muted == Some(false);

        server
            .update_client(event.client_id, update)
            .map_err(SyncError::graph(server_id))?;

        if unmuting {
            self.set_active_server(Some(server_id));
        }
        Ok(())
    }

    fn on_talk_status_changed(&mut self, event: TalkStatusChanged) -> Result<(), SyncError> {
        let server_id = event.connection_id;
        let update = ClientUpdate {
            talking: Some(event.status != 0),
            ..Default::default()
        };
        self.server_mut(server_id)?
            .update_client(event.client_id, update)
            .map_err(SyncError::graph(server_id))
    }

    // ── Channels ────────────────────────────────────────────────────

    fn on_channel_created(&mut self, event: ChannelCreated) -> Result<(), SyncError> {
        let server_id = event.connection_id;
        let channel = Channel::new(
            event.channel_id,
            event.properties.name.unwrap_or_default(),
            event.properties.order.unwrap_or_default(),
        );
        self.server_mut(server_id)?
            .add_sub_channel(event.parent_id, channel)
            .map_err(SyncError::graph(server_id))?;
        debug!(server = %server_id, channel = %event.channel_id, parent = %event.parent_id, "channel created");
        Ok(())
    }

    fn on_channel_moved(&mut self, event: ChannelMoved) -> Result<(), SyncError> {
        let server_id = event.connection_id;
        self.server_mut(server_id)?
            .move_channel(event.channel_id, event.parent_id, event.order)
            .map_err(SyncError::graph(server_id))?;
        debug!(server = %server_id, channel = %event.channel_id, parent = ?event.parent_id, order = %event.order, "channel moved");
        Ok(())
    }

    fn on_channel_edited(&mut self, event: ChannelEdited) -> Result<(), SyncError> {
        let server_id = event.connection_id;
        let channel_id = event.channel_id;
        let server = self.server_mut(server_id)?;
        let current_order = server
            .channel(channel_id)
            .map(Channel::order)
            .ok_or(SyncError::Graph {
                server: server_id,
                source: GraphError::UnknownChannel(channel_id),
            })?;

        if let Some(name) = event.properties.name {
            server
                .rename_channel(channel_id, name)
                .map_err(SyncError::graph(server_id))?;
        }
        if let Some(order) = event.properties.order
            && order != current_order
        {
            server
                .move_channel(channel_id, None, order)
                .map_err(SyncError::graph(server_id))?;
        }
        Ok(())
    }

    fn on_channel_deleted(&mut self, event: ChannelDeleted) -> Result<(), SyncError> {
        let server_id = event.connection_id;
        let server = self.server_mut(server_id)?;

        let stranded = server.clients_in_subtree(event.channel_id);
        if !stranded.is_empty() {
            warn!(
                server = %server_id,
                channel = %event.channel_id,
                clients = stranded.len(),
                "deleting channel that still holds clients, awaiting their removal"
            );
        }
        server
            .delete_channel(event.channel_id, true)
            .map_err(SyncError::graph(server_id))?;
        debug!(server = %server_id, channel = %event.channel_id, "channel deleted");
        Ok(())
    }

    // ── Active server ───────────────────────────────────────────────

    /// Pick the first server whose local client is not hardware-muted, else
    /// the first server.
    fn update_active_server(&mut self) {
        let selected = self
            .servers
            .iter()
            .find(|s| s.local_client().is_some_and(|c| !c.is_hardware_muted()))
            .or_else(|| self.servers.first())
            .map(Server::id);
        self.set_active_server(selected);
    }

    fn set_active_server(&mut self, id: Option<ServerId>) {
        let mut previous = None;
        self.active.send_if_modified(|current| {
            previous = replace_if_changed(current, id);
            previous.is_some()
        });
        if let Some(old) = previous {
            info!(?old, new = ?id, "active server changed");
            self.listeners
                .emit(&HandlerEvent::ActiveServerChanged { old, new: id });
        }
    }

    fn server_mut(&mut self, id: ServerId) -> Result<&mut Server, SyncError> {
        self.servers
            .iter_mut()
            .find(|s| s.id() == id)
            .ok_or(SyncError::UnknownServer(id))
    }
}

// ── Snapshot import ─────────────────────────────────────────────────

fn load_connection(info: ConnectionInfo) -> Result<Server, SyncError> {
    let mut server = Server::new(info.id, info.properties.name, info.client_id);
    import_channels(
        &mut server,
        info.channel_infos.into_descriptors(),
        info.client_infos,
    )?;
    // A connection still joining has no channels yet; its list follows later.
    if server.channel_count() > 0 {
        server.mark_synchronized();
    }
    Ok(server)
}

/// Attach channel descriptors whose parents may arrive later in the list.
///
/// Each pass attaches every descriptor whose parent is already present,
/// together with the clients listed in it. A pass that attaches nothing, or
/// running out of passes, fails with the unresolved ids. Descriptors for
/// channels that already exist are skipped.
fn import_channels(
    server: &mut Server,
    descriptors: Vec<ChannelInfo>,
    mut clients: Vec<ClientInfo>,
) -> Result<(), SyncError> {
    let server_id = server.id();
    let mut remaining: Vec<ChannelInfo> = descriptors
        .into_iter()
        .filter(|d| {
            let present = server.channel(d.id).is_some();
            if present {
                debug!(server = %server_id, channel = %d.id, "channel already present, skipping");
            }
            !present
        })
        .collect();

    let mut passes = 0;
    while !remaining.is_empty() {
        if passes == MAX_RESOLUTION_PASSES {
            return Err(unresolved(server_id, passes, &remaining));
        }
        passes += 1;

        let before = remaining.len();
        let mut deferred = Vec::with_capacity(before);
        for descriptor in remaining {
            if server.channel(descriptor.parent_id).is_none() {
                deferred.push(descriptor);
                continue;
            }
            attach_descriptor(server, descriptor, &mut clients)?;
        }
        remaining = deferred;

        if remaining.len() == before {
            return Err(unresolved(server_id, passes, &remaining));
        }
    }

    let unreachable = server.sort_sub_channels_recursively(ChannelId::ROOT);
    if !unreachable.is_empty() {
        warn!(server = %server_id, channels = ?unreachable, "sibling order chain broken, appended at end");
    }
    for client in clients {
        warn!(
            server = %server_id,
            client = %client.id,
            channel = %client.channel_id,
            "snapshot client references unknown channel, dropped"
        );
    }
    debug!(server = %server_id, passes, "channels resolved");
    Ok(())
}

fn attach_descriptor(
    server: &mut Server,
    descriptor: ChannelInfo,
    clients: &mut Vec<ClientInfo>,
) -> Result<(), SyncError> {
    let server_id = server.id();
    let channel_id = descriptor.id;
    let channel = Channel::new(channel_id, descriptor.name(), descriptor.order());
    server
        .add_sub_channel(descriptor.parent_id, channel)
        .map_err(SyncError::graph(server_id))?;

    let (members, rest): (Vec<_>, Vec<_>) = std::mem::take(clients)
        .into_iter()
        .partition(|c| c.channel_id == channel_id);
    *clients = rest;

    for info in members {
        server
            .add_client(channel_id, Client::from_properties(info.id, &info.properties))
            .map_err(SyncError::graph(server_id))?;
    }
    Ok(())
}

fn unresolved(server: ServerId, passes: usize, remaining: &[ChannelInfo]) -> SyncError {
    SyncError::UnresolvedChannels {
        server,
        passes,
        remaining: remaining.iter().map(|d| d.id).collect(),
    }
}
