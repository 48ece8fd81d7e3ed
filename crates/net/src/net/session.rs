use std::net::{SocketAddr, ToSocketAddrs};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use super::clock::NetClock;
use super::codec::ByteCodec;
use super::config::NetConfig;
use super::connection::{Connection, ConnectionState};
use super::endpoint::UdpEndpoint;
use super::error::{RegistryError, SessionError};
use super::message::{MessageContext, MessageHandler, MessageOptions, MessageRegistry, WireMessage};
use super::packet::{ReceivedPacket, WirePacket};
use super::protocol::{
    CoreMessage, HOST_CONNECTION_INDEX, INVALID_CONNECTION_INDEX, JoinDenyReason,
};
use super::simulator::NetworkSimulation;
use crate::replication::{NetObjectId, ObjectHandle, ReplicationSystem};

pub type JoinCallback = Rc<dyn Fn(&mut Session, u8, &str)>;
pub type LeaveCallback = Rc<dyn Fn(&mut Session, u8)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Bound,
    Connecting,
    Joining,
    Ready,
}

/// One endpoint's view of a session: the connection table, the message
/// registry, the shared clock and the replicated objects.
///
/// Frame order is `process_incoming_packets`, `update`,
/// `process_outgoing_packets`; `step` runs all three.
pub struct Session {
    config: NetConfig,
    endpoint: Option<UdpEndpoint>,
    connections: Vec<Option<Connection>>,
    pending_self: Option<Connection>,
    my_index: Option<u8>,
    host: bool,
    state: SessionState,
    registry: MessageRegistry,
    replication: ReplicationSystem,
    clock: NetClock,
    display_name: String,
    host_addr: Option<SocketAddr>,
    join_started: Option<Instant>,
    last_join_request: Option<Instant>,
    last_heartbeat: Instant,
    last_update: Instant,
    frame_time: Instant,
    last_error: Option<SessionError>,
    last_pong: Option<(SocketAddr, u32)>,
    on_join: Option<JoinCallback>,
    on_leave: Option<LeaveCallback>,
}

impl Session {
    pub fn new(config: NetConfig) -> Self {
        let now = Instant::now();
        let slots = config.connection_slots();
        let mut session = Self {
            config,
            endpoint: None,
            connections: (0..slots).map(|_| None).collect(),
            pending_self: None,
            my_index: None,
            host: false,
            state: SessionState::Disconnected,
            registry: MessageRegistry::new(),
            replication: ReplicationSystem::new(),
            clock: NetClock::new(now),
            display_name: String::from("player"),
            host_addr: None,
            join_started: None,
            last_join_request: None,
            last_heartbeat: now,
            last_update: now,
            frame_time: now,
            last_error: None,
            last_pong: None,
            on_join: None,
            on_leave: None,
        };
        session.register_core_messages();
        session
    }

    fn register_core_messages(&mut self) {
        for kind in CoreMessage::ALL {
            let handler: MessageHandler = Rc::new(
                move |session: &mut Session, context: &MessageContext, message: &mut WireMessage| {
                    session.handle_core(kind, context, message)
                },
            );
            if let Err(e) =
                self.registry
                    .register(kind.name(), kind.options(), Some(handler), Some(kind.index()))
            {
                log::error!("Failed to register {}: {}", kind.name(), e);
            }
        }
    }

    /// Registers a definition with a dynamic index. The returned index is
    /// only current until the next registration, since dynamic indices are
    /// reassigned in name order; resolve messages with `create_message`.
    pub fn register_message_definition<F>(
        &mut self,
        name: &str,
        options: MessageOptions,
        handler: F,
    ) -> Result<u8, RegistryError>
    where
        F: Fn(&mut Session, &MessageContext, &mut WireMessage) + 'static,
    {
        self.registry.register(name, options, Some(Rc::new(handler)), None)
    }

    pub fn register_message_definition_at<F>(
        &mut self,
        name: &str,
        options: MessageOptions,
        index: u8,
        handler: F,
    ) -> Result<u8, RegistryError>
    where
        F: Fn(&mut Session, &MessageContext, &mut WireMessage) + 'static,
    {
        self.registry
            .register(name, options, Some(Rc::new(handler)), Some(index))
    }

    pub fn register_object_definition<F>(&mut self, type_id: u8, factory: F) -> bool
    where
        F: Fn(&mut ByteCodec) -> Option<ObjectHandle> + 'static,
    {
        self.replication.register_definition(type_id, Rc::new(factory))
    }

    pub fn on_join<F>(&mut self, callback: F)
    where
        F: Fn(&mut Session, u8, &str) + 'static,
    {
        self.on_join = Some(Rc::new(callback));
    }

    pub fn on_leave<F>(&mut self, callback: F)
    where
        F: Fn(&mut Session, u8) + 'static,
    {
        self.on_leave = Some(Rc::new(callback));
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.registry
    }

    pub fn replication(&self) -> &ReplicationSystem {
        &self.replication
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_host(&self) -> bool {
        self.host
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    pub fn my_index(&self) -> Option<u8> {
        self.my_index
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().map(UdpEndpoint::local_addr)
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn set_display_name(&mut self, name: impl Into<String>) {
        self.display_name = name.into();
    }

    pub fn connection(&self, index: u8) -> Option<&Connection> {
        self.connections.get(index as usize)?.as_ref()
    }

    pub fn connection_mut(&mut self, index: u8) -> Option<&mut Connection> {
        self.connections.get_mut(index as usize)?.as_mut()
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.iter().flatten()
    }

    /// Ready connections other than this session's own.
    pub fn ready_peers(&self) -> Vec<u8> {
        self.connections()
            .filter(|c| c.is_ready() && !c.is_local())
            .map(Connection::index)
            .collect()
    }

    pub fn network_time(&self) -> f64 {
        self.clock.time(Instant::now())
    }

    pub fn network_time_at(&self, now: Instant) -> f64 {
        self.clock.time(now)
    }

    pub fn take_last_error(&mut self) -> Option<SessionError> {
        self.last_error.take()
    }

    pub fn take_last_pong(&mut self) -> Option<(SocketAddr, u32)> {
        self.last_pong.take()
    }

    pub fn set_simulation(&mut self, simulation: NetworkSimulation) {
        self.config.simulation = simulation;
        for connection in self.connections.iter_mut().flatten() {
            connection.set_simulation(simulation);
        }
        if let Some(connection) = self.pending_self.as_mut() {
            connection.set_simulation(simulation);
        }
    }

    fn record_error(&mut self, error: SessionError) -> SessionError {
        log::warn!("{}", error);
        self.last_error = Some(error.clone());
        error
    }

    pub fn host(&mut self, port: u16) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(self.record_error(SessionError::AlreadyActive));
        }
        let now = Instant::now();
        let endpoint =
            match UdpEndpoint::bind_in_range(self.config.bind_ip, port, self.config.port_range) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    return Err(self.record_error(SessionError::Bind {
                        port,
                        source: Arc::new(e),
                    }));
                }
            };
        let local_addr = endpoint.local_addr();
        log::info!("Hosting session on {}", local_addr);
        self.endpoint = Some(endpoint);
        self.state = SessionState::Bound;

        let mut me = Connection::new(local_addr, HOST_CONNECTION_INDEX, &self.config, now);
        me.set_local(true);
        me.set_display_id(self.display_name.clone());
        me.set_state(ConnectionState::Ready);
        self.connections[HOST_CONNECTION_INDEX as usize] = Some(me);
        self.my_index = Some(HOST_CONNECTION_INDEX);
        self.host = true;

        self.clock.start_authority(now);
        self.last_update = now;
        self.last_heartbeat = now;
        self.frame_time = now;
        self.state = SessionState::Ready;
        Ok(())
    }

    pub fn join(&mut self, host_addr: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(self.record_error(SessionError::AlreadyActive));
        }
        let Some(resolved) = host_addr
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
        else {
            return Err(self.record_error(SessionError::InvalidAddress(host_addr.to_string())));
        };

        let now = Instant::now();
        let endpoint = match UdpEndpoint::bind_in_range(
            self.config.bind_ip,
            resolved.port(),
            self.config.port_range,
        ) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                return Err(self.record_error(SessionError::Bind {
                    port: resolved.port(),
                    source: Arc::new(e),
                }));
            }
        };
        let local_addr = endpoint.local_addr();
        log::info!("Joining {} from {}", resolved, local_addr);
        self.endpoint = Some(endpoint);
        self.state = SessionState::Bound;

        let mut host = Connection::new(resolved, HOST_CONNECTION_INDEX, &self.config, now);
        host.set_state(ConnectionState::Connected);
        self.connections[HOST_CONNECTION_INDEX as usize] = Some(host);

        let mut me = Connection::new(local_addr, INVALID_CONNECTION_INDEX, &self.config, now);
        me.set_local(true);
        me.set_display_id(self.display_name.clone());
        me.set_state(ConnectionState::Connected);
        self.pending_self = Some(me);

        self.host = false;
        self.host_addr = Some(resolved);
        self.clock.reset(now);
        self.last_update = now;
        self.last_heartbeat = now;
        self.frame_time = now;
        self.join_started = Some(now);
        self.state = SessionState::Connecting;
        self.send_join_request(now);
        Ok(())
    }

    /// Hangs up on every peer, flushes once and tears the session down.
    pub fn leave(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        let remote: Vec<u8> = self
            .connections()
            .filter(|c| !c.is_local())
            .map(Connection::index)
            .collect();
        for index in remote {
            self.send(index, core_message(CoreMessage::Hangup));
        }
        self.flush_connections(Instant::now(), true);
        log::info!("Left session");
        self.teardown();
    }

    fn teardown(&mut self) {
        self.endpoint = None;
        self.connections.clear();
        self.connections
            .resize_with(self.config.connection_slots(), || None);
        self.pending_self = None;
        self.my_index = None;
        self.host = false;
        self.host_addr = None;
        self.join_started = None;
        self.last_join_request = None;
        self.replication.clear();
        self.state = SessionState::Disconnected;
    }

    pub fn step(&mut self) {
        let now = Instant::now();
        self.process_incoming_packets(now);
        self.update(now);
        self.process_outgoing_packets(now);
    }

    pub fn send(&mut self, index: u8, message: WireMessage) -> bool {
        let Some(connection) = self.connection_mut(index) else {
            log::warn!("No connection {} to send message {} to", index, message.index());
            return false;
        };
        match connection.send(message) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping message for connection {}: {}", index, e);
                false
            }
        }
    }

    /// Sends a copy to every Ready connection, optionally including our own.
    pub fn broadcast(&mut self, message: &WireMessage, include_self: bool) -> usize {
        let targets: Vec<u8> = self
            .connections()
            .filter(|c| c.is_ready() && (include_self || !c.is_local()))
            .map(Connection::index)
            .collect();
        targets
            .into_iter()
            .filter(|&index| self.send(index, message.clone()))
            .count()
    }

    pub fn create_message(&self, name: &str) -> Option<WireMessage> {
        self.registry.by_name(name).map(WireMessage::new)
    }

    pub fn ping(&mut self, addr: SocketAddr, nonce: u32) {
        let mut message = core_message(CoreMessage::Ping);
        message.payload_mut().write_u32(nonce);
        self.send_connectionless(addr, &message);
    }

    /// Host only: starts replicating `handle` and announces it to every Ready peer.
    pub fn sync_object(&mut self, type_id: u8, handle: ObjectHandle) -> Option<NetObjectId> {
        if !self.host {
            log::warn!("Only the host can sync objects");
            return None;
        }
        if !self.replication.is_registered(type_id) {
            log::warn!("No object definition for type {}", type_id);
            return None;
        }
        let remote: Vec<u8> = self
            .connections()
            .filter(|c| !c.is_local())
            .map(Connection::index)
            .collect();
        let id = self
            .replication
            .register_object(type_id, handle, remote, self.frame_time)?;
        if let Some(message) = self.replication.create_message(id) {
            self.broadcast(&message, false);
        }
        Some(id)
    }

    pub fn unsync_object(&mut self, id: NetObjectId) -> bool {
        if !self.host {
            return false;
        }
        let Some(message) = self.replication.destroy_message(id) else {
            return false;
        };
        self.broadcast(&message, false);
        self.replication.remove_object(id).is_some()
    }

    pub fn process_incoming_packets(&mut self, now: Instant) {
        self.frame_time = now;
        let datagrams = match self.endpoint.as_mut() {
            Some(endpoint) => match endpoint.receive() {
                Ok(datagrams) => datagrams,
                Err(e) => {
                    log::warn!("Socket receive failed: {}", e);
                    Vec::new()
                }
            },
            None => return,
        };

        for (bytes, sender) in datagrams {
            self.handle_datagram(&bytes, sender, now);
        }

        for slot in 0..self.connections.len() {
            let Some(connection) = self.connections[slot].as_mut() else {
                continue;
            };
            let context = MessageContext {
                sender: connection.addr(),
                connection: Some(slot as u8),
            };
            for mut message in connection.process(now) {
                self.dispatch(&context, &mut message);
            }
        }
    }

    fn handle_datagram(&mut self, bytes: &[u8], sender: SocketAddr, now: Instant) {
        let packet = match WirePacket::parse(bytes, sender, &self.registry) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("Dropping datagram from {}: {}", sender, e);
                return;
            }
        };

        match self.find_connection(sender, packet.header.sender_index) {
            Some(slot) => {
                if let Some(connection) = self.connections[slot].as_mut() {
                    connection.receive(packet, now);
                }
            }
            None => self.dispatch_connectionless(packet),
        }
    }

    fn find_connection(&self, sender: SocketAddr, hint: u8) -> Option<usize> {
        let matches = |slot: &Option<Connection>| {
            slot.as_ref()
                .is_some_and(|c| !c.is_local() && c.addr() == sender)
        };
        if self.connections.get(hint as usize).is_some_and(matches) {
            return Some(hint as usize);
        }
        self.connections.iter().position(matches)
    }

    fn dispatch_connectionless(&mut self, packet: ReceivedPacket) {
        let context = MessageContext {
            sender: packet.sender,
            connection: None,
        };
        for mut message in packet.messages {
            if !message.options().contains(MessageOptions::CONNECTIONLESS) {
                log::debug!(
                    "Ignoring message {} from unconnected {}",
                    message.index(),
                    packet.sender
                );
                continue;
            }
            self.dispatch(&context, &mut message);
        }
    }

    fn dispatch(&mut self, context: &MessageContext, message: &mut WireMessage) {
        let handler = self
            .registry
            .by_index(message.index())
            .and_then(|d| d.handler().cloned());
        match handler {
            Some(handler) => handler(self, context, message),
            None => log::trace!("No handler for message {}", message.index()),
        }
    }

    /// Join retries and timeouts, heartbeats, clock advance and teardown of
    /// connections marked for destruction.
    pub fn update(&mut self, now: Instant) {
        self.frame_time = now;
        let delta = now.saturating_duration_since(self.last_update);
        self.last_update = now;
        self.clock.advance(delta);

        match self.state {
            SessionState::Connecting | SessionState::Joining => {
                let timeout = self.config.join_timeout;
                let expired = self
                    .join_started
                    .is_some_and(|started| now.saturating_duration_since(started) > timeout);
                if expired {
                    self.record_error(SessionError::JoinTimeout(timeout));
                    self.teardown();
                    return;
                }
                let retry_due = self.last_join_request.is_none_or(|last| {
                    now.saturating_duration_since(last) >= self.config.join_retry_interval
                });
                if self.state == SessionState::Connecting && retry_due {
                    self.send_join_request(now);
                }
            }
            SessionState::Ready => {
                self.check_timeouts(now);
                self.send_heartbeats(now);
            }
            SessionState::Disconnected | SessionState::Bound => {}
        }

        self.destroy_marked_connections();
    }

    fn check_timeouts(&mut self, now: Instant) {
        let timeout = self.config.connection_timeout;
        for connection in self.connections.iter_mut().flatten() {
            if !connection.is_local()
                && !connection.is_marked_for_destroy()
                && connection.is_timed_out(now, timeout)
            {
                log::warn!(
                    "Connection {} ({}) timed out",
                    connection.index(),
                    connection.addr()
                );
                connection.mark_for_destroy();
            }
        }
    }

    fn send_heartbeats(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_heartbeat) < self.config.heartbeat_interval() {
            return;
        }
        self.last_heartbeat = now;

        let sync = self.host.then(|| self.sync_time_message(now));
        for index in self.ready_peers() {
            self.send(index, core_message(CoreMessage::Heartbeat));
            if let Some(sync) = &sync {
                self.send(index, sync.clone());
            }
        }
    }

    fn destroy_marked_connections(&mut self) {
        for slot in 0..self.connections.len() {
            let marked = self.connections[slot]
                .as_ref()
                .is_some_and(Connection::is_marked_for_destroy);
            if marked {
                self.destroy_connection(slot);
                if self.state == SessionState::Disconnected {
                    return;
                }
            }
        }
    }

    fn destroy_connection(&mut self, slot: usize) {
        let index = slot as u8;
        let was_ready = self.connections[slot]
            .as_ref()
            .is_some_and(Connection::is_ready);
        if self.host && was_ready {
            if let Some(callback) = self.on_leave.clone() {
                callback(self, index);
            }
        }

        self.replication.remove_connection(index);
        if let Some(connection) = self.connections[slot].take() {
            log::info!(
                "Connection {} ({}) destroyed",
                connection.index(),
                connection.addr()
            );
        }

        if !self.host && index == HOST_CONNECTION_INDEX {
            self.record_error(SessionError::HostLost);
            self.teardown();
        }
    }

    pub fn process_outgoing_packets(&mut self, now: Instant) {
        self.frame_time = now;
        self.flush_connections(now, false);
    }

    fn flush_connections(&mut self, now: Instant, force: bool) {
        let interval = self.config.send_interval();
        let local_index = self.my_index.unwrap_or(INVALID_CONNECTION_INDEX);
        let replicate = self.host;
        let mut loopback = Vec::new();

        let Self {
            connections,
            replication,
            endpoint,
            ..
        } = self;
        for (slot, entry) in connections.iter_mut().enumerate() {
            let Some(connection) = entry.as_mut() else {
                continue;
            };
            if !force && !connection.is_send_due(now, interval) {
                continue;
            }
            let local = connection.is_local();
            let packet = connection.flush_with(now, local_index, |packet| {
                if replicate && !local {
                    replication.fill_packet(slot as u8, packet, now);
                }
            });
            let Some(packet) = packet else {
                continue;
            };

            if local {
                loopback.push((slot, packet));
            } else if let Some(endpoint) = endpoint.as_mut() {
                if let Err(e) = endpoint.send_to(packet.as_bytes(), connection.addr()) {
                    log::warn!("Send to {} failed: {}", connection.addr(), e);
                }
            }
        }

        for (slot, packet) in loopback {
            self.loop_back(slot, &packet, now);
        }
    }

    fn loop_back(&mut self, slot: usize, packet: &WirePacket, now: Instant) {
        let Some(addr) = self.connections[slot].as_ref().map(Connection::addr) else {
            return;
        };
        match WirePacket::parse(packet.as_bytes(), addr, &self.registry) {
            Ok(parsed) => {
                if let Some(connection) = self.connections[slot].as_mut() {
                    connection.receive(parsed, now);
                }
            }
            Err(e) => log::warn!("Dropping loopback packet: {}", e),
        }
    }

    fn send_connectionless(&mut self, addr: SocketAddr, message: &WireMessage) {
        let Some(endpoint) = self.endpoint.as_mut() else {
            return;
        };
        let mut packet = WirePacket::new(self.my_index.unwrap_or(INVALID_CONNECTION_INDEX));
        if !packet.write_message(message) {
            log::warn!("Connectionless message {} too large", message.index());
            return;
        }
        packet.finalize_connectionless();
        if let Err(e) = endpoint.send_to(packet.as_bytes(), addr) {
            log::warn!("Send to {} failed: {}", addr, e);
        }
    }

    fn send_join_request(&mut self, now: Instant) {
        let Some(host_addr) = self.host_addr else {
            return;
        };
        self.last_join_request = Some(now);
        log::debug!("Sending join request to {}", host_addr);
        self.send_connectionless(host_addr, &core_message(CoreMessage::JoinRequest));
    }

    fn sync_time_message(&self, now: Instant) -> WireMessage {
        let mut message = core_message(CoreMessage::SyncTime);
        message.payload_mut().write_f64(self.clock.time(now));
        message
    }

    fn is_from_host(&self, context: &MessageContext) -> bool {
        context.connection == Some(HOST_CONNECTION_INDEX)
            && self.host_addr == Some(context.sender)
    }

    fn handle_core(&mut self, kind: CoreMessage, context: &MessageContext, message: &mut WireMessage) {
        match kind {
            CoreMessage::Ping => self.on_ping(context, message),
            CoreMessage::Pong => {
                let nonce = message.payload_mut().read_u32().unwrap_or(0);
                log::debug!("Pong {} from {}", nonce, context.sender);
                self.last_pong = Some((context.sender, nonce));
            }
            CoreMessage::Heartbeat => {}
            CoreMessage::JoinRequest => self.on_join_request(context),
            CoreMessage::JoinDeny => self.on_join_deny(context, message),
            CoreMessage::JoinAccept => self.on_join_accept(context, message),
            CoreMessage::JoinFinished => self.on_join_finished(context),
            CoreMessage::NewConnection => self.on_new_connection(context, message),
            CoreMessage::UpdateConnState => self.on_update_conn_state(context, message),
            CoreMessage::Hangup => {
                if let Some(index) = context.connection {
                    log::info!("Connection {} ({}) hung up", index, context.sender);
                    if let Some(connection) = self.connection_mut(index) {
                        connection.mark_for_destroy();
                    }
                }
            }
            CoreMessage::SyncTime => {
                if self.host || !self.is_from_host(context) {
                    return;
                }
                let Some(host_time) = message.payload_mut().read_f64() else {
                    return;
                };
                let rtt = self
                    .connection(HOST_CONNECTION_INDEX)
                    .map(Connection::rtt)
                    .unwrap_or_default();
                self.clock.apply_sync(host_time, rtt);
            }
            CoreMessage::ObjectCreate => {
                if !self.host && self.is_from_host(context) {
                    self.replication.apply_create(message.payload_mut());
                }
            }
            CoreMessage::ObjectDestroy => {
                if !self.host && self.is_from_host(context) {
                    self.replication.apply_destroy(message.payload_mut());
                }
            }
            CoreMessage::ObjectUpdate => {
                if !self.host && self.is_from_host(context) {
                    self.replication.apply_update(message.payload_mut());
                }
            }
        }
    }

    fn on_ping(&mut self, context: &MessageContext, message: &mut WireMessage) {
        let nonce = message.payload_mut().read_u32().unwrap_or(0);
        let mut pong = core_message(CoreMessage::Pong);
        pong.payload_mut().write_u32(nonce);
        self.send_connectionless(context.sender, &pong);
    }

    fn deny(&mut self, addr: SocketAddr, reason: JoinDenyReason) {
        log::info!("Denying join from {}: {}", addr, reason);
        let mut message = core_message(CoreMessage::JoinDeny);
        message.payload_mut().write_u8(reason as u8);
        self.send_connectionless(addr, &message);
    }

    fn on_join_request(&mut self, context: &MessageContext) {
        if !self.host {
            self.deny(context.sender, JoinDenyReason::NotHost);
            return;
        }
        if context.connection.is_some()
            || self.find_connection(context.sender, INVALID_CONNECTION_INDEX).is_some()
        {
            log::trace!("Duplicate join request from {}", context.sender);
            return;
        }
        let Some(slot) = self.connections.iter().position(Option::is_none) else {
            self.deny(context.sender, JoinDenyReason::TableFull);
            return;
        };
        let Ok(index) = u8::try_from(slot) else {
            self.deny(context.sender, JoinDenyReason::AllocationFailed);
            return;
        };

        let mut connection = Connection::new(context.sender, index, &self.config, self.frame_time);
        connection.set_state(ConnectionState::Connected);
        self.connections[slot] = Some(connection);
        log::info!("Accepted {} as connection {}", context.sender, index);

        let mut accept = core_message(CoreMessage::JoinAccept);
        accept.payload_mut().write_u8(index);
        self.send(index, accept);
        self.send(index, core_message(CoreMessage::JoinFinished));
        let sync = self.sync_time_message(self.frame_time);
        self.send(index, sync);
    }

    fn on_join_deny(&mut self, context: &MessageContext, message: &mut WireMessage) {
        let joining = matches!(self.state, SessionState::Connecting | SessionState::Joining);
        if !joining || self.host_addr != Some(context.sender) {
            return;
        }
        let reason = message
            .payload_mut()
            .read_u8()
            .and_then(JoinDenyReason::from_u8)
            .unwrap_or(JoinDenyReason::AllocationFailed);
        self.record_error(SessionError::JoinDenied(reason));
        self.teardown();
    }

    fn on_join_accept(&mut self, context: &MessageContext, message: &mut WireMessage) {
        if self.host || self.state != SessionState::Connecting || !self.is_from_host(context) {
            return;
        }
        let Some(index) = message.payload_mut().read_u8() else {
            return;
        };
        let slot = index as usize;
        if index == HOST_CONNECTION_INDEX
            || index == INVALID_CONNECTION_INDEX
            || self.connections.get(slot).is_some_and(Option::is_some)
        {
            log::warn!("Host assigned unusable connection index {}", index);
            return;
        }
        // The host's table may be larger than ours.
        if slot >= self.connections.len() {
            self.connections.resize_with(slot + 1, || None);
        }
        let Some(mut me) = self.pending_self.take() else {
            return;
        };
        me.set_index(index);
        self.connections[slot] = Some(me);
        self.my_index = Some(index);
        self.state = SessionState::Joining;
        log::info!("Join accepted as connection {}", index);
    }

    fn on_join_finished(&mut self, context: &MessageContext) {
        if self.host || self.state != SessionState::Joining || !self.is_from_host(context) {
            return;
        }
        if let Some(host) = self.connection_mut(HOST_CONNECTION_INDEX) {
            host.set_state(ConnectionState::Ready);
        }
        if let Some(index) = self.my_index {
            if let Some(me) = self.connection_mut(index) {
                me.set_state(ConnectionState::Ready);
            }
        }
        self.state = SessionState::Ready;
        self.join_started = None;
        log::info!("Join finished");

        let mut announce = core_message(CoreMessage::NewConnection);
        announce.payload_mut().write_string(&self.display_name);
        self.send(HOST_CONNECTION_INDEX, announce);
    }

    fn on_new_connection(&mut self, context: &MessageContext, message: &mut WireMessage) {
        if !self.host {
            return;
        }
        let Some(index) = context.connection else {
            return;
        };
        let name = message.payload_mut().read_string().unwrap_or_default();
        let Some(connection) = self.connection_mut(index) else {
            return;
        };
        if connection.is_ready() {
            return;
        }
        connection.set_display_id(name.clone());
        connection.set_state(ConnectionState::Ready);
        log::info!("Connection {} is ready as '{}'", index, name);

        self.send(index, core_message(CoreMessage::Heartbeat));
        let mut state = core_message(CoreMessage::UpdateConnState);
        state.payload_mut().write_u8(ConnectionState::Ready as u8);
        self.send(index, state);

        self.replication.add_connection(index, self.frame_time);
        let ids: Vec<NetObjectId> = self.replication.objects().map(|o| o.id).collect();
        for id in ids {
            if let Some(create) = self.replication.create_message(id) {
                self.send(index, create);
            }
        }

        if let Some(callback) = self.on_join.clone() {
            callback(self, index, &name);
        }
    }

    fn on_update_conn_state(&mut self, context: &MessageContext, message: &mut WireMessage) {
        if self.host || !self.is_from_host(context) {
            return;
        }
        let Some(state) = message
            .payload_mut()
            .read_u8()
            .and_then(ConnectionState::from_u8)
        else {
            return;
        };
        if let Some(index) = self.my_index {
            if let Some(me) = self.connection_mut(index) {
                me.set_state(state);
            }
        }
    }
}

fn core_message(kind: CoreMessage) -> WireMessage {
    WireMessage::with_index(kind.index(), kind.options())
}
