//! Session context
//!
//! The [`Session`] is the single owner of every piece of mutable state: the
//! connection set, the uplink, the network and channel indices and both
//! command registries. Handlers receive it by `&mut` and run to completion;
//! nothing here is shared between threads.

use crate::buffer::Frame;
use crate::channel::{Channel, ChannelModes, Channels, MemberFlags};
use crate::config::{Config, OperatorAccount};
use crate::connection::{Connection, ConnectionRole, ConnectionState};
use crate::events::{Event, EventListener};
use crate::message::Message;
use crate::registry::CommandRegistry;
use crate::transport::Transport;
use crate::user::Network;
use crate::utils::{irc_to_lower, unix_now};
use crate::{partyline, soft_assert, Error, Result};
use futures_util::future::{select_all, BoxFuture};
use futures_util::FutureExt;
use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};

pub use crate::connection::ConnId;

/// Capabilities we announce in CAPAB
pub const CAPABILITIES: &str = "QS EX IE KLN UNKLN ENCAP TB SERVICES EUID EOPMOD";

/// TS protocol version we speak
pub const TS_VERSION: u32 = 6;

/// Who sent a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A known server, by SID
    Server(String),
    /// A known network user, by UID
    User(String),
    /// A logged-in party-line operator, by account name
    Operator(String),
    /// Nothing we know; carries the raw prefix
    Unresolved(String),
}

/// Resolved command source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Connection the command arrived on
    pub conn: ConnId,
    /// Resolved sender
    pub origin: Origin,
}

impl Source {
    /// SID if the source is a server
    pub fn server(&self) -> Option<&str> {
        match self.origin {
            Origin::Server(ref sid) => Some(sid),
            _ => None,
        }
    }

    /// UID if the source is a network user
    pub fn user(&self) -> Option<&str> {
        match self.origin {
            Origin::User(ref uid) => Some(uid),
            _ => None,
        }
    }

    /// Check if the source could not be resolved
    pub fn is_unresolved(&self) -> bool {
        matches!(self.origin, Origin::Unresolved(_))
    }
}

/// The link engine's state
pub struct Session {
    config: Config,
    connections: BTreeMap<ConnId, Connection>,
    next_conn: u64,
    uplink: Option<ConnId>,
    uplink_server: Option<String>,
    pub(crate) network: Network,
    pub(crate) channels: Channels,
    registry: CommandRegistry,
    partyline: CommandRegistry,
    listeners: Vec<Arc<dyn EventListener>>,
    operators: Vec<Arc<OperatorAccount>>,
    reconnect_at: Option<Instant>,
    shutdown: bool,
    started: Instant,
}

impl Session {
    /// Create a session and place our services in their channels
    pub fn new(config: Config) -> Self {
        let operators = config.partyline.operators.iter().cloned().map(Arc::new).collect();
        let mut session = Self {
            config,
            connections: BTreeMap::new(),
            next_conn: 1,
            uplink: None,
            uplink_server: None,
            network: Network::new(),
            channels: Channels::new(),
            registry: CommandRegistry::new(),
            partyline: CommandRegistry::new(),
            listeners: Vec::new(),
            operators,
            reconnect_at: None,
            shutdown: false,
            started: Instant::now(),
        };

        let now = unix_now();
        let sid = session.config.server.sid.clone();
        for service in session.config.services.clone() {
            let uid = session.network.add_service(&sid, &service, now);
            for channel in &service.channels {
                session.join_service(channel, &uid, now);
            }
        }

        session
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Network view: servers, users and our services
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Channel index
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Server-link command registry
    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Server-link command registry, for registering handlers and hooks
    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    /// Party-line command registry
    pub fn partyline_registry(&self) -> &CommandRegistry {
        &self.partyline
    }

    /// Party-line command registry, for registering commands
    pub fn partyline_registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.partyline
    }

    /// Party-line operator account by login name
    pub fn operator(&self, name: &str) -> Option<Arc<OperatorAccount>> {
        self.operators.iter().find(|o| o.name == name).cloned()
    }

    /// Subscribe to session events
    pub fn subscribe<L: EventListener + 'static>(&mut self, listener: L) {
        self.listeners.push(Arc::new(listener));
    }

    /// Deliver an event to every listener, in subscription order
    pub fn emit(&mut self, event: Event) {
        tracing::debug!("Event: {:?}", event);
        let listeners = self.listeners.clone();
        for listener in listeners {
            listener.on_event(self, &event);
        }
    }

    /// Current wall-clock timestamp
    pub fn now_ts(&self) -> i64 {
        unix_now()
    }

    /// Time since the session was created
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Ask the reactor to stop after the current pass
    pub fn request_shutdown(&mut self) {
        self.shutdown = true;
    }

    /// Check if shutdown was requested
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    // Connections

    fn next_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        id
    }

    /// Look up a connection
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Look up a connection for modification
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    /// Ids of every connection, in creation order
    pub fn connection_ids(&self) -> Vec<ConnId> {
        self.connections.keys().copied().collect()
    }

    /// Number of connections, dead ones included until reaped
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The uplink connection, if any
    pub fn uplink(&self) -> Option<ConnId> {
        self.uplink
    }

    /// SID of the uplink once its handshake completed
    pub fn uplink_server(&self) -> Option<&str> {
        self.uplink_server.as_deref()
    }

    /// Check if the uplink handshake completed
    pub fn is_linked(&self) -> bool {
        self.uplink_server.is_some()
    }

    /// When the next reconnect attempt is due
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Start connecting to the configured uplink
    pub fn connect_uplink(&mut self) -> ConnId {
        if let Some(id) = self.uplink {
            return id;
        }

        let addr = format!("{}:{}", self.config.uplink.host, self.config.uplink.port);
        tracing::info!("Connecting to uplink {}", addr);

        let target = addr.clone();
        let connect: BoxFuture<'static, io::Result<TcpStream>> =
            Box::pin(async move { TcpStream::connect(target).await });

        let id = self.next_id();
        let conn = Connection::connecting(id, ConnectionRole::Uplink, addr, connect, self.config.limits.recv_buffer);
        self.connections.insert(id, conn);
        self.uplink = Some(id);
        id
    }

    /// Open a party-line connection to `addr`
    pub fn connect_dcc(&mut self, addr: SocketAddr) -> ConnId {
        tracing::info!("Opening party-line connection to {}", addr);

        let connect: BoxFuture<'static, io::Result<TcpStream>> =
            Box::pin(async move { TcpStream::connect(addr).await });

        let id = self.next_id();
        let conn = Connection::connecting(
            id,
            ConnectionRole::DccOut,
            addr.to_string(),
            connect,
            self.config.limits.recv_buffer,
        );
        self.connections.insert(id, conn);
        id
    }

    /// Listen for a single inbound party-line connection
    pub async fn open_dcc_listener(&mut self, addr: SocketAddr) -> Result<(ConnId, SocketAddr)> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("Waiting for party-line connection on {}", local);

        let id = self.next_id();
        let conn = Connection::listening(id, listener, self.config.limits.recv_buffer);
        self.connections.insert(id, conn);
        Ok((id, local))
    }

    /// Adopt an already open transport
    ///
    /// The connection starts exactly as if a connect had just completed:
    /// an uplink sends its handshake, a party-line peer gets the banner.
    pub fn attach(&mut self, role: ConnectionRole, transport: Box<dyn Transport>) -> ConnId {
        let id = self.next_id();
        let conn = Connection::open(id, role, transport, self.config.limits.recv_buffer);
        tracing::info!("Attached {:?} connection {} ({})", role, id, conn.peer());
        self.connections.insert(id, conn);

        if role == ConnectionRole::Uplink {
            if let Some(old) = self.uplink {
                let reason = "Replaced by a new uplink connection";
                self.mark_dead(old, reason);
                if self.is_linked() {
                    self.forget_link(reason);
                }
            }
            self.uplink = Some(id);
        }

        self.transport_ready(id);
        id
    }

    fn transport_ready(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        tracing::info!("Connection {} to {} is open", id, conn.peer());

        let role = conn.role;
        match role {
            ConnectionRole::Uplink => {
                conn.set_state(ConnectionState::Handshaking);
                self.send_handshake(id);
            }
            ConnectionRole::DccIn | ConnectionRole::DccOut => {
                conn.set_state(ConnectionState::Established);
                partyline::send_banner(self, id);
            }
        }
    }

    fn send_handshake(&mut self, id: ConnId) {
        let server = self.config.server.clone();
        let password = self.config.uplink.send_password.clone();

        self.send_to(id, &format!("PASS {} TS {} :{}", password, TS_VERSION, server.sid));
        self.send_to(id, &format!("CAPAB :{}", CAPABILITIES));
        self.send_to(id, &format!("SERVER {} 1 :{}", server.name, server.description));
        self.send_to(id, &format!("SVINFO {} {} 0 :{}", TS_VERSION, TS_VERSION, unix_now()));
    }

    /// Send one line to a connection; CRLF is appended
    pub fn send_to(&mut self, id: ConnId, line: &str) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_dead() {
            return;
        }

        tracing::trace!("{} <- {}", id, line);
        let mut bytes = Vec::with_capacity(line.len() + 2);
        bytes.extend_from_slice(line.as_bytes());
        bytes.extend_from_slice(b"\r\n");

        if let Err(e) = conn.send(&bytes) {
            self.mark_dead(id, &format!("Write error: {}", e));
        }
    }

    /// Send a message to a connection
    pub fn send_message(&mut self, id: ConnId, message: &Message) {
        self.send_to(id, &message.to_string());
    }

    /// Send a line to the uplink, if there is one
    pub fn send_uplink(&mut self, line: &str) {
        if let Some(id) = self.uplink {
            self.send_to(id, line);
        }
    }

    /// Tell every logged-in party-line operator something
    pub fn notice_opers(&mut self, text: &str) {
        tracing::info!("Notice: {}", text);

        let targets: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| c.role.is_partyline() && c.is_established() && c.identity().is_some())
            .map(|c| c.id)
            .collect();

        for id in targets {
            self.send_to(id, &format!("*** {}", text));
        }
    }

    /// Mark a connection dead; teardown happens on the next reactor pass
    pub fn mark_dead(&mut self, id: ConnId, reason: &str) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if !conn.mark_dead(reason) {
            return;
        }

        let peer = conn.peer().to_string();
        tracing::warn!("Connection {} ({}) closing: {}", id, peer, reason);

        if Some(id) == self.uplink {
            self.notice_opers(&format!("Lost link with {}: {}", peer, reason));
        } else {
            self.notice_opers(&format!("Party-line connection {} closed: {}", peer, reason));
        }
    }

    /// Release every connection marked dead during an earlier pass
    pub fn reap_dead(&mut self) {
        let dead: Vec<ConnId> = self
            .connections
            .values()
            .filter(|c| c.is_dead())
            .map(|c| c.id)
            .collect();

        for id in dead {
            let Some(mut conn) = self.connections.remove(&id) else {
                continue;
            };
            let reason = conn.dead_reason().unwrap_or("Connection closed").to_string();
            conn.close();
            tracing::debug!("Released connection {}", id);

            if Some(id) == self.uplink {
                self.link_lost(&reason);
            }
        }
    }

    fn link_lost(&mut self, reason: &str) {
        self.uplink = None;
        self.forget_link(reason);

        let delay = Duration::from_secs(self.config.uplink.reconnect_delay);
        self.reconnect_at = Some(Instant::now() + delay);
        tracing::info!("Reconnecting to uplink in {} seconds", delay.as_secs());
    }

    /// Drop everything learned over the current uplink
    fn forget_link(&mut self, reason: &str) {
        if let Some(sid) = self.uplink_server.take() {
            let removed = self.network.remove_server_tree(&sid);
            let users = self.network.users_on(&removed);
            tracing::info!(
                "Uplink lost: removing {} servers and {} users",
                removed.len(),
                users.len()
            );
            for uid in users {
                self.remove_user(&uid, reason);
            }
        }

        self.emit(Event::LinkLost { reason: reason.to_string() });
    }

    /// Expire connections, send probes and start reconnects
    pub fn run_timers(&mut self, now: Instant) {
        if let Some(at) = self.reconnect_at {
            if now >= at && self.uplink.is_none() {
                self.reconnect_at = None;
                self.connect_uplink();
            }
        }

        let timeouts = &self.config.timeouts;
        let ping_interval = timeouts.ping_interval();
        let max_sendq = self.config.limits.partyline_max_sendq;

        let mut expired = Vec::new();
        let mut probes = Vec::new();

        for conn in self.connections.values().filter(|c| !c.is_dead()) {
            let age = conn.age(now);
            match conn.state() {
                ConnectionState::Connecting if age > timeouts.connect_timeout() => {
                    expired.push((conn.id, "Connect timeout".to_string()));
                }
                ConnectionState::Handshaking if age > timeouts.handshake_timeout() => {
                    expired.push((conn.id, "Handshake timeout".to_string()));
                }
                ConnectionState::Established if conn.role == ConnectionRole::Uplink => {
                    let idle = conn.idle(now);
                    if conn.flags.sent_ping {
                        if idle >= ping_interval * 2 {
                            expired.push((conn.id, format!("Ping timeout: {} seconds", idle.as_secs())));
                        }
                    } else if idle >= ping_interval {
                        probes.push(conn.id);
                    }
                }
                _ => {}
            }

            if conn.role.is_partyline() && conn.queue_length() > max_sendq {
                expired.push((conn.id, format!("Send queue exceeded ({} bytes)", conn.queue_length())));
            }
        }

        for id in probes {
            let line = format!("PING :{}", self.config.server.name);
            self.send_to(id, &line);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.flags.sent_ping = true;
            }
        }

        for (id, reason) in expired {
            self.mark_dead(id, &reason);
        }
    }

    /// Wait until any live connection is ready or `tick` elapses
    pub async fn wait_ready(&mut self, tick: Duration) {
        let mut waits: Vec<BoxFuture<'_, ()>> = self
            .connections
            .values_mut()
            .filter(|c| !c.is_dead())
            .map(|c| c.ready().boxed())
            .collect();
        waits.push(Box::pin(tokio::time::sleep(tick)));

        let _ = select_all(waits).await;
    }

    /// Progress, read and flush every live connection once
    pub fn service_io(&mut self) {
        for id in self.connection_ids() {
            self.service_connection(id);
        }
    }

    fn service_connection(&mut self, id: ConnId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_dead() {
            return;
        }

        match conn.progress() {
            Some(Ok(())) => self.transport_ready(id),
            Some(Err(e)) => {
                self.mark_dead(id, &format!("Connect failed: {}", e));
                return;
            }
            None => {}
        }

        let frame = match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_dead() => conn.read_frame(),
            _ => return,
        };

        match frame {
            Ok(Frame::Line(bytes)) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.last_activity = Instant::now();
                    if std::mem::take(&mut conn.flags.unterminated) {
                        tracing::debug!("{} resynchronised after an oversized line", id);
                    }
                }
                let line = String::from_utf8_lossy(&bytes).into_owned();
                self.handle_line(id, &line);
            }
            Ok(Frame::Unterminated(bytes)) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.last_activity = Instant::now();
                    conn.flags.unterminated = true;
                }
                tracing::warn!("Discarding oversized line ({} bytes) from {}", bytes.len(), id);
            }
            Ok(Frame::Pending) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.mark_dead(id, "Connection closed by peer");
            }
            Err(e) => self.mark_dead(id, &format!("Read error: {}", e)),
        }

        let flushed = match self.connections.get_mut(&id) {
            Some(conn) if !conn.is_dead() => conn.flush(),
            _ => return,
        };
        if let Err(e) = flushed {
            self.mark_dead(id, &format!("Write error: {}", e));
        }
    }

    /// Handle one received line
    pub fn handle_line(&mut self, id: ConnId, line: &str) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        tracing::trace!("{} -> {}", id, line);

        if conn.role.is_partyline() {
            partyline::handle_line(self, id, line);
            return;
        }

        if line.trim().is_empty() {
            return;
        }

        match Message::parse_with_limit(line, self.config.limits.max_params) {
            Ok(message) => self.dispatch(id, &message),
            Err(e) => tracing::debug!("Discarding malformed line from {}: {}", id, e),
        }
    }

    /// Resolve the source of a message and run its handler and hooks
    pub fn dispatch(&mut self, id: ConnId, message: &Message) {
        let source = Source {
            conn: id,
            origin: self.resolve_origin(message.source.as_deref()),
        };

        let Some(dispatch) = self.registry.lookup(&message.command) else {
            tracing::debug!("No handler for {} from {}", message.command, id);
            return;
        };

        if source.is_unresolved() && !self.is_linked() && !dispatch.flags.pre_registration {
            tracing::debug!(
                "Dropping {} from unresolved source {:?} before link is established",
                message.command,
                source.origin
            );
            return;
        }

        match dispatch.run(self, &source, &message.params) {
            Ok(()) => {}
            Err(e @ (Error::Protocol(_) | Error::Channel(_) | Error::MessageParse(_))) => {
                tracing::debug!("Discarding {} from {}: {}", dispatch.name, id, e);
            }
            Err(e) => tracing::warn!("{} from {} failed: {}", dispatch.name, id, e),
        }
    }

    fn resolve_origin(&self, prefix: Option<&str>) -> Origin {
        let Some(prefix) = prefix else {
            return match self.uplink_server {
                Some(ref sid) => Origin::Server(sid.clone()),
                None => Origin::Unresolved(String::new()),
            };
        };

        if let Some(user) = self.network.find_user(prefix) {
            return Origin::User(user.uid.clone());
        }
        if let Some(server) = self.network.find_server(prefix) {
            return Origin::Server(server.sid.clone());
        }
        Origin::Unresolved(prefix.to_string())
    }

    /// Display name of a source: nick, server name, account or raw prefix
    pub fn source_name(&self, source: &Source) -> String {
        let name = match source.origin {
            Origin::User(ref uid) => self.network.user(uid).map(|u| u.nick.clone()),
            Origin::Server(ref sid) => self.network.find_server(sid).map(|s| s.name.clone()),
            Origin::Operator(ref name) | Origin::Unresolved(ref name) => Some(name.clone()),
        };
        name.unwrap_or_default()
    }

    // Link establishment

    /// Record the uplink identity after a valid SERVER
    pub(crate) fn establish_link(&mut self, id: ConnId, sid: &str) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.set_state(ConnectionState::Established);
            conn.last_activity = Instant::now();
        }
        self.uplink_server = Some(sid.to_string());

        let name = self.network.find_server(sid).map(|s| s.name.clone()).unwrap_or_default();
        self.notice_opers(&format!("Link with {} established", name));
        self.emit(Event::LinkEstablished { server: name });
        self.send_burst(id);
    }

    fn send_burst(&mut self, id: ConnId) {
        let sid = self.config.server.sid.clone();

        let services: Vec<String> = self.network.services().iter().map(|s| s.uid.clone()).collect();
        for uid in &services {
            if let Some(line) = self.service_intro(uid) {
                self.send_to(id, &line);
            }
        }

        let mut channels: Vec<&Channel> = self.channels.iter().filter(|c| !c.services.is_empty()).collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        let lines: Vec<String> = channels.iter().map(|c| sjoin_line(&sid, c)).collect();
        for line in lines {
            self.send_to(id, &line);
        }

        let name = self.config.server.name.clone();
        self.send_to(id, &format!("PING :{}", name));
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.flags.sent_burst = true;
        }
        tracing::info!("Sent burst: {} services", services.len());
    }

    fn service_intro(&self, uid: &str) -> Option<String> {
        let service = self.network.service(uid)?;
        Some(format!(
            ":{} UID {} 1 {} +ioS {} {} 0 {} :{}",
            self.config.server.sid, service.nick, service.ts, service.user, service.host, service.uid, service.gecos
        ))
    }

    /// Re-introduce a service after it was killed, then rejoin its channels
    pub fn reintroduce_service(&mut self, uid: &str) {
        let Some(line) = self.service_intro(uid) else {
            return;
        };
        self.send_uplink(&line);

        let mut channels: Vec<String> = self
            .channels
            .iter()
            .filter(|c| c.services.contains(uid))
            .map(|c| c.name.clone())
            .collect();
        channels.sort();
        for channel in channels {
            self.rejoin_service(&channel, uid);
        }
    }

    /// Mark the end of burst; true only the first time
    pub(crate) fn finish_burst(&mut self, id: ConnId) -> bool {
        let Some(conn) = self.connections.get_mut(&id) else {
            return false;
        };
        conn.flags.sent_ping = false;
        if !conn.flags.sent_burst || conn.flags.end_of_burst {
            return false;
        }
        conn.flags.end_of_burst = true;

        let name = self
            .uplink_server
            .as_deref()
            .and_then(|sid| self.network.find_server(sid))
            .map(|s| s.name.clone())
            .unwrap_or_default();
        self.notice_opers(&format!("Finished bursting with {}", name));
        self.emit(Event::BurstFinished { server: name });
        true
    }

    // Channel membership

    /// Create a channel if it does not exist; true if it was created
    pub(crate) fn ensure_channel(&mut self, name: &str, ts: i64, modes: &ChannelModes) -> bool {
        if self.channels.contains(name) {
            return false;
        }
        self.channels.insert(Channel::new(name, ts, modes.clone()));
        self.emit(Event::ChannelCreated { channel: name.to_string() });
        true
    }

    /// Add a network user to a channel; existing members keep their flags
    pub(crate) fn add_member(&mut self, channel: &str, uid: &str, flags: MemberFlags) -> bool {
        let Some(user) = self.network.user_mut(uid) else {
            return false;
        };
        let Some(chan) = self.channels.get_mut(channel) else {
            return false;
        };

        if chan.members.contains_key(uid) {
            return false;
        }
        chan.members.insert(uid.to_string(), flags);
        user.channels.insert(irc_to_lower(channel));
        true
    }

    /// Remove a network user from a channel, tearing it down if left empty
    pub(crate) fn remove_member(&mut self, channel: &str, uid: &str) -> bool {
        let removed = self
            .channels
            .get_mut(channel)
            .map(|c| c.members.remove(uid).is_some())
            .unwrap_or(false);

        if let Some(user) = self.network.user_mut(uid) {
            user.channels.remove(&irc_to_lower(channel));
        }

        self.destroy_if_empty(channel);
        removed
    }

    /// Tear a channel down if it has neither users nor services
    pub(crate) fn destroy_if_empty(&mut self, channel: &str) {
        let empty = self.channels.get(channel).map(Channel::is_empty).unwrap_or(false);
        if empty {
            if let Some(chan) = self.channels.remove(channel) {
                tracing::debug!("Channel {} destroyed", chan.name);
                self.emit(Event::ChannelDestroyed { channel: chan.name });
            }
        }
    }

    /// Remove a network user and all of its memberships
    pub(crate) fn remove_user(&mut self, uid: &str, reason: &str) {
        let Some(user) = self.network.remove_user(uid) else {
            return;
        };

        for folded in &user.channels {
            let present = self
                .channels
                .get_mut(folded)
                .map(|c| c.members.remove(uid).is_some())
                .unwrap_or(false);
            soft_assert!(self, present, "{} listed {} but was not a member", user.nick, folded);
            self.destroy_if_empty(folded);
        }

        self.emit(Event::UserQuit {
            uid: uid.to_string(),
            reason: reason.to_string(),
        });
    }

    fn join_service(&mut self, channel: &str, uid: &str, ts: i64) {
        self.ensure_channel(channel, ts, &ChannelModes::default());
        if let Some(chan) = self.channels.get_mut(channel) {
            chan.services.insert(uid.to_string());
        }
    }

    /// Put a service back in a channel with ops, telling the uplink
    pub fn rejoin_service(&mut self, channel: &str, uid: &str) {
        if !self.network.is_service(uid) {
            return;
        }
        let now = unix_now();
        self.join_service(channel, uid, now);

        let Some(chan) = self.channels.get(channel) else {
            return;
        };
        let line = format!(
            ":{} SJOIN {} {} + :@{}",
            self.config.server.sid, chan.ts, chan.name, uid
        );
        if self.is_linked() {
            self.send_uplink(&line);
        }
    }
}

/// SJOIN announcing every service in a channel, all opped
fn sjoin_line(sid: &str, channel: &Channel) -> String {
    let members: Vec<String> = channel.services.iter().map(|uid| format!("@{}", uid)).collect();
    let mut params = channel.modes.to_params();
    params.push(members.join(" "));
    format!(":{} SJOIN {} {} {}", sid, channel.ts, channel.name, join_params(&params))
}

/// Join parameters, prefixing the last with `:`
fn join_params(params: &[String]) -> String {
    let mut out = String::new();
    let last = params.len().saturating_sub(1);
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        if i == last {
            out.push(':');
        }
        out.push_str(param);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::transport::MemoryTransport;

    fn config() -> Config {
        let mut config = Config::default();
        config.services.push(ServiceConfig {
            nick: "ChanServ".to_string(),
            user: "cs".to_string(),
            host: "services.example.org".to_string(),
            gecos: "Channel Services".to_string(),
            channels: vec!["#services".to_string()],
        });
        config
    }

    #[test]
    fn test_services_sit_in_their_channels() {
        let session = Session::new(config());
        let chan = session.channels().get("#Services").unwrap();
        assert_eq!(chan.services.len(), 1);
        assert!(chan.members.is_empty());
    }

    #[test]
    fn test_attach_uplink_sends_handshake() {
        let mut session = Session::new(config());
        let t = MemoryTransport::new("hub");
        let id = session.attach(ConnectionRole::Uplink, Box::new(t.clone()));

        let lines = t.take_lines();
        assert_eq!(lines[0], "PASS linkpass TS 6 :0SV");
        assert!(lines[1].starts_with("CAPAB :QS EX IE"));
        assert_eq!(lines[2], "SERVER services.example.org 1 :IRC Services");
        assert!(lines[3].starts_with("SVINFO 6 6 0 :"));
        assert_eq!(session.connection(id).unwrap().state(), ConnectionState::Handshaking);
        assert_eq!(session.uplink(), Some(id));
    }

    #[test]
    fn test_dead_connection_is_reaped_on_next_pass() {
        let mut session = Session::new(config());
        let t = MemoryTransport::new("peer");
        let id = session.attach(ConnectionRole::DccOut, Box::new(t));

        session.mark_dead(id, "testing");
        session.mark_dead(id, "again");
        assert!(session.connection(id).unwrap().is_dead());

        session.reap_dead();
        assert!(session.connection(id).is_none());
        session.reap_dead();
    }

    #[test]
    fn test_sjoin_line_format() {
        let mut channel = Channel::new("#help", 1000, ChannelModes::parse("+nt", &[]).unwrap());
        channel.services.insert("0SVAAAAAA".to_string());
        channel.services.insert("0SVAAAAAB".to_string());
        assert_eq!(
            sjoin_line("0SV", &channel),
            ":0SV SJOIN 1000 #help +nt :@0SVAAAAAA @0SVAAAAAB"
        );
    }
}
