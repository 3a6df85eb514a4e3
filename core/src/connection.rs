//! Connection state and per-connection I/O
//!
//! A [`Connection`] owns its socket, line framer and send queue. It never
//! decides policy on its own: the session moves it between states and the
//! reactor polls it for readiness.

use crate::buffer::{DrainStatus, Frame, LineFramer, SendQueue};
use crate::config::OperatorAccount;
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::BTreeSet;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};

/// Connection identifier, unique for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a connection is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// The upstream server link
    Uplink,
    /// Party-line, waiting for the peer to connect to us
    DccIn,
    /// Party-line, connecting out to the peer
    DccOut,
}

impl ConnectionRole {
    /// Check if this is a party-line connection
    pub fn is_partyline(&self) -> bool {
        !matches!(self, ConnectionRole::Uplink)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound connect or inbound accept pending
    Connecting,
    /// Credentials sent, waiting for the peer's (uplink only)
    Handshaking,
    /// Normal traffic
    Established,
    /// Terminal; resources are released on the next reactor pass
    Dead,
}

/// Per-connection boolean state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionFlags {
    /// A liveness probe is outstanding
    pub sent_ping: bool,
    /// The peer answered our end-of-burst probe
    pub end_of_burst: bool,
    /// Our burst has been sent
    pub sent_burst: bool,
    /// A valid PASS was received
    pub got_pass: bool,
    /// The last delivery was an unterminated, oversized line
    pub unterminated: bool,
    /// Party-line peer has chat enabled
    pub chat: bool,
}

enum Link {
    Connecting(BoxFuture<'static, io::Result<TcpStream>>),
    Listening(TcpListener),
    Open(Box<dyn Transport>),
    Closed,
}

enum Completion {
    Connected(io::Result<TcpStream>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
}

/// One network endpoint
pub struct Connection {
    /// Connection id
    pub id: ConnId,
    /// Connection role
    pub role: ConnectionRole,
    /// Boolean state
    pub flags: ConnectionFlags,
    /// Capabilities announced by the peer
    pub capabilities: BTreeSet<String>,
    /// SID announced in the peer's PASS
    pub remote_sid: Option<String>,
    /// When the connection was created
    pub created: Instant,
    /// Last time a line was received
    pub last_activity: Instant,
    /// Wall-clock creation time, for display
    pub connected_at: DateTime<Utc>,
    state: ConnectionState,
    link: Link,
    completion: Option<Completion>,
    framer: LineFramer,
    sendq: SendQueue,
    identity: Option<Arc<OperatorAccount>>,
    dead_reason: Option<String>,
    peer: String,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("flags", &self.flags)
            .field("queued", &self.sendq.queue_length())
            .finish()
    }
}

impl Connection {
    fn with_link(id: ConnId, role: ConnectionRole, peer: String, link: Link, recv_buffer: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            role,
            flags: ConnectionFlags::default(),
            capabilities: BTreeSet::new(),
            remote_sid: None,
            created: now,
            last_activity: now,
            connected_at: Utc::now(),
            state: ConnectionState::Connecting,
            link,
            completion: None,
            framer: LineFramer::new(recv_buffer),
            sendq: SendQueue::new(),
            identity: None,
            dead_reason: None,
            peer,
        }
    }

    /// Create a connection waiting on an outbound connect
    pub fn connecting(
        id: ConnId,
        role: ConnectionRole,
        peer: String,
        connect: BoxFuture<'static, io::Result<TcpStream>>,
        recv_buffer: usize,
    ) -> Self {
        Self::with_link(id, role, peer, Link::Connecting(connect), recv_buffer)
    }

    /// Create a party-line connection waiting for one inbound accept
    pub fn listening(id: ConnId, listener: TcpListener, recv_buffer: usize) -> Self {
        let peer = listener
            .local_addr()
            .map(|a| format!("listening on {}", a))
            .unwrap_or_else(|_| "listening".to_string());
        Self::with_link(id, ConnectionRole::DccIn, peer, Link::Listening(listener), recv_buffer)
    }

    /// Create a connection over an already open transport
    pub fn open(id: ConnId, role: ConnectionRole, transport: Box<dyn Transport>, recv_buffer: usize) -> Self {
        let peer = transport.peer();
        Self::with_link(id, role, peer, Link::Open(transport), recv_buffer)
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to a new live state; dead connections stay dead
    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != ConnectionState::Dead {
            self.state = state;
        }
    }

    /// Check if the connection is dead
    pub fn is_dead(&self) -> bool {
        self.state == ConnectionState::Dead
    }

    /// Check if the connection is established
    pub fn is_established(&self) -> bool {
        self.state == ConnectionState::Established
    }

    /// Peer description
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Why the connection died, once dead
    pub fn dead_reason(&self) -> Option<&str> {
        self.dead_reason.as_deref()
    }

    /// Mark the connection dead; returns false if it already was
    pub fn mark_dead(&mut self, reason: &str) -> bool {
        if self.is_dead() {
            return false;
        }
        self.state = ConnectionState::Dead;
        self.dead_reason = Some(reason.to_string());
        true
    }

    /// Release the socket, queued output and identity
    ///
    /// Safe to call more than once; returns true only the first time.
    pub fn close(&mut self) -> bool {
        if matches!(self.link, Link::Closed) {
            return false;
        }
        self.state = ConnectionState::Dead;
        self.link = Link::Closed;
        self.completion = None;
        self.sendq.clear();
        self.identity = None;
        true
    }

    /// Logged-in operator, if any
    pub fn identity(&self) -> Option<&Arc<OperatorAccount>> {
        self.identity.as_ref()
    }

    /// Attach an operator identity
    pub fn set_identity(&mut self, account: Arc<OperatorAccount>) {
        self.identity = Some(account);
    }

    /// Unwritten output bytes
    pub fn queue_length(&self) -> usize {
        self.sendq.queue_length()
    }

    /// Time since the last received line
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Time since the connection was created
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    /// Submit output; written directly when possible
    pub fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.is_dead() {
            return Ok(());
        }
        match &mut self.link {
            Link::Open(transport) => self.sendq.enqueue(Some(transport.as_mut()), bytes),
            _ => self.sendq.enqueue::<dyn Transport>(None, bytes),
        }
    }

    /// Write as much queued output as the transport accepts
    pub fn flush(&mut self) -> io::Result<DrainStatus> {
        match &mut self.link {
            Link::Open(transport) if !self.sendq.is_empty() => self.sendq.drain(transport.as_mut()),
            _ => Ok(DrainStatus::Drained),
        }
    }

    /// Try to frame one line
    pub fn read_frame(&mut self) -> io::Result<Frame> {
        match &mut self.link {
            Link::Open(transport) => self.framer.read_line(transport.as_mut()),
            _ => Ok(Frame::Pending),
        }
    }

    /// Complete a pending connect or accept
    ///
    /// Returns `None` while nothing has happened, `Some(Ok(()))` once the
    /// connection has a usable transport.
    pub fn progress(&mut self) -> Option<io::Result<()>> {
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => match &mut self.link {
                Link::Connecting(connect) => Completion::Connected(connect.now_or_never()?),
                Link::Listening(listener) => Completion::Accepted(listener.accept().now_or_never()?),
                _ => return None,
            },
        };

        match completion {
            Completion::Connected(Ok(stream)) => {
                self.peer = Transport::peer(&stream);
                self.link = Link::Open(Box::new(stream));
                Some(Ok(()))
            }
            Completion::Accepted(Ok((stream, addr))) => {
                self.peer = addr.to_string();
                self.link = Link::Open(Box::new(stream));
                Some(Ok(()))
            }
            Completion::Connected(Err(e)) | Completion::Accepted(Err(e)) => Some(Err(e)),
        }
    }

    /// Wait until the connection has something to do
    ///
    /// A finished connect or accept is stored, so dropping this future after
    /// it resolved loses nothing.
    pub async fn ready(&mut self) {
        if self.completion.is_some() {
            return;
        }

        let want_write = !self.sendq.is_empty();
        match &mut self.link {
            Link::Connecting(connect) => {
                let result = connect.await;
                self.completion = Some(Completion::Connected(result));
            }
            Link::Listening(listener) => {
                let result = listener.accept().await;
                self.completion = Some(Completion::Accepted(result));
            }
            Link::Open(transport) => transport.readiness(want_write).await,
            Link::Closed => futures_util::future::pending::<()>().await,
        }
    }
}
