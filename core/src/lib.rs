//! Services link engine core
//!
//! This crate maintains a single TS6 server link to an upstream IRC server,
//! multiplexes it with party-line (DCC chat) connections on a readiness
//! driven reactor, and keeps channel state consistent with the network using
//! TS based conflict resolution. Service behaviour is layered on top through
//! command handlers, hooks and event listeners.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod message;
pub mod partyline;
pub mod protocol;
pub mod reactor;
pub mod registry;
pub mod session;
pub mod transport;
pub mod user;
pub mod utils;

pub use buffer::{DrainStatus, Frame, LineFramer, SendQueue};
pub use channel::{BurstKind, Channel, ChannelModes, Channels, MemberFlags, ModeChange, TsOutcome};
pub use config::{Config, OperatorAccount, ServiceConfig};
pub use connection::{ConnId, Connection, ConnectionFlags, ConnectionRole, ConnectionState};
pub use error::{Error, Result};
pub use events::{Event, EventListener};
pub use message::Message;
pub use reactor::Reactor;
pub use registry::{CommandFlags, CommandHandler, CommandRegistry, HookId};
pub use session::{Origin, Session, Source};
pub use transport::{MemoryTransport, Transport};
pub use user::{Network, ServerRecord, ServiceDefinition, User};

/// Re-exports for convenience
pub use tracing::{debug, error, info, warn};
