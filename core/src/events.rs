//! Notifications for code layered on top of the link engine

use crate::session::Session;

/// Something that happened to the link or to network state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The uplink completed its handshake
    LinkEstablished { server: String },
    /// The uplink answered our end-of-burst probe
    BurstFinished { server: String },
    /// The uplink connection was torn down
    LinkLost { reason: String },
    /// A channel topic was set or replaced
    TopicChanged { channel: String, setter: String, topic: String },
    /// A channel came into existence
    ChannelCreated { channel: String },
    /// A channel lost its last member
    ChannelDestroyed { channel: String },
    /// A network user was introduced
    UserIntroduced { uid: String, nick: String },
    /// A network user left (quit, kill or split)
    UserQuit { uid: String, reason: String },
}

/// Receives session events
///
/// Listeners run synchronously, in subscription order, from inside the
/// reactor pass that produced the event.
pub trait EventListener: Send + Sync {
    /// Called for every event
    fn on_event(&self, session: &mut Session, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&mut Session, &Event) + Send + Sync,
{
    fn on_event(&self, session: &mut Session, event: &Event) {
        self(session, event)
    }
}
