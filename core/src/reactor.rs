//! The event loop
//!
//! One pass: release connections that died in the previous pass, run
//! timers, wait (bounded by the tick) for any connection to become ready,
//! then give every connection one chance to progress, read a line and flush.

use crate::session::Session;
use crate::Result;
use std::time::Instant;

/// Drives a [`Session`]
pub struct Reactor {
    session: Session,
}

impl Reactor {
    /// Create a new reactor around a session
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// The session being driven
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The session being driven, mutably
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Give the session back
    pub fn into_session(self) -> Session {
        self.session
    }

    /// Run a single pass
    pub async fn turn(&mut self) {
        self.session.reap_dead();
        self.session.run_timers(Instant::now());

        let tick = self.session.config().timeouts.tick();
        self.session.wait_ready(tick).await;

        self.session.service_io();
    }

    /// Run passes until shutdown is requested
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            "Reactor started as {} ({})",
            self.session.config().server.name,
            self.session.config().server.sid
        );

        while !self.session.is_shutdown() {
            self.turn().await;
        }

        for id in self.session.connection_ids() {
            self.session.mark_dead(id, "Shutting down");
        }
        self.session.reap_dead();

        tracing::info!("Reactor stopped");
        Ok(())
    }
}
