//! Server-link protocol handlers
//!
//! Each submodule registers the TS6 commands it understands. Handlers take
//! the session by `&mut`, validate their parameters and discard malformed
//! input by returning a protocol error, which the dispatcher only logs.

pub mod channels;
pub mod link;
pub mod users;

use crate::registry::CommandRegistry;
use crate::session::Session;
use crate::{partyline, Error, Result};

/// Register every core server-link handler
pub fn register_core_handlers(registry: &mut CommandRegistry) {
    link::register(registry);
    users::register(registry);
    channels::register(registry);
}

/// Register core handlers and party-line commands on a session
pub fn install(session: &mut Session) {
    register_core_handlers(session.registry_mut());
    partyline::register_commands(session.partyline_registry_mut());
}

/// Fail unless at least `count` parameters are present
pub(crate) fn need_params(command: &str, params: &[String], count: usize) -> Result<()> {
    if params.len() < count {
        return Err(Error::Protocol(format!(
            "{} needs {} parameters, got {}",
            command,
            count,
            params.len()
        )));
    }
    Ok(())
}

/// Parse a timestamp parameter
pub(crate) fn parse_ts(command: &str, raw: &str) -> Result<i64> {
    raw.parse::<i64>()
        .map_err(|_| Error::Protocol(format!("{}: invalid timestamp {}", command, raw)))
}
