//! Handshake, liveness and server tree maintenance

use super::need_params;
use crate::connection::ConnectionState;
use crate::registry::{CommandFlags, CommandRegistry};
use crate::session::{ConnId, Session, Source, TS_VERSION};
use crate::user::ServerRecord;
use crate::utils::{irc_eq, string::is_valid_sid};
use crate::{Error, Result};

/// Register link handlers
pub fn register(registry: &mut CommandRegistry) {
    registry.register("PASS", CommandFlags::PRE_REGISTRATION, handle_pass);
    registry.register("CAPAB", CommandFlags::PRE_REGISTRATION, handle_capab);
    registry.register("SERVER", CommandFlags::PRE_REGISTRATION, handle_server);
    registry.register("SVINFO", CommandFlags::NONE, handle_svinfo);
    registry.register("PING", CommandFlags::PRE_REGISTRATION, handle_ping);
    registry.register("PONG", CommandFlags::PRE_REGISTRATION, handle_pong);
    registry.register("ERROR", CommandFlags::PRE_REGISTRATION, handle_error);
    registry.register("SID", CommandFlags::NONE, handle_sid);
    registry.register("SQUIT", CommandFlags::NONE, handle_squit);
}

/// Drop the link after telling the peer why
fn fatal(session: &mut Session, id: ConnId, reason: &str) {
    session.send_to(id, &format!("ERROR :Closing Link: {}", reason));
    session.mark_dead(id, reason);
}

/// Check that a command arrived on the uplink while it is handshaking
fn handshaking_uplink(session: &Session, id: ConnId) -> bool {
    session.uplink() == Some(id)
        && session.connection(id).map(|c| c.state()) == Some(ConnectionState::Handshaking)
}

/// PASS <password> TS <version> [:<sid>]
fn handle_pass(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("PASS", params, 3)?;
    let id = source.conn;

    if !handshaking_uplink(session, id) {
        tracing::debug!("Ignoring PASS on {} outside the handshake", id);
        return Ok(());
    }

    if params[0] != session.config().uplink.accept_password {
        fatal(session, id, "Password mismatch");
        return Ok(());
    }

    if !params[1].eq_ignore_ascii_case("TS") || params[2] != TS_VERSION.to_string() {
        fatal(
            session,
            id,
            &format!("Protocol version mismatch: {} {}", params[1], params[2]),
        );
        return Ok(());
    }

    let sid = params.get(3).filter(|s| !s.is_empty()).cloned();
    if let Some(ref sid) = sid {
        if !is_valid_sid(sid) {
            fatal(session, id, &format!("Invalid SID {} in PASS", sid));
            return Ok(());
        }
    }

    if let Some(conn) = session.connection_mut(id) {
        conn.flags.got_pass = true;
        conn.remote_sid = sid;
    }
    Ok(())
}

/// CAPAB :<capabilities>
fn handle_capab(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("CAPAB", params, 1)?;

    if let Some(conn) = session.connection_mut(source.conn) {
        conn.capabilities
            .extend(params.iter().flat_map(|p| p.split_whitespace()).map(str::to_ascii_uppercase));
        tracing::debug!("Uplink capabilities: {:?}", conn.capabilities);
    }
    Ok(())
}

/// SERVER <name> <hops> :<description>
fn handle_server(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("SERVER", params, 3)?;
    let id = source.conn;

    if !handshaking_uplink(session, id) {
        tracing::debug!("Ignoring SERVER {} on {}", params[0], id);
        return Ok(());
    }

    let (got_pass, sid) = match session.connection(id) {
        Some(conn) => (conn.flags.got_pass, conn.remote_sid.clone()),
        None => return Ok(()),
    };
    if !got_pass {
        fatal(session, id, "SERVER without PASS");
        return Ok(());
    }
    // A peer that sent no SID is known by its server name
    let sid = sid.unwrap_or_else(|| params[0].clone());

    let record = ServerRecord {
        sid: sid.clone(),
        name: params[0].clone(),
        description: params[params.len() - 1].clone(),
        uplink_sid: None,
    };
    tracing::info!("Uplink is {} ({})", record.name, record.sid);
    session.network.add_server(record);
    session.establish_link(id, &sid);
    Ok(())
}

/// SVINFO <current> <min> 0 :<time>
fn handle_svinfo(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("SVINFO", params, 2)?;

    let parse = |raw: &str| {
        raw.parse::<u32>()
            .map_err(|_| Error::Protocol(format!("SVINFO: invalid version {}", raw)))
    };
    let current = parse(&params[0])?;
    let min = parse(&params[1])?;

    if current < TS_VERSION || min > TS_VERSION {
        fatal(
            session,
            source.conn,
            &format!("Incompatible TS version: current {} min {}", current, min),
        );
    }
    Ok(())
}

/// PING <origin> [<destination>]
fn handle_ping(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("PING", params, 1)?;

    let server = &session.config().server;
    let line = if session.is_linked() {
        format!(":{} PONG {} :{}", server.sid, server.name, params[0])
    } else {
        format!("PONG {} :{}", server.name, params[0])
    };
    session.send_to(source.conn, &line);
    Ok(())
}

/// PONG <origin> :<destination>
fn handle_pong(session: &mut Session, source: &Source, _params: &[String]) -> Result<()> {
    if session.uplink() == Some(source.conn) && session.finish_burst(source.conn) {
        tracing::info!("Uplink finished processing our burst");
    }
    Ok(())
}

/// ERROR :<reason>
fn handle_error(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    let reason = params.first().map(String::as_str).unwrap_or("no reason");
    session.mark_dead(source.conn, &format!("Remote error: {}", reason));
    Ok(())
}

/// :<server> SID <name> <hops> <sid> :<description>
fn handle_sid(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("SID", params, 4)?;

    let Some(parent) = source.server() else {
        return Err(Error::Protocol("SID from a non-server source".to_string()));
    };
    if !is_valid_sid(&params[2]) {
        return Err(Error::Protocol(format!("SID: invalid sid {}", params[2])));
    }

    let record = ServerRecord {
        sid: params[2].clone(),
        name: params[0].clone(),
        description: params[3].clone(),
        uplink_sid: Some(parent.to_string()),
    };
    tracing::debug!("Server {} ({}) introduced behind {}", record.name, record.sid, parent);
    session.network.add_server(record);
    Ok(())
}

/// SQUIT <server> :<reason>
fn handle_squit(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("SQUIT", params, 1)?;
    let target = &params[0];
    let reason = params.get(1).map(String::as_str).unwrap_or("");

    let ours = &session.config().server;
    if irc_eq(target, &ours.sid) || irc_eq(target, &ours.name) {
        if let Some(uplink) = session.uplink() {
            session.mark_dead(uplink, &format!("SQUIT: {}", reason));
        }
        return Ok(());
    }

    let Some(sid) = session.network.find_server(target).map(|s| s.sid.clone()) else {
        tracing::debug!("SQUIT for unknown server {} from {:?}", target, source.origin);
        return Ok(());
    };

    let removed = session.network.remove_server_tree(&sid);
    let users = session.network.users_on(&removed);
    tracing::info!(
        "Server {} split ({}): {} servers and {} users removed",
        target,
        reason,
        removed.len(),
        users.len()
    );
    for uid in users {
        session.remove_user(&uid, reason);
    }
    Ok(())
}
