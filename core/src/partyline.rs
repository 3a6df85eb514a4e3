//! Party-line: operator chat over DCC connections
//!
//! Lines starting with `.` are commands, looked up in the session's
//! party-line registry. Anything else is chat, relayed to every other
//! logged-in peer that has chat enabled.

use crate::registry::{CommandFlags, CommandRegistry};
use crate::session::{ConnId, Origin, Session, Source};
use crate::{Error, Result};

/// Greeting sent when a party-line connection opens
pub const BANNER: &str = "rustsvcs party-line. Log in with .login <name> <password>";

/// Register the built-in party-line commands
pub fn register_commands(registry: &mut CommandRegistry) {
    registry.register("LOGIN", CommandFlags::PRE_REGISTRATION, cmd_login);
    registry.register("HELP", CommandFlags::PRE_REGISTRATION, cmd_help);
    registry.register("QUIT", CommandFlags::PRE_REGISTRATION, cmd_quit);
    registry.register("CHAT", CommandFlags::NONE, cmd_chat);
    registry.register("WHO", CommandFlags::NONE, cmd_who);
    registry.register("STATUS", CommandFlags::NONE, cmd_status);
}

/// Send the greeting
pub fn send_banner(session: &mut Session, id: ConnId) {
    reply(session, id, BANNER);
}

fn reply(session: &mut Session, id: ConnId, text: &str) {
    session.send_to(id, &format!("*** {}", text));
}

fn account_name(session: &Session, id: ConnId) -> Option<String> {
    session
        .connection(id)
        .and_then(|c| c.identity())
        .map(|account| account.name.clone())
}

/// Handle one line from a party-line peer
pub fn handle_line(session: &mut Session, id: ConnId, line: &str) {
    let line = line.trim_end();
    if line.is_empty() {
        return;
    }

    let name = account_name(session, id);

    let Some(command) = line.strip_prefix('.') else {
        chat(session, id, name, line);
        return;
    };

    let mut words = command.split_whitespace();
    let Some(word) = words.next() else {
        return;
    };
    let params: Vec<String> = words.map(str::to_string).collect();

    let Some(dispatch) = session.partyline_registry().lookup(word) else {
        reply(session, id, &format!("Unknown command .{}, try .help", word));
        return;
    };

    let source = Source {
        conn: id,
        origin: match name {
            Some(name) => Origin::Operator(name),
            None => Origin::Unresolved(session.connection(id).map(|c| c.peer().to_string()).unwrap_or_default()),
        },
    };

    if source.is_unresolved() && !dispatch.flags.pre_registration {
        reply(session, id, "You must .login first");
        return;
    }

    if let Err(e) = dispatch.run(session, &source, &params) {
        tracing::debug!(".{} from {} failed: {}", dispatch.name, id, e);
        reply(session, id, &e.to_string());
    }
}

fn chat(session: &mut Session, id: ConnId, name: Option<String>, text: &str) {
    let Some(name) = name else {
        reply(session, id, "You must .login first");
        return;
    };

    let chatting = session.connection(id).map(|c| c.flags.chat).unwrap_or(false);
    if !chatting {
        reply(session, id, "Chat is off, use .chat to join");
        return;
    }

    broadcast(session, Some(id), &format!("<{}> {}", name, text));
}

/// Send a line to every logged-in, chat-enabled peer except `except`
pub fn broadcast(session: &mut Session, except: Option<ConnId>, line: &str) {
    let targets: Vec<ConnId> = session
        .connection_ids()
        .into_iter()
        .filter(|&other| Some(other) != except)
        .filter(|&other| {
            session.connection(other).is_some_and(|c| {
                c.role.is_partyline() && c.is_established() && c.identity().is_some() && c.flags.chat
            })
        })
        .collect();

    for target in targets {
        session.send_to(target, line);
    }
}

/// .login <name> <password>
fn cmd_login(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    let id = source.conn;
    if let Origin::Operator(ref name) = source.origin {
        reply(session, id, &format!("Already logged in as {}", name));
        return Ok(());
    }
    if params.len() < 2 {
        return Err(Error::Auth("Usage: .login <name> <password>".to_string()));
    }

    let account = session
        .operator(&params[0])
        .filter(|account| account.verify_password(&params[1]));
    let Some(account) = account else {
        let peer = session.connection(id).map(|c| c.peer().to_string()).unwrap_or_default();
        tracing::warn!("Failed party-line login as {} from {}", params[0], peer);
        return Err(Error::Auth("Login failed".to_string()));
    };

    let name = account.name.clone();
    let peer = match session.connection_mut(id) {
        Some(conn) => {
            conn.set_identity(account);
            conn.peer().to_string()
        }
        None => return Ok(()),
    };

    reply(session, id, &format!("Logged in as {}", name));
    session.notice_opers(&format!("{} logged in from {}", name, peer));
    Ok(())
}

/// .chat
fn cmd_chat(session: &mut Session, source: &Source, _params: &[String]) -> Result<()> {
    let id = source.conn;
    let name = session.source_name(source);

    let enabled = match session.connection_mut(id) {
        Some(conn) => {
            conn.flags.chat = !conn.flags.chat;
            conn.flags.chat
        }
        None => return Ok(()),
    };

    if enabled {
        broadcast(session, Some(id), &format!("*** {} joined the party line", name));
        reply(session, id, "Chat enabled");
    } else {
        broadcast(session, Some(id), &format!("*** {} left the party line", name));
        reply(session, id, "Chat disabled");
    }
    Ok(())
}

/// .who
fn cmd_who(session: &mut Session, source: &Source, _params: &[String]) -> Result<()> {
    let mut lines = Vec::new();
    for other in session.connection_ids() {
        let Some(conn) = session.connection(other) else {
            continue;
        };
        let Some(account) = conn.identity() else {
            continue;
        };
        if !conn.role.is_partyline() || conn.is_dead() {
            continue;
        }
        lines.push(format!(
            "{} ({}){}",
            account.name,
            conn.peer(),
            if conn.flags.chat { " [chat]" } else { "" }
        ));
    }

    reply(session, source.conn, &format!("{} operator(s) online", lines.len()));
    for line in lines {
        reply(session, source.conn, &line);
    }
    Ok(())
}

/// .status
fn cmd_status(session: &mut Session, source: &Source, _params: &[String]) -> Result<()> {
    let mut lines = Vec::new();

    let uplink = session.uplink().and_then(|id| session.connection(id));
    lines.push(match uplink {
        None => match session.reconnect_at() {
            Some(_) => "Uplink: disconnected, reconnect pending".to_string(),
            None => "Uplink: none".to_string(),
        },
        Some(conn) => {
            let server = session
                .uplink_server()
                .and_then(|sid| session.network().find_server(sid))
                .map(|s| s.name.clone())
                .unwrap_or_else(|| conn.peer().to_string());
            let burst = if conn.flags.end_of_burst {
                "burst finished"
            } else if conn.flags.sent_burst {
                "bursting"
            } else {
                "no burst yet"
            };
            format!("Uplink: {} {:?}, {}", server, conn.state(), burst)
        }
    });

    let network = session.network();
    lines.push(format!(
        "Servers: {}  Users: {}  Channels: {}  Uptime: {}s",
        network.server_count(),
        network.user_count(),
        session.channels().len(),
        session.uptime().as_secs()
    ));

    for id in session.connection_ids() {
        if let Some(conn) = session.connection(id) {
            lines.push(format!(
                "{} {:?} {} {:?} since {} sendq {}",
                id,
                conn.role,
                conn.peer(),
                conn.state(),
                conn.connected_at.format("%Y-%m-%d %H:%M:%S"),
                conn.queue_length()
            ));
        }
    }

    for line in lines {
        reply(session, source.conn, &line);
    }
    Ok(())
}

/// .quit
fn cmd_quit(session: &mut Session, source: &Source, _params: &[String]) -> Result<()> {
    reply(session, source.conn, "Goodbye");
    session.mark_dead(source.conn, "Quit");
    Ok(())
}

/// .help
fn cmd_help(session: &mut Session, source: &Source, _params: &[String]) -> Result<()> {
    let commands: Vec<String> = session
        .partyline_registry()
        .commands()
        .into_iter()
        .map(|c| format!(".{}", c.to_ascii_lowercase()))
        .collect();
    reply(session, source.conn, &format!("Commands: {}", commands.join(" ")));
    Ok(())
}
