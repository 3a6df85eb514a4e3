//! Network user tracking: introductions, nick changes, quits and kills
//!
//! Also where party-line requests arrive: an IRC operator can CTCP
//! `DCC CHAT` one of our services to get a party-line connection.

use super::{need_params, parse_ts};
use crate::events::Event;
use crate::registry::{CommandFlags, CommandRegistry};
use crate::session::{Session, Source};
use crate::user::User;
use crate::utils::string::is_uid;
use crate::{soft_assert, Error, Result};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Register user handlers
pub fn register(registry: &mut CommandRegistry) {
    registry.register("UID", CommandFlags::NONE, handle_uid);
    registry.register("EUID", CommandFlags::NONE, handle_euid);
    registry.register("NICK", CommandFlags::NONE, handle_nick);
    registry.register("QUIT", CommandFlags::NONE, handle_quit);
    registry.register("KILL", CommandFlags::NONE, handle_kill);
    registry.register("PRIVMSG", CommandFlags::NONE, handle_privmsg);
}

fn introducing_server<'a>(command: &str, source: &'a Source) -> Result<&'a str> {
    source
        .server()
        .ok_or_else(|| Error::Protocol(format!("{} from a non-server source", command)))
}

fn check_uid(command: &str, uid: &str) -> Result<()> {
    if !is_uid(uid) {
        return Err(Error::Protocol(format!("{}: invalid uid {}", command, uid)));
    }
    Ok(())
}

/// :<sid> UID <nick> <hops> <ts> <umodes> <user> <host> <ip> <uid> :<gecos>
fn handle_uid(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("UID", params, 9)?;
    let sid = introducing_server("UID", source)?;
    check_uid("UID", &params[7])?;

    let user = User {
        uid: params[7].clone(),
        nick: params[0].clone(),
        user: params[4].clone(),
        host: params[5].clone(),
        gecos: params[8].clone(),
        server_sid: sid.to_string(),
        ts: parse_ts("UID", &params[2])?,
        umodes: params[3].trim_start_matches('+').to_string(),
        channels: BTreeSet::new(),
    };
    introduce(session, user);
    Ok(())
}

/// :<sid> EUID <nick> <hops> <ts> <umodes> <user> <host> <ip> <uid> <realhost> <account> :<gecos>
fn handle_euid(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("EUID", params, 11)?;
    let sid = introducing_server("EUID", source)?;
    check_uid("EUID", &params[7])?;

    let user = User {
        uid: params[7].clone(),
        nick: params[0].clone(),
        user: params[4].clone(),
        host: params[5].clone(),
        gecos: params[10].clone(),
        server_sid: sid.to_string(),
        ts: parse_ts("EUID", &params[2])?,
        umodes: params[3].trim_start_matches('+').to_string(),
        channels: BTreeSet::new(),
    };
    introduce(session, user);
    Ok(())
}

fn introduce(session: &mut Session, user: User) {
    if let Some(service) = session.network.find_service(&user.nick) {
        let nick = service.nick.clone();
        session.notice_opers(&format!(
            "Nick collision: {} ({}) introduced with the nick of service {}",
            user.nick, user.uid, nick
        ));
    }

    let duplicate = session.network.user(&user.uid).is_some();
    soft_assert!(session, !duplicate, "UID {} introduced twice", user.uid);
    if duplicate {
        session.remove_user(&user.uid, "UID reintroduced");
    }

    tracing::debug!("User {} ({}) on {}", user.nick, user.uid, user.server_sid);
    let event = Event::UserIntroduced {
        uid: user.uid.clone(),
        nick: user.nick.clone(),
    };
    session.network.add_user(user);
    session.emit(event);
}

/// :<uid> NICK <newnick> :<ts>
fn handle_nick(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("NICK", params, 1)?;
    let Some(uid) = source.user() else {
        return Err(Error::Protocol("NICK from a non-user source".to_string()));
    };

    let ts = match params.get(1) {
        Some(raw) => parse_ts("NICK", raw)?,
        None => session.now_ts(),
    };
    session.network.rename_user(uid, &params[0], ts);
    Ok(())
}

/// :<uid> QUIT :<reason>
fn handle_quit(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    let Some(uid) = source.user() else {
        return Err(Error::Protocol("QUIT from a non-user source".to_string()));
    };
    let reason = params.first().map(String::as_str).unwrap_or("");
    session.remove_user(uid, reason);
    Ok(())
}

/// :<source> KILL <target> :<reason>
fn handle_kill(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("KILL", params, 1)?;
    let reason = params.get(1).map(String::as_str).unwrap_or("");

    if let Some(uid) = session.network.find_service(&params[0]).map(|s| s.uid.clone()) {
        let killer = session.source_name(source);
        session.notice_opers(&format!("Service {} killed by {} ({}), reintroducing", params[0], killer, reason));
        session.reintroduce_service(&uid);
        return Ok(());
    }

    match session.network.find_user(&params[0]).map(|u| u.uid.clone()) {
        Some(uid) => session.remove_user(&uid, &format!("Killed ({})", reason)),
        None => tracing::debug!("KILL for unknown target {}", params[0]),
    }
    Ok(())
}

/// :<uid> PRIVMSG <service> :\x01DCC CHAT chat <ip> <port>\x01
fn handle_privmsg(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("PRIVMSG", params, 2)?;
    let Some(uid) = source.user() else {
        return Ok(());
    };
    if session.network.find_service(&params[0]).is_none() {
        return Ok(());
    }
    let Some(addr) = parse_dcc_chat(&params[1]) else {
        return Ok(());
    };

    let Some(user) = session.network.user(uid) else {
        return Ok(());
    };
    let mask = user.mask();
    if !user.is_operator() {
        tracing::info!("Refusing party-line request from non-operator {}", mask);
        return Ok(());
    }

    session.notice_opers(&format!("Party-line requested by {} at {}", mask, addr));
    session.connect_dcc(addr);
    Ok(())
}

/// Parse a CTCP `DCC CHAT chat <ip> <port>` request
pub fn parse_dcc_chat(text: &str) -> Option<SocketAddr> {
    let body = text.strip_prefix('\x01')?.strip_suffix('\x01')?;
    let mut words = body.split_whitespace();

    if !words.next()?.eq_ignore_ascii_case("DCC") || !words.next()?.eq_ignore_ascii_case("CHAT") {
        return None;
    }
    let _protocol = words.next()?;
    let ip: u32 = words.next()?.parse().ok()?;
    let port: u16 = words.next()?.parse().ok()?;
    if port == 0 {
        return None;
    }

    Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
}
