//! Channel state synchronisation
//!
//! JOIN and SJOIN go through the TS merge in [`merge_burst`]; everything
//! else edits an existing channel. A channel left without users and services
//! is torn down before the handler returns.

use super::{need_params, parse_ts};
use crate::channel::{parse_mode_changes, BurstKind, ChannelModes, MemberFlags, ModeChange, TsOutcome, LIST_MODES};
use crate::events::Event;
use crate::registry::{CommandFlags, CommandRegistry};
use crate::session::{Origin, Session, Source};
use crate::utils::string::is_valid_channel_name;
use crate::{Error, Result};

/// Register channel handlers
pub fn register(registry: &mut CommandRegistry) {
    registry.register("JOIN", CommandFlags::NONE, handle_join);
    registry.register("SJOIN", CommandFlags::NONE, handle_sjoin);
    registry.register("PART", CommandFlags::NONE, handle_part);
    registry.register("KICK", CommandFlags::NONE, handle_kick);
    registry.register("TOPIC", CommandFlags::NONE, handle_topic);
    registry.register("TB", CommandFlags::NONE, handle_tb);
    registry.register("TMODE", CommandFlags::NONE, handle_tmode);
    registry.register("BMASK", CommandFlags::NONE, handle_bmask);
}

fn check_channel_name(name: &str) -> Result<()> {
    if !is_valid_channel_name(name) {
        return Err(Error::Channel(format!("Invalid channel name {}", name)));
    }
    Ok(())
}

fn no_such_channel(name: &str) -> Error {
    Error::Channel(format!("No such channel {}", name))
}

/// Apply a JOIN or SJOIN: resolve TS and modes, then add members
///
/// Members flagged on the wire are downgraded when the local side wins.
/// Unknown UIDs are skipped; a channel that ends up empty is destroyed.
pub fn merge_burst(
    session: &mut Session,
    name: &str,
    ts: i64,
    modes: &ChannelModes,
    kind: BurstKind,
    members: &[(String, MemberFlags)],
) -> TsOutcome {
    let outcome = if session.ensure_channel(name, ts, modes) {
        TsOutcome::Created
    } else {
        match session.channels.get_mut(name) {
            Some(channel) => {
                let old_ts = channel.ts;
                let outcome = channel.resolve_ts(ts, modes, kind);
                if outcome == TsOutcome::IncomingWins {
                    tracing::info!("Channel {} TS lowered from {} to {}", name, old_ts, ts);
                }
                outcome
            }
            None => return TsOutcome::Created,
        }
    };

    if outcome == TsOutcome::IncomingWins {
        let services: Vec<String> = session
            .channels
            .get(name)
            .map(|c| c.services.iter().cloned().collect())
            .unwrap_or_default();
        for uid in services {
            session.rejoin_service(name, &uid);
        }
    }

    for (uid, flags) in members {
        if session.network.user(uid).is_none() {
            tracing::debug!("{}: skipping unknown member {}", name, uid);
            continue;
        }
        session.add_member(name, uid, outcome.member_flags(*flags));
    }

    session.destroy_if_empty(name);
    outcome
}

/// :<uid> JOIN <ts> <channel> +<modes...>, or JOIN 0 to leave everything
fn handle_join(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("JOIN", params, 1)?;
    let Some(uid) = source.user() else {
        return Err(Error::Protocol("JOIN from a non-user source".to_string()));
    };

    if params[0] == "0" {
        let channels: Vec<String> = session
            .network
            .user(uid)
            .map(|u| u.channels.iter().cloned().collect())
            .unwrap_or_default();
        for channel in channels {
            session.remove_member(&channel, uid);
        }
        return Ok(());
    }

    need_params("JOIN", params, 2)?;
    let ts = parse_ts("JOIN", &params[0])?;
    let name = &params[1];
    check_channel_name(name)?;

    let modes = match params.get(2) {
        Some(modestring) => ChannelModes::parse(modestring, &params[3..])?,
        None => ChannelModes::default(),
    };

    merge_burst(
        session,
        name,
        ts,
        &modes,
        BurstKind::Join,
        &[(uid.to_string(), MemberFlags::default())],
    );
    Ok(())
}

/// :<sid> SJOIN <ts> <channel> <modes> [args...] :<prefixed uids>
fn handle_sjoin(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("SJOIN", params, 4)?;
    if source.server().is_none() {
        return Err(Error::Protocol("SJOIN from a non-server source".to_string()));
    }

    let ts = parse_ts("SJOIN", &params[0])?;
    let name = &params[1];
    check_channel_name(name)?;

    let last = params.len() - 1;
    let modes = ChannelModes::parse(&params[2], &params[3..last])?;

    let members: Vec<(String, MemberFlags)> = params[last]
        .split_whitespace()
        .map(|entry| {
            let (flags, uid) = MemberFlags::parse_prefixed(entry);
            (uid.to_string(), flags)
        })
        .filter(|(uid, _)| !uid.is_empty())
        .collect();

    merge_burst(session, name, ts, &modes, BurstKind::Sjoin, &members);
    Ok(())
}

/// :<uid> PART <channel>[,<channel>...] [:<reason>]
fn handle_part(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("PART", params, 1)?;
    let Some(uid) = source.user() else {
        return Err(Error::Protocol("PART from a non-user source".to_string()));
    };

    for channel in params[0].split(',').filter(|c| !c.is_empty()) {
        if !session.remove_member(channel, uid) {
            tracing::debug!("PART {} by {} who was not a member", channel, uid);
        }
    }
    Ok(())
}

/// :<source> KICK <channel> <target> [:<reason>]
fn handle_kick(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("KICK", params, 2)?;
    let (channel, target) = (&params[0], &params[1]);

    if !session.channels.contains(channel) {
        return Err(no_such_channel(channel));
    }

    if let Some(uid) = session.network.find_service(target).map(|s| s.uid.clone()) {
        let kicker = session.source_name(source);
        tracing::info!("Service {} kicked from {} by {}, rejoining", target, channel, kicker);
        session.rejoin_service(channel, &uid);
        return Ok(());
    }

    match session.network.find_user(target).map(|u| u.uid.clone()) {
        Some(uid) => {
            session.remove_member(channel, &uid);
        }
        None => tracing::debug!("KICK of unknown target {} from {}", target, channel),
    }
    Ok(())
}

/// Who to record as the topic author
fn topic_author(session: &Session, source: &Source) -> String {
    match source.origin {
        Origin::User(ref uid) => match session.network.user(uid) {
            Some(user) => user.mask(),
            None => uid.clone(),
        },
        _ => session.source_name(source),
    }
}

fn apply_topic(session: &mut Session, channel: &str, topic: &str, setter: &str) -> Result<()> {
    let now = session.now_ts();
    let Some(chan) = session.channels.get_mut(channel) else {
        return Err(no_such_channel(channel));
    };
    chan.set_topic(topic, setter, now);

    let event = Event::TopicChanged {
        channel: chan.name.clone(),
        setter: setter.to_string(),
        topic: topic.to_string(),
    };
    session.emit(event);
    Ok(())
}

/// :<source> TOPIC <channel> :<text>
fn handle_topic(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("TOPIC", params, 2)?;
    let setter = topic_author(session, source);
    apply_topic(session, &params[0], &params[1], &setter)
}

/// :<source> TB <channel> <topic ts> [<setter>] :<text>
fn handle_tb(session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
    need_params("TB", params, 3)?;
    let channel = &params[0];
    let burst_ts = parse_ts("TB", &params[1])?;

    let (setter, topic) = if params.len() >= 4 {
        (params[2].clone(), &params[3])
    } else {
        (session.source_name(source), &params[2])
    };

    let Some(chan) = session.channels.get(channel) else {
        return Err(no_such_channel(channel));
    };
    if !chan.accepts_topic_burst(burst_ts) {
        tracing::debug!(
            "Keeping topic of {} (set at {}) over burst from {}",
            chan.name,
            chan.topic_ts,
            burst_ts
        );
        return Ok(());
    }

    apply_topic(session, channel, topic, &setter)
}

/// :<source> TMODE <ts> <channel> <modes> [args...]
fn handle_tmode(session: &mut Session, _source: &Source, params: &[String]) -> Result<()> {
    need_params("TMODE", params, 3)?;
    let ts = parse_ts("TMODE", &params[0])?;
    let channel = &params[1];

    let mut changes = parse_mode_changes(&params[2], &params[3..])?;
    for change in changes.iter_mut() {
        if let ModeChange::Member { target, .. } = change {
            if let Some(user) = session.network.find_user(target) {
                *target = user.uid.clone();
            }
        }
    }

    let Some(chan) = session.channels.get_mut(channel) else {
        return Err(no_such_channel(channel));
    };
    if ts > chan.ts {
        tracing::debug!("Ignoring TMODE on {} with newer TS {} > {}", chan.name, ts, chan.ts);
        return Ok(());
    }

    let applied = chan.apply_changes(&changes);
    tracing::debug!("TMODE {} applied {} of {} changes", chan.name, applied, changes.len());
    Ok(())
}

/// :<sid> BMASK <ts> <channel> <b|e|I> :<masks>
fn handle_bmask(session: &mut Session, _source: &Source, params: &[String]) -> Result<()> {
    need_params("BMASK", params, 4)?;
    let ts = parse_ts("BMASK", &params[0])?;
    let channel = &params[1];

    let mode = match params[2].chars().next() {
        Some(m) if params[2].len() == 1 && LIST_MODES.contains(m) => m,
        _ => return Err(Error::Channel(format!("BMASK: invalid list type {}", params[2]))),
    };

    let Some(chan) = session.channels.get_mut(channel) else {
        return Err(no_such_channel(channel));
    };
    if ts > chan.ts {
        tracing::debug!("Ignoring BMASK on {} with newer TS {} > {}", chan.name, ts, chan.ts);
        return Ok(());
    }

    let list = chan.list_mut(mode);
    for mask in params[3].split_whitespace() {
        if !list.iter().any(|m| m == mask) {
            list.push(mask.to_string());
        }
    }
    Ok(())
}
