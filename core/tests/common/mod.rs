//! Shared helpers for integration tests

#![allow(dead_code)]

use argon2::password_hash::{PasswordHasher, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use parking_lot::Mutex;
use rustsvcs_core::protocol;
use rustsvcs_core::{
    Config, ConnId, ConnectionRole, Event, MemoryTransport, OperatorAccount, ServiceConfig, Session,
};
use std::sync::Arc;

/// Password of the `admin` party-line account
pub const ADMIN_PASSWORD: &str = "hunter2";

/// Cheap Argon2 hash so tests stay fast
pub fn hash(password: &str) -> String {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let params = Params::new(1024, 1, 1, None).unwrap();
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

/// Configuration with one service in #services and one operator
pub fn config() -> Config {
    let mut config = Config::default();
    config.services.push(ServiceConfig {
        nick: "ChanServ".to_string(),
        user: "chanserv".to_string(),
        host: "services.example.org".to_string(),
        gecos: "Channel Services".to_string(),
        channels: vec!["#services".to_string()],
    });
    config.partyline.operators.push(OperatorAccount {
        name: "admin".to_string(),
        password_hash: hash(ADMIN_PASSWORD),
    });
    config
}

/// Session with core handlers and party-line commands installed
pub fn session() -> Session {
    session_with(config())
}

/// Session built from a custom configuration
pub fn session_with(config: Config) -> Session {
    let mut session = Session::new(config);
    protocol::install(&mut session);
    session
}

/// Service every connection until the transport's input is consumed
pub fn pump(session: &mut Session, transport: &MemoryTransport) {
    for _ in 0..10_000 {
        if transport.pending_input() == 0 {
            break;
        }
        session.service_io();
    }
    session.service_io();
}

/// Attach an uplink and complete its handshake as hub.example.net (1HB)
pub fn link(session: &mut Session) -> (ConnId, MemoryTransport) {
    let t = MemoryTransport::new("hub.example.net");
    let id = session.attach(ConnectionRole::Uplink, Box::new(t.clone()));

    t.feed_line("PASS linkpass TS 6 :1HB");
    t.feed_line("CAPAB :QS EX IE KLN UNKLN ENCAP TB EUID");
    t.feed_line("SERVER hub.example.net 1 :Test hub");
    t.feed_line("SVINFO 6 6 0 :1700000000");
    pump(session, &t);
    (id, t)
}

/// Linked session with the burst output already drained
pub fn linked() -> (Session, ConnId, MemoryTransport) {
    let mut session = session();
    let (id, t) = link(&mut session);
    t.take_written();
    (session, id, t)
}

/// Introduce a user on the hub
pub fn introduce(session: &mut Session, t: &MemoryTransport, uid: &str, nick: &str, umodes: &str) {
    t.feed_line(&format!(
        ":1HB UID {} 1 1000 +{} {} host.example 10.0.0.1 {} :Real Name",
        nick, umodes, nick, uid
    ));
    pump(session, t);
}

/// Record every event a session emits
pub fn record_events(session: &mut Session) -> Arc<Mutex<Vec<Event>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    session.subscribe(move |_: &mut Session, event: &Event| sink.lock().push(event.clone()));
    events
}

/// Attach a party-line peer and drain its banner
pub fn partyline_peer(session: &mut Session, name: &str) -> (ConnId, MemoryTransport) {
    let t = MemoryTransport::new(name);
    let id = session.attach(ConnectionRole::DccOut, Box::new(t.clone()));
    t.take_written();
    (id, t)
}

/// Attach a party-line peer and log it in as admin
pub fn logged_in_peer(session: &mut Session, name: &str) -> (ConnId, MemoryTransport) {
    let (id, t) = partyline_peer(session, name);
    t.feed_line(&format!(".login admin {}", ADMIN_PASSWORD));
    pump(session, &t);
    t.take_written();
    (id, t)
}
