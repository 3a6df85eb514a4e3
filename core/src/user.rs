//! User, server and service tracking
//!
//! Everything the uplink introduces (servers, users) plus our own
//! pseudo-clients lives in [`Network`]. Channels refer to users by UID.

use crate::config::ServiceConfig;
use crate::utils::irc_to_lower;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// A server somewhere behind our uplink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRecord {
    /// TS6 server id
    pub sid: String,
    /// Server name
    pub name: String,
    /// Server description
    pub description: String,
    /// SID of the server this one is linked behind, `None` for our uplink
    pub uplink_sid: Option<String>,
}

/// A network user introduced by UID/EUID
#[derive(Debug, Clone)]
pub struct User {
    /// TS6 user id
    pub uid: String,
    /// Nickname
    pub nick: String,
    /// Username
    pub user: String,
    /// Visible hostname
    pub host: String,
    /// Real name
    pub gecos: String,
    /// SID of the server the user is on
    pub server_sid: String,
    /// Nick timestamp
    pub ts: i64,
    /// User modes without the leading `+`
    pub umodes: String,
    /// Folded names of channels the user is in
    pub channels: BTreeSet<String>,
}

impl User {
    /// `nick!user@host` form
    pub fn mask(&self) -> String {
        format!("{}!{}@{}", self.nick, self.user, self.host)
    }

    /// Check if user has a specific mode
    pub fn has_mode(&self, mode: char) -> bool {
        self.umodes.contains(mode)
    }

    /// Check if user is an IRC operator
    pub fn is_operator(&self) -> bool {
        self.has_mode('o')
    }
}

/// One of our own pseudo-clients
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    /// TS6 user id, under our SID
    pub uid: String,
    /// Nickname
    pub nick: String,
    /// Username
    pub user: String,
    /// Hostname
    pub host: String,
    /// Real name
    pub gecos: String,
    /// Introduction timestamp
    pub ts: i64,
    /// Channels the service should sit in, as configured
    pub channels: Vec<String>,
}

/// Indices over servers, users and services
#[derive(Debug, Default)]
pub struct Network {
    servers: FxHashMap<String, ServerRecord>,
    server_names: FxHashMap<String, String>,
    users: FxHashMap<String, User>,
    nicks: FxHashMap<String, String>,
    services: FxHashMap<String, ServiceDefinition>,
    service_nicks: FxHashMap<String, String>,
    next_uid: u64,
}

/// Characters used in the last six positions of a UID
const UID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

impl Network {
    /// Create an empty network view
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next UID under `sid`: AAAAAA, AAAAAB, ...
    pub fn allocate_uid(&mut self, sid: &str) -> String {
        let mut n = self.next_uid;
        self.next_uid += 1;

        let mut suffix = [b'A'; 6];
        for slot in suffix.iter_mut().rev() {
            *slot = UID_ALPHABET[(n % UID_ALPHABET.len() as u64) as usize];
            n /= UID_ALPHABET.len() as u64;
        }

        format!("{}{}", sid, String::from_utf8_lossy(&suffix))
    }

    /// Register a local service from configuration
    pub fn add_service(&mut self, sid: &str, config: &ServiceConfig, ts: i64) -> String {
        let uid = self.allocate_uid(sid);
        let service = ServiceDefinition {
            uid: uid.clone(),
            nick: config.nick.clone(),
            user: config.user.clone(),
            host: config.host.clone(),
            gecos: config.gecos.clone(),
            ts,
            channels: config.channels.clone(),
        };

        self.service_nicks.insert(irc_to_lower(&service.nick), uid.clone());
        self.services.insert(uid.clone(), service);
        uid
    }

    /// Look up a service by UID
    pub fn service(&self, uid: &str) -> Option<&ServiceDefinition> {
        self.services.get(uid)
    }

    /// Look up a service by UID or nickname
    pub fn find_service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name).or_else(|| {
            self.service_nicks
                .get(&irc_to_lower(name))
                .and_then(|uid| self.services.get(uid))
        })
    }

    /// Check if a UID belongs to one of our services
    pub fn is_service(&self, uid: &str) -> bool {
        self.services.contains_key(uid)
    }

    /// All services, in UID order
    pub fn services(&self) -> Vec<&ServiceDefinition> {
        let mut services: Vec<_> = self.services.values().collect();
        services.sort_by(|a, b| a.uid.cmp(&b.uid));
        services
    }

    /// Add or replace a server
    pub fn add_server(&mut self, server: ServerRecord) {
        self.server_names.insert(irc_to_lower(&server.name), server.sid.clone());
        self.servers.insert(server.sid.clone(), server);
    }

    /// Look up a server by SID or name
    pub fn find_server(&self, name: &str) -> Option<&ServerRecord> {
        self.servers.get(name).or_else(|| {
            self.server_names
                .get(&irc_to_lower(name))
                .and_then(|sid| self.servers.get(sid))
        })
    }

    /// Remove a server and every server behind it
    ///
    /// Returns the removed SIDs; their users are left for the caller to
    /// remove so channel memberships can be torn down alongside.
    pub fn remove_server_tree(&mut self, sid: &str) -> Vec<String> {
        let mut removed = Vec::new();
        let mut pending = vec![sid.to_string()];

        while let Some(current) = pending.pop() {
            if let Some(server) = self.servers.remove(&current) {
                self.server_names.remove(&irc_to_lower(&server.name));
                pending.extend(
                    self.servers
                        .values()
                        .filter(|s| s.uplink_sid.as_deref() == Some(current.as_str()))
                        .map(|s| s.sid.clone()),
                );
                removed.push(current);
            }
        }

        removed
    }

    /// Number of known servers
    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Add a user, replacing any previous user with the same UID
    pub fn add_user(&mut self, user: User) {
        self.nicks.insert(irc_to_lower(&user.nick), user.uid.clone());
        self.users.insert(user.uid.clone(), user);
    }

    /// Look up a user by UID
    pub fn user(&self, uid: &str) -> Option<&User> {
        self.users.get(uid)
    }

    /// Mutable lookup by UID
    pub fn user_mut(&mut self, uid: &str) -> Option<&mut User> {
        self.users.get_mut(uid)
    }

    /// Look up a user by UID or nickname
    pub fn find_user(&self, name: &str) -> Option<&User> {
        self.users.get(name).or_else(|| {
            self.nicks
                .get(&irc_to_lower(name))
                .and_then(|uid| self.users.get(uid))
        })
    }

    /// Change a user's nickname
    pub fn rename_user(&mut self, uid: &str, nick: &str, ts: i64) -> bool {
        let Some(user) = self.users.get_mut(uid) else {
            return false;
        };

        self.nicks.remove(&irc_to_lower(&user.nick));
        user.nick = nick.to_string();
        user.ts = ts;
        self.nicks.insert(irc_to_lower(nick), uid.to_string());
        true
    }

    /// Remove a user from the index
    pub fn remove_user(&mut self, uid: &str) -> Option<User> {
        let user = self.users.remove(uid)?;
        if self.nicks.get(&irc_to_lower(&user.nick)).map(String::as_str) == Some(uid) {
            self.nicks.remove(&irc_to_lower(&user.nick));
        }
        Some(user)
    }

    /// UIDs of users on any of the given servers
    pub fn users_on(&self, sids: &[String]) -> Vec<String> {
        self.users
            .values()
            .filter(|u| sids.contains(&u.server_sid))
            .map(|u| u.uid.clone())
            .collect()
    }

    /// Number of known users
    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn user(uid: &str, nick: &str, sid: &str) -> User {
        User {
            uid: uid.to_string(),
            nick: nick.to_string(),
            user: "u".to_string(),
            host: "h.example".to_string(),
            gecos: "real".to_string(),
            server_sid: sid.to_string(),
            ts: 1,
            umodes: "i".to_string(),
            channels: BTreeSet::new(),
        }
    }

    #[test]
    fn test_uid_allocation() {
        let mut network = Network::new();
        assert_eq!(network.allocate_uid("0SV"), "0SVAAAAAA");
        assert_eq!(network.allocate_uid("0SV"), "0SVAAAAAB");
        for _ in 0..34 {
            network.allocate_uid("0SV");
        }
        assert_eq!(network.allocate_uid("0SV"), "0SVAAAABA");
    }

    #[test]
    fn test_user_lookup_by_nick_is_case_insensitive() {
        let mut network = Network::new();
        network.add_user(user("42XAAAAAA", "Alice[m]", "42X"));

        assert!(network.find_user("alice{M}").is_some());
        assert!(network.find_user("42XAAAAAA").is_some());

        assert!(network.rename_user("42XAAAAAA", "Bob", 5));
        assert!(network.find_user("alice[m]").is_none());
        assert_eq!(network.find_user("bob").unwrap().ts, 5);
    }

    #[test]
    fn test_remove_server_tree() {
        let mut network = Network::new();
        let server = |sid: &str, name: &str, up: Option<&str>| ServerRecord {
            sid: sid.to_string(),
            name: name.to_string(),
            description: String::new(),
            uplink_sid: up.map(str::to_string),
        };
        network.add_server(server("1AA", "hub.test", None));
        network.add_server(server("2BB", "leaf1.test", Some("1AA")));
        network.add_server(server("3CC", "leaf2.test", Some("2BB")));
        network.add_server(server("4DD", "other.test", None));
        network.add_user(user("3CCAAAAAA", "carol", "3CC"));

        let mut removed = network.remove_server_tree("2BB");
        removed.sort();
        assert_eq!(removed, vec!["2BB", "3CC"]);
        assert!(network.find_server("leaf2.test").is_none());
        assert!(network.find_server("HUB.TEST").is_some());
        assert_eq!(network.users_on(&removed), vec!["3CCAAAAAA"]);
    }

    #[test]
    fn test_services() {
        let mut network = Network::new();
        let uid = network.add_service(
            "0SV",
            &ServiceConfig {
                nick: "ChanServ".to_string(),
                user: "cs".to_string(),
                host: "services.test".to_string(),
                gecos: "Channel Services".to_string(),
                channels: vec!["#help".to_string()],
            },
            10,
        );

        assert!(network.is_service(&uid));
        assert_eq!(network.find_service("chanserv").unwrap().uid, uid);
        assert!(network.find_user("ChanServ").is_none());
    }
}
