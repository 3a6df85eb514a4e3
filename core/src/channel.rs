//! Channel state and TS based conflict resolution
//!
//! A channel's TS is a logical clock: the lower value wins a merge, equal
//! values merge additively, and zero means "no authority" on either side.
//! The functions here only touch the channel itself; keeping user records in
//! step with memberships is the session's job.

use crate::utils::irc_to_lower;
use crate::{Error, Result};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Mode letters that are plain on/off switches
pub const SIMPLE_MODES: &str = "cgimnprstuzCLPQ";

/// Mode letters that carry a single value while set, besides `k` and `l`
pub const PARAM_MODES: &str = "fj";

/// List modes: bans, ban exceptions, invite exceptions
pub const LIST_MODES: &str = "beI";

/// Per-member privilege modes
pub const MEMBER_MODES: &str = "ov";

/// Channel mode state, excluding lists and member privileges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelModes {
    /// Set simple modes
    pub simple: BTreeSet<char>,
    /// User limit (`+l`)
    pub limit: Option<u32>,
    /// Channel key (`+k`)
    pub key: Option<String>,
    /// Other single-value modes (`+f`, `+j`)
    pub params: BTreeMap<char, String>,
}

impl ChannelModes {
    /// Parse a burst mode string such as `+ntkl secret 10`
    ///
    /// Only additions are meaningful here; member and list modes are rejected.
    pub fn parse(modestring: &str, args: &[String]) -> Result<Self> {
        let mut modes = ChannelModes::default();

        for change in parse_mode_changes(modestring, args)? {
            match change {
                ModeChange::Simple { adding: true, mode } => {
                    modes.simple.insert(mode);
                }
                ModeChange::Key(Some(key)) => modes.key = Some(key),
                ModeChange::Limit(Some(limit)) => modes.limit = Some(limit),
                ModeChange::Param { mode, value: Some(value) } => {
                    modes.params.insert(mode, value);
                }
                other => {
                    return Err(Error::Channel(format!(
                        "Mode change {:?} not allowed in a burst mode string",
                        other
                    )))
                }
            }
        }

        Ok(modes)
    }

    /// Check if a simple mode is set
    pub fn has(&self, mode: char) -> bool {
        self.simple.contains(&mode)
    }

    /// Merge another side's modes into ours, as for equal timestamps
    pub fn merge(&mut self, other: &ChannelModes) {
        self.simple.extend(other.simple.iter().copied());

        self.limit = match (self.limit, other.limit) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        self.key = greater(self.key.take(), other.key.clone());

        for (mode, value) in &other.params {
            let current = self.params.remove(mode);
            if let Some(v) = greater(current, Some(value.clone())) {
                self.params.insert(*mode, v);
            }
        }
    }

    /// Clear every mode
    pub fn clear(&mut self) {
        *self = ChannelModes::default();
    }

    /// Mode string and its arguments, e.g. `["+ntl", "10"]`
    pub fn to_params(&self) -> Vec<String> {
        let mut letters = String::from("+");
        let mut args = Vec::new();

        letters.extend(self.simple.iter());
        for (mode, value) in &self.params {
            letters.push(*mode);
            args.push(value.clone());
        }
        if let Some(ref key) = self.key {
            letters.push('k');
            args.push(key.clone());
        }
        if let Some(limit) = self.limit {
            letters.push('l');
            args.push(limit.to_string());
        }

        let mut params = vec![letters];
        params.extend(args);
        params
    }
}

impl fmt::Display for ChannelModes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_params().join(" "))
    }
}

/// Lexicographically greater of two optional non-empty values
fn greater(a: Option<String>, b: Option<String>) -> Option<String> {
    let a = a.filter(|s| !s.is_empty());
    let b = b.filter(|s| !s.is_empty());
    match (a, b) {
        (Some(a), Some(b)) => Some(if b > a { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// One parsed mode change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeChange {
    /// Simple mode on or off
    Simple { adding: bool, mode: char },
    /// Set (`Some`) or clear (`None`) the key
    Key(Option<String>),
    /// Set (`Some`) or clear (`None`) the limit
    Limit(Option<u32>),
    /// Set or clear another single-value mode
    Param { mode: char, value: Option<String> },
    /// Op or voice given to or taken from a member
    Member { adding: bool, mode: char, target: String },
    /// Ban, exception or invite-exception list edit
    List { adding: bool, mode: char, mask: String },
}

/// Parse a mode string with its arguments
pub fn parse_mode_changes(modestring: &str, args: &[String]) -> Result<Vec<ModeChange>> {
    let mut args = args.iter();
    let mut adding = true;
    let mut changes = Vec::new();

    let mut need_arg = |mode: char| {
        args.next()
            .cloned()
            .ok_or_else(|| Error::Channel(format!("Mode {} is missing its argument", mode)))
    };

    if modestring.is_empty() {
        return Err(Error::Channel("Empty mode string".to_string()));
    }

    for mode in modestring.chars() {
        match mode {
            '+' => adding = true,
            '-' => adding = false,
            m if SIMPLE_MODES.contains(m) => changes.push(ModeChange::Simple { adding, mode: m }),
            'k' if adding => changes.push(ModeChange::Key(Some(need_arg('k')?))),
            'k' => {
                // -k carries the old key, which we do not need
                let _ = need_arg('k');
                changes.push(ModeChange::Key(None));
            }
            'l' if adding => {
                let raw = need_arg('l')?;
                let limit = raw
                    .parse::<u32>()
                    .map_err(|_| Error::Channel(format!("Invalid limit {}", raw)))?;
                changes.push(ModeChange::Limit(Some(limit)));
            }
            'l' => changes.push(ModeChange::Limit(None)),
            m if PARAM_MODES.contains(m) => {
                let value = if adding { Some(need_arg(m)?) } else { None };
                changes.push(ModeChange::Param { mode: m, value });
            }
            m if MEMBER_MODES.contains(m) => {
                changes.push(ModeChange::Member { adding, mode: m, target: need_arg(m)? });
            }
            m if LIST_MODES.contains(m) => {
                changes.push(ModeChange::List { adding, mode: m, mask: need_arg(m)? });
            }
            other => return Err(Error::Channel(format!("Unknown channel mode {}", other))),
        }
    }

    Ok(changes)
}

/// Per-channel privileges of one member
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemberFlags {
    /// Channel operator
    pub opped: bool,
    /// Voiced
    pub voiced: bool,
    /// Joined with op on the wire but lost it to a TS merge
    pub deopped: bool,
}

impl MemberFlags {
    /// Flags for an operator
    pub const OP: MemberFlags = MemberFlags { opped: true, voiced: false, deopped: false };

    /// Split an SJOIN entry like `@+42XAAAAAA` into flags and UID
    pub fn parse_prefixed(entry: &str) -> (MemberFlags, &str) {
        let mut flags = MemberFlags::default();
        let mut rest = entry;

        while let Some(c) = rest.chars().next() {
            match c {
                '@' => flags.opped = true,
                '+' => flags.voiced = true,
                '%' | '!' | '~' | '&' | '.' => {}
                _ => break,
            }
            rest = &rest[c.len_utf8()..];
        }

        (flags, rest)
    }

    /// Flags after losing a TS merge: op becomes an explicit deop, voice is dropped
    pub fn downgraded(self) -> MemberFlags {
        MemberFlags {
            opped: false,
            voiced: false,
            deopped: self.opped,
        }
    }

    /// Wire prefix, `@`, `+` or both
    pub fn prefix(&self) -> &'static str {
        match (self.opped, self.voiced) {
            (true, true) => "@+",
            (true, false) => "@",
            (false, true) => "+",
            (false, false) => "",
        }
    }
}

/// Which message drove a merge; SJOIN also resets list modes when it wins
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BurstKind {
    Join,
    Sjoin,
}

/// How a merge was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsOutcome {
    /// Channel did not exist and was created with the incoming state
    Created,
    /// Timestamps matched (or one was zero); state merged additively
    Merged,
    /// Incoming TS was lower; local modes and privileges were wiped
    IncomingWins,
    /// Local TS was lower; incoming modes ignored, privileges downgraded
    LocalWins,
}

impl TsOutcome {
    /// Flags to apply to an incoming member under this outcome
    pub fn member_flags(self, flags: MemberFlags) -> MemberFlags {
        match self {
            TsOutcome::LocalWins => flags.downgraded(),
            _ => flags,
        }
    }
}

/// A channel
#[derive(Debug, Clone)]
pub struct Channel {
    /// Channel name as first seen
    pub name: String,
    /// Creation timestamp
    pub ts: i64,
    /// Current modes
    pub modes: ChannelModes,
    /// Topic text, empty when unset
    pub topic: String,
    /// Who set the topic
    pub topic_setter: String,
    /// When the topic was set
    pub topic_ts: i64,
    /// Network users in the channel, by UID
    pub members: FxHashMap<String, MemberFlags>,
    /// Our own services in the channel, by UID
    pub services: BTreeSet<String>,
    /// Ban masks
    pub bans: Vec<String>,
    /// Ban exception masks
    pub excepts: Vec<String>,
    /// Invite exception masks
    pub invex: Vec<String>,
}

impl Channel {
    /// Create a new, empty channel
    pub fn new(name: &str, ts: i64, modes: ChannelModes) -> Self {
        Self {
            name: name.to_string(),
            ts,
            modes,
            topic: String::new(),
            topic_setter: String::new(),
            topic_ts: 0,
            members: FxHashMap::default(),
            services: BTreeSet::new(),
            bans: Vec::new(),
            excepts: Vec::new(),
            invex: Vec::new(),
        }
    }

    /// A channel with neither users nor services must not exist
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.services.is_empty()
    }

    /// Resolve an incoming TS and mode set against local state
    pub fn resolve_ts(&mut self, new_ts: i64, incoming: &ChannelModes, kind: BurstKind) -> TsOutcome {
        // A zero on either side merges as equal; kept for compatibility with
        // peers that send TS 0 for channels they hold no authority over.
        if new_ts == 0 || self.ts == 0 {
            self.ts = 0;
            self.modes.merge(incoming);
            return TsOutcome::Merged;
        }

        if new_ts < self.ts {
            self.ts = new_ts;
            self.modes = incoming.clone();
            for flags in self.members.values_mut() {
                *flags = MemberFlags::default();
            }
            if kind == BurstKind::Sjoin {
                self.bans.clear();
                self.excepts.clear();
                self.invex.clear();
            }
            return TsOutcome::IncomingWins;
        }

        if new_ts > self.ts {
            return TsOutcome::LocalWins;
        }

        self.modes.merge(incoming);
        TsOutcome::Merged
    }

    /// Apply parsed mode changes; member changes for non-members are skipped
    pub fn apply_changes(&mut self, changes: &[ModeChange]) -> usize {
        let mut applied = 0;

        for change in changes {
            match change {
                ModeChange::Simple { adding: true, mode } => {
                    self.modes.simple.insert(*mode);
                }
                ModeChange::Simple { adding: false, mode } => {
                    self.modes.simple.remove(mode);
                }
                ModeChange::Key(key) => self.modes.key = key.clone(),
                ModeChange::Limit(limit) => self.modes.limit = *limit,
                ModeChange::Param { mode, value: Some(value) } => {
                    self.modes.params.insert(*mode, value.clone());
                }
                ModeChange::Param { mode, value: None } => {
                    self.modes.params.remove(mode);
                }
                ModeChange::Member { adding, mode, target } => {
                    let Some(flags) = self.members.get_mut(target) else {
                        continue;
                    };
                    match mode {
                        'o' => {
                            flags.opped = *adding;
                            flags.deopped = !*adding;
                        }
                        _ => flags.voiced = *adding,
                    }
                }
                ModeChange::List { adding, mode, mask } => {
                    let list = self.list_mut(*mode);
                    let present = list.iter().any(|m| m == mask);
                    if *adding && !present {
                        list.push(mask.clone());
                    } else if !*adding && present {
                        list.retain(|m| m != mask);
                    } else {
                        continue;
                    }
                }
            }
            applied += 1;
        }

        applied
    }

    /// The list behind a list mode letter
    pub fn list_mut(&mut self, mode: char) -> &mut Vec<String> {
        match mode {
            'e' => &mut self.excepts,
            'I' => &mut self.invex,
            _ => &mut self.bans,
        }
    }

    /// Set the topic
    pub fn set_topic(&mut self, topic: &str, setter: &str, ts: i64) {
        self.topic = topic.to_string();
        self.topic_setter = setter.to_string();
        self.topic_ts = ts;
    }

    /// Whether a topic burst at `burst_ts` may replace the current topic
    ///
    /// A burst loses only to a non-empty topic stored with an older stamp.
    pub fn accepts_topic_burst(&self, burst_ts: i64) -> bool {
        self.topic.is_empty() || self.topic_ts >= burst_ts
    }
}

/// Channel index keyed by case-folded name
#[derive(Debug, Default)]
pub struct Channels {
    map: FxHashMap<String, Channel>,
}

impl Channels {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a channel by name
    pub fn get(&self, name: &str) -> Option<&Channel> {
        self.map.get(&irc_to_lower(name))
    }

    /// Find a channel by name for modification
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.map.get_mut(&irc_to_lower(name))
    }

    /// Insert a channel, returning it
    pub fn insert(&mut self, channel: Channel) -> &mut Channel {
        let key = irc_to_lower(&channel.name);
        self.map.entry(key).or_insert(channel)
    }

    /// Remove a channel by name
    pub fn remove(&mut self, name: &str) -> Option<Channel> {
        self.map.remove(&irc_to_lower(name))
    }

    /// Check if a channel exists
    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(&irc_to_lower(name))
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Check if there are no channels
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over channels in no particular order
    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.map.values()
    }

    /// Folded names of every channel
    pub fn keys(&self) -> Vec<String> {
        self.map.keys().cloned().collect()
    }
}
