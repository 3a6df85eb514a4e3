//! Command dispatch registry
//!
//! Maps command names to one primary handler plus an ordered list of hooks.
//! Names are matched case-insensitively through a fixed bucket table; the
//! command set is small and static, so a linear scan per bucket is enough.

use crate::session::{Session, Source};
use crate::Result;
use std::fmt;
use std::sync::Arc;

/// Number of hash buckets
const BUCKETS: usize = 64;

/// Something that can handle a command: a primary handler or a hook
pub trait CommandHandler: Send + Sync {
    /// Handle one command from `source`
    fn handle(&self, session: &mut Session, source: &Source, params: &[String]) -> Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&mut Session, &Source, &[String]) -> Result<()> + Send + Sync,
{
    fn handle(&self, session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
        self(session, source, params)
    }
}

/// Handler flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandFlags {
    /// Callable before the remote identity is known
    pub pre_registration: bool,
}

impl CommandFlags {
    /// No special flags
    pub const NONE: CommandFlags = CommandFlags { pre_registration: false };
    /// Callable during the handshake, from an unresolved source
    pub const PRE_REGISTRATION: CommandFlags = CommandFlags { pre_registration: true };
}

/// Handle returned by [`CommandRegistry::add_hook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

struct Entry {
    name: String,
    flags: CommandFlags,
    handler: Arc<dyn CommandHandler>,
    hooks: Vec<(HookId, Arc<dyn CommandHandler>)>,
}

/// Everything needed to run one command, detached from the registry
///
/// Cloned out before running so handlers can take `&mut Session`.
#[derive(Clone)]
pub struct Dispatch {
    /// Registered name
    pub name: String,
    /// Handler flags
    pub flags: CommandFlags,
    /// Primary handler
    pub handler: Arc<dyn CommandHandler>,
    /// Hooks, in registration order
    pub hooks: Vec<Arc<dyn CommandHandler>>,
}

impl Dispatch {
    /// Run the primary handler, then every hook with the same arguments
    ///
    /// A failing handler is reported but hooks still observe the command.
    pub fn run(&self, session: &mut Session, source: &Source, params: &[String]) -> Result<()> {
        let result = self.handler.handle(session, source, params);

        for hook in &self.hooks {
            if let Err(e) = hook.handle(session, source, params) {
                tracing::warn!("Hook for {} failed: {}", self.name, e);
            }
        }

        result
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Case-insensitive command table
pub struct CommandRegistry {
    buckets: Vec<Vec<Entry>>,
    next_hook: u64,
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("commands", &self.commands())
            .finish()
    }
}

fn bucket_of(name: &str) -> usize {
    let hash = name
        .bytes()
        .fold(0usize, |h, b| h.wrapping_mul(31).wrapping_add(b.to_ascii_uppercase() as usize));
    hash % BUCKETS
}

impl CommandRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| Vec::new()).collect(),
            next_hook: 0,
        }
    }

    fn entry(&self, name: &str) -> Option<&Entry> {
        self.buckets[bucket_of(name)]
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Entry> {
        self.buckets[bucket_of(name)]
            .iter_mut()
            .find(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Register the primary handler for a command
    ///
    /// # Panics
    /// If the command is already registered.
    pub fn register<H>(&mut self, name: &str, flags: CommandFlags, handler: H)
    where
        H: CommandHandler + 'static,
    {
        assert!(self.entry(name).is_none(), "command {} registered twice", name);

        self.buckets[bucket_of(name)].push(Entry {
            name: name.to_ascii_uppercase(),
            flags,
            handler: Arc::new(handler),
            hooks: Vec::new(),
        });
    }

    /// Attach a hook that runs after the primary handler
    ///
    /// # Panics
    /// If the command is not registered.
    pub fn add_hook<H>(&mut self, name: &str, hook: H) -> HookId
    where
        H: CommandHandler + 'static,
    {
        let id = HookId(self.next_hook);
        self.next_hook += 1;

        let Some(entry) = self.entry_mut(name) else {
            panic!("add_hook for unknown command {}", name);
        };
        entry.hooks.push((id, Arc::new(hook)));
        id
    }

    /// Detach a hook
    ///
    /// # Panics
    /// If the command or the hook is not registered.
    pub fn remove_hook(&mut self, name: &str, id: HookId) {
        let Some(entry) = self.entry_mut(name) else {
            panic!("remove_hook for unknown command {}", name);
        };

        let Some(pos) = entry.hooks.iter().position(|(h, _)| *h == id) else {
            panic!("remove_hook: {:?} is not attached to {}", id, name);
        };
        entry.hooks.remove(pos);
    }

    /// Look up a command
    pub fn lookup(&self, name: &str) -> Option<Dispatch> {
        self.entry(name).map(|entry| Dispatch {
            name: entry.name.clone(),
            flags: entry.flags,
            handler: Arc::clone(&entry.handler),
            hooks: entry.hooks.iter().map(|(_, h)| Arc::clone(h)).collect(),
        })
    }

    /// Check if a command is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// Registered command names, sorted
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter().map(|e| e.name.clone()))
            .collect();
        names.sort();
        names
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    /// Check if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::{ConnId, Origin};
    use parking_lot::Mutex;

    fn noop(_: &mut Session, _: &Source, _: &[String]) -> Result<()> {
        Ok(())
    }

    fn source() -> Source {
        Source {
            conn: ConnId(1),
            origin: Origin::Unresolved(String::new()),
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let mut registry = CommandRegistry::new();
        registry.register("JOIN", CommandFlags::NONE, noop);

        for name in ["JOIN", "join", "Join"] {
            assert_eq!(registry.lookup(name).unwrap().name, "JOIN");
        }
        assert!(registry.lookup("JOINX").is_none());
    }

    #[test]
    fn test_hooks_fire_after_handler_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut registry = CommandRegistry::new();

        let c = Arc::clone(&calls);
        registry.register("JOIN", CommandFlags::NONE, move |_: &mut Session, _: &Source, _: &[String]| -> Result<()> {
            c.lock().push("handler");
            Ok(())
        });
        for tag in ["first", "second"] {
            let c = Arc::clone(&calls);
            registry.add_hook("join", move |_: &mut Session, _: &Source, _: &[String]| -> Result<()> {
                c.lock().push(tag);
                Ok(())
            });
        }

        let mut session = Session::new(Config::default());
        for name in ["join", "Join", "JOIN"] {
            let dispatch = registry.lookup(name).unwrap();
            dispatch.run(&mut session, &source(), &[]).unwrap();
        }

        let expected: Vec<&str> = ["handler", "first", "second"].repeat(3);
        assert_eq!(*calls.lock(), expected);
    }

    #[test]
    fn test_remove_hook() {
        let mut registry = CommandRegistry::new();
        registry.register("PART", CommandFlags::NONE, noop);
        let a = registry.add_hook("PART", noop);
        let b = registry.add_hook("PART", noop);

        registry.remove_hook("part", a);
        assert_eq!(registry.lookup("PART").unwrap().hooks.len(), 1);
        registry.remove_hook("PART", b);
        assert!(registry.lookup("PART").unwrap().hooks.is_empty());
    }

    #[test]
    #[should_panic(expected = "unknown command")]
    fn test_add_hook_unknown_command_panics() {
        let mut registry = CommandRegistry::new();
        registry.add_hook("NOPE", noop);
    }

    #[test]
    #[should_panic(expected = "is not attached")]
    fn test_remove_missing_hook_panics() {
        let mut registry = CommandRegistry::new();
        registry.register("KICK", CommandFlags::NONE, noop);
        let id = registry.add_hook("KICK", noop);
        registry.remove_hook("KICK", id);
        registry.remove_hook("KICK", id);
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let mut registry = CommandRegistry::new();
        registry.register("PASS", CommandFlags::PRE_REGISTRATION, noop);
        registry.register("pass", CommandFlags::NONE, noop);
    }

    #[test]
    fn test_many_commands_share_buckets() {
        let mut registry = CommandRegistry::new();
        let names: Vec<String> = (0..200).map(|i| format!("CMD{}", i)).collect();
        for name in &names {
            registry.register(name, CommandFlags::NONE, noop);
        }

        assert_eq!(registry.len(), 200);
        for name in &names {
            assert!(registry.contains(&name.to_lowercase()));
        }
    }
}
