use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use tracing::warn;

use crate::attr::KindSchema;
use crate::attr::Schemas;
use crate::events::Event;
use crate::events::EventBus;
use crate::events::Outcome;
use crate::events::isolate;
use crate::fabric::Message;
use crate::pulse::PulseDef;
use crate::shell::{Command, ResolvePolicy, ShellDef, ShellFrame};
use crate::world::World;

pub type MessageFn =
    Box<dyn Fn(&Registry, &mut World, &Message) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    channel: String,
    handler: &'static str,
    f: MessageFn,
}

/// Everything registered at startup: kinds, shells, global commands, event
/// handlers, pulse callbacks and fabric subscriptions. Immutable once built
/// and handed by reference to whatever needs it.
pub struct Registry {
    schemas: Arc<Schemas>,
    events: EventBus,
    shells: HashMap<&'static str, ShellDef>,
    globals: ShellDef,
    base_shell: &'static str,
    policy: ResolvePolicy,
    pulses: Vec<PulseDef>,
    subscriptions: Vec<Subscription>,
}

impl Registry {
    pub fn fire(&self, world: &mut World, ev: Event) -> Outcome {
        self.events.dispatch(self, world, ev)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn schemas(&self) -> &Arc<Schemas> {
        &self.schemas
    }

    pub fn shell(&self, name: &str) -> Option<&ShellDef> {
        self.shells.get(name)
    }

    pub fn base_shell(&self) -> &'static str {
        self.base_shell
    }

    pub fn policy(&self) -> ResolvePolicy {
        self.policy
    }

    /// Find the command for `verb`: the top shell first, then (only under
    /// `FallbackToParents`) the shells beneath it, then the globals.
    pub fn resolve(&self, stack: &[ShellFrame], verb: &str) -> Option<&Command> {
        let mut frames = stack.iter().rev();
        if let Some(top) = frames.next() {
            if let Some(c) = self.shell(top.name).and_then(|s| s.lookup(verb)) {
                return Some(c);
            }
            if self.policy == ResolvePolicy::FallbackToParents {
                for f in frames {
                    if let Some(c) = self.shell(f.name).and_then(|s| s.lookup(verb)) {
                        return Some(c);
                    }
                }
            }
        }
        self.globals.lookup(verb)
    }

    /// What `help` lists for a stack, in resolution order without shadowed
    /// duplicates.
    pub fn reachable(&self, stack: &[ShellFrame]) -> Vec<&Command> {
        let depth = match self.policy {
            ResolvePolicy::TopmostOnly => 1,
            ResolvePolicy::FallbackToParents => stack.len(),
        };
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let shells = stack
            .iter()
            .rev()
            .take(depth)
            .filter_map(|f| self.shell(f.name))
            .chain(std::iter::once(&self.globals));
        for sh in shells {
            for c in sh.commands() {
                if seen.insert(c.name()) {
                    out.push(c);
                }
            }
        }
        out
    }

    pub fn pulses(&self) -> &[PulseDef] {
        &self.pulses
    }

    /// Channels with at least one subscriber, deduplicated.
    pub fn channels(&self) -> BTreeSet<&str> {
        self.subscriptions.iter().map(|s| s.channel.as_str()).collect()
    }

    /// Run the fabric handlers for one message; failures are isolated like
    /// event handlers.
    pub fn deliver(&self, world: &mut World, msg: &Message) -> usize {
        let mut ran = 0;
        for s in self.subscriptions.iter().filter(|s| s.channel == msg.channel) {
            ran += 1;
            if let Err(e) = isolate(|| (s.f)(self, world, msg)) {
                warn!(channel = %msg.channel, handler = s.handler, err = %format!("{e:#}"), "fabric handler failed");
            }
        }
        ran
    }
}

pub struct RegistryBuilder {
    schemas: Schemas,
    events: EventBus,
    shells: Vec<ShellDef>,
    globals: ShellDef,
    base_shell: &'static str,
    policy: ResolvePolicy,
    pulses: Vec<PulseDef>,
    subscriptions: Vec<Subscription>,
    errors: Vec<String>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            schemas: Schemas::new(),
            events: EventBus::default(),
            shells: Vec::new(),
            globals: ShellDef::new("global"),
            base_shell: "login",
            policy: ResolvePolicy::TopmostOnly,
            pulses: Vec::new(),
            subscriptions: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn kind(&mut self, schema: KindSchema) -> &mut Self {
        let kind = schema.kind();
        if let Err(e) = self.schemas.register(schema) {
            self.errors.push(format!("kind {kind}: {e}"));
        }
        self
    }

    pub fn shell(&mut self, shell: ShellDef) -> &mut Self {
        if self.shells.iter().any(|s| s.name() == shell.name()) {
            self.errors.push(format!("shell {} registered twice", shell.name()));
        } else {
            self.shells.push(shell);
        }
        self
    }

    /// A command reachable from every shell depth.
    pub fn global(&mut self, c: Command) -> &mut Self {
        let globals = std::mem::replace(&mut self.globals, ShellDef::new("global"));
        self.globals = globals.command(c);
        self
    }

    pub fn on<F>(&mut self, event: &str, handler: &'static str, priority: i32, f: F) -> &mut Self
    where
        F: Fn(&Registry, &mut World, &mut Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.register(event, handler, priority, f);
        self
    }

    /// Run `f` every `interval` ticks. Callbacks due on the same tick run in
    /// registration order.
    pub fn every<F>(&mut self, owner: &'static str, name: &'static str, interval: u64, f: F) -> &mut Self
    where
        F: Fn(&Registry, &mut World) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        if interval == 0 {
            self.errors.push(format!("pulse {owner}/{name}: interval must be at least 1"));
            return self;
        }
        self.pulses.push(PulseDef::new(owner, name, interval, f));
        self
    }

    pub fn on_message<F>(&mut self, channel: &str, handler: &'static str, f: F) -> &mut Self
    where
        F: Fn(&Registry, &mut World, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscriptions.push(Subscription {
            channel: channel.to_string(),
            handler,
            f: Box::new(f),
        });
        self
    }

    pub fn base_shell(&mut self, name: &'static str) -> &mut Self {
        self.base_shell = name;
        self
    }

    pub fn resolve_policy(&mut self, policy: ResolvePolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> anyhow::Result<Registry> {
        if let Some(first) = self.errors.first() {
            bail!("{} registration error(s), first: {first}", self.errors.len());
        }
        // Globals answer at every depth, so no shell may claim their words.
        for sh in &self.shells {
            if let Some(verb) = sh.verbs().find(|v| self.globals.lookup(v).is_some()) {
                bail!("shell {:?} command {verb:?} collides with a global command", sh.name());
            }
        }
        if !self.shells.is_empty() && !self.shells.iter().any(|s| s.name() == self.base_shell) {
            bail!("base shell {:?} is not registered", self.base_shell);
        }
        Ok(Registry {
            schemas: Arc::new(self.schemas),
            events: self.events,
            shells: self.shells.into_iter().map(|s| (s.name(), s)).collect(),
            globals: self.globals,
            base_shell: self.base_shell,
            policy: self.policy,
            pulses: self.pulses,
            subscriptions: self.subscriptions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mudwire::ConnId;

    fn noop(name: &'static str) -> Command {
        Command::new(name, name, |_, _, _| Ok(()))
    }

    fn builder() -> RegistryBuilder {
        let mut b = RegistryBuilder::new();
        b.shell(ShellDef::new("login").command(noop("connect")).command(noop("look")))
            .shell(ShellDef::new("play").command(noop("say")))
            .global(noop("quit"))
            .global(noop("help"));
        b
    }

    fn stack(names: &[&'static str]) -> Vec<ShellFrame> {
        names
            .iter()
            .map(|&name| ShellFrame {
                name,
                owner: ConnId(1),
            })
            .collect()
    }

    #[test]
    fn topmost_only_ignores_parent_shells() {
        let reg = builder().build().unwrap();
        let st = stack(&["login", "play"]);
        assert_eq!(reg.resolve(&st, "say").map(Command::name), Some("say"));
        assert!(reg.resolve(&st, "connect").is_none());
        assert_eq!(reg.resolve(&st, "quit").map(Command::name), Some("quit"));
        let names: Vec<_> = reg.reachable(&st).iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["say", "help", "quit"]);
    }

    #[test]
    fn fallback_policy_searches_down_the_stack() {
        let mut b = builder();
        b.resolve_policy(ResolvePolicy::FallbackToParents);
        let reg = b.build().unwrap();
        let st = stack(&["login", "play"]);
        assert_eq!(reg.resolve(&st, "connect").map(Command::name), Some("connect"));
        assert_eq!(reg.reachable(&st).len(), 5);
    }

    #[test]
    fn build_reports_registration_mistakes() {
        let mut b = builder();
        b.shell(ShellDef::new("play"));
        assert!(b.build().is_err());

        let mut b = RegistryBuilder::new();
        b.shell(ShellDef::new("menu")).base_shell("login");
        assert!(b.build().is_err());

        let mut b = RegistryBuilder::new();
        b.every("test", "never", 0, |_, _| Ok(()));
        assert!(b.build().is_err());
    }

    #[test]
    fn shell_words_cannot_shadow_globals() {
        let mut b = builder();
        b.shell(ShellDef::new("menu").command(noop("quit")));
        let err = b.build().err().unwrap().to_string();
        assert!(err.contains("\"quit\""), "{err}");

        let mut b = builder();
        b.shell(ShellDef::new("menu").command(noop("exit").alias("help")));
        assert!(b.build().is_err());

        // Registering the global after the shell is caught too.
        let mut b = RegistryBuilder::new();
        b.shell(ShellDef::new("login").command(noop("who")))
            .global(noop("who"));
        assert!(b.build().is_err());
    }
}
