//! Command tables and line tokenizing.
//!
//! A shell is a named command table with a prompt. Sessions keep a stack of
//! shell frames; only the top frame (plus the global commands) is consulted
//! when a line comes in.

use std::collections::BTreeMap;

use mudwire::ConnId;

use crate::error::CommandError;
use crate::events::isolate;
use crate::registry::Registry;
use crate::world::World;

pub type CommandFn =
    Box<dyn Fn(&Registry, &mut World, &Invocation) -> Result<(), CommandError> + Send + Sync>;

pub struct Command {
    name: &'static str,
    aliases: Vec<&'static str>,
    usage: &'static str,
    f: CommandFn,
}

impl Command {
    /// `usage` is shown by `help` and when the command reports a usage error.
    pub fn new<F>(name: &'static str, usage: &'static str, f: F) -> Self
    where
        F: Fn(&Registry, &mut World, &Invocation) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self {
            name,
            aliases: Vec::new(),
            usage,
            f: Box::new(f),
        }
    }

    pub fn alias(mut self, alias: &'static str) -> Self {
        self.aliases.push(alias);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn usage(&self) -> &'static str {
        self.usage
    }

    pub(crate) fn run(
        &self,
        reg: &Registry,
        world: &mut World,
        inv: &Invocation,
    ) -> Result<(), CommandError> {
        isolate(|| (self.f)(reg, world, inv))
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ShellDef {
    name: &'static str,
    prompt: &'static str,
    commands: Vec<Command>,
    index: BTreeMap<&'static str, usize>,
}

impl ShellDef {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            prompt: "> ",
            commands: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    pub fn prompt(mut self, prompt: &'static str) -> Self {
        self.prompt = prompt;
        self
    }

    /// Later registrations of the same verb replace earlier ones.
    pub fn command(mut self, c: Command) -> Self {
        let i = self.commands.len();
        self.index.insert(c.name, i);
        for &a in &c.aliases {
            self.index.insert(a, i);
        }
        self.commands.push(c);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn prompt_text(&self) -> &'static str {
        self.prompt
    }

    pub fn lookup(&self, verb: &str) -> Option<&Command> {
        self.index.get(verb).map(|&i| &self.commands[i])
    }

    /// Every word this shell answers to, aliases included.
    pub fn verbs(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.index.keys().copied()
    }

    /// Commands by name, aliases folded in.
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.index
            .iter()
            .filter(|(k, i)| self.commands[**i].name == **k)
            .map(|(_, i)| &self.commands[*i])
    }
}

/// Whether a verb missing from the top shell is looked up further down the
/// stack before the global commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResolvePolicy {
    #[default]
    TopmostOnly,
    FallbackToParents,
}

/// One shell on a session's stack. Refers back to its session by connection
/// id only, so it can never keep a closed session alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShellFrame {
    pub name: &'static str,
    pub owner: ConnId,
}

/// A tokenized input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub conn: ConnId,
    /// Lowercased command word.
    pub verb: String,
    /// Everything after the verb, trimmed, quotes untouched.
    pub rest: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// `None` for blank lines.
    pub fn parse(conn: ConnId, line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (verb, rest) = match line.find(char::is_whitespace) {
            Some(i) => (&line[..i], line[i..].trim()),
            None => (line, ""),
        };
        Some(Self {
            conn,
            verb: verb.to_lowercase(),
            rest: rest.to_string(),
            args: split_args(rest),
        })
    }

    pub fn arg(&self, i: usize) -> Option<&str> {
        self.args.get(i).map(String::as_str)
    }
}

/// Whitespace separated words; a word opening with `"`, `'` or `` ` `` runs
/// to the matching quote (or the end of the line).
pub fn split_args(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        let mut word = String::new();
        if matches!(c, '"' | '\'' | '`') {
            chars.next();
            for ch in chars.by_ref() {
                if ch == c {
                    break;
                }
                word.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() {
                    break;
                }
                word.push(ch);
                chars.next();
            }
        }
        out.push(word);
    }
    out
}
