//! Mutable game state and the session lifecycle that drives it.
//!
//! Everything here runs on the control-loop thread. Each entry point
//! (`connect`, `handle_line`, `disconnect`, pulse callbacks) finishes all of
//! its effects, nested events included, before returning.

use std::time::Instant;

use mudwire::ConnId;
use serde_json::Value as Json;
use tracing::{debug, info, warn};

use crate::attr::Value;
use crate::entity::EntityId;
use crate::error::{CommandError, Error, SessionError};
use crate::events::{
    ENTITY_ATTR_CHANGED, ENTITY_DELETED, ENTITY_SAVED, Event, SESSION_ACTIVE, SESSION_CLOSED,
    SESSION_LIMBO, SESSION_STARTED,
};
use crate::fabric::Outbox;
use crate::registry::Registry;
use crate::session::{Session, SessionState, Sessions};
use crate::shell::Invocation;
use crate::store::{EntityStore, SaveReport};

pub const UNKNOWN_COMMAND: &str = "Unknown command.";
pub const COMMAND_FAILED: &str = "Something went wrong; the problem has been logged.";
pub const IDLE_WARNING: &str = "You have been idle for a while.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub rehome_ticks: u64,
    pub idle_ticks: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            rehome_ticks: 300,
            idle_ticks: 1800,
        }
    }
}

/// Something for the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Output { conn: ConnId, text: String },
    Close { conn: ConnId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Login {
    Fresh,
    /// A LIMBO session for the account was taken over.
    Resumed,
}

pub struct World {
    pub store: EntityStore,
    pub sessions: Sessions,
    node: String,
    tick: u64,
    limits: Limits,
    outbound: Vec<Outbound>,
    fabric_out: Outbox,
}

impl World {
    pub fn new(node: impl Into<String>, store: EntityStore, limits: Limits, fabric_out: Outbox) -> Self {
        Self {
            store,
            sessions: Sessions::default(),
            node: node.into(),
            tick: 0,
            limits,
            outbound: Vec::new(),
            fabric_out,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub(crate) fn set_tick(&mut self, tick: u64) {
        self.tick = tick;
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Queue a line for a session. Dropped for sessions without a transport.
    pub fn send(&mut self, conn: ConnId, text: impl Into<String>) {
        match self.sessions.get_mut(conn) {
            Some(s) if matches!(s.state(), SessionState::Connecting | SessionState::Active) => {
                s.send(text)
            }
            _ => debug!(conn = %conn, "dropping output for detached session"),
        }
    }

    /// Queue a fabric publish; it goes out on the next flush.
    pub fn publish(&mut self, channel: &str, body: Json) -> bool {
        self.fabric_out.push(channel, body)
    }

    pub(crate) fn outbox_next_retry(&self) -> Option<Instant> {
        self.fabric_out.next_retry()
    }

    pub(crate) fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.fabric_out
    }

    /// Typed attribute write, announced with `entity.attr_changed`.
    pub fn set_attr(
        &mut self,
        reg: &Registry,
        id: EntityId,
        name: &str,
        v: impl Into<Value>,
    ) -> Result<(), Error> {
        let v = v.into();
        let old = self.store.set(id, name, v.clone())?;
        if old != v {
            reg.fire(
                self,
                Event::post(ENTITY_ATTR_CHANGED)
                    .with_entity("entity", id)
                    .with("attr", name),
            );
        }
        Ok(())
    }

    pub fn save_entity(&mut self, reg: &Registry, id: EntityId) -> Result<bool, Error> {
        let saved = self.store.save(id)?;
        if saved {
            let kind = self.store.get(id).map(|e| e.kind().to_string()).unwrap_or_default();
            reg.fire(self, Event::post(ENTITY_SAVED).with_entity("entity", id).with("kind", kind));
        }
        Ok(saved)
    }

    pub fn save_dirty(&mut self, reg: &Registry) -> SaveReport {
        let mut report = SaveReport::default();
        for id in self.store.dirty_ids() {
            match self.save_entity(reg, id) {
                Ok(_) => report.saved += 1,
                Err(e) => {
                    warn!(entity = %self.store.label(id), err = %e, "save failed; entity stays dirty");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        report
    }

    pub fn delete_entity(&mut self, reg: &Registry, id: EntityId) -> Result<(), Error> {
        let e = self.store.delete(id)?;
        reg.fire(
            self,
            Event::post(ENTITY_DELETED)
                .with_entity("entity", id)
                .with("kind", e.kind()),
        );
        Ok(())
    }

    /// Gateway announced a transport. A LIMBO session already waiting under
    /// this connection id is rehomed; otherwise a new session starts.
    pub fn connect(&mut self, reg: &Registry, conn: ConnId, remote: &str) {
        let tick = self.tick;
        if let Some(s) = self.sessions.get_mut(conn) {
            if s.state() != SessionState::Limbo {
                debug!(conn = %conn, "duplicate connect ignored");
                return;
            }
            if let Err(e) = s.rehome(conn, remote, tick) {
                warn!(conn = %conn, err = %e, "rehome failed");
                return;
            }
            let Some(account) = s.account().map(|a| a.encode()) else {
                info!(conn = %conn, "login-stage session rehomed");
                return;
            };
            info!(conn = %conn, "session rehomed");
            reg.fire(
                self,
                Event::post(SESSION_ACTIVE)
                    .with("conn", conn.to_string())
                    .with("account", account)
                    .with("resumed", true),
            );
            return;
        }

        self.sessions
            .insert(Session::new(conn, remote, reg.base_shell(), tick));
        info!(conn = %conn, remote, "session started");
        reg.fire(
            self,
            Event::post(SESSION_STARTED)
                .with("conn", conn.to_string())
                .with("remote", remote),
        );
    }

    /// Transport gone: ACTIVE sessions wait in LIMBO, unauthenticated ones close.
    pub fn disconnect(&mut self, reg: &Registry, conn: ConnId) {
        let Some(state) = self.sessions.get(conn).map(Session::state) else {
            return;
        };
        match state {
            SessionState::Connecting => self.close_session(reg, conn, None),
            SessionState::Active => self.detach(reg, conn, "transport lost"),
            SessionState::Limbo | SessionState::Closed => {}
        }
    }

    fn detach(&mut self, reg: &Registry, conn: ConnId, reason: &str) {
        let tick = self.tick;
        let Some(s) = self.sessions.get_mut(conn) else {
            return;
        };
        if let Err(e) = s.detach(tick) {
            warn!(conn = %conn, err = %e, "detach refused");
            return;
        }
        info!(conn = %conn, reason, "session in limbo");
        reg.fire(
            self,
            Event::post(SESSION_LIMBO)
                .with("conn", conn.to_string())
                .with("reason", reason),
        );
    }

    /// Move every live session off its transport: ACTIVE to LIMBO,
    /// CONNECTING closed. Returns how many went to LIMBO.
    pub fn detach_all(&mut self, reg: &Registry, reason: &str) -> usize {
        for conn in self.sessions.in_state(SessionState::Connecting) {
            self.close_session(reg, conn, None);
        }
        let active = self.sessions.in_state(SessionState::Active);
        for &conn in &active {
            self.detach(reg, conn, reason);
        }
        active.len()
    }

    /// Park every live session for a reload handoff. Unlike
    /// [`World::detach_all`] nothing is closed: the transports stay with the
    /// gateway and the successor picks them up. Returns how many were parked.
    pub fn park_all(&mut self, reg: &Registry, reason: &str) -> usize {
        let tick = self.tick;
        let connecting = self.sessions.in_state(SessionState::Connecting);
        for &conn in &connecting {
            if let Some(s) = self.sessions.get_mut(conn) {
                if let Err(e) = s.hold(tick) {
                    warn!(conn = %conn, err = %e, "hold refused");
                }
            }
        }
        let active = self.sessions.in_state(SessionState::Active);
        for &conn in &active {
            self.detach(reg, conn, reason);
        }
        connecting.len() + active.len()
    }

    /// Authenticate a CONNECTING session. If the account has a session in
    /// LIMBO, that session (shell stack, avatar) moves onto this transport
    /// and `avatar` is ignored.
    pub fn login(
        &mut self,
        reg: &Registry,
        conn: ConnId,
        account: EntityId,
        avatar: Option<EntityId>,
    ) -> Result<Login, Error> {
        let tick = self.tick;
        let state = self.sessions.require(conn)?.state();
        if state != SessionState::Connecting {
            return Err(SessionError::IllegalTransition {
                conn,
                from: state,
                to: SessionState::Active,
            }
            .into());
        }
        if self.sessions.active_for(account).is_some() {
            return Err(SessionError::AccountInUse(account).into());
        }

        let outcome = match self.sessions.limbo_for(account) {
            Some(old_conn) => {
                let fresh = self.sessions.remove(conn).ok_or(SessionError::UnknownConn(conn))?;
                let Some(mut old) = self.sessions.remove(old_conn) else {
                    self.sessions.insert(fresh);
                    return Err(SessionError::UnknownConn(old_conn).into());
                };
                old.rehome(conn, fresh.remote(), tick)?;
                let mut fresh = fresh;
                for line in fresh.take_output() {
                    old.send(line);
                }
                self.sessions.insert(old);
                info!(conn = %conn, from = %old_conn, account = %account, "link-dead session resumed");
                Login::Resumed
            }
            None => {
                let s = self.sessions.require(conn)?;
                s.authenticate(account)?;
                s.set_avatar(avatar);
                info!(conn = %conn, account = %account, "session active");
                Login::Fresh
            }
        };
        reg.fire(
            self,
            Event::post(SESSION_ACTIVE)
                .with("conn", conn.to_string())
                .with("account", account.encode())
                .with("resumed", outcome == Login::Resumed),
        );
        Ok(outcome)
    }

    pub fn push_shell(&mut self, reg: &Registry, conn: ConnId, name: &str) -> Result<(), Error> {
        let def = reg
            .shell(name)
            .ok_or_else(|| SessionError::UnknownShell(name.to_string()))?;
        self.sessions.require(conn)?.push_shell(def.name());
        Ok(())
    }

    pub fn pop_shell(&mut self, conn: ConnId) -> Option<&'static str> {
        self.sessions.get_mut(conn)?.pop_shell()
    }

    /// End a session. `farewell` is written straight to the transport;
    /// anything still buffered is discarded. The avatar is saved.
    pub fn close_session(&mut self, reg: &Registry, conn: ConnId, farewell: Option<&str>) {
        let Some(mut s) = self.sessions.remove(conn) else {
            return;
        };
        let (account, avatar) = (s.account(), s.avatar());
        if let Err(e) = s.close() {
            debug!(conn = %conn, err = %e, "session already closed");
            return;
        }
        if let Some(text) = farewell {
            self.outbound.push(Outbound::Output {
                conn,
                text: format!("{text}\r\n"),
            });
        }
        self.outbound.push(Outbound::Close { conn });
        if let Some(av) = avatar {
            if let Err(e) = self.save_entity(reg, av) {
                warn!(conn = %conn, entity = %av, err = %e, "could not save avatar on close");
            }
        }
        info!(conn = %conn, "session closed");
        reg.fire(
            self,
            Event::post(SESSION_CLOSED)
                .with("conn", conn.to_string())
                .with("account", account.map(|a| a.encode()))
                .with("avatar", avatar.map(|a| a.encode())),
        );
    }

    /// Close LIMBO sessions whose rehome window has passed.
    pub fn reap_limbo(&mut self, reg: &Registry) -> usize {
        let (tick, window) = (self.tick, self.limits.rehome_ticks);
        let expired: Vec<ConnId> = self
            .sessions
            .iter()
            .filter(|s| s.state() == SessionState::Limbo)
            .filter(|s| s.limbo_since().is_some_and(|t| tick.saturating_sub(t) >= window))
            .map(Session::conn)
            .collect();
        for &conn in &expired {
            info!(conn = %conn, "rehome window expired");
            self.close_session(reg, conn, None);
        }
        expired.len()
    }

    pub fn check_idle(&mut self) {
        let (tick, idle) = (self.tick, self.limits.idle_ticks);
        for conn in self.sessions.in_state(SessionState::Active) {
            if let Some(s) = self.sessions.get_mut(conn) {
                if s.check_idle(tick, idle) {
                    s.send(IDLE_WARNING);
                }
            }
        }
    }

    /// Route one input line to the top shell (or a global command).
    pub fn handle_line(&mut self, reg: &Registry, conn: ConnId, line: &str) {
        let tick = self.tick;
        let Some(s) = self.sessions.get_mut(conn) else {
            debug!(conn = %conn, "line for unknown session");
            return;
        };
        if !matches!(s.state(), SessionState::Connecting | SessionState::Active) {
            debug!(conn = %conn, state = ?s.state(), "line ignored");
            return;
        }
        s.note_input(tick);
        let Some(inv) = Invocation::parse(conn, line) else {
            return;
        };
        let stack = s.shells().to_vec();
        let Some(cmd) = reg.resolve(&stack, &inv.verb) else {
            self.send(conn, UNKNOWN_COMMAND);
            return;
        };
        match cmd.run(reg, self, &inv) {
            Ok(()) => {}
            Err(CommandError::Usage(text)) => self.send(conn, format!("Usage: {text}")),
            Err(CommandError::Failed(e)) => {
                warn!(conn = %conn, command = cmd.name(), err = %format!("{e:#}"), "command failed");
                self.send(conn, COMMAND_FAILED);
            }
        }
    }

    /// Everything the gateway should get from this iteration: each session's
    /// buffered lines followed by its prompt, then closes and farewells.
    pub fn flush_output(&mut self, reg: &Registry) -> Vec<Outbound> {
        let mut out = Vec::new();
        for conn in self.sessions.conns() {
            let Some(s) = self.sessions.get_mut(conn) else {
                continue;
            };
            let lines = s.take_output();
            let live = matches!(s.state(), SessionState::Connecting | SessionState::Active);
            let prompt_due = s.take_prompt_due();
            if lines.is_empty() && !(live && prompt_due) {
                continue;
            }
            let mut text = String::new();
            for l in &lines {
                text.push_str(l);
                text.push_str("\r\n");
            }
            if live {
                if let Some(sh) = s.top_shell().and_then(|n| reg.shell(n)) {
                    text.push_str(sh.prompt_text());
                }
            }
            if !text.is_empty() {
                out.push(Outbound::Output { conn, text });
            }
        }
        out.append(&mut self.outbound);
        out
    }
}
