//! Per-connection state and its lifecycle.
//!
//! ```text
//! CONNECTING --auth--> ACTIVE --transport lost / reload--> LIMBO
//!      |                  |  <--------rehome-------------   |
//!      +-----quit/drop----+-------------> CLOSED <--timeout--+
//! ```
//!
//! A reload also holds CONNECTING sessions in LIMBO; those rehome back to
//! CONNECTING since they never authenticated.

use std::collections::HashMap;

use mudwire::ConnId;

use crate::entity::EntityId;
use crate::error::SessionError;
use crate::shell::ShellFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Limbo,
    Closed,
}

#[derive(Debug)]
pub struct Session {
    conn: ConnId,
    remote: String,
    state: SessionState,
    account: Option<EntityId>,
    avatar: Option<EntityId>,
    shells: Vec<ShellFrame>,
    output: Vec<String>,
    limbo_since: Option<u64>,
    last_input: u64,
    idle_warned: bool,
    prompt_due: bool,
}

impl Session {
    pub fn new(conn: ConnId, remote: impl Into<String>, base_shell: &'static str, tick: u64) -> Self {
        Self {
            conn,
            remote: remote.into(),
            state: SessionState::Connecting,
            account: None,
            avatar: None,
            shells: vec![ShellFrame {
                name: base_shell,
                owner: conn,
            }],
            output: Vec::new(),
            limbo_since: None,
            last_input: tick,
            idle_warned: false,
            prompt_due: true,
        }
    }

    /// A session rebuilt from a reload snapshot, parked in LIMBO until its
    /// connection is announced again.
    pub fn restore(
        conn: ConnId,
        account: Option<EntityId>,
        avatar: Option<EntityId>,
        shells: &[&'static str],
        tick: u64,
    ) -> Self {
        Self {
            conn,
            remote: String::new(),
            state: SessionState::Limbo,
            account,
            avatar,
            shells: shells
                .iter()
                .map(|&name| ShellFrame { name, owner: conn })
                .collect(),
            output: Vec::new(),
            limbo_since: Some(tick),
            last_input: tick,
            idle_warned: false,
            prompt_due: false,
        }
    }

    pub fn conn(&self) -> ConnId {
        self.conn
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn account(&self) -> Option<EntityId> {
        self.account
    }

    pub fn avatar(&self) -> Option<EntityId> {
        self.avatar
    }

    pub fn set_avatar(&mut self, avatar: Option<EntityId>) {
        self.avatar = avatar;
    }

    pub fn shells(&self) -> &[ShellFrame] {
        &self.shells
    }

    pub fn shell_names(&self) -> Vec<&'static str> {
        self.shells.iter().map(|f| f.name).collect()
    }

    pub fn top_shell(&self) -> Option<&'static str> {
        self.shells.last().map(|f| f.name)
    }

    pub fn push_shell(&mut self, name: &'static str) {
        self.shells.push(ShellFrame {
            name,
            owner: self.conn,
        });
    }

    /// Drop the top shell. The base shell is never popped; `None` then.
    pub fn pop_shell(&mut self) -> Option<&'static str> {
        if self.shells.len() <= 1 {
            return None;
        }
        self.shells.pop().map(|f| f.name)
    }

    pub fn send(&mut self, text: impl Into<String>) {
        self.output.push(text.into());
    }

    pub fn pending_output(&self) -> &[String] {
        &self.output
    }

    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    pub(crate) fn take_prompt_due(&mut self) -> bool {
        std::mem::take(&mut self.prompt_due)
    }

    /// Record player input. Returns true if the session had been flagged idle.
    pub fn note_input(&mut self, tick: u64) -> bool {
        self.last_input = tick;
        self.prompt_due = true;
        std::mem::take(&mut self.idle_warned)
    }

    /// True exactly once per idle stretch, when `idle_ticks` have passed
    /// without input.
    pub fn check_idle(&mut self, tick: u64, idle_ticks: u64) -> bool {
        if self.state != SessionState::Active || self.idle_warned {
            return false;
        }
        if tick.saturating_sub(self.last_input) < idle_ticks {
            return false;
        }
        self.idle_warned = true;
        true
    }

    pub fn limbo_since(&self) -> Option<u64> {
        self.limbo_since
    }

    fn illegal(&self, to: SessionState) -> SessionError {
        SessionError::IllegalTransition {
            conn: self.conn,
            from: self.state,
            to,
        }
    }

    /// CONNECTING -> ACTIVE.
    pub fn authenticate(&mut self, account: EntityId) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Err(self.illegal(SessionState::Active));
        }
        self.account = Some(account);
        self.state = SessionState::Active;
        Ok(())
    }

    /// ACTIVE -> LIMBO. Pending output is kept; the transport may still be
    /// there (reload) and flush it.
    pub fn detach(&mut self, tick: u64) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(self.illegal(SessionState::Limbo));
        }
        self.state = SessionState::Limbo;
        self.limbo_since = Some(tick);
        Ok(())
    }

    /// CONNECTING -> LIMBO while a reload hands the transport over.
    pub fn hold(&mut self, tick: u64) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Err(self.illegal(SessionState::Limbo));
        }
        self.state = SessionState::Limbo;
        self.limbo_since = Some(tick);
        Ok(())
    }

    /// LIMBO -> ACTIVE on `conn`, which may be a new transport. A session
    /// that never authenticated goes back to CONNECTING.
    pub fn rehome(&mut self, conn: ConnId, remote: &str, tick: u64) -> Result<(), SessionError> {
        let to = if self.account.is_some() {
            SessionState::Active
        } else {
            SessionState::Connecting
        };
        if self.state != SessionState::Limbo {
            return Err(self.illegal(to));
        }
        self.conn = conn;
        if !remote.is_empty() {
            self.remote = remote.to_string();
        }
        for f in &mut self.shells {
            f.owner = conn;
        }
        self.state = to;
        self.limbo_since = None;
        self.last_input = tick;
        self.idle_warned = false;
        self.prompt_due = true;
        Ok(())
    }

    /// Any live state -> CLOSED. Unflushed output is discarded and the shell
    /// stack released.
    pub fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(self.illegal(SessionState::Closed));
        }
        self.state = SessionState::Closed;
        self.output.clear();
        self.shells.clear();
        self.limbo_since = None;
        Ok(())
    }
}

/// Live sessions by connection id.
#[derive(Debug, Default)]
pub struct Sessions {
    by_conn: HashMap<ConnId, Session>,
}

impl Sessions {
    pub fn insert(&mut self, s: Session) -> Option<Session> {
        self.by_conn.insert(s.conn, s)
    }

    pub fn get(&self, conn: ConnId) -> Option<&Session> {
        self.by_conn.get(&conn)
    }

    pub fn get_mut(&mut self, conn: ConnId) -> Option<&mut Session> {
        self.by_conn.get_mut(&conn)
    }

    pub fn require(&mut self, conn: ConnId) -> Result<&mut Session, SessionError> {
        self.by_conn
            .get_mut(&conn)
            .ok_or(SessionError::UnknownConn(conn))
    }

    pub fn remove(&mut self, conn: ConnId) -> Option<Session> {
        self.by_conn.remove(&conn)
    }

    pub fn len(&self) -> usize {
        self.by_conn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_conn.is_empty()
    }

    /// Connection ids in a stable order.
    pub fn conns(&self) -> Vec<ConnId> {
        let mut v: Vec<ConnId> = self.by_conn.keys().copied().collect();
        v.sort_unstable();
        v
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.by_conn.values()
    }

    pub fn in_state(&self, state: SessionState) -> Vec<ConnId> {
        let mut v: Vec<ConnId> = self
            .by_conn
            .values()
            .filter(|s| s.state == state)
            .map(|s| s.conn)
            .collect();
        v.sort_unstable();
        v
    }

    /// The LIMBO session logged in as `account`, if any.
    pub fn limbo_for(&self, account: EntityId) -> Option<ConnId> {
        self.by_conn
            .values()
            .find(|s| s.state == SessionState::Limbo && s.account == Some(account))
            .map(|s| s.conn)
    }

    /// The ACTIVE session logged in as `account`, if any.
    pub fn active_for(&self, account: EntityId) -> Option<ConnId> {
        self.by_conn
            .values()
            .find(|s| s.state == SessionState::Active && s.account == Some(account))
            .map(|s| s.conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(ConnId(9), "127.0.0.1:5555", "login", 0)
    }

    #[test]
    fn push_then_pop_restores_the_previous_top() {
        let mut s = session();
        s.push_shell("play");
        let before = (s.conn(), s.top_shell());
        s.push_shell("notes");
        assert_eq!(s.pop_shell(), Some("notes"));
        assert_eq!((s.conn(), s.top_shell()), before);
        assert_eq!(s.shell_names(), vec!["login", "play"]);
    }

    #[test]
    fn base_shell_survives_pops() {
        let mut s = session();
        assert_eq!(s.pop_shell(), None);
        assert_eq!(s.pop_shell(), None);
        assert_eq!(s.top_shell(), Some("login"));
    }

    #[test]
    fn legal_lifecycle() {
        let mut s = session();
        s.authenticate(EntityId(1)).unwrap();
        assert_eq!(s.state(), SessionState::Active);
        s.detach(10).unwrap();
        assert_eq!(s.limbo_since(), Some(10));
        s.rehome(ConnId(10), "", 12).unwrap();
        assert_eq!(s.conn(), ConnId(10));
        assert!(s.shells().iter().all(|f| f.owner == ConnId(10)));
        assert_eq!(s.remote(), "127.0.0.1:5555");
        s.close().unwrap();
        assert_eq!(s.state(), SessionState::Closed);
        assert!(s.shells().is_empty());
    }

    #[test]
    fn illegal_transitions_are_refused() {
        let mut s = session();
        assert!(matches!(
            s.detach(1),
            Err(SessionError::IllegalTransition { from: SessionState::Connecting, to: SessionState::Limbo, .. })
        ));
        assert!(s.rehome(ConnId(1), "", 1).is_err());
        s.authenticate(EntityId(1)).unwrap();
        assert!(s.authenticate(EntityId(2)).is_err());
        s.close().unwrap();
        assert!(s.close().is_err());
        assert!(s.authenticate(EntityId(1)).is_err());
    }

    #[test]
    fn held_login_stage_session_rehomes_unauthenticated() {
        let mut s = session();
        assert!(s.detach(1).is_err());
        s.hold(4).unwrap();
        assert_eq!((s.state(), s.limbo_since()), (SessionState::Limbo, Some(4)));
        s.rehome(ConnId(9), "", 6).unwrap();
        assert_eq!(s.state(), SessionState::Connecting);
        assert_eq!(s.account(), None);
        assert!(s.hold(7).is_ok());
    }

    #[test]
    fn close_discards_pending_output() {
        let mut s = session();
        s.send("one");
        s.send("two");
        assert_eq!(s.pending_output().len(), 2);
        s.close().unwrap();
        assert!(s.take_output().is_empty());
    }

    #[test]
    fn idle_warning_fires_once_until_input() {
        let mut s = session();
        s.authenticate(EntityId(1)).unwrap();
        assert!(!s.check_idle(5, 10));
        assert!(s.check_idle(10, 10));
        assert!(!s.check_idle(11, 10));
        assert!(s.note_input(12));
        assert!(!s.note_input(13));
        assert!(s.check_idle(23, 10));
    }

    #[test]
    fn limbo_lookup_by_account() {
        let mut all = Sessions::default();
        let mut a = session();
        a.authenticate(EntityId(7)).unwrap();
        a.detach(3).unwrap();
        all.insert(a);
        all.insert(Session::restore(ConnId(2), Some(EntityId(8)), None, &["login", "play"], 3));
        assert_eq!(all.limbo_for(EntityId(7)), Some(ConnId(9)));
        assert_eq!(all.limbo_for(EntityId(8)), Some(ConnId(2)));
        assert_eq!(all.active_for(EntityId(7)), None);
        assert_eq!(all.in_state(SessionState::Limbo), vec![ConnId(2), ConnId(9)]);
    }
}
