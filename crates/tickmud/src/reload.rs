//! Reload handoff over the fabric.
//!
//! The successor publishes a [`ReloadRequest`] naming the incumbent. The
//! incumbent saves, parks its sessions (login-stage ones included) in LIMBO and answers with a
//! [`ReloadSnapshot`]. The successor restores those sessions in LIMBO under
//! their connection ids, so when the gateway re-announces a connection the
//! ordinary connect path rehomes it.

use mudwire::ConnId;
use serde::Deserialize;
use serde::Serialize;
use tracing::{info, warn};

use crate::entity::EntityId;
use crate::error::FabricError;
use crate::registry::Registry;
use crate::session::{Session, SessionState};
use crate::world::World;

pub const RELOAD_REQUEST: &str = "reload.request";
pub const RELOAD_SNAPSHOT: &str = "reload.snapshot";
pub const RELOAD_COMPLETE: &str = "reload.complete";
pub const WORLD_BROADCAST: &str = "world.broadcast";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadRequest {
    /// Node expected to hand off.
    pub target: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(with = "conn_hex")]
    pub conn: ConnId,
    /// `None` for a session still at the login prompt.
    #[serde(default)]
    pub account: Option<EntityId>,
    pub avatar: Option<EntityId>,
    /// Bottom first.
    pub shells: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadSnapshot {
    pub from: String,
    /// The successor this snapshot is meant for.
    pub target: String,
    pub taken_at: String,
    pub sessions: Vec<SessionSnapshot>,
}

mod conn_hex {
    use mudwire::ConnId;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(c: &ConnId, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(c)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ConnId, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl ReloadSnapshot {
    /// Every session still bound to a transport or waiting for one, in conn
    /// order. Login-stage sessions carry no account.
    pub fn capture(world: &World, target: &str) -> Self {
        let mut sessions: Vec<SessionSnapshot> = world
            .sessions
            .iter()
            .filter(|s| s.state() != SessionState::Closed)
            .map(|s| SessionSnapshot {
                conn: s.conn(),
                account: s.account(),
                avatar: s.avatar(),
                shells: s.shell_names().into_iter().map(str::to_string).collect(),
            })
            .collect();
        sessions.sort_by_key(|s| s.conn);
        Self {
            from: world.node().to_string(),
            target: target.to_string(),
            taken_at: chrono::Utc::now().to_rfc3339(),
            sessions,
        }
    }
}

/// Incumbent side. Returns the snapshot that was queued for publishing.
pub fn hand_off(
    reg: &Registry,
    world: &mut World,
    req: &ReloadRequest,
) -> Result<ReloadSnapshot, FabricError> {
    let saved = world.save_dirty(reg);
    if !saved.failed.is_empty() {
        warn!(failed = saved.failed.len(), "entities still dirty at handoff");
    }
    let parked = world.park_all(reg, "reload");
    let snap = ReloadSnapshot::capture(world, &req.from);
    let body = serde_json::to_value(&snap)?;
    if !world.publish(RELOAD_SNAPSHOT, body) {
        return Err(FabricError::Full);
    }
    info!(
        successor = %req.from,
        saved = saved.saved,
        parked,
        sessions = snap.sessions.len(),
        "reload snapshot queued"
    );
    Ok(snap)
}

/// Successor side. Sessions whose shells are no longer registered fall back
/// to the base shell; the base shell is always at the bottom.
pub fn adopt_snapshot(reg: &Registry, world: &mut World, snap: &ReloadSnapshot) -> usize {
    let tick = world.tick();
    let mut adopted = 0;
    for s in &snap.sessions {
        if world.sessions.get(s.conn).is_some() {
            warn!(conn = %s.conn, "snapshot entry collides with a live session; skipped");
            continue;
        }
        let mut shells: Vec<&'static str> = Vec::with_capacity(s.shells.len().max(1));
        for name in &s.shells {
            match reg.shell(name) {
                Some(def) => shells.push(def.name()),
                None => warn!(conn = %s.conn, shell = %name, "unknown shell dropped from snapshot"),
            }
        }
        if shells.first() != Some(&reg.base_shell()) {
            shells.retain(|&n| n != reg.base_shell());
            shells.insert(0, reg.base_shell());
        }
        world
            .sessions
            .insert(Session::restore(s.conn, s.account, s.avatar, &shells, tick));
        adopted += 1;
    }
    info!(from = %snap.from, adopted, "reload snapshot adopted");
    adopted
}
