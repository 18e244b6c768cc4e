//! Starter content: accounts with passwords, a handful of rooms, movement
//! and talk. Enough world to drive every part of the runtime.

use anyhow::anyhow;
use argon2::Argon2;
use mudwire::ConnId;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use serde_json::{Map, Value as Json, json};
use tracing::info;

use crate::attr::{AttrDescriptor, AttrType, KindSchema, Serializer, Value, non_negative, not_blank};
use crate::config::Config;
use crate::entity::{Entity, EntityId};
use crate::error::{CommandError, Error, SessionError};
use crate::events::{ENTITY_MOVED, ENTITY_MOVING, Event, SESSION_ACTIVE, SESSION_STARTED};
use crate::registry::{Registry, RegistryBuilder};
use crate::reload::WORLD_BROADCAST;
use crate::runtime::install_core;
use crate::session::{Session, SessionState};
use crate::shell::{Command, Invocation, ShellDef};
use crate::world::{Login, World};

pub const LOGIN: &str = "login";
pub const PLAY: &str = "play";
pub const NOTES: &str = "notes";

const BAD_LOGIN: &str = "Wrong name or password.";
const NO_EXIT: &str = "You can't go that way.";
const MIN_PASSWORD: usize = 8;

/// Core globals plus the starter world.
pub fn registry(cfg: &Config) -> anyhow::Result<Registry> {
    let mut b = RegistryBuilder::new();
    install_core(&mut b, cfg);
    install(&mut b);
    b.build()
}

pub fn install(b: &mut RegistryBuilder) {
    b.kind(
        KindSchema::new("account", 'A')
            .attr(AttrDescriptor::new("name", AttrType::Text).validator(not_blank))
            .attr(AttrDescriptor::new("password_hash", AttrType::Text).validator(not_blank))
            .attr(AttrDescriptor::new("avatar", AttrType::EntityRef)),
    )
    .kind(
        KindSchema::new("character", 'C')
            .attr(AttrDescriptor::new("name", AttrType::Text).validator(not_blank))
            .attr(AttrDescriptor::new("room", AttrType::EntityRef))
            .attr(
                AttrDescriptor::new("hp", AttrType::Int)
                    .default_value(20i64)
                    .validator(non_negative),
            )
            .attr(AttrDescriptor::new("notes", AttrType::TextList)),
    )
    .kind(
        KindSchema::new("room", 'R')
            .attr(AttrDescriptor::new("name", AttrType::Text).validator(not_blank))
            .attr(AttrDescriptor::new("description", AttrType::Text))
            .attr(AttrDescriptor::new("exits", AttrType::TextList).serializer(Serializer {
                encode: exits_to_json,
                decode: exits_from_json,
            }))
            .attr(AttrDescriptor::new("closed", AttrType::TextList))
            .attr(AttrDescriptor::new("start", AttrType::Bool)),
    )
    .base_shell(LOGIN)
    .shell(
        ShellDef::new(LOGIN)
            .prompt("login> ")
            .command(Command::new("create", "create <name> <password>", create_account))
            .command(Command::new("connect", "connect <name> <password>", connect_account)),
    )
    .shell(play_shell())
    .shell(
        ShellDef::new(NOTES)
            .prompt("notes> ")
            .command(Command::new("add", "add <text>", |reg, w, inv| {
                if inv.rest.is_empty() {
                    return Err(CommandError::usage("add <text>"));
                }
                let avatar = avatar_of(w, inv.conn)?;
                let mut notes = w.store.get(avatar)?.list("notes").to_vec();
                notes.push(inv.rest.clone());
                w.set_attr(reg, avatar, "notes", notes)?;
                w.send(inv.conn, "Noted.");
                Ok(())
            }))
            .command(Command::new("list", "list", |_, w, inv| {
                let avatar = avatar_of(w, inv.conn)?;
                let notes = w.store.get(avatar)?.list("notes").to_vec();
                if notes.is_empty() {
                    w.send(inv.conn, "No notes.");
                }
                for (i, n) in notes.iter().enumerate() {
                    w.send(inv.conn, format!("{:>2}. {n}", i + 1));
                }
                Ok(())
            }))
            .command(
                Command::new("done", "done", |_, w, inv| {
                    w.pop_shell(inv.conn);
                    Ok(())
                })
                .alias("back"),
            ),
    );

    b.on(ENTITY_MOVING, "closed-exits", 0, |_, w, ev| {
        let (Some(from), Some(dir)) = (ev.entity("from"), ev.str_field("dir").map(str::to_string))
        else {
            return Ok(());
        };
        if w.store.get(from)?.list("closed").iter().any(|d| *d == dir) {
            ev.cancel(format!("The way {dir} is closed."));
        }
        Ok(())
    })
    .on(ENTITY_MOVED, "room-broadcast", 10, |_, w, ev| {
        let (Some(who), Some(from), Some(to), Some(dir)) = (
            ev.entity("entity"),
            ev.entity("from"),
            ev.entity("to"),
            ev.str_field("dir"),
        ) else {
            return Ok(());
        };
        let leave = format!("Someone leaves {dir}.");
        let arrive = format!("Someone arrives from the {}.", opposite(dir));
        for c in occupants(w, from, who) {
            w.send(c, leave.clone());
        }
        for c in occupants(w, to, who) {
            w.send(c, arrive.clone());
        }
        Ok(())
    })
    .on(SESSION_STARTED, "banner", 0, |_, w, ev| {
        let conn = conn_of(ev)?;
        w.send(conn, "Welcome to tickmud.");
        w.send(conn, "Type 'create <name> <password>' or 'connect <name> <password>'.");
        Ok(())
    })
    .on(SESSION_ACTIVE, "welcome-back", 0, |_, w, ev| {
        if ev.get("resumed") != Some(&Json::Bool(true)) {
            return Ok(());
        }
        let conn = conn_of(ev)?;
        w.send(conn, "Welcome back.");
        describe(w, conn);
        Ok(())
    })
    .on_message(WORLD_BROADCAST, "remote-shout", |_, w, msg| {
        let name = msg.body.get("name").and_then(Json::as_str).unwrap_or("Someone");
        let text = msg
            .body
            .get("text")
            .and_then(Json::as_str)
            .ok_or_else(|| anyhow!("broadcast without text"))?;
        let line = format!("{name} shouts from afar, \"{text}\"");
        for conn in w.sessions.in_state(SessionState::Active) {
            w.send(conn, line.clone());
        }
        Ok(())
    });
}

fn play_shell() -> ShellDef {
    let mut sh = ShellDef::new(PLAY)
        .command(
            Command::new("look", "look", |_, w, inv| {
                describe(w, inv.conn);
                Ok(())
            })
            .alias("l"),
        )
        .command(Command::new("say", "say <text>", say))
        .command(Command::new("shout", "shout <text>", shout))
        .command(Command::new("score", "score", |_, w, inv| {
            let avatar = avatar_of(w, inv.conn)?;
            let e = w.store.get(avatar)?;
            let line = format!(
                "{}  hp {}  notes {}",
                e.text("name").unwrap_or("?"),
                e.int("hp").unwrap_or(0),
                e.list("notes").len()
            );
            w.send(inv.conn, line);
            Ok(())
        }))
        .command(Command::new("move", "move <direction>", |reg, w, inv| {
            let dir = inv
                .arg(0)
                .and_then(direction)
                .ok_or_else(|| CommandError::usage("move <north|south|east|west|up|down>"))?;
            go(reg, w, inv.conn, dir)
        }))
        .command(Command::new("notes", "notes", |reg, w, inv| {
            w.push_shell(reg, inv.conn, NOTES)?;
            w.send(inv.conn, "Notebook open: add <text>, list, done.");
            Ok(())
        }));
    for (dir, short) in [
        ("north", "n"),
        ("south", "s"),
        ("east", "e"),
        ("west", "w"),
        ("up", "u"),
        ("down", "d"),
    ] {
        sh = sh.command(Command::new(dir, dir, move |reg, w, inv| go(reg, w, inv.conn, dir)).alias(short));
    }
    sh
}

fn direction(s: &str) -> Option<&'static str> {
    Some(match s.to_ascii_lowercase().as_str() {
        "n" | "north" => "north",
        "s" | "south" => "south",
        "e" | "east" => "east",
        "w" | "west" => "west",
        "u" | "up" => "up",
        "d" | "down" => "down",
        _ => return None,
    })
}

fn opposite(dir: &str) -> &'static str {
    match dir {
        "north" => "south",
        "south" => "north",
        "east" => "west",
        "west" => "east",
        "up" => "below",
        "down" => "above",
        _ => "somewhere",
    }
}

/// `["east=<id>"]` on the entity, `{"east": "<id>"}` on disk.
fn exits_to_json(v: &Value) -> Json {
    let mut m = Map::new();
    for e in v.as_list().unwrap_or_default() {
        if let Some((dir, id)) = e.split_once('=') {
            m.insert(dir.to_string(), Json::String(id.to_string()));
        }
    }
    Json::Object(m)
}

fn exits_from_json(j: &Json) -> Option<Value> {
    let m = j.as_object()?;
    let mut out = Vec::with_capacity(m.len());
    for (dir, id) in m {
        out.push(format!("{dir}={}", id.as_str()?));
    }
    Some(Value::TextList(out))
}

fn exit_to(room: &Entity, dir: &str) -> Option<EntityId> {
    room.list("exits").iter().find_map(|e| {
        let (d, id) = e.split_once('=')?;
        if d == dir { EntityId::decode(id) } else { None }
    })
}

fn conn_of(ev: &Event) -> anyhow::Result<ConnId> {
    ev.str_field("conn")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow!("event without a conn"))
}

fn avatar_of(w: &mut World, conn: ConnId) -> Result<EntityId, CommandError> {
    w.sessions
        .require(conn)?
        .avatar()
        .ok_or_else(|| anyhow!("session {conn} has no avatar").into())
}

fn name_of(w: &World, id: EntityId) -> String {
    w.store
        .get(id)
        .ok()
        .and_then(|e| e.text("name"))
        .unwrap_or("Someone")
        .to_string()
}

/// Connections whose avatar stands in `room`, other than `except`.
fn occupants(w: &World, room: EntityId, except: EntityId) -> Vec<ConnId> {
    let mut out: Vec<ConnId> = w
        .sessions
        .iter()
        .filter(|s| s.state() == SessionState::Active)
        .filter(|s| {
            s.avatar().is_some_and(|a| {
                a != except && w.store.get(a).ok().and_then(|e| e.entity_ref("room")) == Some(room)
            })
        })
        .map(Session::conn)
        .collect();
    out.sort();
    out
}

fn room_lines(w: &World, avatar: EntityId) -> Option<Vec<String>> {
    let room_id = w.store.get(avatar).ok()?.entity_ref("room")?;
    let room = w.store.get(room_id).ok()?;
    let mut out = vec![room.text("name").unwrap_or("Somewhere").to_string()];
    if let Some(d) = room.text("description").filter(|d| !d.is_empty()) {
        out.push(d.to_string());
    }
    let closed = room.list("closed");
    let dirs: Vec<String> = room
        .list("exits")
        .iter()
        .filter_map(|e| e.split_once('=').map(|(d, _)| d))
        .map(|d| {
            if closed.iter().any(|c| c == d) {
                format!("{d} (closed)")
            } else {
                d.to_string()
            }
        })
        .collect();
    out.push(if dirs.is_empty() {
        "There are no obvious exits.".to_string()
    } else {
        format!("Exits: {}.", dirs.join(", "))
    });
    let mut here: Vec<String> = occupants(w, room_id, avatar)
        .into_iter()
        .filter_map(|c| w.sessions.get(c).and_then(Session::avatar))
        .map(|a| name_of(w, a))
        .collect();
    here.sort();
    if !here.is_empty() {
        out.push(format!("Also here: {}.", here.join(", ")));
    }
    Some(out)
}

fn describe(w: &mut World, conn: ConnId) {
    let Some(avatar) = w.sessions.get(conn).and_then(Session::avatar) else {
        return;
    };
    let lines = room_lines(w, avatar).unwrap_or_else(|| vec!["You are nowhere.".to_string()]);
    for l in lines {
        w.send(conn, l);
    }
}

fn go(reg: &Registry, w: &mut World, conn: ConnId, dir: &str) -> Result<(), CommandError> {
    let avatar = avatar_of(w, conn)?;
    let from = w
        .store
        .get(avatar)?
        .entity_ref("room")
        .ok_or_else(|| anyhow!("avatar {avatar} is nowhere"))?;
    let Some(to) = exit_to(w.store.get(from)?, dir) else {
        w.send(conn, NO_EXIT);
        return Ok(());
    };
    let fields = |ev: Event| {
        ev.with_entity("entity", avatar)
            .with_entity("from", from)
            .with_entity("to", to)
            .with("dir", dir)
    };
    let out = reg.fire(w, fields(Event::pre(ENTITY_MOVING)));
    if out.canceled {
        w.send(conn, out.reason.unwrap_or_else(|| NO_EXIT.to_string()));
        return Ok(());
    }
    w.set_attr(reg, avatar, "room", to)?;
    reg.fire(w, fields(Event::post(ENTITY_MOVED)));
    describe(w, conn);
    Ok(())
}

fn say(_: &Registry, w: &mut World, inv: &Invocation) -> Result<(), CommandError> {
    if inv.rest.is_empty() {
        return Err(CommandError::usage("say <text>"));
    }
    let avatar = avatar_of(w, inv.conn)?;
    let room = w
        .store
        .get(avatar)?
        .entity_ref("room")
        .ok_or_else(|| anyhow!("avatar {avatar} is nowhere"))?;
    let line = format!("{} says, \"{}\"", name_of(w, avatar), inv.rest);
    for c in occupants(w, room, avatar) {
        w.send(c, line.clone());
    }
    w.send(inv.conn, format!("You say, \"{}\"", inv.rest));
    Ok(())
}

fn shout(_: &Registry, w: &mut World, inv: &Invocation) -> Result<(), CommandError> {
    if inv.rest.is_empty() {
        return Err(CommandError::usage("shout <text>"));
    }
    let avatar = avatar_of(w, inv.conn)?;
    let name = name_of(w, avatar);
    let line = format!("{name} shouts, \"{}\"", inv.rest);
    for c in w.sessions.in_state(SessionState::Active) {
        if c != inv.conn {
            w.send(c, line.clone());
        }
    }
    w.send(inv.conn, format!("You shout, \"{}\"", inv.rest));
    w.publish(WORLD_BROADCAST, json!({ "name": name, "text": inv.rest }));
    Ok(())
}

fn valid_name(name: &str) -> bool {
    (3..=16).contains(&name.len()) && name.chars().all(|c| c.is_ascii_alphabetic())
}

fn capitalize(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    let mut cs = lower.chars();
    match cs.next() {
        Some(f) => f.to_ascii_uppercase().to_string() + cs.as_str(),
        None => String::new(),
    }
}

fn find_account(w: &World, name: &str) -> Option<EntityId> {
    w.store
        .find("account", |e| e.text("name").is_some_and(|n| n.eq_ignore_ascii_case(name)))
        .next()
        .map(Entity::id)
}

fn start_room(w: &World) -> Option<EntityId> {
    w.store.find("room", |e| e.flag("start")).next().map(Entity::id)
}

fn create_account(reg: &Registry, w: &mut World, inv: &Invocation) -> Result<(), CommandError> {
    let (Some(name), Some(pw)) = (inv.arg(0), inv.arg(1)) else {
        return Err(CommandError::usage("create <name> <password>"));
    };
    if !valid_name(name) {
        w.send(inv.conn, "Names are 3 to 16 letters.");
        return Ok(());
    }
    if pw.len() < MIN_PASSWORD {
        w.send(inv.conn, format!("Password too short (min {MIN_PASSWORD})."));
        return Ok(());
    }
    if find_account(w, name).is_some() {
        w.send(inv.conn, "That name is taken.");
        return Ok(());
    }
    let start = start_room(w).ok_or_else(|| anyhow!("no start room in the world"))?;

    // Hashing runs inline and holds the loop for one Argon2 pass.
    let salt = SaltString::generate(&mut password_hash::rand_core::OsRng);
    let hash = Argon2::default()
        .hash_password(pw.as_bytes(), &salt)
        .map_err(|e| anyhow!("hash_password failed: {e}"))?
        .to_string();

    let name = capitalize(name);
    let avatar = w.store.create("character")?.id();
    w.set_attr(reg, avatar, "name", name.as_str())?;
    w.set_attr(reg, avatar, "room", start)?;
    let acct = w.store.create("account")?.id();
    w.set_attr(reg, acct, "name", name.as_str())?;
    w.set_attr(reg, acct, "password_hash", hash)?;
    w.set_attr(reg, acct, "avatar", avatar)?;
    w.save_entity(reg, avatar)?;
    w.save_entity(reg, acct)?;
    info!(conn = %inv.conn, account = %w.store.label(acct), "account created");
    enter(reg, w, inv.conn, acct, avatar)
}

fn connect_account(reg: &Registry, w: &mut World, inv: &Invocation) -> Result<(), CommandError> {
    let (Some(name), Some(pw)) = (inv.arg(0), inv.arg(1)) else {
        return Err(CommandError::usage("connect <name> <password>"));
    };
    let Some(acct) = find_account(w, name) else {
        w.send(inv.conn, BAD_LOGIN);
        return Ok(());
    };
    let e = w.store.get(acct)?;
    let ok = PasswordHash::new(e.text("password_hash").unwrap_or_default())
        .map(|ph| Argon2::default().verify_password(pw.as_bytes(), &ph).is_ok())
        .unwrap_or(false);
    let avatar = e.entity_ref("avatar");
    if !ok {
        info!(conn = %inv.conn, "failed login");
        w.send(inv.conn, BAD_LOGIN);
        return Ok(());
    }
    let avatar = avatar.ok_or_else(|| anyhow!("account {acct} has no avatar"))?;
    enter(reg, w, inv.conn, acct, avatar)
}

fn enter(
    reg: &Registry,
    w: &mut World,
    conn: ConnId,
    acct: EntityId,
    avatar: EntityId,
) -> Result<(), CommandError> {
    match w.login(reg, conn, acct, Some(avatar)) {
        Ok(Login::Fresh) => {
            w.push_shell(reg, conn, PLAY)?;
            describe(w, conn);
            Ok(())
        }
        // The resumed session's stack is kept; session.active shows the room.
        Ok(Login::Resumed) => Ok(()),
        Err(Error::Session(SessionError::AccountInUse(_))) => {
            w.send(conn, "That account is already playing.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Build the starting rooms if the world has none. Returns how many were
/// created.
pub fn seed(w: &mut World) -> Result<usize, Error> {
    if w.store.find("room", |_| true).next().is_some() {
        return Ok(0);
    }
    let square = new_room(
        w,
        "Town Square",
        "Cobblestones ring a dry fountain. The market lies east; the north gate is barred.",
    )?;
    let market = new_room(w, "Market", "Empty stalls lean against each other.")?;
    let gate = new_room(w, "North Road", "A muddy road runs away from the town wall.")?;

    let exits = |pairs: &[(&str, EntityId)]| -> Value {
        Value::TextList(pairs.iter().map(|(d, id)| format!("{d}={id}")).collect())
    };
    w.store.set(square, "exits", exits(&[("east", market), ("north", gate)]))?;
    w.store.set(square, "closed", Value::TextList(vec!["north".into()]))?;
    w.store.set(square, "start", Value::Bool(true))?;
    w.store.set(market, "exits", exits(&[("west", square)]))?;
    w.store.set(gate, "exits", exits(&[("south", square)]))?;
    for id in [square, market, gate] {
        w.store.save(id)?;
    }
    info!(rooms = 3, "seeded starter world");
    Ok(3)
}

fn new_room(w: &mut World, name: &str, description: &str) -> Result<EntityId, Error> {
    let id = w.store.create("room")?.id();
    w.store.set(id, "name", name.into())?;
    w.store.set(id, "description", description.into())?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, JsonCodec};
    use crate::fabric::Message;
    use crate::world::tests::world_for;

    fn setup() -> (Registry, World) {
        let reg = registry(&Config::default()).unwrap();
        let mut w = world_for(&reg);
        assert_eq!(seed(&mut w).unwrap(), 3);
        (reg, w)
    }

    /// Signed-in player in the start room; returns (account, avatar).
    fn player(reg: &Registry, w: &mut World, conn: u128, name: &str) -> (EntityId, EntityId) {
        let start = start_room(w).unwrap();
        let avatar = w.store.create("character").unwrap().id();
        w.store.set(avatar, "name", name.into()).unwrap();
        w.store.set(avatar, "room", start.into()).unwrap();
        let acct = w.store.create("account").unwrap().id();
        w.store.set(acct, "name", name.into()).unwrap();
        w.store.set(acct, "password_hash", "x".into()).unwrap();
        w.store.set(acct, "avatar", avatar.into()).unwrap();
        w.connect(reg, ConnId(conn), "test");
        enter(reg, w, ConnId(conn), acct, avatar).unwrap();
        w.flush_output(reg);
        (acct, avatar)
    }

    fn pending(w: &World, conn: u128) -> Vec<String> {
        w.sessions.get(ConnId(conn)).unwrap().pending_output().to_vec()
    }

    fn room_of(w: &World, avatar: EntityId) -> String {
        let room = w.store.get(avatar).unwrap().entity_ref("room").unwrap();
        w.store.get(room).unwrap().text("name").unwrap().to_string()
    }

    #[test]
    fn seeding_happens_once_and_exits_survive_the_codec() {
        let (reg, mut w) = setup();
        assert_eq!(seed(&mut w).unwrap(), 0);
        let square = start_room(&w).unwrap();
        let c = JsonCodec::new(reg.schemas().clone());
        let bytes = c.encode(w.store.get(square).unwrap()).unwrap();
        let raw: Json = serde_json::from_slice(&bytes).unwrap();
        assert!(raw["attrs"]["exits"]["east"].is_string());
        let back = c.decode(&bytes).unwrap();
        assert_eq!(back.list("exits"), w.store.get(square).unwrap().list("exits"));
    }

    #[test]
    fn closed_exit_vetoes_the_move() {
        let (reg, mut w) = setup();
        let (_, a) = player(&reg, &mut w, 1, "Ann");
        let (_, _) = player(&reg, &mut w, 2, "Bob");
        w.handle_line(&reg, ConnId(1), "north");
        assert_eq!(pending(&w, 1), ["The way north is closed."]);
        assert!(pending(&w, 2).is_empty());
        assert_eq!(room_of(&w, a), "Town Square");

        w.handle_line(&reg, ConnId(1), "move sideways");
        assert_eq!(pending(&w, 1).last().unwrap(), "Usage: move <north|south|east|west|up|down>");
    }

    #[test]
    fn movement_is_announced_to_both_rooms_without_names() {
        let (reg, mut w) = setup();
        let (_, a) = player(&reg, &mut w, 1, "Ann");
        let (_, b) = player(&reg, &mut w, 2, "Bob");
        let (_, _) = player(&reg, &mut w, 3, "Cy");
        w.handle_line(&reg, ConnId(2), "e");
        assert_eq!(room_of(&w, b), "Market");
        w.flush_output(&reg);

        w.handle_line(&reg, ConnId(1), "move east");
        assert_eq!(room_of(&w, a), "Market");
        assert_eq!(pending(&w, 2), ["Someone arrives from the west."]);
        assert_eq!(pending(&w, 3), ["Someone leaves east."]);
        let seen = pending(&w, 1);
        assert_eq!(seen[0], "Market");
        assert!(seen.contains(&"Also here: Bob.".to_string()));
    }

    #[test]
    fn notebook_shell_stacks_on_play() {
        let (reg, mut w) = setup();
        let (_, a) = player(&reg, &mut w, 1, "Ann");
        w.handle_line(&reg, ConnId(1), "notes");
        w.handle_line(&reg, ConnId(1), "add buy \"fresh bread\"");
        w.handle_line(&reg, ConnId(1), "look");
        w.handle_line(&reg, ConnId(1), "list");
        assert_eq!(
            pending(&w, 1)[1..],
            [
                "Noted.".to_string(),
                "Unknown command.".to_string(),
                " 1. buy \"fresh bread\"".to_string()
            ]
        );
        w.handle_line(&reg, ConnId(1), "done");
        assert_eq!(w.sessions.get(ConnId(1)).unwrap().top_shell(), Some(PLAY));
        assert_eq!(w.store.get(a).unwrap().list("notes").len(), 1);
        assert!(w.store.get(a).unwrap().is_dirty());
    }

    #[test]
    fn accounts_are_created_and_password_checked() {
        let (reg, mut w) = setup();
        w.connect(&reg, ConnId(1), "a");
        w.handle_line(&reg, ConnId(1), "create alice short");
        w.handle_line(&reg, ConnId(1), "create alice hunter22");
        let s = w.sessions.get(ConnId(1)).unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.top_shell(), Some(PLAY));
        assert_eq!(pending(&w, 1)[2], "Password too short (min 8).");
        assert!(w.store.dirty_ids().is_empty());
        w.handle_line(&reg, ConnId(1), "quit");

        w.connect(&reg, ConnId(2), "b");
        w.handle_line(&reg, ConnId(2), "create Alice whatever1");
        w.handle_line(&reg, ConnId(2), "connect alice nope");
        assert_eq!(pending(&w, 2)[2..], ["That name is taken.".to_string(), BAD_LOGIN.to_string()]);
        w.handle_line(&reg, ConnId(2), "connect ALICE hunter22");
        assert_eq!(w.sessions.get(ConnId(2)).unwrap().top_shell(), Some(PLAY));
    }

    #[test]
    fn link_dead_player_gets_their_session_back() {
        let (reg, mut w) = setup();
        let (acct, avatar) = player(&reg, &mut w, 1, "Ann");
        w.handle_line(&reg, ConnId(1), "notes");
        w.flush_output(&reg);
        w.disconnect(&reg, ConnId(1));

        w.connect(&reg, ConnId(9), "elsewhere");
        w.flush_output(&reg);
        enter(&reg, &mut w, ConnId(9), acct, avatar).unwrap();
        let s = w.sessions.get(ConnId(9)).unwrap();
        assert_eq!(s.shell_names(), vec![LOGIN, PLAY, NOTES]);
        assert_eq!(pending(&w, 9)[..2], ["Welcome back.".to_string(), "Town Square".to_string()]);
    }

    #[test]
    fn shouts_cross_the_fabric() {
        let (reg, mut w) = setup();
        player(&reg, &mut w, 1, "Ann");
        w.handle_line(&reg, ConnId(1), "shout anyone there");
        assert_eq!(w.outbox_mut().len(), 1);

        let msg = Message {
            channel: WORLD_BROADCAST.into(),
            from: "core-b".into(),
            body: json!({ "name": "Zed", "text": "over here" }),
        };
        assert_eq!(reg.deliver(&mut w, &msg), 1);
        assert_eq!(pending(&w, 1).last().unwrap(), "Zed shouts from afar, \"over here\"");
    }
}
