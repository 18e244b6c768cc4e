//! The control loop.
//!
//! One task owns the registry, the world, the pulse counters and the fabric.
//! Every wake does the same bounded step: advance the tick and run what is
//! due, drain fabric messages, flush the fabric outbox, then hand buffered
//! output to the gateway. The only await points are the poll in [`Runtime::serve`]
//! and output writes.

use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Context;
use mudwire::ConnId;
use mudwire::gateway::{GatewayMsg, OUT_CLOSE, OUT_OUTPUT, header, parse_gateway_msg};
use serde_json::json;
use tickio::frame::{FrameReader, FrameWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::codec::JsonCodec;
use crate::error::FabricError;
use crate::events::{Event, PULSE_TICK};
use crate::fabric::{Fabric, Message, Outbox};
use crate::pulse::Pulse;
use crate::registry::{Registry, RegistryBuilder};
use crate::reload::{
    RELOAD_COMPLETE, RELOAD_REQUEST, RELOAD_SNAPSHOT, ReloadRequest, ReloadSnapshot,
    adopt_snapshot, hand_off,
};
use crate::session::SessionState;
use crate::shell::Command;
use crate::store::{Backend, EntityStore};
use crate::world::{Outbound, World};

/// Upper bound on fabric messages handled per step.
const FABRIC_DRAIN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// Sessions were handed to `successor`; this process should exit
    /// without touching them.
    HandedOff { successor: String },
    Shutdown,
}

/// What the gateway reports about player transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Connect { conn: ConnId, remote: String },
    Line { conn: ConnId, line: String },
    Disconnect { conn: ConnId },
}

impl NetEvent {
    pub fn conn(&self) -> ConnId {
        match self {
            NetEvent::Connect { conn, .. }
            | NetEvent::Line { conn, .. }
            | NetEvent::Disconnect { conn } => *conn,
        }
    }

    /// Log label; never includes the line text.
    pub fn kind(&self) -> &'static str {
        match self {
            NetEvent::Connect { .. } => "connect",
            NetEvent::Line { .. } => "line",
            NetEvent::Disconnect { .. } => "disconnect",
        }
    }
}

impl From<GatewayMsg> for NetEvent {
    fn from(m: GatewayMsg) -> Self {
        match m {
            GatewayMsg::Connect { conn, remote } => NetEvent::Connect {
                conn,
                remote: String::from_utf8_lossy(&remote).into_owned(),
            },
            GatewayMsg::Line { conn, line } => NetEvent::Line {
                conn,
                line: String::from_utf8_lossy(&line).into_owned(),
            },
            GatewayMsg::Disconnect { conn } => NetEvent::Disconnect { conn },
        }
    }
}

/// Global commands and housekeeping pulses every core carries.
pub fn install_core(b: &mut RegistryBuilder, cfg: &crate::config::Config) {
    b.resolve_policy(cfg.resolve_policy())
        .global(Command::new("quit", "quit", |reg, w, inv| {
            w.close_session(reg, inv.conn, Some("Goodbye."));
            Ok(())
        }))
        .global(Command::new("help", "help", |reg, w, inv| {
            let stack = w.sessions.require(inv.conn)?.shells().to_vec();
            let usages: Vec<&str> = reg.reachable(&stack).iter().map(|c| c.usage()).collect();
            w.send(inv.conn, "Commands:");
            for u in usages {
                w.send(inv.conn, format!("  {u}"));
            }
            Ok(())
        }))
        .global(Command::new("who", "who", |_, w, inv| {
            let mut names: Vec<String> = w
                .sessions
                .iter()
                .filter(|s| s.state() == SessionState::Active)
                .filter_map(|s| s.account())
                .map(|a| match w.store.get(a).ok().and_then(|e| e.text("name")) {
                    Some(n) => n.to_string(),
                    None => w.store.label(a),
                })
                .collect();
            names.sort();
            w.send(inv.conn, format!("Players online: {}", names.len()));
            for n in names {
                w.send(inv.conn, format!("  {n}"));
            }
            Ok(())
        }));

    b.every("core", "autosave", cfg.autosave_ticks.max(1), |reg, w| {
        let r = w.save_dirty(reg);
        if r.saved > 0 || !r.failed.is_empty() {
            info!(saved = r.saved, failed = r.failed.len(), "autosave");
        }
        Ok(())
    })
    .every("core", "limbo-reaper", 1, |reg, w| {
        w.reap_limbo(reg);
        Ok(())
    })
    .every("core", "idle-check", 10, |_, w| {
        w.check_idle();
        Ok(())
    });
}

/// Entity store over `backend` with the JSON codec and the configured retry
/// backoff.
pub fn open_store(cfg: &crate::config::Config, reg: &Registry, backend: Box<dyn Backend>) -> EntityStore {
    let schemas = reg.schemas().clone();
    EntityStore::new(
        schemas.clone(),
        Box::new(JsonCodec::new(schemas)),
        backend,
        Some(&cfg.node_id),
    )
    .retry_backoff(cfg.storage_backoff())
}

pub struct Runtime {
    reg: Registry,
    world: World,
    pulse: Pulse,
    fabric: Box<dyn Fabric>,
    cfg: crate::config::Config,
    /// Incumbent we asked for a snapshot.
    awaiting: Option<String>,
    adopted: bool,
    handing_off: Option<(String, Instant)>,
    exit: Option<RunExit>,
}

impl Runtime {
    pub fn new(
        cfg: crate::config::Config,
        reg: Registry,
        store: EntityStore,
        mut fabric: Box<dyn Fabric>,
        started: Instant,
    ) -> Result<Self, FabricError> {
        for ch in [RELOAD_REQUEST, RELOAD_SNAPSHOT, RELOAD_COMPLETE] {
            fabric.subscribe(ch)?;
        }
        for ch in reg.channels() {
            fabric.subscribe(ch)?;
        }
        let outbox = Outbox::new(cfg.fabric_retry(), cfg.fabric_max_attempts, cfg.fabric_outbox);
        let world = World::new(cfg.node_id.clone(), store, cfg.limits(), outbox);
        let pulse = Pulse::new(cfg.tick_len(), started, &reg);
        Ok(Self {
            reg,
            world,
            pulse,
            fabric,
            cfg,
            awaiting: None,
            adopted: false,
            handing_off: None,
            exit: None,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.reg
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn finished(&self) -> Option<&RunExit> {
        self.exit.as_ref()
    }

    pub fn handle_net(&mut self, ev: NetEvent) {
        if self.handing_off.is_some() || self.exit.is_some() {
            info!(conn = %ev.conn(), event = ev.kind(), "input after handoff dropped");
            return;
        }
        match ev {
            NetEvent::Connect { conn, remote } => self.world.connect(&self.reg, conn, &remote),
            NetEvent::Line { conn, line } => self.world.handle_line(&self.reg, conn, &line),
            NetEvent::Disconnect { conn } => self.world.disconnect(&self.reg, conn),
        }
    }

    /// One bounded loop iteration.
    pub fn step(&mut self, now: Instant) {
        // Parked sessions belong to the successor once a handoff started.
        if self.pulse.advance(now) && self.handing_off.is_none() {
            self.pulse.run_due(&self.reg, &mut self.world);
            let tick = self.pulse.tick();
            self.reg.fire(&mut self.world, Event::post(PULSE_TICK).with("tick", tick));
        }
        self.pump_fabric();
        let r = self.world.outbox_mut().flush(self.fabric.as_mut(), now);
        if r.dropped > 0 {
            warn!(dropped = r.dropped, "fabric messages dropped");
        }
        if let Some((successor, deadline)) = &self.handing_off {
            if self.world.outbox_mut().is_empty() || now >= *deadline {
                info!(successor = %successor, "handoff complete");
                self.exit = Some(RunExit::HandedOff {
                    successor: successor.clone(),
                });
                self.handing_off = None;
            }
        }
    }

    fn pump_fabric(&mut self) {
        for _ in 0..FABRIC_DRAIN {
            let Some(msg) = self.fabric.try_recv() else {
                return;
            };
            match msg.channel.as_str() {
                RELOAD_REQUEST => self.on_reload_request(&msg),
                RELOAD_SNAPSHOT => self.on_snapshot(&msg),
                RELOAD_COMPLETE => info!(from = %msg.from, "peer finished reload"),
                _ => {
                    if self.reg.deliver(&mut self.world, &msg) == 0 {
                        debug!(channel = %msg.channel, "fabric message with no handler");
                    }
                }
            }
        }
    }

    fn on_reload_request(&mut self, msg: &Message) {
        let req: ReloadRequest = match serde_json::from_value(msg.body.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(from = %msg.from, err = %e, "bad reload request");
                return;
            }
        };
        if req.target != self.world.node() || self.handing_off.is_some() || self.exit.is_some() {
            return;
        }
        info!(successor = %req.from, "reload requested");
        match hand_off(&self.reg, &mut self.world, &req) {
            Ok(_) => {
                self.handing_off = Some((req.from, Instant::now() + self.cfg.rehome_timeout()));
            }
            Err(e) => warn!(err = %e, "could not queue reload snapshot; staying up"),
        }
    }

    fn on_snapshot(&mut self, msg: &Message) {
        let snap: ReloadSnapshot = match serde_json::from_value(msg.body.clone()) {
            Ok(s) => s,
            Err(e) => {
                warn!(from = %msg.from, err = %e, "bad reload snapshot");
                return;
            }
        };
        if snap.target != self.world.node() || self.awaiting.as_deref() != Some(snap.from.as_str()) {
            debug!(from = %snap.from, target = %snap.target, "snapshot not for us");
            return;
        }
        self.awaiting = None;
        if let Err(e) = self.world.store.load_all() {
            warn!(err = %e, "entity reload failed; adopting sessions anyway");
        }
        adopt_snapshot(&self.reg, &mut self.world, &snap);
        self.adopted = true;
        self.world.publish(
            RELOAD_COMPLETE,
            json!({ "from": self.world.node(), "sessions": snap.sessions.len() }),
        );
    }

    /// Ask `incumbent` to hand over its sessions.
    pub fn request_reload(&mut self, incumbent: &str) {
        let req = ReloadRequest {
            target: incumbent.to_string(),
            from: self.world.node().to_string(),
        };
        match serde_json::to_value(&req) {
            Ok(body) => {
                self.world.publish(RELOAD_REQUEST, body);
                self.awaiting = Some(incumbent.to_string());
            }
            Err(e) => warn!(err = %e, "could not encode reload request"),
        }
    }

    pub fn snapshot_adopted(&self) -> bool {
        self.adopted
    }

    /// Run steps until the requested snapshot was adopted or `timeout`
    /// passes. No gateway is attached meanwhile.
    pub async fn await_snapshot(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.step(now);
            self.discard_outbound();
            if self.adopted {
                return true;
            }
            if now >= deadline {
                warn!(waited_ms = timeout.as_millis() as u64, "no reload snapshot arrived");
                self.awaiting = None;
                return false;
            }
            let wait = self.next_wait(now).min(deadline - now);
            tokio::time::sleep(wait).await;
        }
    }

    pub fn take_outbound(&mut self) -> Vec<Outbound> {
        self.world.flush_output(&self.reg)
    }

    fn discard_outbound(&mut self) {
        let n = self.take_outbound().len();
        if n > 0 {
            debug!(dropped = n, "no gateway attached; output dropped");
        }
    }

    /// How long the loop may sleep before it has work to do.
    pub fn next_wait(&self, now: Instant) -> Duration {
        let tick = self.pulse.tick_len();
        let mut wait = self.pulse.until_due(now).map_or(tick, |d| d.min(tick));
        if let Some(at) = self.world.outbox_next_retry() {
            wait = wait.min(at.saturating_duration_since(now));
        }
        wait
    }

    /// The gateway link dropped: every transport is gone with it.
    pub fn gateway_lost(&mut self) {
        let parked = self.world.detach_all(&self.reg, "gateway lost");
        if parked > 0 {
            info!(parked, "sessions moved to limbo");
        }
    }

    pub fn shutdown(&mut self) {
        let r = self.world.save_dirty(&self.reg);
        info!(saved = r.saved, failed = r.failed.len(), "shutdown save");
    }

    /// Accept gateway links one at a time and run the loop until a handoff
    /// completes or `shutdown` resolves.
    pub async fn serve<F>(&mut self, listener: TcpListener, shutdown: F) -> anyhow::Result<RunExit>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            if let Some(exit) = self.exit.take() {
                return Ok(exit);
            }
            let wait = self.next_wait(Instant::now());
            tokio::select! {
                _ = shutdown.as_mut() => return Ok(RunExit::Shutdown),
                _ = tokio::time::sleep(wait) => {
                    self.step(Instant::now());
                    self.discard_outbound();
                }
                res = listener.accept() => {
                    let (stream, peer) = res.context("accept gateway link")?;
                    info!(peer = %peer, "gateway connected");
                    match self.serve_gateway(stream, shutdown.as_mut()).await {
                        Ok(Some(exit)) => return Ok(exit),
                        Ok(None) => info!(peer = %peer, "gateway link closed"),
                        Err(e) => warn!(peer = %peer, err = %format!("{e:#}"), "gateway link ended with error"),
                    }
                    self.gateway_lost();
                }
            }
        }
    }

    async fn serve_gateway<F>(
        &mut self,
        stream: TcpStream,
        mut shutdown: std::pin::Pin<&mut F>,
    ) -> anyhow::Result<Option<RunExit>>
    where
        F: Future<Output = ()>,
    {
        stream.set_nodelay(true).ok();
        let (rd, wr) = stream.into_split();
        let mut fr = FrameReader::new(rd);
        let mut fw = FrameWriter::new(wr);

        loop {
            self.step(Instant::now());
            for out in self.take_outbound() {
                write_core_msg(&mut fw, out).await?;
            }
            fw.flush().await?;
            if let Some(exit) = self.exit.take() {
                return Ok(Some(exit));
            }

            let wait = self.next_wait(Instant::now());
            tokio::select! {
                _ = shutdown.as_mut() => return Ok(Some(RunExit::Shutdown)),
                _ = tokio::time::sleep(wait) => {}
                res = fr.read_frame() => {
                    let Some(frame) = res.context("read gateway frame")? else {
                        return Ok(None);
                    };
                    match parse_gateway_msg(frame) {
                        Ok(msg) => self.handle_net(msg.into()),
                        Err(e) => warn!(err = %e, "bad gateway frame"),
                    }
                }
            }
        }
    }
}

async fn write_core_msg<W>(fw: &mut FrameWriter<W>, out: Outbound) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    match out {
        Outbound::Output { conn, text } => {
            fw.write_frame_parts(&[&header(OUT_OUTPUT, conn), text.as_bytes()])
                .await
        }
        Outbound::Close { conn } => fw.write_frame_parts(&[&header(OUT_CLOSE, conn)]).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::entity::EntityId;
    use crate::fabric::LocalHub;
    use crate::starter;
    use crate::store::MemoryBackend;
    use mudwire::gateway::{MSG_CONNECT, MSG_LINE, parse_core_msg};
    use mudwire::gateway::CoreMsg;

    fn runtime(node: &str, hub: &LocalHub, backend: &MemoryBackend, t0: Instant) -> Runtime {
        let cfg = Config {
            node_id: node.to_string(),
            tick_ms: 10,
            storage_backoff_ms: 1,
            ..Config::default()
        };
        let reg = starter::registry(&cfg).unwrap();
        let store = open_store(&cfg, &reg, Box::new(backend.clone()));
        Runtime::new(cfg, reg, store, Box::new(hub.connect(node)), t0).unwrap()
    }

    /// Account plus avatar in the start room, logged in on `conn` in the
    /// play shell. Returns the avatar.
    fn sign_in(rt: &mut Runtime, conn: ConnId, name: &str) -> EntityId {
        let w = &mut rt.world;
        let start = w
            .store
            .find("room", |e| e.flag("start"))
            .next()
            .map(|e| e.id())
            .unwrap();
        let avatar = w.store.create("character").unwrap().id();
        w.store.set(avatar, "name", name.into()).unwrap();
        w.store.set(avatar, "room", start.into()).unwrap();
        let acct = w.store.create("account").unwrap().id();
        w.store.set(acct, "name", name.into()).unwrap();
        w.store.set(acct, "password_hash", "x".into()).unwrap();
        w.store.set(acct, "avatar", avatar.into()).unwrap();
        rt.handle_net(NetEvent::Connect {
            conn,
            remote: "127.0.0.1:9".into(),
        });
        rt.world.login(&rt.reg, conn, acct, Some(avatar)).unwrap();
        rt.world.push_shell(&rt.reg, conn, starter::PLAY).unwrap();
        rt.take_outbound();
        avatar
    }

    fn line(rt: &mut Runtime, conn: ConnId, text: &str) {
        rt.handle_net(NetEvent::Line {
            conn,
            line: text.to_string(),
        });
    }

    fn text_for(out: &[Outbound], conn: ConnId) -> String {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Output { conn: c, text } if *c == conn => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn all_attrs(w: &World) -> Vec<(EntityId, String)> {
        let mut out = Vec::new();
        for kind in ["account", "character", "room"] {
            for e in w.store.find(kind, |_| true) {
                out.push((e.id(), format!("{:?}", e.attrs())));
            }
        }
        out
    }

    #[test]
    fn unknown_command_at_the_base_shell() {
        let t0 = Instant::now();
        let mut rt = runtime("a", &LocalHub::new(), &MemoryBackend::new(), t0);
        starter::seed(rt.world_mut()).unwrap();
        let before = all_attrs(rt.world());

        rt.handle_net(NetEvent::Connect {
            conn: ConnId(1),
            remote: "10.0.0.1:1".into(),
        });
        let banner = text_for(&rt.take_outbound(), ConnId(1));
        assert!(banner.starts_with("Welcome to tickmud.\r\n"));
        assert!(banner.ends_with("login> "));

        line(&mut rt, ConnId(1), "xyzzy");
        rt.step(t0);
        assert_eq!(text_for(&rt.take_outbound(), ConnId(1)), "Unknown command.\r\nlogin> ");
        assert_eq!(all_attrs(rt.world()), before);
    }

    #[test]
    fn move_east_reaches_the_other_room_as_a_broadcast() {
        let t0 = Instant::now();
        let mut rt = runtime("a", &LocalHub::new(), &MemoryBackend::new(), t0);
        starter::seed(rt.world_mut()).unwrap();
        let a = sign_in(&mut rt, ConnId(1), "Ann");
        sign_in(&mut rt, ConnId(2), "Bob");
        line(&mut rt, ConnId(2), "east");
        rt.take_outbound();

        line(&mut rt, ConnId(1), "move east");
        rt.step(t0);
        let out = rt.take_outbound();
        assert_eq!(text_for(&out, ConnId(2)), "Someone arrives from the west.\r\n> ");
        assert!(text_for(&out, ConnId(1)).starts_with("Market\r\n"));
        let room = rt.world().store.get(a).unwrap().entity_ref("room").unwrap();
        assert_eq!(rt.world().store.get(room).unwrap().text("name"), Some("Market"));
    }

    #[test]
    fn reload_hands_sessions_to_the_successor() {
        let t0 = Instant::now();
        let hub = LocalHub::new();
        let disk = MemoryBackend::new();
        let mut old = runtime("old", &hub, &disk, t0);
        starter::seed(old.world_mut()).unwrap();
        let avatar = sign_in(&mut old, ConnId(7), "Ann");
        line(&mut old, ConnId(7), "notes");
        line(&mut old, ConnId(7), "add remember the milk");
        old.take_outbound();
        let before = format!("{:?}", old.world().store.get(avatar).unwrap().attrs());

        let mut new = runtime("new", &hub, &disk, t0);
        new.request_reload("old");
        new.step(t0);
        old.step(t0);
        assert_eq!(
            old.finished(),
            Some(&RunExit::HandedOff {
                successor: "new".into()
            })
        );
        assert_eq!(
            old.world().sessions.get(ConnId(7)).unwrap().state(),
            SessionState::Limbo
        );
        line(&mut old, ConnId(7), "done");
        assert_eq!(old.world().sessions.get(ConnId(7)).unwrap().top_shell(), Some(starter::NOTES));

        new.step(t0);
        assert!(new.snapshot_adopted());
        assert_eq!(
            new.world().sessions.get(ConnId(7)).unwrap().state(),
            SessionState::Limbo
        );

        new.handle_net(NetEvent::Connect {
            conn: ConnId(7),
            remote: "127.0.0.1:9".into(),
        });
        let s = new.world().sessions.get(ConnId(7)).unwrap();
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.shell_names(), vec![starter::LOGIN, starter::PLAY, starter::NOTES]);
        assert_eq!(format!("{:?}", new.world().store.get(avatar).unwrap().attrs()), before);

        let out = text_for(&new.take_outbound(), ConnId(7));
        assert!(out.starts_with("Welcome back.\r\n"));
        assert!(out.ends_with("notes> "));
    }

    #[test]
    fn reload_keeps_clients_still_at_the_login_prompt() {
        let t0 = Instant::now();
        let hub = LocalHub::new();
        let disk = MemoryBackend::new();
        let mut old = runtime("old", &hub, &disk, t0);
        starter::seed(old.world_mut()).unwrap();
        old.handle_net(NetEvent::Connect {
            conn: ConnId(3),
            remote: "10.0.0.3:3".into(),
        });
        old.take_outbound();

        let mut new = runtime("new", &hub, &disk, t0);
        new.request_reload("old");
        new.step(t0);
        old.step(t0);
        assert!(old.finished().is_some());
        let out = old.take_outbound();
        assert!(!out.iter().any(|o| matches!(o, Outbound::Close { .. })), "{out:?}");

        // Input still reaching the old core is dropped, not run.
        let late = NetEvent::Line {
            conn: ConnId(3),
            line: "create Bob hunter22".into(),
        };
        assert_eq!((late.conn(), late.kind()), (ConnId(3), "line"));
        old.handle_net(late);
        let parked = old.world().sessions.get(ConnId(3)).unwrap();
        assert_eq!(parked.state(), SessionState::Limbo);
        assert!(parked.pending_output().is_empty());
        assert!(old.world().store.find("account", |_| true).next().is_none());

        new.step(t0);
        assert!(new.snapshot_adopted());
        new.handle_net(NetEvent::Connect {
            conn: ConnId(3),
            remote: "10.0.0.3:3".into(),
        });
        let s = new.world().sessions.get(ConnId(3)).unwrap();
        assert_eq!(s.state(), SessionState::Connecting);
        assert_eq!(s.top_shell(), Some(starter::LOGIN));

        line(&mut new, ConnId(3), "xyzzy");
        assert_eq!(text_for(&new.take_outbound(), ConnId(3)), "Unknown command.\r\nlogin> ");
    }

    #[test]
    fn unclaimed_snapshot_sessions_expire() {
        let t0 = Instant::now();
        let hub = LocalHub::new();
        let disk = MemoryBackend::new();
        let mut old = runtime("old", &hub, &disk, t0);
        starter::seed(old.world_mut()).unwrap();
        sign_in(&mut old, ConnId(7), "Ann");

        let mut new = runtime("new", &hub, &disk, t0);
        new.request_reload("old");
        new.step(t0);
        old.step(t0);
        new.step(t0);
        assert_eq!(new.world().sessions.len(), 1);

        // 30 s window at 10 ms ticks.
        new.step(t0 + Duration::from_millis(29_990));
        assert_eq!(new.world().sessions.len(), 1);
        new.step(t0 + Duration::from_millis(30_000));
        assert!(new.world().sessions.is_empty());
    }

    #[tokio::test]
    async fn waiting_for_a_missing_incumbent_gives_up() {
        let mut rt = runtime("new", &LocalHub::new(), &MemoryBackend::new(), Instant::now());
        rt.request_reload("nobody");
        assert!(!rt.await_snapshot(Duration::from_millis(30)).await);
        assert!(!rt.snapshot_adopted());
    }

    #[tokio::test]
    async fn serves_a_gateway_link() {
        let mut rt = runtime("a", &LocalHub::new(), &MemoryBackend::new(), Instant::now());
        starter::seed(rt.world_mut()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let gateway = async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (rd, wr) = stream.into_split();
            let mut fr = FrameReader::new(rd);
            let mut fw = FrameWriter::new(wr);
            let conn = ConnId(42);
            fw.write_frame_parts(&[&header(MSG_CONNECT, conn), b"10.9.8.7:1234"])
                .await
                .unwrap();
            fw.write_frame_parts(&[&header(MSG_LINE, conn), b"xyzzy"])
                .await
                .unwrap();
            fw.flush().await.unwrap();
            let mut seen = String::new();
            while !seen.contains("Unknown command.") {
                let frame = fr.read_frame().await.unwrap().unwrap();
                match parse_core_msg(frame).unwrap() {
                    CoreMsg::Output { conn: c, text } => {
                        assert_eq!(c, conn);
                        seen.push_str(&String::from_utf8_lossy(&text));
                    }
                    CoreMsg::Close { .. } => panic!("unexpected close"),
                }
            }
            let _ = stop_tx.send(());
            seen
        };
        let shutdown = async move {
            let _ = stop_rx.await;
        };

        let (exit, seen) = tokio::join!(rt.serve(listener, shutdown), gateway);
        assert_eq!(exit.unwrap(), RunExit::Shutdown);
        assert!(seen.starts_with("Welcome to tickmud."));
    }
}
