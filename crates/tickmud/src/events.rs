//! Synchronous named events with ordered, isolated handlers.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use serde_json::Map;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::entity::EntityId;
use crate::registry::Registry;
use crate::world::World;

pub const ENTITY_SAVED: &str = "entity.saved";
pub const ENTITY_DELETED: &str = "entity.deleted";
pub const ENTITY_ATTR_CHANGED: &str = "entity.attr_changed";
pub const ENTITY_MOVING: &str = "entity.moving";
pub const ENTITY_MOVED: &str = "entity.moved";
pub const SESSION_STARTED: &str = "session.started";
pub const SESSION_ACTIVE: &str = "session.active";
pub const SESSION_LIMBO: &str = "session.limbo";
pub const SESSION_CLOSED: &str = "session.closed";
pub const PULSE_TICK: &str = "pulse.tick";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the action; any handler may veto it.
    Pre,
    /// After the action; report only.
    Post,
}

#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    phase: Phase,
    payload: Map<String, Json>,
    canceled: Option<String>,
}

impl Event {
    pub fn pre(name: &str) -> Self {
        Self::new(name, Phase::Pre)
    }

    pub fn post(name: &str) -> Self {
        Self::new(name, Phase::Post)
    }

    fn new(name: &str, phase: Phase) -> Self {
        Self {
            name: name.to_string(),
            phase,
            payload: Map::new(),
            canceled: None,
        }
    }

    pub fn with(mut self, key: &str, v: impl Into<Json>) -> Self {
        self.payload.insert(key.to_string(), v.into());
        self
    }

    pub fn with_entity(self, key: &str, id: EntityId) -> Self {
        self.with(key, id.encode())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn payload(&self) -> &Map<String, Json> {
        &self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.payload.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Json::as_str)
    }

    pub fn entity(&self, key: &str) -> Option<EntityId> {
        self.str_field(key).and_then(EntityId::decode)
    }

    /// Veto a pre-event. Ignored (and logged) on post-events.
    pub fn cancel(&mut self, reason: impl Into<String>) {
        if self.phase == Phase::Post {
            debug!(event = %self.name, "cancel ignored on post-event");
            return;
        }
        self.canceled = Some(reason.into());
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_some()
    }
}

pub type Handler = Box<dyn Fn(&Registry, &mut World, &mut Event) -> anyhow::Result<()> + Send + Sync>;

struct Registration {
    handler: &'static str,
    priority: i32,
    f: Handler,
}

/// Run one handler, turning a panic into an error so the caller can carry
/// on with the next one.
pub(crate) fn isolate<T, E>(f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
where
    E: From<anyhow::Error>,
{
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => r,
        Err(payload) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload)).into()),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: &'static str,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub canceled: bool,
    pub reason: Option<String>,
    pub ran: usize,
    pub failures: Vec<HandlerFailure>,
}

/// One ordered handler list per event name. Built at startup; dispatch only
/// reads it.
#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<String, Vec<Registration>>,
}

impl EventBus {
    /// Handlers run in ascending `priority`; equal priorities run in the
    /// order they were registered.
    pub fn register<F>(&mut self, event: &str, handler: &'static str, priority: i32, f: F)
    where
        F: Fn(&Registry, &mut World, &mut Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let list = self.handlers.entry(event.to_string()).or_default();
        let at = list.partition_point(|r| r.priority <= priority);
        list.insert(
            at,
            Registration {
                handler,
                priority,
                f: Box::new(f),
            },
        );
    }

    pub fn handler_names(&self, event: &str) -> Vec<&'static str> {
        self.handlers
            .get(event)
            .map(|l| l.iter().map(|r| r.handler).collect())
            .unwrap_or_default()
    }

    /// Run every handler for `ev`. A failing handler is logged and recorded;
    /// the rest still run. A cancel on a pre-event stops dispatch.
    pub fn dispatch(&self, reg: &Registry, world: &mut World, mut ev: Event) -> Outcome {
        let mut out = Outcome::default();
        let Some(list) = self.handlers.get(&ev.name) else {
            return out;
        };
        for r in list {
            out.ran += 1;
            if let Err(e) = isolate(|| (r.f)(reg, world, &mut ev)) {
                warn!(event = %ev.name, handler = r.handler, err = %format!("{e:#}"), "event handler failed");
                out.failures.push(HandlerFailure {
                    handler: r.handler,
                    error: format!("{e:#}"),
                });
            }
            if ev.phase == Phase::Pre && ev.is_canceled() {
                debug!(event = %ev.name, handler = r.handler, "event canceled");
                break;
            }
        }
        out.canceled = ev.is_canceled();
        out.reason = ev.canceled;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use crate::world::tests::world_for;
    use std::sync::Arc;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder(log: &Log, name: &'static str) -> impl Fn(&Registry, &mut World, &mut Event) -> anyhow::Result<()> + Send + Sync + 'static {
        let log = log.clone();
        move |_, _, _| {
            log.lock().unwrap().push(name);
            Ok(())
        }
    }

    #[test]
    fn priority_then_registration_order() {
        let log: Log = Arc::default();
        let mut b = RegistryBuilder::new();
        b.on("ping", "late", 10, recorder(&log, "late"));
        b.on("ping", "first", -5, recorder(&log, "first"));
        b.on("ping", "mid-a", 0, recorder(&log, "mid-a"));
        b.on("ping", "mid-b", 0, recorder(&log, "mid-b"));
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);

        let out = reg.fire(&mut w, Event::post("ping"));
        assert_eq!(out.ran, 4);
        assert_eq!(*log.lock().unwrap(), vec!["first", "mid-a", "mid-b", "late"]);
        assert_eq!(reg.events().handler_names("ping"), vec!["first", "mid-a", "mid-b", "late"]);
    }

    #[test]
    fn failing_handler_does_not_stop_the_rest() {
        let log: Log = Arc::default();
        let mut b = RegistryBuilder::new();
        b.on("ping", "one", 0, recorder(&log, "one"));
        b.on("ping", "boom", 1, |_, _, _| anyhow::bail!("kaboom"));
        b.on("ping", "three", 2, recorder(&log, "three"));
        b.on("ping", "four", 3, recorder(&log, "four"));
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);

        let out = reg.fire(&mut w, Event::post("ping"));
        assert_eq!(out.ran, 4);
        assert_eq!(
            out.failures,
            vec![HandlerFailure {
                handler: "boom",
                error: "kaboom".into()
            }]
        );
        assert_eq!(*log.lock().unwrap(), vec!["one", "three", "four"]);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let log: Log = Arc::default();
        let mut b = RegistryBuilder::new();
        b.on("ping", "oob", 0, |_, _, _| panic!("index out of bounds"));
        b.on("ping", "after", 1, recorder(&log, "after"));
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);

        let out = reg.fire(&mut w, Event::post("ping"));
        assert_eq!(out.ran, 2);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].handler, "oob");
        assert!(out.failures[0].error.starts_with("panicked: "));
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
    }

    #[test]
    fn pre_event_veto_short_circuits() {
        let log: Log = Arc::default();
        let mut b = RegistryBuilder::new();
        b.on("open", "guard", 0, |_, _, ev| {
            if ev.str_field("door") == Some("vault") {
                ev.cancel("The vault is sealed.");
            }
            Ok(())
        });
        b.on("open", "after", 1, recorder(&log, "after"));
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);

        let out = reg.fire(&mut w, Event::pre("open").with("door", "vault"));
        assert!(out.canceled);
        assert_eq!(out.reason.as_deref(), Some("The vault is sealed."));
        assert_eq!(out.ran, 1);
        assert!(log.lock().unwrap().is_empty());

        let out = reg.fire(&mut w, Event::pre("open").with("door", "shed"));
        assert!(!out.canceled);
        assert_eq!(out.ran, 2);
    }

    #[test]
    fn post_events_cannot_be_canceled() {
        let mut b = RegistryBuilder::new();
        b.on("moved", "grumpy", 0, |_, _, ev| {
            ev.cancel("no");
            Ok(())
        });
        b.on("moved", "next", 1, |_, _, _| Ok(()));
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);

        let out = reg.fire(&mut w, Event::post("moved"));
        assert!(!out.canceled);
        assert_eq!(out.ran, 2);
    }

    #[test]
    fn handlers_can_fire_nested_events() {
        let log: Log = Arc::default();
        let mut b = RegistryBuilder::new();
        b.on("outer", "relay", 0, |reg, w, _| {
            reg.fire(w, Event::post("inner"));
            Ok(())
        });
        b.on("inner", "leaf", 0, recorder(&log, "leaf"));
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);

        assert_eq!(reg.fire(&mut w, Event::post("outer")).ran, 1);
        assert_eq!(*log.lock().unwrap(), vec!["leaf"]);
        assert_eq!(reg.fire(&mut w, Event::post("nobody")).ran, 0);
    }
}
