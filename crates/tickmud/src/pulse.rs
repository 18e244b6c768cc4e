//! Fixed-length ticks and the callbacks that run on them.

use std::time::Duration;
use std::time::Instant;

use thiserror::Error;
use tracing::warn;

use crate::events::isolate;
use crate::registry::Registry;
use crate::world::World;

pub type PulseFn = Box<dyn Fn(&Registry, &mut World) -> anyhow::Result<()> + Send + Sync>;

/// A callback registered to run every `interval` ticks.
pub struct PulseDef {
    owner: &'static str,
    name: &'static str,
    interval: u64,
    f: PulseFn,
}

impl PulseDef {
    pub(crate) fn new<F>(owner: &'static str, name: &'static str, interval: u64, f: F) -> Self
    where
        F: Fn(&Registry, &mut World) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            owner,
            name,
            interval,
            f: Box::new(f),
        }
    }

    pub fn owner(&self) -> &'static str {
        self.owner
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulseFailure {
    pub owner: &'static str,
    pub name: &'static str,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct PulseReport {
    pub fired: Vec<&'static str>,
    pub failures: Vec<PulseFailure>,
}

/// Tick counter plus the next-fire tick of every registered callback.
///
/// The counter is derived from wall time (`started` + n * `tick_len`), so a
/// stalled loop jumps straight to the current tick on its next wake.
#[derive(Debug)]
pub struct Pulse {
    tick_len: Duration,
    started: Instant,
    tick: u64,
    next_fire: Vec<u64>,
}

impl Pulse {
    pub fn new(tick_len: Duration, started: Instant, reg: &Registry) -> Self {
        Self {
            tick_len: tick_len.max(Duration::from_millis(1)),
            started,
            tick: 0,
            next_fire: reg.pulses().iter().map(PulseDef::interval).collect(),
        }
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn tick_len(&self) -> Duration {
        self.tick_len
    }

    /// Bring the counter up to `now`. Returns whether it moved.
    pub fn advance(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.started);
        let t = (elapsed.as_nanos() / self.tick_len.as_nanos()) as u64;
        if t > self.tick {
            self.tick = t;
            return true;
        }
        false
    }

    pub fn next_due(&self) -> Option<u64> {
        self.next_fire.iter().min().copied()
    }

    /// Time from `now` until the earliest callback is due; zero if overdue.
    pub fn until_due(&self, now: Instant) -> Option<Duration> {
        let due = self.next_due()?;
        let nanos = self.tick_len.as_nanos().saturating_mul(u128::from(due));
        let at = self
            .started
            .checked_add(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))?;
        Some(at.saturating_duration_since(now))
    }

    /// Run every callback whose next-fire tick has been reached, in
    /// registration order. A callback that missed several boundaries runs
    /// once and is rescheduled to its next boundary after the current tick.
    pub fn run_due(&mut self, reg: &Registry, world: &mut World) -> PulseReport {
        world.set_tick(self.tick);
        let mut report = PulseReport::default();
        for (def, next) in reg.pulses().iter().zip(self.next_fire.iter_mut()) {
            if *next > self.tick {
                continue;
            }
            report.fired.push(def.name);
            if let Err(e) = isolate(|| (def.f)(reg, world)) {
                warn!(owner = def.owner, pulse = def.name, tick = self.tick, err = %format!("{e:#}"), "pulse callback failed");
                report.failures.push(PulseFailure {
                    owner: def.owner,
                    name: def.name,
                    error: format!("{e:#}"),
                });
            }
            *next += def.interval;
            if *next <= self.tick {
                let behind = self.tick - *next;
                *next += (behind / def.interval + 1) * def.interval;
            }
        }
        report
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad duration {0:?} (want a pulse count, \"<n>s\", \"<n>m\" or \"now\")")]
pub struct BadDuration(pub String);

/// Convert `"25"` (ticks), `"5s"`, `"3m"` or `"now"` to a tick count.
/// Non-zero durations shorter than a tick round up to one tick.
pub fn duration_to_ticks(s: &str, tick_len: Duration) -> Result<u64, BadDuration> {
    let s = s.trim().to_ascii_lowercase();
    if s == "now" {
        return Ok(0);
    }
    let bad = || BadDuration(s.clone());
    let (num, unit_ms) = if let Some(n) = s.strip_suffix('s') {
        (n, Some(1_000u128))
    } else if let Some(n) = s.strip_suffix('m') {
        (n, Some(60_000u128))
    } else {
        (s.as_str(), None)
    };
    let n: u64 = num.trim().parse().map_err(|_| bad())?;
    let Some(unit_ms) = unit_ms else {
        return Ok(n);
    };
    let total_ms = u128::from(n) * unit_ms;
    let tick_ms = tick_len.as_millis().max(1);
    let ticks = total_ms.div_ceil(tick_ms);
    u64::try_from(ticks).map_err(|_| bad())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryBuilder;
    use crate::world::tests::world_for;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK: Duration = Duration::from_millis(10);

    #[test]
    fn stalled_loop_fires_once_for_the_catch_up() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut b = RegistryBuilder::new();
        let h = hits.clone();
        b.every("test", "every5", 5, move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);
        let t0 = Instant::now();
        let mut p = Pulse::new(TICK, t0, &reg);

        assert!(!p.advance(t0 + Duration::from_millis(9)));
        assert!(p.run_due(&reg, &mut w).fired.is_empty());

        assert!(p.advance(t0 + Duration::from_millis(50)));
        p.run_due(&reg, &mut w);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(p.next_due(), Some(10));

        // Stall for three whole intervals.
        p.advance(t0 + Duration::from_millis(50 + 3 * 50 + 20));
        assert_eq!(p.tick(), 22);
        p.run_due(&reg, &mut w);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(p.next_due(), Some(25));

        // Same tick again: no duplicate fire.
        p.run_due(&reg, &mut w);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(w.tick(), 22);
    }

    #[test]
    fn due_callbacks_run_in_registration_order_and_failures_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut b = RegistryBuilder::new();
        let l = log.clone();
        b.every("a", "first", 2, move |_, _| {
            l.lock().unwrap().push("first");
            Ok(())
        });
        b.every("b", "broken", 1, |_, _| anyhow::bail!("nope"));
        let l = log.clone();
        b.every("c", "third", 2, move |_, _| {
            l.lock().unwrap().push("third");
            Ok(())
        });
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);
        let t0 = Instant::now();
        let mut p = Pulse::new(TICK, t0, &reg);

        p.advance(t0 + Duration::from_millis(20));
        let r = p.run_due(&reg, &mut w);
        assert_eq!(r.fired, vec!["first", "broken", "third"]);
        assert_eq!(r.failures.len(), 1);
        assert_eq!(r.failures[0].owner, "b");
        assert_eq!(*log.lock().unwrap(), vec!["first", "third"]);
    }

    #[test]
    fn panicking_callback_does_not_take_down_the_pulse() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut b = RegistryBuilder::new();
        b.every("a", "boom", 1, |_, _| panic!("bad state"));
        let h = hits.clone();
        b.every("b", "after", 1, move |_, _| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let reg = b.build().unwrap();
        let mut w = world_for(&reg);
        let t0 = Instant::now();
        let mut p = Pulse::new(TICK, t0, &reg);

        for n in 1..=2u64 {
            p.advance(t0 + TICK * n as u32);
            let r = p.run_due(&reg, &mut w);
            assert_eq!(r.failures.len(), 1);
            assert_eq!(r.failures[0].owner, "a");
            assert!(r.failures[0].error.contains("bad state"));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn wait_is_bounded_by_the_next_due_callback() {
        let mut b = RegistryBuilder::new();
        b.every("t", "x", 3, |_, _| Ok(()));
        let reg = b.build().unwrap();
        let t0 = Instant::now();
        let p = Pulse::new(TICK, t0, &reg);
        assert_eq!(p.until_due(t0), Some(Duration::from_millis(30)));
        assert_eq!(p.until_due(t0 + Duration::from_millis(45)), Some(Duration::ZERO));

        let empty = RegistryBuilder::new().build().unwrap();
        assert_eq!(Pulse::new(TICK, t0, &empty).until_due(t0), None);
    }

    #[test]
    fn durations() {
        let tick = Duration::from_millis(40);
        assert_eq!(duration_to_ticks("now", tick), Ok(0));
        assert_eq!(duration_to_ticks("25", tick), Ok(25));
        assert_eq!(duration_to_ticks("5s", tick), Ok(125));
        assert_eq!(duration_to_ticks("3m", tick), Ok(4500));
        assert_eq!(duration_to_ticks("1s", Duration::from_millis(300)), Ok(4));
        assert!(duration_to_ticks("soon", tick).is_err());
        assert!(duration_to_ticks("-1", tick).is_err());
    }
}
