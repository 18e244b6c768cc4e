use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::pulse::{BadDuration, duration_to_ticks};
use crate::shell::ResolvePolicy;
use crate::world::Limits;

/// Core process settings. Read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the gateway link is accepted.
    pub bind: SocketAddr,
    pub tick_ms: u64,
    pub data_dir: PathBuf,
    /// How long a LIMBO session waits to be rehomed.
    pub rehome_timeout_ms: u64,
    pub log_path: Option<PathBuf>,
    pub fabric_sock: PathBuf,
    pub fabric_retry_ms: u64,
    pub fabric_max_attempts: u32,
    pub fabric_outbox: usize,
    pub storage_backoff_ms: u64,
    pub autosave_ticks: u64,
    pub idle_ticks: u64,
    pub shell_fallback: bool,
    pub node_id: String,
    /// Boot as the successor of this node.
    pub reload_from: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 5000)),
            tick_ms: 100,
            data_dir: PathBuf::from("data"),
            rehome_timeout_ms: 30_000,
            log_path: None,
            fabric_sock: PathBuf::from("/run/tickmud/fabric.sock"),
            fabric_retry_ms: 250,
            fabric_max_attempts: 8,
            fabric_outbox: 1024,
            storage_backoff_ms: 20,
            autosave_ticks: 1800,
            idle_ticks: 1800,
            shell_fallback: false,
            node_id: format!("core-{}", std::process::id()),
            reload_from: None,
        }
    }
}

impl Config {
    pub fn tick_len(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    /// Read an interval written as pulses, seconds or minutes
    /// (`"1800"`, `"30s"`, `"3m"`) at this config's tick length.
    pub fn ticks(&self, s: &str) -> Result<u64, BadDuration> {
        duration_to_ticks(s, self.tick_len())
    }

    pub fn rehome_timeout(&self) -> Duration {
        Duration::from_millis(self.rehome_timeout_ms)
    }

    pub fn fabric_retry(&self) -> Duration {
        Duration::from_millis(self.fabric_retry_ms)
    }

    pub fn storage_backoff(&self) -> Duration {
        Duration::from_millis(self.storage_backoff_ms)
    }

    pub fn entities_dir(&self) -> PathBuf {
        self.data_dir.join("entities")
    }

    pub fn resolve_policy(&self) -> ResolvePolicy {
        if self.shell_fallback {
            ResolvePolicy::FallbackToParents
        } else {
            ResolvePolicy::TopmostOnly
        }
    }

    /// Rehome window and idle threshold in ticks (rounded up).
    pub fn limits(&self) -> Limits {
        let tick = self.tick_ms.max(1);
        Limits {
            rehome_ticks: self.rehome_timeout_ms.div_ceil(tick).max(1),
            idle_ticks: self.idle_ticks.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_become_whole_ticks() {
        let cfg = Config {
            tick_ms: 40,
            rehome_timeout_ms: 1_010,
            ..Config::default()
        };
        assert_eq!(cfg.limits().rehome_ticks, 26);
        assert_eq!(cfg.tick_len(), Duration::from_millis(40));
        assert_eq!(cfg.resolve_policy(), ResolvePolicy::TopmostOnly);
        assert_eq!(cfg.entities_dir(), PathBuf::from("data/entities"));
    }

    #[test]
    fn intervals_follow_the_tick_length() {
        let cfg = Config {
            tick_ms: 250,
            ..Config::default()
        };
        assert_eq!(cfg.ticks("1800"), Ok(1800));
        assert_eq!(cfg.ticks("30s"), Ok(120));
        assert_eq!(cfg.ticks("3m"), Ok(720));
        assert!(cfg.ticks("half an hour").is_err());
    }
}
