use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use tickmud::config::Config;
use tickmud::fabric::{Fabric, HubFabric, LocalHub};
use tickmud::runtime::{RunExit, Runtime, open_store};
use tickmud::starter;
use tickmud::store::FileBackend;
use tokio::net::TcpListener;
use tracing::{Level, info, warn};

fn usage_and_exit() -> ! {
    eprintln!(
        "tickmud_core (game core)\n\n\
USAGE:\n  tickmud_core [--bind HOST:PORT] [--data-dir DIR] [--fabric-sock PATH] [--node-id ID] [--reload-from NODE]\n\n\
ENV:\n  TICKMUD_CORE_BIND            default 127.0.0.1:5000 (gateway link)\n  TICKMUD_TICK_MS              default 100\n  TICKMUD_DATA_DIR             default data\n  TICKMUD_REHOME_TIMEOUT_MS    default 30000\n  TICKMUD_LOG_PATH             optional; default stderr\n  TICKMUD_FABRIC_SOCK          default /run/tickmud/fabric.sock\n  TICKMUD_FABRIC_RETRY_MS      default 250\n  TICKMUD_FABRIC_MAX_ATTEMPTS  default 8\n  TICKMUD_STORAGE_BACKOFF_MS   default 20\n  TICKMUD_AUTOSAVE_TICKS       default 1800 (pulses, or \"<n>s\" / \"<n>m\")\n  TICKMUD_IDLE_TICKS           default 1800 (pulses, or \"<n>s\" / \"<n>m\")\n  TICKMUD_SHELL_FALLBACK       default 0 (1 lets commands fall through to lower shells)\n  NODE_ID                      default core-<pid>\n"
    );
    std::process::exit(2);
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| usage_and_exit()),
        Err(_) => default,
    }
}

fn parse_args() -> Config {
    let d = Config::default();
    let mut cfg = Config {
        bind: env_or("TICKMUD_CORE_BIND", d.bind),
        tick_ms: env_or("TICKMUD_TICK_MS", d.tick_ms),
        data_dir: env_or("TICKMUD_DATA_DIR", d.data_dir.clone()),
        rehome_timeout_ms: env_or("TICKMUD_REHOME_TIMEOUT_MS", d.rehome_timeout_ms),
        log_path: std::env::var("TICKMUD_LOG_PATH").ok().map(PathBuf::from),
        fabric_sock: env_or("TICKMUD_FABRIC_SOCK", d.fabric_sock.clone()),
        fabric_retry_ms: env_or("TICKMUD_FABRIC_RETRY_MS", d.fabric_retry_ms),
        fabric_max_attempts: env_or("TICKMUD_FABRIC_MAX_ATTEMPTS", d.fabric_max_attempts),
        storage_backoff_ms: env_or("TICKMUD_STORAGE_BACKOFF_MS", d.storage_backoff_ms),
        shell_fallback: env_or::<u8>("TICKMUD_SHELL_FALLBACK", 0) != 0,
        node_id: std::env::var("NODE_ID").unwrap_or_else(|_| d.node_id.clone()),
        ..d
    };
    // Intervals may be given as "30s" or "3m", so they wait for the tick length.
    if let Ok(v) = std::env::var("TICKMUD_AUTOSAVE_TICKS") {
        cfg.autosave_ticks = cfg.ticks(&v).unwrap_or_else(|_| usage_and_exit());
    }
    if let Ok(v) = std::env::var("TICKMUD_IDLE_TICKS") {
        cfg.idle_ticks = cfg.ticks(&v).unwrap_or_else(|_| usage_and_exit());
    }

    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--bind" => {
                cfg.bind = args
                    .next()
                    .and_then(|v| v.parse::<SocketAddr>().ok())
                    .unwrap_or_else(|| usage_and_exit());
            }
            "--data-dir" => {
                cfg.data_dir = args
                    .next()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| usage_and_exit());
            }
            "--fabric-sock" => {
                cfg.fabric_sock = args
                    .next()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| usage_and_exit());
            }
            "--node-id" => {
                cfg.node_id = args.next().unwrap_or_else(|| usage_and_exit());
            }
            "--reload-from" => {
                cfg.reload_from = Some(args.next().unwrap_or_else(|| usage_and_exit()));
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }
    cfg
}

fn init_logging(cfg: &Config) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tickmud=info,tickmud_core=info".into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_max_level(Level::INFO);

    match &cfg.log_path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create log dir {}", dir.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.init(),
    }
    Ok(())
}

async fn connect_fabric(cfg: &Config) -> Box<dyn Fabric> {
    match HubFabric::connect(&cfg.fabric_sock, &cfg.node_id).await {
        Ok(f) => Box::new(f),
        Err(e) => {
            warn!(
                fabric_sock = %cfg.fabric_sock.display(),
                err = %e,
                "fabric hub unreachable; running without cross-process messaging"
            );
            Box::new(LocalHub::new().connect(&cfg.node_id))
        }
    }
}

async fn bind_with_retry(addr: SocketAddr, within: Duration) -> anyhow::Result<TcpListener> {
    let deadline = Instant::now() + within;
    loop {
        match TcpListener::bind(addr).await {
            Ok(l) => return Ok(l),
            // During a reload the incumbent may still hold the port.
            Err(e) if Instant::now() < deadline => {
                warn!(bind = %addr, err = %e, "gateway port busy; retrying");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(e) => return Err(e).with_context(|| format!("bind {addr}")),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = parse_args();
    init_logging(&cfg)?;

    let reg = starter::registry(&cfg).context("build registry")?;
    let backend = FileBackend::open(cfg.entities_dir())
        .with_context(|| format!("open entity dir {}", cfg.entities_dir().display()))?;
    let store = open_store(&cfg, &reg, Box::new(backend));
    let fabric = connect_fabric(&cfg).await;

    let mut runtime = Runtime::new(cfg.clone(), reg, store, fabric, Instant::now())
        .context("subscribe fabric channels")?;

    let mut adopted = false;
    if let Some(incumbent) = &cfg.reload_from {
        info!(node = %cfg.node_id, incumbent = %incumbent, "booting as reload successor");
        runtime.request_reload(incumbent);
        adopted = runtime.await_snapshot(cfg.rehome_timeout()).await;
        if !adopted {
            warn!(incumbent = %incumbent, "reload handoff failed; cold start");
        }
    }
    if !adopted {
        let r = runtime
            .world_mut()
            .store
            .load_all()
            .context("load entities")?;
        info!(loaded = r.loaded, skipped = r.skipped, "entities loaded");
    }
    starter::seed(runtime.world_mut()).context("seed world")?;

    let listener = bind_with_retry(cfg.bind, cfg.rehome_timeout()).await?;
    info!(
        node = %cfg.node_id,
        bind = %cfg.bind,
        data_dir = %cfg.data_dir.display(),
        tick_ms = cfg.tick_ms,
        "core listening for gateway"
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    match runtime.serve(listener, shutdown).await? {
        RunExit::HandedOff { successor } => {
            info!(successor = %successor, "handed off; exiting");
        }
        RunExit::Shutdown => {
            info!("shutting down");
            runtime.shutdown();
        }
    }
    Ok(())
}
