mod hub;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use mudwire::ConnId;
use mudwire::gateway::{
    CoreMsg, GatewayMsg, MSG_CONNECT, MSG_DISCONNECT, MSG_LINE, header, parse_core_msg,
};
use tickio::frame::{FrameReader, FrameWriter};
use tickio::line::LineBuffer;
use tickio::telnet::TelnetFilter;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::sync::{mpsc, watch};
use tracing::{Level, debug, info, warn};

fn usage_and_exit() -> ! {
    eprintln!(
        "tickmud_gateway (telnet gateway and fabric hub)\n\n\
USAGE:\n  tickmud_gateway [--bind HOST:PORT] [--core-addr HOST:PORT] [--fabric-sock PATH] [--max-line N]\n\n\
ENV:\n  TICKMUD_BIND         default 0.0.0.0:4000\n  TICKMUD_CORE_ADDR    default 127.0.0.1:5000\n  TICKMUD_FABRIC_SOCK  default /run/tickmud/fabric.sock\n  TICKMUD_MAX_LINE     default 4096 (bytes per input line)\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
struct Config {
    bind: SocketAddr,
    core_addr: SocketAddr,
    fabric_sock: PathBuf,
    max_line: usize,
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("TICKMUD_BIND")
        .unwrap_or_else(|_| "0.0.0.0:4000".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut core_addr: SocketAddr = std::env::var("TICKMUD_CORE_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:5000".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());
    let mut fabric_sock = PathBuf::from(
        std::env::var("TICKMUD_FABRIC_SOCK")
            .unwrap_or_else(|_| "/run/tickmud/fabric.sock".to_string()),
    );
    let mut max_line: usize = std::env::var("TICKMUD_MAX_LINE")
        .unwrap_or_else(|_| "4096".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--bind" => {
                bind = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage_and_exit());
            }
            "--core-addr" => {
                core_addr = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage_and_exit());
            }
            "--fabric-sock" => {
                fabric_sock = args
                    .next()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| usage_and_exit());
            }
            "--max-line" => {
                max_line = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage_and_exit());
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        core_addr,
        fabric_sock,
        max_line,
    }
}

struct ConnInfo {
    remote: String,
    write_tx: mpsc::Sender<Bytes>,
    close_tx: watch::Sender<bool>,
}

type Conns = Arc<tokio::sync::Mutex<HashMap<ConnId, ConnInfo>>>;

fn new_conn_id() -> anyhow::Result<ConnId> {
    let mut b = [0u8; 16];
    getrandom::getrandom(&mut b).map_err(|e| anyhow::anyhow!("getrandom failed: {e}"))?;
    Ok(ConnId::from_be_bytes(b))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tickmud_gateway=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = Arc::new(parse_args());

    if let Some(dir) = cfg.fabric_sock.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create fabric socket dir {}", dir.display()))?;
    }
    // A socket left behind by a previous run would make bind fail.
    let _ = std::fs::remove_file(&cfg.fabric_sock);
    let fabric = UnixListener::bind(&cfg.fabric_sock)
        .with_context(|| format!("bind fabric socket {}", cfg.fabric_sock.display()))?;
    tokio::spawn(hub::serve(fabric, hub::Hub::new()));

    let listener = TcpListener::bind(cfg.bind)
        .await
        .with_context(|| format!("bind {}", cfg.bind))?;

    let conns: Conns = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
    let (core_tx, core_rx) = mpsc::channel::<GatewayMsg>(4096);
    tokio::spawn(core_link_task(cfg.core_addr, conns.clone(), core_rx));

    info!(
        bind = %cfg.bind,
        core_addr = %cfg.core_addr,
        fabric_sock = %cfg.fabric_sock.display(),
        "gateway listening"
    );

    loop {
        let (stream, peer) = listener.accept().await?;
        let conns = conns.clone();
        let core_tx = core_tx.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, peer, conns, core_tx, cfg).await {
                warn!(peer = %peer, err = %e, "connection ended with error");
            }
        });
    }
}

async fn core_link_task(core_addr: SocketAddr, conns: Conns, mut rx: mpsc::Receiver<GatewayMsg>) {
    let mut announced_down = false;

    loop {
        match TcpStream::connect(core_addr).await {
            Ok(stream) => {
                announced_down = false;
                info!(core_addr = %core_addr, "connected to core");

                let (rd, wr) = stream.into_split();
                let mut fr = FrameReader::new(rd);
                let mut fw = FrameWriter::new(wr);

                // Re-announce every live connection so the core can rehome it.
                let live = {
                    let m = conns.lock().await;
                    m.iter()
                        .map(|(conn, c)| (*conn, c.remote.clone()))
                        .collect::<Vec<_>>()
                };
                for (conn, remote) in live {
                    let _ = fw
                        .write_frame_parts(&[header(MSG_CONNECT, conn).as_slice(), remote.as_bytes()])
                        .await;
                }
                let _ = fw.flush().await;

                loop {
                    tokio::select! {
                        msg = rx.recv() => {
                            let Some(msg) = msg else {
                                return;
                            };
                            if write_gateway_msg(&mut fw, &msg).await.is_err() {
                                break;
                            }
                        }
                        res = fr.read_frame() => {
                            let frame = match res {
                                Ok(Some(f)) => f,
                                Ok(None) => break,
                                Err(_) => break,
                            };
                            match parse_core_msg(frame) {
                                Ok(msg) => route_core_msg(msg, &conns).await,
                                Err(e) => warn!(err = %e, "bad core message"),
                            }
                        }
                    }
                }

                warn!(core_addr = %core_addr, "core disconnected; reconnecting");
                notify_all(&conns, b"# core disconnected; reconnecting...\r\n").await;
            }
            Err(e) => {
                if !announced_down {
                    announced_down = true;
                    warn!(core_addr = %core_addr, err = %e, "core offline; retrying");
                    notify_all(&conns, b"# core offline; retrying...\r\n").await;
                }

                // Don't let the outbound queue grow unbounded while offline.
                while let Ok(msg) = rx.try_recv() {
                    if let GatewayMsg::Line { conn, .. } = msg {
                        notify_one(&conns, conn, b"# core offline; input dropped\r\n").await;
                    }
                }

                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

async fn write_gateway_msg(
    fw: &mut FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
    msg: &GatewayMsg,
) -> std::io::Result<()> {
    match msg {
        GatewayMsg::Connect { conn, remote } => {
            fw.write_frame_parts(&[header(MSG_CONNECT, *conn).as_slice(), &remote[..]])
                .await?
        }
        GatewayMsg::Line { conn, line } => {
            fw.write_frame_parts(&[header(MSG_LINE, *conn).as_slice(), &line[..]])
                .await?
        }
        GatewayMsg::Disconnect { conn } => {
            fw.write_frame_parts(&[header(MSG_DISCONNECT, *conn).as_slice()])
                .await?
        }
    }
    fw.flush().await
}

async fn route_core_msg(msg: CoreMsg, conns: &Conns) {
    match msg {
        CoreMsg::Output { conn, text } => {
            let tx = {
                let m = conns.lock().await;
                m.get(&conn).map(|c| c.write_tx.clone())
            };
            match tx {
                Some(tx) => {
                    let _ = tx.send(text).await;
                }
                None => debug!(conn = %conn, "output for unknown connection"),
            }
        }
        CoreMsg::Close { conn } => {
            let m = conns.lock().await;
            if let Some(c) = m.get(&conn) {
                let _ = c.close_tx.send(true);
            }
        }
    }
}

async fn notify_all(conns: &Conns, msg: &'static [u8]) {
    let txs = {
        let m = conns.lock().await;
        m.values().map(|c| c.write_tx.clone()).collect::<Vec<_>>()
    };
    for tx in txs {
        let _ = tx.send(Bytes::from_static(msg)).await;
    }
}

async fn notify_one(conns: &Conns, conn: ConnId, msg: &'static [u8]) {
    let tx = {
        let m = conns.lock().await;
        m.get(&conn).map(|c| c.write_tx.clone())
    };
    if let Some(tx) = tx {
        let _ = tx.send(Bytes::from_static(msg)).await;
    }
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    conns: Conns,
    core_tx: mpsc::Sender<GatewayMsg>,
    cfg: Arc<Config>,
) -> anyhow::Result<()> {
    let conn = new_conn_id()?;
    let remote = peer.to_string();
    let (mut rd, mut wr) = stream.into_split();

    let (close_tx, mut close_rx) = watch::channel(false);
    let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(128);
    let writer = tokio::spawn(async move {
        while let Some(b) = write_rx.recv().await {
            if wr.write_all(&b[..]).await.is_err() {
                break;
            }
        }
        let _ = wr.shutdown().await;
    });

    conns.lock().await.insert(
        conn,
        ConnInfo {
            remote: remote.clone(),
            write_tx: write_tx.clone(),
            close_tx,
        },
    );
    info!(conn = %conn, peer = %peer, "connection opened");
    let _ = core_tx
        .send(GatewayMsg::Connect {
            conn,
            remote: Bytes::from(remote),
        })
        .await;

    let res = pump_input(&mut rd, conn, &write_tx, &core_tx, &mut close_rx, cfg.max_line).await;
    let closed_by_core = matches!(res, Ok(true));

    conns.lock().await.remove(&conn);
    // A close the core asked for is already final on its side.
    if !closed_by_core {
        let _ = core_tx.send(GatewayMsg::Disconnect { conn }).await;
    }
    info!(conn = %conn, peer = %peer, by_core = closed_by_core, "connection closed");

    drop(write_tx);
    let _ = writer.await;
    res.map(|_| ())
}

/// Feed socket input through telnet filtering and line splitting until EOF
/// or a core-requested close. Returns true for the latter.
async fn pump_input(
    rd: &mut tokio::net::tcp::OwnedReadHalf,
    conn: ConnId,
    write_tx: &mpsc::Sender<Bytes>,
    core_tx: &mpsc::Sender<GatewayMsg>,
    close_rx: &mut watch::Receiver<bool>,
    max_line: usize,
) -> anyhow::Result<bool> {
    let mut telnet = TelnetFilter::new();
    let mut lines = LineBuffer::new(max_line);
    let mut data = Vec::with_capacity(4096);
    let mut replies = Vec::new();

    let mut buf = [0u8; 4096];
    loop {
        let n = tokio::select! {
            res = rd.read(&mut buf) => res?,
            _ = close_rx.changed() => return Ok(true),
        };
        if n == 0 {
            return Ok(false);
        }

        data.clear();
        replies.clear();
        telnet.feed(&buf[..n], &mut data, &mut replies);
        if !replies.is_empty() {
            let _ = write_tx.send(Bytes::copy_from_slice(&replies)).await;
        }
        if data.is_empty() {
            continue;
        }

        lines.extend(&data);
        loop {
            match lines.next_line() {
                Ok(Some(line)) => {
                    let _ = core_tx.send(GatewayMsg::Line { conn, line }).await;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(conn = %conn, max = max_line, "input line too long; discarded");
                    let _ = write_tx
                        .send(Bytes::from_static(b"# line too long; discarded\r\n"))
                        .await;
                    break;
                }
            }
        }
    }
}
