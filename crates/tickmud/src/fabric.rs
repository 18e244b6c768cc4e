//! Cross-process publish/subscribe.
//!
//! The loop never awaits the fabric: received messages are drained with
//! `try_recv` on each wake and publishes go through an [`Outbox`] that
//! retries on a fixed cadence.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use mudwire::hub::{HUB_PUBLISH, HubMsg, channel_header, parse_hub_msg, subscribe};
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value as Json;
use tickio::frame::{FrameReader, FrameWriter, encode_frame};
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::FabricError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub channel: String,
    /// Node id of the publisher.
    pub from: String,
    pub body: Json,
}

pub trait Fabric: Send {
    fn node(&self) -> &str;
    fn subscribe(&mut self, channel: &str) -> Result<(), FabricError>;
    fn publish(&mut self, channel: &str, body: &Json) -> Result<(), FabricError>;
    /// Next message from a subscribed channel, never blocking. A node does
    /// not receive its own publishes.
    fn try_recv(&mut self) -> Option<Message>;
}

const LOCAL_CHANNEL_CAPACITY: usize = 256;

/// In-process hub. Every `LocalFabric` connected to the same hub sees the
/// others' publishes.
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<Message>>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, node: &str) -> LocalFabric {
        LocalFabric {
            node: node.to_string(),
            hub: self.clone(),
            subs: Vec::new(),
            subscribed: HashSet::new(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Message> {
        let mut chans = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        chans
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[derive(Debug)]
pub struct LocalFabric {
    node: String,
    hub: LocalHub,
    subs: Vec<broadcast::Receiver<Message>>,
    subscribed: HashSet<String>,
}

impl Fabric for LocalFabric {
    fn node(&self) -> &str {
        &self.node
    }

    fn subscribe(&mut self, channel: &str) -> Result<(), FabricError> {
        if self.subscribed.insert(channel.to_string()) {
            self.subs.push(self.hub.sender(channel).subscribe());
        }
        Ok(())
    }

    fn publish(&mut self, channel: &str, body: &Json) -> Result<(), FabricError> {
        let msg = Message {
            channel: channel.to_string(),
            from: self.node.clone(),
            body: body.clone(),
        };
        // No receivers is fine: nobody is listening on that channel yet.
        let _ = self.hub.sender(channel).send(msg);
        Ok(())
    }

    fn try_recv(&mut self) -> Option<Message> {
        for rx in &mut self.subs {
            loop {
                match rx.try_recv() {
                    Ok(m) if m.from == self.node => continue,
                    Ok(m) => return Some(m),
                    Err(broadcast::error::TryRecvError::Lagged(n)) => {
                        warn!(node = %self.node, skipped = n, "fabric subscriber lagged");
                    }
                    Err(_) => break,
                }
            }
        }
        None
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    from: String,
    body: Json,
}

const HUB_QUEUE: usize = 256;

/// Client of the gateway's fabric hub over a Unix socket. Reader and writer
/// run as background tasks; the loop only touches channels.
#[derive(Debug)]
pub struct HubFabric {
    node: String,
    out_tx: mpsc::Sender<Bytes>,
    in_rx: mpsc::Receiver<Message>,
    subscribed: HashSet<String>,
}

impl HubFabric {
    pub async fn connect(path: &Path, node: &str) -> Result<Self, FabricError> {
        let stream = UnixStream::connect(path).await?;
        let (rd, wr) = stream.into_split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(HUB_QUEUE);
        let (in_tx, in_rx) = mpsc::channel::<Message>(HUB_QUEUE * 4);

        tokio::spawn(async move {
            let mut fw = FrameWriter::new(wr);
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = fw.write_encoded(&frame).await {
                    warn!(err = %e, "fabric hub write failed");
                    break;
                }
                if fw.flush().await.is_err() {
                    break;
                }
            }
        });

        let me = node.to_string();
        tokio::spawn(async move {
            let mut fr = FrameReader::new(rd);
            loop {
                let payload = match fr.read_frame().await {
                    Ok(Some(p)) => p,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(err = %e, "fabric hub read failed");
                        break;
                    }
                };
                let (channel, payload) = match parse_hub_msg(payload) {
                    Ok(HubMsg::Deliver { channel, payload }) => (channel, payload),
                    Ok(other) => {
                        debug!(msg = ?other, "ignoring unexpected hub message");
                        continue;
                    }
                    Err(e) => {
                        warn!(err = %e, "bad hub frame");
                        continue;
                    }
                };
                let env: Envelope = match serde_json::from_slice(&payload) {
                    Ok(env) => env,
                    Err(e) => {
                        warn!(err = %e, "undecodable fabric payload");
                        continue;
                    }
                };
                if env.from == me {
                    continue;
                }
                let msg = Message {
                    channel: String::from_utf8_lossy(&channel).into_owned(),
                    from: env.from,
                    body: env.body,
                };
                if in_tx.send(msg).await.is_err() {
                    break;
                }
            }
            info!("fabric hub connection closed");
        });

        Ok(Self {
            node: node.to_string(),
            out_tx,
            in_rx,
            subscribed: HashSet::new(),
        })
    }

    fn queue(&self, frame: Bytes) -> Result<(), FabricError> {
        self.out_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FabricError::Full,
            mpsc::error::TrySendError::Closed(_) => FabricError::Closed,
        })
    }
}

impl Fabric for HubFabric {
    fn node(&self) -> &str {
        &self.node
    }

    fn subscribe(&mut self, channel: &str) -> Result<(), FabricError> {
        if self.subscribed.contains(channel) {
            return Ok(());
        }
        let sub = subscribe(channel)?;
        let frame = encode_frame(&[sub.as_slice()])?;
        self.queue(frame)?;
        self.subscribed.insert(channel.to_string());
        Ok(())
    }

    fn publish(&mut self, channel: &str, body: &Json) -> Result<(), FabricError> {
        let header = channel_header(HUB_PUBLISH, channel)?;
        let payload = serde_json::to_vec(&Envelope {
            from: self.node.clone(),
            body: body.clone(),
        })?;
        self.queue(encode_frame(&[header.as_slice(), payload.as_slice()])?)
    }

    fn try_recv(&mut self) -> Option<Message> {
        self.in_rx.try_recv().ok()
    }
}

struct Pending {
    channel: String,
    body: Json,
    attempts: u32,
    /// `None` until the first failed attempt.
    next_try: Option<Instant>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub dropped: usize,
}

/// Bounded queue of publishes waiting for the fabric. Order is kept: a
/// message that fails holds back the ones behind it until it is sent or
/// given up on.
pub struct Outbox {
    queue: VecDeque<Pending>,
    capacity: usize,
    retry: Duration,
    max_attempts: u32,
}

impl Outbox {
    pub fn new(retry: Duration, max_attempts: u32, capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            retry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Returns false (and drops the message) when the queue is full.
    pub fn push(&mut self, channel: &str, body: Json) -> bool {
        if self.queue.len() >= self.capacity {
            warn!(channel, queued = self.queue.len(), "fabric outbox full; dropping message");
            return false;
        }
        self.queue.push_back(Pending {
            channel: channel.to_string(),
            body,
            attempts: 0,
            next_try: None,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn next_retry(&self) -> Option<Instant> {
        self.queue.front().and_then(|p| p.next_try)
    }

    pub fn flush(&mut self, fabric: &mut dyn Fabric, now: Instant) -> FlushReport {
        let mut report = FlushReport::default();
        while let Some(p) = self.queue.front_mut() {
            if p.next_try.is_some_and(|t| t > now) {
                break;
            }
            match fabric.publish(&p.channel, &p.body) {
                Ok(()) => {
                    self.queue.pop_front();
                    report.sent += 1;
                }
                Err(e) => {
                    p.attempts += 1;
                    if p.attempts >= self.max_attempts {
                        warn!(channel = %p.channel, attempts = p.attempts, err = %e, "giving up on fabric publish");
                        self.queue.pop_front();
                        report.dropped += 1;
                        continue;
                    }
                    debug!(channel = %p.channel, attempts = p.attempts, err = %e, "fabric publish failed; will retry");
                    p.next_try = Some(now + self.retry);
                    break;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_fabric_delivers_to_other_subscribers_only() {
        let hub = LocalHub::new();
        let mut a = hub.connect("a");
        let mut b = hub.connect("b");
        let mut c = hub.connect("c");
        a.subscribe("world.broadcast").unwrap();
        b.subscribe("world.broadcast").unwrap();
        b.subscribe("world.broadcast").unwrap();

        a.publish("world.broadcast", &json!({"text": "hi"})).unwrap();
        let m = b.try_recv().unwrap();
        assert_eq!(m.from, "a");
        assert_eq!(m.body["text"], "hi");
        assert!(b.try_recv().is_none());
        assert!(a.try_recv().is_none());
        assert!(c.try_recv().is_none());
    }

    /// Fails the first `fail` publishes, then records what it is given.
    struct Flaky {
        fail: u32,
        sent: Vec<String>,
    }

    impl Fabric for Flaky {
        fn node(&self) -> &str {
            "flaky"
        }
        fn subscribe(&mut self, _: &str) -> Result<(), FabricError> {
            Ok(())
        }
        fn publish(&mut self, channel: &str, _: &Json) -> Result<(), FabricError> {
            if self.fail > 0 {
                self.fail -= 1;
                return Err(FabricError::Full);
            }
            self.sent.push(channel.to_string());
            Ok(())
        }
        fn try_recv(&mut self) -> Option<Message> {
            None
        }
    }

    #[test]
    fn outbox_retries_in_order_then_gives_up() {
        let t0 = Instant::now();
        let retry = Duration::from_millis(250);
        let mut out = Outbox::new(retry, 3, 8);
        let mut f = Flaky { fail: 1, sent: Vec::new() };
        out.push("one", json!(1));
        out.push("two", json!(2));

        assert_eq!(out.flush(&mut f, t0), FlushReport { sent: 0, dropped: 0 });
        assert_eq!(out.next_retry(), Some(t0 + retry));
        assert_eq!(out.flush(&mut f, t0 + Duration::from_millis(10)), FlushReport::default());
        assert_eq!(out.flush(&mut f, t0 + retry), FlushReport { sent: 2, dropped: 0 });
        assert_eq!(f.sent, vec!["one", "two"]);

        let mut f = Flaky { fail: 10, sent: Vec::new() };
        out.push("doomed", json!(null));
        out.push("after", json!(null));
        let mut now = t0;
        for _ in 0..3 {
            out.flush(&mut f, now);
            now += retry;
        }
        assert_eq!(out.len(), 1);
        f.fail = 0;
        out.flush(&mut f, now);
        assert_eq!(f.sent, vec!["after"]);
        assert!(out.is_empty());
    }

    #[test]
    fn outbox_is_bounded() {
        let t0 = Instant::now();
        let mut out = Outbox::new(Duration::from_millis(1), 1, 2);
        assert!(out.push("a", json!(1)));
        assert!(out.push("b", json!(2)));
        assert!(!out.push("c", json!(3)));
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn hub_fabric_speaks_the_hub_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fabric.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();

        // Minimal hub: echo the subscription back as a delivery from "z".
        let hub = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (rd, wr) = stream.into_split();
            let mut fr = FrameReader::new(rd);
            let mut fw = FrameWriter::new(wr);
            let sub = parse_hub_msg(fr.read_frame().await.unwrap().unwrap()).unwrap();
            let HubMsg::Subscribe { channel } = sub else {
                panic!("expected subscribe");
            };
            let published = parse_hub_msg(fr.read_frame().await.unwrap().unwrap()).unwrap();
            let env = serde_json::to_vec(&json!({"from": "z", "body": {"n": 1}})).unwrap();
            let chan = std::str::from_utf8(&channel).unwrap().to_string();
            let hdr = channel_header(mudwire::hub::HUB_DELIVER, &chan).unwrap();
            fw.write_frame_parts(&[hdr.as_slice(), env.as_slice()]).await.unwrap();
            fw.flush().await.unwrap();
            published
        });

        let mut f = HubFabric::connect(&path, "y").await.unwrap();
        f.subscribe("reload.request").unwrap();
        f.publish("reload.snapshot", &json!({"ok": true})).unwrap();

        let published = hub.await.unwrap();
        let HubMsg::Publish { channel, payload } = published else {
            panic!("expected publish");
        };
        assert_eq!(&channel[..], b"reload.snapshot");
        let env: Envelope = serde_json::from_slice(&payload).unwrap();
        assert_eq!(env.from, "y");

        let mut got = None;
        for _ in 0..100 {
            if let Some(m) = f.try_recv() {
                got = Some(m);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let m = got.expect("delivery");
        assert_eq!(m.channel, "reload.request");
        assert_eq!(m.from, "z");
        assert_eq!(m.body["n"], 1);
    }
}
