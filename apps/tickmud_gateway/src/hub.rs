//! Fabric hub: a Unix-socket relay between core processes.
//!
//! Each client subscribes to channels by name; every publish is delivered
//! to every client subscribed to its channel. The hub lives in the gateway
//! so it outlasts any one core.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use mudwire::hub::{HUB_DELIVER, HubMsg, channel_header, parse_hub_msg};
use tickio::frame::{FrameReader, FrameWriter, encode_frame};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CLIENT_QUEUE: usize = 1024;

struct Client {
    subs: HashSet<String>,
    tx: mpsc::Sender<Bytes>,
}

#[derive(Clone, Default)]
pub struct Hub {
    clients: Arc<Mutex<HashMap<u64, Client>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    async fn deliver(&self, channel: &str, payload: &[u8]) -> usize {
        let frame = match channel_header(HUB_DELIVER, channel)
            .map_err(std::io::Error::other)
            .and_then(|h| encode_frame(&[h.as_slice(), payload]))
        {
            Ok(f) => f,
            Err(e) => {
                warn!(channel, err = %e, "cannot frame delivery");
                return 0;
            }
        };
        let m = self.clients.lock().await;
        let mut n = 0;
        for (id, c) in m.iter().filter(|(_, c)| c.subs.contains(channel)) {
            match c.tx.try_send(frame.clone()) {
                Ok(()) => n += 1,
                Err(_) => warn!(client = id, channel, "fabric client backed up; delivery dropped"),
            }
        }
        n
    }
}

pub async fn serve(listener: UnixListener, hub: Hub) {
    let mut next_id = 0u64;
    loop {
        let stream = match listener.accept().await {
            Ok((s, _)) => s,
            Err(e) => {
                warn!(err = %e, "fabric accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        next_id += 1;
        let id = next_id;
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, hub.clone(), id).await {
                warn!(client = id, err = %e, "fabric client ended with error");
            }
            hub.clients.lock().await.remove(&id);
            info!(client = id, "fabric client gone");
        });
    }
}

async fn handle_client(stream: UnixStream, hub: Hub, id: u64) -> anyhow::Result<()> {
    let (rd, wr) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(CLIENT_QUEUE);
    hub.clients.lock().await.insert(
        id,
        Client {
            subs: HashSet::new(),
            tx,
        },
    );
    info!(client = id, "fabric client connected");

    let writer = tokio::spawn(async move {
        let mut fw = FrameWriter::new(wr);
        while let Some(frame) = rx.recv().await {
            if fw.write_encoded(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut fr = FrameReader::new(rd);
    while let Some(frame) = fr.read_frame().await? {
        match parse_hub_msg(frame) {
            Ok(HubMsg::Subscribe { channel }) => {
                let channel = String::from_utf8_lossy(&channel).into_owned();
                debug!(client = id, channel = %channel, "subscribe");
                if let Some(c) = hub.clients.lock().await.get_mut(&id) {
                    c.subs.insert(channel);
                }
            }
            Ok(HubMsg::Publish { channel, payload }) => {
                let channel = String::from_utf8_lossy(&channel);
                let n = hub.deliver(&channel, &payload).await;
                debug!(client = id, channel = %channel, delivered = n, "publish");
            }
            Ok(HubMsg::Deliver { .. }) => warn!(client = id, "client sent a deliver frame"),
            Err(e) => warn!(client = id, err = %e, "bad fabric frame"),
        }
    }
    writer.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mudwire::hub::{HUB_PUBLISH, subscribe};
    use std::time::Duration;

    #[tokio::test]
    async fn publishes_reach_subscribers_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(serve(listener, Hub::new()));

        let (a_rd, a_wr) = UnixStream::connect(&path).await.unwrap().into_split();
        let (b_rd, b_wr) = UnixStream::connect(&path).await.unwrap().into_split();
        let (mut a_r, mut a_w) = (FrameReader::new(a_rd), FrameWriter::new(a_wr));
        let (mut b_r, mut b_w) = (FrameReader::new(b_rd), FrameWriter::new(b_wr));

        let sub = subscribe("reload.snapshot").unwrap();
        a_w.write_frame_parts(&[sub.as_slice()]).await.unwrap();
        // Let the hub register the subscription before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let h = channel_header(HUB_PUBLISH, "reload.snapshot").unwrap();
        b_w.write_frame_parts(&[h.as_slice(), &b"{\"x\":1}"[..]])
            .await
            .unwrap();
        let h = channel_header(HUB_PUBLISH, "elsewhere").unwrap();
        b_w.write_frame_parts(&[h.as_slice(), &b"{}"[..]])
            .await
            .unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), a_r.read_frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            parse_hub_msg(got).unwrap(),
            HubMsg::Deliver {
                channel: Bytes::from_static(b"reload.snapshot"),
                payload: Bytes::from_static(b"{\"x\":1}"),
            }
        );
        let nothing = tokio::time::timeout(Duration::from_millis(100), b_r.read_frame()).await;
        assert!(nothing.is_err());
    }
}
