//! Fabric hub messages.
//!
//! Client -> hub:
//! - `HUB_SUBSCRIBE`: `type | channel (utf-8, rest)`
//! - `HUB_PUBLISH`:   `type | chan_len (u8) | channel | payload`
//!
//! Hub -> client:
//! - `HUB_DELIVER`:   `type | chan_len (u8) | channel | payload`
//!
//! Payloads are opaque to the hub.

use bytes::Bytes;

use crate::ProtoError;
use crate::need;

pub const HUB_SUBSCRIBE: u8 = 0x11;
pub const HUB_PUBLISH: u8 = 0x12;
pub const HUB_DELIVER: u8 = 0x91;

pub const MAX_CHANNEL_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubMsg {
    Subscribe { channel: Bytes },
    Publish { channel: Bytes, payload: Bytes },
    Deliver { channel: Bytes, payload: Bytes },
}

/// `type | chan_len | channel` prefix for publish/deliver; payload goes in
/// a separate frame part.
pub fn channel_header(t: u8, channel: &str) -> Result<Vec<u8>, ProtoError> {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
        return Err(ProtoError::Malformed("channel length"));
    }
    let mut h = Vec::with_capacity(2 + channel.len());
    h.push(t);
    h.push(channel.len() as u8);
    h.extend_from_slice(channel.as_bytes());
    Ok(h)
}

pub fn subscribe(channel: &str) -> Result<Vec<u8>, ProtoError> {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LEN {
        return Err(ProtoError::Malformed("channel length"));
    }
    let mut m = Vec::with_capacity(1 + channel.len());
    m.push(HUB_SUBSCRIBE);
    m.extend_from_slice(channel.as_bytes());
    Ok(m)
}

pub fn parse_hub_msg(p: Bytes) -> Result<HubMsg, ProtoError> {
    need(&p, 2)?;
    match p[0] {
        HUB_SUBSCRIBE => Ok(HubMsg::Subscribe {
            channel: p.slice(1..),
        }),
        t @ (HUB_PUBLISH | HUB_DELIVER) => {
            let clen = p[1] as usize;
            if clen == 0 {
                return Err(ProtoError::Malformed("empty channel"));
            }
            need(&p, 2 + clen)?;
            let channel = p.slice(2..2 + clen);
            let payload = p.slice(2 + clen..);
            if t == HUB_PUBLISH {
                Ok(HubMsg::Publish { channel, payload })
            } else {
                Ok(HubMsg::Deliver { channel, payload })
            }
        }
        t => Err(ProtoError::UnknownType(t)),
    }
}
