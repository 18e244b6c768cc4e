//! Gateway <-> core messages.
//!
//! Every message starts `type (1) | conn id (16, u128 BE)`.
//!
//! Gateway -> core:
//! - `MSG_CONNECT`: remote address follows (utf-8). Sent for new players and
//!   re-sent for every live connection whenever the core link comes back.
//! - `MSG_LINE`: one input line follows, terminator stripped.
//! - `MSG_DISCONNECT`: the player's transport is gone.
//!
//! Core -> gateway:
//! - `OUT_OUTPUT`: bytes to write to the player verbatim.
//! - `OUT_CLOSE`: drop the player's transport.

use bytes::Bytes;

use crate::ConnId;
use crate::ProtoError;
use crate::need;

pub const MSG_CONNECT: u8 = 0x01;
pub const MSG_LINE: u8 = 0x02;
pub const MSG_DISCONNECT: u8 = 0x03;

pub const OUT_OUTPUT: u8 = 0x81;
pub const OUT_CLOSE: u8 = 0x82;

pub const HEADER_LEN: usize = 1 + ConnId::LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayMsg {
    Connect { conn: ConnId, remote: Bytes },
    Line { conn: ConnId, line: Bytes },
    Disconnect { conn: ConnId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreMsg {
    Output { conn: ConnId, text: Bytes },
    Close { conn: ConnId },
}

/// Fixed message header; the body (if any) is written as a second frame part.
pub fn header(t: u8, conn: ConnId) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[0] = t;
    h[1..].copy_from_slice(&conn.to_be_bytes());
    h
}

pub fn parse_gateway_msg(p: Bytes) -> Result<GatewayMsg, ProtoError> {
    need(&p, HEADER_LEN)?;
    let conn = ConnId::read(&p[1..]);
    match p[0] {
        MSG_CONNECT => Ok(GatewayMsg::Connect {
            conn,
            remote: p.slice(HEADER_LEN..),
        }),
        MSG_LINE => Ok(GatewayMsg::Line {
            conn,
            line: p.slice(HEADER_LEN..),
        }),
        MSG_DISCONNECT => Ok(GatewayMsg::Disconnect { conn }),
        t => Err(ProtoError::UnknownType(t)),
    }
}

pub fn parse_core_msg(p: Bytes) -> Result<CoreMsg, ProtoError> {
    need(&p, HEADER_LEN)?;
    let conn = ConnId::read(&p[1..]);
    match p[0] {
        OUT_OUTPUT => Ok(CoreMsg::Output {
            conn,
            text: p.slice(HEADER_LEN..),
        }),
        OUT_CLOSE => {
            if p.len() != HEADER_LEN {
                return Err(ProtoError::Malformed("close carries no body"));
            }
            Ok(CoreMsg::Close { conn })
        }
        t => Err(ProtoError::UnknownType(t)),
    }
}
