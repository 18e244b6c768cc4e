//! `mudwire`: binary messages exchanged by tickmud processes.
//!
//! Every message travels inside a `tickio::frame` frame. The first payload
//! byte is the message type; the rest is type specific. Decoders hand back
//! `Bytes` slices of the frame rather than copies.
//!
//! - `gateway`: telnet gateway <-> game core (connections, lines, output).
//! - `hub`: fabric clients <-> fabric hub (channel pub/sub).

pub mod conn;
pub mod gateway;
pub mod hub;

pub use conn::ConnId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    TooShort { need: usize, got: usize },
    UnknownType(u8),
    Malformed(&'static str),
}

impl std::fmt::Display for ProtoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoError::TooShort { need, got } => {
                write!(f, "message too short: need {need}, got {got}")
            }
            ProtoError::UnknownType(t) => write!(f, "unknown message type: 0x{t:02x}"),
            ProtoError::Malformed(s) => write!(f, "malformed message: {s}"),
        }
    }
}

impl std::error::Error for ProtoError {}

pub(crate) fn need(p: &[u8], n: usize) -> Result<(), ProtoError> {
    if p.len() < n {
        return Err(ProtoError::TooShort { need: n, got: p.len() });
    }
    Ok(())
}
