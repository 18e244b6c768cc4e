//! `tickio`: the byte plumbing between tickmud processes.
//!
//! - `frame`: u32 BE length-prefixed frames (gateway <-> core, fabric hub).
//! - `telnet`: strips IAC sequences from player input and answers negotiation.
//! - `line`: CR / LF / CRNUL line splitting over a reusable buffer.

pub mod frame;
pub mod line;
pub mod telnet;
