//! Telnet input filtering for the gateway.
//!
//! Player bytes pass through untouched; IAC commands are removed. The gateway
//! implements no options, so every `DO` is answered `WONT` and every `WILL`
//! is answered `DONT`. Subnegotiation blocks (`IAC SB .. IAC SE`) are dropped.

pub const IAC: u8 = 255;
pub const DONT: u8 = 254;
pub const DO: u8 = 253;
pub const WONT: u8 = 252;
pub const WILL: u8 = 251;
pub const SB: u8 = 250;
pub const SE: u8 = 240;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum State {
    #[default]
    Data,
    Iac,
    Option(u8),
    Sub,
    SubIac,
}

#[derive(Debug, Default)]
pub struct TelnetFilter {
    state: State,
}

impl TelnetFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter `chunk`, appending player data to `data` and negotiation
    /// answers to `replies`. State carries over between calls, so sequences
    /// split across reads are handled.
    pub fn feed(&mut self, chunk: &[u8], data: &mut Vec<u8>, replies: &mut Vec<u8>) {
        data.reserve(chunk.len());
        for &b in chunk {
            self.state = match (self.state, b) {
                (State::Data, IAC) => State::Iac,
                (State::Data, _) => {
                    data.push(b);
                    State::Data
                }
                (State::Iac, IAC) => {
                    data.push(IAC);
                    State::Data
                }
                (State::Iac, DO | DONT | WILL | WONT) => State::Option(b),
                (State::Iac, SB) => State::Sub,
                // NOP, GA, AYT and friends carry no payload.
                (State::Iac, _) => State::Data,
                (State::Option(cmd), opt) => {
                    match cmd {
                        DO => replies.extend_from_slice(&[IAC, WONT, opt]),
                        WILL => replies.extend_from_slice(&[IAC, DONT, opt]),
                        _ => {}
                    }
                    State::Data
                }
                (State::Sub, IAC) => State::SubIac,
                (State::Sub, _) => State::Sub,
                (State::SubIac, SE) => State::Data,
                (State::SubIac, _) => State::Sub,
            };
        }
    }
}
