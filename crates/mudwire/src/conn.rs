use std::fmt;
use std::str::FromStr;

/// Identity of one player transport, minted by the gateway.
///
/// The id outlives a game core: after a reload the gateway announces the
/// same id again and the new core uses it to find the waiting session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u128);

impl ConnId {
    pub const LEN: usize = 16;

    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(b: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(b))
    }

    pub(crate) fn read(p: &[u8]) -> Self {
        let mut b = [0u8; 16];
        b.copy_from_slice(&p[..16]);
        Self::from_be_bytes(b)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FromStr for ConnId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u128::from_str_radix(s, 16).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_text_form_parses_back() {
        let c = ConnId(0x0123_4567_89ab_cdef_0011_2233_4455_6677);
        let s = c.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s.parse::<ConnId>().unwrap(), c);
        assert!("not-hex".parse::<ConnId>().is_err());
    }
}
