use bytes::Bytes;
use bytes::BytesMut;
use memchr::memchr2;

/// Accumulates filtered telnet input and yields complete lines.
///
/// Clients end lines with CRLF, bare LF, bare CR or CR NUL; all four are
/// accepted. A CR that ends one read with its LF/NUL still in flight is
/// handled by remembering that the next leading LF/NUL belongs to it.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    max_line_len: usize,
    skip_lf_or_nul: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct LineTooLong;

impl LineBuffer {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            max_line_len: max_line_len.max(1),
            skip_lf_or_nul: false,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete line without its terminator, if any.
    ///
    /// Errors when more than `max_line_len` bytes are buffered with no
    /// terminator in sight; the buffer is cleared so the connection can go on.
    pub fn next_line(&mut self) -> Result<Option<Bytes>, LineTooLong> {
        if self.skip_lf_or_nul && !self.buf.is_empty() {
            if self.buf[0] == b'\n' || self.buf[0] == 0 {
                let _ = self.buf.split_to(1);
            }
            self.skip_lf_or_nul = false;
        }

        let Some(i) = memchr2(b'\n', b'\r', &self.buf) else {
            if self.buf.len() > self.max_line_len {
                self.buf.clear();
                return Err(LineTooLong);
            }
            return Ok(None);
        };

        let line = self.buf.split_to(i).freeze();
        let eol = self.buf.split_to(1);
        if eol[0] == b'\r' {
            match self.buf.first().copied() {
                Some(b'\n') | Some(0) => {
                    let _ = self.buf.split_to(1);
                }
                Some(_) => {}
                None => self.skip_lf_or_nul = true,
            }
        }
        Ok(Some(line))
    }
}
