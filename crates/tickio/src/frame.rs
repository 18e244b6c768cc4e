use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Largest frame either side will accept unless overridden.
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Pull one complete frame out of `buf`, if one is buffered.
///
/// Leaves partial frames in place so a cancelled read can resume.
pub fn take_frame(buf: &mut BytesMut, max_frame_len: usize) -> std::io::Result<Option<Bytes>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_frame_len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit {max_frame_len}"),
        ));
    }
    if buf.len() < LEN_PREFIX + len {
        return Ok(None);
    }
    buf.advance(LEN_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Encode `parts` as a single frame, for senders that hand bytes to a writer task.
pub fn encode_frame(parts: &[&[u8]]) -> std::io::Result<Bytes> {
    let len = frame_len(parts)?;
    let mut out = BytesMut::with_capacity(LEN_PREFIX + len as usize);
    out.put_u32(len);
    for p in parts {
        out.put_slice(p);
    }
    Ok(out.freeze())
}

fn frame_len(parts: &[&[u8]]) -> std::io::Result<u32> {
    let len: usize = parts.iter().map(|p| p.len()).sum();
    len.try_into()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too big"))
}

#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_frame_len: usize,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max.max(1);
        self
    }
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Read the next frame payload; `Ok(None)` means the peer closed cleanly.
    ///
    /// Cancel safe: bytes already read stay buffered for the next call.
    pub async fn read_frame(&mut self) -> std::io::Result<Option<Bytes>> {
        loop {
            if let Some(frame) = take_frame(&mut self.buf, self.max_frame_len)? {
                return Ok(Some(frame));
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed mid-frame",
                ));
            }
        }
    }
}

#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Write one frame built from `parts` (typically a fixed header plus a body)
    /// without joining them first.
    pub async fn write_frame_parts(&mut self, parts: &[&[u8]]) -> std::io::Result<()> {
        let len = frame_len(parts)?;
        self.inner.write_all(&len.to_be_bytes()).await?;
        for p in parts.iter().filter(|p| !p.is_empty()) {
            self.inner.write_all(p).await?;
        }
        Ok(())
    }

    /// Write an already encoded frame (see [`encode_frame`]).
    pub async fn write_encoded(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(frame).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_and_body_arrive_as_one_frame() {
        let (a, b) = tokio::io::duplex(64);
        tokio::spawn(async move {
            let mut fw = FrameWriter::new(b);
            fw.write_frame_parts(&[&[0x02, 0x07], b"look"]).await.unwrap();
            fw.write_frame_parts(&[&[0x03]]).await.unwrap();
            fw.flush().await.unwrap();
        });

        let mut fr = FrameReader::new(a);
        assert_eq!(&fr.read_frame().await.unwrap().unwrap()[..], b"\x02\x07look");
        assert_eq!(&fr.read_frame().await.unwrap().unwrap()[..], b"\x03");
        assert!(fr.read_frame().await.unwrap().is_none());
    }

    #[test]
    fn take_frame_waits_for_the_whole_payload() {
        let enc = encode_frame(&[b"hel", b"lo"]).unwrap();
        let mut buf = BytesMut::from(&enc[..6]);
        assert!(take_frame(&mut buf, 64).unwrap().is_none());
        buf.extend_from_slice(&enc[6..]);
        assert_eq!(&take_frame(&mut buf, 64).unwrap().unwrap()[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let enc = encode_frame(&[&[0u8; 32]]).unwrap();
        let mut buf = BytesMut::from(&enc[..]);
        let err = take_frame(&mut buf, 16).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let enc = encode_frame(&[b"abcdef"]).unwrap();
        let mut fr = FrameReader::new(&enc[..5]);
        let err = fr.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }
}
