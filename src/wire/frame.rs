//! The universal framing primitive: a 4-byte little-endian length followed by that many payload
//!  bytes. RPC calls, handshake headers and streamed messages all travel as frames.

use std::io::ErrorKind;

use anyhow::bail;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::safe_converter::{PrecheckedCast, SafeCast};

pub const FRAME_LEN_PREFIX: usize = 4;

pub const DEFAULT_MAX_FRAME_LEN: usize = 64*1024*1024;

/// Appends a frame to `buf`, for callers that batch several frames into a single write
pub fn put_frame(buf: &mut BytesMut, payload: &[u8]) {
    buf.reserve(FRAME_LEN_PREFIX + payload.len());
    buf.put_u32_le(payload.len().prechecked_cast());
    buf.put_slice(payload);
}

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    if payload.len() > u32::MAX as usize {
        bail!("frame payload of {} bytes does not fit the length prefix", payload.len());
    }
    let len: u32 = payload.len().prechecked_cast();
    stream.write_all(&len.to_le_bytes()).await?;
    stream.write_all(payload).await?;
    Ok(())
}

/// Reads frames from a stream, reusing its buffer across calls. The buffer grows to the largest
///  frame seen so far and is never shrunk.
pub struct FrameReader {
    buf: BytesMut,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> FrameReader {
        FrameReader {
            buf: BytesMut::new(),
            max_frame_len,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }

    /// Returns `None` if the peer closed the connection cleanly, i.e. before the first byte of a
    ///  new frame. A close in the middle of a frame is an error.
    pub async fn read_frame<R: AsyncRead + Unpin>(&mut self, stream: &mut R) -> anyhow::Result<Option<&[u8]>> {
        let mut len_buf = [0u8; FRAME_LEN_PREFIX];

        let first = stream.read(&mut len_buf).await?;
        if first == 0 {
            return Ok(None);
        }
        if first < FRAME_LEN_PREFIX {
            read_exact_or_eof(stream, &mut len_buf[first..]).await?;
        }

        let len: usize = u32::from_le_bytes(len_buf).safe_cast();
        if len > self.max_frame_len {
            bail!("received a frame of {} bytes, exceeding the configured maximum of {} - closing the connection", len, self.max_frame_len);
        }

        self.buf.clear();
        self.buf.resize(len, 0);
        read_exact_or_eof(stream, &mut self.buf[..len]).await?;
        Ok(Some(&self.buf[..len]))
    }
}

async fn read_exact_or_eof<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> anyhow::Result<()> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => bail!("connection closed in the middle of a frame"),
        Err(e) => Err(e.into()),
    }
}
