//! Buffered duplex connection with read-position bookkeeping.
//!
//! The detector multiplexes text response lines and raw binary frames on one
//! socket, so the reader cannot be a plain `BufReader`: the frame channel sometimes
//! has to look at a byte, decide it belongs to a text line, and hand it back.
//! `Connection` keeps its own `BytesMut` read buffer and supports [`Connection::unread`].

use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;

/// An exclusively owned byte stream plus its unread input.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> Connection<S> {
    /// Wrap a stream with an empty read buffer.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Number of bytes received but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Push bytes back in front of the unread input.
    pub fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut joined = BytesMut::with_capacity(bytes.len() + self.buffer.len());
        joined.extend_from_slice(bytes);
        joined.extend_from_slice(&self.buffer);
        self.buffer = joined;
    }

    /// The wrapped stream. Bytes already buffered are not visible through it.
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// The wrapped stream, for writes that bypass [`Connection::write_all`].
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S: AsyncRead + Unpin> Connection<S> {
    /// Read more bytes from the stream; end of stream is an `UnexpectedEof` error.
    async fn fill(&mut self) -> io::Result<()> {
        self.buffer.reserve(READ_CHUNK);
        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        Ok(())
    }

    /// Read a single byte, refilling the buffer if it is empty.
    pub async fn read_u8(&mut self) -> io::Result<u8> {
        if self.buffer.is_empty() {
            self.fill().await?;
        }
        Ok(self.buffer.get_u8())
    }

    /// Fill `out` completely, accumulating across as many reads as needed.
    pub async fn read_exact_into(&mut self, out: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            if self.buffer.is_empty() {
                self.fill().await?;
            }
            let n = (out.len() - filled).min(self.buffer.len());
            self.buffer.copy_to_slice(&mut out[filled..filled + n]);
            filled += n;
        }
        Ok(())
    }

    /// Consume bytes up to and including `delim`.
    ///
    /// Returns the bytes before the delimiter, keeping at most `cap` of them. Bytes past
    /// the cap are still consumed so the stream stays aligned on the next line.
    pub async fn read_until(&mut self, delim: u8, cap: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == delim) {
                let keep = pos.min(cap.saturating_sub(out.len()));
                out.extend_from_slice(&self.buffer[..keep]);
                self.buffer.advance(pos + 1);
                return Ok(out);
            }

            let keep = self.buffer.len().min(cap.saturating_sub(out.len()));
            out.extend_from_slice(&self.buffer[..keep]);
            self.buffer.clear();
            self.fill().await?;
        }
    }

    /// Consume the rest of the current line, dropping the terminator and any trailing CR.
    pub async fn read_line(&mut self, cap: usize) -> io::Result<Vec<u8>> {
        let mut line = self.read_until(b'\n', cap).await?;
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }
}

impl<S: AsyncWrite + Unpin> Connection<S> {
    /// Write every byte, retrying partial writes, then flush.
    pub async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// Shut down the write half of the stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unread_bytes_are_returned_first() {
        let mut conn = Connection::new(&b"cd\n"[..]);
        assert_eq!(conn.read_u8().await.unwrap(), b'c');
        conn.unread(b"ab");
        assert_eq!(conn.read_line(usize::MAX).await.unwrap(), b"abd");
    }

    #[tokio::test]
    async fn read_line_respects_cap_but_consumes_whole_line() {
        let mut conn = Connection::new(&b"0123456789\r\nnext\n"[..]);
        assert_eq!(conn.read_line(4).await.unwrap(), b"0123");
        assert_eq!(conn.read_line(usize::MAX).await.unwrap(), b"next");
    }

    #[tokio::test]
    async fn read_exact_accumulates_across_reads() {
        let (mut host, device) = tokio::io::duplex(4);
        let writer = tokio::spawn(async move {
            host.write_all(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).await.unwrap();
            host
        });

        let mut conn = Connection::new(device);
        let mut out = [0u8; 10];
        conn.read_exact_into(&mut out).await.unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn eof_is_unexpected_eof() {
        let mut conn = Connection::new(&b""[..]);
        let err = conn.read_u8().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
