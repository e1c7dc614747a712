use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Reads CRLF-terminated lines, and counted job payloads, from a stream.
pub struct LineReader<T: AsyncRead + Unpin> {
    /// Holds bytes read in but not yet consumed as a line or body.
    buf: BytesMut,
    /// Index in buf from which a CRLF pair may still appear. Everything
    /// before it has already been scanned without finding one.
    scan_from: usize,
    reader: T,
    /// On a read error, this is set and returned once the buffer is
    /// drained of pending lines.
    pending_error: Option<io::Error>,
}

impl<T: AsyncRead + Unpin> LineReader<T> {
    /// Reads one line, without its trailing CRLF. Returns None on a clean
    /// end-of-stream, discarding any partly-read line.
    ///
    /// Cancel-safe: the only await is `read_buf` on the inner reader, so
    /// either a read completes and is buffered or nothing happened.
    pub async fn read_line(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            // Scan only bytes not yet examined, so pipelined input stays
            // O(bytes read). scan_from sits one byte before the newest
            // read in case a \r arrived at the end of the previous one.
            if let Some(eol) = self.buf[self.scan_from..]
                .windows(2)
                .position(|w| w == b"\r\n")
            {
                let line = self.buf.split_to(self.scan_from + eol + 2).freeze();
                let line = line.slice(0..line.len() - 2);
                self.scan_from = 0;
                return Ok(Some(line));
            }

            if self.fill().await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Reads exactly `n` bytes. Returns None if the stream ends first.
    ///
    /// Cancel-safe in the same sense as `read_line`; a cancelled call
    /// leaves partial data buffered for the next one.
    pub async fn read_exact(&mut self, n: usize) -> io::Result<Option<Bytes>> {
        while self.buf.len() < n {
            if self.fill().await? == 0 {
                return Ok(None);
            }
        }

        let body = self.buf.split_to(n).freeze();
        // The line scan position no longer matches the buffer contents.
        self.scan_from = 0;
        Ok(Some(body))
    }

    /// Resolves once the stream reaches end-of-stream or errors. Bytes
    /// arriving in the meantime are buffered and served by later reads,
    /// so a blocked connection can watch for the peer going away without
    /// losing pipelined input.
    ///
    /// Cancel-safe in the same sense as `read_line`.
    pub async fn closed(&mut self) -> io::Result<()> {
        while self.fill().await? != 0 {}
        Ok(())
    }

    /// Reads into the buffer once, returning the byte count. A zero return
    /// means end-of-stream; any deferred read error surfaces then.
    async fn fill(&mut self) -> io::Result<usize> {
        let n = match self.reader.read_buf(&mut self.buf).await {
            Ok(n) => n,
            Err(e) => {
                self.pending_error = Some(e);
                0
            },
        };

        // Position the next CRLF scan one byte before this read's data.
        self.scan_from = self.buf.len().saturating_sub(n + 1);

        if n == 0 {
            if let Some(e) = self.pending_error.take() {
                return Err(e);
            }
        }
        Ok(n)
    }
}

impl<T: AsyncRead + Unpin> From<T> for LineReader<T> {
    fn from(value: T) -> Self {
        Self {
            buf: BytesMut::new(),
            scan_from: 0,
            reader: value,
            pending_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{self, AsyncWriteExt};
    use tokio::task::yield_now;

    #[tokio::test]
    async fn reassembles_lines() {
        // When properly read, each nth line should read b"test:{n}".
        let tests: &[&[u8]] = &[
            // Simple reassembly
            b"test:",
            b"1\r\n",
            // Split LF
            b"test:",
            b"2\r",
            b"\n",
            // Split CRLF
            b"test:",
            b"3",
            b"\r",
            b"\n",
            // Pipelined lines in one write
            b"test:4\r\ntest:5\r\n",
            b"test:6\r",
            b"\ntest:7\r\n",
            b"test:8",
            b"\r\ntest:9\r\n",
        ];

        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            for buf in tests {
                client.write_all(buf).await.unwrap();
                yield_now().await;
            }
        });

        let mut lr: LineReader<_> = server.into();

        for n in 1..=9 {
            assert_eq!(
                lr.read_line().await.unwrap().unwrap(),
                format!("test:{n}")
            );
        }

        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bodies_interleave_with_lines() {
        let (mut client, server) = io::duplex(4096);

        tokio::spawn(async move {
            // A line, then a 5-byte body (itself containing a CRLF)
            // arriving fragmented, then another line pipelined with the
            // body's tail.
            client.write_all(b"put 1 2 3 5\r\na\r").await.unwrap();
            yield_now().await;
            client.write_all(b"\nbc\r\nquit\r\n").await.unwrap();
        });

        let mut lr: LineReader<_> = server.into();

        assert_eq!(lr.read_line().await.unwrap().unwrap(), "put 1 2 3 5");
        // Body plus its trailing CRLF.
        assert_eq!(lr.read_exact(5 + 2).await.unwrap().unwrap(), "a\r\nbc\r\n");
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "quit");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_waits_for_eof_without_losing_bytes() {
        let (mut client, server) = io::duplex(4096);
        let mut lr: LineReader<_> = server.into();

        client.write_all(b"late\r\n").await.unwrap();
        drop(client);

        lr.closed().await.unwrap();
        // Bytes that arrived while waiting are still served.
        assert_eq!(lr.read_line().await.unwrap().unwrap(), "late");
        assert!(lr.read_line().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_body_is_none() {
        let (mut client, server) = io::duplex(4096);
        client.write_all(b"abc").await.unwrap();
        drop(client);

        let mut lr: LineReader<_> = server.into();
        assert!(lr.read_exact(10).await.unwrap().is_none());
    }
}
