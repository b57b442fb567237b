use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::errors::Result;

/// Largest fragment emitted by the writer. Records of any size are split
/// across fragments; the final fragment carries the end-of-record bit.
pub const MAX_FRAGMENT_SIZE: usize = 1 << 20;

const LAST_FRAGMENT: u32 = 0x8000_0000;

/// Record-framed writer. Bytes written through `AsyncWrite` accumulate in the
/// current record; nothing reaches the wire until `end_of_record`, which
/// emits the buffered record as length-prefixed fragments and flushes.
pub struct RecordWriter<W> {
    inner: W,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin + Send + Sync + 'static> RecordWriter<W> {
    pub fn new(inner: W) -> Self {
        RecordWriter {
            inner,
            buf: Vec::new(),
        }
    }

    /// Emits the buffered record and flushes the transport. An empty record
    /// still emits its terminating fragment.
    pub async fn end_of_record(&mut self) -> Result<()> {
        let mut chunks = self.buf.chunks(MAX_FRAGMENT_SIZE).peekable();
        if chunks.peek().is_none() {
            self.inner.write_u32(LAST_FRAGMENT).await?;
        } else {
            while let Some(chunk) = chunks.next() {
                let mut header = chunk.len() as u32;
                if chunks.peek().is_none() {
                    header |= LAST_FRAGMENT;
                }
                self.inner.write_u32(header).await?;
                self.inner.write_all(chunk).await?;
            }
        }
        self.inner.flush().await?;
        self.buf.clear();
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: AsyncWrite + Unpin + Send + Sync + 'static> AsyncWrite for RecordWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Data is only committed by end_of_record.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Record-framed reader. Reads span fragments transparently within the
/// current record; a read past the final fragment fails, and `skip_record`
/// discards whatever remains and arms the next record.
pub struct RecordReader<R> {
    inner: R,
    header: [u8; 4],
    header_filled: usize,
    remaining: usize,
    in_record: bool,
    record_done: bool,
}

impl<R: AsyncRead + Unpin + Send + Sync + 'static> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        RecordReader {
            inner,
            header: [0u8; 4],
            header_filled: 0,
            remaining: 0,
            in_record: false,
            record_done: false,
        }
    }

    /// True once the final fragment of the current record has been consumed.
    pub fn at_record_end(&self) -> bool {
        self.record_done
    }

    /// Discards the remainder of the current record and positions the reader
    /// at the start of the next. A no-op at a record boundary.
    pub async fn skip_record(&mut self) -> Result<()> {
        if !self.in_record {
            return Ok(());
        }
        let mut sink = [0u8; 4096];
        while !self.record_done {
            let n = self.read(&mut sink).await?;
            if n == 0 && !self.record_done {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a record",
                )
                .into());
            }
        }
        self.in_record = false;
        self.record_done = false;
        self.remaining = 0;
        self.header_filled = 0;
        Ok(())
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }
}

impl<R: AsyncRead + Unpin + Send + Sync + 'static> AsyncRead for RecordReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if this.remaining > 0 {
                let unfilled = buf.initialize_unfilled();
                if unfilled.is_empty() {
                    return Poll::Ready(Ok(()));
                }
                let cap = this.remaining.min(unfilled.len());
                let mut sub = ReadBuf::new(&mut unfilled[..cap]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut sub) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {}
                }
                let n = sub.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a record fragment",
                    )));
                }
                buf.advance(n);
                this.remaining -= n;
                if this.remaining == 0 && this.header[0] & 0x80 != 0 {
                    this.record_done = true;
                }
                return Poll::Ready(Ok(()));
            }

            if this.record_done {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "read past the end of the current record",
                )));
            }

            // Read the next fragment header, possibly across polls.
            while this.header_filled < 4 {
                let filled = this.header_filled;
                let mut sub = ReadBuf::new(&mut this.header[filled..]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut sub) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Ready(Ok(())) => {}
                }
                let n = sub.filled().len();
                if n == 0 {
                    if this.header_filled == 0 && !this.in_record {
                        // Clean EOF at a record boundary.
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside a fragment header",
                    )));
                }
                this.header_filled += n;
            }

            let word = u32::from_be_bytes(this.header);
            let len = (word & !LAST_FRAGMENT) as usize;
            this.in_record = true;
            this.header_filled = 4; // Keep the last-fragment bit visible.
            this.remaining = len;
            if len == 0 {
                if word & LAST_FRAGMENT != 0 {
                    this.record_done = true;
                } else {
                    // Zero-length interior fragment: read the next header.
                    this.header_filled = 0;
                }
                continue;
            }
            this.header_filled = 0;
            this.header[0] = if word & LAST_FRAGMENT != 0 { 0x80 } else { 0 };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{UdaRead, UdaWrite};

    async fn framed(records: &[&[u8]]) -> Vec<u8> {
        let mut writer = RecordWriter::new(Vec::new());
        for record in records {
            writer.write_bytes(record).await.unwrap();
            writer.end_of_record().await.unwrap();
        }
        writer.inner
    }

    #[tokio::test]
    async fn records_round_trip_across_boundaries() {
        let wire = framed(&[b"first record", b"second"]).await;
        let mut reader = RecordReader::new(std::io::Cursor::new(wire));

        assert_eq!(reader.read_bytes().await.unwrap(), b"first record");
        assert!(reader.at_record_end());
        reader.skip_record().await.unwrap();
        assert_eq!(reader.read_bytes().await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn skip_discards_unread_remainder() {
        let wire = framed(&[b"abandoned payload", b"wanted"]).await;
        let mut reader = RecordReader::new(std::io::Cursor::new(wire));

        // Read only the length prefix of the first record, then skip.
        reader.read_u32_be().await.unwrap();
        reader.skip_record().await.unwrap();
        assert_eq!(reader.read_bytes().await.unwrap(), b"wanted");
    }

    #[tokio::test]
    async fn reading_past_record_end_fails() {
        let wire = framed(&[b"x"]).await;
        let mut reader = RecordReader::new(std::io::Cursor::new(wire));
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).await.unwrap();
        assert!(reader.read_exact(&mut buf).await.is_err());
    }

    #[tokio::test]
    async fn large_records_split_into_fragments() {
        let big = vec![0xA5u8; MAX_FRAGMENT_SIZE + 17];
        let mut writer = RecordWriter::new(Vec::new());
        writer.write_bytes(&big).await.unwrap();
        writer.end_of_record().await.unwrap();
        let wire = writer.inner;

        let mut reader = RecordReader::new(std::io::Cursor::new(wire));
        assert_eq!(reader.read_bytes().await.unwrap(), big);
        assert!(reader.at_record_end());
    }
}
