use crate::buffer::BufChain;
use crate::protocol::mysql::packet::next_packet;

use bytes::Bytes;
use std::io;
use std::io::prelude::*;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;

const PACKET_BUFFER_SIZE: usize = 4096;
const PACKET_LARGE_BUFFER_SIZE: usize = 1048576;

#[macro_export]
macro_rules! async_packet_read {
    ($reader: expr) => {{
        use tracing::warn;
        let rs = $reader.next_async().await;
        if rs.is_err() {
            warn!("ProxySrv read pkg err = {:?}", rs);
        }
        rs?.ok_or_else(|| {
            warn!("ProxySrv pkg is none");
            std::io::Error::new(
                std::io::ErrorKind::ConnectionAborted,
                "connection disconnect.",
            )
        })?
    }};
}

/// [PacketReader] turns an arbitrary byte stream into complete logical MySQL
/// packets. Partially received bytes stay queued in a [`BufChain`]; delivered
/// payloads share storage with the read queue instead of being copied out.
pub struct PacketReader<R> {
    queue: BufChain,
    expect_seq: Option<u8>,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            queue: BufChain::new(),
            expect_seq: None,
            r,
        }
    }

    /// Arms sequence continuity checking for the current exchange. The next
    /// packet must carry exactly this sequence number; packets after it must
    /// stay contiguous until [`reset_seq`](Self::reset_seq).
    pub fn expect_seq(&mut self, seq: u8) {
        self.expect_seq = Some(seq);
    }

    /// Clears continuity checking at a command boundary.
    pub fn reset_seq(&mut self) {
        self.expect_seq = None;
    }

    fn take_next(&mut self) -> io::Result<Option<(u8, BufChain)>> {
        match next_packet(&mut self.queue, self.expect_seq)? {
            Some((seq, pkt)) => {
                if self.expect_seq.is_some() {
                    self.expect_seq = Some(seq.wrapping_add(1));
                }
                Ok(Some((seq, pkt)))
            }
            None => Ok(None),
        }
    }
}

impl<R: Read> PacketReader<R> {
    pub fn next_read(&mut self) -> io::Result<Option<(u8, BufChain)>> {
        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if let Some(pkt) = self.take_next()? {
                return Ok(Some(pkt));
            }
            let mut buf = vec![0u8; buffer_size];
            let read = self.r.read(&mut buf)?;
            if read == 0 {
                if self.queue.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} unhandled bytes", self.queue.len()),
                ));
            }
            buf.truncate(read);
            self.queue.append_bytes(Bytes::from(buf));
            buffer_size = PACKET_LARGE_BUFFER_SIZE;
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// One wire packet, no continuation joining. LOAD DATA streaming mode
    /// reads with this so every chunk surfaces individually.
    pub async fn next_raw_async(&mut self) -> io::Result<Option<(u8, BufChain)>> {
        loop {
            if let Some((seq, pkt)) =
                crate::protocol::mysql::packet::next_wire_packet(&mut self.queue, self.expect_seq)?
            {
                if self.expect_seq.is_some() {
                    self.expect_seq = Some(seq.wrapping_add(1));
                }
                return Ok(Some((seq, pkt)));
            }
            let mut buf = vec![0u8; PACKET_LARGE_BUFFER_SIZE];
            let read = self.r.read(&mut buf).await?;
            if read == 0 {
                if self.queue.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} unhandled bytes", self.queue.len()),
                ));
            }
            buf.truncate(read);
            self.queue.append_bytes(Bytes::from(buf));
        }
    }

    pub async fn next_async(&mut self) -> io::Result<Option<(u8, BufChain)>> {
        // start with a small read and switch to a large buffer once a read
        // fills it, so bulk streams do fewer syscalls.
        let mut buffer_size = PACKET_BUFFER_SIZE;
        loop {
            if let Some(pkt) = self.take_next()? {
                return Ok(Some(pkt));
            }
            let mut buf = vec![0u8; buffer_size];
            let read = self.r.read(&mut buf).await?;
            if read == 0 {
                if self.queue.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} unhandled bytes", self.queue.len()),
                ));
            }
            buf.truncate(read);
            self.queue.append_bytes(Bytes::from(buf));
            buffer_size = PACKET_LARGE_BUFFER_SIZE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ping_over_reader() {
        let cursor = Cursor::new(vec![0x01, 0, 0, 0, 0x0e]);
        let mut reader = PacketReader::new(cursor);
        let (seq, pkt) = reader.next_read().unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt.contiguous(), &[0x0e]);
        assert!(reader.next_read().unwrap().is_none());
    }

    #[test]
    fn test_trailing_garbage_is_eof_error() {
        let cursor = Cursor::new(vec![0x05, 0, 0, 0, 0x03]);
        let mut reader = PacketReader::new(cursor);
        assert!(reader.next_read().is_err());
    }

    #[tokio::test]
    async fn test_split_reads_reassemble() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = PacketReader::new(client);
        let frame = [5u8, 0, 0, 2, b'h', b'e', b'l', b'l', b'o'];
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for chunk in frame.chunks(3) {
                server.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        let (seq, pkt) = reader.next_async().await.unwrap().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(&*pkt.contiguous(), b"hello");
    }

    #[tokio::test]
    async fn test_sequence_enforcement() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut reader = PacketReader::new(client);
        reader.expect_seq(1);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(&[1u8, 0, 0, 3, 0xff]).await.unwrap();
        });
        assert!(reader.next_async().await.is_err());
    }
}
