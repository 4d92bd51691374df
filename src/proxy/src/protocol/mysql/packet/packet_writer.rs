use crate::buffer::BufChain;
use crate::protocol::mysql::constants;
use byteorder::{ByteOrder, LittleEndian};

use pin_project::pin_project;
use std::io;
use std::io::prelude::*;
use std::io::IoSlice;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Clone)]
#[pin_project]
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    #[pin]
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Stages a buffer chain as the next packet payload, segment by segment.
    pub fn stage_chain(&mut self, chain: &BufChain) {
        for seg in chain.segments() {
            self.buf.extend_from_slice(seg);
        }
    }

    /// Bytes staged but not yet framed and handed to the socket. The session
    /// uses this as its write-queue depth for backpressure decisions.
    pub fn queued_len(&self) -> usize {
        self.buf.len()
    }
}

impl<W: AsyncWrite> AsyncWrite for PacketWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        AsyncWrite::poll_write(self.project().inner_writer, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        AsyncWrite::poll_flush(self.project().inner_writer, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        AsyncWrite::poll_shutdown(self.project().inner_writer, cx)
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len();
        self.buf.extend_from_slice(buf);
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    /// Frames the staged payload and writes it out. Payloads longer than the
    /// 16M wire maximum are split at the boundary; each emitted packet takes
    /// the next sequence number. An empty stage produces the zero-length
    /// packet (LOAD DATA termination, empty auth responses).
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        if !self.is_empty() {
            let raw_packet = self.take_buffer();
            // split the raw buffer at the boundary of size MAX_PAYLOAD_LEN
            let chunks = raw_packet.chunks(constants::MAX_PAYLOAD_LEN);
            for chunk in chunks {
                LittleEndian::write_u24(&mut header, chunk.len() as u32);
                header[3] = self.seq();
                self.increase_seq();
                // write out the header and payload.
                //
                // depends on the AsyncWrite provided, this may trigger
                // real system call or not (for examples, if AsyncWrite is buffered stream)
                let written = self
                    .inner_writer
                    .write_vectored(&[IoSlice::new(&header), IoSlice::new(chunk)])
                    .await?;

                // if write buffer is not drained, fall back to write_all
                if written != constants::PACKET_HEADER_LEN + chunk.len() {
                    let remaining: Vec<u8> = header
                        .iter()
                        .chain(chunk.iter())
                        .skip(written)
                        .cloned()
                        .collect();
                    self.inner_writer.write_all(&remaining).await?
                }
            }
            // an exact multiple of the wire maximum needs the empty
            // terminator packet so the peer sees the message end.
            if raw_packet.len() % constants::MAX_PAYLOAD_LEN == 0 {
                self.write_empty_packet().await?;
            }
            Ok(())
        } else {
            self.write_empty_packet().await
        }
    }

    /// Frames the staged payload as exactly one wire packet, without the
    /// logical-message terminator rule. LOAD DATA chunks map one to one onto
    /// wire packets; a full-size chunk must NOT be followed by an empty
    /// packet, that would end the upload. The payload must fit one packet.
    pub async fn end_one_packet(&mut self) -> io::Result<()> {
        if self.is_empty() {
            return self.write_empty_packet().await;
        }
        let raw_packet = self.take_buffer();
        assert!(raw_packet.len() <= constants::MAX_PAYLOAD_LEN);
        let mut header = [0; constants::PACKET_HEADER_LEN];
        LittleEndian::write_u24(&mut header, raw_packet.len() as u32);
        header[3] = self.seq();
        self.increase_seq();
        let written = self
            .inner_writer
            .write_vectored(&[IoSlice::new(&header), IoSlice::new(&raw_packet)])
            .await?;
        if written != constants::PACKET_HEADER_LEN + raw_packet.len() {
            let remaining: Vec<u8> = header
                .iter()
                .chain(raw_packet.iter())
                .skip(written)
                .cloned()
                .collect();
            self.inner_writer.write_all(&remaining).await?
        }
        Ok(())
    }

    async fn write_empty_packet(&mut self) -> io::Result<()> {
        let mut header = [0; constants::PACKET_HEADER_LEN];
        LittleEndian::write_u24(&mut header, 0);
        header[3] = self.seq();
        self.increase_seq();
        let _size = self
            .inner_writer
            .write_vectored(&[IoSlice::new(&header), IoSlice::new(&[])])
            .await?;
        Ok(())
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::packet::{assemble, next_packet};
    use crate::buffer::{BufChain, BufProps};
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;

    #[tokio::test]
    async fn test_simple_packet_framing() {
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            writer.set_seq(1);
            Write::write_all(&mut writer, b"\x03SELECT 1").unwrap();
            writer.end_packet().await.unwrap();
        }
        let mut queue = BufChain::from_vec(out);
        let (seq, pkt) = next_packet(&mut queue, None).unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(&*pkt.contiguous(), b"\x03SELECT 1");
    }

    #[tokio::test]
    async fn test_empty_packet() {
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            writer.set_seq(4);
            writer.end_packet().await.unwrap();
        }
        assert_eq!(out, vec![0, 0, 0, 4]);
    }

    #[tokio::test]
    async fn test_oversize_payload_splits_and_reassembles() {
        let payload = vec![0xabu8; MAX_PAYLOAD_LEN + 5];
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            Write::write_all(&mut writer, &payload).unwrap();
            writer.end_packet().await.unwrap();
        }
        let mut queue = BufChain::from_vec(out);
        let packets = assemble(&mut queue).unwrap();
        assert_eq!(packets.len(), 1);
        let (seq, pkt) = &packets[0];
        assert_eq!(*seq, 1);
        assert_eq!(pkt.len(), payload.len());
        assert!(pkt.props.contains(BufProps::MULTIPART));
    }

    #[tokio::test]
    async fn test_one_packet_framing_never_appends_terminator() {
        let payload = vec![0x61u8; MAX_PAYLOAD_LEN];
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            writer.set_seq(2);
            Write::write_all(&mut writer, &payload).unwrap();
            writer.end_one_packet().await.unwrap();
        }
        // exactly one wire packet, no empty terminator after it
        assert_eq!(out.len(), 4 + MAX_PAYLOAD_LEN);
        assert_eq!(out[3], 2);
    }

    #[tokio::test]
    async fn test_exact_max_payload_gets_terminator() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let mut out = Vec::new();
        {
            let mut writer = PacketWriter::new(&mut out);
            Write::write_all(&mut writer, &payload).unwrap();
            writer.end_packet().await.unwrap();
        }
        // one full packet plus the empty terminator
        assert_eq!(out.len(), 4 + MAX_PAYLOAD_LEN + 4);
        let mut queue = BufChain::from_vec(out);
        let (_, pkt) = next_packet(&mut queue, None).unwrap().unwrap();
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN);
        assert!(queue.is_empty());
    }
}
