pub mod packet_reader;
pub mod packet_writer;
pub mod writers;

use crate::buffer::{BufChain, BufProps};
use crate::protocol::mysql::constants;
use crate::protocol::mysql::constants::{CommandCode, HeaderInfo};

use byteorder::{ByteOrder, LittleEndian};
use num_traits::FromPrimitive;
use std::io;

/// Writes the 4-byte wire header (3-byte little-endian length + sequence) in place.
#[inline]
pub fn write_header(header: &mut [u8], payload_len: u32, seq: u8) {
    LittleEndian::write_u24(header, payload_len);
    header[constants::PACKET_HEADER_LEN - 1] = seq;
}

/// Parses a 4-byte wire header into (payload length, sequence).
#[inline]
pub fn parse_header(header: &[u8]) -> io::Result<(u32, u8)> {
    if header.len() < constants::PACKET_HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "short packet header",
        ));
    }
    let len = LittleEndian::read_u24(header);
    Ok((len, header[constants::PACKET_HEADER_LEN - 1]))
}

/// First payload byte of a COM_* packet, decoded without copying.
pub fn get_command(payload: &BufChain) -> Option<CommandCode> {
    payload.first_byte().and_then(CommandCode::from_u8)
}

/// Extracts exactly one complete logical message from the front of the read
/// queue. Returns `None` and leaves the queue untouched when the message is
/// not fully buffered yet.
///
/// A packet with payload length 0xFFFFFF continues into the next packet; the
/// logical message ends at the first packet whose payload is shorter,
/// possibly empty. Joined messages carry the `MULTIPART` prop. The sequence
/// number returned is the one of the final wire packet, which is what the
/// response must continue from.
///
/// `expect_seq` enforces continuity against the previous packet of the same
/// exchange; a mismatch is a protocol error and the connection must close.
pub fn next_packet(
    queue: &mut BufChain,
    expect_seq: Option<u8>,
) -> io::Result<Option<(u8, BufChain)>> {
    let mut offset = 0usize;
    let mut expected = expect_seq;
    let mut parts: Vec<(usize, usize)> = Vec::new();
    let mut multipart = false;

    loop {
        let header = queue.copy_to_vec(offset, constants::PACKET_HEADER_LEN);
        if header.len() < constants::PACKET_HEADER_LEN {
            return Ok(None);
        }
        let (len, seq) = parse_header(&header)?;
        if let Some(want) = expected {
            if seq != want {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("packet out of sequence: got {seq}, expected {want}"),
                ));
            }
        }
        let payload_start = offset + constants::PACKET_HEADER_LEN;
        if queue.len() < payload_start + len as usize {
            return Ok(None);
        }
        parts.push((payload_start, len as usize));
        expected = Some(seq.wrapping_add(1));

        if len as usize == constants::MAX_PAYLOAD_LEN {
            multipart = true;
            offset = payload_start + len as usize;
            continue;
        }

        // Complete. Carve the payload regions out of the queue in one pass;
        // headers are dropped, payload segments stay shared.
        let mut message = BufChain::new();
        let mut consumed = 0usize;
        for (start, part_len) in parts {
            queue.consume(start - consumed);
            message.append(queue.split_to(part_len));
            consumed = start + part_len;
        }
        message.buf_type = queue.buf_type;
        message.hints = queue.hints.clone();
        if multipart {
            message.props |= BufProps::MULTIPART;
        }
        return Ok(Some((seq, message)));
    }
}

/// Extracts exactly one wire packet without continuation joining. LOAD DATA
/// streaming treats every packet as a data chunk in its own right, including
/// full-size 0xFFFFFF ones and the empty terminator.
pub fn next_wire_packet(
    queue: &mut BufChain,
    expect_seq: Option<u8>,
) -> io::Result<Option<(u8, BufChain)>> {
    let header = queue.copy_to_vec(0, constants::PACKET_HEADER_LEN);
    if header.len() < constants::PACKET_HEADER_LEN {
        return Ok(None);
    }
    let (len, seq) = parse_header(&header)?;
    if let Some(want) = expect_seq {
        if seq != want {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("packet out of sequence: got {seq}, expected {want}"),
            ));
        }
    }
    if queue.len() < constants::PACKET_HEADER_LEN + len as usize {
        return Ok(None);
    }
    queue.consume(constants::PACKET_HEADER_LEN);
    Ok(Some((seq, queue.split_to(len as usize))))
}

/// Drains every complete logical message off the read queue. The remainder of
/// a partially received message stays queued.
pub fn assemble(queue: &mut BufChain) -> io::Result<Vec<(u8, BufChain)>> {
    let mut out = Vec::new();
    while let Some(pkt) = next_packet(queue, None)? {
        out.push(pkt);
    }
    Ok(out)
}

impl BufChain {
    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        self.first_byte() == Some(HeaderInfo::EOFHeader as u8) && self.len() <= 5
    }

    /// See: [MariaDB](https://mariadb.com/kb/en/result-set-packets/) or [MySQL](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_ok_packet.html)
    /// Packet header is 0xfe and we need check the packet length.
    /// return true OK packet after the result set when CLIENT_DEPRECATE_EOF is enabled
    pub fn is_result_set_eof_packet(&self) -> bool {
        self.first_byte() == Some(HeaderInfo::EOFHeader as u8)
            && (7..constants::MAX_PAYLOAD_LEN).contains(&self.len())
    }

    pub fn is_ok_packet(&self) -> bool {
        self.first_byte() == Some(HeaderInfo::OKHeader as u8)
    }

    pub fn is_err_packet(&self) -> bool {
        self.first_byte() == Some(HeaderInfo::ErrHeader as u8)
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        self.first_byte() == Some(HeaderInfo::LocalInFileHeader as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mysql::constants::MAX_PAYLOAD_LEN;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; 4];
        write_header(&mut data, payload.len() as u32, seq);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = [0u8; 4];
        for (len, seq) in [(0u32, 0u8), (1, 3), (0xff_ffff, 0xff), (4096, 42)] {
            write_header(&mut header, len, seq);
            assert_eq!(parse_header(&header).unwrap(), (len, seq));
        }
    }

    #[test]
    fn test_one_ping() {
        let mut queue = BufChain::from_vec(frame(0, &[0x0e]));
        let (seq, pkt) = next_packet(&mut queue, None).unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(&*pkt.contiguous(), &[0x0e]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_incomplete_leaves_queue_untouched() {
        let bytes = frame(0, b"\x03SELECT 1");
        let mut queue = BufChain::from_vec(bytes[..6].to_vec());
        assert!(next_packet(&mut queue, None).unwrap().is_none());
        assert_eq!(queue.len(), 6);
        queue.append(BufChain::from_vec(bytes[6..].to_vec()));
        let (_, pkt) = next_packet(&mut queue, None).unwrap().unwrap();
        assert_eq!(&*pkt.contiguous(), b"\x03SELECT 1");
    }

    #[test]
    fn test_long_exact_with_empty_terminator() {
        let mut data = frame(0, &vec![0u8; MAX_PAYLOAD_LEN]);
        data.extend_from_slice(&frame(1, &[]));
        let mut queue = BufChain::from_vec(data);
        let (seq, pkt) = next_packet(&mut queue, None).unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN);
        assert!(pkt.props.contains(BufProps::MULTIPART));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_long_more() {
        let mut data = frame(0, &vec![0u8; MAX_PAYLOAD_LEN]);
        data.extend_from_slice(&frame(1, &[0x10]));
        let mut queue = BufChain::from_vec(data);
        let (seq, pkt) = next_packet(&mut queue, None).unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(pkt.len(), MAX_PAYLOAD_LEN + 1);
        assert_eq!(pkt.copy_to_vec(MAX_PAYLOAD_LEN, 1), vec![0x10]);
    }

    #[test]
    fn test_sequence_discontinuity_is_error() {
        let mut data = frame(0, &vec![0u8; MAX_PAYLOAD_LEN]);
        data.extend_from_slice(&frame(3, &[0x10]));
        let mut queue = BufChain::from_vec(data);
        assert!(next_packet(&mut queue, None).is_err());

        let mut queue = BufChain::from_vec(frame(5, b"x"));
        assert!(next_packet(&mut queue, Some(2)).is_err());
    }

    #[test]
    fn test_assemble_split_invariance() {
        // assemble(assemble(X).remainder ++ Y) == assemble(X ++ Y)
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(0, b"\x03SELECT 1"));
        stream.extend_from_slice(&frame(0, b"\x03SELECT 2"));
        stream.extend_from_slice(&frame(0, b"\x0e"));

        let whole: Vec<Vec<u8>> = {
            let mut queue = BufChain::from_vec(stream.clone());
            assemble(&mut queue)
                .unwrap()
                .into_iter()
                .map(|(_, p)| p.contiguous().to_vec())
                .collect()
        };

        for split in 0..stream.len() {
            let mut queue = BufChain::from_vec(stream[..split].to_vec());
            let mut got: Vec<Vec<u8>> = assemble(&mut queue)
                .unwrap()
                .into_iter()
                .map(|(_, p)| p.contiguous().to_vec())
                .collect();
            queue.append(BufChain::from_vec(stream[split..].to_vec()));
            got.extend(
                assemble(&mut queue)
                    .unwrap()
                    .into_iter()
                    .map(|(_, p)| p.contiguous().to_vec()),
            );
            assert_eq!(got, whole, "split at {split}");
        }
    }

    #[test]
    fn test_reemit_identity() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&frame(0, b"\x03SELECT 1"));
        stream.extend_from_slice(&frame(0, b"\x01"));
        let mut queue = BufChain::from_vec(stream.clone());
        let packets = assemble(&mut queue).unwrap();
        let mut reemitted = Vec::new();
        for (seq, pkt) in packets {
            let mut header = [0u8; 4];
            write_header(&mut header, pkt.len() as u32, seq);
            reemitted.extend_from_slice(&header);
            reemitted.extend_from_slice(&pkt.contiguous());
        }
        assert_eq!(reemitted, stream);
    }
}
