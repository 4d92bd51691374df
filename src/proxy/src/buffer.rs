//! Chained byte buffers. A [`BufChain`] is a linked sequence of shared byte
//! regions: appends link new regions instead of reallocating, clones share the
//! underlying storage, and consuming from the front never copies what remains.

use crate::hint::Hint;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

/// Coarse classification of what a buffer holds, set by whoever produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufType {
    #[default]
    Raw,
    SingleStatement,
    CollectedResult,
}

bitflags::bitflags! {
    /// Boolean properties a buffer carries through the routing chain.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufProps: u8 {
        /// Reassembled from 0xFFFFFF continuation packets.
        const MULTIPART = 0x01;
        /// Replayed from a recorded session, not read off the wire.
        const REPLAYED = 0x02;
        /// End-of-stream marker for LOAD DATA uploads.
        const STREAM_END = 0x04;
        /// Raw LOAD DATA chunk; carries no command byte.
        const STREAM_DATA = 0x08;
    }
}

#[derive(Debug, Clone, Default)]
pub struct BufChain {
    segments: VecDeque<Bytes>,
    pub buf_type: BufType,
    pub props: BufProps,
    /// Resolved prepared-statement id for PS commands. The state machine
    /// resolves the reserved direct-execute id before filters see the buffer.
    pub ps_id: Option<u32>,
    pub hints: Vec<Hint>,
}

impl BufChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        let mut segments = VecDeque::with_capacity(1);
        if !bytes.is_empty() {
            segments.push_back(bytes);
        }
        Self {
            segments,
            ..Default::default()
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(data))
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Bytes::is_empty)
    }

    /// O(1): links the region, no copy.
    pub fn append_bytes(&mut self, bytes: Bytes) {
        if !bytes.is_empty() {
            self.segments.push_back(bytes);
        }
    }

    /// O(1): links the other chain's regions onto this one. Type, props and
    /// hints of `self` win; the appended chain only contributes bytes.
    pub fn append(&mut self, mut other: BufChain) {
        self.segments.append(&mut other.segments);
    }

    /// Removes and returns the first `n` bytes as a new chain. The child
    /// inherits type, props and hints. Panics if fewer than `n` bytes remain.
    pub fn split_to(&mut self, n: usize) -> BufChain {
        assert!(n <= self.len(), "split_to past end of chain");
        let mut taken = VecDeque::new();
        let mut remaining = n;
        while remaining > 0 {
            let mut front = self.segments.pop_front().expect("length checked above");
            if front.len() <= remaining {
                remaining -= front.len();
                taken.push_back(front);
            } else {
                taken.push_back(front.split_to(remaining));
                remaining = 0;
                self.segments.push_front(front);
            }
        }
        BufChain {
            segments: taken,
            buf_type: self.buf_type,
            props: self.props,
            ps_id: self.ps_id,
            hints: self.hints.clone(),
        }
    }

    /// Drops the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        let _ = self.split_to(n);
    }

    /// Copies `n` bytes starting at `offset` out of the chain. Returns fewer
    /// bytes if the chain is shorter.
    pub fn copy_to_vec(&self, offset: usize, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let mut skip = offset;
        for seg in &self.segments {
            if out.len() == n {
                break;
            }
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let avail = &seg[skip..];
            skip = 0;
            let want = n - out.len();
            out.extend_from_slice(&avail[..avail.len().min(want)]);
        }
        out
    }

    /// The byte at `offset`, if present.
    pub fn byte_at(&self, offset: usize) -> Option<u8> {
        let mut skip = offset;
        for seg in &self.segments {
            if skip < seg.len() {
                return Some(seg[skip]);
            }
            skip -= seg.len();
        }
        None
    }

    /// First byte of the chain; for COM packets this is the command code.
    pub fn first_byte(&self) -> Option<u8> {
        self.byte_at(0)
    }

    /// A contiguous view of the whole chain. Free when the chain holds a
    /// single region; flattens (one copy) otherwise. Parsers use this, the
    /// forwarding paths never do.
    pub fn contiguous(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut flat = BytesMut::with_capacity(self.len());
                for seg in &self.segments {
                    flat.extend_from_slice(seg);
                }
                flat.freeze()
            }
        }
    }

    pub fn add_hint(&mut self, hint: Hint) {
        self.hints.push(hint);
    }

    pub fn mark_statement(&mut self) {
        self.buf_type = BufType::SingleStatement;
    }

    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }
}

impl From<Vec<u8>> for BufChain {
    fn from(data: Vec<u8>) -> Self {
        BufChain::from_vec(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hint::Hint;

    fn chain_of(parts: &[&[u8]]) -> BufChain {
        let mut chain = BufChain::new();
        for p in parts {
            chain.append_bytes(Bytes::copy_from_slice(p));
        }
        chain
    }

    #[test]
    fn test_append_is_linking() {
        let mut chain = chain_of(&[b"abc"]);
        chain.append(chain_of(&[b"defg", b"hi"]));
        assert_eq!(chain.len(), 9);
        assert_eq!(chain.segments.len(), 3);
        assert_eq!(&*chain.contiguous(), b"abcdefghi");
    }

    #[test]
    fn test_split_and_consume_across_segments() {
        let mut chain = chain_of(&[b"abc", b"def"]);
        let front = chain.split_to(4);
        assert_eq!(&*front.contiguous(), b"abcd");
        assert_eq!(&*chain.contiguous(), b"ef");
        chain.consume(1);
        assert_eq!(&*chain.contiguous(), b"f");
    }

    #[test]
    fn test_copy_at_offset() {
        let chain = chain_of(&[b"abc", b"def", b"gh"]);
        assert_eq!(chain.copy_to_vec(2, 4), b"cdef");
        assert_eq!(chain.copy_to_vec(6, 10), b"gh");
        assert_eq!(chain.byte_at(3), Some(b'd'));
        assert_eq!(chain.byte_at(8), None);
    }

    #[test]
    fn test_hints_propagate_to_children() {
        let mut chain = chain_of(&[b"abcdef"]);
        chain.add_hint(Hint::RouteToMaster);
        chain.props |= BufProps::MULTIPART;
        let child = chain.split_to(3);
        assert_eq!(child.hints, vec![Hint::RouteToMaster]);
        assert!(child.props.contains(BufProps::MULTIPART));
    }

    #[test]
    fn test_clone_is_shallow() {
        let chain = chain_of(&[b"abcdef"]);
        let copy = chain.clone();
        // Bytes clones share storage, so the data pointers must be equal.
        assert_eq!(
            chain.segments[0].as_ptr(),
            copy.segments[0].as_ptr()
        );
    }
}
