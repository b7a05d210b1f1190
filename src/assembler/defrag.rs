//! IPv4 defragmentation
//!
//! Reassembles fragmented IPv4 packets before transport dispatch. Fragment
//! state is keyed by (src, dst, id, protocol) and discarded when stale.
//! IPv6 fragments are out of scope.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use crate::capture::decode::FragmentInfo;
use crate::capture::IpProtocol;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FragmentKey {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub id: u16,
    pub protocol: IpProtocol,
}

struct FragmentBuffer {
    /// Fragment payloads keyed by byte offset.
    parts: BTreeMap<usize, Vec<u8>>,
    /// Total payload length, known once the last fragment arrives.
    total_len: Option<usize>,
    last_seen_ms: i64,
}

impl FragmentBuffer {
    fn new(ts_ms: i64) -> Self {
        Self {
            parts: BTreeMap::new(),
            total_len: None,
            last_seen_ms: ts_ms,
        }
    }

    /// Assemble the full payload if every byte up to `total_len` is covered.
    fn try_assemble(&self) -> Option<Vec<u8>> {
        let total = self.total_len?;

        let mut covered = 0usize;
        for (&offset, part) in &self.parts {
            if offset > covered {
                return None; // hole
            }
            covered = covered.max(offset + part.len());
        }
        if covered < total {
            return None;
        }

        let mut out = vec![0u8; total];
        for (&offset, part) in &self.parts {
            let end = (offset + part.len()).min(total);
            out[offset..end].copy_from_slice(&part[..end - offset]);
        }
        Some(out)
    }
}

/// Reassembles IPv4 fragments into whole IP payloads.
pub struct Ipv4Defragmenter {
    buffers: HashMap<FragmentKey, FragmentBuffer>,
}

impl Ipv4Defragmenter {
    pub fn new() -> Self {
        Self {
            buffers: HashMap::new(),
        }
    }

    /// Feed one fragment. Returns the whole IP payload once complete.
    pub fn process(
        &mut self,
        key: FragmentKey,
        frag: FragmentInfo,
        payload: &[u8],
        ts_ms: i64,
    ) -> Option<Vec<u8>> {
        let buffer = self
            .buffers
            .entry(key.clone())
            .or_insert_with(|| FragmentBuffer::new(ts_ms));
        buffer.last_seen_ms = ts_ms;
        buffer.parts.insert(frag.offset, payload.to_vec());
        if !frag.more_fragments {
            buffer.total_len = Some(frag.offset + payload.len());
        }

        let assembled = buffer.try_assemble();
        if assembled.is_some() {
            self.buffers.remove(&key);
        }
        assembled
    }

    /// Drop fragment state last touched before the threshold.
    pub fn discard_older_than(&mut self, threshold_ms: i64) -> usize {
        let before = self.buffers.len();
        self.buffers.retain(|_, b| b.last_seen_ms >= threshold_ms);
        before - self.buffers.len()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

impl Default for Ipv4Defragmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FragmentKey {
        FragmentKey {
            src: "10.0.0.1".parse().unwrap(),
            dst: "10.0.0.2".parse().unwrap(),
            id: 42,
            protocol: IpProtocol::Udp,
        }
    }

    #[test]
    fn test_two_fragment_reassembly() {
        let mut defrag = Ipv4Defragmenter::new();

        let first = defrag.process(
            key(),
            FragmentInfo { id: 42, offset: 0, more_fragments: true },
            &[1; 16],
            1000,
        );
        assert!(first.is_none());
        assert_eq!(defrag.len(), 1);

        let full = defrag.process(
            key(),
            FragmentInfo { id: 42, offset: 16, more_fragments: false },
            &[2; 8],
            1001,
        );
        let full = full.expect("fragments should assemble");
        assert_eq!(full.len(), 24);
        assert_eq!(&full[..16], &[1; 16]);
        assert_eq!(&full[16..], &[2; 8]);
        assert!(defrag.is_empty());
    }

    #[test]
    fn test_out_of_order_fragments() {
        let mut defrag = Ipv4Defragmenter::new();

        assert!(defrag
            .process(
                key(),
                FragmentInfo { id: 42, offset: 8, more_fragments: false },
                &[9; 4],
                1000,
            )
            .is_none());

        let full = defrag
            .process(
                key(),
                FragmentInfo { id: 42, offset: 0, more_fragments: true },
                &[3; 8],
                1001,
            )
            .expect("fragments should assemble");
        assert_eq!(full.len(), 12);
    }

    #[test]
    fn test_hole_blocks_assembly() {
        let mut defrag = Ipv4Defragmenter::new();

        assert!(defrag
            .process(
                key(),
                FragmentInfo { id: 42, offset: 0, more_fragments: true },
                &[0; 8],
                1000,
            )
            .is_none());
        // offset 16 leaves a hole at 8..16
        assert!(defrag
            .process(
                key(),
                FragmentInfo { id: 42, offset: 16, more_fragments: false },
                &[0; 8],
                1001,
            )
            .is_none());
        assert_eq!(defrag.len(), 1);
    }

    #[test]
    fn test_discard_older_than() {
        let mut defrag = Ipv4Defragmenter::new();
        defrag.process(
            key(),
            FragmentInfo { id: 42, offset: 0, more_fragments: true },
            &[0; 8],
            1000,
        );

        assert_eq!(defrag.discard_older_than(500), 0);
        assert_eq!(defrag.discard_older_than(2000), 1);
        assert!(defrag.is_empty());
    }
}
