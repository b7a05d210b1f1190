//! TCP stream reassembly
//!
//! Per-connection state machines that turn TCP segments into ordered,
//! direction-tagged flow items. Sequence-ordered delivery buffers
//! out-of-order segments and trims overlaps; checksums are ignored.
//! Non-strict mode accepts streams with no observed handshake, which is
//! required for captures that start mid-connection.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use crate::capture::{TcpFlags, TcpSegment};
use crate::models::{Direction, FlowEntry};

use super::stream::StreamBuffer;

/// Out-of-order segments buffered per direction before gaps are collapsed.
const MAX_PENDING_SEGMENTS: usize = 1024;

type Endpoint = (IpAddr, u16);

/// Order-insensitive connection key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    ip_a: IpAddr,
    port_a: u16,
    ip_b: IpAddr,
    port_b: u16,
}

impl StreamKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self { ip_a: a.0, port_a: a.1, ip_b: b.0, port_b: b.1 }
        } else {
            Self { ip_a: b.0, port_a: b.1, ip_b: a.0, port_b: a.1 }
        }
    }
}

/// Connection state, tracked for segment acceptance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TcpState {
    New,
    SynSent,
    SynReceived,
    Established,
    Closing,
    Reset,
}

#[derive(Debug)]
struct PendingChunk {
    payload: Vec<u8>,
    ts_ms: i64,
}

/// One direction of a connection: expected sequence tracking plus an
/// out-of-order buffer keyed by offset relative to the first byte seen.
#[derive(Debug, Default)]
struct HalfStream {
    /// Absolute sequence number of relative offset zero.
    base: Option<u32>,
    next_rel: u32,
    pending: BTreeMap<u32, PendingChunk>,
    fin_seen: bool,
}

impl HalfStream {
    /// Record the ISN from a SYN.
    fn init(&mut self, next_seq: u32) {
        if self.base.is_none() {
            self.base = Some(next_seq);
            self.next_rel = 0;
        }
    }

    fn process_payload(
        &mut self,
        seq: u32,
        payload: &[u8],
        ts_ms: i64,
        sink: &mut dyn FnMut(&[u8], i64),
    ) {
        let base = match self.base {
            Some(b) => b,
            // Mid-stream pickup: adopt the first data segment's sequence.
            None => {
                self.base = Some(seq);
                self.next_rel = 0;
                seq
            }
        };

        let rel = seq.wrapping_sub(base);
        let diff = rel.wrapping_sub(self.next_rel) as i32;

        if diff == 0 {
            sink(payload, ts_ms);
            self.next_rel = self.next_rel.wrapping_add(payload.len() as u32);
            self.drain_ready(sink);
        } else if diff > 0 {
            self.pending.insert(
                rel,
                PendingChunk { payload: payload.to_vec(), ts_ms },
            );
            if self.pending.len() > MAX_PENDING_SEGMENTS {
                self.collapse_gaps(sink);
            }
        } else {
            // Overlapping or retransmitted segment: deliver only new bytes.
            let overlap = (-diff) as usize;
            if overlap < payload.len() {
                let fresh = &payload[overlap..];
                sink(fresh, ts_ms);
                self.next_rel = self.next_rel.wrapping_add(fresh.len() as u32);
                self.drain_ready(sink);
            }
        }
    }

    /// Deliver buffered segments that have become contiguous.
    fn drain_ready(&mut self, sink: &mut dyn FnMut(&[u8], i64)) {
        while let Some((&rel, _)) = self.pending.iter().next() {
            let diff = rel.wrapping_sub(self.next_rel) as i32;
            if diff > 0 {
                break;
            }
            let chunk = self.pending.remove(&rel).unwrap();
            let overlap = (-diff) as usize;
            if overlap < chunk.payload.len() {
                let fresh = &chunk.payload[overlap..];
                sink(fresh, chunk.ts_ms);
                self.next_rel = self.next_rel.wrapping_add(fresh.len() as u32);
            }
        }
    }

    /// Deliver everything left in sequence order, jumping over holes.
    fn collapse_gaps(&mut self, sink: &mut dyn FnMut(&[u8], i64)) {
        let pending = std::mem::take(&mut self.pending);
        for (rel, chunk) in pending {
            let diff = rel.wrapping_sub(self.next_rel) as i32;
            if diff < 0 {
                let overlap = (-diff) as usize;
                if overlap >= chunk.payload.len() {
                    continue;
                }
                sink(&chunk.payload[overlap..], chunk.ts_ms);
                self.next_rel = self
                    .next_rel
                    .wrapping_add((chunk.payload.len() - overlap) as u32);
            } else {
                sink(&chunk.payload, chunk.ts_ms);
                self.next_rel = rel.wrapping_add(chunk.payload.len() as u32);
            }
        }
    }
}

/// Reassembly state for one TCP connection.
#[derive(Debug)]
pub struct TcpStream {
    client: Endpoint,
    server: Endpoint,
    state: TcpState,
    fsm_err: bool,
    non_strict: bool,
    client_half: HalfStream,
    server_half: HalfStream,
    buffer: StreamBuffer,
    filename: String,
    pub last_seen_ms: i64,
    pub completed: bool,
}

impl TcpStream {
    fn new(client: Endpoint, server: Endpoint, filename: String, non_strict: bool) -> Self {
        Self {
            client,
            server,
            state: TcpState::New,
            fsm_err: false,
            non_strict,
            client_half: HalfStream::default(),
            server_half: HalfStream::default(),
            buffer: StreamBuffer::new(),
            filename,
            last_seen_ms: 0,
            completed: false,
        }
    }

    /// Advance the state machine; returns whether the segment is accepted.
    fn accept(&mut self, flags: &TcpFlags, dir: Direction) -> bool {
        use TcpState::*;

        self.state = match self.state {
            New => {
                if flags.is_syn() {
                    SynSent
                } else if self.non_strict {
                    // Mid-stream pickup
                    Established
                } else {
                    self.fsm_err = true;
                    New
                }
            }
            SynSent => {
                if flags.is_rst() {
                    Reset
                } else if flags.is_syn_ack() && dir == Direction::Server {
                    SynReceived
                } else {
                    SynSent
                }
            }
            SynReceived => {
                if flags.is_rst() {
                    Reset
                } else if flags.ack && dir == Direction::Client {
                    Established
                } else {
                    SynReceived
                }
            }
            Established => {
                if flags.is_rst() {
                    Reset
                } else if flags.is_fin() {
                    Closing
                } else {
                    Established
                }
            }
            Closing => {
                if flags.is_rst() {
                    Reset
                } else {
                    Closing
                }
            }
            Reset => Reset,
        };

        self.state != TcpState::New || self.non_strict
    }

    /// Feed one segment; returns the flow entry if the stream completed.
    pub fn feed(&mut self, src: Endpoint, seg: &TcpSegment, ts_ms: i64) -> Option<FlowEntry> {
        self.last_seen_ms = ts_ms;
        if self.completed {
            // Retained to absorb late ACKs.
            return None;
        }

        let dir = if src == self.client {
            Direction::Client
        } else {
            Direction::Server
        };

        if !self.accept(&seg.flags, dir) {
            return None;
        }

        let half = match dir {
            Direction::Client => &mut self.client_half,
            Direction::Server => &mut self.server_half,
        };

        if seg.flags.syn {
            half.init(seg.seq.wrapping_add(1));
        }

        if !seg.payload.is_empty() {
            let buffer = &mut self.buffer;
            half.process_payload(seg.seq, &seg.payload, ts_ms, &mut |data, ts| {
                buffer.push_chunk(dir, data, ts)
            });
        }

        if seg.flags.is_fin() {
            half.fin_seen = true;
        }

        if self.state == TcpState::Reset
            || (self.client_half.fin_seen && self.server_half.fin_seen)
        {
            return self.finalize();
        }

        None
    }

    /// Force completion (flush-on-timeout).
    pub fn force_complete(&mut self) -> Option<FlowEntry> {
        if self.completed {
            return None;
        }
        self.finalize()
    }

    fn finalize(&mut self) -> Option<FlowEntry> {
        self.completed = true;

        // Deliver whatever is still buffered, holes collapsed.
        let buffer = &mut self.buffer;
        self.client_half
            .collapse_gaps(&mut |data, ts| buffer.push_chunk(Direction::Client, data, ts));
        self.server_half
            .collapse_gaps(&mut |data, ts| buffer.push_chunk(Direction::Server, data, ts));

        // Without items there is nothing to timestamp or display.
        let buffer = std::mem::take(&mut self.buffer);
        let (time, duration) = buffer.time_span()?;

        Some(FlowEntry {
            id: None,
            src_ip: self.client.0,
            src_port: self.client.1,
            dst_ip: self.server.0,
            dst_port: self.server.1,
            time,
            duration,
            num_packets: buffer.num_packets(),
            blocked: false,
            filename: self.filename.clone(),
            parent_id: None,
            child_id: None,
            fingerprints: Vec::new(),
            suricata: Vec::new(),
            size: buffer.size(),
            flow: buffer.into_items(),
            tags: vec!["tcp".to_string()],
            flags: Vec::new(),
            flagids: Vec::new(),
        })
    }
}

/// Statistics for the stream pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub created: u64,
    pub completed: u64,
    pub flushed: u64,
    pub discarded: u64,
}

/// All live TCP connections, keyed by normalized endpoint pair.
pub struct TcpStreamPool {
    streams: HashMap<StreamKey, TcpStream>,
    non_strict: bool,
    pub stats: PoolStats,
}

impl TcpStreamPool {
    pub fn new(non_strict: bool) -> Self {
        Self {
            streams: HashMap::new(),
            non_strict,
            stats: PoolStats::default(),
        }
    }

    /// Route one segment to its stream; returns a completed flow, if any.
    pub fn feed(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        seg: &TcpSegment,
        ts_ms: i64,
        filename: &str,
    ) -> Option<FlowEntry> {
        let src = (src_ip, seg.src_port);
        let dst = (dst_ip, seg.dst_port);
        let key = StreamKey::new(src, dst);

        let streams = &mut self.streams;
        let stats = &mut self.stats;
        let non_strict = self.non_strict;
        let stream = streams.entry(key).or_insert_with(|| {
            stats.created += 1;
            TcpStream::new(src, dst, filename.to_string(), non_strict)
        });

        let entry = stream.feed(src, seg, ts_ms);
        if entry.is_some() {
            self.stats.completed += 1;
        }
        entry
    }

    /// Force-complete streams idle since before the threshold.
    pub fn flush_older_than(&mut self, threshold_ms: i64) -> Vec<FlowEntry> {
        let mut out = Vec::new();
        for stream in self.streams.values_mut() {
            if !stream.completed && stream.last_seen_ms < threshold_ms {
                self.stats.flushed += 1;
                if let Some(entry) = stream.force_complete() {
                    out.push(entry);
                }
            }
        }
        out
    }

    /// Remove completed streams idle since before the threshold.
    pub fn discard_older_than(&mut self, threshold_ms: i64) -> usize {
        let before = self.streams.len();
        self.streams
            .retain(|_, s| !(s.completed && s.last_seen_ms < threshold_ms));
        let removed = before - self.streams.len();
        self.stats.discarded += removed as u64;
        removed
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    const CLIENT: &str = "192.168.1.100";
    const SERVER: &str = "10.0.0.1";

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn seg(src_port: u16, dst_port: u16, seq: u32, flags: TcpFlags, payload: &[u8]) -> TcpSegment {
        TcpSegment {
            src_port,
            dst_port,
            seq,
            flags,
            payload: payload.to_vec(),
        }
    }

    fn syn() -> TcpFlags {
        TcpFlags { syn: true, ..Default::default() }
    }

    fn syn_ack() -> TcpFlags {
        TcpFlags { syn: true, ack: true, ..Default::default() }
    }

    fn ack() -> TcpFlags {
        TcpFlags { ack: true, ..Default::default() }
    }

    fn fin_ack() -> TcpFlags {
        TcpFlags { fin: true, ack: true, ..Default::default() }
    }

    fn rst() -> TcpFlags {
        TcpFlags { rst: true, ..Default::default() }
    }

    /// Complete handshake on ports 40000 -> 80, client ISN 1000, server ISN 2000.
    fn handshake(pool: &mut TcpStreamPool) {
        assert!(pool
            .feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1000, syn(), b""), 1000, "t.pcap")
            .is_none());
        assert!(pool
            .feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2000, syn_ack(), b""), 1001, "t.pcap")
            .is_none());
        assert!(pool
            .feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b""), 1002, "t.pcap")
            .is_none());
    }

    #[test]
    fn test_session_roundtrip() {
        let mut pool = TcpStreamPool::new(false);
        handshake(&mut pool);

        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b"GET / "), 1010, "t.pcap");
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1007, ack(), b"HTTP/1.1\r\n\r\n"), 1011, "t.pcap");
        pool.feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2001, ack(), b"HTTP/1.1 200 OK\r\n\r\n"), 1020, "t.pcap");

        // FIN from both sides completes the stream.
        assert!(pool
            .feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1019, fin_ack(), b""), 1030, "t.pcap")
            .is_none());
        let entry = pool
            .feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2020, fin_ack(), b""), 1096, "t.pcap")
            .expect("stream should complete on both FINs");

        assert_eq!(entry.src_ip, ip(CLIENT));
        assert_eq!(entry.src_port, 40000);
        assert_eq!(entry.dst_port, 80);
        assert_eq!(entry.tags, vec!["tcp"]);
        assert_eq!(entry.time, 1010);
        assert_eq!(entry.duration, 10);
        assert_eq!(entry.num_packets, 3);

        // Client chunks coalesce into one item.
        assert_eq!(entry.flow.len(), 2);
        assert_eq!(entry.flow[0].from, Direction::Client);
        assert_eq!(entry.flow[0].raw, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(entry.flow[1].raw, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(entry.size, entry.flow.iter().map(|i| i.raw.len()).sum::<usize>());
    }

    #[test]
    fn test_out_of_order_delivery() {
        let mut pool = TcpStreamPool::new(false);
        handshake(&mut pool);

        // Second chunk arrives first.
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1006, ack(), b"world"), 1010, "t.pcap");
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b"hello"), 1011, "t.pcap");

        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1011, fin_ack(), b""), 1020, "t.pcap");
        let entry = pool
            .feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2001, fin_ack(), b""), 1021, "t.pcap")
            .unwrap();

        assert_eq!(entry.flow.len(), 1);
        assert_eq!(entry.flow[0].raw, b"helloworld");
        assert_eq!(entry.num_packets, 2);
    }

    #[test]
    fn test_retransmission_ignored() {
        let mut pool = TcpStreamPool::new(false);
        handshake(&mut pool);

        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b"data"), 1010, "t.pcap");
        // Exact retransmission.
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b"data"), 1011, "t.pcap");

        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1005, fin_ack(), b""), 1020, "t.pcap");
        let entry = pool
            .feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2001, fin_ack(), b""), 1021, "t.pcap")
            .unwrap();

        assert_eq!(entry.flow[0].raw, b"data");
        assert_eq!(entry.num_packets, 1);
    }

    #[test]
    fn test_overlap_trimmed() {
        let mut pool = TcpStreamPool::new(false);
        handshake(&mut pool);

        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b"abcdef"), 1010, "t.pcap");
        // Overlaps the last four bytes, carries two new ones.
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1003, ack(), b"cdefGH"), 1011, "t.pcap");

        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1009, fin_ack(), b""), 1020, "t.pcap");
        let entry = pool
            .feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2001, fin_ack(), b""), 1021, "t.pcap")
            .unwrap();

        assert_eq!(entry.flow[0].raw, b"abcdefGH");
    }

    #[test]
    fn test_strict_rejects_missing_handshake() {
        let mut pool = TcpStreamPool::new(false);
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 5000, ack(), b"mid-stream"), 1000, "t.pcap");

        let flushed = pool.flush_older_than(2000);
        assert!(flushed.is_empty(), "strict mode must drop handshake-less data");
    }

    #[test]
    fn test_nonstrict_accepts_missing_handshake() {
        let mut pool = TcpStreamPool::new(true);
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 5000, ack(), b"mid"), 1000, "t.pcap");
        pool.feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 9000, ack(), b"stream"), 1005, "t.pcap");

        let flushed = pool.flush_older_than(2000);
        assert_eq!(flushed.len(), 1);
        let entry = &flushed[0];
        assert_eq!(entry.flow.len(), 2);
        assert_eq!(entry.flow[0].raw, b"mid");
        assert_eq!(entry.flow[1].raw, b"stream");
        // First observed packet's sender is the client.
        assert_eq!(entry.src_ip, ip(CLIENT));
    }

    #[test]
    fn test_rst_completes() {
        let mut pool = TcpStreamPool::new(false);
        handshake(&mut pool);

        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b"payload"), 1010, "t.pcap");
        let entry = pool
            .feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2001, rst(), b""), 1011, "t.pcap")
            .expect("RST should complete the stream");

        assert_eq!(entry.flow[0].raw, b"payload");
    }

    #[test]
    fn test_flush_and_discard() {
        let mut pool = TcpStreamPool::new(true);
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1, ack(), b"x"), 1000, "t.pcap");
        assert_eq!(pool.len(), 1);

        // Not yet idle.
        assert!(pool.flush_older_than(500).is_empty());

        let flushed = pool.flush_older_than(5000);
        assert_eq!(flushed.len(), 1);

        // Completed and idle: removed.
        assert_eq!(pool.discard_older_than(5000), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_empty_stream_dropped_on_flush() {
        let mut pool = TcpStreamPool::new(false);
        // Handshake only, no payload.
        handshake(&mut pool);
        assert!(pool.flush_older_than(5000).is_empty());
        assert_eq!(pool.discard_older_than(5000), 1);
    }

    #[test]
    fn test_late_packet_after_completion_ignored() {
        let mut pool = TcpStreamPool::new(false);
        handshake(&mut pool);
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1001, ack(), b"d"), 1010, "t.pcap");
        pool.feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1002, fin_ack(), b""), 1011, "t.pcap");
        let entry = pool.feed(ip(SERVER), ip(CLIENT), &seg(80, 40000, 2001, fin_ack(), b""), 1012, "t.pcap");
        assert!(entry.is_some());

        // Last ACK after completion.
        assert!(pool
            .feed(ip(CLIENT), ip(SERVER), &seg(40000, 80, 1003, ack(), b""), 1013, "t.pcap")
            .is_none());
        assert_eq!(pool.len(), 1);
    }
}
