//! UDP stream assembly
//!
//! Groups datagrams into address-pair sessions. A stream is keyed by the
//! order-insensitive endpoint pair and completed once it has been idle past
//! the UDP timeout.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::capture::UdpDatagram;
use crate::models::{Direction, FlowEntry};

use super::stream::StreamBuffer;

/// Order-insensitive stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UdpStreamId {
    ip_lower: IpAddr,
    ip_upper: IpAddr,
    port_lower: u16,
    port_upper: u16,
}

impl UdpStreamId {
    fn new(src: (IpAddr, u16), dst: (IpAddr, u16)) -> Self {
        let (ip_lower, ip_upper) = if src.0 <= dst.0 { (src.0, dst.0) } else { (dst.0, src.0) };
        let (port_lower, port_upper) = if src.1 <= dst.1 { (src.1, dst.1) } else { (dst.1, src.1) };
        Self {
            ip_lower,
            ip_upper,
            port_lower,
            port_upper,
        }
    }
}

/// One UDP address-pair session.
pub struct UdpStream {
    /// Endpoints as first observed; the first sender is the client.
    client: (IpAddr, u16),
    server: (IpAddr, u16),
    buffer: StreamBuffer,
    filename: String,
    pub last_seen_ms: i64,
}

impl UdpStream {
    fn new(client: (IpAddr, u16), server: (IpAddr, u16), filename: String) -> Self {
        Self {
            client,
            server,
            buffer: StreamBuffer::new(),
            filename,
            last_seen_ms: 0,
        }
    }

    fn process_datagram(&mut self, dst_ip: IpAddr, payload: &[u8], ts_ms: i64) {
        if payload.is_empty() {
            return;
        }

        // A datagram addressed at the stream's original source endpoint is
        // tagged as coming from the client.
        let from = if dst_ip == self.client.0 {
            Direction::Client
        } else {
            Direction::Server
        };

        self.last_seen_ms = ts_ms;
        self.buffer.push_chunk(from, payload, ts_ms);
    }

    fn complete(self) -> Option<FlowEntry> {
        let (time, duration) = self.buffer.time_span()?;

        Some(FlowEntry {
            id: None,
            src_ip: self.client.0,
            src_port: self.client.1,
            dst_ip: self.server.0,
            dst_port: self.server.1,
            time,
            duration,
            num_packets: self.buffer.num_packets(),
            blocked: false,
            filename: self.filename,
            parent_id: None,
            child_id: None,
            fingerprints: Vec::new(),
            suricata: Vec::new(),
            size: self.buffer.size(),
            flow: self.buffer.into_items(),
            tags: vec!["udp".to_string()],
            flags: Vec::new(),
            flagids: Vec::new(),
        })
    }
}

/// All live UDP streams.
pub struct UdpAssembler {
    streams: HashMap<UdpStreamId, UdpStream>,
}

impl UdpAssembler {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
        }
    }

    /// Route one datagram to its stream.
    pub fn feed(
        &mut self,
        src_ip: IpAddr,
        dst_ip: IpAddr,
        dgram: &UdpDatagram,
        ts_ms: i64,
        filename: &str,
    ) {
        let src = (src_ip, dgram.src_port);
        let dst = (dst_ip, dgram.dst_port);
        let id = UdpStreamId::new(src, dst);

        let stream = self
            .streams
            .entry(id)
            .or_insert_with(|| UdpStream::new(src, dst, filename.to_string()));

        stream.process_datagram(dst_ip, &dgram.payload, ts_ms);
    }

    /// Complete and remove streams last seen before the threshold.
    pub fn complete_older_than(&mut self, threshold_ms: i64) -> Vec<FlowEntry> {
        let expired: Vec<UdpStreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.last_seen_ms < threshold_ms)
            .map(|(id, _)| id.clone())
            .collect();

        let mut flows = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(stream) = self.streams.remove(&id) {
                if let Some(entry) = stream.complete() {
                    flows.push(entry);
                }
            }
        }

        flows
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

impl Default for UdpAssembler {
    fn default() -> Self {
        Self::new()
    }
}
