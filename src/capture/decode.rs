//! Packet decoding
//!
//! Slices raw capture bytes into IP and transport layer views with
//! `etherparse`. Fragmented IPv4 packets are reported with their fragment
//! metadata so the assembler can route them through the defragmenter; the
//! transport layer of a fragment is decoded only after reassembly.

use std::net::IpAddr;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

use super::{CaptureError, IpProtocol, LinkLayer, TcpFlags};

/// IPv4 fragment metadata.
#[derive(Debug, Clone, Copy)]
pub struct FragmentInfo {
    pub id: u16,
    /// Payload offset in bytes.
    pub offset: usize,
    pub more_fragments: bool,
}

/// A decoded TCP segment.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

/// A decoded UDP datagram.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Transport layer of a decoded packet.
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
    Other(IpProtocol),
}

/// A decoded IP packet.
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub protocol: IpProtocol,
    /// Set for IPv4 fragments; `transport` is `None` in that case.
    pub fragment: Option<FragmentInfo>,
    /// IP payload bytes, kept for defragmentation.
    pub ip_payload: Vec<u8>,
    pub transport: Option<Transport>,
}

/// Decode a raw capture frame into IP and transport views.
///
/// Returns `Ok(None)` for non-IP frames (ARP and friends).
pub fn decode_packet(data: &[u8], link: LinkLayer) -> Result<Option<DecodedPacket>, CaptureError> {
    let sliced = match link {
        LinkLayer::Ethernet => SlicedPacket::from_ethernet(data),
        LinkLayer::RawIp => SlicedPacket::from_ip(data),
    }
    .map_err(|e| CaptureError::Decode(e.to_string()))?;

    let (src_ip, dst_ip, protocol, fragment, ip_payload) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            let fragment = if header.is_fragmenting_payload() {
                Some(FragmentInfo {
                    id: header.identification(),
                    offset: header.fragments_offset().value() as usize * 8,
                    more_fragments: header.more_fragments(),
                })
            } else {
                None
            };
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.protocol().0),
                fragment,
                ipv4.payload().payload.to_vec(),
            )
        }
        Some(NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
                IpProtocol::from(header.next_header().0),
                None,
                ipv6.payload().payload.to_vec(),
            )
        }
        _ => return Ok(None),
    };

    let transport = if fragment.is_some() {
        None
    } else {
        Some(match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => Transport::Tcp(TcpSegment {
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                seq: tcp.sequence_number(),
                flags: TcpFlags {
                    fin: tcp.fin(),
                    syn: tcp.syn(),
                    rst: tcp.rst(),
                    psh: tcp.psh(),
                    ack: tcp.ack(),
                    urg: tcp.urg(),
                    ece: tcp.ece(),
                    cwr: tcp.cwr(),
                },
                payload: tcp.payload().to_vec(),
            }),
            Some(TransportSlice::Udp(udp)) => Transport::Udp(UdpDatagram {
                src_port: udp.source_port(),
                dst_port: udp.destination_port(),
                payload: udp.payload().to_vec(),
            }),
            _ => Transport::Other(protocol),
        })
    };

    Ok(Some(DecodedPacket {
        src_ip,
        dst_ip,
        protocol,
        fragment,
        ip_payload,
        transport,
    }))
}

/// Decode the transport layer from a reassembled IP payload.
pub fn decode_transport(protocol: IpProtocol, payload: &[u8]) -> Result<Transport, CaptureError> {
    match protocol {
        IpProtocol::Tcp => {
            let header = etherparse::TcpHeaderSlice::from_slice(payload)
                .map_err(|e| CaptureError::Decode(e.to_string()))?;
            let data_offset = header.data_offset() as usize * 4;
            if payload.len() < data_offset {
                return Err(CaptureError::Truncated("tcp"));
            }
            Ok(Transport::Tcp(TcpSegment {
                src_port: header.source_port(),
                dst_port: header.destination_port(),
                seq: header.sequence_number(),
                flags: TcpFlags {
                    fin: header.fin(),
                    syn: header.syn(),
                    rst: header.rst(),
                    psh: header.psh(),
                    ack: header.ack(),
                    urg: header.urg(),
                    ece: header.ece(),
                    cwr: header.cwr(),
                },
                payload: payload[data_offset..].to_vec(),
            }))
        }
        IpProtocol::Udp => {
            let header = etherparse::UdpHeaderSlice::from_slice(payload)
                .map_err(|e| CaptureError::Decode(e.to_string()))?;
            Ok(Transport::Udp(UdpDatagram {
                src_port: header.source_port(),
                dst_port: header.destination_port(),
                payload: payload[8..].to_vec(),
            }))
        }
        other => Ok(Transport::Other(other)),
    }
}
