//! Packet and capture-file primitives
//!
//! Strongly-typed views over raw capture bytes: link/transport decoding and
//! a format-sniffing reader for classic PCAP and PCAPNG streams.

pub mod decode;
pub mod reader;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use decode::{decode_packet, decode_transport, DecodedPacket, TcpSegment, Transport, UdpDatagram};
pub use reader::{CaptureReader, CapturedPacket};

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Icmpv6,
    Other(u8),
}

impl From<u8> for IpProtocol {
    fn from(val: u8) -> Self {
        match val {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            58 => IpProtocol::Icmpv6,
            other => IpProtocol::Other(other),
        }
    }
}

impl From<IpProtocol> for u8 {
    fn from(val: IpProtocol) -> Self {
        match val {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Icmpv6 => 58,
            IpProtocol::Other(v) => v,
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Icmpv6 => write!(f, "ICMPv6"),
            IpProtocol::Other(n) => write!(f, "Proto({})", n),
        }
    }
}

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
    pub ece: bool,
    pub cwr: bool,
}

impl TcpFlags {
    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }

    pub fn is_fin(&self) -> bool {
        self.fin
    }

    pub fn is_rst(&self) -> bool {
        self.rst
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// Link-layer framing of a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Raw IP packets with no link framing.
    RawIp,
}

/// Errors from the capture layer.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capture format error: {0}")]
    Format(#[from] pcap_file::PcapError),

    #[error("unsupported link type: {0:?}")]
    UnsupportedLinkType(pcap_file::DataLink),

    #[error("packet decode error: {0}")]
    Decode(String),

    #[error("truncated {0} header")]
    Truncated(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_protocol_roundtrip() {
        assert_eq!(IpProtocol::from(6u8), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from(17u8), IpProtocol::Udp);
        assert_eq!(u8::from(IpProtocol::Other(99)), 99);
    }

    #[test]
    fn test_tcp_flags_display() {
        let flags = TcpFlags { syn: true, ack: true, ..Default::default() };
        assert!(flags.is_syn_ack());
        assert!(!flags.is_syn());
        assert_eq!(flags.to_string(), "SA");
    }
}
