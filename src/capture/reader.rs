//! Capture stream reader
//!
//! Reads packets from a classic PCAP or PCAPNG byte stream (file or
//! socket). The format is sniffed from the first four magic bytes:
//! `0A 0D 0D 0A` selects PCAPNG, anything else is handed to the classic
//! reader, which rejects unknown magics itself.

use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::time::Duration;

use pcap_file::pcap::PcapReader;
use pcap_file::pcapng::{Block, PcapNgReader};
use pcap_file::DataLink;
use tracing::debug;

use super::{CaptureError, LinkLayer};

/// PCAPNG section header block type, in stream order.
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

/// An owned packet read from a capture stream.
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    /// Capture timestamp (duration since epoch).
    pub ts: Duration,
    pub data: Vec<u8>,
    pub orig_len: u32,
}

impl CapturedPacket {
    /// Capture timestamp in ms since epoch.
    pub fn ts_ms(&self) -> i64 {
        self.ts.as_millis() as i64
    }
}

type Sniffed<R> = std::io::Chain<Cursor<[u8; 4]>, R>;

enum Inner<R: Read> {
    Pcap(PcapReader<Sniffed<R>>),
    PcapNg {
        reader: PcapNgReader<Sniffed<R>>,
        pending: VecDeque<CapturedPacket>,
    },
}

/// Format-sniffing packet reader over any byte stream.
pub struct CaptureReader<R: Read> {
    inner: Inner<R>,
    snaplen: u32,
    datalink: DataLink,
}

impl<R: Read> CaptureReader<R> {
    /// Sniff the stream format and read the capture header.
    pub fn new(mut reader: R) -> Result<Self, CaptureError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        let chained = Cursor::new(magic).chain(reader);

        if magic == PCAPNG_MAGIC {
            let mut ng = PcapNgReader::new(chained)?;
            // Packets may legally precede the interface description only in
            // broken writers; stash them and fall back to defaults.
            let mut pending = VecDeque::new();
            let mut snaplen = 65535;
            let mut datalink = DataLink::ETHERNET;
            let mut have_idb = false;

            while !have_idb {
                match ng.next_block() {
                    Some(Ok(Block::InterfaceDescription(idb))) => {
                        snaplen = idb.snaplen;
                        datalink = idb.linktype;
                        have_idb = true;
                    }
                    Some(Ok(Block::EnhancedPacket(epb))) => {
                        pending.push_back(CapturedPacket {
                            ts: epb.timestamp,
                            data: epb.data.to_vec(),
                            orig_len: epb.original_len,
                        });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                }
            }

            Ok(Self {
                inner: Inner::PcapNg { reader: ng, pending },
                snaplen,
                datalink,
            })
        } else {
            let reader = PcapReader::new(chained)?;
            let header = reader.header();
            let (snaplen, datalink) = (header.snaplen, header.datalink);
            Ok(Self {
                inner: Inner::Pcap(reader),
                snaplen,
                datalink,
            })
        }
    }

    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    pub fn datalink(&self) -> DataLink {
        self.datalink
    }

    /// Map the capture's datalink to a decodable link layer.
    pub fn link_layer(&self) -> Result<LinkLayer, CaptureError> {
        link_layer_for(self.datalink)
    }

    /// Read the next packet, `None` on clean end of stream.
    pub fn next_packet(&mut self) -> Option<Result<CapturedPacket, CaptureError>> {
        match &mut self.inner {
            Inner::Pcap(reader) => reader.next_packet().map(|res| {
                res.map(|pkt| CapturedPacket {
                    ts: pkt.timestamp,
                    data: pkt.data.to_vec(),
                    orig_len: pkt.orig_len,
                })
                .map_err(CaptureError::from)
            }),
            Inner::PcapNg { reader, pending } => {
                if let Some(pkt) = pending.pop_front() {
                    return Some(Ok(pkt));
                }
                loop {
                    match reader.next_block() {
                        Some(Ok(Block::EnhancedPacket(epb))) => {
                            return Some(Ok(CapturedPacket {
                                ts: epb.timestamp,
                                data: epb.data.to_vec(),
                                orig_len: epb.original_len,
                            }));
                        }
                        Some(Ok(Block::SimplePacket(spb))) => {
                            // Simple packets carry no timestamp.
                            return Some(Ok(CapturedPacket {
                                ts: Duration::ZERO,
                                data: spb.data.to_vec(),
                                orig_len: spb.original_len,
                            }));
                        }
                        Some(Ok(other)) => {
                            debug!("skipping pcapng block: {:?}", block_name(&other));
                        }
                        Some(Err(e)) => return Some(Err(e.into())),
                        None => return None,
                    }
                }
            }
        }
    }
}

/// Map a pcap datalink value to a decodable link layer.
pub fn link_layer_for(datalink: DataLink) -> Result<LinkLayer, CaptureError> {
    match datalink {
        DataLink::ETHERNET => Ok(LinkLayer::Ethernet),
        DataLink::RAW | DataLink::IPV4 | DataLink::IPV6 => Ok(LinkLayer::RawIp),
        other => Err(CaptureError::UnsupportedLinkType(other)),
    }
}

fn block_name(block: &Block<'_>) -> &'static str {
    match block {
        Block::SectionHeader(_) => "section_header",
        Block::InterfaceDescription(_) => "interface_description",
        Block::InterfaceStatistics(_) => "interface_statistics",
        Block::NameResolution(_) => "name_resolution",
        _ => "other",
    }
}
