//! Flow documents and store records
//!
//! The shapes persisted by the flow store and passed between the assembler,
//! the enrichment stage, and the correlator.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Maximum serialized size of a stored flow document, minus headroom for
/// the non-payload fields.
pub const DOC_LIMIT: usize = 6_000_000 - 0x1000;

/// Which endpoint a flow item was sent by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by the connection initiator.
    #[serde(rename = "c")]
    Client,
    /// Sent by the responder.
    #[serde(rename = "s")]
    Server,
}

impl Direction {
    /// The opposite direction.
    pub fn flip(self) -> Self {
        match self {
            Direction::Client => Direction::Server,
            Direction::Server => Direction::Client,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Client => write!(f, "c"),
            Direction::Server => write!(f, "s"),
        }
    }
}

/// One contiguous, direction-tagged payload chunk within a flow.
///
/// `raw` holds the authoritative reassembled bytes. `data` is the printable
/// rendering derived from `raw` when the flow is inserted into the store;
/// until then it is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowItem {
    pub from: Direction,
    #[serde(default)]
    pub data: String,
    #[serde(with = "base64_bytes")]
    pub raw: Vec<u8>,
    /// Capture time of the first packet of the chunk (ms since epoch).
    pub time: i64,
}

impl FlowItem {
    pub fn new(from: Direction, raw: Vec<u8>, time: i64) -> Self {
        Self {
            from,
            data: String::new(),
            raw,
            time,
        }
    }
}

/// One reassembled connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEntry {
    /// Store-assigned identifier, `None` until inserted.
    #[serde(default)]
    pub id: Option<i64>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// Capture time of the first item (ms since epoch).
    pub time: i64,
    /// Last item time minus first item time (ms).
    pub duration: i64,
    pub num_packets: u32,
    pub blocked: bool,
    /// Capture file this flow was reassembled from.
    pub filename: String,
    #[serde(default)]
    pub parent_id: Option<i64>,
    #[serde(default)]
    pub child_id: Option<i64>,
    /// Cookie fingerprints used for cross-flow linkage.
    #[serde(default)]
    pub fingerprints: Vec<u32>,
    /// Handles of IDS signatures correlated to this flow.
    #[serde(default)]
    pub suricata: Vec<i64>,
    pub flow: Vec<FlowItem>,
    pub tags: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub flagids: Vec<String>,
    /// Sum of stored item bytes, clamped to [`DOC_LIMIT`].
    pub size: usize,
}

impl FlowEntry {
    /// Add a tag if not already present.
    pub fn add_tag(&mut self, tag: &str) {
        if !self.tags.iter().any(|t| t == tag) {
            self.tags.push(tag.to_string());
        }
    }

    /// Add a flag literal if not already present.
    pub fn add_flag(&mut self, flag: &str) {
        if !self.flags.iter().any(|f| f == flag) {
            self.flags.push(flag.to_string());
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// An IDS rule hit, deduplicated by content in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub sig_id: i64,
    pub msg: String,
    pub action: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Ingest-progress record for a capture file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PcapFile {
    pub file_name: String,
    /// Number of packets consumed so far.
    pub position: u64,
    pub finished: bool,
}

/// Flow identity used by the correlator's window lookups.
#[derive(Debug, Clone)]
pub struct FlowId {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    /// Flow start time (ms since epoch).
    pub time: i64,
}

impl FlowId {
    /// The same identity with endpoints swapped.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            time: self.time,
        }
    }
}

/// Out-of-band flag identifier tied to a service/team/round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagId {
    pub service: String,
    pub team: i64,
    pub round: i64,
    pub description: String,
    pub flagid: String,
}

/// Serialize raw bytes as base64 inside JSON documents.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_serde() {
        assert_eq!(serde_json::to_string(&Direction::Client).unwrap(), "\"c\"");
        assert_eq!(serde_json::to_string(&Direction::Server).unwrap(), "\"s\"");
        let d: Direction = serde_json::from_str("\"s\"").unwrap();
        assert_eq!(d, Direction::Server);
    }

    #[test]
    fn test_flow_item_raw_roundtrip() {
        let item = FlowItem::new(Direction::Client, vec![0x00, 0xff, b'A'], 1234);
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("\"raw\":\"AP9B\""));
        let back: FlowItem = serde_json::from_str(&json).unwrap();
        assert_eq!(back.raw, item.raw);
        assert_eq!(back.time, 1234);
    }

    #[test]
    fn test_add_tag_dedup() {
        let mut entry = FlowEntry {
            id: None,
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 1,
            dst_port: 2,
            time: 0,
            duration: 0,
            num_packets: 1,
            blocked: false,
            filename: String::new(),
            parent_id: None,
            child_id: None,
            fingerprints: vec![],
            suricata: vec![],
            flow: vec![],
            tags: vec!["tcp".into()],
            flags: vec![],
            flagids: vec![],
            size: 0,
        };
        entry.add_tag("http");
        entry.add_tag("http");
        assert_eq!(entry.tags, vec!["tcp", "http"]);
        entry.add_flag("FLAG{x}");
        entry.add_flag("FLAG{x}");
        assert_eq!(entry.flags.len(), 1);
    }
}
