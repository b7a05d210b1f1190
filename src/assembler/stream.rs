//! Flow item accumulation shared by the TCP and UDP assemblers
//!
//! Collects direction-tagged payload chunks into [`FlowItem`]s, coalescing
//! consecutive same-direction chunks and clamping stored bytes to the
//! document limit. Bytes past the limit are truncated but the packets that
//! carried them still count.

use crate::models::{Direction, FlowItem, DOC_LIMIT};

/// Accumulates reassembled payload chunks for one flow.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    items: Vec<FlowItem>,
    total_size: usize,
    num_packets: u32,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one delivered chunk.
    pub fn push_chunk(&mut self, from: Direction, data: &[u8], ts_ms: i64) {
        self.num_packets += 1;
        if data.is_empty() {
            return;
        }

        let available = DOC_LIMIT.saturating_sub(self.total_size);
        let stored = data.len().min(available);
        self.total_size += stored;
        if stored == 0 {
            return;
        }

        // Consolidate subsequent chunks from the same origin.
        if let Some(last) = self.items.last_mut() {
            if last.from == from {
                last.raw.extend_from_slice(&data[..stored]);
                return;
            }
        }

        self.items.push(FlowItem::new(from, data[..stored].to_vec(), ts_ms));
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn num_packets(&self) -> u32 {
        self.num_packets
    }

    pub fn size(&self) -> usize {
        self.total_size
    }

    /// First item time and duration in ms; `None` when empty.
    pub fn time_span(&self) -> Option<(i64, i64)> {
        let first = self.items.first()?.time;
        let last = self.items.last()?.time;
        Some((first, last - first))
    }

    pub fn into_items(self) -> Vec<FlowItem> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coalesce_same_direction() {
        let mut buf = StreamBuffer::new();
        buf.push_chunk(Direction::Client, b"GET ", 1000);
        buf.push_chunk(Direction::Client, b"/ HTTP/1.1", 1005);
        buf.push_chunk(Direction::Server, b"HTTP/1.1 200 OK", 1010);

        assert_eq!(buf.num_packets(), 3);
        let items = buf.into_items();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].raw, b"GET / HTTP/1.1");
        assert_eq!(items[0].time, 1000);
        assert_eq!(items[1].from, Direction::Server);
    }

    #[test]
    fn test_empty_chunk_counts_packet_only() {
        let mut buf = StreamBuffer::new();
        buf.push_chunk(Direction::Client, b"", 1000);
        assert_eq!(buf.num_packets(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_truncation_at_limit() {
        let mut buf = StreamBuffer::new();
        let big = vec![b'A'; DOC_LIMIT - 10];
        buf.push_chunk(Direction::Client, &big, 1000);
        assert_eq!(buf.size(), DOC_LIMIT - 10);

        // 100 bytes offered, 10 fit: truncate, keep a single item.
        buf.push_chunk(Direction::Client, &[b'B'; 100], 1001);
        assert_eq!(buf.size(), DOC_LIMIT);
        assert_eq!(buf.num_packets(), 2);
        let items = buf.into_items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].raw.len(), DOC_LIMIT);

        // Past the limit nothing more is stored.
        let mut buf = StreamBuffer::new();
        buf.push_chunk(Direction::Client, &vec![b'A'; DOC_LIMIT], 1000);
        buf.push_chunk(Direction::Server, b"more", 1001);
        assert_eq!(buf.size(), DOC_LIMIT);
        assert_eq!(buf.num_packets(), 2);
        assert_eq!(buf.into_items().len(), 1);
    }

    #[test]
    fn test_time_span() {
        let mut buf = StreamBuffer::new();
        assert!(buf.time_span().is_none());
        buf.push_chunk(Direction::Client, b"a", 1000);
        buf.push_chunk(Direction::Server, b"b", 1096);
        assert_eq!(buf.time_span(), Some((1000, 96)));
    }
}
