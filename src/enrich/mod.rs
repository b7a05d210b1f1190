//! Inline flow enrichment
//!
//! Runs once per completed flow, before storage: HTTP parsing and body
//! decoding, then flag-regex tagging.

pub mod http;
pub mod tags;

use regex::bytes::Regex;

use crate::models::FlowEntry;

/// Enrich one completed flow in place.
pub fn process(entry: &mut FlowEntry, flag_regex: Option<&Regex>, experimental: bool) {
    http::parse_http_flow(entry, experimental);
    if let Some(re) = flag_regex {
        tags::apply_flag_tags(entry, re);
    }
}
