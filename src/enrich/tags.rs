//! Flag-regex tagging
//!
//! Applies the competition flag regex to every flow item. Client-side
//! matches tag the flow `flag-in`, server-side matches `flag-out`; the
//! matched literals are collected into the flow's flag set. Runs after HTTP
//! enrichment so decoded bodies are searched rather than wire bytes.

use regex::bytes::Regex;

use crate::models::{Direction, FlowEntry};

/// Apply flag in/out tags and collect matched flags.
pub fn apply_flag_tags(entry: &mut FlowEntry, flag_regex: &Regex) {
    for idx in 0..entry.flow.len() {
        let matches: Vec<String> = flag_regex
            .find_iter(&entry.flow[idx].raw)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .collect();
        if matches.is_empty() {
            continue;
        }

        let tag = match entry.flow[idx].from {
            Direction::Client => "flag-in",
            Direction::Server => "flag-out",
        };

        for flag in matches {
            entry.add_flag(&flag);
        }
        entry.add_tag(tag);
    }
}
