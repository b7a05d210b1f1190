//! Flow store
//!
//! The store is an external collaborator from the pipeline's point of view;
//! [`Store`] is the exact contract the core invokes. [`SqliteStore`] is the
//! bundled adapter.

pub mod sqlite;

use anyhow::Result;

use crate::models::{FlagId, FlowEntry, FlowId, PcapFile, Signature};

pub use sqlite::SqliteStore;

/// Operations the pipeline issues against the flow store.
pub trait Store: Send + Sync {
    /// Look up ingest progress for a capture file.
    fn get_pcap(&self, name: &str) -> Result<Option<PcapFile>>;

    /// Upsert ingest progress by file name.
    fn insert_pcap(&self, record: &PcapFile) -> Result<()>;

    /// Persist a flow, returning the assigned id.
    ///
    /// Canonicalizes item payloads, links fingerprint-related flows and
    /// back-patches the linked flow's parent pointer.
    fn insert_flow(&self, entry: FlowEntry) -> Result<i64>;

    /// Ensure a tag exists in the enumerated tag set.
    fn insert_tag(&self, tag: &str) -> Result<()>;

    /// Deduplicate a signature by content, returning its handle.
    fn add_signature(&self, sig: &Signature) -> Result<i64>;

    /// Attach a signature to flows matching the identity within the window.
    /// Returns true if any flow was updated.
    fn add_signature_to_flow(&self, flow: &FlowId, sig: &Signature, window_ms: i64) -> Result<bool>;

    /// Add tags to flows matching the identity within the window.
    fn add_tags_to_flow(&self, flow: &FlowId, tags: &[String], window_ms: i64) -> Result<bool>;

    /// Record an out-of-band flag id.
    fn insert_flagid(&self, flagid: &FlagId) -> Result<()>;

    /// All known flag ids.
    fn get_flagids(&self) -> Result<Vec<FlagId>>;

    /// Fetch a flow by id.
    fn get_flow(&self, id: i64) -> Result<Option<FlowEntry>>;

    /// All flows, most recent first.
    fn list_flows(&self) -> Result<Vec<FlowEntry>>;

    /// All known tags.
    fn list_tags(&self) -> Result<Vec<String>>;

    /// Bootstrap: seed well-known tags and indexes.
    fn configure(&self) -> Result<()>;
}
