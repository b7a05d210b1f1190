//! IDS alert correlation
//!
//! Consumes Suricata eve records from the alert queue and retro-annotates
//! stored flows whose five-tuple (forward or reverse) and start time fall
//! within the correlation window. Annotation is best-effort: an alert that
//! arrives before its flow is stored matches nothing and is not retried.

pub mod queue;

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::DateTime;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::models::{FlowId, Signature};
use crate::storage::Store;

pub use queue::{AlertQueue, RedisQueue};

/// Tolerance for matching an alert to a flow by start time.
pub const WINDOW_MS: i64 = 5000;

/// Eve record fields the correlator consumes.
#[derive(Debug, Deserialize)]
struct EveRecord {
    src_ip: Option<String>,
    src_port: Option<u16>,
    dest_ip: Option<String>,
    dest_port: Option<u16>,
    flow: Option<EveFlow>,
    alert: Option<EveAlert>,
    metadata: Option<EveMetadata>,
}

#[derive(Debug, Deserialize)]
struct EveFlow {
    start: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EveAlert {
    signature: Option<String>,
    signature_id: Option<i64>,
    action: Option<String>,
    metadata: Option<EveAlertMetadata>,
}

#[derive(Debug, Deserialize)]
struct EveAlertMetadata {
    tag: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct EveMetadata {
    flowbits: Option<Vec<String>>,
}

/// Parse an eve timestamp such as `2022-05-17T19:37:02.978389+0000`.
fn parse_eve_timestamp(s: &str) -> Result<i64> {
    let dt = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z")
        .with_context(|| format!("invalid eve timestamp: {s}"))?;
    Ok(dt.timestamp_millis())
}

pub struct Correlator {
    store: Arc<dyn Store>,
    tag_flowbits: bool,
    batch_size: usize,
}

impl Correlator {
    pub fn new(store: Arc<dyn Store>, tag_flowbits: bool, batch_size: usize) -> Self {
        Self {
            store,
            tag_flowbits,
            batch_size,
        }
    }

    /// Consume the queue until shutdown. Backs off on an empty queue and on
    /// transport errors; per-record failures only skip the record.
    pub async fn run(&self, queue: &mut dyn AlertQueue, shutdown: Arc<AtomicBool>) -> Result<()> {
        while !shutdown.load(Ordering::Relaxed) {
            let lines = match queue.pop_batch(self.batch_size).await {
                Ok(lines) if lines.is_empty() => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                Ok(lines) => lines,
                Err(e) => {
                    warn!("alert queue read failed: {e:#}");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let mut processed = 0;
            for line in &lines {
                match self.handle_record(line) {
                    Ok(_) => processed += 1,
                    Err(e) => error!("failed to handle alert record: {e:#}"),
                }
            }
            info!("processed {processed} alert records");
        }

        Ok(())
    }

    /// Annotate flows for one eve record. Returns whether any flow matched.
    pub fn handle_record(&self, json: &str) -> Result<bool> {
        let rec: EveRecord = serde_json::from_str(json).context("invalid eve json")?;

        let flowbits = rec
            .metadata
            .as_ref()
            .and_then(|m| m.flowbits.clone())
            .unwrap_or_default();
        let has_action = rec
            .alert
            .as_ref()
            .map(|a| a.action.is_some())
            .unwrap_or(false);

        // Nothing to annotate with.
        if !has_action && !(self.tag_flowbits && !flowbits.is_empty()) {
            return Ok(false);
        }

        let src_ip: IpAddr = rec
            .src_ip
            .as_deref()
            .unwrap_or_default()
            .parse()
            .context("invalid src ip")?;
        let dst_ip: IpAddr = rec
            .dest_ip
            .as_deref()
            .unwrap_or_default()
            .parse()
            .context("invalid dest ip")?;

        let start = rec
            .flow
            .as_ref()
            .and_then(|f| f.start.as_deref())
            .context("missing flow start time")?;
        let time = parse_eve_timestamp(start)?;

        let id = FlowId {
            src_ip,
            src_port: rec.src_port.unwrap_or(0),
            dst_ip,
            dst_port: rec.dest_port.unwrap_or(0),
            time,
        };

        let mut updated = false;

        if let Some(alert) = rec.alert.as_ref() {
            if let Some(action) = alert.action.clone() {
                let sig = Signature {
                    sig_id: alert.signature_id.unwrap_or(0),
                    msg: alert.signature.clone().unwrap_or_default(),
                    action,
                    tag: alert
                        .metadata
                        .as_ref()
                        .and_then(|m| m.tag.as_ref())
                        .and_then(|tags| tags.first())
                        .cloned(),
                };

                updated |= self.store.add_signature_to_flow(&id, &sig, WINDOW_MS)?;
                updated |= self
                    .store
                    .add_signature_to_flow(&id.reversed(), &sig, WINDOW_MS)?;
            }
        }

        if self.tag_flowbits && !flowbits.is_empty() {
            updated |= self.store.add_tags_to_flow(&id, &flowbits, WINDOW_MS)?;
            updated |= self
                .store
                .add_tags_to_flow(&id.reversed(), &flowbits, WINDOW_MS)?;
        }

        Ok(updated)
    }
}
