//! Capture assembly service
//!
//! Watches a directory for finished capture files and turns them into flow
//! entries: packet decode, IPv4 defragmentation, TCP/UDP reassembly, inline
//! enrichment, and insertion through a bounded worker pool. The packet loop
//! is single-threaded and owns all reassembly state; backpressure comes
//! from the rendezvous flow channel when every insert worker is busy.

pub mod defrag;
pub mod stream;
pub mod tcp;
pub mod udp;

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use crossbeam_channel::{bounded, Sender};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex::bytes::Regex;
use tracing::{debug, error, info, warn};

use crate::capture::{
    decode_packet, decode_transport, CaptureReader, CapturedPacket, LinkLayer, Transport,
};
use crate::config::AssemblerConfig;
use crate::enrich;
use crate::models::{FlowEntry, PcapFile};
use crate::storage::Store;

use defrag::{FragmentKey, Ipv4Defragmenter};
use tcp::TcpStreamPool;
use udp::UdpAssembler;

/// Reassembles capture files into stored flow entries.
pub struct AssemblerService {
    store: Arc<dyn Store>,
    shutdown: Arc<AtomicBool>,

    flag_regex: Option<Regex>,
    experimental: bool,
    flush_interval_secs: u64,
    tcp_timeout_ms: i64,
    udp_timeout_ms: i64,

    defrag: Ipv4Defragmenter,
    tcp: TcpStreamPool,
    udp: UdpAssembler,

    flow_tx: Option<Sender<FlowEntry>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl AssemblerService {
    pub fn new(
        config: &AssemblerConfig,
        store: Arc<dyn Store>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let flag_regex = config
            .flag_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid flag regex")?;

        let (flow_tx, flow_rx) = bounded::<FlowEntry>(0);

        let mut workers = Vec::with_capacity(config.insert_workers);
        for i in 0..config.insert_workers.max(1) {
            let rx = flow_rx.clone();
            let store = Arc::clone(&store);
            let handle = thread::Builder::new()
                .name(format!("flow-insert-{i}"))
                .spawn(move || {
                    for entry in rx.iter() {
                        let filename = entry.filename.clone();
                        if let Err(e) = store.insert_flow(entry) {
                            error!("failed to insert flow from {filename}: {e:#}");
                        }
                    }
                })
                .context("failed to spawn insert worker")?;
            workers.push(handle);
        }

        Ok(Self {
            store,
            shutdown,
            flag_regex,
            experimental: config.experimental,
            flush_interval_secs: config.flush_interval_secs,
            tcp_timeout_ms: config.connection_tcp_timeout_secs as i64 * 1000,
            udp_timeout_ms: config.connection_udp_timeout_secs as i64 * 1000,
            defrag: Ipv4Defragmenter::new(),
            tcp: TcpStreamPool::new(config.nonstrict),
            udp: UdpAssembler::new(),
            flow_tx: Some(flow_tx),
            workers,
        })
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Process one capture file, resuming from the recorded position.
    pub fn handle_pcap_uri(&mut self, fname: &str) {
        let file = match File::open(fname) {
            Ok(f) => f,
            Err(e) => {
                error!("failed to open capture file {fname}: {e}");
                return;
            }
        };

        let reader = match CaptureReader::new(BufReader::new(file)) {
            Ok(r) => r,
            Err(e) => {
                error!("failed to read capture header of {fname}: {e}");
                self.mark_finished(fname);
                return;
            }
        };

        let link = match reader.link_layer() {
            Ok(l) => l,
            Err(e) => {
                warn!("skipping capture {fname}: {e}");
                self.mark_finished(fname);
                return;
            }
        };

        self.process_capture(reader, link, fname);
    }

    fn process_capture(
        &mut self,
        mut reader: CaptureReader<BufReader<File>>,
        link: LinkLayer,
        fname: &str,
    ) {
        let processed = match self.store.get_pcap(fname) {
            Ok(Some(rec)) if rec.finished => {
                info!("capture file already processed: {fname}");
                return;
            }
            Ok(Some(rec)) => {
                info!("skipping {} already processed packets of {fname}", rec.position);
                rec.position
            }
            Ok(None) => 0,
            Err(e) => {
                warn!("progress lookup failed for {fname}: {e:#}");
                0
            }
        };

        self.flush_connections();

        let start = Instant::now();
        let mut last_flush = Instant::now();
        let mut count: u64 = 0;
        let mut bytes: u64 = 0;
        let mut finished = true;

        while let Some(res) = reader.next_packet() {
            if self.shutdown_requested() {
                warn!("shutdown requested, stopping packet processing of {fname}");
                finished = false;
                break;
            }

            let pkt = match res {
                Ok(p) => p,
                Err(e) => {
                    warn!("capture read error in {fname}: {e}");
                    break;
                }
            };

            count += 1;
            if count <= processed {
                continue;
            }
            bytes += pkt.data.len() as u64;

            self.process_packet(&pkt, link, fname);

            if self.flush_interval_secs != 0
                && last_flush.elapsed().as_secs() >= self.flush_interval_secs
            {
                self.flush_connections();
                last_flush = Instant::now();
            }
        }

        let elapsed = start.elapsed().as_secs_f64().max(1e-9);
        info!(
            "processed {} packets from {fname} ({:.0} pkt/s, {:.2} MB/s, finished={finished})",
            count.saturating_sub(processed),
            (count.saturating_sub(processed)) as f64 / elapsed,
            bytes as f64 / elapsed / 1e6,
        );

        if let Err(e) = self.store.insert_pcap(&PcapFile {
            file_name: fname.to_string(),
            position: count,
            finished,
        }) {
            error!("failed to checkpoint progress for {fname}: {e:#}");
        }
    }

    fn process_packet(&mut self, pkt: &CapturedPacket, link: LinkLayer, fname: &str) {
        let decoded = match decode_packet(&pkt.data, link) {
            Ok(Some(d)) => d,
            Ok(None) => return,
            Err(e) => {
                debug!("undecodable packet in {fname}: {e}");
                return;
            }
        };

        let transport = if let Some(frag) = decoded.fragment {
            let key = FragmentKey {
                src: decoded.src_ip,
                dst: decoded.dst_ip,
                id: frag.id,
                protocol: decoded.protocol,
            };
            match self.defrag.process(key, frag, &decoded.ip_payload, pkt.ts_ms()) {
                // Fragment; the whole packet is not here yet.
                None => return,
                Some(payload) => match decode_transport(decoded.protocol, &payload) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!("failed to decode defragmented packet: {e}");
                        return;
                    }
                },
            }
        } else {
            match decoded.transport {
                Some(t) => t,
                None => return,
            }
        };

        match transport {
            Transport::Tcp(seg) => {
                if let Some(entry) =
                    self.tcp
                        .feed(decoded.src_ip, decoded.dst_ip, &seg, pkt.ts_ms(), fname)
                {
                    self.complete(entry);
                }
            }
            Transport::Udp(dgram) => {
                self.udp
                    .feed(decoded.src_ip, decoded.dst_ip, &dgram, pkt.ts_ms(), fname);
            }
            Transport::Other(proto) => {
                warn!("unsupported transport layer {proto} in {fname}");
            }
        }
    }

    /// Close and save connections older than the configured timeouts.
    pub fn flush_connections(&mut self) {
        let now_ms = Utc::now().timestamp_millis();

        if self.tcp_timeout_ms != 0 {
            let threshold = now_ms - self.tcp_timeout_ms;
            let flushed = self.tcp.flush_older_than(threshold);
            let closed = self.tcp.discard_older_than(threshold);
            let discarded = self.defrag.discard_older_than(threshold);

            if !flushed.is_empty() || closed != 0 || discarded != 0 {
                info!(
                    "flushed connections (flushed={}, closed={closed}, discarded={discarded})",
                    flushed.len()
                );
            }
            for entry in flushed {
                self.complete(entry);
            }
        }

        if self.udp_timeout_ms != 0 {
            let threshold = now_ms - self.udp_timeout_ms;
            let flows = self.udp.complete_older_than(threshold);
            if !flows.is_empty() {
                info!("assembled {} UDP flows", flows.len());
            }
            for entry in flows {
                self.complete(entry);
            }
        }
    }

    /// Enrich a completed flow and hand it to the insert pool. Blocks while
    /// all workers are busy.
    fn complete(&self, mut entry: FlowEntry) {
        enrich::process(&mut entry, self.flag_regex.as_ref(), self.experimental);

        if let Some(tx) = &self.flow_tx {
            if tx.send(entry).is_err() {
                error!("flow channel closed, dropping flow");
            }
        }
    }

    /// Drop the flow channel and wait for the insert workers to drain.
    pub fn close(mut self) {
        self.flow_tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("insert worker panicked");
            }
        }
    }

    fn mark_finished(&self, fname: &str) {
        if let Err(e) = self.store.insert_pcap(&PcapFile {
            file_name: fname.to_string(),
            position: 0,
            finished: true,
        }) {
            error!("failed to record unreadable capture {fname}: {e:#}");
        }
    }
}

/// Watch a directory and feed every new capture file through the service.
/// Combines change notifications with a periodic rescan.
pub fn watch_directory(service: &mut AssemblerService, dir: &Path) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;

    info!("watching directory for new capture files: {}", dir.display());

    let mut seen: HashSet<String> = HashSet::new();
    while !service.shutdown_requested() {
        scan_directory(service, dir, &mut seen);

        match rx.recv_timeout(Duration::from_secs(2)) {
            Ok(Ok(_event)) => {}
            Ok(Err(e)) => error!("directory watch error: {e}"),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(())
}

fn scan_directory(service: &mut AssemblerService, dir: &Path, seen: &mut HashSet<String>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("failed to read watch directory {}: {e}", dir.display());
            return;
        }
    };

    let mut files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().map(|e| e == "pcap").unwrap_or(false))
        .collect();
    files.sort();

    for path in files {
        if service.shutdown_requested() {
            break;
        }
        let fname = path.to_string_lossy().into_owned();
        if !seen.insert(fname.clone()) {
            continue;
        }
        info!("ingesting new capture file: {fname}");
        service.handle_pcap_uri(&fname);
    }
}
