//! Rotating capture writer
//!
//! Reads a continuous capture stream from one sensor connection and cuts it
//! into classic PCAP files: packets are written into `tmp_dir`, and every
//! rotation interval the current file is closed and moved into `dest_dir`
//! where the assembler picks it up atomically. Each file carries the
//! snaplen and link type learned from the stream header.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use crossbeam_channel::{bounded, select, tick};
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use tracing::{error, info, warn};

use crate::capture::{CaptureReader, CapturedPacket};

pub struct RotatingPcapWriter {
    tmp_dir: PathBuf,
    dest_dir: PathBuf,
    client_id: String,
    interval: Duration,
}

impl RotatingPcapWriter {
    pub fn new(
        tmp_dir: impl Into<PathBuf>,
        dest_dir: impl Into<PathBuf>,
        client_id: String,
        interval: Duration,
    ) -> Self {
        Self {
            tmp_dir: tmp_dir.into(),
            dest_dir: dest_dir.into(),
            client_id,
            interval,
        }
    }

    /// Ingest the stream until EOF, read error, or shutdown. A malformed
    /// stream header fails before any file is created; a packet write error
    /// is fatal to the connection but already-rotated files survive.
    pub fn run<R: Read + Send + 'static>(
        &self,
        stream: R,
        shutdown: Arc<AtomicBool>,
    ) -> Result<()> {
        let capture =
            CaptureReader::new(stream).context("failed to read capture stream header")?;
        let snaplen = capture.snaplen();
        let datalink = capture.datalink();

        // Reader thread feeds the rotation loop; channel close marks EOF.
        let (pkt_tx, pkt_rx) = bounded::<CapturedPacket>(64);
        let client = self.client_id.clone();
        let reader_handle = thread::Builder::new()
            .name(format!("pcap-read-{client}"))
            .spawn(move || {
                let mut capture = capture;
                while let Some(res) = capture.next_packet() {
                    match res {
                        Ok(pkt) => {
                            if pkt_tx.send(pkt).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("capture stream from {client} ended: {e}");
                            break;
                        }
                    }
                }
            })
            .context("failed to spawn capture reader thread")?;

        let ticker = tick(self.interval);
        let mut done = false;

        while !done {
            let fname = format!(
                "pcap_{}_{}.pcap",
                self.client_id,
                Local::now().format("%Y-%m-%dT%H-%M-%S")
            );
            let tmp_path = self.tmp_dir.join(&fname);

            let file = File::create(&tmp_path)
                .with_context(|| format!("failed to create capture file {}", tmp_path.display()))?;
            let header = PcapHeader {
                snaplen,
                datalink,
                ..Default::default()
            };
            let mut writer = PcapWriter::with_header(BufWriter::new(file), header)
                .context("failed to write capture file header")?;

            let mut rotate = false;
            while !rotate && !done {
                select! {
                    recv(pkt_rx) -> msg => match msg {
                        Ok(pkt) => {
                            let packet = PcapPacket::new(pkt.ts, pkt.orig_len, &pkt.data);
                            writer
                                .write_packet(&packet)
                                .context("failed to write packet")?;
                        }
                        Err(_) => done = true,
                    },
                    recv(ticker) -> _ => rotate = true,
                    default(Duration::from_millis(200)) => {
                        if shutdown.load(Ordering::Relaxed) {
                            done = true;
                        }
                    }
                }
            }

            writer
                .into_writer()
                .flush()
                .context("failed to flush capture file")?;
            self.move_to_dest(&tmp_path);
        }

        let _ = reader_handle.join();
        info!("finished writing capture files for {}", self.client_id);
        Ok(())
    }

    /// Prefer an atomic rename; fall back to copy-then-unlink across
    /// filesystems.
    fn move_to_dest(&self, src_path: &Path) {
        let base = match src_path.file_name() {
            Some(name) => name,
            None => return,
        };
        let dest_path = self.dest_dir.join(base);

        if std::fs::rename(src_path, &dest_path).is_err() {
            if let Err(e) = std::fs::copy(src_path, &dest_path).and_then(|_| {
                std::fs::remove_file(src_path)
            }) {
                error!(
                    "failed to move capture file {} to {}: {e}",
                    src_path.display(),
                    dest_path.display()
                );
                return;
            }
        }

        info!("rotated capture file {} to {}", base.to_string_lossy(), dest_path.display());
    }
}
