//! Capture intake service
//!
//! Accepts PCAP-over-IP connections from sensors and hands each one to a
//! rotating writer. One blocking task per connection; connections share no
//! mutable state.

pub mod rotating;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::IngestConfig;

use rotating::RotatingPcapWriter;

pub struct Ingestor {
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(config: IngestConfig) -> Self {
        Self { config }
    }

    /// Accept connections until shutdown. Returns only on a fatal bind
    /// error; per-connection failures are logged and the loop continues.
    pub async fn serve(&self, shutdown: Arc<AtomicBool>) -> Result<()> {
        std::fs::create_dir_all(&self.config.tmp_dir)
            .with_context(|| format!("failed to create tmp dir {}", self.config.tmp_dir))?;
        std::fs::create_dir_all(&self.config.dest_dir)
            .with_context(|| format!("failed to create dest dir {}", self.config.dest_dir))?;

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen_addr))?;

        info!(
            "listening for incoming capture connections on {}",
            self.config.listen_addr
        );

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("shutdown requested, stopping accept loop");
                return Ok(());
            }

            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((socket, peer)) => {
                            info!("accepted capture connection from {peer}");
                            self.spawn_connection(socket, peer.to_string(), Arc::clone(&shutdown));
                        }
                        Err(e) => {
                            error!("failed to accept connection: {e}");
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    fn spawn_connection(
        &self,
        socket: tokio::net::TcpStream,
        peer: String,
        shutdown: Arc<AtomicBool>,
    ) {
        let writer = RotatingPcapWriter::new(
            self.config.tmp_dir.clone(),
            self.config.dest_dir.clone(),
            sanitize_filename(&peer),
            Duration::from_secs(self.config.rotate_interval_secs),
        );

        tokio::task::spawn_blocking(move || {
            let stream = match socket.into_std().and_then(|s| {
                s.set_nonblocking(false)?;
                Ok(s)
            }) {
                Ok(s) => s,
                Err(e) => {
                    error!("failed to adopt connection from {peer}: {e}");
                    return;
                }
            };

            match writer.run(stream, shutdown) {
                Ok(()) => info!("finished ingesting capture connection from {peer}"),
                Err(e) => error!("capture connection from {peer} failed: {e:#}"),
            }
        });
    }
}

/// Replace characters that are unsafe in file names with underscores.
pub fn sanitize_filename(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        let cases = [
            ("valid_filename", "valid_filename"),
            ("invalid:filename", "invalid_filename"),
            ("another/invalid\\filename", "another_invalid_filename"),
            ("", ""),
            ("no_special_chars", "no_special_chars"),
            ("123:456/789\\0", "123_456_789_0"),
            ("[::1]:9999", "[__1]_9999"),
        ];

        for (input, expected) in cases {
            assert_eq!(sanitize_filename(input), expected, "input {input:?}");
        }
    }
}
