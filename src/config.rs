use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub assembler: AssemblerConfig,

    #[serde(default)]
    pub enrich: EnrichConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            store: StoreConfig::default(),
            ingest: IngestConfig::default(),
            assembler: AssemblerConfig::default(),
            enrich: EnrichConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/calyx/config.toml"),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        PathBuf::from(&self.store.db_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite flow store
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// TCP address to listen on for incoming capture streams
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Directory where in-progress capture files are written
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,

    /// Directory rotated capture files are moved to
    #[serde(default = "default_dest_dir")]
    pub dest_dir: String,

    /// Seconds between file rotations
    #[serde(default = "default_rotate_interval")]
    pub rotate_interval_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            tmp_dir: default_tmp_dir(),
            dest_dir: default_dest_dir(),
            rotate_interval_secs: default_rotate_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblerConfig {
    /// Directory watched for finished capture files
    #[serde(default = "default_watch_dir")]
    pub watch_dir: String,

    /// Seconds between connection flushes (0 = never)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Idle seconds before a TCP connection is force-closed (0 = never)
    #[serde(default = "default_connection_timeout")]
    pub connection_tcp_timeout_secs: u64,

    /// Idle seconds before a UDP stream is completed (0 = never)
    #[serde(default = "default_connection_timeout")]
    pub connection_udp_timeout_secs: u64,

    /// Regex applied to flow payloads for flag in/out tagging
    #[serde(default)]
    pub flag_regex: Option<String>,

    /// Accept TCP streams with no observed handshake
    #[serde(default)]
    pub nonstrict: bool,

    /// Enable cookie fingerprint extraction
    #[serde(default)]
    pub experimental: bool,

    /// Number of store insert workers
    #[serde(default = "default_insert_workers")]
    pub insert_workers: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            watch_dir: default_watch_dir(),
            flush_interval_secs: default_flush_interval(),
            connection_tcp_timeout_secs: default_connection_timeout(),
            connection_udp_timeout_secs: default_connection_timeout(),
            flag_regex: None,
            nonstrict: false,
            experimental: false,
            insert_workers: default_insert_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    /// Redis connection URL for the alert queue
    #[serde(default)]
    pub queue_url: Option<String>,

    /// Queue (list) name alerts are popped from
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Maximum records popped per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Tag flows with their flowbits
    #[serde(default = "default_true")]
    pub tag_flowbits: bool,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            queue_url: None,
            queue_name: default_queue_name(),
            batch_size: default_batch_size(),
            tag_flowbits: true,
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_db_path() -> String {
    "/var/lib/calyx/calyx.db".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_tmp_dir() -> String {
    "/tmp/ingestor_tmp".to_string()
}

fn default_dest_dir() -> String {
    "/tmp/ingestor_ready".to_string()
}

fn default_rotate_interval() -> u64 {
    60
}

fn default_watch_dir() -> String {
    "/tmp/ingestor_ready".to_string()
}

fn default_flush_interval() -> u64 {
    15
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_insert_workers() -> usize {
    100
}

fn default_queue_name() -> String {
    "suricata".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_true() -> bool {
    true
}
