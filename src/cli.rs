use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use calyx::assembler::{watch_directory, AssemblerService};
use calyx::config::Config;
use calyx::correlator::{Correlator, RedisQueue};
use calyx::ingest::Ingestor;
use calyx::storage::{SqliteStore, Store};

#[derive(Parser)]
#[command(name = "calyx")]
#[command(author, version, about = "Capture-traffic analysis pipeline for attack/defense CTFs")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Receive capture streams from sensors and rotate them into files
    Ingest {
        /// TCP address to listen on for incoming capture streams
        #[arg(long)]
        listen: Option<String>,

        /// Directory to stage in-progress capture files
        #[arg(long)]
        tmp_dir: Option<String>,

        /// Directory rotated capture files are moved to
        #[arg(long)]
        dest_dir: Option<String>,

        /// Seconds between file rotations
        #[arg(long)]
        rotate_interval: Option<u64>,
    },

    /// Reassemble capture files into stored flows
    Assemble {
        /// Directory to watch for finished capture files
        #[arg(long)]
        watch_dir: Option<String>,

        /// Flag regex, used for flag in/out tagging
        #[arg(long)]
        flag: Option<String>,

        /// Seconds between connection flushes
        #[arg(long)]
        flush_interval: Option<u64>,

        /// Idle seconds before TCP and UDP connections are flushed
        #[arg(long)]
        connection_timeout: Option<u64>,

        /// Accept TCP streams with no observed handshake
        #[arg(long)]
        nonstrict: bool,

        /// Enable experimental features (cookie fingerprints)
        #[arg(long)]
        experimental: bool,

        /// Path to the flow store
        #[arg(long)]
        db: Option<String>,
    },

    /// Annotate stored flows with IDS alerts from the queue
    Enrich {
        /// Redis connection URL of the alert queue
        #[arg(long)]
        queue_url: Option<String>,

        /// Queue name alerts are popped from
        #[arg(long)]
        queue: Option<String>,

        /// Tag flows with their flowbits
        #[arg(long)]
        flowbits: Option<bool>,

        /// Path to the flow store
        #[arg(long)]
        db: Option<String>,
    },
}

pub async fn run_command(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, shutting down");
                shutdown.store(true, Ordering::Relaxed);
            }
        });
    }

    match cli.command {
        Commands::Ingest {
            listen,
            tmp_dir,
            dest_dir,
            rotate_interval,
        } => {
            if let Some(v) = listen {
                config.ingest.listen_addr = v;
            }
            if let Some(v) = tmp_dir {
                config.ingest.tmp_dir = v;
            }
            if let Some(v) = dest_dir {
                config.ingest.dest_dir = v;
            }
            if let Some(v) = rotate_interval {
                config.ingest.rotate_interval_secs = v;
            }

            Ingestor::new(config.ingest).serve(shutdown).await
        }

        Commands::Assemble {
            watch_dir,
            flag,
            flush_interval,
            connection_timeout,
            nonstrict,
            experimental,
            db,
        } => {
            if let Some(v) = watch_dir {
                config.assembler.watch_dir = v;
            }
            if let Some(v) = flag {
                config.assembler.flag_regex = Some(v);
            }
            if let Some(v) = flush_interval {
                config.assembler.flush_interval_secs = v;
            }
            if let Some(v) = connection_timeout {
                config.assembler.connection_tcp_timeout_secs = v;
                config.assembler.connection_udp_timeout_secs = v;
            }
            if nonstrict {
                config.assembler.nonstrict = true;
            }
            if experimental {
                config.assembler.experimental = true;
            }
            if let Some(v) = db {
                config.store.db_path = v;
            }

            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config.db_path())?);
            info!("configuring flow store at {}", config.store.db_path);
            store.configure()?;

            let assembler_config = config.assembler.clone();
            let watch_dir = PathBuf::from(&config.assembler.watch_dir);
            let shutdown = Arc::clone(&shutdown);

            tokio::task::spawn_blocking(move || -> Result<()> {
                let mut service = AssemblerService::new(&assembler_config, store, shutdown)?;
                watch_directory(&mut service, &watch_dir)?;
                service.close();
                Ok(())
            })
            .await
            .context("assembler task failed")??;

            Ok(())
        }

        Commands::Enrich {
            queue_url,
            queue,
            flowbits,
            db,
        } => {
            if let Some(v) = queue_url {
                config.enrich.queue_url = Some(v);
            }
            if let Some(v) = queue {
                config.enrich.queue_name = v;
            }
            if let Some(v) = flowbits {
                config.enrich.tag_flowbits = v;
            }
            if let Some(v) = db {
                config.store.db_path = v;
            }

            let url = config
                .enrich
                .queue_url
                .clone()
                .context("no alert queue url configured")?;

            let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config.db_path())?);

            info!("connecting to alert queue at {url}");
            let mut queue = RedisQueue::connect(&url, &config.enrich.queue_name).await?;
            info!("connected to alert queue");

            Correlator::new(store, config.enrich.tag_flowbits, config.enrich.batch_size)
                .run(&mut queue, shutdown)
                .await
        }
    }
}
