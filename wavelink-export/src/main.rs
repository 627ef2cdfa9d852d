//! wavelink export daemon.
//!
//! Follows a disk ring file of waveform records and forwards each record to
//! every configured destination over framed TCP, resuming after restarts and
//! link drops without duplicates or time reversals.
//!
//! Usage:
//!   wavelink-export --ring /data/ring.dat --config /etc/wavelink/export.conf
//!
//! ```text
//!   ring file ──► RingFeeder ──► ExportServer ──► Session (per destination)
//!                                                   ├─ DeliveryQueue
//!                                                   ├─ OutputWriter ──► TCP
//!                                                   └─ catch-up reader
//! ```

use std::fs;
use std::sync::Arc;

// ---

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// ---

use wavelink_domain::{ChannelDirectory, RestrictedSet, RingReader};

// ---

mod catchup;
mod channel_list;
mod config;
mod context;
mod destination;
mod export_server;
mod housekeeping;
mod ring_feeder;
mod session;
mod state_file;
mod stats;
mod throttle;
mod writer;

#[cfg(test)]
mod test_support;

// ---

use config::Config;
use housekeeping::{load_destinations, Housekeeping};

// Gateway re-exports; siblings import via super::Symbol
pub use channel_list::{load_restricted, ChannelFilter};
pub use context::ExportContext;
pub use destination::{parse_list, Destination, Role};
pub use export_server::ExportServer;
pub use ring_feeder::RingFeeder;
pub use session::{Session, SessionPhase};
pub use stats::{Counters, MonitorSnapshot, SessionStats, StatsSnapshot};
pub use throttle::Throttle;

pub(crate) use writer::OutputWriter;

// ---------------------------------------------------------------------------
// main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    let cfg = Config::parse();

    let no_color = std::env::var("EMACS").is_ok()
        || std::env::var("NO_COLOR").is_ok()
        || !std::io::IsTerminal::is_terminal(&std::io::stdout());

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_ansi(!no_color)
        .init();

    let incarnation = Uuid::new_v4();
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %incarnation,
        "wavelink-export starting",
    );

    let ring = RingReader::open(&cfg.ring)
        .with_context(|| format!("opening ring file {}", cfg.ring.display()))?;
    let header = ring.header();
    info!(
        ring = %cfg.ring.display(),
        capacity = header.capacity,
        record_len = header.record_len,
        next_seq = header.next_seq,
        "ring file open",
    );

    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("creating state directory {}", cfg.state_dir.display()))?;

    let directory: Arc<dyn ChannelDirectory> = match &cfg.restricted {
        Some(path) => {
            let set = load_restricted(path)?;
            info!(path = %path.display(), channels = set.len(), "restricted channel list loaded");
            Arc::new(set)
        }
        None => Arc::new(RestrictedSet::default()),
    };

    let ctx = Arc::new(ExportContext {
        ring_path: cfg.ring.clone(),
        ring_capacity: header.capacity,
        decoder: cfg.decoder.build(),
        directory,
        state_dir: cfg.state_dir.clone(),
        chan_dir: cfg.chan_dir.clone(),
        listen_addr: cfg.listen_addr,
        future_tolerance: std::time::Duration::from_secs(cfg.future_tolerance_secs),
        drain_timeout: std::time::Duration::from_secs(cfg.drain_secs),
        runtime: tokio::runtime::Handle::current(),
        incarnation,
    });

    let server = ExportServer::new(Arc::clone(&ctx));
    server.reconcile(load_destinations(&cfg.config)?).await;
    if server.is_empty() {
        warn!(config = %cfg.config.display(), "no usable destinations yet");
    }

    let feeder = RingFeeder::spawn(ring, Arc::clone(&server), cfg.poll_every())
        .context("starting ring feed thread")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let housekeeping = tokio::spawn(Housekeeping::new(Arc::clone(&server), &cfg).run(stop_rx));

    shutdown_signal().await?;
    info!("shutting down");

    stop_tx.send_replace(true);
    tokio::task::spawn_blocking(move || feeder.stop()).await?;
    if let Err(e) = housekeeping.await {
        error!("housekeeping task failed: {e}");
    }
    server.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

// ---

/// Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() -> anyhow::Result<()> {
    // ---
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = term.recv() => {}
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}
