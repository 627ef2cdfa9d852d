//! Periodic chores: destination and channel list reloads, state persistence,
//! status lines and the monitor file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// ---

use anyhow::Context;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

// ---

use wavelink_domain::now_ms;

// ---

use super::config::Config;
use super::{parse_list, Destination, ExportServer, MonitorSnapshot, StatsSnapshot};

/// Future-dated units per status interval that escalate to an alert.
const FUTURE_ALERT_THRESHOLD: u64 = 10;

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

pub struct Housekeeping {
    // ---
    server: Arc<ExportServer>,
    dest_list: PathBuf,
    monitor_file: Option<PathBuf>,
    reload_every: Duration,
    persist_every: Duration,
    status_every: Duration,

    /// `future` counter per session at the previous report.
    future_seen: HashMap<String, u64>,
}

// ---

impl Housekeeping {
    // ---
    pub fn new(server: Arc<ExportServer>, cfg: &Config) -> Self {
        Self {
            server,
            dest_list: cfg.config.clone(),
            monitor_file: cfg.monitor_file.clone(),
            reload_every: cfg.reload_every(),
            persist_every: cfg.persist_every(),
            status_every: cfg.status_every(),
            future_seen: HashMap::new(),
        }
    }

    // ---

    /// Run until `shutdown` turns true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // ---
        let mut reload = tokio::time::interval(self.reload_every);
        let mut persist = tokio::time::interval(self.persist_every);
        let mut status = tokio::time::interval(self.status_every);
        for ticker in [&mut reload, &mut persist, &mut status] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick is immediate; startup already did this work.
            ticker.tick().await;
        }

        loop {
            tokio::select! {
                _ = reload.tick() => self.reload().await,
                _ = persist.tick() => self.persist().await,
                _ = status.tick() => self.report(),
                _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            }
        }
        info!("housekeeping stopped");
    }

    // ---

    /// Re-read the destination list, reconcile, then re-read channel lists.
    pub async fn reload(&self) {
        // ---
        match load_destinations(&self.dest_list) {
            Ok(dests) => self.server.reconcile(dests).await,
            Err(e) => warn!("keeping current destinations: {e:#}"),
        }
        self.server.reload_channels();
    }

    async fn persist(&self) {
        // ---
        let server = Arc::clone(&self.server);
        if let Err(e) = tokio::task::spawn_blocking(move || server.persist_all()).await {
            error!("state persist task failed: {e}");
        }
    }

    /// Log one status line per session, raise an alert on repeated
    /// future-dated units and rewrite the monitor file.
    pub fn report(&mut self) {
        // ---
        let sessions = self.server.snapshots();
        let unmatched_inbound = self.server.unmatched_inbound();
        info!(sessions = sessions.len(), unmatched_inbound, "export status");
        for snap in &sessions {
            info!("{}", snap.status_line());
        }

        for (tag, recent) in self.future_alerts(&sessions) {
            error!(
                tag = %tag,
                recent,
                "repeated future-dated units; check the source clock and decoder",
            );
        }

        if let Some(path) = &self.monitor_file {
            let snapshot = MonitorSnapshot {
                incarnation: self.server.ctx().incarnation,
                generated_at_ms: now_ms(),
                unmatched_inbound,
                sessions,
            };
            if let Err(e) = snapshot.write_to(path) {
                warn!(path = %path.display(), "cannot write monitor file: {e:#}");
            }
        }
    }

    /// Sessions whose `future` counter grew by at least
    /// [`FUTURE_ALERT_THRESHOLD`] since the previous call, with the growth.
    fn future_alerts(&mut self, sessions: &[StatsSnapshot]) -> Vec<(String, u64)> {
        // ---
        let mut alerts = Vec::new();
        let mut seen = HashMap::with_capacity(sessions.len());
        for snap in sessions {
            let total = snap.counters.future;
            let before = self.future_seen.get(&snap.tag).copied().unwrap_or(0);
            let recent = total.saturating_sub(before);
            if recent >= FUTURE_ALERT_THRESHOLD {
                alerts.push((snap.tag.clone(), recent));
            }
            seen.insert(snap.tag.clone(), total);
        }
        self.future_seen = seen;
        alerts
    }
}

// ---

/// Read and parse the destination list.  Bad lines are logged and skipped;
/// only an unreadable file is an error.
pub fn load_destinations(path: &Path) -> anyhow::Result<Vec<Destination>> {
    // ---
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading destination list {}", path.display()))?;
    Ok(parse_list(&text))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
