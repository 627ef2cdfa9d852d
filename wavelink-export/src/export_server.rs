//! [`ExportServer`] owns every destination session and the passive
//! listeners.
//!
//! ```text
//!   destination list ──reconcile──► sessions (by tag)
//!                                     ▲        ▲
//!   ring feeder ──route(record, seq)──┘        │ hand_over(stream)
//!                                              │
//!   listener per passive port ──accept──► match peer host + port
//! ```
//!
//! Reconciling keeps a session whose configuration line is unchanged and
//! rebuilds one whose line changed.  A removed or rebuilt session is
//! terminated (drained and persisted) before its replacement starts, so the
//! replacement resumes from the saved state.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

// ---

use tokio::net::TcpListener;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

// ---

use wavelink_domain::DecodedRecord;

// ---

use super::session::lock;
use super::{Destination, ExportContext, Role, Session, StatsSnapshot};

// ---------------------------------------------------------------------------
// ExportServer
// ---------------------------------------------------------------------------

pub struct ExportServer {
    // ---
    ctx: Arc<ExportContext>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,

    /// Accept loop per passive port.
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,

    /// Inbound connections no passive destination claimed.
    unmatched: AtomicU64,

    weak: Weak<ExportServer>,
}

// ---

impl ExportServer {
    // ---
    pub fn new(ctx: Arc<ExportContext>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            ctx,
            sessions: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            unmatched: AtomicU64::new(0),
            weak: weak.clone(),
        })
    }

    pub fn ctx(&self) -> &Arc<ExportContext> {
        &self.ctx
    }

    // ---

    fn all(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn session(&self, tag: &str) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(tag)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn unmatched_inbound(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    // ---

    /// Bring the running sessions in line with `dests`.
    pub async fn reconcile(&self, dests: Vec<Destination>) {
        // ---
        let wanted: HashMap<&str, &Destination> =
            dests.iter().map(|d| (d.tag.as_str(), d)).collect();

        let retired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let stale: Vec<String> = sessions
                .iter()
                .filter(|(tag, s)| wanted.get(tag.as_str()).map_or(true, |d| d.line != s.dest().line))
                .map(|(tag, _)| tag.clone())
                .collect();
            stale.iter().filter_map(|tag| sessions.remove(tag)).collect()
        };

        for session in &retired {
            info!(tag = session.tag(), "destination removed or changed, stopping session");
        }
        terminate_all(retired).await;

        for dest in dests {
            if self.session(&dest.tag).is_some() {
                continue;
            }
            let session = Session::start(dest, Arc::clone(&self.ctx));
            self.sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(session.tag().to_string(), session);
        }

        self.sync_listeners().await;
        debug!(sessions = self.len(), "destinations reconciled");
    }

    // ---

    /// One listener per port any passive session uses; others are closed.
    async fn sync_listeners(&self) {
        // ---
        let ports: HashSet<u16> = self
            .all()
            .iter()
            .filter(|s| s.dest().role == Role::Passive)
            .map(|s| s.dest().port)
            .collect();

        lock(&self.listeners).retain(|port, task| {
            let keep = ports.contains(port) && !task.is_finished();
            if !keep {
                task.abort();
                info!(port, "passive listener closed");
            }
            keep
        });

        for port in ports {
            if lock(&self.listeners).contains_key(&port) {
                continue;
            }
            let addr = SocketAddr::new(self.ctx.listen_addr, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "passive listener up");
                    let task = self.ctx.runtime.spawn(accept_loop(listener, self.weak.clone()));
                    lock(&self.listeners).insert(port, task);
                }
                // Retried on the next reconcile.
                Err(e) => error!(%addr, "cannot listen for passive destinations: {e}"),
            }
        }
    }

    /// Passive session expecting a connection from `ip` on local `port`.
    pub async fn match_passive(&self, ip: IpAddr, port: u16) -> Option<Arc<Session>> {
        // ---
        let ip = canonical(ip);
        let candidates: Vec<Arc<Session>> = self
            .all()
            .into_iter()
            .filter(|s| s.dest().role == Role::Passive && s.dest().port == port)
            .collect();

        for session in candidates {
            let host = session.dest().host.as_str();
            let matched = match host.parse::<IpAddr>() {
                Ok(addr) => canonical(addr) == ip,
                Err(_) => match tokio::net::lookup_host((host, port)).await {
                    Ok(mut addrs) => addrs.any(|a| canonical(a.ip()) == ip),
                    Err(e) => {
                        warn!(tag = session.tag(), host, "cannot resolve peer host: {e}");
                        false
                    }
                },
            };
            if matched {
                return Some(session);
            }
        }
        None
    }

    // ---

    /// Offer a live record to every session.
    pub fn route(&self, record: &DecodedRecord, seq: u32) {
        // ---
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            session.offer(record, seq);
        }
    }

    /// Tell every session a live record could not be decoded.
    pub fn skip(&self, seq: u32) {
        // ---
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            session.skip(seq);
        }
    }

    pub fn persist_all(&self) {
        // ---
        for session in self.all() {
            if let Err(e) = session.persist() {
                error!(tag = session.tag(), "cannot persist state: {e}");
            }
        }
    }

    pub fn reload_channels(&self) {
        for session in self.all() {
            session.reload_channels();
        }
    }

    /// Per-session snapshots, ordered by tag.
    pub fn snapshots(&self) -> Vec<StatsSnapshot> {
        // ---
        let mut out: Vec<StatsSnapshot> = self.all().iter().map(|s| s.snapshot()).collect();
        out.sort_by(|a, b| a.tag.cmp(&b.tag));
        out
    }

    // ---

    /// Close the listeners and terminate every session.
    pub async fn shutdown(&self) {
        // ---
        for (_, task) in lock(&self.listeners).drain() {
            task.abort();
        }
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();
        info!(sessions = sessions.len(), "stopping all sessions");
        terminate_all(sessions).await;
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Terminate sessions concurrently and wait for all of them.
async fn terminate_all(sessions: Vec<Arc<Session>>) {
    // ---
    let mut set = JoinSet::new();
    for session in sessions {
        set.spawn(async move { session.terminate().await });
    }
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            error!("session termination failed: {e}");
        }
    }
}

/// IPv4-mapped IPv6 addresses compare as IPv4.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

async fn accept_loop(listener: TcpListener, server: Weak<ExportServer>) {
    // ---
    let port = listener.local_addr().map(|a| a.port()).unwrap_or_default();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(port, "accept failed: {e}");
                continue;
            }
        };
        let Some(server) = server.upgrade() else {
            return;
        };
        match server.match_passive(peer.ip(), port).await {
            Some(session) => {
                info!(tag = session.tag(), %peer, "inbound connection accepted");
                session.hand_over(stream);
            }
            None => {
                let refused = server.unmatched.fetch_add(1, Ordering::Relaxed) + 1;
                error!(%peer, port, refused, "connection from unconfigured peer refused");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
