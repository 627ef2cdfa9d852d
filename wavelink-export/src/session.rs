//! [`Session`]: one destination's delivery pipeline.
//!
//! ```text
//!  ring feeder ──offer(record, seq)──►  Session
//!                                         │ RealTime: filter, split, order-check
//!                                         ▼
//!                                   DeliveryQueue ──► OutputWriter ──► socket
//!                                         ▲
//!  ring file ──► CatchupReader ───────────┘  (only while behind)
//! ```
//!
//! # Modes
//!
//! While `RealTime`, each offered record that directly follows the last
//! processed one goes straight into the queue.  Anything else (a gap, or a
//! full queue on the live path) switches the session to `Catchup`: `offer`
//! then only records the newest live sequence, and a catch-up reader replays
//! the backlog from the ring file until it reaches that sequence, then hands
//! back to the live path.  Only the path owning the current mode ever adds
//! to the queue, so the queue always has exactly one producer.
//!
//! A backlog wider than 90% of the ring (or a session that has never
//! processed anything) is not replayed: the session restarts at the live
//! position and logs the gap.
//!
//! # Phases (reported)
//!
//! `Disconnected → Connecting → RealTime ⇄ Catchup → Disconnected`, and
//! `Draining → Terminated` once [`Session::terminate`] runs.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

// ---

use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

// ---

use wavelink_domain::{
    // ---
    now_ms,
    seq_gap,
    DecodedRecord,
    DeliveryQueue,
    OrderGuard,
    OutputUnit,
    Result,
    Verdict,
};

// ---

use super::state_file::{self, SessionState};
use super::{catchup, ChannelFilter, Destination, ExportContext, OutputWriter, SessionStats, StatsSnapshot};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Live-overflow drops between queue growth steps.
const GROW_EVERY_DROPS: u64 = 100;

/// Queue growth limit, as a multiple of the configured size.
const MAX_GROWTH: usize = 8;

/// Pending inbound connections a passive session will hold.
const CONN_BACKLOG: usize = 4;

// ---------------------------------------------------------------------------
// Lock helper
// ---------------------------------------------------------------------------

/// Lock a std mutex, carrying on with the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// SessionPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    // ---
    Disconnected,
    Connecting,
    RealTime,
    Catchup,
    Draining,
    Terminated,
}

// ---

/// Connection state, maintained by the writer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Link {
    // ---
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    RealTime,
    Catchup,
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Progress {
    // ---
    /// Last ring sequence fully handled (queued, filtered out or skipped).
    processed: Option<u32>,

    /// Newest sequence offered by the live feed.
    known: Option<u32>,

    mode: Mode,

    /// Current catch-up reader, if one was started.
    catchup: Option<JoinHandle<()>>,

    live_drops: u64,

    /// Cleared by `terminate`; later offers are ignored.
    accepting: bool,
}

// ---------------------------------------------------------------------------
// SessionCore
// ---------------------------------------------------------------------------

/// State shared by the session handle, its writer task and its catch-up
/// reader.
pub(crate) struct SessionCore {
    // ---
    pub dest: Destination,
    pub ctx: Arc<ExportContext>,
    pub queue: DeliveryQueue,

    /// Per-channel order tracking; one lock for the whole map.
    pub guard: Mutex<OrderGuard>,

    pub filter: RwLock<ChannelFilter>,
    pub stats: SessionStats,

    /// Signalled whenever units are added to the queue.
    pub queued: Notify,

    /// `true` while catch-up is replaying; suspends throttle averaging.
    pub replaying: AtomicBool,

    /// Set once by `terminate`.
    pub shutdown_tx: watch::Sender<bool>,

    link: AtomicU8,
    terminated: AtomicBool,
    progress: Mutex<Progress>,
}

// ---

impl SessionCore {
    // ---
    pub(crate) fn tag(&self) -> &str {
        &self.dest.tag
    }

    pub(crate) fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub(crate) fn set_link(&self, link: Link) {
        self.link.store(link as u8, Ordering::Relaxed);
    }

    fn link(&self) -> Link {
        // ---
        match self.link.load(Ordering::Relaxed) {
            2 => Link::Connected,
            1 => Link::Connecting,
            _ => Link::Disconnected,
        }
    }

    // ---

    /// Apply the destination's policies to `record` and cut it into units
    /// that are not already stale.  Empty when nothing should be sent.
    pub(crate) fn prepare(&self, record: &DecodedRecord, seq: u32) -> Vec<OutputUnit> {
        // ---
        let tag = self.tag();
        let channel = record.channel;

        let allowed = self
            .filter
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .allows(&channel);
        if !allowed {
            SessionStats::bump(&self.stats.filtered);
            trace!(tag, %channel, seq, "channel not on allow-list");
            return Vec::new();
        }

        if !self.dest.allow_restricted && self.ctx.directory.is_restricted(&channel) {
            SessionStats::bump(&self.stats.filtered);
            debug!(tag, %channel, seq, "restricted channel withheld");
            return Vec::new();
        }

        let now = now_ms();
        if let Some(max_age) = self.dest.max_age {
            if record.end_ms() < now.saturating_sub(max_age.as_millis() as i64) {
                SessionStats::bump(&self.stats.too_old);
                debug!(tag, %channel, seq, end_ms = record.end_ms(), "record older than max age");
                return Vec::new();
            }
        }

        let mut units = record.split(seq);
        let mut guard = lock(&self.guard);
        units.retain(|unit| match guard.check(unit, false, now) {
            Verdict::Stale => {
                SessionStats::bump(&self.stats.stale);
                debug!(tag, %channel, seq, start_ms = unit.start_ms, "stale unit discarded");
                false
            }
            _ => true,
        });
        units
    }

    // ---

    /// Live feed entry point.  `None` marks a record the feeder could not
    /// decode.  Never blocks on the queue.
    fn offer(self: &Arc<Self>, record: Option<&DecodedRecord>, seq: u32) {
        // ---
        let tag = self.tag();
        let mut p = lock(&self.progress);
        if !p.accepting {
            return;
        }
        p.known = Some(seq);
        if p.mode == Mode::Catchup {
            return;
        }

        let last = match p.processed {
            Some(last) => last,
            None => {
                info!(tag, seq, "no delivery history, starting at live position");
                seq.wrapping_sub(1)
            }
        };

        let behind = seq_gap(last, seq);
        if behind == 0 {
            trace!(tag, seq, "already processed");
            return;
        }

        let last = if behind > u32::MAX / 2 {
            // Saved position from before the ring was recreated.
            warn!(
                tag,
                saved = last,
                seq,
                "delivery position is ahead of the ring, resuming at live position",
            );
            SessionStats::bump(&self.stats.gaps);
            seq.wrapping_sub(1)
        } else if behind > self.ctx.replay_limit() {
            let skipped = behind - 1;
            warn!(
                tag,
                from = last.wrapping_add(1),
                to = seq.wrapping_sub(1),
                skipped,
                "backlog beyond the ring window, resuming at live position",
            );
            SessionStats::add(&self.stats.gaps, skipped as u64);
            seq.wrapping_sub(1)
        } else {
            last
        };
        p.processed = Some(last);

        if last.wrapping_add(1) == seq {
            let units = match record {
                Some(record) => self.prepare(record, seq),
                None => {
                    SessionStats::bump(&self.stats.decode_errors);
                    Vec::new()
                }
            };

            if self.queue.free() >= units.len() {
                for unit in &units {
                    self.queue.add(unit, seq);
                }
                if !units.is_empty() {
                    self.queued.notify_one();
                }
                p.processed = Some(seq);
                return;
            }
            self.live_overflow(&mut p, seq);
        }

        self.start_catchup(&mut p);
    }

    // ---

    fn live_overflow(&self, p: &mut Progress, seq: u32) {
        // ---
        let tag = self.tag();
        SessionStats::bump(&self.stats.dropped_live);
        p.live_drops += 1;
        warn!(
            tag,
            seq,
            queued = self.queue.used(),
            "queue full, live record dropped; catch-up will resend it",
        );

        if p.live_drops % GROW_EVERY_DROPS == 0 {
            let capacity = self.queue.capacity();
            let limit = self.dest.queue_slots * MAX_GROWTH;
            if capacity < limit && self.queue.resize((capacity * 2).min(limit)) {
                info!(tag, from = capacity, to = self.queue.capacity(), "delivery queue grown");
            }
        }
    }

    fn start_catchup(self: &Arc<Self>, p: &mut Progress) {
        // ---
        p.mode = Mode::Catchup;
        self.replaying.store(true, Ordering::Relaxed);
        info!(
            tag = self.tag(),
            from = ?p.processed.map(|s| s.wrapping_add(1)),
            to = ?p.known,
            "catch-up started",
        );

        // A reader only exits after switching the mode back under this
        // lock, so none is running here.
        let core = Arc::clone(self);
        p.catchup = Some(self.ctx.runtime.spawn_blocking(move || catchup::run(core)));
    }

    // ---

    /// Next backlog sequence to replay, or `None` once caught up, in which
    /// case the session is back in real-time mode.
    pub(crate) fn next_backlog(&self) -> Option<u32> {
        // ---
        let mut p = lock(&self.progress);
        let (Some(processed), Some(known)) = (p.processed, p.known) else {
            self.resume_live(&mut p);
            return None;
        };

        let behind = seq_gap(processed, known);
        if behind == 0 || behind > u32::MAX / 2 {
            self.resume_live(&mut p);
            return None;
        }

        let limit = self.ctx.replay_limit();
        if behind > limit {
            let resume = known.wrapping_sub(limit);
            let skipped = seq_gap(processed, resume);
            warn!(
                tag = self.tag(),
                skipped,
                "catch-up fell behind the ring window, skipping ahead",
            );
            SessionStats::add(&self.stats.gaps, skipped as u64);
            p.processed = Some(resume);
            return Some(resume.wrapping_add(1));
        }

        Some(processed.wrapping_add(1))
    }

    fn resume_live(&self, p: &mut Progress) {
        p.mode = Mode::RealTime;
        self.replaying.store(false, Ordering::Relaxed);
    }

    pub(crate) fn mark_processed(&self, seq: u32) {
        lock(&self.progress).processed = Some(seq);
    }

    /// Give up on the backlog and resume at the live position.
    pub(crate) fn abandon_backlog(&self) {
        // ---
        let mut p = lock(&self.progress);
        if let (Some(processed), Some(known)) = (p.processed, p.known) {
            SessionStats::add(&self.stats.gaps, seq_gap(processed, known) as u64);
        }
        p.processed = p.known;
        self.resume_live(&mut p);
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Handle owned by the export server.
pub struct Session {
    // ---
    core: Arc<SessionCore>,

    /// Inbound connections for a passive destination, consumed by the writer.
    conn_tx: mpsc::Sender<TcpStream>,

    writer: Mutex<Option<JoinHandle<()>>>,
}

// ---

impl Session {
    // ---
    /// Build the session, reload its resumption state and start its writer.
    pub fn start(dest: Destination, ctx: Arc<ExportContext>) -> Arc<Self> {
        // ---
        let tag = dest.tag.clone();
        let filter = load_filter(&dest, &ctx);

        let mut guard = OrderGuard::new(ctx.future_tolerance_ms());
        let path = state_file::state_path(&ctx.state_dir, &tag);
        let processed = match state_file::load(&path) {
            Ok(Some(state)) => {
                let total = state.tracks.len();
                for (channel, track) in state.tracks {
                    if filter.allows(&channel) {
                        guard.insert(channel, track);
                    }
                }
                info!(
                    tag = %tag,
                    seq = state.seq,
                    channels = guard.len(),
                    dropped = total - guard.len(),
                    "resuming from saved state",
                );
                Some(state.seq)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(tag = %tag, "ignoring saved state: {e}");
                None
            }
        };

        let (conn_tx, conn_rx) = mpsc::channel(CONN_BACKLOG);
        let (shutdown_tx, _) = watch::channel(false);

        let core = Arc::new(SessionCore {
            queue: DeliveryQueue::new(dest.queue_slots),
            guard: Mutex::new(guard),
            filter: RwLock::new(filter),
            stats: SessionStats::new(dest.throttle_bps),
            queued: Notify::new(),
            replaying: AtomicBool::new(false),
            shutdown_tx,
            link: AtomicU8::new(Link::Disconnected as u8),
            terminated: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                processed,
                known: None,
                mode: Mode::RealTime,
                catchup: None,
                live_drops: 0,
                accepting: true,
            }),
            dest,
            ctx,
        });

        let writer = OutputWriter::new(Arc::clone(&core), conn_rx);
        let handle = core.ctx.runtime.spawn(writer.run());

        info!(
            tag = %tag,
            role = ?core.dest.role,
            peer = %core.dest.peer_addr(),
            ack = core.dest.ack,
            "session started",
        );

        Arc::new(Self {
            core,
            conn_tx,
            writer: Mutex::new(Some(handle)),
        })
    }

    // ---

    pub fn tag(&self) -> &str {
        self.core.tag()
    }

    pub fn dest(&self) -> &Destination {
        &self.core.dest
    }

    #[cfg(test)]
    pub fn stats(&self) -> &SessionStats {
        &self.core.stats
    }

    // ---

    /// Offer the live record stored at ring sequence `seq`.
    pub fn offer(&self, record: &DecodedRecord, seq: u32) {
        self.core.offer(Some(record), seq);
    }

    /// Account for a live record that could not be decoded.
    pub fn skip(&self, seq: u32) {
        self.core.offer(None, seq);
    }

    /// Give an accepted inbound connection to a passive session.  A newer
    /// connection replaces the one in use.
    pub fn hand_over(&self, stream: TcpStream) {
        // ---
        if let Err(e) = self.conn_tx.try_send(stream) {
            warn!(tag = self.tag(), "dropping inbound connection: {e}");
        }
    }

    // ---

    /// Re-read the channel list.  Channels no longer listed lose their
    /// order history, so a later reappearance starts fresh.
    pub fn reload_channels(&self) {
        // ---
        let tag = self.tag();
        let path = self.core.dest.chan_path(&self.core.ctx.chan_dir);
        match ChannelFilter::load(&path) {
            Ok(filter) => {
                let dropped = lock(&self.core.guard).retain(|ch| filter.allows(ch));
                if dropped > 0 {
                    info!(tag, dropped, "channels left the allow-list");
                }
                *self
                    .core
                    .filter
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = filter;
            }
            Err(e) => warn!(tag, "keeping previous channel list: {e}"),
        }
    }

    /// Write the resumption state.
    ///
    /// The saved sequence is the delivered watermark: everything up to it
    /// has been written to the receiver.
    pub fn persist(&self) -> Result<()> {
        // ---
        let seq = {
            let p = lock(&self.core.progress);
            match self.core.queue.get_tail_seq() {
                Some(tail) => Some(tail.wrapping_sub(1)),
                None => p.processed,
            }
        };
        let Some(seq) = seq else {
            return Ok(());
        };

        let tracks = lock(&self.core.guard).entries();
        let path = state_file::state_path(&self.core.ctx.state_dir, self.tag());
        state_file::save(&path, &SessionState { seq, tracks })?;
        trace!(tag = self.tag(), seq, "state persisted");
        Ok(())
    }

    // ---

    pub fn phase(&self) -> SessionPhase {
        // ---
        if self.core.terminated.load(Ordering::Relaxed) {
            return SessionPhase::Terminated;
        }
        if self.core.is_stopping() {
            return SessionPhase::Draining;
        }
        match self.core.link() {
            Link::Disconnected => SessionPhase::Disconnected,
            Link::Connecting => SessionPhase::Connecting,
            Link::Connected => match lock(&self.core.progress).mode {
                Mode::RealTime => SessionPhase::RealTime,
                Mode::Catchup => SessionPhase::Catchup,
            },
        }
    }

    /// Last ring sequence the session has fully handled.
    pub fn processed(&self) -> Option<u32> {
        lock(&self.core.progress).processed
    }

    #[cfg(test)]
    pub fn is_replaying(&self) -> bool {
        self.core.replaying.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // ---
        let (processed_seq, known_seq) = {
            let p = lock(&self.core.progress);
            (p.processed, p.known)
        };
        let stats = &self.core.stats;
        let latency = stats.latency_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            tag: self.tag().to_string(),
            phase: self.phase(),
            queue_used: self.core.queue.used(),
            queue_capacity: self.core.queue.capacity(),
            processed_seq,
            known_seq,
            latency_ms: (latency >= 0).then_some(latency),
            effective_bps: stats.effective_bps.load(Ordering::Relaxed),
            counters: stats.counters(),
        }
    }

    // ---

    /// Stop accepting records, let the writer drain, join every task and
    /// persist the state.  The state is on disk when this returns.
    pub async fn terminate(&self) {
        // ---
        let tag = self.tag();
        lock(&self.core.progress).accepting = false;
        self.core.shutdown_tx.send_replace(true);
        self.core.queued.notify_one();

        let writer = lock(&self.writer).take();
        if let Some(handle) = writer {
            if let Err(e) = handle.await {
                error!(tag, "writer task failed: {e}");
            }
        }

        let catchup = lock(&self.core.progress).catchup.take();
        if let Some(handle) = catchup {
            if let Err(e) = handle.await {
                error!(tag, "catch-up task failed: {e}");
            }
        }

        if let Err(e) = self.persist() {
            error!(tag, "cannot persist state: {e}");
        }
        self.core.terminated.store(true, Ordering::Relaxed);
        info!(tag, "session terminated");
    }
}

// ---

fn load_filter(dest: &Destination, ctx: &ExportContext) -> ChannelFilter {
    // ---
    let path = dest.chan_path(&ctx.chan_dir);
    match ChannelFilter::load(&path) {
        Ok(filter) => {
            if filter.is_empty() {
                warn!(tag = %dest.tag, path = %path.display(), "channel list is empty, nothing will be sent");
            }
            filter
        }
        Err(e) => {
            warn!(tag = %dest.tag, "{e}; nothing will be sent until it appears");
            ChannelFilter::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::Duration;

    use tokio::net::TcpListener;
    use wavelink_domain::{ChannelCode, ChannelTrack};
    use wavelink_peer_sim::{PeerSim, PeerSimConfig, ReceivedUnit};

    use super::super::test_support::{record, wait_until, Harness};
    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn code() -> ChannelCode {
        ChannelCode::new("CIPASC BHZ  ")
    }

    /// Consecutive units of one channel never go back in time.
    fn assert_forward(units: &[ReceivedUnit]) {
        // ---
        for pair in units.windows(2) {
            assert!(
                pair[0].unit.end_ms() <= pair[1].unit.start_ms,
                "time reversal: {:?} then {:?}",
                (pair[0].unit.start_ms, pair[0].unit.end_ms()),
                pair[1].unit.start_ms,
            );
        }
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn live_records_reach_the_receiver_in_order() {
        // ---
        let h = Harness::new(64);
        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");

        for i in 0..5 {
            let (rec, seq) = h.append(record(code(), i));
            session.offer(&rec, seq);
        }

        let got = sim.collect(5, WAIT).await;
        assert_eq!(got.len(), 5);
        assert_eq!(got.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), [0, 1, 2, 3, 4]);
        assert_forward(&got);
        assert_eq!(session.processed(), Some(4));
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reconnect_resumes_without_duplicates() {
        // ---
        let h = Harness::new(64);
        let mut sim = PeerSim::listen(PeerSimConfig::flaky(5)).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");

        for i in 0..5 {
            let (rec, seq) = h.append(record(code(), i));
            session.offer(&rec, seq);
        }
        let first = sim.collect(5, WAIT).await;
        assert_eq!(first.len(), 5);
        assert!(first.iter().all(|r| r.connection == 0));

        // Let the writer notice the hang-up before more data arrives.
        wait_until(WAIT, || session.stats().reconnects.load(Ordering::Relaxed) >= 1).await;

        for i in 5..10 {
            let (rec, seq) = h.append(record(code(), i));
            session.offer(&rec, seq);
        }
        let second = sim.collect(5, WAIT).await;
        assert_eq!(second.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), [5, 6, 7, 8, 9]);
        assert!(second.iter().all(|r| r.connection == 1));

        let all: Vec<_> = first.into_iter().chain(second).collect();
        assert_forward(&all);
        assert!(sim.next_unit(Duration::from_millis(300)).await.is_none());
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unacknowledged_frames_are_replayed_after_reconnect() {
        // ---
        let h = Harness::new(64);
        let cfg = PeerSimConfig {
            ack: true,
            ack_limit: Some(3),
            drop_after_frames: Some(5),
            ..Default::default()
        };
        let mut sim = PeerSim::listen(cfg).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "-ack");

        for i in 0..5 {
            let (rec, seq) = h.append(record(code(), i));
            session.offer(&rec, seq);
        }
        let first = sim.collect(5, WAIT).await;
        assert_eq!(first.len(), 5);
        assert_eq!(first[0].ack_seq, Some(0));
        assert_eq!(first[4].ack_seq, Some(4));

        // Frames 3 and 4 were never acknowledged and come round again.
        let replay = sim.collect(2, WAIT).await;
        assert_eq!(replay.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), [3, 4]);
        assert!(replay.iter().all(|r| r.connection == 1));
        assert_eq!(session.stats().rollbacks.load(Ordering::Relaxed), 1);
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gap_is_replayed_from_the_ring() {
        // ---
        let h = Harness::new(64);
        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");

        let (rec, seq) = h.append(record(code(), 0));
        session.offer(&rec, seq);

        // Records 1..=8 reach the ring but only 9 is offered live.
        let mut last = (rec, seq);
        for i in 1..10 {
            last = h.append(record(code(), i));
        }
        session.offer(&last.0, last.1);

        let got = sim.collect(10, WAIT).await;
        assert_eq!(got.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert_forward(&got);

        wait_until(WAIT, || !session.is_replaying()).await;
        assert_eq!(session.processed(), Some(9));
        assert_eq!(session.phase(), SessionPhase::RealTime);
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn full_queue_drops_live_and_catchup_recovers() {
        // ---
        let h = Harness::new(256);

        // Two usable slots and no receiver yet.
        let session = h.passive_session("slow", 9, "-q 3");
        for i in 0..8 {
            let (rec, seq) = h.append(record(code(), i));
            session.offer(&rec, seq);
        }
        assert_eq!(session.stats().dropped_live.load(Ordering::Relaxed), 1);
        assert!(session.is_replaying());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut sim = PeerSim::connect(listener.local_addr().unwrap(), PeerSimConfig::perfect())
            .await
            .unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        session.hand_over(stream);

        // The dropped record and everything after it arrive exactly once.
        let got = sim.collect(8, WAIT).await;
        assert_eq!(got.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), (0..8).collect::<Vec<_>>());
        assert_forward(&got);

        wait_until(WAIT, || !session.is_replaying()).await;
        assert_eq!(session.processed(), Some(7));
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_resumes_after_saved_watermark() {
        // ---
        let h = Harness::new(64);
        for i in 0..6 {
            h.append(record(code(), i));
        }

        // Saved state: everything through seq 3 delivered.
        let last_end = record(code(), 3).end_ms();
        state_file::save(
            &state_file::state_path(h.state_dir(), "ew1"),
            &SessionState {
                seq: 3,
                tracks: vec![(
                    code(),
                    ChannelTrack {
                        last_end_ms: last_end,
                        last_seq: 3,
                    },
                )],
            },
        )
        .unwrap();

        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");
        let (rec, seq) = h.append(record(code(), 6));
        session.offer(&rec, seq);

        let got = sim.collect(3, WAIT).await;
        assert_eq!(got.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), [4, 5, 6]);
        assert!(got[0].unit.start_ms >= last_end);
        assert!(sim.next_unit(Duration::from_millis(300)).await.is_none());

        session.terminate().await;
        let saved = state_file::load(&state_file::state_path(h.state_dir(), "ew1"))
            .unwrap()
            .unwrap();
        assert_eq!(saved.seq, 6);
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unlisted_and_restricted_channels_are_withheld() {
        // ---
        let h = Harness::with_restricted(64, &[ChannelCode::new("CISECR HHZ  ")]);
        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");

        let (a, s) = h.append(record(ChannelCode::new("NCOTHR HHZ  "), 0));
        session.offer(&a, s);
        let (b, s) = h.append(record(ChannelCode::new("CISECR HHZ  "), 1));
        session.offer(&b, s);
        let (c, s) = h.append(record(code(), 2));
        session.offer(&c, s);

        let got = sim.collect(1, WAIT).await;
        assert_eq!(got[0].unit.channel, code());
        assert!(sim.next_unit(Duration::from_millis(300)).await.is_none());
        assert_eq!(session.stats().filtered.load(Ordering::Relaxed), 2);
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_receiver_is_disconnected() {
        // ---
        let h = Harness::new(16);
        let sim = PeerSim::listen(PeerSimConfig::silent()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "-hbint 1 -hbto 1");

        wait_until(WAIT, || session.stats().reconnects.load(Ordering::Relaxed) >= 1).await;
        assert!(sim.stats().connections.load(Ordering::Relaxed) >= 1);
        session.terminate().await;
        assert_eq!(session.phase(), SessionPhase::Terminated);
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn saved_position_ahead_of_a_recreated_ring_resumes_live() {
        // ---
        let h = Harness::new(64);
        state_file::save(
            &state_file::state_path(h.state_dir(), "ew1"),
            &SessionState {
                seq: 1000,
                tracks: Vec::new(),
            },
        )
        .unwrap();

        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");
        assert_eq!(session.processed(), Some(1000));

        for i in 0..5 {
            let (rec, seq) = h.append(record(code(), i));
            session.offer(&rec, seq);
        }

        let got = sim.collect(5, WAIT).await;
        assert_eq!(got.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), [0, 1, 2, 3, 4]);
        assert_eq!(session.processed(), Some(4));
        assert_eq!(session.stats().gaps.load(Ordering::Relaxed), 1);
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn backlog_beyond_the_ring_window_resumes_live() {
        // ---
        // 16 slots: at most 14 records are worth replaying.
        let h = Harness::new(16);
        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");

        let (rec, seq) = h.append(record(code(), 0));
        session.offer(&rec, seq);
        let mut last = (rec, seq);
        for i in 1..20 {
            last = h.append(record(code(), i));
        }
        session.offer(&last.0, last.1);

        let got = sim.collect(2, WAIT).await;
        assert_eq!(got.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), [0, 19]);
        assert!(sim.next_unit(Duration::from_millis(300)).await.is_none());
        assert_eq!(session.stats().gaps.load(Ordering::Relaxed), 18);
        assert!(!session.is_replaying());
        assert_eq!(session.processed(), Some(19));
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn future_dated_unit_is_counted_and_not_sent() {
        // ---
        let h = Harness::new(64);
        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");

        // About two hours ahead of the clock; the tolerance is ten minutes.
        for i in [0, 7800, 1] {
            let (rec, seq) = h.append(record(code(), i));
            session.offer(&rec, seq);
        }

        let got = sim.collect(2, WAIT).await;
        assert_eq!(got.iter().map(|r| r.unit.seq).collect::<Vec<_>>(), [0, 2]);
        assert_forward(&got);
        assert_eq!(session.stats().future.load(Ordering::Relaxed), 1);
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn records_older_than_max_age_are_discarded() {
        // ---
        let h = Harness::new(64);
        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "-maxage 60");

        // Ten minutes old.
        let (old, seq) = h.append(record(code(), 0));
        session.offer(&old, seq);

        let fresh = DecodedRecord {
            channel: code(),
            start_ms: now_ms() - 2_000,
            rate: 100.0,
            samples: vec![7; 100],
        };
        let (fresh, seq) = h.append(fresh);
        session.offer(&fresh, seq);

        let got = sim.collect(1, WAIT).await;
        assert_eq!(got[0].unit.seq, 1);
        assert!(sim.next_unit(Duration::from_millis(300)).await.is_none());
        assert_eq!(session.stats().too_old.load(Ordering::Relaxed), 1);
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn channels_dropped_from_the_list_lose_their_history() {
        // ---
        let h = Harness::new(64);
        let other = ChannelCode::new("CIUSC  BHZ  ");
        let mut sim = PeerSim::listen(PeerSimConfig::perfect()).await.unwrap();
        let session = h.active_session("ew1", sim.local_addr().unwrap(), "");

        let (a, s) = h.append(record(code(), 0));
        session.offer(&a, s);
        let (b, s) = h.append(record(other, 0));
        session.offer(&b, s);
        sim.collect(2, WAIT).await;
        wait_until(WAIT, || lock(&session.core.guard).len() == 2).await;

        std::fs::write(h.root().join("chans").join("ew1.chan"), "CIPASC BHZ  \n").unwrap();
        session.reload_channels();

        let guard = lock(&session.core.guard);
        assert!(guard.track(&code()).is_some());
        assert!(guard.track(&other).is_none());
        drop(guard);

        let (c, s) = h.append(record(other, 1));
        session.offer(&c, s);
        assert_eq!(session.stats().filtered.load(Ordering::Relaxed), 1);
        session.terminate().await;
    }

    // ---

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repeated_live_drops_grow_the_queue() {
        // ---
        let h = Harness::new(16);
        let session = h.passive_session("slow", 9, "-q 3");
        let core = &session.core;

        let mut grown = Vec::new();
        {
            let mut p = lock(&core.progress);
            for seq in 0..4 * GROW_EVERY_DROPS as u32 {
                core.live_overflow(&mut p, seq);
                if (seq + 1) % GROW_EVERY_DROPS as u32 == 0 {
                    grown.push(core.queue.capacity());
                }
            }
        }

        // Doubles every hundred drops, up to eight times the configured size.
        assert_eq!(grown, [6, 12, 24, 24]);
        assert_eq!(session.stats().dropped_live.load(Ordering::Relaxed), 400);
        session.terminate().await;
    }
}
