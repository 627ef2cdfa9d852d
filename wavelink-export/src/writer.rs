//! [`OutputWriter`]: the task that owns a session's socket.
//!
//! ```text
//!            ┌──────────── connect / accept ◄──────────────┐
//!            ▼                                              │ backoff
//!   serve: heartbeat ─► tail unit ─► order check ─► write   │
//!            ▲                          │ stale/future      │
//!            │                          ▼ discard           │
//!            └──────── throttle pause ◄─┘                   │
//!                                                           │
//!   link lost (EOF, write error, heartbeat timeout) ─► rollback unacked
//! ```
//!
//! A separate reader task owns the read half, decodes inbound frames and
//! reports heartbeats, acks and EOF over a channel.  The writer is the only
//! consumer of the delivery queue.
//!
//! In ack mode each data frame carries a rolling number mod 250 and is kept
//! in an undo log until acknowledged.  When the link drops, fewer than 250
//! outstanding frames are re-queued by moving the queue tail back and
//! restoring each channel's order track; otherwise delivery resumes from the
//! current position.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

// ---

use wavelink_domain::wire::{self, ACK_MODULUS, TYPE_HEARTBEAT, TYPE_TRACEBUF2};
use wavelink_domain::{
    // ---
    now_ms,
    tracebuf,
    ChannelCode,
    ChannelTrack,
    Frame,
    FrameDecoder,
    Logo,
    OutputUnit,
    Verdict,
};

// ---

use super::session::{lock, Link, SessionCore};
use super::{Role, SessionStats, Throttle};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const REMOTE_BACKOFF_CAP: Duration = Duration::from_secs(60);
const LOCAL_BACKOFF_CAP: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest idle wait before the serve loop re-checks its timers.
const IDLE_TICK: Duration = Duration::from_millis(500);

const READ_BUF_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential reconnect delay with jitter.
#[derive(Debug)]
struct Backoff {
    // ---
    cap: Duration,
    current: Duration,
    rng: SmallRng,

    /// The cap has been reached and reported; cleared on reset.
    capped: bool,
}

impl Backoff {
    // ---
    fn new(cap: Duration) -> Self {
        Self {
            cap,
            current: INITIAL_BACKOFF,
            rng: SmallRng::from_entropy(),
            capped: false,
        }
    }

    /// Delay before the next attempt: the current step plus up to 25%
    /// jitter.  Doubles the step up to the cap.
    fn next_delay(&mut self, tag: &str) -> Duration {
        // ---
        let base = self.current;
        if base >= self.cap && !self.capped {
            self.capped = true;
            warn!(tag, cap_secs = self.cap.as_secs(), "reconnect backoff at its cap");
        }
        self.current = (self.current * 2).min(self.cap);

        let jitter_ms = self.rng.gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter_ms)
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
        self.capped = false;
    }
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// What the reader task reports.
#[derive(Debug)]
enum Inbound {
    // ---
    /// Any inbound message; proves the receiver is alive.
    Alive,
    Ack(u16),
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
enum Ended {
    Lost,
    Replaced(TcpStream),
    Shutdown,
}

/// A data frame awaiting acknowledgement.
#[derive(Debug)]
struct Sent {
    // ---
    ack_seq: u16,
    channel: ChannelCode,

    /// Channel track before this frame was committed.
    previous: Option<ChannelTrack>,

    /// Queue slot index (running count of consumed slots) of this frame.
    slot: u64,
}

// ---------------------------------------------------------------------------
// OutputWriter
// ---------------------------------------------------------------------------

pub(crate) struct OutputWriter {
    // ---
    core: Arc<SessionCore>,
    conn_rx: mpsc::Receiver<TcpStream>,
    shutdown: watch::Receiver<bool>,

    throttle: Throttle,
    backoff: Backoff,
    data_logo: Logo,
    heartbeat: Vec<u8>,

    /// Rolling counter behind the ack numbers.
    next_ack: u32,
    unacked: VecDeque<Sent>,

    /// Queue slots consumed so far; lets rollback count skipped slots too.
    consumed: u64,
}

// ---

impl OutputWriter {
    // ---
    pub(crate) fn new(core: Arc<SessionCore>, conn_rx: mpsc::Receiver<TcpStream>) -> Self {
        // ---
        let dest = &core.dest;
        let cap = if dest.is_local_peer() {
            LOCAL_BACKOFF_CAP
        } else {
            REMOTE_BACKOFF_CAP
        };
        let heartbeat = wire::encode_frame(
            Logo::new(dest.inst, dest.module, TYPE_HEARTBEAT),
            None,
            dest.hb_out.as_bytes(),
        );

        Self {
            shutdown: core.shutdown_tx.subscribe(),
            throttle: Throttle::new(dest.throttle_bps, Instant::now()),
            backoff: Backoff::new(cap),
            data_logo: Logo::new(dest.inst, dest.module, TYPE_TRACEBUF2),
            heartbeat,
            next_ack: 0,
            unacked: VecDeque::new(),
            consumed: 0,
            conn_rx,
            core,
        }
    }

    // ---

    /// Connect, serve, reconnect; returns once the session is shutting down
    /// and the queue has drained (or the drain timed out).
    pub(crate) async fn run(mut self) {
        // ---
        let core = Arc::clone(&self.core);
        let tag = core.tag();
        let mut pending: Option<TcpStream> = None;
        let mut reconnecting = false;

        loop {
            let stream = match pending.take() {
                Some(stream) => stream,
                None => {
                    let next = match core.dest.role {
                        Role::Active => self.connect(reconnecting).await,
                        Role::Passive => self.accept().await,
                    };
                    match next {
                        Some(stream) => stream,
                        None => break,
                    }
                }
            };

            let peer = stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into());
            info!(tag, %peer, "link up");
            core.set_link(Link::Connected);

            let ended = self.serve(stream).await;

            core.set_link(Link::Disconnected);
            self.rollback_unacked();
            reconnecting = true;

            match ended {
                Ended::Shutdown => break,
                Ended::Replaced(stream) => {
                    info!(tag, %peer, "link replaced by a newer inbound connection");
                    SessionStats::bump(&core.stats.reconnects);
                    pending = Some(stream);
                }
                Ended::Lost => {
                    info!(tag, %peer, "link down");
                    SessionStats::bump(&core.stats.reconnects);
                }
            }
        }

        core.set_link(Link::Disconnected);
        debug!(tag, "writer stopped");
    }

    // ---

    /// Active role: dial the peer with backoff until it answers or the
    /// session shuts down.
    async fn connect(&mut self, reconnecting: bool) -> Option<TcpStream> {
        // ---
        let core = Arc::clone(&self.core);
        let tag = core.tag();
        let addr = core.dest.peer_addr();
        let mut wait = reconnecting;

        loop {
            if wait {
                let delay = self.backoff.next_delay(tag);
                debug!(tag, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stopped(&mut self.shutdown) => return None,
                }
            }
            if core.is_stopping() {
                return None;
            }
            wait = true;

            core.set_link(Link::Connecting);
            let attempt = tokio::select! {
                res = dial(&addr) => res,
                _ = stopped(&mut self.shutdown) => return None,
            };
            match attempt {
                Ok(stream) => {
                    self.backoff.reset();
                    return Some(stream);
                }
                Err(e) => {
                    core.set_link(Link::Disconnected);
                    debug!(tag, %addr, "connect failed: {e:#}");
                }
            }
        }
    }

    /// Passive role: wait for the listener to hand over a connection.
    async fn accept(&mut self) -> Option<TcpStream> {
        // ---
        tokio::select! {
            stream = self.conn_rx.recv() => stream,
            _ = stopped(&mut self.shutdown) => None,
        }
    }

    // ---

    async fn serve(&mut self, stream: TcpStream) -> Ended {
        // ---
        let core = Arc::clone(&self.core);
        let tag = core.tag();
        let dest = &core.dest;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(tag, "set_nodelay: {e}");
        }
        let (rd, mut wr) = stream.into_split();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_inbound(rd, events_tx, Arc::clone(&core)));

        let mut last_inbound = Instant::now();
        let mut next_heartbeat = Instant::now();
        let mut drain_deadline: Option<Instant> = None;

        let ended = loop {
            // ---
            if let Some(ended) = self.poll_inbound(&mut events, &mut last_inbound) {
                break ended;
            }
            if let Ok(stream) = self.conn_rx.try_recv() {
                break Ended::Replaced(stream);
            }

            let now = Instant::now();
            if drain_deadline.is_none() && core.is_stopping() {
                debug!(tag, queued = core.queue.used(), "draining before shutdown");
                drain_deadline = Some(now + core.ctx.drain_timeout);
            }
            if let Some(deadline) = drain_deadline {
                if core.queue.is_empty() {
                    break Ended::Shutdown;
                }
                if now >= deadline {
                    warn!(tag, left = core.queue.used(), "drain timed out, queued units not sent");
                    break Ended::Shutdown;
                }
            }

            if now.duration_since(last_inbound) > dest.hb_timeout {
                warn!(
                    tag,
                    timeout_secs = dest.hb_timeout.as_secs(),
                    "nothing heard from receiver, dropping link",
                );
                break Ended::Lost;
            }

            if now >= next_heartbeat {
                if let Err(e) = wr.write_all(&self.heartbeat).await {
                    warn!(tag, "heartbeat write failed: {e}");
                    break Ended::Lost;
                }
                SessionStats::bump(&core.stats.heartbeats_out);
                SessionStats::add(&core.stats.bytes_out, self.heartbeat.len() as u64);
                next_heartbeat = now + dest.hb_interval;
            }

            match core.queue.get_tail() {
                Some(unit) => match self.send_unit(&mut wr, unit).await {
                    Ok(pause) => {
                        if !pause.is_zero() && drain_deadline.is_none() {
                            trace!(tag, pause_ms = pause.as_millis() as u64, "throttled");
                            tokio::select! {
                                _ = tokio::time::sleep(pause) => {}
                                _ = self.shutdown.changed() => {}
                            }
                        }
                    }
                    Err(e) => {
                        warn!(tag, "write failed: {e}");
                        break Ended::Lost;
                    }
                },
                None => {
                    let wake = next_heartbeat
                        .min(last_inbound + dest.hb_timeout)
                        .min(now + IDLE_TICK);
                    tokio::select! {
                        _ = core.queued.notified() => {}
                        event = events.recv() => match event {
                            Some(Inbound::Closed) | None => break Ended::Lost,
                            Some(event) => self.on_inbound(event, &mut last_inbound),
                        },
                        stream = self.conn_rx.recv() => {
                            if let Some(stream) = stream {
                                break Ended::Replaced(stream);
                            }
                        }
                        _ = self.shutdown.changed() => {}
                        _ = tokio::time::sleep_until(wake.into()) => {}
                    }
                }
            }
        };

        // Acks already read still count before rolling back.
        drop(wr);
        reader.abort();
        let _ = self.poll_inbound(&mut events, &mut last_inbound);
        ended
    }

    // ---

    /// Handle queued inbound events; `Some` when the link has closed.
    fn poll_inbound(
        &mut self,
        events: &mut mpsc::UnboundedReceiver<Inbound>,
        last_inbound: &mut Instant,
    ) -> Option<Ended> {
        // ---
        while let Ok(event) = events.try_recv() {
            match event {
                Inbound::Closed => return Some(Ended::Lost),
                event => self.on_inbound(event, last_inbound),
            }
        }
        None
    }

    fn on_inbound(&mut self, event: Inbound, last_inbound: &mut Instant) {
        // ---
        *last_inbound = Instant::now();
        if let Inbound::Ack(seq) = event {
            // Acks are cumulative up to the acknowledged frame.
            match self.unacked.iter().position(|s| s.ack_seq == seq) {
                Some(pos) => {
                    self.unacked.drain(..=pos);
                }
                None => debug!(tag = self.core.tag(), seq, "ack matches no outstanding frame"),
            }
        }
    }

    // ---

    /// Order-check and write the tail unit.  Returns the throttle pause.
    async fn send_unit(
        &mut self,
        wr: &mut OwnedWriteHalf,
        unit: OutputUnit,
    ) -> std::io::Result<Duration> {
        // ---
        let core = Arc::clone(&self.core);
        let tag = core.tag();
        let channel = unit.channel;
        let now = now_ms();

        let (verdict, previous) = {
            let mut guard = lock(&core.guard);
            let previous = guard.track(&channel);
            (guard.check(&unit, true, now), previous)
        };

        match verdict {
            Verdict::Accept => {}
            Verdict::Stale => {
                SessionStats::bump(&core.stats.stale);
                debug!(tag, %channel, seq = unit.seq, start_ms = unit.start_ms, "stale unit discarded");
                self.release_tail();
                return Ok(Duration::ZERO);
            }
            Verdict::Future => {
                SessionStats::bump(&core.stats.future);
                error!(
                    tag,
                    %channel,
                    seq = unit.seq,
                    end_ms = unit.end_ms(),
                    now_ms = now,
                    "unit ends in the future, discarded",
                );
                self.release_tail();
                return Ok(Duration::ZERO);
            }
        }

        let ack_seq = core
            .dest
            .ack
            .then(|| (self.next_ack % ACK_MODULUS as u32) as u16);
        let frame = wire::encode_frame(self.data_logo, ack_seq, &tracebuf::encode(&unit));

        if let Err(e) = wr.write_all(&frame).await {
            lock(&core.guard).restore(channel, previous);
            return Err(e);
        }

        let slot = self.release_tail();
        if let Some(ack_seq) = ack_seq {
            self.next_ack = self.next_ack.wrapping_add(1);
            if self.unacked.len() >= ACK_MODULUS as usize {
                self.unacked.pop_front();
            }
            self.unacked.push_back(Sent {
                ack_seq,
                channel,
                previous,
                slot,
            });
        }

        let stats = &core.stats;
        SessionStats::bump(&stats.units_sent);
        SessionStats::add(&stats.bytes_out, frame.len() as u64);
        let latency_ms = now_ms().saturating_sub(unit.end_ms());
        stats.latency_ms.store(latency_ms, Ordering::Relaxed);
        trace!(tag, %channel, seq = unit.seq, ?ack_seq, latency_ms, "unit sent");

        let pause = self.throttle.record(
            frame.len(),
            Instant::now(),
            core.replaying.load(Ordering::Relaxed),
            Some(Duration::from_millis(latency_ms.max(0) as u64)),
        );
        stats
            .effective_bps
            .store(self.throttle.effective_bps(), Ordering::Relaxed);
        Ok(pause)
    }

    /// Consume the held tail slot; returns that slot's index.
    fn release_tail(&mut self) -> u64 {
        // ---
        if let Err(e) = self.core.queue.bump_tail() {
            error!(tag = self.core.tag(), "cannot advance queue tail: {e}");
        }
        let slot = self.consumed;
        self.consumed += 1;
        slot
    }

    // ---

    /// Re-queue frames the receiver never acknowledged.
    fn rollback_unacked(&mut self) {
        // ---
        let Some(oldest) = self.unacked.front() else {
            return;
        };
        let tag = self.core.tag();
        let frames = self.unacked.len();
        let slots = (self.consumed - oldest.slot) as usize;

        if frames < ACK_MODULUS as usize && self.core.queue.move_tail_back(slots) {
            self.consumed -= slots as u64;
            let mut guard = lock(&self.core.guard);
            for sent in self.unacked.iter().rev() {
                guard.restore(sent.channel, sent.previous);
            }
            SessionStats::bump(&self.core.stats.rollbacks);
            info!(tag, frames, "unacknowledged frames re-queued");
        } else {
            SessionStats::add(&self.core.stats.gaps, frames as u64);
            warn!(tag, frames, "unacknowledged frames cannot be re-queued, continuing from current position");
        }
        self.unacked.clear();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolves once shutdown has been requested.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn dial(addr: &str) -> anyhow::Result<TcpStream> {
    // ---
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {}s", CONNECT_TIMEOUT.as_secs()))??;
    Ok(stream)
}

/// Read half: decode inbound frames until EOF.
async fn read_inbound(
    mut rd: OwnedReadHalf,
    events: mpsc::UnboundedSender<Inbound>,
    core: Arc<SessionCore>,
) {
    // ---
    let tag = core.tag();
    let stats = &core.stats;
    let mut decoder = FrameDecoder::new();
    let mut frames = Vec::new();
    let mut buf = vec![0u8; READ_BUF_LEN];

    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(tag, "read failed: {e}");
                break;
            }
        };
        SessionStats::add(&stats.bytes_in, n as u64);

        let before = decoder.resyncs();
        decoder.push(&buf[..n], &mut frames);
        let resynced = decoder.resyncs() - before;
        if resynced > 0 {
            SessionStats::add(&stats.resyncs, resynced);
            warn!(tag, resynced, "inbound framing broken, resynchronised");
        }

        for frame in frames.drain(..) {
            let event = match frame {
                Frame::Ack(seq) => {
                    SessionStats::bump(&stats.acks_in);
                    Inbound::Ack(seq)
                }
                Frame::Message { logo, payload, .. } if logo.msg_type == TYPE_HEARTBEAT => {
                    SessionStats::bump(&stats.heartbeats_in);
                    if payload != core.dest.hb_in.as_bytes() {
                        debug!(tag, "unexpected heartbeat text");
                    }
                    Inbound::Alive
                }
                Frame::Message { logo, .. } => {
                    debug!(tag, msg_type = logo.msg_type, "ignoring inbound message");
                    Inbound::Alive
                }
            };
            if events.send(event).is_err() {
                return;
            }
        }
    }

    let _ = events.send(Inbound::Closed);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn backoff_doubles_to_its_cap() {
        // ---
        let mut b = Backoff::new(Duration::from_secs(5));
        let bases: Vec<u64> = (0..5).map(|_| b.next_delay("t").as_secs()).collect();

        // Jitter adds at most a quarter, so whole seconds show the base.
        assert_eq!(bases[0], 1);
        assert_eq!(bases[1], 2);
        assert!((4..=5).contains(&bases[2]));
        assert!((5..=6).contains(&bases[3]));
        assert!((5..=6).contains(&bases[4]));
        assert!(b.capped);

        b.reset();
        assert_eq!(b.next_delay("t").as_secs(), 1);
        assert!(!b.capped);
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        // ---
        let mut b = Backoff::new(Duration::from_secs(60));
        for _ in 0..6 {
            let step = b.current;
            let delay = b.next_delay("t");
            assert!(delay >= step && delay <= step + step / 4, "{delay:?} for {step:?}");
        }
    }
}
