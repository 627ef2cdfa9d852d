//! Catch-up reader: replays a session's backlog from the ring file.
//!
//! Runs on the blocking pool with its own [`RingReader`].  Each record from
//! `processed + 1` up to the newest live sequence goes through the same
//! policy checks as live data; a full queue is waited out rather than
//! dropping.  The reader exits only by handing the session back to the live
//! path (or on shutdown), and that handover happens under the session's
//! progress lock, so no live record slips between the two.

use std::sync::Arc;
use std::time::Duration;

// ---

use tracing::{debug, error, info, warn};

// ---

use wavelink_domain::{seq_gap, OutputUnit, RingReader};

// ---

use super::session::SessionCore;
use super::SessionStats;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Wait between attempts to add to a full queue.
const QUEUE_FULL_WAIT: Duration = Duration::from_millis(20);

/// Wait when the ring header has not caught up with the live feed yet.
const RING_LAG_WAIT: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

pub(crate) fn run(core: Arc<SessionCore>) {
    // ---
    let tag = core.tag();
    let mut ring = match RingReader::open(&core.ctx.ring_path) {
        Ok(ring) => ring,
        Err(e) => {
            error!(tag, "catch-up abandoned: {e}");
            core.abandon_backlog();
            return;
        }
    };

    let mut replayed = 0u64;
    while let Some(seq) = core.next_backlog() {
        // ---
        if core.is_stopping() {
            debug!(tag, seq, "catch-up stopped by shutdown");
            return;
        }

        let raw = ring.refresh().and_then(|_| ring.read(seq));
        match raw {
            Ok(Some(raw)) => match core.ctx.decoder.decode(&raw) {
                Ok(record) => {
                    for unit in core.prepare(&record, seq) {
                        if !feed(&core, &unit, seq) {
                            return;
                        }
                    }
                }
                Err(e) => {
                    SessionStats::bump(&core.stats.decode_errors);
                    warn!(tag, seq, "skipping undecodable record: {e}");
                }
            },

            Ok(None) => {
                let header = ring.header();
                let behind = seq_gap(seq, header.next_seq);
                if behind == 0 || behind > u32::MAX / 2 {
                    // The feed saw it, so the header will too.
                    std::thread::sleep(RING_LAG_WAIT);
                    continue;
                }
                if behind > header.capacity {
                    let oldest = header.next_seq.wrapping_sub(header.capacity);
                    let skipped = seq_gap(seq, oldest);
                    warn!(tag, from = seq, to = oldest, skipped, "backlog overwritten in the ring, skipping ahead");
                    SessionStats::add(&core.stats.gaps, skipped as u64);
                    core.mark_processed(oldest.wrapping_sub(1));
                    continue;
                }
                SessionStats::bump(&core.stats.gaps);
                warn!(tag, seq, "ring slot does not hold the expected record");
            }

            Err(e) => {
                SessionStats::bump(&core.stats.gaps);
                error!(tag, seq, "ring read failed: {e}");
            }
        }

        core.mark_processed(seq);
        replayed += 1;
    }

    info!(tag, replayed, "caught up, back to real time");
}

// ---

/// Add `unit`, waiting for room.  `false` if shutdown intervened.
fn feed(core: &SessionCore, unit: &OutputUnit, seq: u32) -> bool {
    // ---
    loop {
        if core.queue.add(unit, seq) {
            core.queued.notify_one();
            return true;
        }
        if core.is_stopping() {
            return false;
        }
        std::thread::sleep(QUEUE_FULL_WAIT);
    }
}
