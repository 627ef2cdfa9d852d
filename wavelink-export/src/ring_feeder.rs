//! [`RingFeeder`]: the live feed.
//!
//! A dedicated `std::thread` polls the ring file, decodes each new record
//! once and routes it to every session in sequence order.  It starts at the
//! ring's current write position; older records reach a session only
//! through that session's catch-up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ---

use tracing::{debug, error, info, warn};

// ---

use wavelink_domain::{seq_gap, RingReader};

// ---

use super::ExportServer;

// ---------------------------------------------------------------------------
// RingFeeder
// ---------------------------------------------------------------------------

pub struct RingFeeder {
    // ---
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

// ---

impl RingFeeder {
    // ---
    /// Spawn the feed thread over an already opened ring.
    pub fn spawn(ring: RingReader, server: Arc<ExportServer>, poll: Duration) -> std::io::Result<Self> {
        // ---
        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("wavelink-ring".into())
                .spawn(move || feed(ring, server, poll, stop))?
        };
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it.
    pub fn stop(mut self) {
        // ---
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("ring feed thread panicked");
            }
        }
    }
}

// ---

fn feed(mut ring: RingReader, server: Arc<ExportServer>, poll: Duration, stop: Arc<AtomicBool>) {
    // ---
    let decoder = Arc::clone(&server.ctx().decoder);
    let mut next = ring.header().next_seq;
    info!(ring = %ring.path().display(), seq = next, "ring feed started at live position");

    while !stop.load(Ordering::Relaxed) {
        let header = match ring.refresh() {
            Ok(header) => header,
            Err(e) => {
                error!("ring header unreadable: {e}");
                thread::sleep(poll);
                continue;
            }
        };

        if next == header.next_seq {
            thread::sleep(poll);
            continue;
        }

        if !header.holds(next) {
            let behind = seq_gap(next, header.next_seq);
            let resume = if behind > u32::MAX / 2 {
                // Writer restarted below us.
                header.next_seq
            } else {
                header.next_seq.wrapping_sub(header.capacity)
            };
            warn!(from = next, to = resume, "ring feed fell behind the writer, skipping ahead");
            next = resume;
            continue;
        }

        while next != header.next_seq && !stop.load(Ordering::Relaxed) {
            match ring.read(next) {
                Ok(Some(raw)) => match decoder.decode(&raw) {
                    Ok(record) => server.route(&record, next),
                    Err(e) => {
                        warn!(seq = next, "undecodable record: {e}");
                        server.skip(next);
                    }
                },
                Ok(None) => {
                    warn!(seq = next, "record overwritten before it was read");
                    server.skip(next);
                }
                Err(e) => {
                    error!(seq = next, "ring read failed: {e}");
                    server.skip(next);
                }
            }
            next = next.wrapping_add(1);
        }
    }

    debug!(seq = next, "ring feed stopped");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
