//! Shared fixtures for the daemon's async tests: a temp ring file, channel
//! lists, an [`ExportContext`] and record builders.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

// ---

use tempfile::TempDir;
use uuid::Uuid;

// ---

use wavelink_domain::{
    // ---
    encode_plain_block,
    now_ms,
    ChannelCode,
    DecodedRecord,
    PlainBlockDecoder,
    RestrictedSet,
    RingWriter,
};

// ---

use super::{Destination, ExportContext, Session};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const RECORD_LEN: u32 = 4096;
const SAMPLES_PER_RECORD: usize = 100;
const RATE: f64 = 100.0;

/// Tags that get an allow-list of `CI.*` in every harness.
const TEST_TAGS: &[&str] = &["ew1", "in1", "slow", "fast", "a", "b", "c"];

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Ten minutes ago, whole seconds; fixed for the test binary's lifetime.
fn base_ms() -> i64 {
    static BASE: OnceLock<i64> = OnceLock::new();
    *BASE.get_or_init(|| (now_ms() - 600_000) / 1000 * 1000)
}

/// The `i`-th one-second record of `channel`: 100 samples at 100 Hz.
pub fn record(channel: ChannelCode, i: i64) -> DecodedRecord {
    // ---
    DecodedRecord {
        channel,
        start_ms: base_ms() + i * 1000,
        rate: RATE,
        samples: (0..SAMPLES_PER_RECORD as i32).map(|s| s + i as i32).collect(),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll `cond` until it holds; panics after `wait`.
pub async fn wait_until<F>(wait: Duration, mut cond: F)
where
    F: FnMut() -> bool,
{
    // ---
    let deadline = Instant::now() + wait;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met within {wait:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A loopback port nothing is listening on (at the time of the call).
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .unwrap()
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    // ---
    dir: TempDir,
    ring: Mutex<RingWriter>,
    ctx: Arc<ExportContext>,
}

// ---

impl Harness {
    // ---
    /// Must be called inside a tokio runtime.
    pub fn new(ring_capacity: u32) -> Self {
        Self::with_restricted(ring_capacity, &[])
    }

    pub fn with_restricted(ring_capacity: u32, restricted: &[ChannelCode]) -> Self {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let ring_path = dir.path().join("ring.dat");
        let chan_dir = dir.path().join("chans");
        let state_dir = dir.path().join("state");
        fs::create_dir_all(&chan_dir).unwrap();
        fs::create_dir_all(&state_dir).unwrap();
        for tag in TEST_TAGS {
            fs::write(chan_dir.join(format!("{tag}.chan")), "# test allow-list\nCI.*\n").unwrap();
        }

        let ring = RingWriter::create(&ring_path, RECORD_LEN, ring_capacity).unwrap();
        let ctx = Arc::new(ExportContext {
            ring_path,
            ring_capacity,
            decoder: Arc::new(PlainBlockDecoder),
            directory: Arc::new(RestrictedSet::new(restricted.iter().copied())),
            state_dir,
            chan_dir,
            listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            future_tolerance: Duration::from_secs(600),
            drain_timeout: Duration::from_secs(2),
            runtime: tokio::runtime::Handle::current(),
            incarnation: Uuid::new_v4(),
        });

        Self {
            dir,
            ring: Mutex::new(ring),
            ctx,
        }
    }

    // ---

    pub fn ctx(&self) -> Arc<ExportContext> {
        Arc::clone(&self.ctx)
    }

    pub fn ring_path(&self) -> &Path {
        &self.ctx.ring_path
    }

    pub fn state_dir(&self) -> &Path {
        &self.ctx.state_dir
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Write `record` to the ring; returns it with its sequence.
    pub fn append(&self, record: DecodedRecord) -> (DecodedRecord, u32) {
        let seq = self.append_raw(&encode_plain_block(&record));
        (record, seq)
    }

    pub fn append_raw(&self, payload: &[u8]) -> u32 {
        self.ring.lock().unwrap().append(payload).unwrap()
    }

    // ---

    pub fn active_session(&self, tag: &str, peer: SocketAddr, options: &str) -> Arc<Session> {
        // ---
        let line = format!("{tag}:{}/{}:{options}", peer.ip(), peer.port());
        Session::start(Destination::parse(&line).unwrap().unwrap(), self.ctx())
    }

    pub fn passive_session(&self, tag: &str, port: u16, options: &str) -> Arc<Session> {
        // ---
        let line = format!("{tag}:127.0.0.1/{port}:-passive {options}");
        Session::start(Destination::parse(&line).unwrap().unwrap(), self.ctx())
    }
}
