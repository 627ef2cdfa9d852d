//! Per-session counters and the monitoring snapshot.
//!
//! Every logged drop, gap or protocol anomaly also bumps one of these
//! counters, so the monitor file tells the same story as the log.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// ---

use serde::Serialize;
use uuid::Uuid;

// ---

use super::SessionPhase;

// ---------------------------------------------------------------------------
// SessionStats
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct SessionStats {
    // ---
    pub bytes_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub units_sent: AtomicU64,
    pub heartbeats_in: AtomicU64,
    pub heartbeats_out: AtomicU64,
    pub acks_in: AtomicU64,

    /// Live records dropped because the queue was full.
    pub dropped_live: AtomicU64,

    /// Units older than data already sent on their channel.
    pub stale: AtomicU64,

    /// Units ending implausibly far in the future.
    pub future: AtomicU64,

    /// Records refused by the allow-list or the restricted policy.
    pub filtered: AtomicU64,

    /// Records older than the destination's max age.
    pub too_old: AtomicU64,

    pub decode_errors: AtomicU64,

    /// Ring sequences skipped without delivery.
    pub gaps: AtomicU64,

    /// Inbound framing resynchronisations.
    pub resyncs: AtomicU64,

    pub reconnects: AtomicU64,
    pub rollbacks: AtomicU64,

    /// Data latency of the last unit written, ms.  -1 until the first write.
    pub latency_ms: AtomicI64,

    /// Throttle cap in force, bits per second.
    pub effective_bps: AtomicU64,
}

// ---

impl SessionStats {
    // ---
    pub fn new(nominal_bps: u64) -> Self {
        // ---
        let stats = Self::default();
        stats.latency_ms.store(-1, Ordering::Relaxed);
        stats.effective_bps.store(nominal_bps, Ordering::Relaxed);
        stats
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    // ---

    pub fn counters(&self) -> Counters {
        // ---
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Counters {
            bytes_out: get(&self.bytes_out),
            bytes_in: get(&self.bytes_in),
            units_sent: get(&self.units_sent),
            heartbeats_in: get(&self.heartbeats_in),
            heartbeats_out: get(&self.heartbeats_out),
            acks_in: get(&self.acks_in),
            dropped_live: get(&self.dropped_live),
            stale: get(&self.stale),
            future: get(&self.future),
            filtered: get(&self.filtered),
            too_old: get(&self.too_old),
            decode_errors: get(&self.decode_errors),
            gaps: get(&self.gaps),
            resyncs: get(&self.resyncs),
            reconnects: get(&self.reconnects),
            rollbacks: get(&self.rollbacks),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    // ---
    pub bytes_out: u64,
    pub bytes_in: u64,
    pub units_sent: u64,
    pub heartbeats_in: u64,
    pub heartbeats_out: u64,
    pub acks_in: u64,
    pub dropped_live: u64,
    pub stale: u64,
    pub future: u64,
    pub filtered: u64,
    pub too_old: u64,
    pub decode_errors: u64,
    pub gaps: u64,
    pub resyncs: u64,
    pub reconnects: u64,
    pub rollbacks: u64,
}

// ---

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    // ---
    pub tag: String,
    pub phase: SessionPhase,
    pub queue_used: usize,
    pub queue_capacity: usize,
    pub processed_seq: Option<u32>,
    pub known_seq: Option<u32>,
    pub latency_ms: Option<i64>,
    pub effective_bps: u64,

    #[serde(flatten)]
    pub counters: Counters,
}

// ---

impl StatsSnapshot {
    // ---
    /// One-line operator summary.
    pub fn status_line(&self) -> String {
        // ---
        let latency = match self.latency_ms {
            Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
            None => "-".to_string(),
        };
        format!(
            "{} {:?} queue {}/{} out {}B in {}B units {} latency {} throttle {}bps \
             dropped {} gaps {} stale {} future {} reconnects {}",
            self.tag,
            self.phase,
            self.queue_used,
            self.queue_capacity.saturating_sub(1),
            self.counters.bytes_out,
            self.counters.bytes_in,
            self.counters.units_sent,
            latency,
            self.effective_bps,
            self.counters.dropped_live,
            self.counters.gaps,
            self.counters.stale,
            self.counters.future,
            self.counters.reconnects,
        )
    }
}

// ---

/// Whole-process snapshot written to the monitor file.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    // ---
    /// Identifies this process run; changes on every restart.
    pub incarnation: Uuid,
    pub generated_at_ms: i64,

    /// Inbound connections refused because no passive destination matched.
    pub unmatched_inbound: u64,

    pub sessions: Vec<StatsSnapshot>,
}

// ---

impl MonitorSnapshot {
    // ---
    /// Replace `path` with this snapshot as JSON (temp file + rename).
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        // ---
        let json = serde_json::to_vec_pretty(self)?;
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        let tmp = path.with_file_name(name);

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.write_all(b"\n")?;
        drop(file);
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn snapshot(stats: &SessionStats) -> StatsSnapshot {
        // ---
        StatsSnapshot {
            tag: "ew1".into(),
            phase: SessionPhase::RealTime,
            queue_used: 3,
            queue_capacity: 1000,
            processed_seq: Some(41),
            known_seq: Some(42),
            latency_ms: Some(2500),
            effective_bps: stats.effective_bps.load(Ordering::Relaxed),
            counters: stats.counters(),
        }
    }

    #[test]
    fn counters_reflect_bumps() {
        // ---
        let stats = SessionStats::new(100_000);
        SessionStats::bump(&stats.dropped_live);
        SessionStats::bump(&stats.dropped_live);
        SessionStats::add(&stats.bytes_out, 512);

        let c = stats.counters();
        assert_eq!(c.dropped_live, 2);
        assert_eq!(c.bytes_out, 512);
        assert_eq!(stats.latency_ms.load(Ordering::Relaxed), -1);
    }

    #[test]
    fn status_line_names_the_essentials() {
        // ---
        let line = snapshot(&SessionStats::new(100_000)).status_line();
        assert!(line.starts_with("ew1 RealTime queue 3/999"), "{line}");
        assert!(line.contains("latency 2.5s"), "{line}");
        assert!(line.contains("throttle 100000bps"), "{line}");
    }

    #[test]
    fn monitor_file_is_json() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        let snap = MonitorSnapshot {
            incarnation: Uuid::new_v4(),
            generated_at_ms: 1,
            unmatched_inbound: 2,
            sessions: vec![snapshot(&SessionStats::new(100_000))],
        };
        snap.write_to(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(value["sessions"][0]["tag"], "ew1");
        assert_eq!(value["sessions"][0]["phase"], "real_time");
        assert_eq!(value["sessions"][0]["dropped_live"], 0);
        assert_eq!(value["unmatched_inbound"], 2);
    }
}
