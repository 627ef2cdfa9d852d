use std::collections::HashMap;

// ---

use super::channel::ChannelCode;
use super::unit::{period_ms, OutputUnit};

// ---------------------------------------------------------------------------
// ChannelTrack
// ---------------------------------------------------------------------------

/// Last committed transmission for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTrack {
    // ---
    /// End time (just past the last sample) of the last unit sent.
    pub last_end_ms: i64,

    /// Ring sequence of the last unit sent.
    pub last_seq: u32,
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    // ---
    /// In order; safe to transmit.
    Accept,

    /// Starts more than one sample period before data already sent.
    Stale,

    /// Would push the channel's tracker implausibly far past wall-clock now.
    Future,
}

// ---------------------------------------------------------------------------
// OrderGuard
// ---------------------------------------------------------------------------

/// Per-channel time tracker enforcing strictly forward delivery.
///
/// Entries are created on the first commit for a channel and only ever
/// advanced by commits.  The destination's allow-list is applied by the
/// caller before a unit reaches the guard.
#[derive(Debug, Clone)]
pub struct OrderGuard {
    // ---
    tracks: HashMap<ChannelCode, ChannelTrack>,

    /// How far past `now` a committed end time may land before the unit is
    /// treated as corrupt.
    future_tolerance_ms: i64,
}

// ---

impl OrderGuard {
    // ---
    pub fn new(future_tolerance_ms: i64) -> Self {
        // ---
        Self {
            tracks: HashMap::new(),
            future_tolerance_ms,
        }
    }

    // ---

    /// Classify `unit` against the channel's tracker.
    ///
    /// With `commit` set, a unit ending beyond `now_ms + tolerance` is
    /// `Future`, and an accepted unit advances the tracker.
    pub fn check(&mut self, unit: &OutputUnit, commit: bool, now_ms: i64) -> Verdict {
        // ---
        let track = self.tracks.get(&unit.channel).copied();

        if let Some(track) = track {
            if unit.start_ms < track.last_end_ms.saturating_sub(period_ms(unit.rate)) {
                return Verdict::Stale;
            }
        }

        if !commit {
            return Verdict::Accept;
        }

        let end = unit.end_ms();
        if end > now_ms.saturating_add(self.future_tolerance_ms) {
            return Verdict::Future;
        }

        let last_end_ms = track.map_or(end, |t| t.last_end_ms.max(end));
        self.tracks.insert(
            unit.channel,
            ChannelTrack {
                last_end_ms,
                last_seq: unit.seq,
            },
        );
        Verdict::Accept
    }

    // ---

    pub fn track(&self, channel: &ChannelCode) -> Option<ChannelTrack> {
        self.tracks.get(channel).copied()
    }

    /// Put back a tracker state captured before a commit.
    ///
    /// `None` removes the entry, returning the channel to "never sent".
    pub fn restore(&mut self, channel: ChannelCode, previous: Option<ChannelTrack>) {
        // ---
        match previous {
            Some(track) => {
                self.tracks.insert(channel, track);
            }
            None => {
                self.tracks.remove(&channel);
            }
        }
    }

    /// Seed an entry loaded from persisted state.
    pub fn insert(&mut self, channel: ChannelCode, track: ChannelTrack) {
        self.tracks.insert(channel, track);
    }

    /// Drop every entry for which `keep` returns `false`; returns how many
    /// were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&ChannelCode) -> bool,
    {
        // ---
        let before = self.tracks.len();
        self.tracks.retain(|ch, _| keep(ch));
        before - self.tracks.len()
    }

    /// Snapshot of every entry, sorted by channel for stable output.
    pub fn entries(&self) -> Vec<(ChannelCode, ChannelTrack)> {
        // ---
        let mut out: Vec<_> = self.tracks.iter().map(|(c, t)| (*c, *t)).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn future_tolerance_ms(&self) -> i64 {
        self.future_tolerance_ms
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    fn unit(start_ms: i64, nsamp: usize, seq: u32) -> OutputUnit {
        OutputUnit {
            channel: ChannelCode::new("IUANMO BHZ00"),
            start_ms,
            rate: 40.0,
            samples: vec![0; nsamp],
            seq,
        }
    }

    fn guard_at(last_end_ms: i64) -> OrderGuard {
        let mut guard = OrderGuard::new(600_000);
        guard.insert(
            ChannelCode::new("IUANMO BHZ00"),
            ChannelTrack {
                last_end_ms,
                last_seq: 1,
            },
        );
        guard
    }

    // ---

    #[test]
    fn two_periods_early_is_stale() {
        // ---
        let t = NOW - 60_000;
        let mut guard = guard_at(t);
        assert_eq!(guard.check(&unit(t - 50, 40, 2), true, NOW), Verdict::Stale);
        assert_eq!(guard.track(&ChannelCode::new("IUANMO BHZ00")).unwrap().last_end_ms, t);
    }

    #[test]
    fn contiguous_unit_is_accepted_and_advances() {
        // ---
        let t = NOW - 60_000;
        let mut guard = guard_at(t);
        assert_eq!(guard.check(&unit(t, 40, 2), true, NOW), Verdict::Accept);
        let track = guard.track(&ChannelCode::new("IUANMO BHZ00")).unwrap();
        assert_eq!(track.last_end_ms, t + 1_000);
        assert_eq!(track.last_seq, 2);
    }

    #[test]
    fn one_period_overlap_is_tolerated() {
        let t = NOW - 60_000;
        let mut guard = guard_at(t);
        assert_eq!(guard.check(&unit(t - 25, 40, 2), false, NOW), Verdict::Accept);
    }

    #[test]
    fn check_without_commit_leaves_tracker() {
        // ---
        let t = NOW - 60_000;
        let mut guard = guard_at(t);
        assert_eq!(guard.check(&unit(t, 40, 2), false, NOW), Verdict::Accept);
        assert_eq!(guard.track(&ChannelCode::new("IUANMO BHZ00")).unwrap().last_end_ms, t);
    }

    #[test]
    fn far_future_is_flagged_on_commit() {
        // ---
        let mut guard = OrderGuard::new(600_000);
        let late = unit(NOW + 3_600_000, 40, 9);
        assert_eq!(guard.check(&late, false, NOW), Verdict::Accept);
        assert_eq!(guard.check(&late, true, NOW), Verdict::Future);
        assert!(guard.is_empty());
    }

    #[test]
    fn overflowing_end_time_is_future() {
        // ---
        let mut guard = OrderGuard::new(600_000);
        let mut slow = unit(NOW - 10_000, 100, 3);
        slow.rate = 1e-300;
        assert_eq!(slow.end_ms(), i64::MAX);
        assert_eq!(guard.check(&slow, true, NOW), Verdict::Future);

        let late = unit(i64::MAX - 10, 40, 4);
        assert_eq!(guard.check(&late, true, NOW), Verdict::Future);
        assert!(guard.is_empty());
    }

    #[test]
    fn first_unit_creates_entry() {
        // ---
        let mut guard = OrderGuard::new(600_000);
        assert_eq!(guard.check(&unit(NOW - 10_000, 400, 5), true, NOW), Verdict::Accept);
        assert_eq!(guard.len(), 1);
    }

    #[test]
    fn restore_undoes_commit() {
        // ---
        let t = NOW - 60_000;
        let mut guard = guard_at(t);
        let ch = ChannelCode::new("IUANMO BHZ00");
        let before = guard.track(&ch);
        guard.check(&unit(t, 40, 2), true, NOW);
        guard.restore(ch, before);
        assert_eq!(guard.track(&ch), before);

        guard.restore(ch, None);
        assert!(guard.is_empty());
    }

    #[test]
    fn retain_drops_unlisted_channels() {
        // ---
        let mut guard = guard_at(NOW);
        guard.insert(
            ChannelCode::new("IUANMO BHN00"),
            ChannelTrack {
                last_end_ms: NOW,
                last_seq: 1,
            },
        );
        let dropped = guard.retain(|c| c.channel() == "BHZ");
        assert_eq!(dropped, 1);
        assert_eq!(guard.entries().len(), 1);
    }
}
