use std::time::{SystemTime, UNIX_EPOCH};

// ---

use super::channel::ChannelCode;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Largest sample count carried by one [`OutputUnit`].
///
/// A TRACEBUF2 message is capped at 4096 bytes; with its 64-byte header and
/// 4-byte samples that leaves room for 1008 samples.
pub const MAX_SAMPLES_PER_UNIT: usize = 1008;

// ---------------------------------------------------------------------------
// Time helpers
// ---------------------------------------------------------------------------

/// Wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    // ---
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Duration of `nsamp` samples at `rate` Hz, rounded to whole milliseconds.
///
/// All span arithmetic goes through this one function so split units and
/// the order tracker agree on rounding.  Spans too long for an `i64`
/// saturate at `i64::MAX`.
pub fn span_ms(nsamp: usize, rate: f64) -> i64 {
    // ---
    if rate.is_nan() || rate <= 0.0 {
        return 0;
    }
    let span = (nsamp as f64 * 1000.0 / rate).round();
    if span >= i64::MAX as f64 {
        i64::MAX
    } else {
        span as i64
    }
}

/// One sample period in milliseconds (at least 1).
pub fn period_ms(rate: f64) -> i64 {
    span_ms(1, rate).max(1)
}

// ---------------------------------------------------------------------------
// Sequence helpers
// ---------------------------------------------------------------------------

/// Number of records from `from` (exclusive) up to `to` (inclusive), with
/// 32-bit wrap-around.
pub fn seq_gap(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from)
}

// ---------------------------------------------------------------------------
// DecodedRecord
// ---------------------------------------------------------------------------

/// One record as produced by the external time-series decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    // ---
    pub channel: ChannelCode,

    /// Time of the first sample, epoch milliseconds.
    pub start_ms: i64,

    /// Samples per second.
    pub rate: f64,

    pub samples: Vec<i32>,
}

// ---

impl DecodedRecord {
    // ---
    /// Time just past the last sample.
    pub fn end_ms(&self) -> i64 {
        self.start_ms.saturating_add(span_ms(self.samples.len(), self.rate))
    }

    // ---

    /// Re-chunk into [`OutputUnit`]s of at most [`MAX_SAMPLES_PER_UNIT`]
    /// samples with contiguous start times.
    pub fn split(&self, seq: u32) -> Vec<OutputUnit> {
        // ---
        self.samples
            .chunks(MAX_SAMPLES_PER_UNIT)
            .enumerate()
            .map(|(i, chunk)| OutputUnit {
                channel: self.channel,
                start_ms: self
                    .start_ms
                    .saturating_add(span_ms(i * MAX_SAMPLES_PER_UNIT, self.rate)),
                rate: self.rate,
                samples: chunk.to_vec(),
                seq,
            })
            .collect()
    }

    /// Number of units [`split`](Self::split) would produce.
    pub fn unit_count(&self) -> usize {
        self.samples.len().div_ceil(MAX_SAMPLES_PER_UNIT)
    }
}

// ---------------------------------------------------------------------------
// OutputUnit
// ---------------------------------------------------------------------------

/// One channel's contiguous span of samples for a single transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputUnit {
    // ---
    pub channel: ChannelCode,

    /// Time of the first sample, epoch milliseconds.
    pub start_ms: i64,

    /// Samples per second.
    pub rate: f64,

    /// At most [`MAX_SAMPLES_PER_UNIT`] values.
    pub samples: Vec<i32>,

    /// Ring sequence number of the record this unit was cut from.
    pub seq: u32,
}

// ---

impl OutputUnit {
    // ---
    pub fn nsamp(&self) -> usize {
        self.samples.len()
    }

    /// Time just past the last sample.
    pub fn end_ms(&self) -> i64 {
        self.start_ms.saturating_add(span_ms(self.samples.len(), self.rate))
    }

    /// Overwrite `self` with `other`, reusing the sample allocation.
    pub fn assign_from(&mut self, other: &OutputUnit) {
        // ---
        self.channel = other.channel;
        self.start_ms = other.start_ms;
        self.rate = other.rate;
        self.seq = other.seq;
        self.samples.clear();
        self.samples.extend_from_slice(&other.samples);
    }
}

// ---

impl Default for OutputUnit {
    fn default() -> Self {
        // ---
        Self {
            channel: ChannelCode::new(""),
            start_ms: 0,
            rate: 0.0,
            samples: Vec::new(),
            seq: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
