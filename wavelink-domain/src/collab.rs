//! Seams to the collaborators the export engine does not own: the record
//! decoder and the channel metadata directory.

use std::collections::HashSet;

// ---

use super::channel::{ChannelCode, CHANNEL_CODE_LEN};
use super::error::{Result, WaveLinkError};
use super::unit::DecodedRecord;

// ---------------------------------------------------------------------------
// RecordDecoder
// ---------------------------------------------------------------------------

/// Turns one raw ring-file record into a flat sample array.
pub trait RecordDecoder: Send + Sync {
    // ---
    fn decode(&self, raw: &[u8]) -> Result<DecodedRecord>;
}

// ---------------------------------------------------------------------------
// ChannelDirectory
// ---------------------------------------------------------------------------

/// Channel metadata lookup.  Only the restriction flag matters here.
pub trait ChannelDirectory: Send + Sync {
    // ---
    fn is_restricted(&self, channel: &ChannelCode) -> bool;
}

// ---

/// Directory backed by an explicit set of restricted codes.
#[derive(Debug, Clone, Default)]
pub struct RestrictedSet {
    // ---
    restricted: HashSet<ChannelCode>,
}

impl RestrictedSet {
    // ---
    pub fn new<I>(codes: I) -> Self
    where
        I: IntoIterator<Item = ChannelCode>,
    {
        Self {
            restricted: codes.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.restricted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.restricted.is_empty()
    }
}

impl ChannelDirectory for RestrictedSet {
    fn is_restricted(&self, channel: &ChannelCode) -> bool {
        self.restricted.contains(channel)
    }
}

// ---------------------------------------------------------------------------
// Plain block codec
// ---------------------------------------------------------------------------

/// Uncompressed record layout understood by [`PlainBlockDecoder`]:
///
/// ```text
/// "PB" | channel (12) | start ms (i64) | rate (f64) | nsamp (u32) | i32 * nsamp
/// ```
///
/// All integers big-endian.
pub const PLAIN_HEADER_LEN: usize = 2 + CHANNEL_CODE_LEN + 8 + 8 + 4;

const PLAIN_MAGIC: &[u8; 2] = b"PB";

/// Sample rates outside this range (Hz) are treated as corruption.
const RATE_RANGE: std::ops::RangeInclusive<f64> = 1e-4..=1e6;

/// Start times outside this range (epoch ms, 1970 to 2500) are treated as
/// corruption.
const START_RANGE: std::ops::RangeInclusive<i64> = 0..=16_725_225_600_000;

/// Serialise `record` in the plain block layout.
pub fn encode_plain_block(record: &DecodedRecord) -> Vec<u8> {
    // ---
    let mut out = Vec::with_capacity(PLAIN_HEADER_LEN + 4 * record.samples.len());
    out.extend_from_slice(PLAIN_MAGIC);
    out.extend_from_slice(record.channel.as_bytes());
    out.extend_from_slice(&record.start_ms.to_be_bytes());
    out.extend_from_slice(&record.rate.to_be_bytes());
    out.extend_from_slice(&(record.samples.len() as u32).to_be_bytes());
    for sample in &record.samples {
        out.extend_from_slice(&sample.to_be_bytes());
    }
    out
}

// ---

/// Decoder for [`encode_plain_block`] records.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainBlockDecoder;

impl RecordDecoder for PlainBlockDecoder {
    // ---
    fn decode(&self, raw: &[u8]) -> Result<DecodedRecord> {
        // ---
        if raw.len() < PLAIN_HEADER_LEN || &raw[0..2] != PLAIN_MAGIC {
            return Err(WaveLinkError::Decode("not a plain block".into()));
        }

        let mut code = [0u8; CHANNEL_CODE_LEN];
        code.copy_from_slice(&raw[2..14]);

        let mut i64_buf = [0u8; 8];
        i64_buf.copy_from_slice(&raw[14..22]);
        let start_ms = i64::from_be_bytes(i64_buf);

        let mut f64_buf = [0u8; 8];
        f64_buf.copy_from_slice(&raw[22..30]);
        let rate = f64::from_be_bytes(f64_buf);

        let mut u32_buf = [0u8; 4];
        u32_buf.copy_from_slice(&raw[30..34]);
        let nsamp = u32::from_be_bytes(u32_buf) as usize;

        let body = &raw[PLAIN_HEADER_LEN..];
        if body.len() < 4 * nsamp {
            return Err(WaveLinkError::Decode(format!(
                "plain block claims {nsamp} samples, has room for {}",
                body.len() / 4
            )));
        }
        if !RATE_RANGE.contains(&rate) {
            return Err(WaveLinkError::Decode(format!("bad sample rate {rate}")));
        }
        if !START_RANGE.contains(&start_ms) {
            return Err(WaveLinkError::Decode(format!("bad start time {start_ms}")));
        }

        let samples = body[..4 * nsamp]
            .chunks_exact(4)
            .map(|c| i32::from_be_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(DecodedRecord {
            channel: ChannelCode::from_bytes(code),
            start_ms,
            rate,
            samples,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
