//! TRACEBUF2 waveform payload.
//!
//! ```text
//! offset  size  field
//!      0     4  pinno       (i32)
//!      4     4  nsamp       (i32)
//!      8     8  starttime   (f64, epoch seconds of first sample)
//!     16     8  endtime     (f64, epoch seconds of last sample)
//!     24     8  samprate    (f64)
//!     32     7  sta         (NUL padded)
//!     39     9  net
//!     48     4  chan
//!     52     3  loc         ("--" when blank)
//!     55     2  version     ("20")
//!     57     3  datatype    ("s4" = big-endian i32)
//!     60     2  quality
//!     62     2  pad
//!     64   4*n  samples
//! ```

use super::channel::ChannelCode;
use super::error::{Result, WaveLinkError};
use super::unit::OutputUnit;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const TRACEBUF_HEADER_LEN: usize = 64;

/// Largest TRACEBUF2 message, header included.
pub const MAX_TRACEBUF_LEN: usize = 4096;

const DATATYPE: &[u8; 2] = b"s4";
const BLANK_LOCATION: &str = "--";

// ---------------------------------------------------------------------------
// encode
// ---------------------------------------------------------------------------

fn put_text(dst: &mut [u8], text: &str) {
    // Last byte of each field stays NUL.
    let room = dst.len() - 1;
    for (slot, byte) in dst[..room].iter_mut().zip(text.bytes()) {
        *slot = byte;
    }
}

/// Serialise `unit` as a TRACEBUF2 message.
pub fn encode(unit: &OutputUnit) -> Vec<u8> {
    // ---
    let nsamp = unit.nsamp();
    let mut out = vec![0u8; TRACEBUF_HEADER_LEN + 4 * nsamp];

    let start_s = unit.start_ms as f64 / 1000.0;
    let last_s = if unit.rate > 0.0 && nsamp > 0 {
        start_s + (nsamp - 1) as f64 / unit.rate
    } else {
        start_s
    };

    out[0..4].copy_from_slice(&0i32.to_be_bytes());
    out[4..8].copy_from_slice(&(nsamp as i32).to_be_bytes());
    out[8..16].copy_from_slice(&start_s.to_be_bytes());
    out[16..24].copy_from_slice(&last_s.to_be_bytes());
    out[24..32].copy_from_slice(&unit.rate.to_be_bytes());

    let location = match unit.channel.location() {
        "" => BLANK_LOCATION,
        loc => loc,
    };
    put_text(&mut out[32..39], unit.channel.station());
    put_text(&mut out[39..48], unit.channel.network());
    put_text(&mut out[48..52], unit.channel.channel());
    put_text(&mut out[52..55], location);
    out[55..57].copy_from_slice(b"20");
    out[57..59].copy_from_slice(DATATYPE);

    for (dst, sample) in out[TRACEBUF_HEADER_LEN..]
        .chunks_exact_mut(4)
        .zip(&unit.samples)
    {
        dst.copy_from_slice(&sample.to_be_bytes());
    }
    out
}

// ---------------------------------------------------------------------------
// decode
// ---------------------------------------------------------------------------

fn get_text(src: &[u8]) -> &str {
    // ---
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    std::str::from_utf8(&src[..end]).unwrap_or("").trim()
}

fn be_f64(src: &[u8]) -> f64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&src[..8]);
    f64::from_be_bytes(raw)
}

fn be_i32(src: &[u8]) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&src[..4]);
    i32::from_be_bytes(raw)
}

/// Parse a TRACEBUF2 message back into a unit (sequence number 0).
///
/// Only the big-endian `s4` data type is accepted.
pub fn decode(bytes: &[u8]) -> Result<OutputUnit> {
    // ---
    if bytes.len() < TRACEBUF_HEADER_LEN {
        return Err(WaveLinkError::Decode(format!(
            "tracebuf too short: {} bytes",
            bytes.len()
        )));
    }

    let nsamp = be_i32(&bytes[4..8]);
    if nsamp < 0 || bytes.len() != TRACEBUF_HEADER_LEN + 4 * nsamp as usize {
        return Err(WaveLinkError::Decode(format!(
            "tracebuf nsamp {nsamp} does not match length {}",
            bytes.len()
        )));
    }
    if &bytes[57..59] != DATATYPE {
        return Err(WaveLinkError::Decode("tracebuf datatype is not s4".into()));
    }

    let location = match get_text(&bytes[52..55]) {
        BLANK_LOCATION => "",
        loc => loc,
    };
    let channel = ChannelCode::from_parts(
        get_text(&bytes[39..48]),
        get_text(&bytes[32..39]),
        get_text(&bytes[48..52]),
        location,
    );

    let samples = bytes[TRACEBUF_HEADER_LEN..]
        .chunks_exact(4)
        .map(be_i32)
        .collect();

    Ok(OutputUnit {
        channel,
        start_ms: (be_f64(&bytes[8..16]) * 1000.0).round() as i64,
        rate: be_f64(&bytes[24..32]),
        samples,
        seq: 0,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
