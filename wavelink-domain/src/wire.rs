//! Wire framing for the export protocol.
//!
//! Every message travels in one frame over a plain TCP stream:
//!
//! ```text
//! +-----+------+------+------+-----------+------------------+-----+
//! | STX | inst | mod  | type | [SQ:nnn]  | escaped payload  | ETX |
//! | 02  | 3 dg | 3 dg | 3 dg | ack mode  | variable         | 03  |
//! +-----+------+------+------+-----------+------------------+-----+
//! ```
//!
//! Inside the payload every `STX`, `ETX` or `ESC` byte is preceded by an
//! extra `ESC`.  Acknowledgements from the receiver are bare frames
//! `STX "ACK:" nnn ETX` echoing the rolling sequence.
//!
//! [`FrameDecoder`] is incremental: feed it whatever the socket returned and
//! collect complete frames.  Bytes outside a frame are discarded up to the
//! next `STX`; each discard episode counts as one resync.

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const ESC: u8 = 0x1B;

/// Message type carried by heartbeat frames.
pub const TYPE_HEARTBEAT: u16 = 3;

/// Message type carried by waveform frames.
pub const TYPE_TRACEBUF2: u16 = 19;

/// Rolling ack sequence runs `0 .. ACK_MODULUS`.
pub const ACK_MODULUS: u16 = 250;

/// Frames whose unescaped body exceeds this are treated as garbage.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const ACK_PREFIX: &[u8] = b"ACK:";
const SEQ_PREFIX: &[u8] = b"SQ:";
const LOGO_LEN: usize = 9;

// ---------------------------------------------------------------------------
// Logo
// ---------------------------------------------------------------------------

/// Institution / module / message-type triple written ahead of each payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Logo {
    // ---
    pub inst: u16,
    pub module: u16,
    pub msg_type: u16,
}

// ---

impl Logo {
    // ---
    pub fn new(inst: u16, module: u16, msg_type: u16) -> Self {
        Self {
            inst,
            module,
            msg_type,
        }
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        // ---
        for value in [self.inst, self.module, self.msg_type] {
            out.extend_from_slice(format!("{:03}", value % 1000).as_bytes());
        }
    }
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

fn needs_escape(byte: u8) -> bool {
    matches!(byte, STX | ETX | ESC)
}

/// Append `payload` to `out`, escaping framing bytes.
pub fn escape_into(payload: &[u8], out: &mut Vec<u8>) {
    // ---
    for &byte in payload {
        if needs_escape(byte) {
            out.push(ESC);
        }
        out.push(byte);
    }
}

pub fn escape(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 16);
    escape_into(payload, &mut out);
    out
}

/// Reverse [`escape`].  A dangling trailing `ESC` is dropped.
pub fn unescape(bytes: &[u8]) -> Vec<u8> {
    // ---
    let mut out = Vec::with_capacity(bytes.len());
    let mut escaped = false;
    for &byte in bytes {
        if escaped {
            out.push(byte);
            escaped = false;
        } else if byte == ESC {
            escaped = true;
        } else {
            out.push(byte);
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Build one complete frame.
///
/// `ack_seq` is `Some` only for destinations running in ack mode.
pub fn encode_frame(logo: Logo, ack_seq: Option<u16>, payload: &[u8]) -> Vec<u8> {
    // ---
    let mut out = Vec::with_capacity(payload.len() + payload.len() / 16 + 20);
    out.push(STX);
    logo.write_into(&mut out);
    if let Some(seq) = ack_seq {
        out.extend_from_slice(SEQ_PREFIX);
        out.extend_from_slice(format!("{:03}", seq % ACK_MODULUS).as_bytes());
    }
    escape_into(payload, &mut out);
    out.push(ETX);
    out
}

/// Build the acknowledgement a receiver returns for `seq`.
pub fn encode_ack(seq: u16) -> Vec<u8> {
    // ---
    let mut out = Vec::with_capacity(9);
    out.push(STX);
    out.extend_from_slice(ACK_PREFIX);
    out.extend_from_slice(format!("{:03}", seq % ACK_MODULUS).as_bytes());
    out.push(ETX);
    out
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    // ---
    /// Data or heartbeat message; `payload` is already unescaped.
    Message {
        logo: Logo,
        ack_seq: Option<u16>,
        payload: Vec<u8>,
    },

    /// Receiver acknowledgement of a rolling sequence.
    Ack(u16),
}

// ---

fn parse_digits(bytes: &[u8]) -> Option<u16> {
    // ---
    if bytes.is_empty() || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// `ack_mode` decides whether a leading `SQ:nnn` is a rolling sequence or
/// part of the payload.
fn parse_body(body: &[u8], ack_mode: bool) -> Option<Frame> {
    // ---
    if let Some(rest) = body.strip_prefix(ACK_PREFIX) {
        return parse_digits(rest).map(Frame::Ack);
    }

    if body.len() < LOGO_LEN {
        return None;
    }
    let logo = Logo {
        inst: parse_digits(&body[0..3])?,
        module: parse_digits(&body[3..6])?,
        msg_type: parse_digits(&body[6..9])?,
    };

    let rest = &body[LOGO_LEN..];
    let tagged = if ack_mode { rest.strip_prefix(SEQ_PREFIX) } else { None };
    let (ack_seq, payload) = match tagged {
        Some(tail) if tail.len() >= 3 => match parse_digits(&tail[..3]) {
            Some(seq) => (Some(seq), &tail[3..]),
            None => (None, rest),
        },
        _ => (None, rest),
    };

    Some(Frame::Message {
        logo,
        ack_seq,
        payload: payload.to_vec(),
    })
}

// ---------------------------------------------------------------------------
// FrameDecoder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Hunting,
    Body,
    Escaped,
}

/// Incremental frame parser with resynchronisation.
#[derive(Debug)]
pub struct FrameDecoder {
    // ---
    state: DecodeState,
    body: Vec<u8>,

    /// Already counted the current run of junk bytes.
    discarding: bool,

    /// Peer was configured for acknowledged delivery.
    ack_mode: bool,

    resyncs: u64,
}

// ---

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            state: DecodeState::Hunting,
            body: Vec::new(),
            discarding: false,
            ack_mode: false,
            resyncs: 0,
        }
    }

    /// Treat a leading `SQ:nnn` on messages as the rolling ack sequence.
    pub fn with_ack_mode(mut self, ack_mode: bool) -> Self {
        self.ack_mode = ack_mode;
        self
    }

    /// Number of times the decoder had to throw bytes away to find a frame.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    // ---

    fn resync(&mut self) {
        // ---
        self.resyncs += 1;
        tracing::debug!(resyncs = self.resyncs, "frame decoder: resync");
    }

    // ---

    /// Consume `bytes`, appending every completed frame to `out`.
    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<Frame>) {
        // ---
        for &byte in bytes {
            match self.state {
                DecodeState::Hunting => {
                    if byte == STX {
                        self.body.clear();
                        self.discarding = false;
                        self.state = DecodeState::Body;
                    } else if !self.discarding {
                        self.discarding = true;
                        self.resync();
                    }
                }

                DecodeState::Body => match byte {
                    STX => {
                        // Unescaped STX: the previous frame was cut short.
                        self.resync();
                        self.body.clear();
                    }
                    ETX => {
                        match parse_body(&self.body, self.ack_mode) {
                            Some(frame) => out.push(frame),
                            None => self.resync(),
                        }
                        self.body.clear();
                        self.state = DecodeState::Hunting;
                    }
                    ESC => self.state = DecodeState::Escaped,
                    _ => self.push_body(byte),
                },

                DecodeState::Escaped => {
                    self.state = DecodeState::Body;
                    self.push_body(byte);
                }
            }
        }
    }

    // ---

    fn push_body(&mut self, byte: u8) {
        // ---
        if self.body.len() >= MAX_FRAME_LEN {
            self.resync();
            self.body.clear();
            self.discarding = true;
            self.state = DecodeState::Hunting;
            return;
        }
        self.body.push(byte);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn decode_all(bytes: &[u8]) -> (Vec<Frame>, u64) {
        let mut decoder = FrameDecoder::new().with_ack_mode(true);
        let mut frames = Vec::new();
        decoder.push(bytes, &mut frames);
        (frames, decoder.resyncs())
    }

    // ---

    #[test]
    fn escape_round_trip_with_framing_bytes() {
        // ---
        let payload = vec![0x00, STX, 0x41, ETX, ESC, ESC, 0xFF, STX];
        let escaped = escape(&payload);
        assert!(escaped.len() > payload.len());
        assert_eq!(unescape(&escaped), payload);
    }

    #[test]
    fn frame_layout() {
        // ---
        let frame = encode_frame(Logo::new(13, 2, TYPE_HEARTBEAT), None, b"alive");
        assert_eq!(frame, b"\x02013002003alive\x03".to_vec());

        let frame = encode_frame(Logo::new(13, 2, TYPE_TRACEBUF2), Some(7), &[ETX]);
        assert_eq!(frame, b"\x02013002019SQ:007\x1b\x03\x03".to_vec());
    }

    #[test]
    fn decoder_returns_original_payload() {
        // ---
        let payload = vec![STX, ETX, ESC, 1, 2, 3];
        let logo = Logo::new(1, 2, TYPE_TRACEBUF2);
        let (frames, resyncs) = decode_all(&encode_frame(logo, Some(249), &payload));
        assert_eq!(resyncs, 0);
        assert_eq!(
            frames,
            vec![Frame::Message {
                logo,
                ack_seq: Some(249),
                payload
            }]
        );
    }

    #[test]
    fn decoder_handles_split_input() {
        // ---
        let bytes = [
            encode_frame(Logo::new(1, 1, TYPE_HEARTBEAT), None, b"alive"),
            encode_ack(42),
        ]
        .concat();

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &bytes {
            decoder.push(std::slice::from_ref(byte), &mut frames);
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], Frame::Ack(42));
    }

    #[test]
    fn junk_before_frame_resyncs_once() {
        // ---
        let mut bytes = b"garbage bytes".to_vec();
        bytes.extend(encode_ack(3));
        let (frames, resyncs) = decode_all(&bytes);
        assert_eq!(frames, vec![Frame::Ack(3)]);
        assert_eq!(resyncs, 1);
    }

    #[test]
    fn truncated_frame_is_abandoned_at_next_stx() {
        // ---
        let mut bytes = vec![STX, b'0', b'1'];
        bytes.extend(encode_ack(5));
        let (frames, resyncs) = decode_all(&bytes);
        assert_eq!(frames, vec![Frame::Ack(5)]);
        assert_eq!(resyncs, 1);
    }

    #[test]
    fn malformed_header_is_dropped() {
        // ---
        let (frames, resyncs) = decode_all(b"\x02ABC\x03");
        assert!(frames.is_empty());
        assert_eq!(resyncs, 1);
    }

    #[test]
    fn sequence_prefix_is_payload_without_ack_mode() {
        // ---
        let logo = Logo::new(1, 2, TYPE_TRACEBUF2);
        let bytes = encode_frame(logo, None, b"SQ:123 looks like a sequence");

        let mut frames = Vec::new();
        FrameDecoder::new().push(&bytes, &mut frames);
        assert_eq!(
            frames,
            vec![Frame::Message {
                logo,
                ack_seq: None,
                payload: b"SQ:123 looks like a sequence".to_vec(),
            }]
        );
    }
}
