use std::fmt;

// ---------------------------------------------------------------------------
// ChannelCode
// ---------------------------------------------------------------------------

/// Width of a channel code on disk and in memory.
pub const CHANNEL_CODE_LEN: usize = 12;

/// Fixed-width `NNSSSSSCCCLL` channel identifier.
///
/// Network (2), station (5), channel (3), location (2), each left-aligned
/// and space padded.  Text shorter than 12 bytes is padded; longer text is
/// truncated, so two spellings of the same code always compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelCode([u8; CHANNEL_CODE_LEN]);

// ---

impl ChannelCode {
    // ---
    pub fn new(text: &str) -> Self {
        // ---
        let mut code = [b' '; CHANNEL_CODE_LEN];
        for (slot, byte) in code.iter_mut().zip(text.bytes()) {
            *slot = if byte.is_ascii_graphic() { byte } else { b' ' };
        }
        Self(code)
    }

    // ---

    /// Build a code from its four components.
    pub fn from_parts(network: &str, station: &str, channel: &str, location: &str) -> Self {
        // ---
        let mut code = [b' '; CHANNEL_CODE_LEN];
        put_field(&mut code[0..2], network);
        put_field(&mut code[2..7], station);
        put_field(&mut code[7..10], channel);
        put_field(&mut code[10..12], location);
        Self(code)
    }

    // ---

    pub fn from_bytes(bytes: [u8; CHANNEL_CODE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHANNEL_CODE_LEN] {
        &self.0
    }

    pub fn network(&self) -> &str {
        self.field(0..2)
    }

    pub fn station(&self) -> &str {
        self.field(2..7)
    }

    pub fn channel(&self) -> &str {
        self.field(7..10)
    }

    pub fn location(&self) -> &str {
        self.field(10..12)
    }

    /// Full 12-character code including padding.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    // ---

    fn field(&self, range: std::ops::Range<usize>) -> &str {
        std::str::from_utf8(&self.0[range]).unwrap_or("").trim_end()
    }
}

// ---

fn put_field(dst: &mut [u8], text: &str) {
    for (slot, byte) in dst.iter_mut().zip(text.trim().bytes()) {
        *slot = byte;
    }
}

// ---

impl fmt::Display for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for ChannelCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelCode({:?})", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn short_text_is_padded() {
        // ---
        let code = ChannelCode::new("USDUG  BHZ");
        assert_eq!(code.as_str(), "USDUG  BHZ  ");
        assert_eq!(code, ChannelCode::new("USDUG  BHZ  "));
    }

    #[test]
    fn parts_round_trip() {
        // ---
        let code = ChannelCode::from_parts("IU", "ANMO", "BHZ", "00");
        assert_eq!(code.as_str(), "IUANMO BHZ00");
        assert_eq!(code.network(), "IU");
        assert_eq!(code.station(), "ANMO");
        assert_eq!(code.channel(), "BHZ");
        assert_eq!(code.location(), "00");
    }

    #[test]
    fn long_text_is_truncated() {
        let code = ChannelCode::new("IUANMO BHZ00EXTRA");
        assert_eq!(code.as_str(), "IUANMO BHZ00");
    }
}
