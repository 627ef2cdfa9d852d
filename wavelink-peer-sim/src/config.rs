use std::time::Duration;

// ---------------------------------------------------------------------------
// PeerSimConfig
// ---------------------------------------------------------------------------

/// Behaviour of the simulated destination.
///
/// All fields default to a well-behaved receiver: heartbeats every second,
/// no acks, never drops the link.
#[derive(Debug, Clone)]
pub struct PeerSimConfig {
    // ---
    /// Institution code on heartbeats we send.
    pub inst: u16,

    /// Module code on heartbeats we send.
    pub module: u16,

    /// Text of the heartbeat we send.
    pub heartbeat_text: String,

    /// How often we send a heartbeat.  `None` = never (a silent peer).
    pub heartbeat_interval: Option<Duration>,

    /// Reply `ACK:nnn` to every sequenced frame.
    pub ack: bool,

    /// Close the first connection after this many data frames.
    pub drop_after_frames: Option<usize>,

    /// Stop acking after this many data frames on the first connection, so
    /// the sender is left with unacknowledged frames when the link drops.
    pub ack_limit: Option<usize>,
}

// ---

impl Default for PeerSimConfig {
    fn default() -> Self {
        // ---
        Self {
            inst: 13,
            module: 99,
            heartbeat_text: "alive".into(),
            heartbeat_interval: Some(Duration::from_secs(1)),
            ack: false,
            drop_after_frames: None,
            ack_limit: None,
        }
    }
}

// ---

impl PeerSimConfig {
    // ---
    /// Well-behaved receiver.
    pub fn perfect() -> Self {
        Self::default()
    }

    // ---

    /// Receiver that acknowledges every sequenced frame.
    pub fn acking() -> Self {
        // ---
        Self {
            ack: true,
            ..Default::default()
        }
    }

    // ---

    /// Receiver that hangs up after `frames` data frames, then accepts the
    /// sender's reconnect normally.
    pub fn flaky(frames: usize) -> Self {
        // ---
        Self {
            drop_after_frames: Some(frames),
            ..Default::default()
        }
    }

    // ---

    /// Receiver that never sends a heartbeat.
    pub fn silent() -> Self {
        // ---
        Self {
            heartbeat_interval: None,
            ..Default::default()
        }
    }
}
