//! CLI configuration for `wavelink-export`.
//!
//! ```text
//! wavelink-export --ring /data/ring.dat --config /etc/wavelink/export.conf \
//!     --state-dir /var/lib/wavelink --chan-dir /etc/wavelink/chans
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ---

use clap::{Parser, ValueEnum};

// ---

use wavelink_domain::{PlainBlockDecoder, RecordDecoder};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "wavelink-export", about = "Real-time waveform export node")]
pub struct Config {
    // ---
    /// Disk ring file written by the acquisition side.
    #[arg(long)]
    pub ring: PathBuf,

    /// Destination list, one `tag:host/port:options` line per destination.
    /// Re-read every `--reload-secs`.
    #[arg(long)]
    pub config: PathBuf,

    /// Directory holding `<tag>.state` resumption files.
    ///
    /// Created automatically if it does not exist.
    #[arg(long, default_value = "/var/lib/wavelink")]
    pub state_dir: PathBuf,

    /// Directory holding `<tag>.chan` channel lists, for destinations
    /// without `-chanfile`.
    #[arg(long, default_value = "/etc/wavelink/chans")]
    pub chan_dir: PathBuf,

    /// Restricted channel codes, one per line.  Without it nothing is
    /// restricted.
    #[arg(long)]
    pub restricted: Option<PathBuf>,

    /// Record decoder for the ring file.
    #[arg(long, value_enum, default_value_t = DecoderKind::Plain)]
    pub decoder: DecoderKind,

    /// Address passive destinations' listeners bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_addr: IpAddr,

    /// Destination list and channel list reload interval.
    #[arg(long, default_value_t = 30)]
    pub reload_secs: u64,

    /// Resumption state persist interval.
    #[arg(long, default_value_t = 60)]
    pub persist_secs: u64,

    /// Status line interval.
    #[arg(long, default_value_t = 300)]
    pub status_secs: u64,

    /// JSON counters snapshot, rewritten every `--status-secs`.
    #[arg(long)]
    pub monitor_file: Option<PathBuf>,

    /// How far past wall-clock now a unit may end before it is treated as
    /// corrupt.
    #[arg(long, default_value_t = 600)]
    pub future_tolerance_secs: u64,

    /// How long a terminating session keeps sending queued data.
    #[arg(long, default_value_t = 5)]
    pub drain_secs: u64,

    /// Ring file poll interval, milliseconds.
    #[arg(long, default_value_t = 100)]
    pub poll_ms: u64,
}

// ---

impl Config {
    // ---
    pub fn reload_every(&self) -> Duration {
        Duration::from_secs(self.reload_secs.max(1))
    }

    pub fn persist_every(&self) -> Duration {
        Duration::from_secs(self.persist_secs.max(1))
    }

    pub fn status_every(&self) -> Duration {
        Duration::from_secs(self.status_secs.max(1))
    }

    pub fn poll_every(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

// ---------------------------------------------------------------------------
// DecoderKind
// ---------------------------------------------------------------------------

/// Registry of record decoders, resolved once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecoderKind {
    // ---
    /// Uncompressed `PB` blocks.
    Plain,
}

// ---

impl DecoderKind {
    // ---
    pub fn build(self) -> Arc<dyn RecordDecoder> {
        match self {
            DecoderKind::Plain => Arc::new(PlainBlockDecoder),
        }
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
    fn defaults_are_applied() {
        // ---
        let cfg = Config::parse_from(["wavelink-export", "--ring", "/r", "--config", "/c"]);
        assert_eq!(cfg.decoder, DecoderKind::Plain);
        assert_eq!(cfg.reload_secs, 30);
        assert_eq!(cfg.persist_secs, 60);
        assert_eq!(cfg.status_secs, 300);
        assert_eq!(cfg.future_tolerance_secs, 600);
        assert_eq!(cfg.drain_secs, 5);
        assert!(cfg.monitor_file.is_none());
    }

    #[test]
    fn unknown_decoder_is_refused() {
        // ---
        let res = Config::try_parse_from([
            "wavelink-export",
            "--ring",
            "/r",
            "--config",
            "/c",
            "--decoder",
            "steim9",
        ]);
        assert!(res.is_err());
    }
}
