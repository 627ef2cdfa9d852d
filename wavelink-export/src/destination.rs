//! Destination list parsing.
//!
//! One destination per line:
//!
//! ```text
//! tag:host/port:options
//!
//! ew1:10.0.0.5/16005:-ack -throttle 200000 -hbint 30
//! lab:192.168.1.20/16010:-passive -q 4000 -chanfile /etc/wavelink/lab.chan
//! ```
//!
//! For an active destination `host/port` is the receiver we dial.  For a
//! passive one `host` is the address the receiver connects from and `port`
//! is the local port we listen on.
//!
//! A [`Destination`] is immutable.  When a line changes the server builds a
//! new one and replaces the session wholesale.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---

use tracing::{error, warn};

// ---

use wavelink_domain::{Result, WaveLinkError};

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

const DEFAULT_THROTTLE_BPS: u64 = 100_000;
const DEFAULT_HEARTBEAT_TEXT: &str = "alive";
const DEFAULT_HEARTBEAT_SECS: u64 = 60;
const DEFAULT_QUEUE_SLOTS: usize = 1000;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    // ---
    /// We connect out to the receiver.
    Active,

    /// The receiver connects in to us.
    Passive,
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    // ---
    pub tag: String,

    /// The configuration line this destination was parsed from, trimmed.
    /// Two destinations with the same line are the same destination.
    pub line: String,

    pub host: String,
    pub port: u16,
    pub role: Role,

    /// Sequence every data frame and expect `ACK:nnn` replies.
    pub ack: bool,

    /// Institution code in the frame logo.
    pub inst: u16,

    /// Module code in the frame logo.
    pub module: u16,

    /// Nominal bandwidth cap, bits per second.  0 disables the throttle.
    pub throttle_bps: u64,

    /// Heartbeat text we send.
    pub hb_out: String,

    /// Heartbeat text we expect from the receiver.
    pub hb_in: String,

    pub hb_interval: Duration,

    /// Close the link when nothing arrives from the receiver for this long.
    pub hb_timeout: Duration,

    /// Forward channels the directory marks as restricted.
    pub allow_restricted: bool,

    /// Skip records whose data ends longer ago than this.
    pub max_age: Option<Duration>,

    /// Delivery queue capacity, slots.
    pub queue_slots: usize,

    /// Explicit channel file; otherwise `<chan-dir>/<tag>.chan`.
    pub chan_file: Option<PathBuf>,
}

// ---

impl Destination {
    // ---
    /// Parse one configuration line.
    ///
    /// Returns `Ok(None)` for blank lines and `#` comments, and
    /// `Err(WaveLinkError::Config)` for a line that cannot describe a
    /// destination.  Unknown options are logged and ignored.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        // ---
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }

        let mut fields = line.splitn(3, ':');
        let tag = fields.next().unwrap_or_default().trim();
        let peer = fields.next().unwrap_or_default().trim();
        let options = fields.next().unwrap_or_default();

        if tag.is_empty() {
            return Err(config_err(line, "missing tag"));
        }
        let (host, port) = peer
            .split_once('/')
            .ok_or_else(|| config_err(line, "peer must be host/port"))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(config_err(line, "no peer host"));
        }
        let port: u16 = port
            .trim()
            .parse()
            .map_err(|_| config_err(line, "no usable peer port"))?;
        if port == 0 {
            return Err(config_err(line, "peer port 0"));
        }

        let mut dest = Self {
            tag: tag.to_string(),
            line: line.to_string(),
            host: host.to_string(),
            port,
            role: Role::Active,
            ack: false,
            inst: 0,
            module: 0,
            throttle_bps: DEFAULT_THROTTLE_BPS,
            hb_out: DEFAULT_HEARTBEAT_TEXT.to_string(),
            hb_in: DEFAULT_HEARTBEAT_TEXT.to_string(),
            hb_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            hb_timeout: Duration::ZERO,
            allow_restricted: false,
            max_age: None,
            queue_slots: DEFAULT_QUEUE_SLOTS,
            chan_file: None,
        };
        let mut hb_timeout = None;

        let mut words = options.split_whitespace();
        while let Some(word) = words.next() {
            match word {
                "-active" => dest.role = Role::Active,
                "-passive" => dest.role = Role::Passive,
                "-ack" => dest.ack = true,
                "-allowrestricted" => dest.allow_restricted = true,
                "-inst" => dest.inst = value(line, word, words.next())?,
                "-mod" => dest.module = value(line, word, words.next())?,
                "-throttle" => dest.throttle_bps = value(line, word, words.next())?,
                "-hbout" => dest.hb_out = text(line, word, words.next())?,
                "-hbin" => dest.hb_in = text(line, word, words.next())?,
                "-hbint" => {
                    dest.hb_interval = Duration::from_secs(value::<u64>(line, word, words.next())?.max(1))
                }
                "-hbto" => {
                    hb_timeout = Some(Duration::from_secs(value::<u64>(line, word, words.next())?.max(1)))
                }
                "-maxage" => {
                    let secs: u64 = value(line, word, words.next())?;
                    dest.max_age = (secs > 0).then(|| Duration::from_secs(secs));
                }
                "-q" => dest.queue_slots = value::<usize>(line, word, words.next())?.max(2),
                "-chanfile" => dest.chan_file = Some(PathBuf::from(text(line, word, words.next())?)),
                other => warn!(tag, option = other, "ignoring unknown destination option"),
            }
        }

        dest.hb_timeout = hb_timeout.unwrap_or(dest.hb_interval * 3);
        Ok(Some(dest))
    }

    // ---

    /// Channel file for this destination.
    pub fn chan_path(&self, chan_dir: &Path) -> PathBuf {
        self.chan_file
            .clone()
            .unwrap_or_else(|| chan_dir.join(format!("{}.chan", self.tag)))
    }

    /// `true` when the peer is on this host or a private network, which
    /// earns a shorter reconnect backoff cap.
    pub fn is_local_peer(&self) -> bool {
        // ---
        if self.host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
            Ok(IpAddr::V6(v6)) => v6.is_loopback(),
            Err(_) => false,
        }
    }

    /// `host:port`, for dialling.
    pub fn peer_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ---

fn config_err(line: &str, why: &str) -> WaveLinkError {
    WaveLinkError::Config(format!("{why}: {line:?}"))
}

fn value<T: std::str::FromStr>(line: &str, option: &str, word: Option<&str>) -> Result<T> {
    // ---
    let word = word.ok_or_else(|| config_err(line, &format!("{option} needs a value")))?;
    word.parse()
        .map_err(|_| config_err(line, &format!("bad value {word:?} for {option}")))
}

fn text(line: &str, option: &str, word: Option<&str>) -> Result<String> {
    word.map(str::to_string)
        .ok_or_else(|| config_err(line, &format!("{option} needs a value")))
}

// ---------------------------------------------------------------------------
// parse_list
// ---------------------------------------------------------------------------

/// Parse a whole destination list.
///
/// Lines that fail to parse are logged and left out; a repeated tag keeps
/// its first definition.  Neither case stops the rest of the list.
pub fn parse_list(text: &str) -> Vec<Destination> {
    // ---
    let mut out: Vec<Destination> = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        match Destination::parse(line) {
            Ok(Some(dest)) => {
                if out.iter().any(|d| d.tag == dest.tag) {
                    error!(tag = %dest.tag, line = lineno + 1, "duplicate destination tag, line ignored");
                    continue;
                }
                out.push(dest);
            }
            Ok(None) => {}
            Err(e) => error!(line = lineno + 1, "destination excluded: {e}"),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
