//! Per-destination resumption state.
//!
//! ```text
//! <state-dir>/<tag>.state   (big-endian)
//! +-----------+---------------------------------------------+
//! | seq (u32) | record * N                                  |
//! +-----------+---------------------------------------------+
//!
//! record (24 bytes)
//! +----------------------+------------------+---------------+
//! | channel (12 bytes)   | last end ms (i64)| last seq (u32)|
//! +----------------------+------------------+---------------+
//! ```
//!
//! `seq` is the last ring sequence whose units all reached the wire.  The
//! file is rewritten in full each time: written to `<tag>.state.tmp`,
//! fsynced, renamed over the old file, then the directory is fsynced.  A
//! crash leaves either the old file or the new one, never a mix.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

// ---

use wavelink_domain::{ChannelCode, ChannelTrack, Result, WaveLinkError, CHANNEL_CODE_LEN};

// ---

const SEQ_LEN: usize = 4;
const RECORD_LEN: usize = CHANNEL_CODE_LEN + 8 + 4;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    // ---
    /// Delivered watermark.
    pub seq: u32,

    pub tracks: Vec<(ChannelCode, ChannelTrack)>,
}

// ---

impl SessionState {
    // ---
    fn encode(&self) -> Vec<u8> {
        // ---
        let mut out = Vec::with_capacity(SEQ_LEN + self.tracks.len() * RECORD_LEN);
        out.extend_from_slice(&self.seq.to_be_bytes());
        for (channel, track) in &self.tracks {
            out.extend_from_slice(channel.as_bytes());
            out.extend_from_slice(&track.last_end_ms.to_be_bytes());
            out.extend_from_slice(&track.last_seq.to_be_bytes());
        }
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        // ---
        if bytes.len() < SEQ_LEN || (bytes.len() - SEQ_LEN) % RECORD_LEN != 0 {
            return Err(WaveLinkError::State(format!(
                "state file length {} is not 4 + 24*n",
                bytes.len()
            )));
        }

        let seq = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let tracks = bytes[SEQ_LEN..]
            .chunks_exact(RECORD_LEN)
            .map(|rec| {
                let mut code = [0u8; CHANNEL_CODE_LEN];
                code.copy_from_slice(&rec[..CHANNEL_CODE_LEN]);
                let mut end = [0u8; 8];
                end.copy_from_slice(&rec[CHANNEL_CODE_LEN..CHANNEL_CODE_LEN + 8]);
                let mut last = [0u8; 4];
                last.copy_from_slice(&rec[CHANNEL_CODE_LEN + 8..]);
                (
                    ChannelCode::from_bytes(code),
                    ChannelTrack {
                        last_end_ms: i64::from_be_bytes(end),
                        last_seq: u32::from_be_bytes(last),
                    },
                )
            })
            .collect();

        Ok(Self { seq, tracks })
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

pub fn state_path(state_dir: &Path, tag: &str) -> PathBuf {
    state_dir.join(format!("{tag}.state"))
}

fn tmp_path(path: &Path) -> PathBuf {
    // ---
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// load / save
// ---------------------------------------------------------------------------

/// Read the state file.  A missing file is `Ok(None)`.
pub fn load(path: &Path) -> Result<Option<SessionState>> {
    // ---
    match fs::read(path) {
        Ok(bytes) => SessionState::decode(&bytes)
            .map(Some)
            .map_err(|e| WaveLinkError::State(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WaveLinkError::State(format!(
            "cannot read {}: {e}",
            path.display()
        ))),
    }
}

/// Atomically replace the state file.
pub fn save(path: &Path, state: &SessionState) -> Result<()> {
    // ---
    let tmp = tmp_path(path);
    let fail = |what: &str, e: std::io::Error| {
        WaveLinkError::State(format!("{what} {}: {e}", tmp.display()))
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| fail("cannot create directory for", e))?;
    }

    let mut file = File::create(&tmp).map_err(|e| fail("cannot create", e))?;
    file.write_all(&state.encode())
        .map_err(|e| fail("cannot write", e))?;
    file.sync_all().map_err(|e| fail("cannot fsync", e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| fail("cannot rename", e))?;

    if let Some(parent) = path.parent() {
        let dir = OpenOptions::new()
            .read(true)
            .open(parent)
            .map_err(|e| fail("cannot open directory of", e))?;
        dir.sync_all()
            .map_err(|e| fail("cannot fsync directory of", e))?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
