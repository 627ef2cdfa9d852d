//! [`ExportContext`]: process-wide collaborators and settings handed to every
//! session and task at construction.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

// ---

use tokio::runtime::Handle;
use uuid::Uuid;

// ---

use wavelink_domain::{ChannelDirectory, RecordDecoder};

// ---------------------------------------------------------------------------
// ExportContext
// ---------------------------------------------------------------------------

pub struct ExportContext {
    // ---
    /// Disk ring file; catch-up readers open their own handle on it.
    pub ring_path: PathBuf,

    /// Slot count of the ring file.
    pub ring_capacity: u32,

    pub decoder: Arc<dyn RecordDecoder>,
    pub directory: Arc<dyn ChannelDirectory>,

    pub state_dir: PathBuf,
    pub chan_dir: PathBuf,

    /// Address passive listeners bind to.
    pub listen_addr: IpAddr,

    pub future_tolerance: Duration,

    /// How long a terminating session keeps draining its queue.
    pub drain_timeout: Duration,

    /// Runtime that session tasks are spawned on.  Sessions are fed from the
    /// ring feeder thread, which has no runtime of its own.
    pub runtime: Handle,

    /// Identifies this process run in logs and the monitor file.
    pub incarnation: Uuid,
}

// ---

impl ExportContext {
    // ---
    /// Largest backlog, in ring sequences, that catch-up will try to replay.
    /// Beyond this the oldest records are about to be overwritten.
    pub fn replay_limit(&self) -> u32 {
        (self.ring_capacity as u64 * 9 / 10) as u32
    }

    pub fn future_tolerance_ms(&self) -> i64 {
        self.future_tolerance.as_millis() as i64
    }
}

// ---

impl std::fmt::Debug for ExportContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("ExportContext")
            .field("ring_path", &self.ring_path)
            .field("ring_capacity", &self.ring_capacity)
            .field("state_dir", &self.state_dir)
            .field("chan_dir", &self.chan_dir)
            .field("incarnation", &self.incarnation)
            .finish_non_exhaustive()
    }
}
