//! Simulated export destination for wavelink testing.
//!
//! [`PeerSim`] speaks the receiving side of the export protocol over real
//! loopback sockets: it decodes frames and TRACEBUF2 payloads, sends
//! heartbeats, answers sequenced frames with acks, and can be told to
//! misbehave through [`PeerSimConfig`]:
//!
//! - Hang up after N data frames (link outage mid-stream)
//! - Stop acking part way (unacknowledged frames at disconnect)
//! - Never send heartbeats (heartbeat timeout)
//!
//! # Quick start
//!
//! ```rust,no_run
//! use wavelink_peer_sim::{PeerSim, PeerSimConfig};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let sim = PeerSim::listen(PeerSimConfig::flaky(5)).await?;
//! let addr = sim.local_addr();
//! # Ok(())
//! # }
//! ```

mod config;
mod peer;

// --- public API
pub use config::PeerSimConfig;
pub use peer::{PeerSim, PeerStats, ReceivedUnit};
