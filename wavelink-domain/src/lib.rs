//! Core types and delivery engines for the wavelink waveform export node.
//!
//! This crate defines the vocabulary of the system.  The export daemon and
//! the peer simulator both depend on `wavelink-domain` and speak its types.
//! Everything here is synchronous; tasks and sockets live in the daemon.
//!
//! # Structure
//!
//! - [`error`]    [`WaveLinkError`] and [`Result<T>`] alias
//! - [`channel`]  fixed-width [`ChannelCode`]
//! - [`unit`]     [`DecodedRecord`], [`OutputUnit`], time and sequence helpers
//! - [`queue`]    [`DeliveryQueue`] (one-slot-free circular buffer)
//! - [`order`]    [`OrderGuard`] per-channel time tracker
//! - [`wire`]     frame encoding, escaping, [`FrameDecoder`]
//! - [`tracebuf`] TRACEBUF2 waveform payload
//! - [`ring`]     [`RingReader`] / [`RingWriter`] for the disk ring file
//! - [`collab`]   [`RecordDecoder`] and [`ChannelDirectory`] seams

mod channel;
mod collab;
mod error;
mod order;
mod queue;
mod ring;
mod unit;

pub mod tracebuf;
pub mod wire;

// --- error
pub use error::{Result, WaveLinkError};

// --- channel
pub use channel::{ChannelCode, CHANNEL_CODE_LEN};

// --- unit
pub use unit::{
    // ---
    now_ms,
    period_ms,
    seq_gap,
    span_ms,
    DecodedRecord,
    OutputUnit,
    MAX_SAMPLES_PER_UNIT,
};

// --- queue
pub use queue::DeliveryQueue;

// --- order
pub use order::{ChannelTrack, OrderGuard, Verdict};

// --- wire
pub use wire::{Frame, FrameDecoder, Logo};

// --- ring
pub use ring::{RingHeader, RingReader, RingWriter};

// --- collab
pub use collab::{
    // ---
    encode_plain_block,
    ChannelDirectory,
    PlainBlockDecoder,
    RecordDecoder,
    RestrictedSet,
};
