use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum WaveLinkError {
    // ---
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("ring file error: {0}")]
    RingFile(String),

    #[error("state file error: {0}")]
    State(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bump_tail called without an outstanding get_tail")]
    TailNotHeld,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---

pub type Result<T> = std::result::Result<T, WaveLinkError>;
