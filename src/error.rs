//! Error types for the PCM bridge

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0} bridge is already running")]
    AlreadyRunning(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    /// No device satisfies the request
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device exists but cannot serve the requested channels/format, or went away
    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Recoverable backend hiccup; callers treat it as an idle tick
    #[error("Transient capture error: {0}")]
    CaptureTransient(String),

    #[error("Recording failed: {0}")]
    Recording(String),
}

impl AudioError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AudioError::CaptureTransient(_))
    }
}

/// Wire header violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad magic {found:?}, expected {expected:?}")]
    BadMagic { expected: String, found: String },

    #[error("unsupported bit depth {0}, only 16-bit PCM is accepted")]
    UnsupportedBitDepth(u16),

    #[error("channel count must be non-zero")]
    ZeroChannels,

    #[error("unsupported sample rate {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("block of {0} frames is too large")]
    BlockTooLarge(u32),

    #[error("header truncated after {0} bytes")]
    Truncated(usize),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connection error: {0}")]
    Connection(#[source] std::io::Error),

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
