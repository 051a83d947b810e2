//! # PCM Bridge
//!
//! Bidirectional real-time PCM16 audio bridge over TCP between a desktop
//! and a remote thin client.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                DESKTOP                                      │
//! │                                                                             │
//! │  ┌──────────────────┐        ┌──────────────────────────────────────────┐   │
//! │  │  Device Resolver │───────▶│ Capture Pipeline (audio::capture)        │   │
//! │  │ (audio::resolver)│        │  callback variant ──▶ BoundedFrameQueue  │   │
//! │  └────────┬─────────┘        │  polling variant  ──▶ direct write path  │   │
//! │           │                  └────────────────────┬─────────────────────┘   │
//! │           │                                       ▼                         │
//! │           │                  ┌──────────────────────────────────────────┐   │
//! │           │                  │ Outbound Server (network::outbound)      │   │
//! │           │                  │  "PCM1" header, then PCM16LE stream      │   │
//! │           │                  └────────────────────┬─────────────────────┘   │
//! │           │                                       │ TCP :5000               │
//! │           ▼                                       │                         │
//! │  ┌──────────────────┐        ┌────────────────────┼─────────────────────┐   │
//! │  │ Output device    │◀───────│ Mic Bridge (network::mic)                │   │
//! │  │ (virtual cable)  │        │  "MIC1" handshake, re-chunk, mono→stereo │   │
//! │  └──────────────────┘        └────────────────────┬─────────────────────┘   │
//! │                                                   │ TCP :5001               │
//! └───────────────────────────────────────────────────┼─────────────────────────┘
//!                                                     │
//!                                              REMOTE CLIENT
//! ```
//!
//! Both servers are owned by [`supervisor::BridgeSupervisor`], which is the
//! entry point for outer layers (control panels, the `pcm-bridge` binary).

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod supervisor;

pub use error::{Error, Result};
pub use protocol::{AudioFormat, StreamHeader};
pub use supervisor::BridgeSupervisor;

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default sample rate for capture and the wire header
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default block size in frames (20 ms @ 48 kHz)
    pub const DEFAULT_BLOCK_FRAMES: u32 = 960;

    /// Default TCP port for desktop audio → client
    pub const DEFAULT_OUTBOUND_PORT: u16 = 5000;

    /// Default TCP port for client microphone → desktop
    pub const DEFAULT_MIC_PORT: u16 = 5001;

    /// Slots in the capture → socket frame queue
    pub const FRAME_QUEUE_CAPACITY: usize = 64;

    /// Maximum bytes taken from the mic socket per receive
    pub const MIC_RECV_CHUNK: usize = 8192;

    /// Upper bound on how long any server loop may go without checking its stop flag
    pub const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

    /// Idle time before the first TCP keepalive probe
    pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(15);

    /// Interval between TCP keepalive probes
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

    /// Shortest pause between polls when the capture tap has nothing to offer
    pub const MIN_IDLE_SLEEP: Duration = Duration::from_millis(10);
}
