//! Wire protocol shared by both bridge directions
//!
//! Every connection starts with one fixed 16-byte little-endian header and
//! then carries raw interleaved PCM16LE samples with no further framing:
//!
//! ```text
//! ┌─────────┬──────────────┬──────────┬───────────────┬──────────────┐
//! │ magic   │ sample_rate  │ channels │ bits/sample   │ block_frames │
//! │ 4 bytes │ u32          │ u16      │ u16 (= 16)    │ u32          │
//! └─────────┴──────────────┴──────────┴───────────────┴──────────────┘
//! ```
//!
//! The magic tells the direction: `PCM1` is sent by the desktop on the
//! outbound bridge, `MIC1` is sent by the client on the mic bridge.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{DEFAULT_BLOCK_FRAMES, DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::error::ProtocolError;

/// Encoded header length in bytes
pub const HEADER_LEN: usize = 16;

/// Magic of the desktop → client stream
pub const OUTBOUND_MAGIC: [u8; 4] = *b"PCM1";

/// Magic of the client → desktop microphone stream
pub const MIC_MAGIC: [u8; 4] = *b"MIC1";

/// The only supported sample width
pub const BITS_PER_SAMPLE: u16 = 16;

/// Highest sample rate a header may announce
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Largest nominal block a header may announce
pub const MAX_BLOCK_FRAMES: u32 = 1 << 16;

const BYTES_PER_SAMPLE: usize = (BITS_PER_SAMPLE / 8) as usize;

/// PCM16 stream format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Always 16
    pub bits_per_sample: u16,
    /// Nominal frames per block
    pub block_frames: u32,
}

impl AudioFormat {
    pub fn pcm16(sample_rate: u32, channels: u16, block_frames: u32) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: BITS_PER_SAMPLE,
            block_frames,
        }
    }

    /// Same format with a different channel count
    pub fn with_channels(self, channels: u16) -> Self {
        Self { channels, ..self }
    }

    /// Bytes per frame (one sample for every channel)
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Bytes per nominal block
    pub fn block_bytes(&self) -> usize {
        self.block_frames as usize * self.frame_bytes()
    }

    /// Duration of one nominal block
    pub fn block_duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.block_frames as u64 * 1_000_000_000 / self.sample_rate as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS, DEFAULT_BLOCK_FRAMES)
    }
}

/// Decoded connection header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub magic: [u8; 4],
    pub format: AudioFormat,
}

impl StreamHeader {
    /// Header announcing desktop audio to a client
    pub fn outbound(format: AudioFormat) -> Self {
        Self {
            magic: OUTBOUND_MAGIC,
            format,
        }
    }

    /// Header a client sends before streaming its microphone
    pub fn mic(format: AudioFormat) -> Self {
        Self {
            magic: MIC_MAGIC,
            format,
        }
    }

    /// Serialize to the 16-byte wire layout
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.magic);
        out[4..8].copy_from_slice(&self.format.sample_rate.to_le_bytes());
        out[8..10].copy_from_slice(&self.format.channels.to_le_bytes());
        out[10..12].copy_from_slice(&self.format.bits_per_sample.to_le_bytes());
        out[12..16].copy_from_slice(&self.format.block_frames.to_le_bytes());
        out
    }

    /// Parse and validate a header, requiring `expected_magic`
    pub fn decode(bytes: &[u8], expected_magic: [u8; 4]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_LEN {
            return Err(ProtocolError::Truncated(bytes.len()));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != expected_magic {
            return Err(ProtocolError::BadMagic {
                expected: String::from_utf8_lossy(&expected_magic).into_owned(),
                found: String::from_utf8_lossy(&magic).into_owned(),
            });
        }

        let sample_rate = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let channels = u16::from_le_bytes([bytes[8], bytes[9]]);
        let bits_per_sample = u16::from_le_bytes([bytes[10], bytes[11]]);
        let block_frames = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

        if bits_per_sample != BITS_PER_SAMPLE {
            return Err(ProtocolError::UnsupportedBitDepth(bits_per_sample));
        }
        if channels == 0 {
            return Err(ProtocolError::ZeroChannels);
        }
        if sample_rate == 0 || sample_rate > MAX_SAMPLE_RATE {
            return Err(ProtocolError::UnsupportedSampleRate(sample_rate));
        }
        if block_frames > MAX_BLOCK_FRAMES {
            return Err(ProtocolError::BlockTooLarge(block_frames));
        }

        Ok(Self {
            magic,
            format: AudioFormat {
                sample_rate,
                channels,
                bits_per_sample,
                block_frames,
            },
        })
    }
}
