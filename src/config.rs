//! Configuration management
//!
//! Loaded from a TOML file; every field is optional and falls back to the
//! defaults below.
//!
//! ```toml
//! [outbound]
//! port = 5000
//! backend = "callback"
//! device = 7
//!
//! [mic]
//! output_device = 12
//!
//! [recording]
//! seconds = 0
//! ```

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::network::tcp::resolve_addr;
use crate::protocol::{AudioFormat, MAX_BLOCK_FRAMES, MAX_SAMPLE_RATE};

/// Highest channel count accepted for capture
const MAX_CHANNELS: u16 = 8;

/// Capture strategy for the outbound bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureBackend {
    /// Pick the best available strategy
    #[default]
    Auto,
    /// Audio host pushes blocks into a bounded queue
    Callback,
    /// Recorder polled per connection, silence while idle
    Polling,
}

impl CaptureBackend {
    /// Concrete strategy for `Auto`
    pub fn resolve(self) -> CaptureBackend {
        match self {
            CaptureBackend::Auto => CaptureBackend::Callback,
            other => other,
        }
    }
}

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub outbound: OutboundConfig,
    pub mic: MicBridgeConfig,
    pub recording: TestRecordConfig,
}

/// Desktop audio → client bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboundConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub sample_rate: u32,
    pub channels: u16,
    pub block_frames: u32,
    pub backend: CaptureBackend,
    /// Global device index; resolved automatically when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<usize>,
    /// 0 disables the timeout
    pub write_timeout_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_OUTBOUND_PORT,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            block_frames: DEFAULT_BLOCK_FRAMES,
            backend: CaptureBackend::Auto,
            device: None,
            write_timeout_ms: 5000,
        }
    }
}

impl OutboundConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::pcm16(self.sample_rate, self.channels, self.block_frames)
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        (self.write_timeout_ms > 0).then(|| Duration::from_millis(self.write_timeout_ms))
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(resolve_addr(&self.host, self.port)?)
    }
}

/// Client microphone → desktop output bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MicBridgeConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Global device index; resolved automatically when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_device: Option<usize>,
    /// How long a client may take to send its header
    pub handshake_timeout_ms: u64,
}

impl Default for MicBridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_MIC_PORT,
            output_device: None,
            handshake_timeout_ms: 5000,
        }
    }
}

impl MicBridgeConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        Ok(resolve_addr(&self.host, self.port)?)
    }
}

/// One-off WAV capture instead of serving
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRecordConfig {
    /// 0 disables the test recording
    pub seconds: u32,
    pub path: PathBuf,
}

impl Default for TestRecordConfig {
    fn default() -> Self {
        Self {
            seconds: 0,
            path: PathBuf::from("capture_test.wav"),
        }
    }
}

impl AppConfig {
    /// Parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("parse {}: {}", path.display(), e)))
    }

    /// Parse `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        std::fs::write(path, raw)?;
        Ok(())
    }

    /// Per-user config location, e.g. `~/.config/pcm-bridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "pcm-bridge").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject settings no bridge could run with
    pub fn validate(&self) -> Result<()> {
        let out = &self.outbound;
        if !out.enabled && !self.mic.enabled && self.recording.seconds == 0 {
            return Err(Error::Config("both bridges are disabled".to_string()));
        }
        if out.sample_rate == 0 || out.sample_rate > MAX_SAMPLE_RATE {
            return Err(Error::Config(format!(
                "outbound.sample_rate must be between 1 and {MAX_SAMPLE_RATE}, got {}",
                out.sample_rate
            )));
        }
        if out.channels == 0 || out.channels > MAX_CHANNELS {
            return Err(Error::Config(format!(
                "outbound.channels must be between 1 and {MAX_CHANNELS}, got {}",
                out.channels
            )));
        }
        if out.block_frames == 0 || out.block_frames > MAX_BLOCK_FRAMES {
            return Err(Error::Config(format!(
                "outbound.block_frames must be between 1 and {MAX_BLOCK_FRAMES}, got {}",
                out.block_frames
            )));
        }
        if out.enabled && self.mic.enabled && out.port == self.mic.port && out.port != 0 {
            return Err(Error::Config(format!(
                "outbound and mic bridges cannot share port {}",
                out.port
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.outbound.port, 5000);
        assert_eq!(config.mic.port, 5001);
        assert_eq!(config.outbound.format(), AudioFormat::pcm16(48000, 2, 960));
        assert_eq!(config.outbound.write_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.outbound.backend.resolve(), CaptureBackend::Callback);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config: AppConfig = toml::from_str(
            r#"
            [outbound]
            port = 6000
            backend = "polling"
            device = 3
            write_timeout_ms = 0

            [mic]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.outbound.port, 6000);
        assert_eq!(config.outbound.backend, CaptureBackend::Polling);
        assert_eq!(config.outbound.device, Some(3));
        assert_eq!(config.outbound.write_timeout(), None);
        assert_eq!(config.outbound.channels, 2);
        assert!(!config.mic.enabled);
        assert_eq!(config.mic.output_device, None);
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = AppConfig::default();
        config.outbound.channels = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.outbound.block_frames = u32::MAX;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.mic.port = config.outbound.port;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.outbound.enabled = false;
        config.mic.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("pcm-bridge-cfg-{}", std::process::id()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.outbound.device = Some(4);
        config.mic.handshake_timeout_ms = 750;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.outbound.device, Some(4));
        assert_eq!(loaded.mic.handshake_timeout(), Duration::from_millis(750));

        std::fs::remove_dir_all(&dir).unwrap();
        assert!(AppConfig::load_or_default(&path).is_ok());
        assert!(AppConfig::load(&path).is_err());
    }
}
