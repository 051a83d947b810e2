//! PCM Bridge Application
//!
//! Streams desktop audio to a remote client and plays the client's
//! microphone into a local output device.
//!
//! Usage: `pcm-bridge [config.toml]`

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pcm_bridge::{config::AppConfig, BridgeSupervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting PCM bridge");

    let config_path = std::env::args().nth(1).map(PathBuf::from).or_else(AppConfig::default_path);
    let config = match &config_path {
        Some(path) => {
            tracing::info!("Config: {}", path.display());
            AppConfig::load_or_default(path).context("loading configuration")?
        }
        None => AppConfig::default(),
    };
    config.validate().context("invalid configuration")?;

    let supervisor = Arc::new(BridgeSupervisor::new());

    println!("\n=== Capture Devices ===");
    for device in supervisor.list_capture_devices()? {
        println!("  {}", device);
    }
    println!("\n=== Output Devices ===");
    for device in supervisor.list_output_devices()? {
        println!("  {}", device);
    }
    println!();

    if config.recording.seconds > 0 {
        let recorder = supervisor.clone();
        let summary = tokio::task::spawn_blocking(move || {
            recorder.record_test(&config.outbound, &config.recording)
        })
        .await??;
        println!(
            "File created: {} ({} frames, {} Hz, {} ch)",
            summary.path.display(),
            summary.frames,
            summary.sample_rate,
            summary.channels
        );
        return Ok(());
    }

    if config.mic.enabled {
        match supervisor.start_mic_bridge(&config.mic) {
            Ok(addr) => tracing::info!("Mic bridge listening on {}", addr),
            Err(e) if config.outbound.enabled => tracing::error!("Mic bridge disabled: {}", e),
            Err(e) => return Err(e).context("starting mic bridge"),
        }
    }

    if config.outbound.enabled {
        match supervisor.start_outbound_bridge(&config.outbound) {
            Ok(addr) => tracing::info!("Audio bridge listening on {}", addr),
            Err(e) if supervisor.is_mic_running() => {
                tracing::error!("Audio bridge error: {}; mic bridge keeps running", e)
            }
            Err(e) => return Err(e).context("starting audio bridge"),
        }
    }

    if !supervisor.is_outbound_running() && !supervisor.is_mic_running() {
        bail!("no bridge is running");
    }

    tracing::info!("Press Ctrl+C to stop");

    let mut stats_tick = tokio::time::interval(Duration::from_secs(30));
    stats_tick.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl+C")?;
                tracing::info!("Stopped by user");
                break;
            }
            _ = stats_tick.tick() => {
                if let Some(stats) = supervisor.outbound_stats() {
                    tracing::info!(
                        "Audio bridge: {:?}, {} clients, {:.1} MB sent",
                        stats.state(),
                        stats.connections(),
                        stats.bytes() as f64 / (1024.0 * 1024.0)
                    );
                }
                if let Some(stats) = supervisor.mic_stats() {
                    tracing::info!(
                        "Mic bridge: {:?}, {} clients, {:.1} MB received",
                        stats.state(),
                        stats.connections(),
                        stats.bytes() as f64 / (1024.0 * 1024.0)
                    );
                }
            }
        }
    }

    let stopper = supervisor.clone();
    tokio::task::spawn_blocking(move || stopper.stop()).await?;
    Ok(())
}
