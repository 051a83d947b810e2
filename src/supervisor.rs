//! Lifecycle of the two bridges
//!
//! [`BridgeSupervisor`] owns at most one outbound and one mic bridge, each
//! on its own thread with its own stop flag. It is the control surface for
//! whatever drives the bridges: the bundled binary, or a control panel.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::capture::{open_frame_source, FrameSource};
use crate::audio::device::{CpalCatalog, DeviceCatalog, DeviceDescriptor};
use crate::audio::recorder::{self, RecordingSummary};
use crate::audio::resolver::DeviceResolver;
use crate::config::{MicBridgeConfig, OutboundConfig, TestRecordConfig};
use crate::error::{Error, Result};
use crate::network::mic::MicBridgeServer;
use crate::network::outbound::OutboundServer;
use crate::network::{ServerState, ServerStats};

/// A running server thread
struct BridgeHandle {
    name: &'static str,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    thread: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Raise the stop flag and wait for the thread, which notices within about a second
    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("{} bridge thread panicked", self.name);
            }
        }
    }
}

pub struct BridgeSupervisor {
    resolver: Arc<DeviceResolver>,
    outbound: Mutex<Option<BridgeHandle>>,
    mic: Mutex<Option<BridgeHandle>>,
}

impl BridgeSupervisor {
    /// Supervisor using the system audio devices
    pub fn new() -> Self {
        Self::with_catalog(Arc::new(CpalCatalog::new()))
    }

    pub fn with_catalog(catalog: Arc<dyn DeviceCatalog>) -> Self {
        Self {
            resolver: Arc::new(DeviceResolver::new(catalog)),
            outbound: Mutex::new(None),
            mic: Mutex::new(None),
        }
    }

    pub fn resolver(&self) -> &Arc<DeviceResolver> {
        &self.resolver
    }

    pub fn list_capture_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.resolver.enumerate_capture_devices()?)
    }

    pub fn list_output_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.resolver.enumerate_output_devices()?)
    }

    /// Resolve the capture device, start capture and begin accepting clients
    pub fn start_outbound_bridge(&self, config: &OutboundConfig) -> Result<SocketAddr> {
        if self.is_outbound_running() {
            return Err(Error::AlreadyRunning("outbound"));
        }
        let source = open_frame_source(&self.resolver, config)?;
        self.start_outbound_with_source(config, source)
    }

    /// Start the outbound bridge on an already-built frame source
    pub fn start_outbound_with_source(
        &self,
        config: &OutboundConfig,
        source: Box<dyn FrameSource>,
    ) -> Result<SocketAddr> {
        let mut slot = self.outbound.lock();
        if slot.as_ref().is_some_and(BridgeHandle::is_alive) {
            return Err(Error::AlreadyRunning("outbound"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let server = OutboundServer::bind(config.bind_addr()?, source, config.write_timeout(), stop.clone())?;
        let local_addr = server.local_addr();
        let stats = server.stats();

        let thread = thread::Builder::new()
            .name("outbound-bridge".to_string())
            .spawn(move || server.run())?;

        *slot = Some(BridgeHandle {
            name: "outbound",
            local_addr,
            stop,
            stats,
            thread: Some(thread),
        });
        Ok(local_addr)
    }

    /// Check the output device exists, then begin accepting mic clients
    pub fn start_mic_bridge(&self, config: &MicBridgeConfig) -> Result<SocketAddr> {
        let mut slot = self.mic.lock();
        if slot.as_ref().is_some_and(BridgeHandle::is_alive) {
            return Err(Error::AlreadyRunning("mic"));
        }

        let device = self.resolver.resolve_mic_output_device(config.output_device)?;
        tracing::info!("Mic output device: {}", device);

        let stop = Arc::new(AtomicBool::new(false));
        let server = MicBridgeServer::bind(
            config.bind_addr()?,
            self.resolver.clone(),
            config.output_device,
            config.handshake_timeout(),
            stop.clone(),
        )?;
        let local_addr = server.local_addr();
        let stats = server.stats();

        let thread = thread::Builder::new()
            .name("mic-bridge".to_string())
            .spawn(move || server.run())?;

        *slot = Some(BridgeHandle {
            name: "mic",
            local_addr,
            stop,
            stats,
            thread: Some(thread),
        });
        Ok(local_addr)
    }

    /// Record a WAV with the outbound capture settings, without serving
    pub fn record_test(&self, config: &OutboundConfig, recording: &TestRecordConfig) -> Result<RecordingSummary> {
        let mut source = open_frame_source(&self.resolver, config)?;
        Ok(recorder::record_test(source.as_mut(), recording.seconds, &recording.path)?)
    }

    pub fn stop_outbound(&self) {
        if let Some(mut handle) = self.outbound.lock().take() {
            handle.shutdown();
        }
    }

    pub fn stop_mic(&self) {
        if let Some(mut handle) = self.mic.lock().take() {
            handle.shutdown();
        }
    }

    /// Stop both bridges and join their threads
    pub fn stop(&self) {
        // Raise both flags first so the bridges wind down in parallel
        for slot in [&self.outbound, &self.mic] {
            if let Some(handle) = slot.lock().as_ref() {
                handle.stop.store(true, Ordering::SeqCst);
            }
        }
        self.stop_outbound();
        self.stop_mic();
    }

    pub fn is_outbound_running(&self) -> bool {
        self.outbound.lock().as_ref().is_some_and(BridgeHandle::is_alive)
    }

    pub fn is_mic_running(&self) -> bool {
        self.mic.lock().as_ref().is_some_and(BridgeHandle::is_alive)
    }

    pub fn outbound_addr(&self) -> Option<SocketAddr> {
        self.outbound.lock().as_ref().map(|h| h.local_addr)
    }

    pub fn mic_addr(&self) -> Option<SocketAddr> {
        self.mic.lock().as_ref().map(|h| h.local_addr)
    }

    pub fn outbound_state(&self) -> Option<ServerState> {
        self.outbound.lock().as_ref().map(|h| h.stats.state())
    }

    pub fn mic_state(&self) -> Option<ServerState> {
        self.mic.lock().as_ref().map(|h| h.stats.state())
    }

    pub fn outbound_stats(&self) -> Option<Arc<ServerStats>> {
        self.outbound.lock().as_ref().map(|h| h.stats.clone())
    }

    pub fn mic_stats(&self) -> Option<Arc<ServerStats>> {
        self.mic.lock().as_ref().map(|h| h.stats.clone())
    }
}

impl Default for BridgeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BridgeSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
