//! Audio device enumeration and opening
//!
//! [`DeviceCatalog`] is the seam between the bridge and the audio host. The
//! production implementation, [`CpalCatalog`], walks every cpal host so that
//! device indices are global and stable within one [`DeviceInventory`]
//! snapshot. Tests substitute their own catalog.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;
use std::fmt;

use crate::audio::buffer::SharedFrameQueue;
use crate::audio::capture::{self, CpalTap, SampleTap, StreamHandle};
use crate::audio::playback::{CpalPlayback, PcmSink};
use crate::audio::resolver::is_loopback_name;
use crate::error::AudioError;
use crate::protocol::AudioFormat;

/// One audio endpoint as seen in a single enumeration pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub index: usize,
    pub name: String,
    pub host_api: String,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    /// Captures what the system plays rather than a physical input
    pub is_loopback: bool,
}

impl DeviceDescriptor {
    pub fn is_input(&self) -> bool {
        self.max_input_channels > 0
    }

    pub fn is_output(&self) -> bool {
        self.max_output_channels > 0
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match (self.is_input(), self.is_output()) {
            (true, true) => "in/out",
            (true, false) => "in",
            (false, true) => "out",
            (false, false) => "n/a",
        };
        write!(f, "{}: {} [{}] ({})", self.index, self.name, self.host_api, direction)?;
        if self.is_loopback {
            write!(f, " (loopback)")?;
        }
        Ok(())
    }
}

/// Snapshot of every device plus the system defaults
#[derive(Debug, Clone, Default)]
pub struct DeviceInventory {
    pub devices: Vec<DeviceDescriptor>,
    pub default_input: Option<usize>,
    pub default_output: Option<usize>,
    /// Output endpoints can be opened directly for loopback capture
    pub native_loopback: bool,
}

impl DeviceInventory {
    pub fn get(&self, index: usize) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.index == index)
    }

    pub fn capture_devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter().filter(|d| d.is_input())
    }

    pub fn output_devices(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter().filter(|d| d.is_output())
    }

    pub fn default_output_device(&self) -> Option<&DeviceDescriptor> {
        self.default_output.and_then(|index| self.get(index))
    }
}

/// Enumerates devices and opens capture/playback streams on them
pub trait DeviceCatalog: Send + Sync {
    /// Take a fresh snapshot of the available devices
    fn inventory(&self) -> Result<DeviceInventory, AudioError>;

    /// Start callback-driven capture that pushes each delivered block into `queue`
    fn open_block_capture(
        &self,
        device: &DeviceDescriptor,
        format: AudioFormat,
        queue: SharedFrameQueue,
    ) -> Result<StreamHandle, AudioError>;

    /// Open a recorder that is polled for whatever audio is currently available
    fn open_tap(
        &self,
        device: &DeviceDescriptor,
        format: AudioFormat,
    ) -> Result<Box<dyn SampleTap>, AudioError>;

    /// Open an output stream accepting PCM16LE in `format`
    fn open_output(
        &self,
        device: &DeviceDescriptor,
        format: AudioFormat,
    ) -> Result<Box<dyn PcmSink>, AudioError>;
}

/// Device catalog backed by cpal
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCatalog;

impl CpalCatalog {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceCatalog for CpalCatalog {
    fn inventory(&self) -> Result<DeviceInventory, AudioError> {
        let default_host = cpal::default_host();
        let default_host_id = default_host.id();
        let default_input_name = default_host
            .default_input_device()
            .and_then(|d| d.name().ok());
        let default_output_name = default_host
            .default_output_device()
            .and_then(|d| d.name().ok());

        let mut inventory = DeviceInventory {
            native_loopback: native_loopback_supported(),
            ..Default::default()
        };

        for host_id in cpal::available_hosts() {
            let host = match cpal::host_from_id(host_id) {
                Ok(host) => host,
                Err(e) => {
                    tracing::debug!("Skipping audio host {}: {}", host_id.name(), e);
                    continue;
                }
            };
            let devices = match host.devices() {
                Ok(devices) => devices,
                Err(e) => {
                    tracing::warn!("Failed to enumerate {} devices: {}", host_id.name(), e);
                    continue;
                }
            };

            for device in devices {
                let Ok(name) = device.name() else {
                    continue;
                };
                let mut max_input = max_channels(device.supported_input_configs());
                let max_output = max_channels(device.supported_output_configs());
                if max_input == 0 && max_output == 0 {
                    continue;
                }

                let index = inventory.devices.len();
                if host_id == default_host_id {
                    if inventory.default_input.is_none()
                        && max_input > 0
                        && default_input_name.as_ref() == Some(&name)
                    {
                        inventory.default_input = Some(index);
                    }
                    if inventory.default_output.is_none()
                        && max_output > 0
                        && default_output_name.as_ref() == Some(&name)
                    {
                        inventory.default_output = Some(index);
                    }
                }

                let mut is_loopback = max_input > 0 && is_loopback_name(&name);
                if inventory.native_loopback && max_input == 0 && max_output > 0 {
                    // Render endpoints double as loopback capture sources.
                    max_input = max_output;
                    is_loopback = true;
                }

                inventory.devices.push(DeviceDescriptor {
                    index,
                    name,
                    host_api: host_id.name().to_string(),
                    max_input_channels: max_input,
                    max_output_channels: max_output,
                    is_loopback,
                });
            }
        }

        Ok(inventory)
    }

    fn open_block_capture(
        &self,
        device: &DeviceDescriptor,
        format: AudioFormat,
        queue: SharedFrameQueue,
    ) -> Result<StreamHandle, AudioError> {
        let cpal_device = find_cpal_device(device, Endpoint::for_capture(device))?;
        capture::start_block_capture(cpal_device, device, format, queue)
    }

    fn open_tap(
        &self,
        device: &DeviceDescriptor,
        format: AudioFormat,
    ) -> Result<Box<dyn SampleTap>, AudioError> {
        let cpal_device = find_cpal_device(device, Endpoint::for_capture(device))?;
        Ok(Box::new(CpalTap::open(cpal_device, device, format)?))
    }

    fn open_output(
        &self,
        device: &DeviceDescriptor,
        format: AudioFormat,
    ) -> Result<Box<dyn PcmSink>, AudioError> {
        let cpal_device = find_cpal_device(device, Endpoint::Render)?;
        Ok(Box::new(CpalPlayback::open(cpal_device, device, format)?))
    }
}

/// WASAPI can capture a render endpoint directly
fn native_loopback_supported() -> bool {
    cfg!(target_os = "windows")
}

fn max_channels<I, E>(configs: Result<I, E>) -> u16
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    configs
        .map(|iter| iter.map(|c| c.channels()).max().unwrap_or(0))
        .unwrap_or(0)
}

/// Side of an endpoint a stream is opened on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Capture,
    Render,
}

impl Endpoint {
    /// Loopback of a render device is opened on its render side
    pub(crate) fn for_capture(descriptor: &DeviceDescriptor) -> Self {
        if descriptor.is_loopback && descriptor.is_output() {
            Endpoint::Render
        } else {
            Endpoint::Capture
        }
    }
}

/// A host device as seen while looking a descriptor back up
struct EndpointCandidate<D> {
    device: D,
    name: String,
    has_input: bool,
    has_output: bool,
}

/// First candidate called `name` that can open `endpoint`.
///
/// Hosts may list a capture and a render endpoint under the same name
/// (hands-free headsets do), so the name alone is not enough.
fn select_endpoint<D>(
    candidates: impl IntoIterator<Item = EndpointCandidate<D>>,
    name: &str,
    endpoint: Endpoint,
) -> Option<D> {
    candidates
        .into_iter()
        .filter(|c| c.name == name)
        .find(|c| match endpoint {
            Endpoint::Capture => c.has_input,
            Endpoint::Render => c.has_output,
        })
        .map(|c| c.device)
}

fn has_configs<I, E>(configs: Result<I, E>) -> bool
where
    I: Iterator<Item = cpal::SupportedStreamConfigRange>,
{
    configs.map(|mut iter| iter.next().is_some()).unwrap_or(false)
}

/// Look a descriptor back up in its cpal host
pub(crate) fn find_cpal_device(descriptor: &DeviceDescriptor, endpoint: Endpoint) -> Result<cpal::Device, AudioError> {
    let host_id = cpal::available_hosts()
        .into_iter()
        .find(|id| id.name() == descriptor.host_api)
        .ok_or_else(|| {
            AudioError::DeviceNotFound(format!("audio host {} unavailable", descriptor.host_api))
        })?;
    let host = cpal::host_from_id(host_id).map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;
    let devices = host
        .devices()
        .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?;

    let candidates = devices.filter_map(|device| {
        let name = device.name().ok()?;
        if name != descriptor.name {
            return None;
        }
        let has_input = has_configs(device.supported_input_configs());
        let has_output = has_configs(device.supported_output_configs());
        Some(EndpointCandidate {
            device,
            name,
            has_input,
            has_output,
        })
    });

    select_endpoint(candidates, &descriptor.name, endpoint)
        .ok_or_else(|| AudioError::DeviceNotFound(format!("{} ({:?} endpoint)", descriptor.name, endpoint)))
}
