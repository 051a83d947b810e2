//! Device selection for both bridges
//!
//! The selection policies are plain functions over a [`DeviceInventory`], so
//! they can be exercised without hardware. [`DeviceResolver`] binds them to a
//! live [`DeviceCatalog`] and takes a fresh snapshot on every call: output
//! devices come and go (virtual cable drivers get reinstalled, headsets get
//! unplugged) and must not be cached between mic bridge connections.

use std::sync::Arc;

use crate::audio::device::{DeviceCatalog, DeviceDescriptor, DeviceInventory};
use crate::error::AudioError;

/// Input names that expose the system mix as a capture source
pub const LOOPBACK_KEYWORDS: &[&str] = &["mezcla estereo", "stereo mix", "what u hear", "loopback"];

/// Substrings identifying the virtual cable the mic bridge plays into
pub const VIRTUAL_CABLE_HINTS: &[&str] = &["cable input", "vb-audio", "virtual cable"];

/// All of these present means the exact preferred virtual cable endpoint
const PREFERRED_MIC_OUTPUT_HINTS: &[&str] = &["cable input", "vb-audio virtual c", "vb-audio virtual cable"];

/// What a scoring rule looks at
#[derive(Debug, Clone, Copy)]
pub enum Matcher {
    NameContains(&'static str),
    NameContainsAll(&'static [&'static str]),
    NameContainsAny(&'static [&'static str]),
    HostApiContains(&'static str),
}

impl Matcher {
    fn matches(&self, name: &str, host_api: &str) -> bool {
        match self {
            Matcher::NameContains(hint) => name.contains(hint),
            Matcher::NameContainsAll(hints) => hints.iter().all(|h| name.contains(h)),
            Matcher::NameContainsAny(hints) => hints.iter().any(|h| name.contains(h)),
            Matcher::HostApiContains(hint) => host_api.contains(hint),
        }
    }
}

/// A `(matcher, score_delta)` pair; all matching rules add up
#[derive(Debug, Clone, Copy)]
pub struct ScoreRule {
    pub matcher: Matcher,
    pub delta: i32,
}

/// Ranking of candidate outputs for the mic bridge
pub const MIC_OUTPUT_RULES: &[ScoreRule] = &[
    ScoreRule { matcher: Matcher::NameContainsAll(PREFERRED_MIC_OUTPUT_HINTS), delta: 250 },
    ScoreRule { matcher: Matcher::NameContains("cable input"), delta: 180 },
    ScoreRule { matcher: Matcher::NameContainsAny(&["vb-audio", "virtual cable"]), delta: 100 },
    // cpal has no MME host; only catalogs that report one get this bonus.
    ScoreRule { matcher: Matcher::HostApiContains("mme"), delta: 40 },
    // The capture side of the same cable: playing into it would loop back to us.
    ScoreRule { matcher: Matcher::NameContains("cable output"), delta: -160 },
    ScoreRule { matcher: Matcher::NameContains("16ch"), delta: -20 },
];

/// Evaluate `rules` against a device (case-insensitive)
pub fn score_device(device: &DeviceDescriptor, rules: &[ScoreRule]) -> i32 {
    let name = device.name.to_lowercase();
    let host_api = device.host_api.to_lowercase();
    rules
        .iter()
        .filter(|rule| rule.matcher.matches(&name, &host_api))
        .map(|rule| rule.delta)
        .sum()
}

/// Lowercase, collapse non-alphanumeric runs into single spaces, trim
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn is_loopback_name(name: &str) -> bool {
    let lowered = name.to_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

pub fn is_virtual_cable_name(name: &str) -> bool {
    let lowered = name.to_lowercase();
    VIRTUAL_CABLE_HINTS.iter().any(|h| lowered.contains(h))
}

/// Capture device for the callback backend
pub fn select_loopback_capture(
    inventory: &DeviceInventory,
    explicit: Option<usize>,
) -> Result<DeviceDescriptor, AudioError> {
    if let Some(index) = explicit {
        let device = inventory
            .get(index)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("capture device {index}")))?;
        if !device.is_input() {
            return Err(AudioError::DeviceError(format!(
                "{} has no input channels",
                device.name
            )));
        }
        return Ok(device.clone());
    }

    if inventory.native_loopback {
        if let Some(device) = inventory.default_output_device().filter(|d| d.is_loopback) {
            return Ok(device.clone());
        }
    }

    inventory
        .capture_devices()
        .find(|d| is_loopback_name(&d.name))
        .cloned()
        .ok_or_else(|| {
            AudioError::DeviceNotFound(
                "no loopback device; enable \"Stereo Mix\" or select a device explicitly".to_string(),
            )
        })
}

/// Output device the mic bridge plays the remote microphone into
pub fn select_mic_output(
    inventory: &DeviceInventory,
    explicit: Option<usize>,
) -> Result<DeviceDescriptor, AudioError> {
    if let Some(index) = explicit {
        let device = inventory
            .get(index)
            .ok_or_else(|| AudioError::DeviceNotFound(format!("output device {index}")))?;
        if !device.is_output() {
            return Err(AudioError::DeviceError(format!(
                "{} has no output channels",
                device.name
            )));
        }
        return Ok(device.clone());
    }

    let best = inventory
        .output_devices()
        .map(|d| (score_device(d, MIC_OUTPUT_RULES), d))
        .max_by_key(|(score, d)| (*score, d.index));
    if let Some((score, device)) = best {
        if score > 0 {
            return Ok(device.clone());
        }
    }

    if let Some(device) = inventory.default_output_device().filter(|d| d.is_output()) {
        return Ok(device.clone());
    }

    inventory
        .output_devices()
        .next()
        .cloned()
        .ok_or_else(|| AudioError::DeviceNotFound("no output device for the mic bridge".to_string()))
}

/// Capture device for the polling backend
pub fn select_mic_source(
    inventory: &DeviceInventory,
    explicit: Option<usize>,
) -> Result<DeviceDescriptor, AudioError> {
    let captures: Vec<&DeviceDescriptor> = inventory.capture_devices().collect();
    if captures.is_empty() {
        return Err(AudioError::DeviceNotFound("no capture devices".to_string()));
    }

    if let Some(index) = explicit {
        return captures
            .iter()
            .find(|d| d.index == index)
            .map(|d| (*d).clone())
            .ok_or_else(|| AudioError::DeviceNotFound(format!("capture device {index}")));
    }

    let loopbacks: Vec<&DeviceDescriptor> = captures.iter().copied().filter(|d| d.is_loopback).collect();
    let Some(first_loopback) = loopbacks.first() else {
        return Ok(captures[0].clone());
    };

    // Follow whatever the user is currently listening on.
    if let Some(default) = inventory.default_output_device() {
        let default_name = normalize_name(&default.name);
        if !default_name.is_empty() {
            let matching = loopbacks.iter().find(|candidate| {
                let candidate_name = normalize_name(&candidate.name);
                !candidate_name.is_empty()
                    && (candidate_name.contains(&default_name) || default_name.contains(&candidate_name))
            });
            if let Some(device) = matching {
                return Ok((*device).clone());
            }
        }
    }

    // Never pick the cable the mic bridge injects into; that would feed the client its own voice.
    let device = loopbacks
        .iter()
        .find(|d| !is_virtual_cable_name(&d.name))
        .unwrap_or(first_loopback);
    Ok((*device).clone())
}

/// Device resolver shared by the supervisor and both bridges
pub struct DeviceResolver {
    catalog: Arc<dyn DeviceCatalog>,
}

impl DeviceResolver {
    pub fn new(catalog: Arc<dyn DeviceCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<dyn DeviceCatalog> {
        &self.catalog
    }

    pub fn inventory(&self) -> Result<DeviceInventory, AudioError> {
        self.catalog.inventory()
    }

    pub fn enumerate_capture_devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        Ok(self.inventory()?.capture_devices().cloned().collect())
    }

    pub fn enumerate_output_devices(&self) -> Result<Vec<DeviceDescriptor>, AudioError> {
        Ok(self.inventory()?.output_devices().cloned().collect())
    }

    pub fn resolve_loopback_capture(&self, explicit: Option<usize>) -> Result<DeviceDescriptor, AudioError> {
        select_loopback_capture(&self.inventory()?, explicit)
    }

    pub fn resolve_mic_output_device(&self, explicit: Option<usize>) -> Result<DeviceDescriptor, AudioError> {
        select_mic_output(&self.inventory()?, explicit)
    }

    pub fn resolve_mic_source_device(&self, explicit: Option<usize>) -> Result<DeviceDescriptor, AudioError> {
        select_mic_source(&self.inventory()?, explicit)
    }
}
