//! Playback of the client's microphone into a local output device
//!
//! The mic bridge writes PCM16LE into a [`PcmSink`]. [`CpalPlayback`] feeds a
//! sample queue that the cpal output callback drains; the callback never
//! blocks and plays silence on underrun, while the writer waits for room so
//! the client is naturally paced by the device clock.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::capture::{build_with_buffer_fallback, forward_stream_errors, StreamHandle};
use crate::audio::device::DeviceDescriptor;
use crate::error::AudioError;
use crate::protocol::AudioFormat;

/// Output buffered ahead of the device, in milliseconds
const PLAYBACK_BUFFER_MS: usize = 500;

/// Ceiling on queued samples whatever the client announces (500 ms of 8 ch at 384 kHz)
const MAX_PLAYBACK_SAMPLES: usize = 1_536_000;

/// Give up on a write when the device has not taken a sample for this long
const WRITE_STALL_LIMIT: Duration = Duration::from_millis(500);

/// Destination for PCM16LE audio
pub trait PcmSink: Send {
    /// Write interleaved PCM16LE; blocks while the device catches up
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;
}

/// Duplicate every 16-bit mono sample into a left/right pair.
/// A trailing odd byte is ignored.
pub fn mono_to_stereo(pcm: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len() * 2);
    for sample in pcm.chunks_exact(2) {
        out.extend_from_slice(sample);
        out.extend_from_slice(sample);
    }
    out
}

/// Samples queued ahead of the device for `format`
pub fn playback_queue_capacity(format: &AudioFormat) -> usize {
    let samples_per_second = (format.sample_rate as usize).saturating_mul(format.channels.max(1) as usize);
    (samples_per_second.saturating_mul(PLAYBACK_BUFFER_MS) / 1000).clamp(1, MAX_PLAYBACK_SAMPLES)
}

/// cpal output stream fed through a lock-free sample queue
pub struct CpalPlayback {
    stream: StreamHandle,
    queue: Arc<ArrayQueue<i16>>,
}

impl CpalPlayback {
    pub fn open(device: cpal::Device, descriptor: &DeviceDescriptor, format: AudioFormat) -> Result<Self, AudioError> {
        let queue = Arc::new(ArrayQueue::<i16>::new(playback_queue_capacity(&format)));
        let name = descriptor.name.clone();

        let stream_queue = queue.clone();
        let stream = StreamHandle::spawn(format!("playback-{}", descriptor.index), move |error_tx| {
            let sample_format = device
                .default_output_config()
                .map(|c| c.sample_format())
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            let stream = build_with_buffer_fallback(&format, |config| match sample_format {
                SampleFormat::F32 => build_output_stream::<f32>(&device, config, stream_queue.clone(), error_tx.clone()),
                SampleFormat::I16 => build_output_stream::<i16>(&device, config, stream_queue.clone(), error_tx.clone()),
                SampleFormat::U16 => build_output_stream::<u16>(&device, config, stream_queue.clone(), error_tx.clone()),
                other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
            })?;
            stream
                .play()
                .map_err(|e| AudioError::StreamError(e.to_string()))?;
            Ok(stream)
        })?;

        tracing::debug!(
            "Playback on {} ({} Hz, {} ch)",
            name,
            format.sample_rate,
            format.channels
        );

        Ok(Self { stream, queue })
    }
}

fn build_output_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: Arc<ArrayQueue<i16>>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<i16>,
{
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for slot in data.iter_mut() {
                    *slot = match queue.pop() {
                        Some(sample) => T::from_sample(sample),
                        None => T::EQUILIBRIUM,
                    };
                }
            },
            forward_stream_errors(error_tx),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

impl PcmSink for CpalPlayback {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        while let Some(err) = self.stream.check_errors() {
            if err.is_transient() {
                tracing::warn!("Playback warning: {}", err);
            } else {
                return Err(err);
            }
        }

        for bytes in pcm.chunks_exact(2) {
            let mut sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            let mut stalled_since: Option<Instant> = None;

            while let Err(rejected) = self.queue.push(sample) {
                sample = rejected;
                let since = *stalled_since.get_or_insert_with(Instant::now);
                if since.elapsed() > WRITE_STALL_LIMIT {
                    return Err(AudioError::DeviceError(
                        "output device stopped consuming audio".to_string(),
                    ));
                }
                thread::sleep(Duration::from_millis(2));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_to_stereo_duplicates_samples() {
        let mono = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(
            mono_to_stereo(&mono),
            vec![0x01, 0x02, 0x01, 0x02, 0x03, 0x04, 0x03, 0x04]
        );
    }

    #[test]
    fn test_mono_to_stereo_ignores_odd_byte() {
        assert_eq!(mono_to_stereo(&[0x10, 0x20, 0x30]), vec![0x10, 0x20, 0x10, 0x20]);
        assert!(mono_to_stereo(&[]).is_empty());
    }

    #[test]
    fn test_playback_capacity_ignores_block_size() {
        assert_eq!(playback_queue_capacity(&AudioFormat::pcm16(48000, 2, 960)), 48000);
        assert_eq!(playback_queue_capacity(&AudioFormat::pcm16(48000, 2, u32::MAX)), 48000);
        assert_eq!(playback_queue_capacity(&AudioFormat::pcm16(0, 2, 960)), 1);
        assert_eq!(
            playback_queue_capacity(&AudioFormat::pcm16(u32::MAX, u16::MAX, u32::MAX)),
            MAX_PLAYBACK_SAMPLES
        );
    }

    #[test]
    fn test_mono_to_stereo_doubles_length() {
        let mono = vec![0u8; 1920];
        assert_eq!(mono_to_stereo(&mono).len(), 3840);
    }
}
