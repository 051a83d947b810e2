//! Audio capture for the outbound bridge
//!
//! Two interchangeable [`FrameSource`] implementations:
//!
//! - [`CallbackSource`]: the audio host calls us once per block on its
//!   real-time thread; the block is copied into a [`BoundedFrameQueue`]
//!   and the serving thread dequeues it. Capture runs for the lifetime of
//!   the bridge, across client reconnects.
//! - [`PollingSource`]: a recorder is opened per connection and the serving
//!   thread polls it for whatever audio is available, sending silence when
//!   there is none so the client never times out.
//!
//! [`BoundedFrameQueue`]: crate::audio::buffer::BoundedFrameQueue

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::buffer::{create_shared_queue, FrameBuffer, SharedFrameQueue};
use crate::audio::device::{DeviceCatalog, DeviceDescriptor, Endpoint};
use crate::audio::resolver::DeviceResolver;
use crate::config::{CaptureBackend, OutboundConfig};
use crate::constants::{FRAME_QUEUE_CAPACITY, MIN_IDLE_SLEEP};
use crate::error::{AudioError, Error};
use crate::protocol::AudioFormat;

/// Captured chunks a [`CpalTap`] holds before dropping new ones
const TAP_BACKLOG: usize = 64;

/// Producer of PCM16 frames for one outbound bridge
pub trait FrameSource: Send {
    /// Format of every frame this source yields
    fn format(&self) -> AudioFormat;

    /// A new client connected
    fn begin_session(&mut self) -> Result<(), AudioError>;

    /// Wait up to `timeout` for the next frame
    fn next_frame(&mut self, timeout: Duration) -> Result<Option<FrameBuffer>, AudioError>;

    /// The client went away
    fn end_session(&mut self) {}
}

/// Recorder that hands out whatever interleaved float samples arrived since the last call
pub trait SampleTap: Send {
    fn read_available(&mut self) -> Result<Vec<f32>, AudioError>;
}

/// Keeps an audio stream alive on a dedicated thread
///
/// cpal streams are not `Send` on every platform, so the stream is built,
/// played and dropped on the same thread. Errors reported by the stream's
/// error callback are forwarded through a bounded channel.
pub struct StreamHandle {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<AudioError>,
}

impl StreamHandle {
    /// Run `build` on a new thread named `name` and keep its result alive until stopped.
    ///
    /// Returns once the stream is playing, or with the error `build` produced.
    pub fn spawn<S, F>(name: impl Into<String>, build: F) -> Result<Self, AudioError>
    where
        S: 'static,
        F: FnOnce(Sender<AudioError>) -> Result<S, AudioError> + Send + 'static,
    {
        let name = name.into();
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let (error_tx, error_rx) = bounded::<AudioError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let stream = match build(error_tx) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }

                // Stream is dropped here, stopping it
                drop(stream);
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                running,
                thread_handle: Some(handle),
                error_rx,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::StreamError(format!("{name} exited during startup")))
            }
        }
    }

    /// Stop the stream and join its thread
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Next error reported by the stream, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.try_recv().ok()
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Error callback shared by every stream we build
pub(crate) fn forward_stream_errors(error_tx: Sender<AudioError>) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        let err = match err {
            cpal::StreamError::DeviceNotAvailable => {
                AudioError::DeviceError("audio device is no longer available".to_string())
            }
            other => AudioError::CaptureTransient(other.to_string()),
        };
        let _ = error_tx.try_send(err);
    }
}

/// Build a stream asking for `block_frames`-sized callbacks, retrying with the
/// host's default buffer size when the device rejects a fixed size.
pub(crate) fn build_with_buffer_fallback<F>(format: &AudioFormat, mut build: F) -> Result<cpal::Stream, AudioError>
where
    F: FnMut(&StreamConfig) -> Result<cpal::Stream, AudioError>,
{
    let mut config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    if format.block_frames > 0 {
        config.buffer_size = BufferSize::Fixed(format.block_frames);
        match build(&config) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(
                    "Fixed buffer of {} frames rejected ({}), using host default",
                    format.block_frames,
                    e
                );
                config.buffer_size = BufferSize::Default;
            }
        }
    }

    build(&config)
}

fn input_sample_format(device: &cpal::Device, descriptor: &DeviceDescriptor) -> Result<SampleFormat, AudioError> {
    let supported = if Endpoint::for_capture(descriptor) == Endpoint::Render {
        device.default_output_config()
    } else {
        device.default_input_config()
    };
    supported
        .map(|c| c.sample_format())
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Convert one callback's samples to PCM16LE, reusing `scratch`'s allocation
fn encode_pcm16<T>(scratch: &mut Vec<u8>, data: &[T])
where
    T: Sample,
    i16: FromSample<T>,
{
    scratch.clear();
    for &sample in data {
        let pcm: i16 = i16::from_sample(sample);
        scratch.extend_from_slice(&pcm.to_le_bytes());
    }
}

fn build_block_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    block_frames: u32,
    queue: SharedFrameQueue,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    i16: FromSample<T>,
{
    let channels = config.channels;
    let callback_frames = match config.buffer_size {
        BufferSize::Fixed(frames) => frames,
        BufferSize::Default => block_frames,
    };
    let mut scratch: Vec<u8> = Vec::with_capacity(callback_frames as usize * channels as usize * 2);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                encode_pcm16(&mut scratch, data);
                // Never blocks; evicts the oldest block when the consumer falls behind
                queue.push_bytes(&scratch, channels);
            },
            forward_stream_errors(error_tx),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Start callback-driven capture on a cpal device, feeding `queue`
pub(crate) fn start_block_capture(
    device: cpal::Device,
    descriptor: &DeviceDescriptor,
    format: AudioFormat,
    queue: SharedFrameQueue,
) -> Result<StreamHandle, AudioError> {
    let descriptor = descriptor.clone();

    StreamHandle::spawn(format!("capture-{}", descriptor.index), move |error_tx| {
        let sample_format = input_sample_format(&device, &descriptor)?;
        let stream = build_with_buffer_fallback(&format, |config| match sample_format {
            SampleFormat::F32 => build_block_stream::<f32>(&device, config, format.block_frames, queue.clone(), error_tx.clone()),
            SampleFormat::I16 => build_block_stream::<i16>(&device, config, format.block_frames, queue.clone(), error_tx.clone()),
            SampleFormat::U16 => build_block_stream::<u16>(&device, config, format.block_frames, queue.clone(), error_tx.clone()),
            other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
        })?;
        stream
            .play()
            .map_err(|e| AudioError::StreamError(e.to_string()))?;
        tracing::debug!("Block capture running on {}", descriptor.name);
        Ok(stream)
    })
}

/// cpal-backed [`SampleTap`]
pub struct CpalTap {
    stream: StreamHandle,
    samples_rx: Receiver<Vec<f32>>,
}

impl CpalTap {
    pub fn open(device: cpal::Device, descriptor: &DeviceDescriptor, format: AudioFormat) -> Result<Self, AudioError> {
        let descriptor = descriptor.clone();
        let (samples_tx, samples_rx) = bounded::<Vec<f32>>(TAP_BACKLOG);

        let stream = StreamHandle::spawn(format!("tap-{}", descriptor.index), move |error_tx| {
            let sample_format = input_sample_format(&device, &descriptor)?;
            let stream = build_with_buffer_fallback(&format, |config| match sample_format {
                SampleFormat::F32 => build_tap_stream::<f32>(&device, config, samples_tx.clone(), error_tx.clone()),
                SampleFormat::I16 => build_tap_stream::<i16>(&device, config, samples_tx.clone(), error_tx.clone()),
                SampleFormat::U16 => build_tap_stream::<u16>(&device, config, samples_tx.clone(), error_tx.clone()),
                other => Err(AudioError::UnsupportedFormat(format!("{other:?}"))),
            })?;
            stream
                .play()
                .map_err(|e| AudioError::StreamError(e.to_string()))?;
            Ok(stream)
        })?;

        Ok(Self { stream, samples_rx })
    }
}

fn build_tap_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples_tx: Sender<Vec<f32>>,
    error_tx: Sender<AudioError>,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                let _ = samples_tx.try_send(samples);
            },
            forward_stream_errors(error_tx),
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

impl SampleTap for CpalTap {
    fn read_available(&mut self) -> Result<Vec<f32>, AudioError> {
        if let Some(err) = self.stream.check_errors() {
            return Err(err);
        }
        let mut samples = Vec::new();
        for chunk in self.samples_rx.try_iter() {
            samples.extend_from_slice(&chunk);
        }
        Ok(samples)
    }
}

type StreamOpener = Box<dyn FnMut(SharedFrameQueue) -> Result<StreamHandle, AudioError> + Send>;

/// Event-driven source: capture callback → bounded queue → serving thread
pub struct CallbackSource {
    format: AudioFormat,
    queue: SharedFrameQueue,
    stream: Option<StreamHandle>,
    opener: Option<StreamOpener>,
    device_lost: bool,
}

impl CallbackSource {
    /// Source fed by whoever holds a clone of `queue`
    pub fn new(format: AudioFormat, queue: SharedFrameQueue) -> Self {
        Self {
            format,
            queue,
            stream: None,
            opener: None,
            device_lost: false,
        }
    }

    /// Start capturing `device` right away; capture outlives individual connections
    pub fn open(
        catalog: Arc<dyn DeviceCatalog>,
        device: DeviceDescriptor,
        format: AudioFormat,
    ) -> Result<Self, AudioError> {
        let queue = create_shared_queue(FRAME_QUEUE_CAPACITY);
        let mut opener: StreamOpener =
            Box::new(move |queue| catalog.open_block_capture(&device, format, queue));
        let stream = opener(queue.clone())?;

        Ok(Self {
            format,
            queue,
            stream: Some(stream),
            opener: Some(opener),
            device_lost: false,
        })
    }

    pub fn queue(&self) -> &SharedFrameQueue {
        &self.queue
    }
}

impl FrameSource for CallbackSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn begin_session(&mut self) -> Result<(), AudioError> {
        if self.device_lost {
            if let Some(opener) = self.opener.as_mut() {
                self.stream = None;
                self.stream = Some(opener(self.queue.clone())?);
                self.device_lost = false;
                tracing::info!("Capture stream reopened");
            }
        }

        let stale = self.queue.clear();
        if stale > 0 {
            tracing::debug!("Discarded {} stale blocks from the previous client", stale);
        }
        Ok(())
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<Option<FrameBuffer>, AudioError> {
        if let Some(stream) = &self.stream {
            while let Some(err) = stream.check_errors() {
                if err.is_transient() {
                    tracing::warn!("Capture warning: {}", err);
                } else {
                    self.device_lost = true;
                    return Err(err);
                }
            }
        }
        Ok(self.queue.pop_timeout(timeout))
    }
}

type TapOpener = Box<dyn FnMut() -> Result<Box<dyn SampleTap>, AudioError> + Send>;

/// Poll-based source: one recorder per connection, silence while idle
pub struct PollingSource {
    format: AudioFormat,
    opener: TapOpener,
    tap: Option<Box<dyn SampleTap>>,
    /// Samples of an incomplete trailing frame from the previous poll
    partial: Vec<f32>,
    silence: FrameBuffer,
    sequence: u32,
    /// Last poll came back empty
    idle: bool,
}

impl PollingSource {
    pub fn new<F>(format: AudioFormat, opener: F) -> Self
    where
        F: FnMut() -> Result<Box<dyn SampleTap>, AudioError> + Send + 'static,
    {
        Self {
            format,
            opener: Box::new(opener),
            tap: None,
            partial: Vec::new(),
            silence: FrameBuffer::silence(&format),
            sequence: 0,
            idle: false,
        }
    }

    /// Poll `device` through the catalog; the recorder opens when a client connects
    pub fn open(catalog: Arc<dyn DeviceCatalog>, device: DeviceDescriptor, format: AudioFormat) -> Self {
        Self::new(format, move || catalog.open_tap(&device, format))
    }

    fn idle_interval(&self) -> Duration {
        self.format.block_duration().max(MIN_IDLE_SLEEP)
    }

    /// One poll of the tap; `None` means an idle tick
    fn poll_tap(&mut self) -> Result<Option<FrameBuffer>, AudioError> {
        let tap = self
            .tap
            .as_mut()
            .ok_or_else(|| AudioError::StreamError("no capture session".to_string()))?;

        let samples = match tap.read_available() {
            Ok(samples) => samples,
            Err(e) if e.is_transient() => {
                tracing::warn!("Capture warning: {}", e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.partial.extend_from_slice(&samples);
        let channels = self.format.channels.max(1) as usize;
        let whole = self.partial.len() - self.partial.len() % channels;
        if whole == 0 {
            return Ok(None);
        }

        let frame = FrameBuffer::from_f32(&self.partial[..whole], self.format.channels, self.sequence);
        self.partial.drain(..whole);
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(frame))
    }
}

impl FrameSource for PollingSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn begin_session(&mut self) -> Result<(), AudioError> {
        self.tap = Some((self.opener)()?);
        self.partial.clear();
        self.idle = false;
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<FrameBuffer>, AudioError> {
        if self.idle {
            thread::sleep(self.idle_interval());
            self.idle = false;
        }
        if let Some(frame) = self.poll_tap()? {
            return Ok(Some(frame));
        }
        // Nothing captured: keep the client fed and back off before the next poll
        self.idle = true;
        Ok(Some(self.silence.clone()))
    }

    fn end_session(&mut self) {
        self.tap = None;
        self.partial.clear();
    }
}

/// Resolve the capture device for `config` and build the matching source
pub fn open_frame_source(resolver: &DeviceResolver, config: &OutboundConfig) -> Result<Box<dyn FrameSource>, Error> {
    let format = config.format();
    match config.backend.resolve() {
        CaptureBackend::Polling => {
            let device = resolver.resolve_mic_source_device(config.device)?;
            tracing::info!("Capture device (polling): {}", device);
            Ok(Box::new(PollingSource::open(resolver.catalog().clone(), device, format)))
        }
        _ => {
            let device = resolver.resolve_loopback_capture(config.device)?;
            tracing::info!("Capture device (callback): {}", device);
            let source = CallbackSource::open(resolver.catalog().clone(), device, format)?;
            Ok(Box::new(source))
        }
    }
}
