//! End-to-end bridge tests over loopback TCP with an in-memory device catalog

use parking_lot::Mutex;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pcm_bridge::audio::buffer::{FrameBuffer, SharedFrameQueue};
use pcm_bridge::audio::capture::{FrameSource, PollingSource, SampleTap, StreamHandle};
use pcm_bridge::audio::device::{DeviceCatalog, DeviceDescriptor, DeviceInventory};
use pcm_bridge::audio::playback::PcmSink;
use pcm_bridge::config::{MicBridgeConfig, OutboundConfig};
use pcm_bridge::error::{AudioError, Error};
use pcm_bridge::protocol::{HEADER_LEN, MIC_MAGIC, OUTBOUND_MAGIC};
use pcm_bridge::{AudioFormat, BridgeSupervisor, StreamHeader};

/// Stops the fake capture thread when the stream handle drops it
struct ProducerGuard(Arc<AtomicBool>);

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct CollectSink(Arc<Mutex<Vec<u8>>>);

impl PcmSink for CollectSink {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        self.0.lock().extend_from_slice(pcm);
        Ok(())
    }
}

#[derive(Default)]
struct FakeCatalog {
    devices: Vec<DeviceDescriptor>,
    played: Arc<Mutex<Vec<u8>>>,
    opened_outputs: Arc<Mutex<Vec<AudioFormat>>>,
}

impl FakeCatalog {
    fn desktop() -> Self {
        Self {
            devices: vec![
                device(0, "Stereo Mix (Realtek Audio)", 2, 0, true),
                device(1, "Speakers (Realtek Audio)", 0, 2, false),
                device(2, "CABLE Input (VB-Audio Virtual Cable)", 0, 2, false),
            ],
            ..Default::default()
        }
    }
}

fn device(index: usize, name: &str, input: u16, output: u16, is_loopback: bool) -> DeviceDescriptor {
    DeviceDescriptor {
        index,
        name: name.to_string(),
        host_api: "Fake".to_string(),
        max_input_channels: input,
        max_output_channels: output,
        is_loopback,
    }
}

impl DeviceCatalog for FakeCatalog {
    fn inventory(&self) -> Result<DeviceInventory, AudioError> {
        Ok(DeviceInventory {
            devices: self.devices.clone(),
            default_input: None,
            default_output: self.devices.iter().find(|d| d.is_output()).map(|d| d.index),
            native_loopback: false,
        })
    }

    fn open_block_capture(
        &self,
        _device: &DeviceDescriptor,
        format: AudioFormat,
        queue: SharedFrameQueue,
    ) -> Result<StreamHandle, AudioError> {
        StreamHandle::spawn("fake-capture", move |_errors| {
            let running = Arc::new(AtomicBool::new(true));
            let producer_running = running.clone();
            thread::spawn(move || {
                let block: Vec<u8> = (0..format.block_bytes()).map(|i| (i % 200 + 1) as u8).collect();
                while producer_running.load(Ordering::SeqCst) {
                    queue.push_bytes(&block, format.channels);
                    thread::sleep(format.block_duration());
                }
            });
            Ok(ProducerGuard(running))
        })
    }

    fn open_tap(&self, _device: &DeviceDescriptor, _format: AudioFormat) -> Result<Box<dyn SampleTap>, AudioError> {
        Err(AudioError::DeviceNotFound("no taps in this catalog".into()))
    }

    fn open_output(&self, _device: &DeviceDescriptor, format: AudioFormat) -> Result<Box<dyn PcmSink>, AudioError> {
        self.opened_outputs.lock().push(format);
        Ok(Box::new(CollectSink(self.played.clone())))
    }
}

/// Hands out large frames as fast as the socket takes them
struct FloodSource {
    format: AudioFormat,
    sequence: u32,
}

impl FrameSource for FloodSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn begin_session(&mut self) -> Result<(), AudioError> {
        Ok(())
    }

    fn next_frame(&mut self, _timeout: Duration) -> Result<Option<FrameBuffer>, AudioError> {
        self.sequence = self.sequence.wrapping_add(1);
        Ok(Some(FrameBuffer::new(vec![0x55u8; 64 * 1024], self.format.channels, self.sequence)))
    }
}

fn local_outbound() -> OutboundConfig {
    OutboundConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        block_frames: 480,
        ..Default::default()
    }
}

fn local_mic() -> MicBridgeConfig {
    MicBridgeConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        handshake_timeout_ms: 2000,
        ..Default::default()
    }
}

fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

fn read_header(stream: &mut TcpStream) -> StreamHeader {
    let mut raw = [0u8; HEADER_LEN];
    stream.read_exact(&mut raw).unwrap();
    StreamHeader::decode(&raw, OUTBOUND_MAGIC).unwrap()
}

/// A well-behaved mic client gets its audio played
fn assert_mic_client_served(addr: SocketAddr, played: &Arc<Mutex<Vec<u8>>>) {
    let before = played.lock().len();
    let mut good = connect(addr);
    good.write_all(&StreamHeader::mic(AudioFormat::pcm16(48000, 2, 960)).encode())
        .unwrap();
    good.write_all(&[7u8; 400]).unwrap();
    wait_for("audio from a later client", || played.lock().len() == before + 400);
}

fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

/// True once the server has closed the connection
fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}

#[test]
fn outbound_sends_header_then_audio() {
    let supervisor = BridgeSupervisor::with_catalog(Arc::new(FakeCatalog::desktop()));
    let addr = supervisor.start_outbound_bridge(&local_outbound()).unwrap();

    let mut client = connect(addr);
    let header = read_header(&mut client);
    assert_eq!(header.format, AudioFormat::pcm16(48000, 2, 480));

    let start = Instant::now();
    let mut chunk = [0u8; 1920];
    client.read_exact(&mut chunk).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(chunk.iter().any(|&b| b != 0));

    supervisor.stop();
}

#[test]
fn outbound_serves_next_client_after_disconnect() {
    let supervisor = BridgeSupervisor::with_catalog(Arc::new(FakeCatalog::desktop()));
    let addr = supervisor.start_outbound_bridge(&local_outbound()).unwrap();

    let mut first = connect(addr);
    read_header(&mut first);
    drop(first);

    let mut second = connect(addr);
    let header = read_header(&mut second);
    assert_eq!(header.magic, OUTBOUND_MAGIC);
    let mut chunk = [0u8; 64];
    second.read_exact(&mut chunk).unwrap();

    wait_for("second connection", || {
        supervisor.outbound_stats().is_some_and(|s| s.connections() == 2)
    });
    supervisor.stop();
}

#[test]
fn outbound_polling_sends_silence_while_idle() {
    struct IdleTap;

    impl SampleTap for IdleTap {
        fn read_available(&mut self) -> Result<Vec<f32>, AudioError> {
            Ok(Vec::new())
        }
    }

    let config = local_outbound();
    let sessions = Arc::new(AtomicUsize::new(0));
    let opened = sessions.clone();
    let source = PollingSource::new(config.format(), move || {
        opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(IdleTap) as Box<dyn SampleTap>)
    });

    let supervisor = BridgeSupervisor::with_catalog(Arc::new(FakeCatalog::desktop()));
    let addr = supervisor.start_outbound_with_source(&config, Box::new(source)).unwrap();

    let mut client = connect(addr);
    read_header(&mut client);
    let mut block = vec![0xAAu8; config.format().block_bytes()];
    client.read_exact(&mut block).unwrap();
    assert!(block.iter().all(|&b| b == 0));
    assert_eq!(sessions.load(Ordering::SeqCst), 1);

    supervisor.stop();
}

#[test]
fn outbound_evicts_client_that_stops_reading() {
    let config = OutboundConfig {
        write_timeout_ms: 200,
        ..local_outbound()
    };
    let source = FloodSource {
        format: config.format(),
        sequence: 0,
    };
    let supervisor = BridgeSupervisor::with_catalog(Arc::new(FakeCatalog::desktop()));
    let addr = supervisor.start_outbound_with_source(&config, Box::new(source)).unwrap();

    // Reads the header, then nothing more
    let mut stalled = connect(addr);
    read_header(&mut stalled);

    let start = Instant::now();
    let mut next = connect(addr);
    let header = read_header(&mut next);
    assert_eq!(header.magic, OUTBOUND_MAGIC);
    assert!(start.elapsed() < Duration::from_secs(4));
    assert!(supervisor.outbound_stats().is_some_and(|s| s.connections() == 2));

    drop(stalled);
    supervisor.stop();
}

#[test]
fn outbound_stop_is_prompt_while_client_stalls() {
    let config = local_outbound();
    assert_eq!(config.write_timeout(), Some(Duration::from_secs(5)));
    let source = FloodSource {
        format: config.format(),
        sequence: 0,
    };
    let supervisor = BridgeSupervisor::with_catalog(Arc::new(FakeCatalog::desktop()));
    let addr = supervisor.start_outbound_with_source(&config, Box::new(source)).unwrap();

    let mut stalled = connect(addr);
    read_header(&mut stalled);
    thread::sleep(Duration::from_millis(300));

    let start = Instant::now();
    supervisor.stop();
    assert!(start.elapsed() < Duration::from_millis(2500));
    assert!(!supervisor.is_outbound_running());
}

#[test]
fn mic_mono_stream_is_widened_to_stereo() {
    let catalog = Arc::new(FakeCatalog::desktop());
    let played = catalog.played.clone();
    let opened = catalog.opened_outputs.clone();
    let supervisor = BridgeSupervisor::with_catalog(catalog);
    let addr = supervisor.start_mic_bridge(&local_mic()).unwrap();

    let mono: Vec<u8> = (0..1920u32).map(|i| (i % 256) as u8).collect();
    let mut client = connect(addr);
    client
        .write_all(&StreamHeader::mic(AudioFormat::pcm16(48000, 1, 480)).encode())
        .unwrap();
    // Odd-sized writes so the server sees frames split across reads
    for piece in mono.chunks(333) {
        client.write_all(piece).unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    wait_for("widened audio", || played.lock().len() >= 3840);
    let played = played.lock().clone();
    assert_eq!(played.len(), 3840);
    for (i, pair) in played.chunks_exact(4).enumerate() {
        assert_eq!(&pair[0..2], &mono[i * 2..i * 2 + 2]);
        assert_eq!(&pair[2..4], &mono[i * 2..i * 2 + 2]);
    }
    assert_eq!(opened.lock().as_slice(), &[AudioFormat::pcm16(48000, 2, 480)]);

    supervisor.stop();
}

#[test]
fn mic_rejects_bad_magic_and_keeps_serving() {
    let catalog = Arc::new(FakeCatalog::desktop());
    let played = catalog.played.clone();
    let supervisor = BridgeSupervisor::with_catalog(catalog);
    let addr = supervisor.start_mic_bridge(&local_mic()).unwrap();

    let mut bad = connect(addr);
    bad.write_all(&StreamHeader::outbound(AudioFormat::default()).encode())
        .unwrap();
    assert!(closed_by_server(&mut bad));
    assert!(played.lock().is_empty());

    assert_mic_client_served(addr, &played);

    supervisor.stop();
}

#[test]
fn mic_drops_truncated_header_and_keeps_serving() {
    let catalog = Arc::new(FakeCatalog::desktop());
    let played = catalog.played.clone();
    let opened = catalog.opened_outputs.clone();
    let supervisor = BridgeSupervisor::with_catalog(catalog);
    let addr = supervisor.start_mic_bridge(&local_mic()).unwrap();

    let mut short = connect(addr);
    let header = StreamHeader::mic(AudioFormat::default()).encode();
    short.write_all(&header[..7]).unwrap();
    short.shutdown(Shutdown::Write).unwrap();
    assert!(closed_by_server(&mut short));
    assert!(opened.lock().is_empty());

    assert_mic_client_served(addr, &played);

    supervisor.stop();
}

#[test]
fn mic_rejects_oversized_block_and_keeps_serving() {
    let catalog = Arc::new(FakeCatalog::desktop());
    let played = catalog.played.clone();
    let opened = catalog.opened_outputs.clone();
    let supervisor = BridgeSupervisor::with_catalog(catalog);
    let addr = supervisor.start_mic_bridge(&local_mic()).unwrap();

    for format in [
        AudioFormat::pcm16(48000, 2, u32::MAX),
        AudioFormat::pcm16(0, 2, 960),
        AudioFormat::pcm16(u32::MAX, 2, 960),
    ] {
        let mut greedy = connect(addr);
        greedy.write_all(&StreamHeader::mic(format).encode()).unwrap();
        assert!(closed_by_server(&mut greedy), "{format:?}");
    }
    assert!(opened.lock().is_empty());

    assert_mic_client_served(addr, &played);
    assert_eq!(opened.lock().len(), 1);

    supervisor.stop();
}

#[test]
fn mic_rejects_more_channels_than_output_has() {
    let catalog = Arc::new(FakeCatalog::desktop());
    let opened = catalog.opened_outputs.clone();
    let supervisor = BridgeSupervisor::with_catalog(catalog);
    let addr = supervisor.start_mic_bridge(&local_mic()).unwrap();

    let mut client = connect(addr);
    client
        .write_all(&StreamHeader::mic(AudioFormat::pcm16(48000, 4, 960)).encode())
        .unwrap();
    assert!(closed_by_server(&mut client));
    assert!(opened.lock().is_empty());

    supervisor.stop();
}

#[test]
fn mic_bridge_needs_an_output_device() {
    let catalog = FakeCatalog {
        devices: vec![device(0, "Microphone", 1, 0, false)],
        ..Default::default()
    };
    let supervisor = BridgeSupervisor::with_catalog(Arc::new(catalog));
    let err = supervisor.start_mic_bridge(&local_mic()).unwrap_err();
    assert!(matches!(err, Error::Audio(AudioError::DeviceNotFound(_))));
    assert!(!supervisor.is_mic_running());
}

#[test]
fn stop_is_prompt_and_bridges_restart() {
    let supervisor = BridgeSupervisor::with_catalog(Arc::new(FakeCatalog::desktop()));
    let out_addr = supervisor.start_outbound_bridge(&local_outbound()).unwrap();
    supervisor.start_mic_bridge(&local_mic()).unwrap();

    assert!(matches!(
        supervisor.start_mic_bridge(&local_mic()),
        Err(Error::AlreadyRunning("mic"))
    ));

    // One client mid-stream, one connected mic client that never sends a header
    let mut listener = connect(out_addr);
    read_header(&mut listener);
    let _silent_mic = connect(supervisor.mic_addr().unwrap());

    let start = Instant::now();
    supervisor.stop();
    assert!(start.elapsed() < Duration::from_secs(3));
    assert!(!supervisor.is_outbound_running());
    assert!(!supervisor.is_mic_running());
    assert!(supervisor.outbound_state().is_none());

    supervisor.start_outbound_bridge(&local_outbound()).unwrap();
    assert!(supervisor.is_outbound_running());
    supervisor.stop();
}
