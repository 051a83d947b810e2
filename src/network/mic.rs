//! Client microphone → desktop output device
//!
//! The client opens with a `MIC1` header describing its PCM16 stream, then
//! sends raw samples. TCP delivers arbitrary byte runs, so the payload is
//! re-aligned to whole frames before it reaches the output device. Mono
//! clients are widened to stereo when the device allows it.

use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::audio::playback::{mono_to_stereo, PcmSink};
use crate::audio::resolver::DeviceResolver;
use crate::constants::{MIC_RECV_CHUNK, STOP_POLL_INTERVAL};
use crate::error::{AudioError, Error, NetworkError, ProtocolError};
use crate::network::tcp::{accept_timeout, bind_listener, configure_stream, read_full, ReadOutcome};
use crate::network::{ServerState, ServerStats};
use crate::protocol::{StreamHeader, HEADER_LEN, MIC_MAGIC};

/// Re-aligns a byte stream to whole PCM frames
#[derive(Debug, Clone)]
pub struct Rechunker {
    frame_bytes: usize,
    carry: Vec<u8>,
}

impl Rechunker {
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            frame_bytes: frame_bytes.max(1),
            carry: Vec::with_capacity(frame_bytes),
        }
    }

    /// Append `data` and take the longest whole-frame prefix, keeping the
    /// remainder (always shorter than one frame) for the next call.
    pub fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        self.carry.extend_from_slice(data);
        let aligned = self.carry.len() - self.carry.len() % self.frame_bytes;
        if aligned == 0 {
            return None;
        }
        let rest = self.carry.split_off(aligned);
        Some(std::mem::replace(&mut self.carry, rest))
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> &[u8] {
        &self.carry
    }
}

/// Channel count to open the output with for a client sending `input_channels`
pub fn output_channels_for(input_channels: u16, max_output_channels: u16) -> Result<u16, AudioError> {
    let output = if input_channels == 1 && max_output_channels >= 2 {
        2
    } else {
        input_channels
    };
    if output > max_output_channels {
        return Err(AudioError::DeviceError(format!(
            "output supports {max_output_channels} channels, stream needs {output}"
        )));
    }
    Ok(output)
}

/// Copy the client's PCM into `sink` until EOF or stop, re-chunking on frame
/// boundaries and widening mono to stereo when `widen_mono` is set.
pub fn pump<R: Read>(
    reader: &mut R,
    sink: &mut dyn PcmSink,
    frame_bytes: usize,
    widen_mono: bool,
    stop: &AtomicBool,
    stats: &ServerStats,
) -> Result<(), Error> {
    let mut rechunker = Rechunker::new(frame_bytes);
    let mut buf = vec![0u8; MIC_RECV_CHUNK];

    while !stop.load(Ordering::SeqCst) {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NetworkError::Connection(e).into()),
        };
        stats.add_bytes(n);

        if let Some(chunk) = rechunker.push(&buf[..n]) {
            if widen_mono {
                sink.write(&mono_to_stereo(&chunk))?;
            } else {
                sink.write(&chunk)?;
            }
        }
    }

    if !rechunker.pending().is_empty() {
        tracing::debug!("Dropping {} bytes of incomplete frame", rechunker.pending().len());
    }
    Ok(())
}

pub struct MicBridgeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    resolver: Arc<DeviceResolver>,
    output_device: Option<usize>,
    handshake_timeout: Duration,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
}

impl MicBridgeServer {
    pub fn bind(
        addr: SocketAddr,
        resolver: Arc<DeviceResolver>,
        output_device: Option<usize>,
        handshake_timeout: Duration,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            resolver,
            output_device,
            handshake_timeout,
            stop,
            stats: Arc::new(ServerStats::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }

    /// Accept clients one at a time until the stop flag is raised.
    /// A failing client never takes the server down.
    pub fn run(self) {
        tracing::info!("Mic bridge listening on {}", self.local_addr);

        while !self.stop.load(Ordering::SeqCst) {
            self.stats.set_state(ServerState::Listening);

            let (stream, peer) = match accept_timeout(&self.listener, STOP_POLL_INTERVAL, &self.stop) {
                Ok(Some(pair)) => pair,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Mic accept failed: {}", e);
                    thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };

            tracing::info!("Mic client connected: {}", peer);
            self.stats.record_connection();

            match self.handle_client(&stream) {
                Ok(()) => {}
                Err(Error::Network(NetworkError::Connection(e))) => {
                    tracing::info!("Mic client {} disconnected: {}", peer, e)
                }
                Err(e) => tracing::warn!("Mic bridge error ({}): {}", peer, e),
            }
            let _ = stream.shutdown(Shutdown::Both);
            tracing::info!("Mic client {} closed", peer);
        }

        self.stats.set_state(ServerState::Stopped);
        tracing::info!("Mic bridge stopped");
    }

    fn handle_client(&self, stream: &TcpStream) -> Result<(), Error> {
        configure_stream(stream).map_err(NetworkError::Connection)?;
        stream
            .set_read_timeout(Some(STOP_POLL_INTERVAL))
            .map_err(NetworkError::Connection)?;

        self.stats.set_state(ServerState::Handshake);
        let mut reader = stream;
        let mut raw = [0u8; HEADER_LEN];
        let deadline = Instant::now() + self.handshake_timeout;
        match read_full(&mut reader, &mut raw, &self.stop, deadline)? {
            ReadOutcome::Filled => {}
            ReadOutcome::Closed(n) => return Err(ProtocolError::Truncated(n).into()),
            ReadOutcome::Stopped => return Ok(()),
        }
        let input = StreamHeader::decode(&raw, MIC_MAGIC)?.format;

        let device = self.resolver.resolve_mic_output_device(self.output_device)?;
        let output_channels = output_channels_for(input.channels, device.max_output_channels)?;
        let widen_mono = input.channels == 1 && output_channels == 2;
        tracing::info!(
            "Mic stream {} Hz, {} ch -> {} ({} ch)",
            input.sample_rate,
            input.channels,
            device.name,
            output_channels
        );

        let mut sink = self
            .resolver
            .catalog()
            .open_output(&device, input.with_channels(output_channels))?;

        self.stats.set_state(ServerState::Streaming);
        pump(
            &mut reader,
            sink.as_mut(),
            input.frame_bytes(),
            widen_mono,
            &self.stop,
            &self.stats,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Hands out its data at most `step` bytes per read
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[derive(Default)]
    struct CollectSink {
        writes: Vec<Vec<u8>>,
    }

    impl PcmSink for CollectSink {
        fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
            self.writes.push(pcm.to_vec());
            Ok(())
        }
    }

    fn pump_with_step(data: &[u8], frame_bytes: usize, widen: bool, step: usize) -> CollectSink {
        let mut reader = Trickle {
            data: data.to_vec(),
            pos: 0,
            step,
        };
        let mut sink = CollectSink::default();
        let stop = AtomicBool::new(false);
        pump(&mut reader, &mut sink, frame_bytes, widen, &stop, &ServerStats::new()).unwrap();
        sink
    }

    #[test]
    fn test_rechunker_holds_partial_frame() {
        let mut rechunker = Rechunker::new(4);
        assert_eq!(rechunker.push(&[1, 2, 3]), None);
        assert_eq!(rechunker.push(&[4, 5]), Some(vec![1, 2, 3, 4]));
        assert_eq!(rechunker.pending(), &[5]);
        assert_eq!(rechunker.push(&[6, 7, 8, 9, 10, 11, 12]), Some(vec![5, 6, 7, 8, 9, 10, 11, 12]));
        assert!(rechunker.pending().is_empty());
    }

    #[test]
    fn test_pump_preserves_bytes_for_any_split() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        for step in [1, 3, 17, 4096] {
            let sink = pump_with_step(&data, 4, false, step);
            assert!(sink.writes.iter().all(|w| w.len() % 4 == 0), "step {step}");
            assert_eq!(sink.writes.concat(), data, "step {step}");
        }
    }

    #[test]
    fn test_pump_widens_mono() {
        let mono: Vec<u8> = (0..1920u32).map(|i| (i % 256) as u8).collect();
        let sink = pump_with_step(&mono, 2, true, 1000);
        let played = sink.writes.concat();
        assert_eq!(played.len(), 3840);
        assert_eq!(played, mono_to_stereo(&mono));
    }

    #[test]
    fn test_pump_drops_trailing_partial_frame() {
        let sink = pump_with_step(&[1, 2, 3, 4, 5, 6, 7], 4, false, 3);
        assert_eq!(sink.writes.concat(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_pump_stops_on_flag() {
        let mut reader = Trickle {
            data: vec![0; 64],
            pos: 0,
            step: 8,
        };
        let mut sink = CollectSink::default();
        let stop = AtomicBool::new(true);
        pump(&mut reader, &mut sink, 2, false, &stop, &ServerStats::new()).unwrap();
        assert!(sink.writes.is_empty());
        assert_eq!(reader.pos, 0);
    }

    #[test]
    fn test_output_channels() {
        assert_eq!(output_channels_for(1, 2).unwrap(), 2);
        assert_eq!(output_channels_for(1, 1).unwrap(), 1);
        assert_eq!(output_channels_for(2, 8).unwrap(), 2);
        assert!(matches!(output_channels_for(4, 2), Err(AudioError::DeviceError(_))));
    }

    proptest! {
        #[test]
        fn prop_rechunker_emits_whole_frames_in_order(
            data in proptest::collection::vec(any::<u8>(), 0..2048),
            cuts in proptest::collection::vec(1usize..64, 1..64),
            frame_bytes in 1usize..9,
        ) {
            let mut rechunker = Rechunker::new(frame_bytes);
            let mut out = Vec::new();
            let mut pos = 0;
            let mut cut = cuts.iter().cycle();
            while pos < data.len() {
                let end = (pos + cut.next().copied().unwrap_or(1)).min(data.len());
                if let Some(chunk) = rechunker.push(&data[pos..end]) {
                    prop_assert_eq!(chunk.len() % frame_bytes, 0);
                    out.extend_from_slice(&chunk);
                }
                pos = end;
            }
            prop_assert!(rechunker.pending().len() < frame_bytes);
            let expected = data.len() - data.len() % frame_bytes;
            prop_assert_eq!(&out[..], &data[..expected]);
        }
    }
}
