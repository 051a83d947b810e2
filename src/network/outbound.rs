//! Desktop audio → client server
//!
//! Serves one client at a time. Each connection gets a `PCM1` header followed
//! by an endless PCM16LE stream from the configured [`FrameSource`]. When the
//! client leaves, the server goes back to accepting.

use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::audio::capture::FrameSource;
use crate::constants::STOP_POLL_INTERVAL;
use crate::error::{Error, NetworkError};
use crate::network::tcp::{accept_timeout, bind_listener, configure_stream, write_all_until, WriteOutcome};
use crate::network::{ServerState, ServerStats};
use crate::protocol::StreamHeader;

pub struct OutboundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    source: Box<dyn FrameSource>,
    write_timeout: Option<Duration>,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
}

impl OutboundServer {
    /// Bind `addr`; no client is accepted until [`run`](Self::run)
    pub fn bind(
        addr: SocketAddr,
        source: Box<dyn FrameSource>,
        write_timeout: Option<Duration>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        let listener = bind_listener(addr)?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            source,
            write_timeout,
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

    /// Accept and serve clients until the stop flag is raised
    pub fn run(mut self) {
        let format = self.source.format();
        tracing::info!(
            "Audio server on {} ({} Hz, {} ch, {} frames/block)",
            self.local_addr,
            format.sample_rate,
            format.channels,
            format.block_frames
        );

        while !self.stop.load(Ordering::SeqCst) {
            self.stats.set_state(ServerState::Listening);

            let (stream, peer) = match accept_timeout(&self.listener, STOP_POLL_INTERVAL, &self.stop) {
                Ok(Some(pair)) => pair,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    thread::sleep(Duration::from_millis(100));
                    continue;
                }
            };

            tracing::info!("Client connected: {}", peer);
            self.stats.record_connection();
            self.stats.set_state(ServerState::Serving);

            match self.serve(stream) {
                Ok(()) => tracing::info!("Client {} released", peer),
                Err(e) => tracing::info!("Client {} disconnected: {}", peer, e),
            }
        }

        self.stats.set_state(ServerState::Stopped);
        tracing::info!("Audio server on {} stopped", self.local_addr);
    }

    fn serve(&mut self, mut stream: TcpStream) -> Result<(), Error> {
        self.source.begin_session()?;
        let result = self.stream_frames(&mut stream);
        self.source.end_session();
        let _ = stream.shutdown(Shutdown::Both);
        result
    }

    fn stream_frames(&mut self, stream: &mut TcpStream) -> Result<(), Error> {
        configure_stream(stream).map_err(NetworkError::Connection)?;
        // Short socket timeout so a client that stops reading cannot hold off a stop request
        let poll = self
            .write_timeout
            .map_or(STOP_POLL_INTERVAL, |limit| limit.min(STOP_POLL_INTERVAL));
        stream
            .set_write_timeout(Some(poll))
            .map_err(NetworkError::Connection)?;

        let header = StreamHeader::outbound(self.source.format()).encode();
        if write_all_until(stream, &header, &self.stop, self.write_timeout)? == WriteOutcome::Stopped {
            return Ok(());
        }

        while !self.stop.load(Ordering::SeqCst) {
            let Some(frame) = self.source.next_frame(STOP_POLL_INTERVAL)? else {
                continue;
            };
            if frame.is_empty() {
                continue;
            }
            match write_all_until(stream, frame.as_bytes(), &self.stop, self.write_timeout)? {
                WriteOutcome::Written => self.stats.add_bytes(frame.len()),
                WriteOutcome::Stopped => break,
            }
        }
        Ok(())
    }
}
