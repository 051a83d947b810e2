//! TCP socket plumbing shared by both bridges

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::{KEEPALIVE_IDLE, KEEPALIVE_INTERVAL};
use crate::error::NetworkError;

/// Pause between nonblocking accept attempts
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Resolve `host:port` to the first matching socket address
pub fn resolve_addr(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::InvalidAddress(format!("{host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| NetworkError::InvalidAddress(format!("{host}:{port} resolved to nothing")))
}

/// Bind a listener with address reuse and a backlog of one.
///
/// A second client waits in the backlog until the current one leaves. The
/// listener is nonblocking so accept loops can observe their stop flag.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener, NetworkError> {
    let bind_err = |e: io::Error| NetworkError::BindFailed(format!("{addr}: {e}"));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(1).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(socket.into())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Wait up to `timeout` for a client, returning early once `stop` is set
pub fn accept_timeout(
    listener: &TcpListener,
    timeout: Duration,
    stop: &AtomicBool,
) -> io::Result<Option<(TcpStream, SocketAddr)>> {
    let deadline = Instant::now() + timeout;
    loop {
        match listener.accept() {
            Ok(pair) => return Ok(Some(pair)),
            Err(e) if is_timeout(&e) => {
                if stop.load(Ordering::SeqCst) || Instant::now() >= deadline {
                    return Ok(None);
                }
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Blocking mode, no Nagle delay, and keepalive probing so dead peers are noticed
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    // Accepted sockets may inherit the listener's nonblocking flag
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "windows",
    ))]
    let keepalive = keepalive.with_interval(KEEPALIVE_INTERVAL);

    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        tracing::debug!("Keepalive tuning unavailable ({}), using system defaults", e);
        sock.set_keepalive(true)?;
    }
    Ok(())
}

/// How [`read_full`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Filled,
    /// Peer closed after this many bytes
    Closed(usize),
    /// The stop flag was raised
    Stopped,
}

/// Fill `buf` from a reader that has a short read timeout, checking `stop`
/// on every timeout and failing once `deadline` passes.
pub fn read_full<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    stop: &AtomicBool,
    deadline: Instant,
) -> Result<ReadOutcome, NetworkError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(ReadOutcome::Closed(filled)),
            Ok(n) => filled += n,
            Err(e) if is_timeout(&e) => {
                if stop.load(Ordering::SeqCst) {
                    return Ok(ReadOutcome::Stopped);
                }
                if Instant::now() >= deadline {
                    return Err(NetworkError::Timeout);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NetworkError::Connection(e)),
        }
    }
    Ok(ReadOutcome::Filled)
}

/// How [`write_all_until`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The stop flag was raised before everything went out
    Stopped,
}

/// Write all of `buf` to a writer that has a short write timeout.
///
/// `stop` is checked on every timeout. The write fails with
/// [`NetworkError::Timeout`] once no byte has been accepted for `stall_limit`.
pub fn write_all_until<W: Write>(
    writer: &mut W,
    buf: &[u8],
    stop: &AtomicBool,
    stall_limit: Option<Duration>,
) -> Result<WriteOutcome, NetworkError> {
    let mut written = 0;
    let mut last_progress = Instant::now();
    while written < buf.len() {
        match writer.write(&buf[written..]) {
            Ok(0) => {
                return Err(NetworkError::Connection(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting data",
                )))
            }
            Ok(n) => {
                written += n;
                last_progress = Instant::now();
            }
            Err(e) if is_timeout(&e) => {
                if stop.load(Ordering::SeqCst) {
                    return Ok(WriteOutcome::Stopped);
                }
                if stall_limit.is_some_and(|limit| last_progress.elapsed() >= limit) {
                    return Err(NetworkError::Timeout);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(NetworkError::Connection(e)),
        }
    }
    Ok(WriteOutcome::Written)
}
