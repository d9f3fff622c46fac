//! A non-blocking, framed byte stream over a TCP socket. Bind/listen/accept
//! are treated as primitive operations and live directly on `mio::net`
//! types at the call site; this module wraps the per-connection socket.

use std::io::{self, Read, Write};
use std::net::Ipv4Addr;

use mio::net::TcpStream;

/// The outcome of a single non-blocking I/O attempt.
pub enum IoOutcome {
    /// `n` bytes were moved.
    Moved(usize),
    /// The operation would have blocked; try again after the next
    /// readiness notification.
    WouldBlock,
    /// The peer closed its end.
    Closed,
}

/// A connected, non-blocking TCP endpoint. Move-only; dropping it closes
/// the underlying socket.
pub struct ByteStream {
    inner: TcpStream,
}

impl ByteStream {
    pub fn new(inner: TcpStream) -> Self {
        Self { inner }
    }

    pub fn inner_mut(&mut self) -> &mut TcpStream {
        &mut self.inner
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> io::Result<IoOutcome> {
        match self.inner.read(buf) {
            Ok(0) => Ok(IoOutcome::Closed),
            Ok(n) => Ok(IoOutcome::Moved(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.recv(buf),
            Err(e) => Err(e),
        }
    }

    pub fn send(&mut self, buf: &[u8]) -> io::Result<IoOutcome> {
        match self.inner.write(buf) {
            Ok(0) if !buf.is_empty() => Ok(IoOutcome::Closed),
            Ok(n) => Ok(IoOutcome::Moved(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(IoOutcome::WouldBlock),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.send(buf),
            Err(e) => Err(e),
        }
    }

    /// The peer's IPv4 address, captured at accept time. Returns the
    /// unspecified address if the peer is connected over IPv6.
    pub fn peer_ipv4(&self) -> io::Result<Ipv4Addr> {
        match self.inner.peer_addr()?.ip() {
            std::net::IpAddr::V4(v4) => Ok(v4),
            std::net::IpAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
        }
    }

    pub fn close(&mut self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }
}
