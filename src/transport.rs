//! Socket transports behind a channel
//!
//! A [`Transport`] is the non-blocking byte pipe a channel reads from and
//! writes to. Every method takes `&self`: a channel is shared between the
//! worker running its read task, the worker running its write task and its
//! selector thread, and the socket types involved all support concurrent
//! `&self` I/O.
//!
//! The selector registers transports by raw descriptor
//! ([`Transport::raw_fd`]) so interest can change without a `&mut` borrow.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::config::{apply_datagram_options, apply_socket_options, SocketOptions};

/// Non-blocking byte pipe under a channel
pub trait Transport: Send + Sync + 'static {
    /// Reads into `buf`; `Ok(0)` means the peer closed the stream, unless
    /// the transport [is datagram-oriented](Transport::is_datagram).
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Descriptor registered with the selector.
    fn raw_fd(&self) -> RawFd;

    /// Completes a pending outbound connect after a writable event.
    ///
    /// `Ok(true)` once connected, `Ok(false)` if the event was spurious and
    /// the connect is still in progress.
    fn finish_connect(&self) -> io::Result<bool> {
        Ok(true)
    }

    /// Whether each read returns exactly one whole datagram.
    ///
    /// Such reads are never split, and `Ok(0)` is an empty datagram.
    fn is_datagram(&self) -> bool {
        false
    }

    fn peer_addr(&self) -> io::Result<SocketAddr>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Shuts down both directions; the descriptor stays open until the
    /// transport is dropped.
    fn shutdown(&self) -> io::Result<()>;
}

/// `io::Read` view of a transport, for [`Buffer::read_from`](crate::buffer::Buffer::read_from).
pub(crate) struct Reader<'a>(pub(crate) &'a dyn Transport);

impl Read for Reader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

/// TCP stream transport
#[derive(Debug)]
pub struct TcpTransport {
    stream: mio::net::TcpStream,
}

impl TcpTransport {
    /// Starts a non-blocking connect to `addr`; completion is reported by a
    /// writable event.
    pub fn connect(addr: SocketAddr, opts: &SocketOptions) -> io::Result<Self> {
        let stream = mio::net::TcpStream::connect(addr)?;
        apply_socket_options(stream.as_raw_fd(), addr.is_ipv6(), opts)?;
        Ok(Self { stream })
    }

    /// Wraps an accepted stream, applying `opts`.
    pub fn accepted(stream: mio::net::TcpStream, opts: &SocketOptions) -> io::Result<Self> {
        let ipv6 = stream.local_addr().map(|a| a.is_ipv6()).unwrap_or(false);
        apply_socket_options(stream.as_raw_fd(), ipv6, opts)?;
        Ok(Self { stream })
    }

    pub fn stream(&self) -> &mio::net::TcpStream {
        &self.stream
    }
}

impl Transport for TcpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    fn finish_connect(&self) -> io::Result<bool> {
        if let Some(err) = self.stream.take_error()? {
            return Err(err);
        }
        match self.stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn shutdown(&self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Largest payload a UDP datagram can carry
pub const MAX_DATAGRAM: usize = 65_535;

/// Connected UDP socket as a channel transport
///
/// Each datagram read becomes one fragment of the inbound pipeline; each
/// departed message is sent as one datagram.
#[derive(Debug)]
pub struct UdpTransport {
    socket: mio::net::UdpSocket,
}

impl UdpTransport {
    /// Binds `local` and connects it to `peer`.
    pub fn connect(local: SocketAddr, peer: SocketAddr, opts: &SocketOptions) -> io::Result<Self> {
        let socket = std::net::UdpSocket::bind(local)?;
        apply_datagram_options(socket.as_raw_fd(), local.is_ipv6(), opts)?;
        socket.connect(peer)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: mio::net::UdpSocket::from_std(socket),
        })
    }

    pub fn socket(&self) -> &mio::net::UdpSocket {
        &self.socket
    }
}

impl Transport for UdpTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.socket.recv(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.socket.send(buf)
    }

    fn raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn is_datagram(&self) -> bool {
        true
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn shutdown(&self) -> io::Result<()> {
        Ok(())
    }
}
