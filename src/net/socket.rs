//! Non-blocking UDP socket wrapper.
//!
//! A thin layer over [`std::net::UdpSocket`] put into non-blocking mode at
//! bind time, with `try_` variants that turn `WouldBlock` into `None` for
//! polling loops and buffer sizing through `rustix`. The exposed
//! descriptor ([`AsFd`]/[`AsRawFd`]) is what the readiness multiplexer
//! waits on.

use std::io::{self, ErrorKind};
use std::net::UdpSocket as StdUdpSocket;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use super::Endpoint;

/// A non-blocking UDP socket.
///
/// All send/recv calls are non-blocking; pair the socket with the
/// [`crate::net::select::Multiplexer`] (or any poll loop) for readiness
/// notification.
pub struct UdpSocket {
    inner: StdUdpSocket,
}

impl UdpSocket {
    /// Creates a new UDP socket bound to the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound (e.g. address in
    /// use) or cannot be switched to non-blocking mode.
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = StdUdpSocket::bind(endpoint.as_socket_addr())?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Sends a datagram to the specified endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if the socket would block.
    pub fn send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<usize> {
        self.inner.send_to(buf, dest.as_socket_addr())
    }

    /// Receives a datagram from the socket.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or if no data is available.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Endpoint)> {
        self.inner
            .recv_from(buf)
            .map(|(n, addr)| (n, Endpoint::from(addr)))
    }

    /// Attempts to send, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than `WouldBlock`.
    pub fn try_send_to(&self, buf: &[u8], dest: Endpoint) -> io::Result<Option<usize>> {
        match self.send_to(buf, dest) {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Attempts to receive, returning `Ok(None)` instead of `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure other than `WouldBlock`.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        match self.recv_from(buf) {
            Ok((n, ep)) => Ok(Some((n, ep))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_send_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Sets the socket's receive buffer size.
    ///
    /// Media receivers usually want this raised well above the default so
    /// fragment bursts survive a slow poll cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be set.
    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        rustix::net::sockopt::set_socket_recv_buffer_size(self.inner.as_fd(), size)?;
        Ok(())
    }

    /// Gets the socket's send buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::get_socket_send_buffer_size(
            self.inner.as_fd(),
        )?)
    }

    /// Gets the socket's receive buffer size.
    ///
    /// # Errors
    ///
    /// Returns an error if the option cannot be retrieved.
    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        Ok(rustix::net::sockopt::get_socket_recv_buffer_size(
            self.inner.as_fd(),
        )?)
    }
}

impl AsFd for UdpSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl AsRawFd for UdpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
