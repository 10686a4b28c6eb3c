//! Stream abstraction so `CommTask` can be driven by either a real
//! `mio::net::TcpStream` or, in tests, a `std::net::TcpStream` connected
//! over loopback.

use std::io::{Error, Result};
use std::net::{Shutdown, SocketAddr};

/// Minimal surface a `CommTask` needs from its underlying socket.
pub trait TcpStream {
    /// Connects to `addr`. Used by tests driving a server over loopback.
    fn connect(addr: SocketAddr) -> Result<Self>
    where
        Self: Sized;

    /// Address of the remote peer.
    fn peer_addr(&self) -> Result<SocketAddr>;

    /// Address this socket is bound to locally.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Shuts down the read, write, or both halves of the connection.
    fn shutdown(&self, how: Shutdown) -> Result<()>;

    /// Sets `TCP_NODELAY`.
    fn set_nodelay(&self, nodelay: bool) -> Result<()>;

    /// Reads the current `TCP_NODELAY` setting.
    fn nodelay(&self) -> Result<bool>;

    /// Sets the IP time-to-live.
    fn set_ttl(&self, ttl: u32) -> Result<()>;

    /// Reads the IP time-to-live.
    fn ttl(&self) -> Result<u32>;

    /// Takes and clears the socket's pending error, if any.
    fn take_error(&self) -> Result<Option<Error>>;

    /// Peeks at incoming bytes without consuming them.
    fn peek(&self, buf: &mut [u8]) -> Result<usize>;
}

impl TcpStream for mio::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}

impl TcpStream for std::net::TcpStream {
    #[inline]
    fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect(addr)
    }

    #[inline]
    fn peer_addr(&self) -> Result<SocketAddr> {
        Self::peer_addr(self)
    }

    #[inline]
    fn local_addr(&self) -> Result<SocketAddr> {
        Self::local_addr(self)
    }

    #[inline]
    fn shutdown(&self, how: Shutdown) -> Result<()> {
        Self::shutdown(self, how)
    }

    #[inline]
    fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Self::set_nodelay(self, nodelay)
    }

    #[inline]
    fn nodelay(&self) -> Result<bool> {
        Self::nodelay(self)
    }

    #[inline]
    fn set_ttl(&self, ttl: u32) -> Result<()> {
        Self::set_ttl(self, ttl)
    }

    #[inline]
    fn ttl(&self) -> Result<u32> {
        Self::ttl(self)
    }

    #[inline]
    fn take_error(&self) -> Result<Option<Error>> {
        Self::take_error(self)
    }

    #[inline]
    fn peek(&self, buf: &mut [u8]) -> Result<usize> {
        Self::peek(self, buf)
    }
}
