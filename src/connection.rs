//! Scoped ownership of a connected socket descriptor.

use crate::{c_wrappers, fdpass, peer_creds::PeerCreds, wire};
use std::{
    io::{self, Read, Write},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
};

/// Move-only owner of a connected, bidirectional byte-and-descriptor stream.
///
/// The wrapped descriptor is closed exactly once, no matter how the value
/// leaves scope: normal drop, early return, error propagation, or overwrite by
/// assignment. Explicitly [`close`](Self::close)ing surfaces the close error
/// that a plain drop would swallow, and [`into_fd`](Self::into_fd) relinquishes
/// ownership without closing anything.
///
/// One connection carries one exchange at a time; interleaving calls from two
/// call sites corrupts framing. Use [`try_clone`](Self::try_clone) to give a
/// second owner its own descriptor instead of sharing this one.
#[derive(Debug)]
pub struct Connection(OwnedFd);

impl Connection {
    /// Creates a pair of connections joined to each other, as per
    /// `socketpair(2)`, with close-on-exec set on both descriptors.
    ///
    /// Connection establishment between unrelated processes is otherwise out
    /// of this crate's scope; accept or connect a [`UnixStream`] (or take a
    /// descriptor from a host framework) and convert it.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = c_wrappers::socketpair_stream()?;
        Ok((Self(a), Self(b)))
    }

    /// Duplicates the connection into an independently owned descriptor
    /// referring to the same socket, with close-on-exec set.
    pub fn try_clone(&self) -> io::Result<Self> {
        c_wrappers::duplicate_fd(self.0.as_fd()).map(Self)
    }

    /// Relinquishes ownership of the descriptor without closing it.
    #[inline]
    pub fn into_fd(self) -> OwnedFd {
        self.0
    }

    /// Closes the connection now, reporting the error a plain drop would
    /// discard.
    pub fn close(self) -> io::Result<()> {
        c_wrappers::close_explicitly(self.0)
    }

    /// Polls the connection for readability without committing to a read.
    ///
    /// Returns `Ok(false)` if the peer is gone or the socket is in an error
    /// state (`POLLHUP`/`POLLERR`/`POLLNVAL`), `Ok(true)` otherwise. With
    /// `block` set, waits indefinitely for the state to become known; without
    /// it, reports the current state immediately. Deciding what to do with a
    /// dead connection (usually dropping it) stays with the caller.
    pub fn check_alive(&self, block: bool) -> io::Result<bool> {
        let revents = c_wrappers::poll_in(self.0.as_fd(), block)?;
        Ok((revents & !libc::POLLIN) == 0)
    }

    /// Queries the kernel-certified identity of the peer.
    #[inline]
    pub fn peer_creds(&self) -> io::Result<PeerCreds> {
        PeerCreds::for_socket(self.0.as_fd())
    }
}

/// The wire codec, as methods. See [`wire`] for the contract of each.
impl Connection {
    /// Reads a native-endian `u8`.
    #[inline]
    pub fn read_u8(&self) -> io::Result<u8> { wire::read_u8(self.0.as_fd()) }
    /// Reads a native-endian `u32`.
    #[inline]
    pub fn read_u32(&self) -> io::Result<u32> { wire::read_u32(self.0.as_fd()) }
    /// Reads a native-endian `u64`.
    #[inline]
    pub fn read_u64(&self) -> io::Result<u64> { wire::read_u64(self.0.as_fd()) }
    /// Reads a native-endian `i32`.
    #[inline]
    pub fn read_i32(&self) -> io::Result<i32> { wire::read_i32(self.0.as_fd()) }
    /// Reads a length-prefixed string. See [`wire::read_string`].
    #[inline]
    pub fn read_string(&self) -> io::Result<String> { wire::read_string(self.0.as_fd()) }
    /// Writes a native-endian `u8`.
    #[inline]
    pub fn write_u8(&self, val: u8) -> io::Result<()> { wire::write_u8(self.0.as_fd(), val) }
    /// Writes a native-endian `u32`.
    #[inline]
    pub fn write_u32(&self, val: u32) -> io::Result<()> { wire::write_u32(self.0.as_fd(), val) }
    /// Writes a native-endian `u64`.
    #[inline]
    pub fn write_u64(&self, val: u64) -> io::Result<()> { wire::write_u64(self.0.as_fd(), val) }
    /// Writes a native-endian `i32`.
    #[inline]
    pub fn write_i32(&self, val: i32) -> io::Result<()> { wire::write_i32(self.0.as_fd(), val) }
    /// Writes a length-prefixed string. See [`wire::write_string`].
    #[inline]
    pub fn write_string(&self, s: &str) -> io::Result<()> { wire::write_string(self.0.as_fd(), s) }
}

/// The descriptor courier, as methods. See [`fdpass`] for the protocol.
impl Connection {
    /// Sends a batch of descriptors. See [`fdpass::send_fds`].
    #[inline]
    pub fn send_fds(&self, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        fdpass::send_fds(self.0.as_fd(), fds)
    }
    /// Receives a batch of descriptors. See [`fdpass::recv_fds`].
    #[inline]
    pub fn recv_fds(&self) -> io::Result<Vec<OwnedFd>> {
        fdpass::recv_fds(self.0.as_fd())
    }
    /// Sends one descriptor, or the "not available" frame. See
    /// [`fdpass::send_fd`].
    #[inline]
    pub fn send_fd(&self, fd: Option<BorrowedFd<'_>>) -> io::Result<()> {
        fdpass::send_fd(self.0.as_fd(), fd)
    }
    /// Receives at most one descriptor. See [`fdpass::recv_fd`].
    #[inline]
    pub fn recv_fd(&self) -> io::Result<Option<OwnedFd>> {
        fdpass::recv_fd(self.0.as_fd())
    }
}

impl Read for &Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        c_wrappers::read(self.0.as_fd(), buf)
    }
}
impl Write for &Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        c_wrappers::write(self.0.as_fd(), buf)
    }
    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
impl Read for Connection {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&mut &*self).read(buf)
    }
}
impl Write for Connection {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&mut &*self).write(buf)
    }
    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsFd for Connection {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}
impl AsRawFd for Connection {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
impl From<OwnedFd> for Connection {
    #[inline]
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}
impl From<Connection> for OwnedFd {
    #[inline]
    fn from(conn: Connection) -> Self {
        conn.0
    }
}
impl From<UnixStream> for Connection {
    #[inline]
    fn from(stream: UnixStream) -> Self {
        Self(stream.into())
    }
}
impl FromRawFd for Connection {
    #[inline]
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self(unsafe {
            // SAFETY: forwarded to the caller
            OwnedFd::from_raw_fd(fd)
        })
    }
}
impl IntoRawFd for Connection {
    #[inline]
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

/// Sets or clears the close-on-exec flag on a descriptor.
///
/// Descriptors received through the courier arrive with the flag set; a caller
/// that means to pass one across `exec` clears it explicitly here rather than
/// by never having had it set.
pub fn set_cloexec(fd: BorrowedFd<'_>, cloexec: bool) -> io::Result<()> {
    let mut flags = c_wrappers::get_fdflags(fd)? & !libc::FD_CLOEXEC;
    if cloexec {
        flags |= libc::FD_CLOEXEC;
    }
    c_wrappers::set_fdflags(fd, flags)
}

/// Clears the close-on-exec flag, letting the descriptor survive `exec`.
#[inline]
pub fn clear_cloexec(fd: BorrowedFd<'_>) -> io::Result<()> {
    set_cloexec(fd, false)
}
