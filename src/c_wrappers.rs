//! Thin `io::Result` wrappers over the raw syscalls the crate is built on.
//!
//! Every function here captures `errno` at the call boundary and does nothing
//! else; retry policy (`EINTR` and friends) belongs to the callers.

use crate::misc::FdOrErrno;
use libc::{c_int, c_short, msghdr, socklen_t, ucred};
use std::{
    io,
    mem::{size_of, zeroed},
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
};

pub(crate) fn read(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let (success, bytes_read) = unsafe {
        // SAFETY: the buffer pointer and length come from a live slice
        let size_or_err = libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len());
        (size_or_err >= 0, size_or_err as usize)
    };
    ok_or_ret_errno!(success => bytes_read)
}

pub(crate) fn write(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<usize> {
    let (success, bytes_written) = unsafe {
        // SAFETY: as above
        let size_or_err = libc::write(fd.as_raw_fd(), buf.as_ptr().cast(), buf.len());
        (size_or_err >= 0, size_or_err as usize)
    };
    ok_or_ret_errno!(success => bytes_written)
}

pub(crate) fn recv(fd: BorrowedFd<'_>, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
    let (success, bytes_read) = unsafe {
        // SAFETY: as above
        let size_or_err = libc::recv(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len(), flags);
        (size_or_err >= 0, size_or_err as usize)
    };
    ok_or_ret_errno!(success => bytes_read)
}

/// # Safety
/// `hdr` must point iovecs and the control buffer at live, correctly sized
/// memory.
pub(crate) unsafe fn sendmsg(fd: BorrowedFd<'_>, hdr: &msghdr) -> io::Result<usize> {
    let (success, bytes_sent) = unsafe {
        let size_or_err = libc::sendmsg(fd.as_raw_fd(), hdr, 0);
        (size_or_err >= 0, size_or_err as usize)
    };
    ok_or_ret_errno!(success => bytes_sent)
}

/// # Safety
/// Same contract as [`sendmsg`], with the buffers being written to.
pub(crate) unsafe fn recvmsg(fd: BorrowedFd<'_>, hdr: &mut msghdr, flags: c_int) -> io::Result<usize> {
    let (success, bytes_read) = unsafe {
        let size_or_err = libc::recvmsg(fd.as_raw_fd(), hdr, flags);
        (size_or_err >= 0, size_or_err as usize)
    };
    ok_or_ret_errno!(success => bytes_read)
}

/// Polls the descriptor for readability, retrying on `EINTR`, and returns the
/// raw revents. `block` selects between an indefinite wait and an immediate
/// probe.
pub(crate) fn poll_in(fd: BorrowedFd<'_>, block: bool) -> io::Result<c_short> {
    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout = if block { -1 } else { 0 };
    loop {
        let success = unsafe {
            // SAFETY: pfd is a live stack value
            libc::poll(&mut pfd, 1, timeout) != -1
        };
        if success {
            return Ok(pfd.revents);
        }
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(e);
        }
    }
}

pub(crate) fn socketpair_stream() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [-1 as c_int; 2];
    let success = unsafe {
        // SAFETY: fds is a live two-element buffer
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        ) != -1
    };
    ok_or_ret_errno!(success => unsafe {
        // SAFETY: socketpair just created those descriptors, making us their
        // only owner
        (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
    })
}

pub(crate) fn get_peer_ucred(fd: BorrowedFd<'_>) -> io::Result<ucred> {
    let mut cred: ucred = unsafe {
        // SAFETY: it's safe for the ucred structure to be zero-initialized,
        // since it only contains integers
        zeroed()
    };
    let mut cred_len = size_of::<ucred>() as socklen_t;
    let success = unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut ucred).cast(),
            &mut cred_len,
        ) != -1
    };
    ok_or_ret_errno!(success => cred)
}

/// Queries `SO_PEERSEC` into the given buffer, returning the length the kernel
/// reported.
pub(crate) fn get_peer_sec(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    let mut len = buf.len() as socklen_t;
    let success = unsafe {
        // SAFETY: the buffer pointer and length come from a live slice
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERSEC,
            buf.as_mut_ptr().cast(),
            &mut len,
        ) != -1
    };
    ok_or_ret_errno!(success => len as usize)
}

pub(crate) fn duplicate_fd(fd: BorrowedFd<'_>) -> io::Result<OwnedFd> {
    let new_fd = unsafe {
        // SAFETY: F_DUPFD_CLOEXEC takes an integer argument
        libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0)
    }
    .fd_or_errno()?;
    Ok(unsafe {
        // SAFETY: we just created this descriptor
        OwnedFd::from_raw_fd(new_fd)
    })
}

pub(crate) fn get_fdflags(fd: BorrowedFd<'_>) -> io::Result<c_int> {
    let (val, success) = unsafe {
        let ret = libc::fcntl(fd.as_raw_fd(), libc::F_GETFD, 0);
        (ret, ret != -1)
    };
    ok_or_ret_errno!(success => val)
}

pub(crate) fn set_fdflags(fd: BorrowedFd<'_>, flags: c_int) -> io::Result<()> {
    let success = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, flags) != -1 };
    ok_or_ret_errno!(success => ())
}

pub(crate) fn close_explicitly(fd: OwnedFd) -> io::Result<()> {
    use std::os::fd::IntoRawFd;
    let success = unsafe {
        // SAFETY: into_raw_fd relinquishes ownership, so this is the sole
        // close of the descriptor
        libc::close(fd.into_raw_fd()) != -1
    };
    ok_or_ret_errno!(success => ())
}
