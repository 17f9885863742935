//! The descriptor courier: batches of file descriptors over `SCM_RIGHTS`.
//!
//! # Protocol
//! A batch is one `sendmsg(2)` whose byte payload is a native-endian `i32`
//! descriptor count. A positive count is accompanied by a single ancillary
//! block of exactly `count` descriptors; a count of zero travels alone and is
//! the explicit "no descriptor available" signal, distinct from any error.
//!
//! The receiver first peeks the count without consuming it, sizes its
//! ancillary buffer to exactly fit, and only then commits to the blocking
//! read. The two-phase receive is a load-bearing part of the wire contract
//! (collapsing it into one read with a worst-case buffer would change how
//! large batches are tolerated) and is preserved here exactly.
//!
//! # Failure policy
//! A frame that fails validation (wrong ancillary size, wrong control message
//! shape, wrong classification) yields an error carrying no descriptors,
//! never a partial batch; descriptors that did arrive are closed, not leaked.
//! Callers are expected to treat any error from this layer as "feature
//! unavailable" and fall back to their default behavior.

use crate::{c_wrappers, wire};
use libc::{c_int, c_uint, msghdr};
use std::{
    io,
    mem::{size_of, zeroed},
    os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    ptr,
};
use tracing::debug;

/// The most descriptors one batch can carry, which is the kernel's own
/// per-message `SCM_RIGHTS` ceiling.
pub const MAX_FDS_PER_MSG: usize = 253;

fn cmsg_space_for(count: usize) -> usize {
    unsafe {
        // SAFETY: pure arithmetic
        libc::CMSG_SPACE((count * size_of::<c_int>()) as c_uint) as usize
    }
}
fn cmsg_len_for(count: usize) -> usize {
    unsafe {
        // SAFETY: pure arithmetic
        libc::CMSG_LEN((count * size_of::<c_int>()) as c_uint) as usize
    }
}

fn protocol_violation(what: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what)
}

/// Control message storage with `cmsghdr`-compatible alignment, which `Vec<u8>`
/// does not guarantee.
struct CmsgBuffer {
    storage: Vec<u64>,
}
impl CmsgBuffer {
    fn with_space(space: usize) -> Self {
        Self {
            storage: vec![0_u64; space.div_ceil(size_of::<u64>())],
        }
    }
    fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        self.storage.as_mut_ptr().cast()
    }
}

/// Sends a batch of descriptors, preceded by its count.
///
/// An empty batch sends the bare 0-count frame, the protocol's "nothing for
/// you" answer. Batches above [`MAX_FDS_PER_MSG`] are refused with `EINVAL`
/// before anything touches the wire.
pub fn send_fds(fd: BorrowedFd<'_>, fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    if fds.len() > MAX_FDS_PER_MSG {
        return Err(io::Error::from_raw_os_error(libc::EINVAL));
    }
    let mut count = fds.len() as c_int;
    let mut iov = libc::iovec {
        iov_base: (&mut count as *mut c_int).cast(),
        iov_len: size_of::<c_int>(),
    };
    let mut hdr = unsafe {
        // SAFETY: msghdr is POD
        zeroed::<msghdr>()
    };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;

    let space = cmsg_space_for(fds.len());
    let mut cmsg_buf = CmsgBuffer::with_space(space);
    if !fds.is_empty() {
        hdr.msg_control = cmsg_buf.as_mut_ptr();
        hdr.msg_controllen = space as _;
        unsafe {
            // SAFETY: the buffer was sized (and aligned) for exactly this one
            // header and its payload
            let cmsg = libc::CMSG_FIRSTHDR(&hdr);
            (*cmsg).cmsg_len = cmsg_len_for(fds.len()) as _;
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            let data = libc::CMSG_DATA(cmsg);
            for (i, payload_fd) in fds.iter().enumerate() {
                let raw = payload_fd.as_raw_fd();
                ptr::copy_nonoverlapping(
                    (&raw as *const c_int).cast::<u8>(),
                    data.add(i * size_of::<c_int>()),
                    size_of::<c_int>(),
                );
            }
        }
    }

    let sent = loop {
        match unsafe {
            // SAFETY: iov and cmsg_buf outlive the call
            c_wrappers::sendmsg(fd, &hdr)
        } {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => break other,
        }
    }?;
    if sent != size_of::<c_int>() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "descriptor count header not fully sent",
        ));
    }
    Ok(())
}

/// Sends one descriptor, or the 0-count "not available" frame for `None`.
///
/// This is the courier's answer to "I may or may not have the resource":
/// unavailability is a clean frame the receiver can tell apart from every
/// failure mode.
pub fn send_fd(fd: BorrowedFd<'_>, payload: Option<BorrowedFd<'_>>) -> io::Result<()> {
    match payload {
        Some(payload_fd) => send_fds(fd, &[payload_fd]),
        None => send_fds(fd, &[]),
    }
}

/// Receives a batch of descriptors, in send order.
///
/// `Ok` with an empty vector is the peer's explicit "no descriptor available"
/// answer. Every received descriptor arrives with close-on-exec already set
/// (`MSG_CMSG_CLOEXEC`); see [`clear_cloexec`](crate::connection::clear_cloexec)
/// if one needs to survive `exec`.
///
/// On a count outside `0..=`[`MAX_FDS_PER_MSG`] the frame is left unconsumed
/// and an error is returned; the connection's framing can no longer be
/// trusted and it should be dropped. A frame whose ancillary block does not
/// exactly match its declared count is consumed, its descriptors are closed,
/// and an error is returned.
pub fn recv_fds(fd: BorrowedFd<'_>) -> io::Result<Vec<OwnedFd>> {
    let count = peek_count(fd)?;
    if count == 0 {
        // Consume the bare header; this is data, not an error
        wire::read_i32(fd)?;
        return Ok(Vec::new());
    }
    if count < 0 || count as usize > MAX_FDS_PER_MSG {
        debug!(count, "descriptor count out of range");
        return Err(protocol_violation("descriptor count out of range"));
    }
    let count = count as usize;

    let mut count_echo: c_int = 0;
    let mut iov = libc::iovec {
        iov_base: (&mut count_echo as *mut c_int).cast(),
        iov_len: size_of::<c_int>(),
    };
    let space = cmsg_space_for(count);
    let mut cmsg_buf = CmsgBuffer::with_space(space);
    let mut hdr = unsafe {
        // SAFETY: msghdr is POD
        zeroed::<msghdr>()
    };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = cmsg_buf.as_mut_ptr();
    hdr.msg_controllen = space as _;

    let received = loop {
        match unsafe {
            // SAFETY: iov and cmsg_buf outlive the call
            c_wrappers::recvmsg(fd, &mut hdr, libc::MSG_WAITALL | libc::MSG_CMSG_CLOEXEC)
        } {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => break other,
        }
    }?;
    if received == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        ));
    }

    // Adopt whatever descriptors actually arrived before passing judgement,
    // so that a rejected frame closes them instead of leaking them.
    let (fds, shape) = unsafe {
        // SAFETY: hdr was just filled in by recvmsg
        adopt_scm_rights(&hdr)
    };

    let control_len = hdr.msg_controllen as usize;
    if received != size_of::<c_int>() || control_len != space {
        debug!(received, control_len, expected = space, "malformed descriptor frame");
        return Err(protocol_violation("ancillary block size mismatch"));
    }
    let Some((level, ty, cmsg_len)) = shape else {
        return Err(protocol_violation("ancillary block missing"));
    };
    if level != libc::SOL_SOCKET || ty != libc::SCM_RIGHTS {
        debug!(level, ty, "unexpected control message classification");
        return Err(protocol_violation("not a descriptor-rights control message"));
    }
    if cmsg_len != cmsg_len_for(count) || fds.len() != count {
        debug!(
            cmsg_len,
            got = fds.len(),
            expected = count,
            "descriptor count does not match ancillary payload"
        );
        return Err(protocol_violation("descriptor count mismatch"));
    }
    Ok(fds)
}

/// Receives at most one descriptor; `Ok(None)` is the peer's "not available"
/// answer.
pub fn recv_fd(fd: BorrowedFd<'_>) -> io::Result<Option<OwnedFd>> {
    let mut fds = recv_fds(fd)?;
    match fds.len() {
        0 => Ok(None),
        1 => Ok(fds.pop()),
        _ => Err(protocol_violation("expected at most one descriptor")),
    }
}

/// Extracts the first control message's classification and, if it is an
/// `SCM_RIGHTS` block, takes ownership of every descriptor in it.
///
/// # Safety
/// `hdr` must have been filled in by a successful `recvmsg` whose control
/// buffer is still live.
unsafe fn adopt_scm_rights(hdr: &msghdr) -> (Vec<OwnedFd>, Option<(c_int, c_int, usize)>) {
    let cmsg = unsafe { libc::CMSG_FIRSTHDR(hdr) };
    if cmsg.is_null() {
        return (Vec::new(), None);
    }
    let (level, ty, cmsg_len) = unsafe {
        ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len as usize)
    };
    let mut fds = Vec::new();
    if level == libc::SOL_SOCKET && ty == libc::SCM_RIGHTS {
        let data_len = cmsg_len.saturating_sub(cmsg_len_for(0));
        let fd_count = data_len / size_of::<c_int>();
        fds.reserve(fd_count);
        let data = unsafe { libc::CMSG_DATA(cmsg) };
        for i in 0..fd_count {
            let mut raw: c_int = -1;
            unsafe {
                // SAFETY: CMSG_DATA is not aligned for c_int, so the value is
                // copied out bytewise
                ptr::copy_nonoverlapping(
                    data.add(i * size_of::<c_int>()),
                    (&mut raw as *mut c_int).cast::<u8>(),
                    size_of::<c_int>(),
                );
                // SAFETY: the kernel just installed this descriptor for us,
                // making us its only owner
                fds.push(OwnedFd::from_raw_fd(raw));
            }
        }
    }
    (fds, Some((level, ty, cmsg_len)))
}

fn peek_count(fd: BorrowedFd<'_>) -> io::Result<c_int> {
    let mut buf = [0_u8; size_of::<c_int>()];
    loop {
        match c_wrappers::recv(fd, &mut buf, libc::MSG_PEEK) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))
            }
            Ok(peeked) if peeked == buf.len() => return Ok(c_int::from_ne_bytes(buf)),
            Ok(peeked) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed mid-header ({peeked} of 4 bytes)"),
                ))
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}
