//! Kernel-verified identity of the process on the other end of a connection.

use crate::c_wrappers;
use libc::{gid_t, pid_t, uid_t};
use std::{io, os::fd::BorrowedFd};

/// Upper bound on the security label the kernel is allowed to hand back.
const SEC_LABEL_BUF: usize = 4096;

/// Credentials of the peer of a connected Unix-domain socket, as certified by
/// the kernel at `connect(2)`/`socketpair(2)` time.
///
/// A captured record is immutable and tied to the connection it was read from;
/// it says nothing about traffic that arrives later. The inspector only
/// reports facts; which peers may request which resources is the caller's
/// policy to enforce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerCreds {
    /// Effective user ID of the peer.
    pub uid: uid_t,
    /// Effective group ID of the peer.
    pub gid: gid_t,
    /// Process ID of the peer.
    pub pid: pid_t,
    /// Security label of the peer (`SO_PEERSEC`), empty when the kernel has
    /// none to report. Best-effort: absence of a label is not a failure.
    pub context: String,
}

impl PeerCreds {
    /// Queries the credentials of the given socket's peer.
    pub fn for_socket(fd: BorrowedFd<'_>) -> io::Result<Self> {
        let cred = c_wrappers::get_peer_ucred(fd)?;
        if cred.pid == 0 {
            // Zero-initialized ucred is the kernel's way of saying the peer
            // is gone without saying so
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        Ok(Self {
            uid: cred.uid,
            gid: cred.gid,
            pid: cred.pid,
            context: security_context(fd),
        })
    }
}

fn security_context(fd: BorrowedFd<'_>) -> String {
    let mut buf = [0_u8; SEC_LABEL_BUF];
    let len = match c_wrappers::get_peer_sec(fd, &mut buf) {
        Ok(len) => len.min(buf.len()),
        Err(..) => 0,
    };
    // Depending on the LSM, the label may or may not carry a trailing NUL
    let label = match buf[..len].iter().position(|b| *b == 0) {
        Some(nul) => &buf[..nul],
        None => &buf[..len],
    };
    String::from_utf8_lossy(label).into_owned()
}
