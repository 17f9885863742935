//! Ready-made serve/request flows for the common case this crate exists for:
//! a privileged companion hands an open file to a confined requester.
//!
//! The companion side is one call per accepted connection and closes the
//! connection on every path. Unavailability of any kind (missing file,
//! unauthorized peer, failed open) is answered with the courier's 0-count frame,
//! so the requester sees a clean "not available" rather than an EOF it would
//! have to second-guess, and can fall back to whatever it would have done
//! without the companion.

use crate::connection::Connection;
use libc::uid_t;
use std::{
    ffi::CString,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    os::fd::{AsFd, OwnedFd},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// What a companion serves, and to whom.
///
/// This is the context value handed to [`serve_file`] per connection; there is
/// no process-global configuration anywhere in the crate.
#[derive(Clone, Debug)]
pub struct ServeOptions {
    path: PathBuf,
    label: Option<String>,
    require_peer_uid: Option<uid_t>,
}

impl ServeOptions {
    /// Serves the file at `path`, to anyone, with its label untouched.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            label: None,
            require_peer_uid: None,
        }
    }
    /// Restamps the file with the given security label before serving it, so
    /// that the requester's policy lets it use the descriptor. Best-effort: a
    /// failed restamp is logged and the file is served anyway.
    #[must_use]
    pub fn label(mut self, context: impl Into<String>) -> Self {
        self.label = Some(context.into());
        self
    }
    /// Only serves peers whose kernel-certified effective UID matches.
    /// Everyone else gets the "not available" answer.
    #[must_use]
    pub fn require_peer_uid(mut self, uid: uid_t) -> Self {
        self.require_peer_uid = Some(uid);
        self
    }
    /// The path being served.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Companion-side handler: answer one connection with a descriptor for the
/// configured file, or with the "not available" frame.
///
/// Consumes the connection, which guarantees it is closed no matter which
/// path is taken: success, denial, or error.
pub fn serve_file(conn: Connection, opts: &ServeOptions) -> io::Result<()> {
    if let Some(required) = opts.require_peer_uid {
        match conn.peer_creds() {
            Ok(creds) if creds.uid == required => {}
            Ok(creds) => {
                debug!(uid = creds.uid, required, "peer not authorized, withholding file");
                return conn.send_fd(None);
            }
            Err(e) => {
                debug!(error = %e, "peer credentials unavailable, withholding file");
                return conn.send_fd(None);
            }
        }
    }
    if fs::metadata(&opts.path).is_err() {
        debug!(path = %opts.path.display(), "no source file to serve");
        return conn.send_fd(None);
    }
    if let Some(context) = &opts.label {
        if let Err(e) = set_file_context(&opts.path, context) {
            warn!(
                error = %e,
                path = %opts.path.display(),
                "failed to restamp security label"
            );
        }
    }
    // File::open is O_RDONLY | O_CLOEXEC
    let file = match File::open(&opts.path) {
        Ok(file) => file,
        Err(e) => {
            debug!(error = %e, path = %opts.path.display(), "source file failed to open");
            return conn.send_fd(None);
        }
    };
    conn.send_fd(Some(file.as_fd()))
}

/// Requester-side counterpart of [`serve_file`]: receive the descriptor, or
/// `None` if the companion had nothing to offer.
///
/// Consumes the connection; the bookkeeping socket has served its purpose
/// once the payload is in hand.
pub fn request_file(conn: Connection) -> io::Result<Option<OwnedFd>> {
    conn.recv_fd()
}

/// Sets the security context new sockets of this thread are created with.
///
/// Writes the NUL-terminated context to `/proc/thread-self/attr/sockcreate`,
/// falling back to the per-tid path on kernels without `thread-self`.
pub fn set_sockcreate_context(context: &str) -> io::Result<()> {
    let mut payload = Vec::with_capacity(context.len() + 1);
    payload.extend_from_slice(context.as_bytes());
    payload.push(0);
    match write_attr(Path::new("/proc/thread-self/attr/sockcreate"), &payload) {
        Ok(()) => Ok(()),
        Err(..) => {
            // Kernels before 3.17 have no /proc/thread-self
            let fallback = format!("/proc/self/task/{}/attr/sockcreate", gettid());
            write_attr(Path::new(&fallback), &payload)
        }
    }
}

/// Stamps the file at `path` with the given security label
/// (`security.selinux`).
pub fn set_file_context(path: &Path, context: &str) -> io::Result<()> {
    const SELINUX_XATTR: &[u8] = b"security.selinux\0";
    let path_c = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let value = CString::new(context).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let success = unsafe {
        // SAFETY: all three pointers refer to live NUL-terminated buffers
        libc::setxattr(
            path_c.as_ptr(),
            SELINUX_XATTR.as_ptr().cast(),
            value.as_ptr().cast(),
            value.as_bytes_with_nul().len(),
            0,
        ) != -1
    };
    ok_or_ret_errno!(success => ())
}

fn write_attr(path: &Path, payload: &[u8]) -> io::Result<()> {
    OpenOptions::new().write(true).open(path)?.write_all(payload)
}

fn gettid() -> libc::pid_t {
    unsafe {
        // SAFETY: no arguments, no side effects on failure
        libc::syscall(libc::SYS_gettid) as libc::pid_t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn uid() -> uid_t {
        unsafe { libc::getuid() }
    }

    #[test]
    fn absent_file_yields_not_available() {
        let (server, client) = Connection::pair().unwrap();
        let opts = ServeOptions::new("/definitely/not/here/hosts");
        serve_file(server, &opts).unwrap();
        assert!(request_file(client).unwrap().is_none(), "absent file should serve None");
    }

    #[test]
    fn present_file_is_served_with_contents() {
        let mut source = tempfile::NamedTempFile::new().unwrap();
        source.write_all(b"127.0.0.1 localhost\n").unwrap();
        source.flush().unwrap();

        let (server, client) = Connection::pair().unwrap();
        serve_file(server, &ServeOptions::new(source.path())).unwrap();
        let fd = request_file(client).unwrap().expect("file should be served");
        let mut contents = String::new();
        File::from(fd).read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "127.0.0.1 localhost\n");
    }

    #[test]
    fn unauthorized_peer_is_denied_cleanly() {
        let source = tempfile::NamedTempFile::new().unwrap();
        let (server, client) = Connection::pair().unwrap();
        let opts = ServeOptions::new(source.path()).require_peer_uid(uid().wrapping_add(1));
        serve_file(server, &opts).unwrap();
        assert!(
            request_file(client).unwrap().is_none(),
            "uid mismatch should look like an absent file, not an error"
        );
    }

    #[test]
    fn authorized_peer_is_served() {
        let source = tempfile::NamedTempFile::new().unwrap();
        let (server, client) = Connection::pair().unwrap();
        let opts = ServeOptions::new(source.path()).require_peer_uid(uid());
        serve_file(server, &opts).unwrap();
        assert!(request_file(client).unwrap().is_some(), "matching uid should be served");
    }

    #[test]
    fn label_restamp_failure_is_not_fatal() {
        // tmpfs on a test machine typically refuses the SELinux xattr; the
        // file must be served regardless.
        let source = tempfile::NamedTempFile::new().unwrap();
        let (server, client) = Connection::pair().unwrap();
        let opts = ServeOptions::new(source.path()).label("u:object_r:system_file:s0");
        serve_file(server, &opts).unwrap();
        assert!(request_file(client).unwrap().is_some(), "label failure must not block serving");
    }
}
