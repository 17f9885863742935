//! The wire codec: native-endian fixed-width integers and length-prefixed
//! strings over a connected stream socket.
//!
//! These are stateless free functions over a borrowed descriptor; the
//! [`Connection`](crate::Connection) guard exposes them as methods. Both
//! endpoints are assumed to run on the same host, so no byte order conversion
//! is performed anywhere.
//!
//! # Error mapping
//! Transient signal interruptions (`EINTR`) are retried internally and never
//! surface. A peer that closes the stream produces
//! [`UnexpectedEof`](io::ErrorKind::UnexpectedEof), whether the close lands on
//! a message boundary or mid-message (the error's message text tells the two
//! apart, matching the `std::io::Read::read_exact` convention). Oversized
//! strings fail with the raw OS error `E2BIG` on both ends.

use crate::c_wrappers;
use std::{io, mem::size_of, os::fd::BorrowedFd};

/// The longest string the codec will agree to put on (or accept from) the
/// wire, in bytes.
pub const MAX_STRING_LEN: usize = 4096;

/// Reads exactly `buf.len()` bytes, retrying across signal interruptions and
/// accumulating partial progress.
///
/// This is the backbone every fixed-width read is built on. A zero-byte result
/// from the peer terminates the loop: if nothing had been read yet, the
/// connection was closed on a message boundary; otherwise the message was cut
/// short. Both surface as [`UnexpectedEof`](io::ErrorKind::UnexpectedEof).
pub fn read_exact(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<()> {
    let mut read_sz = 0;
    while read_sz < buf.len() {
        match c_wrappers::read(fd, &mut buf[read_sz..]) {
            Ok(0) if read_sz == 0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))
            }
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed mid-message ({read_sz} of {} bytes)", buf.len()),
                ))
            }
            Ok(bytes_read) => read_sz += bytes_read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Writes all of `buf`, retrying across signal interruptions and accumulating
/// partial progress.
///
/// A write that makes no progress without reporting an error fails with
/// [`WriteZero`](io::ErrorKind::WriteZero); a partially applied write is
/// never silently resumable elsewhere.
pub fn write_exact(fd: BorrowedFd<'_>, buf: &[u8]) -> io::Result<()> {
    let mut write_sz = 0;
    while write_sz < buf.len() {
        match c_wrappers::write(fd, &buf[write_sz..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "peer stopped accepting bytes mid-message",
                ))
            }
            Ok(bytes_written) => write_sz += bytes_written,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

macro_rules! int_codec {
    ($(($read:ident, $write:ident, $ty:ty)),+ $(,)?) => {$(
        #[doc = concat!("Reads a native-endian `", stringify!($ty), "`.")]
        pub fn $read(fd: BorrowedFd<'_>) -> io::Result<$ty> {
            let mut buf = [0_u8; size_of::<$ty>()];
            read_exact(fd, &mut buf)?;
            Ok(<$ty>::from_ne_bytes(buf))
        }
        #[doc = concat!("Writes a native-endian `", stringify!($ty), "`.")]
        pub fn $write(fd: BorrowedFd<'_>, val: $ty) -> io::Result<()> {
            write_exact(fd, &val.to_ne_bytes())
        }
    )+};
}
int_codec! {
    (read_u8, write_u8, u8),
    (read_u32, write_u32, u32),
    (read_u64, write_u64, u64),
    (read_i32, write_i32, i32),
}

/// Reads a length-prefixed UTF-8 string.
///
/// A zero or negative length is an empty string, not a failure. A length
/// above [`MAX_STRING_LEN`] is a protocol violation: the declared body is
/// drained from the stream in bounded chunks, so framing stays aligned for
/// whatever message follows, and the call fails with `E2BIG`. The drain trusts
/// the peer's own length declaration: a peer that declares bytes it never
/// sends leaves the call blocked the same way any other read on the connection
/// would be.
pub fn read_string(fd: BorrowedFd<'_>) -> io::Result<String> {
    let len = read_i32(fd)?;
    if len <= 0 {
        return Ok(String::new());
    }
    let len = len as usize;
    if len > MAX_STRING_LEN {
        drain(fd, len)?;
        return Err(io::Error::from_raw_os_error(libc::E2BIG));
    }
    let mut buf = vec![0_u8; len];
    read_exact(fd, &mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes a length-prefixed UTF-8 string.
///
/// A string longer than [`MAX_STRING_LEN`] is refused with `E2BIG`; a
/// zero-length header is sent in its place so the peer's framing survives.
/// The two ends will then disagree about whether the string was empty, which
/// is why callers must check this result rather than the decoded content.
pub fn write_string(fd: BorrowedFd<'_>, s: &str) -> io::Result<()> {
    if s.len() > MAX_STRING_LEN {
        write_i32(fd, 0)?;
        return Err(io::Error::from_raw_os_error(libc::E2BIG));
    }
    write_i32(fd, s.len() as i32)?;
    if !s.is_empty() {
        write_exact(fd, s.as_bytes())?;
    }
    Ok(())
}

fn drain(fd: BorrowedFd<'_>, mut remaining: usize) -> io::Result<()> {
    let mut scratch = [0_u8; 512];
    while remaining > 0 {
        let take = remaining.min(scratch.len());
        read_exact(fd, &mut scratch[..take])?;
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connection;
    use std::os::fd::AsFd;

    #[test]
    fn int_round_trips() {
        let (a, b) = Connection::pair().unwrap();
        write_u8(a.as_fd(), 0xA5).unwrap();
        write_u32(a.as_fd(), 0xDEAD_BEEF).unwrap();
        write_u64(a.as_fd(), u64::MAX - 7).unwrap();
        write_i32(a.as_fd(), -1).unwrap();
        assert_eq!(read_u8(b.as_fd()).unwrap(), 0xA5);
        assert_eq!(read_u32(b.as_fd()).unwrap(), 0xDEAD_BEEF);
        assert_eq!(read_u64(b.as_fd()).unwrap(), u64::MAX - 7);
        assert_eq!(read_i32(b.as_fd()).unwrap(), -1);
    }

    #[test]
    fn string_round_trips() {
        let (a, b) = Connection::pair().unwrap();
        for msg in ["", "hello", &"x".repeat(MAX_STRING_LEN)] {
            write_string(a.as_fd(), msg).unwrap();
            assert_eq!(read_string(b.as_fd()).unwrap(), msg);
        }
    }

    #[test]
    fn oversized_write_is_refused_and_reads_as_empty() {
        let (a, b) = Connection::pair().unwrap();
        let long = "y".repeat(MAX_STRING_LEN + 1);
        let e = write_string(a.as_fd(), &long).unwrap_err();
        assert_eq!(e.raw_os_error(), Some(libc::E2BIG));
        // The reader sees the substitute zero-length header, not a truncated
        // copy of the string.
        assert_eq!(read_string(b.as_fd()).unwrap(), "");
    }

    #[test]
    fn oversized_incoming_length_is_drained_and_refused() {
        let (a, b) = Connection::pair().unwrap();
        let body_len = MAX_STRING_LEN + 123;
        write_i32(a.as_fd(), body_len as i32).unwrap();
        write_exact(a.as_fd(), &vec![b'z'; body_len]).unwrap();
        write_string(a.as_fd(), "aligned").unwrap();

        let e = read_string(b.as_fd()).unwrap_err();
        assert_eq!(e.raw_os_error(), Some(libc::E2BIG));
        // The rejected body was consumed, so the stream is still in sync.
        assert_eq!(read_string(b.as_fd()).unwrap(), "aligned");
    }

    #[test]
    fn negative_length_is_an_empty_string() {
        let (a, b) = Connection::pair().unwrap();
        write_i32(a.as_fd(), -42).unwrap();
        assert_eq!(read_string(b.as_fd()).unwrap(), "");
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let (a, b) = Connection::pair().unwrap();
        write_i32(a.as_fd(), 2).unwrap();
        write_exact(a.as_fd(), &[0xFF, 0xFE]).unwrap();
        let e = read_string(b.as_fd()).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);
    }
}
