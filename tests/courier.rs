use super::util::*;
use color_eyre::eyre::bail;
use fdcourier::Connection;
use libc::c_int;
use std::{
    io::ErrorKind,
    mem::{size_of, zeroed},
    os::fd::{AsFd, AsRawFd, BorrowedFd},
};

#[test]
fn batches_round_trip_in_order() -> TestResult {
    install();
    for batch_size in 0..=8 {
        // Single-threaded on purpose: these frames all fit the socket buffer.
        let (a, b) = Connection::pair()?;
        let files: Vec<_> = (0..batch_size)
            .map(|_| tempfile::tempfile())
            .collect::<Result<_, _>>()?;
        let borrowed: Vec<_> = files.iter().map(|f| f.as_fd()).collect();
        a.send_fds(&borrowed)?;
        let received = b.recv_fds()?;
        ensure_eq!(received.len(), batch_size, "batch of {batch_size}");
        for (got, sent) in received.iter().zip(&files) {
            ensure_eq!(
                file_identity(got.as_fd())?,
                file_identity(sent.as_fd())?,
                "descriptors must alias their sources, in send order"
            );
        }
    }
    Ok(())
}

#[test]
fn zero_batch_is_distinct_from_connection_error() -> TestResult {
    drive_pair(
        |conn| {
            conn.send_fds(&[])?;
            Ok(()) // guard closes the connection here
        },
        |conn| {
            // The 0-count frame parses as data...
            ensure_eq!(conn.recv_fds()?.len(), 0);
            // ...and only the close after it is an error.
            let err = conn.recv_fds().unwrap_err();
            ensure_eq!(err.kind(), ErrorKind::UnexpectedEof);
            Ok(())
        },
    )
}

#[test]
fn single_descriptor_not_available_sentinel() -> TestResult {
    drive_pair(
        |conn| {
            conn.send_fd(None)?;
            Ok(())
        },
        |conn| {
            ensure_eq!(conn.recv_fd()?.is_none(), true);
            Ok(())
        },
    )
}

/// Builds the hostile frame by hand: a header claiming two descriptors with
/// ancillary space for just one attached.
fn send_two_claim_one(conn: &Connection, payload: BorrowedFd<'_>) -> TestResult {
    let mut count: c_int = 2;
    let mut iov = libc::iovec {
        iov_base: (&mut count as *mut c_int).cast(),
        iov_len: size_of::<c_int>(),
    };
    let mut control = [0_u64; 8];
    let space = unsafe { libc::CMSG_SPACE(size_of::<c_int>() as u32) } as usize;
    let mut hdr: libc::msghdr = unsafe { zeroed() };
    hdr.msg_iov = &mut iov;
    hdr.msg_iovlen = 1;
    hdr.msg_control = control.as_mut_ptr().cast();
    hdr.msg_controllen = space as _;
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&hdr);
        (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<c_int>() as u32) as _;
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        let raw = payload.as_raw_fd();
        std::ptr::copy_nonoverlapping(
            (&raw as *const c_int).cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            size_of::<c_int>(),
        );
    }
    let sent = unsafe { libc::sendmsg(conn.as_raw_fd(), &hdr, 0) };
    if sent != size_of::<c_int>() as isize {
        bail!("malformed frame send failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

#[test]
fn count_and_ancillary_mismatch_is_rejected() -> TestResult {
    drive_pair(
        |conn| {
            let decoy = tempfile::tempfile()?;
            send_two_claim_one(&conn, decoy.as_fd())?;
            Ok(())
        },
        |conn| {
            let err = conn.recv_fds().unwrap_err();
            ensure_eq!(err.kind(), ErrorKind::InvalidData);
            Ok(())
        },
    )
}
