//! Test utilities for driving a connected endpoint pair from two threads.
#![allow(dead_code, unused_macros)]

#[macro_use]
mod eyre;

pub use eyre::*;

use color_eyre::eyre::{eyre, WrapErr};
use fdcourier::Connection;
use std::{
    mem::zeroed,
    os::fd::{AsRawFd, BorrowedFd},
    thread,
};

/// Runs `server` in its own thread against one end of a fresh socketpair and
/// `client` on the calling thread against the other, failing if either side
/// does.
pub fn drive_pair(
    server: impl FnOnce(Connection) -> TestResult + Send + 'static,
    client: impl FnOnce(Connection) -> TestResult,
) -> TestResult {
    install();
    let (server_conn, client_conn) = Connection::pair().context("socketpair failed")?;
    let server_thread = thread::spawn(move || server(server_conn));
    let client_result = client(client_conn);
    server_thread
        .join()
        .map_err(|_| eyre!("server thread panicked"))?
        .context("server side failed")?;
    client_result.context("client side failed")
}

/// Device/inode identity of whatever the descriptor refers to; two
/// descriptors with equal identity alias the same kernel file object.
pub fn file_identity(fd: BorrowedFd<'_>) -> TestResult<(u64, u64)> {
    let mut st = unsafe { zeroed::<libc::stat>() };
    let success = unsafe { libc::fstat(fd.as_raw_fd(), &mut st) } != -1;
    if !success {
        return Err(std::io::Error::last_os_error()).context("fstat failed");
    }
    Ok((st.st_dev as u64, st.st_ino as u64))
}
