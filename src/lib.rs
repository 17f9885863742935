#![doc = include_str!("../README.md")]
// If this was in Cargo.toml, it would cover tests as well
#![warn(
    missing_docs,
    clippy::panic_in_result_fn,
    clippy::missing_assert_message
)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!(
    "fdcourier requires a Linux-like target (SO_PEERCRED/SO_PEERSEC peer identity, \
SCM_RIGHTS descriptor passing and MSG_CMSG_CLOEXEC)"
);

#[macro_use]
mod macros;

mod c_wrappers;
mod misc;

pub mod companion;
pub mod connection;
pub mod fdpass;
pub mod peer_creds;
pub mod wire;

pub use {connection::Connection, peer_creds::PeerCreds};
