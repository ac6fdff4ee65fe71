//! Error definitions

use derive_more::{Display, From};
use std::{borrow::Cow, env, io, num};

/// Common errors of the `overlay` crate.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "Permission denied, must run as root")]
    PermissionDenied,
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "{:?}", "_0")]
    Error(&'static str),
    #[display(fmt = "{}", "_0")]
    InvalidArgument(num::ParseIntError),
    #[display(fmt = "Unknown transport method: {}", "_0")]
    #[from(ignore)]
    UnknownMethod(Cow<'static, str>),
    #[display(fmt = "Missing parent declaration")]
    MissingParent,
    #[display(fmt = "{}", "_0")]
    VarError(env::VarError),
    #[display(fmt = "{}", "_0")]
    JoinError(tokio::task::JoinError),
    #[display(fmt = "Username '{}' for dropping privileges not found", "_0")]
    UserNotFound(Cow<'static, str>),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    Privdrop(&'static str, Box<dyn std::error::Error + Send + Sync>),
    #[display(fmt = "General error: {}", "_0")]
    GeneralError(Box<dyn std::error::Error + Send + Sync>),
    #[display(fmt = "Lost {}, terminated", "_0")]
    #[from(ignore)]
    Terminated(&'static str),
    /// A handshake or RPC did not complete within its deadline.
    #[display(fmt = "timed out waiting for {}", "_0")]
    #[from(ignore)]
    Timeout(&'static str),
    /// Setting up a child stream failed before a handshake could begin
    /// (socketpair/pty allocation, fork, exec).
    #[display(fmt = "failed to set up stream: {}", "_0")]
    #[from(ignore)]
    StreamSetup(Cow<'static, str>),
    /// The peer hit EOF while a caller was still waiting on it; carries the
    /// last bytes read before the close, for diagnostics.
    #[display(fmt = "stream closed, last bytes received: {}", "_0")]
    #[from(ignore)]
    StreamClosed(String),
    /// A peer sent a message that violates the wire protocol (bad magic,
    /// out-of-order handshake ack, truncated frame).
    #[display(fmt = "protocol violation: {}", "_0")]
    #[from(ignore)]
    ProtocolViolation(Cow<'static, str>),
    /// A `proxy_connect` request to a remote context failed on the remote
    /// side rather than locally.
    #[display(fmt = "remote connect via context {} failed: {}", "_0", "_1")]
    RemoteConnect(u32, Cow<'static, str>),
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
