//! Error types for the zygote daemon and the grow client
//!
//! Each phase of a request has its own error type so callers can tell a
//! transport failure from a load failure without string matching.

use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Status a forked child replies with (and exits with) when dispatch fails.
pub const EXIT_DISPATCH_FAILURE: i32 = libc::EXIT_FAILURE;

/// Exit code of the grow client for a malformed invocation.
pub const EXIT_USAGE: i32 = 2;

/// Exit code of the grow client when the request could not be carried out.
pub const EXIT_TRANSPORT_FAILURE: i32 = 255;

/// Errors raised while framing or unframing a request on a channel
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: i32, actual: i32 },

    #[error("invalid string length {0}")]
    InvalidLength(i64),

    #[error("negative argument count {0}")]
    InvalidCount(i32),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// True when the peer hung up before sending anything at all.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Errors raised while resolving or invoking a code unit
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load {locator:?}: {source}")]
    Open {
        locator: OsString,
        #[source]
        source: libloading::Error,
    },

    #[error("{locator:?} has no entry symbol: {source}")]
    MissingEntry {
        locator: OsString,
        #[source]
        source: libloading::Error,
    },

    #[error("no code unit registered as {0:?}")]
    NotRegistered(OsString),

    #[error("argument {0:?} contains an interior NUL byte")]
    InvalidArgument(OsString),

    #[error("too many {0} for the entry point")]
    TooMany(&'static str),
}

/// Errors raised by the daemon: setting up the endpoint, accepting, or
/// dispatching inside a forked child
#[derive(Debug, Error)]
pub enum ZygoteError {
    #[error("socket path {path:?} is {len} bytes, the limit is {max}")]
    SocketPathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("cannot remove stale endpoint {path:?}: {source}")]
    StaleEndpoint {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("endpoint already torn down")]
    NotListening,

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),

    #[error("waiting for connections failed: {0}")]
    Poll(#[source] nix::Error),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to install descriptor on fd {target}: {source}")]
    InstallDescriptor {
        target: i32,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised by the grow client
#[derive(Debug, Error)]
pub enum GrowError {
    #[error("socket path {path:?} is {len} bytes, the limit is {max}")]
    SocketPathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("cannot connect to {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("zygote closed the connection without accepting the request (protocol version {version})")]
    Rejected { version: i32 },

    #[error("zygote worker {pid} exited without reporting a status")]
    NoStatus { pid: i32 },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GrowError {
    /// The exit code the grow client terminates with for this error.
    pub fn exit_code(&self) -> i32 {
        EXIT_TRANSPORT_FAILURE
    }
}
