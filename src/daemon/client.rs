//! Grow client
//!
//! Sends one request to a zygote, hands over standard streams, and waits for
//! the status of the code unit.

use crate::daemon::descriptor::{send_standard_streams, StandardStreams};
use crate::daemon::endpoint::check_socket_path;
use crate::daemon::protocol::{read_int, write_int, Request};
use crate::error::GrowError;
use std::io::{self, Write};
use std::os::fd::BorrowedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

/// Result of a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Growth {
    /// Pid of the zygote worker that served the request
    pub worker_pid: i32,
    /// Status returned by the code unit
    pub status: i32,
}

/// Client for one zygote endpoint
#[derive(Debug, Clone)]
pub struct GrowClient {
    socket_path: PathBuf,
}

impl GrowClient {
    /// Create a client for the zygote listening at `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Result<Self, GrowError> {
        let socket_path = socket_path.into();
        check_socket_path(&socket_path).map_err(|(len, max)| GrowError::SocketPathTooLong {
            path: socket_path.clone(),
            len,
            max,
        })?;
        Ok(Self { socket_path })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Check whether a zygote accepts connections at the path
    pub fn is_zygote_running(&self) -> bool {
        self.socket_path.exists() && UnixStream::connect(&self.socket_path).is_ok()
    }

    /// Connect to the zygote
    pub fn connect(&self) -> Result<UnixStream, GrowError> {
        UnixStream::connect(&self.socket_path).map_err(|source| GrowError::Connect {
            path: self.socket_path.clone(),
            source,
        })
    }

    /// Run `request` in a zygote worker with `streams` as its stdio
    pub fn grow(
        &self,
        request: &Request,
        streams: &StandardStreams<BorrowedFd<'_>>,
    ) -> Result<Growth, GrowError> {
        let mut stream = self.connect()?;

        // Handshake first, so a rejected request fails here instead of on a
        // write to a closed socket
        write_int(&mut stream, request.version)?;
        stream.flush()?;

        let worker_pid = match read_int(&mut stream) {
            Ok(pid) => pid,
            Err(e) if is_hangup(&e) => {
                return Err(GrowError::Rejected {
                    version: request.version,
                })
            }
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(worker_pid, "zygote worker accepted request");

        stream.write_all(&request.encode_body()?)?;
        stream.flush()?;

        // A worker that failed to load the unit replies and exits without
        // taking the streams; its status is still queued for reading
        match send_standard_streams(&stream, streams) {
            Ok(()) => {}
            Err(e) if is_hangup(&e) || e.kind() == io::ErrorKind::BrokenPipe => {
                tracing::debug!(worker_pid, error = %e, "worker stopped before taking streams");
            }
            Err(e) => return Err(e.into()),
        }

        let status = match read_int(&mut stream) {
            Ok(status) => status,
            Err(e) if is_hangup(&e) => return Err(GrowError::NoStatus { pid: worker_pid }),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(worker_pid, status, "zygote worker finished");

        Ok(Growth { worker_pid, status })
    }
}

fn is_hangup(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset
    )
}
