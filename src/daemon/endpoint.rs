//! The zygote's listening endpoint
//!
//! `Endpoint` owns the listening socket and its filesystem path. Teardown
//! closes the socket and unlinks the path at most once, whether it is reached
//! through [`Endpoint::teardown`], a termination signal, or `Drop`. A forked
//! child calls [`Endpoint::disown`] so that its exit never touches the
//! parent's socket file.

use crate::error::ZygoteError;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

/// Longest socket path `sockaddr_un` can hold, terminator excluded
pub fn max_socket_path_len() -> usize {
    // SAFETY: sockaddr_un is plain old data
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len() - 1
}

/// Check that `path` fits in a socket address, returning its length on error
pub fn check_socket_path(path: &Path) -> Result<(), (usize, usize)> {
    let len = path.as_os_str().as_bytes().len();
    let max = max_socket_path_len();
    if len > max {
        return Err((len, max));
    }
    Ok(())
}

/// Listening socket plus the path it is bound to
#[derive(Debug)]
pub struct Endpoint {
    listener: Option<UnixListener>,
    path: Option<PathBuf>,
}

impl Endpoint {
    /// Bind a fresh endpoint at `path`, replacing any stale socket file
    pub fn bind(path: &Path, mode: u32) -> Result<Self, ZygoteError> {
        check_socket_path(path).map_err(|(len, max)| ZygoteError::SocketPathTooLong {
            path: path.to_path_buf(),
            len,
            max,
        })?;

        match fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale endpoint"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ZygoteError::StaleEndpoint {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        let listener = UnixListener::bind(path).map_err(|source| ZygoteError::Bind {
            path: path.to_path_buf(),
            source,
        })?;

        let endpoint = Self {
            listener: Some(listener),
            path: Some(path.to_path_buf()),
        };

        // From here on a failure drops `endpoint`, which unlinks the path
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;

        Ok(endpoint)
    }

    /// The listening socket, until teardown or disown
    pub fn listener(&self) -> Option<&UnixListener> {
        self.listener.as_ref()
    }

    /// The bound path, until teardown or disown
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Forget the endpoint without unlinking it (for forked children)
    pub fn disown(&mut self) {
        self.listener = None;
        self.path = None;
    }

    /// Close the socket and unlink the path; later calls do nothing
    pub fn teardown(&mut self) {
        self.listener = None;

        if let Some(path) = self.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed endpoint"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove endpoint")
                }
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.teardown();
    }
}
