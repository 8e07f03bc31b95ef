//! Zygote wire protocol
//!
//! Every value on the wire is either a native-endian `i32` or a
//! length-prefixed byte string (an `i32` length followed by that many raw
//! bytes, no terminator).
//!
//! ```text
//! client                                   zygote child
//!   version ─────────────────────────────▶  (mismatch: close, no reply)
//!           ◀───────────────────────────── pid
//!   envc, env[envc]
//!   cwd
//!   argc, locator, arg[argc]  ───────────▶
//!   [1 byte + stderr fd]
//!   [1 byte + stdout fd]
//!   [1 byte + stdin fd]       ───────────▶  load, dup2, run
//!           ◀───────────────────────────── exit status
//! ```
//!
//! `argc` counts the caller's arguments only; the code-unit locator travels
//! separately and becomes `argv[0]` on the receiving side.

use crate::error::ProtocolError;
use std::ffi::{OsStr, OsString};
use std::io::{self, Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

/// Protocol version compiled into both the daemon and the client
pub const PROTOCOL_VERSION: i32 = 1;

/// Maximum length of a single string on the wire (10MB)
pub const MAX_STRING_LEN: usize = 10 * 1024 * 1024;

/// A request to grow the zygote into a full process
///
/// Descriptors are not part of this struct; they are transferred out of band
/// over the same channel (see [`crate::daemon::descriptor`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Protocol version the sender speaks
    pub version: i32,
    /// Environment as `KEY=VALUE` entries, in order
    pub environment: Vec<OsString>,
    /// Working directory of the caller
    pub cwd: PathBuf,
    /// Locator of the code unit (conventionally a shared object path)
    pub locator: OsString,
    /// Arguments after the locator
    pub args: Vec<OsString>,
}

impl Request {
    /// Create a request with an empty environment and cwd
    pub fn new(locator: impl Into<OsString>, args: Vec<OsString>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            environment: Vec::new(),
            cwd: PathBuf::new(),
            locator: locator.into(),
            args,
        }
    }

    /// Create a request carrying the current process's environment and cwd
    pub fn from_current_process(
        locator: impl Into<OsString>,
        args: Vec<OsString>,
    ) -> io::Result<Self> {
        let environment = std::env::vars_os()
            .map(|(key, value)| {
                let mut entry = key;
                entry.push("=");
                entry.push(value);
                entry
            })
            .collect();

        Ok(Self {
            environment,
            cwd: std::env::current_dir()?,
            ..Self::new(locator, args)
        })
    }

    /// Override the protocol version
    pub fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Override the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Override the environment
    pub fn with_environment(mut self, environment: Vec<OsString>) -> Self {
        self.environment = environment;
        self
    }

    /// The argument vector the code unit sees: locator first, then the args
    pub fn argv(&self) -> Vec<OsString> {
        std::iter::once(self.locator.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Encode everything that follows the version handshake
    pub fn encode_body(&self) -> io::Result<Vec<u8>> {
        let mut buffer = Vec::new();

        write_count(&mut buffer, self.environment.len())?;
        for entry in &self.environment {
            write_string(&mut buffer, entry.as_bytes())?;
        }

        write_string(&mut buffer, self.cwd.as_os_str().as_bytes())?;

        write_count(&mut buffer, self.args.len())?;
        write_string(&mut buffer, self.locator.as_bytes())?;
        for arg in &self.args {
            write_string(&mut buffer, arg.as_bytes())?;
        }

        Ok(buffer)
    }

    /// Decode everything that follows the version handshake
    ///
    /// `version` is the value already validated by [`read_handshake`].
    pub fn decode_body<R: Read>(version: i32, reader: &mut R) -> Result<Self, ProtocolError> {
        let envc = read_count(reader)?;
        let mut environment = Vec::with_capacity(envc.min(1024));
        for _ in 0..envc {
            environment.push(read_os_string(reader)?);
        }

        let cwd = PathBuf::from(read_os_string(reader)?);

        let argc = read_count(reader)?;
        let locator = read_os_string(reader)?;
        let mut args = Vec::with_capacity(argc.min(1024));
        for _ in 0..argc {
            args.push(read_os_string(reader)?);
        }

        Ok(Self {
            version,
            environment,
            cwd,
            locator,
            args,
        })
    }
}

/// Write a native-endian integer
pub fn write_int<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_ne_bytes())
}

/// Read a native-endian integer
pub fn read_int<R: Read>(reader: &mut R) -> io::Result<i32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(i32::from_ne_bytes(bytes))
}

/// Write a length-prefixed string (no terminator)
pub fn write_string<W: Write>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    if bytes.len() > MAX_STRING_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("String too large: {} bytes", bytes.len()),
        ));
    }
    write_int(writer, bytes.len() as i32)?;
    writer.write_all(bytes)
}

/// Read a length-prefixed string
pub fn read_string<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let len = read_int(reader)?;
    if len < 0 || len as usize > MAX_STRING_LEN {
        return Err(ProtocolError::InvalidLength(len as i64));
    }

    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

fn read_os_string<R: Read>(reader: &mut R) -> Result<OsString, ProtocolError> {
    read_string(reader).map(OsString::from_vec)
}

fn write_count<W: Write>(writer: &mut W, count: usize) -> io::Result<()> {
    let count = i32::try_from(count)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Too many entries"))?;
    write_int(writer, count)
}

fn read_count<R: Read>(reader: &mut R) -> Result<usize, ProtocolError> {
    let count = read_int(reader)?;
    usize::try_from(count).map_err(|_| ProtocolError::InvalidCount(count))
}

/// Read the version handshake and check it against `expected`
pub fn read_handshake<R: Read>(reader: &mut R, expected: i32) -> Result<i32, ProtocolError> {
    let actual = read_int(reader)?;
    if actual != expected {
        return Err(ProtocolError::VersionMismatch { expected, actual });
    }
    Ok(actual)
}

/// Split a `KEY=VALUE` environment entry
///
/// Returns `None` for entries the process environment cannot hold: no `=`,
/// an empty key, or an interior NUL byte.
pub fn split_env_entry(entry: &OsStr) -> Option<(&OsStr, &OsStr)> {
    let bytes = entry.as_bytes();
    if bytes.contains(&0) {
        return None;
    }
    let eq = bytes.iter().position(|&b| b == b'=')?;
    if eq == 0 {
        return None;
    }
    Some((
        OsStr::from_bytes(&bytes[..eq]),
        OsStr::from_bytes(&bytes[eq + 1..]),
    ))
}
