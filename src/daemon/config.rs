//! Zygote configuration
//!
//! The socket path always comes from the starting process. Everything else
//! has a default and may be overridden from the environment:
//! - ZYGOTE_LOADER (deepbind, portable)
//! - ZYGOTE_SOCKET_MODE (octal permissions of the socket file)

use crate::daemon::loader::Freshness;
use crate::daemon::protocol::PROTOCOL_VERSION;
use std::ffi::OsString;
use std::path::PathBuf;

/// Default permissions of the socket file (owner only)
pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

/// Runtime configuration of a zygote
#[derive(Debug, Clone, PartialEq)]
pub struct ZygoteConfig {
    /// Filesystem path of the listening socket
    pub socket_path: PathBuf,
    /// Version a request must carry to be served
    pub protocol_version: i32,
    /// dlopen policy for code units
    pub freshness: Freshness,
    /// Permissions applied to the socket file
    pub socket_mode: u32,
}

impl ZygoteConfig {
    /// Defaults for a zygote listening at `socket_path`
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            protocol_version: PROTOCOL_VERSION,
            freshness: Freshness::default(),
            socket_mode: DEFAULT_SOCKET_MODE,
        }
    }

    /// Defaults overridden by `ZYGOTE_*` variables of this process
    pub fn from_env(socket_path: impl Into<PathBuf>) -> Self {
        Self::from_vars(socket_path, std::env::vars_os())
    }

    /// Defaults overridden by `ZYGOTE_*` entries of `vars`
    pub fn from_vars<I>(socket_path: impl Into<PathBuf>, vars: I) -> Self
    where
        I: IntoIterator<Item = (OsString, OsString)>,
    {
        let mut config = Self::new(socket_path);

        for (key, value) in vars {
            let (Some(key), Some(value)) = (key.to_str(), value.to_str()) else {
                continue;
            };
            let value = value.trim();

            match key {
                "ZYGOTE_LOADER" => match value.parse::<Freshness>() {
                    Ok(freshness) => config.freshness = freshness,
                    Err(e) => tracing::warn!(value, error = %e, "ignoring invalid ZYGOTE_LOADER"),
                },
                "ZYGOTE_SOCKET_MODE" => match u32::from_str_radix(value, 8) {
                    Ok(mode) if mode <= 0o777 => config.socket_mode = mode,
                    _ => tracing::warn!(value, "ignoring invalid ZYGOTE_SOCKET_MODE"),
                },
                _ => {}
            }
        }

        config
    }

    /// Serve requests of another protocol version
    pub fn with_protocol_version(mut self, version: i32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_freshness(mut self, freshness: Freshness) -> Self {
        self.freshness = freshness;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(OsString, OsString)> {
        pairs
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ZygoteConfig::new("/tmp/z.sock");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/z.sock"));
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.freshness, Freshness::Deepbind);
        assert_eq!(config.socket_mode, 0o600);
    }

    #[test]
    fn test_overrides_from_vars() {
        let config = ZygoteConfig::from_vars(
            "/tmp/z.sock",
            vars(&[
                ("ZYGOTE_LOADER", "portable"),
                ("ZYGOTE_SOCKET_MODE", "660"),
                ("UNRELATED", "x"),
            ]),
        );

        assert_eq!(config.freshness, Freshness::Portable);
        assert_eq!(config.socket_mode, 0o660);
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = ZygoteConfig::from_vars(
            "/tmp/z.sock",
            vars(&[
                ("ZYGOTE_LOADER", "eager"),
                ("ZYGOTE_SOCKET_MODE", "999"),
            ]),
        );

        assert_eq!(config, ZygoteConfig::new("/tmp/z.sock"));
    }

    #[test]
    fn test_builders() {
        let config = ZygoteConfig::new("/tmp/z.sock")
            .with_protocol_version(8)
            .with_freshness(Freshness::Portable);

        assert_eq!(config.protocol_version, 8);
        assert_eq!(config.freshness, Freshness::Portable);
    }
}
