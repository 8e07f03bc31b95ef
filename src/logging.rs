//! Diagnostic logging
//!
//! The subscriber writes to a duplicate of the process's stderr taken at
//! startup. A forked zygote child later replaces fd 2 with the caller's
//! stderr, and its diagnostics must keep going to the daemon's log rather
//! than into the caller's terminal.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io;
use std::os::fd::AsFd;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Variable holding an `EnvFilter` directive, e.g. `ZYGOTE_LOG=debug`
pub const LOG_ENV: &str = "ZYGOTE_LOG";

/// Install the global subscriber; `default_directive` applies when
/// `ZYGOTE_LOG` is unset or invalid
pub fn init(default_directive: &str) -> Result<()> {
    let target = io::stderr()
        .as_fd()
        .try_clone_to_owned()
        .context("failed to duplicate stderr for logging")?;

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(File::from(target)))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install log subscriber: {}", e))
}
