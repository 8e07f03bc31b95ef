use crate::daemon::config::ZygoteConfig;
use crate::daemon::endpoint::Endpoint;
use crate::daemon::loader::{Capabilities, UnitLoader};
use crate::daemon::worker;
use crate::error::ZygoteError;
use crate::signal::{exit_code_for_signal, reap_children, LifecycleSignals};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{fork, ForkResult};
use std::fs;
use std::io::ErrorKind;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;

/// How a zygote's accept loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminated {
    /// The termination signal that was received
    pub signal: i32,
}

impl Terminated {
    /// Exit code the hosting process should terminate with
    pub fn exit_code(&self) -> i32 {
        exit_code_for_signal(self.signal)
    }
}

/// A bound zygote, ready to fork a worker per connection
///
/// The hosting process must be single-threaded when it calls
/// [`Zygote::serve`]: `fork` copies only the calling thread.
pub struct Zygote<L: UnitLoader> {
    config: ZygoteConfig,
    endpoint: Endpoint,
    signals: LifecycleSignals,
    loader: L,
    capabilities: Capabilities,
}

impl<L: UnitLoader> Zygote<L> {
    /// Bind the endpoint and install signal handlers
    pub fn bind(
        config: ZygoteConfig,
        loader: L,
        capabilities: Capabilities,
    ) -> Result<Self, ZygoteError> {
        let endpoint = Endpoint::bind(&config.socket_path, config.socket_mode)?;
        let signals = LifecycleSignals::install().map_err(ZygoteError::Signals)?;

        let shown = fs::canonicalize(&config.socket_path)
            .unwrap_or_else(|_| config.socket_path.clone());
        tracing::info!(
            path = %shown.display(),
            version = config.protocol_version,
            %capabilities,
            "zygote listening"
        );

        Ok(Self {
            config,
            endpoint,
            signals,
            loader,
            capabilities,
        })
    }

    pub fn config(&self) -> &ZygoteConfig {
        &self.config
    }

    /// Path of the listening socket, until shutdown
    pub fn socket_path(&self) -> Option<&Path> {
        self.endpoint.path()
    }

    /// Accept and fork until a termination signal arrives
    ///
    /// The loop sleeps in `poll` on the listener and the signal self-pipe,
    /// so a connecting peer is accepted as soon as it arrives.
    ///
    /// Returns in the parent process only; forked workers exit from
    /// inside. The endpoint is torn down on every way out.
    pub fn serve(mut self) -> Result<Terminated, ZygoteError> {
        let result = self.accept_loop();
        self.endpoint.teardown();
        result
    }

    fn accept_loop(&mut self) -> Result<Terminated, ZygoteError> {
        // Readiness comes from poll; a peer that vanished in between must
        // not block the loop in accept
        self.endpoint
            .listener()
            .ok_or(ZygoteError::NotListening)?
            .set_nonblocking(true)?;

        loop {
            if let Some(signal) = self.signals.termination() {
                tracing::info!(signal, "zygote shutting down");
                return Ok(Terminated { signal });
            }

            if self.signals.take_child_exited() {
                reap_children();
            }

            if !self.wait_for_connection()? {
                continue;
            }

            let accepted = self
                .endpoint
                .listener()
                .ok_or(ZygoteError::NotListening)?
                .accept();

            match accepted {
                Ok((stream, _addr)) => {
                    // Some platforms hand out accepted sockets in the listener's mode
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::warn!(error = %e, "dropping connection");
                        continue;
                    }
                    if let Err(e) = self.spawn_worker(stream) {
                        tracing::error!(error = %e, "failed to spawn worker");
                    }
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::Interrupted | ErrorKind::ConnectionAborted
                    ) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Block until a peer is connecting or a signal arrived
    ///
    /// Returns true when the listener is readable.
    fn wait_for_connection(&self) -> Result<bool, ZygoteError> {
        let listener = self.endpoint.listener().ok_or(ZygoteError::NotListening)?;
        let wake = self.signals.wake_fd().ok_or(ZygoteError::NotListening)?;

        let mut fds = [
            PollFd::new(listener.as_fd(), PollFlags::POLLIN),
            PollFd::new(wake, PollFlags::POLLIN),
        ];

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(ZygoteError::Poll(e)),
        }

        let ready = |fd: &PollFd<'_>| fd.revents().is_some_and(|r| !r.is_empty());
        let connecting = ready(&fds[0]);
        if ready(&fds[1]) {
            self.signals.drain_wakeups();
        }

        Ok(connecting)
    }

    /// Fork a worker for `stream`
    fn spawn_worker(&mut self, stream: UnixStream) -> Result<(), ZygoteError> {
        // SAFETY: the zygote runs single-threaded, and the child only runs
        // the worker before exiting
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                tracing::debug!(pid = child.as_raw(), "forked worker");
                // The worker owns the connection now
                drop(stream);
                Ok(())
            }
            Ok(ForkResult::Child) => {
                self.endpoint.disown();
                self.signals.restore_defaults();
                worker::grow(
                    stream,
                    &self.loader,
                    &self.capabilities,
                    self.config.protocol_version,
                )
            }
            Err(e) => Err(ZygoteError::Fork(e)),
        }
    }
}
