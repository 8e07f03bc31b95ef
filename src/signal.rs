//! Signal dispositions of the zygote process
//!
//! Handlers only store into atomics and write a wake byte to a self-pipe
//! (signal-hook does the async-signal-safe part). The accept loop blocks in
//! `poll` on the listener and the pipe, then reads the atomics. A forked
//! child restores the default dispositions before it runs any code unit.

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use signal_hook::consts::{SIGCHLD, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::SigId;
use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Signals that shut the zygote down
pub const TERMINATION_SIGNALS: [i32; 3] = [SIGINT, SIGQUIT, SIGTERM];

/// Signal flags read by the accept loop, plus a descriptor that becomes
/// readable whenever one of them is set
pub struct LifecycleSignals {
    /// Number of the last termination signal, 0 if none
    termination: Arc<AtomicUsize>,
    /// Set when a child changed state
    child_exited: Arc<AtomicBool>,
    /// Read end of the self-pipe; `None` after `restore_defaults`
    wake: Option<UnixStream>,
    ids: Vec<SigId>,
}

impl LifecycleSignals {
    /// Register handlers for SIGINT, SIGQUIT, SIGTERM and SIGCHLD
    pub fn install() -> io::Result<Self> {
        let (wake, waker) = UnixStream::pair()?;
        wake.set_nonblocking(true)?;
        waker.set_nonblocking(true)?;

        let mut signals = Self {
            termination: Arc::new(AtomicUsize::new(0)),
            child_exited: Arc::new(AtomicBool::new(false)),
            wake: Some(wake),
            ids: Vec::new(),
        };

        for sig in TERMINATION_SIGNALS {
            let id = signal_hook::flag::register_usize(
                sig,
                Arc::clone(&signals.termination),
                sig as usize,
            )?;
            signals.ids.push(id);
        }

        let id = signal_hook::flag::register(SIGCHLD, Arc::clone(&signals.child_exited))?;
        signals.ids.push(id);

        // Registered after the flags, so the flag is set before the wake-up
        for sig in TERMINATION_SIGNALS.into_iter().chain([SIGCHLD]) {
            let id = signal_hook::low_level::pipe::register(sig, waker.try_clone()?)?;
            signals.ids.push(id);
        }

        Ok(signals)
    }

    /// Readable whenever a handled signal arrived since the last
    /// [`LifecycleSignals::drain_wakeups`]
    pub fn wake_fd(&self) -> Option<BorrowedFd<'_>> {
        self.wake.as_ref().map(|wake| wake.as_fd())
    }

    /// Consume pending wake bytes
    pub fn drain_wakeups(&self) {
        let Some(mut wake) = self.wake.as_ref() else {
            return;
        };

        let mut buf = [0u8; 64];
        loop {
            match wake.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    /// The termination signal received so far, if any
    pub fn termination(&self) -> Option<i32> {
        match self.termination.load(Ordering::SeqCst) {
            0 => None,
            sig => Some(sig as i32),
        }
    }

    /// Whether a child exited since the last call
    pub fn take_child_exited(&self) -> bool {
        self.child_exited.swap(false, Ordering::SeqCst)
    }

    /// Drop our handlers and put the kernel defaults back (in a forked child)
    pub fn restore_defaults(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
        self.wake = None;

        for sig in [Signal::SIGINT, Signal::SIGQUIT, Signal::SIGTERM, Signal::SIGCHLD] {
            // SAFETY: SIG_DFL installs no Rust code as a handler
            if let Err(e) = unsafe { signal(sig, SigHandler::SigDfl) } {
                tracing::warn!(signal = ?sig, error = %e, "failed to restore default disposition");
            }
        }
    }
}

impl Drop for LifecycleSignals {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Exit code for a process terminated on behalf of `sig`
pub fn exit_code_for_signal(sig: i32) -> i32 {
    match sig {
        SIGINT => 130,  // 128 + 2
        SIGQUIT => 131, // 128 + 3
        SIGTERM => 143, // 128 + 15
        sig if sig > 0 => 128 + sig,
        _ => 1,
    }
}

/// Reap every finished child without blocking; returns how many were reaped
pub fn reap_children() -> usize {
    let mut reaped = 0;

    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                reaped += 1;
                if code == 0 {
                    tracing::debug!(pid = pid.as_raw(), "child done");
                } else {
                    tracing::info!(pid = pid.as_raw(), status = code, "child done with exit status");
                }
            }
            Ok(WaitStatus::Signaled(pid, sig, core_dumped)) => {
                reaped += 1;
                tracing::warn!(pid = pid.as_raw(), signal = ?sig, core_dumped, "child killed by signal");
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => {
                // Stopped or continued; not finished
            }
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                break;
            }
        }
    }

    reaped
}

/// Serializes tests that raise signals or fork (and so deliver SIGCHLD)
#[cfg(test)]
pub(crate) static TEST_SIGNAL_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    fn lock() -> std::sync::MutexGuard<'static, ()> {
        TEST_SIGNAL_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for_signal(SIGINT), 130);
        assert_eq!(exit_code_for_signal(SIGQUIT), 131);
        assert_eq!(exit_code_for_signal(SIGTERM), 143);
        assert_eq!(exit_code_for_signal(libc::SIGHUP), 129);
        assert_eq!(exit_code_for_signal(0), 1);
    }

    #[test]
    fn test_signal_flags() {
        let _guard = lock();
        let signals = LifecycleSignals::install().unwrap();
        assert_eq!(signals.termination(), None);
        assert!(!signals.take_child_exited());

        signal_hook::low_level::raise(SIGCHLD).unwrap();
        assert!(signals.take_child_exited());
        assert!(!signals.take_child_exited());

        signal_hook::low_level::raise(SIGTERM).unwrap();
        assert_eq!(signals.termination(), Some(SIGTERM));
    }

    fn is_readable(fd: BorrowedFd<'_>) -> bool {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
        poll(&mut fds, PollTimeout::ZERO).unwrap() == 1
    }

    #[test]
    fn test_signal_wakes_the_pipe() {
        let _guard = lock();
        let signals = LifecycleSignals::install().unwrap();
        signals.drain_wakeups();
        assert!(!is_readable(signals.wake_fd().unwrap()));

        signal_hook::low_level::raise(SIGCHLD).unwrap();
        assert!(is_readable(signals.wake_fd().unwrap()));

        signals.drain_wakeups();
        assert!(!is_readable(signals.wake_fd().unwrap()));
    }
}
