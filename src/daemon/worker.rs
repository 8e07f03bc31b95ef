//! The forked child side of the zygote
//!
//! A worker handles exactly one connection and then exits. It answers the
//! version handshake with its pid, takes on the caller's environment, cwd
//! and standard streams, runs the requested code unit, and exits with the
//! unit's status. The status is written back to the caller from an exit
//! handler, so exit-time cleanup the unit registered (and buffered C stdio)
//! completes before the caller sees it.

use crate::daemon::descriptor::{recv_standard_streams, StandardStreams};
use crate::daemon::loader::{Capabilities, CodeUnit, UnitLoader};
use crate::daemon::protocol::{read_handshake, split_env_entry, write_int, Request};
use crate::error::{LoadError, ZygoteError, EXIT_DISPATCH_FAILURE};
use nix::fcntl::{fcntl, FcntlArg};
use nix::unistd::dup2;
use std::env;
use std::ffi::OsString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};

/// Connection the exit handler replies on (-1 once used)
static REPLY_FD: AtomicI32 = AtomicI32::new(-1);

/// Status the exit handler replies with
static REPLY_STATUS: AtomicI32 = AtomicI32::new(EXIT_DISPATCH_FAILURE);

#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" {
    fn on_exit(
        function: extern "C" fn(libc::c_int, *mut libc::c_void),
        arg: *mut libc::c_void,
    ) -> libc::c_int;
}

/// Everything a worker needs to run one request
pub struct ExecutionContext<'a> {
    pub request: Request,
    pub unit: Box<dyn CodeUnit>,
    pub capabilities: &'a Capabilities,
}

impl ExecutionContext<'_> {
    /// Invoke the unit's entry point with the request's argument vector
    pub fn run(&mut self) -> Result<i32, LoadError> {
        let argv = self.request.argv();
        self.unit.invoke(self.capabilities, &argv)
    }
}

/// Serve one connection in a freshly forked child; never returns
pub fn grow<L: UnitLoader + ?Sized>(
    stream: UnixStream,
    loader: &L,
    capabilities: &Capabilities,
    expected_version: i32,
) -> ! {
    let pid = process::id() as i32;

    // The connection must survive the dup2 onto fds 0, 1 and 2
    let mut stream = match lift_above_stdio(OwnedFd::from(stream)) {
        Ok(fd) => UnixStream::from(fd),
        Err(e) => {
            tracing::error!(pid, error = %e, "cannot move connection off stdio");
            process::exit(EXIT_DISPATCH_FAILURE);
        }
    };

    // No reply of any kind on a failed handshake: the peer speaks another
    // protocol and would misread it
    let version = match read_handshake(&mut stream, expected_version) {
        Ok(version) => version,
        Err(e) if e.is_eof() => {
            tracing::debug!(pid, "peer closed before the handshake");
            process::exit(EXIT_DISPATCH_FAILURE);
        }
        Err(e) => {
            tracing::error!(pid, error = %e, "rejecting request");
            process::exit(EXIT_DISPATCH_FAILURE);
        }
    };

    if let Err(e) = write_int(&mut stream, pid) {
        tracing::error!(pid, error = %e, "failed to send pid");
        process::exit(EXIT_DISPATCH_FAILURE);
    }

    // From here on every exit replies exactly once, including a unit that
    // calls exit() itself
    let immediate = !arm_exit_reply(&stream);

    let status = match dispatch(&mut stream, version, loader, capabilities) {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(pid, error = %e, "request failed");
            EXIT_DISPATCH_FAILURE
        }
    };

    REPLY_STATUS.store(status, Ordering::SeqCst);
    if immediate {
        reply_with_exit_status();
    }
    // `stream` is never dropped; the exit handler owns its descriptor
    process::exit(status);
}

/// Decode the request body, become the caller's process, and run the unit
fn dispatch<L: UnitLoader + ?Sized>(
    stream: &mut UnixStream,
    version: i32,
    loader: &L,
    capabilities: &Capabilities,
) -> Result<i32, ZygoteError> {
    let request = Request::decode_body(version, stream)?;
    let pid = process::id();

    replace_environment(&request.environment);
    change_directory(&request.cwd);

    tracing::info!(
        pid,
        locator = ?request.locator,
        %capabilities,
        args = ?request.args,
        "run"
    );

    let unit = loader.load(&request.locator)?;

    let streams = recv_standard_streams(&*stream)?;
    install_standard_streams(streams)?;

    let mut context = ExecutionContext {
        request,
        unit,
        capabilities,
    };
    let status = context.run()?;

    // Unload before replying so the unit's destructors run first
    drop(context);

    Ok(status)
}

/// Replace the whole environment with `entries`
fn replace_environment(entries: &[OsString]) {
    let stale: Vec<OsString> = env::vars_os().map(|(key, _)| key).collect();
    for key in stale {
        env::remove_var(key);
    }

    for entry in entries {
        match split_env_entry(entry) {
            Some((key, value)) => env::set_var(key, value),
            None => tracing::debug!(?entry, "skipping malformed environment entry"),
        }
    }
}

fn change_directory(cwd: &Path) {
    match env::set_current_dir(cwd) {
        Ok(()) => tracing::debug!(pid = process::id(), cwd = %cwd.display(), "cd"),
        Err(e) => tracing::warn!(cwd = %cwd.display(), error = %e, "cannot change directory"),
    }
}

/// Put the transferred descriptors on fds 0, 1 and 2, closing the carriers
///
/// A carrier may itself sit on 0, 1 or 2 when the zygote runs with closed
/// stdio, so all three are moved above 2 before any of them is installed.
fn install_standard_streams(streams: StandardStreams<OwnedFd>) -> Result<(), ZygoteError> {
    let StandardStreams {
        stdin,
        stdout,
        stderr,
    } = streams;

    let lift = |fd, target| {
        lift_above_stdio(fd).map_err(|source| ZygoteError::InstallDescriptor { target, source })
    };
    let carriers = [
        (lift(stdin, libc::STDIN_FILENO)?, libc::STDIN_FILENO),
        (lift(stdout, libc::STDOUT_FILENO)?, libc::STDOUT_FILENO),
        (lift(stderr, libc::STDERR_FILENO)?, libc::STDERR_FILENO),
    ];

    for (fd, target) in &carriers {
        dup2(fd.as_raw_fd(), *target)
            .map_err(|source| ZygoteError::InstallDescriptor { target: *target, source })?;
    }

    Ok(())
}

/// Move `fd` to the lowest free descriptor above 2 (close-on-exec)
fn lift_above_stdio(fd: OwnedFd) -> nix::Result<OwnedFd> {
    if fd.as_raw_fd() > libc::STDERR_FILENO {
        return Ok(fd);
    }
    let lifted = fcntl(
        fd.as_raw_fd(),
        FcntlArg::F_DUPFD_CLOEXEC(libc::STDERR_FILENO + 1),
    )?;
    // SAFETY: fcntl just returned this descriptor and nothing else owns it
    Ok(unsafe { OwnedFd::from_raw_fd(lifted) })
}

extern "C" fn reply_with_exit_status() {
    let fd = REPLY_FD.swap(-1, Ordering::SeqCst);
    if fd < 0 {
        return;
    }

    let status = REPLY_STATUS.load(Ordering::SeqCst).to_ne_bytes();
    // SAFETY: `fd` belongs to the worker's connection, which is never
    // dropped, and is only closed here
    unsafe {
        libc::fflush(std::ptr::null_mut());
        libc::write(fd, status.as_ptr().cast(), status.len());
        libc::close(fd);
    }
}

/// glibc hands exit handlers the status passed to exit()
#[cfg(all(target_os = "linux", target_env = "gnu"))]
extern "C" fn reply_with_status_on_exit(status: libc::c_int, _arg: *mut libc::c_void) {
    REPLY_STATUS.store(status, Ordering::SeqCst);
    reply_with_exit_status();
}

/// Register the exit-time reply on `stream` with the failure status
///
/// Where the C library reports the exit status to handlers, the reply
/// carries whatever status the process exits with. Elsewhere it carries the
/// stored status, so a unit that calls exit() itself reports failure.
///
/// Returns false when the handler could not be registered; the caller must
/// then call [`reply_with_exit_status`] itself.
fn arm_exit_reply(stream: &UnixStream) -> bool {
    REPLY_STATUS.store(EXIT_DISPATCH_FAILURE, Ordering::SeqCst);
    REPLY_FD.store(stream.as_raw_fd(), Ordering::SeqCst);

    // SAFETY: the handler touches only the two atomics and a descriptor
    // nothing else closes
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    let registered = unsafe { on_exit(reply_with_status_on_exit, std::ptr::null_mut()) };
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    let registered = unsafe { libc::atexit(reply_with_exit_status) };

    if registered != 0 {
        tracing::warn!("cannot register exit handler; replying before exit");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::protocol::read_int;
    use std::os::fd::IntoRawFd;

    #[test]
    fn test_reply_handler_writes_once() {
        let (local, mut remote) = UnixStream::pair().unwrap();

        REPLY_STATUS.store(17, Ordering::SeqCst);
        REPLY_FD.store(local.into_raw_fd(), Ordering::SeqCst);

        reply_with_exit_status();
        // Second call finds no connection
        reply_with_exit_status();

        assert_eq!(read_int(&mut remote).unwrap(), 17);
        let mut rest = Vec::new();
        std::io::Read::read_to_end(&mut remote, &mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_lift_leaves_high_descriptors_alone() {
        let (local, _remote) = UnixStream::pair().unwrap();
        let raw = local.as_raw_fd();
        assert!(raw > libc::STDERR_FILENO);

        let lifted = lift_above_stdio(OwnedFd::from(local)).unwrap();
        assert_eq!(lifted.as_raw_fd(), raw);
    }

    /// Carriers that arrive on fds 0, 1 and 2 in the wrong order still end
    /// up behind the right standard stream
    #[test]
    fn test_install_carriers_sitting_on_stdio() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, pipe, ForkResult};

        let _guard = crate::signal::TEST_SIGNAL_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        // SAFETY: the child only shuffles descriptors and leaves with _exit
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let ok = std::panic::catch_unwind(swap_carriers_through_stdio).unwrap_or(false);
                unsafe { libc::_exit(if ok { 0 } else { 1 }) }
            }
            ForkResult::Parent { child } => {
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }

        fn swap_carriers_through_stdio() -> bool {
            let (out_read, out_write) = pipe().unwrap();
            let (in_read, in_write) = pipe().unwrap();
            let (err_read, err_write) = pipe().unwrap();

            // SAFETY: the forked child owns its descriptor table
            let carrier = |fd: &OwnedFd| unsafe { OwnedFd::from_raw_fd(libc::dup(fd.as_raw_fd())) };
            unsafe {
                libc::close(0);
                libc::close(1);
                libc::close(2);
            }
            // Lowest free descriptors: stdout's carrier lands on 0, stdin's
            // on 1, stderr's on 2
            let stdout = carrier(&out_write);
            let stdin = carrier(&in_write);
            let stderr = carrier(&err_write);
            if (stdout.as_raw_fd(), stdin.as_raw_fd(), stderr.as_raw_fd()) != (0, 1, 2) {
                return false;
            }

            if install_standard_streams(StandardStreams {
                stdin,
                stdout,
                stderr,
            })
            .is_err()
            {
                return false;
            }

            for (fd, text) in [(0, "in"), (1, "out"), (2, "err")] {
                unsafe { libc::write(fd, text.as_ptr().cast(), text.len()) };
            }
            unsafe {
                libc::close(0);
                libc::close(1);
                libc::close(2);
            }
            drop((out_write, in_write, err_write));

            let drain = |fd: OwnedFd| {
                let mut text = String::new();
                std::io::Read::read_to_string(&mut std::fs::File::from(fd), &mut text).ok();
                text
            };
            drain(out_read) == "out" && drain(in_read) == "in" && drain(err_read) == "err"
        }
    }
}
