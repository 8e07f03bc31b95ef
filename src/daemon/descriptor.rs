//! Descriptor transfer over a Unix stream socket
//!
//! Each transfer is one `sendmsg` carrying a single payload byte and a single
//! descriptor as `SCM_RIGHTS` ancillary data. The payload byte exists only
//! because a stream socket cannot carry ancillary data on an empty message.

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

/// Something that can move open descriptors to its peer
pub trait DescriptorChannel {
    /// Send one descriptor; the local copy stays open
    fn send_descriptor(&self, fd: BorrowedFd<'_>) -> io::Result<()>;

    /// Receive one descriptor, owned by the caller
    fn recv_descriptor(&self) -> io::Result<OwnedFd>;
}

impl DescriptorChannel for UnixStream {
    fn send_descriptor(&self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let payload = [0u8; 1];
        let iov = [IoSlice::new(&payload)];
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];

        sendmsg::<()>(self.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(io::Error::from)?;
        Ok(())
    }

    fn recv_descriptor(&self) -> io::Result<OwnedFd> {
        let mut payload = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut payload)];
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; 1]);

        let msg = recvmsg::<()>(
            self.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;

        if msg.bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed before sending a descriptor",
            ));
        }

        let mut received: Option<OwnedFd> = None;
        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                for fd in fds {
                    // SAFETY: the kernel just installed this descriptor in our table
                    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
                    // Extra descriptors are dropped (closed) rather than leaked
                    if received.is_none() {
                        received = Some(owned);
                    }
                }
            }
        }

        received.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "descriptor was not passed")
        })
    }
}

/// The three standard streams of a process
#[derive(Debug)]
pub struct StandardStreams<F> {
    pub stdin: F,
    pub stdout: F,
    pub stderr: F,
}

impl<'a> StandardStreams<BorrowedFd<'a>> {
    /// Borrow this process's own standard streams
    pub fn of_current_process() -> Self {
        // SAFETY: fds 0, 1 and 2 stay open for the life of the process
        unsafe {
            Self {
                stdin: BorrowedFd::borrow_raw(libc::STDIN_FILENO),
                stdout: BorrowedFd::borrow_raw(libc::STDOUT_FILENO),
                stderr: BorrowedFd::borrow_raw(libc::STDERR_FILENO),
            }
        }
    }

    /// Borrow three arbitrary descriptors as standard streams
    pub fn borrowed<T: AsFd>(stdin: &'a T, stdout: &'a T, stderr: &'a T) -> Self {
        Self {
            stdin: stdin.as_fd(),
            stdout: stdout.as_fd(),
            stderr: stderr.as_fd(),
        }
    }
}

/// Send standard streams in wire order: stderr, stdout, stdin
pub fn send_standard_streams<C: DescriptorChannel>(
    channel: &C,
    streams: &StandardStreams<BorrowedFd<'_>>,
) -> io::Result<()> {
    channel.send_descriptor(streams.stderr)?;
    channel.send_descriptor(streams.stdout)?;
    channel.send_descriptor(streams.stdin)?;
    Ok(())
}

/// Receive standard streams in wire order: stderr, stdout, stdin
pub fn recv_standard_streams<C: DescriptorChannel>(
    channel: &C,
) -> io::Result<StandardStreams<OwnedFd>> {
    let stderr = channel.recv_descriptor()?;
    let stdout = channel.recv_descriptor()?;
    let stdin = channel.recv_descriptor()?;
    Ok(StandardStreams {
        stdin,
        stdout,
        stderr,
    })
}
