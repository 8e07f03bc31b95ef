use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::os::fd::{AsFd, AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::Mutex;
use zygote::daemon::descriptor::send_standard_streams;
use zygote::daemon::protocol::{read_int, write_int};
use zygote::daemon::{worker, Capabilities, Request, StandardStreams, StaticLoader, PROTOCOL_VERSION};

// Workers are forked from the test process
static LOCK: Mutex<()> = Mutex::new(());

fn write_stdout(bytes: &[u8]) {
    // SAFETY: fd 1 is open in every worker; ManuallyDrop keeps it open
    let mut out = ManuallyDrop::new(unsafe { File::from_raw_fd(1) });
    let _ = out.write_all(bytes);
}

fn seven(_: &Capabilities, _: &[OsString]) -> i32 {
    7
}

extern "C" fn say_goodbye() {
    write_stdout(b"goodbye\n");
}

/// Leaves text in a C stdio buffer and registers an exit handler
fn buffered(_: &Capabilities, _: &[OsString]) -> i32 {
    // SAFETY: fd 1 is the worker's stdout; the FILE is flushed at exit
    unsafe {
        libc::atexit(say_goodbye);
        let out = libc::fdopen(1, b"w\0".as_ptr().cast());
        if out.is_null() {
            return 90;
        }
        libc::fputs(b"buffered\0".as_ptr().cast(), out);
    }
    5
}

fn quits(_: &Capabilities, argv: &[OsString]) -> i32 {
    let code = argv
        .get(1)
        .and_then(|a| a.to_str())
        .and_then(|a| a.parse().ok())
        .unwrap_or(-1);
    process::exit(code);
}

fn units() -> StaticLoader {
    StaticLoader::new()
        .register("seven", seven)
        .register("buffered", buffered)
        .register("quits", quits)
}

/// A worker forked straight onto one end of a socket pair
struct Worker {
    pid: Pid,
    stream: UnixStream,
}

impl Worker {
    fn fork() -> Self {
        let (client, server) = UnixStream::pair().unwrap();

        // SAFETY: the child only serves the connection and exits
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                drop(client);
                let loader = units();
                let capabilities = Capabilities::new();
                let _ = panic::catch_unwind(AssertUnwindSafe(|| {
                    worker::grow(server, &loader, &capabilities, PROTOCOL_VERSION);
                }));
                unsafe { libc::_exit(101) }
            }
            ForkResult::Parent { child } => Self {
                pid: child,
                stream: client,
            },
        }
    }

    /// Drive the whole request and return the replied status
    fn request<F: AsFd>(&mut self, locator: &str, args: &[&str], stdout: &F) -> i32 {
        let request = Request::new(locator, args.iter().map(OsString::from).collect())
            .with_cwd(std::env::temp_dir());
        let null = File::options()
            .read(true)
            .write(true)
            .open("/dev/null")
            .unwrap();

        write_int(&mut self.stream, PROTOCOL_VERSION).unwrap();
        assert_eq!(read_int(&mut self.stream).unwrap(), self.pid.as_raw());
        self.stream.write_all(&request.encode_body().unwrap()).unwrap();

        let streams = StandardStreams {
            stdin: null.as_fd(),
            stdout: stdout.as_fd(),
            stderr: null.as_fd(),
        };
        send_standard_streams(&self.stream, &streams).unwrap();
        read_int(&mut self.stream).unwrap()
    }

    fn exit_code(self) -> i32 {
        match waitpid(self.pid, None).unwrap() {
            WaitStatus::Exited(_, code) => code,
            other => panic!("worker did not exit normally: {:?}", other),
        }
    }
}

/// Read whatever is already in the pipe, without waiting for more
fn available(reader: &mut os_pipe::PipeReader) -> String {
    fcntl(reader.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).unwrap();
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("reading worker output: {}", e),
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[test]
fn test_worker_exit_code_matches_reply() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_reader, writer) = os_pipe::pipe().unwrap();

    let mut worker = Worker::fork();
    assert_eq!(worker.request("seven", &[], &writer), 7);
    assert_eq!(worker.exit_code(), 7);
}

#[test]
fn test_exit_time_output_precedes_status() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (mut reader, writer) = os_pipe::pipe().unwrap();

    let mut worker = Worker::fork();
    let status = worker.request("buffered", &[], &writer);
    // Everything the unit left behind is in the pipe once the status arrives
    let output = available(&mut reader);

    assert_eq!(status, 5);
    assert!(output.contains("buffered"), "missing stdio output: {:?}", output);
    assert!(output.contains("goodbye\n"), "missing exit handler output: {:?}", output);
    assert_eq!(worker.exit_code(), 5);
}

#[test]
fn test_unit_calling_exit_reports_its_code() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let (_reader, writer) = os_pipe::pipe().unwrap();

    let mut worker = Worker::fork();
    let status = worker.request("quits", &["3"], &writer);

    if cfg!(all(target_os = "linux", target_env = "gnu")) {
        assert_eq!(status, 3);
    } else {
        assert_eq!(status, zygote::EXIT_DISPATCH_FAILURE);
    }
    assert_eq!(worker.exit_code(), 3);
}

#[test]
fn test_missing_unit_exits_with_failure() {
    let _guard = LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let mut worker = Worker::fork();
    let request = Request::new("absent", Vec::new()).with_cwd(std::env::temp_dir());

    // The worker replies without waiting for the streams
    write_int(&mut worker.stream, PROTOCOL_VERSION).unwrap();
    read_int(&mut worker.stream).unwrap();
    worker.stream.write_all(&request.encode_body().unwrap()).unwrap();

    assert_eq!(read_int(&mut worker.stream).unwrap(), 1);
    assert_eq!(worker.exit_code(), 1);
}
