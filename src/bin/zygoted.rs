//! Zygote daemon binary
//!
//! Starts a zygote that loads code units with dlopen, and provides
//! commands to stop and check on it.

use anyhow::{anyhow, bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;
use zygote::daemon::{run_direct, Capabilities, DlopenLoader, GrowClient, Zygote, ZygoteConfig};
use zygote::logging;

fn main() -> Result<()> {
    let args: Vec<OsString> = env::args_os().collect();

    let Some(command) = args.get(1).and_then(|c| c.to_str()) else {
        print_usage();
        return Ok(());
    };

    match (command, args.get(2)) {
        ("start", Some(socket)) => start_zygote(Path::new(socket)),
        ("stop", Some(socket)) => stop_zygote(Path::new(socket)),
        ("status", Some(socket)) => check_status(Path::new(socket)),
        ("direct", Some(locator)) => run_in_process(locator, &args[3..]),
        ("-h" | "--help", _) => {
            print_usage();
            Ok(())
        }
        ("start" | "stop" | "status" | "direct", None) => {
            eprintln!("Error: '{}' needs an argument", command);
            print_usage();
            process::exit(2);
        }
        _ => {
            eprintln!("Error: Unknown command '{}'", command);
            print_usage();
            process::exit(2);
        }
    }
}

fn pid_file(socket_path: &Path) -> PathBuf {
    let mut path = socket_path.as_os_str().to_owned();
    path.push(".pid");
    PathBuf::from(path)
}

fn start_zygote(socket_path: &Path) -> Result<()> {
    logging::init("info")?;

    let client = GrowClient::new(socket_path)?;
    if client.is_zygote_running() {
        eprintln!("Error: A zygote is already running at {}", socket_path.display());
        eprintln!("Use 'zygoted stop {}' to stop it first.", socket_path.display());
        process::exit(1);
    }

    let config = ZygoteConfig::from_env(socket_path);
    let loader = DlopenLoader::new(config.freshness);
    let zygote = Zygote::bind(config, loader, Capabilities::new())
        .with_context(|| format!("failed to start zygote at {}", socket_path.display()))?;

    let pid_path = pid_file(socket_path);
    fs::write(&pid_path, format!("{}\n", process::id()))
        .with_context(|| format!("failed to write {}", pid_path.display()))?;

    let outcome = zygote.serve();
    fs::remove_file(&pid_path).ok();

    let terminated = outcome.context("zygote stopped unexpectedly")?;
    process::exit(terminated.exit_code());
}

fn read_pid(pid_path: &Path) -> Result<Pid> {
    let text = fs::read_to_string(pid_path)
        .with_context(|| format!("failed to read {}", pid_path.display()))?;
    let pid: i32 = text
        .trim()
        .parse()
        .map_err(|_| anyhow!("Invalid PID in {}", pid_path.display()))?;
    Ok(Pid::from_raw(pid))
}

fn stop_zygote(socket_path: &Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Zygote is not running (socket not found).");
        return Ok(());
    }

    let pid_path = pid_file(socket_path);
    if !pid_path.exists() {
        eprintln!("Warning: PID file not found. Cannot send signal to zygote.");
        eprintln!("You may need to manually kill the zygote process.");
        return Ok(());
    }

    let pid = read_pid(&pid_path)?;
    kill(pid, Signal::SIGTERM).with_context(|| format!("failed to signal zygote {}", pid))?;
    println!("Sent shutdown signal to zygote (PID {}).", pid);

    // Wait for the socket to be removed (up to 5 seconds)
    for _ in 0..50 {
        thread::sleep(Duration::from_millis(100));
        if !socket_path.exists() {
            println!("Zygote stopped.");
            return Ok(());
        }
    }

    bail!("zygote {} did not remove {}", pid, socket_path.display())
}

fn check_status(socket_path: &Path) -> Result<()> {
    if !socket_path.exists() {
        println!("Zygote is not running (socket not found).");
        process::exit(1);
    }

    let client = GrowClient::new(socket_path)?;
    if !client.is_zygote_running() {
        println!("Socket file exists but zygote is not responding.");
        println!("This may be a stale socket. Try 'zygoted start {}'.", socket_path.display());
        process::exit(1);
    }

    println!("Zygote is running at {}", socket_path.display());
    if let Ok(pid) = read_pid(&pid_file(socket_path)) {
        println!("PID: {}", pid);
    }
    Ok(())
}

fn run_in_process(locator: &OsStr, args: &[OsString]) -> Result<()> {
    if let Err(e) = logging::init("warn") {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    let config = ZygoteConfig::from_env("");
    let loader = DlopenLoader::new(config.freshness);
    let status = run_direct(&loader, locator, &Capabilities::new(), args)?;
    process::exit(status);
}

fn print_usage() {
    println!("Zygote daemon");
    println!();
    println!("Usage: zygoted <command> <argument>...");
    println!();
    println!("Commands:");
    println!("  start SOCKET              Serve code units at SOCKET (foreground)");
    println!("  stop SOCKET               Stop the zygote serving SOCKET");
    println!("  status SOCKET             Check whether a zygote serves SOCKET");
    println!("  direct LOCATOR [ARG]...   Run a code unit in this process");
    println!("  -h, --help                Show this help message");
    println!();
    println!("Environment:");
    println!("  ZYGOTE_LOG          log filter (e.g. info, debug)");
    println!("  ZYGOTE_LOADER       deepbind or portable");
    println!("  ZYGOTE_SOCKET_MODE  octal permissions of the socket file");
}
