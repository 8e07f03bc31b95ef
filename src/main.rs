//! grow: run a code unit inside a zygote
//!
//! Usage: grow ZYGOTE_SOCKET_PATH CODE_PATH [ARG]...
//!
//! The unit runs in a fresh child of the zygote, with this process's
//! environment, working directory and standard streams. grow exits with the
//! unit's status, or 255 if the request could not be completed.

use std::env;
use std::ffi::OsString;
use std::process;
use zygote::daemon::{GrowClient, Request, StandardStreams};
use zygote::error::{GrowError, EXIT_USAGE};
use zygote::logging;

fn main() {
    let args: Vec<OsString> = env::args_os().collect();

    if args.len() < 3 {
        eprintln!("Usage: grow  ZYGOTE_SOCKET_PATH  CODE_PATH  [ARG]...");
        process::exit(EXIT_USAGE);
    }

    // Quiet unless ZYGOTE_LOG asks otherwise
    if let Err(e) = logging::init("warn") {
        eprintln!("grow: logging disabled: {:#}", e);
    }

    match grow(&args[1], &args[2], args[3..].to_vec()) {
        Ok(status) => process::exit(status),
        Err(e) => {
            eprintln!("grow: {}", e);
            process::exit(e.exit_code());
        }
    }
}

fn grow(socket_path: &OsString, locator: &OsString, args: Vec<OsString>) -> Result<i32, GrowError> {
    let client = GrowClient::new(socket_path)?;
    let request = Request::from_current_process(locator, args)?;
    let growth = client.grow(&request, &StandardStreams::of_current_process())?;
    Ok(growth.status)
}
