//! Stand-in for `perl -d` used by launch tests.
//!
//! Accepts the interpreter command line built by the adapter (`[-d|-dt] [perl args]
//! program [args]`), reads `PERLDB_OPTS=RemotePort=host:port` and connects back like
//! perl5db does.

#[path = "../common/fake_perl.rs"]
mod fake_perl;

use fake_perl::{serve, CommandLog, FakeOptions};
use std::net::TcpStream;
use std::process::ExitCode;

fn main() -> ExitCode {
    let program = std::env::args()
        .skip(1)
        .find(|arg| !arg.starts_with('-'))
        .unwrap_or_else(|| "-e".to_string());

    let Some(address) = std::env::var("PERLDB_OPTS")
        .ok()
        .and_then(|opts| opts.strip_prefix("RemotePort=").map(ToString::to_string))
    else {
        eprintln!("PERLDB_OPTS=RemotePort=host:port is required");
        return ExitCode::FAILURE;
    };

    println!("fake perl5db: {program}");

    let stream = match TcpStream::connect(&address) {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("connect to {address}: {e}");
            return ExitCode::FAILURE;
        }
    };

    let options = FakeOptions::new(std::process::id(), &program);
    match serve(stream, options, CommandLog::default()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("debugger session: {e}");
            ExitCode::FAILURE
        }
    }
}
