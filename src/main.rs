//! perl-dap: Debug Adapter Protocol bridge for the perl5db remote debugger.

use anyhow::Context;
use clap::Parser;
use log::{info, warn};
use perl_dap::config::AdapterConfig;
use perl_dap::dap::io;
use perl_dap::dap::logger::DapLogger;
use perl_dap::dap::tracer::FileTracer;
use perl_dap::dap::DapOutput;
use perl_dap::log::LOGGER_SWITCHER;
use perl_dap::server::{serve, ServerOptions};
use perl_dap::session::args::ChildSessions;
use perl_dap::session::DebugSession;
use std::net::{SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[clap(long, default_value = "127.0.0.1:4711")]
    listen: String,

    /// Serve a single client over stdin/stdout instead of TCP
    #[clap(long)]
    stdio: bool,

    /// Exit after the first debug session ends
    #[clap(long)]
    oneshot: bool,

    /// Log file for adapter diagnostics
    #[clap(long)]
    log_file: Option<PathBuf>,

    /// Trace DAP traffic into the log file, requires --log-file
    #[clap(long)]
    trace_dap: bool,

    /// Adapter configuration file [default: ~/.config/perl-dap/config.toml]
    #[clap(long, env = "PERL_DAP_CONFIG")]
    config: Option<PathBuf>,

    /// How additional debuggee processes are presented: relay or threads
    #[clap(long)]
    child_sessions: Option<ChildSessions>,
}

fn main() -> anyhow::Result<()> {
    let logger = env_logger::Logger::from_default_env();
    let filter = logger.filter();
    LOGGER_SWITCHER.switch(logger, filter);

    let args = Args::parse();

    let mut config = AdapterConfig::from_file(args.config.as_deref());
    if let Some(child_sessions) = args.child_sessions {
        config.child_sessions = child_sessions;
    }

    let tracer = match &args.log_file {
        Some(path) => Some(FileTracer::new(path, args.trace_dap)?),
        None => None,
    };
    if args.trace_dap && tracer.is_none() {
        warn!(target: "dap", "--trace-dap requires --log-file; tracing disabled");
    }

    if args.stdio {
        let (reader, writer) = io::stdio(tracer);
        let output = Arc::new(Mutex::new(DapOutput::new(writer)));
        // stdout carries the protocol
        let logger = DapLogger::new(output.clone());
        let filter = logger.filter();
        LOGGER_SWITCHER.switch(logger, filter);
        return DebugSession::new(output, config).run(reader);
    }

    let addr: SocketAddr = args.listen.parse().context("Invalid listen address")?;
    let listener = TcpListener::bind(addr).with_context(|| format!("bind {addr}"))?;
    info!(target: "dap", "perl-dap listening on {addr}");

    serve(
        listener,
        ServerOptions {
            config,
            tracer,
            oneshot: args.oneshot,
        },
    )
}
