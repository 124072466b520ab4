//! TCP adapter server: one thread and one [`DebugSession`] per DAP client.

use crate::config::AdapterConfig;
use crate::dap::io;
use crate::dap::tracer::FileTracer;
use crate::dap::DapOutput;
use crate::net::accept_until;
use crate::session::DebugSession;
use log::{info, warn};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

#[derive(Clone)]
pub struct ServerOptions {
    pub config: AdapterConfig,
    pub tracer: Option<FileTracer>,
    /// Stop accepting clients once the first session ends.
    pub oneshot: bool,
}

/// Serve a single client, return when the client disconnects.
pub fn run_session(
    stream: TcpStream,
    config: AdapterConfig,
    tracer: Option<FileTracer>,
) -> anyhow::Result<()> {
    let (reader, writer) = io::tcp(stream, tracer)?;
    let output = Arc::new(Mutex::new(DapOutput::new(writer)));
    DebugSession::new(output, config).run(reader)
}

fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    options: &ServerOptions,
    on_finish: impl FnOnce() + Send + 'static,
) -> anyhow::Result<()> {
    let config = options.config.clone();
    let tracer = options
        .tracer
        .as_ref()
        .map(|tracer| tracer.for_session(&peer.to_string()));
    thread::Builder::new()
        .name(format!("dap-session-{peer}"))
        .spawn(move || {
            if let Some(t) = &tracer {
                t.line("client connected");
            }
            match run_session(stream, config, tracer.clone()) {
                Ok(()) => {
                    info!(target: "dap", "session of {peer} finished");
                    if let Some(t) = &tracer {
                        t.line("session finished");
                    }
                }
                Err(err) => {
                    warn!(target: "dap", "session of {peer} ended with error: {err:#}");
                    if let Some(t) = &tracer {
                        t.line(&format!("session error: {err:#}"));
                    }
                }
            }
            on_finish();
        })?;
    Ok(())
}

/// Accept DAP clients until the listener fails, or until the first session ends
/// in oneshot mode. Nested sessions connect to the same listener concurrently.
pub fn serve(listener: TcpListener, options: ServerOptions) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut first = true;

    loop {
        let (stream, peer) = match accept_until(&listener, &stop) {
            Ok(Some(accepted)) => accepted,
            Ok(None) => break,
            Err(err) => {
                warn!(target: "dap", "accept failed: {err:#}");
                continue;
            }
        };
        info!(target: "dap", "DAP client connected: {peer}");

        let finish_flag = (first && options.oneshot).then(|| stop.clone());
        first = false;
        let on_finish = move || {
            if let Some(stop) = finish_flag {
                stop.store(true, Ordering::Release);
            }
        };

        if let Err(err) = spawn_session(stream, peer, &options, on_finish) {
            warn!(target: "dap", "failed to start session: {err:#}");
            if options.oneshot {
                return Err(err);
            }
        }
    }

    info!(target: "dap", "adapter server stopped");
    Ok(())
}
