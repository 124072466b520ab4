//! Byte relay for additional debuggee processes.
//!
//! A forked child of the debuggee connects to the same listener as its parent. To expose
//! it as a separate debug session the socket is handed to [`RelayRuntime`], which listens
//! on an ephemeral loopback port and splices bytes between the debuggee and the first
//! connection to that port (a nested session). No protocol awareness here: the nested
//! session sees the raw perl5db stream, banner included.

use crate::net::accept_until;
use crate::runtime::lock;
use log::debug;
use std::io;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub struct RelayRuntime {
    port: u16,
    debuggee: TcpStream,
    client: Arc<Mutex<Option<TcpStream>>>,
    stop: Arc<AtomicBool>,
}

impl RelayRuntime {
    /// Start listening for a nested session, `on_close` is called once when both ends
    /// are closed (or relay is stopped before a session connects).
    pub fn start(
        debuggee: TcpStream,
        on_close: impl FnOnce() + Send + 'static,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let port = listener.local_addr()?.port();
        let client = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let relay = Self {
            port,
            debuggee: debuggee.try_clone()?,
            client: client.clone(),
            stop: stop.clone(),
        };

        thread::Builder::new()
            .name(format!("perl5db-relay-{port}"))
            .spawn(move || {
                match accept_until(&listener, &stop) {
                    Ok(Some((stream, peer))) => {
                        debug!(target: "runtime", "relay :{port} connected to {peer}");
                        if let Ok(clone) = stream.try_clone() {
                            *lock(&client) = Some(clone);
                        }
                        if let Err(e) = splice(&debuggee, &stream) {
                            debug!(target: "runtime", "relay :{port} splice: {e}");
                        }
                    }
                    Ok(None) => debug!(target: "runtime", "relay :{port} stopped"),
                    Err(e) => debug!(target: "runtime", "relay :{port} accept: {e}"),
                }
                _ = debuggee.shutdown(Shutdown::Both);
                debug!(target: "runtime", "relay :{port} closed");
                on_close();
            })?;

        Ok(relay)
    }

    /// Loopback port for a nested session.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Close both ends.
    pub fn close(&self) {
        self.stop.store(true, Ordering::Release);
        _ = self.debuggee.shutdown(Shutdown::Both);
        if let Some(client) = lock(&self.client).as_ref() {
            _ = client.shutdown(Shutdown::Both);
        }
    }
}

/// Copy bytes in both directions until one of the sides is closed.
fn splice(debuggee: &TcpStream, client: &TcpStream) -> io::Result<()> {
    let mut from_debuggee = debuggee.try_clone()?;
    let mut to_client = client.try_clone()?;
    let downstream = thread::spawn(move || {
        let copied = io::copy(&mut from_debuggee, &mut to_client);
        _ = from_debuggee.shutdown(Shutdown::Both);
        _ = to_client.shutdown(Shutdown::Both);
        copied
    });

    let mut from_client = client.try_clone()?;
    let mut to_debuggee = debuggee.try_clone()?;
    let upstream = io::copy(&mut from_client, &mut to_debuggee);
    _ = debuggee.shutdown(Shutdown::Both);
    _ = client.shutdown(Shutdown::Both);

    let downstream = downstream
        .join()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "relay thread panicked"))?;
    debug!(
        target: "runtime",
        "relay finished, bytes to debuggee: {:?}, bytes from debuggee: {:?}",
        upstream.as_ref().ok(),
        downstream.as_ref().ok(),
    );
    Ok(())
}
