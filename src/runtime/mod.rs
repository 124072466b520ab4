//! Connection to a single perl5db debuggee.
//!
//! The debugger talks a line oriented REPL protocol over a raw socket
//! (`PERLDB_OPTS=RemotePort=host:port`). [`RuntimeConnection`] turns it into an ordered
//! RPC channel: commands are queued, written one by one and each one is resolved by the
//! text printed before the next prompt (see [`prompt`]).

pub mod breakpoint;
pub mod error;
pub mod inspect;
pub mod prompt;
pub mod relay;

pub use error::Error;

use crate::muted_error;
use crate::runtime::breakpoint::BreakpointRegistry;
use crate::runtime::prompt::{Prompt, PromptParser};
use log::{debug, trace, warn};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

/// Unique (per process) id of a debuggee connection.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Asynchronous notifications produced by a connection reader thread.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    /// Prompt carries a process chain or a thread id.
    ThreadObserved { id: ConnectionId, prompt: Prompt },
    /// Socket is closed, all pending commands are failed.
    Closed { id: ConnectionId, had_error: bool },
}

/// Receiver of [`RuntimeEvent`]'s, called from the reader thread.
pub type Notifier = Box<dyn Fn(RuntimeEvent) + Send>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type ReplySender = mpsc::SyncSender<Result<String, Error>>;

struct Command {
    seq: u64,
    line: String,
}

/// Ordered command pipeline of a connection.
///
/// At most one command is written and not yet answered. A command is written while the
/// queue lock is held, so submission order equals write order.
struct CommandQueue {
    writer: TcpStream,
    next_seq: u64,
    /// False until the first prompt, and while a command is in flight.
    idle: bool,
    in_flight: Option<u64>,
    waiting: VecDeque<Command>,
    pending: HashMap<u64, ReplySender>,
    closed: bool,
}

impl CommandQueue {
    fn new(writer: TcpStream) -> Self {
        Self {
            writer,
            next_seq: 0,
            idle: false,
            in_flight: None,
            waiting: VecDeque::new(),
            pending: HashMap::new(),
            closed: false,
        }
    }

    fn submit(&mut self, line: String, tx: ReplySender) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert(seq, tx);
        self.waiting.push_back(Command { seq, line });

        if self.idle {
            self.write_next();
        }
        Ok(())
    }

    /// Handle a parsed prompt, `reply` is the text printed since the previous one.
    fn on_prompt(&mut self, reply: Option<String>) {
        if let Some(reply) = reply {
            match self.in_flight.take() {
                Some(seq) => {
                    if let Some(tx) = self.pending.remove(&seq) {
                        _ = tx.send(Ok(reply));
                    }
                }
                None => debug!(target: "runtime", "unsolicited debuggee output: {reply:?}"),
            }
        }
        self.idle = true;
        self.write_next();
    }

    fn write_next(&mut self) {
        while let Some(cmd) = self.waiting.pop_front() {
            trace!(target: "runtime", "-> {}", cmd.line);
            let mut data = cmd.line.into_bytes();
            data.push(b'\n');

            match self.writer.write_all(&data).and_then(|_| self.writer.flush()) {
                Ok(()) => {
                    self.idle = false;
                    self.in_flight = Some(cmd.seq);
                    return;
                }
                Err(e) => {
                    warn!(target: "runtime", "write to debuggee: {e}");
                    if let Some(tx) = self.pending.remove(&cmd.seq) {
                        _ = tx.send(Err(Error::IO(e)));
                    }
                }
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.in_flight = None;
        self.waiting.clear();
        for (_, tx) in self.pending.drain() {
            _ = tx.send(Err(Error::ConnectionClosed));
        }
    }
}

/// Reply of a submitted command that is not received yet.
#[must_use]
pub struct PendingReply {
    command: String,
    rx: mpsc::Receiver<Result<String, Error>>,
}

impl PendingReply {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Block until the command prompt is observed.
    pub fn wait(self) -> Result<String, Error> {
        self.rx.recv().map_err(|_| Error::ConnectionClosed)?
    }
}

/// Identity of the debuggee process behind a connection.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    /// Value of `$$`.
    pub pid: Option<u32>,
    /// Thread id from the prompt of a `-dt` debuggee.
    pub thread: Option<u32>,
    /// Value of `$0`, script path as the debuggee sees it.
    pub script: Option<String>,
    /// Script path as the client sees it.
    pub program: Option<String>,
}

impl Identity {
    /// Translate debuggee path into the client one.
    pub fn to_client_path(&self, path: &str) -> String {
        match (&self.script, &self.program) {
            (Some(script), Some(program)) if script == path => program.clone(),
            _ => path.to_string(),
        }
    }

    /// Translate client path into the debuggee one.
    pub fn to_debuggee_path(&self, path: &str) -> String {
        match (&self.script, &self.program) {
            (Some(script), Some(program)) if program == path => script.clone(),
            _ => path.to_string(),
        }
    }
}

/// Position of the debuggee, as printed by `.` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub sub: String,
    pub file: String,
    pub line: u32,
}

static POSITION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^(?P<sub>[\w:]+?)(?:::)?\((?P<file>.+):(?P<line>\d+)\):")
        .expect("must compile")
});

/// Parse output of `.` command, e.g. `main::foo(t.pl:12):`.
pub(crate) fn parse_position(reply: &str) -> Option<Position> {
    let caps = POSITION_RE.captures(reply)?;
    let line = caps["line"].parse().ok()?;
    Some(Position {
        sub: caps["sub"].to_string(),
        file: caps["file"].to_string(),
        line,
    })
}

/// Quote a string as a perl single quoted literal.
pub(crate) fn perl_quote(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
}

const HAS_PADWALKER: &str = "p eval { require PadWalker; 1 } ? 1 : 0";
const HAS_B: &str = "p eval { require B; 1 } ? 1 : 0";

/// Single debuggee connection.
pub struct RuntimeConnection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    stream: TcpStream,
    queue: Arc<Mutex<CommandQueue>>,
    breakpoints: Mutex<BreakpointRegistry>,
    identity: Mutex<Identity>,
    padwalker: OnceCell<bool>,
    reflection: OnceCell<bool>,
}

impl RuntimeConnection {
    /// Take ownership of an accepted debuggee socket and start the reader thread.
    pub fn start(stream: TcpStream, notifier: Notifier) -> Result<Arc<Self>, Error> {
        stream.set_nodelay(true)?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr().ok();
        let queue = Arc::new(Mutex::new(CommandQueue::new(stream.try_clone()?)));

        let reader = stream.try_clone()?;
        let reader_queue = queue.clone();
        thread::Builder::new()
            .name(format!("perl5db-reader-{id}"))
            .spawn(move || read_loop(id, reader, reader_queue, notifier))?;

        debug!(target: "runtime", "debuggee connection #{id} established, peer: {peer:?}");

        Ok(Arc::new(Self {
            id,
            peer,
            stream,
            queue,
            breakpoints: Mutex::new(BreakpointRegistry::default()),
            identity: Mutex::new(Identity::default()),
            padwalker: OnceCell::new(),
            reflection: OnceCell::new(),
        }))
    }

    /// Connect to a debuggee exposed by a relay and start the reader thread.
    pub fn connect(addr: SocketAddr, notifier: Notifier) -> Result<Arc<Self>, Error> {
        let stream = TcpStream::connect(addr)?;
        Self::start(stream, notifier)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn identity(&self) -> Identity {
        lock(&self.identity).clone()
    }

    /// Debuggee process id, falls back to the connection id while the process is unknown.
    pub fn thread_id(&self) -> i64 {
        lock(&self.identity)
            .pid
            .map(i64::from)
            .unwrap_or(self.id as i64)
    }

    /// Queue a raw debugger command.
    pub fn send(&self, command: &str) -> Result<PendingReply, Error> {
        let (tx, rx) = mpsc::sync_channel(1);
        lock(&self.queue).submit(command.to_string(), tx)?;
        Ok(PendingReply {
            command: command.to_string(),
            rx,
        })
    }

    /// Run a raw debugger command and return its output.
    pub fn run_command(&self, command: &str) -> Result<String, Error> {
        self.send(command)?.wait()
    }

    /// Resume execution until a breakpoint or the end of program (`c`).
    pub fn continue_(&self) -> Result<PendingReply, Error> {
        self.send("c")
    }

    /// Step over (`n`).
    pub fn next(&self) -> Result<PendingReply, Error> {
        self.send("n")
    }

    /// Step into (`s`).
    pub fn step_into(&self) -> Result<PendingReply, Error> {
        self.send("s")
    }

    /// Step out of the current subroutine (`r`).
    pub fn step_out(&self) -> Result<PendingReply, Error> {
        self.send("r")
    }

    /// Options for a top level debuggee. Relayed child processes inherit them.
    pub fn set_startup_options(&self) -> Result<(), Error> {
        let exit = self.send("o inhibit_exit=0")?;
        // `o` can't undef an option, history file from `.perldb` is disabled directly
        let hist = self.send("undef ${$DB::optionVars{HistFile}}")?;
        exit.wait()?;
        hist.wait()?;
        Ok(())
    }

    /// Query process id and script name, `program` is the script path known to the client.
    pub fn discover_identity(&self, program: Option<&str>) -> Result<Identity, Error> {
        let pid_reply = self.send("p $$")?;
        let name_reply = self.send("p $0")?;

        let pid = pid_reply.wait()?;
        let script = name_reply.wait()?.trim().to_string();

        let mut identity = lock(&self.identity);
        identity.pid = pid.trim().parse().ok();
        identity.script = (!script.is_empty()).then_some(script);
        identity.program = program.map(ToString::to_string);
        debug!(target: "runtime", "connection #{} identity: {identity:?}", self.id);
        Ok(identity.clone())
    }

    /// Update identity with a prompt annotation.
    pub fn observe(&self, prompt: &Prompt) {
        let mut identity = lock(&self.identity);
        if let Some(pid) = prompt.pid() {
            identity.pid = Some(pid);
        }
        if prompt.thread.is_some() {
            identity.thread = prompt.thread;
        }
    }

    fn check_module(&self, command: &str) -> Result<bool, Error> {
        Ok(self.run_command(command)?.trim() == "1")
    }

    /// Return true if PadWalker is available in the debuggee (checked once).
    pub fn introspection_installed(&self) -> Result<bool, Error> {
        self.padwalker
            .get_or_try_init(|| self.check_module(HAS_PADWALKER))
            .copied()
    }

    /// Return true if B module is available in the debuggee (checked once).
    pub fn reflection_available(&self) -> Result<bool, Error> {
        self.reflection
            .get_or_try_init(|| self.check_module(HAS_B))
            .copied()
    }

    /// Current debuggee position.
    pub fn current_position(&self) -> Result<Option<Position>, Error> {
        Ok(parse_position(&self.run_command(".")?))
    }

    /// Source code of a loaded file.
    pub fn get_source(&self, path: &str) -> Result<String, Error> {
        let path = lock(&self.identity).to_debuggee_path(path);
        self.run_command(&format!("f {path}"))?;
        // element 0 of the main script is the injected `BEGIN { require 'perl5db.pl' }`
        self.run_command("p join '', @DB::dbline[1 .. $#DB::dbline]")
    }

    /// Shut the socket down, the reader thread fails all pending commands.
    pub fn terminate(&self) {
        muted_error!(self.stream.shutdown(Shutdown::Both), "debuggee socket shutdown:");
    }

    fn translate_to_debuggee(&self, path: &str) -> String {
        lock(&self.identity).to_debuggee_path(path)
    }

    fn translate_to_client(&self, path: &str) -> String {
        lock(&self.identity).to_client_path(path)
    }
}

impl Drop for RuntimeConnection {
    fn drop(&mut self) {
        _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn read_loop(
    id: ConnectionId,
    mut stream: TcpStream,
    queue: Arc<Mutex<CommandQueue>>,
    notify: Notifier,
) {
    let mut parser = PromptParser::default();
    let mut buf = [0u8; 8192];

    let had_error = loop {
        match stream.read(&mut buf) {
            Ok(0) => break false,
            Ok(n) => {
                parser.push(&buf[..n]);
                while let Some(frame) = parser.next_frame() {
                    trace!(target: "runtime", "<- #{id} {:?}", frame.reply);
                    if frame.prompt.is_annotated() {
                        notify(RuntimeEvent::ThreadObserved {
                            id,
                            prompt: frame.prompt.clone(),
                        });
                    }
                    lock(&queue).on_prompt(frame.reply);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(target: "runtime", "debuggee connection #{id} read: {e}");
                break true;
            }
        }
    };

    if !parser.pending().is_empty() {
        debug!(
            target: "runtime",
            "debuggee connection #{id} closed with unframed output: {:?}",
            String::from_utf8_lossy(parser.pending())
        );
    }
    lock(&queue).close();
    debug!(target: "runtime", "debuggee connection #{id} closed");
    notify(RuntimeEvent::Closed { id, had_error });
}
