//! Debug session: DAP state machine on top of perl5db connections.
//!
//! A session is an actor, one thread owns all the state and processes a single inbox of
//! [`Message`]'s: client messages, accepted debuggee sockets, connection events and
//! completions of connection jobs. Inspection commands are sent to stopped connections
//! only and block the session thread until the reply prompt. Flow control and breakpoint
//! updates may wait for a running debuggee, they are executed by the worker of a
//! connection and the session never waits for them.

pub mod args;
pub mod frames;
pub mod handles;
pub mod launcher;
pub mod liveness;
mod worker;

use crate::config::AdapterConfig;
use crate::dap::io::DapReader;
use crate::dap::protocol::{ClientMessage, ClientResponse, DapRequest};
use crate::dap::DapOutput;
use crate::net::accept_until;
use crate::runtime::inspect::Scope;
use crate::runtime::relay::RelayRuntime;
use crate::runtime::{self, lock, ConnectionId, RuntimeConnection, RuntimeEvent};
use crate::session::args::{ChildSessions, LaunchArguments};
use crate::session::frames::build_frames;
use crate::session::handles::Handles;
use crate::session::launcher::DebuggeeCommand;
use crate::session::liveness::{LifecycleEvent, Liveness};
use crate::session::worker::{BreakpointUpdate, ConnectionWorker, Job, Verdict};
use crate::weak_error;
use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;
use strum::IntoEnumIterator;
use strum_macros::Display;

const PADWALKER_MISSING: &str =
    "PadWalker not installed. Debugger will be unable to list variables.\n";

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Stopped,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
enum StartMode {
    Launch,
    Attach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Next,
    StepIn,
    StepOut,
}

impl Flow {
    fn stop_reason(self) -> &'static str {
        match self {
            Flow::Continue => "breakpoint",
            Flow::Next | Flow::StepIn | Flow::StepOut => "step",
        }
    }
}

/// Inbox of a session.
enum Message {
    Client(ClientMessage),
    ClientClosed,
    Accepted(TcpStream),
    Runtime(RuntimeEvent),
    Resumed {
        id: ConnectionId,
        reason: &'static str,
        outcome: Result<String, runtime::Error>,
    },
    BreakpointsApplied {
        id: ConnectionId,
        request: Option<u64>,
        outcome: Result<Vec<Verdict>, runtime::Error>,
    },
    RelayClosed(u64),
}

enum ReverseRequest {
    RunInTerminal { launch: DapRequest },
    StartDebugging { relay: u64 },
}

struct PendingReverseRequest {
    kind: ReverseRequest,
    deadline: Instant,
}

#[derive(Debug, Clone, Deserialize)]
struct SourceBreakpoint {
    line: u32,
    #[serde(default)]
    condition: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FunctionBreakpointArgs {
    name: String,
    #[serde(default)]
    condition: Option<String>,
}

/// `setBreakpoints` or `setFunctionBreakpoints` request waiting for the connections.
struct PendingBreakpoints {
    req: DapRequest,
    update: Arc<BreakpointUpdate>,
    /// `source` argument of `setBreakpoints`.
    source: Value,
    waiting: BTreeSet<ConnectionId>,
    verdicts: Vec<Verdict>,
}

impl PendingBreakpoints {
    fn merge(&mut self, verdicts: Vec<Verdict>) {
        for (verdict, other) in self.verdicts.iter_mut().zip(verdicts) {
            verdict.merge(other);
        }
    }

    fn reject(&mut self, message: &str) {
        for verdict in &mut self.verdicts {
            verdict.merge(Verdict::rejected(Some(message.to_string())));
        }
    }

    fn body(&self) -> Value {
        let breakpoints: Vec<_> = match self.update.as_ref() {
            BreakpointUpdate::Source { breakpoints, .. } => breakpoints
                .iter()
                .zip(&self.verdicts)
                .map(|(bp, verdict)| {
                    let mut out = json!({
                        "verified": verdict.verified,
                        "line": bp.line,
                        "source": self.source,
                    });
                    if let (false, Some(message)) = (verdict.verified, &verdict.message) {
                        out["message"] = json!(message);
                    }
                    out
                })
                .collect(),
            BreakpointUpdate::Functions(breakpoints) => breakpoints
                .iter()
                .zip(&self.verdicts)
                .map(|(bp, verdict)| match &verdict.location {
                    Some(loc) if verdict.verified => json!({
                        "verified": true,
                        "line": loc.line,
                        "source": {"path": loc.path, "name": file_name(&loc.path)},
                    }),
                    _ => json!({
                        "verified": false,
                        "message": verdict
                            .message
                            .clone()
                            .unwrap_or_else(|| format!("subroutine {} not found", bp.name)),
                    }),
                })
                .collect(),
        };
        json!({"breakpoints": breakpoints})
    }
}

#[derive(Debug, Clone, Copy)]
struct FrameRef {
    connection: ConnectionId,
}

#[derive(Debug, Clone, Copy)]
struct ScopeRef {
    connection: ConnectionId,
    scope: Scope,
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Debug session state for a single DAP client.
pub struct DebugSession {
    output: Arc<Mutex<DapOutput>>,
    config: AdapterConfig,
    inbox: mpsc::Receiver<Message>,
    sender: mpsc::Sender<Message>,
    state: SessionState,
    run_in_terminal: bool,
    mode: Option<StartMode>,
    args: LaunchArguments,
    child_sessions: ChildSessions,
    listener_stop: Arc<AtomicBool>,
    connections: BTreeMap<ConnectionId, Arc<RuntimeConnection>>,
    workers: HashMap<ConnectionId, ConnectionWorker>,
    /// Connections executing a flow control command.
    running: BTreeSet<ConnectionId>,
    primary: Option<ConnectionId>,
    selected: Option<ConnectionId>,
    initialized_sent: bool,
    relays: HashMap<u64, RelayRuntime>,
    next_relay_id: u64,
    liveness: Liveness,
    reverse_requests: HashMap<i64, PendingReverseRequest>,
    debuggee: Option<Child>,
    source_breakpoints: BTreeMap<String, Vec<SourceBreakpoint>>,
    function_breakpoints: Vec<FunctionBreakpointArgs>,
    pending_breakpoints: HashMap<u64, PendingBreakpoints>,
    next_breakpoint_request: u64,
    frames: Handles<FrameRef>,
    scopes: Handles<ScopeRef>,
}

impl DebugSession {
    pub fn new(output: Arc<Mutex<DapOutput>>, config: AdapterConfig) -> Self {
        let (sender, inbox) = mpsc::channel();
        let child_sessions = config.child_sessions;
        Self {
            output,
            config,
            inbox,
            sender,
            state: SessionState::Uninitialized,
            run_in_terminal: false,
            mode: None,
            args: LaunchArguments::default(),
            child_sessions,
            listener_stop: Arc::new(AtomicBool::new(false)),
            connections: BTreeMap::new(),
            workers: HashMap::new(),
            running: BTreeSet::new(),
            primary: None,
            selected: None,
            initialized_sent: false,
            relays: HashMap::new(),
            next_relay_id: 1,
            liveness: Liveness::new(child_sessions),
            reverse_requests: HashMap::new(),
            debuggee: None,
            source_breakpoints: BTreeMap::new(),
            function_breakpoints: vec![],
            pending_breakpoints: HashMap::new(),
            next_breakpoint_request: 1,
            frames: Handles::default(),
            scopes: Handles::default(),
        }
    }

    fn output(&self) -> MutexGuard<'_, DapOutput> {
        lock(&self.output)
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(target: "dap", "session state: {} -> {state}", self.state);
            self.state = state;
        }
    }

    fn send_success(&self, req: &DapRequest) -> anyhow::Result<()> {
        self.output().send_response(req, true, None, None)
    }

    fn send_success_body(&self, req: &DapRequest, body: Value) -> anyhow::Result<()> {
        self.output().send_response(req, true, None, Some(body))
    }

    fn send_err(&self, req: &DapRequest, message: impl ToString) -> anyhow::Result<()> {
        self.output()
            .send_response(req, false, Some(message.to_string()), None)
    }

    fn send_event(&self, name: &'static str) -> anyhow::Result<()> {
        self.output().send_event(name, None)
    }

    fn send_event_body(&self, name: &'static str, body: Value) -> anyhow::Result<()> {
        self.output().send_event(name, Some(body))
    }

    fn send_output(&self, category: &str, text: &str) -> anyhow::Result<()> {
        self.output().send_output(category, text)
    }

    fn send_stopped(&mut self, reason: &str, thread_id: i64) -> anyhow::Result<()> {
        self.set_state(SessionState::Stopped);
        self.send_event_body(
            "stopped",
            json!({
                "reason": reason,
                "threadId": thread_id,
                "allThreadsStopped": self.running.is_empty(),
            }),
        )
    }

    fn emit_lifecycle(&mut self, events: Vec<LifecycleEvent>) -> anyhow::Result<()> {
        for event in events {
            match event {
                LifecycleEvent::ThreadExited(thread_id) => {
                    self.send_event_body(
                        "thread",
                        json!({"reason": "exited", "threadId": thread_id}),
                    )?;
                }
                LifecycleEvent::Exited(code) => {
                    self.send_event_body("exited", json!({"exitCode": code}))?;
                }
                LifecycleEvent::Terminated => {
                    self.set_state(SessionState::Terminated);
                    self.send_event("terminated")?;
                }
            }
        }
        Ok(())
    }

    fn primary_connection(&self) -> anyhow::Result<Arc<RuntimeConnection>> {
        self.primary
            .and_then(|id| self.connections.get(&id))
            .cloned()
            .ok_or_else(|| anyhow!("no debuggee connected"))
    }

    /// Connection of a DAP thread, selected (or primary) one if thread is unknown.
    fn connection_for_thread(
        &self,
        thread_id: Option<i64>,
    ) -> anyhow::Result<Arc<RuntimeConnection>> {
        if let Some(thread_id) = thread_id {
            if let Some(conn) = self
                .connections
                .values()
                .find(|conn| conn.thread_id() == thread_id)
            {
                return Ok(conn.clone());
            }
        }
        if let Some(conn) = self.selected.and_then(|id| self.connections.get(&id)) {
            return Ok(conn.clone());
        }
        self.primary_connection()
    }

    fn connection(&self, id: ConnectionId) -> anyhow::Result<Arc<RuntimeConnection>> {
        self.connections
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow!("debuggee connection is closed"))
    }

    fn all_connections(&self) -> Vec<Arc<RuntimeConnection>> {
        self.connections.values().cloned().collect()
    }

    fn is_running(&self, id: ConnectionId) -> bool {
        self.running.contains(&id)
    }

    /// Fail if the debuggee of a connection is running, its commands would wait for the
    /// next stop.
    fn ensure_stopped(&self, conn: &RuntimeConnection) -> anyhow::Result<()> {
        if self.is_running(conn.id()) {
            bail!("thread {} is running", conn.thread_id());
        }
        Ok(())
    }

    /// Primary connection if stopped, any other stopped connection otherwise.
    fn stopped_connection(&self) -> anyhow::Result<Arc<RuntimeConnection>> {
        let primary = self.primary_connection()?;
        if !self.is_running(primary.id()) {
            return Ok(primary);
        }
        self.connections
            .values()
            .find(|conn| !self.is_running(conn.id()))
            .cloned()
            .ok_or_else(|| anyhow!("debuggee is running"))
    }

    fn submit(&self, id: ConnectionId, job: Job) -> anyhow::Result<()> {
        self.workers
            .get(&id)
            .ok_or_else(|| anyhow!("debuggee connection is closed"))?
            .submit(job)
    }

    fn handle_initialize(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        self.run_in_terminal = req
            .arguments
            .get("supportsRunInTerminalRequest")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        self.set_state(SessionState::Initialized);

        let body = json!({
            "supportsConfigurationDoneRequest": true,
            "supportsConditionalBreakpoints": true,
            "supportsFunctionBreakpoints": true,
            "supportsSetVariable": true,
            "supportsTerminateRequest": true,
            "supportTerminateDebuggee": true,
            "supportsEvaluateForHovers": true,
            "supportsBreakpointLocationsRequest": true,
            "supportsSingleThreadExecutionRequests": true,
            "supportsRestartRequest": false,
            "supportsStepBack": false,
        });
        self.send_success_body(req, body)
    }

    fn handle_start(&mut self, req: &DapRequest, mode: StartMode) -> anyhow::Result<()> {
        let args: LaunchArguments = if req.arguments.is_null() {
            LaunchArguments::default()
        } else {
            serde_json::from_value(req.arguments.clone())
                .with_context(|| format!("{mode}: invalid arguments"))?
        };

        self.mode = Some(mode);
        self.child_sessions = args.child_sessions.unwrap_or(self.config.child_sessions);
        self.liveness = Liveness::new(self.child_sessions);
        self.args = args;

        if self.args.proxy {
            let port = self
                .args
                .port
                .ok_or_else(|| anyhow!("{mode}: missing relay port"))?;
            info!(target: "dap", "nested session, connect to relay :{port}");
            let relay = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            let conn = RuntimeConnection::connect(relay, self.notifier())
                .with_context(|| format!("connect to relay :{port}"))?;
            self.send_success(req)?;
            return self.register_connection(conn, true);
        }

        let remote = self.args.hostname.is_some();
        let (ip, port) = match mode {
            StartMode::Launch if !remote => (Ipv4Addr::LOCALHOST, 0),
            StartMode::Launch => (Ipv4Addr::UNSPECIFIED, 0),
            StartMode::Attach => (
                Ipv4Addr::UNSPECIFIED,
                self.args.port.unwrap_or(self.config.attach_port),
            ),
        };
        let listener =
            TcpListener::bind((ip, port)).with_context(|| format!("bind {ip}:{port}"))?;
        let port = listener.local_addr()?.port();
        info!(target: "dap", "{mode}: waiting for debuggee on {ip}:{port}");
        self.spawn_acceptor(listener)?;

        match mode {
            StartMode::Attach => self.send_success(req),
            StartMode::Launch => {
                let perl = self.args.perl.clone().unwrap_or_else(|| self.config.perl.clone());
                let command = match launcher::build_command(&self.args, &perl, port) {
                    Ok(command) => command,
                    Err(e) => {
                        self.listener_stop.store(true, Ordering::Release);
                        return Err(e);
                    }
                };
                if self.run_in_terminal {
                    self.request_terminal_launch(req, command)
                } else {
                    self.spawn_debuggee(&command)?;
                    self.send_success(req)
                }
            }
        }
    }

    fn spawn_acceptor(&self, listener: TcpListener) -> anyhow::Result<()> {
        let stop = self.listener_stop.clone();
        let sender = self.sender.clone();
        thread::Builder::new()
            .name("perl5db-acceptor".to_string())
            .spawn(move || loop {
                match accept_until(&listener, &stop) {
                    Ok(Some((stream, peer))) => {
                        info!(target: "dap", "debuggee connected: {peer}");
                        if sender.send(Message::Accepted(stream)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "dap", "debuggee accept failed: {e:#}");
                        break;
                    }
                }
            })?;
        Ok(())
    }

    fn request_terminal_launch(
        &mut self,
        req: &DapRequest,
        command: DebuggeeCommand,
    ) -> anyhow::Result<()> {
        let arguments = json!({
            "kind": "integrated",
            "title": self.args.program.as_deref().map(file_name),
            "cwd": command.cwd.unwrap_or_default(),
            "args": command.args,
            "env": command.env,
        });
        let seq = self.output().send_request("runInTerminal", arguments)?;
        self.reverse_requests.insert(
            seq,
            PendingReverseRequest {
                kind: ReverseRequest::RunInTerminal {
                    launch: req.clone(),
                },
                deadline: Instant::now() + self.config.reverse_request_timeout(),
            },
        );
        Ok(())
    }

    fn spawn_debuggee(&mut self, command: &DebuggeeCommand) -> anyhow::Result<()> {
        let mut child = launcher::spawn(command)?;
        info!(target: "dap", "debuggee spawned, pid: {}", child.id());

        let output = self.output.clone();
        launcher::forward_output(&mut child, move |category, text| {
            _ = lock(&output).send_output(category, &text);
        });
        self.debuggee = Some(child);
        Ok(())
    }

    fn on_accepted(&mut self, stream: TcpStream) -> anyhow::Result<()> {
        if self.primary.is_some() && self.child_sessions == ChildSessions::Relay {
            return self.start_relay(stream);
        }
        let conn = RuntimeConnection::start(stream, self.notifier())?;
        self.register_connection(conn, false)
    }

    fn start_relay(&mut self, stream: TcpStream) -> anyhow::Result<()> {
        let relay_id = self.next_relay_id;
        self.next_relay_id += 1;

        let sender = self.sender.clone();
        let relay = RelayRuntime::start(stream, move || {
            _ = sender.send(Message::RelayClosed(relay_id));
        })?;
        self.liveness.opened();

        let mode = self.mode.unwrap_or(StartMode::Launch).to_string();
        let mut configuration = json!({
            "request": mode,
            "port": relay.port(),
            "stopOnEntry": self.args.stop_on_entry,
            "__proxy": true,
        });
        if let Some(program) = &self.args.program {
            configuration["program"] = json!(program);
        }
        info!(target: "dap", "child process relayed on :{}", relay.port());
        self.relays.insert(relay_id, relay);

        let seq = self.output().send_request(
            "startDebugging",
            json!({"configuration": configuration, "request": mode}),
        )?;
        self.reverse_requests.insert(
            seq,
            PendingReverseRequest {
                kind: ReverseRequest::StartDebugging { relay: relay_id },
                deadline: Instant::now() + self.config.reverse_request_timeout(),
            },
        );
        Ok(())
    }

    fn notifier(&self) -> runtime::Notifier {
        let sender = self.sender.clone();
        Box::new(move |event| {
            _ = sender.send(Message::Runtime(event));
        })
    }

    /// Register a debuggee connection, `nested` is true for a connection to a relay.
    fn register_connection(
        &mut self,
        conn: Arc<RuntimeConnection>,
        nested: bool,
    ) -> anyhow::Result<()> {
        let id = conn.id();
        debug!(target: "dap", "debuggee connection #{id} from {:?}", conn.peer());
        self.connections.insert(id, conn.clone());
        self.workers
            .insert(id, ConnectionWorker::start(conn.clone(), self.sender.clone())?);
        self.liveness.opened();

        let is_primary = self.primary.is_none();
        if is_primary {
            self.primary = Some(id);
            self.selected = Some(id);
        }

        if !conn.introspection_installed()? {
            self.send_output("important", PADWALKER_MISSING)?;
        }
        let identity = conn.discover_identity(self.args.program.as_deref())?;
        info!(target: "dap", "debuggee process {:?} ({:?}) ready", identity.pid, identity.script);

        // relayed children inherit options of the parent process
        if is_primary && !nested {
            conn.set_startup_options()?;
        }

        if !self.initialized_sent {
            self.initialized_sent = true;
            return self.send_event("initialized");
        }

        // additional process of the threads model
        let thread_id = conn.thread_id();
        self.send_event_body("thread", json!({"reason": "started", "threadId": thread_id}))?;
        self.apply_breakpoints(id)?;
        if self.args.stop_on_entry {
            self.send_stopped("entry", thread_id)
        } else {
            self.resume(&conn, Flow::Continue)
        }
    }

    /// Set remembered breakpoints on a new connection, ahead of its first resume.
    fn apply_breakpoints(&self, id: ConnectionId) -> anyhow::Result<()> {
        let mut updates: Vec<_> = self
            .source_breakpoints
            .iter()
            .map(|(path, breakpoints)| BreakpointUpdate::Source {
                path: path.clone(),
                breakpoints: breakpoints.clone(),
            })
            .collect();
        if !self.function_breakpoints.is_empty() {
            updates.push(BreakpointUpdate::Functions(
                self.function_breakpoints.clone(),
            ));
        }
        for update in updates {
            self.submit(
                id,
                Job::Breakpoints {
                    request: None,
                    update: Arc::new(update),
                },
            )?;
        }
        Ok(())
    }

    fn on_client_response(&mut self, rsp: ClientResponse) -> anyhow::Result<()> {
        let Some(pending) = self.reverse_requests.remove(&rsp.request_seq) else {
            debug!(target: "dap", "response to unknown request {}", rsp.request_seq);
            return Ok(());
        };
        let error = (!rsp.success).then(|| {
            rsp.message
                .clone()
                .unwrap_or_else(|| format!("{} failed", rsp.command))
        });
        self.complete_reverse_request(pending.kind, error)
    }

    fn complete_reverse_request(
        &mut self,
        kind: ReverseRequest,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        match (kind, error) {
            (ReverseRequest::RunInTerminal { launch }, None) => self.send_success(&launch),
            (ReverseRequest::RunInTerminal { launch }, Some(error)) => {
                self.listener_stop.store(true, Ordering::Release);
                self.send_err(&launch, format!("launch in terminal: {error}"))
            }
            (ReverseRequest::StartDebugging { .. }, None) => Ok(()),
            (ReverseRequest::StartDebugging { relay }, Some(error)) => {
                warn!(target: "dap", "nested session not started: {error}");
                if let Some(relay) = self.relays.get(&relay) {
                    relay.close();
                }
                Ok(())
            }
        }
    }

    fn expire_reverse_requests(&mut self) -> anyhow::Result<()> {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .reverse_requests
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            if let Some(pending) = self.reverse_requests.remove(&seq) {
                self.complete_reverse_request(pending.kind, Some("timeout".to_string()))?;
            }
        }
        Ok(())
    }

    fn on_runtime_event(&mut self, event: RuntimeEvent) -> anyhow::Result<()> {
        match event {
            RuntimeEvent::ThreadObserved { id, prompt } => {
                if let Some(conn) = self.connections.get(&id) {
                    conn.observe(&prompt);
                }
                Ok(())
            }
            RuntimeEvent::Closed { id, had_error } => {
                let Some(conn) = self.connections.remove(&id) else {
                    return Ok(());
                };
                info!(target: "dap", "debuggee connection #{id} closed");
                // queued jobs fail with a closed connection and still report back
                self.workers.remove(&id);
                self.running.remove(&id);
                if self.primary == Some(id) {
                    self.primary = self.connections.keys().next().copied();
                }
                if self.selected == Some(id) {
                    self.selected = self.primary;
                }
                let events = self.liveness.connection_closed(conn.thread_id(), had_error);
                self.emit_lifecycle(events)?;
                if self.liveness.is_terminated() {
                    info!(target: "dap", "debuggee terminated");
                } else {
                    debug!(target: "dap", "{} debuggee(s) still alive", self.liveness.live());
                }
                Ok(())
            }
        }
    }

    fn on_relay_closed(&mut self, relay: u64) -> anyhow::Result<()> {
        if self.relays.remove(&relay).is_none() {
            return Ok(());
        }
        let events = self.liveness.relay_closed();
        self.emit_lifecycle(events)
    }

    fn resume(&mut self, conn: &RuntimeConnection, flow: Flow) -> anyhow::Result<()> {
        let id = conn.id();
        if self.is_running(id) {
            debug!(target: "dap", "debuggee #{id} already running");
            return Ok(());
        }
        self.submit(id, Job::Resume(flow))?;
        self.running.insert(id);
        self.frames.reset();
        self.scopes.reset();
        self.set_state(SessionState::Running);
        Ok(())
    }

    fn on_resumed(
        &mut self,
        id: ConnectionId,
        reason: &'static str,
        outcome: Result<String, runtime::Error>,
    ) -> anyhow::Result<()> {
        self.running.remove(&id);
        match outcome {
            Ok(_) => {
                let Some(conn) = self.connections.get(&id) else {
                    return Ok(());
                };
                let thread_id = conn.thread_id();
                self.frames.reset();
                self.scopes.reset();
                self.send_stopped(reason, thread_id)
            }
            // end of the program, termination is reported by the connection close
            Err(e) if e.is_fatal() => {
                debug!(target: "dap", "debuggee #{id} gone while running: {e}");
                Ok(())
            }
            Err(e) => {
                warn!(target: "dap", "debuggee resume: {e:#}");
                Ok(())
            }
        }
    }

    fn handle_configuration_done(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        self.send_success(req)?;

        let conn = self.primary_connection()?;
        if self.args.stop_on_entry {
            self.send_stopped("entry", conn.thread_id())
        } else {
            self.resume(&conn, Flow::Continue)
        }
    }

    fn handle_flow(&mut self, req: &DapRequest, flow: Flow) -> anyhow::Result<()> {
        let single_thread = req
            .arguments
            .get("singleThread")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64);

        let targets = if single_thread {
            let conn = self.connection_for_thread(thread_id)?;
            self.selected = Some(conn.id());
            vec![conn]
        } else {
            self.all_connections()
        };
        if targets.is_empty() {
            bail!("{}: no debuggee connected", req.command);
        }
        let targets: Vec<_> = targets
            .into_iter()
            .filter(|conn| !self.is_running(conn.id()))
            .collect();
        if targets.is_empty() {
            bail!("{}: debuggee is running", req.command);
        }

        for conn in &targets {
            self.resume(conn, flow)?;
        }

        if flow == Flow::Continue {
            self.send_success_body(req, json!({"allThreadsContinued": !single_thread}))
        } else {
            self.send_success(req)
        }
    }

    fn handle_set_breakpoints(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let source = req.arguments.get("source").cloned().unwrap_or(Value::Null);
        let path = source
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("setBreakpoints: missing arguments.source.path"))?
            .to_string();
        let breakpoints: Vec<SourceBreakpoint> = match req.arguments.get("breakpoints") {
            Some(bps) => serde_json::from_value(bps.clone())
                .context("setBreakpoints: invalid arguments.breakpoints")?,
            None => vec![],
        };

        if breakpoints.is_empty() {
            self.source_breakpoints.remove(&path);
        } else {
            self.source_breakpoints.insert(path.clone(), breakpoints.clone());
        }
        self.update_breakpoints(req, source, BreakpointUpdate::Source { path, breakpoints })
    }

    fn handle_set_function_breakpoints(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let breakpoints: Vec<FunctionBreakpointArgs> = match req.arguments.get("breakpoints") {
            Some(bps) => serde_json::from_value(bps.clone())
                .context("setFunctionBreakpoints: invalid arguments.breakpoints")?,
            None => vec![],
        };

        self.function_breakpoints = breakpoints.clone();
        self.update_breakpoints(req, Value::Null, BreakpointUpdate::Functions(breakpoints))
    }

    /// Submit a breakpoint update to every connection, the request is answered when all
    /// of them report back.
    fn update_breakpoints(
        &mut self,
        req: &DapRequest,
        source: Value,
        update: BreakpointUpdate,
    ) -> anyhow::Result<()> {
        let request = self.next_breakpoint_request;
        self.next_breakpoint_request += 1;

        let update = Arc::new(update);
        let initial = if self.workers.is_empty() {
            Verdict::rejected(None)
        } else {
            Verdict::accepted(None)
        };
        let mut pending = PendingBreakpoints {
            req: req.clone(),
            verdicts: vec![initial; update.len()],
            update: update.clone(),
            source,
            waiting: BTreeSet::new(),
        };

        for (&id, worker) in &self.workers {
            let job = Job::Breakpoints {
                request: Some(request),
                update: update.clone(),
            };
            match worker.submit(job) {
                Ok(()) => {
                    pending.waiting.insert(id);
                }
                Err(e) => pending.reject(&format!("{e:#}")),
            }
        }

        if pending.waiting.is_empty() {
            return self.send_success_body(req, pending.body());
        }
        self.pending_breakpoints.insert(request, pending);
        Ok(())
    }

    fn on_breakpoints_applied(
        &mut self,
        id: ConnectionId,
        request: Option<u64>,
        outcome: Result<Vec<Verdict>, runtime::Error>,
    ) -> anyhow::Result<()> {
        let Some(request) = request else {
            if let Err(e) = outcome {
                warn!(target: "dap", "breakpoints of debuggee #{id} not restored: {e}");
            }
            return Ok(());
        };
        let Some(pending) = self.pending_breakpoints.get_mut(&request) else {
            return Ok(());
        };

        match outcome {
            Ok(verdicts) => pending.merge(verdicts),
            Err(e) => {
                warn!(target: "dap", "{} on debuggee #{id}: {e}", pending.req.command);
                pending.reject(&format!("debuggee #{id}: {e}"));
            }
        }
        pending.waiting.remove(&id);

        if !pending.waiting.is_empty() {
            return Ok(());
        }
        match self.pending_breakpoints.remove(&request) {
            Some(pending) => self.send_success_body(&pending.req, pending.body()),
            None => Ok(()),
        }
    }

    fn handle_breakpoint_locations(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let path = req
            .arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("breakpointLocations: missing arguments.source.path"))?;
        let line = req
            .arguments
            .get("line")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("breakpointLocations: missing arguments.line"))?;
        let end_line = req.arguments.get("endLine").and_then(Value::as_u64);

        let conn = self.stopped_connection()?;
        let lines = conn.get_breakpoint_locations(
            path,
            u32::try_from(line)?,
            end_line.map(u32::try_from).transpose()?,
        )?;
        let breakpoints: Vec<_> = lines.into_iter().map(|line| json!({"line": line})).collect();
        self.send_success_body(req, json!({"breakpoints": breakpoints}))
    }

    fn handle_threads(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let threads: Vec<_> = self
            .connections
            .values()
            .map(|conn| {
                let identity = conn.identity();
                let script = identity
                    .program
                    .as_deref()
                    .or(identity.script.as_deref())
                    .map(file_name)
                    .unwrap_or_else(|| "perl".to_string());
                let name = match (identity.pid, identity.thread) {
                    (Some(pid), Some(tid)) => format!("{script} ({pid}) thread {tid}"),
                    (Some(pid), None) => format!("{script} ({pid})"),
                    _ => script,
                };
                json!({"id": conn.thread_id(), "name": name})
            })
            .collect();
        self.send_success_body(req, json!({"threads": threads}))
    }

    fn handle_stack_trace(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let thread_id = req.arguments.get("threadId").and_then(Value::as_i64);
        let start_frame = req
            .arguments
            .get("startFrame")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        let levels = req
            .arguments
            .get("levels")
            .and_then(Value::as_u64)
            .filter(|levels| *levels > 0)
            .map(|levels| levels as usize)
            .unwrap_or(usize::MAX);

        let conn = self.connection_for_thread(thread_id)?;
        self.ensure_stopped(&conn)?;
        let position = conn.current_position()?;
        let trace = conn.get_stack_trace()?;
        let frames = build_frames(position.as_ref(), &trace);
        let identity = conn.identity();

        let mut out = Vec::new();
        for frame in frames.iter().skip(start_frame).take(levels) {
            let id = self.frames.alloc(FrameRef {
                connection: conn.id(),
            });
            let path = identity.to_client_path(&frame.file);
            out.push(json!({
                "id": id,
                "name": frame.name,
                "line": frame.line,
                "column": 1,
                "source": {"name": file_name(&path), "path": path},
            }));
        }

        self.send_success_body(
            req,
            json!({"stackFrames": out, "totalFrames": frames.len()}),
        )
    }

    fn handle_scopes(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let frame_id = req
            .arguments
            .get("frameId")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("scopes: missing arguments.frameId"))?;
        let frame = *self
            .frames
            .get(frame_id)
            .ok_or_else(|| anyhow!("scopes: unknown frame {frame_id}"))?;

        // perl5db exposes variables of the current position only
        let scopes: Vec<_> = Scope::iter()
            .map(|scope| {
                let reference = self.scopes.alloc(ScopeRef {
                    connection: frame.connection,
                    scope,
                });
                json!({
                    "name": scope.to_string(),
                    "variablesReference": reference,
                    "expensive": false,
                })
            })
            .collect();

        self.send_success_body(req, json!({"scopes": scopes}))
    }

    fn handle_variables(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let reference = req
            .arguments
            .get("variablesReference")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("variables: missing arguments.variablesReference"))?;

        let variables = match self.scopes.get(reference).copied() {
            Some(scope_ref) => {
                let conn = self.connection(scope_ref.connection)?;
                self.ensure_stopped(&conn)?;
                conn.get_variables(scope_ref.scope)?
            }
            None => vec![],
        };

        let out: Vec<_> = variables
            .into_iter()
            .map(|var| {
                json!({
                    "name": var.name,
                    "value": var.value,
                    "variablesReference": 0,
                })
            })
            .collect();
        self.send_success_body(req, json!({"variables": out}))
    }

    fn handle_set_variable(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let reference = req
            .arguments
            .get("variablesReference")
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("setVariable: missing arguments.variablesReference"))?;
        let name = req
            .arguments
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("setVariable: missing arguments.name"))?;
        let value = req
            .arguments
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("setVariable: missing arguments.value"))?;

        let scope_ref = *self
            .scopes
            .get(reference)
            .ok_or_else(|| anyhow!("setVariable: unknown variables reference {reference}"))?;
        let conn = self.connection(scope_ref.connection)?;
        self.ensure_stopped(&conn)?;
        let value = conn.set_variable(name, value)?;
        self.send_success_body(req, json!({"value": value, "variablesReference": 0}))
    }

    fn handle_evaluate(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let expression = req
            .arguments
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("evaluate: missing arguments.expression"))?;
        let context = req.arguments.get("context").and_then(Value::as_str);

        let conn = match req
            .arguments
            .get("frameId")
            .and_then(Value::as_i64)
            .and_then(|id| self.frames.get(id))
        {
            Some(frame) => self.connection(frame.connection)?,
            None => self.connection_for_thread(None)?,
        };
        self.ensure_stopped(&conn)?;

        let result = if context == Some("repl") {
            conn.run_command(expression)?
        } else {
            conn.evaluate_variable(expression)?
        };
        self.send_success_body(req, json!({"result": result, "variablesReference": 0}))
    }

    fn handle_source(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let path = req
            .arguments
            .get("source")
            .and_then(|s| s.get("path"))
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("source: missing arguments.source.path"))?;
        let content = self.stopped_connection()?.get_source(path)?;
        self.send_success_body(req, json!({"content": content}))
    }

    fn handle_terminate(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        self.close_debuggees();
        self.send_success(req)
    }

    fn handle_disconnect(&mut self, req: &DapRequest) -> anyhow::Result<()> {
        let terminate_debuggee = req
            .arguments
            .get("terminateDebuggee")
            .and_then(Value::as_bool)
            .unwrap_or(self.mode != Some(StartMode::Attach));

        if !terminate_debuggee && self.mode == Some(StartMode::Attach) {
            // running connections are left as is
            for conn in self.all_connections() {
                if self.is_running(conn.id()) {
                    continue;
                }
                weak_error!(conn.clear_all_breakpoints(), "clear breakpoints:");
                weak_error!(conn.clear_all_function_breakpoints(), "clear breakpoints:");
                // let the program run, the reply is never awaited
                _ = weak_error!(conn.continue_(), "detach:");
            }
        }

        self.close_debuggees();
        self.send_success(req)
    }

    /// Close debuggee sockets, relays and the listener, kill a spawned debuggee.
    fn close_debuggees(&mut self) {
        self.listener_stop.store(true, Ordering::Release);
        for conn in self.connections.values() {
            conn.terminate();
        }
        for relay in self.relays.values() {
            relay.close();
        }
        if let Some(mut child) = self.debuggee.take() {
            weak_error!(child.kill(), "kill debuggee:");
            weak_error!(child.wait(), "wait debuggee:");
        }
    }

    fn dispatch(&mut self, req: &DapRequest) -> anyhow::Result<bool> {
        match req.command.as_str() {
            "initialize" => self.handle_initialize(req)?,
            "launch" => self.handle_start(req, StartMode::Launch)?,
            "attach" => self.handle_start(req, StartMode::Attach)?,
            "configurationDone" => self.handle_configuration_done(req)?,
            "setBreakpoints" => self.handle_set_breakpoints(req)?,
            "setFunctionBreakpoints" => self.handle_set_function_breakpoints(req)?,
            "breakpointLocations" => self.handle_breakpoint_locations(req)?,
            "threads" => self.handle_threads(req)?,
            "stackTrace" => self.handle_stack_trace(req)?,
            "scopes" => self.handle_scopes(req)?,
            "variables" => self.handle_variables(req)?,
            "setVariable" => self.handle_set_variable(req)?,
            "continue" => self.handle_flow(req, Flow::Continue)?,
            "next" => self.handle_flow(req, Flow::Next)?,
            "stepIn" => self.handle_flow(req, Flow::StepIn)?,
            "stepOut" => self.handle_flow(req, Flow::StepOut)?,
            "evaluate" => self.handle_evaluate(req)?,
            "source" => self.handle_source(req)?,
            "terminate" => self.handle_terminate(req)?,
            "disconnect" => {
                self.handle_disconnect(req)?;
                return Ok(false);
            }
            other => {
                self.send_err(req, format!("Unsupported DAP command: {other}"))?;
            }
        }
        Ok(true)
    }

    fn next_message(&mut self) -> anyhow::Result<Message> {
        loop {
            let deadline = self.reverse_requests.values().map(|p| p.deadline).min();
            let Some(deadline) = deadline else {
                return Ok(self.inbox.recv()?);
            };
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.inbox.recv_timeout(timeout) {
                Ok(msg) => return Ok(msg),
                Err(RecvTimeoutError::Timeout) => self.expire_reverse_requests()?,
                Err(RecvTimeoutError::Disconnected) => bail!("session inbox closed"),
            }
        }
    }

    fn event_loop(&mut self) -> anyhow::Result<()> {
        loop {
            let cont = match self.next_message()? {
                Message::Client(ClientMessage::Request(req)) => match self.dispatch(&req) {
                    Ok(cont) => cont,
                    Err(e) => {
                        warn!(target: "dap", "{} failed: {e:#}", req.command);
                        self.send_err(&req, format!("{e:#}"))?;
                        true
                    }
                },
                Message::Client(ClientMessage::Response(rsp)) => {
                    self.on_client_response(rsp)?;
                    true
                }
                Message::ClientClosed => {
                    info!(target: "dap", "DAP client disconnected");
                    false
                }
                Message::Accepted(stream) => {
                    if let Err(e) = self.on_accepted(stream) {
                        warn!(target: "dap", "debuggee setup failed: {e:#}");
                    }
                    true
                }
                Message::Runtime(event) => {
                    self.on_runtime_event(event)?;
                    true
                }
                Message::Resumed {
                    id,
                    reason,
                    outcome,
                } => {
                    self.on_resumed(id, reason, outcome)?;
                    true
                }
                Message::BreakpointsApplied {
                    id,
                    request,
                    outcome,
                } => {
                    self.on_breakpoints_applied(id, request, outcome)?;
                    true
                }
                Message::RelayClosed(relay) => {
                    self.on_relay_closed(relay)?;
                    true
                }
            };
            if !cont {
                return Ok(());
            }
        }
    }

    /// Serve a client until it disconnects.
    pub fn run(mut self, mut reader: DapReader) -> anyhow::Result<()> {
        let sender = self.sender.clone();
        thread::Builder::new()
            .name("dap-reader".to_string())
            .spawn(move || loop {
                let msg = match reader.read_message() {
                    Ok(Some(value)) => value,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(target: "dap", "read DAP message: {e:#}");
                        break;
                    }
                };
                match ClientMessage::from_value(msg) {
                    Ok(msg) => {
                        if sender.send(Message::Client(msg)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(target: "dap", "ignore DAP message: {e:#}"),
                }
            })?;

        let result = self.event_loop();
        self.close_debuggees();
        result
    }
}
