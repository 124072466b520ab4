//! Per connection worker.
//!
//! Flow control and breakpoint updates of a connection may wait for the debuggee as long
//! as the program runs, so they are executed on a worker thread, one job after another
//! in submission order, and the outcomes are posted back to the session inbox.

use crate::runtime::breakpoint::FunctionLocation;
use crate::runtime::{self, ConnectionId, RuntimeConnection};
use crate::session::{Flow, FunctionBreakpointArgs, Message, SourceBreakpoint};
use anyhow::anyhow;
use log::debug;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// Breakpoint set replacing the previous one of the same kind.
#[derive(Debug)]
pub(super) enum BreakpointUpdate {
    /// Line breakpoints of a single source.
    Source {
        path: String,
        breakpoints: Vec<SourceBreakpoint>,
    },
    Functions(Vec<FunctionBreakpointArgs>),
}

impl BreakpointUpdate {
    pub(super) fn len(&self) -> usize {
        match self {
            BreakpointUpdate::Source { breakpoints, .. } => breakpoints.len(),
            BreakpointUpdate::Functions(breakpoints) => breakpoints.len(),
        }
    }
}

/// Outcome of a single breakpoint.
#[derive(Debug, Clone)]
pub(super) struct Verdict {
    pub verified: bool,
    pub location: Option<FunctionLocation>,
    pub message: Option<String>,
}

impl Verdict {
    pub(super) fn accepted(location: Option<FunctionLocation>) -> Self {
        Self {
            verified: true,
            location,
            message: None,
        }
    }

    pub(super) fn rejected(message: Option<String>) -> Self {
        Self {
            verified: false,
            location: None,
            message,
        }
    }

    /// Combine outcomes of several connections, verified only if all of them accept.
    pub(super) fn merge(&mut self, other: Verdict) {
        self.verified = self.verified && other.verified;
        if self.location.is_none() {
            self.location = other.location;
        }
        if self.message.is_none() {
            self.message = other.message;
        }
    }
}

pub(super) enum Job {
    Resume(Flow),
    /// `request` identifies a client request waiting for the verdicts.
    Breakpoints {
        request: Option<u64>,
        update: Arc<BreakpointUpdate>,
    },
}

fn resume(conn: &RuntimeConnection, flow: Flow) -> Result<String, runtime::Error> {
    let pending = match flow {
        Flow::Continue => conn.continue_(),
        Flow::Next => conn.next(),
        Flow::StepIn => conn.step_into(),
        Flow::StepOut => conn.step_out(),
    }?;
    debug!(target: "dap", "resume #{} with `{}`", conn.id(), pending.command());
    pending.wait()
}

/// Apply a breakpoint update, negative outcomes of the debugger are unverified
/// breakpoints, transport failures fail the whole update.
fn apply_update(
    conn: &RuntimeConnection,
    update: &BreakpointUpdate,
) -> Result<Vec<Verdict>, runtime::Error> {
    match update {
        BreakpointUpdate::Source { path, breakpoints } => {
            conn.clear_source_breakpoints(path)?;
            breakpoints
                .iter()
                .map(|bp| {
                    let accepted = conn.set_breakpoint(path, bp.line, bp.condition.as_deref())?;
                    Ok(if accepted {
                        Verdict::accepted(None)
                    } else {
                        Verdict::rejected(None)
                    })
                })
                .collect()
        }
        BreakpointUpdate::Functions(breakpoints) => {
            conn.clear_all_function_breakpoints()?;
            breakpoints
                .iter()
                .map(
                    |bp| match conn.set_function_breakpoint(&bp.name, bp.condition.as_deref()) {
                        Ok(Some(location)) => Ok(Verdict::accepted(Some(location))),
                        Ok(None) => Ok(Verdict::rejected(None)),
                        Err(e) if !e.is_fatal() => Ok(Verdict::rejected(Some(e.to_string()))),
                        Err(e) => Err(e),
                    },
                )
                .collect()
        }
    }
}

/// Handle of a worker thread, the thread exits after the handle is dropped and
/// the submitted jobs are done.
pub(super) struct ConnectionWorker {
    jobs: mpsc::Sender<Job>,
}

impl ConnectionWorker {
    pub(super) fn start(
        conn: Arc<RuntimeConnection>,
        inbox: mpsc::Sender<Message>,
    ) -> anyhow::Result<Self> {
        let (jobs, rx) = mpsc::channel::<Job>();
        let id: ConnectionId = conn.id();
        thread::Builder::new()
            .name(format!("perl5db-worker-{id}"))
            .spawn(move || {
                for job in rx {
                    let msg = match job {
                        Job::Resume(flow) => Message::Resumed {
                            id,
                            reason: flow.stop_reason(),
                            outcome: resume(&conn, flow),
                        },
                        Job::Breakpoints { request, update } => Message::BreakpointsApplied {
                            id,
                            request,
                            outcome: apply_update(&conn, &update),
                        },
                    };
                    if inbox.send(msg).is_err() {
                        break;
                    }
                }
                debug!(target: "dap", "worker of debuggee connection #{id} stopped");
            })?;
        Ok(Self { jobs })
    }

    pub(super) fn submit(&self, job: Job) -> anyhow::Result<()> {
        self.jobs
            .send(job)
            .map_err(|_| anyhow!("debuggee connection worker is stopped"))
    }
}
