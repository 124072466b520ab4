//! Debug Adapter Protocol plumbing: message envelopes, framing, tracing and logging.

pub mod io;
pub mod logger;
pub mod protocol;
pub mod tracer;

use crate::dap::io::DapWriter;
use crate::dap::protocol::{DapEvent, DapRequest, DapResponse, DapReverseRequest};
use serde_json::{json, Value};

/// Outgoing side of a DAP connection, assigns sequence numbers to messages.
///
/// Shared between a session and its helper threads behind a mutex. Implementations must
/// not log while the lock is held, log records may be forwarded to the same output
/// (see [`logger::DapLogger`]).
pub struct DapOutput {
    writer: DapWriter,
    seq: i64,
}

impl DapOutput {
    pub fn new(writer: DapWriter) -> Self {
        Self { writer, seq: 1 }
    }

    fn next_seq(&mut self) -> i64 {
        let s = self.seq;
        self.seq += 1;
        s
    }

    pub fn send_response(
        &mut self,
        req: &DapRequest,
        success: bool,
        message: Option<String>,
        body: Option<Value>,
    ) -> anyhow::Result<()> {
        let rsp = DapResponse {
            seq: self.next_seq(),
            r#type: "response",
            request_seq: req.seq,
            success,
            command: req.command.clone(),
            message,
            body,
        };
        self.writer.write_message(&rsp)
    }

    pub fn send_event(&mut self, event: &'static str, body: Option<Value>) -> anyhow::Result<()> {
        let ev = DapEvent {
            seq: self.next_seq(),
            r#type: "event",
            event,
            body,
        };
        self.writer.write_message(&ev)
    }

    /// Send `output` event.
    pub fn send_output(&mut self, category: &str, output: &str) -> anyhow::Result<()> {
        self.send_event(
            "output",
            Some(json!({"category": category, "output": output})),
        )
    }

    /// Send a reverse request, return its sequence number.
    pub fn send_request(&mut self, command: &'static str, arguments: Value) -> anyhow::Result<i64> {
        let seq = self.next_seq();
        let req = DapReverseRequest {
            seq,
            r#type: "request",
            command,
            arguments,
        };
        self.writer.write_message(&req)?;
        Ok(seq)
    }
}
