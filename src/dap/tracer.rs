use crate::runtime::lock;
use anyhow::Context;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Append-only trace file shared by every session of the adapter.
///
/// Nested sessions run concurrently with their parent, so each session traces through
/// its own [`FileTracer::for_session`] copy and lines carry the session label.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
    trace_messages: bool,
    session: Option<Arc<str>>,
}

impl FileTracer {
    /// Open (or create) a trace file, `trace_messages` enables DAP traffic dump.
    pub fn new(path: &Path, trace_messages: bool) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            trace_messages,
            session: None,
        })
    }

    /// Tracer writing into the same file with lines tagged by `session`.
    pub fn for_session(&self, session: &str) -> Self {
        Self {
            session: Some(Arc::from(session)),
            ..self.clone()
        }
    }

    pub fn line(&self, text: &str) {
        let mut file = lock(&self.file);
        _ = match &self.session {
            Some(session) => writeln!(file, "[{session}] {text}"),
            None => writeln!(file, "{text}"),
        };
    }

    /// Write a DAP message, `direction` is `<-` for incoming and `->` for outgoing.
    pub fn message(&self, direction: &str, message: &serde_json::Value) {
        if !self.trace_messages {
            return;
        }
        if let Ok(line) = serde_json::to_string(message) {
            self.line(&format!("{direction} {line}"));
        }
    }
}
