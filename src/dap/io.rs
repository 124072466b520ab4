//! Content-Length framing of DAP messages over TCP or stdio.

use crate::dap::tracer::FileTracer;
use anyhow::anyhow;
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;

/// Reading half of a DAP transport.
pub struct DapReader {
    reader: Box<dyn BufRead + Send>,
    tracer: Option<FileTracer>,
}

/// Writing half of a DAP transport.
pub struct DapWriter {
    writer: Box<dyn Write + Send>,
    tracer: Option<FileTracer>,
}

/// Split a TCP connection into DAP reader and writer.
pub fn tcp(
    stream: TcpStream,
    tracer: Option<FileTracer>,
) -> anyhow::Result<(DapReader, DapWriter)> {
    stream.set_nodelay(true)?;
    let reader = BufReader::new(stream.try_clone()?);
    Ok((
        DapReader::new(reader, tracer.clone()),
        DapWriter::new(stream, tracer),
    ))
}

/// DAP reader and writer over the process stdin/stdout.
pub fn stdio(tracer: Option<FileTracer>) -> (DapReader, DapWriter) {
    (
        DapReader::new(BufReader::new(std::io::stdin()), tracer.clone()),
        DapWriter::new(std::io::stdout(), tracer),
    )
}

impl DapReader {
    pub fn new(reader: impl BufRead + Send + 'static, tracer: Option<FileTracer>) -> Self {
        Self {
            reader: Box::new(reader),
            tracer,
        }
    }

    /// Read a single message, return [`None`] if the client closed the stream.
    pub fn read_message(&mut self) -> anyhow::Result<Option<Value>> {
        let mut content_length: Option<usize> = None;
        let mut headers = 0;
        loop {
            let mut line = String::new();
            let read_n = self.reader.read_line(&mut line)?;
            if read_n == 0 {
                return Ok(None);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                if headers > 0 {
                    break;
                }
                continue;
            }
            headers += 1;
            if let Some(v) = line.strip_prefix("Content-Length:") {
                content_length = Some(v.trim().parse()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length header"))?;
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf)?;
        let msg: Value = serde_json::from_slice(&buf)?;
        if let Some(tracer) = &self.tracer {
            tracer.message("<-", &msg);
        }
        Ok(Some(msg))
    }
}

impl DapWriter {
    pub fn new(writer: impl Write + Send + 'static, tracer: Option<FileTracer>) -> Self {
        Self {
            writer: Box::new(writer),
            tracer,
        }
    }

    pub fn write_message<T: Serialize>(&mut self, v: &T) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(v)?;
        if let Some(tracer) = &self.tracer {
            if let Ok(value) = serde_json::to_value(v) {
                tracer.message("->", &value);
            }
        }
        write!(self.writer, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.writer.write_all(&payload)?;
        self.writer.flush()?;
        Ok(())
    }
}
