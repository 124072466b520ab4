#![allow(dead_code)]

pub mod fake_perl;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn repo_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn fake_perl_bin() -> PathBuf {
    std::env::var("CARGO_BIN_EXE_fake-perl5db")
        .map(PathBuf::from)
        .unwrap_or_else(|_| repo_root().join("target").join("debug").join("fake-perl5db"))
}

/// Address of a free local port.
pub fn free_addr() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").context("bind test TCP port")?;
    Ok(listener.local_addr()?)
}

/// Connect with retries while the other side is starting.
pub fn connect_with_retry(addr: SocketAddr) -> anyhow::Result<TcpStream> {
    let start = Instant::now();
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if start.elapsed() > CONNECT_TIMEOUT {
                    return Err(anyhow!("failed to connect to {addr}: {err}"));
                }
                thread::sleep(CONNECT_RETRY_DELAY);
            }
        }
    }
}

pub struct DapClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    next_seq: i64,
    pending_events: VecDeque<Value>,
    pending_requests: VecDeque<Value>,
}

impl DapClient {
    pub fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = connect_with_retry(addr)?;
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .context("set DAP read timeout")?;
        stream
            .set_write_timeout(Some(READ_TIMEOUT))
            .context("set DAP write timeout")?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            next_seq: 1,
            pending_events: VecDeque::new(),
            pending_requests: VecDeque::new(),
        })
    }

    pub fn send_request(&mut self, command: &str, arguments: Value) -> anyhow::Result<i64> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        self.write_message(&request)?;
        Ok(seq)
    }

    /// Send a request and wait for its response.
    pub fn request(&mut self, command: &str, arguments: Value) -> anyhow::Result<Value> {
        let seq = self.send_request(command, arguments)?;
        self.read_response(seq)
    }

    /// Answer a reverse request of the adapter.
    pub fn respond(&mut self, request: &Value, success: bool, body: Value) -> anyhow::Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let response = json!({
            "seq": seq,
            "type": "response",
            "request_seq": request["seq"],
            "command": request["command"],
            "success": success,
            "body": body,
        });
        self.write_message(&response)
    }

    fn dispatch(&mut self, msg: Value) -> Option<Value> {
        match msg.get("type").and_then(Value::as_str) {
            Some("event") => self.pending_events.push_back(msg),
            Some("request") => self.pending_requests.push_back(msg),
            Some("response") => return Some(msg),
            _ => {}
        }
        None
    }

    pub fn read_response(&mut self, request_seq: i64) -> anyhow::Result<Value> {
        loop {
            let msg = self.read_message()?;
            if let Some(rsp) = self.dispatch(msg) {
                if rsp.get("request_seq").and_then(Value::as_i64) == Some(request_seq) {
                    return Ok(rsp);
                }
            }
        }
    }

    /// Wait for an event with the given name, other events stay queued.
    pub fn wait_for_event(&mut self, name: &str) -> anyhow::Result<Value> {
        let matches = |event: &Value| event.get("event").and_then(Value::as_str) == Some(name);
        if let Some(pos) = self.pending_events.iter().position(matches) {
            return Ok(self.pending_events.remove(pos).expect("position is valid"));
        }
        loop {
            let msg = self.read_message()?;
            if msg.get("type").and_then(Value::as_str) == Some("event") && matches(&msg) {
                return Ok(msg);
            }
            self.dispatch(msg);
        }
    }

    /// Wait for a reverse request with the given command.
    pub fn wait_for_request(&mut self, command: &str) -> anyhow::Result<Value> {
        let matches =
            |req: &Value| req.get("command").and_then(Value::as_str) == Some(command);
        if let Some(pos) = self.pending_requests.iter().position(matches) {
            return Ok(self.pending_requests.remove(pos).expect("position is valid"));
        }
        loop {
            let msg = self.read_message()?;
            if msg.get("type").and_then(Value::as_str) == Some("request") && matches(&msg) {
                return Ok(msg);
            }
            self.dispatch(msg);
        }
    }

    /// Events received and not consumed yet with the given name.
    pub fn queued_events(&self, name: &str) -> usize {
        self.pending_events
            .iter()
            .filter(|event| event.get("event").and_then(Value::as_str) == Some(name))
            .count()
    }

    fn read_message(&mut self) -> anyhow::Result<Value> {
        let deadline = Instant::now() + MESSAGE_TIMEOUT;
        let mut content_length = None;
        loop {
            let mut line = String::new();
            let read_n = loop {
                match self.reader.read_line(&mut line) {
                    Ok(n) => break n,
                    Err(err)
                        if err.kind() == std::io::ErrorKind::WouldBlock
                            || err.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        if Instant::now() > deadline {
                            return Err(anyhow!("Timed out waiting for DAP header"));
                        }
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            };
            if read_n == 0 {
                return Err(anyhow!("DAP connection closed"));
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Content-Length:") {
                content_length = Some(value.trim().parse::<usize>()?);
            }
        }

        let len = content_length.ok_or_else(|| anyhow!("Missing Content-Length"))?;
        let mut buf = vec![0u8; len];
        self.read_exact_with_deadline(&mut buf, deadline)?;
        let msg = serde_json::from_slice(&buf)?;
        Ok(msg)
    }

    fn read_exact_with_deadline(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> anyhow::Result<()> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.reader.read(&mut buf[offset..]) {
                Ok(0) => return Err(anyhow!("DAP connection closed")),
                Ok(n) => offset += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > deadline {
                        return Err(anyhow!("Timed out waiting for DAP body"));
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn write_message(&mut self, message: &Value) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(message)?;
        write!(self.stream, "Content-Length: {}\r\n\r\n", payload.len())?;
        self.stream.write_all(&payload)?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Adapter process serving test clients.
pub struct DapSession {
    pub client: DapClient,
    pub addr: SocketAddr,
    process: Child,
    config: PathBuf,
    closed: bool,
}

impl DapSession {
    /// Start the adapter with a configuration file content.
    pub fn start(config: &str) -> anyhow::Result<Self> {
        let addr = free_addr()?;
        let config_path = std::env::temp_dir().join(format!(
            "perl-dap-test-{}-{}.toml",
            std::process::id(),
            addr.port()
        ));
        std::fs::write(&config_path, config).context("write adapter config")?;

        let bin_path = std::env::var("CARGO_BIN_EXE_perl-dap")
            .map(PathBuf::from)
            .unwrap_or_else(|_| repo_root().join("target").join("debug").join("perl-dap"));
        let process = Command::new(bin_path)
            .args(["--listen", &addr.to_string(), "--oneshot", "--config"])
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn perl-dap")?;
        let client = DapClient::connect(addr)?;
        Ok(Self {
            client,
            addr,
            process,
            config: config_path,
            closed: false,
        })
    }

    /// Open one more client connection to the same adapter (nested session).
    pub fn connect_nested(&self) -> anyhow::Result<DapClient> {
        DapClient::connect(self.addr)
    }

    pub fn initialize(&mut self, run_in_terminal: bool) -> anyhow::Result<Value> {
        let response = self.client.request(
            "initialize",
            json!({
                "adapterID": "perl",
                "supportsRunInTerminalRequest": run_in_terminal,
                "supportsStartDebuggingRequest": true,
            }),
        )?;
        assert_eq!(response["success"], true, "response: {response}");
        Ok(response)
    }

    pub fn disconnect(&mut self, terminate: bool) -> anyhow::Result<Value> {
        let response = self
            .client
            .request("disconnect", json!({ "terminateDebuggee": terminate }))?;
        self.closed = true;
        Ok(response)
    }
}

impl Drop for DapSession {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.disconnect(true);
        }
        if wait_for_exit(&mut self.process, SHUTDOWN_TIMEOUT).is_err() {
            let _ = self.process.kill();
        }
        let _ = std::fs::remove_file(&self.config);
    }
}

pub fn wait_for_exit(child: &mut Child, timeout: Duration) -> anyhow::Result<()> {
    let start = Instant::now();
    loop {
        if let Some(_status) = child.try_wait()? {
            return Ok(());
        }
        if start.elapsed() >= timeout {
            return Err(anyhow!("process did not exit in time"));
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Wait until the condition holds.
pub fn wait_until(what: &str, condition: impl Fn() -> bool) -> anyhow::Result<()> {
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > MESSAGE_TIMEOUT {
            return Err(anyhow!("timed out waiting for {what}"));
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}
