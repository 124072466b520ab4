//! Command line of a debuggee started by `launch` request.

use crate::session::args::LaunchArguments;
use anyhow::{anyhow, Context};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::net::{Ipv4Addr, UdpSocket};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;

/// Debuggee process description, suitable for `runInTerminal` request or for local spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebuggeeCommand {
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

fn debug_flag(threads: bool) -> &'static str {
    if threads {
        "-dt"
    } else {
        "-d"
    }
}

/// Quote a word for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c);
    if !word.is_empty() && word.chars().all(safe) {
        return word.to_string();
    }
    format!("'{}'", word.replace('\'', r"'\''"))
}

/// Build the debuggee command, `port` is the adapter port the debuggee connects to.
pub fn build_command(
    args: &LaunchArguments,
    perl: &str,
    port: u16,
) -> anyhow::Result<DebuggeeCommand> {
    let program = args
        .program
        .as_deref()
        .ok_or_else(|| anyhow!("launch: missing arguments.program"))?;

    match &args.hostname {
        Some(hostname) => {
            let local = args
                .local_hostname
                .clone()
                .or_else(|| detect_local_address(hostname))
                .unwrap_or_else(|| "localhost".to_string());
            Ok(DebuggeeCommand {
                args: vec![
                    "ssh".to_string(),
                    hostname.clone(),
                    remote_command(args, perl, program, &local, port),
                ],
                env: BTreeMap::new(),
                cwd: args.cwd.clone(),
            })
        }
        None => {
            let mut argv = vec![perl.to_string(), debug_flag(args.threads).to_string()];
            argv.extend(args.perl_args.iter().cloned());
            argv.push(program.to_string());
            argv.extend(args.args.iter().cloned());

            let mut env = args.env.clone();
            env.insert(
                "PERLDB_OPTS".to_string(),
                // the listener of a local launch is bound to the IPv4 loopback only
                format!("RemotePort={}:{port}", Ipv4Addr::LOCALHOST),
            );
            Ok(DebuggeeCommand {
                args: argv,
                env,
                cwd: args.cwd.clone(),
            })
        }
    }
}

/// Shell command executed by ssh on a remote host.
fn remote_command(
    args: &LaunchArguments,
    perl: &str,
    program: &str,
    local_hostname: &str,
    port: u16,
) -> String {
    let mut words = vec![format!(
        "PERLDB_OPTS={}",
        shell_quote(&format!("RemotePort={local_hostname}:{port}"))
    )];
    words.extend(
        args.env
            .iter()
            .map(|(name, value)| format!("{name}={}", shell_quote(value))),
    );
    words.push(shell_quote(perl));
    words.push(debug_flag(args.threads).to_string());
    words.extend(args.perl_args.iter().map(|a| shell_quote(a)));
    words.push(shell_quote(program));
    words.extend(args.args.iter().map(|a| shell_quote(a)));
    words.join(" ")
}

/// Local address used to reach a remote host, no packets are sent.
fn detect_local_address(remote: &str) -> Option<String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect((remote, 22)).ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

/// Spawn the debuggee, stdout and stderr are piped.
pub fn spawn(cmd: &DebuggeeCommand) -> anyhow::Result<Child> {
    let (program, args) = cmd
        .args
        .split_first()
        .ok_or_else(|| anyhow!("empty debuggee command"))?;

    let program_path = if !Path::new(program).exists() {
        which::which(program)
            .with_context(|| format!("{program} not found"))?
            .to_string_lossy()
            .to_string()
    } else {
        program.to_string()
    };

    let mut command = Command::new(program_path);
    command
        .args(args)
        .envs(&cmd.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cmd.cwd.as_deref().filter(|cwd| !cwd.is_empty()) {
        command.current_dir(cwd);
    }

    command.spawn().context("spawn debuggee")
}

/// Forward debuggee stdout and stderr line by line, `sink` receives output category and text.
pub fn forward_output(
    child: &mut Child,
    sink: impl Fn(&'static str, String) + Clone + Send + 'static,
) {
    fn pump(
        reader: impl Read + Send + 'static,
        category: &'static str,
        sink: impl Fn(&'static str, String) + Send + 'static,
    ) {
        thread::spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut buf = String::new();
            loop {
                buf.clear();
                match reader.read_line(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => sink(category, buf.clone()),
                    Err(_) => break,
                }
            }
        });
    }

    if let Some(stdout) = child.stdout.take() {
        pump(stdout, "stdout", sink.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        pump(stderr, "stderr", sink);
    }
}
