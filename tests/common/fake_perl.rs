//! Scripted perl5db emulator.
//!
//! Speaks the remote debugger protocol over a socket: banner, `  DB<n> ` prompts and
//! replies to the commands issued by the adapter. The debugged program is fixed (see
//! [`SOURCE`]), execution is a precomputed list of steps.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

pub const SOURCE: &[&str] = &[
    "use strict;",
    "my $count = 3;",
    "my @names = ('a', 'b');",
    "sub greet {",
    "    my ($name) = @_;",
    "    return \"hi $name\";",
    "}",
    "my $msg = greet('x');",
    "print \"$msg\\n\";",
    "$count++;",
];

pub const BREAKABLE: &[u32] = &[2, 3, 5, 6, 8, 9, 10];
pub const GREET_LINE: u32 = 5;
pub const GREET_CALL_LINE: u32 = 8;

const BANNER: &str = "\nLoading DB routines from perl5db.pl version 1.60\n\
Editor support available.\n\n\
Enter h or 'h h' for help, or 'man perldebug' for more help.\n\n";

#[derive(Debug, Clone, Copy)]
struct Step {
    line: u32,
    depth: usize,
}

const STEPS: &[Step] = &[
    Step { line: 2, depth: 0 },
    Step { line: 3, depth: 0 },
    Step { line: 8, depth: 0 },
    Step { line: 5, depth: 1 },
    Step { line: 6, depth: 1 },
    Step { line: 9, depth: 0 },
    Step { line: 10, depth: 0 },
];

#[derive(Debug, Clone)]
pub struct FakeOptions {
    pub pid: u32,
    /// Value of `$0`.
    pub script: String,
    pub padwalker: bool,
    /// Printed right before each prompt, e.g. `[pid=1->2]`.
    pub annotation: String,
    /// B module is loadable.
    pub reflection: bool,
    /// `%DB::sub` lookups and listings of subroutines work.
    pub locatable: bool,
    /// `c` is held until [`FakePerl::release`].
    pub hold_continue: bool,
}

impl FakeOptions {
    pub fn new(pid: u32, script: &str) -> Self {
        Self {
            pid,
            script: script.to_string(),
            padwalker: true,
            annotation: String::new(),
            reflection: true,
            locatable: true,
            hold_continue: false,
        }
    }
}

pub type CommandLog = Arc<Mutex<Vec<String>>>;

/// Latch holding `c` of a debuggee, stays open once opened.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<bool>, Condvar)>);

impl Gate {
    pub fn open(&self) {
        let (open, cvar) = &*self.0;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }

    fn wait(&self) {
        let (open, cvar) = &*self.0;
        let mut open = open.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }
}

enum Reply {
    Text(String),
    Exit,
}

struct Debugger {
    options: FakeOptions,
    step: usize,
    breakpoints: BTreeSet<u32>,
    vars: BTreeMap<String, String>,
}

impl Debugger {
    fn new(options: FakeOptions) -> Self {
        let vars = BTreeMap::from([
            ("$count".to_string(), "3".to_string()),
            ("$name".to_string(), "x".to_string()),
            ("$VERSION".to_string(), "0.01".to_string()),
        ]);
        Self {
            options,
            step: 0,
            breakpoints: BTreeSet::new(),
            vars,
        }
    }

    fn current(&self) -> Step {
        STEPS[self.step]
    }

    fn sub_name(&self) -> &'static str {
        if self.current().depth > 0 {
            "main::greet"
        } else {
            "main::"
        }
    }

    fn position(&self) -> String {
        let line = self.current().line;
        format!(
            "{}({}:{line}):\t{}",
            self.sub_name(),
            self.options.script,
            SOURCE[line as usize - 1]
        )
    }

    fn stack_trace(&self) -> String {
        if self.current().depth == 0 {
            return String::new();
        }
        format!(
            "$ = main::greet('x') called from file '{}' line {GREET_CALL_LINE}",
            self.options.script
        )
    }

    fn lexicals(&self) -> String {
        if !self.options.padwalker {
            return "PadWalker module not found - please install".to_string();
        }
        if self.current().depth > 0 {
            return format!("$name = '{}'", self.vars["$name"]);
        }
        format!(
            "$count = {}\n@names = (\n   0  'a'\n   1  'b'\n)",
            self.vars["$count"]
        )
    }

    /// Move to the next step matching the predicate, [`None`] if the program is finished.
    fn advance(&mut self, predicate: impl Fn(&Step, &Step) -> bool) -> Reply {
        let from = self.current();
        match (self.step + 1..STEPS.len()).find(|&i| predicate(&from, &STEPS[i])) {
            Some(i) => {
                self.step = i;
                Reply::Text(self.position())
            }
            None => Reply::Exit,
        }
    }

    fn set_breakpoint(&mut self, target: &str) -> String {
        if let Some((file, line)) = target.rsplit_once(':') {
            if let Ok(line) = line.parse::<u32>() {
                if file != self.options.script {
                    return format!("No file matching '{file}' is loaded.");
                }
                if !BREAKABLE.contains(&line) {
                    return format!("Line {line} not breakable.");
                }
                self.breakpoints.insert(line);
                return String::new();
            }
        }

        let name = if target.contains("::") {
            target.to_string()
        } else {
            format!("main::{target}")
        };
        if name == "main::greet" {
            self.breakpoints.insert(GREET_LINE);
            String::new()
        } else {
            format!("Subroutine {name} not found.")
        }
    }

    fn listing(&self) -> String {
        if !self.options.locatable {
            return "Subroutine main::greet not found.".to_string();
        }
        (4..=7u32)
            .map(|line| {
                let marker = match (BREAKABLE.contains(&line), self.breakpoints.contains(&line)) {
                    (true, true) => ":b",
                    (true, false) => ":",
                    (false, _) => " ",
                };
                format!("{line}{marker}\t{}", SOURCE[line as usize - 1])
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn breakable_lines(&self, cmd: &str) -> String {
        let range = cmd
            .split_once("!= 0 } ")
            .map(|(_, range)| range.trim_end_matches(" }"))
            .unwrap_or_default();
        let (start, end) = range.split_once(" .. ").unwrap_or(("1", ""));
        let start: u32 = start.trim().parse().unwrap_or(1);
        let end: u32 = end.trim().parse().unwrap_or(SOURCE.len() as u32);
        BREAKABLE
            .iter()
            .filter(|line| (start..=end).contains(*line))
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    fn sub_entry(&self, cmd: &str) -> String {
        if !self.options.locatable {
            return "Search pattern not terminated at (eval 9) line 2.".to_string();
        }
        if cmd.contains("my $n = 'greet';") || cmd.contains("my $n = 'main::greet';") {
            format!("{}:{GREET_LINE}", self.options.script)
        } else {
            String::new()
        }
    }

    fn dump(&self, expr: &str) -> String {
        match expr {
            "\\@names" => "0  ARRAY(0x55d0c8a1e2f8)\n   0  'a'\n   1  'b'".to_string(),
            other => match self.vars.get(other) {
                Some(value) => format!("0  {value}"),
                None => "0  HASH(0x55d0c8b7a0e0)\n     empty hash".to_string(),
            },
        }
    }

    fn handle(&mut self, cmd: &str) -> Reply {
        let text = match cmd {
            "q" => return Reply::Exit,
            "c" => {
                let breakpoints = self.breakpoints.clone();
                return self.advance(move |_, step| breakpoints.contains(&step.line));
            }
            "n" => return self.advance(|from, step| step.depth <= from.depth),
            "s" => return self.advance(|_, _| true),
            "r" => return self.advance(|from, step| step.depth < from.depth),
            "p $$" => self.options.pid.to_string(),
            "p $0" | "p $DB::filename" => self.options.script.clone(),
            "." => self.position(),
            "T" => self.stack_trace(),
            "y" => self.lexicals(),
            _ if cmd.starts_with("p eval { require PadWalker") => {
                u8::from(self.options.padwalker).to_string()
            }
            _ if cmd.starts_with("p eval { require B") => {
                u8::from(self.options.reflection).to_string()
            }
            _ if cmd.starts_with("o ") => "          inhibit_exit = '0'".to_string(),
            _ if cmd.starts_with("undef ") => String::new(),
            _ if cmd.starts_with("if (!$INC{'B.pm'})") => {
                if self.options.reflection && cmd.contains("\\&main::greet)") {
                    format!(
                        "{{\"file\":\"{}\",\"line\":{GREET_LINE}}}",
                        self.options.script
                    )
                } else {
                    "Not a subroutine reference".to_string()
                }
            }
            _ if cmd.starts_with("p do { no strict 'refs'; no warnings; my $f = ") => {
                self.breakable_lines(cmd)
            }
            _ if cmd.starts_with("p do { no strict 'refs'; no warnings; my $n = ") => {
                self.sub_entry(cmd)
            }
            _ if cmd.starts_with("p do { no strict 'refs'; no warnings; my $p = ") => {
                "$VERSION".to_string()
            }
            _ if cmd.starts_with("p join '', @DB::dbline") => SOURCE.join("\n"),
            _ if cmd.starts_with("p ref ") => String::new(),
            _ if cmd.starts_with("p ") => self.vars.get(&cmd[2..]).cloned().unwrap_or_default(),
            _ if cmd.starts_with("x ") => self.dump(&cmd[2..]),
            _ if cmd.starts_with("b ") => {
                let target = cmd[2..].split_whitespace().next().unwrap_or_default();
                self.set_breakpoint(target)
            }
            _ if cmd.starts_with("B ") => {
                if let Ok(line) = cmd[2..].trim().parse::<u32>() {
                    self.breakpoints.remove(&line);
                }
                String::new()
            }
            _ if cmd.starts_with("f ") => String::new(),
            _ if cmd.starts_with("l ") => self.listing(),
            _ if cmd.starts_with("require ") => {
                let module = cmd["require ".len()..].trim_matches('\'');
                format!("Can't locate {module}.pm in @INC (you may need to install the {module} module)")
            }
            _ => match cmd.split_once(" = ") {
                Some((name, value)) if name.starts_with('$') => {
                    self.vars.insert(name.to_string(), value.to_string());
                    String::new()
                }
                _ => String::new(),
            },
        };
        Reply::Text(text)
    }
}

/// Run the debugger REPL over a connected socket until the program ends.
pub fn serve(stream: TcpStream, options: FakeOptions, log: CommandLog) -> io::Result<()> {
    serve_gated(stream, options, log, Gate::default())
}

fn serve_gated(
    stream: TcpStream,
    options: FakeOptions,
    log: CommandLog,
    gate: Gate,
) -> io::Result<()> {
    let hold_continue = options.hold_continue;
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream.try_clone()?);
    let annotation = options.annotation.clone();
    let mut debugger = Debugger::new(options);
    let mut counter = 1;

    write!(writer, "{BANNER}{}\n{annotation}  DB<{counter}> ", debugger.position())?;
    writer.flush()?;

    for line in reader.lines() {
        let line = line?;
        let cmd = line.trim_end_matches('\r');
        log.lock().unwrap().push(cmd.to_string());
        if cmd == "c" && hold_continue {
            gate.wait();
        }

        match debugger.handle(cmd) {
            Reply::Text(text) => {
                counter += 1;
                if !text.is_empty() {
                    writeln!(writer, "{text}")?;
                }
                write!(writer, "{annotation}  DB<{counter}> ")?;
                writer.flush()?;
            }
            Reply::Exit => break,
        }
    }

    _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

/// Emulated debuggee running on a background thread.
pub struct FakePerl {
    log: CommandLog,
    stream: TcpStream,
    gate: Gate,
    handle: JoinHandle<io::Result<()>>,
}

impl FakePerl {
    /// Connect to an adapter (or to a test listener) like `PERLDB_OPTS=RemotePort` does.
    pub fn connect(addr: SocketAddr, options: FakeOptions) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        let log = CommandLog::default();
        let gate = Gate::default();
        let (thread_stream, thread_log, thread_gate) =
            (stream.try_clone()?, log.clone(), gate.clone());
        let handle =
            thread::spawn(move || serve_gated(thread_stream, options, thread_log, thread_gate));
        Ok(Self {
            log,
            stream,
            gate,
            handle,
        })
    }

    /// Let a held `c` run.
    pub fn release(&self) {
        self.gate.open();
    }

    /// Drop the connection like a killed process does.
    pub fn disconnect(&self) {
        _ = self.stream.shutdown(Shutdown::Both);
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
