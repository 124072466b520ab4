//! Framing of the perl5db output stream.
//!
//! The debugger has no message framing. After every command it prints the command output
//! and then a prompt, so a reply is the text between two consecutive prompts:
//!
//! ```text
//! prompt    = [ pid-chain hws* ] [ "[" digits "]" hws* ] "DB" ( "<" n ">" | "<<" n ">>" ) " "
//! pid-chain = "[pid=" digits ( "->" digits )+ "]"
//! hws       = " " | "\t"
//! reply     = bytes between the end of a prompt and the start of the next one,
//!             without one trailing "\n" followed by at most two spaces
//! ```
//!
//! Everything before the first prompt (the debugger banner) is dropped.

/// A parsed prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    /// Command counter.
    pub counter: u32,
    /// `DB<<n>>` form, printed by a debugger nested into an evaluated expression.
    pub nested: bool,
    /// Process chain of a forked debuggee, the last element is the current process.
    pub pids: Vec<u32>,
    /// Thread id of a debuggee run with `-dt`.
    pub thread: Option<u32>,
}

impl Prompt {
    /// Process id announced by the prompt, if any.
    pub fn pid(&self) -> Option<u32> {
        self.pids.last().copied()
    }

    /// Return true if prompt carries a process or thread identity.
    pub fn is_annotated(&self) -> bool {
        !self.pids.is_empty() || self.thread.is_some()
    }
}

/// One step of the stream: a prompt and the reply printed before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Reply text, [`None`] for the very first prompt of a connection.
    pub reply: Option<String>,
    pub prompt: Prompt,
}

/// Incremental parser, bytes are pushed as they come from a socket and frames are
/// taken out as soon as a complete prompt is buffered.
#[derive(Debug, Default)]
pub struct PromptParser {
    buf: Vec<u8>,
    seen_prompt: bool,
}

struct Located {
    start: usize,
    end: usize,
    prompt: Prompt,
}

enum Marker {
    Complete { end: usize, counter: u32, nested: bool },
    Incomplete,
    Invalid,
}

impl PromptParser {
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed by a frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Take next complete frame from the buffer.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let located = locate_prompt(&self.buf)?;

        let reply = if self.seen_prompt {
            let end = reply_end(&self.buf, located.start);
            Some(String::from_utf8_lossy(&self.buf[..end]).into_owned())
        } else {
            None
        };
        self.seen_prompt = true;
        self.buf.drain(..located.end);

        Some(Frame {
            reply,
            prompt: located.prompt,
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn locate_prompt(buf: &[u8]) -> Option<Located> {
    let mut from = 0;
    while let Some(pos) = find(&buf[from..], b"DB<") {
        let at = from + pos;
        match parse_marker(buf, at) {
            Marker::Complete {
                end,
                counter,
                nested,
            } => {
                let (start, pids, thread) = parse_annotations(buf, at);
                return Some(Located {
                    start,
                    end,
                    prompt: Prompt {
                        counter,
                        nested,
                        pids,
                        thread,
                    },
                });
            }
            // a prompt may be split between two socket reads, wait for the rest
            Marker::Incomplete => return None,
            Marker::Invalid => from = at + 1,
        }
    }
    None
}

/// Parse `DB<n> ` or `DB<<n>> ` starting at `at`.
fn parse_marker(buf: &[u8], at: usize) -> Marker {
    let mut i = at + 3;
    let nested = buf.get(i) == Some(&b'<');
    if nested {
        i += 1;
    }

    let digits_start = i;
    while i < buf.len() && buf[i].is_ascii_digit() {
        i += 1;
    }
    if i == buf.len() {
        return Marker::Incomplete;
    }
    if i == digits_start {
        return Marker::Invalid;
    }
    let Some(counter) = std::str::from_utf8(&buf[digits_start..i])
        .ok()
        .and_then(|digits| digits.parse::<u32>().ok())
    else {
        return Marker::Invalid;
    };

    let closing: &[u8] = if nested { b">> " } else { b"> " };
    for expected in closing {
        match buf.get(i) {
            None => return Marker::Incomplete,
            Some(b) if b == expected => i += 1,
            Some(_) => return Marker::Invalid,
        }
    }

    Marker::Complete {
        end: i,
        counter,
        nested,
    }
}

fn skip_hws_back(buf: &[u8], mut j: usize) -> usize {
    while j > 0 && matches!(buf[j - 1], b' ' | b'\t') {
        j -= 1;
    }
    j
}

/// Find a `[...]` group that ends right before `j` and lies on the same line.
fn bracket_before(buf: &[u8], j: usize) -> Option<(usize, &[u8])> {
    if j == 0 || buf[j - 1] != b']' {
        return None;
    }
    let close = j - 1;
    let mut k = close;
    while k > 0 {
        k -= 1;
        match buf[k] {
            b'[' => return Some((k, &buf[k + 1..close])),
            b'\n' => return None,
            _ => {}
        }
    }
    None
}

fn parse_number(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn parse_pid_chain(content: &[u8]) -> Option<Vec<u32>> {
    let chain = content.strip_prefix(b"pid=")?;
    let chain = std::str::from_utf8(chain).ok()?;
    let pids = chain
        .split("->")
        .map(|pid| parse_number(pid.as_bytes()))
        .collect::<Option<Vec<_>>>()?;
    (pids.len() >= 2).then_some(pids)
}

/// Walk back from the `DB<` marker over the optional thread id and pid chain.
fn parse_annotations(buf: &[u8], at: usize) -> (usize, Vec<u32>, Option<u32>) {
    let mut start = at;
    let mut thread = None;
    let mut pids = vec![];

    let j = skip_hws_back(buf, start);
    if let Some((open, content)) = bracket_before(buf, j) {
        if let Some(tid) = parse_number(content) {
            thread = Some(tid);
            start = open;
        }
    }

    let j = skip_hws_back(buf, start);
    if let Some((open, content)) = bracket_before(buf, j) {
        if let Some(chain) = parse_pid_chain(content) {
            pids = chain;
            start = open;
        }
    }

    (start, pids, thread)
}

fn reply_end(buf: &[u8], prompt_start: usize) -> usize {
    let mut end = prompt_start;
    let mut spaces = 0;
    while spaces < 2 && end > 0 && buf[end - 1] == b' ' {
        end -= 1;
        spaces += 1;
    }
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    end
}
