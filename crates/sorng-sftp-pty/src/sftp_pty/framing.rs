//! Sentinel framing over the interactive console.
//!
//! Each command is written as two lines: the command itself and
//! `!echo <token>`. The response is complete once a newline-terminated line
//! consisting of exactly the token shows up. Everything before that line is
//! the command's output, minus terminal noise.
//!
//! Bytes are buffered raw and only decoded once a full line is available,
//! so multi-byte characters split across reads survive.

use crate::sftp_pty::classifier::strip_ansi;

const PROMPT: &str = "sftp>";

#[derive(Debug, Default)]
pub struct SentinelFramer {
    buf: Vec<u8>,
    /// Offset of the first byte not yet checked for a sentinel line.
    line_start: usize,
    pending: Option<Pending>,
}

#[derive(Debug)]
struct Pending {
    command: String,
    sentinel: String,
}

impl SentinelFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `sentinel`. Any buffered bytes are discarded.
    pub fn begin(&mut self, command: &str, sentinel: &str) {
        self.buf.clear();
        self.line_start = 0;
        self.pending = Some(Pending {
            command: command.trim().to_string(),
            sentinel: sentinel.to_string(),
        });
    }

    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the in-flight command and its buffer.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.line_start = 0;
        self.pending = None;
    }

    /// Feed raw bytes. Returns the cleaned output once the sentinel line
    /// has arrived; the framer is idle again afterwards.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        let pending = self.pending.as_ref()?;
        self.buf.extend_from_slice(bytes);

        while let Some(rel) = self.buf[self.line_start..].iter().position(|b| *b == b'\n') {
            let end = self.line_start + rel;
            let line = String::from_utf8_lossy(&self.buf[self.line_start..end]);
            if is_sentinel_line(&line, &pending.sentinel) {
                let body = String::from_utf8_lossy(&self.buf[..self.line_start]).into_owned();
                let output = clean_output(&body, &pending.command, &pending.sentinel);
                self.reset();
                return Some(output);
            }
            self.line_start = end + 1;
        }
        None
    }
}

fn is_sentinel_line(raw: &str, sentinel: &str) -> bool {
    let line = visible_line(raw);
    let line = line.trim_end();
    if line == sentinel {
        return true;
    }
    // A prompt redrawn in front of the subshell output.
    match line.strip_prefix(PROMPT) {
        Some(rest) => rest.trim_start() == sentinel,
        None => false,
    }
}

/// Last carriage-return segment of a line, without escapes or control bytes.
fn visible_line(raw: &str) -> String {
    let raw = raw.trim_end_matches('\r');
    let last = raw.rsplit('\r').next().unwrap_or(raw);
    strip_ansi(last)
        .chars()
        .filter(|c| *c == '\t' || !c.is_control())
        .collect()
}

/// Strip echoes, prompts and overwritten progress from a response body.
pub fn clean_output(body: &str, command: &str, sentinel: &str) -> String {
    let sentinel_echo = format!("!echo {}", sentinel);
    let mut command_echo_seen = false;

    let lines: Vec<String> = body
        .split('\n')
        .map(visible_line)
        .filter(|line| {
            let t = line.trim();
            if t.contains(&sentinel_echo) || t.starts_with(PROMPT) {
                return false;
            }
            if !command_echo_seen && !command.is_empty() && t == command {
                command_echo_seen = true;
                return false;
            }
            true
        })
        .map(|line| line.trim_end().to_string())
        .collect();

    let first = lines.iter().position(|l| !l.is_empty());
    let last = lines.iter().rposition(|l| !l.is_empty());
    match (first, last) {
        (Some(a), Some(b)) => lines[a..=b].join("\n"),
        _ => String::new(),
    }
}
