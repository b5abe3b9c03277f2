//! Output classifier for the interactive `sftp` console.
//!
//! Everything here is pure: a chunk of terminal text goes in, at most one
//! [`OutputEvent`] comes out. Nothing panics and nothing errors; text that
//! matches no pattern is simply `None`.
//!
//! Detection order matters and is fixed:
//! 1. host-key confirmation prompt
//! 2. password / passphrase prompt
//! 3. canonical ssh connection errors
//! 4. live progress line (`\r`-overwritten, no trailing newline)
//! 5. idle `sftp>` prompt
//! 6. a single `ls -l` row

use lazy_static::lazy_static;
use regex::Regex;

use crate::sftp_pty::types::{basename, EntryKind, ProgressSample, RemoteEntry};

lazy_static! {
    static ref ANSI_RE: Regex = Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]"
    )
    .expect("static regex");
    static ref LISTING_RE: Regex = Regex::new(
        r"(?x)
        ^([dlcbps-][rwxsStT-]{9})[+.@]?\s+   # permissions
        (\d+)\s+                             # link count
        (\S+)\s+                             # owner
        (\S+)\s+                             # group
        (\d+)\s+                             # size
        (\w{3}\s+\d{1,2}\s+[\d:]+)\s+        # date
        (.+)$                                # name, possibly `-> target`
        "
    )
    .expect("static regex");
    static ref PROGRESS_RE: Regex = Regex::new(
        r"^(.+?)\s+(\d{1,3})%\s+(\d+(?:\.\d+)?(?:[KMGTPE]B)?)\s+(\S+/s)\s+(\S+)(?:\s+ETA)?\s*$"
    )
    .expect("static regex");
    static ref FINGERPRINT_RE: Regex =
        Regex::new(r"(?m)key fingerprint is (\S+?)\.?\s*$").expect("static regex");
}

/// ssh failures recognised by their fixed wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalError {
    ConnectionRefused,
    TimedOut,
    NoRoute,
    NameResolution,
    PermissionDenied,
    ConnectionClosed,
    HostKeyVerificationFailed,
}

impl CanonicalError {
    pub fn describe(&self) -> &'static str {
        match self {
            CanonicalError::ConnectionRefused => "connection refused",
            CanonicalError::TimedOut => "connection timed out",
            CanonicalError::NoRoute => "no route to host",
            CanonicalError::NameResolution => "could not resolve hostname",
            CanonicalError::PermissionDenied => "permission denied",
            CanonicalError::ConnectionClosed => "connection closed by remote host",
            CanonicalError::HostKeyVerificationFailed => "host key verification failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    HostKeyPrompt {
        fingerprint: Option<String>,
        message: String,
    },
    AuthPrompt,
    ConnectionError(CanonicalError),
    Progress(ProgressSample),
    Ready,
    ListingRow(RemoteEntry),
}

/// Classify one chunk (or an accumulated buffer) of terminal output.
pub fn classify(chunk: &str) -> Option<OutputEvent> {
    let text = strip_ansi(chunk);

    if text.contains("Are you sure you want to continue connecting") {
        let fingerprint = FINGERPRINT_RE
            .captures(&text)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        return Some(OutputEvent::HostKeyPrompt {
            fingerprint,
            message: text.replace('\r', "").trim().to_string(),
        });
    }

    let lower = text.to_lowercase();
    if lower.contains("password:") || lower.contains("passphrase for") {
        return Some(OutputEvent::AuthPrompt);
    }

    if let Some(err) = canonical_error(&lower) {
        return Some(OutputEvent::ConnectionError(err));
    }

    if let Some(sample) = parse_progress(&text) {
        return Some(OutputEvent::Progress(sample));
    }

    if text.trim_end().ends_with("sftp>") {
        return Some(OutputEvent::Ready);
    }

    let trimmed = text.trim_matches(|c| c == '\r' || c == '\n');
    if !trimmed.contains('\n') {
        if let Some(entry) = parse_listing_row(trimmed.trim_end_matches('\r')) {
            return Some(OutputEvent::ListingRow(entry));
        }
    }

    None
}

fn canonical_error(lower: &str) -> Option<CanonicalError> {
    if lower.contains("host key verification failed") {
        Some(CanonicalError::HostKeyVerificationFailed)
    } else if lower.contains("connection refused") {
        Some(CanonicalError::ConnectionRefused)
    } else if lower.contains("timed out") {
        Some(CanonicalError::TimedOut)
    } else if lower.contains("no route to host") {
        Some(CanonicalError::NoRoute)
    } else if lower.contains("could not resolve hostname")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
    {
        Some(CanonicalError::NameResolution)
    } else if lower.contains("permission denied") {
        Some(CanonicalError::PermissionDenied)
    } else if lower.contains("connection closed")
        || lower.contains("connection reset")
        || lower.contains("connection lost")
    {
        Some(CanonicalError::ConnectionClosed)
    } else {
        None
    }
}

/// Remove CSI / OSC / single-character escape sequences.
pub fn strip_ansi(text: &str) -> String {
    if !text.contains('\x1b') {
        return text.to_string();
    }
    ANSI_RE.replace_all(text, "").into_owned()
}

// ─── Progress lines ──────────────────────────────────────────────────

/// A progress sample, only for the live line: a chunk containing `\r`
/// that does not end in a newline. The last `\r` segment wins.
pub fn parse_progress(chunk: &str) -> Option<ProgressSample> {
    if !chunk.contains('\r') || chunk.ends_with('\n') {
        return None;
    }
    let last = chunk.rsplit('\r').next()?;
    let caps = PROGRESS_RE.captures(last.trim_start())?;

    let percent = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<u16>().ok())
        .map(|p| p.min(100) as u8);

    Some(ProgressSample {
        filename: caps.get(1)?.as_str().trim().to_string(),
        percent,
        transferred: caps.get(3).and_then(|m| parse_size(m.as_str())),
        speed: caps.get(4).map(|m| m.as_str().to_string()),
        eta: caps.get(5).map(|m| m.as_str().to_string()),
    })
}

/// "512", "300KB", "1.5MB" → bytes.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (num, mult) = match s.strip_suffix('B') {
        Some(rest) => {
            let mult: u64 = match rest.chars().last() {
                Some('K') => 1 << 10,
                Some('M') => 1 << 20,
                Some('G') => 1 << 30,
                Some('T') => 1 << 40,
                Some('P') => 1 << 50,
                Some('E') => 1 << 60,
                _ => return rest.parse::<u64>().ok(),
            };
            (&rest[..rest.len() - 1], mult)
        }
        None => (s, 1),
    };
    let value: f64 = num.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    Some((value * mult as f64) as u64)
}

// ─── Listings ────────────────────────────────────────────────────────

/// Parse one `ls -l` row as sftp prints it.
///
/// `ls -l some/dir` prints `some/dir/name`, so the name is reduced to its
/// basename.
pub fn parse_listing_row(line: &str) -> Option<RemoteEntry> {
    let caps = LISTING_RE.captures(line.trim())?;

    let perms = caps.get(1)?.as_str();
    let size = caps.get(5)?.as_str().parse::<u64>().unwrap_or(0);
    let name_raw = caps.get(7)?.as_str();

    let kind = match perms.as_bytes().first() {
        Some(b'd') => EntryKind::Directory,
        Some(b'l') => EntryKind::Symlink,
        Some(b'-') => EntryKind::File,
        _ => EntryKind::Unknown,
    };

    let (name, link_target) = match (kind, name_raw.find(" -> ")) {
        (EntryKind::Symlink, Some(pos)) => (
            &name_raw[..pos],
            Some(name_raw[pos + 4..].to_string()),
        ),
        _ => (name_raw, None),
    };

    Some(RemoteEntry {
        name: basename(name).to_string(),
        kind,
        size,
        modified: caps.get(6).map(|m| m.as_str().to_string()),
        permissions: perms.to_string(),
        owner: caps.get(3)?.as_str().to_string(),
        group: caps.get(4)?.as_str().to_string(),
        link_target,
    })
}

/// Parse a whole listing body, skipping `.`/`..` and non-row lines.
pub fn parse_listing(raw: &str) -> Vec<RemoteEntry> {
    raw.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .filter_map(parse_listing_row)
        .filter(|e| e.name != "." && e.name != "..")
        .collect()
}

// ─── Command errors ──────────────────────────────────────────────────

/// First line of command output that sftp uses to report a failure.
pub fn command_error(output: &str) -> Option<String> {
    output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .filter(|l| !LISTING_RE.is_match(l))
        .find(|l| {
            l.starts_with("Couldn't ")
                || l.starts_with("Can't ")
                || l.starts_with("Cannot ")
                || l.starts_with("Invalid command")
                || l.contains(": No such file or directory")
                || l.contains("Permission denied")
                || l.ends_with(": Failure")
                || l.ends_with(" not found.")
                || l.ends_with(" not found")
        })
        .map(|l| l.to_string())
}

/// Whether a command error line means the path is missing.
pub fn is_not_found(line: &str) -> bool {
    line.contains("No such file") || line.contains("not found")
}
