//! Shared types for the pty-driven SFTP crate.

use serde::{Deserialize, Serialize};

use crate::sftp_pty::error::{SftpError, SftpResult};
use crate::sftp_pty::transfer_item::TransferItem;

// ─── Connection / Session ────────────────────────────────────────────

/// Configuration for one `sftp` process.
///
/// Produced by host discovery (ssh config / saved connections); the engine
/// only validates and consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Private key passed to `sftp -i`. Agent / default keys are used when unset.
    #[serde(default)]
    pub identity_file: Option<String>,
    /// Path to the `sftp` binary.
    #[serde(default = "default_binary")]
    pub binary_path: String,
    /// Seconds to wait for the first `sftp>` prompt.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    /// Virtual terminal width. Wide enough that listings never wrap.
    #[serde(default = "default_cols")]
    pub terminal_cols: u16,
    #[serde(default = "default_rows")]
    pub terminal_rows: u16,
    /// Extra `-o Key=Value` options handed to ssh.
    #[serde(default)]
    pub extra_options: Vec<String>,
    /// Friendly label shown in the UI.
    #[serde(default)]
    pub label: Option<String>,
}

fn default_port() -> u16 {
    22
}
fn default_binary() -> String {
    "sftp".into()
}
fn default_connect_timeout() -> u64 {
    20
}
fn default_cols() -> u16 {
    1000
}
fn default_rows() -> u16 {
    50
}

impl Default for SftpConnectionConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            identity_file: None,
            binary_path: default_binary(),
            connect_timeout_sec: default_connect_timeout(),
            terminal_cols: default_cols(),
            terminal_rows: default_rows(),
            extra_options: Vec::new(),
            label: None,
        }
    }
}

impl SftpConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Reject anything that could be read by ssh as an option or a shell
    /// metacharacter. Runs before a process is spawned.
    pub fn validate(&self) -> SftpResult<()> {
        if self.host.is_empty() {
            return Err(SftpError::validation("host must not be empty"));
        }
        if self.host.starts_with('-') {
            return Err(SftpError::validation(format!(
                "invalid host '{}'",
                self.host
            )));
        }
        let host_ok = self
            .host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '[' | ']'));
        if !host_ok {
            return Err(SftpError::validation(format!(
                "invalid host '{}'",
                self.host
            )));
        }

        if self.username.is_empty() || self.username.starts_with('-') {
            return Err(SftpError::validation(format!(
                "invalid username '{}'",
                self.username
            )));
        }
        let user_ok = self
            .username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !user_ok {
            return Err(SftpError::validation(format!(
                "invalid username '{}'",
                self.username
            )));
        }

        if self.port == 0 {
            return Err(SftpError::validation("port must be between 1 and 65535"));
        }
        if self.binary_path.trim().is_empty() {
            return Err(SftpError::validation("sftp binary path is empty"));
        }
        Ok(())
    }

    /// `user@host`, bracketing bare IPv6 literals.
    pub fn destination(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}@[{}]", self.username, self.host)
        } else {
            format!("{}@{}", self.username, self.host)
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

// ─── Directory listing ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

/// A parsed `ls -l` row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    /// Timestamp column as printed ("Jan  1 12:00" / "Jan  1  2025").
    pub modified: Option<String>,
    pub permissions: String,
    pub owner: String,
    pub group: String,
    pub link_target: Option<String>,
}

impl RemoteEntry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

// ─── Progress ────────────────────────────────────────────────────────

/// One live progress line from `put`/`get`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub filename: String,
    pub percent: Option<u8>,
    /// Bytes parsed from the size column ("1.2MB", "512KB", "17").
    pub transferred: Option<u64>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

// ─── Transfers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferDirection {
    Upload,
    Download,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferStatus {
    Queued,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// A file that failed inside a folder transfer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedFile {
    pub name: String,
    pub error: String,
    pub source: String,
    /// Destination directory the file was headed to.
    pub dest: String,
    #[serde(default)]
    pub size: u64,
}

/// What `cancel` deletes for a folder transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CancelCleanup {
    /// Only files that were in flight at cancellation.
    RemovePartial,
    /// The whole destination directory.
    RemoveAll,
}

impl Default for CancelCleanup {
    fn default() -> Self {
        Self::RemovePartial
    }
}

/// One file-sized unit of work executed on one session.
#[derive(Debug, Clone, PartialEq)]
pub struct FileWork {
    pub transfer_id: String,
    pub source: String,
    pub dest_dir: String,
    pub direction: TransferDirection,
    pub size: u64,
    /// Basename of `source`; matches what sftp prints on its progress line.
    pub name: String,
}

impl FileWork {
    /// Full destination path of this file.
    pub fn dest_path(&self) -> String {
        join_path(&self.dest_dir, &self.name)
    }
}

// ─── Pool / Manager ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferManagerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub cancel_cleanup: CancelCleanup,
    /// Pause after killing sessions before touching their files.
    #[serde(default = "default_settle_ms")]
    pub cancel_settle_ms: u64,
    /// Backoff before the single retry of a failed cleanup delete.
    #[serde(default = "default_delete_retry_ms")]
    pub delete_retry_ms: u64,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_settle_ms() -> u64 {
    500
}
fn default_delete_retry_ms() -> u64 {
    1000
}

impl Default for TransferManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            cancel_cleanup: CancelCleanup::default(),
            cancel_settle_ms: default_settle_ms(),
            delete_retry_ms: default_delete_retry_ms(),
        }
    }
}

/// Everything the manager tells its observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransferEvent {
    Queued { item: TransferItem },
    Started { item: TransferItem },
    Progress { item: TransferItem },
    Completed { item: TransferItem },
    Failed { item: TransferItem },
    Cancelled { item: TransferItem },
    PoolOccupancy { stats: PoolStats },
}

impl TransferEvent {
    /// The transfer this event concerns, if any.
    pub fn item(&self) -> Option<&TransferItem> {
        match self {
            TransferEvent::Queued { item }
            | TransferEvent::Started { item }
            | TransferEvent::Progress { item }
            | TransferEvent::Completed { item }
            | TransferEvent::Failed { item }
            | TransferEvent::Cancelled { item } => Some(item),
            TransferEvent::PoolOccupancy { .. } => None,
        }
    }
}

// ─── Path helpers ────────────────────────────────────────────────────

/// Last `/`-separated component, ignoring a trailing slash.
pub fn basename(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return path;
    }
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Everything before the last component; "" for a bare name.
pub fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => "",
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
