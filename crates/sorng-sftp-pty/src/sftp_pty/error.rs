//! Error type for the pty-driven SFTP engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Categorised SFTP error.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("[SFTP {kind:?}] {message}")]
pub struct SftpError {
    pub kind: SftpErrorKind,
    pub message: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SftpErrorKind {
    /// Spawn failure or a canonical connection error printed by ssh.
    ConnectionFailed,
    /// No prompt within the connect timeout.
    Timeout,
    /// The sftp process exited while commands were pending.
    ConnectionClosed,
    /// Server asked for a password or key passphrase.
    AuthUnsupported,
    /// The host key was rejected by the caller.
    HostKeyRejected,
    /// An argument could not be expressed on the sftp command line.
    ProtocolError,
    /// sftp printed an error line for a command.
    CommandFailed,
    /// Remote or local path does not exist.
    NotFound,
    /// Host, user or port failed validation.
    Validation,
    /// Operation not allowed in the current state.
    InvalidState,
    /// A single file transfer failed.
    TransferFailed,
    /// Cleanup after cancellation could not delete something.
    CleanupFailed,
    /// Operation cancelled.
    Cancelled,
    /// Local I/O error.
    Io,
}

pub type SftpResult<T> = Result<T, SftpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SftpError {
    pub fn new(kind: SftpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::ConnectionFailed, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Timeout, msg)
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::ConnectionClosed, msg)
    }

    pub fn auth_unsupported(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::AuthUnsupported, msg)
    }

    pub fn host_key_rejected(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::HostKeyRejected, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::ProtocolError, msg)
    }

    pub fn command_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::CommandFailed, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::NotFound, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Validation, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::InvalidState, msg)
    }

    pub fn cleanup_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::CleanupFailed, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Cancelled, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Io, msg)
    }

    /// Errors after which the session must not be reused.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self.kind,
            SftpErrorKind::ConnectionFailed
                | SftpErrorKind::ConnectionClosed
                | SftpErrorKind::Timeout
                | SftpErrorKind::AuthUnsupported
                | SftpErrorKind::HostKeyRejected
                | SftpErrorKind::Cancelled
        )
    }
}

impl From<std::io::Error> for SftpError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(e.to_string()),
            _ => Self::io(e.to_string()),
        }
    }
}
