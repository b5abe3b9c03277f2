//! # sorng-sftp-pty: SFTP transfers over the OpenSSH `sftp` client
//!
//! Drives `sftp` interactively on a pseudo-terminal instead of speaking the
//! SFTP wire protocol, so the user's ssh config, agent and known_hosts apply
//! unchanged.
//!
//! Architecture:
//! - `types`: config, listing entries, progress samples, events, path helpers
//! - `error`: SFTP-specific error type
//! - `classifier`: ANSI stripping, prompt / error / progress / `ls -l` parsing
//! - `framing`: `!echo` sentinel framing of command responses
//! - `escape`: quoting of paths for the sftp command line
//! - `process`: spawning `sftp` on a pty behind the `ProcessSpawner` seam
//! - `session`: one `sftp` process: connect, serialized `execute`, abort
//! - `remote_ops`: pwd / cd / ls / stat / mkdir -p / rm -r / put / get
//! - `transfer_item`: per-transfer status, folder byte accounting, ETA
//! - `decompose`: file and directory trees into per-file work
//! - `pool`: bounded session pool
//! - `manager`: queue, scheduling, cancel / cleanup, retry, events

pub mod types;
pub mod error;
pub mod classifier;
pub mod framing;
pub mod escape;
pub mod process;
pub mod session;
pub mod remote_ops;
pub mod transfer_item;
pub mod decompose;
pub mod pool;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for lib.rs consumers
pub use types::*;
pub use error::{SftpError, SftpErrorKind, SftpResult};
pub use process::{ProcessSpawner, PtySpawner, SpawnSpec, SpawnedProcess};
pub use session::{
    ChannelHostKeyVerifier, HostKeyDecision, HostKeyRequest, HostKeyVerifier, RejectUnknownHosts,
    SftpSession,
};
pub use transfer_item::TransferItem;
pub use manager::TransferManager;
