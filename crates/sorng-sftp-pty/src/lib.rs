//! # SortOfRemote NG – SFTP (pty)
//!
//! SFTP file transfer engine built on the system OpenSSH `sftp` client:
//!   • Interactive session driven through a pseudo-terminal
//!   • Sentinel-framed request/response over the interactive prompt
//!   • Output classification (prompts, errors, listings, progress lines)
//!   • Host-key confirmation surfaced to the caller
//!   • Recursive directory decomposition into per-file work
//!   • Bounded session pool with reuse and failure isolation
//!   • Folder progress aggregation with windowed ETA
//!   • Cancellation with partial / full destination cleanup
//!   • Retry of failed files as an independent transfer

pub mod sftp_pty;
