//! Remote operations built from one or a few `execute` calls.
//!
//! Every path is quoted through [`quote_path`], or [`quote_glob`] where sftp
//! expands the argument as a pattern, and every response is checked for
//! sftp's error lines, so callers get typed failures instead of text.

use log::debug;

use crate::sftp_pty::classifier::{command_error, is_not_found, parse_listing};
use crate::sftp_pty::error::{SftpError, SftpErrorKind, SftpResult};
use crate::sftp_pty::escape::{quote_glob, quote_path};
use crate::sftp_pty::session::SftpSession;
use crate::sftp_pty::types::*;

/// Turn an sftp error line in `output` into a typed error.
fn check(output: String, kind: SftpErrorKind) -> SftpResult<String> {
    match command_error(&output) {
        Some(line) if is_not_found(&line) => Err(SftpError::not_found(line)),
        Some(line) => Err(SftpError::new(kind, line)),
        None => Ok(output),
    }
}

impl SftpSession {
    async fn run(&self, command: String, kind: SftpErrorKind) -> SftpResult<String> {
        let output = self.execute(&command).await?;
        check(output, kind).map_err(|e| e.with_session(self.id()))
    }

    // ─── Navigation ──────────────────────────────────────────────

    pub async fn pwd(&self) -> SftpResult<String> {
        let out = self.run("pwd".into(), SftpErrorKind::CommandFailed).await?;
        out.lines()
            .find_map(|l| l.trim().strip_prefix("Remote working directory:"))
            .map(|p| p.trim().to_string())
            .ok_or_else(|| SftpError::command_failed(format!("unexpected pwd output: {}", out)))
    }

    pub async fn cd(&self, path: &str) -> SftpResult<()> {
        self.run(format!("cd {}", quote_path(path)?), SftpErrorKind::CommandFailed)
            .await
            .map(|_| ())
    }

    // ─── Listing ─────────────────────────────────────────────────

    /// Entries of a remote directory, without `.` and `..`.
    pub async fn list(&self, path: &str) -> SftpResult<Vec<RemoteEntry>> {
        let out = self
            .run(format!("ls -la {}", quote_glob(path)?), SftpErrorKind::CommandFailed)
            .await?;
        Ok(parse_listing(&out))
    }

    /// A single entry, looked up in its parent's listing.
    pub async fn stat(&self, path: &str) -> SftpResult<RemoteEntry> {
        let name = basename(path);
        let parent = match parent_dir(path) {
            "" => ".",
            p => p,
        };
        if name == "/" || name.is_empty() {
            return Ok(RemoteEntry {
                name: "/".into(),
                kind: EntryKind::Directory,
                size: 0,
                modified: None,
                permissions: "drwxr-xr-x".into(),
                owner: String::new(),
                group: String::new(),
                link_target: None,
            });
        }
        self.list(parent)
            .await?
            .into_iter()
            .find(|e| e.name == name)
            .ok_or_else(|| SftpError::not_found(format!("{} not found", path)).with_session(self.id()))
    }

    pub async fn exists(&self, path: &str) -> SftpResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == SftpErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ─── Directories ─────────────────────────────────────────────

    pub async fn mkdir(&self, path: &str) -> SftpResult<()> {
        self.run(format!("mkdir {}", quote_path(path)?), SftpErrorKind::CommandFailed)
            .await
            .map(|_| ())
    }

    /// Create `path` and any missing parents. sftp has no `mkdir -p`, so each
    /// segment is attempted and the result is verified at the end.
    pub async fn mkdir_all(&self, path: &str) -> SftpResult<()> {
        if let Ok(entry) = self.stat(path).await {
            if entry.is_dir() {
                return Ok(());
            }
        }

        let mut current = String::new();
        if path.starts_with('/') {
            current.push('/');
        }
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = join_path(&current, component);
            // Existing segments fail with "Failure"; only the final check counts.
            if let Err(e) = self.mkdir(&current).await {
                if e.is_fatal_to_session() {
                    return Err(e);
                }
            }
        }

        match self.stat(path).await {
            Ok(entry) if entry.is_dir() => Ok(()),
            Ok(_) => Err(SftpError::command_failed(format!("{} exists and is not a directory", path))),
            Err(e) => Err(SftpError::command_failed(format!("could not create {}: {}", path, e.message))),
        }
    }

    pub async fn remove_dir(&self, path: &str) -> SftpResult<()> {
        self.run(format!("rmdir {}", quote_path(path)?), SftpErrorKind::CommandFailed)
            .await
            .map(|_| ())
    }

    /// Depth-first delete of a directory tree. Files go as they are found;
    /// directories are removed deepest first once emptied.
    pub async fn remove_recursive(&self, path: &str) -> SftpResult<()> {
        let mut pending = vec![path.to_string()];
        let mut dirs: Vec<String> = Vec::new();

        while let Some(dir) = pending.pop() {
            for entry in self.list(&dir).await? {
                let child = join_path(&dir, &entry.name);
                if entry.is_dir() {
                    pending.push(child);
                } else {
                    self.remove_file(&child).await?;
                }
            }
            dirs.push(dir);
        }

        for dir in dirs.iter().rev() {
            self.remove_dir(dir).await?;
        }
        debug!("Removed remote tree {}", path);
        Ok(())
    }

    /// Remove a file or a whole directory tree.
    pub async fn remove_path(&self, path: &str) -> SftpResult<()> {
        if self.stat(path).await?.is_dir() {
            self.remove_recursive(path).await
        } else {
            self.remove_file(path).await
        }
    }

    // ─── Files ───────────────────────────────────────────────────

    pub async fn remove_file(&self, path: &str) -> SftpResult<()> {
        self.run(format!("rm {}", quote_glob(path)?), SftpErrorKind::CommandFailed)
            .await
            .map(|_| ())
    }

    pub async fn rename(&self, from: &str, to: &str) -> SftpResult<()> {
        let cmd = format!("rename {} {}", quote_path(from)?, quote_path(to)?);
        self.run(cmd, SftpErrorKind::CommandFailed).await.map(|_| ())
    }

    /// `put` a local file to the full remote path `remote`.
    pub async fn upload(&self, local: &str, remote: &str) -> SftpResult<()> {
        let cmd = format!("put {} {}", quote_glob(local)?, quote_path(remote)?);
        self.run(cmd, SftpErrorKind::TransferFailed).await.map(|_| ())
    }

    /// `get` a remote file to the full local path `local`.
    pub async fn download(&self, remote: &str, local: &str) -> SftpResult<()> {
        let cmd = format!("get {} {}", quote_glob(remote)?, quote_path(local)?);
        self.run(cmd, SftpErrorKind::TransferFailed).await.map(|_| ())
    }
}
