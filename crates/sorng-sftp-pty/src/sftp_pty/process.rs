//! Process layer: how an `sftp` child is started behind a pseudo-terminal.
//!
//! The session only sees a byte reader, a byte writer and a kill handle,
//! so tests can substitute a scripted fake for the real binary.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::sftp_pty::error::{SftpError, SftpResult};
use crate::sftp_pty::types::SftpConnectionConfig;

/// Environment variables inherited from the parent; everything else is
/// dropped so prompts and messages stay in the C locale.
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "USER", "SSH_AUTH_SOCK"];

/// What to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cols: u16,
    pub rows: u16,
}

impl SpawnSpec {
    pub fn for_connection(config: &SftpConnectionConfig) -> Self {
        let mut env: Vec<(String, String)> = vec![
            ("LANG".into(), "C".into()),
            ("LC_ALL".into(), "C".into()),
            ("TERM".into(), "dumb".into()),
        ];
        for key in INHERITED_ENV {
            if let Ok(val) = std::env::var(key) {
                env.push((key.to_string(), val));
            }
        }

        Self {
            program: config.binary_path.clone(),
            args: build_args(config),
            env,
            cols: config.terminal_cols.max(80),
            rows: config.terminal_rows.max(24),
        }
    }
}

/// Command-line arguments for `sftp`.
pub fn build_args(config: &SftpConnectionConfig) -> Vec<String> {
    let mut args = vec!["-P".to_string(), config.port.to_string()];

    if let Some(ref key) = config.identity_file {
        args.push("-i".into());
        args.push(key.clone());
    }

    args.push("-o".into());
    args.push("ServerAliveInterval=15".into());
    args.push("-o".into());
    args.push("ServerAliveCountMax=3".into());

    for opt in &config.extra_options {
        args.push("-o".into());
        args.push(opt.clone());
    }

    args.push(config.destination());
    args
}

/// Forcible termination of a spawned process. Must be idempotent.
pub trait ProcessKiller: Send + Sync {
    fn kill(&self);
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A running child: its terminal output, its terminal input, and a kill switch.
pub struct SpawnedProcess {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub killer: Arc<dyn ProcessKiller>,
    pub pid: Option<u32>,
}

#[async_trait]
pub trait ProcessSpawner: Send + Sync {
    async fn spawn(&self, spec: &SpawnSpec) -> SftpResult<SpawnedProcess>;
}

// ─── Pseudo-terminal implementation ─────────────────────────────────

/// Launches the real binary on a fresh pty.
#[derive(Debug, Default, Clone)]
pub struct PtySpawner;

impl PtySpawner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSpawner for PtySpawner {
    async fn spawn(&self, spec: &SpawnSpec) -> SftpResult<SpawnedProcess> {
        debug!("Spawning {} {}", spec.program, spec.args.join(" "));

        let pty = pty_process::Pty::new()
            .map_err(|e| SftpError::connection_failed(format!("Failed to open pty: {}", e)))?;
        pty.resize(pty_process::Size::new(spec.rows, spec.cols))
            .map_err(|e| SftpError::connection_failed(format!("Failed to size pty: {}", e)))?;
        let pts = pty
            .pts()
            .map_err(|e| SftpError::connection_failed(format!("Failed to open pts: {}", e)))?;

        let mut cmd = pty_process::Command::new(&spec.program);
        cmd.args(&spec.args).env_clear();
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }

        let child = cmd.spawn(&pts).map_err(|e| {
            SftpError::connection_failed(format!("Failed to spawn '{}': {}", spec.program, e))
        })?;
        let pid = child.id();
        let killer = Arc::new(ChildKiller::watch(child));

        let (reader, writer) = pty.into_split();
        Ok(SpawnedProcess {
            reader: Box::new(reader),
            writer: Box::new(writer),
            killer,
            pid,
        })
    }
}

/// Owns the child in a background task that reaps it on exit or on kill.
struct ChildKiller {
    tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl ChildKiller {
    fn watch(mut child: tokio::process::Child) -> Self {
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!("sftp process exited: {:?}", status);
                }
                _ = rx => {
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill sftp process: {}", e);
                    }
                    let _ = child.wait().await;
                }
            }
        });
        Self {
            tx: StdMutex::new(Some(tx)),
        }
    }
}

impl ProcessKiller for ChildKiller {
    fn kill(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(());
            }
        }
    }
}
