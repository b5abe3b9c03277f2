//! One interactive `sftp` process and the request/response channel on top
//! of it.
//!
//! Lifecycle: `Disconnected → Connecting → Connected → Disconnected`.
//! Once a session drops back to `Disconnected` it stays there until someone
//! calls [`SftpSession::connect`] again.
//!
//! After the first prompt the process is owned by a driver task. The driver
//! takes commands from a FIFO one at a time, frames each with a sentinel,
//! and routes live progress lines to the current listener. When the process
//! goes away every queued and in-flight command is rejected.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::sftp_pty::classifier::{classify, OutputEvent};
use crate::sftp_pty::error::{SftpError, SftpResult};
use crate::sftp_pty::framing::SentinelFramer;
use crate::sftp_pty::process::{
    BoxedReader, BoxedWriter, ProcessKiller, ProcessSpawner, SpawnSpec,
};
use crate::sftp_pty::types::{ProgressSample, SessionState, SftpConnectionConfig};

const READ_CHUNK: usize = 8192;

// ─── Host key confirmation ───────────────────────────────────────────

/// An unknown host key that needs a yes/no from the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyRequest {
    pub session_id: String,
    pub host: String,
    pub port: u16,
    pub fingerprint: Option<String>,
    /// The prompt text as ssh printed it.
    pub message: String,
}

/// Decides whether an unknown host key is trusted. `connect` stays pending
/// (with its timeout paused) until this returns.
#[async_trait]
pub trait HostKeyVerifier: Send + Sync {
    async fn verify(&self, request: &HostKeyRequest) -> bool;
}

/// Refuses every unknown host key.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectUnknownHosts;

#[async_trait]
impl HostKeyVerifier for RejectUnknownHosts {
    async fn verify(&self, request: &HostKeyRequest) -> bool {
        warn!(
            "Rejecting unknown host key for {}:{} ({})",
            request.host,
            request.port,
            request.fingerprint.as_deref().unwrap_or("no fingerprint")
        );
        false
    }
}

pub type HostKeyDecision = (HostKeyRequest, oneshot::Sender<bool>);

/// Forwards each request to a receiver (typically the UI bridge) and waits
/// for its answer. A dropped responder counts as a rejection.
#[derive(Debug, Clone)]
pub struct ChannelHostKeyVerifier {
    tx: mpsc::UnboundedSender<HostKeyDecision>,
}

impl ChannelHostKeyVerifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostKeyDecision>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl HostKeyVerifier for ChannelHostKeyVerifier {
    async fn verify(&self, request: &HostKeyRequest) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.tx.send((request.clone(), reply_tx)).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}

// ─── Session ─────────────────────────────────────────────────────────

struct QueuedCommand {
    command: String,
    sentinel: String,
    reply: oneshot::Sender<SftpResult<String>>,
}

enum DriverMsg {
    Execute(QueuedCommand),
    Quit,
}

struct Shared {
    state: SessionState,
    /// Bumped on every connect so a stale driver never tears down a newer one.
    generation: u64,
    cmd_tx: Option<mpsc::UnboundedSender<DriverMsg>>,
    killer: Option<Arc<dyn ProcessKiller>>,
    connect_cancel: Option<oneshot::Sender<()>>,
    stop: Option<Arc<Notify>>,
    progress: Option<mpsc::UnboundedSender<ProgressSample>>,
}

pub struct SftpSession {
    id: String,
    config: SftpConnectionConfig,
    spawner: Arc<dyn ProcessSpawner>,
    shared: Arc<StdMutex<Shared>>,
}

impl std::fmt::Debug for SftpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSession")
            .field("id", &self.id)
            .field("host", &self.config.host)
            .field("state", &self.state())
            .finish()
    }
}

fn lock_shared(shared: &StdMutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|e| e.into_inner())
}

impl SftpSession {
    pub fn new(config: SftpConnectionConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            spawner,
            shared: Arc::new(StdMutex::new(Shared {
                state: SessionState::Disconnected,
                generation: 0,
                cmd_tx: None,
                killer: None,
                connect_cancel: None,
                stop: None,
                progress: None,
            })),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SftpConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        lock_shared(&self.shared).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Route live progress lines to `listener` (or nowhere).
    pub fn set_progress_listener(&self, listener: Option<mpsc::UnboundedSender<ProgressSample>>) {
        lock_shared(&self.shared).progress = listener;
    }

    /// Start the process and wait for the first `sftp>` prompt.
    pub async fn connect(&self, verifier: &dyn HostKeyVerifier) -> SftpResult<()> {
        self.config.validate()?;

        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let generation = {
            let mut sh = lock_shared(&self.shared);
            if sh.state != SessionState::Disconnected {
                return Err(SftpError::invalid_state(format!(
                    "connect called while {:?}",
                    sh.state
                ))
                .with_session(&self.id));
            }
            sh.state = SessionState::Connecting;
            sh.generation += 1;
            sh.connect_cancel = Some(cancel_tx);
            sh.generation
        };

        info!(
            "SFTP session {} connecting to {}:{}",
            self.id, self.config.host, self.config.port
        );

        let spec = SpawnSpec::for_connection(&self.config);
        let process = match self.spawner.spawn(&spec).await {
            Ok(p) => p,
            Err(e) => {
                self.fail_connect(generation, None);
                return Err(e.with_session(&self.id));
            }
        };
        match process.pid {
            Some(pid) => debug!("SFTP session {} spawned sftp pid {}", self.id, pid),
            None => debug!("SFTP session {} spawned sftp", self.id),
        }
        lock_shared(&self.shared).killer = Some(process.killer.clone());

        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(read_loop(process.reader, chunk_tx));
        let mut writer = process.writer;
        let killer = process.killer;

        let timeout = Duration::from_secs(self.config.connect_timeout_sec.max(1));
        let mut deadline = Instant::now() + timeout;
        let mut buf: Vec<u8> = Vec::new();

        let outcome: SftpResult<()> = loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    break Err(SftpError::cancelled("connect aborted"));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    break Err(SftpError::timeout(format!(
                        "no sftp prompt from {} within {}s",
                        self.config.host,
                        timeout.as_secs()
                    )));
                }
                chunk = chunk_rx.recv() => {
                    let Some(bytes) = chunk else {
                        break Err(SftpError::connection_closed(format!(
                            "sftp exited before the prompt: {}",
                            last_line(&buf)
                        )));
                    };
                    buf.extend_from_slice(&bytes);
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    match classify(&text) {
                        Some(OutputEvent::Ready) => break Ok(()),
                        Some(OutputEvent::AuthPrompt) => {
                            break Err(SftpError::auth_unsupported(
                                "server requested a password or key passphrase; only key/agent authentication is supported",
                            ));
                        }
                        Some(OutputEvent::ConnectionError(kind)) => {
                            break Err(SftpError::connection_failed(format!(
                                "{}: {}",
                                kind.describe(),
                                last_line(&buf)
                            )));
                        }
                        Some(OutputEvent::HostKeyPrompt { fingerprint, message }) => {
                            let request = HostKeyRequest {
                                session_id: self.id.clone(),
                                host: self.config.host.clone(),
                                port: self.config.port,
                                fingerprint,
                                message,
                            };
                            let accepted = tokio::select! {
                                _ = &mut cancel_rx => {
                                    break Err(SftpError::cancelled("connect aborted"));
                                }
                                accepted = verifier.verify(&request) => accepted,
                            };
                            let answer: &[u8] = if accepted { b"yes\n" } else { b"no\n" };
                            let _ = writer.write_all(answer).await;
                            let _ = writer.flush().await;
                            if !accepted {
                                break Err(SftpError::host_key_rejected(format!(
                                    "host key for {} was not accepted",
                                    self.config.host
                                )));
                            }
                            buf.clear();
                            deadline = Instant::now() + timeout;
                        }
                        _ => {}
                    }
                }
            }
        };

        if let Err(e) = outcome {
            warn!("SFTP session {} connect failed: {}", self.id, e);
            killer.kill();
            self.fail_connect(generation, Some(&killer));
            return Err(e.with_session(&self.id));
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        {
            let mut sh = lock_shared(&self.shared);
            if sh.generation != generation || sh.state != SessionState::Connecting {
                drop(sh);
                killer.kill();
                return Err(SftpError::cancelled("connect aborted").with_session(&self.id));
            }
            sh.state = SessionState::Connected;
            sh.cmd_tx = Some(cmd_tx);
            sh.connect_cancel = None;
            sh.stop = Some(stop.clone());
        }

        info!("SFTP session {} connected to {}", self.id, self.config.host);
        tokio::spawn(drive(Driver {
            session_id: self.id.clone(),
            generation,
            shared: self.shared.clone(),
            writer,
            chunk_rx,
            cmd_rx,
            stop,
            killer,
        }));
        Ok(())
    }

    fn fail_connect(&self, generation: u64, killer: Option<&Arc<dyn ProcessKiller>>) {
        let mut sh = lock_shared(&self.shared);
        if sh.generation == generation {
            sh.state = SessionState::Disconnected;
            sh.connect_cancel = None;
            sh.killer = None;
        }
        drop(sh);
        if let Some(k) = killer {
            k.kill();
        }
    }

    /// Queue `command` and wait for its cleaned output.
    pub async fn execute(&self, command: &str) -> SftpResult<String> {
        if command.chars().any(|c| c.is_control()) {
            return Err(SftpError::protocol("command contains control characters")
                .with_session(&self.id));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let sh = lock_shared(&self.shared);
            let tx = match (sh.state, sh.cmd_tx.as_ref()) {
                (SessionState::Connected, Some(tx)) => tx,
                (state, _) => {
                    return Err(SftpError::invalid_state(format!(
                        "execute called while {:?}",
                        state
                    ))
                    .with_session(&self.id));
                }
            };
            let queued = QueuedCommand {
                command: command.to_string(),
                sentinel: format!("__SORNG_DONE_{}__", Uuid::new_v4().simple()),
                reply: reply_tx,
            };
            if tx.send(DriverMsg::Execute(queued)).is_err() {
                return Err(SftpError::connection_closed("sftp process is gone")
                    .with_session(&self.id));
            }
        }

        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(SftpError::connection_closed("sftp process is gone").with_session(&self.id)),
        }
    }

    /// Kill the process now. Pending commands are rejected.
    pub fn abort(&self) {
        let (cancel, stop, killer) = {
            let mut sh = lock_shared(&self.shared);
            sh.state = SessionState::Disconnected;
            sh.cmd_tx = None;
            sh.progress = None;
            (sh.connect_cancel.take(), sh.stop.take(), sh.killer.take())
        };
        debug!("SFTP session {} aborted", self.id);
        if let Some(tx) = cancel {
            let _ = tx.send(());
        }
        if let Some(stop) = stop {
            stop.notify_one();
        }
        if let Some(k) = killer {
            k.kill();
        }
    }

    /// Send `bye` after whatever is queued, then kill the process.
    pub fn disconnect(&self) {
        let tx = {
            let mut sh = lock_shared(&self.shared);
            match sh.state {
                SessionState::Connected => {
                    sh.state = SessionState::Disconnected;
                    sh.progress = None;
                    sh.cmd_tx.take()
                }
                SessionState::Connecting => None,
                SessionState::Disconnected => return,
            }
        };
        match tx {
            Some(tx) if tx.send(DriverMsg::Quit).is_ok() => {
                debug!("SFTP session {} disconnecting", self.id);
            }
            _ => self.abort(),
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        if let Some(k) = lock_shared(&self.shared).killer.take() {
            k.kill();
        }
    }
}

// ─── Background tasks ────────────────────────────────────────────────

async fn read_loop(mut reader: BoxedReader, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            // EIO once the child side of the pty closes.
            Err(e) => {
                trace!("sftp read ended: {}", e);
                break;
            }
        }
    }
}

struct Driver {
    session_id: String,
    generation: u64,
    shared: Arc<StdMutex<Shared>>,
    writer: BoxedWriter,
    chunk_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cmd_rx: mpsc::UnboundedReceiver<DriverMsg>,
    stop: Arc<Notify>,
    killer: Arc<dyn ProcessKiller>,
}

async fn drive(mut d: Driver) {
    let mut framer = SentinelFramer::new();
    let mut in_flight: Option<oneshot::Sender<SftpResult<String>>> = None;

    let reason = loop {
        tokio::select! {
            _ = d.stop.notified() => break "aborted",
            msg = d.cmd_rx.recv(), if in_flight.is_none() => match msg {
                Some(DriverMsg::Execute(cmd)) => {
                    trace!(">>> [{}] {}", d.session_id, cmd.command);
                    framer.begin(&cmd.command, &cmd.sentinel);
                    let line = format!("{}\n!echo {}\n", cmd.command, cmd.sentinel);
                    let written = match d.writer.write_all(line.as_bytes()).await {
                        Ok(()) => d.writer.flush().await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = written {
                        let _ = cmd.reply.send(Err(SftpError::connection_closed(format!(
                            "write to sftp failed: {}",
                            e
                        ))
                        .with_session(&d.session_id)));
                        break "write failed";
                    }
                    in_flight = Some(cmd.reply);
                }
                Some(DriverMsg::Quit) => {
                    let _ = d.writer.write_all(b"bye\n").await;
                    let _ = d.writer.flush().await;
                    break "disconnected";
                }
                None => break "dropped",
            },
            chunk = d.chunk_rx.recv() => match chunk {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    trace!("<<< [{}] {:?}", d.session_id, text);
                    if let Some(OutputEvent::Progress(sample)) = classify(&text) {
                        let listener = lock_shared(&d.shared).progress.clone();
                        if let Some(tx) = listener {
                            let _ = tx.send(sample);
                        }
                    }
                    if let Some(output) = framer.push(&bytes) {
                        if let Some(reply) = in_flight.take() {
                            let _ = reply.send(Ok(output));
                        }
                    }
                }
                None => break "process exited",
            },
        }
    };

    debug!("SFTP session {} driver stopped: {}", d.session_id, reason);
    d.killer.kill();
    {
        let mut sh = lock_shared(&d.shared);
        if sh.generation == d.generation {
            sh.state = SessionState::Disconnected;
            sh.cmd_tx = None;
            sh.stop = None;
            sh.killer = None;
        }
    }

    let closed = || {
        SftpError::connection_closed(format!("sftp session ended ({})", reason))
            .with_session(&d.session_id)
    };
    if let Some(reply) = in_flight.take() {
        let _ = reply.send(Err(closed()));
    }
    d.cmd_rx.close();
    while let Ok(msg) = d.cmd_rx.try_recv() {
        if let DriverMsg::Execute(cmd) = msg {
            let _ = cmd.reply.send(Err(closed()));
        }
    }
}

fn last_line(buf: &[u8]) -> String {
    let text = String::from_utf8_lossy(buf);
    text.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .last()
        .unwrap_or("")
        .to_string()
}
