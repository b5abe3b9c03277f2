//! Scripted stand-in for the `sftp` binary, used by unit tests.
//!
//! Each spawned "process" is a task on the far side of an in-memory duplex
//! stream. It behaves like sftp on a pty: it echoes input lines, prints
//! `sftp> ` prompts, writes `\r`-overwritten progress lines, and performs
//! file operations against a real temporary directory acting as the remote
//! filesystem.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::{oneshot, Notify};

use crate::sftp_pty::error::SftpResult;
use crate::sftp_pty::process::{ProcessKiller, ProcessSpawner, SpawnSpec, SpawnedProcess};
use crate::sftp_pty::types::basename;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectScript {
    Ready,
    HostKey,
    Password,
    Refused,
    Silent,
}

struct RemoteInner {
    root: tempfile::TempDir,
    script: StdMutex<ConnectScript>,
    connect_delay_ms: AtomicUsize,
    failing: StdMutex<HashSet<String>>,
    hanging: StdMutex<HashSet<String>>,
    hangs: AtomicUsize,
    killed: AtomicBool,
    kills: AtomicUsize,
    alive: AtomicUsize,
    max_alive: AtomicUsize,
    log: StdMutex<Vec<String>>,
    exits: StdMutex<Vec<Arc<Notify>>>,
}

/// Shared state of every fake process: the remote filesystem plus knobs.
#[derive(Clone)]
pub struct FakeRemote {
    inner: Arc<RemoteInner>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RemoteInner {
                root: tempfile::tempdir().expect("tempdir"),
                script: StdMutex::new(ConnectScript::Ready),
                connect_delay_ms: AtomicUsize::new(0),
                failing: StdMutex::new(HashSet::new()),
                hanging: StdMutex::new(HashSet::new()),
                hangs: AtomicUsize::new(0),
                killed: AtomicBool::new(false),
                kills: AtomicUsize::new(0),
                alive: AtomicUsize::new(0),
                max_alive: AtomicUsize::new(0),
                log: StdMutex::new(Vec::new()),
                exits: StdMutex::new(Vec::new()),
            }),
        }
    }

    pub fn root(&self) -> &Path {
        self.inner.root.path()
    }

    pub fn root_str(&self) -> String {
        self.root().display().to_string()
    }

    /// Absolute remote path for a path relative to the fake root.
    pub fn remote_path(&self, rel: &str) -> String {
        self.root().join(rel).display().to_string()
    }

    pub fn write_remote_file(&self, rel: &str, data: &[u8]) {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(path, data).expect("write");
    }

    pub fn set_connect_script(&self, script: ConnectScript) {
        *self.inner.script.lock().unwrap() = script;
    }

    pub fn set_connect_delay_ms(&self, ms: usize) {
        self.inner.connect_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Transfers of files with this basename print an error.
    pub fn fail_on(&self, name: &str) {
        self.inner.failing.lock().unwrap().insert(name.to_string());
    }

    pub fn stop_failing(&self, name: &str) {
        self.inner.failing.lock().unwrap().remove(name);
    }

    /// Transfers of files with this basename write half the data, print one
    /// progress line and then never finish.
    pub fn hang_on(&self, name: &str) {
        self.inner.hanging.lock().unwrap().insert(name.to_string());
    }

    pub async fn wait_for_hangs(&self, n: usize) {
        while self.inner.hangs.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    pub fn was_killed(&self) -> bool {
        self.inner.killed.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.inner.kills.load(Ordering::SeqCst)
    }

    pub fn alive(&self) -> usize {
        self.inner.alive.load(Ordering::SeqCst)
    }

    pub fn max_alive(&self) -> usize {
        self.inner.max_alive.load(Ordering::SeqCst)
    }

    pub fn command_log(&self) -> Vec<String> {
        self.inner.log.lock().unwrap().clone()
    }

    /// Make every running fake process exit on its own.
    pub fn exit_process(&self) {
        for exit in self.inner.exits.lock().unwrap().iter() {
            exit.notify_one();
        }
    }
}

/// Spawns fake processes bound to one [`FakeRemote`].
#[derive(Clone)]
pub struct FakeSpawner {
    remote: FakeRemote,
    spawned: Arc<AtomicUsize>,
}

impl FakeSpawner {
    pub fn new(remote: FakeRemote) -> Self {
        Self {
            remote,
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

struct FakeKiller {
    remote: FakeRemote,
    tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl ProcessKiller for FakeKiller {
    fn kill(&self) {
        if let Some(tx) = self.tx.lock().unwrap().take() {
            self.remote.inner.killed.store(true, Ordering::SeqCst);
            self.remote.inner.kills.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self, _spec: &SpawnSpec) -> SftpResult<SpawnedProcess> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (kill_tx, kill_rx) = oneshot::channel();
        let exit = Arc::new(Notify::new());
        self.remote.inner.exits.lock().unwrap().push(exit.clone());

        let inner = &self.remote.inner;
        let now = inner.alive.fetch_add(1, Ordering::SeqCst) + 1;
        inner.max_alive.fetch_max(now, Ordering::SeqCst);

        let remote = self.remote.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = kill_rx => {}
                _ = exit.notified() => {}
                _ = run_fake(server, remote.clone()) => {}
            }
            remote.inner.alive.fetch_sub(1, Ordering::SeqCst);
        });

        let (reader, writer) = tokio::io::split(client);
        Ok(SpawnedProcess {
            reader: Box::new(reader),
            writer: Box::new(writer),
            killer: Arc::new(FakeKiller {
                remote: self.remote.clone(),
                tx: StdMutex::new(Some(kill_tx)),
            }),
            pid: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgState {
    Start,
    Unquoted,
    Single,
    Double,
}

/// Split a command line into arguments the way sftp's own tokenizer does.
///
/// Inside quotes a backslash only unescapes the enclosing quote character;
/// before a glob character it is doubled so that glob(3) later sees a
/// literal backslash. Outside quotes `\*`, `\?`, `\[` and `\\` are kept for
/// glob(3) and any other escaped character is taken literally.
pub fn sftp_argv(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut state = ArgState::Start;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match (state, c) {
            (ArgState::Start, c) if c.is_whitespace() => {}
            (ArgState::Unquoted, c) if c.is_whitespace() => {
                args.push(std::mem::take(&mut cur));
                state = ArgState::Start;
            }
            (ArgState::Single, '\\') | (ArgState::Double, '\\') => {
                let quote = if state == ArgState::Single { '\'' } else { '"' };
                match chars.get(i + 1).copied() {
                    Some(n) if n == quote => {
                        cur.push(n);
                        i += 1;
                    }
                    Some(n) if matches!(n, '*' | '?' | '[') => {
                        cur.push_str("\\\\\\");
                        cur.push(n);
                        i += 1;
                    }
                    Some(n) => {
                        cur.push('\\');
                        cur.push(n);
                        i += 1;
                    }
                    None => cur.push('\\'),
                }
            }
            (_, '\\') => {
                state = ArgState::Unquoted;
                match chars.get(i + 1).copied() {
                    Some(n) if matches!(n, '*' | '?' | '[' | '\\') => {
                        cur.push('\\');
                        cur.push(n);
                        i += 1;
                    }
                    Some(n) => {
                        cur.push(n);
                        i += 1;
                    }
                    None => {}
                }
            }
            (ArgState::Start, '"') | (ArgState::Unquoted, '"') => state = ArgState::Double,
            (ArgState::Start, '\'') | (ArgState::Unquoted, '\'') => state = ArgState::Single,
            (ArgState::Double, '"') | (ArgState::Single, '\'') => state = ArgState::Unquoted,
            (_, c) => {
                if state == ArgState::Start {
                    state = ArgState::Unquoted;
                }
                cur.push(c);
            }
        }
        i += 1;
    }
    if state != ArgState::Start {
        args.push(cur);
    }
    args
}

/// Undo the one level of backslash escaping glob(3) removes when a pattern
/// has no wildcards left.
pub fn unglob(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut chars = arg.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next().unwrap_or('\\'));
        } else {
            out.push(c);
        }
    }
    out
}

type Out = WriteHalf<DuplexStream>;

async fn say(out: &mut Out, text: &str) {
    let _ = out.write_all(text.as_bytes()).await;
    let _ = out.flush().await;
}

async fn run_fake(server: DuplexStream, remote: FakeRemote) {
    let (rd, mut out) = tokio::io::split(server);
    let mut lines = BufReader::new(rd).lines();

    let script = *remote.inner.script.lock().unwrap();
    match script {
        ConnectScript::Ready => {
            let delay = remote.inner.connect_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
            }
            say(&mut out, "Connected to fake.host.\r\nsftp> ").await;
        }
        ConnectScript::HostKey => {
            say(
                &mut out,
                "The authenticity of host 'fake.host (127.0.0.1)' can't be established.\r\n\
                 ED25519 key fingerprint is SHA256:fakeFingerprint.\r\n\
                 This key is not known by any other names.\r\n\
                 Are you sure you want to continue connecting (yes/no/[fingerprint])? ",
            )
            .await;
            match lines.next_line().await {
                Ok(Some(answer)) if answer.trim() == "yes" => {
                    say(
                        &mut out,
                        "yes\r\nWarning: Permanently added 'fake.host' (ED25519) to the list of known hosts.\r\n\
                         Connected to fake.host.\r\nsftp> ",
                    )
                    .await;
                }
                _ => {
                    say(&mut out, "no\r\nHost key verification failed.\r\n").await;
                    return;
                }
            }
        }
        ConnectScript::Password => {
            say(&mut out, "tester@fake.host's password: ").await;
            std::future::pending::<()>().await;
        }
        ConnectScript::Refused => {
            say(&mut out, "ssh: connect to host fake.host port 22: Connection refused\r\n").await;
            return;
        }
        ConnectScript::Silent => {
            std::future::pending::<()>().await;
        }
    }

    let mut cwd = remote.root().to_path_buf();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end_matches('\r').to_string();
        remote.inner.log.lock().unwrap().push(line.clone());
        say(&mut out, &format!("{}\r\n", line)).await;

        if let Some(text) = line.strip_prefix("!echo ") {
            say(&mut out, &format!("{}\r\nsftp> ", text.trim())).await;
            continue;
        }

        let args = sftp_argv(&line);
        let Some(cmd) = args.first().map(String::as_str) else {
            say(&mut out, "sftp> ").await;
            continue;
        };
        let resolve = |p: &str| -> PathBuf {
            let p = Path::new(p);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                cwd.join(p)
            }
        };

        match cmd {
            "bye" | "quit" | "exit" => return,
            "pwd" => {
                say(&mut out, &format!("Remote working directory: {}\r\n", cwd.display())).await;
            }
            "cd" => {
                let target = resolve(args.get(1).map(String::as_str).unwrap_or("/"));
                if target.is_dir() {
                    cwd = target;
                } else {
                    say(&mut out, "Couldn't canonicalize: No such file or directory\r\n").await;
                }
            }
            "ls" => {
                let given = args.iter().skip(1).find(|a| !a.starts_with('-')).map(|a| unglob(a));
                let target = given.as_deref().map(|p| resolve(p)).unwrap_or_else(|| cwd.clone());
                let shown = given.unwrap_or_default();
                say(&mut out, &list_output(&target, &shown)).await;
            }
            "mkdir" => {
                let target = resolve(args.get(1).map(String::as_str).unwrap_or(""));
                if std::fs::create_dir(&target).is_err() {
                    say(&mut out, &format!("remote mkdir \"{}\": Failure\r\n", target.display())).await;
                }
            }
            "rmdir" => {
                let target = resolve(args.get(1).map(String::as_str).unwrap_or(""));
                if std::fs::remove_dir(&target).is_err() {
                    say(&mut out, "Couldn't remove directory: Failure\r\n").await;
                }
            }
            "rm" => {
                let target = resolve(&unglob(args.get(1).map(String::as_str).unwrap_or("")));
                if std::fs::remove_file(&target).is_err() {
                    say(&mut out, "Couldn't delete file: No such file or directory\r\n").await;
                }
            }
            "rename" => {
                let from = resolve(args.get(1).map(String::as_str).unwrap_or(""));
                let to = resolve(args.get(2).map(String::as_str).unwrap_or(""));
                if std::fs::rename(&from, &to).is_err() {
                    say(&mut out, "Couldn't rename file: Failure\r\n").await;
                }
            }
            "put" | "get" => {
                let src = resolve(&unglob(args.get(1).map(String::as_str).unwrap_or("")));
                let dst = resolve(args.get(2).map(String::as_str).unwrap_or("."));
                transfer(&remote, &mut out, cmd == "put", &src, &dst).await;
            }
            _ => say(&mut out, "Invalid command.\r\n").await,
        }
        say(&mut out, "sftp> ").await;
    }
}

fn list_output(target: &Path, shown: &str) -> String {
    let Ok(meta) = std::fs::metadata(target) else {
        return format!("Can't ls: \"{}\" not found\r\n", target.display());
    };
    if !meta.is_dir() {
        return format!("{}\r\n", row(&meta, shown));
    }

    let prefix = |name: &str| {
        if shown.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", shown.trim_end_matches('/'), name)
        }
    };
    let mut out = String::new();
    out.push_str(&format!("{}\r\n", row(&meta, &prefix("."))));
    out.push_str(&format!("{}\r\n", row(&meta, &prefix(".."))));
    let mut names: Vec<(String, std::fs::Metadata)> = std::fs::read_dir(target)
        .map(|rd| {
            rd.filter_map(|e| e.ok())
                .filter_map(|e| Some((e.file_name().to_string_lossy().into_owned(), e.metadata().ok()?)))
                .collect()
        })
        .unwrap_or_default();
    names.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, meta) in names {
        out.push_str(&format!("{}\r\n", row(&meta, &prefix(&name))));
    }
    out
}

fn row(meta: &std::fs::Metadata, name: &str) -> String {
    let perms = if meta.is_dir() { "drwxr-xr-x" } else { "-rw-r--r--" };
    format!("{}    1 tester   tester   {:>8} Jan  1 12:00 {}", perms, meta.len(), name)
}

fn progress_line(name: &str, percent: u64, bytes: u64) -> String {
    format!("\r{:<40} {:>3}% {:>6} 1.0MB/s   00:01 ETA", name, percent, bytes)
}

async fn transfer(remote: &FakeRemote, out: &mut Out, upload: bool, src: &Path, dst: &Path) {
    let name = basename(&src.display().to_string()).to_string();
    let dest = if dst.is_dir() { dst.join(&name) } else { dst.to_path_buf() };

    let verb = if upload { "Uploading" } else { "Fetching" };
    let Ok(data) = tokio::fs::read(src).await else {
        let msg = if upload {
            format!("stat {}: No such file or directory\r\n", src.display())
        } else {
            format!("File \"{}\" not found.\r\n", src.display())
        };
        say(out, &msg).await;
        return;
    };
    say(out, &format!("{} {} to {}\r\n", verb, src.display(), dest.display())).await;

    if remote.inner.failing.lock().unwrap().contains(&name) {
        say(out, &format!("remote open(\"{}\"): Permission denied\r\n", dest.display())).await;
        return;
    }

    let total = data.len() as u64;
    if remote.inner.hanging.lock().unwrap().contains(&name) {
        let half = data.len() / 2;
        let _ = tokio::fs::write(&dest, &data[..half]).await;
        say(out, &progress_line(&name, 50, half as u64)).await;
        remote.inner.hangs.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
    }

    say(out, &progress_line(&name, 30, total * 3 / 10)).await;
    tokio::time::sleep(Duration::from_millis(3)).await;
    let _ = tokio::fs::write(&dest, &data).await;
    say(out, &progress_line(&name, 100, total)).await;
    tokio::time::sleep(Duration::from_millis(3)).await;
    say(out, "\r\n").await;
}
