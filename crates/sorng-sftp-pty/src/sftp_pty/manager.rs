//! Transfer manager: queue, session pool and lifecycle of every transfer.
//!
//! A transfer is decomposed into per-file [`FileWork`] on enqueue. Work is
//! admitted FIFO onto pooled sessions, at most `max_concurrent` at a time.
//! All bookkeeping lives in one `std::sync::Mutex<ManagerState>` that is
//! never held across an `.await`; connects, transfers and cleanup deletes run
//! outside it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::sync::{broadcast, mpsc};

use crate::sftp_pty::decompose::{
    create_local_tree, create_remote_tree, plan_download, plan_upload, TransferPlan,
};
use crate::sftp_pty::error::{SftpError, SftpErrorKind, SftpResult};
use crate::sftp_pty::pool::SessionPool;
use crate::sftp_pty::process::{ProcessSpawner, PtySpawner};
use crate::sftp_pty::session::{HostKeyVerifier, SftpSession};
use crate::sftp_pty::transfer_item::TransferItem;
use crate::sftp_pty::types::*;

const EVENT_CAPACITY: usize = 1024;

// ─── State ───────────────────────────────────────────────────────────

struct ManagerState {
    /// Insertion order.
    items: Vec<TransferItem>,
    queue: VecDeque<FileWork>,
    pool: SessionPool,
    config: TransferManagerConfig,
    destroyed: bool,
}

impl ManagerState {
    fn item(&self, id: &str) -> Option<&TransferItem> {
        self.items.iter().find(|i| i.id == id)
    }

    fn item_mut(&mut self, id: &str) -> Option<&mut TransferItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }
}

struct ManagerInner {
    connection: SftpConnectionConfig,
    spawner: Arc<dyn ProcessSpawner>,
    verifier: Arc<dyn HostKeyVerifier>,
    state: StdMutex<ManagerState>,
    events: broadcast::Sender<TransferEvent>,
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: TransferEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_occupancy(&self) {
        let stats = self.lock().pool.stats();
        self.emit(TransferEvent::PoolOccupancy { stats });
    }

    fn new_session(&self) -> SftpSession {
        SftpSession::new(self.connection.clone(), self.spawner.clone())
    }
}

enum WorkOutcome {
    Done,
    Failed(SftpError),
    ConnectFailed(SftpError),
}

fn finished_event(item: TransferItem) -> TransferEvent {
    match item.status {
        TransferStatus::Completed => TransferEvent::Completed { item },
        TransferStatus::Failed => TransferEvent::Failed { item },
        TransferStatus::Cancelled => TransferEvent::Cancelled { item },
        _ => TransferEvent::Progress { item },
    }
}

/// Schedules file and folder transfers for one connection.
#[derive(Clone)]
pub struct TransferManager {
    inner: Arc<ManagerInner>,
}

impl TransferManager {
    pub fn new(
        connection: SftpConnectionConfig,
        spawner: Arc<dyn ProcessSpawner>,
        verifier: Arc<dyn HostKeyVerifier>,
        config: TransferManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                connection,
                spawner,
                verifier,
                state: StdMutex::new(ManagerState {
                    items: Vec::new(),
                    queue: VecDeque::new(),
                    pool: SessionPool::new(config.max_concurrent),
                    config,
                    destroyed: false,
                }),
                events,
            }),
        }
    }

    /// A manager that runs the real `sftp` binary on a pseudo-terminal.
    pub fn with_pty(
        connection: SftpConnectionConfig,
        verifier: Arc<dyn HostKeyVerifier>,
        config: TransferManagerConfig,
    ) -> Self {
        Self::new(connection, Arc::new(PtySpawner::new()), verifier, config)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    // ─── Enqueue ─────────────────────────────────────────────────

    /// Queue a local file or directory for upload into `remote_dir`.
    pub async fn enqueue_upload(
        &self,
        local: &str,
        remote_dir: &str,
        skip: Option<Vec<String>>,
    ) -> SftpResult<String> {
        self.enqueue(TransferDirection::Upload, local, remote_dir, skip.unwrap_or_default())
            .await
    }

    /// Queue a remote file or directory for download into `local_dir`.
    pub async fn enqueue_download(
        &self,
        remote: &str,
        local_dir: &str,
        skip: Option<Vec<String>>,
    ) -> SftpResult<String> {
        self.enqueue(TransferDirection::Download, remote, local_dir, skip.unwrap_or_default())
            .await
    }

    async fn enqueue(
        &self,
        direction: TransferDirection,
        source: &str,
        dest_dir: &str,
        skip: Vec<String>,
    ) -> SftpResult<String> {
        let item = TransferItem::new(direction, source, dest_dir);
        let id = item.id.clone();
        {
            let mut st = self.inner.lock();
            if st.destroyed {
                return Err(SftpError::invalid_state("transfer manager has been destroyed"));
            }
            st.items.push(item.clone());
        }
        info!("Queued {:?} {} -> {} ({})", direction, source, dest_dir, id);
        self.inner.emit(TransferEvent::Queued { item });

        match self.plan(direction, &id, source, dest_dir, &skip).await {
            Ok(plan) => {
                self.admit_plan(&id, plan);
                self.schedule();
                Ok(id)
            }
            Err(e) => {
                warn!("Could not prepare transfer {}: {}", id, e);
                let failed = {
                    let mut st = self.inner.lock();
                    st.item_mut(&id).and_then(|item| {
                        if item.is_terminal() {
                            return None;
                        }
                        item.mark_failed(e.message.clone());
                        Some(item.clone())
                    })
                };
                if let Some(item) = failed {
                    self.inner.emit(TransferEvent::Failed { item });
                }
                Err(e)
            }
        }
    }

    async fn plan(
        &self,
        direction: TransferDirection,
        id: &str,
        source: &str,
        dest_dir: &str,
        skip: &[String],
    ) -> SftpResult<TransferPlan> {
        match direction {
            TransferDirection::Upload => {
                let plan = plan_upload(id, source, dest_dir, skip).await?;
                if plan.is_folder {
                    let session = self.borrow_session().await?;
                    let created = create_remote_tree(&session, &plan).await;
                    self.return_session(session);
                    created?;
                }
                Ok(plan)
            }
            TransferDirection::Download => {
                let session = self.borrow_session().await?;
                let planned = plan_download(&session, id, source, dest_dir, skip).await;
                self.return_session(session);
                let plan = planned?;
                create_local_tree(&plan).await?;
                Ok(plan)
            }
        }
    }

    fn admit_plan(&self, id: &str, plan: TransferPlan) {
        let mut st = self.inner.lock();
        let Some(item) = st.item_mut(id) else {
            return;
        };
        // Cancelled while the tree was being walked.
        if item.status != TransferStatus::Queued {
            return;
        }
        if plan.is_folder {
            item.set_file_sizes(&plan.file_sizes(), plan.total);
        } else {
            item.set_single_file(plan.total);
        }
        if plan.works.is_empty() {
            item.mark_active();
            item.mark_completed();
            let snapshot = item.clone();
            info!("Transfer {} had no files and is complete", id);
            self.inner.emit(TransferEvent::Completed { item: snapshot });
            return;
        }
        debug!("Transfer {} split into {} file(s)", id, plan.works.len());
        st.queue.extend(plan.works);
    }

    // ─── Borrowed sessions ───────────────────────────────────────

    /// A connected session for planning or cleanup. An idle pooled session
    /// is reused when there is one; otherwise a fresh one is connected
    /// outside the pool's accounting and closed again on return if the pool
    /// is full. Live processes therefore stay within `max_concurrent` plus
    /// one per enqueue or cancel that is planning or cleaning up right now.
    async fn borrow_session(&self) -> SftpResult<Arc<SftpSession>> {
        let idle = self.inner.lock().pool.take_idle();
        if let Some(session) = idle {
            return Ok(session);
        }
        let session = Arc::new(self.inner.new_session());
        session.connect(self.inner.verifier.as_ref()).await?;
        Ok(session)
    }

    fn return_session(&self, session: Arc<SftpSession>) {
        let surplus = {
            let mut st = self.inner.lock();
            if st.destroyed {
                Some(session)
            } else {
                st.pool.release(session)
            }
        };
        if let Some(session) = surplus {
            session.disconnect();
        }
        self.inner.emit_occupancy();
    }

    // ─── Scheduling ──────────────────────────────────────────────

    /// Admit queued work while there is capacity.
    fn schedule(&self) {
        let mut launches = Vec::new();
        {
            let mut st = self.inner.lock();
            if st.destroyed {
                return;
            }
            while st.pool.has_capacity() {
                let Some(work) = st.queue.pop_front() else {
                    break;
                };
                let Some(item) = st.item_mut(&work.transfer_id) else {
                    continue;
                };
                if item.is_terminal() {
                    continue;
                }
                if item.status == TransferStatus::Queued {
                    item.mark_active();
                    let snapshot = item.clone();
                    self.inner.emit(TransferEvent::Started { item: snapshot });
                }

                let (session, fresh) = match st.pool.take_idle() {
                    Some(session) => (session, false),
                    None => (Arc::new(self.inner.new_session()), true),
                };
                debug!(
                    "Admitting {} on session {}{}",
                    work.source,
                    session.id(),
                    if fresh { " (new)" } else { "" }
                );
                st.pool.activate(session.clone(), work.clone());
                launches.push((session, work, fresh));
            }
            if !launches.is_empty() {
                let stats = st.pool.stats();
                self.inner.emit(TransferEvent::PoolOccupancy { stats });
            }
        }

        for (session, work, fresh) in launches {
            let this = self.clone();
            tokio::spawn(async move {
                this.run_work(session, work, fresh).await;
            });
        }
    }

    async fn run_work(self, session: Arc<SftpSession>, work: FileWork, fresh: bool) {
        let outcome = if fresh {
            match session.connect(self.inner.verifier.as_ref()).await {
                Ok(()) => self.transfer_file(&session, &work).await,
                Err(e) => WorkOutcome::ConnectFailed(e),
            }
        } else {
            self.transfer_file(&session, &work).await
        };
        self.on_work_finished(session, work, outcome);
    }

    async fn transfer_file(&self, session: &SftpSession, work: &FileWork) -> WorkOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressSample>();
        session.set_progress_listener(Some(tx));
        let forward = {
            let this = self.clone();
            let id = work.transfer_id.clone();
            let name = work.name.clone();
            tokio::spawn(async move {
                while let Some(mut sample) = rx.recv().await {
                    sample.filename = name.clone();
                    this.on_progress(&id, &sample);
                }
            })
        };

        let dest = work.dest_path();
        let result = match work.direction {
            TransferDirection::Upload => session.upload(&work.source, &dest).await,
            TransferDirection::Download => session.download(&work.source, &dest).await,
        };
        session.set_progress_listener(None);
        // Every sample lands before the file is accounted for.
        let _ = forward.await;

        match result {
            Ok(()) => WorkOutcome::Done,
            Err(e) => WorkOutcome::Failed(e),
        }
    }

    fn on_progress(&self, id: &str, sample: &ProgressSample) {
        let mut st = self.inner.lock();
        if let Some(item) = st.item_mut(id) {
            if item.is_terminal() {
                return;
            }
            item.update_progress(sample, Instant::now());
            let snapshot = item.clone();
            self.inner.emit(TransferEvent::Progress { item: snapshot });
        }
    }

    fn on_work_finished(&self, session: Arc<SftpSession>, work: FileWork, outcome: WorkOutcome) {
        let mut to_kill = None;
        let mut to_close = None;
        {
            let mut st = self.inner.lock();
            if st.pool.finish(session.id()).is_none() {
                // Cancelled or destroyed underneath us; the session is already dead.
                return;
            }
            if matches!(outcome, WorkOutcome::Done) {
                to_close = st.pool.release(session);
            } else {
                to_kill = Some(session);
            }

            let mut purge = false;
            let mut event = None;
            if let Some(item) = st.item_mut(&work.transfer_id) {
                if !item.is_terminal() {
                    match outcome {
                        WorkOutcome::Done => {
                            item.finish_file(&work.name);
                            item.completed_files += 1;
                        }
                        WorkOutcome::Failed(e) if item.total_files > 1 => {
                            warn!("{} failed inside transfer {}: {}", work.source, item.id, e);
                            item.record_file_failure(FailedFile {
                                name: work.name.clone(),
                                error: e.message,
                                source: work.source.clone(),
                                dest: work.dest_dir.clone(),
                                size: work.size,
                            });
                        }
                        WorkOutcome::Failed(e) | WorkOutcome::ConnectFailed(e) => {
                            warn!("Transfer {} failed: {}", item.id, e);
                            item.mark_failed(e.message);
                            purge = true;
                        }
                    }

                    if !item.is_terminal() && item.finished_files() >= item.total_files {
                        if item.completed_files > 0 {
                            item.mark_completed();
                            info!(
                                "Transfer {} completed ({} ok, {} failed)",
                                item.id,
                                item.completed_files,
                                item.failed_files.len()
                            );
                        } else {
                            item.mark_failed(format!("all {} files failed", item.total_files));
                            warn!("Transfer {} failed: no file succeeded", item.id);
                        }
                    }
                    event = Some(finished_event(item.clone()));
                }
            }
            if purge {
                st.queue.retain(|w| w.transfer_id != work.transfer_id);
            }
            if let Some(event) = event {
                self.inner.emit(event);
            }
        }

        if let Some(session) = to_kill {
            session.abort();
        }
        if let Some(session) = to_close {
            session.disconnect();
        }
        self.inner.emit_occupancy();
        self.schedule();
    }

    // ─── Cancel ──────────────────────────────────────────────────

    /// Stop a transfer, kill its sessions and remove what it left behind.
    pub async fn cancel(&self, id: &str) -> SftpResult<()> {
        let (snapshot, slots, admitted, cleanup, settle, retry) = {
            let mut st = self.inner.lock();
            let config = st.config.clone();
            let Some(item) = st.item_mut(id) else {
                return Err(SftpError::not_found(format!("no transfer with id {}", id)));
            };
            if item.is_terminal() {
                return Ok(());
            }
            let admitted = item.status == TransferStatus::Active;
            item.mark_cancelled();
            let snapshot = item.clone();
            st.queue.retain(|w| w.transfer_id != id);
            let slots = st.pool.take_transfer(id);
            (
                snapshot,
                slots,
                admitted,
                config.cancel_cleanup,
                Duration::from_millis(config.cancel_settle_ms),
                Duration::from_millis(config.delete_retry_ms),
            )
        };

        info!(
            "Cancelling transfer {} ({} file(s) in flight)",
            id,
            slots.len()
        );
        for slot in &slots {
            slot.session.abort();
        }
        self.inner.emit_occupancy();
        // Freed slots go to other transfers while this one settles.
        self.schedule();

        if admitted {
            tokio::time::sleep(settle).await;
            let in_flight = slots.iter().map(|s| s.work.dest_path()).collect();
            self.cleanup_cancelled(&snapshot, in_flight, cleanup, retry).await;
        }

        let latest = self.get(id).unwrap_or(snapshot);
        self.inner.emit(TransferEvent::Cancelled { item: latest });
        self.schedule();
        Ok(())
    }

    async fn cleanup_cancelled(
        &self,
        item: &TransferItem,
        in_flight: Vec<String>,
        mode: CancelCleanup,
        retry: Duration,
    ) {
        for target in item.cleanup_targets(mode, in_flight) {
            if let Err(e) = self.delete_destination(item.direction, &target).await {
                debug!("Cleanup of {} failed, retrying: {}", target, e);
                tokio::time::sleep(retry).await;
                if let Err(e) = self.delete_destination(item.direction, &target).await {
                    let err = SftpError::cleanup_failed(format!("{}: {}", target, e.message));
                    warn!("Giving up on cleanup of cancelled transfer {}: {}", item.id, err);
                }
            }
        }
    }

    async fn delete_destination(&self, direction: TransferDirection, path: &str) -> SftpResult<()> {
        match direction {
            TransferDirection::Download => delete_local(path).await,
            TransferDirection::Upload => {
                let session = self.borrow_session().await?;
                let result = match session.remove_path(path).await {
                    Err(e) if e.kind == SftpErrorKind::NotFound => Ok(()),
                    other => other,
                };
                self.return_session(session);
                result
            }
        }
    }

    // ─── Retry ───────────────────────────────────────────────────

    /// Queue the failed files of `id` as a new transfer.
    pub fn retry_failed(&self, id: &str) -> SftpResult<String> {
        let new_id = {
            let mut st = self.inner.lock();
            if st.destroyed {
                return Err(SftpError::invalid_state("transfer manager has been destroyed"));
            }
            let Some(original) = st.item(id) else {
                return Err(SftpError::not_found(format!("no transfer with id {}", id)));
            };
            if original.failed_files.is_empty() {
                return Err(SftpError::invalid_state(format!(
                    "transfer {} has no failed files",
                    id
                )));
            }

            let mut retry = TransferItem::new(original.direction, &original.source, &original.dest_dir);
            retry.name = format!("{} (retry)", original.name);
            let sizes: Vec<(String, u64)> = original
                .failed_files
                .iter()
                .map(|f| (f.name.clone(), f.size))
                .collect();
            let total = sizes.iter().map(|(_, s)| *s).sum();
            retry.set_file_sizes(&sizes, total);
            let owned = original
                .failed_files
                .iter()
                .map(|f| join_path(&f.dest, &f.name))
                .collect();
            retry.set_retry_of(id, owned);

            let works: Vec<FileWork> = original
                .failed_files
                .iter()
                .map(|f| FileWork {
                    transfer_id: retry.id.clone(),
                    source: f.source.clone(),
                    dest_dir: f.dest.clone(),
                    direction: original.direction,
                    size: f.size,
                    name: f.name.clone(),
                })
                .collect();

            info!("Retrying {} failed file(s) of {} as {}", works.len(), id, retry.id);
            let new_id = retry.id.clone();
            st.items.push(retry.clone());
            st.queue.extend(works);
            self.inner.emit(TransferEvent::Queued { item: retry });
            new_id
        };
        self.schedule();
        Ok(new_id)
    }

    // ─── Settings ────────────────────────────────────────────────

    pub fn set_max_concurrent(&self, max: usize) {
        let excess = {
            let mut st = self.inner.lock();
            st.config.max_concurrent = max.max(1);
            st.pool.set_max(max)
        };
        if !excess.is_empty() {
            debug!("Closing {} idle session(s) over the new limit", excess.len());
        }
        for session in excess {
            session.disconnect();
        }
        self.inner.emit_occupancy();
        self.schedule();
    }

    pub fn set_cancel_cleanup(&self, mode: CancelCleanup) {
        self.inner.lock().config.cancel_cleanup = mode;
    }

    // ─── Queries ─────────────────────────────────────────────────

    pub fn get_all(&self) -> Vec<TransferItem> {
        self.inner.lock().items.clone()
    }

    pub fn get(&self, id: &str) -> Option<TransferItem> {
        self.inner.lock().item(id).cloned()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.lock().pool.stats()
    }

    /// Forget a finished transfer. Returns false for unknown or running ones.
    pub fn clear(&self, id: &str) -> bool {
        let mut st = self.inner.lock();
        match st.items.iter().position(|i| i.id == id) {
            Some(idx) if st.items[idx].is_terminal() => {
                st.items.remove(idx);
                true
            }
            _ => false,
        }
    }

    /// Forget every finished transfer; returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut st = self.inner.lock();
        let before = st.items.len();
        st.items.retain(|i| !i.is_terminal());
        before - st.items.len()
    }

    // ─── Teardown ────────────────────────────────────────────────

    /// Kill everything. Unfinished transfers are marked failed.
    pub fn destroy(&self) {
        let (active, idle, failed) = {
            let mut st = self.inner.lock();
            if st.destroyed {
                return;
            }
            st.destroyed = true;
            st.queue.clear();
            let (active, idle) = st.pool.drain();
            let mut failed = Vec::new();
            for item in st.items.iter_mut().filter(|i| !i.is_terminal()) {
                item.mark_failed("connection lost");
                failed.push(item.clone());
            }
            (active, idle, failed)
        };

        info!(
            "Destroying transfer manager: {} active, {} idle session(s), {} unfinished transfer(s)",
            active.len(),
            idle.len(),
            failed.len()
        );
        for session in active {
            session.abort();
        }
        for session in idle {
            session.disconnect();
        }
        for item in failed {
            self.inner.emit(TransferEvent::Failed { item });
        }
        self.inner.emit_occupancy();
    }
}

async fn delete_local(path: &str) -> SftpResult<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await?,
        Ok(_) => tokio::fs::remove_file(path).await?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
