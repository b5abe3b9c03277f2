//! One user-visible transfer: a single file or a whole folder.
//!
//! Folder progress is byte-accurate: each file's registered size is counted
//! once, when the file is finalized, and percent never reaches 100 until the
//! scheduler marks the transfer completed.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sftp_pty::types::*;

/// Throughput is measured over this trailing window.
const ETA_WINDOW: Duration = Duration::from_secs(30);
/// Shorter spans give too noisy a rate to report.
const ETA_MIN_SPAN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferItem {
    pub id: String,
    pub direction: TransferDirection,
    pub source: String,
    /// Directory the transfer lands in.
    pub dest_dir: String,
    /// Full destination path (`dest_dir/name`).
    pub destination: String,
    pub name: String,
    pub status: TransferStatus,
    pub percent: u8,
    pub transferred: u64,
    pub total: u64,
    pub is_folder: bool,
    pub total_files: usize,
    pub completed_files: usize,
    /// Folder mode: file the latest progress line was about.
    pub current_file: Option<String>,
    pub failed_files: Vec<FailedFile>,
    pub speed: Option<String>,
    pub eta: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Retries: the transfer whose failed files this one sends again.
    pub retry_of: Option<String>,
    /// Retries only own the files they write, never the shared destination.
    #[serde(skip)]
    owned_paths: Option<Vec<String>>,
    #[serde(skip)]
    tracker: ProgressTracker,
}

#[derive(Debug, Clone, Default)]
struct ProgressTracker {
    /// Expected sizes by file name; duplicate names keep one entry each.
    pending: HashMap<String, Vec<u64>>,
    /// Sizes already in `completed_bytes` whose file has not yet been
    /// reported finished. A failure takes them back out.
    unconfirmed: HashMap<String, Vec<u64>>,
    completed_bytes: u64,
    /// Whether `current_file` has already been counted.
    current_finalized: bool,
    samples: VecDeque<(Instant, u64)>,
}

impl TransferItem {
    pub fn new(direction: TransferDirection, source: &str, dest_dir: &str) -> Self {
        let name = basename(source).to_string();
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            source: source.to_string(),
            dest_dir: dest_dir.to_string(),
            destination: join_path(dest_dir, &name),
            name,
            status: TransferStatus::Queued,
            percent: 0,
            transferred: 0,
            total: 0,
            is_folder: false,
            total_files: 1,
            completed_files: 0,
            current_file: None,
            failed_files: Vec::new(),
            speed: None,
            eta: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_of: None,
            owned_paths: None,
            tracker: ProgressTracker::default(),
        }
    }

    /// Single-file mode with a known size.
    pub fn set_single_file(&mut self, size: u64) {
        self.is_folder = false;
        self.total = size;
        self.total_files = 1;
    }

    /// Switch to folder mode and register every expected `(name, size)`.
    pub fn set_file_sizes(&mut self, sizes: &[(String, u64)], total: u64) {
        self.is_folder = true;
        self.total = total;
        self.total_files = sizes.len();
        self.tracker.pending.clear();
        self.tracker.unconfirmed.clear();
        for (name, size) in sizes {
            self.tracker
                .pending
                .entry(name.clone())
                .or_default()
                .push(*size);
        }
        self.refresh_folder();
    }

    /// Mark this item as a retry of `original` writing exactly `paths`.
    pub fn set_retry_of(&mut self, original: &str, paths: Vec<String>) {
        self.retry_of = Some(original.to_string());
        self.owned_paths = Some(paths);
    }

    /// What a cancel deletes, given the paths that were mid-transfer.
    pub fn cleanup_targets(&self, mode: CancelCleanup, in_flight: Vec<String>) -> Vec<String> {
        match (&self.owned_paths, mode) {
            (Some(owned), CancelCleanup::RemoveAll) => owned.clone(),
            (Some(_), CancelCleanup::RemovePartial) => in_flight,
            (None, CancelCleanup::RemoveAll) => vec![self.destination.clone()],
            (None, CancelCleanup::RemovePartial) if !self.is_folder => {
                vec![self.destination.clone()]
            }
            (None, CancelCleanup::RemovePartial) => in_flight,
        }
    }

    /// Files that have reached an outcome, successful or not.
    pub fn finished_files(&self) -> usize {
        self.completed_files + self.failed_files.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    // ─── Progress ────────────────────────────────────────────────

    pub fn update_progress(&mut self, sample: &ProgressSample, now: Instant) {
        if self.is_terminal() {
            return;
        }

        if self.is_folder {
            let same = self.current_file.as_deref() == Some(sample.filename.as_str());
            if !same {
                if let Some(prev) = self.current_file.take() {
                    if !self.tracker.current_finalized {
                        self.finalize(&prev);
                    }
                }
                self.current_file = Some(sample.filename.clone());
                self.tracker.current_finalized = false;
            }
            if sample.percent == Some(100) && !self.tracker.current_finalized {
                self.finalize(&sample.filename);
                self.tracker.current_finalized = true;
            }
            self.refresh_folder();
        } else {
            if let Some(p) = sample.percent {
                self.percent = p.min(100);
                if self.total > 0 {
                    self.transferred = self.total * self.percent as u64 / 100;
                } else if let Some(bytes) = sample.transferred {
                    self.transferred = bytes;
                }
            } else if let Some(bytes) = sample.transferred {
                self.transferred = if self.total > 0 { bytes.min(self.total) } else { bytes };
            }
        }

        if sample.speed.is_some() {
            self.speed = sample.speed.clone();
        }
        self.record_sample(now);
    }

    /// A file finished, with or without a final 100% line.
    pub fn finish_file(&mut self, name: &str) {
        if take_one(&mut self.tracker.unconfirmed, name).is_none() {
            if let Some(size) = take_one(&mut self.tracker.pending, name) {
                self.tracker.completed_bytes += size;
            }
        }
        if self.current_file.as_deref() == Some(name) {
            self.tracker.current_finalized = true;
        }
        if self.is_folder {
            self.refresh_folder();
        }
    }

    /// Drop a failed file from the expected set. Bytes it was already
    /// credited with (a filename switch or a 100% line) are taken back.
    pub fn fail_file(&mut self, name: &str) {
        if let Some(size) = take_one(&mut self.tracker.unconfirmed, name) {
            self.tracker.completed_bytes = self.tracker.completed_bytes.saturating_sub(size);
        } else {
            take_one(&mut self.tracker.pending, name);
        }
        if self.current_file.as_deref() == Some(name) {
            self.current_file = None;
            self.tracker.current_finalized = false;
        }
        if self.is_folder {
            self.refresh_folder();
        }
    }

    /// Count one pending occurrence of `name`. Unknown names add nothing.
    fn finalize(&mut self, name: &str) {
        if let Some(size) = take_one(&mut self.tracker.pending, name) {
            self.tracker.completed_bytes += size;
            self.tracker
                .unconfirmed
                .entry(name.to_string())
                .or_default()
                .push(size);
        }
    }

    fn refresh_folder(&mut self) {
        let done = self.tracker.completed_bytes.min(self.total);
        self.transferred = done;
        self.percent = if self.total == 0 {
            0
        } else {
            ((done as u128 * 100 / self.total as u128) as u8).min(99)
        };
    }

    fn record_sample(&mut self, now: Instant) {
        let samples = &mut self.tracker.samples;
        samples.push_back((now, self.transferred));

        // Keep one anchor at or beyond the window edge.
        while samples.len() > 2 {
            match samples.get(1) {
                Some((t, _)) if now.saturating_duration_since(*t) >= ETA_WINDOW => {
                    samples.pop_front();
                }
                _ => break,
            }
        }

        let (Some(&(t0, b0)), Some(&(t1, b1))) = (samples.front(), samples.back()) else {
            return;
        };
        let span = t1.saturating_duration_since(t0);
        if span < ETA_MIN_SPAN {
            return;
        }
        let rate = (b1 as f64 - b0 as f64) / span.as_secs_f64();
        if rate <= 0.0 {
            return;
        }
        let remaining = self.total.saturating_sub(self.transferred) as f64;
        self.eta = Some(format_eta((remaining / rate).ceil() as u64));
    }

    // ─── Transitions ─────────────────────────────────────────────

    pub fn mark_active(&mut self) {
        self.status = TransferStatus::Active;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = TransferStatus::Completed;
        self.percent = 100;
        if self.failed_files.is_empty() {
            self.transferred = self.total;
        } else if self.is_folder {
            self.transferred = self.tracker.completed_bytes.min(self.total);
        }
        self.current_file = None;
        self.eta = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TransferStatus::Failed;
        self.error = Some(error.into());
        self.eta = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TransferStatus::Cancelled;
        self.eta = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn record_file_failure(&mut self, failure: FailedFile) {
        self.fail_file(&failure.name);
        self.failed_files.push(failure);
    }
}

fn take_one(sizes: &mut HashMap<String, Vec<u64>>, name: &str) -> Option<u64> {
    let list = sizes.get_mut(name)?;
    let size = list.pop();
    if list.is_empty() {
        sizes.remove(name);
    }
    size
}

/// `42s`, `3m 5s`, `2h 10m`.
pub fn format_eta(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
