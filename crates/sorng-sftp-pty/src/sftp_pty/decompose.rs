//! Turning a file or directory transfer into per-file work.
//!
//! Planning walks the source tree (local via `walkdir`, remote via repeated
//! listings), honours the skip-list, and records every directory so the
//! whole destination tree can be created before any file moves. Empty
//! directories are created too.

use std::path::{Path, PathBuf};

use log::{debug, info};
use walkdir::WalkDir;

use crate::sftp_pty::error::{SftpError, SftpResult};
use crate::sftp_pty::session::SftpSession;
use crate::sftp_pty::types::*;

/// The outcome of decomposing one transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferPlan {
    pub is_folder: bool,
    /// Destination root: the file itself, or the top directory.
    pub root: String,
    /// Directories relative to `root`, parents before children.
    pub dirs: Vec<String>,
    pub works: Vec<FileWork>,
    pub total: u64,
}

impl TransferPlan {
    pub fn file_sizes(&self) -> Vec<(String, u64)> {
        self.works.iter().map(|w| (w.name.clone(), w.size)).collect()
    }
}

/// Whether `rel` equals a skip entry or lies beneath one.
pub fn is_skipped(rel: &str, skip: &[String]) -> bool {
    skip.iter().any(|s| {
        let s = s.trim_matches('/');
        !s.is_empty() && (rel == s || rel.strip_prefix(s).map_or(false, |r| r.starts_with('/')))
    })
}

fn rel_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn sort_by_depth(dirs: &mut [String]) {
    dirs.sort_by_key(|d| d.matches('/').count());
}

fn work_for(
    transfer_id: &str,
    direction: TransferDirection,
    source: String,
    dest_root: &str,
    rel: &str,
    size: u64,
) -> FileWork {
    let parent = parent_dir(rel);
    let dest_dir = if parent.is_empty() {
        dest_root.to_string()
    } else {
        join_path(dest_root, parent)
    };
    FileWork {
        transfer_id: transfer_id.to_string(),
        name: basename(&source).to_string(),
        source,
        dest_dir,
        direction,
        size,
    }
}

// ─── Upload ──────────────────────────────────────────────────────────

pub async fn plan_upload(
    transfer_id: &str,
    local: &str,
    remote_dest_dir: &str,
    skip: &[String],
) -> SftpResult<TransferPlan> {
    let meta = tokio::fs::metadata(local).await?;
    let name = basename(local).to_string();
    let root = join_path(remote_dest_dir, &name);

    if !meta.is_dir() {
        return Ok(TransferPlan {
            is_folder: false,
            root,
            dirs: Vec::new(),
            works: vec![FileWork {
                transfer_id: transfer_id.to_string(),
                source: local.to_string(),
                dest_dir: remote_dest_dir.to_string(),
                direction: TransferDirection::Upload,
                size: meta.len(),
                name,
            }],
            total: meta.len(),
        });
    }

    let base = PathBuf::from(local);
    let skip_owned = skip.to_vec();
    let walked = tokio::task::spawn_blocking(move || walk_local(&base, &skip_owned))
        .await
        .map_err(|e| SftpError::io(format!("directory walk panicked: {}", e)))??;

    let (mut dirs, files) = walked;
    sort_by_depth(&mut dirs);
    let mut total = 0u64;
    let works = files
        .into_iter()
        .map(|(rel, size)| {
            total += size;
            let source = Path::new(local).join(&rel).display().to_string();
            work_for(transfer_id, TransferDirection::Upload, source, &root, &rel, size)
        })
        .collect::<Vec<_>>();

    info!(
        "Planned upload of {}: {} files, {} dirs, {} bytes",
        local,
        works.len(),
        dirs.len(),
        total
    );
    Ok(TransferPlan {
        is_folder: true,
        root,
        dirs,
        works,
        total,
    })
}

type Walked = (Vec<String>, Vec<(String, u64)>);

fn walk_local(base: &Path, skip: &[String]) -> SftpResult<Walked> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    let walker = WalkDir::new(base)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| match e.path().strip_prefix(base) {
            Ok(rel) => !is_skipped(&rel_string(rel), skip),
            Err(_) => true,
        });

    for entry in walker {
        let entry = entry.map_err(|e| SftpError::io(format!("walk {}: {}", base.display(), e)))?;
        let rel = match entry.path().strip_prefix(base) {
            Ok(r) => rel_string(r),
            Err(_) => continue,
        };
        let ft = entry.file_type();
        if ft.is_dir() {
            dirs.push(rel);
        } else if ft.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push((rel, size));
        } else if ft.is_symlink() {
            // Links to regular files are sent as files; link targets are not walked.
            if let Ok(meta) = std::fs::metadata(entry.path()) {
                if meta.is_file() {
                    files.push((rel, meta.len()));
                }
            }
        }
    }
    Ok((dirs, files))
}

/// Create the remote destination tree for a folder upload.
pub async fn create_remote_tree(session: &SftpSession, plan: &TransferPlan) -> SftpResult<()> {
    if !plan.is_folder {
        return Ok(());
    }
    session.mkdir_all(&plan.root).await?;
    for rel in &plan.dirs {
        let path = join_path(&plan.root, rel);
        if let Err(e) = session.mkdir(&path).await {
            if e.is_fatal_to_session() {
                return Err(e);
            }
            // Already there is fine; anything else shows up when files land.
            debug!("mkdir {} skipped: {}", path, e.message);
        }
    }
    Ok(())
}

// ─── Download ────────────────────────────────────────────────────────

pub async fn plan_download(
    session: &SftpSession,
    transfer_id: &str,
    remote: &str,
    local_dest_dir: &str,
    skip: &[String],
) -> SftpResult<TransferPlan> {
    let entry = session.stat(remote).await?;
    let name = basename(remote).to_string();
    let root = join_path(local_dest_dir, &name);

    if !entry.is_dir() {
        return Ok(TransferPlan {
            is_folder: false,
            root,
            dirs: Vec::new(),
            works: vec![FileWork {
                transfer_id: transfer_id.to_string(),
                source: remote.to_string(),
                dest_dir: local_dest_dir.to_string(),
                direction: TransferDirection::Download,
                size: entry.size,
                name,
            }],
            total: entry.size,
        });
    }

    let mut dirs: Vec<String> = Vec::new();
    let mut works: Vec<FileWork> = Vec::new();
    let mut total = 0u64;
    let mut pending: Vec<String> = vec![String::new()];

    while let Some(rel_dir) = pending.pop() {
        let remote_dir = if rel_dir.is_empty() {
            remote.to_string()
        } else {
            join_path(remote, &rel_dir)
        };
        for child in session.list(&remote_dir).await? {
            let rel = if rel_dir.is_empty() {
                child.name.clone()
            } else {
                join_path(&rel_dir, &child.name)
            };
            if is_skipped(&rel, skip) {
                continue;
            }
            if child.is_dir() {
                dirs.push(rel.clone());
                pending.push(rel);
            } else if child.kind != EntryKind::Unknown {
                total += child.size;
                let source = join_path(&remote_dir, &child.name);
                works.push(work_for(
                    transfer_id,
                    TransferDirection::Download,
                    source,
                    &root,
                    &rel,
                    child.size,
                ));
            }
        }
    }
    sort_by_depth(&mut dirs);

    info!(
        "Planned download of {}: {} files, {} dirs, {} bytes",
        remote,
        works.len(),
        dirs.len(),
        total
    );
    Ok(TransferPlan {
        is_folder: true,
        root,
        dirs,
        works,
        total,
    })
}

/// Create the local destination tree for a folder download.
pub async fn create_local_tree(plan: &TransferPlan) -> SftpResult<()> {
    if !plan.is_folder {
        return Ok(());
    }
    tokio::fs::create_dir_all(&plan.root).await?;
    for rel in &plan.dirs {
        tokio::fs::create_dir_all(Path::new(&plan.root).join(rel)).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp_pty::session::RejectUnknownHosts;
    use crate::sftp_pty::testing::{FakeRemote, FakeSpawner};
    use std::sync::Arc;

    fn touch(root: &Path, rel: &str, len: usize) {
        let p = root.join(rel);
        std::fs::create_dir_all(p.parent().unwrap()).unwrap();
        std::fs::write(p, vec![b'x'; len]).unwrap();
    }

    #[test]
    fn test_skip_matching() {
        let skip = vec!["node_modules".to_string(), "/build/tmp/".to_string()];
        assert!(is_skipped("node_modules", &skip));
        assert!(is_skipped("node_modules/left-pad/index.js", &skip));
        assert!(is_skipped("build/tmp/x.o", &skip));
        assert!(!is_skipped("build/out.bin", &skip));
        assert!(!is_skipped("node_modules_backup", &skip));
    }

    #[tokio::test]
    async fn test_plan_upload_single_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "notes.txt", 42);
        let local = dir.path().join("notes.txt").display().to_string();
        let plan = plan_upload("t1", &local, "/srv/in", &[]).await.unwrap();
        assert!(!plan.is_folder);
        assert_eq!(plan.root, "/srv/in/notes.txt");
        assert_eq!(plan.total, 42);
        assert_eq!(plan.works.len(), 1);
        assert_eq!(plan.works[0].dest_dir, "/srv/in");
        assert_eq!(plan.works[0].dest_path(), "/srv/in/notes.txt");
    }

    #[tokio::test]
    async fn test_plan_upload_folder_with_skip() {
        let dir = tempfile::tempdir().unwrap();
        let proj = dir.path().join("proj");
        touch(&proj, "a.txt", 10);
        touch(&proj, "src/lib.rs", 20);
        touch(&proj, "src/deep/mod.rs", 30);
        touch(&proj, "target/big.bin", 1000);
        std::fs::create_dir_all(proj.join("empty")).unwrap();

        let plan = plan_upload("t1", &proj.display().to_string(), "/srv", &["target".to_string()])
            .await
            .unwrap();
        assert!(plan.is_folder);
        assert_eq!(plan.root, "/srv/proj");
        assert_eq!(plan.total, 60);
        assert_eq!(plan.dirs, vec!["empty", "src", "src/deep"]);

        let mut dests: Vec<(String, String)> = plan
            .works
            .iter()
            .map(|w| (w.name.clone(), w.dest_dir.clone()))
            .collect();
        dests.sort();
        assert_eq!(
            dests,
            vec![
                ("a.txt".to_string(), "/srv/proj".to_string()),
                ("lib.rs".to_string(), "/srv/proj/src".to_string()),
                ("mod.rs".to_string(), "/srv/proj/src/deep".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_local_source() {
        let err = plan_upload("t", "/definitely/not/here", "/srv", &[]).await.unwrap_err();
        assert_eq!(err.kind, crate::sftp_pty::error::SftpErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_plan_download_and_trees() {
        let remote = FakeRemote::new();
        remote.write_remote_file("photos/a.jpg", &[1u8; 100]);
        remote.write_remote_file("photos/2024/b.jpg", &[1u8; 200]);
        remote.write_remote_file("photos/2024/raw/c.raw", &[1u8; 300]);
        remote.write_remote_file("photos/cache/skip.me", &[1u8; 5]);
        std::fs::create_dir_all(remote.root().join("photos/empty")).unwrap();

        let s = SftpSession::new(
            SftpConnectionConfig::new("fake.host", "tester"),
            Arc::new(FakeSpawner::new(remote.clone())),
        );
        s.connect(&RejectUnknownHosts).await.unwrap();

        let local = tempfile::tempdir().unwrap();
        let local_dir = local.path().display().to_string();
        let plan = plan_download(
            &s,
            "t2",
            &remote.remote_path("photos"),
            &local_dir,
            &["cache".to_string()],
        )
        .await
        .unwrap();
        assert!(plan.is_folder);
        assert_eq!(plan.total, 600);
        assert_eq!(plan.works.len(), 3);
        assert_eq!(plan.dirs, vec!["2024", "empty", "2024/raw"]);

        create_local_tree(&plan).await.unwrap();
        assert!(local.path().join("photos/2024/raw").is_dir());
        assert!(local.path().join("photos/empty").is_dir());
        assert!(!local.path().join("photos/cache").exists());

        // Mirror it back up under a new remote directory.
        let up = plan_upload("t3", &local.path().join("photos").display().to_string(), &remote.remote_path("mirror/x"), &[])
            .await
            .unwrap();
        create_remote_tree(&s, &up).await.unwrap();
        assert!(remote.root().join("mirror/x/photos/2024/raw").is_dir());
        assert!(remote.root().join("mirror/x/photos/empty").is_dir());
    }

    #[tokio::test]
    async fn test_plan_download_single_file() {
        let remote = FakeRemote::new();
        remote.write_remote_file("one.bin", &[0u8; 1000]);
        let s = SftpSession::new(
            SftpConnectionConfig::new("fake.host", "tester"),
            Arc::new(FakeSpawner::new(remote.clone())),
        );
        s.connect(&RejectUnknownHosts).await.unwrap();
        let plan = plan_download(&s, "t", &remote.remote_path("one.bin"), "/tmp/dl", &[])
            .await
            .unwrap();
        assert!(!plan.is_folder);
        assert_eq!(plan.total, 1000);
        assert_eq!(plan.works[0].dest_path(), "/tmp/dl/one.bin");
    }
}
