//! End-to-end scenarios against a real project directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{TimeDelta, Utc};
use pgvc::repository::{
    AutoOutcome, CancellationToken, Repository, RepositoryError, RepositoryOptions, SnapshotOptions, CONTROL_DIR,
    WORK_DIR,
};
use pgvc::storage::{Change, ChangeKind, StorageError};
use pgvc::transaction::{
    BackupManifest, BackupRecord, FileOperation, TransactionError, TransactionMetadata, MARKER_FILE,
};
use tempfile::TempDir;

fn write(root: &Path, path: &str, content: &str) {
    let path = root.join(path);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn open(root: &Path) -> Repository {
    Repository::open_with(RepositoryOptions::new(root).create_if_missing(true).in_memory_breaker(true)).unwrap()
}

/// Every path outside the control and work dirs: files with their bytes,
/// directories as `None`.
fn tree_state(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != CONTROL_DIR && e.file_name() != WORK_DIR)
        .map(|e| e.unwrap())
        .map(|e| {
            let key = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            let content = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
            (key, content)
        })
        .collect()
}

fn count_objects(root: &Path) -> usize {
    walkdir::WalkDir::new(root.join(CONTROL_DIR).join("objects"))
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && !e.path().components().any(|c| c.as_os_str() == "tmp"))
        .count()
}

#[test]
fn initial_snapshot_resolves_head() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "Assets/Textures/stone.png", "png bytes");
    write(dir.path(), "Assets/Scenes/main.scene", "scene");
    write(dir.path(), "readme.txt", "hello");

    let repo = open(dir.path());
    let summary = repo.create_snapshot("initial", "alice", &SnapshotOptions::default()).unwrap();

    assert_eq!(repo.head().unwrap(), Some(summary.commit));
    let info = repo.get_commit(summary.commit).unwrap();
    assert_eq!(info.commit.parent, None);
    assert_eq!(info.commit.author, "alice");
    // 3 blobs, 4 trees (root, Assets, Textures, Scenes), 1 commit
    assert_eq!(count_objects(dir.path()), 8);
    assert!(repo.status().unwrap().is_empty());
}

#[test]
fn one_modified_file_is_one_change() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "one");
    write(dir.path(), "b/c.txt", "two");
    let repo = open(dir.path());
    repo.create_snapshot("base", "alice", &SnapshotOptions::default()).unwrap();

    write(dir.path(), "b/c.txt", "two, edited");
    assert_eq!(repo.status().unwrap(), vec![Change::new("b/c.txt", ChangeKind::Modified)]);
}

#[test]
fn ignored_files_are_not_captured() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), ".pgignore", "# build output\nLibrary/\n*.tmp\n!keep.tmp\n");
    write(dir.path(), "Library/cache.bin", "cache");
    write(dir.path(), "Assets/scratch.tmp", "scratch");
    write(dir.path(), "Assets/keep.tmp", "keep");
    write(dir.path(), "Assets/a.txt", "a");

    let repo = open(dir.path());
    let summary = repo.create_snapshot("base", "alice", &SnapshotOptions::default()).unwrap();
    assert_eq!(summary.files, 3);
    assert!(repo.read_file_at(summary.commit, "Assets/keep.tmp").is_ok());
    assert!(repo.read_file_at(summary.commit, "Library/cache.bin").is_err());

    write(dir.path(), "Library/cache.bin", "changed cache");
    assert!(repo.status().unwrap().is_empty());
}

#[test]
fn leftover_marker_is_recovered() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "a");
    drop(open(dir.path()));

    let work = dir.path().join(WORK_DIR);
    fs::create_dir_all(&work).unwrap();
    fs::write(work.join(MARKER_FILE), "not even json").unwrap();

    let repo = Repository::open(dir.path()).unwrap();
    assert!(repo.last_recovery().marker_found);
    assert!(!work.join(MARKER_FILE).exists());
    repo.create_snapshot("after recovery", "alice", &SnapshotOptions::default())
        .unwrap();
}

#[test]
fn interrupted_transaction_keeps_backups() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "precious");
    drop(open(dir.path()));

    // what a process killed while deleting a.txt leaves behind
    let original = dir.path().join("a.txt");
    let work = dir.path().join(WORK_DIR);
    let tx_dir = work.join("tx-01jc0ffee");
    let backup = tx_dir.join("backups").join("0");
    fs::create_dir_all(backup.parent().unwrap()).unwrap();
    fs::rename(&original, &backup).unwrap();
    let manifest = BackupManifest {
        tx_id: "01jc0ffee".to_string(),
        backups: vec![BackupRecord {
            original: original.clone(),
            backup: backup.clone(),
        }],
    };
    fs::write(tx_dir.join("manifest.json"), serde_json::to_vec(&manifest).unwrap()).unwrap();
    let marker = TransactionMetadata {
        tx_id: "01jc0ffee".to_string(),
        started_at: Utc::now(),
        pid: 0,
    };
    fs::write(work.join(MARKER_FILE), serde_json::to_vec(&marker).unwrap()).unwrap();

    let reopened = Repository::open(dir.path()).unwrap();
    let report = reopened.last_recovery();
    assert!(report.marker_found);
    assert_eq!(report.interrupted.as_ref().map(|m| m.tx_id.as_str()), Some("01jc0ffee"));
    assert_eq!(report.quarantined.len(), 1);
    let kept = &report.quarantined[0];
    assert_eq!(kept.originals, vec![original]);
    assert_eq!(
        fs::read_to_string(kept.location.join("backups").join("0")).unwrap(),
        "precious"
    );
}

#[test]
fn second_handle_leaves_running_transaction_alone() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "asset.bin", "precious");
    let repo = open(dir.path());

    let mut tx = repo.transactions().begin().unwrap();
    tx.execute(FileOperation::delete(dir.path().join("asset.bin"))).unwrap();

    let second = Repository::open(dir.path()).unwrap();
    assert!(second.last_recovery().marker_in_use);
    assert!(second.last_recovery().quarantined.is_empty());
    assert!(dir.path().join(WORK_DIR).join(MARKER_FILE).exists());
    let err = second
        .create_snapshot("meanwhile", "bob", &SnapshotOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::Transaction(TransactionError::Locked { .. })
    ));

    tx.rollback().unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("asset.bin")).unwrap(), "precious");
    assert!(!dir.path().join(WORK_DIR).join(MARKER_FILE).exists());
}

#[test]
fn stash_indices_are_sequential() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "a");
    let repo = open(dir.path());
    let head = repo
        .create_snapshot("base", "alice", &SnapshotOptions::default())
        .unwrap()
        .commit;

    for i in 0..3u64 {
        write(dir.path(), "a.txt", &format!("wip {}", i));
        let stash = repo.create_stash(&format!("wip {}", i), "alice").unwrap();
        assert_eq!(stash.index, i);
    }
    assert_eq!(repo.head().unwrap(), Some(head));
    let indices: Vec<u64> = repo.list_stashes().unwrap().iter().map(|s| s.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(dir
        .path()
        .join(CONTROL_DIR)
        .join("refs/stash/auto/2")
        .is_file());
}

#[test]
fn cancelled_snapshot_leaves_head() {
    let dir = TempDir::new().unwrap();
    for i in 0..20 {
        write(dir.path(), &format!("f{:02}.txt", i), &i.to_string());
    }
    let repo = open(dir.path());

    // cancel from inside the progress callback, halfway through the walk
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let options = SnapshotOptions::new().cancel(cancel).progress(move |p| {
        if p.processed == 10 {
            trigger.cancel();
        }
    });
    let err = repo.create_snapshot("cancelled", "alice", &options).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(repo.head().unwrap(), None);
    assert!(!dir.path().join(WORK_DIR).join(MARKER_FILE).exists());
}

#[test]
fn restore_round_trips_working_tree() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "Assets/a.txt", "a1");
    write(dir.path(), "Assets/deep/b.txt", "b1");
    let repo = open(dir.path());
    let first = repo
        .create_snapshot("first", "alice", &SnapshotOptions::default())
        .unwrap()
        .commit;

    write(dir.path(), "Assets/a.txt", "a2");
    fs::remove_file(dir.path().join("Assets/deep/b.txt")).unwrap();
    write(dir.path(), "Assets/c.txt", "c2");
    let second = repo
        .create_snapshot("second", "alice", &SnapshotOptions::default())
        .unwrap()
        .commit;

    repo.restore(first, &CancellationToken::new()).unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("Assets/a.txt")).unwrap(), "a1");
    assert_eq!(fs::read_to_string(dir.path().join("Assets/deep/b.txt")).unwrap(), "b1");
    assert!(!dir.path().join("Assets/c.txt").exists());
    assert_eq!(repo.diff_commits(second, first).unwrap().len(), 3);

    repo.restore(second, &CancellationToken::new()).unwrap();
    assert!(repo.status().unwrap().is_empty());
}

#[test]
fn failed_restore_puts_back_every_path() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "a1");
    write(dir.path(), "x", "x1");
    write(dir.path(), "z/file", "z1");
    let repo = open(dir.path());
    let snapshot = repo
        .create_snapshot("base", "alice", &SnapshotOptions::default())
        .unwrap()
        .commit;

    write(dir.path(), "a.txt", "a2");
    write(dir.path(), "extra.txt", "extra");
    fs::remove_file(dir.path().join("x")).unwrap();
    fs::create_dir(dir.path().join("x")).unwrap();
    // an ignored file where the snapshot needs the directory z/
    fs::remove_dir_all(dir.path().join("z")).unwrap();
    write(dir.path(), "z", "blocker");
    write(dir.path(), ".pgignore", "z\n");
    let before = tree_state(dir.path());

    // deletions, a.txt and x are applied before z/file fails
    let err = repo.restore(snapshot, &CancellationToken::new()).unwrap_err();
    assert!(!err.is_cancelled());
    assert_eq!(tree_state(dir.path()), before);
    assert!(dir.path().join("x").is_dir());
    assert!(!dir.path().join(WORK_DIR).join(MARKER_FILE).exists());
}

#[test]
fn ref_cycle_is_an_integrity_fault() {
    let dir = TempDir::new().unwrap();
    let repo = open(dir.path());
    let control = dir.path().join(CONTROL_DIR);
    fs::write(control.join("HEAD"), "ref: refs/heads/a\n").unwrap();
    fs::write(control.join("refs/heads/a"), "ref: refs/heads/b\n").unwrap();
    fs::write(control.join("refs/heads/b"), "ref: refs/heads/a\n").unwrap();

    let err = repo.head().unwrap_err();
    assert!(matches!(
        err,
        RepositoryError::Storage(StorageError::RefCycle { .. })
    ));
    assert!(err.is_integrity_fault());
}

#[test]
fn breaker_gates_and_auto_resets() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "a");
    let repo = open(dir.path());
    let cancel = CancellationToken::new();

    let long_ago = Utc::now() - TimeDelta::hours(25);
    for _ in 0..3 {
        repo.breaker().record_failure("auto snapshot").unwrap();
    }
    assert!(matches!(
        repo.auto_snapshot("hourly", "scheduler", &cancel).unwrap(),
        AutoOutcome::Skipped { .. }
    ));
    assert_eq!(repo.head().unwrap(), None);

    // failures older than the window no longer count
    repo.reset_breaker().unwrap();
    for _ in 0..3 {
        repo.breaker().record_failure_at("auto snapshot", long_ago).unwrap();
    }
    assert!(matches!(
        repo.auto_snapshot("hourly", "scheduler", &cancel).unwrap(),
        AutoOutcome::Snapshot(_)
    ));
    assert_eq!(repo.breaker().state().unwrap().consecutive_failures, 0);
}

#[test]
fn breaker_counts_failed_auto_snapshots() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.txt", "a");
    let repo = open(dir.path());
    // an unreadable HEAD makes every snapshot fail
    fs::write(dir.path().join(CONTROL_DIR).join("HEAD"), "garbage\n").unwrap();

    let cancel = CancellationToken::new();
    for _ in 0..3 {
        assert!(repo.auto_snapshot("hourly", "scheduler", &cancel).is_err());
    }
    assert!(repo.breaker().is_open().unwrap());
    assert!(matches!(
        repo.auto_snapshot("hourly", "scheduler", &cancel).unwrap(),
        AutoOutcome::Skipped { .. }
    ));
}

#[test]
fn background_snapshots_run_in_order() {
    let dir = TempDir::new().unwrap();
    let repo = open(dir.path());
    let runner = repo.task_runner().unwrap();

    let handles: Vec<_> = (0..3)
        .map(|i| {
            let repo = repo.clone();
            let root = dir.path().to_path_buf();
            runner
                .submit(format!("snapshot {}", i), move |cancel| {
                    write(&root, "a.txt", &format!("version {}", i));
                    let options = SnapshotOptions::new().cancel(cancel.clone());
                    repo.create_snapshot(&format!("version {}", i), "scheduler", &options)
                })
                .unwrap()
        })
        .collect();
    for handle in handles {
        handle.wait().unwrap();
    }

    let messages: Vec<String> = repo
        .history(None)
        .unwrap()
        .into_iter()
        .map(|info| info.commit.message)
        .collect();
    assert_eq!(messages, vec!["version 2", "version 1", "version 0"]);
}
