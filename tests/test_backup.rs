//! FILENAME: tests/test_backup.rs
//! Integration tests for database backups and restore-with-server-stopped.

mod common;

use std::path::Path;
use std::time::{Duration, SystemTime};

use common::{closed_port, http_server, FakeRunner};
use ddt_manager::backup::BackupStore;
use ddt_manager::error::BackupError;
use ddt_manager::{Supervisor, SupervisorConfig, SupervisorErrorKind};

fn store(root: &Path) -> BackupStore {
    BackupStore::new(root.join("backups"), root.join("db.sqlite3"))
}

fn supervisor(root: &Path, port: u16) -> Supervisor<FakeRunner> {
    let config = SupervisorConfig {
        port,
        server_dir: root.to_path_buf(),
        env_dir: root.join("venv"),
        probe_timeout_ms: 200,
        ..SupervisorConfig::default()
    };
    Supervisor::new(config, FakeRunner::healthy()).unwrap()
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

fn age(path: &Path, days: u64) {
    let when = SystemTime::now() - Duration::from_secs(days * 24 * 60 * 60);
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(when)
        .unwrap();
}

// ============================================================================
// CREATE, LIST, DELETE
// ============================================================================

#[tokio::test]
async fn test_create_list_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());
    std::fs::write(dir.path().join("db.sqlite3"), "v1").unwrap();

    assert!(backups.list_backups().await.unwrap().is_empty());

    let first = backups.create_backup().await.unwrap();
    assert!(first.name.starts_with("ddt-backup-"));
    assert!(first.name.ends_with(".sqlite3"));
    assert_eq!(first.size, 2);
    assert_eq!(read(&first.path), "v1");

    tokio::time::sleep(Duration::from_millis(20)).await;
    std::fs::write(dir.path().join("db.sqlite3"), "v2-longer").unwrap();
    let second = backups.create_backup().await.unwrap();

    let listed = backups.list_backups().await.unwrap();
    let names: Vec<&str> = listed.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(names, vec![second.name.as_str(), first.name.as_str()]);

    backups.delete_backup(&first.name).await.unwrap();
    assert_eq!(backups.list_backups().await.unwrap().len(), 1);
    assert!(matches!(
        backups.delete_backup(&first.name).await,
        Err(BackupError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_prune_removes_only_backups_past_retention() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());
    std::fs::write(dir.path().join("db.sqlite3"), "live").unwrap();

    let old = backups.create_backup().await.unwrap();
    let recent = backups.create_backup().await.unwrap();
    age(&old.path, 45);
    age(&recent.path, 3);
    std::fs::write(dir.path().join("backups/notes.txt"), "x").unwrap();
    age(&dir.path().join("backups/notes.txt"), 90);

    let removed = backups.prune_older_than(30).await.unwrap();
    let removed: Vec<&str> = removed.iter().map(|b| b.name.as_str()).collect();
    assert_eq!(removed, vec![old.name.as_str()]);

    let left = backups.list_backups().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].name, recent.name);
    assert!(dir.path().join("backups/notes.txt").exists());
    assert_eq!(read(&dir.path().join("db.sqlite3")), "live");

    assert!(backups.prune_older_than(30).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_prune_without_backup_dir_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());

    assert!(backups.prune_older_than(0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unrelated_files_are_not_listed() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());
    std::fs::create_dir_all(dir.path().join("backups")).unwrap();
    std::fs::write(dir.path().join("backups/notes.txt"), "x").unwrap();

    assert!(backups.list_backups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backup_without_database_fails() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());

    let err = backups.create_backup().await.unwrap_err();
    assert!(matches!(err, BackupError::MissingDatabase(_)));
}

#[tokio::test]
async fn test_names_outside_the_backup_dir_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());
    std::fs::write(dir.path().join("db.sqlite3"), "live").unwrap();
    backups.create_backup().await.unwrap();

    for name in [
        "../db.sqlite3",
        "ddt-backup-1/../../db.sqlite3",
        "db.sqlite3",
        "",
    ] {
        assert!(
            matches!(
                backups.delete_backup(name).await,
                Err(BackupError::NotFound(_))
            ),
            "{name} should be rejected"
        );
    }
    assert_eq!(read(&dir.path().join("db.sqlite3")), "live");
}

// ============================================================================
// RESTORE
// ============================================================================

#[tokio::test]
async fn test_restore_swaps_database_and_keeps_safety_copy() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());
    let db = dir.path().join("db.sqlite3");
    std::fs::write(&db, "old").unwrap();
    let saved = backups.create_backup().await.unwrap();

    std::fs::write(&db, "new").unwrap();
    std::fs::write(dir.path().join("db.sqlite3-wal"), "pending").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let supervisor = supervisor(dir.path(), closed_port().await);
    let safety = backups
        .restore(&supervisor, &saved.name)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(read(&db), "old");
    assert_eq!(read(&safety.path), "new");
    assert!(!dir.path().join("db.sqlite3-wal").exists());
    assert!(!dir.path().join("db.sqlite3.restore").exists());
    assert_eq!(backups.list_backups().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_restore_refuses_while_a_foreign_server_answers() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());
    let db = dir.path().join("db.sqlite3");
    std::fs::write(&db, "old").unwrap();
    let saved = backups.create_backup().await.unwrap();
    std::fs::write(&db, "new").unwrap();

    let (port, server) = http_server("200 OK").await;
    let supervisor = supervisor(dir.path(), port);
    let err = backups.restore(&supervisor, &saved.name).await.unwrap_err();

    match err {
        BackupError::Supervisor(err) => {
            assert!(matches!(err.kind, SupervisorErrorKind::ExternalServer(_)))
        }
        other => panic!("expected a supervisor error, got {other:?}"),
    }
    assert_eq!(read(&db), "new");
    server.abort();
}

#[tokio::test]
async fn test_restore_after_shutdown_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let backups = store(dir.path());
    std::fs::write(dir.path().join("db.sqlite3"), "old").unwrap();
    let saved = backups.create_backup().await.unwrap();

    let supervisor = supervisor(dir.path(), closed_port().await);
    supervisor.shutdown().await;

    let err = backups.restore(&supervisor, &saved.name).await.unwrap_err();
    assert!(matches!(err, BackupError::Supervisor(ref e) if e.is_cancelled()));
}
