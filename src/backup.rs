use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use serde::Serialize;

use crate::command::CommandRunner;
use crate::error::BackupError;
use crate::supervisor::Supervisor;

const BACKUP_PREFIX: &str = "ddt-backup-";
const BACKUP_SUFFIX: &str = ".sqlite3";
const DAY_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub modified_ms: u64,
}

#[derive(Debug, Clone)]
pub struct BackupStore {
    backup_dir: PathBuf,
    db_path: PathBuf,
}

fn millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl BackupStore {
    pub fn new(backup_dir: impl Into<PathBuf>, db_path: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            db_path: db_path.into(),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Copies the live database into a new timestamped backup file.
    pub async fn create_backup(&self) -> Result<BackupInfo, BackupError> {
        if !tokio::fs::try_exists(&self.db_path).await.unwrap_or(false) {
            return Err(BackupError::MissingDatabase(self.db_path.clone()));
        }
        tokio::fs::create_dir_all(&self.backup_dir).await?;

        let stamp = millis(SystemTime::now());
        let mut name = format!("{BACKUP_PREFIX}{stamp}{BACKUP_SUFFIX}");
        let mut n = 1;
        while tokio::fs::try_exists(self.backup_dir.join(&name)).await.unwrap_or(false) {
            name = format!("{BACKUP_PREFIX}{stamp}-{n}{BACKUP_SUFFIX}");
            n += 1;
        }
        let path = self.backup_dir.join(&name);
        tokio::fs::copy(&self.db_path, &path).await?;
        info!("database backed up to {}", path.display());
        self.describe(name, path).await
    }

    /// Newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupInfo>, BackupError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.backup_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_backup_name(&name) {
                continue;
            }
            out.push(self.describe(name, entry.path()).await?);
        }
        out.sort_by(|a, b| {
            b.modified_ms
                .cmp(&a.modified_ms)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(out)
    }

    pub async fn delete_backup(&self, name: &str) -> Result<(), BackupError> {
        let path = self.resolve(name).await?;
        tokio::fs::remove_file(&path).await?;
        info!("backup {} deleted", path.display());
        Ok(())
    }

    /// Deletes backups last modified more than `days` days ago and returns
    /// them. Files with an unreadable mtime are kept.
    pub async fn prune_older_than(&self, days: u64) -> Result<Vec<BackupInfo>, BackupError> {
        let cutoff = millis(SystemTime::now()).saturating_sub(days.saturating_mul(DAY_MS));
        let mut removed = Vec::new();
        for backup in self.list_backups().await? {
            if backup.modified_ms == 0 || backup.modified_ms >= cutoff {
                continue;
            }
            tokio::fs::remove_file(&backup.path).await?;
            removed.push(backup);
        }
        if !removed.is_empty() {
            info!(
                "pruned {} backup(s) older than {days} day(s) from {}",
                removed.len(),
                self.backup_dir.display()
            );
        }
        Ok(removed)
    }

    /// Swaps `name` in as the live database with the server stopped. The
    /// current database is backed up first; that safety copy is returned.
    pub async fn restore<R: CommandRunner>(
        &self,
        supervisor: &Supervisor<R>,
        name: &str,
    ) -> Result<Option<BackupInfo>, BackupError> {
        let source = self.resolve(name).await?;
        supervisor
            .with_server_stopped(|| self.swap_in(&source))
            .await?
    }

    async fn swap_in(&self, source: &Path) -> Result<Option<BackupInfo>, BackupError> {
        let safety = match self.create_backup().await {
            Ok(info) => Some(info),
            Err(BackupError::MissingDatabase(_)) => None,
            Err(err) => return Err(err),
        };

        let mut staged = self.db_path.as_os_str().to_owned();
        staged.push(".restore");
        let staged = PathBuf::from(staged);
        tokio::fs::copy(source, &staged).await?;
        tokio::fs::rename(&staged, &self.db_path).await?;

        for suffix in ["-wal", "-shm", "-journal"] {
            let mut side = self.db_path.as_os_str().to_owned();
            side.push(suffix);
            let side = PathBuf::from(side);
            if tokio::fs::try_exists(&side).await.unwrap_or(false) {
                if let Err(err) = tokio::fs::remove_file(&side).await {
                    warn!("cannot remove stale {}: {err}", side.display());
                }
            }
        }
        info!("database restored from {}", source.display());
        Ok(safety)
    }

    /// Backup names only; anything that could point outside the backup
    /// directory is treated as missing.
    async fn resolve(&self, name: &str) -> Result<PathBuf, BackupError> {
        let path = self.backup_dir.join(name);
        let plain = Path::new(name).file_name().map(|n| n == name).unwrap_or(false);
        if !plain
            || !is_backup_name(name)
            || !tokio::fs::try_exists(&path).await.unwrap_or(false)
        {
            return Err(BackupError::NotFound(path));
        }
        Ok(path)
    }

    async fn describe(&self, name: String, path: PathBuf) -> Result<BackupInfo, BackupError> {
        let meta = tokio::fs::metadata(&path).await?;
        Ok(BackupInfo {
            name,
            size: meta.len(),
            modified_ms: meta.modified().map(millis).unwrap_or(0),
            path,
        })
    }
}

fn is_backup_name(name: &str) -> bool {
    name.starts_with(BACKUP_PREFIX) && name.ends_with(BACKUP_SUFFIX)
}
