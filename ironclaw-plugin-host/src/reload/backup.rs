//! Timestamped plugin source snapshots
//!
//! Files are named `<plugin>_<YYYYMMDD_HHMMSS>.<ext>`, with `-<n>` before the
//! extension when a second snapshot lands in the same second.

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::SystemTime;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const TIMESTAMP_LEN: usize = 15;

/// A backup as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    /// RFC 3339 creation time
    pub timestamp: String,
    pub size_bytes: u64,
}

#[derive(Debug)]
struct BackupFile {
    path: PathBuf,
    taken_at: NaiveDateTime,
    sequence: u32,
    modified: SystemTime,
    size_bytes: u64,
}

/// Backup directory shared by all plugins
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    keep: usize,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep,
        }
    }

    /// Write a new snapshot of `plugin`'s source
    pub fn create(&self, plugin: &str, extension: &str, contents: &[u8]) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();

        let mut sequence = 0u32;
        loop {
            let file_name = match sequence {
                0 => format!("{plugin}_{stamp}.{extension}"),
                n => format!("{plugin}_{stamp}-{n}.{extension}"),
            };
            let path = self.dir.join(file_name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(contents)?;
                    file.sync_all()?;
                    tracing::debug!(plugin = %plugin, path = %path.display(), "Created backup");
                    return Ok(path);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => sequence += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Backups of `plugin`, newest first
    pub fn list(&self, plugin: &str) -> io::Result<Vec<BackupInfo>> {
        Ok(self
            .scan(plugin)?
            .into_iter()
            .map(|backup| BackupInfo {
                timestamp: backup
                    .taken_at
                    .and_local_timezone(Local)
                    .earliest()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| backup.taken_at.and_utc().to_rfc3339()),
                path: backup.path,
                size_bytes: backup.size_bytes,
            })
            .collect())
    }

    /// Delete all but the newest `keep` backups of `plugin`
    pub fn prune(&self, plugin: &str) -> io::Result<usize> {
        let mut removed = 0;
        for backup in self.scan(plugin)?.into_iter().skip(self.keep) {
            fs::remove_file(&backup.path)?;
            removed += 1;
        }
        if removed > 0 {
            tracing::debug!(plugin = %plugin, removed, "Pruned old backups");
        }
        Ok(removed)
    }

    fn scan(&self, plugin: &str) -> io::Result<Vec<BackupFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some((taken_at, sequence)) = file_name
                .to_str()
                .and_then(|file_name| parse_backup_name(plugin, file_name))
            else {
                continue;
            };

            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            backups.push(BackupFile {
                path: entry.path(),
                taken_at,
                sequence,
                modified: metadata.modified()?,
                size_bytes: metadata.len(),
            });
        }

        backups.sort_by(|a, b| {
            (b.modified, b.taken_at, b.sequence).cmp(&(a.modified, a.taken_at, a.sequence))
        });
        Ok(backups)
    }
}

/// Parse `<plugin>_<timestamp>[-<n>].<ext>` for exactly this plugin name
fn parse_backup_name(plugin: &str, file_name: &str) -> Option<(NaiveDateTime, u32)> {
    let rest = file_name.strip_prefix(plugin)?.strip_prefix('_')?;
    let (stem, extension) = rest.split_once('.')?;
    if extension.is_empty() {
        return None;
    }

    let stamp = stem.get(..TIMESTAMP_LEN)?;
    let taken_at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;

    let sequence = match &stem[TIMESTAMP_LEN..] {
        "" => 0,
        suffix => suffix.strip_prefix('-')?.parse().ok()?,
    };
    Some((taken_at, sequence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_backup_names() {
        assert!(parse_backup_name("echo", "echo_20240102_030405.wat").is_some());
        assert_eq!(
            parse_backup_name("echo", "echo_20240102_030405-2.wasm").map(|(_, n)| n),
            Some(2)
        );
        assert!(parse_backup_name("echo", "echo_v2_20240102_030405.wat").is_none());
        assert!(parse_backup_name("echo", "echo_20240102_030405").is_none());
        assert!(parse_backup_name("echo", "echo_20241302_030405.wat").is_none());
        assert!(parse_backup_name("echo", "echo_20240102_030405x.wat").is_none());
    }

    #[test]
    fn test_create_list_newest_first() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path().join("backups"), 5);

        let first = store.create("echo", "wat", b"one").unwrap();
        let second = store.create("echo", "wat", b"second").unwrap();
        store.create("echo_v2", "wat", b"other plugin").unwrap();
        assert_ne!(first, second);

        let listed = store.list("echo").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second);
        assert_eq!(listed[0].size_bytes, 6);
        assert_eq!(listed[1].path, first);
        assert!(chrono::DateTime::parse_from_rfc3339(&listed[0].timestamp).is_ok());
    }

    #[test]
    fn test_prune_keeps_newest() {
        let temp = TempDir::new().unwrap();
        let store = BackupStore::new(temp.path(), 2);

        let paths: Vec<PathBuf> = (0..4)
            .map(|i| store.create("echo", "wat", format!("v{i}").as_bytes()).unwrap())
            .collect();

        assert_eq!(store.prune("echo").unwrap(), 2);
        let kept: Vec<PathBuf> = store.list("echo").unwrap().into_iter().map(|b| b.path).collect();
        assert_eq!(kept, vec![paths[3].clone(), paths[2].clone()]);
    }

    #[test]
    fn test_missing_directory_lists_nothing() {
        let store = BackupStore::new("/nonexistent/backups", 5);
        assert!(store.list("echo").unwrap().is_empty());
    }
}
