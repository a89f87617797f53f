//! Keep the SQLite database across rebuilds: copy it aside, then copy it back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::paths::SQLITE_DB_PATH_ENV;

const DATABASE_FILE_NAME: &str = "securesignin.db";
const TEMP_BACKUP_NAME: &str = "pre-build-backup.db";

/// Database locations and the backup directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreservePaths {
    /// Possible database locations, highest priority first.
    pub candidates: Vec<PathBuf>,
    pub backup_dir: PathBuf,
}

impl PreservePaths {
    pub fn new(home: &Path, cwd: &Path, env_database: Option<PathBuf>) -> Self {
        let mut candidates = vec![
            home.join(".securesignin").join(DATABASE_FILE_NAME),
            cwd.join("data").join(DATABASE_FILE_NAME),
        ];
        candidates.extend(env_database.filter(|path| !path.as_os_str().is_empty()));
        candidates.push(Path::new("/app/data").join(DATABASE_FILE_NAME));
        Self {
            candidates,
            backup_dir: home
                .join(".config")
                .join("secure-sign-in-app")
                .join("backups"),
        }
    }

    pub fn detect() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
        let cwd = std::env::current_dir().context("read current directory")?;
        Ok(Self::new(
            &home,
            &cwd,
            std::env::var_os(SQLITE_DB_PATH_ENV).map(PathBuf::from),
        ))
    }

    /// First existing candidate, or the first candidate when none exists.
    pub fn database(&self) -> Option<&Path> {
        self.candidates
            .iter()
            .find(|path| path.is_file())
            .or_else(|| self.candidates.first())
            .map(PathBuf::as_path)
    }

    pub fn temp_backup(&self) -> PathBuf {
        self.backup_dir.join(TEMP_BACKUP_NAME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Saved { from: PathBuf, to: PathBuf },
    NothingToBackUp,
}

/// Result of a restore that found a backup to restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<PathBuf>,
    /// Timestamped copy kept in the backup directory.
    pub archived: PathBuf,
    pub failures: Vec<(PathBuf, String)>,
}

/// Copy the working database to the temporary backup.
pub fn backup_database(paths: &PreservePaths) -> Result<BackupOutcome> {
    let Some(database) = paths.database().filter(|path| path.is_file()) else {
        info!("no database found, nothing to back up");
        return Ok(BackupOutcome::NothingToBackUp);
    };

    fs::create_dir_all(&paths.backup_dir)
        .with_context(|| format!("create {}", paths.backup_dir.display()))?;
    let target = paths.temp_backup();
    fs::copy(database, &target)
        .with_context(|| format!("copy {} to {}", database.display(), target.display()))?;
    info!(from = %database.display(), to = %target.display(), "database backed up");
    Ok(BackupOutcome::Saved {
        from: database.to_path_buf(),
        to: target,
    })
}

/// Restore the temporary backup. Returns `None` when there is nothing to restore.
pub fn restore_database(paths: &PreservePaths, now: DateTime<Utc>) -> Result<Option<RestoreReport>> {
    let backup = paths.temp_backup();
    if !backup.is_file() {
        info!(path = %backup.display(), "no backup found, nothing to restore");
        return Ok(None);
    }
    let database = paths
        .database()
        .ok_or_else(|| anyhow!("no database location configured"))?
        .to_path_buf();

    if let Some(parent) = database.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::copy(&backup, &database)
        .with_context(|| format!("restore {} to {}", backup.display(), database.display()))?;
    info!(to = %database.display(), "database restored");

    let archived = paths.backup_dir.join(format!("backup-{}.db", archive_stamp(now)));
    fs::copy(&backup, &archived).with_context(|| format!("write {}", archived.display()))?;

    let mut report = RestoreReport {
        restored: vec![database.clone()],
        archived,
        failures: Vec::new(),
    };
    for other in paths.candidates.iter().filter(|path| **path != database) {
        if !other.parent().is_some_and(Path::is_dir) {
            continue;
        }
        match fs::copy(&backup, other) {
            Ok(_) => {
                info!(to = %other.display(), "database restored to alternative location");
                report.restored.push(other.clone());
            }
            Err(err) => {
                warn!(to = %other.display(), err = %err, "could not restore to alternative location");
                report.failures.push((other.clone(), err.to_string()));
            }
        }
    }
    Ok(Some(report))
}

/// ISO-8601 UTC with `:` and `.` replaced so it is a safe file name.
fn archive_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H-%M-%S-%3fZ").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    fn layout(tmp: &TempDir) -> PreservePaths {
        let root = tmp.path();
        PreservePaths {
            candidates: vec![
                root.join("home/.securesignin/securesignin.db"),
                root.join("project/data/securesignin.db"),
                root.join("docker/data/securesignin.db"),
            ],
            backup_dir: root.join("home/.config/secure-sign-in-app/backups"),
        }
    }

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).single().expect("valid time")
    }

    #[test]
    fn default_candidates_follow_priority_order() {
        let paths = PreservePaths::new(
            Path::new("/home/u"),
            Path::new("/work"),
            Some(PathBuf::from("/srv/db.sqlite")),
        );
        assert_eq!(
            paths.candidates,
            [
                PathBuf::from("/home/u/.securesignin/securesignin.db"),
                PathBuf::from("/work/data/securesignin.db"),
                PathBuf::from("/srv/db.sqlite"),
                PathBuf::from("/app/data/securesignin.db"),
            ]
        );
        assert_eq!(
            paths.temp_backup(),
            PathBuf::from("/home/u/.config/secure-sign-in-app/backups/pre-build-backup.db")
        );
    }

    #[test]
    fn empty_env_override_is_ignored() {
        let paths = PreservePaths::new(Path::new("/h"), Path::new("/w"), Some(PathBuf::new()));
        assert_eq!(paths.candidates.len(), 3);
    }

    #[test]
    fn backup_without_database_is_a_no_op() {
        let tmp = TempDir::new().expect("tmp");
        let paths = layout(&tmp);
        assert_eq!(
            backup_database(&paths).expect("backup"),
            BackupOutcome::NothingToBackUp
        );
        assert!(!paths.backup_dir.exists());
    }

    #[test]
    fn backup_copies_the_first_existing_database() {
        let tmp = TempDir::new().expect("tmp");
        let paths = layout(&tmp);
        let second = &paths.candidates[1];
        fs::create_dir_all(second.parent().expect("parent")).expect("mkdir");
        fs::write(second, b"rows").expect("write db");

        let outcome = backup_database(&paths).expect("backup");
        assert_eq!(
            outcome,
            BackupOutcome::Saved {
                from: second.clone(),
                to: paths.temp_backup(),
            }
        );
        assert_eq!(fs::read(paths.temp_backup()).expect("read"), b"rows");
    }

    #[test]
    fn restore_without_backup_reports_nothing() {
        let tmp = TempDir::new().expect("tmp");
        assert_eq!(restore_database(&layout(&tmp), stamp()).expect("restore"), None);
    }

    #[test]
    fn restore_writes_primary_archive_and_existing_alternatives() {
        let tmp = TempDir::new().expect("tmp");
        let paths = layout(&tmp);
        fs::create_dir_all(&paths.backup_dir).expect("mkdir backups");
        fs::write(paths.temp_backup(), b"saved").expect("write backup");
        // Only the docker location's directory exists besides the primary.
        fs::create_dir_all(paths.candidates[2].parent().expect("parent")).expect("mkdir docker");

        let report = restore_database(&paths, stamp())
            .expect("restore")
            .expect("something restored");

        assert_eq!(
            report.restored,
            [paths.candidates[0].clone(), paths.candidates[2].clone()]
        );
        assert!(report.failures.is_empty());
        assert_eq!(
            report.archived,
            paths.backup_dir.join("backup-2026-03-04T05-06-07-000Z.db")
        );
        assert_eq!(fs::read(&paths.candidates[0]).expect("primary"), b"saved");
        assert_eq!(fs::read(&report.archived).expect("archive"), b"saved");
        assert!(!paths.candidates[1].exists());
    }

    #[test]
    fn alternative_failures_are_recorded() {
        let tmp = TempDir::new().expect("tmp");
        let paths = layout(&tmp);
        fs::create_dir_all(&paths.backup_dir).expect("mkdir backups");
        fs::write(paths.temp_backup(), b"saved").expect("write backup");
        // A directory where the file should go makes the copy fail.
        fs::create_dir_all(&paths.candidates[1]).expect("mkdir blocker");

        let report = restore_database(&paths, stamp())
            .expect("restore")
            .expect("something restored");
        assert_eq!(report.restored, [paths.candidates[0].clone()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, paths.candidates[1]);
    }
}
