//! On-disk backup catalog: one subdirectory per backup under
//! `$BACKUP_PATH/backup/`, named by the backup's start time, each holding a
//! key=value manifest, the file list and the copied `database/` tree.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{info, warn};

use crate::wal::{Lsn, BLCKSZ, XLOG_BLCKSZ};
use crate::{Error, Result};

pub const BACKUPS_DIR: &str = "backup";
pub const BACKUP_INI_FILE: &str = "backup.ini";
pub const DATABASE_FILE_LIST: &str = "file_database.txt";
pub const MKDIRS_SH_FILE: &str = "mkdirs.sh";
pub const DATABASE_DIR: &str = "database";
pub const LOCK_FILE: &str = "backup.lock";

/// Directory-name format of a backup ID, e.g. `20260802T103000`.
pub const ID_FORMAT: &str = "%Y%m%dT%H%M%S";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Sentinel for "no byte count": a skipped file's write size, or a size that
/// was never computed.
pub const BYTES_INVALID: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Page,
}

impl BackupMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "full" => Ok(BackupMode::Full),
            "page" => Ok(BackupMode::Page),
            _ => Err(Error::Usage(format!("invalid backup-mode \"{value}\"")).into()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupMode::Full => "FULL",
            BackupMode::Page => "PAGE",
        }
    }
}

impl std::fmt::Display for BackupMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStatus {
    Running,
    Done,
    Error,
    Deleted,
    Corrupt,
}

impl BackupStatus {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "RUNNING" => Ok(BackupStatus::Running),
            "DONE" => Ok(BackupStatus::Done),
            "ERROR" => Ok(BackupStatus::Error),
            "DELETED" => Ok(BackupStatus::Deleted),
            "CORRUPT" => Ok(BackupStatus::Corrupt),
            _ => Err(Error::Corruption(format!("invalid backup status \"{value}\"")).into()),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupStatus::Running => "RUNNING",
            BackupStatus::Done => "DONE",
            BackupStatus::Error => "ERROR",
            BackupStatus::Deleted => "DELETED",
            BackupStatus::Corrupt => "CORRUPT",
        }
    }
}

impl std::fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalog record. The start time doubles as the backup's identity and
/// its directory name.
#[derive(Debug, Clone)]
pub struct Backup {
    pub start_time: NaiveDateTime,
    pub mode: BackupMode,
    pub status: BackupStatus,
    pub tli: u32,
    pub start_lsn: Lsn,
    pub stop_lsn: Lsn,
    pub recovery_xid: u32,
    pub recovery_time: Option<NaiveDateTime>,
    pub block_size: u32,
    pub wal_block_size: u32,
    pub data_bytes_read: i64,
    pub data_bytes_written: i64,
    pub end_time: Option<NaiveDateTime>,
}

impl Backup {
    pub fn new(mode: BackupMode, start_time: NaiveDateTime) -> Self {
        Backup {
            start_time,
            mode,
            status: BackupStatus::Running,
            tli: 0,
            start_lsn: Lsn::INVALID,
            stop_lsn: Lsn::INVALID,
            recovery_xid: 0,
            recovery_time: None,
            block_size: BLCKSZ as u32,
            wal_block_size: XLOG_BLCKSZ as u32,
            data_bytes_read: BYTES_INVALID,
            data_bytes_written: BYTES_INVALID,
            end_time: None,
        }
    }

    pub fn id(&self) -> String {
        self.start_time.format(ID_FORMAT).to_string()
    }

    /// Whether this record can anchor a differential backup.
    pub fn is_parent_candidate(&self, tli: u32) -> bool {
        self.mode == BackupMode::Full && self.status == BackupStatus::Done && self.tli == tli
    }

    /// Enforce the monotone status transitions: RUNNING may move to DONE or
    /// ERROR; DONE may later move to CORRUPT (validate) or DELETED (delete).
    pub fn transition(&mut self, to: BackupStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (BackupStatus::Running, BackupStatus::Done)
                | (BackupStatus::Running, BackupStatus::Error)
                | (BackupStatus::Done, BackupStatus::Corrupt)
                | (BackupStatus::Done, BackupStatus::Deleted)
                | (BackupStatus::Error, BackupStatus::Deleted)
                | (BackupStatus::Corrupt, BackupStatus::Deleted)
        );
        if !allowed {
            return Err(Error::Internal(format!(
                "invalid backup status transition {} -> {}",
                self.status, to
            ))
            .into());
        }
        self.status = to;
        Ok(())
    }
}

/// Exclusive catalog lock; the file is removed when the guard drops.
#[derive(Debug)]
pub struct CatalogLock {
    path: PathBuf,
}

impl Drop for CatalogLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("cannot release catalog lock \"{}\": {e}", self.path.display());
        }
    }
}

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Catalog { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    pub fn backup_dir(&self, backup: &Backup) -> PathBuf {
        self.backups_dir().join(backup.id())
    }

    pub fn database_dir(&self, backup: &Backup) -> PathBuf {
        self.backup_dir(backup).join(DATABASE_DIR)
    }

    pub fn file_list_path(&self, backup: &Backup) -> PathBuf {
        self.backup_dir(backup).join(DATABASE_FILE_LIST)
    }

    pub fn mkdirs_path(&self, backup: &Backup) -> PathBuf {
        self.backup_dir(backup).join(MKDIRS_SH_FILE)
    }

    /// Acquire the exclusive catalog lock. Contention (a live holder) is
    /// reported as `Error::CatalogBusy`; a lock left behind by a dead process
    /// is stolen.
    pub fn lock(&self) -> Result<CatalogLock> {
        if !self.root.is_dir() {
            return Err(Error::Environment(format!(
                "backup catalog \"{}\" does not exist, run init first",
                self.root.display()
            ))
            .into());
        }

        let path = self.root.join(LOCK_FILE);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    return Ok(CatalogLock { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<i32>().ok());
                    match holder {
                        Some(pid) if pid_alive(pid) => {
                            return Err(Error::CatalogBusy.into());
                        }
                        _ => {
                            warn!(
                                "removing stale catalog lock \"{}\" (holder is gone)",
                                path.display()
                            );
                            fs::remove_file(&path)?;
                        }
                    }
                }
                Err(e) => {
                    return Err(Error::Environment(format!(
                        "cannot create lock file \"{}\": {e}",
                        path.display()
                    ))
                    .into());
                }
            }
        }
        Err(Error::CatalogBusy.into())
    }

    /// Read all records, sorted by start time descending. A record left in
    /// RUNNING by a dead process is flipped to ERROR (the caller holds the
    /// lock, so no live backup can own it); `persist_orphans` controls
    /// whether the flip is written back.
    pub fn list(&self, persist_orphans: bool) -> Result<Vec<Backup>> {
        let dir = self.backups_dir();
        let mut backups = Vec::new();
        if !dir.is_dir() {
            return Ok(backups);
        }

        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(start_time) = NaiveDateTime::parse_from_str(name, ID_FORMAT) else {
                continue;
            };

            let mut backup = match self.read_ini(&entry.path(), start_time) {
                Ok(b) => b,
                Err(e) => {
                    warn!("skipping unreadable backup \"{name}\": {e}");
                    continue;
                }
            };

            if backup.status == BackupStatus::Running {
                info!(backup = %backup.id(), "found orphaned RUNNING backup, marking as ERROR");
                backup.end_time = Some(chrono::Local::now().naive_local());
                backup.transition(BackupStatus::Error)?;
                if persist_orphans {
                    self.write_ini(&backup)?;
                }
            }
            backups.push(backup);
        }

        backups.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(backups)
    }

    /// The most recent completed FULL backup on the given timeline, if any.
    /// `list` must be sorted descending.
    pub fn last_data_backup<'a>(list: &'a [Backup], tli: u32) -> Option<&'a Backup> {
        list.iter().find(|b| b.is_parent_candidate(tli))
    }

    pub fn find(list: &[Backup], start_time: NaiveDateTime) -> Option<&Backup> {
        list.iter().find(|b| b.start_time == start_time)
    }

    pub fn create_backup_dir(&self, backup: &Backup) -> Result<()> {
        let dir = self.backup_dir(backup);
        if dir.exists() {
            return Err(Error::Environment(format!(
                "backup directory \"{}\" already exists",
                dir.display()
            ))
            .into());
        }
        fs::create_dir_all(dir.join(DATABASE_DIR))?;
        Ok(())
    }

    /// Persist the manifest with a write-to-temporary-then-rename so a
    /// concurrent reader sees either the old or the new version, never a
    /// torn one.
    pub fn write_ini(&self, backup: &Backup) -> Result<()> {
        let dir = self.backup_dir(backup);
        let target = dir.join(BACKUP_INI_FILE);
        let tmp = dir.join(format!("{BACKUP_INI_FILE}.tmp"));

        let mut buf = String::new();
        buf.push_str("# pg_arman backup manifest\n");
        buf.push_str(&format!("BACKUP_MODE={}\n", backup.mode));
        buf.push_str(&format!("STATUS={}\n", backup.status));
        buf.push_str(&format!("TIMELINE_ID={}\n", backup.tli));
        buf.push_str(&format!("START_LSN={}\n", backup.start_lsn));
        buf.push_str(&format!("STOP_LSN={}\n", backup.stop_lsn));
        buf.push_str(&format!(
            "START_TIME='{}'\n",
            backup.start_time.format(TIME_FORMAT)
        ));
        if let Some(end) = backup.end_time {
            buf.push_str(&format!("END_TIME='{}'\n", end.format(TIME_FORMAT)));
        }
        buf.push_str(&format!("RECOVERY_XID={}\n", backup.recovery_xid));
        if let Some(t) = backup.recovery_time {
            buf.push_str(&format!("RECOVERY_TIME='{}'\n", t.format(TIME_FORMAT)));
        }
        buf.push_str(&format!("BLOCK_SIZE={}\n", backup.block_size));
        buf.push_str(&format!("WAL_BLOCK_SIZE={}\n", backup.wal_block_size));
        buf.push_str(&format!("DATA_BYTES_READ={}\n", backup.data_bytes_read));
        buf.push_str(&format!("DATA_BYTES_WRITTEN={}\n", backup.data_bytes_written));

        fs::write(&tmp, buf)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }

    fn read_ini(&self, dir: &Path, start_time: NaiveDateTime) -> Result<Backup> {
        let path = dir.join(BACKUP_INI_FILE);
        let contents = fs::read_to_string(&path)
            .map_err(|e| Error::Corruption(format!("cannot read \"{}\": {e}", path.display())))?;

        let mut mode = None;
        let mut backup = Backup::new(BackupMode::Full, start_time);
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('\'');
            match key {
                "BACKUP_MODE" => mode = Some(BackupMode::parse(value)?),
                "STATUS" => backup.status = BackupStatus::parse(value)?,
                "TIMELINE_ID" => backup.tli = value.parse().unwrap_or(0),
                "START_LSN" => backup.start_lsn = Lsn::parse(value)?,
                "STOP_LSN" => backup.stop_lsn = Lsn::parse(value)?,
                "START_TIME" => {}
                "END_TIME" => {
                    backup.end_time = NaiveDateTime::parse_from_str(value, TIME_FORMAT).ok()
                }
                "RECOVERY_XID" => backup.recovery_xid = value.parse().unwrap_or(0),
                "RECOVERY_TIME" => {
                    backup.recovery_time = NaiveDateTime::parse_from_str(value, TIME_FORMAT).ok()
                }
                "BLOCK_SIZE" => backup.block_size = value.parse().unwrap_or(0),
                "WAL_BLOCK_SIZE" => backup.wal_block_size = value.parse().unwrap_or(0),
                "DATA_BYTES_READ" => {
                    backup.data_bytes_read = value.parse().unwrap_or(BYTES_INVALID)
                }
                "DATA_BYTES_WRITTEN" => {
                    backup.data_bytes_written = value.parse().unwrap_or(BYTES_INVALID)
                }
                _ => warn!("unknown manifest key \"{key}\" in \"{}\"", path.display()),
            }
        }

        backup.mode = mode.ok_or_else(|| {
            Error::Corruption(format!("BACKUP_MODE missing from \"{}\"", path.display()))
        })?;
        Ok(backup)
    }

    /// Mark records falling out of the retention window as DELETED. Two
    /// policies joined by "keep if either retains": the N most recent FULL
    /// generations, and records younger than D days. Generations are counted
    /// per timeline (backups on different timelines are not chain
    /// compatible), and whole generations are kept or dropped together so a
    /// retained differential never loses its parent. Marking only; the
    /// physical sweep runs separately.
    pub fn apply_retention(
        &self,
        list: &mut [Backup],
        keep_generations: Option<i32>,
        keep_days: Option<i32>,
        now: NaiveDateTime,
    ) -> Result<usize> {
        if keep_generations.is_none() && keep_days.is_none() {
            return Ok(0);
        }

        let mut timelines: Vec<u32> = list.iter().map(|b| b.tli).collect();
        timelines.sort_unstable();
        timelines.dedup();

        let mut deleted = 0;
        for tli in timelines {
            // Generation index per record of this timeline, counting
            // completed FULL backups from the newest down. A differential is
            // anchored by the next FULL below it, so it takes that
            // generation's index.
            let mut generation = 0u32;
            let mut generations: Vec<(usize, u32)> = Vec::new();
            for (i, backup) in list.iter().enumerate() {
                if backup.tli != tli {
                    continue;
                }
                if backup.mode == BackupMode::Full && backup.status == BackupStatus::Done {
                    generation += 1;
                    generations.push((i, generation));
                } else {
                    generations.push((i, generation + 1));
                }
            }

            // The oldest generation containing a record either policy
            // retains.
            let mut boundary = keep_generations.map(|n| n.max(0) as u32).unwrap_or(0);
            for (i, generation) in &generations {
                let backup = &list[*i];
                if backup.status != BackupStatus::Done {
                    continue;
                }
                let by_days = keep_days
                    .map(|d| (now - backup.start_time).num_days() < d as i64)
                    .unwrap_or(false);
                if by_days {
                    boundary = boundary.max(*generation);
                }
            }

            for (i, generation) in &generations {
                let backup = &mut list[*i];
                if *generation <= boundary
                    || matches!(backup.status, BackupStatus::Running | BackupStatus::Deleted)
                {
                    continue;
                }
                info!(backup = %backup.id(), tli, "retention: marking backup as DELETED");
                backup.transition(BackupStatus::Deleted)?;
                self.write_ini(backup)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Remove a deleted record's payload, keeping the manifest so the record
    /// stays visible as DELETED.
    pub fn remove_backup_data(&self, backup: &Backup) -> Result<()> {
        for name in [DATABASE_DIR, DATABASE_FILE_LIST, MKDIRS_SH_FILE] {
            let path = self.backup_dir(backup).join(name);
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else if path.is_file() {
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    Path::new("/proc").join(pid.to_string()).exists()
}
