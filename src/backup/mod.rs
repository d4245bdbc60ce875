//! Backup orchestration: catalog locking, server coordination, the WAL scan
//! for differential page discovery, and the file copy loop.

pub mod datafile;
pub mod filetree;
pub mod pagemap;

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Local, Timelike};
use tracing::{debug, info, warn};

use crate::catalog::{Backup, BackupMode, BackupStatus, Catalog, BYTES_INVALID};
use crate::options::Options;
use crate::server::Server;
use crate::wal::{self, Lsn};
use crate::{Error, Result};

use filetree::FileEntry;
use pagemap::BlockSink;

const BACKUP_LABEL_FILE: &str = "backup_label";

/// Take one backup according to the resolved options and return the
/// completed record.
pub fn do_backup(opts: &Options) -> Result<Backup> {
    let backup_root = opts.require_backup_path()?.to_path_buf();
    let pgdata = opts.require_pgdata()?.to_path_buf();
    let mode = opts.require_backup_mode()?;
    let arclog = opts.require_arclog_path()?.to_path_buf();

    crate::install_signal_handler();

    let catalog = Catalog::new(&backup_root);
    let _lock = catalog.lock()?;

    // Reading the catalog under the lock also repairs records orphaned by a
    // crashed run; must happen before our own RUNNING record exists.
    let backup_list = catalog.list(!opts.check)?;

    // A differential backup is pointless without any completed full backup;
    // refuse before touching the server or the catalog.
    if mode == BackupMode::Page
        && !backup_list
            .iter()
            .any(|b| b.mode == BackupMode::Full && b.status == BackupStatus::Done)
    {
        return Err(Error::Usage(
            "Valid full backup not found for differential backup. \
             Either create a full backup or validate existing one."
                .into(),
        )
        .into());
    }

    let start_time = Local::now().naive_local().with_nanosecond(0).unwrap();
    let current = Backup::new(mode, start_time);
    info!(backup = %current.id(), mode = %mode, "backup start");

    if !opts.check {
        catalog.create_backup_dir(&current)?;
        catalog.write_ini(&current)?;
    }

    let server = Server::new(opts.connection.clone(), &pgdata);
    let mut guard = CleanupGuard::new(catalog.clone(), server.clone(), &pgdata, current, opts.check);

    run_backup(&mut guard, &catalog, &server, &pgdata, &arclog, opts, &backup_list)?;
    let current = guard.disarm();

    let mut retained = catalog.list(false)?;
    catalog.apply_retention(
        &mut retained,
        opts.keep_data_generations,
        opts.keep_data_days,
        Local::now().naive_local(),
    )?;

    info!(backup = %current.id(), "backup completed");
    Ok(current)
}

fn run_backup(
    guard: &mut CleanupGuard,
    catalog: &Catalog,
    server: &Server,
    pgdata: &Path,
    arclog: &Path,
    opts: &Options,
    backup_list: &[Backup],
) -> Result<()> {
    server.check_version()?;

    if server.is_standby() {
        return Err(Error::Server("Backup cannot run on a standby.".into()).into());
    }

    let tli = server.current_timeline()?;
    guard.backup_mut().tli = tli;

    let prev_backup = if guard.backup().mode == BackupMode::Page {
        let prev = Catalog::last_data_backup(backup_list, tli).ok_or_else(|| {
            Error::Usage(
                "Valid full backup not found for differential backup. \
                 Either create a full backup or validate existing one."
                    .into(),
            )
        })?;
        debug!(parent = %prev.id(), lsn = %prev.start_lsn, "differential parent located");
        Some(prev.clone())
    } else {
        None
    };

    let label = format!(
        "{} with pg_arman",
        guard.backup().start_time.format("%Y-%m-%d %H:%M:%S")
    );
    let start_lsn = server.start_backup(&label, opts.smooth_checkpoint)?;
    guard.backup_mut().start_lsn = start_lsn;

    // If the server did not write a backup label we are not actually inside
    // an online backup; stop it and refuse to continue.
    if !pgdata.join(BACKUP_LABEL_FILE).is_file() {
        server.stop_backup_quiet();
        return Err(Error::Protocol("backup_label does not exist in PGDATA".into()).into());
    }

    let mut files = filetree::list_data_directory(pgdata)?;
    if !opts.check {
        filetree::write_mkdirs_script(&catalog.mkdirs_path(guard.backup()), &files)?;
    }

    // Differential mode: make sure every segment up to the start position is
    // archived, then scan the WAL written since the parent backup started.
    let mut prev_files: Option<Vec<FileEntry>> = None;
    if let Some(prev) = &prev_backup {
        let switch_lsn = server.force_switch()?;
        server.wait_for_archive(switch_lsn, tli)?;

        prev_files = Some(filetree::read_file_list(&catalog.file_list_path(prev))?);

        let mut sink = BlockSink::new(pgdata);
        for file in &files {
            if file.is_datafile {
                sink.register(pgdata.join(&file.path));
            }
        }
        wal::extract_page_map(arclog, prev.start_lsn, tli, start_lsn, &mut sink)?;
        for file in &mut files {
            if file.is_datafile {
                if let Some(map) = sink.take(&pgdata.join(&file.path)) {
                    file.pagemap = map;
                }
            }
        }
    }

    backup_files(
        pgdata,
        &catalog.database_dir(guard.backup()),
        &mut files,
        prev_files.as_deref(),
        prev_backup.as_ref().map(|b| b.start_lsn),
        opts.check,
    )?;

    let stop = server.stop_backup()?;
    {
        let backup = guard.backup_mut();
        backup.stop_lsn = stop.lsn;
        backup.tli = stop.tli;
        backup.recovery_xid = stop.xid;
        backup.recovery_time = Some(stop.time);
    }

    if !opts.check {
        filetree::write_file_list(&catalog.file_list_path(guard.backup()), &files)?;
    }

    // For a full backup the total amount of data written counts; for a
    // differential backup only the data read counts.
    let mut read: i64 = 0;
    let mut written: i64 = 0;
    for file in files.iter().filter(|f| f.is_regular()) {
        if file.read_size != BYTES_INVALID {
            read += match guard.backup().mode {
                BackupMode::Full => file.size,
                BackupMode::Page => file.read_size,
            };
        }
        if file.write_size != BYTES_INVALID {
            written += file.write_size;
        }
    }
    {
        let backup = guard.backup_mut();
        backup.data_bytes_read = read;
        backup.data_bytes_written = written;
        backup.end_time = Some(Local::now().naive_local());
        backup.transition(BackupStatus::Done)?;
    }
    if !opts.check {
        catalog.write_ini(guard.backup())?;
    }
    info!(read, written, "database backup completed");
    Ok(())
}

/// Copy every listed entry into the backup's database directory. In
/// differential mode, relation files present in the parent are copied as
/// page deltas; everything else is copied verbatim.
fn backup_files(
    from_root: &Path,
    to_root: &Path,
    files: &mut [FileEntry],
    prev_files: Option<&[FileEntry]>,
    parent_lsn: Option<Lsn>,
    check: bool,
) -> Result<()> {
    let total = files.len();
    for (i, file) in files.iter_mut().enumerate() {
        if crate::interrupted() {
            return Err(Error::Interrupted("backup").into());
        }
        debug!("({}/{}) {}", i + 1, total, file.path.display());

        // A wall clock behind a file's mtime means the clock was rewound and
        // the mtime-based skip logic cannot be trusted.
        if epoch_seconds() < file.mtime {
            return Err(Error::Environment(
                "current time may be rewound. Please retry with full backup mode.".into(),
            )
            .into());
        }

        if file.is_dir() {
            if !check {
                std::fs::create_dir_all(to_root.join(&file.path))?;
            }
            continue;
        }
        if file.is_symlink() {
            // recreated from the scaffolding script on restore
            continue;
        }
        if !file.is_regular() {
            warn!(
                "unexpected file type {:o} for \"{}\"",
                file.mode,
                file.path.display()
            );
            continue;
        }

        // Unmodified since the parent backup: record as skipped, the restore
        // side takes it from the parent.
        let prev_entry = prev_files.and_then(|prev| {
            prev.binary_search_by(|p| p.path.cmp(&file.path))
                .ok()
                .map(|i| &prev[i])
        });
        if let Some(prev) = prev_entry {
            if prev.mtime == file.mtime {
                file.write_size = BYTES_INVALID;
                debug!("skip unmodified \"{}\"", file.path.display());
                continue;
            }
        }

        // Wait out the current second when it equals the file's mtime, so
        // the copy holds every write stamped with that mtime
        // (second-resolution filesystems).
        while epoch_seconds() == file.mtime {
            std::thread::sleep(Duration::from_millis(100));
        }

        if check {
            continue;
        }

        let copied = match (parent_lsn, file.is_datafile, prev_entry.is_some()) {
            (Some(lsn), true, true) => datafile::backup_data_file(from_root, to_root, file, lsn)?,
            _ => datafile::copy_file(from_root, to_root, file)?,
        };
        if !copied {
            // vanished between scan and copy
            file.write_size = BYTES_INVALID;
            debug!("skip vanished \"{}\"", file.path.display());
        }
    }
    Ok(())
}

fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Rollback guard for a running backup. Armed from record creation until the
/// run completes; on drop it stops a dangling server-side backup and flips a
/// still-RUNNING record to ERROR, so no RUNNING record survives any exit
/// path.
struct CleanupGuard {
    catalog: Catalog,
    server: Server,
    pgdata: PathBuf,
    backup: Option<Backup>,
    check: bool,
}

impl CleanupGuard {
    fn new(catalog: Catalog, server: Server, pgdata: &Path, backup: Backup, check: bool) -> Self {
        CleanupGuard {
            catalog,
            server,
            pgdata: pgdata.to_path_buf(),
            backup: Some(backup),
            check,
        }
    }

    fn backup(&self) -> &Backup {
        self.backup.as_ref().expect("guard already disarmed")
    }

    fn backup_mut(&mut self) -> &mut Backup {
        self.backup.as_mut().expect("guard already disarmed")
    }

    fn disarm(mut self) -> Backup {
        self.backup.take().expect("guard already disarmed")
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(mut backup) = self.backup.take() else {
            return;
        };

        if self.pgdata.join(BACKUP_LABEL_FILE).is_file() {
            warn!("backup_label exists, stopping server-side backup");
            self.server.stop_backup_quiet();
        }

        if backup.status == BackupStatus::Running {
            warn!(backup = %backup.id(), "backup is running, updating its status to ERROR");
            backup.end_time = Some(Local::now().naive_local());
            if backup.transition(BackupStatus::Error).is_ok() && !self.check {
                if let Err(e) = self.catalog.write_ini(&backup) {
                    warn!("cannot persist ERROR status: {e}");
                }
            }
        }
    }
}
