//! Implementation of `pg_arman delete`.

use std::fs;

use tracing::info;

use crate::catalog::{BackupMode, BackupStatus, Catalog};
use crate::options::{parse_time, Options};
use crate::wal::segment_file_name;
use crate::{Error, Result};

pub fn execute(opts: &Options, date: Option<&str>) -> Result<()> {
    let backup_root = opts.require_backup_path()?;
    let arclog = opts.arclog_path.clone().ok_or_else(|| {
        Error::Usage("delete command needs ARCLOG_PATH (-A, --arclog-path) option".into())
    })?;
    let date = date.ok_or_else(|| {
        Error::Usage("required delete range option not specified: delete DATE".into())
    })?;
    let cutoff = parse_time(date)?;

    let catalog = Catalog::new(backup_root);
    let _lock = catalog.lock()?;
    let mut list = catalog.list(!opts.check)?;

    // When the oldest record we keep is a differential, the newest FULL
    // older than the cutoff stays as its anchor.
    let oldest_kept_mode = list
        .iter()
        .filter(|b| b.start_time >= cutoff && b.status == BackupStatus::Done)
        .min_by_key(|b| b.start_time)
        .map(|b| b.mode);
    let mut anchor_kept = !matches!(oldest_kept_mode, Some(BackupMode::Page));

    let mut deleted = 0;
    for backup in list.iter_mut().filter(|b| b.start_time < cutoff) {
        if matches!(backup.status, BackupStatus::Deleted | BackupStatus::Running) {
            continue;
        }
        if !anchor_kept && backup.mode == BackupMode::Full && backup.status == BackupStatus::Done
        {
            info!(backup = %backup.id(), "keeping full backup as anchor of retained differentials");
            anchor_kept = true;
            continue;
        }
        info!(backup = %backup.id(), "deleting backup");
        if !opts.check {
            backup.transition(BackupStatus::Deleted)?;
            catalog.write_ini(backup)?;
            catalog.remove_backup_data(backup)?;
        }
        deleted += 1;
    }

    // Archived segments older than the oldest remaining backup's start
    // position can no longer participate in any restore.
    let oldest_needed = list
        .iter()
        .filter(|b| b.status == BackupStatus::Done)
        .min_by_key(|b| b.start_time);
    let mut pruned = 0;
    if let Some(oldest) = oldest_needed {
        let boundary = segment_file_name(oldest.tli, oldest.start_lsn.segment());
        for entry in fs::read_dir(&arclog).map_err(|e| {
            Error::Environment(format!("cannot list \"{}\": {e}", arclog.display()))
        })? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() == 24
                && name.chars().all(|c| c.is_ascii_hexdigit())
                && name < boundary.as_str()
            {
                if !opts.check {
                    fs::remove_file(entry.path())?;
                }
                pruned += 1;
            }
        }
    }

    info!(deleted, pruned, "delete complete");
    Ok(())
}
