//! Restore: replay the newest usable full backup plus its differential
//! chain into the data directory, then write the recovery configuration
//! pointing the server at the WAL archive.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::backup::{datafile, filetree};
use crate::catalog::{Backup, BackupMode, BackupStatus, Catalog};
use crate::options::{parse_time, Options};
use crate::{Error, Result};

pub fn do_restore(opts: &Options) -> Result<()> {
    let pgdata = opts.require_pgdata()?.to_path_buf();
    let backup_root = opts.require_backup_path()?.to_path_buf();
    let arclog = opts.require_arclog_path()?.to_path_buf();

    if pgdata.join("postmaster.pid").exists() {
        return Err(Error::Environment(
            "postmaster.pid exists in PGDATA, the server may still be running".into(),
        )
        .into());
    }

    let catalog = Catalog::new(&backup_root);
    let _lock = catalog.lock()?;
    let list = catalog.list(!opts.check)?;

    let target_time = opts
        .recovery_target_time
        .as_deref()
        .map(parse_time)
        .transpose()?;

    let base = select_base(&list, target_time, opts.recovery_target_timeline).ok_or_else(
        || Error::Environment("cannot find valid full backup to restore".into()),
    )?;
    let chain = select_chain(&list, base, target_time);
    info!(
        base = %base.id(),
        differentials = chain.len(),
        "restore plan resolved"
    );

    if !opts.check {
        fs::create_dir_all(&pgdata)?;
    }
    restore_one(&catalog, base, &pgdata, opts.check)?;
    for backup in &chain {
        restore_one(&catalog, backup, &pgdata, opts.check)?;
    }

    if !opts.check {
        write_recovery_conf(&pgdata, &arclog, opts)?;
    }
    info!("restore complete; start the server to begin recovery");
    Ok(())
}

/// The newest completed FULL backup recoverable to the requested target.
fn select_base<'a>(
    list: &'a [Backup],
    target_time: Option<NaiveDateTime>,
    target_tli: Option<u32>,
) -> Option<&'a Backup> {
    list.iter().find(|b| {
        b.mode == BackupMode::Full
            && b.status == BackupStatus::Done
            && target_tli.map_or(true, |tli| b.tli == tli)
            && target_time.map_or(true, |t| b.recovery_time.unwrap_or(b.start_time) <= t)
    })
}

/// Completed differential backups between the base and the recovery target,
/// oldest first.
fn select_chain<'a>(
    list: &'a [Backup],
    base: &Backup,
    target_time: Option<NaiveDateTime>,
) -> Vec<&'a Backup> {
    let mut chain: Vec<&Backup> = list
        .iter()
        .filter(|b| {
            b.mode == BackupMode::Page
                && b.status == BackupStatus::Done
                && b.tli == base.tli
                && b.start_time > base.start_time
                && target_time.map_or(true, |t| b.recovery_time.unwrap_or(b.start_time) <= t)
        })
        .collect();
    chain.sort_by_key(|b| b.start_time);
    chain
}

/// Replay one backup: recreate directories and symlinks, copy verbatim
/// files, apply page deltas over the image built so far.
fn restore_one(catalog: &Catalog, backup: &Backup, pgdata: &Path, check: bool) -> Result<()> {
    info!(backup = %backup.id(), mode = %backup.mode, "restoring backup");
    let database_dir = catalog.database_dir(backup);

    for action in filetree::read_mkdirs_script(&catalog.mkdirs_path(backup))? {
        if check {
            continue;
        }
        match action {
            filetree::ScaffoldAction::Dir(path) => {
                fs::create_dir_all(pgdata.join(path))?;
            }
            filetree::ScaffoldAction::Link { target, path } => {
                let link = pgdata.join(path);
                if !link.exists() {
                    std::os::unix::fs::symlink(target, link)?;
                }
            }
        }
    }

    let files = filetree::read_file_list(&catalog.file_list_path(backup))?;
    for entry in &files {
        if !entry.is_regular() || entry.write_size == crate::catalog::BYTES_INVALID {
            // directories and symlinks are scaffolded; skipped files come
            // from the parent image
            continue;
        }
        if check {
            continue;
        }

        let src = database_dir.join(&entry.path);
        let dst = pgdata.join(&entry.path);
        debug!("restoring \"{}\"", entry.path.display());

        let is_delta =
            backup.mode == BackupMode::Page && entry.is_datafile && entry.crc.is_none();
        if is_delta {
            datafile::restore_data_file(&src, &dst, entry.size)?;
        } else {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dst).map_err(|e| {
                Error::Environment(format!("cannot restore \"{}\": {e}", entry.path.display()))
            })?;
        }
        fs::set_permissions(&dst, fs::Permissions::from_mode(entry.mode & 0o7777))?;
    }
    Ok(())
}

/// Write `recovery.conf` with the archive restore command and the requested
/// recovery target, if any.
fn write_recovery_conf(pgdata: &Path, arclog: &Path, opts: &Options) -> Result<()> {
    let mut out = String::new();
    out.push_str("# recovery.conf generated by pg_arman 0.1\n");
    out.push_str(&format!(
        "restore_command = 'cp {}/%f \"%p\"'\n",
        arclog.display()
    ));
    if let Some(time) = &opts.recovery_target_time {
        out.push_str(&format!("recovery_target_time = '{time}'\n"));
    }
    if let Some(xid) = &opts.recovery_target_xid {
        out.push_str(&format!("recovery_target_xid = '{xid}'\n"));
    }
    if let Some(inclusive) = opts.recovery_target_inclusive {
        out.push_str(&format!("recovery_target_inclusive = {inclusive}\n"));
    }
    if let Some(tli) = opts.recovery_target_timeline {
        out.push_str(&format!("recovery_target_timeline = '{tli}'\n"));
    }

    let path = pgdata.join("recovery.conf");
    fs::write(&path, out)?;
    info!(path = %path.display(), "recovery configuration written");
    Ok(())
}
