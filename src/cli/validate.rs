//! Implementation of `pg_arman validate`.

use std::fs::File;
use std::io::Read;

use tracing::{info, warn};

use crate::backup::datafile;
use crate::catalog::{Backup, BackupMode, BackupStatus, Catalog, BYTES_INVALID};
use crate::options::{parse_time, Options};
use crate::{Error, Result};

pub fn execute(opts: &Options, date: Option<&str>) -> Result<()> {
    let catalog = Catalog::new(opts.require_backup_path()?);
    let _lock = catalog.lock()?;
    let list = catalog.list(!opts.check)?;

    let targets: Vec<Backup> = match date {
        Some(date) => {
            let target = parse_time(date)?;
            let backup = Catalog::find(&list, target)
                .ok_or_else(|| Error::Environment(format!("backup \"{date}\" does not exist")))?;
            vec![backup.clone()]
        }
        None => list
            .iter()
            .filter(|b| b.status == BackupStatus::Done)
            .cloned()
            .collect(),
    };

    let mut corrupt = 0;
    for mut backup in targets {
        if !validate_backup(&catalog, &mut backup, opts.check)? {
            corrupt += 1;
        }
    }
    if corrupt > 0 {
        return Err(Error::Corruption(format!("{corrupt} corrupt backup(s) found")).into());
    }
    Ok(())
}

/// Re-read every captured file of a DONE backup and compare it against the
/// manifest: CRCs for verbatim files, per-page checksums for delta files.
/// A mismatch moves the record to CORRUPT (reported only, in check mode).
/// Returns whether the backup is sound.
pub fn validate_backup(catalog: &Catalog, backup: &mut Backup, check: bool) -> Result<bool> {
    if backup.status != BackupStatus::Done {
        warn!(backup = %backup.id(), status = %backup.status, "not validating");
        return Ok(true);
    }
    info!(backup = %backup.id(), "validating backup");

    let database_dir = catalog.database_dir(backup);
    let files = crate::backup::filetree::read_file_list(&catalog.file_list_path(backup))?;

    let mut sound = true;
    for entry in &files {
        if !entry.is_regular() || entry.write_size == BYTES_INVALID {
            continue;
        }
        let path = database_dir.join(&entry.path);

        let is_delta =
            backup.mode == BackupMode::Page && entry.is_datafile && entry.crc.is_none();
        let verdict = if is_delta {
            datafile::validate_delta_file(&path)
        } else {
            verify_crc(&path, entry.crc, entry.write_size)
        };
        if let Err(e) = verdict {
            warn!("corruption detected in \"{}\": {e}", entry.path.display());
            sound = false;
        }
    }

    if !sound {
        backup.transition(BackupStatus::Corrupt)?;
        if !check {
            catalog.write_ini(backup)?;
        }
        warn!(backup = %backup.id(), "backup marked as CORRUPT");
    } else {
        info!(backup = %backup.id(), "backup is valid");
    }
    Ok(sound)
}

fn verify_crc(path: &std::path::Path, expected: Option<u32>, expected_size: i64) -> Result<()> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let mut file = File::open(path)
        .map_err(|e| Error::Corruption(format!("cannot open \"{}\": {e}", path.display())))?;
    let mut hasher = crc32fast::Hasher::new();
    let mut size: i64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as i64;
    }

    if size != expected_size {
        return Err(Error::Corruption(format!(
            "size mismatch: expected {expected_size}, found {size}"
        ))
        .into());
    }
    let crc = hasher.finalize();
    if crc != expected {
        return Err(Error::Corruption(format!(
            "CRC mismatch: expected {expected:08X}, computed {crc:08X}"
        ))
        .into());
    }
    Ok(())
}
