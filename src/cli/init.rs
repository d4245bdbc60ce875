//! Implementation of `pg_arman init`.

use std::fs;

use tracing::info;

use crate::catalog::BACKUPS_DIR;
use crate::options::{Options, PG_ARMAN_INI};
use crate::{Error, Result};

pub fn execute(opts: &Options) -> Result<()> {
    let root = opts.require_backup_path()?;

    if root.is_dir() && fs::read_dir(root)?.next().is_some() {
        return Err(Error::Environment(format!(
            "backup catalog already exist and is not empty: \"{}\"",
            root.display()
        ))
        .into());
    }

    if !opts.check {
        fs::create_dir_all(root.join(BACKUPS_DIR))?;
    }

    let mut ini = String::new();
    ini.push_str("# pg_arman configuration\n");
    if let Some(pgdata) = &opts.pgdata {
        ini.push_str(&format!("pgdata = {}\n", pgdata.display()));
    } else {
        ini.push_str("# pgdata = /path/to/cluster\n");
    }
    if let Some(arclog) = &opts.arclog_path {
        ini.push_str(&format!("arclog-path = {}\n", arclog.display()));
    } else {
        ini.push_str("# arclog-path = /path/to/archive\n");
    }
    ini.push_str("# backup-mode = full\n");
    ini.push_str("# smooth-checkpoint = false\n");
    ini.push_str("# keep-data-generations = 3\n");
    ini.push_str("# keep-data-days = 10\n");
    if !opts.check {
        fs::write(root.join(PG_ARMAN_INI), ini)?;
    }

    info!(path = %root.display(), "backup catalog initialized");
    Ok(())
}
