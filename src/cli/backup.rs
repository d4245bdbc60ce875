//! Implementation of `pg_arman backup`.

use clap::Args;
use tracing::info;

use crate::catalog::Catalog;
use crate::options::Options;
use crate::{cli::validate, Error, Result};

#[derive(Debug, Clone, Args, Default)]
pub struct BackupArgs {
    /// Backup mode: "full" or "page"
    #[arg(short = 'b', long = "backup-mode", value_name = "MODE")]
    pub backup_mode: Option<String>,

    /// Spread the checkpoint out instead of requesting an immediate one
    #[arg(short = 'C', long = "smooth-checkpoint")]
    pub smooth_checkpoint: bool,

    /// Validate the backup right after taking it
    #[arg(long = "validate")]
    pub validate: bool,

    /// Number of full-backup generations to keep
    #[arg(long = "keep-data-generations", value_name = "NUM")]
    pub keep_data_generations: Option<String>,

    /// Keep backups younger than this many days
    #[arg(long = "keep-data-days", value_name = "DAYS")]
    pub keep_data_days: Option<String>,
}

pub fn execute(opts: &Options) -> Result<()> {
    let mut backup = crate::backup::do_backup(opts)?;

    if opts.validate_after && !opts.check {
        let catalog = Catalog::new(opts.require_backup_path()?);
        if !validate::validate_backup(&catalog, &mut backup, opts.check)? {
            return Err(Error::Corruption(format!(
                "backup {} is corrupt",
                backup.id()
            ))
            .into());
        }
        info!(backup = %backup.id(), "backup validated");
    }
    Ok(())
}
