//! Implementation of `pg_arman show`.

use crate::catalog::{Backup, Catalog, BYTES_INVALID};
use crate::options::{parse_time, Options};
use crate::{Error, Result};

pub fn execute(opts: &Options, date: Option<&str>) -> Result<()> {
    let catalog = Catalog::new(opts.require_backup_path()?);
    let list = catalog.list(false)?;

    match date {
        Some(date) => {
            let target = parse_time(date)?;
            let backup = Catalog::find(&list, target)
                .ok_or_else(|| Error::Environment(format!("backup \"{date}\" does not exist")))?;
            print_detail(backup);
        }
        None => print_list(&list),
    }
    Ok(())
}

fn print_list(list: &[Backup]) {
    println!("{:=<76}", "");
    println!(
        "{:<19}  {:<4}  {:>3}  {:>8}  {:>9}  {:<8}",
        "Start", "Mode", "TLI", "Time", "Data", "Status"
    );
    println!("{:=<76}", "");
    for backup in list {
        let duration = backup
            .end_time
            .map(|end| format!("{}s", (end - backup.start_time).num_seconds()))
            .unwrap_or_else(|| "----".to_string());
        println!(
            "{:<19}  {:<4}  {:>3}  {:>8}  {:>9}  {:<8}",
            backup.start_time.format("%Y-%m-%d %H:%M:%S"),
            backup.mode,
            backup.tli,
            duration,
            format_bytes(backup.data_bytes_read),
            backup.status,
        );
    }
}

fn print_detail(backup: &Backup) {
    println!("BACKUP_ID={}", backup.id());
    println!("BACKUP_MODE={}", backup.mode);
    println!("STATUS={}", backup.status);
    println!("TIMELINE_ID={}", backup.tli);
    println!("START_LSN={}", backup.start_lsn);
    println!("STOP_LSN={}", backup.stop_lsn);
    println!("START_TIME='{}'", backup.start_time.format("%Y-%m-%d %H:%M:%S"));
    if let Some(end) = backup.end_time {
        println!("END_TIME='{}'", end.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("RECOVERY_XID={}", backup.recovery_xid);
    if let Some(t) = backup.recovery_time {
        println!("RECOVERY_TIME='{}'", t.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("BLOCK_SIZE={}", backup.block_size);
    println!("WAL_BLOCK_SIZE={}", backup.wal_block_size);
    println!("DATA_BYTES_READ={}", backup.data_bytes_read);
    println!("DATA_BYTES_WRITTEN={}", backup.data_bytes_written);
}

fn format_bytes(bytes: i64) -> String {
    if bytes == BYTES_INVALID {
        return "----".to_string();
    }
    let units = ["B", "kB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < units.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.0}{}", units[unit])
    }
}
