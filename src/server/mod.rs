//! Driver for the server's backup control primitives.
//!
//! Each operation opens its own short-lived connection; the engine is a
//! serial pipeline and never holds a connection across file I/O.

use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDateTime;
use postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::options::ConnectionOptions;
use crate::wal::{segment_file_name, Lsn, BLCKSZ, XLOG_BLCKSZ, XLOG_SEG_SIZE};
use crate::{Error, Result};

/// Server version this engine is built against (9.6).
pub const PG_VERSION_NUM: u32 = 90600;

/// Seconds to wait for the archiver to pick up a switched segment.
pub const ARCHIVE_TIMEOUT: u64 = 10;

/// Result of stopping a backup: the stop position plus the recovery target
/// bookkeeping recorded alongside it.
#[derive(Debug, Clone, Copy)]
pub struct StopBackupInfo {
    pub lsn: Lsn,
    pub tli: u32,
    pub xid: u32,
    pub time: NaiveDateTime,
}

#[derive(Debug, Clone)]
pub struct Server {
    connection: ConnectionOptions,
    pgdata: PathBuf,
}

impl Server {
    pub fn new(connection: ConnectionOptions, pgdata: &Path) -> Self {
        Server {
            connection: connection.clone(),
            pgdata: pgdata.to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Client> {
        let conn = &self.connection;
        let mut config = postgres::Config::new();

        config.host(conn.host.as_deref().unwrap_or("localhost"));
        if let Some(port) = &conn.port {
            let port: u16 = port.parse().map_err(|_| {
                Error::Usage(format!("invalid connection port \"{port}\""))
            })?;
            config.port(port);
        }
        let user = conn
            .username
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "postgres".to_string());
        config.dbname(conn.dbname.as_deref().unwrap_or(&user));
        config.user(&user);

        if let Ok(password) = std::env::var("PGPASSWORD") {
            config.password(password);
        } else if conn.password_prompt && !conn.no_password {
            eprint!("Password: ");
            let mut password = String::new();
            std::io::stdin().lock().read_line(&mut password)?;
            config.password(password.trim_end());
        }

        config
            .connect(NoTls)
            .map_err(|e| Error::Server(format!("could not connect to server: {e}")).into())
    }

    /// Confirm the server is the version this engine was built against and
    /// that its block sizes match the compiled-in constants. Purely an
    /// assertion; the engine never takes these values from the server.
    pub fn check_version(&self) -> Result<()> {
        let mut client = self.connect()?;

        let row = client
            .query_one("SELECT current_setting('server_version_num')", &[])
            .map_err(|e| Error::Protocol(e.to_string()))?;
        let version: u32 = row
            .get::<_, String>(0)
            .parse()
            .map_err(|_| Error::Protocol("unparsable server_version_num".into()))?;
        if version / 100 != PG_VERSION_NUM / 100 {
            return Err(Error::Server(format!(
                "server version is {}.{}.{}, must be {}.{}",
                version / 10000,
                (version / 100) % 100,
                version % 100,
                PG_VERSION_NUM / 10000,
                (PG_VERSION_NUM / 100) % 100,
            ))
            .into());
        }

        confirm_setting(&mut client, "block_size", BLCKSZ as u32)?;
        confirm_setting(&mut client, "wal_block_size", XLOG_BLCKSZ as u32)?;
        debug!(version, "server version and block sizes confirmed");
        Ok(())
    }

    /// A standby is recognized by the recovery configuration file in its
    /// data directory; backups are refused there.
    pub fn is_standby(&self) -> bool {
        self.pgdata.join("recovery.conf").is_file()
    }

    /// Ask the server to begin an online backup, returning the start
    /// position. `fast` is the inverse of a smooth checkpoint.
    pub fn start_backup(&self, label: &str, smooth_checkpoint: bool) -> Result<Lsn> {
        let mut client = self.connect()?;
        let fast = !smooth_checkpoint;
        let row = client
            .query_one("SELECT pg_start_backup($1, $2)::text", &[&label, &fast])
            .map_err(|e| Error::Server(format!("pg_start_backup failed: {e}")))?;
        let lsn = Lsn::parse(&row.get::<_, String>(0))?;
        info!(lsn = %lsn, "server backup started");
        Ok(lsn)
    }

    /// End the online backup: collect the stop position, the timeline, the
    /// recovery target transaction and time, then wait for the final
    /// partial segment to be archived.
    pub fn stop_backup(&self) -> Result<StopBackupInfo> {
        let mut client = self.connect()?;
        let row = client
            .query_one("SELECT pg_stop_backup()::text", &[])
            .map_err(|e| Error::Server(format!("pg_stop_backup failed: {e}")))?;
        let lsn = Lsn::parse(&row.get::<_, String>(0))?;
        let tli = current_timeline(&mut client)?;
        let xid = current_txid(&mut client)?;
        let time = chrono::Local::now().naive_local();
        drop(client);

        info!(lsn = %lsn, tli, xid, "server backup stopped");
        self.wait_for_archive(lsn, tli)?;
        Ok(StopBackupInfo {
            lsn,
            tli,
            xid,
            time,
        })
    }

    /// Best-effort stop used on cleanup paths; failures are logged, not
    /// raised, and no archive wait is performed.
    pub fn stop_backup_quiet(&self) {
        let result = self
            .connect()
            .and_then(|mut client| {
                client
                    .execute("SELECT pg_stop_backup()", &[])
                    .map_err(|e| Error::Server(e.to_string()).into())
            });
        if let Err(e) = result {
            warn!("pg_stop_backup during cleanup failed: {e}");
        }
    }

    /// Force a WAL switch so the segment containing the switch point can be
    /// archived; returns the switch position.
    pub fn force_switch(&self) -> Result<Lsn> {
        let mut client = self.connect()?;
        let row = client
            .query_one("SELECT pg_switch_xlog()::text", &[])
            .map_err(|e| Error::Server(format!("pg_switch_xlog failed: {e}")))?;
        let lsn = Lsn::parse(&row.get::<_, String>(0))?;
        debug!(lsn = %lsn, "WAL switch forced");
        Ok(lsn)
    }

    pub fn current_txid(&self) -> Result<u32> {
        let mut client = self.connect()?;
        current_txid(&mut client)
    }

    pub fn current_timeline(&self) -> Result<u32> {
        let mut client = self.connect()?;
        current_timeline(&mut client)
    }

    /// Poll the archive status directory until the `.ready` marker of the
    /// segment holding `lsn` disappears, meaning the archiver stored it.
    pub fn wait_for_archive(&self, lsn: Lsn, tli: u32) -> Result<()> {
        // a position sitting exactly on a segment boundary belongs to the
        // previous, just-closed segment
        let segno = if lsn.0 % XLOG_SEG_SIZE == 0 {
            lsn.segment().saturating_sub(1)
        } else {
            lsn.segment()
        };
        let name = segment_file_name(tli, segno);
        let ready = self
            .pgdata
            .join("pg_xlog/archive_status")
            .join(format!("{name}.ready"));
        debug!(path = %ready.display(), "waiting for archiver");

        let mut tries = 0u64;
        while ready.exists() {
            std::thread::sleep(Duration::from_secs(1));
            if crate::interrupted() {
                return Err(Error::Interrupted("WAL archive wait").into());
            }
            tries += 1;
            if tries > ARCHIVE_TIMEOUT {
                return Err(Error::ArchiveTimeout(ARCHIVE_TIMEOUT).into());
            }
        }
        debug!(segment = %name, tries, "segment archived");
        Ok(())
    }
}

fn current_timeline(client: &mut Client) -> Result<u32> {
    let row = client
        .query_one("SELECT timeline_id FROM pg_control_checkpoint()", &[])
        .map_err(|e| Error::Protocol(e.to_string()))?;
    Ok(row.get::<_, i32>(0) as u32)
}

fn current_txid(client: &mut Client) -> Result<u32> {
    let row = client
        .query_one("SELECT txid_current()", &[])
        .map_err(|e| Error::Protocol(e.to_string()))?;
    Ok(row.get::<_, i64>(0) as u32)
}

fn confirm_setting(client: &mut Client, name: &str, expected: u32) -> Result<u32> {
    let row = client
        .query_one("SELECT current_setting($1)", &[&name])
        .map_err(|e| Error::Protocol(format!("cannot get {name}: {e}")))?;
    let value: u32 = row
        .get::<_, String>(0)
        .parse()
        .map_err(|_| Error::Protocol(format!("cannot get {name}")))?;
    if value != expected {
        return Err(Error::Server(format!(
            "{name}({value}) is not compatible({expected} expected)"
        ))
        .into());
    }
    Ok(value)
}
