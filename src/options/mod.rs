//! Option resolution: built-in defaults, `$BACKUP_PATH/pg_arman.ini`,
//! environment variables and explicit command-line flags, in increasing
//! order of precedence.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::warn;

use crate::catalog::BackupMode;
use crate::cli::Cli;
use crate::{Error, Result};

pub const PG_ARMAN_INI: &str = "pg_arman.ini";

/// Connection parameters for the database server. Unset fields fall back to
/// the usual client defaults (local socket, current user).
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub dbname: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub username: Option<String>,
    pub no_password: bool,
    pub password_prompt: bool,
}

/// The fully merged option set a command runs with.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub pgdata: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
    pub arclog_path: Option<PathBuf>,
    pub check: bool,

    pub backup_mode: Option<BackupMode>,
    pub smooth_checkpoint: bool,
    pub validate_after: bool,
    pub keep_data_generations: Option<i32>,
    pub keep_data_days: Option<i32>,

    pub recovery_target_time: Option<String>,
    pub recovery_target_xid: Option<String>,
    pub recovery_target_inclusive: Option<bool>,
    pub recovery_target_timeline: Option<u32>,

    pub connection: ConnectionOptions,
}

impl Options {
    /// Merge the configuration file, the environment and the parsed command
    /// line into one option set.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let mut opts = Options::default();

        // The catalog location itself can only come from the flag or the
        // environment; it decides where the configuration file lives.
        let backup_path = cli
            .backup_path
            .clone()
            .or_else(|| env_path("BACKUP_PATH"));
        if let Some(root) = &backup_path {
            let ini = root.join(PG_ARMAN_INI);
            if ini.exists() {
                opts.apply_ini(&ini)?;
            }
        }

        opts.apply_env();
        opts.apply_cli(cli)?;
        opts.backup_path = backup_path.or(opts.backup_path);
        Ok(opts)
    }

    /// Apply one key=value file. Unknown keys and wrong-typed values are
    /// rejected; lines without a key before `=` are warned about and skipped.
    pub fn apply_ini(&mut self, path: &Path) -> Result<()> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Environment(format!("cannot read \"{}\": {e}", path.display())))?;

        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!(
                    "syntax error in \"{}\" line {}: {}",
                    path.display(),
                    lineno + 1,
                    line
                );
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                warn!(
                    "syntax error in \"{}\" line {}: {}",
                    path.display(),
                    lineno + 1,
                    line
                );
                continue;
            }
            self.assign(&normalize_key(key), unquote(value.trim()))?;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_path("PGDATA") {
            self.pgdata = Some(v);
        }
        if let Some(v) = env_path("BACKUP_PATH") {
            self.backup_path = Some(v);
        }
        if let Some(v) = env_path("ARCLOG_PATH") {
            self.arclog_path = Some(v);
        }
        if let Ok(v) = std::env::var("PGHOST") {
            self.connection.host = Some(v);
        }
        if let Ok(v) = std::env::var("PGPORT") {
            self.connection.port = Some(v);
        }
        if let Ok(v) = std::env::var("PGUSER") {
            self.connection.username = Some(v);
        }
        if let Ok(v) = std::env::var("PGDATABASE") {
            self.connection.dbname = Some(v);
        }
    }

    fn apply_cli(&mut self, cli: &Cli) -> Result<()> {
        if let Some(v) = &cli.pgdata {
            self.pgdata = Some(v.clone());
        }
        if let Some(v) = &cli.arclog_path {
            self.arclog_path = Some(v.clone());
        }
        self.check |= cli.check;

        if let Some(v) = &cli.dbname {
            self.connection.dbname = Some(v.clone());
        }
        if let Some(v) = &cli.host {
            self.connection.host = Some(v.clone());
        }
        if let Some(v) = &cli.port {
            self.connection.port = Some(v.clone());
        }
        if let Some(v) = &cli.username {
            self.connection.username = Some(v.clone());
        }
        self.connection.no_password |= cli.no_password;
        self.connection.password_prompt |= cli.password_prompt;

        if let Some(args) = cli.backup_args() {
            if let Some(v) = &args.backup_mode {
                self.backup_mode = Some(BackupMode::parse(v)?);
            }
            self.smooth_checkpoint |= args.smooth_checkpoint;
            self.validate_after |= args.validate;
            if let Some(v) = &args.keep_data_generations {
                self.keep_data_generations = Some(parse_int32("keep-data-generations", v)?);
            }
            if let Some(v) = &args.keep_data_days {
                self.keep_data_days = Some(parse_int32("keep-data-days", v)?);
            }
        }

        if let Some(args) = cli.restore_args() {
            if let Some(v) = &args.recovery_target_time {
                self.recovery_target_time = Some(v.clone());
            }
            if let Some(v) = &args.recovery_target_xid {
                self.recovery_target_xid = Some(v.clone());
            }
            if let Some(v) = &args.recovery_target_inclusive {
                self.recovery_target_inclusive =
                    Some(parse_bool("recovery-target-inclusive", v)?);
            }
            if let Some(v) = &args.recovery_target_timeline {
                self.recovery_target_timeline =
                    Some(parse_uint32("recovery-target-timeline", v)?);
            }
        }

        Ok(())
    }

    /// Assign one configuration-file key. Keys are the long option names.
    fn assign(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "pgdata" => self.pgdata = Some(PathBuf::from(value)),
            "backup-path" => self.backup_path = Some(PathBuf::from(value)),
            "arclog-path" => self.arclog_path = Some(PathBuf::from(value)),
            "backup-mode" => self.backup_mode = Some(BackupMode::parse(value)?),
            "smooth-checkpoint" => {
                self.smooth_checkpoint = parse_bool("smooth-checkpoint", value)?
            }
            "validate" => self.validate_after = parse_bool("validate", value)?,
            "keep-data-generations" => {
                self.keep_data_generations = Some(parse_int32("keep-data-generations", value)?)
            }
            "keep-data-days" => {
                self.keep_data_days = Some(parse_int32("keep-data-days", value)?)
            }
            "recovery-target-time" => self.recovery_target_time = Some(value.to_string()),
            "recovery-target-xid" => self.recovery_target_xid = Some(value.to_string()),
            "recovery-target-inclusive" => {
                self.recovery_target_inclusive =
                    Some(parse_bool("recovery-target-inclusive", value)?)
            }
            "recovery-target-timeline" => {
                self.recovery_target_timeline =
                    Some(parse_uint32("recovery-target-timeline", value)?)
            }
            "dbname" => self.connection.dbname = Some(value.to_string()),
            "host" => self.connection.host = Some(value.to_string()),
            "port" => self.connection.port = Some(value.to_string()),
            "username" => self.connection.username = Some(value.to_string()),
            _ => {
                return Err(Error::Config(format!("invalid option \"{key}\"")).into());
            }
        }
        Ok(())
    }

    pub fn require_pgdata(&self) -> Result<&Path> {
        self.pgdata.as_deref().ok_or_else(|| {
            Error::Usage("Required parameter not specified: PGDATA (-D, --pgdata)".into()).into()
        })
    }

    pub fn require_backup_path(&self) -> Result<&Path> {
        self.backup_path.as_deref().ok_or_else(|| {
            Error::Usage(
                "required parameter not specified: BACKUP_PATH (-B, --backup-path)".into(),
            )
            .into()
        })
    }

    pub fn require_arclog_path(&self) -> Result<&Path> {
        self.arclog_path.as_deref().ok_or_else(|| {
            Error::Usage(
                "required parameter not specified: ARCLOG_PATH (-A, --arclog-path)".into(),
            )
            .into()
        })
    }

    pub fn require_backup_mode(&self) -> Result<BackupMode> {
        self.backup_mode.ok_or_else(|| {
            Error::Usage(
                "Required parameter not specified: BACKUP_MODE (-b, --backup-mode)".into(),
            )
            .into()
        })
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn normalize_key(key: &str) -> String {
    key.trim_start_matches('-').to_lowercase().replace('_', "-")
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Parse a 32-bit signed integer option value.
pub fn parse_int32(name: &str, value: &str) -> Result<i32> {
    value.trim().parse::<i32>().map_err(|_| {
        Error::Config(format!(
            "option --{name} should be a 32bit signed integer: '{value}'"
        ))
        .into()
    })
}

/// Parse a 32-bit unsigned integer option value.
pub fn parse_uint32(name: &str, value: &str) -> Result<u32> {
    value.trim().parse::<u32>().map_err(|_| {
        Error::Config(format!(
            "option --{name} should be a 32bit unsigned integer: '{value}'"
        ))
        .into()
    })
}

/// Parse a boolean option value; accepts the usual on/off spellings.
pub fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "on" | "yes" | "1" | "t" | "y" => Ok(true),
        "false" | "off" | "no" | "0" | "f" | "n" => Ok(false),
        _ => Err(Error::Config(format!("option --{name} should be a boolean: '{value}'")).into()),
    }
}

/// Parse a backup ID or timestamp argument of show/validate/delete.
pub fn parse_time(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    for format in ["%Y%m%dT%H%M%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(t);
        }
    }
    if let Ok(d) = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(t) = d.and_hms_opt(0, 0, 0) {
            return Ok(t);
        }
    }
    Err(Error::Usage(format!("invalid backup ID or timestamp \"{value}\"")).into())
}
