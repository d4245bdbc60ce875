//! Command-line surface: one module per subcommand, common and connection
//! options on the root parser.

use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, Parser, Subcommand};

use crate::options::Options;
use crate::Result;

pub mod backup;
pub mod delete;
pub mod init;
pub mod restore;
pub mod show;
pub mod validate;

#[derive(Parser, Debug)]
#[command(
    name = "pg_arman",
    version = "0.1",
    about = "Backup and recovery manager for PostgreSQL clusters",
    disable_help_flag = true
)]
pub struct Cli {
    /// Location of the database cluster's data directory
    #[arg(short = 'D', long = "pgdata", global = true, value_name = "PATH")]
    pub pgdata: Option<PathBuf>,

    /// Location of the backup catalog
    #[arg(short = 'B', long = "backup-path", global = true, value_name = "PATH")]
    pub backup_path: Option<PathBuf>,

    /// Location of archived WAL segments
    #[arg(short = 'A', long = "arclog-path", global = true, value_name = "PATH")]
    pub arclog_path: Option<PathBuf>,

    /// Show what would be done, without writing anything
    #[arg(short = 'c', long = "check", global = true)]
    pub check: bool,

    /// Database to connect to
    #[arg(short = 'd', long = "dbname", global = true, value_name = "DBNAME")]
    pub dbname: Option<String>,

    /// Database server host or socket directory
    #[arg(short = 'h', long = "host", global = true, value_name = "HOSTNAME")]
    pub host: Option<String>,

    /// Database server port
    #[arg(short = 'p', long = "port", global = true, value_name = "PORT")]
    pub port: Option<String>,

    /// User name to connect as
    #[arg(short = 'U', long = "username", global = true, value_name = "USERNAME")]
    pub username: Option<String>,

    /// Never prompt for a password
    #[arg(short = 'w', long = "no-password", global = true)]
    pub no_password: bool,

    /// Force a password prompt
    #[arg(short = 'W', long = "password", global = true)]
    pub password_prompt: bool,

    /// Log detailed progress
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Log only warnings and errors
    #[arg(short = 'q', long = "quiet", global = true)]
    pub quiet: bool,

    /// Print help
    #[arg(long = "help", global = true, action = ArgAction::HelpLong)]
    pub help: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize the backup catalog
    #[command(disable_help_flag = true)]
    Init,

    /// Take an online backup of the cluster
    #[command(disable_help_flag = true)]
    Backup(backup::BackupArgs),

    /// Restore the cluster from the catalog
    #[command(disable_help_flag = true)]
    Restore(restore::RestoreArgs),

    /// List backups, or show one backup in detail
    #[command(disable_help_flag = true)]
    Show {
        #[arg(value_name = "DATE")]
        date: Option<String>,
    },

    /// Verify the files of a backup against its manifest
    #[command(disable_help_flag = true)]
    Validate {
        #[arg(value_name = "DATE")]
        date: Option<String>,
    },

    /// Mark backups older than DATE as deleted and prune archived WAL
    #[command(disable_help_flag = true)]
    Delete {
        #[arg(value_name = "DATE")]
        date: Option<String>,
    },
}

impl Cli {
    pub fn backup_args(&self) -> Option<&backup::BackupArgs> {
        match &self.command {
            Command::Backup(args) => Some(args),
            _ => None,
        }
    }

    pub fn restore_args(&self) -> Option<&restore::RestoreArgs> {
        match &self.command {
            Command::Restore(args) => Some(args),
            _ => None,
        }
    }
}

/// Parse CLI arguments. Exits the process on syntax errors, help and
/// version, the way a command-line tool should.
pub fn parse_args<I>(args: I) -> Cli
where
    I: IntoIterator<Item = String>,
{
    Cli::parse_from(args)
}

pub fn dispatch(cli: Cli) -> Result<()> {
    let opts = Options::resolve(&cli)?;
    match &cli.command {
        Command::Init => init::execute(&opts),
        Command::Backup(_) => backup::execute(&opts),
        Command::Restore(_) => restore::execute(&opts),
        Command::Show { date } => show::execute(&opts, date.as_deref()),
        Command::Validate { date } => validate::execute(&opts, date.as_deref()),
        Command::Delete { date } => delete::execute(&opts, date.as_deref()),
    }
}

/// Build the underlying clap `Command` (useful for help/version contract
/// tests).
pub fn clap_command() -> clap::Command {
    Cli::command()
}
