use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;

use thiserror::Error;

pub mod backup;
pub mod catalog;
pub mod cli;
pub mod logging;
pub mod options;
pub mod restore;
pub mod server;
pub mod wal;

pub type Result<T> = anyhow::Result<T>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Config(String),
    #[error("{0}")]
    Environment(String),
    #[error("{0}")]
    Server(String),
    #[error("unexpected result from server: {0}")]
    Protocol(String),
    #[error("switched WAL could not be archived in {0} seconds")]
    ArchiveTimeout(u64),
    #[error("{0}")]
    Corruption(String),
    #[error("another pg_arman is running, skipping this backup")]
    CatalogBusy,
    #[error("interrupted during {0}")]
    Interrupted(&'static str),
    #[error("{0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static SIGNAL_HOOK: Once = Once::new();

/// True once the operator has sent SIGINT/SIGTERM. Checked at loop tops in
/// the WAL scan, the file copy loop and the archive poll.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

#[doc(hidden)]
pub fn set_interrupted(value: bool) {
    INTERRUPTED.store(value, Ordering::Relaxed);
}

/// Install the signal handler that raises the interrupt flag. The handler
/// itself does no work; all cleanup runs on the main thread at the next
/// loop-top check.
pub fn install_signal_handler() {
    SIGNAL_HOOK.call_once(|| {
        let _ = ctrlc::set_handler(|| {
            INTERRUPTED.store(true, Ordering::Relaxed);
        });
    });
}

/// Entry point for the library, called by the CLI thin wrapper.
pub fn run<I, S>(args: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let cli = cli::parse_args(args.into_iter().map(Into::into));

    logging::init_logging(cli.verbose, cli.quiet)?;

    cli::dispatch(cli)
}
