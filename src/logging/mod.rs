//! Logging initialization using `tracing` and `tracing-subscriber`.

use tracing_subscriber::{fmt, util::SubscriberInitExt, EnvFilter};

use crate::Result;

/// Initialize the global tracing subscriber on stderr. Safe to call multiple
/// times; subsequent calls will no-op.
///
/// `-v` lowers the filter to debug, `-q` raises it to warning; otherwise the
/// `RUST_LOG` environment variable is honored with an info default.
pub fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let filter = if verbose {
        EnvFilter::new("debug")
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish()
        .try_init();

    Ok(())
}
