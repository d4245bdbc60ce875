//! Implementation of `pg_arman restore`.

use clap::Args;

use crate::options::Options;
use crate::Result;

#[derive(Debug, Clone, Args, Default)]
pub struct RestoreArgs {
    /// Recover up to this timestamp
    #[arg(long = "recovery-target-time", value_name = "TIME")]
    pub recovery_target_time: Option<String>,

    /// Recover up to this transaction ID
    #[arg(long = "recovery-target-xid", value_name = "XID")]
    pub recovery_target_xid: Option<String>,

    /// Whether to include the recovery target itself
    #[arg(long = "recovery-target-inclusive", value_name = "BOOL")]
    pub recovery_target_inclusive: Option<String>,

    /// Timeline to recover along
    #[arg(long = "recovery-target-timeline", value_name = "TLI")]
    pub recovery_target_timeline: Option<String>,
}

pub fn execute(opts: &Options) -> Result<()> {
    crate::restore::do_restore(opts)
}
