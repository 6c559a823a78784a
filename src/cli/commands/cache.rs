//! Cache command implementation.

use super::Context;
use crate::cli::args::CacheCommands;
use crate::error::RollsyncError;
use crate::output::{format_cache_stats, format_refresh};

/// Execute cache subcommands.
///
/// # Errors
///
/// Returns an error if the service cannot be opened, the device is offline
/// for a refresh, no scope is known, or the download fails.
pub async fn cache(ctx: &Context, cmd: CacheCommands) -> Result<String, RollsyncError> {
    let service = ctx.service()?;

    match cmd {
        CacheCommands::Status => {
            let stats = service.get_cache_statistics().await?;
            format_cache_stats(&stats, ctx.format)
        }
        CacheCommands::Refresh { scope } => {
            if !service.probe_connectivity().await {
                return Err(RollsyncError::Offline);
            }
            let report = match scope {
                Some(scope) => service.cache().refresh_scope(&scope).await?,
                None => service.cache().refresh().await?,
            };
            format_refresh(&report, ctx.format)
        }
    }
}
