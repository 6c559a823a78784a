//! Sync command implementation.
//!
//! `run` performs one foreground cycle; `daemon` runs the background
//! scheduler until Ctrl-C.

use std::io::Write;

use tracing::{info, warn};

use super::Context;
use crate::cli::args::SyncCommands;
use crate::error::RollsyncError;
use crate::output::{format_event, format_sync_result};

/// Execute sync subcommands.
///
/// # Errors
///
/// Returns an error if the service cannot be opened, the device is offline,
/// a cycle is already running, or the store fails.
pub async fn sync(ctx: &Context, cmd: SyncCommands) -> Result<String, RollsyncError> {
    match cmd {
        SyncCommands::Run => {
            let service = ctx.service()?;
            if !service.probe_connectivity().await {
                return Err(RollsyncError::Offline);
            }
            let result = service.force_sync_now().await?;
            format_sync_result(&result, ctx.format)
        }
        SyncCommands::Daemon { interval } => {
            let mut config = ctx.config.clone();
            if let Some(minutes) = interval {
                config.sync.interval_minutes = minutes.max(1);
            }
            let ctx = Context {
                paths: ctx.paths.clone(),
                config,
                format: ctx.format,
            };
            daemon(&ctx).await
        }
    }
}

async fn daemon(ctx: &Context) -> Result<String, RollsyncError> {
    let service = ctx.service()?;
    let mut events = service.subscribe();

    if !service.probe_connectivity().await {
        warn!("server unreachable, waiting for connectivity");
    }
    service.start();
    info!(
        interval_minutes = ctx.config.sync.interval_minutes,
        "sync daemon running, press Ctrl-C to stop"
    );

    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                writeln!(stdout, "{}", format_event(&event, ctx.format)?)?;
            }
        }
    }

    info!("shutting down");
    service.shutdown().await;
    Ok("Sync daemon stopped".to_string())
}
