//! `fpc backlog` subcommand group.

use std::fmt::Write as _;
use std::time::Duration;

use clap::{Args, Subcommand};
use fpc_backlog::Backlog;

use crate::context::{Context, GlobalArgs};
use crate::error::CliError;
use crate::output::Output;

/// Backlog commands.
#[derive(Subcommand)]
pub(crate) enum BacklogCommand {
    /// Send queued operations to the service.
    Replay(ReplayArgs),
    /// List queued operations.
    Show,
    /// Replay from the first entry again on the next run.
    ResetOffset,
    /// Drop every queued operation.
    Delete,
}

/// Arguments for the backlog replay command.
#[derive(Args)]
pub(crate) struct ReplayArgs {
    /// Seconds to spend replaying (default: backlog.replay_time_limit).
    #[arg(long)]
    time_limit: Option<u64>,
}

impl BacklogCommand {
    pub(crate) fn execute(self, global: &GlobalArgs) -> Result<(), CliError> {
        let output = Output::new();
        let context = Context::load(global)?;
        match self {
            Self::Replay(args) => replay(&output, &context, &args),
            Self::Show => show(&output, &context.backlog()),
            Self::ResetOffset => {
                context.backlog().reset_offset()?;
                output.success("Backlog offset reset");
                Ok(())
            }
            Self::Delete => {
                context.backlog().delete()?;
                output.success("Backlog deleted");
                Ok(())
            }
        }
    }
}

fn replay(output: &Output, context: &Context, args: &ReplayArgs) -> Result<(), CliError> {
    let site = context.site_cache()?;
    if !site.backlog().exists() {
        output.info("Backlog is empty");
        return Ok(());
    }
    let limit = args
        .time_limit
        .unwrap_or(context.settings.backlog.replay_time_limit);

    if site.replay_backlog(Duration::from_secs(limit))? {
        output.success("Backlog replayed");
    } else {
        let pending = site.backlog().entries()?.len();
        output.warning(&format!("Replay stopped with {pending} operation(s) pending"));
    }
    Ok(())
}

fn show(output: &Output, backlog: &Backlog) -> Result<(), CliError> {
    let Some(header) = backlog.header()? else {
        output.info("Backlog is empty");
        return Ok(());
    };
    let entries = backlog.entries()?;

    output.highlight(&format!("{} pending operation(s)", entries.len()));
    output.field("Offset:", &header.offset.to_string(), 18);
    output.field("First processing:", &header.first_processing.to_string(), 18);
    output.field("Last processing:", &header.last_processing.to_string(), 18);
    for request in &entries {
        let mut line = format!("  {} {}", request.method, request.path);
        if let Some(url) = request.body.get("url") {
            let _ = write!(line, " url={url}");
        }
        if let Some(tag) = request.body.get("tag") {
            let _ = write!(line, " tag={tag}");
        }
        output.info(&line);
    }
    Ok(())
}
