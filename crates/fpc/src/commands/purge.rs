//! `fpc purge` and `fpc invalidate` command implementations.

use clap::Args;
use fpc_core::{PurgeMode, PurgeReport, PurgeRequest};

use crate::context::{Context, GlobalArgs};
use crate::error::CliError;
use crate::output::Output;

/// What to purge, shared by both commands.
#[derive(Args, Debug, Default)]
pub(crate) struct TargetArgs {
    /// Page URLs.
    urls: Vec<String>,

    /// Purge every URL the service associates with this tag.
    #[arg(short, long)]
    tag: Option<String>,

    /// Target the whole site. Required when no URL or tag is given.
    #[arg(long, conflicts_with_all = ["urls", "tag"])]
    all: bool,

    /// Reason recorded in the service's purge history.
    #[arg(short, long)]
    reason: Option<String>,
}

impl TargetArgs {
    fn request(self, mode: PurgeMode) -> Result<PurgeRequest, CliError> {
        if self.urls.is_empty() && self.tag.is_none() && !self.all {
            return Err(CliError::Validation(
                "nothing to purge: pass URLs, --tag or --all".to_owned(),
            ));
        }
        Ok(PurgeRequest {
            urls: self.urls,
            tag: self.tag,
            mode,
            reason: self.reason,
        })
    }
}

/// Arguments for the purge command.
#[derive(Args)]
pub(crate) struct PurgeArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Keep the service's optimized assets.
    #[arg(long)]
    pagecache_only: bool,

    /// Leave the renamed cache directory of a site purge in place.
    #[arg(long)]
    light: bool,
}

impl PurgeArgs {
    fn mode(&self) -> PurgeMode {
        let mut mode = PurgeMode::COMPLETE;
        if self.pagecache_only {
            mode |= PurgeMode::PAGECACHE_ONLY;
        }
        if self.light {
            mode |= PurgeMode::LIGHT_PURGE;
        }
        mode
    }

    pub(crate) fn execute(self, global: &GlobalArgs) -> Result<(), CliError> {
        let output = Output::new();
        let mode = self.mode();
        let request = self.target.request(mode)?;
        run(&output, global, &request, "Purged")
    }
}

/// Arguments for the invalidate command.
#[derive(Args)]
pub(crate) struct InvalidateArgs {
    #[command(flatten)]
    target: TargetArgs,
}

impl InvalidateArgs {
    pub(crate) fn execute(self, global: &GlobalArgs) -> Result<(), CliError> {
        let output = Output::new();
        let request = self
            .target
            .request(PurgeMode::INVALIDATE | PurgeMode::PAGECACHE_ONLY)?;
        run(&output, global, &request, "Invalidated")
    }
}

fn run(output: &Output, global: &GlobalArgs, request: &PurgeRequest, verb: &str) -> Result<(), CliError> {
    let context = Context::load(global)?;
    let site = context.site_cache()?;
    let report = site.purge(request)?;
    print_report(output, request, &report, verb);
    Ok(())
}

fn describe(request: &PurgeRequest) -> String {
    match (&request.tag, request.urls.len()) {
        (Some(tag), 0) => format!("tag {tag}"),
        (Some(tag), n) => format!("{n} URL(s) and tag {tag}"),
        (None, 0) => "the whole site".to_owned(),
        (None, 1) => request.urls[0].clone(),
        (None, n) => format!("{n} URLs"),
    }
}

fn print_report(output: &Output, request: &PurgeRequest, report: &PurgeReport, verb: &str) {
    output.success(&format!("{verb} {}", describe(request)));
    if request.tag.is_some() {
        output.info(&format!("Tagged URLs: {}", report.tag_urls));
    }
    if !report.local {
        output.warning("Some local cache directories could not be removed");
    }
    if !report.remote {
        output.warning("The cache service is unavailable; the remote purge was queued");
    }
    if let Some(stale_dir) = &report.stale_dir {
        output.highlight(&format!("Stale cache left at {}", stale_dir.display()));
    }
}
