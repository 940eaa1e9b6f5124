//! `fpc key` command implementation.

use clap::Args;
use fpc_core::{RequestInfo, Session};
use fpc_pagecache::FileVariant;

use crate::context::{Context, GlobalArgs};
use crate::error::CliError;
use crate::output::Output;

const WIDTH: usize = 14;

/// Arguments for the key command.
#[derive(Args)]
pub(crate) struct KeyArgs {
    /// Request URL.
    url: String,

    /// User agent of the request (selects the device type).
    #[arg(short = 'A', long)]
    user_agent: Option<String>,

    /// Request cookie as NAME=VALUE. May be repeated.
    #[arg(short = 'b', long = "cookie", value_parser = parse_cookie)]
    cookies: Vec<(String, String)>,

    /// Referring page, used for AJAX fragments.
    #[arg(short = 'e', long)]
    referer: Option<String>,

    /// Send the request as AJAX (`X-Requested-With: XMLHttpRequest`).
    #[arg(long)]
    ajax: bool,
}

impl KeyArgs {
    pub(crate) fn execute(self, global: &GlobalArgs) -> Result<(), CliError> {
        let output = Output::new();
        let context = Context::load(global)?;
        let site = context.local_site_cache()?;
        let session = site.session(self.into_request())?;
        print_session(&output, &context, &session);
        Ok(())
    }

    fn into_request(self) -> RequestInfo {
        let mut request = RequestInfo::get(self.url);
        if let Some(user_agent) = self.user_agent {
            request = request.with_user_agent(user_agent);
        }
        if let Some(referer) = self.referer {
            request = request.with_referer(referer);
        }
        if self.ajax {
            request = request.with_header("X-Requested-With", "XMLHttpRequest");
        }
        for (name, value) in self.cookies {
            request = request.with_cookie(name, value);
        }
        request
    }
}

fn print_session(output: &Output, context: &Context, session: &Session<'_>) {
    let entry = session.entry();
    let data_dir = &context.settings.storage.data_dir;

    output.field("URL:", session.url(), WIDTH);
    output.field("Device:", session.device().as_str(), WIDTH);
    output.field("AJAX:", &session.is_ajax().to_string(), WIDTH);
    output.field("Cacheable:", &session.is_cache_allowed().to_string(), WIDTH);
    output.field(
        "File:",
        &data_dir.join(entry.cache_file_path(FileVariant::Fresh)).display().to_string(),
        WIDTH,
    );
    if entry.has_cache() {
        output.field("Cached:", "yes", WIDTH);
        output.field("Remaining TTL:", &format!("{}s", session.remaining_ttl()), WIDTH);
    } else {
        output.field("Cached:", "no", WIDTH);
    }
}

/// Parse `NAME=VALUE`.
fn parse_cookie(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_owned(), value.to_owned()))
        }
        _ => Err(format!("expected NAME=VALUE, got {raw:?}")),
    }
}
