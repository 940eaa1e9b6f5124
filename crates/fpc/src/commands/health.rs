//! `fpc health` subcommand group.

use clap::Subcommand;
use fpc_backlog::HealthStatus;

use crate::context::{Context, GlobalArgs};
use crate::error::CliError;
use crate::output::Output;

/// Health commands.
#[derive(Subcommand)]
pub(crate) enum HealthCommand {
    /// Print the stored health status.
    Show,
    /// Probe the service and store the outcome.
    Check,
}

impl HealthCommand {
    pub(crate) fn execute(self, global: &GlobalArgs) -> Result<(), CliError> {
        let output = Output::new();
        let context = Context::load(global)?;
        let status = match self {
            Self::Show => context.health().status(),
            Self::Check => context.site_cache()?.check_health_status()?,
        };
        print_status(&output, status);
        Ok(())
    }
}

fn print_status(output: &Output, status: HealthStatus) {
    let message = format!("Service status: {status}");
    if status == HealthStatus::Healthy {
        output.success(&message);
    } else {
        output.warning(&message);
    }
}
