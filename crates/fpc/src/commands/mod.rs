//! CLI command implementations.

pub(crate) mod backlog;
pub(crate) mod health;
pub(crate) mod key;
pub(crate) mod purge;

pub(crate) use backlog::BacklogCommand;
pub(crate) use health::HealthCommand;
pub(crate) use key::KeyArgs;
pub(crate) use purge::{InvalidateArgs, PurgeArgs};
