//! Client for the remote cache service.
//!
//! [`ApiClient`] wraps a [`fpc_transport::Transport`] with the rules every
//! remote call follows: calls are refused while the service is not healthy,
//! failed attempts are retried, persistent failures degrade the shared
//! [`fpc_backlog::HealthMonitor`], and purges that cannot be delivered are
//! queued in the [`fpc_backlog::Backlog`] for replay.
//!
//! Operations:
//!
//! - cache lookups: [`ApiClient::get`], [`ApiClient::get_multi`]
//! - purges: [`ApiClient::purge`], [`ApiClient::purge_urls`],
//!   [`ApiClient::purge_by_tag`]
//! - [`ApiClient::get_last_purge`]
//!
//! Batches run through [`BatchPool`]. [`ReverseProxy`] purges proxy caches in
//! front of the site.

mod batch;
mod client;
mod error;
mod proxy;

pub use batch::{BatchOutcome, BatchPool, MAX_RETRIES};
pub use client::{ApiClient, LookupContext, PurgeOptions};
pub use error::ApiError;
pub use proxy::ReverseProxy;
