//! Transport to the remote cache service.
//!
//! A [`Request`] describes one call completely: it is what the API client
//! sends, and it is also the entry the backlog persists and replays later.
//! [`Transport`] sends it and hands back the raw [`Response`]; the status
//! classification lives in [`ResponseStatus`] and failures are the tagged
//! [`TransportError`].
//!
//! - [`HttpTransport`] sends requests with `ureq`
//! - [`MockTransport`] answers from a script (behind the `mock` feature)

mod client;
mod error;
#[cfg(feature = "mock")]
mod mock;
mod request;
mod response;

pub use client::HttpTransport;
pub use error::{TimeoutPhase, TransportError};
#[cfg(feature = "mock")]
pub use mock::MockTransport;
pub use request::Request;
pub use response::{Response, ResponseStatus};

/// Sends requests to the remote service.
pub trait Transport: Send + Sync {
    /// Send `request` and wait for the response.
    fn send(&self, request: &Request) -> Result<Response, TransportError>;

    /// Send `request` again after it already went out once.
    fn replay(&self, request: &Request) -> Result<Response, TransportError> {
        self.send(request)
    }
}
