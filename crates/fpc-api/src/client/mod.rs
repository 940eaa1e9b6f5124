//! Health-gated request maker shared by every API call.

mod cache;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fpc_backlog::{Backlog, HealthMonitor};
use fpc_transport::{Request, Response, ResponseStatus, Transport, TransportError};

use crate::ApiError;

pub use cache::{LookupContext, PurgeOptions};

const SITE_ID_HEADER: &str = "X-Nitro-Site-Id";
const SIGNATURE_HEADER: &str = "X-Nitro-Signature";

/// Default attempts per request.
const DEFAULT_ATTEMPTS: u32 = 2;

/// Default pause between attempts.
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Client for the remote cache service of one site.
///
/// Every request goes through [`ApiClient::send`]:
///
/// - while the service is not healthy the request is refused with
///   [`ApiError::ServiceDown`] (and queued in the backlog when allowed)
/// - otherwise it is attempted up to `attempts` times until a response below
///   500 arrives
/// - failures update the shared [`HealthMonitor`]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    health: Arc<HealthMonitor>,
    backlog: Arc<Backlog>,
    site_id: String,
    secret: String,
    attempts: u32,
    retry_delay: Duration,
}

impl ApiClient {
    pub fn new(
        site_id: impl Into<String>,
        secret: impl Into<String>,
        transport: Arc<dyn Transport>,
        health: Arc<HealthMonitor>,
        backlog: Arc<Backlog>,
    ) -> Self {
        Self {
            transport,
            health,
            backlog,
            site_id: site_id.into(),
            secret: secret.into(),
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Attempt each request up to `attempts` times, pausing `delay` in between.
    #[must_use]
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    #[must_use]
    pub fn health(&self) -> &HealthMonitor {
        &self.health
    }

    #[must_use]
    pub fn backlog(&self) -> &Backlog {
        &self.backlog
    }

    /// The transport requests go out on, for callers that resend stored
    /// requests themselves.
    #[must_use]
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    /// Send `request`, retrying, escalating health and backlogging as needed.
    ///
    /// With `backlog` set and the backlog enabled, a request that cannot be
    /// delivered is queued for replay. A response is returned whatever its
    /// status once one arrives; callers decide what a non-OK status means.
    pub fn send(&self, request: Request, backlog: bool) -> Result<Response, ApiError> {
        let backlog_active = backlog && self.backlog.is_enabled();
        let request = self.admit(request, backlog_active)?;

        let mut last_response = None;
        for attempt in 1..=self.attempts {
            match self.transport.send(&request) {
                Ok(response) if response.code < 500 => {
                    self.health.record_success()?;
                    return Ok(response);
                }
                Ok(response) => {
                    tracing::debug!(path = %request.path, code = response.code, attempt, "Server error");
                    last_response = Some(response);
                }
                Err(e) if attempt == self.attempts => {
                    let status = self.health.record_failure(backlog_active)?;
                    if backlog_active {
                        self.backlog.append(&request)?;
                    }
                    tracing::warn!(path = %request.path, error = %e, %status, "Request failed");
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::debug!(path = %request.path, error = %e, attempt, "Request attempt failed");
                }
            }
            if attempt < self.attempts {
                thread::sleep(self.retry_delay);
            }
        }

        self.health.record_server_errors()?;
        if backlog_active {
            self.backlog.append(&request)?;
        }
        last_response.ok_or_else(|| TransportError::Fatal("no attempt was made".to_owned()).into())
    }

    /// Sign `request` and check that the service may be called.
    ///
    /// Refused requests are queued first when `backlog_active`.
    pub(crate) fn admit(&self, request: Request, backlog_active: bool) -> Result<Request, ApiError> {
        let request = self.sign(request);
        if self.health.is_healthy() {
            return Ok(request);
        }

        let mut message = "Connection to the cache service is not reliable at the moment".to_owned();
        if backlog_active {
            self.backlog.append(&request)?;
            message.push_str("; request queued for delayed processing");
        }
        tracing::debug!(path = %request.path, status = %self.health.status(), "Refusing remote call");
        Err(ApiError::ServiceDown(message))
    }

    /// Whether the service answers an authenticated request.
    ///
    /// Goes around the health gate, the retries and the backlog so a client
    /// that considers the service sick can find out it recovered.
    pub fn ping(&self) -> bool {
        let request = self.sign(Request::get(format!("cache/getlastpurge/{}", self.site_id)));
        match self.transport.send(&request) {
            Ok(response) => response.status() == ResponseStatus::Ok,
            Err(e) => {
                tracing::debug!(error = %e, "Health probe failed");
                false
            }
        }
    }

    fn sign(&self, request: Request) -> Request {
        let request = request.header(SITE_ID_HEADER, self.site_id.as_str());
        if self.secret.is_empty() {
            return request;
        }
        let signature = signature(&self.site_id, &request.path, &self.secret);
        request.header(SIGNATURE_HEADER, signature)
    }
}

/// Hex MD5 over the site, the path and the site secret.
fn signature(site_id: &str, path: &str, secret: &str) -> String {
    use md5::{Digest, Md5};

    let mut hasher = Md5::new();
    hasher.update(site_id.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
