//! Purges for reverse proxies (Varnish and alike) in front of the site.

use std::collections::BTreeMap;
use std::sync::Arc;

use fpc_transport::{Request, ResponseStatus, Transport};
use rayon::prelude::*;
use url::Url;

/// Sends purge requests for a URL to every configured proxy server.
///
/// Each request goes to the server's address while carrying the URL's own
/// `Host`, so the proxy drops the entry it keeps for that URL.
pub struct ReverseProxy {
    transport: Arc<dyn Transport>,
    servers: Vec<String>,
    headers: BTreeMap<String, String>,
}

impl ReverseProxy {
    /// Proxy purger for `servers`, each `host` or `host:port`.
    pub fn new(transport: Arc<dyn Transport>, servers: Vec<String>) -> Self {
        Self {
            transport,
            servers,
            headers: BTreeMap::new(),
        }
    }

    /// Send `value` as header `name` with every purge.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Send `method` for `url` to every server in parallel.
    ///
    /// Failures are logged. Returns how many servers accepted the purge.
    pub fn purge(&self, url: &str, method: &str) -> usize {
        if self.servers.is_empty() {
            return 0;
        }
        let target = match Url::parse(url) {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(url, error = %e, "Skipping proxy purge of invalid URL");
                return 0;
            }
        };
        let Some(host) = host_header(&target) else {
            tracing::warn!(url, "Skipping proxy purge of URL without host");
            return 0;
        };

        self.servers
            .par_iter()
            .filter(|server| self.purge_on(server, &target, &host, method))
            .count()
    }

    fn purge_on(&self, server: &str, target: &Url, host: &str, method: &str) -> bool {
        let Some(redirected) = redirect(target, server) else {
            tracing::warn!(server, "Invalid proxy server address");
            return false;
        };
        let mut request = Request::new(method, redirected.as_str()).header("Host", host);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match self.transport.send(&request) {
            Ok(response) if response.status() == ResponseStatus::Ok => {
                tracing::debug!(server, url = %target, method, "Purged proxy cache");
                true
            }
            Ok(response) => {
                tracing::warn!(server, url = %target, code = response.code, "Proxy rejected purge");
                false
            }
            Err(e) => {
                tracing::warn!(server, url = %target, error = %e, "Proxy purge failed");
                false
            }
        }
    }
}

/// `host[:port]` as the URL addresses it.
fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    })
}

/// `url` with its authority replaced by `server`.
fn redirect(url: &Url, server: &str) -> Option<Url> {
    let (host, port) = match server.rsplit_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().ok()?)),
        None => (server, None),
    };
    let mut redirected = url.clone();
    redirected.set_host(Some(host)).ok()?;
    redirected.set_port(port).ok()?;
    Some(redirected)
}
