use std::time::Duration;

use ureq::Agent;
use ureq::http;

use crate::{Request, Response, Transport, TransportError};

/// [`Transport`] over HTTPS with `ureq`.
pub struct HttpTransport {
    agent: Agent,
    base_url: String,
}

impl HttpTransport {
    /// Transport for the service at `base_url`.
    ///
    /// `timeout` bounds the whole exchange, `connect_timeout` only the
    /// connection setup.
    #[must_use]
    pub fn new(base_url: &str, connect_timeout: Duration, timeout: Duration) -> Self {
        let agent = Agent::config_builder()
            .timeout_connect(Some(connect_timeout))
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .allow_non_standard_methods(true)
            .build()
            .into();

        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Absolute URL for a request path.
    #[must_use]
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_owned()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn builder(&self, request: &Request) -> Result<http::request::Builder, TransportError> {
        let method = http::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        let mut builder = http::Request::builder()
            .method(method)
            .uri(self.url_for(&request.path));
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(cookie) = request.cookie_header() {
            builder = builder.header("Cookie", cookie);
        }
        Ok(builder)
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let builder = self.builder(request)?;
        let result = if request.has_body() {
            let http_request = builder
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(request.encoded_body().into_bytes())
                .map_err(|e| TransportError::Fatal(e.to_string()))?;
            self.agent.run(http_request)
        } else {
            let http_request = builder
                .body(())
                .map_err(|e| TransportError::Fatal(e.to_string()))?;
            self.agent.run(http_request)
        };

        let response = result?;
        let code = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                Some((name.as_str().to_owned(), value.to_str().ok()?.to_owned()))
            })
            .collect();
        let body = response.into_body().read_to_vec()?;

        tracing::debug!(method = %request.method, path = %request.path, code, "Remote call");
        Ok(Response {
            code,
            headers,
            body,
        })
    }
}
