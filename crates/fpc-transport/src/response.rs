use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

/// Response classes the client acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    ClientError,
    NotFound,
    ServerError,
    ServiceUnavailable,
}

impl ResponseStatus {
    /// Classify an HTTP status code.
    #[must_use]
    pub fn from_code(code: u16) -> Self {
        match code {
            200..=299 => Self::Ok,
            404 => Self::NotFound,
            503 => Self::ServiceUnavailable,
            500..=599 => Self::ServerError,
            _ => Self::ClientError,
        }
    }

    /// Readable name used in error messages.
    #[must_use]
    pub fn reason(code: u16) -> &'static str {
        match code {
            400 => "Bad Request",
            403 => "Forbidden",
            404 => "Not Found",
            500 => "Runtime Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }
}

/// A raw response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// Header names are lowercase.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    #[must_use]
    pub fn new(code: u16) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn status(&self) -> ResponseStatus {
        ResponseStatus::from_code(self.code)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The service's `{"error": "..."}` message, else the name of the status
    /// code.
    #[must_use]
    pub fn error_message(&self) -> String {
        self.json::<serde_json::Value>()
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned))
            .unwrap_or_else(|| ResponseStatus::reason(self.code).to_owned())
    }
}
