use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_method() -> String {
    "GET".to_owned()
}

/// A complete description of one remote call.
///
/// `path` is relative to the service base URL unless it is an absolute
/// `http(s)://` URL. The serialized form is the backlog entry format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(rename = "type", default = "default_method")]
    pub method: String,
    /// Form fields, sent url-encoded with `POST` and `PUT`.
    #[serde(rename = "bodyData", default)]
    pub body: BTreeMap<String, String>,
}

impl Request {
    /// A request with `method` to `path`.
    pub fn new(method: &str, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            headers: BTreeMap::new(),
            cookies: BTreeMap::new(),
            method: method.to_ascii_uppercase(),
            body: BTreeMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn cookies(mut self, cookies: &BTreeMap<String, String>) -> Self {
        self.cookies
            .extend(cookies.iter().map(|(n, v)| (n.clone(), v.clone())));
        self
    }

    /// Add a form field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.body.insert(name.into(), value.into());
        self
    }

    /// Whether the form body is sent.
    #[must_use]
    pub fn has_body(&self) -> bool {
        matches!(self.method.as_str(), "POST" | "PUT")
    }

    /// The `Cookie` header value, if there are cookies.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// The url-encoded form body.
    #[must_use]
    pub fn encoded_body(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.body)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serialized_field_names() {
        let request = Request::post("cache/purge/site1")
            .field("url", "https://example.com/")
            .header("X-Nitro-Url", "https://example.com/");

        let json: serde_json::Value = serde_json::to_value(&request).unwrap();

        assert_eq!(json["path"], "cache/purge/site1");
        assert_eq!(json["type"], "POST");
        assert_eq!(json["bodyData"]["url"], "https://example.com/");
        assert_eq!(json.get("async"), None);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let request: Request = serde_json::from_str(r#"{"path": "cache/get/site1/default"}"#).unwrap();

        assert_eq!(request, Request::get("cache/get/site1/default"));
    }

    #[test]
    fn test_deserialize_ignores_dispatch_flags() {
        let request: Request =
            serde_json::from_str(r#"{"path": "p", "type": "POST", "async": true, "verifySSL": false}"#)
                .unwrap();

        assert_eq!(request.path, "p");
        assert_eq!(request.method, "POST");
    }

    #[test]
    fn test_cookie_header_and_body() {
        let request = Request::post("p")
            .cookie("b", "2")
            .cookie("a", "1")
            .field("url", "https://example.com/?a=1&b=2")
            .field("reason", "post updated");

        assert_eq!(request.cookie_header().as_deref(), Some("a=1; b=2"));
        assert_eq!(
            request.encoded_body(),
            "reason=post+updated&url=https%3A%2F%2Fexample.com%2F%3Fa%3D1%26b%3D2"
        );
        assert!(request.has_body());
        assert!(!Request::get("p").has_body());
        assert_eq!(Request::get("p").cookie_header(), None);
    }
}
