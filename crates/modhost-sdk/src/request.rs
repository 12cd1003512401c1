//! HTTP Request representation for modules

use crate::error::HttpError;
use crate::site_host::SiteHost;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Header used by clients that cannot send arbitrary methods
pub const METHOD_OVERRIDE_HEADER: &str = "X-HTTP-Method-Override";

/// Represents an incoming HTTP request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Request {
    /// HTTP method (GET, POST, PUT, DELETE, etc.)
    pub method: String,

    /// Request path (e.g., "/items/123")
    pub path: String,

    /// Query parameters
    #[serde(default)]
    pub query: HashMap<String, String>,

    /// HTTP headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request body
    #[serde(default)]
    pub body: Option<String>,

    /// Path parameters extracted from route (e.g., {id} -> "123")
    #[serde(default)]
    pub params: HashMap<String, String>,

    /// Client IP address
    #[serde(default)]
    pub client_ip: Option<String>,

    /// Request ID for tracing
    #[serde(default)]
    pub request_id: String,

    /// Virtual host resolved by the routing authority, `None` when unmatched
    #[serde(skip)]
    pub site_host: Option<SiteHost>,
}

impl Request {
    /// Create a request with the given method and path.
    ///
    /// # Example
    /// ```ignore
    /// let req = Request::new("GET", "/api/health").with_header("Host", "example.com");
    /// ```
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add a header (builder pattern).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the body (builder pattern).
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Apply `X-HTTP-Method-Override` if the client sent one.
    pub fn apply_method_override(&mut self) {
        if let Some(method) = self.header(METHOD_OVERRIDE_HEADER) {
            let method = method.trim().to_ascii_uppercase();
            if !method.is_empty() {
                self.method = method;
            }
        }
    }

    /// Parse the body as JSON into a typed struct.
    ///
    /// Fails with a 400 `HttpError` when the body is not valid JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, HttpError> {
        let body = self.body.as_deref().unwrap_or("null");
        serde_json::from_str(body)
            .map_err(|_| HttpError::only_explain(400, "Bad JSON"))
    }

    /// Get a query parameter as a string reference.
    pub fn query_param(&self, key: &str) -> Option<&String> {
        self.query.get(key)
    }

    /// Get a path parameter as a string reference.
    ///
    /// # Example
    /// ```ignore
    /// // Route: /users/{id}, Request: /users/123
    /// let id = req.path_param("id"); // Some(&"123".to_string())
    /// ```
    pub fn path_param(&self, key: &str) -> Option<&String> {
        self.params.get(key)
    }

    /// Get a required path parameter parsed as a specific type.
    /// Returns a 400 `HttpError` if missing or invalid.
    pub fn require_path_param<T: FromStr>(&self, key: &str) -> Result<T, HttpError> {
        self.params.get(key)
            .ok_or_else(|| HttpError::only_explain(400, format!("Missing path parameter: {}", key)))?
            .parse()
            .map_err(|_| HttpError::only_explain(400, format!("Invalid value for path parameter: {}", key)))
    }

    /// Get a header value (case-insensitive lookup).
    pub fn header(&self, key: &str) -> Option<&String> {
        self.headers.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// The raw `Host` header, if any.
    pub fn host(&self) -> Option<&str> {
        self.header("Host").map(String::as_str)
    }

    /// The `Host` header with any port stripped.
    ///
    /// Bracketed IPv6 literals keep their brackets: `[::1]:8080` -> `[::1]`.
    pub fn host_without_port(&self) -> Option<&str> {
        let host = self.host()?.trim();
        if host.starts_with('[') {
            return Some(host.split_once(']').map(|(h, _)| &host[..=h.len()]).unwrap_or(host));
        }
        Some(host.split(':').next().unwrap_or(host))
    }

    /// Get the Content-Type header value.
    pub fn content_type(&self) -> Option<&String> {
        self.header("Content-Type")
    }

    /// Check if the request has a JSON content type.
    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let req = Request::new("get", "/").with_header("Content-Type", "application/json");
        assert_eq!(req.method, "GET");
        assert!(req.header("content-type").is_some());
        assert!(req.is_json());
    }

    #[test]
    fn test_host_without_port() {
        let req = Request::new("GET", "/").with_header("host", "Example.com:8443");
        assert_eq!(req.host_without_port(), Some("Example.com"));

        let req = Request::new("GET", "/").with_header("Host", "[::1]:8080");
        assert_eq!(req.host_without_port(), Some("[::1]"));

        let req = Request::new("GET", "/");
        assert_eq!(req.host_without_port(), None);
    }

    #[test]
    fn test_method_override() {
        let mut req = Request::new("POST", "/items/1").with_header(METHOD_OVERRIDE_HEADER, "delete");
        req.apply_method_override();
        assert_eq!(req.method, "DELETE");
    }

    #[test]
    fn test_json_body() {
        #[derive(Debug, Deserialize)]
        struct Payload {
            name: String,
        }

        let req = Request::new("POST", "/").with_body(r#"{"name":"a"}"#);
        let payload: Payload = req.json().unwrap();
        assert_eq!(payload.name, "a");

        let bad = Request::new("POST", "/").with_body("{");
        let err = bad.json::<Payload>().unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn test_require_path_param() {
        let mut req = Request::new("GET", "/users/42");
        req.params.insert("id".into(), "42".into());
        let id: i64 = req.require_path_param("id").unwrap();
        assert_eq!(id, 42);
        assert!(req.require_path_param::<i64>("missing").is_err());
    }
}
