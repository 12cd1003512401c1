//! Error types for modhost modules
//!
//! [`HttpError`] is the structured HTTP exception: any handler, pre-handler or
//! the routing authority may fail with one and the runtime turns it into a
//! rendered response. [`HandlerError`] is the full set of ways a request-time
//! callable can fail.

use std::collections::HashMap;
use std::fmt;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::response::Response;
use crate::status;

/// A structured HTTP error carrying everything needed to render it
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    /// HTTP status code
    pub status: u16,

    /// Short message, defaults to the status reason phrase
    pub message: String,

    /// Longer explanation, defaults to the status description
    pub explain: String,

    /// Extra headers to send with the rendered response
    pub headers: Option<HashMap<String, String>>,

    /// Extra properties merged into JSON error bodies
    pub properties: Map<String, Value>,
}

impl HttpError {
    /// Create an error with the default message and explanation for `status`.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            message: status::phrase(status).to_string(),
            explain: status::description(status).to_string(),
            headers: None,
            properties: Map::new(),
        }
    }

    /// Create an error with a custom explanation only.
    ///
    /// # Example
    /// ```ignore
    /// return Err(HttpError::only_explain(400, "JSON content type expected").into());
    /// ```
    pub fn only_explain(status: u16, explain: impl Into<String>) -> Self {
        Self::new(status).with_explain(explain)
    }

    pub fn not_found() -> Self {
        Self::new(404)
    }

    pub fn internal() -> Self {
        Self::new(500)
    }

    /// Set the explanation (builder pattern).
    pub fn with_explain(mut self, explain: impl Into<String>) -> Self {
        self.explain = explain.into();
        self
    }

    /// Add a header to the rendered response (builder pattern).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Add a property to JSON error bodies (builder pattern).
    pub fn add_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Build an error from a response that was raised as a failure.
    ///
    /// The body, when present, becomes the explanation.
    pub fn from_response(response: Response) -> Self {
        let mut err = Self::new(response.status);
        if let Some(body) = response.body.filter(|b| !b.is_empty()) {
            err.explain = body;
        }
        if !response.headers.is_empty() {
            err.headers = Some(response.headers);
        }
        err
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

impl std::error::Error for HttpError {}

/// Errors a request handler or pre-handler can fail with
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Structured HTTP error, rendered by the routing authority
    #[error("{0}")]
    Http(#[from] HttpError),

    /// A response raised as control flow (redirects, early exits).
    ///
    /// Below 400 it is sent as is, otherwise it is rendered like an `HttpError`.
    #[error("control response with status {}", .0.status)]
    Transport(Response),

    /// Any other failure, answered with a generic 500
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HandlerError {
    /// Wrap any error as an uncaught failure.
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        HandlerError::Other(err.into())
    }

    /// Raise a redirect as control flow.
    pub fn redirect(status: u16, location: impl Into<String>) -> Self {
        HandlerError::Transport(Response::redirect(status, location))
    }

    /// Status code this error will be answered with.
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::Http(err) => err.status,
            HandlerError::Transport(resp) => resp.status,
            HandlerError::Other(_) => 500,
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Other(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_come_from_status() {
        let err = HttpError::new(404);
        assert_eq!(err.message, "Not Found");
        assert_eq!(err.explain, "Resource not found.");
        assert!(err.headers.is_none());
    }

    #[test]
    fn test_builder() {
        let err = HttpError::only_explain(429, "slow down")
            .with_header("Retry-After", "10")
            .add_property("retry_after", 10);
        assert_eq!(err.message, "Too Many Requests");
        assert_eq!(err.explain, "slow down");
        assert_eq!(err.headers.unwrap()["Retry-After"], "10");
        assert_eq!(err.properties["retry_after"], 10);
    }

    #[test]
    fn test_from_response() {
        let err = HttpError::from_response(Response::text(403, "nope"));
        assert_eq!(err.status, 403);
        assert_eq!(err.explain, "nope");
        assert!(err.headers.is_some());
    }

    #[test]
    fn test_handler_error_status() {
        assert_eq!(HandlerError::from(HttpError::not_found()).status_code(), 404);
        assert_eq!(HandlerError::redirect(302, "/").status_code(), 302);
        assert_eq!(HandlerError::other("boom").status_code(), 500);
    }
}
