//! Handler types and route declarations
//!
//! Route handlers are stored as type-erased async closures so that modules can
//! hand them to the routing authority without the runtime knowing their types.
//!
//! # Example
//!
//! ```ignore
//! use modhost_sdk::prelude::*;
//!
//! let get_user = handler(|req: Request| async move {
//!     let id: i64 = req.require_path_param("id")?;
//!     Ok(Response::ok(json!({"id": id})))
//! });
//!
//! let route = RouteSpec::new(["GET"], "/api/users/{id}");
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::{HandlerError, Request, Response};

/// Type alias for boxed futures returned by handlers
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A type-erased route handler
pub type Handler =
    Arc<dyn Fn(Request) -> BoxFuture<'static, Result<Response, HandlerError>> + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)))
}

/// One route a handler answers: a method set and a path pattern.
///
/// Patterns are `/` separated. A segment may be static, a named parameter
/// `{id}`, or a named parameter with a regex `{tail:.*}`. The method `*`
/// matches any method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub methods: Vec<String>,
    pub path: String,
}

impl RouteSpec {
    pub fn new<I, S>(methods: I, path: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            methods: methods
                .into_iter()
                .map(|m| m.as_ref().to_ascii_uppercase())
                .collect(),
            path: path.into(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(["GET"], path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(["POST"], path)
    }

    /// Route matching every method.
    pub fn any(path: impl Into<String>) -> Self {
        Self::new(["*"], path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HttpError;

    #[tokio::test]
    async fn test_handler_boxing() {
        let h = handler(|req: Request| async move {
            if req.path == "/missing" {
                return Err(HttpError::not_found().into());
            }
            Ok(Response::text(200, req.path))
        });

        let resp = h(Request::new("GET", "/hello")).await.unwrap();
        assert_eq!(resp.body.as_deref(), Some("/hello"));

        let err = h(Request::new("GET", "/missing")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_route_spec_uppercases_methods() {
        let spec = RouteSpec::new(["get", "Post"], "/items");
        assert_eq!(spec.methods, vec!["GET", "POST"]);
        assert_eq!(RouteSpec::any("/x").methods, vec!["*"]);
    }
}
