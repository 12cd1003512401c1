//! modhost SDK - Types and utilities for writing modhost modules
//!
//! This crate provides the request/response types, the structured HTTP error
//! and the handler helpers that modules use to plug into a modhost runtime.

pub mod request;
pub mod response;
pub mod error;
pub mod status;
pub mod site_host;
pub mod handler;

pub mod prelude {
    //! Common imports for modhost modules
    pub use crate::request::Request;
    pub use crate::response::Response;
    pub use crate::error::{HandlerError, HttpError};
    pub use crate::site_host::SiteHost;
    pub use crate::handler::{handler, BoxFuture, Handler, RouteSpec};
    pub use serde::{Deserialize, Serialize};
    pub use serde_json::{json, Value as JsonValue};
}

// Re-export key types at crate root
pub use request::Request;
pub use response::Response;
pub use error::{HandlerError, HttpError};
pub use site_host::SiteHost;
pub use handler::{handler, BoxFuture, Handler, RouteSpec};
