//! modhost - pluggable module runtime and request-serving host
//!
//! Modules are discovered from a directory tree, ordered by their
//! dependencies and set up against a [`runtime::Registrar`]. The
//! [`runtime::ModuleRuntime`] serves requests through them and can swap the
//! whole module set at runtime, rolling back when the new set fails.

pub mod config;
pub mod modules;
pub mod pipeline;
pub mod routing;
pub mod runtime;
pub mod server;
