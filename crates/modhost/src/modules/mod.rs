//! Modules shipped with the binary
//!
//! - `special_handler`: the routing authority (virtual hosts, error pages)
//! - `health`: health endpoint and heartbeat

pub mod health;
pub mod special_handler;

use crate::runtime::ModuleCatalog;

pub use health::{Health, HealthModule};
pub use special_handler::{SpecialHandler, VirtualHostAuthority};

/// Catalog with every built-in module under its directory identity.
pub fn builtin_catalog() -> ModuleCatalog {
    ModuleCatalog::new()
        .with("special_handler", SpecialHandler)
        .with("health", Health)
}
