//! What modules see of the runtime outside the registration calls
//!
//! - [`RuntimeConfig`]: the module-facing configuration snapshot
//! - [`RuntimeHandle`]: a weak handle that modules may keep past `setup`

use std::path::PathBuf;
use std::sync::Weak;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::RuntimeError;
use super::events::DispatchReport;
use super::manager::{Inner, LifecycleState, ModuleRuntime, RuntimeStatus};

/// Runtime configuration snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hostnames of the main site
    pub main_domains: Vec<String>,

    /// Path prefix whose errors render as JSON
    pub api_prefix: String,

    /// HTML template for non-API error pages
    pub error_template: Option<PathBuf>,

    /// Enable permissive CORS for the API
    pub dev: bool,

    /// Heartbeat period of the health module
    pub heartbeat_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            main_domains: vec!["localhost".to_string()],
            api_prefix: "/api".to_string(),
            error_template: None,
            dev: false,
            heartbeat_secs: 60,
        }
    }
}

/// Weak handle to a running [`ModuleRuntime`].
///
/// Holding one never keeps the runtime alive. Every call is a no-op once the
/// runtime is gone.
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Weak<Inner>,
}

impl RuntimeHandle {
    pub(crate) fn new(inner: Weak<Inner>) -> Self {
        Self { inner }
    }

    /// A handle not attached to any runtime.
    pub fn detached() -> Self {
        Self { inner: Weak::new() }
    }

    pub fn runtime(&self) -> Option<ModuleRuntime> {
        self.inner.upgrade().map(ModuleRuntime::from_inner)
    }

    /// Broadcast an event to the currently installed modules.
    pub async fn dispatch(&self, event: &str, args: Value) -> DispatchReport {
        match self.runtime() {
            Some(runtime) => runtime.dispatch(event, args).await,
            None => DispatchReport::default(),
        }
    }

    /// Request a background reload.
    pub fn reload(&self) -> Result<(), RuntimeError> {
        match self.runtime() {
            Some(runtime) => runtime.reload(),
            None => Err(RuntimeError::InvalidState {
                action: "reload",
                state: "detached".to_string(),
            }),
        }
    }

    pub fn state(&self) -> Option<LifecycleState> {
        self.runtime().map(|r| r.state())
    }

    pub async fn status(&self) -> Option<RuntimeStatus> {
        match self.runtime() {
            Some(runtime) => Some(runtime.status().await),
            None => None,
        }
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_detached_handle_is_inert() {
        let handle = RuntimeHandle::detached();
        assert!(handle.runtime().is_none());
        assert!(handle.state().is_none());
        assert!(handle.status().await.is_none());
        assert_eq!(handle.dispatch("disconnect", Value::Null).await.invoked, 0);
        assert!(handle.reload().is_err());
    }

    #[test]
    fn test_config_serializes() {
        let json = serde_json::to_value(RuntimeConfig::default()).unwrap();
        assert_eq!(json["api_prefix"], "/api");
        assert_eq!(json["main_domains"][0], "localhost");
    }
}
