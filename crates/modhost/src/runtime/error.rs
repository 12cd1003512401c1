//! Runtime error taxonomy

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while discovering and ordering modules
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("circular dependency between modules: {}", format_graph(.remaining))]
    CircularDependency {
        /// Modules left unresolved, with the dependencies they still wait on
        remaining: BTreeMap<String, BTreeSet<String>>,
    },

    #[error("module {module} depends on unknown module {dependency}")]
    MissingDependency { module: String, dependency: String },

    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor {path:?}: {source}")]
    Descriptor {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn format_graph(remaining: &BTreeMap<String, BTreeSet<String>>) -> String {
    remaining
        .iter()
        .map(|(module, deps)| {
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            format!("{} -> [{}]", module, deps.join(", "))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration errors raised while a module registers its capabilities
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("a routing authority is already set ({existing})")]
    DuplicateRoutingAuthority { existing: String },

    #[error("{callable} is already subscribed to event {event}")]
    DuplicateEventSubscription { event: String, callable: String },

    #[error("module {module} declares HTTP routes but no routing authority is set")]
    NoRoutingAuthority { module: String },
}

/// Drain accounting errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("drain counter released below zero")]
    CounterUnderflow,
}

/// A single module's setup failure
#[derive(Debug)]
pub struct ModuleFailure {
    pub module: String,
    pub error: anyhow::Error,
}

impl fmt::Display for ModuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:#}", self.module, self.error)
    }
}

/// Lifecycle failures of the module runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("module {0} is not in the catalog")]
    UnknownModule(String),

    #[error("{} module(s) failed to set up: {}", .0.len(), format_failures(.0))]
    ModuleSetupFailure(Vec<ModuleFailure>),

    #[error("no module set a routing authority")]
    MissingRoutingAuthority,

    #[error("a reload is already in progress")]
    ReloadInProgress,

    #[error("cannot {action} while {state}")]
    InvalidState { action: &'static str, state: String },

    #[error("reload failed ({cause}) and rollback failed ({rollback})")]
    RollbackFailed {
        cause: Box<RuntimeError>,
        rollback: Box<RuntimeError>,
    },
}

fn format_failures(failures: &[ModuleFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
