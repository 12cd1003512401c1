//! Runtime module - module loading, capability registry and lifecycle
//!
//! This module provides:
//! - Dependency-ordered discovery of the module tree
//! - The catalog of module entry points and the registration surface
//! - Priority-tiered lifecycle events
//! - The in-flight request drain gate
//! - The load / unload / reload-with-rollback state machine

pub mod catalog;
pub mod context;
pub mod drain;
pub mod error;
pub mod escalation;
pub mod events;
pub mod manager;
pub mod module;
pub mod resolver;
pub mod tasks;

pub use catalog::{ModuleCatalog, ModuleEntry};
pub use context::{RuntimeConfig, RuntimeHandle};
pub use drain::{DrainGate, DrainGuard};
pub use error::{DrainError, ModuleFailure, RegistrationError, ResolveError, RuntimeError};
pub use escalation::{Escalation, EscalationDecision, FixedEscalation};
pub use events::{DispatchReport, EventDispatcher, EventSubscription, DISCONNECT};
pub use manager::{LifecycleState, ModuleRuntime, ReloadOutcome, RuntimeStatus};
pub use module::{
    BaseModule, HttpModule, HttpRoute, PreHandlerModule, Registrar, RouteExtras, RoutingAuthority,
};
pub use resolver::ModuleDescriptor;
pub use tasks::{PeriodicTask, TaskSet};
