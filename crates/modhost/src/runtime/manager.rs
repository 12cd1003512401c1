//! Module runtime lifecycle
//!
//! Owns the installed [`Registry`] and drives it through
//! `Empty -> Loading -> Ready -> (Reloading -> Ready | RolledBack) -> Unloading -> Empty`.
//!
//! A load pass resolves the module tree, runs every module's `setup` in
//! dependency order against a fresh registry, and only installs that registry
//! once the whole pass succeeded. A reload drains in-flight requests, tears the
//! current modules down, and loads again; when that fails it re-runs `setup`
//! for the previous module set so the process keeps serving.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};

use super::catalog::{ModuleCatalog, ModuleEntry};
use super::context::{RuntimeConfig, RuntimeHandle};
use super::drain::DrainGate;
use super::error::{ModuleFailure, RuntimeError};
use super::escalation::{Escalation, EscalationDecision, FixedEscalation};
use super::events::{DispatchReport, DISCONNECT};
use super::module::{BaseModule, LoadedModule, Registrar, Registry};
use super::resolver::{self, ModuleDescriptor};
use super::tasks::TaskSet;

/// Lifecycle state of the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Empty,
    Loading,
    Ready,
    Reloading,
    /// A reload failed and the previous modules were restored
    RolledBack,
    Unloading,
    /// Neither a load nor its rollback left working modules
    Degraded,
}

impl LifecycleState {
    /// Whether requests are dispatched in this state.
    pub fn is_serving(self) -> bool {
        matches!(self, Self::Ready | Self::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Reloading => "reloading",
            Self::RolledBack => "rolled_back",
            Self::Unloading => "unloading",
            Self::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a reload that left the runtime serving
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The new module set is installed
    Reloaded,
    /// The new set failed and the previous one was restored
    RolledBack { cause: String },
}

/// A loaded unit as reported by [`ModuleRuntime::status`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub identity: String,
    pub name: String,
}

/// Point-in-time view of the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub state: LifecycleState,
    pub modules: Vec<ModuleInfo>,
    pub pre_handlers: Vec<String>,
    pub routing_authority: Option<String>,
    pub in_flight: usize,
    pub tracked_tasks: usize,
    pub reload_in_progress: bool,
    pub loaded_at: Option<DateTime<Utc>>,
    pub last_reload_at: Option<DateTime<Utc>>,
    pub last_reload_outcome: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Epochs {
    loaded_at: Option<DateTime<Utc>>,
    last_reload_at: Option<DateTime<Utc>>,
    last_reload_outcome: Option<String>,
}

/// A failed load pass and whatever it registered before failing
struct LoadFailure {
    partial: Registry,
    error: RuntimeError,
}

pub(crate) struct Inner {
    modules_dir: PathBuf,
    config: RuntimeConfig,
    catalog: StdRwLock<ModuleCatalog>,
    staged: Mutex<Option<ModuleCatalog>>,
    pub(crate) registry: RwLock<Arc<Registry>>,
    pub(crate) state: watch::Sender<LifecycleState>,
    pub(crate) drain: Arc<DrainGate>,
    tasks: TaskSet,
    reloading: AtomicBool,
    lifecycle: AsyncMutex<()>,
    escalation: Arc<dyn Escalation>,
    shutdown: watch::Sender<bool>,
    epochs: Mutex<Epochs>,
}

/// Clears the reload-in-progress flag on every exit path
struct ReloadFlag<'a>(&'a AtomicBool);

impl Drop for ReloadFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Builder for [`ModuleRuntime`]
pub struct RuntimeBuilder {
    modules_dir: PathBuf,
    config: RuntimeConfig,
    catalog: ModuleCatalog,
    escalation: Arc<dyn Escalation>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: ModuleCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn escalation(mut self, escalation: Arc<dyn Escalation>) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn build(self) -> ModuleRuntime {
        let (state, _) = watch::channel(LifecycleState::Empty);
        let (shutdown, _) = watch::channel(false);
        ModuleRuntime {
            inner: Arc::new(Inner {
                modules_dir: self.modules_dir,
                config: self.config,
                catalog: StdRwLock::new(self.catalog),
                staged: Mutex::new(None),
                registry: RwLock::new(Arc::new(Registry::default())),
                state,
                drain: Arc::new(DrainGate::new()),
                tasks: TaskSet::new(),
                reloading: AtomicBool::new(false),
                lifecycle: AsyncMutex::new(()),
                escalation: self.escalation,
                shutdown,
                epochs: Mutex::new(Epochs::default()),
            }),
        }
    }
}

/// The module runtime, cheap to clone
#[derive(Clone)]
pub struct ModuleRuntime {
    pub(crate) inner: Arc<Inner>,
}

impl ModuleRuntime {
    pub fn builder(modules_dir: impl Into<PathBuf>) -> RuntimeBuilder {
        RuntimeBuilder {
            modules_dir: modules_dir.into(),
            config: RuntimeConfig::default(),
            catalog: ModuleCatalog::new(),
            escalation: Arc::new(FixedEscalation::default()),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle::new(Arc::downgrade(&self.inner))
    }

    pub fn modules_dir(&self) -> &Path {
        &self.inner.modules_dir
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.borrow()
    }

    /// Subscribe to lifecycle state changes.
    pub fn watch_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    pub fn drain(&self) -> &Arc<DrainGate> {
        &self.inner.drain
    }

    pub fn tasks(&self) -> &TaskSet {
        &self.inner.tasks
    }

    pub fn is_reloading(&self) -> bool {
        self.inner.reloading.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: LifecycleState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            tracing::info!(from = %previous, to = %state, "Runtime state changed");
        }
    }

    /// The currently installed registry.
    pub(crate) async fn registry(&self) -> Arc<Registry> {
        Arc::clone(&*self.inner.registry.read().await)
    }

    async fn install(&self, registry: Registry) {
        *self.inner.registry.write().await = Arc::new(registry);
        let mut epochs = self.inner.epochs.lock().unwrap_or_else(|e| e.into_inner());
        epochs.loaded_at = Some(Utc::now());
    }

    async fn take_registry(&self) -> Arc<Registry> {
        std::mem::take(&mut *self.inner.registry.write().await)
    }

    fn active_catalog(&self) -> ModuleCatalog {
        self.inner.catalog.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the catalog used by the next reload.
    ///
    /// It becomes active only if that reload succeeds.
    pub fn stage_catalog(&self, catalog: ModuleCatalog) {
        *self.inner.staged.lock().unwrap_or_else(|e| e.into_inner()) = Some(catalog);
    }

    /// Broadcast an event to the installed modules.
    pub async fn dispatch(&self, event: &str, args: Value) -> DispatchReport {
        let registry = self.registry().await;
        registry.events.dispatch(event, args).await
    }

    /// First loaded unit of type `M`.
    pub async fn get_module<M: BaseModule>(&self) -> Option<Arc<M>> {
        let registry = self.registry().await;
        registry.modules.iter().find_map(LoadedModule::downcast::<M>)
    }

    /// Identities of the loaded modules, in load order.
    pub async fn module_identities(&self) -> Vec<String> {
        let registry = self.registry().await;
        registry.descriptors.iter().map(|d| d.identity.clone()).collect()
    }

    /// Run every module's setup in `descriptors` order against a fresh registry.
    async fn load_pass(
        &self,
        catalog: &ModuleCatalog,
        descriptors: Vec<ModuleDescriptor>,
    ) -> Result<Registry, LoadFailure> {
        let mut registry = Registry::default();

        let mut entries: Vec<(ModuleDescriptor, Arc<dyn ModuleEntry>)> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            match catalog.get(&descriptor.identity) {
                Some(entry) => entries.push((descriptor, entry)),
                None => {
                    return Err(LoadFailure {
                        partial: registry,
                        error: RuntimeError::UnknownModule(descriptor.identity),
                    })
                }
            }
        }

        let mut failures = Vec::new();
        for (descriptor, entry) in entries {
            let outcome = {
                let mut registrar = Registrar::new(
                    &mut registry,
                    &descriptor,
                    &self.inner.config,
                    &self.inner.tasks,
                    self.handle(),
                );
                std::panic::AssertUnwindSafe(entry.setup(&mut registrar))
                    .catch_unwind()
                    .await
            };

            let error = match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(module = %descriptor.identity, "Module set up");
                    None
                }
                Ok(Err(e)) => Some(e),
                Err(_) => Some(anyhow::anyhow!("setup panicked")),
            };
            if let Some(error) = error {
                tracing::error!(module = %descriptor.identity, "Module setup failed: {:#}", error);
                failures.push(ModuleFailure {
                    module: descriptor.identity.clone(),
                    error,
                });
            }
            registry.descriptors.push(descriptor);
        }

        if !failures.is_empty() {
            return Err(LoadFailure {
                partial: registry,
                error: RuntimeError::ModuleSetupFailure(failures),
            });
        }
        if registry.authority.is_none() {
            return Err(LoadFailure {
                partial: registry,
                error: RuntimeError::MissingRoutingAuthority,
            });
        }
        Ok(registry)
    }

    /// Resolve the module tree and run a load pass over it.
    async fn scan_and_load(&self, catalog: &ModuleCatalog) -> Result<Registry, LoadFailure> {
        let descriptors = resolver::scan_modules(&self.inner.modules_dir).map_err(|e| LoadFailure {
            partial: Registry::default(),
            error: e.into(),
        })?;
        self.load_pass(catalog, descriptors).await
    }

    /// Run every unit's unload hook, newest first, as one concurrent group.
    ///
    /// Failures are logged and counted, never raised.
    async fn unload_units(modules: &[LoadedModule]) -> usize {
        let runs = modules.iter().rev().map(|module| async move {
            let outcome = std::panic::AssertUnwindSafe(module.unit.on_unload())
                .catch_unwind()
                .await;
            (module, outcome)
        });

        let mut failed = 0;
        for (module, outcome) in join_all(runs).await {
            match outcome {
                Ok(Ok(())) => {
                    tracing::debug!(module = %module.identity, unit = %module.name, "Module unit unloaded");
                }
                Ok(Err(e)) => {
                    failed += 1;
                    tracing::error!(module = %module.identity, unit = %module.name, "Unload hook failed: {:#}", e);
                }
                Err(_) => {
                    failed += 1;
                    tracing::error!(module = %module.identity, unit = %module.name, "Unload hook panicked");
                }
            }
        }
        failed
    }

    /// Hand an unrecoverable failure to the escalation policy.
    fn escalate(&self, error: &RuntimeError) -> EscalationDecision {
        let decision = self.inner.escalation.decide(error);
        if decision == EscalationDecision::Terminate {
            self.request_shutdown();
        }
        decision
    }

    /// Ask the hosting process to shut down.
    pub fn request_shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// Resolve once a shutdown has been requested.
    pub async fn shutdown_requested(&self) {
        let mut rx = self.inner.shutdown.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }

    /// Load the module tree and start serving.
    ///
    /// Every module's setup runs even when an earlier one fails; the failures
    /// are then reported together and the partial units are unloaded again.
    pub async fn load(&self) -> Result<(), RuntimeError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if !matches!(state, LifecycleState::Empty | LifecycleState::Degraded) {
            return Err(RuntimeError::InvalidState {
                action: "load",
                state: state.to_string(),
            });
        }

        self.set_state(LifecycleState::Loading);
        let catalog = self.active_catalog();
        match self.scan_and_load(&catalog).await {
            Ok(registry) => {
                let count = registry.modules.len();
                self.install(registry).await;
                self.set_state(LifecycleState::Ready);
                tracing::info!(units = count, "Modules loaded");
                Ok(())
            }
            Err(failure) => {
                Self::unload_units(&failure.partial.modules).await;
                self.set_state(LifecycleState::Degraded);
                self.escalate(&failure.error);
                Err(failure.error)
            }
        }
    }

    /// Stop serving, drain in-flight requests and unload every module.
    pub async fn unload(&self) -> Result<(), RuntimeError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() == LifecycleState::Empty {
            return Ok(());
        }

        self.set_state(LifecycleState::Unloading);
        self.dispatch(DISCONNECT, json!({ "reason": "unload" })).await;
        self.inner.drain.wait_quiesced().await;

        let registry = self.take_registry().await;
        let failed = Self::unload_units(&registry.modules).await;
        self.set_state(LifecycleState::Empty);
        tracing::info!(units = registry.modules.len(), failed, "Modules unloaded");
        Ok(())
    }

    /// Unload and abort every tracked background task.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.unload().await?;
        let aborted = self.inner.tasks.abort_all();
        if aborted > 0 {
            tracing::info!(aborted, "Aborted tracked tasks");
        }
        Ok(())
    }

    fn begin_reload(&self) -> Result<(), RuntimeError> {
        if self.inner.reloading.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::ReloadInProgress);
        }
        Ok(())
    }

    /// Start a reload in the background.
    ///
    /// Returns `ReloadInProgress` if one is already running.
    pub fn reload(&self) -> Result<(), RuntimeError> {
        self.begin_reload()?;
        let runtime = self.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.run_reload().await {
                tracing::error!("Reload failed: {}", e);
            }
        });
        Ok(())
    }

    /// Reload and wait for the outcome.
    pub async fn reload_and_wait(&self) -> Result<ReloadOutcome, RuntimeError> {
        self.begin_reload()?;
        self.run_reload().await
    }

    async fn run_reload(&self) -> Result<ReloadOutcome, RuntimeError> {
        let _flag = ReloadFlag(&self.inner.reloading);
        let _lifecycle = self.inner.lifecycle.lock().await;

        let state = self.state();
        if !matches!(
            state,
            LifecycleState::Ready | LifecycleState::RolledBack | LifecycleState::Degraded
        ) {
            return Err(RuntimeError::InvalidState {
                action: "reload",
                state: state.to_string(),
            });
        }

        tracing::info!("Reloading modules");
        self.set_state(LifecycleState::Reloading);
        self.dispatch(DISCONNECT, json!({ "reason": "reload" })).await;
        self.inner.drain.wait_quiesced().await;

        // Snapshot what is needed to bring the current set back
        let previous = self.take_registry().await;
        let previous_catalog = self.active_catalog();
        let previous_descriptors = previous.descriptors.clone();

        Self::unload_units(&previous.modules).await;
        drop(previous);

        let leftover = self.inner.tasks.names();
        if !leftover.is_empty() {
            tracing::warn!(tasks = ?leftover, "Tracked tasks still running after unload");
        }

        let staged = self.inner.staged.lock().unwrap_or_else(|e| e.into_inner()).take();
        let catalog = staged.unwrap_or_else(|| previous_catalog.clone());

        let outcome = match self.scan_and_load(&catalog).await {
            Ok(registry) => {
                self.install(registry).await;
                *self.inner.catalog.write().unwrap_or_else(|e| e.into_inner()) = catalog;
                self.set_state(LifecycleState::Ready);
                tracing::info!("Reload complete");
                Ok(ReloadOutcome::Reloaded)
            }
            Err(failure) => {
                tracing::error!("Reload failed, rolling back: {}", failure.error);
                Self::unload_units(&failure.partial.modules).await;
                drop(failure.partial);

                match self.load_pass(&previous_catalog, previous_descriptors).await {
                    Ok(registry) => {
                        self.install(registry).await;
                        self.set_state(LifecycleState::RolledBack);
                        tracing::warn!("Previous modules restored");
                        Ok(ReloadOutcome::RolledBack {
                            cause: failure.error.to_string(),
                        })
                    }
                    Err(rollback) => {
                        Self::unload_units(&rollback.partial.modules).await;
                        self.set_state(LifecycleState::Degraded);
                        let error = RuntimeError::RollbackFailed {
                            cause: Box::new(failure.error),
                            rollback: Box::new(rollback.error),
                        };
                        self.escalate(&error);
                        Err(error)
                    }
                }
            }
        };

        let mut epochs = self.inner.epochs.lock().unwrap_or_else(|e| e.into_inner());
        epochs.last_reload_at = Some(Utc::now());
        epochs.last_reload_outcome = Some(match &outcome {
            Ok(ReloadOutcome::Reloaded) => "reloaded".to_string(),
            Ok(ReloadOutcome::RolledBack { .. }) => "rolled_back".to_string(),
            Err(_) => "degraded".to_string(),
        });
        outcome
    }

    /// Point-in-time status for admin surfaces.
    pub async fn status(&self) -> RuntimeStatus {
        let registry = self.registry().await;
        let epochs = self.inner.epochs.lock().unwrap_or_else(|e| e.into_inner()).clone();
        RuntimeStatus {
            state: self.state(),
            modules: registry
                .modules
                .iter()
                .map(|m| ModuleInfo {
                    identity: m.identity.clone(),
                    name: m.name.clone(),
                })
                .collect(),
            pre_handlers: registry.pre_handlers.iter().map(|p| p.name.clone()).collect(),
            routing_authority: registry.routing_authority_name().map(str::to_string),
            in_flight: self.inner.drain.in_flight(),
            tracked_tasks: self.inner.tasks.len(),
            reload_in_progress: self.is_reloading(),
            loaded_at: epochs.loaded_at,
            last_reload_at: epochs.last_reload_at,
            last_reload_outcome: epochs.last_reload_outcome,
        }
    }
}
