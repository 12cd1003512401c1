//! Module capability roles and the registration surface
//!
//! A module unit implements [`BaseModule`] and optionally one of the richer
//! roles. During `setup` a module hands its units to the [`Registrar`], which
//! records their event subscriptions, forwards their routes to the routing
//! authority and keeps the ordered list of loaded units.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use modhost_sdk::{Handler, HandlerError, HttpError, Request, Response, RouteSpec, SiteHost};

use super::context::{RuntimeConfig, RuntimeHandle};
use super::error::RegistrationError;
use super::events::{EventDispatcher, EventSubscription};
use super::resolver::ModuleDescriptor;
use super::tasks::TaskSet;

/// Last path segment of a type name, `my_crate::users::UsersModule` -> `UsersModule`
fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Every module unit. The unload hook runs once when the unit is torn down.
#[async_trait]
pub trait BaseModule: Send + Sync + 'static {
    /// Name used in logs, pre-handler ordering and event callable names.
    fn name(&self) -> &str {
        short_type_name(std::any::type_name::<Self>())
    }

    /// Event subscriptions of this unit.
    fn events(self: Arc<Self>) -> Vec<EventSubscription> {
        Vec::new()
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A route-answering callable exposed by an [`HttpModule`]
#[derive(Clone)]
pub struct HttpRoute {
    pub name: String,
    pub handler: Handler,
    pub routes: Vec<RouteSpec>,
}

impl HttpRoute {
    pub fn new(name: impl Into<String>, handler: Handler, routes: Vec<RouteSpec>) -> Self {
        Self {
            name: name.into(),
            handler,
            routes,
        }
    }
}

/// A unit exposing HTTP routes
pub trait HttpModule: BaseModule {
    fn routes(self: Arc<Self>) -> Vec<HttpRoute>;
}

/// A unit whose hooks run around every request
#[async_trait]
pub trait PreHandlerModule: BaseModule {
    /// Returning a response skips the remaining pre-handlers and routing.
    async fn handle_request(&self, request: &mut Request) -> Result<Option<Response>, HandlerError>;

    /// Runs after dispatch for every pre-handler whose request phase ran.
    async fn handle_response(&self, _request: &Request, _response: &mut Response) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Extra metadata attached to a route registration
#[derive(Debug, Clone, Default)]
pub struct RouteExtras {
    /// Target virtual host, the main site when `None`
    pub site_host: Option<SiteHost>,
}

impl RouteExtras {
    pub fn for_site(site_host: SiteHost) -> Self {
        Self {
            site_host: Some(site_host),
        }
    }
}

/// The single unit responsible for host-based routing and error rendering
#[async_trait]
pub trait RoutingAuthority: BaseModule {
    fn on_add_http_routes(
        &self,
        name: &str,
        handler: Handler,
        routes: &[RouteSpec],
        extras: &RouteExtras,
    ) -> anyhow::Result<()>;

    /// Withdraw routes added with `handler` when their unit fails to register.
    fn on_remove_http_routes(&self, _name: &str, _handler: &Handler, _extras: &RouteExtras) {}

    fn get_sitehost(&self, request: &Request) -> Option<SiteHost>;

    async fn handle_request(&self, request: &Request) -> Result<Response, HandlerError>;

    async fn create_exception_response(&self, request: &Request, error: &HttpError) -> Response;
}

/// A loaded unit with its owning module identity
#[derive(Clone)]
pub struct LoadedModule {
    pub identity: String,
    pub name: String,
    pub unit: Arc<dyn BaseModule>,
    any: Arc<dyn Any + Send + Sync>,
}

impl LoadedModule {
    fn new<M: BaseModule>(identity: &str, unit: Arc<M>) -> Self {
        Self {
            identity: identity.to_string(),
            name: unit.name().to_string(),
            any: unit.clone(),
            unit,
        }
    }

    /// Typed view of the unit.
    pub fn downcast<M: BaseModule>(&self) -> Option<Arc<M>> {
        Arc::clone(&self.any).downcast::<M>().ok()
    }
}

/// A registered pre-handler and its name
#[derive(Clone)]
pub struct PreHandlerEntry {
    pub name: String,
    pub unit: Arc<dyn PreHandlerModule>,
}

/// Capabilities registered during one load pass
#[derive(Default)]
pub struct Registry {
    /// Descriptors whose setup ran, in load order
    pub descriptors: Vec<ModuleDescriptor>,
    /// Units in load order
    pub modules: Vec<LoadedModule>,
    pub pre_handlers: Vec<PreHandlerEntry>,
    pub authority: Option<Arc<dyn RoutingAuthority>>,
    pub events: EventDispatcher,
}

impl Registry {
    pub fn routing_authority_name(&self) -> Option<&str> {
        self.authority.as_ref().map(|a| a.name())
    }
}

/// What a module's `setup` receives
pub struct Registrar<'a> {
    registry: &'a mut Registry,
    descriptor: &'a ModuleDescriptor,
    config: &'a RuntimeConfig,
    tasks: &'a TaskSet,
    handle: RuntimeHandle,
}

impl<'a> Registrar<'a> {
    pub fn new(
        registry: &'a mut Registry,
        descriptor: &'a ModuleDescriptor,
        config: &'a RuntimeConfig,
        tasks: &'a TaskSet,
        handle: RuntimeHandle,
    ) -> Self {
        Self {
            registry,
            descriptor,
            config,
            tasks,
            handle,
        }
    }

    /// Subscriptions of `unit`, bound to this instance and checked against the table.
    fn prepare<M: BaseModule>(&self, unit: &Arc<M>) -> Result<Vec<EventSubscription>, RegistrationError> {
        let owner = Arc::as_ptr(unit) as *const () as usize;
        let prefix = format!("{}:{}", self.descriptor.identity, unit.name());
        let subscriptions: Vec<EventSubscription> = Arc::clone(unit)
            .events()
            .into_iter()
            .map(|mut sub| {
                sub.owner = owner;
                sub.callable = format!("{}.{}", prefix, sub.callable);
                sub
            })
            .collect();
        self.registry.events.check(&subscriptions)?;
        Ok(subscriptions)
    }

    fn commit<M: BaseModule>(
        &mut self,
        unit: Arc<M>,
        subscriptions: Vec<EventSubscription>,
    ) -> Result<(), RegistrationError> {
        self.registry.events.subscribe_all(subscriptions)?;
        tracing::debug!(module = %self.descriptor.identity, unit = %unit.name(), "Module unit added");
        self.registry
            .modules
            .push(LoadedModule::new(&self.descriptor.identity, unit));
        Ok(())
    }

    /// Register a unit with the base role only. Nothing is recorded on error.
    pub fn add_module<M: BaseModule>(&mut self, unit: Arc<M>) -> Result<(), RegistrationError> {
        let subscriptions = self.prepare(&unit)?;
        self.commit(unit, subscriptions)
    }

    /// Register a unit and forward its routes to the routing authority.
    ///
    /// On error the unit is not registered and its routes are withdrawn.
    pub fn add_http_module<M: HttpModule>(&mut self, unit: Arc<M>, extras: RouteExtras) -> anyhow::Result<()> {
        let authority = self.registry.authority.clone().ok_or_else(|| {
            RegistrationError::NoRoutingAuthority {
                module: self.descriptor.identity.clone(),
            }
        })?;
        let subscriptions = self.prepare(&unit)?;

        let mut forwarded: Vec<(String, Handler)> = Vec::new();
        for route in Arc::clone(&unit).routes() {
            let name = format!("{}.{}", unit.name(), route.name);
            if let Err(e) = authority.on_add_http_routes(&name, route.handler.clone(), &route.routes, &extras) {
                for (name, handler) in &forwarded {
                    authority.on_remove_http_routes(name, handler, &extras);
                }
                return Err(e);
            }
            forwarded.push((name, route.handler));
        }

        self.commit(unit, subscriptions)?;
        Ok(())
    }

    /// Register a pre-handler, before the one named `before` if present.
    pub fn add_prehandler_module<M: PreHandlerModule>(
        &mut self,
        unit: Arc<M>,
        before: Option<&str>,
    ) -> Result<(), RegistrationError> {
        let entry = PreHandlerEntry {
            name: unit.name().to_string(),
            unit: unit.clone(),
        };
        let position = before.and_then(|b| self.registry.pre_handlers.iter().position(|p| p.name == b));
        self.add_module(unit)?;
        match position {
            Some(index) => self.registry.pre_handlers.insert(index, entry),
            None => self.registry.pre_handlers.push(entry),
        }
        Ok(())
    }

    /// Claim the routing authority role. Only one unit may ever hold it.
    pub fn set_routing_authority<M: RoutingAuthority>(&mut self, unit: Arc<M>) -> Result<(), RegistrationError> {
        if let Some(existing) = self.registry.routing_authority_name() {
            return Err(RegistrationError::DuplicateRoutingAuthority {
                existing: existing.to_string(),
            });
        }
        self.add_module(unit.clone())?;
        self.registry.authority = Some(unit);
        Ok(())
    }

    /// First loaded unit of type `M`.
    pub fn get_module<M: BaseModule>(&self) -> Option<Arc<M>> {
        self.registry.modules.iter().find_map(LoadedModule::downcast::<M>)
    }

    pub fn config(&self) -> &RuntimeConfig {
        self.config
    }

    pub fn descriptor(&self) -> &ModuleDescriptor {
        self.descriptor
    }

    pub fn tasks(&self) -> &TaskSet {
        self.tasks
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct Plain;
    impl BaseModule for Plain {}

    struct Named(&'static str);
    impl BaseModule for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[async_trait]
    impl PreHandlerModule for Named {
        async fn handle_request(&self, _request: &mut Request) -> Result<Option<Response>, HandlerError> {
            Ok(None)
        }
    }

    struct Listener;
    impl BaseModule for Listener {
        fn events(self: Arc<Self>) -> Vec<EventSubscription> {
            vec![EventSubscription::new("disconnect", "on_disconnect", |_| async { Ok(()) })]
        }
    }

    struct Routes;
    impl BaseModule for Routes {}
    impl HttpModule for Routes {
        fn routes(self: Arc<Self>) -> Vec<HttpRoute> {
            vec![HttpRoute::new(
                "index",
                modhost_sdk::handler(|_req| async { Ok(Response::text(200, "hi")) }),
                vec![RouteSpec::get("/")],
            )]
        }
    }

    fn descriptor() -> ModuleDescriptor {
        ModuleDescriptor {
            identity: "test".into(),
            path: PathBuf::from("test"),
            dependencies: Default::default(),
            load_subdirectories: Vec::new(),
            settings: serde_json::Value::Null,
        }
    }

    fn with_registrar<R>(registry: &mut Registry, f: impl FnOnce(&mut Registrar<'_>) -> R) -> R {
        let descriptor = descriptor();
        let config = RuntimeConfig::default();
        let tasks = TaskSet::new();
        let mut registrar = Registrar::new(registry, &descriptor, &config, &tasks, RuntimeHandle::detached());
        f(&mut registrar)
    }

    #[test]
    fn test_default_name_is_short_type_name() {
        assert_eq!(Plain.name(), "Plain");
        assert_eq!(short_type_name("a::b::Thing<c::D>"), "Thing");
    }

    #[test]
    fn test_get_module_downcasts() {
        let mut registry = Registry::default();
        with_registrar(&mut registry, |r| {
            r.add_module(Arc::new(Plain)).unwrap();
            assert!(r.get_module::<Plain>().is_some());
            assert!(r.get_module::<Listener>().is_none());
        });
        assert_eq!(registry.modules[0].identity, "test");
    }

    #[test]
    fn test_prehandler_insert_before() {
        let mut registry = Registry::default();
        with_registrar(&mut registry, |r| {
            r.add_prehandler_module(Arc::new(Named("auth")), None).unwrap();
            r.add_prehandler_module(Arc::new(Named("cors")), Some("auth")).unwrap();
            r.add_prehandler_module(Arc::new(Named("tail")), Some("missing")).unwrap();
        });
        let names: Vec<&str> = registry.pre_handlers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["cors", "auth", "tail"]);
    }

    #[test]
    fn test_routes_need_an_authority() {
        let mut registry = Registry::default();
        let err = with_registrar(&mut registry, |r| {
            r.add_http_module(Arc::new(Routes), RouteExtras::default()).unwrap_err()
        });
        assert_eq!(
            err.downcast_ref::<RegistrationError>(),
            Some(&RegistrationError::NoRoutingAuthority { module: "test".into() })
        );
        assert!(registry.modules.is_empty());
    }

    #[test]
    fn test_same_type_under_two_identities() {
        let mut registry = Registry::default();
        with_registrar(&mut registry, |r| r.add_module(Arc::new(Listener)).unwrap());

        let sites = ModuleDescriptor {
            identity: "sites".into(),
            ..descriptor()
        };
        let config = RuntimeConfig::default();
        let tasks = TaskSet::new();
        let mut registrar = Registrar::new(&mut registry, &sites, &config, &tasks, RuntimeHandle::detached());
        registrar.add_module(Arc::new(Listener)).unwrap();
        registrar.add_module(Arc::new(Listener)).unwrap();

        assert_eq!(registry.events.subscriber_count("disconnect"), 3);
        assert_eq!(registry.modules.len(), 3);
    }

    #[test]
    fn test_duplicate_event_subscription() {
        let mut registry = Registry::default();
        let unit = Arc::new(Listener);
        with_registrar(&mut registry, |r| {
            r.add_module(unit.clone()).unwrap();
            let err = r.add_module(unit.clone()).unwrap_err();
            assert!(matches!(err, RegistrationError::DuplicateEventSubscription { .. }));
        });
        assert_eq!(registry.events.subscriber_count("disconnect"), 1);
        assert_eq!(registry.modules.len(), 1);
    }

    struct Echoes;
    impl BaseModule for Echoes {
        fn events(self: Arc<Self>) -> Vec<EventSubscription> {
            vec![
                EventSubscription::new("reload", "on_reload", |_| async { Ok(()) }),
                EventSubscription::new("disconnect", "on_event", |_| async { Ok(()) }),
                EventSubscription::new("disconnect", "on_event", |_| async { Ok(()) }),
            ]
        }
    }

    impl HttpModule for Echoes {
        fn routes(self: Arc<Self>) -> Vec<HttpRoute> {
            vec![HttpRoute::new(
                "index",
                modhost_sdk::handler(|_req| async { Ok(Response::text(200, "echo")) }),
                vec![RouteSpec::get("/echo")],
            )]
        }
    }

    /// Records forwarded routes and fails on the pattern `/fail`.
    #[derive(Default)]
    struct Recording {
        routes: std::sync::Mutex<Vec<(String, Handler)>>,
    }

    impl BaseModule for Recording {}

    #[async_trait]
    impl RoutingAuthority for Recording {
        fn on_add_http_routes(&self, name: &str, handler: Handler, routes: &[RouteSpec], _: &RouteExtras) -> anyhow::Result<()> {
            if routes.iter().any(|r| r.path == "/fail") {
                anyhow::bail!("cannot route {}", name);
            }
            self.routes.lock().unwrap().push((name.to_string(), handler));
            Ok(())
        }

        fn on_remove_http_routes(&self, _name: &str, handler: &Handler, _: &RouteExtras) {
            self.routes.lock().unwrap().retain(|(_, h)| !Arc::ptr_eq(h, handler));
        }

        fn get_sitehost(&self, _request: &Request) -> Option<SiteHost> {
            None
        }

        async fn handle_request(&self, _request: &Request) -> Result<Response, HandlerError> {
            Ok(Response::no_content())
        }

        async fn create_exception_response(&self, _request: &Request, error: &HttpError) -> Response {
            Response::text(error.status, error.message.clone())
        }
    }

    struct HalfBroken;
    impl BaseModule for HalfBroken {}
    impl HttpModule for HalfBroken {
        fn routes(self: Arc<Self>) -> Vec<HttpRoute> {
            let ok = modhost_sdk::handler(|_req| async { Ok(Response::no_content()) });
            vec![
                HttpRoute::new("good", ok.clone(), vec![RouteSpec::get("/good")]),
                HttpRoute::new("bad", ok, vec![RouteSpec::get("/fail")]),
            ]
        }
    }

    #[test]
    fn test_failed_unit_leaves_nothing_behind() {
        let mut registry = Registry::default();
        let authority = Arc::new(Recording::default());
        with_registrar(&mut registry, |r| {
            r.set_routing_authority(authority.clone()).unwrap();

            let err = r.add_http_module(Arc::new(Echoes), RouteExtras::default()).unwrap_err();
            assert!(matches!(
                err.downcast_ref::<RegistrationError>(),
                Some(RegistrationError::DuplicateEventSubscription { .. })
            ));
            assert!(r.get_module::<Echoes>().is_none());

            assert!(r.add_http_module(Arc::new(HalfBroken), RouteExtras::default()).is_err());
            assert!(r.get_module::<HalfBroken>().is_none());
        });

        assert!(authority.routes.lock().unwrap().is_empty());
        assert_eq!(registry.events.subscriber_count("reload"), 0);
        assert_eq!(registry.events.subscriber_count("disconnect"), 0);
        assert_eq!(registry.modules.len(), 1);
    }
}
