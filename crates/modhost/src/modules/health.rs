//! Health module: `GET {api}/health` and a heartbeat log

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use modhost_sdk::{handler, HttpError, Request, Response, RouteSpec};
use serde_json::json;

use crate::runtime::{
    BaseModule, EventSubscription, HttpModule, HttpRoute, ModuleEntry, PeriodicTask, Registrar,
    RouteExtras, RuntimeHandle, DISCONNECT,
};

pub struct HealthModule {
    handle: RuntimeHandle,
    api_prefix: String,
    heartbeat: PeriodicTask,
}

impl HealthModule {
    pub fn new(handle: RuntimeHandle, api_prefix: impl Into<String>, period: Duration) -> Self {
        Self {
            handle,
            api_prefix: api_prefix.into(),
            heartbeat: PeriodicTask::new("health.heartbeat", period),
        }
    }

    pub fn heartbeat(&self) -> &PeriodicTask {
        &self.heartbeat
    }

    fn start_heartbeat(&self) -> anyhow::Result<()> {
        let handle = self.handle.clone();
        self.heartbeat.start(move || {
            let handle = handle.clone();
            async move {
                if let Some(status) = handle.status().await {
                    tracing::debug!(
                        state = %status.state,
                        modules = status.modules.len(),
                        in_flight = status.in_flight,
                        "Heartbeat"
                    );
                }
                Ok(())
            }
        })
    }
}

#[async_trait]
impl BaseModule for HealthModule {
    fn events(self: Arc<Self>) -> Vec<EventSubscription> {
        vec![EventSubscription::new(DISCONNECT, "on_disconnect", |args| async move {
            tracing::info!(reason = %args["reason"], "Health module disconnecting");
            Ok(())
        })]
    }

    async fn on_unload(&self) -> anyhow::Result<()> {
        self.heartbeat.stop_wait().await;
        Ok(())
    }
}

impl HttpModule for HealthModule {
    fn routes(self: Arc<Self>) -> Vec<HttpRoute> {
        let handle = self.handle.clone();
        let path = format!("{}/health", self.api_prefix.trim_end_matches('/'));
        vec![HttpRoute::new(
            "health",
            handler(move |_req: Request| {
                let handle = handle.clone();
                async move {
                    let status = handle
                        .status()
                        .await
                        .ok_or_else(|| HttpError::only_explain(503, "Runtime is shutting down"))?;
                    let mut modules: Vec<&str> = status.modules.iter().map(|m| m.identity.as_str()).collect();
                    modules.dedup();
                    Ok(Response::ok(json!({
                        "status": "ok",
                        "state": status.state,
                        "modules": modules,
                        "in_flight": status.in_flight,
                    })))
                }
            }),
            vec![RouteSpec::get(path)],
        )]
    }
}

/// Setup entry of the `health` module
pub struct Health;

#[async_trait]
impl ModuleEntry for Health {
    async fn setup(&self, registrar: &mut Registrar<'_>) -> anyhow::Result<()> {
        let config = registrar.config();
        let unit = Arc::new(HealthModule::new(
            registrar.handle(),
            config.api_prefix.clone(),
            Duration::from_secs(config.heartbeat_secs.max(1)),
        ));
        registrar.add_http_module(unit.clone(), RouteExtras::default())?;
        unit.start_heartbeat()?;
        Ok(())
    }
}
