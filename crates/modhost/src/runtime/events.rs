//! Priority-tiered lifecycle event broadcast
//!
//! Handlers subscribe to a named event with an integer priority. A dispatch
//! runs tiers in ascending priority order; every handler of a tier runs
//! concurrently and the whole tier is awaited before the next one starts.
//! A failing handler never stops its siblings or later tiers.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use modhost_sdk::BoxFuture;
use serde_json::Value;

use super::error::RegistrationError;

/// Broadcast before every drain wait so modules can close long-lived connections
pub const DISCONNECT: &str = "disconnect";

/// Type-erased event handler
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A module's request to receive an event
#[derive(Clone)]
pub struct EventSubscription {
    pub event: String,
    pub priority: i32,
    /// Name of the callable, used in logs and failure reports
    pub callable: String,
    /// Instance the callable is bound to. Set by the registrar.
    pub owner: usize,
    pub handler: EventHandler,
}

impl EventSubscription {
    /// Subscribe `callable` to `event` at priority 0.
    pub fn new<F, Fut>(event: impl Into<String>, callable: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            event: event.into(),
            priority: 0,
            callable: callable.into(),
            owner: 0,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("callable", &self.callable)
            .field("owner", &self.owner)
            .finish()
    }
}

struct Subscriber {
    callable: String,
    handler: EventHandler,
}

/// One handler failure observed during a dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFailure {
    pub priority: i32,
    pub callable: String,
    pub error: String,
}

/// Outcome of a dispatch
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Handlers invoked, across all tiers
    pub invoked: usize,
    pub failures: Vec<EventFailure>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Table of event name -> priority -> subscribers in insertion order
#[derive(Default)]
pub struct EventDispatcher {
    events: HashMap<String, BTreeMap<i32, Vec<Subscriber>>>,
    registered: HashSet<(String, usize, String)>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription. The same callable may subscribe to an event once.
    pub fn subscribe(&mut self, subscription: EventSubscription) -> Result<(), RegistrationError> {
        self.subscribe_all(vec![subscription])
    }

    /// Reject the batch if any subscription is already registered or repeated within it.
    pub fn check(&self, subscriptions: &[EventSubscription]) -> Result<(), RegistrationError> {
        let mut batch = HashSet::new();
        for sub in subscriptions {
            let key = (sub.event.clone(), sub.owner, sub.callable.clone());
            if self.registered.contains(&key) || !batch.insert(key) {
                return Err(RegistrationError::DuplicateEventSubscription {
                    event: sub.event.clone(),
                    callable: sub.callable.clone(),
                });
            }
        }
        Ok(())
    }

    /// Record every subscription of the batch, or none of them.
    pub fn subscribe_all(&mut self, subscriptions: Vec<EventSubscription>) -> Result<(), RegistrationError> {
        self.check(&subscriptions)?;
        for subscription in subscriptions {
            self.registered.insert((
                subscription.event.clone(),
                subscription.owner,
                subscription.callable.clone(),
            ));
            tracing::debug!(
                event = %subscription.event,
                priority = subscription.priority,
                callable = %subscription.callable,
                "Event subscription registered"
            );
            self.events
                .entry(subscription.event)
                .or_default()
                .entry(subscription.priority)
                .or_default()
                .push(Subscriber {
                    callable: subscription.callable,
                    handler: subscription.handler,
                });
        }
        Ok(())
    }

    /// Number of handlers subscribed to `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.events
            .get(event)
            .map(|tiers| tiers.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.registered.clear();
    }

    /// Invoke every handler subscribed to `event`, tier by tier.
    ///
    /// Unknown events are a no-op.
    pub async fn dispatch(&self, event: &str, args: Value) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(tiers) = self.events.get(event) else {
            return report;
        };

        for (priority, subscribers) in tiers {
            let runs = subscribers.iter().map(|sub| {
                let fut = (sub.handler)(args.clone());
                async move {
                    let outcome = std::panic::AssertUnwindSafe(fut).catch_unwind().await;
                    (sub.callable.as_str(), outcome)
                }
            });

            for (callable, outcome) in join_all(runs).await {
                report.invoked += 1;
                let error = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => format!("{:#}", e),
                    Err(_) => "handler panicked".to_string(),
                };
                tracing::warn!(
                    event = %event,
                    priority = *priority,
                    callable = %callable,
                    "Event handler failed: {}",
                    error
                );
                report.failures.push(EventFailure {
                    priority: *priority,
                    callable: callable.to_string(),
                    error,
                });
            }
        }

        report
    }
}
