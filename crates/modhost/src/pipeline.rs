//! Request dispatch pipeline
//!
//! For every request:
//! 1. wait until the runtime serves, then enter the drain gate
//! 2. resolve the virtual host through the routing authority
//! 3. run the pre-handlers in order until one answers, else route the request
//! 4. render failures through the routing authority
//! 5. run the response hooks of every invoked pre-handler, newest first

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use modhost_sdk::{HandlerError, HttpError, Request, Response};

use crate::runtime::module::Registry;
use crate::runtime::{DrainGuard, LifecycleState, ModuleRuntime, RoutingAuthority};

fn unavailable() -> Response {
    Response::text(503, "Service Unavailable").with_header("Retry-After", "5")
}

impl ModuleRuntime {
    /// Wait for a serving state and take a drain guard.
    ///
    /// `None` when the runtime is degraded or gone.
    async fn admit(&self) -> Option<DrainGuard> {
        let mut state_rx = self.watch_state();
        loop {
            let state = *state_rx.borrow_and_update();
            if state == LifecycleState::Degraded {
                return None;
            }
            if state.is_serving() {
                let guard = self.drain().enter();
                // A reload may have started between the check and the enter
                if self.state().is_serving() {
                    return Some(guard);
                }
                drop(guard);
                continue;
            }
            if state_rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Answer one request through the installed modules.
    pub async fn serve(&self, mut request: Request) -> Response {
        let Some(_guard) = self.admit().await else {
            return unavailable();
        };

        let registry = self.registry().await;
        let Some(authority) = registry.authority.clone() else {
            return unavailable();
        };
        request.site_host = authority.get_sitehost(&request);

        let mut invoked = Vec::new();
        let outcome = AssertUnwindSafe(dispatch_chain(&registry, authority.as_ref(), &mut request, &mut invoked))
            .catch_unwind()
            .await;

        let mut response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(HandlerError::Http(error))) => render(authority.as_ref(), &request, &error).await,
            Ok(Err(HandlerError::Transport(response))) if response.status < 400 => response,
            Ok(Err(HandlerError::Transport(response))) => {
                let error = HttpError::from_response(response);
                render(authority.as_ref(), &request, &error).await
            }
            Ok(Err(HandlerError::Other(e))) => {
                tracing::error!(request_id = %request.request_id, path = %request.path, "Unhandled request failure: {}", e);
                render(authority.as_ref(), &request, &HttpError::internal()).await
            }
            Err(_) => {
                tracing::error!(request_id = %request.request_id, path = %request.path, "Request handling panicked");
                render(authority.as_ref(), &request, &HttpError::internal()).await
            }
        };

        for index in invoked.into_iter().rev() {
            let pre = &registry.pre_handlers[index];
            let hook = AssertUnwindSafe(pre.unit.handle_response(&request, &mut response))
                .catch_unwind()
                .await;
            match hook {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(pre_handler = %pre.name, request_id = %request.request_id, "Response hook failed: {:#}", e);
                }
                Err(_) => {
                    tracing::warn!(pre_handler = %pre.name, request_id = %request.request_id, "Response hook panicked");
                }
            }
        }
        response
    }
}

/// Pre-handlers then routing. Indices of invoked pre-handlers land in `invoked`.
async fn dispatch_chain(
    registry: &Registry,
    authority: &dyn RoutingAuthority,
    request: &mut Request,
    invoked: &mut Vec<usize>,
) -> Result<Response, HandlerError> {
    for (index, pre) in registry.pre_handlers.iter().enumerate() {
        invoked.push(index);
        if let Some(response) = pre.unit.handle_request(request).await? {
            tracing::debug!(pre_handler = %pre.name, request_id = %request.request_id, "Request answered by pre-handler");
            return Ok(response);
        }
    }
    authority.handle_request(request).await
}

/// Render `error`, falling back to a bare 500 if the authority panics.
async fn render(authority: &dyn RoutingAuthority, request: &Request, error: &HttpError) -> Response {
    match AssertUnwindSafe(authority.create_exception_response(request, error))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(request_id = %request.request_id, status = error.status, "Error rendering panicked");
            Response::text(500, "Internal Server Error")
        }
    }
}
