//! Routing authority: virtual hosts, URL routing and error rendering
//!
//! Every virtual host owns an independent [`UrlRouter`]. Routes registered
//! without a target host go to the main site, built from the configured
//! domains. Errors under the API prefix render as compact JSON, everything
//! else as an HTML page.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use modhost_sdk::{handler, Handler, HandlerError, HttpError, Request, Response, RouteSpec, SiteHost};
use serde_json::{Map, Value};

use crate::routing::{RouteMatch, UrlRouter};
use crate::runtime::{
    BaseModule, HttpModule, HttpRoute, ModuleEntry, PreHandlerModule, Registrar, RouteExtras,
    RoutingAuthority,
};

const DEFAULT_ERROR_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>{code} {message}</title>
</head>
<body>
  <h1>{code} {message}</h1>
  <p>{explain}</p>
</body>
</html>
"#;

/// Whether `path` is `prefix` itself or lies below it.
pub fn is_api_path(prefix: &str, path: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    path == prefix || path.strip_prefix(prefix).is_some_and(|rest| rest.starts_with('/'))
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

pub struct VirtualHostAuthority {
    main_site: SiteHost,
    api_prefix: String,
    error_page: String,
    routers: DashMap<SiteHost, UrlRouter>,
}

impl VirtualHostAuthority {
    pub fn new(main_domains: &[String], api_prefix: impl Into<String>) -> Self {
        let main_site = SiteHost::new(main_domains);
        let routers = DashMap::new();
        routers.insert(main_site.clone(), UrlRouter::new());
        Self {
            main_site,
            api_prefix: api_prefix.into(),
            error_page: DEFAULT_ERROR_PAGE.to_string(),
            routers,
        }
    }

    /// Use `template` for non-API error pages.
    pub fn with_error_page(mut self, template: impl Into<String>) -> Self {
        self.error_page = template.into();
        self
    }

    pub fn main_site(&self) -> &SiteHost {
        &self.main_site
    }

    /// Known virtual hosts, in no particular order.
    pub fn sites(&self) -> Vec<SiteHost> {
        self.routers.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn route_count(&self, site: &SiteHost) -> usize {
        self.routers.get(site).map(|r| r.len()).unwrap_or(0)
    }

    fn render_page(&self, error: &HttpError) -> String {
        self.error_page
            .replace("{code}", &error.status.to_string())
            .replace("{message}", &escape_html(&error.message))
            .replace("{explain}", &escape_html(&error.explain))
    }
}

impl BaseModule for VirtualHostAuthority {}

#[async_trait]
impl RoutingAuthority for VirtualHostAuthority {
    fn on_add_http_routes(
        &self,
        name: &str,
        handler: Handler,
        routes: &[RouteSpec],
        extras: &RouteExtras,
    ) -> anyhow::Result<()> {
        let site = extras.site_host.clone().unwrap_or_else(|| self.main_site.clone());
        let mut router = self.routers.entry(site.clone()).or_default();
        for spec in routes {
            if let Err(e) = router.add(name, handler.clone(), spec) {
                router.remove(&handler);
                return Err(e).with_context(|| format!("cannot add route {} to site {}", name, site));
            }
        }
        Ok(())
    }

    fn on_remove_http_routes(&self, name: &str, handler: &Handler, extras: &RouteExtras) {
        let site = extras.site_host.as_ref().unwrap_or(&self.main_site);
        if let Some(mut router) = self.routers.get_mut(site) {
            let removed = router.remove(handler);
            tracing::debug!(route = %name, site = %site, removed, "Routes withdrawn");
        }
    }

    fn get_sitehost(&self, request: &Request) -> Option<SiteHost> {
        let host = request.host_without_port()?;
        self.routers
            .iter()
            .find(|entry| entry.key().has_host(host))
            .map(|entry| entry.key().clone())
    }

    async fn handle_request(&self, request: &Request) -> Result<Response, HandlerError> {
        let site = request.site_host.as_ref().ok_or_else(HttpError::not_found)?;

        // The router guard must not live across the handler await
        let resolved = match self.routers.get(site) {
            Some(router) => router.resolve(&request.method, &request.path),
            None => RouteMatch::NotFound,
        };

        match resolved {
            RouteMatch::Found { name, handler, params } => {
                tracing::debug!(
                    request_id = %request.request_id,
                    route = %name,
                    site = %site,
                    "Dispatching to route"
                );
                let mut request = request.clone();
                request.params = params;
                handler(request).await
            }
            RouteMatch::MethodNotAllowed { allowed } => {
                Err(HttpError::new(405).with_header("Allow", allowed.join(", ")).into())
            }
            RouteMatch::NotFound => Err(HttpError::not_found().into()),
        }
    }

    async fn create_exception_response(&self, request: &Request, error: &HttpError) -> Response {
        let mut response = if is_api_path(&self.api_prefix, &request.path) {
            let mut data = Map::new();
            data.insert("code".into(), Value::from(error.status));
            data.insert("message".into(), Value::from(error.message.clone()));
            data.insert("explain".into(), Value::from(error.explain.clone()));
            data.extend(error.properties.clone());
            Response::json(error.status, Value::Object(data))
        } else {
            Response::html(error.status, self.render_page(error))
        };

        if let Some(headers) = &error.headers {
            for (key, value) in headers {
                if !key.eq_ignore_ascii_case("content-type") {
                    response.set_header(key.clone(), value.clone());
                }
            }
        }
        response
    }
}

/// Adds a permissive CORS origin to every response (dev mode)
pub struct CorsHeaders;

impl BaseModule for CorsHeaders {}

#[async_trait]
impl PreHandlerModule for CorsHeaders {
    async fn handle_request(&self, _request: &mut Request) -> Result<Option<Response>, HandlerError> {
        Ok(None)
    }

    async fn handle_response(&self, _request: &Request, response: &mut Response) -> anyhow::Result<()> {
        response.set_header("Access-Control-Allow-Origin", "*");
        Ok(())
    }
}

/// Answers CORS preflight requests under the API prefix (dev mode)
pub struct CorsPreflight {
    api_prefix: String,
}

impl BaseModule for CorsPreflight {}

impl HttpModule for CorsPreflight {
    fn routes(self: Arc<Self>) -> Vec<HttpRoute> {
        let path = format!("{}/{{t:.*}}", self.api_prefix.trim_end_matches('/'));
        vec![HttpRoute::new(
            "options_all",
            handler(|_req: Request| async {
                Ok(Response::no_content()
                    .with_header("Access-Control-Allow-Methods", "*")
                    .with_header("Access-Control-Allow-Headers", "*"))
            }),
            vec![RouteSpec::new(["OPTIONS"], path)],
        )]
    }
}

/// Setup entry of the `special_handler` module
pub struct SpecialHandler;

#[async_trait]
impl ModuleEntry for SpecialHandler {
    async fn setup(&self, registrar: &mut Registrar<'_>) -> anyhow::Result<()> {
        let config = registrar.config().clone();
        let mut authority = VirtualHostAuthority::new(&config.main_domains, config.api_prefix.clone());
        if let Some(path) = &config.error_template {
            let template = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("cannot read error template {}", path.display()))?;
            authority = authority.with_error_page(template);
        }
        registrar.set_routing_authority(Arc::new(authority))?;

        if config.dev {
            registrar.add_prehandler_module(Arc::new(CorsHeaders), None)?;
            registrar.add_http_module(
                Arc::new(CorsPreflight {
                    api_prefix: config.api_prefix,
                }),
                RouteExtras::default(),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authority() -> VirtualHostAuthority {
        let authority = VirtualHostAuthority::new(&["Example.com".to_string(), "www.example.com".to_string()], "/api");
        authority
            .on_add_http_routes(
                "Items.get_item",
                handler(|req: Request| async move {
                    let id = req.path_param("id").cloned().unwrap_or_default();
                    Ok(Response::ok(json!({ "id": id })))
                }),
                &[RouteSpec::get("/api/items/{id}")],
                &RouteExtras::default(),
            )
            .unwrap();
        authority
            .on_add_http_routes(
                "Blog.index",
                handler(|_req: Request| async { Ok(Response::text(200, "blog")) }),
                &[RouteSpec::get("/")],
                &RouteExtras::for_site(SiteHost::new(["blog.example.com"])),
            )
            .unwrap();
        authority
    }

    fn request(method: &str, host: &str, path: &str) -> Request {
        Request::new(method, path).with_header("Host", host)
    }

    async fn dispatch(authority: &VirtualHostAuthority, mut req: Request) -> Result<Response, HandlerError> {
        req.site_host = authority.get_sitehost(&req);
        authority.handle_request(&req).await
    }

    #[test]
    fn test_is_api_path() {
        assert!(is_api_path("/api", "/api"));
        assert!(is_api_path("/api/", "/api/users"));
        assert!(!is_api_path("/api", "/apiary"));
        assert!(!is_api_path("/api", "/"));
    }

    #[test]
    fn test_sitehost_lookup_ignores_case_and_port() {
        let authority = authority();
        let req = request("GET", "WWW.Example.COM:8443", "/");
        assert_eq!(authority.get_sitehost(&req).as_ref(), Some(authority.main_site()));

        let req = request("GET", "blog.example.com", "/");
        assert_eq!(authority.get_sitehost(&req), Some(SiteHost::new(["blog.example.com"])));

        assert!(authority.get_sitehost(&request("GET", "other.org", "/")).is_none());
        assert!(authority.get_sitehost(&Request::new("GET", "/")).is_none());
    }

    #[tokio::test]
    async fn test_routes_are_per_site() {
        let authority = authority();

        let resp = dispatch(&authority, request("GET", "example.com", "/api/items/7")).await.unwrap();
        assert_eq!(resp.body.as_deref(), Some(r#"{"id":"7"}"#));

        let resp = dispatch(&authority, request("GET", "blog.example.com", "/")).await.unwrap();
        assert_eq!(resp.body.as_deref(), Some("blog"));

        let err = dispatch(&authority, request("GET", "blog.example.com", "/api/items/7")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_unmatched_host_is_not_found() {
        let authority = authority();
        let err = dispatch(&authority, request("GET", "unknown.org", "/api/items/1")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_method_not_allowed_carries_allow() {
        let authority = authority();
        let err = dispatch(&authority, request("DELETE", "example.com", "/api/items/1")).await.unwrap_err();
        match err {
            HandlerError::Http(e) => {
                assert_eq!(e.status, 405);
                assert_eq!(e.headers.unwrap()["Allow"], "GET, HEAD");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_api_errors_render_as_json() {
        let authority = authority();
        let error = HttpError::only_explain(422, "name is required")
            .add_property("field", "name")
            .with_header("Content-Type", "text/plain")
            .with_header("Retry-After", "5");
        let resp = authority
            .create_exception_response(&Request::new("POST", "/api/users"), &error)
            .await;

        assert_eq!(resp.status, 422);
        assert_eq!(resp.header("content-type").unwrap(), "application/json");
        assert_eq!(resp.header("retry-after").unwrap(), "5");
        let body: Value = serde_json::from_str(resp.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["code"], 422);
        assert_eq!(body["explain"], "name is required");
        assert_eq!(body["field"], "name");
    }

    #[tokio::test]
    async fn test_page_errors_render_template_escaped() {
        let authority = authority().with_error_page("<p>{code}|{message}|{explain}</p>");
        let error = HttpError::new(404).with_explain("<script>");
        let resp = authority
            .create_exception_response(&Request::new("GET", "/missing"), &error)
            .await;

        assert_eq!(resp.status, 404);
        assert!(resp.header("content-type").unwrap().starts_with("text/html"));
        assert_eq!(resp.body.as_deref(), Some("<p>404|Not Found|&lt;script&gt;</p>"));
    }

    #[test]
    fn test_bad_pattern_is_rejected() {
        let authority = authority();
        let err = authority
            .on_add_http_routes(
                "Bad.route",
                handler(|_req: Request| async { Ok(Response::no_content()) }),
                &[RouteSpec::get("/x/{broken")],
                &RouteExtras::default(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Bad.route"));
    }

    #[tokio::test]
    async fn test_failed_route_set_is_not_half_added() {
        let authority = authority();
        let main = authority.main_site().clone();
        let before = authority.route_count(&main);
        authority
            .on_add_http_routes(
                "Half.route",
                handler(|_req: Request| async { Ok(Response::no_content()) }),
                &[RouteSpec::get("/api/half"), RouteSpec::get("/x/{broken")],
                &RouteExtras::default(),
            )
            .unwrap_err();
        assert_eq!(authority.route_count(&main), before);

        let err = dispatch(&authority, request("GET", "example.com", "/api/half")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_withdrawn_routes_stop_matching() {
        let authority = authority();
        let withdrawn = handler(|_req: Request| async { Ok(Response::text(200, "gone soon")) });
        let extras = RouteExtras::for_site(SiteHost::new(["blog.example.com"]));
        authority
            .on_add_http_routes("Blog.feed", withdrawn.clone(), &[RouteSpec::get("/feed")], &extras)
            .unwrap();
        authority.on_remove_http_routes("Blog.feed", &withdrawn, &extras);

        let err = dispatch(&authority, request("GET", "blog.example.com", "/feed")).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
        let resp = dispatch(&authority, request("GET", "blog.example.com", "/")).await.unwrap();
        assert_eq!(resp.body.as_deref(), Some("blog"));
    }
}
