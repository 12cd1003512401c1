//! URL router used per virtual host
//!
//! Patterns are matched segment by segment: static segments must be equal and
//! `{param}` captures one segment. A pattern containing `{name:regex}` is
//! compiled into a single anchored regex instead, so the regex may span
//! segments (`/static/{tail:.*}`).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use modhost_sdk::{Handler, RouteSpec};
use regex_lite::Regex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    #[error("invalid route pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Param(String),
}

#[derive(Debug, Clone)]
enum Matcher {
    Segments(Vec<Segment>),
    Regex { regex: Regex, names: Vec<String> },
}

fn invalid(pattern: &str, reason: impl Into<String>) -> RouteError {
    RouteError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.into(),
    }
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Split a pattern into literal text and `{...}` placeholders, honouring
/// nested braces inside regexes such as `{id:\d{4}}`.
fn tokenize(pattern: &str) -> Result<Vec<(bool, String)>, RouteError> {
    let mut tokens = Vec::new();
    let mut literal = String::new();
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        if c == '}' {
            return Err(invalid(pattern, "unbalanced '}'"));
        }
        if c != '{' {
            literal.push(c);
            continue;
        }
        if !literal.is_empty() {
            tokens.push((false, std::mem::take(&mut literal)));
        }
        let mut depth = 1;
        let mut placeholder = String::new();
        for c in chars.by_ref() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            placeholder.push(c);
        }
        if depth != 0 {
            return Err(invalid(pattern, "unclosed '{'"));
        }
        tokens.push((true, placeholder));
    }
    if !literal.is_empty() {
        tokens.push((false, literal));
    }
    Ok(tokens)
}

impl Matcher {
    fn compile(pattern: &str) -> Result<Self, RouteError> {
        if !pattern.starts_with('/') {
            return Err(invalid(pattern, "must start with '/'"));
        }
        let tokens = tokenize(pattern)?;

        if !tokens.iter().any(|(is_var, text)| *is_var && text.contains(':')) {
            let mut segments = Vec::new();
            for part in pattern.split('/') {
                if part.starts_with('{') && part.ends_with('}') {
                    let name = &part[1..part.len() - 1];
                    if !valid_name(name) {
                        return Err(invalid(pattern, format!("bad parameter name {:?}", name)));
                    }
                    segments.push(Segment::Param(name.to_string()));
                } else if part.contains('{') || part.contains('}') {
                    return Err(invalid(pattern, "a parameter must span a whole segment"));
                } else {
                    segments.push(Segment::Static(part.to_string()));
                }
            }
            return Ok(Matcher::Segments(segments));
        }

        let mut source = String::from("^");
        let mut names = Vec::new();
        for (is_var, text) in tokens {
            if !is_var {
                source.push_str(&regex_lite::escape(&text));
                continue;
            }
            let (name, re) = match text.split_once(':') {
                Some((name, re)) => (name, re.to_string()),
                None => (text.as_str(), "[^{}/]+".to_string()),
            };
            if !valid_name(name) {
                return Err(invalid(pattern, format!("bad parameter name {:?}", name)));
            }
            source.push_str(&format!("(?P<{}>{})", name, re));
            names.push(name.to_string());
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|e| invalid(pattern, e.to_string()))?;
        Ok(Matcher::Regex { regex, names })
    }

    /// Extracted path parameters if `path` matches.
    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        match self {
            Matcher::Segments(segments) => {
                let path_parts: Vec<&str> = path.split('/').collect();
                if segments.len() != path_parts.len() {
                    return None;
                }

                let mut params = HashMap::new();
                for (segment, path_part) in segments.iter().zip(path_parts.iter()) {
                    match segment {
                        Segment::Param(name) => {
                            if path_part.is_empty() {
                                return None;
                            }
                            params.insert(name.clone(), path_part.to_string());
                        }
                        Segment::Static(s) if s == path_part => {}
                        Segment::Static(_) => return None,
                    }
                }
                Some(params)
            }
            Matcher::Regex { regex, names } => {
                let captures = regex.captures(path)?;
                Some(
                    names
                        .iter()
                        .filter_map(|name| {
                            captures
                                .name(name)
                                .map(|m| (name.clone(), m.as_str().to_string()))
                        })
                        .collect(),
                )
            }
        }
    }
}

struct RouteEntry {
    name: String,
    methods: Vec<String>,
    pattern: String,
    matcher: Matcher,
    handler: Handler,
}

impl RouteEntry {
    fn accepts(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == "*" || m == method)
    }
}

/// Outcome of resolving a request against a router
pub enum RouteMatch {
    Found {
        name: String,
        handler: Handler,
        params: HashMap<String, String>,
    },
    /// The path exists but not for this method
    MethodNotAllowed { allowed: Vec<String> },
    NotFound,
}

/// Ordered set of routes; the first registered match wins
#[derive(Default)]
pub struct UrlRouter {
    routes: Vec<RouteEntry>,
}

impl UrlRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every method of `spec`.
    pub fn add(&mut self, name: &str, handler: Handler, spec: &RouteSpec) -> Result<(), RouteError> {
        let matcher = Matcher::compile(&spec.path)?;
        if spec.methods.is_empty() {
            return Err(invalid(&spec.path, "no methods"));
        }
        tracing::debug!(route = %name, methods = ?spec.methods, path = %spec.path, "Route added");
        self.routes.push(RouteEntry {
            name: name.to_string(),
            methods: spec.methods.iter().map(|m| m.to_ascii_uppercase()).collect(),
            pattern: spec.path.clone(),
            matcher,
            handler,
        });
        Ok(())
    }

    /// Drop every route registered with this exact `handler`. Returns how many went.
    pub fn remove(&mut self, handler: &Handler) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| !Arc::ptr_eq(&r.handler, handler));
        before - self.routes.len()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered `(methods, pattern)` pairs, in registration order.
    pub fn patterns(&self) -> Vec<(Vec<String>, String)> {
        self.routes
            .iter()
            .map(|r| (r.methods.clone(), r.pattern.clone()))
            .collect()
    }

    /// Find the handler for `method` and `path`. `HEAD` falls back to `GET`.
    pub fn resolve(&self, method: &str, path: &str) -> RouteMatch {
        let method = method.to_ascii_uppercase();
        let mut allowed = BTreeSet::new();
        let mut head_fallback = None;

        for route in &self.routes {
            let Some(params) = route.matcher.matches(path) else {
                continue;
            };
            if route.accepts(&method) {
                return RouteMatch::Found {
                    name: route.name.clone(),
                    handler: route.handler.clone(),
                    params,
                };
            }
            if method == "HEAD" && head_fallback.is_none() && route.accepts("GET") {
                head_fallback = Some((route, params));
            }
            allowed.extend(route.methods.iter().cloned());
        }

        if let Some((route, params)) = head_fallback {
            return RouteMatch::Found {
                name: route.name.clone(),
                handler: route.handler.clone(),
                params,
            };
        }
        if allowed.is_empty() {
            return RouteMatch::NotFound;
        }
        if allowed.contains("GET") {
            allowed.insert("HEAD".to_string());
        }
        RouteMatch::MethodNotAllowed {
            allowed: allowed.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modhost_sdk::{handler, Request, Response};

    fn echo(label: &'static str) -> Handler {
        handler(move |_req: Request| async move { Ok(Response::text(200, label)) })
    }

    fn found(m: RouteMatch) -> (String, HashMap<String, String>) {
        match m {
            RouteMatch::Found { name, params, .. } => (name, params),
            RouteMatch::MethodNotAllowed { allowed } => panic!("405, allowed {:?}", allowed),
            RouteMatch::NotFound => panic!("404"),
        }
    }

    #[test]
    fn test_segment_params() {
        let mut router = UrlRouter::new();
        router.add("pet", echo("pet"), &RouteSpec::get("/pet/{petId}")).unwrap();

        let (name, params) = found(router.resolve("GET", "/pet/42"));
        assert_eq!(name, "pet");
        assert_eq!(params["petId"], "42");

        assert!(matches!(router.resolve("GET", "/pet/42/extra"), RouteMatch::NotFound));
        assert!(matches!(router.resolve("GET", "/pet/"), RouteMatch::NotFound));
    }

    #[test]
    fn test_regex_tail() {
        let mut router = UrlRouter::new();
        router.add("files", echo("files"), &RouteSpec::get("/static/{tail:.*}")).unwrap();
        router.add("year", echo("year"), &RouteSpec::get(r"/archive/{year:\d{4}}")).unwrap();

        let (_, params) = found(router.resolve("GET", "/static/css/site.css"));
        assert_eq!(params["tail"], "css/site.css");

        let (_, params) = found(router.resolve("GET", "/archive/2024"));
        assert_eq!(params["year"], "2024");
        assert!(matches!(router.resolve("GET", "/archive/24"), RouteMatch::NotFound));
    }

    #[test]
    fn test_method_handling() {
        let mut router = UrlRouter::new();
        router.add("read", echo("read"), &RouteSpec::get("/items")).unwrap();
        router.add("create", echo("create"), &RouteSpec::post("/items")).unwrap();
        router.add("all", echo("all"), &RouteSpec::any("/anything")).unwrap();

        assert_eq!(found(router.resolve("post", "/items")).0, "create");
        assert_eq!(found(router.resolve("HEAD", "/items")).0, "read");
        assert_eq!(found(router.resolve("PATCH", "/anything")).0, "all");

        match router.resolve("DELETE", "/items") {
            RouteMatch::MethodNotAllowed { allowed } => {
                assert_eq!(allowed, vec!["GET", "HEAD", "POST"]);
            }
            _ => panic!("expected 405"),
        }
    }

    #[test]
    fn test_first_registration_wins() {
        let mut router = UrlRouter::new();
        router.add("specific", echo("specific"), &RouteSpec::get("/users/me")).unwrap();
        router.add("generic", echo("generic"), &RouteSpec::get("/users/{id}")).unwrap();
        assert_eq!(found(router.resolve("GET", "/users/me")).0, "specific");
        assert_eq!(found(router.resolve("GET", "/users/7")).0, "generic");
    }

    #[test]
    fn test_remove_by_handler() {
        let mut router = UrlRouter::new();
        let shared = echo("shared");
        router.add("a", shared.clone(), &RouteSpec::get("/a")).unwrap();
        router.add("b", shared.clone(), &RouteSpec::post("/b")).unwrap();
        router.add("a", echo("other"), &RouteSpec::get("/c")).unwrap();

        assert_eq!(router.remove(&shared), 2);
        assert_eq!(router.patterns(), vec![(vec!["GET".to_string()], "/c".to_string())]);
        assert!(matches!(router.resolve("GET", "/a"), RouteMatch::NotFound));
    }

    #[test]
    fn test_invalid_patterns() {
        let mut router = UrlRouter::new();
        assert!(router.add("a", echo("a"), &RouteSpec::get("no-slash")).is_err());
        assert!(router.add("b", echo("b"), &RouteSpec::get("/x/{unclosed")).is_err());
        assert!(router.add("c", echo("c"), &RouteSpec::get("/x/pre{id}")).is_err());
        assert!(router.add("d", echo("d"), &RouteSpec::get("/x/{bad:(}")).is_err());
        assert!(router.is_empty());
    }
}
