//! Verb + path routing for inbound requests.
//!
//! # Responsibilities
//! - Match the request path (exact or prefix, query string ignored)
//! - Match the verb (case-insensitive)
//! - Refuse authenticated-only routes on anonymous connections
//!
//! # Design Decisions
//! - First registered match wins
//! - A path that matches under a different verb yields 405, otherwise 404
//! - Path matching is case-sensitive

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};

use crate::dispatch::{DispatchError, DispatchResponse, Dispatcher};
use crate::protocol::RequestMessage;
use crate::session::SessionContext;

type Handler = Arc<
    dyn Fn(Arc<SessionContext>, RequestMessage) -> BoxFuture<'static, Result<DispatchResponse, DispatchError>>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathMatcher {
    Exact(String),
    Prefix(String),
}

impl PathMatcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            PathMatcher::Exact(expected) => path == expected,
            PathMatcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

struct Route {
    verb: String,
    path: PathMatcher,
    authenticated_only: bool,
    handler: Handler,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("verb", &self.verb)
            .field("path", &self.path)
            .field("authenticated_only", &self.authenticated_only)
            .finish()
    }
}

/// Table-driven [`Dispatcher`].
#[derive(Debug, Default)]
pub struct ResourceRouter {
    routes: Vec<Route>,
}

impl ResourceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the keepalive and ping resources.
    pub fn with_builtin_routes(self) -> Self {
        self.route("GET", "/v1/keepalive", |_, _| async { Ok(DispatchResponse::ok()) })
            .route("GET", "/v1/ping", |_, _| async {
                Ok(DispatchResponse::ok().with_body(&b"pong"[..]))
            })
    }

    /// Route an exact path.
    pub fn route<F, Fut>(self, verb: &str, path: &str, handler: F) -> Self
    where
        F: Fn(Arc<SessionContext>, RequestMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchResponse, DispatchError>> + Send + 'static,
    {
        self.push(verb, PathMatcher::Exact(path.to_string()), false, handler)
    }

    /// Route every path under `prefix`.
    pub fn route_prefix<F, Fut>(self, verb: &str, prefix: &str, handler: F) -> Self
    where
        F: Fn(Arc<SessionContext>, RequestMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchResponse, DispatchError>> + Send + 'static,
    {
        self.push(verb, PathMatcher::Prefix(prefix.to_string()), false, handler)
    }

    /// Route an exact path that anonymous connections may not use.
    pub fn route_authenticated<F, Fut>(self, verb: &str, path: &str, handler: F) -> Self
    where
        F: Fn(Arc<SessionContext>, RequestMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchResponse, DispatchError>> + Send + 'static,
    {
        self.push(verb, PathMatcher::Exact(path.to_string()), true, handler)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn push<F, Fut>(mut self, verb: &str, path: PathMatcher, authenticated_only: bool, handler: F) -> Self
    where
        F: Fn(Arc<SessionContext>, RequestMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<DispatchResponse, DispatchError>> + Send + 'static,
    {
        self.routes.push(Route {
            verb: verb.to_ascii_uppercase(),
            path,
            authenticated_only,
            handler: Arc::new(move |context, request| handler(context, request).boxed()),
        });
        self
    }

    fn find(&self, verb: &str, path: &str) -> Result<&Route, DispatchError> {
        let path = path.split_once('?').map_or(path, |(path, _)| path);
        let mut path_matched = false;
        for route in &self.routes {
            if !route.path.matches(path) {
                continue;
            }
            if route.verb.eq_ignore_ascii_case(verb) {
                return Ok(route);
            }
            path_matched = true;
        }
        if path_matched {
            Err(DispatchError::MethodNotAllowed)
        } else {
            Err(DispatchError::NotFound)
        }
    }
}

impl Dispatcher for ResourceRouter {
    fn dispatch(
        &self,
        context: Arc<SessionContext>,
        request: RequestMessage,
    ) -> BoxFuture<'_, Result<DispatchResponse, DispatchError>> {
        let route = match self.find(&request.verb, &request.path) {
            Ok(route) => route,
            Err(e) => return future::ready(Err(e)).boxed(),
        };
        if route.authenticated_only && !context.is_authenticated() {
            return future::ready(Err(DispatchError::Unauthorized)).boxed();
        }
        (route.handler)(context, request)
    }
}
