//! Static registration of embedded app modules and their route tables

use crate::manifest::AppDescriptor;
use crate::registry::{FailureKind, Registry};
use hyper::{Method, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Request as seen by an embedded handler
#[derive(Debug, Clone)]
pub struct AppRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    /// Values captured by `{param}` segments
    pub params: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub app: Arc<AppDescriptor>,
}

impl AppRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// JSON response from an embedded handler
#[derive(Debug, Clone)]
pub struct AppResponse {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl AppResponse {
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn with_status(status: StatusCode, body: serde_json::Value) -> Self {
        Self { status, body }
    }
}

pub type Handler = Arc<dyn Fn(&AppRequest) -> AppResponse + Send + Sync>;

/// One route exported by an app, relative to the app's mount path
#[derive(Clone)]
pub struct RouteBinding {
    pub method: Method,
    pub path: String,
    pub handler: Handler,
}

impl RouteBinding {
    pub fn new<F>(method: Method, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&AppRequest) -> AppResponse + Send + Sync + 'static,
    {
        Self {
            method,
            path: path.into(),
            handler: Arc::new(handler),
        }
    }

    pub fn get<F>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&AppRequest) -> AppResponse + Send + Sync + 'static,
    {
        Self::new(Method::GET, path, handler)
    }

    pub fn post<F>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&AppRequest) -> AppResponse + Send + Sync + 'static,
    {
        Self::new(Method::POST, path, handler)
    }
}

impl std::fmt::Debug for RouteBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteBinding")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish()
    }
}

/// Entry point of an embedded app
pub trait AppModule: Send + Sync {
    /// Ordered route list for this app
    fn routes(&self, app: &AppDescriptor) -> anyhow::Result<Vec<RouteBinding>>;
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("app '{0}' exports no handlers")]
    NoHandlers(String),
    #[error("failed to load app '{app}': {cause:#}")]
    Module { app: String, cause: anyhow::Error },
}

impl LoadError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            LoadError::NoHandlers(_) => FailureKind::NoHandlersExported,
            LoadError::Module { .. } => FailureKind::LoadError,
        }
    }
}

/// Modules compiled into the binary, keyed by app name
#[derive(Default)]
pub struct ModuleCatalog {
    modules: HashMap<String, Box<dyn AppModule>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the bundled apps registered
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register("hello", crate::apps::hello::HelloModule);
        catalog
    }

    pub fn register(&mut self, name: impl Into<String>, module: impl AppModule + 'static) {
        self.modules.insert(name.into(), Box::new(module));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn load(&self, app: &AppDescriptor) -> Result<Vec<RouteBinding>, LoadError> {
        let module = self
            .modules
            .get(&app.name)
            .ok_or_else(|| LoadError::NoHandlers(app.name.clone()))?;

        let routes = module.routes(app).map_err(|cause| LoadError::Module {
            app: app.name.clone(),
            cause,
        })?;

        if routes.is_empty() {
            return Err(LoadError::NoHandlers(app.name.clone()));
        }
        Ok(routes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

struct CompiledRoute {
    method: Method,
    pattern: String,
    segments: Vec<Segment>,
    handler: Handler,
    app: Arc<AppDescriptor>,
}

/// Routes of every loaded embedded app, mounted under the base path
#[derive(Default)]
pub struct Router {
    routes: Vec<CompiledRoute>,
}

/// A route resolved for one request
pub struct RouteMatch {
    pub handler: Handler,
    pub params: BTreeMap<String, String>,
    pub app: Arc<AppDescriptor>,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `bindings` under `{base_path}{app.url_prefix}`
    pub fn mount(&mut self, base_path: &str, app: &AppDescriptor, bindings: Vec<RouteBinding>) {
        let app = Arc::new(app.clone());
        let mount = app.mount_path(base_path);

        for binding in bindings {
            let pattern = format!("{}/{}", mount, binding.path.trim_start_matches('/'));
            let pattern = pattern.trim_end_matches('/').to_string();
            let segments = split_path(&pattern)
                .into_iter()
                .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(param) => Segment::Param(param.to_string()),
                    None => Segment::Literal(s.to_string()),
                })
                .collect();
            debug!(app = %app.name, method = %binding.method, path = %pattern, "Mounted route");
            self.routes.push(CompiledRoute {
                method: binding.method,
                pattern,
                segments,
                handler: binding.handler,
                app: Arc::clone(&app),
            });
        }
    }

    /// First route registered for `method` that matches `path`. Trailing slashes are ignored.
    pub fn find(&self, method: &Method, path: &str) -> Option<RouteMatch> {
        let parts = split_path(path);

        self.routes
            .iter()
            .filter(|r| r.method == *method && r.segments.len() == parts.len())
            .find_map(|route| {
                let mut params = BTreeMap::new();
                for (segment, part) in route.segments.iter().zip(&parts) {
                    match segment {
                        Segment::Literal(lit) if lit == part => {}
                        Segment::Literal(_) => return None,
                        Segment::Param(name) => {
                            params.insert(name.clone(), (*part).to_string());
                        }
                    }
                }
                Some(RouteMatch {
                    handler: Arc::clone(&route.handler),
                    params,
                    app: Arc::clone(&route.app),
                })
            })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// `(method, path)` for every mounted route, in registration order
    pub fn describe(&self) -> Vec<(String, String)> {
        self.routes
            .iter()
            .map(|r| (r.method.to_string(), r.pattern.clone()))
            .collect()
    }
}

/// Load every embedded app in the registry and mount its routes.
///
/// Apps that fail to load are moved to the registry's failed list.
pub fn load_embedded(registry: &Registry, catalog: &ModuleCatalog, base_path: &str) -> Router {
    let mut router = Router::new();

    for app in registry.embedded() {
        match catalog.load(&app) {
            Ok(bindings) => {
                info!(app = %app.name, routes = bindings.len(), "Loaded embedded app");
                router.mount(base_path, &app, bindings);
            }
            Err(e) => {
                error!(app = %app.name, error = %e, "Failed to load embedded app");
                registry.mark_failed(&app.name, e.failure_kind(), e.to_string());
            }
        }
    }

    router
}
