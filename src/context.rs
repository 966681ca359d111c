//! Shared state for one running framework instance

use crate::config::Config;
use crate::control::ControlPlane;
use crate::environment::EnvironmentManager;
use crate::loader::{load_embedded, ModuleCatalog, Router};
use crate::ports::PortAllocator;
use crate::proxy_config::{ProxyConfigGenerator, ProxySettings};
use crate::registry::{discover, Registry};
use crate::supervisor::{Supervisor, SupervisorSettings};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Everything the HTTP surfaces and the startup sequence share
pub struct AppContext {
    pub config: Config,
    pub registry: Arc<Registry>,
    pub ports: PortAllocator,
    pub environments: Arc<EnvironmentManager>,
    pub supervisor: Arc<Supervisor>,
    pub control: ControlPlane,
    pub router: Router,
    pub started_at: DateTime<Utc>,
}

impl AppContext {
    /// Discover apps, assign ports and load embedded modules.
    ///
    /// Isolated apps are not started here; see [`ControlPlane::start_all_isolated`].
    pub async fn initialize(config: Config, catalog: &ModuleCatalog, app_filter: Option<&str>) -> Self {
        let environments = EnvironmentManager::new(config.environment.clone()).await;
        Self::assemble(config, environments, catalog, app_filter)
    }

    pub fn assemble(
        config: Config,
        environments: EnvironmentManager,
        catalog: &ModuleCatalog,
        app_filter: Option<&str>,
    ) -> Self {
        let apps_folder = config.apps_folder();
        info!(path = %apps_folder.display(), "Discovering apps");

        let mut discovery = discover(&apps_folder, &config.environment.dependency_file);
        if let Some(filter) = app_filter {
            discovery.retain_only(filter);
        }

        let ports = PortAllocator::new(config.apps.isolated_base_port);
        let registry = Arc::new(Registry::build(discovery, &ports));
        let router = load_embedded(&registry, catalog, &config.server.base_path);

        let environments = Arc::new(environments);
        let supervisor = Supervisor::new(SupervisorSettings::from_config(&config));
        let control = ControlPlane::new(
            Arc::clone(&registry),
            Arc::clone(&environments),
            Arc::clone(&supervisor),
            config.supervisor.stop_timeout(),
        );

        info!(
            embedded = registry.embedded().len(),
            isolated = registry.isolated().len(),
            failed = registry.failed().len(),
            routes = router.len(),
            "App registry ready"
        );

        Self {
            config,
            registry,
            ports,
            environments,
            supervisor,
            control,
            router,
            started_at: Utc::now(),
        }
    }

    pub fn proxy_generator(&self) -> ProxyConfigGenerator {
        ProxyConfigGenerator::new(ProxySettings::from_config(&self.config))
    }

    /// Generate the reverse proxy configuration for the current registry and write it out
    pub async fn write_proxy_config(&self) -> std::io::Result<PathBuf> {
        let generator = self.proxy_generator();
        let embedded = self.registry.embedded();
        let isolated = self.registry.isolated();

        let content = generator.generate(&embedded, &isolated);
        let path = generator.write(content).await?;
        info!(path = %path.display(), "Wrote reverse proxy configuration");
        info!("\n{}", generator.routing_summary(&embedded, &isolated));
        Ok(path)
    }

    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }

    /// Overall framework status, shared by the admin and framework surfaces.
    ///
    /// Carries the app summaries, the live process table and the dependency
    /// environment of every isolated app.
    pub async fn status(&self) -> serde_json::Value {
        let base = &self.config.server.base_path;
        let embedded: Vec<serde_json::Value> = self
            .registry
            .embedded()
            .iter()
            .map(|app| {
                json!({
                    "name": app.name,
                    "prefix": app.url_prefix,
                    "mount": app.mount_path(base),
                    "version": app.version,
                })
            })
            .collect();

        let mut isolated = Vec::new();
        for app in self.registry.isolated() {
            let process = self.supervisor.status(&app.name);
            let environment = self.environments.inspect(&app.directory).await;
            isolated.push(json!({
                "name": app.name,
                "prefix": app.url_prefix,
                "port": app.port,
                "running": process.as_ref().map(|p| p.is_running).unwrap_or(false),
                "pid": process.as_ref().map(|p| p.pid),
                "environment": environment,
            }));
        }

        let processes = self.supervisor.all_statuses();

        json!({
            "name": PKG_NAME,
            "version": VERSION,
            "base_path": base,
            "uptime_secs": self.uptime_secs(),
            "routes": self.router.len(),
            "running_processes": processes.len(),
            "processes": processes,
            "embedded": embedded,
            "isolated": isolated,
            "failed": self.registry.failed(),
        })
    }

    /// Detailed view of one app by name: embedded, isolated or failed
    pub async fn app_detail(&self, name: &str) -> Option<serde_json::Value> {
        if let Some(app) = self.registry.isolated_app(name) {
            let process = self.supervisor.status(name);
            let environment = self.environments.inspect(&app.directory).await;
            return Some(json!({
                "app": app,
                "mount": app.mount_path(&self.config.server.base_path),
                "process": process,
                "environment": environment,
            }));
        }

        if let Some(app) = self.registry.embedded().into_iter().find(|a| a.name == name) {
            return Some(json!({
                "app": app,
                "mount": app.mount_path(&self.config.server.base_path),
            }));
        }

        self.registry
            .failed()
            .into_iter()
            .find(|f| f.name == name)
            .map(|record| json!({ "failed": record }))
    }
}
