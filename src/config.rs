use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `apps.folder`
pub const APPS_FOLDER_ENV: &str = "PLUGREST_APPS_FOLDER";

/// Global configuration for the framework host
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener, admin and auth settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Where apps live and how isolated ports are numbered
    #[serde(default)]
    pub apps: AppsConfig,

    /// Dependency environment provisioning
    #[serde(default)]
    pub environment: EnvironmentConfig,

    /// Isolated process supervision
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Reverse-proxy configuration output
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the framework listener (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,

    /// Framework listener port (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path every route is mounted under (default: /pyrest)
    #[serde(default = "default_base_path")]
    pub base_path: String,

    /// Port for the admin control plane, bound to loopback
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Auth configuration file handed to isolated apps
    #[serde(default = "default_auth_config_file")]
    pub auth_config_file: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            admin_port: default_admin_port(),
            admin_token: None,
            auth_config_file: default_auth_config_file(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppsConfig {
    /// Directory scanned for apps (default: apps)
    #[serde(default = "default_apps_folder")]
    pub folder: String,

    /// First port handed out to isolated apps without a preference
    #[serde(default = "default_isolated_base_port")]
    pub isolated_base_port: u16,
}

impl Default for AppsConfig {
    fn default() -> Self {
        Self {
            folder: default_apps_folder(),
            isolated_base_port: default_isolated_base_port(),
        }
    }
}

/// Which tool creates environments and installs dependencies
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstallerKind {
    /// Use `uv` when it is on PATH, otherwise `pip`
    #[default]
    Auto,
    Uv,
    Pip,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnvironmentConfig {
    /// Environment directory name inside each app (default: .venv)
    #[serde(default = "default_env_dir_name")]
    pub dir_name: String,

    /// Dependency manifest whose presence makes an app isolated
    #[serde(default = "default_dependency_file")]
    pub dependency_file: String,

    /// Interpreter used to create environments and to run apps without one
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    #[serde(default)]
    pub installer: InstallerKind,

    /// Upgrade pip inside a fresh environment before installing
    #[serde(default = "default_true")]
    pub upgrade_pip: bool,

    /// Extra environment applied to every provisioning command
    #[serde(default)]
    pub installer_env: BTreeMap<String, String>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            dir_name: default_env_dir_name(),
            dependency_file: default_dependency_file(),
            interpreter: default_interpreter(),
            installer: InstallerKind::default(),
            upgrade_pip: true,
            installer_env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Arguments passed to the interpreter to run an isolated app
    #[serde(default = "default_runner_args")]
    pub runner_args: Vec<String>,

    /// How long a fresh process must survive to count as started
    #[serde(default = "default_spawn_grace_ms")]
    pub spawn_grace_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

impl SupervisorConfig {
    pub fn spawn_grace(&self) -> Duration {
        Duration::from_millis(self.spawn_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runner_args: default_runner_args(),
            spawn_grace_ms: default_spawn_grace_ms(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

/// Shape of the generated proxy configuration
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyFormat {
    /// Pick `complete` for nginx.conf / default.conf, `server` otherwise
    #[default]
    Auto,
    /// Upstreams plus a server block, meant to be included
    Server,
    /// A full nginx.conf with events and http blocks
    Complete,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Generate proxy configuration at startup
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_proxy_output_dir")]
    pub output_dir: String,

    #[serde(default = "default_proxy_filename")]
    pub filename: String,

    #[serde(default)]
    pub format: ProxyFormat,

    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Port the proxy itself listens on
    #[serde(default = "default_proxy_listen_port")]
    pub listen_port: u16,

    /// Container mode; detected from the environment when unset
    pub docker_mode: Option<bool>,

    /// Hostname of the framework service in container mode
    #[serde(default = "default_main_service")]
    pub main_service: String,

    /// Per-app service hostname prefix in container mode
    #[serde(default)]
    pub isolated_service_prefix: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_dir: default_proxy_output_dir(),
            filename: default_proxy_filename(),
            format: ProxyFormat::default(),
            server_name: default_server_name(),
            listen_port: default_proxy_listen_port(),
            docker_mode: None,
            main_service: default_main_service(),
            isolated_service_prefix: String::new(),
        }
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_base_path() -> String {
    "/pyrest".to_string()
}

fn default_admin_port() -> u16 {
    8099
}

fn default_auth_config_file() -> String {
    "auth_config.json".to_string()
}

fn default_apps_folder() -> String {
    "apps".to_string()
}

fn default_isolated_base_port() -> u16 {
    8001
}

fn default_env_dir_name() -> String {
    ".venv".to_string()
}

fn default_dependency_file() -> String {
    "requirements.txt".to_string()
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_true() -> bool {
    true
}

fn default_runner_args() -> Vec<String> {
    vec!["isolated_app.py".to_string()]
}

fn default_spawn_grace_ms() -> u64 {
    500
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_proxy_output_dir() -> String {
    "nginx".to_string()
}

fn default_proxy_filename() -> String {
    "pyrest_generated.conf".to_string()
}

fn default_server_name() -> String {
    "localhost".to_string()
}

fn default_proxy_listen_port() -> u16 {
    8080
}

fn default_main_service() -> String {
    "pyrest".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; environment overrides are applied
    /// before validation either way.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(folder) = std::env::var(APPS_FOLDER_ENV) {
            if !folder.is_empty() {
                self.apps.folder = folder;
            }
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let base = &self.server.base_path;
        if !base.starts_with('/') {
            errors.push(format!("server.base_path '{}' must start with '/'", base));
        }
        if base.len() > 1 && base.ends_with('/') {
            errors.push(format!("server.base_path '{}' must not end with '/'", base));
        }
        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.admin_port == 0 {
            errors.push("server.admin_port must be greater than 0".to_string());
        }
        if self.server.admin_port == self.server.port {
            errors.push(format!(
                "server.admin_port {} collides with server.port",
                self.server.admin_port
            ));
        }
        if self.apps.isolated_base_port == 0 {
            errors.push("apps.isolated_base_port must be greater than 0".to_string());
        }
        if self.supervisor.runner_args.is_empty() {
            errors.push("supervisor.runner_args must not be empty".to_string());
        }
        if self.environment.dir_name.is_empty() || self.environment.dir_name.contains('/') {
            errors.push(format!(
                "environment.dir_name '{}' must be a plain directory name",
                self.environment.dir_name
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Read-only view for the admin API. The admin token and installer
    /// environment values are masked.
    pub fn redacted(&self) -> serde_json::Value {
        let installer_env: BTreeMap<&str, String> = self
            .environment
            .installer_env
            .iter()
            .map(|(key, value)| (key.as_str(), mask_secret(value)))
            .collect();

        json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port,
                "base_path": self.server.base_path,
                "admin_port": self.server.admin_port,
                "admin_token": self.server.admin_token.as_ref().map(|_| "********"),
                "auth_config_file": self.server.auth_config_file,
                "pid_file": self.server.pid_file,
            },
            "apps": {
                "folder": self.apps.folder,
                "isolated_base_port": self.apps.isolated_base_port,
            },
            "environment": {
                "dir_name": self.environment.dir_name,
                "dependency_file": self.environment.dependency_file,
                "interpreter": self.environment.interpreter,
                "installer": self.environment.installer,
                "upgrade_pip": self.environment.upgrade_pip,
                "installer_env": installer_env,
            },
            "supervisor": {
                "runner_args": self.supervisor.runner_args,
                "spawn_grace_ms": self.supervisor.spawn_grace_ms,
                "stop_timeout_secs": self.supervisor.stop_timeout_secs,
            },
            "proxy": {
                "enabled": self.proxy.enabled,
                "output_dir": self.proxy.output_dir,
                "filename": self.proxy.filename,
                "format": self.proxy.format,
                "server_name": self.proxy.server_name,
                "listen_port": self.proxy.listen_port,
                "docker_mode": self.proxy.docker_mode,
                "main_service": self.proxy.main_service,
                "isolated_service_prefix": self.proxy.isolated_service_prefix,
            },
        })
    }

    pub fn apps_folder(&self) -> PathBuf {
        PathBuf::from(&self.apps.folder)
    }

    /// Auth config path as handed to child processes (absolute when resolvable)
    pub fn auth_config_path(&self) -> PathBuf {
        let path = PathBuf::from(&self.server.auth_config_file);
        if path.is_absolute() {
            return path;
        }
        std::env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Keep the first and last four characters of long values, hide short ones entirely
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret(""), "****");
        assert_eq!(mask_secret("short"), "****");
        assert_eq!(mask_secret("https://user:pw@pypi.example/simple"), "http****mple");
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let mut config = Config::default();
        config.server.admin_token = Some("super-secret-token".to_string());
        config
            .environment
            .installer_env
            .insert("PIP_INDEX_URL".to_string(), "https://user:pw@pypi.example/simple".to_string());

        let view = config.redacted();
        let rendered = view.to_string();
        assert!(!rendered.contains("super-secret-token"));
        assert!(!rendered.contains("user:pw"));
        assert_eq!(view["server"]["admin_token"], "********");
        assert_eq!(view["environment"]["installer_env"]["PIP_INDEX_URL"], "http****mple");
        assert_eq!(view["environment"]["installer"], "auto");
        assert_eq!(view["server"]["base_path"], "/pyrest");

        assert!(Config::default().redacted()["server"]["admin_token"].is_null());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
host = "127.0.0.1"
port = 9000
base_path = "/api"
admin_port = 9001
admin_token = "secret"

[apps]
folder = "plugins"
isolated_base_port = 9100

[environment]
interpreter = "/usr/bin/python3.12"
installer = "pip"
upgrade_pip = false

[environment.installer_env]
PIP_INDEX_URL = "https://mirror.example/simple"

[supervisor]
runner_args = ["-m", "runner"]
stop_timeout_secs = 2

[proxy]
filename = "nginx.conf"
format = "complete"
docker_mode = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.base_path, "/api");
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.apps.folder, "plugins");
        assert_eq!(config.apps.isolated_base_port, 9100);
        assert_eq!(config.environment.installer, InstallerKind::Pip);
        assert!(!config.environment.upgrade_pip);
        assert_eq!(
            config.environment.installer_env.get("PIP_INDEX_URL").map(String::as_str),
            Some("https://mirror.example/simple")
        );
        assert_eq!(config.supervisor.runner_args, vec!["-m", "runner"]);
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.proxy.format, ProxyFormat::Complete);
        assert_eq!(config.proxy.docker_mode, Some(true));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.base_path, "/pyrest");
        assert_eq!(config.server.auth_config_file, "auth_config.json");
        assert_eq!(config.apps.folder, "apps");
        assert_eq!(config.apps.isolated_base_port, 8001);
        assert_eq!(config.environment.dir_name, ".venv");
        assert_eq!(config.environment.dependency_file, "requirements.txt");
        assert_eq!(config.environment.installer, InstallerKind::Auto);
        assert_eq!(config.supervisor.spawn_grace(), Duration::from_millis(500));
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(5));
        assert!(config.proxy.enabled);
        assert_eq!(config.proxy.filename, "pyrest_generated.conf");
        assert_eq!(config.proxy.format, ProxyFormat::Auto);
        assert!(config.proxy.docker_mode.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nport = \"not a number\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_validate_base_path() {
        let mut config = Config::default();
        config.server.base_path = "pyrest".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must start with '/'"));

        config.server.base_path = "/pyrest/".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must not end with '/'"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.supervisor.runner_args.clear();
        config.environment.dir_name = "a/b".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("server.port"));
        assert!(err.contains("runner_args"));
        assert!(err.contains("dir_name"));
    }

    #[test]
    fn test_validate_admin_port_collision() {
        let mut config = Config::default();
        config.server.admin_port = config.server.port;
        assert!(config.validate().unwrap_err().to_string().contains("collides"));
    }

    #[test]
    fn test_auth_config_path_is_absolute() {
        let config = Config::default();
        assert!(config.auth_config_path().is_absolute());
        assert!(config.auth_config_path().ends_with("auth_config.json"));
    }
}
