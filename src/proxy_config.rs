//! nginx configuration for the apps in the registry
//!
//! Isolated apps get an upstream and a regex location each, ordered longest
//! prefix first. Embedded apps share a catch-all location pointing at the
//! framework process. Output carries no timestamps, so identical registries
//! produce byte-identical files.

use crate::config::{Config, ProxyFormat};
use crate::manifest::AppDescriptor;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

const MAIN_UPSTREAM: &str = "plugrest_main";

/// Container-mode markers in the process environment
pub fn detect_docker_mode() -> bool {
    let env_true = |key: &str| {
        std::env::var(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    };
    Path::new("/.dockerenv").exists() || env_true("DOCKER_MODE") || env_true("PLUGREST_DOCKER")
}

/// Everything the generator needs besides the apps themselves
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub base_path: String,
    pub main_port: u16,
    pub server_name: String,
    pub listen_port: u16,
    pub docker_mode: bool,
    pub main_service: String,
    pub isolated_service_prefix: String,
    pub output_dir: PathBuf,
    pub filename: String,
    pub format: ProxyFormat,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        let proxy = &config.proxy;
        Self {
            base_path: config.server.base_path.trim_end_matches('/').to_string(),
            main_port: config.server.port,
            server_name: proxy.server_name.clone(),
            listen_port: proxy.listen_port,
            docker_mode: proxy.docker_mode.unwrap_or_else(detect_docker_mode),
            main_service: proxy.main_service.clone(),
            isolated_service_prefix: proxy.isolated_service_prefix.clone(),
            output_dir: PathBuf::from(&proxy.output_dir),
            filename: proxy.filename.clone(),
            format: proxy.format,
        }
    }

    /// Whether the configured format (or filename, for `auto`) asks for a full nginx.conf
    pub fn complete(&self) -> bool {
        match self.format {
            ProxyFormat::Complete => true,
            ProxyFormat::Server => false,
            ProxyFormat::Auto => {
                self.filename.ends_with("nginx.conf") || self.filename == "default.conf"
            }
        }
    }
}

pub struct ProxyConfigGenerator {
    settings: ProxySettings,
}

impl ProxyConfigGenerator {
    pub fn new(settings: ProxySettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Render in the configured shape
    pub fn generate(&self, embedded: &[AppDescriptor], isolated: &[AppDescriptor]) -> String {
        if self.settings.complete() {
            self.generate_complete(embedded, isolated)
        } else {
            self.generate_server(embedded, isolated)
        }
    }

    fn main_host(&self) -> String {
        if self.settings.docker_mode {
            format!("{}:{}", self.settings.main_service, self.settings.main_port)
        } else {
            format!("127.0.0.1:{}", self.settings.main_port)
        }
    }

    fn isolated_host(&self, app: &AppDescriptor, port: u16) -> String {
        match (self.settings.docker_mode, self.settings.isolated_service_prefix.is_empty()) {
            (true, false) => format!("{}{}:{}", self.settings.isolated_service_prefix, app.name, port),
            (true, true) => format!("{}:{}", self.settings.main_service, port),
            (false, _) => format!("127.0.0.1:{}", port),
        }
    }

    /// Isolated apps with ports, longest prefix first, ties broken by name
    fn routed<'a>(&self, isolated: &'a [AppDescriptor]) -> Vec<(&'a AppDescriptor, u16)> {
        let mut routed: Vec<(&AppDescriptor, u16)> = isolated
            .iter()
            .filter_map(|app| match app.port {
                Some(port) => Some((app, port)),
                None => {
                    warn!(app = %app.name, "Isolated app has no port, leaving it out of proxy config");
                    None
                }
            })
            .collect();
        routed.sort_by(|(a, _), (b, _)| {
            b.url_prefix
                .len()
                .cmp(&a.url_prefix.len())
                .then_with(|| a.name.cmp(&b.name))
        });
        routed
    }

    fn upstreams(&self, has_embedded: bool, routed: &[(&AppDescriptor, u16)]) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Docker mode: {}", self.settings.docker_mode);
        out.push('\n');

        if has_embedded {
            let _ = writeln!(out, "# Framework process (embedded apps)");
            let _ = writeln!(out, "upstream {} {{", MAIN_UPSTREAM);
            let _ = writeln!(out, "    server {};", self.main_host());
            let _ = writeln!(out, "    keepalive 64;");
            let _ = writeln!(out, "}}");
            out.push('\n');
        }

        let mut by_name: Vec<&(&AppDescriptor, u16)> = routed.iter().collect();
        by_name.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        for (app, port) in by_name {
            let _ = writeln!(out, "# Isolated app: {}", app.name);
            let _ = writeln!(out, "upstream {} {{", upstream_name(&app.name));
            let _ = writeln!(out, "    server {};", self.isolated_host(app, *port));
            let _ = writeln!(out, "    keepalive 32;");
            let _ = writeln!(out, "}}");
            out.push('\n');
        }
        out
    }

    /// Upstreams plus one server block, suitable for inclusion from an existing nginx.conf
    pub fn generate_server(&self, embedded: &[AppDescriptor], isolated: &[AppDescriptor]) -> String {
        let base = &self.settings.base_path;
        let routed = self.routed(isolated);
        let has_embedded = !embedded.is_empty();

        let mut out = String::new();
        out.push_str("# plugrest proxy configuration\n");
        out.push_str("# Generated file, do not edit. Include it from nginx.conf or sites-enabled.\n\n");
        out.push_str(&self.upstreams(has_embedded, &routed));

        let listen = self.settings.listen_port;
        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "    listen {} default_server;", listen);
        let _ = writeln!(out, "    listen [::]:{} default_server;", listen);
        let _ = writeln!(out, "    server_name {};", self.settings.server_name);
        out.push('\n');
        out.push_str(
            "    access_log /var/log/nginx/plugrest_access.log;\n\
             \x20   error_log /var/log/nginx/plugrest_error.log;\n\n\
             \x20   add_header X-Frame-Options \"SAMEORIGIN\" always;\n\
             \x20   add_header X-Content-Type-Options \"nosniff\" always;\n\n\
             \x20   proxy_http_version 1.1;\n\
             \x20   proxy_set_header Host $host;\n\
             \x20   proxy_set_header X-Real-IP $remote_addr;\n\
             \x20   proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
             \x20   proxy_set_header X-Forwarded-Proto $scheme;\n\
             \x20   proxy_set_header X-Forwarded-Host $host;\n\
             \x20   proxy_set_header X-Forwarded-Port $server_port;\n\
             \x20   proxy_set_header Upgrade $http_upgrade;\n\
             \x20   proxy_set_header Connection \"upgrade\";\n\
             \x20   proxy_connect_timeout 60s;\n\
             \x20   proxy_send_timeout 60s;\n\
             \x20   proxy_read_timeout 60s;\n\
             \x20   proxy_buffering off;\n\n",
        );

        // Regex locations are evaluated in file order, so the longest prefix goes first.
        // The pattern matches the prefix with or without a trailing path.
        for (app, _) in &routed {
            let _ = writeln!(out, "    # Isolated app: {}", app.name);
            let _ = writeln!(out, "    location ~ {} {{", location_regex(base, &app.url_prefix));
            let _ = writeln!(out, "        proxy_pass http://{}$request_uri;", upstream_name(&app.name));
            let _ = writeln!(out, "    }}");
            out.push('\n');
        }

        if has_embedded {
            let _ = writeln!(out, "    # Embedded apps and framework endpoints");
            let _ = writeln!(out, "    location {}/ {{", base);
            let _ = writeln!(out, "        proxy_pass http://{};", MAIN_UPSTREAM);
            let _ = writeln!(out, "    }}");
            out.push('\n');
        }

        let _ = writeln!(out, "    location = / {{");
        let _ = writeln!(out, "        return 301 {}/;", base);
        let _ = writeln!(out, "    }}");
        out.push('\n');
        out.push_str(
            "    location /nginx-health {\n\
             \x20       access_log off;\n\
             \x20       add_header Content-Type text/plain;\n\
             \x20       return 200 \"healthy\\n\";\n\
             \x20   }\n\
             }\n",
        );
        out
    }

    /// A standalone nginx.conf wrapping the server configuration in `events`/`http`
    pub fn generate_complete(&self, embedded: &[AppDescriptor], isolated: &[AppDescriptor]) -> String {
        let server = self.generate_server(embedded, isolated);

        let mut out = String::from(
            "# plugrest complete nginx configuration\n\
             # Generated file, do not edit.\n\n\
             worker_processes auto;\n\
             error_log /var/log/nginx/error.log warn;\n\
             pid /run/nginx/nginx.pid;\n\n\
             events {\n\
             \x20   worker_connections 1024;\n\
             \x20   multi_accept on;\n\
             }\n\n\
             http {\n\
             \x20   include /etc/nginx/mime.types;\n\
             \x20   default_type application/octet-stream;\n\n\
             \x20   log_format main '$remote_addr - $remote_user [$time_local] \"$request\" '\n\
             \x20                   '$status $body_bytes_sent \"$http_referer\" '\n\
             \x20                   '\"$http_user_agent\" \"$http_x_forwarded_for\"';\n\
             \x20   access_log /var/log/nginx/access.log main;\n\n\
             \x20   sendfile on;\n\
             \x20   tcp_nopush on;\n\
             \x20   tcp_nodelay on;\n\
             \x20   keepalive_timeout 65;\n\n\
             \x20   gzip on;\n\
             \x20   gzip_proxied any;\n\
             \x20   gzip_types text/plain text/css application/json application/javascript application/xml;\n\n",
        );

        for line in server.lines() {
            if line.is_empty() {
                out.push('\n');
            } else {
                let _ = writeln!(out, "    {}", line);
            }
        }

        out.push_str("\n    include /etc/nginx/conf.d/*.conf;\n}\n");
        out
    }

    /// Human-readable list of where each app is served
    pub fn routing_summary(&self, embedded: &[AppDescriptor], isolated: &[AppDescriptor]) -> String {
        let base = &self.settings.base_path;
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Proxy listening on {}:{}",
            self.settings.server_name, self.settings.listen_port
        );

        if !embedded.is_empty() {
            let _ = writeln!(out, "Embedded apps (-> {}):", self.main_host());
            for app in embedded {
                let _ = writeln!(out, "  {}{}  [{}]", base, app.url_prefix, app.name);
            }
        }
        let routed = self.routed(isolated);
        if !routed.is_empty() {
            let _ = writeln!(out, "Isolated apps:");
            for (app, port) in routed {
                let _ = writeln!(
                    out,
                    "  {}{}  [{}] -> {}",
                    base,
                    app.url_prefix,
                    app.name,
                    self.isolated_host(app, port)
                );
            }
        }
        let _ = writeln!(out, "Health check: /nginx-health");
        out
    }

    /// Write `content` to `<output_dir>/<filename>`.
    ///
    /// A directory squatting on the target is removed (or, failing that, the
    /// file goes to `<filename>.new`). If the write itself fails the content
    /// goes to `<filename>.<unix timestamp>`.
    pub async fn write(&self, content: String) -> std::io::Result<PathBuf> {
        let output_dir = self.settings.output_dir.clone();
        let filename = self.settings.filename.clone();
        tokio::task::spawn_blocking(move || write_config(&output_dir, &filename, &content))
            .await
            .map_err(std::io::Error::other)?
    }
}

/// nginx upstream identifier for an app.
///
/// Distinct app names always give distinct identifiers: `_` becomes `__` and
/// any other byte outside `[A-Za-z0-9]` becomes `_` plus two hex digits.
pub fn upstream_name(app: &str) -> String {
    let mut out = String::from("plugrest_");
    for byte in app.bytes() {
        match byte {
            b'_' => out.push_str("__"),
            b if b.is_ascii_alphanumeric() => out.push(b as char),
            b => {
                let _ = write!(out, "_{:02x}", b);
            }
        }
    }
    out
}

/// Quoted PCRE matching `base` + `prefix`, with or without a trailing path
fn location_regex(base: &str, prefix: &str) -> String {
    let mut pattern = String::from("\"^");
    for c in base.chars().chain(prefix.chars()) {
        if matches!(
            c,
            '\\' | '.' | '^' | '$' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '"'
        ) {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push_str("(/.*)?$\"");
    pattern
}

fn write_config(output_dir: &Path, filename: &str, content: &str) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let mut target = output_dir.join(filename);

    if target.is_dir() {
        warn!(path = %target.display(), "Proxy config target is a directory, removing it");
        if let Err(e) = std::fs::remove_dir_all(&target) {
            error!(path = %target.display(), error = %e, "Failed to remove directory");
            target = output_dir.join(format!("{}.new", filename));
        }
    }

    match std::fs::write(&target, content) {
        Ok(()) => {
            info!(path = %target.display(), "Proxy configuration written");
            Ok(target)
        }
        Err(e) => {
            let fallback = output_dir.join(format!("{}.{}", filename, chrono::Utc::now().timestamp()));
            error!(path = %target.display(), error = %e, fallback = %fallback.display(), "Failed to write proxy configuration");
            std::fs::write(&fallback, content)?;
            Ok(fallback)
        }
    }
}
