use plugrest::admin::AdminServer;
use plugrest::config::Config;
use plugrest::context::{AppContext, PKG_NAME, VERSION};
use plugrest::loader::ModuleCatalog;
use plugrest::server::FrameworkServer;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct CliArgs {
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    debug: bool,
    no_isolated: bool,
    no_proxy: bool,
    app: Option<String>,
    help: bool,
}

const USAGE: &str = "Usage: plugrest [OPTIONS]

Options:
  --config PATH     Configuration file (default: plugrest.toml)
  --host HOST       Override server.host
  --port PORT       Override server.port
  --debug           Verbose logging
  --no-isolated     Do not provision or start isolated apps
  --no-proxy        Do not write the reverse proxy configuration
  --app NAME        Load only the named app
  -h, --help        Show this help";

fn parse_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut cli = CliArgs::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let flag = arg.as_str();
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("{} requires a value", flag))
        };
        match flag {
            "--config" | "-c" => cli.config = Some(PathBuf::from(value(flag)?)),
            "--host" => cli.host = Some(value(flag)?),
            "--port" | "-p" => {
                let raw = value(flag)?;
                let port = raw
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid port '{}'", raw))?;
                cli.port = Some(port);
            }
            "--app" => cli.app = Some(value(flag)?),
            "--debug" => cli.debug = true,
            "--no-isolated" => cli.no_isolated = true,
            "--no-proxy" => cli.no_proxy = true,
            "--help" | "-h" => cli.help = true,
            other => anyhow::bail!("unknown argument '{}'\n\n{}", other, USAGE),
        }
    }

    Ok(cli)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args)?;
    if cli.help {
        println!("{}", USAGE);
        return Ok(());
    }

    let directive = if cli.debug { "plugrest=debug" } else { "plugrest=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from("plugrest.toml"));
    let mut config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    if let Some(host) = &cli.host {
        config.server.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
        config.validate()?;
    }

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config, &cli);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = PidFile::create(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let catalog = ModuleCatalog::with_builtin();
    let context = Arc::new(AppContext::initialize(config, &catalog, cli.app.as_deref()).await);
    let config = &context.config;

    if cli.no_isolated {
        info!(count = context.registry.isolated().len(), "Isolated apps disabled, not starting");
    } else {
        let started = context.control.start_all_isolated().await;
        info!(started, failed = context.registry.failed().len(), "Isolated apps started");
    }

    if config.proxy.enabled && !cli.no_proxy {
        if let Err(e) = context.write_proxy_config().await {
            error!(error = %e, "Failed to write reverse proxy configuration");
        }
    }

    for failed in context.registry.failed() {
        warn!(app = %failed.name, kind = ?failed.error_kind, message = %failed.message, "App unavailable");
    }

    let main_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| {
            error!(host = %config.server.host, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let admin_addr: SocketAddr = format!("127.0.0.1:{}", config.server.admin_port)
        .parse()
        .map_err(|e| {
            error!(admin_port = config.server.admin_port, error = %e, "Invalid admin bind address");
            anyhow::anyhow!("Invalid admin bind address: {}", e)
        })?;

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let framework = FrameworkServer::new(main_addr, Arc::clone(&context), shutdown_rx.clone());
    let framework_handle = tokio::spawn(async move {
        if let Err(e) = framework.run().await {
            error!(error = %e, "Framework server error");
        }
    });

    let admin_server = AdminServer::new(admin_addr, Arc::clone(&context), shutdown_rx.clone(), admin_token);
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = admin_server.run().await {
            error!(error = %e, "Admin server error");
        }
    });

    wait_for_shutdown_signal().await;

    let _ = shutdown_tx.send(true);

    info!(running = context.supervisor.running_count(), "Stopping isolated apps...");
    context
        .supervisor
        .shutdown_all(config.supervisor.stop_timeout())
        .await;

    // Wait for servers to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = framework_handle.await;
        let _ = admin_handle.await;
    })
    .await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler, waiting for Ctrl+C only");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down...");
    }
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        // Only truncate once the lock is ours
        file.set_len(0)?;
        writeln!(&file, "{}", std::process::id())?;

        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn print_startup_banner(config: &Config, cli: &CliArgs) {
    info!(name = PKG_NAME, version = VERSION, "Starting plugin REST framework");
    info!(
        host = %config.server.host,
        port = config.server.port,
        admin_port = config.server.admin_port,
        base_path = %config.server.base_path,
        "Server configuration"
    );
    info!(
        folder = %config.apps.folder,
        isolated_base_port = config.apps.isolated_base_port,
        only = ?cli.app,
        "App settings"
    );
    info!(
        dir_name = %config.environment.dir_name,
        dependency_file = %config.environment.dependency_file,
        interpreter = %config.environment.interpreter,
        installer = ?config.environment.installer,
        "Environment settings"
    );
    info!(
        spawn_grace_ms = config.supervisor.spawn_grace_ms,
        stop_timeout_secs = config.supervisor.stop_timeout_secs,
        isolated_enabled = !cli.no_isolated,
        "Supervisor settings"
    );
    info!(
        enabled = config.proxy.enabled && !cli.no_proxy,
        output_dir = %config.proxy.output_dir,
        format = ?config.proxy.format,
        "Reverse proxy settings"
    );
}
