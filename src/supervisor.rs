use crate::config::Config;
use crate::environment;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, error, info, warn};

/// Environment variables describing an isolated app to its own process
pub const ENV_APP_NAME: &str = "PLUGREST_APP_NAME";
pub const ENV_APP_PATH: &str = "PLUGREST_APP_PATH";
pub const ENV_APP_PORT: &str = "PLUGREST_APP_PORT";
pub const ENV_MAIN_PORT: &str = "PLUGREST_MAIN_PORT";
pub const ENV_BASE_PATH: &str = "PLUGREST_BASE_PATH";
pub const ENV_AUTH_CONFIG: &str = "PLUGREST_AUTH_CONFIG";

/// How long to wait for a dead child's stderr to drain
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll interval while waiting for a signalled process to exit
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Wait after SIGKILL before giving up on reaping
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Lifecycle state of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Inside the startup grace window
    Starting,
    Running,
    /// Termination signals sent
    Stopping,
    NotRunning,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("app '{0}' is not running")]
    NotRunning(String),
    #[error("failed to spawn '{app}' with {program}: {source}")]
    Spawn {
        app: String,
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("app '{app}' exited during startup (exit code {code:?}): {stderr}")]
    ExitedEarly {
        app: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to check '{app}': {source}")]
    Wait {
        app: String,
        #[source]
        source: std::io::Error,
    },
}

/// Settings shared by every spawned app
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Interpreter used when an app has no environment
    pub interpreter: String,
    pub runner_args: Vec<String>,
    pub spawn_grace: Duration,
    pub main_port: u16,
    pub base_path: String,
    pub auth_config: PathBuf,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interpreter: config.environment.interpreter.clone(),
            runner_args: config.supervisor.runner_args.clone(),
            spawn_grace: config.supervisor.spawn_grace(),
            main_port: config.server.port,
            base_path: config.server.base_path.clone(),
            auth_config: config.auth_config_path(),
        }
    }
}

/// A tracked isolated app process
struct SupervisedProcess {
    child: Child,
    pid: u32,
    app_path: PathBuf,
    port: u16,
    environment_path: Option<PathBuf>,
    started_at: DateTime<Utc>,
    state: ProcessState,
}

impl SupervisedProcess {
    /// Exit code if the process has exited, `Some(None)` for signal deaths
    fn exit(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.code()),
            Ok(None) => None,
            Err(_) => Some(None),
        }
    }

    fn status(&mut self, app_name: &str) -> ProcessStatus {
        let exit = self.exit();
        let is_running = exit.is_none();
        ProcessStatus {
            app_name: app_name.to_string(),
            pid: self.pid,
            port: self.port,
            state: if is_running { self.state } else { ProcessState::NotRunning },
            is_running,
            exit_code: exit.flatten(),
            child_pids: if is_running { descendant_pids(self.pid) } else { Vec::new() },
            app_path: self.app_path.clone(),
            environment_path: self.environment_path.clone(),
            started_at: self.started_at,
            uptime_secs: (Utc::now() - self.started_at).num_seconds().max(0),
        }
    }
}

/// Point-in-time view of a supervised process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub app_name: String,
    pub pid: u32,
    pub port: u16,
    pub state: ProcessState,
    pub is_running: bool,
    pub exit_code: Option<i32>,
    /// Descendants of the main process (forked workers)
    pub child_pids: Vec<u32>,
    pub app_path: PathBuf,
    pub environment_path: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

/// Spawns isolated apps in their own process group and tears whole groups down.
///
/// `Supervisor` is shared behind an `Arc`; [`new`](Supervisor::new) returns
/// `Arc<Self>` directly. Entries are keyed by app name and exist only while a
/// process is (or recently was) alive; dead entries are purged lazily.
///
/// Concurrent lifecycle calls for the same app are not serialized here.
pub struct Supervisor {
    processes: DashMap<String, Mutex<SupervisedProcess>>,
    settings: SupervisorSettings,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Arc<Self> {
        Arc::new(Self {
            processes: DashMap::new(),
            settings,
        })
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.settings
    }

    /// Start `app` unless a live process already exists for it.
    ///
    /// The process must survive the startup grace window; if it exits early
    /// its stderr is returned in the error.
    pub async fn spawn(
        &self,
        app: &str,
        app_dir: &Path,
        port: u16,
        env_path: Option<&Path>,
    ) -> Result<ProcessStatus, SupervisorError> {
        if let Some(status) = self.status(app) {
            debug!(app, pid = status.pid, "App already running");
            return Ok(status);
        }

        let env_path = env_path.filter(|p| environment::is_valid(p));
        let program = match env_path {
            Some(env) => environment::python_path(env),
            None => PathBuf::from(&self.settings.interpreter),
        };

        let mut cmd = Command::new(&program);
        cmd.args(&self.settings.runner_args)
            .current_dir(app_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .env(ENV_APP_NAME, app)
            .env(ENV_APP_PATH, app_dir)
            .env(ENV_APP_PORT, port.to_string())
            .env(ENV_MAIN_PORT, self.settings.main_port.to_string())
            .env(ENV_BASE_PATH, &self.settings.base_path)
            .env(ENV_AUTH_CONFIG, &self.settings.auth_config);

        if let Some(env) = env_path {
            let bin = env.join("bin");
            let path = match std::env::var_os("PATH") {
                Some(existing) => {
                    let mut paths = vec![bin];
                    paths.extend(std::env::split_paths(&existing));
                    std::env::join_paths(paths).unwrap_or(existing)
                }
                None => bin.into_os_string(),
            };
            cmd.env("VIRTUAL_ENV", env).env("PATH", path);
        }

        // Own process group so forked workers can be signalled together
        #[cfg(unix)]
        cmd.process_group(0);

        info!(app, program = %program.display(), port, "Spawning isolated app");

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            app: app.to_string(),
            program: program.display().to_string(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);
        let stderr = child.stderr.take();

        self.processes.insert(
            app.to_string(),
            Mutex::new(SupervisedProcess {
                child,
                pid,
                app_path: app_dir.to_path_buf(),
                port,
                environment_path: env_path.map(Path::to_path_buf),
                started_at: Utc::now(),
                state: ProcessState::Starting,
            }),
        );

        tokio::time::sleep(self.settings.spawn_grace).await;

        let checked = self.processes.get(app).map(|entry| {
            let mut guard = entry.lock();
            let checked = guard.child.try_wait().map(|exit| match exit {
                Some(status) => Err(status.code()),
                None => {
                    // a concurrent stop may already have moved it on
                    if guard.state == ProcessState::Starting {
                        guard.state = ProcessState::Running;
                    }
                    Ok(guard.status(app))
                }
            });
            checked
        });

        match checked {
            None => {
                warn!(app, pid, "App was stopped during startup");
                Err(SupervisorError::NotRunning(app.to_string()))
            }
            Some(Err(source)) => {
                self.processes.remove(app);
                signal_group(pid, Signal::Kill);
                Err(SupervisorError::Wait {
                    app: app.to_string(),
                    source,
                })
            }
            Some(Ok(Err(code))) => {
                self.processes.remove(app);
                // leftover forks would otherwise keep the pipe open
                signal_group(pid, Signal::Kill);
                let stderr = drain_stderr(stderr).await;
                error!(app, code = ?code, stderr = %stderr, "Isolated app exited during startup");
                Err(SupervisorError::ExitedEarly {
                    app: app.to_string(),
                    code,
                    stderr,
                })
            }
            Some(Ok(Ok(status))) => {
                if let Some(stderr) = stderr {
                    forward_stderr(app.to_string(), stderr);
                }
                info!(app, pid, port, "Isolated app running");
                Ok(status)
            }
        }
    }

    /// Stop an app's whole process group.
    ///
    /// 1. SIGTERM to the group
    /// 2. Wait up to `timeout` for the main process
    /// 3. SIGKILL to the group, then any recorded descendants still alive
    ///
    /// Returns `Ok(true)` once the app is gone, including when it had already exited.
    pub async fn stop(&self, app: &str, timeout: Duration) -> Result<bool, SupervisorError> {
        let (pid, descendants, already_exited) = {
            let Some(entry) = self.processes.get(app) else {
                return Err(SupervisorError::NotRunning(app.to_string()));
            };
            let mut guard = entry.lock();
            let exited = guard.exit().is_some();
            guard.state = ProcessState::Stopping;
            let descendants = if exited { Vec::new() } else { descendant_pids(guard.pid) };
            (guard.pid, descendants, exited)
        };

        if already_exited {
            debug!(app, pid, "App had already exited, purging entry");
            self.processes.remove(app);
            signal_group(pid, Signal::Kill);
            return Ok(true);
        }

        info!(app, pid, children = descendants.len(), "Sending SIGTERM to process group");
        signal_group(pid, Signal::Term);

        // The entry stays visible as `Stopping` until the main process is gone
        if self.wait_for_exit(app, timeout).await {
            info!(app, pid, "Isolated app exited");
        } else {
            warn!(app, timeout_secs = timeout.as_secs_f64(), "Stop timeout exceeded, sending SIGKILL");
            signal_group(pid, Signal::Kill);
            if !self.wait_for_exit(app, KILL_WAIT).await {
                error!(app, pid, "Isolated app survived SIGKILL");
            }
        }
        self.processes.remove(app);

        // members that ignored SIGTERM
        signal_group(pid, Signal::Kill);

        for child_pid in descendants {
            if pid_alive(child_pid) {
                warn!(app, pid = child_pid, "Killing straggler process");
                signal_pid(child_pid, Signal::Kill);
            }
        }

        Ok(true)
    }

    /// Poll until the main process of `app` has exited (and is reaped) or `timeout` passes
    async fn wait_for_exit(&self, app: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let exited = match self.processes.get(app) {
                Some(entry) => entry.lock().exit().is_some(),
                None => true,
            };
            if exited {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }

    /// Stop every tracked app
    pub async fn shutdown_all(&self, timeout: Duration) {
        let apps: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        for app in apps {
            if let Err(e) = self.stop(&app, timeout).await {
                debug!(app = %app, error = %e, "Stop during shutdown failed");
            }
        }
    }

    /// Status of a live app. Dead entries are purged and reported as `None`.
    ///
    /// Entries still inside the startup grace window are left for `spawn` to
    /// clean up, since it reports their exit code and stderr.
    pub fn status(&self, app: &str) -> Option<ProcessStatus> {
        let (status, starting) = {
            let entry = self.processes.get(app)?;
            let mut guard = entry.lock();
            let starting = guard.state == ProcessState::Starting;
            (guard.status(app), starting)
        };
        if status.is_running {
            Some(status)
        } else if starting {
            None
        } else {
            info!(app, exit_code = ?status.exit_code, "Isolated app no longer running, purging");
            self.processes.remove(app);
            None
        }
    }

    pub fn is_running(&self, app: &str) -> bool {
        self.status(app).is_some()
    }

    /// Status of every live app, sorted by name, after purging dead entries
    pub fn all_statuses(&self) -> Vec<ProcessStatus> {
        let names: Vec<String> = self.processes.iter().map(|e| e.key().clone()).collect();
        let mut statuses: Vec<ProcessStatus> =
            names.iter().filter_map(|name| self.status(name)).collect();
        statuses.sort_by(|a, b| a.app_name.cmp(&b.app_name));
        statuses
    }

    pub fn running_count(&self) -> usize {
        self.all_statuses().len()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        for entry in self.processes.iter() {
            let mut guard = entry.value().lock();
            if guard.exit().is_none() {
                warn!(app = %entry.key(), pid = guard.pid, "Killing isolated app left running");
                signal_group(guard.pid, Signal::Kill);
            }
        }
    }
}

async fn drain_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, stderr.read_to_end(&mut buf)).await;
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn forward_stderr(app: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(app = %app, "{}", line);
        }
        debug!(app = %app, "stderr closed");
    });
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: Signal) {
    if pgid == 0 {
        return;
    }
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(-(pgid as i32), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: Signal) {
    signal_pid(pid, signal);
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: Signal) {
    if pid == 0 {
        return;
    }
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    unsafe {
        libc::kill(pid as i32, sig);
    }
}

#[cfg(not(unix))]
fn signal_pid(_pid: u32, _signal: Signal) {}

/// Whether `pid` names a live, non-zombie process
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || unsafe { libc::kill(pid as i32, 0) } != 0 {
        return false;
    }
    !matches!(proc_stat(pid), Some((_, 'Z')))
}

#[cfg(not(unix))]
pub fn pid_alive(_pid: u32) -> bool {
    false
}

/// `(ppid, state)` from /proc/<pid>/stat. The command name may contain spaces
/// and parentheses, so fields are read after the last ')'.
#[cfg(target_os = "linux")]
fn proc_stat(pid: u32) -> Option<(u32, char)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&stat)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn proc_stat(_pid: u32) -> Option<(u32, char)> {
    None
}

#[cfg(unix)]
fn parse_stat(stat: &str) -> Option<(u32, char)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((ppid, state))
}

/// All live descendants of `pid`, found by walking parent links in /proc
#[cfg(target_os = "linux")]
pub fn descendant_pids(pid: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let table: Vec<(u32, u32)> = entries
        .filter_map(Result::ok)
        .filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
        .filter_map(|p| {
            let (ppid, state) = proc_stat(p)?;
            (state != 'Z').then_some((p, ppid))
        })
        .collect();

    let mut found = Vec::new();
    let mut frontier = vec![pid];
    while let Some(parent) = frontier.pop() {
        for &(p, ppid) in &table {
            if ppid == parent && !found.contains(&p) {
                found.push(p);
                frontier.push(p);
            }
        }
    }
    found.sort_unstable();
    found
}

#[cfg(not(target_os = "linux"))]
pub fn descendant_pids(_pid: u32) -> Vec<u32> {
    Vec::new()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutil::{fake_interpreter, wait_until, write_app};
    use tempfile::TempDir;

    fn supervisor(interpreter: &Path) -> Arc<Supervisor> {
        Supervisor::new(SupervisorSettings {
            interpreter: interpreter.to_string_lossy().into_owned(),
            runner_args: vec!["run.sh".to_string()],
            spawn_grace: Duration::from_millis(300),
            main_port: 8000,
            base_path: "/pyrest".to_string(),
            auth_config: PathBuf::from("/etc/plugrest/auth_config.json"),
        })
    }

    #[test]
    fn test_parse_stat_handles_odd_names() {
        let stat = "1234 (my (weird) app) S 99 1234 1234 0 -1";
        assert_eq!(parse_stat(stat), Some((99, 'S')));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[tokio::test]
    async fn test_stop_unknown_app_is_not_running() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let err = sup.stop("ghost", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(tmp.path(), "worker", "sleep 30\n", None);

        let status = sup.spawn("worker", &app, 8101, None).await.unwrap();
        assert!(status.is_running);
        assert_eq!(status.state, ProcessState::Running);
        assert_eq!(status.port, 8101);
        assert!(pid_alive(status.pid));
        assert!(sup.is_running("worker"));

        assert!(sup.stop("worker", Duration::from_secs(2)).await.unwrap());
        assert!(sup.status("worker").is_none());
        assert!(wait_until(Duration::from_secs(2), || !pid_alive(status.pid)).await);
    }

    #[tokio::test]
    async fn test_spawn_twice_returns_existing() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(tmp.path(), "worker", "sleep 30\n", None);

        let first = sup.spawn("worker", &app, 8102, None).await.unwrap();
        let second = sup.spawn("worker", &app, 8102, None).await.unwrap();
        assert_eq!(first.pid, second.pid);

        sup.shutdown_all(Duration::from_secs(2)).await;
        assert_eq!(sup.running_count(), 0);
    }

    #[tokio::test]
    async fn test_early_exit_reports_stderr() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(
            tmp.path(),
            "crashy",
            "echo 'ModuleNotFoundError: No module named flask' >&2\nexit 3\n",
            None,
        );

        let err = sup.spawn("crashy", &app, 8103, None).await.unwrap_err();
        match err {
            SupervisorError::ExitedEarly { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("No module named flask"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(sup.status("crashy").is_none());
    }

    #[tokio::test]
    async fn test_child_receives_identity_env() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(tmp.path(), "envy", "env > env.out\nsleep 30\n", None);

        sup.spawn("envy", &app, 8104, None).await.unwrap();
        let env = std::fs::read_to_string(app.join("env.out")).unwrap();
        sup.stop("envy", Duration::from_secs(2)).await.unwrap();

        assert!(env.contains("PLUGREST_APP_NAME=envy"));
        assert!(env.contains("PLUGREST_APP_PORT=8104"));
        assert!(env.contains("PLUGREST_MAIN_PORT=8000"));
        assert!(env.contains("PLUGREST_BASE_PATH=/pyrest"));
        assert!(env.contains("PLUGREST_AUTH_CONFIG=/etc/plugrest/auth_config.json"));
        assert!(env.contains(&format!("PLUGREST_APP_PATH={}", app.display())));
    }

    #[tokio::test]
    async fn test_stop_kills_forked_workers() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(
            tmp.path(),
            "forky",
            "sleep 30 &\necho $! > worker.pid\nsleep 30 &\nwait\n",
            None,
        );

        let status = sup.spawn("forky", &app, 8105, None).await.unwrap();
        let worker: u32 = std::fs::read_to_string(app.join("worker.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid_alive(worker));
        #[cfg(target_os = "linux")]
        assert!(sup.status("forky").unwrap().child_pids.contains(&worker));

        sup.stop("forky", Duration::from_secs(2)).await.unwrap();
        assert!(wait_until(Duration::from_secs(2), || !pid_alive(worker)).await);
        assert!(wait_until(Duration::from_secs(2), || !pid_alive(status.pid)).await);
    }

    #[tokio::test]
    async fn test_state_is_starting_during_grace_window() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(tmp.path(), "slow", "sleep 30\n", None);

        let spawner = {
            let sup = Arc::clone(&sup);
            let app = app.clone();
            tokio::spawn(async move { sup.spawn("slow", &app, 8109, None).await })
        };
        assert!(
            wait_until(Duration::from_secs(2), || {
                sup.status("slow").map(|s| s.state) == Some(ProcessState::Starting)
            })
            .await
        );

        let status = spawner.await.unwrap().unwrap();
        assert_eq!(status.state, ProcessState::Running);
        assert_eq!(sup.status("slow").unwrap().state, ProcessState::Running);

        sup.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_state_is_stopping_until_exit() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(
            tmp.path(),
            "lingering",
            "trap '' TERM\nwhile true; do sleep 1; done\n",
            None,
        );
        let pid = sup.spawn("lingering", &app, 8110, None).await.unwrap().pid;

        let stopper = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move { sup.stop("lingering", Duration::from_millis(800)).await })
        };
        assert!(
            wait_until(Duration::from_secs(1), || {
                sup.status("lingering").map(|s| s.state) == Some(ProcessState::Stopping)
            })
            .await
        );

        assert!(stopper.await.unwrap().unwrap());
        assert!(sup.status("lingering").is_none());
        assert!(wait_until(Duration::from_secs(2), || !pid_alive(pid)).await);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(
            tmp.path(),
            "stubborn",
            "trap '' TERM\nwhile true; do sleep 1; done\n",
            None,
        );

        let status = sup.spawn("stubborn", &app, 8106, None).await.unwrap();
        let started = std::time::Instant::now();
        sup.stop("stubborn", Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(wait_until(Duration::from_secs(2), || !pid_alive(status.pid)).await);
    }

    #[tokio::test]
    async fn test_dead_entries_are_purged() {
        let tmp = TempDir::new().unwrap();
        let sup = supervisor(&fake_interpreter(tmp.path()));
        let app = write_app(tmp.path(), "brief", "sleep 1\n", None);

        sup.spawn("brief", &app, 8107, None).await.unwrap();
        assert!(wait_until(Duration::from_secs(5), || sup.all_statuses().is_empty()).await);
        assert!(matches!(
            sup.stop("brief", Duration::from_secs(1)).await,
            Err(SupervisorError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_uses_environment_interpreter() {
        let tmp = TempDir::new().unwrap();
        let python = fake_interpreter(tmp.path());
        let app = write_app(tmp.path(), "venvy", "env > env.out\nsleep 30\n", Some("requests\n"));
        let env = crate::environment::EnvironmentManager::with_installer(
            crate::config::EnvironmentConfig {
                interpreter: python.to_string_lossy().into_owned(),
                ..Default::default()
            },
            false,
        )
        .ensure(&app)
        .await
        .unwrap()
        .unwrap();

        let sup = supervisor(&tmp.path().join("missing-python"));
        let status = sup.spawn("venvy", &app, 8108, Some(&env)).await.unwrap();
        assert_eq!(status.environment_path.as_deref(), Some(env.as_path()));

        let out = std::fs::read_to_string(app.join("env.out")).unwrap();
        sup.stop("venvy", Duration::from_secs(2)).await.unwrap();
        assert!(out.contains(&format!("VIRTUAL_ENV={}", env.display())));
        assert!(out.contains(&format!("PATH={}", env.join("bin").display())));
    }
}
