//! Lifecycle actions on isolated apps
//!
//! Each action is an ordered workflow over the environment manager and the
//! supervisor. A failing step halts the workflow and the error reports which
//! steps had already completed. Nothing is rolled back.

use crate::environment::EnvironmentManager;
use crate::manifest::AppDescriptor;
use crate::registry::{FailureKind, Registry};
use crate::supervisor::{Supervisor, SupervisorError};
use serde::Serialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Start,
    Stop,
    Restart,
    ClearEnvironment,
    CreateEnvironment,
    RebuildEnvironment,
    InspectProcesses,
    InspectEnvironment,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Restart => "restart",
            Action::ClearEnvironment => "clear-environment",
            Action::CreateEnvironment => "create-environment",
            Action::RebuildEnvironment => "rebuild-environment",
            Action::InspectProcesses => "inspect-processes",
            Action::InspectEnvironment => "inspect-environment",
        }
    }
}

impl FromStr for Action {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Action::Start),
            "stop" => Ok(Action::Stop),
            "restart" => Ok(Action::Restart),
            "clear-environment" | "clear-venv" => Ok(Action::ClearEnvironment),
            "create-environment" | "create-venv" => Ok(Action::CreateEnvironment),
            "rebuild-environment" | "rebuild-venv" => Ok(Action::RebuildEnvironment),
            "inspect-processes" | "processes" => Ok(Action::InspectProcesses),
            "inspect-environment" | "environment" => Ok(Action::InspectEnvironment),
            other => Err(ControlError::UnknownAction(other.to_string())),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Stopped,
    VenvCleared,
    VenvCreated,
    DepsInstalled,
    Started,
}

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("isolated app '{0}' not found")]
    NotFound(String),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("app '{0}' is not running")]
    NotRunning(String),
    #[error("{action} failed for '{app}' after {steps:?}: {reason}")]
    Failed {
        app: String,
        action: Action,
        steps: Vec<Step>,
        reason: String,
    },
}

/// Result of a successful action
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub app: String,
    pub action: Action,
    pub steps: Vec<Step>,
    pub details: serde_json::Value,
}

/// Tracks progress of one workflow so failures can report completed steps
struct Workflow<'a> {
    app: &'a str,
    action: Action,
    steps: Vec<Step>,
}

impl<'a> Workflow<'a> {
    fn new(app: &'a str, action: Action) -> Self {
        Self {
            app,
            action,
            steps: Vec::new(),
        }
    }

    fn done(&mut self, step: Step) {
        info!(app = self.app, action = %self.action, step = ?step, "Step complete");
        self.steps.push(step);
    }

    fn fail(self, reason: impl std::fmt::Display) -> ControlError {
        let reason = reason.to_string();
        error!(app = self.app, action = %self.action, steps = ?self.steps, reason = %reason, "Action failed");
        ControlError::Failed {
            app: self.app.to_string(),
            action: self.action,
            steps: self.steps,
            reason,
        }
    }

    fn finish(self, details: serde_json::Value) -> ActionOutcome {
        ActionOutcome {
            app: self.app.to_string(),
            action: self.action,
            steps: self.steps,
            details,
        }
    }
}

/// Drives lifecycle actions for isolated apps
pub struct ControlPlane {
    registry: Arc<Registry>,
    environments: Arc<EnvironmentManager>,
    supervisor: Arc<Supervisor>,
    stop_timeout: Duration,
}

impl ControlPlane {
    pub fn new(
        registry: Arc<Registry>,
        environments: Arc<EnvironmentManager>,
        supervisor: Arc<Supervisor>,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            environments,
            supervisor,
            stop_timeout,
        }
    }

    /// Run `action` (by name) on the isolated app `app`
    pub async fn execute(&self, app: &str, action: &str) -> Result<ActionOutcome, ControlError> {
        let descriptor = self
            .registry
            .isolated_app(app)
            .ok_or_else(|| ControlError::NotFound(app.to_string()))?;
        let action: Action = action.parse()?;

        info!(app, action = %action, "Executing admin action");

        match action {
            Action::Start => self.start(&descriptor).await,
            Action::Stop => self.stop(&descriptor).await,
            Action::Restart => self.restart(&descriptor).await,
            Action::ClearEnvironment => self.clear_environment(&descriptor).await,
            Action::CreateEnvironment => self.create_environment(&descriptor).await,
            Action::RebuildEnvironment => self.rebuild_environment(&descriptor).await,
            Action::InspectProcesses => Ok(self.inspect_processes(&descriptor)),
            Action::InspectEnvironment => Ok(self.inspect_environment(&descriptor).await),
        }
    }

    fn port_of(app: &AppDescriptor) -> u16 {
        app.port.unwrap_or_default()
    }

    async fn start(&self, app: &AppDescriptor) -> Result<ActionOutcome, ControlError> {
        let mut flow = Workflow::new(&app.name, Action::Start);
        if let Err(reason) = self.start_steps(app, &mut flow).await {
            return Err(flow.fail(reason));
        }
        Ok(self.finish_with_status(flow, app))
    }

    /// ensure-environment then spawn; spawn is skipped if provisioning fails
    async fn start_steps(&self, app: &AppDescriptor, flow: &mut Workflow<'_>) -> Result<(), String> {
        let env = self
            .environments
            .ensure(&app.directory)
            .await
            .map_err(|e| format!("environment setup failed: {}", e))?;
        if env.is_some() {
            flow.done(Step::DepsInstalled);
        }

        self.supervisor
            .spawn(&app.name, &app.directory, Self::port_of(app), env.as_deref())
            .await
            .map_err(|e| e.to_string())?;
        flow.done(Step::Started);
        Ok(())
    }

    async fn stop(&self, app: &AppDescriptor) -> Result<ActionOutcome, ControlError> {
        let mut flow = Workflow::new(&app.name, Action::Stop);
        let status = self
            .supervisor
            .status(&app.name)
            .ok_or_else(|| ControlError::NotRunning(app.name.clone()))?;

        let mut killed = vec![status.pid];
        killed.extend(status.child_pids.iter().copied());

        match self.supervisor.stop(&app.name, self.stop_timeout).await {
            Ok(_) => flow.done(Step::Stopped),
            Err(SupervisorError::NotRunning(name)) => return Err(ControlError::NotRunning(name)),
            Err(e) => return Err(flow.fail(e)),
        }

        Ok(flow.finish(json!({ "killed_pids": killed })))
    }

    async fn restart(&self, app: &AppDescriptor) -> Result<ActionOutcome, ControlError> {
        let mut flow = Workflow::new(&app.name, Action::Restart);

        match self.supervisor.stop(&app.name, self.stop_timeout).await {
            Ok(_) => flow.done(Step::Stopped),
            Err(SupervisorError::NotRunning(_)) => {}
            Err(e) => return Err(flow.fail(e)),
        }

        if let Err(reason) = self.start_steps(app, &mut flow).await {
            return Err(flow.fail(reason));
        }
        Ok(self.finish_with_status(flow, app))
    }

    async fn stop_if_running(&self, app: &AppDescriptor, flow: &mut Workflow<'_>) -> Result<(), String> {
        if !self.supervisor.is_running(&app.name) {
            return Ok(());
        }
        match self.supervisor.stop(&app.name, self.stop_timeout).await {
            Ok(_) => {
                flow.done(Step::Stopped);
                Ok(())
            }
            Err(SupervisorError::NotRunning(_)) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn clear_environment(&self, app: &AppDescriptor) -> Result<ActionOutcome, ControlError> {
        let mut flow = Workflow::new(&app.name, Action::ClearEnvironment);

        if let Err(reason) = self.stop_if_running(app, &mut flow).await {
            return Err(flow.fail(reason));
        }

        let env_path = self.environments.env_path(&app.directory);
        let removed = match self.environments.remove(&env_path).await {
            Ok(removed) => removed,
            Err(e) => return Err(flow.fail(e)),
        };
        flow.done(Step::VenvCleared);

        Ok(flow.finish(json!({ "path": env_path, "removed": removed })))
    }

    async fn create_environment(&self, app: &AppDescriptor) -> Result<ActionOutcome, ControlError> {
        let mut flow = Workflow::new(&app.name, Action::CreateEnvironment);
        let info = self.environments.inspect(&app.directory).await;

        if info.exists && info.is_valid {
            return Ok(flow.finish(json!({ "path": info.path, "created": false })));
        }
        if !info.has_requirements {
            return Ok(flow.finish(json!({
                "path": info.path,
                "created": false,
                "reason": "no dependency file",
            })));
        }

        match self.environments.create(&app.directory).await {
            Ok(_) => flow.done(Step::VenvCreated),
            Err(e) => return Err(flow.fail(e)),
        }
        match self.environments.install(&app.directory, &info.path).await {
            Ok(()) => flow.done(Step::DepsInstalled),
            Err(e) => return Err(flow.fail(e)),
        }

        Ok(flow.finish(json!({ "path": info.path, "created": true })))
    }

    async fn rebuild_environment(&self, app: &AppDescriptor) -> Result<ActionOutcome, ControlError> {
        let mut flow = Workflow::new(&app.name, Action::RebuildEnvironment);

        if let Err(reason) = self.stop_if_running(app, &mut flow).await {
            return Err(flow.fail(reason));
        }

        let env_path = self.environments.env_path(&app.directory);
        if let Err(e) = self.environments.remove(&env_path).await {
            return Err(flow.fail(e));
        }
        flow.done(Step::VenvCleared);

        if let Err(e) = self.environments.create(&app.directory).await {
            return Err(flow.fail(e));
        }
        flow.done(Step::VenvCreated);

        if let Err(e) = self.environments.install(&app.directory, &env_path).await {
            return Err(flow.fail(e));
        }
        flow.done(Step::DepsInstalled);

        if let Err(e) = self
            .supervisor
            .spawn(&app.name, &app.directory, Self::port_of(app), Some(&env_path))
            .await
        {
            return Err(flow.fail(e));
        }
        flow.done(Step::Started);

        Ok(self.finish_with_status(flow, app))
    }

    fn inspect_processes(&self, app: &AppDescriptor) -> ActionOutcome {
        let flow = Workflow::new(&app.name, Action::InspectProcesses);
        self.finish_with_status(flow, app)
    }

    async fn inspect_environment(&self, app: &AppDescriptor) -> ActionOutcome {
        let flow = Workflow::new(&app.name, Action::InspectEnvironment);
        let info = self.environments.inspect(&app.directory).await;
        flow.finish(json!(info))
    }

    fn finish_with_status(&self, flow: Workflow<'_>, app: &AppDescriptor) -> ActionOutcome {
        let details = match self.supervisor.status(&app.name) {
            Some(status) => json!({ "running": true, "port": app.port, "process": status }),
            None => json!({ "running": false, "port": app.port }),
        };
        flow.finish(details)
    }

    /// Provision and spawn every isolated app in the registry.
    ///
    /// Apps that fail are moved to the failed list; the rest keep starting.
    pub async fn start_all_isolated(&self) -> usize {
        let mut started = 0;
        for app in self.registry.isolated() {
            let env = match self.environments.ensure(&app.directory).await {
                Ok(env) => env,
                Err(e) => {
                    self.registry
                        .mark_failed(&app.name, FailureKind::ProvisionError, e.to_string());
                    continue;
                }
            };

            match self
                .supervisor
                .spawn(&app.name, &app.directory, Self::port_of(&app), env.as_deref())
                .await
            {
                Ok(status) => {
                    info!(app = %app.name, pid = status.pid, port = status.port, "Isolated app started");
                    started += 1;
                }
                Err(e) => {
                    warn!(app = %app.name, error = %e, "Isolated app failed to start");
                    self.registry
                        .mark_failed(&app.name, FailureKind::UnexpectedError, e.to_string());
                }
            }
        }
        started
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::EnvironmentConfig;
    use crate::environment;
    use crate::ports::PortAllocator;
    use crate::registry::discover;
    use crate::supervisor::{pid_alive, SupervisorSettings};
    use crate::testutil::{fake_interpreter, wait_until, write_app};
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct Harness {
        _tmp: TempDir,
        apps: PathBuf,
        registry: Arc<Registry>,
        supervisor: Arc<Supervisor>,
        control: ControlPlane,
    }

    fn harness(setup: impl FnOnce(&Path)) -> Harness {
        let tmp = TempDir::new().unwrap();
        let python = fake_interpreter(tmp.path());
        let apps = tmp.path().join("apps");
        std::fs::create_dir_all(&apps).unwrap();
        setup(&apps);

        let registry = Arc::new(Registry::build(
            discover(&apps, "requirements.txt"),
            &PortAllocator::new(8201),
        ));
        let environments = Arc::new(EnvironmentManager::with_installer(
            EnvironmentConfig {
                interpreter: python.to_string_lossy().into_owned(),
                ..Default::default()
            },
            false,
        ));
        let supervisor = Supervisor::new(SupervisorSettings {
            interpreter: python.to_string_lossy().into_owned(),
            runner_args: vec!["run.sh".to_string()],
            spawn_grace: Duration::from_millis(300),
            main_port: 8000,
            base_path: "/pyrest".to_string(),
            auth_config: PathBuf::from("auth_config.json"),
        });
        let control = ControlPlane::new(
            Arc::clone(&registry),
            environments,
            Arc::clone(&supervisor),
            Duration::from_secs(2),
        );

        Harness {
            _tmp: tmp,
            apps,
            registry,
            supervisor,
            control,
        }
    }

    fn one_app(apps: &Path) {
        write_app(apps, "worker", "sleep 30\n", Some("requests\n"));
    }

    #[test]
    fn test_action_parsing() {
        assert_eq!("rebuild-environment".parse::<Action>().unwrap(), Action::RebuildEnvironment);
        assert_eq!("clear-venv".parse::<Action>().unwrap(), Action::ClearEnvironment);
        assert!(matches!("explode".parse::<Action>(), Err(ControlError::UnknownAction(_))));
        assert_eq!(Action::InspectProcesses.to_string(), "inspect-processes");
    }

    #[tokio::test]
    async fn test_unknown_app_and_action() {
        let h = harness(one_app);
        assert!(matches!(
            h.control.execute("ghost", "start").await,
            Err(ControlError::NotFound(_))
        ));
        assert!(matches!(
            h.control.execute("worker", "explode").await,
            Err(ControlError::UnknownAction(_))
        ));
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let h = harness(one_app);

        let started = h.control.execute("worker", "start").await.unwrap();
        assert_eq!(started.steps, vec![Step::DepsInstalled, Step::Started]);
        assert_eq!(started.details["running"], true);
        assert_eq!(started.details["port"], 8201);
        let pid = h.supervisor.status("worker").unwrap().pid;

        let stopped = h.control.execute("worker", "stop").await.unwrap();
        assert_eq!(stopped.steps, vec![Step::Stopped]);
        assert_eq!(stopped.details["killed_pids"][0], pid);
        assert!(wait_until(Duration::from_secs(2), || !pid_alive(pid)).await);

        assert!(matches!(
            h.control.execute("worker", "stop").await,
            Err(ControlError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let h = harness(one_app);

        // restart from cold just starts
        let cold = h.control.execute("worker", "restart").await.unwrap();
        assert_eq!(cold.steps, vec![Step::DepsInstalled, Step::Started]);
        let first = h.supervisor.status("worker").unwrap().pid;

        let warm = h.control.execute("worker", "restart").await.unwrap();
        assert_eq!(warm.steps, vec![Step::Stopped, Step::DepsInstalled, Step::Started]);
        let second = h.supervisor.status("worker").unwrap().pid;
        assert_ne!(first, second);

        h.supervisor.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_clear_environment_while_running() {
        let h = harness(one_app);
        h.control.execute("worker", "start").await.unwrap();
        let pid = h.supervisor.status("worker").unwrap().pid;
        let env = h.apps.join("worker/.venv");
        assert!(env.exists());

        let outcome = h.control.execute("worker", "clear-environment").await.unwrap();
        assert_eq!(outcome.steps, vec![Step::Stopped, Step::VenvCleared]);
        assert_eq!(outcome.details["removed"], true);
        assert!(!env.exists());
        assert!(h.supervisor.status("worker").is_none());
        assert!(wait_until(Duration::from_secs(2), || !pid_alive(pid)).await);
    }

    #[tokio::test]
    async fn test_create_environment_reports_created_once() {
        let h = harness(one_app);

        let first = h.control.execute("worker", "create-environment").await.unwrap();
        assert_eq!(first.details["created"], true);
        assert_eq!(first.steps, vec![Step::VenvCreated, Step::DepsInstalled]);

        let second = h.control.execute("worker", "create-environment").await.unwrap();
        assert_eq!(second.details["created"], false);
        assert!(second.steps.is_empty());
        assert!(h.supervisor.status("worker").is_none());
    }

    #[tokio::test]
    async fn test_rebuild_environment_full_cycle() {
        let h = harness(one_app);
        h.control.execute("worker", "start").await.unwrap();

        let outcome = h.control.execute("worker", "rebuild-environment").await.unwrap();
        assert_eq!(
            outcome.steps,
            vec![
                Step::Stopped,
                Step::VenvCleared,
                Step::VenvCreated,
                Step::DepsInstalled,
                Step::Started
            ]
        );
        assert!(h.supervisor.is_running("worker"));
        let env = h.apps.join("worker/.venv");
        assert!(environment::is_valid(&env));
        // fresh environment: exactly one install
        assert_eq!(crate::testutil::read_install_log(&env).len(), 1);

        h.supervisor.shutdown_all(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_rebuild_install_failure_reports_steps() {
        let h = harness(one_app);
        h.control.execute("worker", "start").await.unwrap();
        std::fs::write(h.apps.join("worker/requirements.txt"), "broken-package==9.9\n").unwrap();

        let err = h.control.execute("worker", "rebuild-environment").await.unwrap_err();
        match err {
            ControlError::Failed { steps, reason, action, .. } => {
                assert_eq!(action, Action::RebuildEnvironment);
                assert_eq!(steps, vec![Step::Stopped, Step::VenvCleared, Step::VenvCreated]);
                assert!(reason.contains("broken-package"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.supervisor.status("worker").is_none());
    }

    #[tokio::test]
    async fn test_inspect_actions_are_read_only() {
        let h = harness(one_app);

        let procs = h.control.execute("worker", "inspect-processes").await.unwrap();
        assert_eq!(procs.details["running"], false);
        let env = h.control.execute("worker", "inspect-environment").await.unwrap();
        assert_eq!(env.details["exists"], false);
        assert_eq!(env.details["has_requirements"], true);
        assert!(!h.apps.join("worker/.venv").exists());
    }

    #[tokio::test]
    async fn test_start_all_isolated_marks_failures() {
        let h = harness(|apps| {
            write_app(apps, "good", "sleep 30\n", Some("requests\n"));
            write_app(apps, "bad_deps", "sleep 30\n", Some("broken-package\n"));
            write_app(apps, "crashy", "exit 1\n", Some("requests\n"));
        });

        let started = h.control.start_all_isolated().await;
        assert_eq!(started, 1);

        let isolated: Vec<String> = h.registry.isolated().into_iter().map(|a| a.name).collect();
        assert_eq!(isolated, vec!["good"]);
        let failed = h.registry.failed();
        let kind_of = |name: &str| failed.iter().find(|f| f.name == name).unwrap().error_kind;
        assert_eq!(kind_of("bad_deps"), FailureKind::ProvisionError);
        assert_eq!(kind_of("crashy"), FailureKind::UnexpectedError);

        // failed apps are no longer addressable
        assert!(matches!(
            h.control.execute("crashy", "start").await,
            Err(ControlError::NotFound(_))
        ));

        h.supervisor.shutdown_all(Duration::from_secs(2)).await;
    }
}
