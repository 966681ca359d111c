//! Per-app dependency environments
//!
//! An isolated app gets its own interpreter environment inside its directory
//! (`<app>/.venv` by default), populated from its dependency file. Environments
//! are created lazily, re-installed on every ensure, and can be removed and
//! rebuilt from the admin API.

use crate::config::{EnvironmentConfig, InstallerKind};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to create environment at {path}: {stderr}")]
    Create { path: PathBuf, stderr: String },
    #[error("failed to install {requirements}: {stderr}")]
    Install { requirements: PathBuf, stderr: String },
    #[error("no dependency file at {0}")]
    MissingRequirements(PathBuf),
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// On-disk state of an app's environment
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentInfo {
    pub path: PathBuf,
    pub exists: bool,
    pub is_valid: bool,
    pub size_bytes: u64,
    pub has_requirements: bool,
}

/// Interpreter inside an environment
pub fn python_path(env_path: &Path) -> PathBuf {
    env_path.join("bin").join("python")
}

/// Installer inside an environment
pub fn pip_path(env_path: &Path) -> PathBuf {
    env_path.join("bin").join("pip")
}

/// An environment is usable when its interpreter exists and is executable
pub fn is_valid(env_path: &Path) -> bool {
    is_executable(&python_path(env_path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;

    if !path.is_file() {
        return false;
    }
    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::X_OK) == 0 }
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|entry| match entry.file_type() {
            Ok(ft) if ft.is_dir() => dir_size(&entry.path()),
            Ok(ft) if ft.is_file() => entry.metadata().map(|m| m.len()).unwrap_or(0),
            _ => 0,
        })
        .sum()
}

/// Creates, populates and removes app environments
pub struct EnvironmentManager {
    config: EnvironmentConfig,
    use_uv: bool,
}

impl EnvironmentManager {
    /// Build a manager, probing for `uv` when the installer is `auto`
    pub async fn new(config: EnvironmentConfig) -> Self {
        let use_uv = match config.installer {
            InstallerKind::Uv => true,
            InstallerKind::Pip => false,
            InstallerKind::Auto => detect_uv().await,
        };
        info!(installer = if use_uv { "uv" } else { "pip" }, "Environment installer selected");
        Self { config, use_uv }
    }

    /// Build a manager with an explicit installer choice
    pub fn with_installer(config: EnvironmentConfig, use_uv: bool) -> Self {
        Self { config, use_uv }
    }

    pub fn uses_uv(&self) -> bool {
        self.use_uv
    }

    pub fn env_path(&self, app_dir: &Path) -> PathBuf {
        app_dir.join(&self.config.dir_name)
    }

    pub fn requirements_path(&self, app_dir: &Path) -> PathBuf {
        app_dir.join(&self.config.dependency_file)
    }

    pub fn has_requirements(&self, app_dir: &Path) -> bool {
        self.requirements_path(app_dir).is_file()
    }

    /// Make sure the app's environment exists and its dependencies are installed.
    ///
    /// Returns `None` when the app has no dependency file. An existing valid
    /// environment is reused but installation always runs.
    pub async fn ensure(&self, app_dir: &Path) -> Result<Option<PathBuf>, ProvisionError> {
        if !self.has_requirements(app_dir) {
            debug!(app_dir = %app_dir.display(), "No dependency file, no environment needed");
            return Ok(None);
        }

        let env_path = self.env_path(app_dir);
        if is_valid(&env_path) {
            debug!(path = %env_path.display(), "Environment already valid");
        } else {
            self.create(app_dir).await?;
        }

        self.install(app_dir, &env_path).await?;
        Ok(Some(env_path))
    }

    /// Create a fresh environment, replacing any invalid directory at the target.
    ///
    /// A failed creation never leaves a partial directory behind.
    pub async fn create(&self, app_dir: &Path) -> Result<PathBuf, ProvisionError> {
        let env_path = self.env_path(app_dir);

        if env_path.exists() && !is_valid(&env_path) {
            warn!(path = %env_path.display(), "Invalid environment found, removing");
            self.remove(&env_path).await?;
        }

        info!(path = %env_path.display(), uv = self.use_uv, "Creating environment");

        let env_arg = env_path.to_string_lossy().into_owned();
        let result = if self.use_uv {
            self.run("uv", &["venv", &env_arg, "--python", &self.config.interpreter], app_dir)
                .await
        } else {
            self.run(&self.config.interpreter, &["-m", "venv", &env_arg], app_dir)
                .await
        };

        let failure = match result {
            Ok(output) if output.success && is_valid(&env_path) => {
                info!(path = %env_path.display(), "Environment created");
                return Ok(env_path);
            }
            Ok(output) => ProvisionError::Create {
                path: env_path.clone(),
                stderr: non_empty(output.stderr, "interpreter missing after creation"),
            },
            Err(e) => e,
        };

        error!(path = %env_path.display(), error = %failure, "Environment creation failed");
        if env_path.exists() {
            if let Err(e) = self.remove(&env_path).await {
                warn!(path = %env_path.display(), error = %e, "Failed to clean up partial environment");
            }
        }
        Err(failure)
    }

    /// Install the app's dependency file into `env_path`
    pub async fn install(&self, app_dir: &Path, env_path: &Path) -> Result<(), ProvisionError> {
        let requirements = self.requirements_path(app_dir);
        if !requirements.is_file() {
            return Err(ProvisionError::MissingRequirements(requirements));
        }
        let req_arg = requirements.to_string_lossy().into_owned();

        info!(
            requirements = %requirements.display(),
            env = %env_path.display(),
            installer = if self.use_uv { "uv" } else { "pip" },
            "Installing dependencies"
        );

        let output = if self.use_uv {
            let python = python_path(env_path).to_string_lossy().into_owned();
            self.run("uv", &["pip", "install", "--python", &python, "-r", &req_arg], app_dir)
                .await?
        } else {
            let pip = pip_path(env_path).to_string_lossy().into_owned();
            if self.config.upgrade_pip {
                match self.run(&pip, &["install", "--upgrade", "pip"], app_dir).await {
                    Ok(out) if out.success => debug!("pip upgraded"),
                    Ok(out) => warn!(stderr = %out.stderr.trim(), "pip upgrade failed"),
                    Err(e) => warn!(error = %e, "pip upgrade failed"),
                }
            }
            self.run(&pip, &["install", "-r", &req_arg], app_dir).await?
        };

        if !output.success {
            error!(requirements = %requirements.display(), stderr = %output.stderr.trim(), "Dependency installation failed");
            return Err(ProvisionError::Install {
                requirements,
                stderr: non_empty(output.stderr, "installer exited with an error"),
            });
        }

        info!(env = %env_path.display(), "Dependencies installed");
        Ok(())
    }

    /// Delete an environment tree. Returns false if there was nothing to delete.
    pub async fn remove(&self, env_path: &Path) -> Result<bool, ProvisionError> {
        if !env_path.exists() {
            return Ok(false);
        }
        let path = env_path.to_path_buf();
        let result = tokio::task::spawn_blocking({
            let path = path.clone();
            move || std::fs::remove_dir_all(&path)
        })
        .await
        .unwrap_or_else(|e| Err(std::io::Error::other(e)));

        match result {
            Ok(()) => {
                info!(path = %path.display(), "Environment removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ProvisionError::Remove { path, source }),
        }
    }

    /// Describe the app's environment without changing anything
    pub async fn inspect(&self, app_dir: &Path) -> EnvironmentInfo {
        let path = self.env_path(app_dir);
        let has_requirements = self.has_requirements(app_dir);
        tokio::task::spawn_blocking(move || {
            let exists = path.exists();
            EnvironmentInfo {
                exists,
                is_valid: exists && is_valid(&path),
                size_bytes: if exists { dir_size(&path) } else { 0 },
                has_requirements,
                path,
            }
        })
        .await
        .unwrap_or_else(|e| {
            warn!(error = %e, "Environment inspection task failed");
            EnvironmentInfo {
                path: self.env_path(app_dir),
                exists: false,
                is_valid: false,
                size_bytes: 0,
                has_requirements,
            }
        })
    }

    async fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput, ProvisionError> {
        debug!(program, ?args, "Running provisioning command");
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .envs(&self.config.installer_env)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(program, stdout = %stdout.trim(), "Command output");
        }

        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

struct CommandOutput {
    success: bool,
    stderr: String,
}

fn non_empty(stderr: String, fallback: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

async fn detect_uv() -> bool {
    match Command::new("uv")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
    {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}
