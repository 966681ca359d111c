//! App discovery and the live registry of embedded, isolated and failed apps

use crate::manifest::{AppDescriptor, AppManifest, Classification, ManifestError, MANIFEST_FILE};
use crate::ports::PortAllocator;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Why an app ended up in the failed list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ManifestInvalid,
    LoadError,
    NoHandlersExported,
    ProvisionError,
    UnexpectedError,
}

/// An app that could not be brought up. Stays in the list until restart.
#[derive(Debug, Clone, Serialize)]
pub struct FailedAppRecord {
    pub name: String,
    pub path: PathBuf,
    pub error_kind: FailureKind,
    pub message: String,
    pub was_isolated: bool,
    pub port: Option<u16>,
}

/// Outcome of one discovery pass
#[derive(Debug, Default)]
pub struct Discovery {
    /// Enabled apps, sorted by directory name
    pub apps: Vec<AppDescriptor>,
    pub failed: Vec<FailedAppRecord>,
}

impl Discovery {
    /// Keep only the app named `filter` (case-insensitive).
    ///
    /// When nothing matches, every app is dropped and the available names are logged.
    pub fn retain_only(&mut self, filter: &str) {
        let available: Vec<String> = self.apps.iter().map(|a| a.name.clone()).collect();
        self.apps.retain(|a| a.name.eq_ignore_ascii_case(filter));
        self.failed.retain(|f| f.name.eq_ignore_ascii_case(filter));
        if self.apps.is_empty() {
            error!(app = filter, available = ?available, "Requested app not found");
        } else {
            info!(app = filter, "Single-app mode");
        }
    }
}

/// Walk the immediate subdirectories of `root` and resolve every app found.
///
/// Directories starting with `_` or `.` are skipped, as are directories
/// without a manifest. Per-app problems are recorded and never abort the scan.
/// A missing root is created and yields an empty result.
pub fn discover(root: &Path, dependency_file: &str) -> Discovery {
    let mut discovery = Discovery::default();

    if !root.exists() {
        info!(path = %root.display(), "Apps folder missing, creating it");
        if let Err(e) = std::fs::create_dir_all(root) {
            error!(path = %root.display(), error = %e, "Failed to create apps folder");
        }
        return discovery;
    }

    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            error!(path = %root.display(), error = %e, "Failed to read apps folder");
            return discovery;
        }
    };

    let mut dirs: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry in apps folder");
                None
            }
        })
        .filter(|entry| entry.path().is_dir())
        .map(|entry| (entry.file_name().to_string_lossy().into_owned(), entry.path()))
        .collect();
    dirs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut seen = HashSet::new();

    for (dir_name, path) in dirs {
        if dir_name.starts_with('_') || dir_name.starts_with('.') {
            debug!(dir = %dir_name, "Skipping internal directory");
            continue;
        }

        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            warn!(dir = %dir_name, "No {} found, skipping", MANIFEST_FILE);
            continue;
        }

        let isolated = path.join(dependency_file).is_file();
        let classification = if isolated {
            Classification::Isolated
        } else {
            Classification::Embedded
        };

        let manifest = match AppManifest::load(&manifest_path) {
            Ok(manifest) => manifest,
            Err(e) => {
                let kind = match e {
                    ManifestError::Parse { .. } => FailureKind::ManifestInvalid,
                    ManifestError::Io { .. } => FailureKind::UnexpectedError,
                };
                error!(dir = %dir_name, error = %e, "Failed to load app manifest");
                discovery.failed.push(FailedAppRecord {
                    name: dir_name,
                    path,
                    error_kind: kind,
                    message: e.to_string(),
                    was_isolated: isolated,
                    port: None,
                });
                continue;
            }
        };

        let descriptor = AppDescriptor::resolve(&path, manifest, classification);

        if !descriptor.enabled {
            info!(app = %descriptor.name, "App disabled, skipping");
            continue;
        }

        if !seen.insert(descriptor.name.clone()) {
            error!(app = %descriptor.name, dir = %dir_name, "Duplicate app name");
            // The surviving app keeps the name, so the rejected one is keyed by directory
            discovery.failed.push(FailedAppRecord {
                name: duplicate_key(&dir_name, &descriptor.name),
                path,
                error_kind: FailureKind::ManifestInvalid,
                message: format!("duplicate app name '{}'", descriptor.name),
                was_isolated: isolated,
                port: None,
            });
            continue;
        }

        info!(
            app = %descriptor.name,
            prefix = %descriptor.url_prefix,
            classification = ?descriptor.classification,
            "Discovered app"
        );
        discovery.apps.push(descriptor);
    }

    discovery
}

fn duplicate_key(dir_name: &str, app_name: &str) -> String {
    format!("{} (duplicate of '{}')", dir_name, app_name)
}

/// Live view of every app the framework knows about.
///
/// A name is in at most one of the embedded, isolated and failed sets.
#[derive(Default)]
pub struct Registry {
    embedded: RwLock<Vec<AppDescriptor>>,
    isolated: RwLock<BTreeMap<String, AppDescriptor>>,
    failed: RwLock<Vec<FailedAppRecord>>,
}

impl Registry {
    /// Partition a discovery result, assigning ports to isolated apps in discovery order
    pub fn build(discovery: Discovery, ports: &PortAllocator) -> Self {
        let mut embedded = Vec::new();
        let mut isolated = BTreeMap::new();
        let mut failed = discovery.failed;

        for mut app in discovery.apps {
            match app.classification {
                Classification::Embedded => embedded.push(app),
                Classification::Isolated => match ports.assign(&app.name, app.preferred_port) {
                    Some(port) => {
                        app.port = Some(port);
                        isolated.insert(app.name.clone(), app);
                    }
                    None => failed.push(FailedAppRecord {
                        name: app.name,
                        path: app.directory,
                        error_kind: FailureKind::UnexpectedError,
                        message: "no free port available".to_string(),
                        was_isolated: true,
                        port: None,
                    }),
                },
            }
        }

        Self {
            embedded: RwLock::new(embedded),
            isolated: RwLock::new(isolated),
            failed: RwLock::new(failed),
        }
    }

    pub fn embedded(&self) -> Vec<AppDescriptor> {
        self.embedded.read().clone()
    }

    /// Isolated apps ordered by name
    pub fn isolated(&self) -> Vec<AppDescriptor> {
        self.isolated.read().values().cloned().collect()
    }

    pub fn isolated_app(&self, name: &str) -> Option<AppDescriptor> {
        self.isolated.read().get(name).cloned()
    }

    pub fn failed(&self) -> Vec<FailedAppRecord> {
        self.failed.read().clone()
    }

    pub fn is_failed(&self, name: &str) -> bool {
        self.failed.read().iter().any(|f| f.name == name)
    }

    /// Move a live app into the failed list. Returns false for unknown names.
    pub fn mark_failed(&self, name: &str, kind: FailureKind, message: impl Into<String>) -> bool {
        let removed = {
            let mut isolated = self.isolated.write();
            isolated.remove(name)
        }
        .or_else(|| {
            let mut embedded = self.embedded.write();
            embedded
                .iter()
                .position(|a| a.name == name)
                .map(|idx| embedded.remove(idx))
        });

        let Some(app) = removed else {
            return false;
        };

        let record = FailedAppRecord {
            name: app.name,
            path: app.directory,
            error_kind: kind,
            message: message.into(),
            was_isolated: app.classification == Classification::Isolated,
            port: app.port,
        };
        warn!(app = %record.name, kind = ?record.error_kind, message = %record.message, "App marked as failed");
        self.failed.write().push(record);
        true
    }
}
