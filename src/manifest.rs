//! App manifests and the descriptors resolved from them

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File every app directory must carry
pub const MANIFEST_FILE: &str = "config.json";

/// How an app is hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Runs inside the framework process
    Embedded,
    /// Runs as its own OS process behind the reverse proxy
    Isolated,
}

/// Errors reading or parsing a manifest
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Raw contents of `config.json`. Unknown keys are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct AppManifest {
    pub name: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub prefix: Option<String>,
    pub port: Option<u16>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub allowed_roles: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_enabled() -> bool {
    true
}

impl AppManifest {
    pub fn from_json(content: &str, path: &Path) -> Result<Self, ManifestError> {
        serde_json::from_str(content).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content, path)
    }
}

/// Resolved configuration for one discovered app
#[derive(Debug, Clone, Serialize)]
pub struct AppDescriptor {
    pub name: String,
    pub classification: Classification,
    pub url_prefix: String,
    pub enabled: bool,
    /// Assigned once for isolated apps, never for embedded ones
    pub port: Option<u16>,
    /// Port requested by the manifest
    #[serde(skip)]
    pub preferred_port: Option<u16>,
    pub version: String,
    pub description: String,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub directory: PathBuf,
    pub auth_required: bool,
    pub allowed_roles: Vec<String>,
}

impl AppDescriptor {
    /// Resolve a manifest found in `directory`.
    ///
    /// The name falls back to the directory name and the prefix to `/<name>`.
    pub fn resolve(directory: &Path, manifest: AppManifest, classification: Classification) -> Self {
        let dir_name = directory
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = manifest
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(dir_name);
        let url_prefix = normalize_prefix(manifest.prefix.as_deref().unwrap_or(&name));

        Self {
            url_prefix,
            classification,
            enabled: manifest.enabled,
            port: None,
            preferred_port: manifest.port.filter(|p| *p != 0),
            version: manifest.version,
            description: manifest.description,
            settings: manifest.settings,
            directory: directory.to_path_buf(),
            auth_required: manifest.auth_required,
            allowed_roles: manifest.allowed_roles,
            name,
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.classification == Classification::Isolated
    }

    /// Mount point of this app under `base_path`
    pub fn mount_path(&self, base_path: &str) -> String {
        format!("{}{}", base_path.trim_end_matches('/'), self.url_prefix)
    }
}

/// `/name`, `name/` and `/name/` all become `/name`
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim().trim_matches('/');
    format!("/{}", trimmed)
}
